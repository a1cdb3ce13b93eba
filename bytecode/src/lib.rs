//! Serialized op streams for the strand runtime: packed integers, the
//! instruction set, a builder, the encoder/decoder pair, the linker and
//! the module container.

mod builder;
mod decoder;
mod encoder;
mod error;
mod instruction;
mod link;
mod module;
mod op;
mod packed;

pub use builder::{CodeBuilder, Label};
pub use decoder::{InstructionDecoder, decode};
pub use encoder::{InstructionEncoder, encode};
pub use error::{DecodeError, LinkError};
pub use instruction::{
    A_IGNORE, A_STACK, A_THIS, Arg, BinaryCond, Branch, CONSTANT_OFFSET, Instruction, UnaryCond,
};
pub use link::{LinkReport, link};
pub use module::{ClassDef, Constant, MAGIC, MethodDef, Module};
pub use op::Op;
pub use packed::{PackedReader, packed_len, write_packed, write_string};

#[cfg(test)]
mod tests {
    use super::*;

    fn every_kind() -> Vec<Instruction> {
        let mut b = CodeBuilder::new();
        b.emit(Instruction::Nop);
        b.mov(Arg::Reg(300), Arg::Const(70_000));
        b.add(Arg::Stack, Arg::Reg(0), Arg::Const(1));
        b.sub(Arg::Ignore, Arg::Stack, Arg::This);
        let a = b.jump();
        let c = b.jump_if(UnaryCond::NotNull, Arg::Reg(1));
        let d = b.jump_cmp(BinaryCond::Lte, 4, Arg::Reg(0), Arg::Reg(1));
        b.call(Arg::Reg(2), 7, &[Arg::Reg(0), Arg::Const(3)]);
        b.invoke(Arg::Stack, Arg::Reg(4), 9, &[]);
        b.invoke_async(Arg::Reg(5), Arg::Reg(4), 9, &[Arg::Reg(1)]);
        b.super_call(Arg::Ignore, &[Arg::This]);
        b.new_object(Arg::Reg(6), 1, &[Arg::Const(0)]);
        b.get_field(Arg::Reg(7), Arg::Reg(6), 0);
        b.set_field(Arg::Reg(6), 1, Arg::Reg(7));
        b.new_service(Arg::Reg(8), 2, &[]);
        b.freeze(Arg::Reg(9), Arg::Reg(6));
        b.new_ref(Arg::Reg(10), Arg::Const(2));
        b.new_lazy(Arg::Reg(11), 3);
        b.ref_get(Arg::Stack, Arg::Reg(11));
        b.ref_set(Arg::Reg(10), Arg::Stack);
        let g = b.guard(Arg::Reg(12));
        b.guard_end();
        b.bind(a);
        b.bind(c);
        b.bind(d);
        b.bind(g);
        b.throw(Arg::Reg(12));
        b.ret(Arg::Reg(0));
        b.ret_void();
        b.finish()
    }

    #[test]
    fn every_instruction_survives_serialization() {
        let code = every_kind();
        let ops: std::collections::HashSet<Op> = code.iter().map(Instruction::op).collect();
        // all families except the remaining unary/binary conditions
        assert_eq!(ops.len(), Op::COUNT - 3 - 5);
        assert_eq!(decode(&encode(&code)).unwrap(), code);
    }

    #[test]
    fn malformed_streams_are_errors() {
        assert_eq!(
            decode(&[0xFF]),
            Err(DecodeError::InvalidOpcode { byte: 0xFF, pos: 0 })
        );
        // Move with a constant as destination
        let mut bytes = vec![Op::Move as u8];
        write_packed(&mut bytes, Arg::Const(0).encode());
        write_packed(&mut bytes, 0);
        assert!(matches!(
            decode(&bytes),
            Err(DecodeError::InvalidArgument { raw: -17, pos: 1 })
        ));
        // reserved operand
        let mut bytes = vec![Op::Throw as u8];
        write_packed(&mut bytes, -9);
        assert!(matches!(decode(&bytes), Err(DecodeError::InvalidArgument { raw: -9, .. })));
        // truncated operands
        assert!(matches!(
            decode(&[Op::Add as u8, 0x01]),
            Err(DecodeError::UnexpectedEof { .. })
        ));
    }
}
