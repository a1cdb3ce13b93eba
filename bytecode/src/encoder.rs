use crate::{Arg, Instruction, write_packed};

/// Serializes instructions into their packed byte form.
///
/// Branches are always written as their relative offset, linked or not.
pub struct InstructionEncoder {
    buf: Vec<u8>,
}

impl InstructionEncoder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    fn arg(&mut self, arg: Arg) {
        write_packed(&mut self.buf, arg.encode());
    }

    fn index(&mut self, idx: u32) {
        write_packed(&mut self.buf, idx as i64);
    }

    fn args(&mut self, args: &[Arg]) {
        write_packed(&mut self.buf, args.len() as i64);
        for arg in args {
            self.arg(*arg);
        }
    }

    pub fn encode(&mut self, instruction: &Instruction) {
        self.buf.push(instruction.op() as u8);

        match instruction {
            Instruction::Nop
            | Instruction::GuardEnd
            | Instruction::ReturnVoid => {}
            Instruction::Move { dst, src }
            | Instruction::Freeze { dst, src }
            | Instruction::NewRef { dst, src } => {
                self.arg(*dst);
                self.arg(*src);
            }
            Instruction::Add { dst, lhs, rhs } | Instruction::Sub { dst, lhs, rhs } => {
                self.arg(*dst);
                self.arg(*lhs);
                self.arg(*rhs);
            }
            Instruction::Jump { branch } => {
                write_packed(&mut self.buf, branch.offset() as i64);
            }
            Instruction::JumpUnary { arg, branch, .. } => {
                self.arg(*arg);
                write_packed(&mut self.buf, branch.offset() as i64);
            }
            Instruction::JumpBinary {
                ty,
                lhs,
                rhs,
                branch,
                ..
            } => {
                self.index(*ty);
                self.arg(*lhs);
                self.arg(*rhs);
                write_packed(&mut self.buf, branch.offset() as i64);
            }
            Instruction::Call { dst, method, args } => {
                self.arg(*dst);
                self.index(*method);
                self.args(args);
            }
            Instruction::Invoke {
                dst,
                target,
                name,
                args,
            }
            | Instruction::InvokeAsync {
                dst,
                target,
                name,
                args,
            } => {
                self.arg(*dst);
                self.arg(*target);
                self.index(*name);
                self.args(args);
            }
            Instruction::Super { dst, args } => {
                self.arg(*dst);
                self.args(args);
            }
            Instruction::New { dst, class, args }
            | Instruction::NewService { dst, class, args } => {
                self.arg(*dst);
                self.index(*class);
                self.args(args);
            }
            Instruction::GetField { dst, target, field } => {
                self.arg(*dst);
                self.arg(*target);
                self.index(*field);
            }
            Instruction::SetField {
                target,
                field,
                value,
            } => {
                self.arg(*target);
                self.index(*field);
                self.arg(*value);
            }
            Instruction::NewLazy { dst, method } => {
                self.arg(*dst);
                self.index(*method);
            }
            Instruction::RefGet { dst, target } => {
                self.arg(*dst);
                self.arg(*target);
            }
            Instruction::RefSet { target, value } => {
                self.arg(*target);
                self.arg(*value);
            }
            Instruction::GuardStart { var, branch } => {
                self.arg(*var);
                write_packed(&mut self.buf, branch.offset() as i64);
            }
            Instruction::Throw { arg } | Instruction::Return { arg } => self.arg(*arg),
        }
    }
}

impl Default for InstructionEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Serialize a whole op stream.
pub fn encode(code: &[Instruction]) -> Vec<u8> {
    let mut encoder = InstructionEncoder::new();
    for instruction in code {
        encoder.encode(instruction);
    }
    encoder.into_bytes()
}
