use crate::{
    Arg, BinaryCond, Branch, DecodeError, Instruction, Op, PackedReader, UnaryCond,
};

/// Decodes a packed op stream into [`Instruction`]s.
///
/// Input comes from outside the process, so every read is checked and a
/// malformed stream yields a [`DecodeError`] rather than a panic.
pub struct InstructionDecoder<'a> {
    reader: PackedReader<'a>,
    failed: bool,
}

impl<'a> InstructionDecoder<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            reader: PackedReader::new(bytes),
            failed: false,
        }
    }

    /// Current byte offset in the stream.
    #[inline]
    pub fn offset(&self) -> usize {
        self.reader.position()
    }

    #[inline]
    pub fn is_at_end(&self) -> bool {
        self.reader.is_at_end()
    }

    /// Decode the next instruction, or `None` at end-of-stream.
    pub fn decode_next(&mut self) -> Option<Result<Instruction, DecodeError>> {
        if self.failed || self.is_at_end() {
            return None;
        }
        let result = self.decode();
        self.failed = result.is_err();
        Some(result)
    }

    fn decode(&mut self) -> Result<Instruction, DecodeError> {
        let pos = self.reader.position();
        let byte = self.reader.read_u8()?;
        let op = Op::try_from(byte).map_err(|byte| DecodeError::InvalidOpcode { byte, pos })?;

        let instruction = match op {
            Op::Nop => Instruction::Nop,
            Op::Move => Instruction::Move {
                dst: self.dst()?,
                src: self.arg()?,
            },
            Op::Add => Instruction::Add {
                dst: self.dst()?,
                lhs: self.arg()?,
                rhs: self.arg()?,
            },
            Op::Sub => Instruction::Sub {
                dst: self.dst()?,
                lhs: self.arg()?,
                rhs: self.arg()?,
            },
            Op::Jump => Instruction::Jump {
                branch: self.branch()?,
            },
            Op::JumpTrue => self.unary(UnaryCond::True)?,
            Op::JumpFalse => self.unary(UnaryCond::False)?,
            Op::JumpNull => self.unary(UnaryCond::Null)?,
            Op::JumpNotNull => self.unary(UnaryCond::NotNull)?,
            Op::JumpEq => self.binary(BinaryCond::Eq)?,
            Op::JumpNeq => self.binary(BinaryCond::Neq)?,
            Op::JumpLt => self.binary(BinaryCond::Lt)?,
            Op::JumpLte => self.binary(BinaryCond::Lte)?,
            Op::JumpGt => self.binary(BinaryCond::Gt)?,
            Op::JumpGte => self.binary(BinaryCond::Gte)?,
            Op::Call => Instruction::Call {
                dst: self.dst()?,
                method: self.reader.read_index()?,
                args: self.args()?,
            },
            Op::Invoke => Instruction::Invoke {
                dst: self.dst()?,
                target: self.arg()?,
                name: self.reader.read_index()?,
                args: self.args()?,
            },
            Op::InvokeAsync => Instruction::InvokeAsync {
                dst: self.dst()?,
                target: self.arg()?,
                name: self.reader.read_index()?,
                args: self.args()?,
            },
            Op::Super => Instruction::Super {
                dst: self.dst()?,
                args: self.args()?,
            },
            Op::New => Instruction::New {
                dst: self.dst()?,
                class: self.reader.read_index()?,
                args: self.args()?,
            },
            Op::GetField => Instruction::GetField {
                dst: self.dst()?,
                target: self.arg()?,
                field: self.reader.read_index()?,
            },
            Op::SetField => Instruction::SetField {
                target: self.arg()?,
                field: self.reader.read_index()?,
                value: self.arg()?,
            },
            Op::NewService => Instruction::NewService {
                dst: self.dst()?,
                class: self.reader.read_index()?,
                args: self.args()?,
            },
            Op::Freeze => Instruction::Freeze {
                dst: self.dst()?,
                src: self.arg()?,
            },
            Op::NewRef => Instruction::NewRef {
                dst: self.dst()?,
                src: self.arg()?,
            },
            Op::NewLazy => Instruction::NewLazy {
                dst: self.dst()?,
                method: self.reader.read_index()?,
            },
            Op::RefGet => Instruction::RefGet {
                dst: self.dst()?,
                target: self.arg()?,
            },
            Op::RefSet => Instruction::RefSet {
                target: self.arg()?,
                value: self.arg()?,
            },
            Op::GuardStart => Instruction::GuardStart {
                var: self.dst()?,
                branch: self.branch()?,
            },
            Op::GuardEnd => Instruction::GuardEnd,
            Op::Throw => Instruction::Throw { arg: self.arg()? },
            Op::Return => Instruction::Return { arg: self.arg()? },
            Op::ReturnVoid => Instruction::ReturnVoid,
        };
        Ok(instruction)
    }

    fn unary(&mut self, cond: UnaryCond) -> Result<Instruction, DecodeError> {
        Ok(Instruction::JumpUnary {
            cond,
            arg: self.arg()?,
            branch: self.branch()?,
        })
    }

    fn binary(&mut self, cond: BinaryCond) -> Result<Instruction, DecodeError> {
        Ok(Instruction::JumpBinary {
            cond,
            ty: self.reader.read_index()?,
            lhs: self.arg()?,
            rhs: self.arg()?,
            branch: self.branch()?,
        })
    }

    fn arg(&mut self) -> Result<Arg, DecodeError> {
        let pos = self.reader.position();
        let raw = self.reader.read_packed()?;
        Arg::decode(raw).ok_or(DecodeError::InvalidArgument { raw, pos })
    }

    fn dst(&mut self) -> Result<Arg, DecodeError> {
        let pos = self.reader.position();
        let arg = self.arg()?;
        if arg.is_assignable() {
            Ok(arg)
        } else {
            Err(DecodeError::InvalidArgument {
                raw: arg.encode(),
                pos,
            })
        }
    }

    fn args(&mut self) -> Result<Vec<Arg>, DecodeError> {
        let count = self.reader.read_index()? as usize;
        // every operand takes at least one byte
        let mut args = Vec::with_capacity(count.min(self.reader.remaining()));
        for _ in 0..count {
            args.push(self.arg()?);
        }
        Ok(args)
    }

    fn branch(&mut self) -> Result<Branch, DecodeError> {
        Ok(Branch::new(self.reader.read_offset()?))
    }
}

impl Iterator for InstructionDecoder<'_> {
    type Item = Result<Instruction, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.decode_next()
    }
}

/// Decode a whole op stream; branches come back unlinked.
pub fn decode(bytes: &[u8]) -> Result<Vec<Instruction>, DecodeError> {
    InstructionDecoder::new(bytes).collect()
}
