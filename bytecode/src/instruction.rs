use core::{cmp::Ordering, fmt};

use crate::{LinkError, Op};

/// Raw operand meaning "push to / pop from the frame's stack slot".
pub const A_STACK: i64 = -1;
/// Raw operand meaning "discard the result".
pub const A_IGNORE: i64 = -2;
/// Raw operand meaning "the frame's target object".
pub const A_THIS: i64 = -3;
/// Raw operands at or below this value address the constant pool.
pub const CONSTANT_OFFSET: i64 = -17;

/// One operand slot of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arg {
    Reg(u32),
    Stack,
    Ignore,
    This,
    Const(u32),
}

impl Arg {
    pub fn encode(self) -> i64 {
        match self {
            Arg::Reg(reg) => reg as i64,
            Arg::Stack => A_STACK,
            Arg::Ignore => A_IGNORE,
            Arg::This => A_THIS,
            Arg::Const(idx) => CONSTANT_OFFSET - idx as i64,
        }
    }

    pub fn decode(raw: i64) -> Option<Self> {
        match raw {
            0.. => u32::try_from(raw).ok().map(Arg::Reg),
            A_STACK => Some(Arg::Stack),
            A_IGNORE => Some(Arg::Ignore),
            A_THIS => Some(Arg::This),
            ..=CONSTANT_OFFSET => u32::try_from(CONSTANT_OFFSET - raw).ok().map(Arg::Const),
            _ => None,
        }
    }

    /// Whether the operand may receive a value.
    pub fn is_assignable(self) -> bool {
        matches!(self, Arg::Reg(_) | Arg::Stack | Arg::Ignore)
    }
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Reg(reg) => write!(f, "r{reg}"),
            Arg::Stack => f.write_str("^"),
            Arg::Ignore => f.write_str("_"),
            Arg::This => f.write_str("this"),
            Arg::Const(idx) => write!(f, "#{idx}"),
        }
    }
}

/// A branch operand.
///
/// Serialized form is a relative offset in ops. [`link`](crate::link)
/// rewrites it into an absolute op index exactly once; after that the
/// target is read, never recomputed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Branch {
    offset: i32,
    target: Option<u32>,
    redundant: bool,
}

impl Branch {
    pub const fn new(offset: i32) -> Self {
        Self {
            offset,
            target: None,
            redundant: false,
        }
    }

    #[inline]
    pub fn offset(&self) -> i32 {
        self.offset
    }

    #[inline]
    pub fn target(&self) -> Option<usize> {
        self.target.map(|t| t as usize)
    }

    #[inline]
    pub fn is_linked(&self) -> bool {
        self.target.is_some()
    }

    #[inline]
    pub fn is_redundant(&self) -> bool {
        self.redundant
    }

    pub(crate) fn set_offset(&mut self, offset: i32) {
        debug_assert!(!self.is_linked(), "offset patched after link");
        self.offset = offset;
    }

    pub(crate) fn check(&self, index: usize, len: usize) -> Result<usize, LinkError> {
        if self.is_linked() {
            return Err(LinkError::AlreadyLinked { index });
        }
        let target = index as i64 + self.offset as i64;
        if target < 0 || target >= len as i64 {
            return Err(LinkError::TargetOutOfRange {
                index,
                offset: self.offset,
                len,
            });
        }
        Ok(target as usize)
    }

    pub(crate) fn resolve(&mut self, target: usize, eliminate: bool) {
        self.target = Some(target as u32);
        self.redundant = eliminate && self.offset == 1;
    }
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.target {
            Some(target) => write!(f, "-> {target}"),
            None => write!(f, "{:+}", self.offset),
        }
    }
}

/// Condition of a single-operand jump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryCond {
    True,
    False,
    Null,
    NotNull,
}

/// Condition of a two-operand jump; compared under a common type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryCond {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl BinaryCond {
    /// Equality conditions ask the type for `equals`, the rest for `compare`.
    pub fn is_equality(self) -> bool {
        matches!(self, BinaryCond::Eq | BinaryCond::Neq)
    }

    pub fn holds_for_equality(self, equal: bool) -> bool {
        match self {
            BinaryCond::Eq => equal,
            BinaryCond::Neq => !equal,
            _ => unreachable!("{self:?} is an ordering condition"),
        }
    }

    pub fn holds_for_ordering(self, ordering: Ordering) -> bool {
        match self {
            BinaryCond::Eq => ordering == Ordering::Equal,
            BinaryCond::Neq => ordering != Ordering::Equal,
            BinaryCond::Lt => ordering == Ordering::Less,
            BinaryCond::Lte => ordering != Ordering::Greater,
            BinaryCond::Gt => ordering == Ordering::Greater,
            BinaryCond::Gte => ordering != Ordering::Less,
        }
    }
}

/// A decoded instruction.
///
/// Families share a variant (`JumpUnary`, `JumpBinary`) and are told apart
/// by their condition; the interpreter dispatches on the variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    Nop,
    Move {
        dst: Arg,
        src: Arg,
    },
    Add {
        dst: Arg,
        lhs: Arg,
        rhs: Arg,
    },
    Sub {
        dst: Arg,
        lhs: Arg,
        rhs: Arg,
    },
    Jump {
        branch: Branch,
    },
    JumpUnary {
        cond: UnaryCond,
        arg: Arg,
        branch: Branch,
    },
    JumpBinary {
        cond: BinaryCond,
        /// Constant pool index of the common type.
        ty: u32,
        lhs: Arg,
        rhs: Arg,
        branch: Branch,
    },
    /// Static call of a method table entry.
    Call {
        dst: Arg,
        method: u32,
        args: Vec<Arg>,
    },
    /// Virtual call by name; waits for cross-fiber targets.
    Invoke {
        dst: Arg,
        target: Arg,
        /// Constant pool index of the method name.
        name: u32,
        args: Vec<Arg>,
    },
    /// Cross-fiber call that stores a future instead of waiting.
    InvokeAsync {
        dst: Arg,
        target: Arg,
        name: u32,
        args: Vec<Arg>,
    },
    Super {
        dst: Arg,
        args: Vec<Arg>,
    },
    New {
        dst: Arg,
        class: u32,
        args: Vec<Arg>,
    },
    GetField {
        dst: Arg,
        target: Arg,
        field: u32,
    },
    SetField {
        target: Arg,
        field: u32,
        value: Arg,
    },
    NewService {
        dst: Arg,
        class: u32,
        args: Vec<Arg>,
    },
    Freeze {
        dst: Arg,
        src: Arg,
    },
    NewRef {
        dst: Arg,
        src: Arg,
    },
    NewLazy {
        dst: Arg,
        method: u32,
    },
    RefGet {
        dst: Arg,
        target: Arg,
    },
    RefSet {
        target: Arg,
        value: Arg,
    },
    GuardStart {
        var: Arg,
        branch: Branch,
    },
    GuardEnd,
    Throw {
        arg: Arg,
    },
    Return {
        arg: Arg,
    },
    ReturnVoid,
}

impl Instruction {
    pub fn op(&self) -> Op {
        match self {
            Self::Nop => Op::Nop,
            Self::Move { .. } => Op::Move,
            Self::Add { .. } => Op::Add,
            Self::Sub { .. } => Op::Sub,
            Self::Jump { .. } => Op::Jump,
            Self::JumpUnary { cond, .. } => match cond {
                UnaryCond::True => Op::JumpTrue,
                UnaryCond::False => Op::JumpFalse,
                UnaryCond::Null => Op::JumpNull,
                UnaryCond::NotNull => Op::JumpNotNull,
            },
            Self::JumpBinary { cond, .. } => match cond {
                BinaryCond::Eq => Op::JumpEq,
                BinaryCond::Neq => Op::JumpNeq,
                BinaryCond::Lt => Op::JumpLt,
                BinaryCond::Lte => Op::JumpLte,
                BinaryCond::Gt => Op::JumpGt,
                BinaryCond::Gte => Op::JumpGte,
            },
            Self::Call { .. } => Op::Call,
            Self::Invoke { .. } => Op::Invoke,
            Self::InvokeAsync { .. } => Op::InvokeAsync,
            Self::Super { .. } => Op::Super,
            Self::New { .. } => Op::New,
            Self::GetField { .. } => Op::GetField,
            Self::SetField { .. } => Op::SetField,
            Self::NewService { .. } => Op::NewService,
            Self::Freeze { .. } => Op::Freeze,
            Self::NewRef { .. } => Op::NewRef,
            Self::NewLazy { .. } => Op::NewLazy,
            Self::RefGet { .. } => Op::RefGet,
            Self::RefSet { .. } => Op::RefSet,
            Self::GuardStart { .. } => Op::GuardStart,
            Self::GuardEnd => Op::GuardEnd,
            Self::Throw { .. } => Op::Throw,
            Self::Return { .. } => Op::Return,
            Self::ReturnVoid => Op::ReturnVoid,
        }
    }

    pub fn branch(&self) -> Option<&Branch> {
        match self {
            Self::Jump { branch }
            | Self::JumpUnary { branch, .. }
            | Self::JumpBinary { branch, .. }
            | Self::GuardStart { branch, .. } => Some(branch),
            _ => None,
        }
    }

    pub fn branch_mut(&mut self) -> Option<&mut Branch> {
        match self {
            Self::Jump { branch }
            | Self::JumpUnary { branch, .. }
            | Self::JumpBinary { branch, .. }
            | Self::GuardStart { branch, .. } => Some(branch),
            _ => None,
        }
    }

    /// Jumps transfer control; a guard's branch only names its handler.
    pub fn is_jump(&self) -> bool {
        matches!(
            self,
            Self::Jump { .. } | Self::JumpUnary { .. } | Self::JumpBinary { .. }
        )
    }

    /// Set by the linker for jumps that land on the next op.
    pub fn is_redundant(&self) -> bool {
        self.branch().is_some_and(Branch::is_redundant)
    }
}

struct ArgList<'a>(&'a [Arg]);

impl fmt::Display for ArgList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, arg) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{arg}")?;
        }
        f.write_str(")")
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = format!("{:?}", self.op());
        match self {
            Self::Nop | Self::GuardEnd | Self::ReturnVoid => f.write_str(&name),
            Self::Move { dst, src }
            | Self::Freeze { dst, src }
            | Self::NewRef { dst, src } => write!(f, "{name} {dst}, {src}"),
            Self::Add { dst, lhs, rhs } | Self::Sub { dst, lhs, rhs } => {
                write!(f, "{name} {dst}, {lhs}, {rhs}")
            }
            Self::Jump { branch } => write!(f, "{name} {branch}"),
            Self::JumpUnary { arg, branch, .. } => write!(f, "{name} {arg}, {branch}"),
            Self::JumpBinary {
                ty,
                lhs,
                rhs,
                branch,
                ..
            } => write!(f, "{name} #{ty}, {lhs}, {rhs}, {branch}"),
            Self::Call { dst, method, args } => {
                write!(f, "{name} {dst}, @{method}{}", ArgList(args))
            }
            Self::Invoke {
                dst,
                target,
                name: method,
                args,
            }
            | Self::InvokeAsync {
                dst,
                target,
                name: method,
                args,
            } => write!(f, "{name} {dst}, {target}.#{method}{}", ArgList(args)),
            Self::Super { dst, args } => write!(f, "{name} {dst}{}", ArgList(args)),
            Self::New { dst, class, args } | Self::NewService { dst, class, args } => {
                write!(f, "{name} {dst}, %{class}{}", ArgList(args))
            }
            Self::GetField { dst, target, field } => {
                write!(f, "{name} {dst}, {target}.{field}")
            }
            Self::SetField {
                target,
                field,
                value,
            } => write!(f, "{name} {target}.{field}, {value}"),
            Self::NewLazy { dst, method } => write!(f, "{name} {dst}, @{method}"),
            Self::RefGet { dst, target } => write!(f, "{name} {dst}, {target}"),
            Self::RefSet { target, value } => write!(f, "{name} {target}, {value}"),
            Self::GuardStart { var, branch } => write!(f, "{name} {var}, {branch}"),
            Self::Throw { arg } | Self::Return { arg } => write!(f, "{name} {arg}"),
        }
    }
}
