/// Serialized opcodes.
///
/// Every operand that follows an opcode is a packed integer. Register and
/// constant operands share one encoding (see [`Arg`](crate::Arg)); branch
/// operands are offsets relative to the branching op, counted in ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Op {
    Nop = 0x00,

    /// Operands: `dst`, `src`
    Move,
    /// Operands: `dst`, `lhs`, `rhs`
    Add,
    /// Operands: `dst`, `lhs`, `rhs`
    Sub,

    /// Operands: `offset`
    Jump,
    /// Operands: `arg`, `offset`
    JumpTrue,
    JumpFalse,
    JumpNull,
    JumpNotNull,
    /// Operands: `type`, `lhs`, `rhs`, `offset`
    JumpEq,
    JumpNeq,
    JumpLt,
    JumpLte,
    JumpGt,
    JumpGte,

    /// Operands: `dst`, `method`, `argc`, `args..`
    Call,
    /// Operands: `dst`, `target`, `name`, `argc`, `args..`
    Invoke,
    /// Operands: `dst`, `target`, `name`, `argc`, `args..`
    InvokeAsync,
    /// Operands: `dst`, `argc`, `args..`
    Super,
    /// Operands: `dst`, `class`, `argc`, `args..`
    New,
    /// Operands: `dst`, `target`, `field`
    GetField,
    /// Operands: `target`, `field`, `value`
    SetField,
    /// Operands: `dst`, `class`, `argc`, `args..`
    NewService,
    /// Operands: `dst`, `src`
    Freeze,
    /// Operands: `dst`, `src`
    NewRef,
    /// Operands: `dst`, `method`
    NewLazy,
    /// Operands: `dst`, `target`
    RefGet,
    /// Operands: `target`, `value`
    RefSet,

    /// Operands: `var`, `offset`
    GuardStart,
    GuardEnd,
    /// Operands: `arg`
    Throw,
    /// Operands: `arg`
    Return,
    ReturnVoid,
}

impl Op {
    pub const COUNT: usize = Op::ReturnVoid as usize + 1;

    const ALL: [Op; Op::COUNT] = [
        Op::Nop,
        Op::Move,
        Op::Add,
        Op::Sub,
        Op::Jump,
        Op::JumpTrue,
        Op::JumpFalse,
        Op::JumpNull,
        Op::JumpNotNull,
        Op::JumpEq,
        Op::JumpNeq,
        Op::JumpLt,
        Op::JumpLte,
        Op::JumpGt,
        Op::JumpGte,
        Op::Call,
        Op::Invoke,
        Op::InvokeAsync,
        Op::Super,
        Op::New,
        Op::GetField,
        Op::SetField,
        Op::NewService,
        Op::Freeze,
        Op::NewRef,
        Op::NewLazy,
        Op::RefGet,
        Op::RefSet,
        Op::GuardStart,
        Op::GuardEnd,
        Op::Throw,
        Op::Return,
        Op::ReturnVoid,
    ];

    /// Whether the op carries a branch operand.
    pub const fn has_branch(self) -> bool {
        matches!(
            self,
            Op::Jump
                | Op::JumpTrue
                | Op::JumpFalse
                | Op::JumpNull
                | Op::JumpNotNull
                | Op::JumpEq
                | Op::JumpNeq
                | Op::JumpLt
                | Op::JumpLte
                | Op::JumpGt
                | Op::JumpGte
                | Op::GuardStart
        )
    }
}

impl TryFrom<u8> for Op {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        Self::ALL.get(byte as usize).copied().ok_or(byte)
    }
}
