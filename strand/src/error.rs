use std::sync::Arc;

use strand_bytecode::{Arg, DecodeError, LinkError};
use thiserror::Error;

use crate::{Exception, ExceptionKind, FiberId, MAX_FIELDS, MAX_REGISTERS};

/// Invariant violations inside the interpreter.
///
/// A host error is fatal to the fiber it happens on and is never visible
/// to guest handlers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    #[error("fiber {fiber} touched a handle owned by fiber {owner}")]
    ForeignHandle { fiber: FiberId, owner: FiberId },
    #[error("dangling heap handle {index}")]
    DanglingHandle { index: u32 },
    #[error("heap slot {index} holds the wrong kind of object")]
    WrongObject { index: u32 },
    #[error("register r{reg} out of range")]
    BadRegister { reg: u32 },
    #[error("read from an empty stack")]
    StackUnderflow,
    #[error("frame has no target object")]
    NoThis,
    #[error("operand {0} cannot be assigned")]
    NotAssignable(Arg),
    #[error("operand {0} cannot be read")]
    NotReadable(Arg),
    #[error("constant #{index} missing or of the wrong kind")]
    BadConstant { index: u32 },
    #[error("method @{index} does not exist")]
    BadMethod { index: u32 },
    #[error("class %{index} does not exist")]
    BadClass { index: u32 },
    #[error("field {field} out of range for {class}")]
    BadField { class: String, field: u32 },
    #[error("branch at op {pc} was never linked")]
    Unlinked { pc: usize },
    #[error("control fell off the end of {method}")]
    FellOffEnd { method: String },
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error("a deferred value was stored or read directly")]
    DeferredRead,
    #[error("op at {pc} suspended without a pending frame")]
    NoPendingFrame { pc: usize },
    #[error("exception step without an exception")]
    MissingException,
    #[error("request frame has no reply")]
    NoReply,
}

/// The content of a frame's exception slot.
#[derive(Debug, Clone, Error)]
pub enum Fault {
    #[error("{0}")]
    Guest(Arc<Exception>),
    #[error("host error: {0}")]
    Host(#[from] HostError),
}

impl Fault {
    pub fn guest(kind: ExceptionKind, message: impl Into<String>) -> Self {
        Fault::Guest(Arc::new(Exception::new(kind, message)))
    }
}

impl From<Exception> for Fault {
    fn from(exception: Exception) -> Self {
        Fault::Guest(Arc::new(exception))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("failed to decode module: {0}")]
    Decode(#[from] DecodeError),
    #[error("unknown class `{name}`")]
    UnknownClass { name: String },
    #[error("unknown type `{name}` in constant #{index}")]
    UnknownType { name: String, index: u32 },
    #[error("duplicate class `{name}`")]
    DuplicateClass { name: String },
    #[error("class `{class}` lists method @{index} which does not exist")]
    BadMethodIndex { class: String, index: u32 },
    #[error("class `{class}` inherits from itself")]
    InheritanceCycle { class: String },
    #[error("`{method}` declares {registers} registers, more than {max}", max = MAX_REGISTERS)]
    TooManyRegisters { method: String, registers: u32 },
    #[error("class `{class}` declares {fields} fields, more than {max}", max = MAX_FIELDS)]
    TooManyFields { class: String, fields: u32 },
    #[error("cannot link `{method}`: {source}")]
    Link { method: String, source: LinkError },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("no function named `{0}`")]
    NoSuchMethod(String),
    #[error("no class named `{0}`")]
    NoSuchClass(String),
    #[error("{0}")]
    Isolation(String),
    #[error("`{method}` takes {expected} arguments, got {got}")]
    Arity {
        method: String,
        expected: usize,
        got: usize,
    },
    #[error("fiber {0} did not finish in time")]
    Timeout(FiberId),
}
