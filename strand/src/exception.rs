use std::fmt;

use crate::Portable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionKind {
    /// Raised by a `Throw` of a value that is not an exception.
    Thrown,
    IllegalArgument,
    Unsupported,
    NullDereference,
    Arithmetic,
    ReadOnly,
    StackOverflow,
    /// A value was refused at a fiber boundary.
    Isolation,
    NotFreezable,
    ServiceTerminated,
    Terminated,
}

impl ExceptionKind {
    pub fn name(self) -> &'static str {
        match self {
            ExceptionKind::Thrown => "Thrown",
            ExceptionKind::IllegalArgument => "IllegalArgument",
            ExceptionKind::Unsupported => "Unsupported",
            ExceptionKind::NullDereference => "NullDereference",
            ExceptionKind::Arithmetic => "Arithmetic",
            ExceptionKind::ReadOnly => "ReadOnly",
            ExceptionKind::StackOverflow => "StackOverflow",
            ExceptionKind::Isolation => "Isolation",
            ExceptionKind::NotFreezable => "NotFreezable",
            ExceptionKind::ServiceTerminated => "ServiceTerminated",
            ExceptionKind::Terminated => "Terminated",
        }
    }
}

impl fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A guest-visible exception.
///
/// Exceptions are immutable once raised, so they cross fiber boundaries
/// as they are.
#[derive(Debug, Clone)]
pub struct Exception {
    pub kind: ExceptionKind,
    pub message: String,
    pub value: Option<Portable>,
    /// One line per frame, innermost first. Filled in when raised.
    pub trace: Vec<String>,
}

impl Exception {
    pub fn new(kind: ExceptionKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            value: None,
            trace: Vec::new(),
        }
    }

    pub fn with_value(mut self, value: Portable) -> Self {
        self.value = Some(value);
        self
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}
