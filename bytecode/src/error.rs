use thiserror::Error;

/// Failure while reading a serialized op stream or module.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unexpected end of input at byte {pos}")]
    UnexpectedEof { pos: usize },
    #[error("packed integer at byte {pos} declares {len} trailing bytes")]
    PackedOverflow { pos: usize, len: usize },
    #[error("invalid opcode 0x{byte:02x} at byte {pos}")]
    InvalidOpcode { byte: u8, pos: usize },
    #[error("invalid argument encoding {raw} at byte {pos}")]
    InvalidArgument { raw: i64, pos: usize },
    #[error("value {value} out of range at byte {pos}")]
    OutOfRange { value: i64, pos: usize },
    #[error("invalid constant tag {tag} at byte {pos}")]
    InvalidConstant { tag: i64, pos: usize },
    #[error("invalid utf-8 string at byte {pos}")]
    InvalidUtf8 { pos: usize },
    #[error("not a strand module (bad magic)")]
    BadMagic,
    #[error("{count} trailing bytes after module")]
    TrailingBytes { count: usize },
}

/// Failure while resolving relative branch offsets into op indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("branch at op {index} is already linked")]
    AlreadyLinked { index: usize },
    #[error("branch at op {index} with offset {offset:+} targets outside 0..{len}")]
    TargetOutOfRange { index: usize, offset: i32, len: usize },
}
