use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("empty input")]
    Empty,
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("unexpected byte {byte:#04x} at offset {offset}")]
    UnexpectedByte { byte: u8, offset: usize },
    #[error("invalid integer at offset {0}")]
    InvalidInteger(usize),
    #[error("invalid byte string length at offset {0}")]
    InvalidLength(usize),
    #[error("dictionary key at offset {0} is not a byte string")]
    NonStringKey(usize),
    #[error("duplicate dictionary key at offset {0}")]
    DuplicateKey(usize),
    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),
    #[error("nesting exceeds maximum depth of {0}")]
    RecursionDepth(usize),
}
