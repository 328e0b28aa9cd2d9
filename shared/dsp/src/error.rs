use thiserror::Error;

pub type DspResult<T> = Result<T, DspError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DspError {
    #[error("non-finite input sample at index {index}")]
    NonFiniteInput { index: usize },

    #[error("filter diverged at sample {index}; state rolled back")]
    Diverged { index: usize },

    #[error("length mismatch: expected {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("invalid filter config: {0}")]
    InvalidConfig(&'static str),

    #[error("state record: {0}")]
    Codec(#[from] CodecError),
}

/// Reasons a persisted filter record is rejected.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("bad magic")]
    BadMagic,

    #[error("unsupported version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown algorithm tag {0}")]
    UnknownKind(u8),

    #[error("record truncated")]
    Truncated,

    #[error("{field} length {actual} does not match order {order}")]
    LengthField {
        field: &'static str,
        order: usize,
        actual: usize,
    },

    #[error("invalid value in {0}")]
    InvalidValue(&'static str),

    #[error("{0} trailing bytes")]
    Trailing(usize),
}
