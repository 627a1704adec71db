use thiserror::Error;

#[derive(Error, Debug)]
pub enum RepoError {
    #[error("The requested byte range [{offset}, +{len}) lies outside the cached blob")]
    RangeOutOfBounds { offset: u64, len: u64 },

    #[error("The mesh asset does not match the expected format: {reason}")]
    FormatError { reason: &'static str },

    /// Represents an empty source, for example a sub-section of size zero
    /// being handed to a parser that expects payload bytes.
    #[error("Source contains no data")]
    EmptySource,

    #[error("Failed to reserve a buffer of {size} bytes")]
    BufferExhausted { size: usize },

    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    DecodeError(#[from] serde_json::Error),
}
