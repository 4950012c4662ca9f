//! Error types for wire codec operations

/// Errors from frame and protobuf decoding.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed varint at offset {0}")]
    Varint(usize),

    #[error("truncated field: needed {needed} bytes, had {remaining}")]
    Truncated { needed: usize, remaining: usize },

    #[error("unsupported wire type {0}")]
    WireType(u8),

    #[error("invalid utf-8 in string field: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Result alias for codec operations.
pub type Result<T> = std::result::Result<T, Error>;
