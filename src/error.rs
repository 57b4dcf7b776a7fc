//! Closed error taxonomy shared by every storage backend in this crate.

use std::io;

/// Every distinguishable failure mode a [`crate::storage::Storage`] backend,
/// the graph walker, or the copy engine can surface.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found")]
    NotFound,

    #[error("already exists")]
    AlreadyExists,

    #[error("mismatched digest: expected {expected}, found {found}")]
    MismatchedDigest { expected: String, found: String },

    #[error("mismatched size: expected {expected}, found {found}")]
    MismatchedSize { expected: u64, found: u64 },

    #[error("trailing data after declared size {size}")]
    TrailingData { size: u64 },

    #[error("invalid descriptor size {0}")]
    InvalidDescriptorSize(i64),

    #[error("unsupported digest algorithm {0}")]
    UnsupportedDigestAlgorithm(String),

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("missing name for pushed content")]
    MissingName,

    #[error("duplicate name {0}")]
    DuplicateName(String),

    #[error("path traversal disallowed for {0}")]
    PathTraversalDisallowed(String),

    #[error("overwrite disallowed for {0}")]
    OverwriteDisallowed(String),

    #[error("skip descriptor")]
    SkipDescriptor,

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),

    #[error("size {size} exceeds limit {limit}")]
    SizeExceedsLimit { size: u64, limit: u64 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("verify() called before size was reached")]
    EarlyVerify,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Ssl(#[from] openssl::error::ErrorStack),
}

impl Error {
    /// True for failures the copy engine is allowed to swallow and treat
    /// as a successful, already-satisfied transfer.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists)
    }

    /// True for the cooperative skip signal returned by `preCopy` hooks.
    pub fn is_skip_descriptor(&self) -> bool {
        matches!(self, Error::SkipDescriptor)
    }
}

/// Verification failures need to flow through `std::io::Read`, which only
/// speaks `io::Error`. We wrap rather than lose the underlying kind so
/// callers downcasting `io::Error::into_inner` can still get at it.
impl From<Error> for io::Error {
    fn from(e: Error) -> io::Error {
        match e {
            Error::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
