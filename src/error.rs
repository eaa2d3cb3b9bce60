//! Error kinds surfaced by the matching core (spec §7).
//!
//! Every fallible core operation returns `Result<T, DiffError>`. The CLI
//! boundary converts to `anyhow::Error` (see `src/tools/tools.rs`), matching
//! the way `Vector35-idb-rs`'s `tools.rs` keeps `anyhow` at the binary edge
//! while inner modules use their own error types.

pub type Result<T> = std::result::Result<T, DiffError>;

#[derive(Debug, thiserror::Error)]
pub enum DiffError {
    /// Absent input file or referenced resource.
    #[error("not found: {0}")]
    NotFound(String),
    /// Malformed export artifact, unsorted basic blocks, missing address on
    /// the first instruction of a run, incompatible schema.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Operation on an unattached flow graph, double-attach, duplicate fixed
    /// point commit.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),
    /// I/O failure on result-store write, driver error.
    #[error("internal error: {0}")]
    Internal(String),
    /// Fallback for driver-specific errors wrapped without classification.
    #[error("unknown error: {0}")]
    Unknown(String),
}

impl From<std::io::Error> for DiffError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => DiffError::NotFound(err.to_string()),
            std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::InvalidData => {
                DiffError::InvalidArgument(err.to_string())
            }
            _ => DiffError::Internal(err.to_string()),
        }
    }
}

impl From<rusqlite::Error> for DiffError {
    fn from(err: rusqlite::Error) -> Self {
        DiffError::Internal(err.to_string())
    }
}

#[macro_export]
macro_rules! invalid_argument {
    ($($arg:tt)*) => {
        $crate::error::DiffError::InvalidArgument(format!($($arg)*))
    };
}

#[macro_export]
macro_rules! failed_precondition {
    ($($arg:tt)*) => {
        $crate::error::DiffError::FailedPrecondition(format!($($arg)*))
    };
}

#[macro_export]
macro_rules! ensure_arg {
    ($cond:expr, $($arg:tt)*) => {
        if !($cond) {
            return Err($crate::invalid_argument!($($arg)*));
        }
    };
}
