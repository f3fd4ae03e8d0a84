use thiserror::Error;

/// Closed error taxonomy for the whole crate.
///
/// The transport layer is responsible for translating protocol-specific
/// failures into these variants before they reach the core. Variants are
/// `Clone` because a background fetch worker may need to both log an error
/// and park a copy of it for the thread waiting on the page.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FsError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("two-factor authentication required")]
    TwoFactorRequired,

    #[error("read-only: {0}")]
    ReadOnly(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("write mode violation: {0}")]
    WriteType(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid data: {0}")]
    Invalid(String),
}

impl FsError {
    /// POSIX errno for surfacing through the FUSE layer.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound(_) => libc::ENOENT,
            FsError::AccessDenied(_) => libc::EACCES,
            FsError::AuthenticationFailed(_) => libc::EACCES,
            FsError::TwoFactorRequired => libc::EACCES,
            FsError::ReadOnly(_) => libc::EROFS,
            FsError::Unsupported(_) => libc::ENOTSUP,
            FsError::WriteType(_) => libc::ENOTSUP,
            FsError::Conflict(_) => libc::EEXIST,
            FsError::Transport(_) => libc::EIO,
            FsError::Invalid(_) => libc::EINVAL,
        }
    }
}

impl From<std::io::Error> for FsError {
    fn from(e: std::io::Error) -> Self {
        FsError::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for FsError {
    fn from(e: serde_json::Error) -> Self {
        FsError::Invalid(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FsError>;
