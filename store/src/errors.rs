use thiserror::Error;

/// Failure conditions of filesystem-session operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FsError {
    #[error("operation on a closed or unknown handle")]
    InvalidHandle,
    #[error("path component does not exist")]
    LookupFailed,
    #[error("operation refused by policy")]
    PermissionDenied,
    #[error("node already exists")]
    NodeAlreadyExists,
    #[error("directory is not empty")]
    NotEmpty,
    #[error("no space left on the backing store")]
    NoSpace,
    #[error("out of metadata storage")]
    OutOfMetadata,
    #[error("name exceeds the session limit")]
    NameTooLong,
    #[error("per-session handle or root limit reached")]
    OutOfNodeHandles,
}

impl From<std::io::Error> for FsError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::NotFound => FsError::LookupFailed,
            ErrorKind::PermissionDenied => FsError::PermissionDenied,
            ErrorKind::AlreadyExists => FsError::NodeAlreadyExists,
            ErrorKind::DirectoryNotEmpty => FsError::NotEmpty,
            _ => FsError::LookupFailed,
        }
    }
}
