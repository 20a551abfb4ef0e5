use davfs_client::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("No such file or directory: {path}")]
    NotFound { path: String },

    #[error("Not a directory: {path}")]
    NotDirectory { path: String },

    #[error("Is a directory: {path}")]
    IsDirectory { path: String },

    #[error("Name already exists: {path}")]
    AlreadyExists { path: String },

    #[error("Directory not empty: {path}")]
    NotEmpty { path: String },

    #[error("Stale file handle: {name}")]
    Stale { name: String },

    #[error("Operation not permitted: {op}")]
    PermissionDenied { op: String },

    #[error("Cannot shrink {path} from {from} to {to} bytes in place")]
    OutOfRange { path: String, from: u64, to: u64 },

    #[error("Invalid argument: {msg}")]
    InvalidArgument { msg: String },

    #[error("Rename of {from} did not settle after {attempts} attempts")]
    RenameContention { from: String, attempts: usize },

    #[error("Remote store error: {0}")]
    Remote(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, FsError>;

impl FsError {
    pub fn stale(name: &str) -> Self {
        FsError::Stale {
            name: name.to_string(),
        }
    }

    /// Lift a remote failure, naming `path` when the resource is missing.
    pub fn remote(err: StoreError, path: &str) -> Self {
        match err {
            StoreError::NotFound { .. } => FsError::NotFound {
                path: path.to_string(),
            },
            other => FsError::Remote(other),
        }
    }

    pub fn to_errno(&self) -> i32 {
        use libc::*;
        match self {
            FsError::NotFound { .. } => ENOENT,
            FsError::NotDirectory { .. } => ENOTDIR,
            FsError::IsDirectory { .. } => EISDIR,
            FsError::AlreadyExists { .. } => EEXIST,
            FsError::NotEmpty { .. } => ENOTEMPTY,
            FsError::Stale { .. } => ESTALE,
            FsError::PermissionDenied { .. } => EPERM,
            FsError::OutOfRange { .. } => ERANGE,
            FsError::InvalidArgument { .. } => EINVAL,
            FsError::RenameContention { .. } => EBUSY,
            FsError::Remote(e) => match e {
                StoreError::NotFound { .. } => ENOENT,
                StoreError::AlreadyExists { .. } => EEXIST,
                StoreError::PermissionDenied { .. } => EACCES,
                StoreError::Timeout { .. } => ETIMEDOUT,
                StoreError::Conflict { .. }
                | StoreError::Http { .. }
                | StoreError::Transport { .. }
                | StoreError::Protocol { .. } => EIO,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_errno() {
        let err = FsError::NotFound {
            path: "/a".to_string(),
        };
        assert_eq!(err.to_errno(), libc::ENOENT);
    }

    #[test]
    fn test_stale_errno() {
        assert_eq!(FsError::stale("f").to_errno(), libc::ESTALE);
    }

    #[test]
    fn test_not_empty_errno() {
        let err = FsError::NotEmpty {
            path: "/d".to_string(),
        };
        assert_eq!(err.to_errno(), libc::ENOTEMPTY);
    }

    #[test]
    fn test_out_of_range_errno() {
        let err = FsError::OutOfRange {
            path: "/f".to_string(),
            from: 10,
            to: 5,
        };
        assert_eq!(err.to_errno(), libc::ERANGE);
    }

    #[test]
    fn test_permission_denied_errno() {
        let err = FsError::PermissionDenied {
            op: "chmod".to_string(),
        };
        assert_eq!(err.to_errno(), libc::EPERM);
    }

    #[test]
    fn test_type_mismatch_errnos() {
        let dir = FsError::IsDirectory {
            path: "/d".to_string(),
        };
        let file = FsError::NotDirectory {
            path: "/f".to_string(),
        };
        assert_eq!(dir.to_errno(), libc::EISDIR);
        assert_eq!(file.to_errno(), libc::ENOTDIR);
    }

    #[test]
    fn test_rename_contention_errno() {
        let err = FsError::RenameContention {
            from: "/a".to_string(),
            attempts: 64,
        };
        assert_eq!(err.to_errno(), libc::EBUSY);
    }

    #[test]
    fn test_remote_errnos() {
        let timeout = FsError::from(StoreError::Timeout {
            path: "/a".to_string(),
        });
        assert_eq!(timeout.to_errno(), libc::ETIMEDOUT);
        let denied = FsError::from(StoreError::PermissionDenied {
            path: "/a".to_string(),
        });
        assert_eq!(denied.to_errno(), libc::EACCES);
        let transport = FsError::from(StoreError::Transport {
            reason: "reset".to_string(),
        });
        assert_eq!(transport.to_errno(), libc::EIO);
    }

    #[test]
    fn test_remote_not_found_becomes_not_found() {
        let err = FsError::remote(StoreError::not_found("/x"), "/x");
        assert!(matches!(err, FsError::NotFound { .. }));
        let err = FsError::remote(
            StoreError::Transport {
                reason: "down".to_string(),
            },
            "/x",
        );
        assert!(matches!(err, FsError::Remote(_)));
    }

    #[test]
    fn test_display_messages_non_empty() {
        let errors = [
            FsError::NotFound {
                path: "/a".to_string(),
            },
            FsError::AlreadyExists {
                path: "/a".to_string(),
            },
            FsError::stale("a"),
            FsError::InvalidArgument {
                msg: "bad".to_string(),
            },
        ];
        for err in errors {
            assert!(!err.to_string().is_empty());
        }
    }
}
