use thiserror::Error;

/// Failures reported by a remote store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("resource not found: {path}")]
    NotFound { path: String },

    #[error("resource already exists: {path}")]
    AlreadyExists { path: String },

    #[error("conflict on {path}: {reason}")]
    Conflict { path: String, reason: String },

    #[error("permission denied: {path}")]
    PermissionDenied { path: String },

    #[error("unexpected HTTP status {status} for {path}")]
    Http { status: u16, path: String },

    #[error("request for {path} timed out")]
    Timeout { path: String },

    #[error("transport error: {reason}")]
    Transport { reason: String },

    #[error("protocol error: {reason}")]
    Protocol { reason: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    pub fn not_found(path: &str) -> Self {
        StoreError::NotFound {
            path: path.to_string(),
        }
    }

    pub fn conflict(path: &str, reason: impl Into<String>) -> Self {
        StoreError::Conflict {
            path: path.to_string(),
            reason: reason.into(),
        }
    }

    /// Maps an HTTP status that signals failure onto the store taxonomy.
    pub fn from_status(status: u16, path: &str) -> Self {
        let path = path.to_string();
        match status {
            401 | 403 => StoreError::PermissionDenied { path },
            404 | 410 => StoreError::NotFound { path },
            408 | 504 => StoreError::Timeout { path },
            409 | 412 | 423 => StoreError::Conflict {
                path,
                reason: format!("status {}", status),
            },
            _ => StoreError::Http { status, path },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            let path = e.url().map(|u| u.path().to_string()).unwrap_or_default();
            return StoreError::Timeout { path };
        }
        if let Some(status) = e.status() {
            let path = e.url().map(|u| u.path().to_string()).unwrap_or_default();
            return StoreError::from_status(status.as_u16(), &path);
        }
        StoreError::Transport {
            reason: e.to_string(),
        }
    }
}
