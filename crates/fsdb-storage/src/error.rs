//! Error taxonomy shared by every storage operation.
//!
//! OS errors are translated once, at the store boundary, through
//! [`StorageError::io`]. Errors carrying a message render it verbatim because
//! callers match on the exact text of conflict and bad-request reasons.

use std::path::PathBuf;

/// Semantic error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum StorageErrorKind {
    /// Document, revision or attachment does not exist.
    NotFound,
    /// Permission denied by the filesystem.
    Forbidden,
    /// Malformed payload or invalid request.
    BadRequest,
    /// Supplied revision does not match the stored state.
    Conflict,
    /// Resource already exists.
    PreconditionFailed,
    /// Unclassified I/O failure.
    Internal,
    /// Operation stopped through a [`CancelToken`](crate::CancelToken).
    Cancelled,
}

impl StorageErrorKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "Not found",
            Self::Forbidden => "Forbidden",
            Self::BadRequest => "Bad request",
            Self::Conflict => "Conflict",
            Self::PreconditionFailed => "Precondition failed",
            Self::Internal => "Internal error",
            Self::Cancelled => "Cancelled",
        }
    }
}

/// Storage error with semantic kind, optional reason and path context.
#[derive(Debug)]
pub struct StorageError {
    /// Semantic error category.
    pub kind: StorageErrorKind,
    /// Path context (if applicable).
    pub path: Option<PathBuf>,
    message: Option<String>,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl StorageError {
    /// Create a new storage error.
    #[must_use]
    pub fn new(kind: StorageErrorKind) -> Self {
        Self {
            kind,
            path: None,
            message: None,
            source: None,
        }
    }

    /// Attach path context.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Attach a human-readable reason, rendered verbatim by `Display`.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Attach the underlying error source.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Reason attached with [`with_message`](Self::with_message).
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Downcast the source error to a concrete type.
    #[must_use]
    pub fn downcast_source<E: std::error::Error + 'static>(&self) -> Option<&E> {
        self.source.as_ref()?.downcast_ref()
    }

    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StorageErrorKind::NotFound).with_message(message)
    }

    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StorageErrorKind::BadRequest).with_message(message)
    }

    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StorageErrorKind::Conflict).with_message(message)
    }

    #[must_use]
    pub fn precondition_failed(message: impl Into<String>) -> Self {
        Self::new(StorageErrorKind::PreconditionFailed).with_message(message)
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StorageErrorKind::Internal).with_message(message)
    }

    #[must_use]
    pub fn cancelled() -> Self {
        Self::new(StorageErrorKind::Cancelled)
    }

    /// Create a storage error from an I/O error.
    #[must_use]
    pub fn io(err: std::io::Error, path: Option<PathBuf>) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => StorageErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => StorageErrorKind::Forbidden,
            _ => StorageErrorKind::Internal,
        };
        let mut error = Self::new(kind).with_source(err);
        if let Some(p) = path {
            error = error.with_path(p);
        }
        error
    }

    /// HTTP-style status code for adapters that expose one.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self.kind {
            StorageErrorKind::NotFound => 404,
            StorageErrorKind::Forbidden => 403,
            StorageErrorKind::BadRequest => 400,
            StorageErrorKind::Conflict => 409,
            StorageErrorKind::PreconditionFailed => 412,
            StorageErrorKind::Internal => 500,
            StorageErrorKind::Cancelled => 499,
        }
    }
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Format: "message" or "Kind: source (path: /foo/bar)"
        if let Some(message) = &self.message {
            write!(f, "{message}")?;
        } else {
            write!(f, "{}", self.kind.as_str())?;
        }

        if let Some(source) = &self.source {
            write!(f, ": {source}")?;
        }

        if let Some(path) = &self.path {
            write!(f, " (path: {})", path.display())?;
        }

        Ok(())
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|s| s.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Shorthand for results produced by this crate.
pub type Result<T, E = StorageError> = std::result::Result<T, E>;

/// Extension for attaching path context to `std::io::Result`.
pub(crate) trait IoResultExt<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| StorageError::io(e, Some(path.into())))
    }
}
