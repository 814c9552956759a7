use std::{io, path::PathBuf, time::Duration};
use thiserror::Error;

pub type Result<T, E = ModError> = std::result::Result<T, E>;

type Cause = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidSource,
    FetchError,
    RateLimited,
    UnsupportedFormat,
    UnsafeArchiveEntry,
    PathConflict,
    UpdateFailed,
    RollbackFailed,
    NotFound,
    Inconsistent,
    Cancelled,
    Io,
    Corrupt,
}

impl ErrorKind {
    pub fn label(self) -> &'static str {
        match self {
            ErrorKind::InvalidSource => "invalid source",
            ErrorKind::FetchError => "fetch error",
            ErrorKind::RateLimited => "rate limited",
            ErrorKind::UnsupportedFormat => "unsupported format",
            ErrorKind::UnsafeArchiveEntry => "unsafe archive entry",
            ErrorKind::PathConflict => "path conflict",
            ErrorKind::UpdateFailed => "update failed",
            ErrorKind::RollbackFailed => "rollback failed",
            ErrorKind::NotFound => "not found",
            ErrorKind::Inconsistent => "inconsistent",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Io => "i/o error",
            ErrorKind::Corrupt => "corrupt data",
        }
    }
}

/// Every failure the engine reports. Each variant renders a human message via
/// `Display` and exposes its underlying cause (if any) through `source()`.
#[derive(Debug, Error)]
pub enum ModError {
    #[error("cannot use '{reference}' as a mod source: {reason}")]
    InvalidSource { reference: String, reason: String },

    #[error("failed to fetch {url}: {message}")]
    Fetch {
        url: String,
        message: String,
        status: Option<u16>,
        retryable: bool,
        #[source]
        cause: Option<Cause>,
    },

    #[error("rate limited by {url}{}", format_retry_after(.retry_after))]
    RateLimited {
        url: String,
        retry_after: Option<Duration>,
    },

    #[error("unsupported archive format: {signature}")]
    UnsupportedFormat { signature: String },

    #[error("archive entry '{entry}' is unsafe: {reason}")]
    UnsafeArchiveEntry { entry: String, reason: String },

    #[error("'{path}' is already owned by {owner}")]
    PathConflict { path: String, owner: String },

    #[error("update of '{id}' failed: {reason}")]
    UpdateFailed {
        id: String,
        reason: String,
        #[source]
        cause: Option<Box<ModError>>,
    },

    #[error(
        "rollback of '{id}' failed: {reason}; backup kept at {}",
        .backup.display()
    )]
    RollbackFailed {
        id: String,
        reason: String,
        backup: PathBuf,
        #[source]
        cause: Option<Box<ModError>>,
    },

    #[error("mod '{0}' not found")]
    NotFound(String),

    #[error("'{id}' is inconsistent: {reason}")]
    Inconsistent { id: String, reason: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("cannot parse {}: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn format_retry_after(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(delay) => format!(" (retry after {}s)", delay.as_secs()),
        None => String::new(),
    }
}

impl ModError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ModError::InvalidSource { .. } => ErrorKind::InvalidSource,
            ModError::Fetch { .. } => ErrorKind::FetchError,
            ModError::RateLimited { .. } => ErrorKind::RateLimited,
            ModError::UnsupportedFormat { .. } => ErrorKind::UnsupportedFormat,
            ModError::UnsafeArchiveEntry { .. } => ErrorKind::UnsafeArchiveEntry,
            ModError::PathConflict { .. } => ErrorKind::PathConflict,
            ModError::UpdateFailed { .. } => ErrorKind::UpdateFailed,
            ModError::RollbackFailed { .. } => ErrorKind::RollbackFailed,
            ModError::NotFound(_) => ErrorKind::NotFound,
            ModError::Inconsistent { .. } => ErrorKind::Inconsistent,
            ModError::Cancelled => ErrorKind::Cancelled,
            ModError::Io { .. } => ErrorKind::Io,
            ModError::Corrupt { .. } => ErrorKind::Corrupt,
        }
    }

    /// True when repeating the same request later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ModError::Fetch { retryable, .. } => *retryable,
            ModError::RateLimited { .. } => true,
            _ => false,
        }
    }

    pub fn invalid_source(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        ModError::InvalidSource {
            reference: reference.into(),
            reason: reason.into(),
        }
    }

    pub fn fetch_permanent(url: impl Into<String>, message: impl Into<String>) -> Self {
        ModError::Fetch {
            url: url.into(),
            message: message.into(),
            status: None,
            retryable: false,
            cause: None,
        }
    }

    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        ModError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn update_failed(id: impl Into<String>, cause: ModError) -> Self {
        ModError::UpdateFailed {
            id: id.into(),
            reason: cause.to_string(),
            cause: Some(Box::new(cause)),
        }
    }
}

/// `.io_context("...")` mirrors anyhow's `.context` for local filesystem calls.
pub trait IoContext<T> {
    fn io_context(self, context: impl Into<String>) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn io_context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|err| ModError::io(context, err))
    }
}

impl From<walkdir::Error> for ModError {
    fn from(err: walkdir::Error) -> Self {
        let context = match err.path() {
            Some(path) => format!("walk {}", path.display()),
            None => "walk directory".to_string(),
        };
        let source = err
            .into_io_error()
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "filesystem loop"));
        ModError::io(context, source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn fetch_errors_keep_their_cause() {
        let err = ModError::Fetch {
            url: "https://example.com/a.zip".to_string(),
            message: "connection reset".to_string(),
            status: None,
            retryable: true,
            cause: Some(Box::new(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))),
        };
        assert_eq!(err.kind(), ErrorKind::FetchError);
        assert!(err.is_retryable());
        assert_eq!(err.source().map(|cause| cause.to_string()).as_deref(), Some("reset"));
    }

    #[test]
    fn rate_limit_message_mentions_delay() {
        let err = ModError::RateLimited {
            url: "https://api.github.com/repos/a/b".to_string(),
            retry_after: Some(Duration::from_secs(42)),
        };
        assert!(err.to_string().ends_with("(retry after 42s)"));
        assert!(err.is_retryable());
    }

    #[test]
    fn update_failure_wraps_inner_error() {
        let inner = ModError::io("copy file", io::Error::new(io::ErrorKind::Other, "disk full"));
        let err = ModError::update_failed("my-mod", inner);
        assert_eq!(err.kind(), ErrorKind::UpdateFailed);
        assert!(err.to_string().contains("disk full"));
        assert_eq!(err.source().map(|cause| cause.to_string()).as_deref(), Some("copy file: disk full"));
    }
}
