use crate::transport::TransportError;
use std::sync::Arc;
use thiserror::Error;

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// Field path or configuration key that caused the error (e.g., "backend.dir", "upstream_url")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., the offending value or file path)
    pub details: Option<String>,
    /// Source of the error (e.g., "disk_cache", "redis_cache", "config")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self {
            field_path: None,
            details: None,
            source: None,
        }
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Unified error type for the caching transport.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("Runtime error: {message}{}", format_context(.context))]
    Runtime {
        message: String,
        context: ErrorContext,
    },

    #[error("Cache storage error: {message}{}", format_context(.context))]
    Storage {
        message: String,
        context: ErrorContext,
    },

    /// The throttling gate refused admission; the upstream call was never made.
    #[error("Outbound admission failed for {key}: {reason}")]
    Admission { key: String, reason: String },

    /// The caller's cancellation token fired while it waited for a response.
    #[error("Request cancelled: {key}")]
    Cancelled { key: String },

    #[error("Network transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP message error: {0}")]
    Http(#[from] http::Error),

    /// A single delegate failure observed by every coalesced caller.
    #[error(transparent)]
    Shared(Arc<Error>),
}

// Helper function to format error context for display
fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl Error {
    /// Create a new runtime error without context.
    pub fn runtime(msg: impl Into<String>) -> Self {
        Self::runtime_with_context(msg, ErrorContext::new())
    }

    /// Create a new runtime error with structured context
    pub fn runtime_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Runtime {
            message: msg.into(),
            context,
        }
    }

    /// Create a new configuration error with structured context
    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    /// Create a new storage error with structured context
    pub fn storage_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Storage {
            message: msg.into(),
            context,
        }
    }

    /// Recover an owned error from a shared one when no other caller still holds it.
    pub fn from_shared(shared: Arc<Error>) -> Self {
        match Arc::try_unwrap(shared) {
            Ok(err) => err,
            Err(shared) => Error::Shared(shared),
        }
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Configuration { context, .. }
            | Error::Runtime { context, .. }
            | Error::Storage { context, .. } => Some(context),
            Error::Shared(inner) => inner.context(),
            _ => None,
        }
    }

    /// True when the failure happened talking to upstream (no response received).
    pub fn is_transport(&self) -> bool {
        match self {
            Error::Transport(_) => true,
            Error::Shared(inner) => inner.is_transport(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_formatting() {
        let err = Error::configuration_with_context(
            "max_concurrency must be at least 1",
            ErrorContext::new()
                .with_field_path("max_concurrency")
                .with_source("config"),
        );
        assert_eq!(
            err.to_string(),
            "Configuration error: max_concurrency must be at least 1 (field: max_concurrency, source: config)"
        );
    }

    #[test]
    fn test_shared_error_is_transparent() {
        let inner = Arc::new(Error::Transport(TransportError::Other("reset".into())));
        let shared = Error::Shared(inner.clone());
        assert_eq!(shared.to_string(), inner.to_string());
        assert!(shared.is_transport());
    }

    #[test]
    fn test_from_shared_unwraps_sole_owner() {
        let sole = Arc::new(Error::runtime("boom"));
        assert!(matches!(Error::from_shared(sole), Error::Runtime { .. }));

        let held = Arc::new(Error::runtime("boom"));
        let _other = held.clone();
        assert!(matches!(Error::from_shared(held), Error::Shared(_)));
    }
}
