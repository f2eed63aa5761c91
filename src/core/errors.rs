use thiserror::Error;

/// Unified error type for the plexus runtime.
///
/// Addressing and timeout errors are *data*: the engine converts them into a
/// result delivered along the originating path instead of aborting anything.
/// Lifecycle errors are fatal to the violating extension group only.
#[derive(Debug, Error)]
pub enum PlexusError {
    /// The destination names a graph id with no live engine behind it.
    #[error("Graph not found.")]
    GraphNotFound { graph_id: String },

    /// The destination names an extension that is not a node of the resolved
    /// graph.
    #[error("The extension[{extension}] is invalid.")]
    ExtensionInvalid { extension: String },

    /// The destination names a remote app for which no outbound transport is
    /// registered.
    #[error("App unreachable: {uri}")]
    AppUnreachable { uri: String },

    /// A path deadline elapsed before its result(s) arrived.
    #[error("Operation timed out: {operation} ({timeout_ms}ms)")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Malformed inbound message at the external boundary.
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Illegal lifecycle transition: double-stop, unbalanced lock mode,
    /// send after engine-closing.
    #[error("Lifecycle error in {scope}: {message}")]
    Lifecycle { scope: String, message: String },

    /// Graph or configuration rejected at build time.
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    /// Serialization errors
    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl PlexusError {
    pub fn graph_not_found<S: Into<String>>(graph_id: S) -> Self {
        Self::GraphNotFound {
            graph_id: graph_id.into(),
        }
    }

    pub fn extension_invalid<S: Into<String>>(extension: S) -> Self {
        Self::ExtensionInvalid {
            extension: extension.into(),
        }
    }

    pub fn app_unreachable<S: Into<String>>(uri: S) -> Self {
        Self::AppUnreachable { uri: uri.into() }
    }

    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn lifecycle<S: Into<String>, M: Into<String>>(scope: S, message: M) -> Self {
        Self::Lifecycle {
            scope: scope.into(),
            message: message.into(),
        }
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
            field: None,
        }
    }

    pub fn validation_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Error category for logging and metrics.
    pub fn category(&self) -> &'static str {
        match self {
            Self::GraphNotFound { .. }
            | Self::ExtensionInvalid { .. }
            | Self::AppUnreachable { .. } => "addressing",
            Self::Timeout { .. } => "timeout",
            Self::Protocol { .. } => "protocol",
            Self::Lifecycle { .. } => "lifecycle",
            Self::Validation { .. } => "validation",
            Self::Serialization { .. } => "serialization",
            Self::Internal { .. } => "internal",
        }
    }

}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, PlexusError>;

impl From<serde_json::Error> for PlexusError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            format: "json".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<serde_yaml::Error> for PlexusError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization {
            format: "yaml".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<anyhow::Error> for PlexusError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(format!("{err:#}"))
    }
}
