//! Error types for the logo processing pipeline

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Error types raised by the individual pipeline stages
///
/// None of these ever reach the presentation layer: the controller converts
/// every stage failure into a fallback to the original source.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Network/transport failures, non-success responses, unreachable sources
    #[error("Fetch error: {0}")]
    Fetch(String),

    /// Malformed, truncated or unsupported image content
    #[error("Decode error: {0}")]
    Decode(String),

    /// Background-removal engine failures
    #[error("Inference error: {0}")]
    Inference(String),

    /// Resource table exhaustion, empty payloads or unknown references
    #[error("Publish error: {0}")]
    Publish(String),

    /// Invalid configuration or parameters
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Input/output errors outside the fetch stage (config files, CLI output)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The consumer lost interest before the invocation completed
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

// io::Error is not Clone; a shared execution hands the same failure to every
// waiter, so the Io variant is rebuilt from its kind and message.
impl Clone for PipelineError {
    fn clone(&self) -> Self {
        match self {
            Self::Fetch(msg) => Self::Fetch(msg.clone()),
            Self::Decode(msg) => Self::Decode(msg.clone()),
            Self::Inference(msg) => Self::Inference(msg.clone()),
            Self::Publish(msg) => Self::Publish(msg.clone()),
            Self::InvalidConfig(msg) => Self::InvalidConfig(msg.clone()),
            Self::Io(e) => Self::Io(std::io::Error::new(e.kind(), e.to_string())),
            Self::Cancelled(msg) => Self::Cancelled(msg.clone()),
            Self::Internal(msg) => Self::Internal(msg.clone()),
        }
    }
}

/// Coarse classification of a [`PipelineError`], used in logs and outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    Fetch,
    Decode,
    Inference,
    Publish,
    Config,
    Io,
    Cancelled,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Fetch => "FetchError",
            Self::Decode => "DecodeError",
            Self::Inference => "InferenceError",
            Self::Publish => "PublishError",
            Self::Config => "ConfigError",
            Self::Io => "IoError",
            Self::Cancelled => "Cancelled",
            Self::Internal => "InternalError",
        };
        f.write_str(name)
    }
}

impl PipelineError {
    /// Create a new fetch error
    pub fn fetch<S: Into<String>>(msg: S) -> Self {
        Self::Fetch(msg.into())
    }

    /// Create a new decode error
    pub fn decode<S: Into<String>>(msg: S) -> Self {
        Self::Decode(msg.into())
    }

    /// Create a new inference error
    pub fn inference<S: Into<String>>(msg: S) -> Self {
        Self::Inference(msg.into())
    }

    /// Create a new publish error
    pub fn publish<S: Into<String>>(msg: S) -> Self {
        Self::Publish(msg.into())
    }

    /// Create a new invalid configuration error
    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a new cancellation error
    pub fn cancelled<S: Into<String>>(msg: S) -> Self {
        Self::Cancelled(msg.into())
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Classify this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Fetch(_) => ErrorKind::Fetch,
            Self::Decode(_) => ErrorKind::Decode,
            Self::Inference(_) => ErrorKind::Inference,
            Self::Publish(_) => ErrorKind::Publish,
            Self::InvalidConfig(_) => ErrorKind::Config,
            Self::Io(_) => ErrorKind::Io,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether this error represents a lost consumer rather than a failure
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    // Contextual error creators

    /// Create fetch error for a non-success HTTP status
    pub fn http_status(status: u16, source: &str) -> Self {
        Self::Fetch(format!("HTTP error {} for {}", status, source))
    }

    /// Create fetch error wrapping a transport failure
    pub fn network_error<E: std::fmt::Display>(context: &str, source: &str, error: E) -> Self {
        Self::Fetch(format!("{} '{}': {}", context, source, error))
    }

    /// Create configuration error with valid ranges
    pub fn config_value_error<T: std::fmt::Display>(
        parameter: &str,
        value: T,
        valid_range: &str,
    ) -> Self {
        Self::InvalidConfig(format!(
            "Invalid {}: {} (valid range: {})",
            parameter, value, valid_range
        ))
    }

    /// Create an error tagged with the pipeline stage that raised it
    pub fn stage_error(stage: crate::progress::PipelineStage, details: &str) -> Self {
        use crate::progress::PipelineStage;

        let message = format!("{} failed: {}", stage.description(), details);
        match stage {
            PipelineStage::Fetching => Self::Fetch(message),
            PipelineStage::Decoding => Self::Decode(message),
            PipelineStage::Inference => Self::Inference(message),
            PipelineStage::Publishing => Self::Publish(message),
            _ => Self::Internal(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::PipelineStage;

    #[test]
    fn test_error_creation() {
        let err = PipelineError::fetch("connection refused");
        assert!(matches!(err, PipelineError::Fetch(_)));
        assert_eq!(err.kind(), ErrorKind::Fetch);

        let err = PipelineError::decode("truncated PNG");
        assert_eq!(err.kind(), ErrorKind::Decode);

        let err = PipelineError::cancelled("consumer dropped");
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_error_display() {
        let err = PipelineError::invalid_config("fetch timeout is zero");
        assert_eq!(err.to_string(), "Invalid configuration: fetch timeout is zero");

        let err = PipelineError::http_status(404, "https://cdn.example/missing.png");
        assert_eq!(
            err.to_string(),
            "Fetch error: HTTP error 404 for https://cdn.example/missing.png"
        );
    }

    #[test]
    fn test_kind_display_names() {
        assert_eq!(ErrorKind::Fetch.to_string(), "FetchError");
        assert_eq!(ErrorKind::Decode.to_string(), "DecodeError");
        assert_eq!(ErrorKind::Inference.to_string(), "InferenceError");
        assert_eq!(ErrorKind::Publish.to_string(), "PublishError");
    }

    #[test]
    fn test_contextual_errors() {
        let err = PipelineError::config_value_error("max_fetch_bytes", 0, "1-1073741824");
        let text = err.to_string();
        assert!(text.contains("max_fetch_bytes"));
        assert!(text.contains("1-1073741824"));

        let err = PipelineError::stage_error(PipelineStage::Inference, "model returned no output");
        assert_eq!(err.kind(), ErrorKind::Inference);
        assert!(err.to_string().contains("model returned no output"));

        let err = PipelineError::stage_error(PipelineStage::Decoding, "bad header");
        assert_eq!(err.kind(), ErrorKind::Decode);
    }

    #[test]
    fn test_clone_preserves_kind_and_message() {
        let err = PipelineError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "logo.png missing",
        ));
        let copy = err.clone();
        assert_eq!(copy.kind(), ErrorKind::Io);
        assert!(copy.to_string().contains("logo.png missing"));

        let err = PipelineError::inference("model crashed");
        assert_eq!(err.clone().to_string(), err.to_string());
    }
}
