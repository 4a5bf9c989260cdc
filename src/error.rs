use thiserror::Error;

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for the agent runtime.
///
/// Tool failures are deliberately absent: a tool that is missing or that
/// fails during invocation is surfaced to the model as an error-carrying
/// tool result part, never as an `Error` escaping the orchestrator.
#[derive(Debug, Error)]
pub enum Error {
    /// Missing API key, unknown provider, invalid model string.
    /// Raised at model-construction time, never at agent construction.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Malformed wire frame, unexpected finish reason, schema-mapping failure
    #[error("{provider} protocol error: {message}")]
    Protocol { provider: String, message: String },

    /// Transport-layer failure
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// JSON serialization/deserialization failure
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Non-2xx response from a provider endpoint
    #[error("API error: {0}")]
    Api(String),

    /// SSE decoding or mid-stream failure
    #[error("stream error: {0}")]
    Stream(String),

    /// A tool result arrived for a name with no outstanding call
    #[error("no outstanding tool call named '{0}'")]
    NoMatchingCall(String),
}

impl Error {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    pub fn protocol(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Protocol {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn api(msg: impl Into<String>) -> Self {
        Error::Api(msg.into())
    }

    pub fn stream(msg: impl Into<String>) -> Self {
        Error::Stream(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_display() {
        let err = Error::configuration("missing OPENAI_API_KEY");
        assert_eq!(
            err.to_string(),
            "invalid configuration: missing OPENAI_API_KEY"
        );
    }

    #[test]
    fn test_protocol_display_includes_provider() {
        let err = Error::protocol("google", "unexpected finish reason");
        assert_eq!(
            err.to_string(),
            "google protocol error: unexpected finish reason"
        );
    }

    #[test]
    fn test_json_error_conversion() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: Error = parse_err.into();
        assert!(matches!(err, Error::Json(_)));
    }
}
