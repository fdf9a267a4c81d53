use thiserror::Error;

/// Failure taxonomy shared by client and server.
///
/// `Security`, `Validation` and `Inference` are per-request: the server turns
/// them into an error delta on the job stream. `Initialization` is fatal to
/// the serving process.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("security error: {0}")]
    Security(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("inference error: {0}")]
    Inference(String),

    #[error("initialization error: {0}")]
    Initialization(String),
}

impl RelayError {
    pub fn security(message: impl Into<String>) -> Self {
        RelayError::Security(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        RelayError::Validation(message.into())
    }

    pub fn inference(message: impl Into<String>) -> Self {
        RelayError::Inference(message.into())
    }

    pub fn initialization(message: impl Into<String>) -> Self {
        RelayError::Initialization(message.into())
    }

    /// Text carried by an error delta, without the category prefix.
    pub fn client_message(&self) -> &str {
        match self {
            | RelayError::Security(msg)
            | RelayError::Validation(msg)
            | RelayError::Inference(msg)
            | RelayError::Initialization(msg) => msg,
        }
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        RelayError::Inference(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_category() {
        let err = RelayError::validation("No prompt provided");
        assert_eq!(err.to_string(), "validation error: No prompt provided");
        assert_eq!(err.client_message(), "No prompt provided");
    }
}
