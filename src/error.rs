// Error taxonomy shared by the API client, the realtime channel, and the
// synchronization store

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ChatError>;

#[derive(Error, Debug)]
pub enum ChatError {
    /// REST call rejected or the server answered with a non-2xx status.
    #[error("network error: {0}")]
    Network(String),

    /// A response did not match the expected shape. Responses are rejected
    /// outright rather than coerced, so nothing malformed reaches the store.
    #[error("invalid response from server: {0}")]
    Schema(String),

    /// Missing or rejected credentials (401/403, or no stored token).
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Realtime channel failure, surfaced only once reconnection is exhausted.
    #[error("realtime channel error: {0}")]
    Channel(String),
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(code) if code.as_u16() == 401 || code.as_u16() == 403 => {
                ChatError::Auth(err.to_string())
            }
            _ => ChatError::Network(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        ChatError::Schema(err.to_string())
    }
}
