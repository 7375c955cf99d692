use serde_json::Value;
use shared::{domain::MessageId, error::ApiError};
use thiserror::Error;

/// Failure of an authenticated request against a public chat server.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("invalid request url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("no token available for {server_url}")]
    NoToken { server_url: String },
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("response from {url} was not valid JSON (status {status})")]
    InvalidBody { url: String, status: u16 },
    #[error("{url} responded with status {status}: {}", .error.message)]
    Status {
        url: String,
        status: u16,
        error: ApiError,
        body: Value,
    },
    #[error("unexpected response shape from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl RequestError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::InvalidBody { status, .. } | Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum PublicChatError {
    #[error("failed to delete public chat message {server_id} on {channel}")]
    DeleteFailed {
        server_id: MessageId,
        channel: String,
        #[source]
        source: RequestError,
    },
}

#[derive(Debug, Error)]
pub enum ChallengeError {
    #[error("challenge field {field} is not valid base64: {source}")]
    Base64 {
        field: &'static str,
        #[source]
        source: base64::DecodeError,
    },
    #[error("server public key must be 32 bytes, got {0}")]
    ServerKeyLength(usize),
    #[error("challenge ciphertext too short: {0} bytes")]
    CiphertextTooShort(usize),
    #[error("challenge could not be decrypted with the local identity")]
    Decrypt,
    #[error("decrypted token is not valid UTF-8")]
    TokenEncoding,
}
