use serde::{Deserialize, Serialize};

use crate::protocol::ResponseMeta;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    RateLimited,
    Internal,
}

impl ErrorCode {
    /// Maps an HTTP status (or a `meta.code` echoing one) onto a coarse class.
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            200..=299 => None,
            401 => Some(Self::Unauthorized),
            403 => Some(Self::Forbidden),
            404 => Some(Self::NotFound),
            429 => Some(Self::RateLimited),
            400..=499 => Some(Self::Validation),
            _ => Some(Self::Internal),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    /// Builds an error from a response `meta` block, falling back to the HTTP
    /// status when the server left `meta.code` out.
    pub fn from_meta(status: u16, meta: &ResponseMeta) -> Self {
        let effective = meta.code.unwrap_or(status);
        let code = ErrorCode::from_status(effective).unwrap_or(ErrorCode::Internal);
        let message = meta
            .error_message
            .clone()
            .unwrap_or_else(|| format!("server responded with status {status}"));
        Self { code, message }
    }
}
