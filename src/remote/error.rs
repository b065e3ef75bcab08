use thiserror::Error;

use super::RemoteRecord;

#[derive(Error, Debug, Clone)]
pub enum RemoteError {
  #[error("Network error: {0}")]
  Network(String),

  #[error("Authentication rejected ({status}): {message}")]
  Auth { status: u16, message: String },

  #[error("Server error {status}: {message}")]
  Server { status: u16, message: String },

  #[error("Conflict: remote holds version {}", .0.version)]
  Conflict(Box<RemoteRecord>),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl RemoteError {
  /// Truncate a response body to avoid logging excessive data
  fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY_LENGTH {
      body.to_string()
    } else {
      let mut end = MAX_ERROR_BODY_LENGTH;
      while !body.is_char_boundary(end) {
        end -= 1;
      }
      format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }
  }

  /// Map a non-success status. 409 is handled by the caller because its body
  /// carries the authoritative record.
  pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
    let message = Self::truncate_body(body);
    match status.as_u16() {
      code @ (401 | 403) => RemoteError::Auth {
        status: code,
        message,
      },
      code => RemoteError::Server {
        status: code,
        message,
      },
    }
  }

  /// Transient failures worth another attempt. Other 4xx answers will not
  /// change on a resend.
  pub fn is_retryable(&self) -> bool {
    match self {
      RemoteError::Network(_) => true,
      RemoteError::Server { status, .. } => *status >= 500 || matches!(status, 408 | 429),
      RemoteError::Auth { .. } | RemoteError::Conflict(_) => false,
    }
  }
}

impl From<reqwest::Error> for RemoteError {
  fn from(err: reqwest::Error) -> Self {
    RemoteError::Network(err.to_string())
  }
}
