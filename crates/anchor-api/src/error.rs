//! API error type and [`axum::response::IntoResponse`] implementation.
//!
//! Bodies are always `{"error": "<kind>", "message": "<text>"}`.

use anchor_core::store::{ErrorKind, StoreError};
use axum::{
  Json,
  http::StatusCode,
  response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// An error returned by an API handler.
#[derive(Debug, Error)]
pub enum ApiError {
  /// A store or core failure, already classified.
  #[error("{message}")]
  Store { kind: ErrorKind, message: String },

  #[error("not found: {0}")]
  NotFound(String),

  #[error("bad request: {0}")]
  BadRequest(String),

  /// The resource existed but has expired.
  #[error("gone: {0}")]
  Gone(String),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

impl ApiError {
  /// Classify any backend error.
  pub fn store<E: StoreError>(e: E) -> Self {
    Self::Store { kind: e.kind(), message: e.to_string() }
  }

  pub fn status(&self) -> StatusCode {
    match self {
      Self::Store { kind, .. } => match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict | ErrorKind::ChainIntegrity => StatusCode::CONFLICT,
        ErrorKind::Transient => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
      },
      Self::NotFound(_) => StatusCode::NOT_FOUND,
      Self::BadRequest(_) => StatusCode::BAD_REQUEST,
      Self::Gone(_) => StatusCode::GONE,
      Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
  }

  fn code(&self) -> &'static str {
    match self {
      Self::Store { kind, .. } => kind.as_str(),
      Self::NotFound(_) => "not_found",
      Self::BadRequest(_) => "validation",
      Self::Gone(_) => "gone",
      Self::Io(_) => "internal",
    }
  }
}

impl From<anchor_core::Error> for ApiError {
  fn from(e: anchor_core::Error) -> Self { Self::store(e) }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let status = self.status();
    if status.is_server_error() {
      error!(error = %self, "request failed");
    }
    let body = json!({ "error": self.code(), "message": self.to_string() });
    (status, Json(body)).into_response()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn kinds_map_to_statuses() {
    let cases = [
      (ErrorKind::Validation, StatusCode::BAD_REQUEST),
      (ErrorKind::NotFound, StatusCode::NOT_FOUND),
      (ErrorKind::Conflict, StatusCode::CONFLICT),
      (ErrorKind::ChainIntegrity, StatusCode::CONFLICT),
      (ErrorKind::Transient, StatusCode::SERVICE_UNAVAILABLE),
      (ErrorKind::Internal, StatusCode::INTERNAL_SERVER_ERROR),
    ];
    for (kind, status) in cases {
      let e = ApiError::Store { kind, message: String::new() };
      assert_eq!(e.status(), status, "{kind:?}");
    }
  }

  #[test]
  fn core_validation_is_bad_request() {
    let e = ApiError::from(anchor_core::Error::InvalidCursor);
    assert_eq!(e.status(), StatusCode::BAD_REQUEST);
    assert_eq!(e.code(), "validation");
  }
}
