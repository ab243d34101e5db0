//! Central error taxonomy (§7). Every fallible subsystem funnels into [`AppError`], which the
//! dispatcher maps to a stable `{"error": ...}` JSON body and HTTP status.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};

static DEV_MODE: AtomicBool = AtomicBool::new(false);

/// Toggles whether internal error details are exposed in responses (§9 open question). Set once
/// at startup from the `--dev` CLI flag.
pub fn set_dev_mode(enabled: bool) {
  DEV_MODE.store(enabled, Ordering::Relaxed);
}

fn dev_mode() -> bool {
  return DEV_MODE.load(Ordering::Relaxed);
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
  #[error("Validation error: {0}")]
  Validation(String),

  #[error("Unauthorized")]
  Unauthorized,

  #[error("Forbidden: {0}")]
  Forbidden(String),

  #[error("Not found: {0}")]
  NotFound(String),

  #[error("Conflict: {0}")]
  Conflict(String),

  #[error("Internal error: {0}")]
  Internal(Box<dyn std::error::Error + Send + Sync>),
}

impl AppError {
  pub fn internal<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
    return AppError::Internal(Box::new(err));
  }

  fn status(&self) -> StatusCode {
    return match self {
      AppError::Validation(_) => StatusCode::BAD_REQUEST,
      AppError::Unauthorized => StatusCode::UNAUTHORIZED,
      AppError::Forbidden(_) => StatusCode::FORBIDDEN,
      AppError::NotFound(_) => StatusCode::NOT_FOUND,
      AppError::Conflict(_) => StatusCode::CONFLICT,
      AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
  }

  /// Message safe to show to the client. In production, internal errors are redacted.
  fn public_message(&self, dev_mode: bool) -> String {
    return match self {
      AppError::Internal(err) if !dev_mode => {
        log::error!("internal error: {err}");
        "internal error".to_string()
      }
      other => other.to_string(),
    };
  }

  /// Render as the response body the dispatcher sends. `dev_mode` gates whether internal error
  /// details are exposed (§9 open question: development-mode error exposure).
  pub fn into_response_with_mode(self, dev_mode: bool) -> Response {
    let status = self.status();
    let message = self.public_message(dev_mode);
    return (status, Json(json!({ "error": message }))).into_response();
  }
}

impl From<bunbase_sqlite::Error> for AppError {
  fn from(err: bunbase_sqlite::Error) -> Self {
    return AppError::Internal(Box::new(err));
  }
}

impl From<rusqlite::Error> for AppError {
  fn from(err: rusqlite::Error) -> Self {
    return AppError::Internal(Box::new(err));
  }
}

impl From<rusqlite::types::FromSqlError> for AppError {
  fn from(err: rusqlite::types::FromSqlError) -> Self {
    return AppError::Internal(Box::new(err));
  }
}

impl From<serde_json::Error> for AppError {
  fn from(err: serde_json::Error) -> Self {
    return AppError::Validation(format!("invalid json: {err}"));
  }
}

impl IntoResponse for AppError {
  fn into_response(self) -> Response {
    return self.into_response_with_mode(dev_mode());
  }
}
