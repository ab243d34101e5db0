//! File download route (§6): `GET /api/files/:collection/:id/:filename`.
//!
//! Gates on the record's viewRule before ever touching the filesystem: a record the caller
//! isn't allowed to see must not leak its attachments either (§4.10).

use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;

use crate::error::AppError;
use crate::state::AppState;

use super::resolve_auth;

pub fn router() -> Router<AppState> {
  return Router::new().route("/api/files/{collection}/{id}/{filename}", get(download));
}

async fn download(
  State(state): State<AppState>,
  Path((collection, id, filename)): Path<(String, String, String)>,
  headers: HeaderMap,
) -> Result<Response, AppError> {
  let auth = resolve_auth(&state, &headers);
  state.records().get(&collection, &id, &auth).await?;

  let (bytes, mime) = state.files().read(&collection, &id, &filename).await?;

  let mut response = bytes.into_response();
  if let Ok(value) = HeaderValue::from_str(&mime) {
    response.headers_mut().insert(axum::http::header::CONTENT_TYPE, value);
  }
  return Ok(response);
}
