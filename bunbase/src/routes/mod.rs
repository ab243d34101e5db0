//! HTTP surface assembly (§6): merges every submodule's router, resolves the bearer principal
//! once per request, and wraps the result with the layers every route shares.

pub mod admin;
pub mod extract;
pub mod files;
pub mod query_parse;
pub mod realtime;
pub mod records;

use axum::extract::DefaultBodyLimit;
use axum::http::HeaderMap;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::rules::AuthContext;
use crate::state::AppState;

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Resolves the `Authorization: Bearer <token>` header into an [`AuthContext`], defaulting to
/// anonymous when the header is absent or the token doesn't verify (§4.7).
pub fn resolve_auth(state: &AppState, headers: &HeaderMap) -> AuthContext {
  let token = headers
    .get(axum::http::header::AUTHORIZATION)
    .and_then(|v| v.to_str().ok())
    .and_then(|v| v.strip_prefix("Bearer "));
  return state.auth().resolve(token).unwrap_or_else(AuthContext::anonymous);
}

pub fn router(state: AppState) -> Router {
  return Router::new()
    .merge(records::router())
    .merge(files::router())
    .merge(realtime::router())
    .merge(admin::router())
    .layer(TraceLayer::new_for_http())
    .layer(CorsLayer::permissive())
    .layer(DefaultBodyLimit::disable())
    .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
    .with_state(state);
}
