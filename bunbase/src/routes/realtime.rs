//! Realtime routes (§4.9/§6): `GET /api/realtime` opens the SSE stream, `POST /api/realtime`
//! (re)sets a client's subscription set.

use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{KeepAlive, KeepAliveStream, Sse};
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;

use crate::constants::SSE_PING_INTERVAL_SECS;
use crate::error::AppError;
use crate::realtime::ClientEventStream;
use crate::state::AppState;

use super::resolve_auth;

pub fn router() -> Router<AppState> {
  return Router::new().route("/api/realtime", get(connect).post(subscribe));
}

async fn connect(State(state): State<AppState>) -> Sse<KeepAliveStream<ClientEventStream>> {
  let (client_id, receiver) = state.realtime().connect();
  let stream = ClientEventStream::new(state.realtime().clone(), client_id, receiver);

  return Sse::new(stream).keep_alive(
    KeepAlive::new()
      .interval(Duration::from_secs(SSE_PING_INTERVAL_SECS))
      .text("ping"),
  );
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscribeBody {
  client_id: String,
  subscriptions: Vec<String>,
}

async fn subscribe(
  State(state): State<AppState>,
  headers: HeaderMap,
  Json(body): Json<SubscribeBody>,
) -> Result<StatusCode, AppError> {
  let auth = resolve_auth(&state, &headers);
  state
    .realtime()
    .subscribe(&body.client_id, &body.subscriptions, &auth)?;
  return Ok(StatusCode::NO_CONTENT);
}
