//! Admin routes (§6): `/admin/auth/*` bearer-token login and `/admin/collections*` schema CRUD.
//! Every handler in this module requires an admin principal.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::error::AppError;
use crate::schema::{CollectionKind, CollectionRules, Field};
use crate::state::AppState;

use super::resolve_auth;

pub fn router() -> Router<AppState> {
  return Router::new()
    .route("/admin/auth/login", post(login))
    .route("/admin/auth/me", get(me))
    .route("/admin/auth/change-password", post(change_password))
    .route("/admin/collections", get(list_collections).post(create_collection))
    .route(
      "/admin/collections/{name}",
      get(get_collection).patch(patch_collection).delete(delete_collection),
    );
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<crate::rules::AuthContext, AppError> {
  let auth = resolve_auth(state, headers);
  if !auth.is_admin {
    return Err(AppError::Unauthorized);
  }
  return Ok(auth);
}

#[derive(Debug, Deserialize)]
struct LoginBody {
  email: String,
  password: String,
}

async fn login(
  State(state): State<AppState>,
  Json(body): Json<LoginBody>,
) -> Result<Json<JsonValue>, AppError> {
  let (admin, token) = state.auth().login_admin(&body.email, &body.password).await?;
  return Ok(Json(serde_json::json!({
    "admin": { "id": admin.id, "email": admin.email },
    "token": token,
  })));
}

async fn me(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<JsonValue>, AppError> {
  let auth = require_admin(&state, &headers)?;
  let admin = state.auth().get_admin(auth.id.as_deref().unwrap_or_default()).await?;
  return Ok(Json(serde_json::json!({ "id": admin.id, "email": admin.email })));
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangePasswordBody {
  old_password: String,
  new_password: String,
}

async fn change_password(
  State(state): State<AppState>,
  headers: HeaderMap,
  Json(body): Json<ChangePasswordBody>,
) -> Result<Json<JsonValue>, AppError> {
  let auth = require_admin(&state, &headers)?;
  state
    .auth()
    .change_admin_password(auth.id.as_deref().unwrap_or_default(), &body.old_password, &body.new_password)
    .await?;
  return Ok(Json(serde_json::json!({ "success": true })));
}

async fn list_collections(
  State(state): State<AppState>,
  headers: HeaderMap,
) -> Result<Json<JsonValue>, AppError> {
  require_admin(&state, &headers)?;
  let names = state.schema().collection_names();
  let collections: Vec<JsonValue> = names
    .iter()
    .filter_map(|name| state.schema().get_collection(name))
    .map(|c| serde_json::to_value(&*c))
    .collect::<Result<_, _>>()?;
  return Ok(Json(serde_json::json!({ "collections": collections })));
}

async fn get_collection(
  State(state): State<AppState>,
  Path(name): Path<String>,
  headers: HeaderMap,
) -> Result<Json<JsonValue>, AppError> {
  require_admin(&state, &headers)?;
  let collection = state
    .schema()
    .get_collection(&name)
    .ok_or_else(|| AppError::NotFound(format!("collection '{name}' not found")))?;
  return Ok(Json(serde_json::to_value(&*collection)?));
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateCollectionBody {
  name: String,
  #[serde(default)]
  kind: Option<String>,
  #[serde(default)]
  fields: Vec<Field>,
  #[serde(default)]
  rules: CollectionRules,
}

async fn create_collection(
  State(state): State<AppState>,
  headers: HeaderMap,
  Json(body): Json<CreateCollectionBody>,
) -> Result<Json<JsonValue>, AppError> {
  require_admin(&state, &headers)?;
  let kind = match body.kind.as_deref() {
    Some(raw) => raw.parse::<CollectionKind>()?,
    None => CollectionKind::Base,
  };
  let collection = state
    .schema()
    .create_collection(&body.name, body.fields, kind, body.rules)
    .await?;
  return Ok(Json(serde_json::to_value(&*collection)?));
}

/// Renames are deliberately unsupported (§9): `add_fields` and `remove_fields` cover the common
/// schema-evolution cases without the rename-vs-reinterpretation ambiguity a `from`/`to` pair
/// would introduce for clients with stale field lists.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PatchCollectionBody {
  #[serde(default)]
  add_fields: Vec<Field>,
  #[serde(default)]
  remove_fields: Vec<String>,
  #[serde(default)]
  rules: Option<CollectionRules>,
}

async fn patch_collection(
  State(state): State<AppState>,
  Path(name): Path<String>,
  headers: HeaderMap,
  Json(body): Json<PatchCollectionBody>,
) -> Result<Json<JsonValue>, AppError> {
  require_admin(&state, &headers)?;

  for field in body.add_fields {
    state.schema().add_field(&name, field).await?;
  }
  for field_name in &body.remove_fields {
    state.schema().remove_field(&name, field_name).await?;
  }
  if let Some(rules) = body.rules {
    state.schema().update_rules(&name, rules).await?;
  }

  let collection = state
    .schema()
    .get_collection(&name)
    .ok_or_else(|| AppError::NotFound(format!("collection '{name}' not found")))?;
  return Ok(Json(serde_json::to_value(&*collection)?));
}

async fn delete_collection(
  State(state): State<AppState>,
  Path(name): Path<String>,
  headers: HeaderMap,
) -> Result<Json<JsonValue>, AppError> {
  require_admin(&state, &headers)?;
  state.schema().delete_collection(&name).await?;
  state.files().cleanup_collection(&name).await;
  return Ok(Json(serde_json::json!({ "success": true })));
}
