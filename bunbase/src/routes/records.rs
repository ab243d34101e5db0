//! Record CRUD routes (§6): `/api/collections/:name/records[/:id]`.

use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::error::AppError;
use crate::files::{validate_uploads, IncomingFile};
use crate::records::Page;
use crate::schema::FieldType;
use crate::state::AppState;

use super::extract::{extract_record_body, RecordBody};
use super::query_parse::parse_query_options;
use super::resolve_auth;

pub fn router() -> Router<AppState> {
  return Router::new()
    .route("/api/collections/{name}/records", get(list).post(create))
    .route(
      "/api/collections/{name}/records/{id}",
      get(get_one).patch(update).delete(delete_one),
    );
}

/// Validates and saves every upload field against the collection's field options, then rewrites
/// `data` to hold the persisted filenames the client gets back (§4.10).
async fn apply_uploads(
  state: &AppState,
  collection_name: &str,
  record_id: &str,
  data: &mut JsonMap<String, JsonValue>,
  uploads: std::collections::HashMap<String, Vec<(String, String, Vec<u8>)>>,
) -> Result<(), AppError> {
  let collection = state
    .schema()
    .get_collection(collection_name)
    .ok_or_else(|| AppError::NotFound(format!("collection '{collection_name}' not found")))?;

  for (field_name, raw_uploads) in uploads {
    let field = collection
      .field(&field_name)
      .ok_or_else(|| AppError::Validation(format!("unknown field: {field_name}")))?;
    if field.field_type != FieldType::File {
      return Err(AppError::Validation(format!(
        "field '{field_name}' does not accept file uploads"
      )));
    }

    let validated = validate_uploads(&field_name, &raw_uploads, &field.options)?;
    let names: Vec<JsonValue> = validated
      .iter()
      .map(|f: &IncomingFile| JsonValue::String(f.sanitized_name.clone()))
      .collect();

    state.files().save(collection_name, record_id, &validated).await?;

    let value = if field.options.max_files() == 1 {
      names.into_iter().next().unwrap_or(JsonValue::Null)
    } else {
      JsonValue::Array(names)
    };
    data.insert(field_name, value);
  }

  return Ok(());
}

async fn list(
  State(state): State<AppState>,
  Path(name): Path<String>,
  headers: HeaderMap,
  request: Request,
) -> Result<Json<JsonValue>, AppError> {
  let auth = resolve_auth(&state, &headers);
  let collection = state
    .schema()
    .get_collection(&name)
    .ok_or_else(|| AppError::NotFound(format!("collection '{name}' not found")))?;

  let raw_query = request.uri().query().unwrap_or("");
  let opts = parse_query_options(raw_query, &collection)?;

  let Page {
    items,
    page,
    per_page,
    total_items,
    total_pages,
  } = state.records().list(&name, &opts, &auth).await?;

  return Ok(Json(serde_json::json!({
    "page": page,
    "perPage": per_page,
    "totalItems": total_items,
    "totalPages": total_pages,
    "items": items,
  })));
}

async fn get_one(
  State(state): State<AppState>,
  Path((name, id)): Path<(String, String)>,
  headers: HeaderMap,
) -> Result<Json<JsonValue>, AppError> {
  let auth = resolve_auth(&state, &headers);
  let record = state.records().get(&name, &id, &auth).await?;
  return Ok(Json(JsonValue::Object(record)));
}

async fn create(
  State(state): State<AppState>,
  Path(name): Path<String>,
  headers: HeaderMap,
  request: Request,
) -> Result<(StatusCode, Json<JsonValue>), AppError> {
  let auth = resolve_auth(&state, &headers);

  let (mut data, uploads) = match extract_record_body(request).await? {
    RecordBody::Json(map) => (map, std::collections::HashMap::new()),
    RecordBody::Multipart { data, uploads } => (data, uploads),
  };

  let has_uploads = !uploads.is_empty();
  let created = state.records().create(&name, data.clone(), &auth).await?;

  if has_uploads {
    let id = created["id"].as_str().unwrap_or_default().to_string();
    data.clear();
    apply_uploads(&state, &name, &id, &mut data, uploads).await?;
    if !data.is_empty() {
      let updated = state.records().update(&name, &id, data, &auth).await?;
      return Ok((StatusCode::CREATED, Json(JsonValue::Object(updated))));
    }
  }

  return Ok((StatusCode::CREATED, Json(JsonValue::Object(created))));
}

async fn update(
  State(state): State<AppState>,
  Path((name, id)): Path<(String, String)>,
  headers: HeaderMap,
  request: Request,
) -> Result<Json<JsonValue>, AppError> {
  let auth = resolve_auth(&state, &headers);

  let (mut data, uploads) = match extract_record_body(request).await? {
    RecordBody::Json(map) => (map, std::collections::HashMap::new()),
    RecordBody::Multipart { data, uploads } => (data, uploads),
  };

  if !uploads.is_empty() {
    apply_uploads(&state, &name, &id, &mut data, uploads).await?;
  }

  let updated = state.records().update(&name, &id, data, &auth).await?;
  return Ok(Json(JsonValue::Object(updated)));
}

async fn delete_one(
  State(state): State<AppState>,
  Path((name, id)): Path<(String, String)>,
  headers: HeaderMap,
) -> Result<StatusCode, AppError> {
  let auth = resolve_auth(&state, &headers);
  state.records().delete(&name, &id, &auth).await?;
  return Ok(StatusCode::NO_CONTENT);
}
