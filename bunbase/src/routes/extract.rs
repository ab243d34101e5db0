//! JSON/multipart record body extraction (§4.10 ingress), dispatching on `Content-Type` since
//! record create/update accept either encoding.

use axum::body::Bytes;
use axum::extract::{FromRequest, Multipart, Request};
use axum::http::header::CONTENT_TYPE;
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::HashMap;

use crate::error::AppError;

/// A validated raw upload as handed to [`crate::files::validate_uploads`]: `(original_name,
/// mime_type, bytes)`.
pub type RawUpload = (String, String, Vec<u8>);

pub enum RecordBody {
  Json(JsonMap<String, JsonValue>),
  Multipart {
    data: JsonMap<String, JsonValue>,
    uploads: HashMap<String, Vec<RawUpload>>,
  },
}

/// Merges a repeated multipart field name into a JSON array, matching how an HTML form submits
/// multi-value fields.
fn coerce_and_push_array(map: &mut JsonMap<String, JsonValue>, key: String, value: JsonValue) {
  match map.get_mut(&key) {
    Some(JsonValue::Array(existing)) => existing.push(value),
    Some(existing) => {
      let prior = existing.take();
      map.insert(key, JsonValue::Array(vec![prior, value]));
    }
    None => {
      map.insert(key, value);
    }
  };
}

/// Reads the request body as JSON (an empty body decodes to an empty object) or as multipart
/// form data, grouping uploaded files by field name.
pub async fn extract_record_body(req: Request) -> Result<RecordBody, AppError> {
  let is_multipart = req
    .headers()
    .get(CONTENT_TYPE)
    .and_then(|v| v.to_str().ok())
    .is_some_and(|v| v.starts_with("multipart/form-data"));

  if is_multipart {
    let mut multipart = Multipart::from_request(req, &())
      .await
      .map_err(|err| AppError::Validation(err.to_string()))?;

    let mut data = JsonMap::new();
    let mut uploads: HashMap<String, Vec<RawUpload>> = HashMap::new();

    while let Some(field) = multipart
      .next_field()
      .await
      .map_err(|err| AppError::Validation(err.to_string()))?
    {
      let Some(name) = field.name().map(str::to_string) else {
        continue;
      };

      if field.file_name().is_some() {
        let original_name = field.file_name().unwrap_or("file").to_string();
        let mime_type = field
          .content_type()
          .unwrap_or("application/octet-stream")
          .to_string();
        let bytes = field
          .bytes()
          .await
          .map_err(|err| AppError::Validation(err.to_string()))?;
        if bytes.is_empty() {
          continue;
        }
        uploads
          .entry(name)
          .or_default()
          .push((original_name, mime_type, bytes.to_vec()));
      } else {
        let text = field
          .text()
          .await
          .map_err(|err| AppError::Validation(err.to_string()))?;
        coerce_and_push_array(&mut data, name, JsonValue::String(text));
      }
    }

    return Ok(RecordBody::Multipart { data, uploads });
  }

  let bytes = Bytes::from_request(req, &())
    .await
    .map_err(|err| AppError::Validation(err.to_string()))?;
  if bytes.is_empty() {
    return Ok(RecordBody::Json(JsonMap::new()));
  }
  return match serde_json::from_slice(&bytes)? {
    JsonValue::Object(map) => Ok(RecordBody::Json(map)),
    _ => Err(AppError::Validation("expected a JSON object".to_string())),
  };
}
