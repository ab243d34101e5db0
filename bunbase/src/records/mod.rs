//! Record service (§4.4): the CRUD surface over a single collection's table. Encodes/decodes
//! between the JSON shape clients see and the typed SQLite row, validates against the schema,
//! enforces per-collection rules, and drives the before/after hook chain around each mutation.

use rusqlite::types::Value as SqlValue;
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::sync::Arc;

use bunbase_sqlite::{params, Connection};

use crate::constants::MANAGED_COLUMNS;
use crate::error::AppError;
use crate::hooks::{HookEvent, HookRegistry};
use crate::query::{BuiltQuery, QueryBuilder, QueryOptions};
#[cfg(test)]
use crate::query::Condition;
use crate::rules::{self, AuthContext};
use crate::schema::{quote_ident, Collection, Field, FieldType, SchemaRegistry};
use crate::util::{generate_record_id, now_rfc3339};

/// A page of records plus the pagination envelope (§4.3/§4.4).
pub struct Page {
  pub items: Vec<JsonMap<String, JsonValue>>,
  pub page: i64,
  pub per_page: i64,
  pub total_items: i64,
  pub total_pages: i64,
}

#[derive(Clone)]
pub struct RecordService {
  conn: Connection,
  schema: Arc<SchemaRegistry>,
  hooks: HookRegistry,
}

fn decode_value(field_type: FieldType, raw: &SqlValue) -> JsonValue {
  if matches!(raw, SqlValue::Null) {
    return JsonValue::Null;
  }
  return match field_type {
    FieldType::Text | FieldType::Datetime | FieldType::Relation => match raw {
      SqlValue::Text(s) => JsonValue::String(s.clone()),
      other => json_from_generic(other),
    },
    FieldType::Number => match raw {
      SqlValue::Real(n) => serde_json::Number::from_f64(*n)
        .map(JsonValue::Number)
        .unwrap_or(JsonValue::Null),
      SqlValue::Integer(n) => JsonValue::Number((*n).into()),
      other => json_from_generic(other),
    },
    FieldType::Boolean => match raw {
      SqlValue::Integer(n) => JsonValue::Bool(*n != 0),
      other => json_from_generic(other),
    },
    FieldType::Json | FieldType::File => match raw {
      SqlValue::Text(s) => serde_json::from_str(s).unwrap_or(JsonValue::Null),
      other => json_from_generic(other),
    },
  };
}

fn json_from_generic(raw: &SqlValue) -> JsonValue {
  return match raw {
    SqlValue::Null => JsonValue::Null,
    SqlValue::Integer(n) => JsonValue::Number((*n).into()),
    SqlValue::Real(n) => serde_json::Number::from_f64(*n).map(JsonValue::Number).unwrap_or(JsonValue::Null),
    SqlValue::Text(s) => JsonValue::String(s.clone()),
    SqlValue::Blob(_) => JsonValue::Null,
  };
}

fn encode_value(field: &Field, value: &JsonValue) -> Result<SqlValue, AppError> {
  if value.is_null() {
    if field.required {
      return Err(AppError::Validation(format!(
        "field '{}' is required",
        field.name
      )));
    }
    return Ok(SqlValue::Null);
  }

  return match field.field_type {
    FieldType::Text | FieldType::Datetime | FieldType::Relation => match value.as_str() {
      Some(s) => Ok(SqlValue::Text(s.to_string())),
      None => Err(AppError::Validation(format!(
        "field '{}' must be a string",
        field.name
      ))),
    },
    FieldType::Number => match value.as_f64() {
      Some(n) => Ok(SqlValue::Real(n)),
      None => Err(AppError::Validation(format!(
        "field '{}' must be a number",
        field.name
      ))),
    },
    FieldType::Boolean => match value.as_bool() {
      Some(b) => Ok(SqlValue::Integer(b as i64)),
      None => Err(AppError::Validation(format!(
        "field '{}' must be a boolean",
        field.name
      ))),
    },
    FieldType::Json => Ok(SqlValue::Text(value.to_string())),
    FieldType::File => {
      if !value.is_array() && !value.is_string() {
        return Err(AppError::Validation(format!(
          "field '{}' must be a filename or array of filenames",
          field.name
        )));
      }
      let names = if let Some(s) = value.as_str() {
        vec![JsonValue::String(s.to_string())]
      } else {
        value.as_array().cloned().unwrap_or_default()
      };
      if names.len() > field.options.max_files() as usize {
        return Err(AppError::Validation(format!(
          "field '{}' accepts at most {} file(s)",
          field.name,
          field.options.max_files()
        )));
      }
      Ok(SqlValue::Text(JsonValue::Array(names).to_string()))
    }
  };
}

fn row_to_json(collection: &Collection, row: &bunbase_sqlite::Row) -> JsonMap<String, JsonValue> {
  let mut map = JsonMap::new();
  for (idx, name) in row.column_names().iter().enumerate() {
    let raw = row.get_value(idx).cloned().unwrap_or(SqlValue::Null);
    let value = match *name {
      "id" | "created_at" | "updated_at" => json_from_generic(&raw),
      field_name => match collection.field(field_name) {
        Some(field) => decode_value(field.field_type, &raw),
        None => json_from_generic(&raw),
      },
    };
    map.insert((*name).to_string(), value);
  }
  return map;
}

impl RecordService {
  pub fn new(conn: Connection, schema: Arc<SchemaRegistry>, hooks: HookRegistry) -> Self {
    return Self { conn, schema, hooks };
  }

  fn collection(&self, name: &str) -> Result<Arc<Collection>, AppError> {
    return self
      .schema
      .get_collection(name)
      .ok_or_else(|| AppError::NotFound(format!("collection '{name}' not found")));
  }

  /// Validates `input` against `collection`'s fields: rejects unknown fields, checks
  /// requiredness, coerces/encodes each value, and confirms relation targets exist.
  async fn validate_and_encode(
    &self,
    collection: &Collection,
    input: &JsonMap<String, JsonValue>,
    partial: bool,
  ) -> Result<Vec<(String, SqlValue)>, AppError> {
    let mut encoded = vec![];

    for key in input.keys() {
      if MANAGED_COLUMNS.contains(&key.as_str()) {
        continue;
      }
      if collection.field(key).is_none() {
        return Err(AppError::Validation(format!("unknown field: {key}")));
      }
    }

    for field in &collection.fields {
      let Some(value) = input.get(&field.name) else {
        if !partial && field.required {
          return Err(AppError::Validation(format!(
            "field '{}' is required",
            field.name
          )));
        }
        continue;
      };

      if field.field_type == FieldType::Relation && !value.is_null() {
        let target = field.options.target.as_deref().ok_or_else(|| {
          AppError::Internal(format!("relation field '{}' missing target", field.name).into())
        })?;
        let target_id = value
          .as_str()
          .ok_or_else(|| AppError::Validation(format!("field '{}' must be a string id", field.name)))?;
        let exists = self
          .conn
          .query_value::<i64>(
            &format!("SELECT 1 FROM {} WHERE \"id\" = :id", quote_ident(target)),
            params!(target_id.to_string()),
          )
          .await?
          .is_some();
        if !exists {
          return Err(AppError::Validation(format!(
            "field '{}' references nonexistent record '{target_id}' in '{target}'",
            field.name
          )));
        }
      }

      let sql_value = encode_value(field, value)?;
      encoded.push((field.name.clone(), sql_value));
    }

    return Ok(encoded);
  }

  pub async fn create(
    &self,
    collection_name: &str,
    input: JsonMap<String, JsonValue>,
    auth: &AuthContext,
  ) -> Result<JsonMap<String, JsonValue>, AppError> {
    let collection = self.collection(collection_name)?;

    if !rules::admits(collection.create_rule.as_deref(), &input, auth)? {
      return Err(AppError::Forbidden(format!(
        "not allowed to create records in '{collection_name}'"
      )));
    }

    let mut record = input;
    self
      .hooks
      .run_before(collection_name, HookEvent::Create, &mut record, auth)?;

    let encoded = self.validate_and_encode(&collection, &record, false).await?;

    let id = generate_record_id();
    let now = now_rfc3339();

    let mut columns = vec!["\"id\"".to_string(), "\"created_at\"".to_string(), "\"updated_at\"".to_string()];
    let mut placeholders = vec![":id".to_string(), ":created_at".to_string(), ":updated_at".to_string()];
    let mut bind: Vec<(String, SqlValue)> = vec![
      (":id".to_string(), SqlValue::Text(id.clone())),
      (":created_at".to_string(), SqlValue::Text(now.clone())),
      (":updated_at".to_string(), SqlValue::Text(now.clone())),
    ];
    for (name, value) in encoded {
      columns.push(quote_ident(&name));
      placeholders.push(format!(":{name}"));
      bind.push((format!(":{name}"), value));
    }

    let sql = format!(
      "INSERT INTO {} ({}) VALUES ({})",
      quote_ident(collection_name),
      columns.join(", "),
      placeholders.join(", ")
    );

    self.conn.execute(&sql, bind).await.map_err(AppError::from)?;

    let created = self.get_raw(collection_name, &id).await?.ok_or_else(|| {
      AppError::Internal("record vanished immediately after insert".into())
    })?;

    self.hooks.run_after(collection_name, HookEvent::Create, &created, auth);
    return Ok(created);
  }

  async fn get_raw(
    &self,
    collection_name: &str,
    id: &str,
  ) -> Result<Option<JsonMap<String, JsonValue>>, AppError> {
    let collection = self.collection(collection_name)?;
    let rows = self
      .conn
      .query(
        &format!("SELECT * FROM {} WHERE \"id\" = :id", quote_ident(collection_name)),
        params!(id.to_string()),
      )
      .await?;
    return Ok(rows.get(0).map(|row| row_to_json(&collection, row)));
  }

  pub async fn get(
    &self,
    collection_name: &str,
    id: &str,
    auth: &AuthContext,
  ) -> Result<JsonMap<String, JsonValue>, AppError> {
    let collection = self.collection(collection_name)?;
    let record = self
      .get_raw(collection_name, id)
      .await?
      .ok_or_else(|| AppError::NotFound(format!("record '{id}' not found")))?;

    if !rules::admits(collection.view_rule.as_deref(), &record, auth)? {
      return Err(AppError::Forbidden(format!(
        "not allowed to view record '{id}'"
      )));
    }
    return Ok(record);
  }

  pub async fn list(
    &self,
    collection_name: &str,
    opts: &QueryOptions,
    auth: &AuthContext,
  ) -> Result<Page, AppError> {
    let collection = self.collection(collection_name)?;
    let valid_columns = collection.column_names();

    let projection = rules::to_sql_projection(collection.list_rule.as_deref(), auth)?;
    let BuiltQuery {
      sql,
      count_sql,
      mut params,
    } = QueryBuilder::build(collection_name, &valid_columns, Some(&projection.sql), opts)?;
    let count_params = projection.params.clone();
    params.extend(projection.params);

    let rows = self.conn.query(&sql, params).await.map_err(AppError::from)?;

    let total_items: i64 = self
      .conn
      .query_value(&count_sql, count_params)
      .await
      .map_err(AppError::from)?
      .unwrap_or(0);

    let mut items: Vec<JsonMap<String, JsonValue>> =
      rows.iter().map(|row| row_to_json(&collection, row)).collect();

    if !opts.expand.is_empty() {
      self.expand_relations(&collection, &mut items, &opts.expand).await?;
    }

    return Ok(Page {
      items,
      page: opts.page(),
      per_page: opts.per_page(),
      total_items,
      total_pages: crate::query::total_pages(total_items, opts.per_page()),
    });
  }

  /// Inlines one level of related records under an `expand` submap (§4.3/§4.4). Relation fields
  /// not named in `expand`, or referents that no longer exist, are silently skipped.
  async fn expand_relations(
    &self,
    collection: &Collection,
    items: &mut [JsonMap<String, JsonValue>],
    expand: &[String],
  ) -> Result<(), AppError> {
    for field_name in expand {
      let Some(field) = collection.field(field_name) else {
        continue;
      };
      if field.field_type != FieldType::Relation {
        continue;
      }
      let Some(target) = field.options.target.clone() else {
        continue;
      };
      if self.schema.get_collection(&target).is_none() {
        continue;
      }

      for item in items.iter_mut() {
        let Some(id) = item.get(field_name).and_then(|v| v.as_str()) else {
          continue;
        };
        let Some(related) = self.get_raw(&target, id).await? else {
          continue;
        };
        let entry = item
          .entry("expand")
          .or_insert_with(|| JsonValue::Object(JsonMap::new()));
        if let JsonValue::Object(map) = entry {
          map.insert(field_name.clone(), JsonValue::Object(related));
        }
      }
    }
    return Ok(());
  }

  pub async fn update(
    &self,
    collection_name: &str,
    id: &str,
    input: JsonMap<String, JsonValue>,
    auth: &AuthContext,
  ) -> Result<JsonMap<String, JsonValue>, AppError> {
    let collection = self.collection(collection_name)?;
    let existing = self
      .get_raw(collection_name, id)
      .await?
      .ok_or_else(|| AppError::NotFound(format!("record '{id}' not found")))?;

    if !rules::admits(collection.update_rule.as_deref(), &existing, auth)? {
      return Err(AppError::Forbidden(format!(
        "not allowed to update record '{id}'"
      )));
    }

    let mut record = input;
    self
      .hooks
      .run_before(collection_name, HookEvent::Update, &mut record, auth)?;

    let encoded = self.validate_and_encode(&collection, &record, true).await?;
    if encoded.is_empty() {
      let after_hook_record = existing.clone();
      self
        .hooks
        .run_after(collection_name, HookEvent::Update, &after_hook_record, auth);
      return Ok(existing);
    }

    let now = now_rfc3339();
    let mut sets = vec!["\"updated_at\" = :updated_at".to_string()];
    let mut bind: Vec<(String, SqlValue)> = vec![
      (":updated_at".to_string(), SqlValue::Text(now)),
      (":id".to_string(), SqlValue::Text(id.to_string())),
    ];
    for (name, value) in encoded {
      sets.push(format!("{} = :{name}", quote_ident(&name)));
      bind.push((format!(":{name}"), value));
    }

    let sql = format!(
      "UPDATE {} SET {} WHERE \"id\" = :id",
      quote_ident(collection_name),
      sets.join(", ")
    );
    self.conn.execute(&sql, bind).await.map_err(AppError::from)?;

    let updated = self.get_raw(collection_name, id).await?.ok_or_else(|| {
      AppError::Internal("record vanished immediately after update".into())
    })?;

    self.hooks.run_after(collection_name, HookEvent::Update, &updated, auth);
    return Ok(updated);
  }

  pub async fn delete(
    &self,
    collection_name: &str,
    id: &str,
    auth: &AuthContext,
  ) -> Result<JsonMap<String, JsonValue>, AppError> {
    let collection = self.collection(collection_name)?;
    let existing = self
      .get_raw(collection_name, id)
      .await?
      .ok_or_else(|| AppError::NotFound(format!("record '{id}' not found")))?;

    if !rules::admits(collection.delete_rule.as_deref(), &existing, auth)? {
      return Err(AppError::Forbidden(format!(
        "not allowed to delete record '{id}'"
      )));
    }

    let mut record = existing.clone();
    self
      .hooks
      .run_before(collection_name, HookEvent::Delete, &mut record, auth)?;

    self
      .conn
      .execute(
        &format!("DELETE FROM {} WHERE \"id\" = :id", quote_ident(collection_name)),
        params!(id.to_string()),
      )
      .await
      .map_err(AppError::from)?;

    self.hooks.run_after(collection_name, HookEvent::Delete, &existing, auth);
    return Ok(existing);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::query::{Op, SortDir, SortKey};
  use crate::schema::{CollectionKind, CollectionRules, FieldOptions};
  use serde_json::json;

  async fn service() -> (RecordService, Arc<SchemaRegistry>) {
    let conn = Connection::open_in_memory().await.unwrap();
    let schema = Arc::new(SchemaRegistry::new(conn.clone()).await.unwrap());
    schema
      .create_collection(
        "posts",
        vec![
          Field {
            name: "title".into(),
            field_type: FieldType::Text,
            required: true,
            options: FieldOptions::default(),
          },
          Field {
            name: "views".into(),
            field_type: FieldType::Number,
            required: false,
            options: FieldOptions::default(),
          },
          Field {
            name: "owner".into(),
            field_type: FieldType::Text,
            required: false,
            options: FieldOptions::default(),
          },
        ],
        CollectionKind::Base,
        CollectionRules {
          create_rule: Some("".into()),
          view_rule: Some("".into()),
          list_rule: Some("".into()),
          update_rule: Some("owner = @request.auth.id".into()),
          delete_rule: Some("owner = @request.auth.id".into()),
        },
      )
      .await
      .unwrap();

    let service = RecordService::new(conn, schema.clone(), HookRegistry::new());
    return (service, schema);
  }

  fn admin() -> AuthContext {
    return AuthContext {
      id: Some("admin".into()),
      is_admin: true,
    };
  }

  #[tokio::test]
  async fn test_create_get_roundtrip() {
    let (service, _schema) = service().await;
    let created = service
      .create(
        "posts",
        json!({"title": "hello", "views": 3}).as_object().unwrap().clone(),
        &admin(),
      )
      .await
      .unwrap();
    assert_eq!(created["title"], json!("hello"));
    assert_eq!(created["views"], json!(3.0));
    assert!(created["id"].is_string());

    let fetched = service.get("posts", created["id"].as_str().unwrap(), &admin()).await.unwrap();
    assert_eq!(fetched["title"], json!("hello"));
  }

  #[tokio::test]
  async fn test_create_rejects_missing_required_field() {
    let (service, _schema) = service().await;
    let err = service
      .create("posts", json!({}).as_object().unwrap().clone(), &admin())
      .await
      .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
  }

  #[tokio::test]
  async fn test_update_denied_for_non_owner() {
    let (service, _schema) = service().await;
    let created = service
      .create(
        "posts",
        json!({"title": "hello", "owner": "u1"}).as_object().unwrap().clone(),
        &admin(),
      )
      .await
      .unwrap();
    let id = created["id"].as_str().unwrap().to_string();

    let other = AuthContext {
      id: Some("u2".into()),
      is_admin: false,
    };
    let err = service
      .update("posts", &id, json!({"title": "changed"}).as_object().unwrap().clone(), &other)
      .await
      .unwrap_err();
    assert!(matches!(err, AppError::Forbidden(_)));

    let owner = AuthContext {
      id: Some("u1".into()),
      is_admin: false,
    };
    let updated = service
      .update("posts", &id, json!({"title": "changed"}).as_object().unwrap().clone(), &owner)
      .await
      .unwrap();
    assert_eq!(updated["title"], json!("changed"));
  }

  #[tokio::test]
  async fn test_list_pagination_and_sort() {
    let (service, _schema) = service().await;
    for i in 0..5 {
      service
        .create(
          "posts",
          json!({"title": format!("p{i}"), "views": i}).as_object().unwrap().clone(),
          &admin(),
        )
        .await
        .unwrap();
    }

    let opts = QueryOptions {
      sort: vec![SortKey {
        field: "views".into(),
        dir: SortDir::Desc,
      }],
      per_page: Some(2),
      ..Default::default()
    };
    let page = service.list("posts", &opts, &admin()).await.unwrap();
    assert_eq!(page.items.len(), 2);
    assert_eq!(page.total_items, 5);
    assert_eq!(page.total_pages, 3);
    assert_eq!(page.items[0]["views"], json!(4.0));
  }

  #[tokio::test]
  async fn test_list_filter_by_field() {
    let (service, _schema) = service().await;
    service
      .create("posts", json!({"title": "alpha", "views": 1}).as_object().unwrap().clone(), &admin())
      .await
      .unwrap();
    service
      .create("posts", json!({"title": "beta", "views": 2}).as_object().unwrap().clone(), &admin())
      .await
      .unwrap();

    let opts = QueryOptions {
      filter: vec![Condition {
        field: "title".into(),
        op: Op::Eq,
        value: SqlValue::Text("beta".into()),
      }],
      ..Default::default()
    };
    let page = service.list("posts", &opts, &admin()).await.unwrap();
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0]["title"], json!("beta"));
  }

  #[tokio::test]
  async fn test_delete_removes_record() {
    let (service, _schema) = service().await;
    let created = service
      .create("posts", json!({"title": "gone", "owner": "u1"}).as_object().unwrap().clone(), &admin())
      .await
      .unwrap();
    let id = created["id"].as_str().unwrap().to_string();

    let owner = AuthContext {
      id: Some("u1".into()),
      is_admin: false,
    };
    service.delete("posts", &id, &owner).await.unwrap();
    let err = service.get("posts", &id, &admin()).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
  }

  #[tokio::test]
  async fn test_relation_field_must_reference_existing_record() {
        let conn = Connection::open_in_memory().await.unwrap();
    let schema = Arc::new(SchemaRegistry::new(conn.clone()).await.unwrap());
    schema
      .create_collection("authors", vec![], CollectionKind::Base, CollectionRules::default())
      .await
      .unwrap();
    schema
      .create_collection(
        "posts",
        vec![Field {
          name: "author".into(),
          field_type: FieldType::Relation,
          required: true,
          options: FieldOptions {
            target: Some("authors".into()),
            ..Default::default()
          },
        }],
        CollectionKind::Base,
        CollectionRules::default(),
      )
      .await
      .unwrap();

    let service = RecordService::new(conn, schema, HookRegistry::new());
    let err = service
      .create("posts", json!({"author": "missing"}).as_object().unwrap().clone(), &admin())
      .await
      .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
  }
}
