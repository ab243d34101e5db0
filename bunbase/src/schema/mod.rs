//! Schema registry (§4.2): persists `_collections` and `_fields` rows, translates schema
//! mutations into physical DDL, and caches per-collection field lists.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use bunbase_sqlite::{params, Connection};

use crate::constants::{ADMINS_TABLE, COLLECTIONS_TABLE, FIELDS_TABLE, MANAGED_COLUMNS};
use crate::error::AppError;
use crate::util::is_valid_identifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionKind {
  Base,
  Auth,
}

impl FromStr for CollectionKind {
  type Err = AppError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    return match s {
      "base" => Ok(CollectionKind::Base),
      "auth" => Ok(CollectionKind::Auth),
      other => Err(AppError::Validation(format!("unknown collection kind: {other}"))),
    };
  }
}

impl CollectionKind {
  fn as_str(&self) -> &'static str {
    return match self {
      CollectionKind::Base => "base",
      CollectionKind::Auth => "auth",
    };
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
  Text,
  Number,
  Boolean,
  Datetime,
  Json,
  Relation,
  File,
}

impl FromStr for FieldType {
  type Err = AppError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    return match s {
      "text" => Ok(FieldType::Text),
      "number" => Ok(FieldType::Number),
      "boolean" => Ok(FieldType::Boolean),
      "datetime" => Ok(FieldType::Datetime),
      "json" => Ok(FieldType::Json),
      "relation" => Ok(FieldType::Relation),
      "file" => Ok(FieldType::File),
      other => Err(AppError::Validation(format!("unknown field type: {other}"))),
    };
  }
}

impl FieldType {
  fn as_str(&self) -> &'static str {
    return match self {
      FieldType::Text => "text",
      FieldType::Number => "number",
      FieldType::Boolean => "boolean",
      FieldType::Datetime => "datetime",
      FieldType::Json => "json",
      FieldType::Relation => "relation",
      FieldType::File => "file",
    };
  }

  /// Native SQLite column type backing this field.
  fn sqlite_type(&self) -> &'static str {
    return match self {
      FieldType::Text | FieldType::Datetime | FieldType::Json | FieldType::File => "TEXT",
      FieldType::Number => "REAL",
      FieldType::Boolean => "INTEGER",
      FieldType::Relation => "TEXT",
    };
  }
}

/// Type-specific options (§3 table). Serialized as JSON in the `_fields.options` column.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldOptions {
  /// `relation`: the target collection name.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub target: Option<String>,
  /// `file`: maximum number of files (default 1).
  #[serde(skip_serializing_if = "Option::is_none")]
  pub max_files: Option<u32>,
  /// `file`: maximum size in bytes per file (default 10 MiB).
  #[serde(skip_serializing_if = "Option::is_none")]
  pub max_size: Option<u64>,
  /// `file`: allowed MIME patterns (`*/*`, `kind/*`, or exact).
  #[serde(skip_serializing_if = "Option::is_none")]
  pub allowed_types: Option<Vec<String>>,
}

impl FieldOptions {
  pub fn max_files(&self) -> u32 {
    return self.max_files.unwrap_or(crate::constants::DEFAULT_FILE_MAX_FILES);
  }

  pub fn max_size(&self) -> u64 {
    return self.max_size.unwrap_or(crate::constants::DEFAULT_FILE_MAX_SIZE);
  }

  pub fn allowed_types(&self) -> &[String] {
    return self.allowed_types.as_deref().unwrap_or(&[]);
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Field {
  pub name: String,
  #[serde(rename = "type")]
  pub field_type: FieldType,
  #[serde(default)]
  pub required: bool,
  #[serde(default)]
  pub options: FieldOptions,
}

impl Field {
  pub fn validate_name(name: &str) -> Result<(), AppError> {
    if !is_valid_identifier(name) {
      return Err(AppError::Validation(format!("invalid field name: {name}")));
    }
    if MANAGED_COLUMNS.contains(&name) {
      return Err(AppError::Validation(format!(
        "field name '{name}' is reserved"
      )));
    }
    return Ok(());
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection {
  pub name: String,
  pub kind: CollectionKind,
  pub fields: Vec<Field>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub list_rule: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub view_rule: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub create_rule: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub update_rule: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub delete_rule: Option<String>,
}

impl Collection {
  pub fn field(&self, name: &str) -> Option<&Field> {
    return self.fields.iter().find(|f| f.name == name);
  }

  /// Every column name that is legal to reference in filters/sort: managed + field columns.
  pub fn column_names(&self) -> Vec<&str> {
    let mut names: Vec<&str> = MANAGED_COLUMNS.to_vec();
    names.extend(self.fields.iter().map(|f| f.name.as_str()));
    return names;
  }
}

fn validate_collection_name(name: &str) -> Result<(), AppError> {
  if !is_valid_identifier(name) || name.starts_with('_') {
    return Err(AppError::Validation(format!(
      "invalid collection name: {name}"
    )));
  }
  return Ok(());
}

fn implicit_auth_fields() -> Vec<Field> {
  return vec![
    Field {
      name: "email".to_string(),
      field_type: FieldType::Text,
      required: true,
      options: FieldOptions::default(),
    },
    Field {
      name: "password_hash".to_string(),
      field_type: FieldType::Text,
      required: true,
      options: FieldOptions::default(),
    },
    Field {
      name: "verified".to_string(),
      field_type: FieldType::Boolean,
      required: true,
      options: FieldOptions::default(),
    },
  ];
}

/// Quote a validated identifier for use as a SQL identifier. Callers must have already checked
/// it against [`is_valid_identifier`]; this only adds the quoting, it does not sanitize.
pub fn quote_ident(name: &str) -> String {
  return format!("\"{}\"", name.replace('"', "\"\""));
}

fn create_table_sql(collection: &Collection) -> String {
  let mut columns = vec![
    "\"id\" TEXT PRIMARY KEY NOT NULL".to_string(),
    "\"created_at\" TEXT NOT NULL".to_string(),
    "\"updated_at\" TEXT NOT NULL".to_string(),
  ];

  for field in &collection.fields {
    let mut col = format!(
      "{} {}",
      quote_ident(&field.name),
      field.field_type.sqlite_type()
    );
    if field.required {
      col.push_str(" NOT NULL");
    }
    if field.field_type == FieldType::Relation {
      if let Some(target) = &field.options.target {
        col.push_str(&format!(
          " REFERENCES {}(\"id\")",
          quote_ident(target)
        ));
      }
    }
    columns.push(col);
  }

  if collection.kind == CollectionKind::Auth {
    columns.push("UNIQUE(\"email\")".to_string());
  }

  return format!(
    "CREATE TABLE {} ({})",
    quote_ident(&collection.name),
    columns.join(", ")
  );
}

#[derive(Default)]
struct Cache {
  collections: HashMap<String, Arc<Collection>>,
}

/// Persists collection/field metadata in system tables and caches the decoded shape. The cache
/// is a single reader/writer lock, invalidated wholesale on any mutation (§9).
pub struct SchemaRegistry {
  conn: Connection,
  cache: RwLock<Cache>,
}

impl SchemaRegistry {
  pub async fn new(conn: Connection) -> Result<Self, AppError> {
    Self::migrate(&conn).await?;
    let registry = Self {
      conn,
      cache: RwLock::new(Cache::default()),
    };
    registry.reload_cache().await?;
    return Ok(registry);
  }

  pub fn conn(&self) -> &Connection {
    return &self.conn;
  }

  /// Idempotently creates `_collections`, `_fields`, `_admins` if absent.
  async fn migrate(conn: &Connection) -> Result<(), AppError> {
    conn
      .execute_batch(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {COLLECTIONS_TABLE} (
          name TEXT PRIMARY KEY NOT NULL,
          kind TEXT NOT NULL,
          list_rule TEXT,
          view_rule TEXT,
          create_rule TEXT,
          update_rule TEXT,
          delete_rule TEXT
        );
        CREATE TABLE IF NOT EXISTS {FIELDS_TABLE} (
          collection_name TEXT NOT NULL REFERENCES {COLLECTIONS_TABLE}(name),
          name TEXT NOT NULL,
          field_type TEXT NOT NULL,
          required INTEGER NOT NULL DEFAULT 0,
          options TEXT NOT NULL DEFAULT '{{}}',
          PRIMARY KEY (collection_name, name)
        );
        CREATE TABLE IF NOT EXISTS {ADMINS_TABLE} (
          id TEXT PRIMARY KEY NOT NULL,
          email TEXT NOT NULL UNIQUE,
          password_hash TEXT NOT NULL,
          created_at TEXT NOT NULL,
          updated_at TEXT NOT NULL
        );
        "#
      ))
      .await
      .map_err(AppError::from)?;

    return Ok(());
  }

  async fn reload_cache(&self) -> Result<(), AppError> {
    let collection_rows = self
      .conn
      .query(
        &format!(
          "SELECT name, kind, list_rule, view_rule, create_rule, update_rule, delete_rule FROM {COLLECTIONS_TABLE}"
        ),
        (),
      )
      .await?;

    let mut collections = HashMap::new();
    for row in collection_rows.iter() {
      let name: String = row.get(0).map_err(AppError::from)?;
      let kind: String = row.get(1).map_err(AppError::from)?;
      let list_rule: Option<String> = row.get(2).map_err(AppError::from)?;
      let view_rule: Option<String> = row.get(3).map_err(AppError::from)?;
      let create_rule: Option<String> = row.get(4).map_err(AppError::from)?;
      let update_rule: Option<String> = row.get(5).map_err(AppError::from)?;
      let delete_rule: Option<String> = row.get(6).map_err(AppError::from)?;

      let field_rows = self
        .conn
        .query(
          &format!(
            "SELECT name, field_type, required, options FROM {FIELDS_TABLE} WHERE collection_name = ?1 ORDER BY rowid"
          ),
          params!(name.clone()),
        )
        .await?;

      let mut fields = vec![];
      for frow in field_rows.iter() {
        let fname: String = frow.get(0).map_err(AppError::from)?;
        let ftype: String = frow.get(1).map_err(AppError::from)?;
        let required: bool = frow.get(2).map_err(AppError::from)?;
        let options: String = frow.get(3).map_err(AppError::from)?;
        fields.push(Field {
          name: fname,
          field_type: FieldType::from_str(&ftype)?,
          required,
          options: serde_json::from_str(&options).unwrap_or_default(),
        });
      }

      collections.insert(
        name.clone(),
        Arc::new(Collection {
          name,
          kind: CollectionKind::from_str(&kind)?,
          fields,
          list_rule,
          view_rule,
          create_rule,
          update_rule,
          delete_rule,
        }),
      );
    }

    self.cache.write().collections = collections;
    return Ok(());
  }

  pub fn get_collection(&self, name: &str) -> Option<Arc<Collection>> {
    return self.cache.read().collections.get(name).cloned();
  }

  pub fn get_fields(&self, name: &str) -> Option<Vec<Field>> {
    return self.get_collection(name).map(|c| c.fields.clone());
  }

  pub fn collection_names(&self) -> Vec<String> {
    return self.cache.read().collections.keys().cloned().collect();
  }

  pub async fn create_collection(
    &self,
    name: &str,
    mut fields: Vec<Field>,
    kind: CollectionKind,
    rules: CollectionRules,
  ) -> Result<Arc<Collection>, AppError> {
    validate_collection_name(name)?;

    if self.get_collection(name).is_some() {
      return Err(AppError::Conflict(format!(
        "collection '{name}' already exists"
      )));
    }

    let mut seen = std::collections::HashSet::new();
    for field in &fields {
      Field::validate_name(&field.name)?;
      if !seen.insert(field.name.clone()) {
        return Err(AppError::Validation(format!(
          "duplicate field name: {}",
          field.name
        )));
      }
      if field.field_type == FieldType::Relation {
        let target = field.options.target.as_deref().ok_or_else(|| {
          AppError::Validation(format!(
            "relation field '{}' requires options.target",
            field.name
          ))
        })?;
        if target == name {
          return Err(AppError::Validation(
            "a relation field may not target its own collection at creation time".to_string(),
          ));
        }
      }
    }

    if kind == CollectionKind::Auth {
      let reserved: std::collections::HashSet<&str> =
        ["email", "password_hash", "verified"].into_iter().collect();
      fields.retain(|f| !reserved.contains(f.name.as_str()));
      fields.extend(implicit_auth_fields());
    }

    let collection = Collection {
      name: name.to_string(),
      kind,
      fields,
      list_rule: rules.list_rule,
      view_rule: rules.view_rule,
      create_rule: rules.create_rule,
      update_rule: rules.update_rule,
      delete_rule: rules.delete_rule,
    };

    let create_sql = create_table_sql(&collection);
    let fields_to_insert = collection.fields.clone();
    let rules_row = (
      collection.name.clone(),
      collection.kind.as_str().to_string(),
      collection.list_rule.clone(),
      collection.view_rule.clone(),
      collection.create_rule.clone(),
      collection.update_rule.clone(),
      collection.delete_rule.clone(),
    );

    self
      .conn
      .transaction(move |tx| {
        tx.execute(&create_sql, [])?;
        tx.execute(
          &format!(
            "INSERT INTO {COLLECTIONS_TABLE} (name, kind, list_rule, view_rule, create_rule, update_rule, delete_rule) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
          ),
          rusqlite::params![
            rules_row.0, rules_row.1, rules_row.2, rules_row.3, rules_row.4, rules_row.5, rules_row.6
          ],
        )?;

        for field in &fields_to_insert {
          tx.execute(
            &format!(
              "INSERT INTO {FIELDS_TABLE} (collection_name, name, field_type, required, options) VALUES (?1, ?2, ?3, ?4, ?5)"
            ),
            rusqlite::params![
              rules_row.0,
              field.name,
              field.field_type.as_str(),
              field.required as i64,
              serde_json::to_string(&field.options).unwrap_or_else(|_| "{}".to_string()),
            ],
          )?;
        }

        return Ok(());
      })
      .await
      .map_err(AppError::from)?;

    self.reload_cache().await?;
    return Ok(self.get_collection(name).expect("just created"));
  }

  /// Adds a field, issuing `ALTER TABLE ADD COLUMN` and updating metadata atomically.
  pub async fn add_field(&self, collection: &str, field: Field) -> Result<(), AppError> {
    let existing = self
      .get_collection(collection)
      .ok_or_else(|| AppError::NotFound(format!("collection '{collection}' not found")))?;

    Field::validate_name(&field.name)?;
    if existing.field(&field.name).is_some() {
      return Err(AppError::Conflict(format!(
        "field '{}' already exists",
        field.name
      )));
    }

    let mut col = format!(
      "{} {}",
      quote_ident(&field.name),
      field.field_type.sqlite_type()
    );
    if field.required {
      // SQLite can't add a NOT NULL column without a default on a non-empty table; relax it
      // here and let application-level validation enforce requiredness on writes going forward.
      col.push_str(" DEFAULT NULL");
    }
    let alter_sql = format!(
      "ALTER TABLE {} ADD COLUMN {col}",
      quote_ident(collection)
    );

    let collection_owned = collection.to_string();
    let field_clone = field.clone();
    self
      .conn
      .transaction(move |tx| {
        tx.execute(&alter_sql, [])?;
        tx.execute(
          &format!(
            "INSERT INTO {FIELDS_TABLE} (collection_name, name, field_type, required, options) VALUES (?1, ?2, ?3, ?4, ?5)"
          ),
          rusqlite::params![
            collection_owned,
            field_clone.name,
            field_clone.field_type.as_str(),
            field_clone.required as i64,
            serde_json::to_string(&field_clone.options).unwrap_or_else(|_| "{}".to_string()),
          ],
        )?;
        return Ok(());
      })
      .await
      .map_err(AppError::from)?;

    self.reload_cache().await?;
    return Ok(());
  }

  /// Renames a field. Lossless: only metadata and the column name change.
  pub async fn rename_field(
    &self,
    collection: &str,
    old_name: &str,
    new_name: &str,
  ) -> Result<(), AppError> {
    let existing = self
      .get_collection(collection)
      .ok_or_else(|| AppError::NotFound(format!("collection '{collection}' not found")))?;
    if existing.field(old_name).is_none() {
      return Err(AppError::NotFound(format!("field '{old_name}' not found")));
    }
    Field::validate_name(new_name)?;

    let alter_sql = format!(
      "ALTER TABLE {} RENAME COLUMN {} TO {}",
      quote_ident(collection),
      quote_ident(old_name),
      quote_ident(new_name)
    );

    let collection_owned = collection.to_string();
    let old = old_name.to_string();
    let new = new_name.to_string();
    self
      .conn
      .transaction(move |tx| {
        tx.execute(&alter_sql, [])?;
        tx.execute(
          &format!(
            "UPDATE {FIELDS_TABLE} SET name = ?1 WHERE collection_name = ?2 AND name = ?3"
          ),
          rusqlite::params![new, collection_owned, old],
        )?;
        return Ok(());
      })
      .await
      .map_err(AppError::from)?;

    self.reload_cache().await?;
    return Ok(());
  }

  /// Drops a field. Lossy by nature: the open question in §9 around SQLite's version-dependent
  /// `DROP COLUMN` support is resolved here by requiring native support (SQLite >= 3.35); older
  /// builds will surface the underlying SQL error rather than silently rebuilding the table.
  pub async fn remove_field(&self, collection: &str, name: &str) -> Result<(), AppError> {
    let existing = self
      .get_collection(collection)
      .ok_or_else(|| AppError::NotFound(format!("collection '{collection}' not found")))?;
    if existing.field(name).is_none() {
      return Err(AppError::NotFound(format!("field '{name}' not found")));
    }

    let alter_sql = format!(
      "ALTER TABLE {} DROP COLUMN {}",
      quote_ident(collection),
      quote_ident(name)
    );

    let collection_owned = collection.to_string();
    let name_owned = name.to_string();
    self
      .conn
      .transaction(move |tx| {
        tx.execute(&alter_sql, [])?;
        tx.execute(
          &format!("DELETE FROM {FIELDS_TABLE} WHERE collection_name = ?1 AND name = ?2"),
          rusqlite::params![collection_owned, name_owned],
        )?;
        return Ok(());
      })
      .await
      .map_err(AppError::from)?;

    self.reload_cache().await?;
    return Ok(());
  }

  /// Updates a collection's access rules in place (§4.2); any `None` field clears that rule.
  pub async fn update_rules(&self, name: &str, rules: CollectionRules) -> Result<(), AppError> {
    if self.get_collection(name).is_none() {
      return Err(AppError::NotFound(format!("collection '{name}' not found")));
    }

    fn opt_value(opt: Option<String>) -> rusqlite::types::Value {
      return match opt {
        Some(s) => rusqlite::types::Value::Text(s),
        None => rusqlite::types::Value::Null,
      };
    }

    self
      .conn
      .execute(
        &format!(
          "UPDATE {COLLECTIONS_TABLE} SET list_rule = :list, view_rule = :view, create_rule = :create, update_rule = :update, delete_rule = :delete WHERE name = :name"
        ),
        vec![
          (":list".to_string(), opt_value(rules.list_rule)),
          (":view".to_string(), opt_value(rules.view_rule)),
          (":create".to_string(), opt_value(rules.create_rule)),
          (":update".to_string(), opt_value(rules.update_rule)),
          (":delete".to_string(), opt_value(rules.delete_rule)),
          (":name".to_string(), rusqlite::types::Value::Text(name.to_string())),
        ],
      )
      .await
      .map_err(AppError::from)?;

    self.reload_cache().await?;
    return Ok(());
  }

  /// Drops the table and metadata. File cleanup is the caller's responsibility (records service
  /// triggers it, so the registry stays storage-agnostic).
  pub async fn delete_collection(&self, name: &str) -> Result<(), AppError> {
    if self.get_collection(name).is_none() {
      return Err(AppError::NotFound(format!("collection '{name}' not found")));
    }

    let drop_sql = format!("DROP TABLE {}", quote_ident(name));
    let name_owned = name.to_string();
    self
      .conn
      .transaction(move |tx| {
        tx.execute(&drop_sql, [])?;
        tx.execute(
          &format!("DELETE FROM {FIELDS_TABLE} WHERE collection_name = ?1"),
          rusqlite::params![name_owned.clone()],
        )?;
        tx.execute(
          &format!("DELETE FROM {COLLECTIONS_TABLE} WHERE name = ?1"),
          rusqlite::params![name_owned],
        )?;
        return Ok(());
      })
      .await
      .map_err(AppError::from)?;

    self.reload_cache().await?;
    return Ok(());
  }
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct CollectionRules {
  pub list_rule: Option<String>,
  pub view_rule: Option<String>,
  pub create_rule: Option<String>,
  pub update_rule: Option<String>,
  pub delete_rule: Option<String>,
}

#[cfg(test)]
mod tests {
  use super::*;

  async fn registry() -> SchemaRegistry {
    let conn = Connection::open_in_memory().await.unwrap();
    return SchemaRegistry::new(conn).await.unwrap();
  }

  #[tokio::test]
  async fn test_create_collection_round_trip() {
    let reg = registry().await;
    reg
      .create_collection(
        "posts",
        vec![Field {
          name: "title".into(),
          field_type: FieldType::Text,
          required: true,
          options: FieldOptions::default(),
        }],
        CollectionKind::Base,
        CollectionRules::default(),
      )
      .await
      .unwrap();

    let collection = reg.get_collection("posts").unwrap();
    assert_eq!(collection.fields.len(), 1);
    assert_eq!(collection.fields[0].name, "title");
  }

  #[tokio::test]
  async fn test_create_collection_rejects_bad_name() {
    let reg = registry().await;
    let err = reg
      .create_collection("_bad", vec![], CollectionKind::Base, CollectionRules::default())
      .await
      .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
  }

  #[tokio::test]
  async fn test_create_collection_conflict() {
    let reg = registry().await;
    reg
      .create_collection("posts", vec![], CollectionKind::Base, CollectionRules::default())
      .await
      .unwrap();
    let err = reg
      .create_collection("posts", vec![], CollectionKind::Base, CollectionRules::default())
      .await
      .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
  }

  #[tokio::test]
  async fn test_delete_collection_removes_all_traces() {
    let reg = registry().await;
    reg
      .create_collection("posts", vec![], CollectionKind::Base, CollectionRules::default())
      .await
      .unwrap();
    reg.delete_collection("posts").await.unwrap();
    assert!(reg.get_collection("posts").is_none());

    let count: i64 = reg
      .conn()
      .query_value(
        &format!("SELECT COUNT(*) FROM {COLLECTIONS_TABLE} WHERE name = 'posts'"),
        (),
      )
      .await
      .unwrap()
      .unwrap();
    assert_eq!(count, 0);
  }

  #[tokio::test]
  async fn test_auth_collection_has_implicit_fields() {
    let reg = registry().await;
    let collection = reg
      .create_collection("users", vec![], CollectionKind::Auth, CollectionRules::default())
      .await
      .unwrap();
    assert!(collection.field("email").is_some());
    assert!(collection.field("password_hash").is_some());
    assert!(collection.field("verified").is_some());
  }
}
