//! Shared application state (§5): one handle per process, cheap to clone (an `Arc` internally),
//! injected into every route handler via axum's `State` extractor.

use std::path::PathBuf;
use std::sync::Arc;

use bunbase_sqlite::Connection;

use crate::auth::AuthService;
use crate::files::FileStore;
use crate::hooks::{HookEvent, HookRegistry};
use crate::realtime::RealtimeManager;
use crate::records::RecordService;
use crate::schema::SchemaRegistry;

struct Inner {
  schema: Arc<SchemaRegistry>,
  records: RecordService,
  auth: AuthService,
  hooks: HookRegistry,
  files: FileStore,
  realtime: RealtimeManager,
  storage_dir: PathBuf,
}

#[derive(Clone)]
pub struct AppState {
  inner: Arc<Inner>,
}

impl AppState {
  /// Wires every subsystem together and registers the global after-hooks (§4.9/§4.10) that make
  /// realtime broadcast and file cleanup apply to every collection, not just one.
  pub async fn new(conn: Connection, jwt_secret: &str, storage_dir: impl Into<PathBuf>) -> Result<Self, crate::error::AppError> {
    let storage_dir = storage_dir.into();
    let schema = Arc::new(SchemaRegistry::new(conn.clone()).await?);
    let hooks = HookRegistry::new();
    let records = RecordService::new(conn.clone(), schema.clone(), hooks.clone());
    let auth = AuthService::new(conn.clone(), schema.clone(), jwt_secret);
    let files = FileStore::new(storage_dir.clone());
    let realtime = RealtimeManager::new();

    for event in [HookEvent::Create, HookEvent::Update, HookEvent::Delete] {
      let realtime = realtime.clone();
      let schema = schema.clone();
      let action = match event {
        HookEvent::Create => "create",
        HookEvent::Update => "update",
        HookEvent::Delete => "delete",
      };
      let _ = hooks.register_after(None, event, move |collection, record, _auth| {
        realtime.broadcast(&schema, collection, action, record);
      });
    }

    {
      let files = files.clone();
      let _ = hooks.register_after(None, HookEvent::Delete, move |collection, record, _auth| {
        let Some(id) = record.get("id").and_then(|v| v.as_str()) else {
          return;
        };
        let files = files.clone();
        let collection = collection.to_string();
        let id = id.to_string();
        tokio::spawn(async move {
          files.cleanup(&collection, &id).await;
        });
      });
    }

    return Ok(Self {
      inner: Arc::new(Inner {
        schema,
        records,
        auth,
        hooks,
        files,
        realtime,
        storage_dir,
      }),
    });
  }

  pub fn schema(&self) -> &Arc<SchemaRegistry> {
    return &self.inner.schema;
  }

  pub fn records(&self) -> &RecordService {
    return &self.inner.records;
  }

  pub fn auth(&self) -> &AuthService {
    return &self.inner.auth;
  }

  pub fn hooks(&self) -> &HookRegistry {
    return &self.inner.hooks;
  }

  pub fn files(&self) -> &FileStore {
    return &self.inner.files;
  }

  pub fn realtime(&self) -> &RealtimeManager {
    return &self.inner.realtime;
  }

  pub fn storage_dir(&self) -> &PathBuf {
    return &self.inner.storage_dir;
  }
}
