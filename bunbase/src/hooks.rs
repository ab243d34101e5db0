//! Hook engine (§4.5): ordered before/after callbacks per collection and event, registered at
//! startup. Before-hooks can mutate the pending record or veto the operation by returning an
//! error; after-hooks observe the committed record and can only fail loudly (errors are logged,
//! never unwind the already-committed transaction).

use serde_json::Map as JsonMap;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::AppError;
use crate::rules::AuthContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookEvent {
  Create,
  Update,
  Delete,
}

pub type BeforeHook =
  Arc<dyn Fn(&mut JsonMap<String, JsonValue>, &AuthContext) -> Result<(), AppError> + Send + Sync>;
/// Runs after a committed mutation. Takes the collection name so that global (collection-agnostic)
/// hooks -- realtime broadcast, file cleanup -- know which table's rule set and storage tree to
/// act on.
pub type AfterHook = Arc<dyn Fn(&str, &JsonMap<String, JsonValue>, &AuthContext) + Send + Sync>;

/// Thunk returned by `register_before`/`register_after` (§4.5, spec §3 "Hook registration"
/// lifecycle): invoking it removes the hook it was handed back for. Dropping it without calling
/// it leaves the hook registered indefinitely.
pub type Unregister = Box<dyn FnOnce() + Send + Sync>;

#[derive(Default)]
struct CollectionHooks {
  before: HashMap<HookEvent, Vec<(u64, BeforeHook)>>,
  after: HashMap<HookEvent, Vec<(u64, AfterHook)>>,
}

#[derive(Default)]
struct Registry {
  /// Hooks registered with no collection filter (`on(event, None, handler)`): run for every
  /// collection, ahead of any collection-scoped hooks.
  global: CollectionHooks,
  by_collection: HashMap<String, CollectionHooks>,
}

/// Registry of hooks keyed by event name and optional collection scope (§4.5). Cheap to clone
/// (an `Arc` internally) so it can be shared across the record service and the route layer.
#[derive(Default, Clone)]
pub struct HookRegistry {
  inner: Arc<std::sync::RwLock<Registry>>,
  next_id: Arc<AtomicU64>,
}

impl HookRegistry {
  pub fn new() -> Self {
    return Self::default();
  }

  /// Registers a before-hook. `collection: None` scopes the hook to every collection. Call the
  /// returned thunk to unregister it.
  pub fn register_before<F>(&self, collection: Option<&str>, event: HookEvent, hook: F) -> Unregister
  where
    F: Fn(&mut JsonMap<String, JsonValue>, &AuthContext) -> Result<(), AppError> + Send + Sync + 'static,
  {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let mut guard = self.inner.write().expect("hook registry lock poisoned");
    let scope = match collection {
      Some(name) => guard.by_collection.entry(name.to_string()).or_default(),
      None => &mut guard.global,
    };
    scope.before.entry(event).or_default().push((id, Arc::new(hook)));
    drop(guard);

    let inner = self.inner.clone();
    let collection = collection.map(str::to_string);
    return Box::new(move || {
      let mut guard = inner.write().expect("hook registry lock poisoned");
      let scope = match &collection {
        Some(name) => guard.by_collection.entry(name.clone()).or_default(),
        None => &mut guard.global,
      };
      if let Some(hooks) = scope.before.get_mut(&event) {
        hooks.retain(|(hook_id, _)| *hook_id != id);
      }
    });
  }

  /// Registers an after-hook. `collection: None` scopes the hook to every collection. Call the
  /// returned thunk to unregister it.
  pub fn register_after<F>(&self, collection: Option<&str>, event: HookEvent, hook: F) -> Unregister
  where
    F: Fn(&str, &JsonMap<String, JsonValue>, &AuthContext) + Send + Sync + 'static,
  {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let mut guard = self.inner.write().expect("hook registry lock poisoned");
    let scope = match collection {
      Some(name) => guard.by_collection.entry(name.to_string()).or_default(),
      None => &mut guard.global,
    };
    scope.after.entry(event).or_default().push((id, Arc::new(hook)));
    drop(guard);

    let inner = self.inner.clone();
    let collection = collection.map(str::to_string);
    return Box::new(move || {
      let mut guard = inner.write().expect("hook registry lock poisoned");
      let scope = match &collection {
        Some(name) => guard.by_collection.entry(name.clone()).or_default(),
        None => &mut guard.global,
      };
      if let Some(hooks) = scope.after.get_mut(&event) {
        hooks.retain(|(hook_id, _)| *hook_id != id);
      }
    });
  }

  /// Runs every registered before-hook for `collection`/`event` in registration order (global
  /// hooks first, then collection-scoped ones), stopping at the first error (§8: hook
  /// cancellation aborts the whole mutation).
  pub fn run_before(
    &self,
    collection: &str,
    event: HookEvent,
    record: &mut JsonMap<String, JsonValue>,
    auth: &AuthContext,
  ) -> Result<(), AppError> {
    let hooks = {
      let guard = self.inner.read().expect("hook registry lock poisoned");
      let mut hooks = guard.global.before.get(&event).cloned().unwrap_or_default();
      if let Some(scoped) = guard.by_collection.get(collection).and_then(|c| c.before.get(&event)) {
        hooks.extend(scoped.iter().cloned());
      }
      hooks
    };
    for (_id, hook) in hooks {
      hook(record, auth)?;
    }
    return Ok(());
  }

  /// Runs every registered after-hook (global first, then collection-scoped). Failures are not
  /// possible by construction (the closure signature has no error path) since the mutation
  /// already committed.
  pub fn run_after(
    &self,
    collection: &str,
    event: HookEvent,
    record: &JsonMap<String, JsonValue>,
    auth: &AuthContext,
  ) {
    let hooks = {
      let guard = self.inner.read().expect("hook registry lock poisoned");
      let mut hooks = guard.global.after.get(&event).cloned().unwrap_or_default();
      if let Some(scoped) = guard.by_collection.get(collection).and_then(|c| c.after.get(&event)) {
        hooks.extend(scoped.iter().cloned());
      }
      hooks
    };
    for (_id, hook) in hooks {
      hook(collection, record, auth);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use std::sync::atomic::{AtomicBool, Ordering};

  #[test]
  fn test_before_hook_can_mutate_and_veto() {
    let registry = HookRegistry::new();
    let _ = registry.register_before(Some("posts"), HookEvent::Create, |record, _auth| {
      record.insert("slug".to_string(), json!("generated"));
      return Ok(());
    });
    let _ = registry.register_before(Some("posts"), HookEvent::Create, |record, _auth| {
      if record.get("title").is_none() {
        return Err(AppError::Validation("title required".into()));
      }
      return Ok(());
    });

    let mut record = JsonMap::new();
    let auth = AuthContext::anonymous();
    let err = registry
      .run_before("posts", HookEvent::Create, &mut record, &auth)
      .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
    assert_eq!(record.get("slug"), Some(&json!("generated")));
  }

  #[test]
  fn test_after_hook_runs_on_commit() {
    let registry = HookRegistry::new();
    let fired = Arc::new(AtomicBool::new(false));
    let fired_clone = fired.clone();
    let _ = registry.register_after(Some("posts"), HookEvent::Delete, move |_collection, _record, _auth| {
      fired_clone.store(true, Ordering::SeqCst);
    });

    let record = JsonMap::new();
    let auth = AuthContext::anonymous();
    registry.run_after("posts", HookEvent::Delete, &record, &auth);
    assert!(fired.load(Ordering::SeqCst));
  }

  #[test]
  fn test_unregister_removes_hook() {
    let registry = HookRegistry::new();
    let calls = Arc::new(AtomicBool::new(false));
    let calls_clone = calls.clone();
    let unregister = registry.register_before(Some("posts"), HookEvent::Create, move |_record, _auth| {
      calls_clone.store(true, Ordering::SeqCst);
      return Ok(());
    });

    unregister();

    let mut record = JsonMap::new();
    let auth = AuthContext::anonymous();
    registry
      .run_before("posts", HookEvent::Create, &mut record, &auth)
      .unwrap();
    assert!(!calls.load(Ordering::SeqCst));
  }
}
