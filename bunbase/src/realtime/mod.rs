//! Realtime subsystem (§4.9): an SSE connection manager, a subscriber index, and a
//! permission-filtered broadcaster driven by the hook engine's after-mutation callbacks.
//!
//! Shared state lives behind a single `parking_lot::Mutex` (§5): critical sections are short
//! (add/remove a client, rebuild one client's subscriptions, filter broadcast candidates).
//! Broadcasting copies the candidate list under the lock and releases it before sending, so a
//! slow or dead client's full/closed channel never blocks the triggering request.

use axum::response::sse::Event;
use futures_util::Stream;
use parking_lot::Mutex;
use pin_project_lite::pin_project;
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::constants::REALTIME_CLIENT_CHANNEL_CAPACITY;
use crate::error::AppError;
use crate::rules::{self, AuthContext};
use crate::schema::SchemaRegistry;
use crate::util::{generate_random_string, now_rfc3339};

const CLIENT_ID_LEN: usize = 16;
const WILDCARD: &str = "*";

/// `collection/recordId` or `collection/*` (§3). Invalid topics are dropped by [`parse_topic`],
/// never surfaced as an error, per spec.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Topic {
  collection: String,
  target: String,
}

fn parse_topic(raw: &str) -> Option<Topic> {
  let (collection, target) = raw.split_once('/')?;
  if !crate::util::is_valid_identifier(collection) {
    return None;
  }
  if target != WILDCARD && !target.chars().all(|c| c.is_ascii_alphanumeric()) {
    return None;
  }
  return Some(Topic {
    collection: collection.to_string(),
    target: target.to_string(),
  });
}

struct ClientEntry {
  sender: async_channel::Sender<Event>,
  subscriptions: HashSet<Topic>,
  auth: Option<AuthContext>,
  last_activity: String,
}

#[derive(Default)]
struct Inner {
  clients: HashMap<String, ClientEntry>,
  /// `(collection, recordId|"*") -> clientIds`, rebuilt whenever a client's subscription set
  /// changes.
  index: HashMap<(String, String), HashSet<String>>,
}

impl Inner {
  fn index_client(&mut self, client_id: &str, subscriptions: &HashSet<Topic>) {
    for topic in subscriptions {
      self
        .index
        .entry((topic.collection.clone(), topic.target.clone()))
        .or_default()
        .insert(client_id.to_string());
    }
  }

  fn unindex_client(&mut self, client_id: &str, subscriptions: &HashSet<Topic>) {
    for topic in subscriptions {
      let key = (topic.collection.clone(), topic.target.clone());
      if let Some(set) = self.index.get_mut(&key) {
        set.remove(client_id);
        if set.is_empty() {
          self.index.remove(&key);
        }
      }
    }
  }

  fn remove_client(&mut self, client_id: &str) {
    if let Some(entry) = self.clients.remove(client_id) {
      self.unindex_client(client_id, &entry.subscriptions);
    }
  }
}

/// Owns the `clients` map and `subscriberIndex`, cheap to clone (an `Arc` internally) so it can
/// be shared between the SSE route handlers and the global after-hooks wired in `AppState`.
#[derive(Clone, Default)]
pub struct RealtimeManager {
  inner: Arc<Mutex<Inner>>,
}

impl RealtimeManager {
  pub fn new() -> Self {
    return Self::default();
  }

  /// Allocates a client, queues the initial `PB_CONNECT` event, and returns its id plus the
  /// receiving half of its channel.
  pub fn connect(&self) -> (String, async_channel::Receiver<Event>) {
    let client_id = generate_random_string(CLIENT_ID_LEN);
    let (sender, receiver) = async_channel::bounded(REALTIME_CLIENT_CHANNEL_CAPACITY);

    let connect_event = Event::default()
      .event("PB_CONNECT")
      .json_data(json!({ "clientId": client_id }))
      .unwrap_or_else(|_| Event::default().event("PB_CONNECT"));
    let _ = sender.try_send(connect_event);

    self.inner.lock().clients.insert(
      client_id.clone(),
      ClientEntry {
        sender,
        subscriptions: HashSet::new(),
        auth: None,
        last_activity: now_rfc3339(),
      },
    );

    return (client_id, receiver);
  }

  /// Replaces `client_id`'s subscription set (§4.9 `POST /api/realtime`). An empty `topics`
  /// clears subscriptions. Captures `auth` on first call; a differing principal on a later call
  /// is a session-hijacking attempt and is rejected.
  pub fn subscribe(&self, client_id: &str, topics: &[String], auth: &AuthContext) -> Result<(), AppError> {
    let mut guard = self.inner.lock();
    let entry = guard
      .clients
      .get(client_id)
      .ok_or_else(|| AppError::NotFound(format!("unknown realtime client '{client_id}'")))?;

    if let Some(captured) = &entry.auth {
      if captured != auth {
        return Err(AppError::Forbidden(
          "realtime subscription principal mismatch".to_string(),
        ));
      }
    }

    let new_subscriptions: HashSet<Topic> = topics.iter().filter_map(|t| parse_topic(t)).collect();

    let old_subscriptions = guard
      .clients
      .get(client_id)
      .map(|c| c.subscriptions.clone())
      .unwrap_or_default();
    guard.unindex_client(client_id, &old_subscriptions);
    guard.index_client(client_id, &new_subscriptions);

    let entry = guard.clients.get_mut(client_id).expect("checked above");
    entry.subscriptions = new_subscriptions;
    entry.auth.get_or_insert_with(|| auth.clone());
    entry.last_activity = now_rfc3339();
    return Ok(());
  }

  /// Refreshes `lastActivity` for `client_id`, e.g. on each keep-alive tick.
  pub fn touch(&self, client_id: &str) {
    if let Some(entry) = self.inner.lock().clients.get_mut(client_id) {
      entry.last_activity = now_rfc3339();
    }
  }

  /// Drops a client and its index entries, e.g. when its SSE stream is dropped.
  pub fn disconnect(&self, client_id: &str) {
    self.inner.lock().remove_client(client_id);
  }

  /// Evicts clients inactive for longer than `timeout_secs` (§4.9 inactivity sweep).
  pub fn sweep(&self, timeout_secs: i64) {
    let now = chrono::Utc::now();
    let mut guard = self.inner.lock();
    let stale: Vec<String> = guard
      .clients
      .iter()
      .filter_map(|(id, entry)| {
        let last = chrono::DateTime::parse_from_rfc3339(&entry.last_activity).ok()?;
        let idle = now.signed_duration_since(last).num_seconds();
        if idle > timeout_secs {
          Some(id.clone())
        } else {
          None
        }
      })
      .collect();
    for id in stale {
      guard.remove_client(&id);
    }
  }

  /// Fans a committed mutation out to every subscriber whose governing rule admits the record
  /// (§4.9 broadcast). Fire-and-forget: a full or closed channel evicts that client but never
  /// fails the triggering request.
  pub fn broadcast(
    &self,
    schema: &SchemaRegistry,
    collection: &str,
    action: &str,
    record: &JsonMap<String, JsonValue>,
  ) {
    let Some(coll) = schema.get_collection(collection) else {
      return;
    };
    let Some(record_id) = record.get("id").and_then(|v| v.as_str()) else {
      return;
    };

    let event = match Event::default().json_data(json!({ "action": action, "record": record })) {
      Ok(event) => event,
      Err(_) => return,
    };

    let mut guard = self.inner.lock();
    let specific = guard
      .index
      .get(&(collection.to_string(), record_id.to_string()))
      .cloned()
      .unwrap_or_default();
    let wildcard = guard
      .index
      .get(&(collection.to_string(), WILDCARD.to_string()))
      .cloned()
      .unwrap_or_default();

    let mut dead = vec![];
    for client_id in specific.iter().chain(wildcard.iter().filter(|id| !specific.contains(*id))) {
      let Some(entry) = guard.clients.get(client_id) else {
        continue;
      };
      let rule = if specific.contains(client_id) {
        coll.view_rule.as_deref()
      } else {
        coll.list_rule.as_deref()
      };
      let auth = entry.auth.clone().unwrap_or_default();
      let admitted = rules::admits(rule, record, &auth).unwrap_or(false);
      if !admitted {
        continue;
      }
      if entry.sender.try_send(event.clone()).is_err() {
        dead.push(client_id.clone());
      }
    }
    for client_id in dead {
      guard.remove_client(&client_id);
    }
  }

  #[cfg(test)]
  fn client_count(&self) -> usize {
    return self.inner.lock().clients.len();
  }
}

pin_project! {
  /// SSE stream wrapper that disconnects the client (removing it from the manager and the
  /// subscriber index) when the connection is dropped, whichever side closes it first.
  pub struct ClientEventStream {
    manager: RealtimeManager,
    client_id: String,

    #[pin]
    receiver: async_channel::Receiver<Event>,
  }

  impl PinnedDrop for ClientEventStream {
    fn drop(this: Pin<&mut Self>) {
      this.manager.disconnect(&this.client_id);
    }
  }
}

impl ClientEventStream {
  pub fn new(manager: RealtimeManager, client_id: String, receiver: async_channel::Receiver<Event>) -> Self {
    return Self {
      manager,
      client_id,
      receiver,
    };
  }
}

impl Stream for ClientEventStream {
  type Item = Result<Event, axum::Error>;

  fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
    let this = self.project();
    let item = futures_util::ready!(Stream::poll_next(this.receiver, cx));
    if item.is_some() {
      this.manager.touch(this.client_id);
    }
    return Poll::Ready(item.map(Ok));
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::schema::{CollectionKind, CollectionRules, Field, FieldOptions, FieldType};
  use bunbase_sqlite::Connection;
  use serde_json::json;

  #[test]
  fn test_parse_topic() {
    assert!(parse_topic("posts/abc123").is_some());
    assert!(parse_topic("posts/*").is_some());
    assert!(parse_topic("posts").is_none());
    assert!(parse_topic("_bad/abc").is_none());
    assert!(parse_topic("posts/has space").is_none());
  }

  async fn schema_with_posts(list_rule: &str, view_rule: &str) -> Arc<SchemaRegistry> {
    let conn = Connection::open_in_memory().await.unwrap();
    let schema = Arc::new(SchemaRegistry::new(conn).await.unwrap());
    schema
      .create_collection(
        "posts",
        vec![Field {
          name: "title".into(),
          field_type: FieldType::Text,
          required: false,
          options: FieldOptions::default(),
        }],
        CollectionKind::Base,
        CollectionRules {
          list_rule: Some(list_rule.to_string()),
          view_rule: Some(view_rule.to_string()),
          ..Default::default()
        },
      )
      .await
      .unwrap();
    return schema;
  }

  #[tokio::test]
  async fn test_subscribe_requires_known_client() {
    let manager = RealtimeManager::new();
    let err = manager
      .subscribe("nope", &["posts/*".to_string()], &AuthContext::anonymous())
      .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
  }

  #[tokio::test]
  async fn test_subscribe_rejects_principal_mismatch() {
    let manager = RealtimeManager::new();
    let (client_id, _receiver) = manager.connect();
    let auth_a = AuthContext {
      id: Some("a".into()),
      is_admin: false,
    };
    let auth_b = AuthContext {
      id: Some("b".into()),
      is_admin: false,
    };
    manager.subscribe(&client_id, &["posts/*".to_string()], &auth_a).unwrap();
    let err = manager
      .subscribe(&client_id, &["posts/*".to_string()], &auth_b)
      .unwrap_err();
    assert!(matches!(err, AppError::Forbidden(_)));
  }

  #[tokio::test]
  async fn test_broadcast_filters_by_list_rule() {
    let schema = schema_with_posts("@request.auth.id != ''", "@request.auth.id != ''").await;
    let manager = RealtimeManager::new();

    let (anon_id, anon_rx) = manager.connect();
    manager.subscribe(&anon_id, &["posts/*".to_string()], &AuthContext::anonymous()).unwrap();

    let (user_id, user_rx) = manager.connect();
    let user_auth = AuthContext {
      id: Some("u1".into()),
      is_admin: false,
    };
    manager.subscribe(&user_id, &["posts/*".to_string()], &user_auth).unwrap();

    // Drain each client's initial PB_CONNECT event before exercising the broadcast itself.
    let _ = anon_rx.try_recv().unwrap();
    let _ = user_rx.try_recv().unwrap();

    let record = json!({"id": "rec1", "title": "hi"}).as_object().unwrap().clone();
    manager.broadcast(&schema, "posts", "create", &record);

    assert!(anon_rx.try_recv().is_err());
    assert!(user_rx.try_recv().is_ok());
  }

  #[tokio::test]
  async fn test_disconnect_removes_client() {
    let manager = RealtimeManager::new();
    let (client_id, _receiver) = manager.connect();
    assert_eq!(manager.client_count(), 1);
    manager.disconnect(&client_id);
    assert_eq!(manager.client_count(), 0);
  }

  #[tokio::test]
  async fn test_sweep_evicts_stale_clients() {
    let manager = RealtimeManager::new();
    let (client_id, _receiver) = manager.connect();
    manager.inner.lock().clients.get_mut(&client_id).unwrap().last_activity =
      "2000-01-01T00:00:00Z".to_string();
    manager.sweep(300);
    assert_eq!(manager.client_count(), 0);
  }
}
