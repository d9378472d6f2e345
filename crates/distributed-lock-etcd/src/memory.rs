//! In-process coordination store with etcd v2 semantics.
//!
//! Keys carry a TTL and expire with an `expire` event, every mutation bumps a
//! shared index, and watchers replay from a bounded event history. Time is
//! measured with [`tokio::time::Instant`], so tests can run on a paused clock.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::client::{KeyWatcher, KeysApi, ttl_seconds};
use crate::error::{ErrorCode, KeysError, KeysResult};
use crate::response::{Action, Node, Response};

/// Number of events kept for watchers, as in etcd.
const HISTORY_LIMIT: usize = 1000;

#[derive(Debug, Clone)]
struct StoredNode {
    value: String,
    created_index: u64,
    modified_index: u64,
    expires_at: Option<Instant>,
}

impl StoredNode {
    fn to_node(&self, key: &str, now: Instant) -> Node {
        Node {
            key: key.to_string(),
            value: Some(self.value.clone()),
            created_index: self.created_index,
            modified_index: self.modified_index,
            ttl: self.expires_at.map(|deadline| {
                let remaining = deadline.saturating_duration_since(now);
                ttl_seconds(remaining) as i64
            }),
        }
    }
}

#[derive(Debug, Default)]
struct State {
    index: u64,
    nodes: HashMap<String, StoredNode>,
    history: VecDeque<Response>,
    /// Highest index dropped from `history`.
    trimmed_through: u64,
}

impl State {
    fn record(&mut self, event: Response) {
        self.history.push_back(event);
        while self.history.len() > HISTORY_LIMIT {
            if let Some(dropped) = self.history.pop_front() {
                self.trimmed_through = dropped.index;
            }
        }
    }

    /// Removes every key whose lease ran out, emitting `expire` events in
    /// deadline order.
    fn expire_due(&mut self, now: Instant) {
        let mut due: Vec<(Instant, String)> = self
            .nodes
            .iter()
            .filter_map(|(key, node)| match node.expires_at {
                Some(deadline) if deadline <= now => Some((deadline, key.clone())),
                _ => None,
            })
            .collect();
        due.sort();

        for (_, key) in due {
            if let Some(stored) = self.nodes.remove(&key) {
                self.index += 1;
                let event = Response {
                    action: Action::Expire,
                    node: Node {
                        key: key.clone(),
                        value: None,
                        created_index: stored.created_index,
                        modified_index: self.index,
                        ttl: None,
                    },
                    prev_node: Some(stored.to_node(&key, now)),
                    index: self.index,
                };
                self.record(event);
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.nodes.values().filter_map(|node| node.expires_at).min()
    }
}

struct Shared {
    state: Mutex<State>,
    /// Publishes the store index after every change.
    changed: watch::Sender<u64>,
}

/// In-memory [`KeysApi`] implementation.
///
/// Clones share the same store, so independent lock instances built from
/// clones compete for the same keys.
#[derive(Clone)]
pub struct MemoryKeysApi {
    shared: Arc<Shared>,
}

impl MemoryKeysApi {
    /// Creates an empty store.
    pub fn new() -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                changed,
            }),
        }
    }

    /// Returns the current store index.
    pub fn index(&self) -> u64 {
        self.shared.state.lock().index
    }

    /// Runs `op` against the state after applying due expirations, and
    /// wakes watchers when the index moved.
    fn apply<T>(&self, op: impl FnOnce(&mut State, Instant) -> T) -> T {
        let now = Instant::now();
        let mut state = self.shared.state.lock();
        let before = state.index;
        state.expire_due(now);
        let result = op(&mut state, now);
        if state.index != before {
            self.shared.changed.send_replace(state.index);
        }
        result
    }

    fn deadline(now: Instant, ttl: Duration) -> Instant {
        now + Duration::from_secs(ttl_seconds(ttl))
    }
}

impl Default for MemoryKeysApi {
    fn default() -> Self {
        Self::new()
    }
}

impl KeysApi for MemoryKeysApi {
    type Watcher = MemoryKeyWatcher;

    async fn create(&self, key: &str, value: &str, ttl: Duration) -> KeysResult<Response> {
        self.apply(|state, now| {
            if state.nodes.contains_key(key) {
                return Err(KeysError::PreconditionViolated(ErrorCode::NodeExist));
            }
            state.index += 1;
            let stored = StoredNode {
                value: value.to_string(),
                created_index: state.index,
                modified_index: state.index,
                expires_at: Some(Self::deadline(now, ttl)),
            };
            let event = Response {
                action: Action::Create,
                node: stored.to_node(key, now),
                prev_node: None,
                index: state.index,
            };
            state.nodes.insert(key.to_string(), stored);
            state.record(event.clone());
            Ok(event)
        })
    }

    async fn get(&self, key: &str) -> KeysResult<Response> {
        self.apply(|state, now| {
            let stored = state.nodes.get(key).ok_or(KeysError::NotFound)?;
            Ok(Response {
                action: Action::Get,
                node: stored.to_node(key, now),
                prev_node: None,
                index: state.index,
            })
        })
    }

    async fn update(&self, key: &str, value: &str, ttl: Duration) -> KeysResult<Response> {
        self.apply(|state, now| {
            let index = state.index + 1;
            let stored = state.nodes.get_mut(key).ok_or(KeysError::NotFound)?;
            let prev_node = stored.to_node(key, now);
            stored.value = value.to_string();
            stored.modified_index = index;
            stored.expires_at = Some(Self::deadline(now, ttl));
            let event = Response {
                action: Action::Update,
                node: stored.to_node(key, now),
                prev_node: Some(prev_node),
                index,
            };
            state.index = index;
            state.record(event.clone());
            Ok(event)
        })
    }

    async fn delete(&self, key: &str) -> KeysResult<Response> {
        self.apply(|state, now| {
            let stored = state.nodes.remove(key).ok_or(KeysError::NotFound)?;
            state.index += 1;
            let event = Response {
                action: Action::Delete,
                node: Node {
                    key: key.to_string(),
                    value: None,
                    created_index: stored.created_index,
                    modified_index: state.index,
                    ttl: None,
                },
                prev_node: Some(stored.to_node(key, now)),
                index: state.index,
            };
            state.record(event.clone());
            Ok(event)
        })
    }

    fn watcher(&self, key: &str, after_index: u64) -> Self::Watcher {
        MemoryKeyWatcher {
            shared: self.shared.clone(),
            key: key.to_string(),
            after_index,
            changed: self.shared.changed.subscribe(),
        }
    }
}

/// Watch over one key of a [`MemoryKeysApi`].
pub struct MemoryKeyWatcher {
    shared: Arc<Shared>,
    key: String,
    /// Index of the last event delivered (or the anchor).
    after_index: u64,
    changed: watch::Receiver<u64>,
}

impl MemoryKeyWatcher {
    /// Returns the next event for the key, or the deadline of the earliest
    /// lease to wait for when there is none yet.
    fn poll_event(&mut self) -> KeysResult<Result<Response, Option<Instant>>> {
        self.changed.borrow_and_update();

        let now = Instant::now();
        let mut state = self.shared.state.lock();
        let before = state.index;
        state.expire_due(now);
        if state.index != before {
            self.shared.changed.send_replace(state.index);
        }

        if state.trimmed_through > self.after_index {
            return Err(KeysError::from_remote(
                ErrorCode::EventIndexCleared,
                format!(
                    "the event in requested index is outdated and cleared (requested: {}, oldest: {})",
                    self.after_index + 1,
                    state.trimmed_through + 1
                ),
            ));
        }

        let event = state
            .history
            .iter()
            .find(|event| event.index > self.after_index && event.node.key == self.key)
            .cloned();

        match event {
            Some(event) => {
                self.after_index = event.index;
                Ok(Ok(event))
            }
            None => Ok(Err(state.next_deadline())),
        }
    }
}

impl KeyWatcher for MemoryKeyWatcher {
    async fn next(&mut self) -> KeysResult<Response> {
        loop {
            let deadline = match self.poll_event()? {
                Ok(event) => return Ok(event),
                Err(deadline) => deadline,
            };

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = self.changed.changed() => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => {
                    // The sender lives in `shared`, which this watcher keeps alive.
                    let _ = self.changed.changed().await;
                }
            }
        }
    }
}
