//! Cross-system coordination: dependency graph, shared state and messaging.
//!
//! Every registered system gets a mailbox. Point-to-point messages and topic
//! broadcasts are delivered into it; a closed mailbox only fails its own
//! delivery.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::{debug, info, warn};

use crate::error::CoordinatorError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// How often [`Coordinator::await_ready`] re-checks dependencies.
    pub poll_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
        }
    }
}

impl CoordinatorConfig {
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyStatus {
    AllMet,
    /// Dependencies that are not registered.
    Missing(Vec<String>),
}

/// A delivered message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub from: String,
    pub to: String,
    /// Set for broadcasts.
    pub topic: Option<String>,
    pub payload: Value,
    pub sent_at: DateTime<Utc>,
}

/// Outcome of a broadcast, per subscriber.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: Vec<String>,
    pub failed: Vec<String>,
}

type Graph = BTreeMap<String, BTreeSet<String>>;

/// Depth-first search from `start` along dependency edges. Returns the path
/// back to `start` if one exists.
fn find_cycle(graph: &Graph, start: &str) -> Option<Vec<String>> {
    fn visit(
        graph: &Graph,
        node: &str,
        start: &str,
        path: &mut Vec<String>,
        visited: &mut BTreeSet<String>,
    ) -> bool {
        for dep in graph.get(node).into_iter().flatten() {
            if dep == start {
                path.push(dep.clone());
                return true;
            }
            if visited.insert(dep.clone()) {
                path.push(dep.clone());
                if visit(graph, dep, start, path, visited) {
                    return true;
                }
                path.pop();
            }
        }
        false
    }

    let mut path = vec![start.to_string()];
    let mut visited = BTreeSet::new();
    visit(graph, start, start, &mut path, &mut visited).then_some(path)
}

/// Owns system dependencies, shared state and mailboxes.
#[derive(Debug, Default)]
pub struct Coordinator {
    config: CoordinatorConfig,
    graph: RwLock<Graph>,
    mailboxes: DashMap<String, UnboundedSender<Message>>,
    state: DashMap<String, Value>,
    subscriptions: DashMap<String, BTreeSet<String>>,
}

impl Coordinator {
    #[must_use]
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Register `id` with its dependencies and return its mailbox.
    ///
    /// Dependencies need not be registered yet.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::DuplicateSystem`] if `id` is registered,
    /// or [`CoordinatorError::DependencyCycle`] if the new edges would close
    /// a cycle. Nothing changes on error.
    pub fn register_system<I, S>(
        &self,
        id: &str,
        dependencies: I,
    ) -> Result<UnboundedReceiver<Message>, CoordinatorError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut graph = self.graph.write();
        if graph.contains_key(id) {
            return Err(CoordinatorError::DuplicateSystem(id.to_string()));
        }

        let deps: BTreeSet<String> = dependencies.into_iter().map(Into::into).collect();
        let mut tentative = graph.clone();
        tentative.insert(id.to_string(), deps.clone());
        if let Some(path) = find_cycle(&tentative, id) {
            warn!(system = %id, path = ?path, "rejected registration: dependency cycle");
            return Err(CoordinatorError::DependencyCycle { path });
        }

        graph.insert(id.to_string(), deps);
        let (tx, rx) = unbounded_channel();
        self.mailboxes.insert(id.to_string(), tx);
        info!(system = %id, "registered system with coordinator");
        Ok(rx)
    }

    /// Remove `id`, its mailbox and its subscriptions.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::NotRegistered`] for unknown ids.
    pub fn unregister_system(&self, id: &str) -> Result<(), CoordinatorError> {
        let mut graph = self.graph.write();
        if graph.remove(id).is_none() {
            return Err(CoordinatorError::NotRegistered(id.to_string()));
        }
        self.mailboxes.remove(id);
        self.subscriptions.retain(|_, subscribers| {
            subscribers.remove(id);
            !subscribers.is_empty()
        });
        drop(graph);
        info!(system = %id, "unregistered system from coordinator");
        Ok(())
    }

    #[must_use]
    pub fn is_registered(&self, id: &str) -> bool {
        self.graph.read().contains_key(id)
    }

    /// Registered ids, sorted.
    #[must_use]
    pub fn registered_systems(&self) -> Vec<String> {
        self.graph.read().keys().cloned().collect()
    }

    /// Declared dependencies of `id`, sorted.
    #[must_use]
    pub fn dependencies(&self, id: &str) -> Option<Vec<String>> {
        self.graph
            .read()
            .get(id)
            .map(|deps| deps.iter().cloned().collect())
    }

    /// # Errors
    ///
    /// Returns [`CoordinatorError::NotRegistered`] for unknown ids.
    pub fn check_dependencies(&self, id: &str) -> Result<DependencyStatus, CoordinatorError> {
        let graph = self.graph.read();
        let deps = graph
            .get(id)
            .ok_or_else(|| CoordinatorError::NotRegistered(id.to_string()))?;
        let missing: Vec<String> = deps
            .iter()
            .filter(|dep| !graph.contains_key(*dep))
            .cloned()
            .collect();
        Ok(if missing.is_empty() {
            DependencyStatus::AllMet
        } else {
            DependencyStatus::Missing(missing)
        })
    }

    /// Wait until every dependency of `id` is registered.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::NotReady`] with the missing ids once
    /// `timeout` has passed, or [`CoordinatorError::NotRegistered`] if `id`
    /// is not registered.
    pub async fn await_ready(&self, id: &str, timeout: Duration) -> Result<(), CoordinatorError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let missing = match self.check_dependencies(id)? {
                DependencyStatus::AllMet => return Ok(()),
                DependencyStatus::Missing(missing) => missing,
            };
            if tokio::time::Instant::now() >= deadline {
                return Err(CoordinatorError::NotReady {
                    system: id.to_string(),
                    missing,
                    after: timeout,
                });
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Store `value` under `key`, returning the previous value.
    pub fn put(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.state.insert(key.into(), value)
    }

    /// # Errors
    ///
    /// Returns [`CoordinatorError::StateNotFound`] if `key` is absent.
    pub fn get(&self, key: &str) -> Result<Value, CoordinatorError> {
        self.state
            .get(key)
            .map(|v| v.value().clone())
            .ok_or_else(|| CoordinatorError::StateNotFound(key.to_string()))
    }

    /// Atomically replace the value under `key` with `f(current)`. `f` sees
    /// `None` when the key is absent. Returns the new value.
    ///
    /// `f` runs while the shard holding `key` is write-locked. It must not
    /// call back into the shared-state methods of this coordinator (`get`,
    /// `put`, `update`, `delete`): a key in the same shard deadlocks.
    pub fn update(&self, key: impl Into<String>, f: impl FnOnce(Option<&Value>) -> Value) -> Value {
        match self.state.entry(key.into()) {
            Entry::Occupied(mut entry) => {
                let value = f(Some(entry.get()));
                entry.insert(value.clone());
                value
            }
            Entry::Vacant(entry) => {
                let value = f(None);
                entry.insert(value.clone());
                value
            }
        }
    }

    /// # Errors
    ///
    /// Returns [`CoordinatorError::StateNotFound`] if `key` is absent.
    pub fn delete(&self, key: &str) -> Result<Value, CoordinatorError> {
        self.state
            .remove(key)
            .map(|(_, v)| v)
            .ok_or_else(|| CoordinatorError::StateNotFound(key.to_string()))
    }

    /// Subscribe `id` to `topic`.
    ///
    /// The registration is held for the whole call, so a concurrent
    /// [`unregister_system`](Self::unregister_system) either sees the
    /// subscription and removes it or runs before the check.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::NotRegistered`] if `id` is unknown.
    pub fn subscribe(&self, id: &str, topic: &str) -> Result<(), CoordinatorError> {
        let graph = self.graph.read();
        if !graph.contains_key(id) {
            return Err(CoordinatorError::NotRegistered(id.to_string()));
        }
        self.subscriptions
            .entry(topic.to_string())
            .or_default()
            .insert(id.to_string());
        drop(graph);
        debug!(system = %id, topic, "subscribed");
        Ok(())
    }

    /// Returns `true` if `id` was subscribed to `topic`.
    pub fn unsubscribe(&self, id: &str, topic: &str) -> bool {
        let removed = self
            .subscriptions
            .get_mut(topic)
            .is_some_and(|mut subscribers| subscribers.remove(id));
        self.subscriptions
            .remove_if(topic, |_, subscribers| subscribers.is_empty());
        removed
    }

    /// Current subscribers of `topic`, sorted.
    #[must_use]
    pub fn subscribers(&self, topic: &str) -> Vec<String> {
        self.subscriptions
            .get(topic)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Deliver `payload` to every current subscriber of `topic`. A failed
    /// delivery is logged and does not affect the others.
    pub fn broadcast(&self, from: &str, topic: &str, payload: Value) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let sent_at = Utc::now();
        for subscriber in self.subscribers(topic) {
            let message = Message {
                from: from.to_string(),
                to: subscriber.clone(),
                topic: Some(topic.to_string()),
                payload: payload.clone(),
                sent_at,
            };
            let delivered = self
                .mailboxes
                .get(&subscriber)
                .is_some_and(|tx| tx.send(message).is_ok());
            if delivered {
                report.delivered.push(subscriber);
            } else {
                warn!(topic, subscriber = %subscriber, "broadcast delivery failed");
                report.failed.push(subscriber);
            }
        }
        debug!(
            topic,
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "broadcast"
        );
        report
    }

    /// # Errors
    ///
    /// Returns [`CoordinatorError::NotRegistered`] if `to` is unknown, or
    /// [`CoordinatorError::DeliveryFailed`] if its mailbox is closed.
    pub fn send_message(&self, from: &str, to: &str, payload: Value) -> Result<(), CoordinatorError> {
        let mailbox = self
            .mailboxes
            .get(to)
            .ok_or_else(|| CoordinatorError::NotRegistered(to.to_string()))?;
        mailbox
            .send(Message {
                from: from.to_string(),
                to: to.to_string(),
                topic: None,
                payload,
                sent_at: Utc::now(),
            })
            .map_err(|_| CoordinatorError::DeliveryFailed(to.to_string()))
    }
}
