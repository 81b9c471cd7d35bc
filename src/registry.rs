//! The signup registry: routing key to live upstream connection.

use std::collections::HashMap;
use std::sync::RwLock;

use tonic::transport::Channel;
use tracing::debug;

/// Builds the key forwarded calls are routed by.
pub fn routing_key(task_id: &str, party_id: &str) -> String {
    format!("{task_id}_{party_id}")
}

/// A worker that completed the signup handshake.
///
/// The channel is the multiplexed connection this process dialed back to
/// the worker's advertised address; every forwarded call for this key runs
/// a stream on it.
#[derive(Debug, Clone)]
pub struct RegisteredTask {
    pub task_id: String,
    pub party_id: String,
    pub service_type: String,
    pub address: String,
    pub channel: Channel,
}

impl RegisteredTask {
    pub fn key(&self) -> String {
        routing_key(&self.task_id, &self.party_id)
    }
}

/// Process-wide map of registered workers.
///
/// One writer (the signup handler), many readers (one lookup per forwarded
/// call). Critical sections are a single map operation; the lock is never
/// held while a call is in flight.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, RegisteredTask>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes `task` under its routing key and returns the entry it
    /// displaced, if any. The displaced connection stays open until the
    /// caller drops it; calls already running on it keep their own handle
    /// and finish undisturbed.
    pub fn insert(&self, task: RegisteredTask) -> Option<RegisteredTask> {
        let key = task.key();
        debug!("registering {} -> {}", key, task.address);
        self.tasks.write().unwrap().insert(key, task)
    }

    /// Looks up `key`, cloning the record so the caller holds the
    /// connection without holding the lock.
    pub fn lookup(&self, key: &str) -> Option<RegisteredTask> {
        self.tasks.read().unwrap().get(key).cloned()
    }

    pub fn remove(&self, key: &str) -> Option<RegisteredTask> {
        self.tasks.write().unwrap().remove(key)
    }

    /// Drops every registered connection.
    pub fn clear(&self) {
        self.tasks.write().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.tasks.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.read().unwrap().is_empty()
    }
}
