//! Per-repository serialization of review work.
//!
//! Reviews of the same repository must not overlap: a rebase or merge in one
//! pull request changes what every other open pull request is compared
//! against. Each `owner/name` key gets a FIFO backlog and at most one consumer
//! task; different keys run in parallel.
//!
//! The backlog map is the only shared state. Its lock is held for single
//! push/pop operations and never across a handler call. A key is present in
//! the map exactly while it has queued items or a running consumer.

use anyhow::Result;
use async_trait::async_trait;
use futures_util::FutureExt;
use gatekeeper_core::PolicyConfig;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::operations::{EventMeta, PullRequest, Repository};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, envelope: &EventEnvelope) -> Result<()>;
}

/// One unit of queued work.
#[derive(Clone)]
pub struct EventEnvelope {
    pub pull_request: PullRequest,
    pub repository: Repository,
    pub policy: PolicyConfig,
    pub meta: EventMeta,
    pub handler: Arc<dyn EventHandler>,
}

impl EventEnvelope {
    pub fn key(&self) -> String {
        self.repository.key()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("event queue is shutting down")]
    ShuttingDown,
}

type Backlogs = HashMap<String, VecDeque<EventEnvelope>>;

struct Inner {
    backlogs: Mutex<Backlogs>,
    consumers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Inner {
    fn backlogs(&self) -> MutexGuard<'_, Backlogs> {
        self.backlogs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn consumers(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.consumers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pop the next envelope for `key`, removing the key once it is empty.
    fn next(&self, key: &str) -> Option<EventEnvelope> {
        let mut backlogs = self.backlogs();
        let queue = backlogs.get_mut(key)?;
        match queue.pop_front() {
            Some(envelope) => Some(envelope),
            None => {
                backlogs.remove(key);
                None
            }
        }
    }
}

#[derive(Clone)]
pub struct RepositoryEventQueue {
    inner: Arc<Inner>,
}

impl Default for RepositoryEventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl RepositoryEventQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                backlogs: Mutex::new(HashMap::new()),
                consumers: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Queue an envelope behind any pending work for the same repository.
    ///
    /// Never waits for a handler. Must be called within a Tokio runtime.
    pub fn enqueue(&self, envelope: EventEnvelope) -> Result<(), QueueError> {
        let key = envelope.key();
        let mut backlogs = self.inner.backlogs();
        // Checked under the lock so no consumer starts after a drain has
        // collected the handles.
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(QueueError::ShuttingDown);
        }
        match backlogs.get_mut(&key) {
            // An entry means a consumer is running and will pick this up.
            Some(queue) => {
                queue.push_back(envelope);
                debug!("Queued event for {} ({} pending)", key, queue.len());
            }
            None => {
                backlogs.insert(key.clone(), VecDeque::from([envelope]));
                // Spawned while the backlog lock is held, so the consumer
                // cannot observe an empty queue before this insert.
                let handle = tokio::spawn(consume(Arc::clone(&self.inner), key));
                let mut consumers = self.inner.consumers();
                consumers.retain(|h| !h.is_finished());
                consumers.push(handle);
            }
        }
        Ok(())
    }

    /// Keys with pending work or a running consumer.
    pub fn active_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.backlogs().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn is_idle(&self) -> bool {
        self.inner.backlogs().is_empty()
    }

    /// Stop accepting work, then wait for every backlog to empty and every
    /// consumer task to exit.
    pub async fn drain_and_shutdown(&self) {
        {
            // Store under the backlog lock so no enqueue is midway through.
            let _backlogs = self.inner.backlogs();
            self.inner.closed.store(true, Ordering::SeqCst);
        }
        info!("Draining event queue, active: {:?}", self.active_keys());

        while !self.is_idle() {
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        let handles: Vec<JoinHandle<()>> = self.inner.consumers().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Queue consumer task failed: {}", e);
            }
        }
        info!("Event queue drained");
    }
}

async fn consume(inner: Arc<Inner>, key: String) {
    debug!("Starting queue consumer for {}", key);

    while let Some(envelope) = inner.next(&key) {
        let pr_number = envelope.pull_request.number;
        let result = AssertUnwindSafe(envelope.handler.handle_event(&envelope))
            .catch_unwind()
            .await;
        match result {
            Ok(Ok(())) => debug!("Handled PR #{} in {}", pr_number, key),
            Ok(Err(e)) => error!("Failed to handle PR #{} in {}: {:#}", pr_number, key, e),
            Err(_) => error!("Handler panicked for PR #{} in {}", pr_number, key),
        }
    }

    debug!("Queue consumer for {} exiting", key);
}
