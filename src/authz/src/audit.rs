//! Audit trail of decisions and administrative mutations
//!
//! Events are handed to an [`AuditRecorder`], which queues them on a bounded
//! channel and writes them through the policy store from a background task.
//! Recording never blocks and never fails the caller: when the queue is full
//! the event is dropped and counted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::policy::PolicyStore;
use crate::scope::Scope;
use crate::types::{new_id, Pagination};

/// Action recorded for authorization decisions
pub const DECISION_ACTION: &str = "authz.decision";

/// Append-only audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub id: String,
    #[serde(flatten)]
    pub scope: Scope,
    pub actor_id: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    #[serde(default)]
    pub old_value: Option<JsonValue>,
    #[serde(default)]
    pub new_value: Option<JsonValue>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        scope: Scope,
        actor_id: impl Into<String>,
        action: impl Into<String>,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        Self {
            id: new_id(),
            scope,
            actor_id: actor_id.into(),
            action: action.into(),
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            old_value: None,
            new_value: None,
            ip_address: None,
            user_agent: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_old_value(mut self, value: JsonValue) -> Self {
        self.old_value = Some(value);
        self
    }

    pub fn with_new_value(mut self, value: JsonValue) -> Self {
        self.new_value = Some(value);
        self
    }

    pub fn with_origin(mut self, ip_address: Option<String>, user_agent: Option<String>) -> Self {
        self.ip_address = ip_address;
        self.user_agent = user_agent;
        self
    }
}

/// Who performed an administrative call, and from where
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditContext {
    pub actor_id: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl AuditContext {
    pub fn new(actor_id: impl Into<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            ip_address: None,
            user_agent: None,
        }
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }
}

/// Filters for listing audit events
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditFilter {
    pub actor_id: Option<String>,
    pub action: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    /// Inclusive lower bound
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound
    pub until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pagination: Pagination,
}

impl AuditFilter {
    pub fn matches(&self, event: &AuditEvent) -> bool {
        fn eq(filter: &Option<String>, value: &str) -> bool {
            filter.as_deref().map_or(true, |f| f == value)
        }

        eq(&self.actor_id, &event.actor_id)
            && eq(&self.action, &event.action)
            && eq(&self.resource_type, &event.resource_type)
            && eq(&self.resource_id, &event.resource_id)
            && self.since.map_or(true, |since| event.timestamp >= since)
            && self.until.map_or(true, |until| event.timestamp < until)
    }
}

/// Recorder configuration
#[derive(Debug, Clone)]
pub struct AuditConfig {
    /// Record events at all
    pub enabled: bool,
    /// Queue capacity; events beyond it are dropped
    pub buffer_size: usize,
    /// Budget for a single store write
    pub write_timeout: Duration,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            buffer_size: 4096,
            write_timeout: Duration::from_millis(2000),
        }
    }
}

/// Recorder counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuditStats {
    /// Events written to the store
    pub recorded: u64,
    /// Events dropped because the queue was full or closed
    pub dropped: u64,
    /// Events the store rejected or timed out on
    pub failed: u64,
    /// Events queued but not yet written
    pub pending: usize,
}

#[derive(Default)]
struct Counters {
    recorded: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

enum Command {
    Record(Box<AuditEvent>),
    Flush(oneshot::Sender<()>),
}

/// Non-blocking audit recorder
///
/// The background writer stops once the recorder is dropped and the queue
/// has drained.
pub struct AuditRecorder {
    sender: Option<mpsc::Sender<Command>>,
    counters: Arc<Counters>,
}

impl AuditRecorder {
    /// Start the background writer on the current tokio runtime.
    pub fn spawn(store: Arc<dyn PolicyStore>, config: AuditConfig) -> Self {
        if !config.enabled {
            return Self::disabled();
        }

        let (sender, receiver) = mpsc::channel(config.buffer_size.max(1));
        let counters = Arc::new(Counters::default());

        tokio::spawn(run_writer(
            receiver,
            store,
            config.write_timeout,
            Arc::clone(&counters),
        ));

        Self {
            sender: Some(sender),
            counters,
        }
    }

    /// A recorder that discards everything
    pub fn disabled() -> Self {
        Self {
            sender: None,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.sender.is_some()
    }

    /// Queue an event without waiting. Returns whether it was queued.
    pub fn record(&self, event: AuditEvent) -> bool {
        let Some(sender) = &self.sender else {
            return false;
        };

        match sender.try_send(Command::Record(Box::new(event))) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(Command::Record(event))) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    action = %event.action,
                    resource_type = %event.resource_type,
                    "Audit queue full, dropping event"
                );
                false
            }
            Err(_) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Audit writer stopped, dropping event");
                false
            }
        }
    }

    /// Wait until every event queued before this call has been written or
    /// has failed.
    pub async fn flush(&self) {
        let Some(sender) = &self.sender else {
            return;
        };

        let (done, wait) = oneshot::channel();
        if sender.send(Command::Flush(done)).await.is_err() {
            return;
        }
        let _ = wait.await;
    }

    pub fn stats(&self) -> AuditStats {
        let pending = self
            .sender
            .as_ref()
            .map(|s| s.max_capacity() - s.capacity())
            .unwrap_or(0);

        AuditStats {
            recorded: self.counters.recorded.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            pending,
        }
    }
}

async fn run_writer(
    mut receiver: mpsc::Receiver<Command>,
    store: Arc<dyn PolicyStore>,
    write_timeout: Duration,
    counters: Arc<Counters>,
) {
    while let Some(command) = receiver.recv().await {
        match command {
            Command::Record(event) => {
                let action = event.action.clone();
                match tokio::time::timeout(write_timeout, store.create_audit_event(*event)).await {
                    Ok(Ok(())) => {
                        counters.recorded.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(Err(e)) => {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        warn!(action = %action, error = %e, "Failed to write audit event");
                    }
                    Err(_) => {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        warn!(action = %action, "Audit write timed out");
                    }
                }
            }
            Command::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Audit writer stopped");
}
