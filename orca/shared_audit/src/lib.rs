#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Audit event stream shared by the ORCA runtime crates.
//!
//! Components record events through the [`AuditSink`] trait. Delivery to durable
//! or in-memory publishers happens off the caller's thread via [`AuditTrail`].

/// Background delivery worker.
pub mod trail;

pub use trail::{AuditTrail, AuditTrailBuilder};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::{fs::OpenOptions, io::AsyncWriteExt, sync::broadcast};
use uuid::Uuid;

/// Single audit event encoded as JSON.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEvent {
    /// Unique identifier (`evt-<uuid>`).
    pub id: String,
    /// Component that recorded the event.
    pub source: String,
    /// Event kind (e.g., `module_executed`).
    pub kind: String,
    /// RFC3339 timestamp.
    pub timestamp: String,
    /// Structured fields.
    #[serde(default)]
    pub fields: Value,
}

impl AuditEvent {
    /// Creates an event stamped with the current time.
    #[must_use]
    pub fn new(source: impl Into<String>, kind: impl Into<String>, fields: Value) -> Self {
        Self {
            id: format!("evt-{}", Uuid::new_v4()),
            source: source.into(),
            kind: kind.into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            fields,
        }
    }

    /// Looks up a field by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

/// Fire-and-forget recording capability injected into runtime components.
///
/// Implementations must not block beyond enqueueing and must swallow delivery failures.
pub trait AuditSink: Send + Sync {
    /// Records an event of the given kind.
    fn record(&self, kind: &str, fields: Value);
}

/// Sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn record(&self, _kind: &str, _fields: Value) {}
}

/// Asynchronous delivery target for audit events.
#[async_trait]
pub trait AuditPublisher: Send + Sync {
    /// Delivers one event.
    async fn publish(&self, event: AuditEvent) -> Result<()>;
}

/// In-memory broadcast bus retaining a bounded backlog (local runs and tests).
#[derive(Debug, Clone)]
pub struct MemoryAuditBus {
    sender: broadcast::Sender<AuditEvent>,
    backlog: Arc<Mutex<VecDeque<AuditEvent>>>,
    capacity: usize,
}

impl MemoryAuditBus {
    /// Creates a bus keeping at most `capacity` recent events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            backlog: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Subscribes to events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AuditEvent> {
        self.sender.subscribe()
    }

    /// Snapshot of recent events retained in memory.
    #[must_use]
    pub fn snapshot(&self) -> Vec<AuditEvent> {
        self.backlog.lock().iter().cloned().collect()
    }

    /// Retained events of the given kind, oldest first.
    #[must_use]
    pub fn events_of(&self, kind: &str) -> Vec<AuditEvent> {
        self.backlog
            .lock()
            .iter()
            .filter(|event| event.kind == kind)
            .cloned()
            .collect()
    }

    /// Number of retained events of the given kind.
    #[must_use]
    pub fn count(&self, kind: &str) -> usize {
        self.backlog
            .lock()
            .iter()
            .filter(|event| event.kind == kind)
            .count()
    }

    fn push(&self, event: AuditEvent) {
        {
            let mut backlog = self.backlog.lock();
            backlog.push_back(event.clone());
            while backlog.len() > self.capacity {
                backlog.pop_front();
            }
        }
        // No receivers is fine.
        let _ = self.sender.send(event);
    }
}

#[async_trait]
impl AuditPublisher for MemoryAuditBus {
    async fn publish(&self, event: AuditEvent) -> Result<()> {
        self.push(event);
        Ok(())
    }
}

impl AuditSink for MemoryAuditBus {
    fn record(&self, kind: &str, fields: Value) {
        self.push(AuditEvent::new("memory-bus", kind, fields));
    }
}

/// File-backed publisher appending one JSON document per line.
#[derive(Debug, Clone)]
pub struct JsonLinesAuditPublisher {
    path: PathBuf,
}

impl JsonLinesAuditPublisher {
    /// Creates a publisher for `path`, creating parent directories.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }

    /// Target file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AuditPublisher for JsonLinesAuditPublisher {
    async fn publish(&self, event: AuditEvent) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let mut data = serde_json::to_vec(&event)?;
        data.push(b'\n');
        file.write_all(&data).await?;
        file.flush().await?;
        Ok(())
    }
}
