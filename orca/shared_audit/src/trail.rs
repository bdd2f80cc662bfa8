use std::{fmt, path::PathBuf, sync::Arc, thread::JoinHandle};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{AuditEvent, AuditPublisher, AuditSink, JsonLinesAuditPublisher};

/// Builder for [`AuditTrail`].
pub struct AuditTrailBuilder {
    source: String,
    log_path: Option<PathBuf>,
    publishers: Vec<Arc<dyn AuditPublisher>>,
}

impl AuditTrailBuilder {
    /// Creates a builder scoped to a source label.
    #[must_use]
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            log_path: None,
            publishers: Vec::new(),
        }
    }

    /// Appends events to a JSON lines file.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Adds a delivery target.
    #[must_use]
    pub fn publisher(mut self, publisher: Arc<dyn AuditPublisher>) -> Self {
        self.publishers.push(publisher);
        self
    }

    /// Opens the trail and starts its delivery worker.
    pub fn build(mut self) -> Result<AuditTrail> {
        if let Some(path) = self.log_path.take() {
            let file = JsonLinesAuditPublisher::new(&path)
                .with_context(|| format!("opening audit log {}", path.display()))?;
            self.publishers.push(Arc::new(file));
        }
        AuditTrail::open(self.source, self.publishers)
    }
}

/// Queue-backed audit sink delivering events on a dedicated worker thread.
///
/// `record` only enqueues. `shutdown` closes the queue, lets the worker drain what
/// was already accepted, then joins it. Events recorded after shutdown are dropped.
pub struct AuditTrail {
    source: String,
    sender: Mutex<Option<mpsc::UnboundedSender<AuditEvent>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for AuditTrail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditTrail")
            .field("source", &self.source)
            .field("open", &self.is_open())
            .finish()
    }
}

impl AuditTrail {
    /// Returns a builder.
    #[must_use]
    pub fn builder(source: impl Into<String>) -> AuditTrailBuilder {
        AuditTrailBuilder::new(source)
    }

    /// Starts the delivery worker for the given publishers.
    pub fn open(
        source: impl Into<String>,
        publishers: Vec<Arc<dyn AuditPublisher>>,
    ) -> Result<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("building audit delivery runtime")?;
        let worker = std::thread::Builder::new()
            .name("audit-trail".into())
            .spawn(move || runtime.block_on(deliver(receiver, publishers)))
            .context("spawning audit delivery thread")?;
        Ok(Self {
            source: source.into(),
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Whether the trail still accepts events.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.sender.lock().is_some()
    }

    /// Stops accepting events, flushes the queue and joins the worker. Idempotent.
    pub fn shutdown(&self) {
        drop(self.sender.lock().take());
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                warn!(source = %self.source, "audit delivery worker panicked");
            }
        }
    }
}

impl AuditSink for AuditTrail {
    fn record(&self, kind: &str, fields: Value) {
        if let Some(sender) = self.sender.lock().as_ref() {
            let _ = sender.send(AuditEvent::new(&self.source, kind, fields));
        }
    }
}

impl Drop for AuditTrail {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn deliver(
    mut receiver: mpsc::UnboundedReceiver<AuditEvent>,
    publishers: Vec<Arc<dyn AuditPublisher>>,
) {
    while let Some(event) = receiver.recv().await {
        debug!(kind = %event.kind, fields = %event.fields, "[{}]", event.kind.to_uppercase());
        for publisher in &publishers {
            if let Err(err) = publisher.publish(event.clone()).await {
                warn!(kind = %event.kind, error = %err, "audit delivery failed");
            }
        }
    }
}
