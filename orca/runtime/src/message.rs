use std::{fmt, sync::Arc, time::Instant};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

/// Messages gathered for one module invocation, keyed by input topic.
pub type Inputs = IndexMap<String, Arc<Message>>;

/// Payloads produced by one module invocation, keyed by output topic.
pub type Outputs = IndexMap<String, Payload>;

/// Point-in-time copy of every stored message, keyed by topic.
pub type Snapshot = IndexMap<String, Arc<Message>>;

/// Standard observation envelope emitted by environments.
///
/// The only payload shape the runtime itself interprets (for episode termination).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Context {
    /// Opaque state value.
    #[serde(default)]
    pub state: Option<Value>,
    /// Scalar reward.
    #[serde(default)]
    pub reward: f64,
    /// Episode ended naturally.
    #[serde(default)]
    pub terminated: bool,
    /// Episode was cut short.
    #[serde(default)]
    pub truncated: bool,
    /// Free-form side channel.
    #[serde(default)]
    pub info: Map<String, Value>,
}

impl Context {
    /// Creates an envelope around a state value.
    #[must_use]
    pub fn new(state: impl Into<Value>) -> Self {
        Self {
            state: Some(state.into()),
            ..Self::default()
        }
    }

    /// Sets the reward.
    #[must_use]
    pub fn with_reward(mut self, reward: f64) -> Self {
        self.reward = reward;
        self
    }

    /// Marks the episode as terminated.
    #[must_use]
    pub fn terminated(mut self) -> Self {
        self.terminated = true;
        self
    }

    /// Marks the episode as truncated.
    #[must_use]
    pub fn truncated(mut self) -> Self {
        self.truncated = true;
        self
    }

    /// Inserts an info entry.
    #[must_use]
    pub fn with_info(mut self, key: impl Into<String>, value: Value) -> Self {
        self.info.insert(key.into(), value);
        self
    }

    /// Numeric view of the state, if it is a number.
    #[must_use]
    pub fn state_f64(&self) -> Option<f64> {
        self.state.as_ref().and_then(Value::as_f64)
    }

    /// Whether the envelope ends the episode.
    #[must_use]
    pub const fn is_done(&self) -> bool {
        self.terminated || self.truncated
    }
}

/// Message body: either an observation envelope or an opaque JSON value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Payload {
    /// Observation envelope.
    Context(Context),
    /// Anything else; passed through untouched.
    Value(Value),
}

impl Payload {
    /// Envelope view, if this payload is one.
    #[must_use]
    pub const fn as_context(&self) -> Option<&Context> {
        match self {
            Self::Context(ctx) => Some(ctx),
            Self::Value(_) => None,
        }
    }

    /// Numeric view: a bare number, or an envelope's reward.
    #[must_use]
    pub fn as_reward(&self) -> Option<f64> {
        match self {
            Self::Context(ctx) => Some(ctx.reward),
            Self::Value(value) => value.as_f64(),
        }
    }
}

impl From<Context> for Payload {
    fn from(ctx: Context) -> Self {
        Self::Context(ctx)
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

/// Immutable envelope published to the message store.
#[derive(Debug, Clone)]
pub struct Message {
    id: Uuid,
    topic: String,
    payload: Payload,
    sender: String,
    confidence: Option<f64>,
    created_at: Instant,
    timestamp: DateTime<Utc>,
}

impl Message {
    /// Creates a message stamped with the current time.
    #[must_use]
    pub fn new(
        topic: impl Into<String>,
        payload: impl Into<Payload>,
        sender: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            payload: payload.into(),
            sender: sender.into(),
            confidence: None,
            created_at: Instant::now(),
            timestamp: Utc::now(),
        }
    }

    /// Attaches a confidence, clamped to `[0, 1]`.
    #[must_use]
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence.clamp(0.0, 1.0));
        self
    }

    /// Overrides the generated id.
    #[must_use]
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    /// Unique id.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Topic the message was published on.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Body.
    #[must_use]
    pub const fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Envelope view of the body.
    #[must_use]
    pub const fn context(&self) -> Option<&Context> {
        self.payload.as_context()
    }

    /// Id of the emitting module.
    #[must_use]
    pub fn sender(&self) -> &str {
        &self.sender
    }

    /// Optional certainty in `[0, 1]`.
    #[must_use]
    pub const fn confidence(&self) -> Option<f64> {
        self.confidence
    }

    /// Monotonic creation instant.
    #[must_use]
    pub const fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Wall-clock creation time.
    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// JSON rendering for audit and inspection.
    #[must_use]
    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "topic": self.topic,
            "payload": self.payload,
            "sender": self.sender,
            "timestamp": self.timestamp.to_rfc3339(),
            "confidence": self.confidence,
        })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<Message topic={} from={} time={} confidence={:?}>",
            self.topic,
            self.sender,
            self.timestamp.format("%H:%M:%S%.3f"),
            self.confidence
        )
    }
}
