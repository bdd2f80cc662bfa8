//! Per-cycle compliance evaluation over message snapshots.

use std::{fmt, sync::Arc};

use serde_json::json;
use shared_audit::AuditSink;

use crate::message::Snapshot;

/// Result of one property check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Nothing to report.
    Pass,
    /// Finding forwarded to the audit stream.
    Violation(String),
}

impl CheckOutcome {
    /// Convenience constructor.
    pub fn violation(detail: impl Into<String>) -> Self {
        Self::Violation(detail.into())
    }
}

/// A stateful predicate over the current messages.
///
/// Each instance owns its history; two monitors never share state.
pub trait PropertyCheck: Send {
    /// Name used in audit events.
    fn name(&self) -> &str;

    /// Inspects one snapshot.
    fn evaluate(&mut self, snapshot: &Snapshot) -> CheckOutcome;
}

/// Adapts a closure into a [`PropertyCheck`].
pub struct FnCheck<F> {
    name: String,
    check: F,
}

impl<F> FnCheck<F>
where
    F: FnMut(&Snapshot) -> CheckOutcome + Send,
{
    /// Wraps `check` under `name`.
    pub fn new(name: impl Into<String>, check: F) -> Self {
        Self {
            name: name.into(),
            check,
        }
    }
}

impl<F> PropertyCheck for FnCheck<F>
where
    F: FnMut(&Snapshot) -> CheckOutcome + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&mut self, snapshot: &Snapshot) -> CheckOutcome {
        (self.check)(snapshot)
    }
}

/// Runs registered checks once per cycle and reports non-passing outcomes.
pub struct ComplianceMonitor {
    checks: Vec<Box<dyn PropertyCheck>>,
    audit: Arc<dyn AuditSink>,
}

impl fmt::Debug for ComplianceMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComplianceMonitor")
            .field(
                "checks",
                &self.checks.iter().map(|check| check.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl ComplianceMonitor {
    /// Creates a monitor with no checks.
    #[must_use]
    pub fn new(audit: Arc<dyn AuditSink>) -> Self {
        Self {
            checks: Vec::new(),
            audit,
        }
    }

    /// Adds a check.
    pub fn register(&mut self, check: Box<dyn PropertyCheck>) {
        self.checks.push(check);
    }

    /// Number of registered checks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.checks.len()
    }

    /// Whether no check is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// Evaluates every check; returns `(check, detail)` for each violation.
    pub fn evaluate(&mut self, snapshot: &Snapshot) -> Vec<(String, String)> {
        let mut violations = Vec::new();
        for check in &mut self.checks {
            if let CheckOutcome::Violation(detail) = check.evaluate(snapshot) {
                self.audit.record(
                    "oc_violation",
                    json!({ "check": check.name(), "detail": detail }),
                );
                violations.push((check.name().to_string(), detail));
            }
        }
        violations
    }
}
