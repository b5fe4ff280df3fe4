//! Diagnostic records for abnormal-but-non-fatal conditions.
//!
//! Everything the receive loop or teardown swallows ends up here. Fatal
//! conditions are returned to the caller as errors instead.

use std::fmt;
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticKind {
    /// Frame is missing segments or carries an undecodable payload.
    MalformedFrame,
    /// No handler is registered for the token.
    UnknownCommand,
    /// Frame arrived in a state that does not expect it.
    OutOfOrder,
    /// Operator command issued with no connection to carry it.
    NotConnected,
    /// Peer announced a different capability level.
    CapabilityMismatch,
    /// Read, write or accept failure.
    Transport,
    /// A cleanup task failed or panicked.
    Cleanup,
    /// Connection lifecycle announcement.
    Lifecycle,
}

impl DiagnosticKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MalformedFrame => "malformed_frame",
            Self::UnknownCommand => "unknown_command",
            Self::OutOfOrder => "out_of_order",
            Self::NotConnected => "not_connected",
            Self::CapabilityMismatch => "capability_mismatch",
            Self::Transport => "transport",
            Self::Cleanup => "cleanup",
            Self::Lifecycle => "lifecycle",
        }
    }
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    /// Label of the engine or connection that produced the record.
    pub label: String,
    pub message: String,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, label: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            label: label.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.label, self.kind, self.message)
    }
}

pub trait DiagnosticSink: Send + Sync {
    fn report(&self, diagnostic: Diagnostic);
}

/// Default sink: emits each record as a tracing event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDiagnostics;

impl DiagnosticSink for TracingDiagnostics {
    fn report(&self, d: Diagnostic) {
        let kind = d.kind.as_str();
        match d.kind {
            DiagnosticKind::Transport => {
                tracing::error!(label = %d.label, kind, "{}", d.message);
            }
            DiagnosticKind::Lifecycle => {
                tracing::info!(label = %d.label, kind, "{}", d.message);
            }
            DiagnosticKind::NotConnected => {
                tracing::debug!(label = %d.label, kind, "{}", d.message);
            }
            _ => {
                tracing::warn!(label = %d.label, kind, "{}", d.message);
            }
        }
    }
}

/// Sink that keeps every record in memory.
#[derive(Debug, Default)]
pub struct CollectingDiagnostics {
    records: Mutex<Vec<Diagnostic>>,
}

impl CollectingDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<Diagnostic> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn of_kind(&self, kind: DiagnosticKind) -> Vec<Diagnostic> {
        self.records()
            .into_iter()
            .filter(|d| d.kind == kind)
            .collect()
    }

    /// True if any record contains `needle` in its message.
    pub fn contains(&self, needle: &str) -> bool {
        self.records().iter().any(|d| d.message.contains(needle))
    }
}

impl DiagnosticSink for CollectingDiagnostics {
    fn report(&self, diagnostic: Diagnostic) {
        TracingDiagnostics.report(diagnostic.clone());
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(diagnostic);
    }
}
