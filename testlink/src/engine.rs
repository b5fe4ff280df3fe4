//! Lifecycle state and command dispatch shared by both engine roles.
//!
//! The state lives behind a single mutex. Every transition and every
//! comparison that gates behavior happens through a [`StateGuard`]; plain
//! [`EngineCore::state`] reads are advisory.
//!
//! Handlers are registered on a [`CommandRegistry`] which is moved into the
//! core at construction, so the table cannot change once frames flow.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio_util::bytes::Bytes;

use crate::bridge::codec::RawFrame;
use crate::bridge::wire::Command;
use crate::diagnostics::{Diagnostic, DiagnosticKind, DiagnosticSink};

/// Connection lifecycle, declared in the order states are reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EngineState {
    Initialized,
    Listening,
    Negotiating,
    Connected,
    Disconnected,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Listening => "listening",
            Self::Negotiating => "negotiating",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected)
    }

    /// Legal edges: each state to its successor, any live state to
    /// `Disconnected`, and [`EngineState::EXECUTION_DIAL`].
    pub fn can_transition_to(&self, next: EngineState) -> bool {
        use EngineState::*;
        match (*self, next) {
            (Disconnected, _) => false,
            (_, Disconnected) => true,
            (Initialized, Listening) | (Listening, Negotiating) | (Negotiating, Connected) => true,
            edge => edge == Self::EXECUTION_DIAL,
        }
    }

    /// The execution side dials out instead of listening.
    pub const EXECUTION_DIAL: (EngineState, EngineState) =
        (EngineState::Initialized, EngineState::Negotiating);
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal state transition: {from} -> {to}")]
pub struct StateError {
    pub from: EngineState,
    pub to: EngineState,
}

/// Handler invoked from the receive loop. Must not block.
pub type CommandHandler<C> = Box<dyn Fn(&C, Option<Bytes>) + Send + Sync>;

/// Command table, filled before the engine is built.
pub struct CommandRegistry<C> {
    handlers: HashMap<Command, CommandHandler<C>>,
}

impl<C> Default for CommandRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> CommandRegistry<C> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register `handler` for `command`, replacing any earlier one.
    pub fn add_command_handler<F>(&mut self, command: Command, handler: F) -> &mut Self
    where
        F: Fn(&C, Option<Bytes>) + Send + Sync + 'static,
    {
        if self.handlers.insert(command, Box::new(handler)).is_some() {
            tracing::debug!(%command, "Replaced command handler");
        }
        self
    }

    pub fn with_handler<F>(mut self, command: Command, handler: F) -> Self
    where
        F: Fn(&C, Option<Bytes>) + Send + Sync + 'static,
    {
        self.add_command_handler(command, handler);
        self
    }

    pub fn handles(&self, command: Command) -> bool {
        self.handlers.contains_key(&command)
    }

    fn get(&self, command: Command) -> Option<&CommandHandler<C>> {
        self.handlers.get(&command)
    }
}

/// Exclusive access to the engine state.
pub struct StateGuard<'a> {
    state: MutexGuard<'a, EngineState>,
    label: &'a str,
}

impl StateGuard<'_> {
    pub fn get(&self) -> EngineState {
        *self.state
    }

    pub fn transition(&mut self, to: EngineState) -> Result<(), StateError> {
        let from = *self.state;
        if !from.can_transition_to(to) {
            return Err(StateError { from, to });
        }
        tracing::debug!(label = %self.label, %from, %to, "State transition");
        *self.state = to;
        Ok(())
    }
}

/// State, handler table and diagnostics for one engine instance.
///
/// `C` is the role-specific context handed to handlers.
pub struct EngineCore<C> {
    label: String,
    state: Mutex<EngineState>,
    registry: CommandRegistry<C>,
    diagnostics: Arc<dyn DiagnosticSink>,
}

impl<C> EngineCore<C> {
    pub fn new(
        label: impl Into<String>,
        registry: CommandRegistry<C>,
        diagnostics: Arc<dyn DiagnosticSink>,
    ) -> Self {
        Self {
            label: label.into(),
            state: Mutex::new(EngineState::Initialized),
            registry,
            diagnostics,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn diagnostics(&self) -> &Arc<dyn DiagnosticSink> {
        &self.diagnostics
    }

    pub fn report(&self, kind: DiagnosticKind, message: impl Into<String>) {
        self.diagnostics
            .report(Diagnostic::new(kind, &self.label, message));
    }

    /// Advisory read. Decisions must go through [`EngineCore::lock_state`].
    pub fn state(&self) -> EngineState {
        self.lock_state().get()
    }

    pub fn lock_state(&self) -> StateGuard<'_> {
        let state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!(label = %self.label, "Engine state mutex poisoned - recovering");
                poisoned.into_inner()
            }
        };
        StateGuard {
            state,
            label: &self.label,
        }
    }

    /// Route one inbound frame to its handler.
    ///
    /// Unknown or unregistered tokens are reported and dropped.
    pub fn dispatch(&self, context: &C, frame: RawFrame) {
        let handler = frame.command().and_then(|c| self.registry.get(c));
        match handler {
            Some(handler) => {
                tracing::trace!(
                    label = %self.label,
                    command = %frame.token_lossy(),
                    payload_len = frame.payload.as_ref().map_or(0, Bytes::len),
                    "Dispatching frame"
                );
                handler(context, frame.payload);
            }
            None => self.report(
                DiagnosticKind::UnknownCommand,
                format!("unknown command '{}'", frame.token_lossy()),
            ),
        }
    }
}

/// Behavior common to both roles.
#[async_trait]
pub trait Engine: Send + Sync {
    fn label(&self) -> &str;

    fn state(&self) -> EngineState;

    /// Role-specific teardown. Safe before a connection exists and idempotent.
    async fn disconnect(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::CollectingDiagnostics;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter {
        infos: AtomicUsize,
        last_payload_len: AtomicUsize,
    }

    fn core(diagnostics: Arc<CollectingDiagnostics>) -> EngineCore<Counter> {
        let registry = CommandRegistry::new().with_handler(Command::Info, |c: &Counter, payload| {
            c.infos.fetch_add(1, Ordering::SeqCst);
            c.last_payload_len
                .store(payload.map_or(0, |p| p.len()), Ordering::SeqCst);
        });
        EngineCore::new("test", registry, diagnostics)
    }

    fn raw(line: &'static [u8]) -> RawFrame {
        RawFrame::parse(Bytes::from_static(line))
    }

    #[test]
    fn legal_order_is_accepted() {
        let core = core(Arc::new(CollectingDiagnostics::new()));
        let mut state = core.lock_state();
        for next in [
            EngineState::Listening,
            EngineState::Negotiating,
            EngineState::Connected,
            EngineState::Disconnected,
        ] {
            state.transition(next).unwrap();
            assert_eq!(state.get(), next);
        }
    }

    #[test]
    fn backwards_and_repeated_transitions_are_rejected() {
        let core = core(Arc::new(CollectingDiagnostics::new()));
        let mut state = core.lock_state();
        state.transition(EngineState::Listening).unwrap();

        let err = state.transition(EngineState::Initialized).unwrap_err();
        assert_eq!(
            err,
            StateError {
                from: EngineState::Listening,
                to: EngineState::Initialized
            }
        );
        assert!(state.transition(EngineState::Listening).is_err());
        assert_eq!(state.get(), EngineState::Listening);
    }

    #[test]
    fn skipped_transitions_are_rejected() {
        let core = core(Arc::new(CollectingDiagnostics::new()));
        let mut state = core.lock_state();

        let err = state.transition(EngineState::Connected).unwrap_err();
        assert_eq!(
            err,
            StateError {
                from: EngineState::Initialized,
                to: EngineState::Connected
            }
        );
        assert_eq!(state.get(), EngineState::Initialized);

        state.transition(EngineState::Listening).unwrap();
        assert!(state.transition(EngineState::Connected).is_err());
        assert_eq!(state.get(), EngineState::Listening);
    }

    #[test]
    fn execution_side_dials_straight_to_negotiating() {
        let core = core(Arc::new(CollectingDiagnostics::new()));
        let mut state = core.lock_state();
        let (from, to) = EngineState::EXECUTION_DIAL;
        assert_eq!(state.get(), from);

        state.transition(to).unwrap();
        state.transition(EngineState::Connected).unwrap();
        assert!(!EngineState::Listening.can_transition_to(EngineState::Initialized));
        assert!(!EngineState::Listening.can_transition_to(EngineState::Listening));
    }

    #[test]
    fn any_state_may_disconnect_once() {
        for from in [
            EngineState::Initialized,
            EngineState::Listening,
            EngineState::Negotiating,
            EngineState::Connected,
        ] {
            assert!(from.can_transition_to(EngineState::Disconnected));
        }
        assert!(!EngineState::Disconnected.can_transition_to(EngineState::Disconnected));
        assert!(!EngineState::Disconnected.can_transition_to(EngineState::Connected));
    }

    #[test]
    fn dispatch_invokes_registered_handler() {
        let diagnostics = Arc::new(CollectingDiagnostics::new());
        let core = core(Arc::clone(&diagnostics));
        let ctx = Counter::default();

        core.dispatch(&ctx, raw(b"INFO {\"capability\":1}"));
        core.dispatch(&ctx, raw(b"INFO"));

        assert_eq!(ctx.infos.load(Ordering::SeqCst), 2);
        assert_eq!(ctx.last_payload_len.load(Ordering::SeqCst), 0);
        assert!(diagnostics.records().is_empty());
    }

    #[test]
    fn dispatch_drops_unknown_and_unregistered_tokens() {
        let diagnostics = Arc::new(CollectingDiagnostics::new());
        let core = core(Arc::clone(&diagnostics));
        let ctx = Counter::default();

        core.dispatch(&ctx, raw(b"PING"));
        core.dispatch(&ctx, raw(b"QUIT"));

        assert_eq!(ctx.infos.load(Ordering::SeqCst), 0);
        let unknown = diagnostics.of_kind(DiagnosticKind::UnknownCommand);
        assert_eq!(unknown.len(), 2);
        assert!(unknown[0].message.contains("PING"));
        assert!(unknown[1].message.contains("QUIT"));
    }
}
