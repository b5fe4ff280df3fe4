//! Execution side of the protocol - runs inside the peer process.
//!
//! The runner side (listening, forwarding to a sink) is in runner.rs.
//!
//! Flow:
//! 1. `connect()` dials the port the runner handed out, state -> Negotiating
//! 2. Runner INFO arrives, we answer with our INFO, state -> Connected
//! 3. `send_message()` emits MESSAGE frames for running operations
//! 4. CANCEL fires per-operation cancellation tokens (or all of them)
//! 5. QUIT fires the quit token; the owner then calls `disconnect()`

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_util::bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::{DEFAULT_MAX_FRAME_LENGTH, Frame};
use crate::bridge::protocol::{EngineInfo, EngineRole};
use crate::bridge::wire::{self, Command, PROTOCOL_CAPABILITY};
use crate::connection::FramedConnection;
use crate::diagnostics::{DiagnosticKind, DiagnosticSink, TracingDiagnostics};
use crate::engine::{CommandRegistry, Engine, EngineCore, EngineState};

#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    pub label: String,
    pub host: IpAddr,
    pub port: u16,
    pub capability: u32,
    pub max_frame_length: usize,
}

impl ExecutionConfig {
    pub fn new(port: u16) -> Self {
        Self {
            label: format!("execution-{}", uuid::Uuid::new_v4().simple()),
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
            capability: PROTOCOL_CAPABILITY,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_host(mut self, host: IpAddr) -> Self {
        self.host = host;
        self
    }

    pub fn with_capability(mut self, capability: u32) -> Self {
        self.capability = capability;
        self
    }

    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("execution engine '{label}' cannot connect from state {state}")]
    AlreadyStarted { label: String, state: EngineState },
    #[error("failed to connect to runner at {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("not connected to a runner")]
    NotConnected,
    #[error("handshake did not complete within {0:?}")]
    HandshakeTimeout(Duration),
}

/// Execution-side engine: one connection to one runner.
pub struct ExecutionEngine {
    shared: Arc<ExecutionShared>,
}

struct ExecutionShared {
    core: EngineCore<ExecutionShared>,
    config: ExecutionConfig,
    connection: Mutex<Option<Arc<FramedConnection>>>,
    runner_info: Mutex<Option<EngineInfo>>,
    operations: DashMap<String, CancellationToken>,
    cancel_all: CancellationToken,
    quit: CancellationToken,
    state_changed: Notify,
    teardown: tokio::sync::Mutex<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ExecutionEngine {
    pub fn new(config: ExecutionConfig) -> Self {
        Self::with_diagnostics(config, Arc::new(TracingDiagnostics))
    }

    pub fn with_diagnostics(config: ExecutionConfig, diagnostics: Arc<dyn DiagnosticSink>) -> Self {
        let registry = CommandRegistry::new()
            .with_handler(Command::Info, ExecutionShared::on_info)
            .with_handler(Command::Cancel, ExecutionShared::on_cancel)
            .with_handler(Command::Quit, ExecutionShared::on_quit);

        Self {
            shared: Arc::new(ExecutionShared {
                core: EngineCore::new(config.label.clone(), registry, diagnostics),
                config,
                connection: Mutex::new(None),
                runner_info: Mutex::new(None),
                operations: DashMap::new(),
                cancel_all: CancellationToken::new(),
                quit: CancellationToken::new(),
                state_changed: Notify::new(),
                teardown: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Dial the runner and wait for its INFO in the background.
    pub async fn connect(&self) -> Result<(), ExecutionError> {
        let shared = &self.shared;
        let label = shared.core.label();
        let already_started = |state| ExecutionError::AlreadyStarted {
            label: label.to_string(),
            state,
        };

        let state = shared.core.state();
        if state != EngineState::Initialized {
            return Err(already_started(state));
        }

        let addr = shared.config.addr();
        tracing::debug!(%label, %addr, "Connecting to runner");
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| ExecutionError::Connect { addr, source })?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%label, error = %e, "Failed to set TCP_NODELAY");
        }

        let weak = Arc::downgrade(shared);
        let connection = Arc::new(
            FramedConnection::new(
                label,
                stream,
                move |frame| {
                    if let Some(shared) = weak.upgrade() {
                        shared.core.dispatch(&shared, frame);
                    }
                },
                Arc::clone(shared.core.diagnostics()),
            )
            .with_max_frame_length(shared.config.max_frame_length),
        );

        {
            let mut state = shared.core.lock_state();
            // Lost a race with another connect() or a disconnect().
            if let Err(e) = state.transition(EngineState::Negotiating) {
                return Err(already_started(e.from));
            }
            *lock(&shared.connection) = Some(Arc::clone(&connection));
            connection.start();
        }
        shared.state_changed.notify_waiters();

        shared.core.report(
            DiagnosticKind::Lifecycle,
            format!("connected to runner at {addr}"),
        );
        Ok(())
    }

    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), ExecutionError> {
        let wait = async {
            loop {
                let changed = self.shared.state_changed.notified();
                match self.state() {
                    EngineState::Connected => return Ok(()),
                    EngineState::Disconnected => return Err(ExecutionError::NotConnected),
                    _ => changed.await,
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| ExecutionError::HandshakeTimeout(timeout))?
    }

    /// Emit a MESSAGE frame for `operation_id`.
    pub fn send_message<T: Serialize + ?Sized>(
        &self,
        operation_id: &str,
        message: &T,
    ) -> Result<(), ExecutionError> {
        if !wire::is_valid_segment(operation_id.as_bytes()) {
            return Err(ExecutionError::InvalidArgument(format!(
                "operation id must be non-empty and free of reserved bytes: {operation_id:?}"
            )));
        }
        let json = serde_json::to_vec(message)?;

        let connection = lock(&self.shared.connection)
            .clone()
            .ok_or(ExecutionError::NotConnected)?;
        connection
            .send(
                Frame::new(Command::Message)
                    .with_segment(operation_id.to_string())
                    .with_segment(json),
            )
            .map_err(|_| ExecutionError::NotConnected)
    }

    /// Cancellation token for one operation.
    ///
    /// Fires on CANCEL with this id, on a connection-wide CANCEL, and on
    /// disconnect. Ids cancelled before being registered come back cancelled.
    pub fn operation_token(&self, operation_id: &str) -> CancellationToken {
        self.shared.operation_token(operation_id)
    }

    /// Forget a finished operation.
    pub fn finish_operation(&self, operation_id: &str) {
        self.shared.operations.remove(operation_id);
    }

    pub fn is_cancel_requested(&self, operation_id: &str) -> bool {
        self.shared.cancel_all.is_cancelled()
            || self
                .shared
                .operations
                .get(operation_id)
                .is_some_and(|t| t.is_cancelled())
    }

    pub fn is_quit_requested(&self) -> bool {
        self.shared.quit.is_cancelled()
    }

    /// Completes on QUIT or when the runner goes away.
    pub async fn wait_for_quit(&self) {
        let connection = lock(&self.shared.connection).clone();
        match connection {
            Some(connection) => {
                tokio::select! {
                    _ = self.shared.quit.cancelled() => {}
                    _ = connection.closed() => {}
                }
            }
            None => self.shared.quit.cancelled().await,
        }
    }

    pub fn runner_info(&self) -> Option<EngineInfo> {
        lock(&self.shared.runner_info).clone()
    }

    pub fn label(&self) -> &str {
        self.shared.core.label()
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.shared.config
    }

    /// Advisory.
    pub fn state(&self) -> EngineState {
        self.shared.core.state()
    }

    /// Dispose the connection and cancel every outstanding operation.
    pub async fn disconnect(&self) {
        let shared = &self.shared;
        let _teardown = shared.teardown.lock().await;
        let label = shared.core.label();

        {
            let mut state = shared.core.lock_state();
            if state.get().is_terminal() {
                tracing::debug!(%label, "Already disconnected");
                return;
            }
            if let Err(e) = state.transition(EngineState::Disconnected) {
                tracing::error!(%label, error = %e, "Unexpected transition failure on disconnect");
            }
        }
        shared.state_changed.notify_waiters();

        let connection = lock(&shared.connection).take();
        if let Some(connection) = connection {
            connection.dispose().await;
        }
        shared.cancel_all.cancel();

        shared
            .core
            .report(DiagnosticKind::Lifecycle, "disconnected from runner");
    }
}

#[async_trait]
impl Engine for ExecutionEngine {
    fn label(&self) -> &str {
        ExecutionEngine::label(self)
    }

    fn state(&self) -> EngineState {
        ExecutionEngine::state(self)
    }

    async fn disconnect(&self) {
        ExecutionEngine::disconnect(self).await;
    }
}

impl ExecutionShared {
    fn operation_token(&self, operation_id: &str) -> CancellationToken {
        self.operations
            .entry(operation_id.to_string())
            .or_insert_with(|| self.cancel_all.child_token())
            .clone()
    }

    fn on_info(&self, payload: Option<Bytes>) {
        let Some(json) = payload else {
            self.core
                .report(DiagnosticKind::MalformedFrame, "INFO missing JSON");
            return;
        };

        let info: EngineInfo = match serde_json::from_slice(&json) {
            Ok(info) => info,
            Err(e) => {
                self.core.report(
                    DiagnosticKind::MalformedFrame,
                    format!("INFO payload is not valid engine info: {e}"),
                );
                return;
            }
        };
        if info.capability != self.config.capability {
            self.core.report(
                DiagnosticKind::CapabilityMismatch,
                format!(
                    "runner capability {} differs from ours ({})",
                    info.capability, self.config.capability
                ),
            );
        }
        *lock(&self.runner_info) = Some(info);

        let reply = EngineInfo::new(EngineRole::Execution, self.core.label())
            .with_capability(self.config.capability);
        let json = match serde_json::to_vec(&reply) {
            Ok(json) => json,
            Err(e) => {
                self.core.report(
                    DiagnosticKind::MalformedFrame,
                    format!("failed to encode execution INFO: {e}"),
                );
                return;
            }
        };

        let mut state = self.core.lock_state();
        let current = state.get();
        if current != EngineState::Negotiating {
            drop(state);
            self.core.report(
                DiagnosticKind::OutOfOrder,
                format!("INFO received out of order (state: {current})"),
            );
            return;
        }

        let sent = lock(&self.connection)
            .as_ref()
            .is_some_and(|c| c.send(Frame::new(Command::Info).with_segment(json)).is_ok());
        if !sent {
            drop(state);
            self.core
                .report(DiagnosticKind::NotConnected, "cannot send INFO reply");
            return;
        }
        if let Err(e) = state.transition(EngineState::Connected) {
            tracing::error!(label = %self.core.label(), error = %e, "Unexpected transition failure on INFO");
        }
        drop(state);
        self.state_changed.notify_waiters();

        self.core
            .report(DiagnosticKind::Lifecycle, "handshake complete");
    }

    fn on_cancel(&self, payload: Option<Bytes>) {
        match payload {
            None => {
                tracing::info!(label = %self.core.label(), "Runner cancelled all operations");
                self.cancel_all.cancel();
            }
            Some(id) => {
                let operation_id = String::from_utf8_lossy(&id);
                tracing::info!(label = %self.core.label(), %operation_id, "Runner cancelled operation");
                self.operation_token(&operation_id).cancel();
            }
        }
    }

    fn on_quit(&self, _payload: Option<Bytes>) {
        self.core
            .report(DiagnosticKind::Lifecycle, "runner requested quit");
        self.quit.cancel();
    }
}
