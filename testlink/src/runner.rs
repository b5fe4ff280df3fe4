//! Runner side of the protocol.
//!
//! Flow:
//! 1. `start()` binds a loopback listener (backlog 1) and returns its port
//! 2. A background task accepts exactly one peer, then closes the listener
//! 3. Runner sends INFO, state moves to Negotiating
//! 4. Peer INFO moves state to Connected
//! 5. MESSAGE frames are decoded and forwarded to the [`MessageSink`]
//! 6. `disconnect()` sends QUIT (once), disposes the connection and runs the
//!    cleanup tasks registered along the way

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tokio_util::bytes::Bytes;

use crate::bridge::codec::{DEFAULT_MAX_FRAME_LENGTH, Frame};
use crate::bridge::protocol::{EngineInfo, EngineRole, ExecutionMessage};
use crate::bridge::wire::{self, Command, PROTOCOL_CAPABILITY};
use crate::cleanup::CleanupTasks;
use crate::connection::FramedConnection;
use crate::diagnostics::{DiagnosticKind, DiagnosticSink, TracingDiagnostics};
use crate::engine::{CommandRegistry, Engine, EngineCore, EngineState};

/// Consumer of decoded MESSAGE frames.
///
/// Called synchronously from the receive loop, so it must not block.
pub trait MessageSink: Send + Sync {
    /// Returns `false` to ask the peer to stop everything it is running.
    fn on_message(&self, message: ExecutionMessage) -> bool;
}

impl<F> MessageSink for F
where
    F: Fn(ExecutionMessage) -> bool + Send + Sync,
{
    fn on_message(&self, message: ExecutionMessage) -> bool {
        self(message)
    }
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub label: String,
    pub bind_addr: IpAddr,
    pub capability: u32,
    pub max_frame_length: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self::new(format!("runner-{}", uuid::Uuid::new_v4().simple()))
    }
}

impl RunnerConfig {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            capability: PROTOCOL_CAPABILITY,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }

    pub fn with_bind_addr(mut self, addr: IpAddr) -> Self {
        self.bind_addr = addr;
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
}

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("runner '{label}' cannot start from state {state}")]
    AlreadyStarted { label: String, state: EngineState },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("failed to bind listener: {0}")]
    Bind(#[source] io::Error),
    #[error("handshake did not complete within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("runner disconnected before the handshake completed")]
    Disconnected,
    #[error("start() must be called from within a tokio runtime")]
    NoRuntime,
}

/// Runner-side engine. One instance serves exactly one peer.
pub struct RunnerEngine {
    shared: Arc<RunnerShared>,
}

struct RunnerShared {
    core: EngineCore<RunnerShared>,
    config: RunnerConfig,
    sink: Arc<dyn MessageSink>,
    port: OnceLock<u16>,
    connection: Mutex<Option<Arc<FramedConnection>>>,
    cleanup: CleanupTasks,
    accept_task: Mutex<Option<AbortHandle>>,
    execution_info: Mutex<Option<EngineInfo>>,
    cancel_requested: AtomicBool,
    quit_sent: AtomicBool,
    state_changed: Notify,
    teardown: tokio::sync::Mutex<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RunnerEngine {
    pub fn new(config: RunnerConfig, sink: Arc<dyn MessageSink>) -> Self {
        Self::with_diagnostics(config, sink, Arc::new(TracingDiagnostics))
    }

    pub fn with_diagnostics(
        config: RunnerConfig,
        sink: Arc<dyn MessageSink>,
        diagnostics: Arc<dyn DiagnosticSink>,
    ) -> Self {
        let registry = CommandRegistry::new()
            .with_handler(Command::Info, RunnerShared::on_info)
            .with_handler(Command::Message, RunnerShared::on_message);

        Self {
            shared: Arc::new(RunnerShared {
                core: EngineCore::new(config.label.clone(), registry, diagnostics),
                config,
                sink,
                port: OnceLock::new(),
                connection: Mutex::new(None),
                cleanup: CleanupTasks::new(),
                accept_task: Mutex::new(None),
                execution_info: Mutex::new(None),
                cancel_requested: AtomicBool::new(false),
                quit_sent: AtomicBool::new(false),
                state_changed: Notify::new(),
                teardown: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Bind the listener and begin accepting in the background.
    ///
    /// Returns the bound port before any peer connects. Fails with
    /// [`RunnerError::NoRuntime`] outside a tokio runtime.
    pub fn start(&self) -> Result<u16, RunnerError> {
        let shared = &self.shared;
        let label = shared.core.label();
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| RunnerError::NoRuntime)?;

        let port = {
            let mut state = shared.core.lock_state();
            if state.get() != EngineState::Initialized {
                return Err(RunnerError::AlreadyStarted {
                    label: label.to_string(),
                    state: state.get(),
                });
            }

            let listener = bind_listener(shared.config.bind_addr).map_err(RunnerError::Bind)?;
            let port = listener.local_addr().map_err(RunnerError::Bind)?.port();
            let _ = shared.port.set(port);

            let accept = runtime.spawn(accept_one(Arc::downgrade(shared), listener));
            let abort = accept.abort_handle();
            *lock(&shared.accept_task) = Some(abort.clone());
            shared.cleanup.push_sync("listener", move || {
                abort.abort();
                Ok(())
            });

            if let Err(e) = state.transition(EngineState::Listening) {
                tracing::error!(%label, error = %e, "Unexpected transition failure on start");
            }
            port
        };
        shared.state_changed.notify_waiters();

        shared.core.report(
            DiagnosticKind::Lifecycle,
            format!("listening on {}:{port}", shared.config.bind_addr),
        );
        Ok(port)
    }

    /// Wait until the peer's INFO has been accepted.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), RunnerError> {
        let wait = async {
            loop {
                let changed = self.shared.state_changed.notified();
                match self.state() {
                    EngineState::Connected => return Ok(()),
                    EngineState::Disconnected => return Err(RunnerError::Disconnected),
                    _ => changed.await,
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| RunnerError::HandshakeTimeout(timeout))?
    }

    /// Completes once the accepted peer has gone away or the runner is disconnected.
    pub async fn closed(&self) {
        loop {
            let changed = self.shared.state_changed.notified();
            if self.state().is_terminal() {
                return;
            }
            match self.shared.connection() {
                Some(connection) => return connection.closed().await,
                None => changed.await,
            }
        }
    }

    /// Ask the peer to cancel one operation.
    pub fn send_cancel(&self, operation_id: &str) -> Result<(), RunnerError> {
        if !wire::is_valid_segment(operation_id.as_bytes()) {
            return Err(RunnerError::InvalidArgument(format!(
                "operation id must be non-empty and free of reserved bytes: {operation_id:?}"
            )));
        }

        let frame = Frame::new(Command::Cancel).with_segment(operation_id.to_string());
        if self.shared.send_frame(frame) {
            tracing::debug!(label = %self.label(), %operation_id, "Sent CANCEL");
        }
        Ok(())
    }

    /// Tell the peer to shut down. Sends QUIT at most once per connection.
    pub fn send_quit(&self) {
        let shared = &self.shared;
        let Some(connection) = shared.connection() else {
            shared.core.report(
                DiagnosticKind::NotConnected,
                "cannot send QUIT: no connection",
            );
            return;
        };

        if shared.quit_sent.swap(true, Ordering::AcqRel) {
            tracing::debug!(label = %self.label(), "QUIT already sent");
            return;
        }
        shared.send_on(&connection, Frame::new(Command::Quit));
    }

    /// Send QUIT if needed, dispose the connection and run cleanup tasks.
    ///
    /// Idempotent; concurrent callers wait for the first teardown.
    pub async fn disconnect(&self) {
        self.shared.disconnect().await;
    }

    pub fn label(&self) -> &str {
        self.shared.core.label()
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.shared.config
    }

    /// Advisory.
    pub fn state(&self) -> EngineState {
        self.shared.core.state()
    }

    pub fn port(&self) -> Option<u16> {
        self.shared.port.get().copied()
    }

    /// The peer's handshake record, once received.
    pub fn execution_info(&self) -> Option<EngineInfo> {
        lock(&self.shared.execution_info).clone()
    }

    /// Lower of our capability and the peer's, once the peer has announced one.
    pub fn negotiated_capability(&self) -> Option<u32> {
        lock(&self.shared.execution_info)
            .as_ref()
            .map(|info| info.capability.min(self.shared.config.capability))
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.shared.cancel_requested.load(Ordering::Acquire)
    }

    pub fn is_quit_sent(&self) -> bool {
        self.shared.quit_sent.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Engine for RunnerEngine {
    fn label(&self) -> &str {
        RunnerEngine::label(self)
    }

    fn state(&self) -> EngineState {
        RunnerEngine::state(self)
    }

    async fn disconnect(&self) {
        RunnerEngine::disconnect(self).await;
    }
}

fn bind_listener(ip: IpAddr) -> io::Result<TcpListener> {
    let socket = match ip {
        IpAddr::V4(_) => TcpSocket::new_v4()?,
        IpAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.bind(SocketAddr::new(ip, 0))?;
    socket.listen(1)
}

async fn accept_one(shared: Weak<RunnerShared>, listener: TcpListener) {
    let accepted = listener.accept().await;
    // One engine, one peer.
    drop(listener);

    let Some(shared) = shared.upgrade() else {
        return;
    };
    match accepted {
        Ok((stream, peer)) => shared.on_accepted(stream, peer),
        Err(e) => shared
            .core
            .report(DiagnosticKind::Transport, format!("accept failed: {e}")),
    }
}

impl RunnerShared {
    fn connection(&self) -> Option<Arc<FramedConnection>> {
        lock(&self.connection).clone()
    }

    fn on_accepted(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let label = self.core.label();
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%label, error = %e, "Failed to set TCP_NODELAY");
        }

        let weak = Arc::downgrade(self);
        let connection = Arc::new(
            FramedConnection::new(
                label,
                stream,
                move |frame| {
                    if let Some(shared) = weak.upgrade() {
                        shared.core.dispatch(&shared, frame);
                    }
                },
                Arc::clone(self.core.diagnostics()),
            )
            .with_max_frame_length(self.config.max_frame_length),
        );

        {
            let mut state = self.core.lock_state();
            if state.get() != EngineState::Listening {
                drop(state);
                self.core.report(
                    DiagnosticKind::Lifecycle,
                    format!("dropping connection from {peer}: runner already torn down"),
                );
                return;
            }

            let conn = Arc::clone(&connection);
            self.cleanup.push("accepted socket", move || async move {
                conn.dispose().await;
                Ok(())
            });
            *lock(&self.connection) = Some(Arc::clone(&connection));
            connection.start();

            if let Err(e) = state.transition(EngineState::Negotiating) {
                tracing::error!(%label, error = %e, "Unexpected transition failure on accept");
            }
        }
        self.state_changed.notify_waiters();

        self.core.report(
            DiagnosticKind::Lifecycle,
            format!("accepted connection from {peer}"),
        );

        let info = EngineInfo::new(EngineRole::Runner, label).with_capability(self.config.capability);
        match serde_json::to_vec(&info) {
            Ok(json) => {
                self.send_on(&connection, Frame::new(Command::Info).with_segment(json));
            }
            Err(e) => self.core.report(
                DiagnosticKind::MalformedFrame,
                format!("failed to encode runner INFO: {e}"),
            ),
        }
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
                    "peer capability {} differs from ours ({}), using {}",
                    info.capability,
                    self.config.capability,
                    info.capability.min(self.config.capability)
                ),
            );
        }
        let capability = info.capability;
        *lock(&self.execution_info) = Some(info);

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
        if let Err(e) = state.transition(EngineState::Connected) {
            tracing::error!(label = %self.core.label(), error = %e, "Unexpected transition failure on INFO");
        }
        drop(state);
        self.state_changed.notify_waiters();

        self.core.report(
            DiagnosticKind::Lifecycle,
            format!("connected to execution engine (capability {capability})"),
        );
    }

    fn on_message(&self, payload: Option<Bytes>) {
        let Some(payload) = payload else {
            self.core.report(
                DiagnosticKind::MalformedFrame,
                "MESSAGE missing operation ID and JSON",
            );
            return;
        };

        let (operation_id, json) = wire::split_on_separator(&payload);
        let Some(json) = json.filter(|j| !j.is_empty()) else {
            self.core
                .report(DiagnosticKind::MalformedFrame, "MESSAGE missing JSON");
            return;
        };
        let operation_id = String::from_utf8_lossy(operation_id).into_owned();

        let state = self.core.state();
        if state != EngineState::Connected {
            self.core.report(
                DiagnosticKind::OutOfOrder,
                format!("MESSAGE received out of order (state: {state}, operation: {operation_id})"),
            );
        }

        let message = match serde_json::from_slice(json) {
            Ok(message) => message,
            Err(e) => {
                self.core.report(
                    DiagnosticKind::MalformedFrame,
                    format!("MESSAGE for operation {operation_id} has invalid JSON: {e}"),
                );
                return;
            }
        };

        let keep_running = self.sink.on_message(ExecutionMessage {
            operation_id,
            message,
        });

        if !keep_running
            && self
                .cancel_requested
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            tracing::info!(label = %self.core.label(), "Message sink requested cancellation");
            self.send_frame(Frame::new(Command::Cancel));
        }
    }

    /// Send on the current connection, reporting when there is none.
    fn send_frame(&self, frame: Frame) -> bool {
        match self.connection() {
            Some(connection) => self.send_on(&connection, frame),
            None => {
                self.core.report(
                    DiagnosticKind::NotConnected,
                    format!("cannot send {}: no connection", frame.command),
                );
                false
            }
        }
    }

    fn send_on(&self, connection: &FramedConnection, frame: Frame) -> bool {
        let command = frame.command;
        match connection.send(frame) {
            Ok(()) => true,
            Err(e) => {
                self.core.report(
                    DiagnosticKind::NotConnected,
                    format!("cannot send {command}: {e}"),
                );
                false
            }
        }
    }

    async fn disconnect(&self) {
        let _teardown = self.teardown.lock().await;
        let label = self.core.label();

        {
            let mut state = self.core.lock_state();
            if state.get().is_terminal() {
                tracing::debug!(%label, "Already disconnected");
                return;
            }
            if let Err(e) = state.transition(EngineState::Disconnected) {
                tracing::error!(%label, error = %e, "Unexpected transition failure on disconnect");
            }
        }
        self.state_changed.notify_waiters();

        let connection = lock(&self.connection).take();
        if let Some(connection) = connection {
            if !self.quit_sent.swap(true, Ordering::AcqRel) {
                self.send_on(&connection, Frame::new(Command::Quit));
            }
            connection.dispose().await;
        }

        let report = self.cleanup.run(label, self.core.diagnostics().as_ref()).await;
        lock(&self.accept_task).take();

        self.core.report(
            DiagnosticKind::Lifecycle,
            format!(
                "disconnected ({} cleanup tasks, {} failed)",
                report.ran, report.failed
            ),
        );
    }
}

impl Drop for RunnerShared {
    fn drop(&mut self) {
        if let Some(accept) = lock(&self.accept_task).take() {
            accept.abort();
        }
        if !self.core.state().is_terminal() {
            tracing::warn!(
                label = %self.core.label(),
                "Runner dropped without disconnect; remaining resources released on drop"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::CollectingDiagnostics;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, DuplexStream};

    struct CountingSink {
        calls: AtomicUsize,
        keep_running: bool,
    }

    impl MessageSink for CountingSink {
        fn on_message(&self, _message: ExecutionMessage) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.keep_running
        }
    }

    fn runner(keep_running: bool) -> (RunnerEngine, Arc<CountingSink>, Arc<CollectingDiagnostics>) {
        let sink = Arc::new(CountingSink {
            calls: AtomicUsize::new(0),
            keep_running,
        });
        let diagnostics = Arc::new(CollectingDiagnostics::new());
        let engine = RunnerEngine::with_diagnostics(
            RunnerConfig::new("runner-test"),
            sink.clone(),
            diagnostics.clone(),
        );
        (engine, sink, diagnostics)
    }

    /// Install a duplex-backed connection and walk the state to `target`.
    fn attach(engine: &RunnerEngine, target: EngineState) -> DuplexStream {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let shared = &engine.shared;
        let connection = Arc::new(FramedConnection::new(
            "runner-test",
            local,
            |_| {},
            Arc::clone(shared.core.diagnostics()),
        ));
        connection.start();
        *lock(&shared.connection) = Some(connection);

        let mut state = shared.core.lock_state();
        for next in [
            EngineState::Listening,
            EngineState::Negotiating,
            EngineState::Connected,
        ] {
            if next > target {
                break;
            }
            state.transition(next).unwrap();
        }
        remote
    }

    async fn wire_output(engine: &RunnerEngine, mut remote: DuplexStream) -> String {
        engine.disconnect().await;
        let mut out = String::new();
        remote.read_to_string(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn start_twice_is_a_precondition_violation() {
        let (engine, _, _) = runner(true);
        let port = engine.start().unwrap();
        assert_ne!(port, 0);
        assert_eq!(engine.port(), Some(port));
        assert_eq!(engine.state(), EngineState::Listening);

        let err = engine.start().unwrap_err();
        assert!(matches!(
            err,
            RunnerError::AlreadyStarted {
                state: EngineState::Listening,
                ..
            }
        ));
        engine.disconnect().await;
    }

    #[test]
    fn start_outside_runtime_is_an_error() {
        let (engine, _, _) = runner(true);

        assert!(matches!(engine.start(), Err(RunnerError::NoRuntime)));
        assert_eq!(engine.state(), EngineState::Initialized);
        assert_eq!(engine.port(), None);
    }

    #[tokio::test]
    async fn start_after_disconnect_is_rejected() {
        let (engine, _, _) = runner(true);
        engine.disconnect().await;
        assert!(matches!(
            engine.start(),
            Err(RunnerError::AlreadyStarted {
                state: EngineState::Disconnected,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn commands_without_connection_are_diagnosed_no_ops() {
        let (engine, _, diagnostics) = runner(true);

        engine.send_quit();
        engine.send_cancel("op-1").unwrap();

        assert!(!engine.is_quit_sent());
        assert_eq!(diagnostics.of_kind(DiagnosticKind::NotConnected).len(), 2);
    }

    #[tokio::test]
    async fn cancel_rejects_bad_operation_ids() {
        let (engine, _, _) = runner(true);
        for bad in ["", "op 1", "op\n1"] {
            assert!(matches!(
                engine.send_cancel(bad),
                Err(RunnerError::InvalidArgument(_))
            ));
        }
    }

    #[tokio::test]
    async fn cancel_carries_operation_id() {
        let (engine, _, _) = runner(true);
        let remote = attach(&engine, EngineState::Connected);

        engine.send_cancel("op-7").unwrap();

        assert_eq!(wire_output(&engine, remote).await, "CANCEL op-7\nQUIT\n");
    }

    #[tokio::test]
    async fn quit_is_sent_once() {
        let (engine, _, _) = runner(true);
        let remote = attach(&engine, EngineState::Connected);

        engine.send_quit();
        engine.send_quit();

        assert!(engine.is_quit_sent());
        // Teardown must not add a second QUIT either.
        assert_eq!(wire_output(&engine, remote).await, "QUIT\n");
    }

    #[tokio::test]
    async fn disconnect_twice_sends_nothing_more() {
        let (engine, _, diagnostics) = runner(true);
        let remote = attach(&engine, EngineState::Connected);

        engine.disconnect().await;
        engine.disconnect().await;

        assert_eq!(engine.state(), EngineState::Disconnected);
        assert_eq!(wire_output(&engine, remote).await, "QUIT\n");
        assert!(diagnostics.of_kind(DiagnosticKind::Cleanup).is_empty());
    }

    #[tokio::test]
    async fn info_moves_negotiating_to_connected() {
        let (engine, _, diagnostics) = runner(true);
        let _remote = attach(&engine, EngineState::Negotiating);

        engine
            .shared
            .on_info(Some(Bytes::from_static(br#"{"capability":1,"role":"execution"}"#)));

        assert_eq!(engine.state(), EngineState::Connected);
        let info = engine.execution_info().unwrap();
        assert_eq!(info.capability, 1);
        assert_eq!(info.role, Some(EngineRole::Execution));
        assert_eq!(engine.negotiated_capability(), Some(1));
        assert!(diagnostics.of_kind(DiagnosticKind::OutOfOrder).is_empty());
        engine.disconnect().await;
    }

    #[tokio::test]
    async fn info_out_of_order_leaves_state_alone() {
        let (engine, _, diagnostics) = runner(true);
        let _remote = attach(&engine, EngineState::Connected);

        engine
            .shared
            .on_info(Some(Bytes::from_static(br#"{"capability":1}"#)));

        assert_eq!(engine.state(), EngineState::Connected);
        assert!(diagnostics.contains("INFO received out of order"));
        engine.disconnect().await;
    }

    #[tokio::test]
    async fn malformed_info_is_dropped() {
        let (engine, _, diagnostics) = runner(true);
        let _remote = attach(&engine, EngineState::Negotiating);

        engine.shared.on_info(None);
        engine.shared.on_info(Some(Bytes::from_static(b"not json")));

        assert_eq!(engine.state(), EngineState::Negotiating);
        assert!(engine.execution_info().is_none());
        assert!(diagnostics.contains("INFO missing JSON"));
        assert_eq!(diagnostics.of_kind(DiagnosticKind::MalformedFrame).len(), 2);
        engine.disconnect().await;
    }

    #[tokio::test]
    async fn capability_mismatch_is_advisory() {
        let (engine, _, diagnostics) = runner(true);
        let _remote = attach(&engine, EngineState::Negotiating);

        engine
            .shared
            .on_info(Some(Bytes::from_static(br#"{"capability":3}"#)));

        assert_eq!(engine.state(), EngineState::Connected);
        assert_eq!(engine.negotiated_capability(), Some(PROTOCOL_CAPABILITY));
        assert_eq!(diagnostics.of_kind(DiagnosticKind::CapabilityMismatch).len(), 1);
        engine.disconnect().await;
    }

    #[tokio::test]
    async fn message_payload_problems_skip_the_sink() {
        let (engine, sink, diagnostics) = runner(true);
        let _remote = attach(&engine, EngineState::Connected);

        engine.shared.on_message(None);
        engine.shared.on_message(Some(Bytes::from_static(b"op-1")));
        engine.shared.on_message(Some(Bytes::from_static(b"op-1 ")));
        engine.shared.on_message(Some(Bytes::from_static(b"op-1 {broken")));

        assert_eq!(sink.calls.load(Ordering::SeqCst), 0);
        assert!(diagnostics.contains("MESSAGE missing operation ID and JSON"));
        assert_eq!(
            diagnostics
                .records()
                .iter()
                .filter(|d| d.message == "MESSAGE missing JSON")
                .count(),
            2
        );
        assert!(diagnostics.contains("invalid JSON"));
        engine.disconnect().await;
    }

    #[tokio::test]
    async fn racing_refusals_send_one_cancel() {
        let (engine, sink, _) = runner(false);
        let remote = attach(&engine, EngineState::Connected);

        let shared = Arc::clone(&engine.shared);
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || {
                    let payload = format!("op-{i} {{\"type\":\"result\",\"passed\":false}}");
                    shared.on_message(Some(Bytes::from(payload)));
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(sink.calls.load(Ordering::SeqCst), 8);
        assert!(engine.is_cancel_requested());
        assert_eq!(wire_output(&engine, remote).await, "CANCEL\nQUIT\n");
    }

    #[tokio::test]
    async fn wait_connected_times_out_without_peer() {
        let (engine, _, _) = runner(true);
        engine.start().unwrap();

        let err = engine
            .wait_connected(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::HandshakeTimeout(_)));
        engine.disconnect().await;
    }

    #[tokio::test]
    async fn disconnect_before_start_is_safe() {
        let (engine, _, diagnostics) = runner(true);
        engine.disconnect().await;
        assert_eq!(engine.state(), EngineState::Disconnected);
        assert!(diagnostics.contains("disconnected (0 cleanup tasks, 0 failed)"));
    }
}
