//! Framed connection over a byte stream.
//!
//! Two background tasks per connection:
//! - **reader**: decodes frames and hands each one to the dispatch callback,
//!   strictly in wire order. A panicking callback is reported and the loop
//!   keeps reading.
//! - **writer**: drains a queue of whole frames onto the socket, so concurrent
//!   senders never interleave bytes of different frames
//!
//! The outbound queue is unbounded: `send` never blocks or fails while the
//! connection is open, so frames pile up in memory if the peer stops reading.
//! Disposal waits at most `WRITER_DRAIN_TIMEOUT` for them before aborting the
//! writer and dropping whatever is still queued.
//!
//! Disposal drains the writer, shuts down the write half, stops the reader and
//! drops both halves. It is idempotent and concurrent callers wait for the
//! first one to finish.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::{DEFAULT_MAX_FRAME_LENGTH, Frame, FrameCodec, RawFrame};
use crate::cleanup::panic_message;
use crate::diagnostics::{Diagnostic, DiagnosticKind, DiagnosticSink};

/// How long disposal waits for queued frames to reach the socket.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Invoked once per decoded frame, on the reader task.
pub type DispatchFn = Box<dyn FnMut(RawFrame) + Send>;

#[derive(Debug, Clone, thiserror::Error)]
#[error("connection '{label}' is closed")]
pub struct ConnectionClosed {
    pub label: String,
}

struct Pending {
    reader: BoxedReader,
    writer: BoxedWriter,
    dispatch: DispatchFn,
    outbound_rx: mpsc::UnboundedReceiver<Frame>,
}

struct Tasks {
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

pub struct FramedConnection {
    label: String,
    max_frame_length: usize,
    outbound: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    pending: Mutex<Option<Pending>>,
    tasks: tokio::sync::Mutex<Option<Tasks>>,
    shutdown: CancellationToken,
    closed: CancellationToken,
    diagnostics: Arc<dyn DiagnosticSink>,
}

impl FramedConnection {
    pub fn new<S, F>(
        label: impl Into<String>,
        stream: S,
        dispatch: F,
        diagnostics: Arc<dyn DiagnosticSink>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        F: FnMut(RawFrame) + Send + 'static,
    {
        let (reader, writer): (ReadHalf<S>, WriteHalf<S>) = tokio::io::split(stream);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        Self {
            label: label.into(),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            outbound: Mutex::new(Some(outbound_tx)),
            pending: Mutex::new(Some(Pending {
                reader: Box::new(reader),
                writer: Box::new(writer),
                dispatch: Box::new(dispatch),
                outbound_rx,
            })),
            tasks: tokio::sync::Mutex::new(None),
            shutdown: CancellationToken::new(),
            closed: CancellationToken::new(),
            diagnostics,
        }
    }

    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Spawn the reader and writer tasks. Frames sent earlier are queued.
    pub fn start(&self) {
        let Some(pending) = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            tracing::warn!(label = %self.label, "Connection already started or disposed");
            return;
        };

        let Pending {
            reader,
            writer,
            dispatch,
            outbound_rx,
        } = pending;

        let reader = FramedRead::new(reader, FrameCodec::with_max_length(self.max_frame_length));
        let writer = FramedWrite::new(writer, FrameCodec::with_max_length(self.max_frame_length));

        let reader = tokio::spawn(read_loop(
            self.label.clone(),
            reader,
            dispatch,
            self.shutdown.clone(),
            self.closed.clone(),
            Arc::clone(&self.diagnostics),
        ));
        let writer = tokio::spawn(write_loop(
            self.label.clone(),
            writer,
            outbound_rx,
            Arc::clone(&self.diagnostics),
        ));

        // Fresh connection: nobody else can hold this lock yet.
        match self.tasks.try_lock() {
            Ok(mut tasks) => *tasks = Some(Tasks { reader, writer }),
            Err(_) => {
                tracing::error!(label = %self.label, "Connection tasks busy during start");
                reader.abort();
                writer.abort();
            }
        }

        tracing::debug!(label = %self.label, "Connection started");
    }

    /// Queue one whole frame for writing.
    pub fn send(&self, frame: Frame) -> Result<(), ConnectionClosed> {
        let outbound = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        let closed = || ConnectionClosed {
            label: self.label.clone(),
        };
        let tx = outbound.as_ref().ok_or_else(closed)?;

        tracing::trace!(label = %self.label, command = %frame.command, "Queueing frame");
        tx.send(frame).map_err(|_| closed())
    }

    pub fn is_open(&self) -> bool {
        !self.closed.is_cancelled()
            && self
                .outbound
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .as_ref()
                .is_some_and(|tx| !tx.is_closed())
    }

    /// Completes when the receive loop has ended.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Release the connection. Must not be awaited from a dispatch callback.
    pub async fn dispose(&self) {
        let mut tasks = self.tasks.lock().await;

        // Closing the queue lets the writer drain and shut down the write half.
        drop(
            self.outbound
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );

        if let Some(Tasks { reader, mut writer }) = tasks.take() {
            if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
                .await
                .is_err()
            {
                self.report(
                    DiagnosticKind::Transport,
                    "timed out draining outbound frames, aborting writer",
                );
                writer.abort();
                let _ = writer.await;
            }

            self.shutdown.cancel();
            if let Err(e) = reader.await
                && e.is_panic()
            {
                self.report(DiagnosticKind::Transport, "receive loop panicked");
            }

            tracing::debug!(label = %self.label, "Connection disposed");
        } else if let Some(pending) = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            // Never started: dropping the halves releases the stream.
            drop(pending);
            tracing::debug!(label = %self.label, "Disposed connection that never started");
        }

        self.shutdown.cancel();
        self.closed.cancel();
    }

    fn report(&self, kind: DiagnosticKind, message: impl Into<String>) {
        self.diagnostics
            .report(Diagnostic::new(kind, &self.label, message));
    }
}

impl Drop for FramedConnection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn read_loop(
    label: String,
    mut reader: FramedRead<BoxedReader, FrameCodec>,
    mut dispatch: DispatchFn,
    shutdown: CancellationToken,
    closed: CancellationToken,
    diagnostics: Arc<dyn DiagnosticSink>,
) {
    loop {
        let next = tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,
            next = reader.next() => next,
        };

        match next {
            Some(Ok(frame)) => {
                let command = frame.token_lossy();
                if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| dispatch(frame))) {
                    diagnostics.report(Diagnostic::new(
                        DiagnosticKind::Transport,
                        &label,
                        format!(
                            "handler for {command} panicked: {}",
                            panic_message(panic.as_ref())
                        ),
                    ));
                }
            }
            Some(Err(e)) => {
                diagnostics.report(Diagnostic::new(
                    DiagnosticKind::Transport,
                    &label,
                    format!("receive failed: {e}"),
                ));
                break;
            }
            None => {
                if let Some(len) = reader.decoder_mut().take_dropped_tail() {
                    diagnostics.report(Diagnostic::new(
                        DiagnosticKind::MalformedFrame,
                        &label,
                        format!("dropped unterminated frame at end of stream ({len} bytes)"),
                    ));
                }
                diagnostics.report(Diagnostic::new(
                    DiagnosticKind::Lifecycle,
                    &label,
                    "peer closed the connection",
                ));
                break;
            }
        }
    }

    closed.cancel();
    tracing::debug!(%label, "Receive loop exiting");
}

async fn write_loop(
    label: String,
    mut writer: FramedWrite<BoxedWriter, FrameCodec>,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    diagnostics: Arc<dyn DiagnosticSink>,
) {
    while let Some(frame) = outbound.recv().await {
        let command = frame.command;
        if let Err(e) = writer.send(frame).await {
            diagnostics.report(Diagnostic::new(
                DiagnosticKind::Transport,
                &label,
                format!("failed to send {command}: {e}"),
            ));
            return;
        }
    }

    if let Err(e) = SinkExt::<Frame>::close(&mut writer).await {
        tracing::debug!(%label, error = %e, "Write half shutdown failed");
    }
    tracing::debug!(%label, "Send loop exiting");
}
