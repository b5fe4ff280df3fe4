//! testlink: runner/execution control protocol for out-of-process test runs.

pub mod bridge;
pub mod cleanup;
pub mod connection;
pub mod diagnostics;
pub mod engine;
pub mod execution;
pub mod runner;

pub use bridge::codec::{Frame, FrameCodec, RawFrame};
pub use bridge::protocol::{EngineInfo, EngineRole, ExecutionMessage};
pub use bridge::wire::{Command, PROTOCOL_CAPABILITY};
pub use cleanup::{CleanupReport, CleanupTasks};
pub use connection::{ConnectionClosed, FramedConnection};
pub use diagnostics::{
    CollectingDiagnostics, Diagnostic, DiagnosticKind, DiagnosticSink, TracingDiagnostics,
};
pub use engine::{Engine, EngineState, StateError};
pub use execution::{ExecutionConfig, ExecutionEngine, ExecutionError};
pub use runner::{MessageSink, RunnerConfig, RunnerEngine, RunnerError};
pub use tokio_util::sync::CancellationToken;
