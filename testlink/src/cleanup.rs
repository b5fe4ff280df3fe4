//! Ordered, fault-isolated release of acquired resources.
//!
//! Tasks are appended as resources are acquired and run once during
//! teardown, in registration order. A task that returns an error or panics
//! is reported and the remaining tasks still run.

use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::{Mutex, PoisonError};

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::diagnostics::{Diagnostic, DiagnosticKind, DiagnosticSink};

type CleanupAction = Box<dyn FnOnce() -> BoxFuture<'static, io::Result<()>> + Send>;

struct CleanupTask {
    name: String,
    action: CleanupAction,
}

/// Outcome of a teardown pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub ran: usize,
    pub failed: usize,
}

#[derive(Default)]
pub struct CleanupTasks {
    tasks: Mutex<Vec<CleanupTask>>,
}

impl CleanupTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async release step.
    pub fn push<F, Fut>(&self, name: impl Into<String>, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = io::Result<()>> + Send + 'static,
    {
        self.push_task(CleanupTask {
            name: name.into(),
            action: Box::new(move || action().boxed()),
        });
    }

    /// Register a release step that completes immediately.
    pub fn push_sync<F>(&self, name: impl Into<String>, action: F)
    where
        F: FnOnce() -> io::Result<()> + Send + 'static,
    {
        self.push_task(CleanupTask {
            name: name.into(),
            action: Box::new(move || futures::future::ready(action()).boxed()),
        });
    }

    fn push_task(&self, task: CleanupTask) {
        tracing::trace!(task = %task.name, "Registered cleanup task");
        self.lock().push(task);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Run and clear every registered task.
    ///
    /// Calling this again only runs tasks registered since the last call.
    pub async fn run(&self, label: &str, diagnostics: &dyn DiagnosticSink) -> CleanupReport {
        let tasks = std::mem::take(&mut *self.lock());
        let mut report = CleanupReport::default();

        for CleanupTask { name, action } in tasks {
            report.ran += 1;
            tracing::debug!(%label, task = %name, "Running cleanup task");

            let outcome = match std::panic::catch_unwind(AssertUnwindSafe(action)) {
                Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
                Err(panic) => Err(panic),
            };

            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(format!("cleanup task '{name}' failed: {e}")),
                Err(panic) => Some(format!(
                    "cleanup task '{name}' panicked: {}",
                    panic_message(panic.as_ref())
                )),
            };

            if let Some(message) = failure {
                report.failed += 1;
                diagnostics.report(Diagnostic::new(DiagnosticKind::Cleanup, label, message));
            }
        }

        report
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<CleanupTask>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::CollectingDiagnostics;
    use std::sync::Arc;

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) + Clone) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_clone = Arc::clone(&log);
        (log, move |name| log_clone.lock().unwrap().push(name))
    }

    #[tokio::test]
    async fn runs_in_registration_order() {
        let tasks = CleanupTasks::new();
        let (log, record) = recorder();

        for name in ["listener", "socket", "reader"] {
            let record = record.clone();
            tasks.push_sync(name, move || {
                record(name);
                Ok(())
            });
        }

        let diagnostics = CollectingDiagnostics::new();
        let report = tasks.run("test", &diagnostics).await;

        assert_eq!(report, CleanupReport { ran: 3, failed: 0 });
        assert_eq!(*log.lock().unwrap(), vec!["listener", "socket", "reader"]);
        assert!(diagnostics.records().is_empty());
    }

    #[tokio::test]
    async fn failures_do_not_stop_later_tasks() {
        let tasks = CleanupTasks::new();
        let (log, record) = recorder();

        let r = record.clone();
        tasks.push_sync("first", move || {
            r("first");
            Err(io::Error::other("close failed"))
        });
        let r = record.clone();
        tasks.push("second", move || async move {
            r("second");
            let missing: Option<()> = None;
            missing.expect("boom");
            Ok(())
        });
        let r = record.clone();
        tasks.push_sync("third", move || {
            r("third");
            panic!("sync close");
        });
        let r = record.clone();
        tasks.push("fourth", move || async move {
            r("fourth");
            Ok(())
        });

        let diagnostics = CollectingDiagnostics::new();
        let report = tasks.run("test", &diagnostics).await;

        assert_eq!(report, CleanupReport { ran: 4, failed: 3 });
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third", "fourth"]);

        let failures = diagnostics.of_kind(DiagnosticKind::Cleanup);
        assert_eq!(failures.len(), 3);
        assert!(failures[0].message.contains("close failed"));
        assert!(failures[1].message.contains("boom"));
        assert!(failures[2].message.contains("panicked"));
    }

    #[tokio::test]
    async fn tasks_run_at_most_once() {
        let tasks = CleanupTasks::new();
        let (log, record) = recorder();
        tasks.push_sync("only", move || {
            record("only");
            Ok(())
        });

        let diagnostics = CollectingDiagnostics::new();
        tasks.run("test", &diagnostics).await;
        let second = tasks.run("test", &diagnostics).await;

        assert_eq!(second.ran, 0);
        assert!(tasks.is_empty());
        assert_eq!(log.lock().unwrap().len(), 1);
    }
}
