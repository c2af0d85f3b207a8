//! Background watchers that run an operation at a fixed interval.

use std::{
    collections::HashMap,
    ops::ControlFlow,
    str::FromStr,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use serde::Deserialize;
use tokio::{runtime::Handle, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::{ConfigError, SinkError, SinkErrorKind};

/// Last error seen per kind, shared between packet handlers and the exception monitor.
#[derive(Debug, Clone, Default)]
pub struct ErrorRegistry {
    errors: Arc<Mutex<HashMap<SinkErrorKind, SinkError>>>,
}

impl ErrorRegistry {
    pub fn record(&self, err: SinkError) {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(err.kind, err);
    }

    pub fn snapshot(&self) -> Vec<SinkError> {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}

pub trait Monitor: Send + 'static {
    fn name(&self) -> &'static str;

    /// Runs once per interval. `Break` stops the monitor.
    fn operation(&mut self) -> ControlFlow<()>;
}

pub struct MonitorHandle {
    stop_token: CancellationToken,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Asks the monitor to stop; it exits at its next wake-up at the latest.
    pub fn stop(&self) {
        self.stop_token.cancel();
    }

    pub async fn join(self) {
        if let Err(e) = self.task.await {
            error!("monitor task failed: {e}");
        }
    }
}

pub fn spawn_monitor<M: Monitor>(mut monitor: M, interval: Duration) -> MonitorHandle {
    let stop_token = CancellationToken::new();
    let token = stop_token.clone();
    let task = tokio::task::spawn(async move {
        info!("{} started, checking every {interval:?}", monitor.name());
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    if monitor.operation().is_break() {
                        break;
                    }
                }
            }
        }
        info!("{} stopped", monitor.name());
    });

    MonitorHandle { stop_token, task }
}

/// Logs how many tasks the runtime is driving.
pub struct TaskMonitor {
    runtime: Handle,
}

impl TaskMonitor {
    pub fn new() -> Self {
        TaskMonitor {
            runtime: Handle::current(),
        }
    }
}

impl Default for TaskMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Monitor for TaskMonitor {
    fn name(&self) -> &'static str {
        "task monitor"
    }

    fn operation(&mut self) -> ControlFlow<()> {
        let metrics = self.runtime.metrics();
        info!(
            "number of alive tasks: {} on {} workers",
            metrics.num_alive_tasks(),
            metrics.num_workers()
        );
        ControlFlow::Continue(())
    }
}

/// Which recorded sink errors make the exception monitor shut everything down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum ExceptionPolicy {
    #[default]
    Any,
    Fatal,
}

impl FromStr for ExceptionPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "any" => Ok(ExceptionPolicy::Any),
            "fatal" => Ok(ExceptionPolicy::Fatal),
            _ => Err(ConfigError::invalid(
                "exception_policy",
                format!("'{s}' (expected one of: any, fatal)"),
            )),
        }
    }
}

impl TryFrom<String> for ExceptionPolicy {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Calls the shutdown callback once sink errors show up in the registry.
pub struct ExceptionMonitor {
    errors: ErrorRegistry,
    policy: ExceptionPolicy,
    shutdown: Option<Box<dyn FnOnce() + Send>>,
}

impl ExceptionMonitor {
    pub fn new(
        errors: ErrorRegistry,
        policy: ExceptionPolicy,
        shutdown: impl FnOnce() + Send + 'static,
    ) -> Self {
        ExceptionMonitor {
            errors,
            policy,
            shutdown: Some(Box::new(shutdown)),
        }
    }
}

impl Monitor for ExceptionMonitor {
    fn name(&self) -> &'static str {
        "exception monitor"
    }

    fn operation(&mut self) -> ControlFlow<()> {
        let found: Vec<SinkError> = self
            .errors
            .snapshot()
            .into_iter()
            .filter(|e| self.policy == ExceptionPolicy::Any || e.is_fatal())
            .collect();

        if found.is_empty() {
            return ControlFlow::Continue(());
        }

        for e in &found {
            error!("sink error detected: {e}");
        }
        error!("shutting down after {} sink error kinds", found.len());
        if let Some(shutdown) = self.shutdown.take() {
            shutdown();
        }
        ControlFlow::Break(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use rstest::rstest;

    use super::*;

    fn counting_monitor(
        errors: &ErrorRegistry,
        policy: ExceptionPolicy,
    ) -> (ExceptionMonitor, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let monitor = ExceptionMonitor::new(errors.clone(), policy, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (monitor, calls)
    }

    #[test]
    fn test_registry_keeps_last_error_per_kind() {
        let registry = ErrorRegistry::default();
        assert!(registry.is_empty());

        registry.record(SinkError::new("a", SinkErrorKind::Unavailable, "first"));
        registry.record(SinkError::new("a", SinkErrorKind::Unavailable, "second"));
        registry.record(SinkError::new("b", SinkErrorKind::Io, "broken pipe"));

        let mut snapshot = registry.snapshot();
        snapshot.sort_by_key(|e| e.sink.clone());
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].message, "second");
    }

    #[test]
    fn test_exception_monitor_shuts_down_once() {
        let errors = ErrorRegistry::default();
        let (mut monitor, calls) = counting_monitor(&errors, ExceptionPolicy::Any);

        assert!(monitor.operation().is_continue());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        errors.record(SinkError::new("http", SinkErrorKind::Unavailable, "queue full"));
        assert!(monitor.operation().is_break());
        assert!(monitor.operation().is_break());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[rstest]
    #[case::transient(SinkErrorKind::Unavailable, false)]
    #[case::permission(SinkErrorKind::PermissionDenied, true)]
    fn test_fatal_policy(#[case] kind: SinkErrorKind, #[case] triggers: bool) {
        let errors = ErrorRegistry::default();
        let (mut monitor, calls) = counting_monitor(&errors, ExceptionPolicy::Fatal);

        errors.record(SinkError::new("http", kind, "boom"));
        assert_eq!(monitor.operation().is_break(), triggers);
        assert_eq!(calls.load(Ordering::SeqCst), usize::from(triggers));
    }

    struct Counter(Arc<AtomicUsize>);

    impl Monitor for Counter {
        fn name(&self) -> &'static str {
            "counter"
        }

        fn operation(&mut self) -> ControlFlow<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            ControlFlow::Continue(())
        }
    }

    #[tokio::test]
    async fn test_monitor_runs_until_stopped() {
        let runs = Arc::new(AtomicUsize::new(0));
        let handle = spawn_monitor(Counter(runs.clone()), Duration::from_millis(5));

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.stop();
        tokio::time::timeout(Duration::from_secs(1), handle.join())
            .await
            .unwrap();

        assert!(runs.load(Ordering::SeqCst) > 0);
    }

    #[tokio::test]
    async fn test_exception_monitor_task_stops_itself() {
        let errors = ErrorRegistry::default();
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let handle = spawn_monitor(
            ExceptionMonitor::new(errors.clone(), ExceptionPolicy::Any, move || token.cancel()),
            Duration::from_millis(5),
        );

        errors.record(SinkError::new("stdout", SinkErrorKind::Io, "closed"));
        tokio::time::timeout(Duration::from_secs(1), shutdown.cancelled())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle.join())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_task_monitor_logs() {
        let mut monitor = TaskMonitor::new();
        assert!(monitor.operation().is_continue());
    }
}
