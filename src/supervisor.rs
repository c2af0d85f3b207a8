//! Runs a set of receivers next to the monitors until they all stop.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{
    config::MonitorConfig,
    error::RunError,
    listener::Receiver,
    monitor::{spawn_monitor, ErrorRegistry, ExceptionMonitor, TaskMonitor},
};

/// Starts every receiver and waits for all of them to finish.
///
/// `receivers` must have been created with tokens derived from `shutdown_token`: it is
/// cancelled when a receiver fails or the exception monitor reports sink errors, which
/// stops the remaining receivers. The first receiver failure wins over sink errors.
pub async fn run_receivers(
    receivers: Vec<Receiver>,
    errors: ErrorRegistry,
    monitor: &MonitorConfig,
    shutdown_token: CancellationToken,
) -> Result<(), RunError> {
    let interval = monitor.interval()?;
    let sink_failure = Arc::new(AtomicBool::new(false));
    let monitors = if monitor.enabled {
        let failure_flag = sink_failure.clone();
        let token = shutdown_token.clone();
        vec![
            spawn_monitor(TaskMonitor::new(), interval),
            spawn_monitor(
                ExceptionMonitor::new(errors, monitor.exception_policy, move || {
                    failure_flag.store(true, Ordering::SeqCst);
                    token.cancel();
                }),
                interval,
            ),
        ]
    } else {
        Vec::new()
    };

    let mut tasks = JoinSet::new();
    for receiver in receivers {
        tasks.spawn(async move {
            let name = format!("{} receiver on {}", receiver.protocol(), receiver.address());
            info!("starting {name}");
            let res = receiver.start().await;
            (name, res)
        });
    }

    let mut failure = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((name, Ok(()))) => info!("{name} stopped"),
            Ok((name, Err(source))) => {
                error!("{name} failed: {source}");
                failure.get_or_insert(RunError::Receiver { name, source });
                shutdown_token.cancel();
            }
            Err(e) => {
                error!("receiver task failed: {e}");
                failure.get_or_insert(RunError::Task(e));
                shutdown_token.cancel();
            }
        }
    }

    for monitor in monitors {
        monitor.stop();
        monitor.join().await;
    }

    if let Some(e) = failure {
        return Err(e);
    }
    if sink_failure.load(Ordering::SeqCst) {
        return Err(RunError::SinkFailure);
    }
    info!("all receivers stopped");
    Ok(())
}
