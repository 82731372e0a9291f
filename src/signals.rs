use crate::services::ServiceResult;
use crate::services::manager::ServiceManager;
use crate::utils::fmt_duration;
use std::process::ExitCode;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

/// Supervise the running services until one exits or the process is told
/// to stop, then drain everything within the shutdown grace period.
///
/// Queue producers stop fetching as soon as the shutdown fans out; jobs
/// still running get the remainder of the grace period to finish. Anything
/// left `executing` after that is deliberately abandoned — the lifeline
/// sweep rescues those rows once they age past the threshold.
pub async fn handle_shutdown_signals(
    mut service_manager: ServiceManager,
    shutdown_grace: Duration,
    instance: &str,
) -> ExitCode {
    let mut exit_code = ExitCode::SUCCESS;

    tokio::select! {
        (service_name, result) = service_manager.run() => {
            // A service completed without being asked to
            match result {
                ServiceResult::GracefulShutdown => {
                    info!(service = service_name, "service completed gracefully");
                }
                ServiceResult::NormalCompletion => {
                    warn!(service = service_name, "service completed unexpectedly");
                    exit_code = ExitCode::FAILURE;
                }
                ServiceResult::Error(e) => {
                    error!(service = service_name, error = ?e, "service failed");
                    exit_code = ExitCode::FAILURE;
                }
            }
        }
        reason = shutdown_requested() => {
            info!(
                instance,
                reason,
                grace = fmt_duration(shutdown_grace),
                "shutdown requested, draining queue producers"
            );
        }
    }

    exit_code = drain_services(service_manager, shutdown_grace, exit_code).await;

    info!(instance, exit_code = ?exit_code, "shutdown complete");
    exit_code
}

/// Resolve when the process receives SIGINT or SIGTERM, naming the signal.
async fn shutdown_requested() -> &'static str {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C signal handler");
    };

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm_stream =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM signal handler");
        sigterm_stream.recv().await;
    };

    #[cfg(not(unix))]
    // On non-Unix systems only ctrl+c can interrupt
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "ctrl+c",
        _ = sigterm => "SIGTERM",
    }
}

/// Shut the remaining services down within the grace period.
///
/// A producer that cannot finish its running jobs in time leaves them
/// `executing`; that is expected, not an error state, but the process exits
/// non-zero so orchestrators can tell the drain was cut short.
async fn drain_services(
    mut service_manager: ServiceManager,
    shutdown_grace: Duration,
    current_exit_code: ExitCode,
) -> ExitCode {
    match service_manager.shutdown(shutdown_grace).await {
        Ok(elapsed) => {
            info!(
                remaining = fmt_duration(shutdown_grace.saturating_sub(elapsed)),
                "all services drained"
            );
            current_exit_code
        }
        Err(pending_services) => {
            warn!(
                pending_services = ?pending_services,
                "{} service(s) cut short; outstanding executions will be \
                 rescued by the lifeline",
                pending_services.len()
            );

            if current_exit_code == ExitCode::SUCCESS {
                ExitCode::FAILURE
            } else {
                current_exit_code
            }
        }
    }
}
