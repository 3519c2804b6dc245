use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Cancel `shutdown` on the first SIGTERM or SIGINT
///
/// Returns the join handle of the signal task. The task also exits when
/// the token is cancelled from elsewhere.
#[cfg(unix)]
pub fn setup_signal_handlers(shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to setup signal handlers, falling back to Ctrl+C: {}", e);
                wait_ctrl_c(shutdown).await;
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, initiating graceful shutdown");
                shutdown.cancel();
            }
            _ = sigint.recv() => {
                info!("SIGINT received, initiating graceful shutdown");
                shutdown.cancel();
            }
            _ = shutdown.cancelled() => {}
        }
    })
}

#[cfg(not(unix))]
pub fn setup_signal_handlers(shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(wait_ctrl_c(shutdown))
}

async fn wait_ctrl_c(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => {
                info!("Ctrl+C received, initiating graceful shutdown");
                shutdown.cancel();
            }
            Err(e) => {
                error!("Failed to listen for Ctrl+C: {}", e);
                shutdown.cancelled().await;
            }
        },
        _ = shutdown.cancelled() => {}
    }
}
