//! Process-wide cancellation driven by SIGINT/SIGTERM.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

async fn terminate() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    }
    #[cfg(not(unix))]
    std::future::pending::<()>().await;
}

/// Returns a token that is cancelled on the first shutdown signal.
pub fn install() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!(error = %e, "Failed to listen for ctrl-c");
                    terminate().await;
                }
            }
            _ = terminate() => {}
        }
        info!("Shutdown signal received");
        token.cancel();
    });
    cancel
}
