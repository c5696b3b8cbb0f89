//! Shutdown signal handling

use anyhow::Result;
use tokio_util::sync::CancellationToken;

/// Cancel `token` on SIGTERM or SIGINT
#[cfg(unix)]
pub fn cancel_on_shutdown(token: CancellationToken) -> Result<()> {
    use anyhow::Context;
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT");
            }
            _ = token.cancelled() => return,
        }
        token.cancel();
    });

    Ok(())
}

#[cfg(not(unix))]
pub fn cancel_on_shutdown(token: CancellationToken) -> Result<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl-C");
            }
            _ = token.cancelled() => return,
        }
        token.cancel();
    });

    Ok(())
}
