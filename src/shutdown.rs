use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Exit status used when a second signal interrupts a graceful shutdown.
const FORCED_EXIT_CODE: i32 = 130;

/// Install a handler for SIGTERM and SIGINT.
///
/// The first signal cancels the returned token: the node stops its loops,
/// releases leadership and announces its departure. A second signal while
/// that is in progress exits the process immediately.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

        let name = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
        };
        tracing::info!(signal = name, "Shutdown requested, stopping node");
        trigger.cancel();

        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
        tracing::warn!("Second signal received, exiting without cleanup");
        std::process::exit(FORCED_EXIT_CODE);
    });

    token
}
