use console::Term;
use tally::StopHandle;

/// Exit code for a forced quit (128 + SIGINT).
const FORCE_QUIT_EXIT_CODE: i32 = 130;

/// First Ctrl+C asks the pipeline to drain; a second one exits immediately.
pub(crate) fn setup_shutdown_handler(stop: StopHandle) {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            return;
        }

        let is_tty = Term::stderr().is_term();
        if is_tty {
            eprintln!("\n\nStop requested, flushing pending records...");
            eprintln!("Press Ctrl+C again to force quit.");
        } else {
            tracing::warn!("Stop requested, flushing pending records");
        }

        stop.stop();

        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }

        if is_tty {
            eprintln!("Force quit!");
        } else {
            tracing::warn!("Force quit, pending records are lost");
        }
        std::process::exit(FORCE_QUIT_EXIT_CODE);
    });
}
