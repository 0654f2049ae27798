use tokio_util::sync::CancellationToken;

/// Two-stage ctrl-c handling: the first cancels the running experiment so
/// every realization is killed and aborted cleanly; the second exits the
/// process immediately.
pub fn spawn_ctrl_c_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        eprintln!(
            "Cancellation requested — killing running realizations \
             (press CTRL+C again to exit immediately)."
        );
        cancel.cancel();

        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        eprintln!("Exiting immediately.");
        std::process::exit(130);
    });
}
