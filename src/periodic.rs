// Periodic task lifecycle: run, sleep for the current period, stop on shutdown.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Spawn a loop that runs `tick` immediately and then every `period()`.
/// `period` is re-read after each tick so interval changes apply without restart.
/// The loop ends when `shutdown` flips to true (or its sender is dropped); a tick in
/// progress is allowed to finish.
pub fn spawn_periodic<P, F, Fut>(
    name: &'static str,
    period: P,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    P: Fn() -> Duration + Send + 'static,
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let span = tracing::span!(tracing::Level::DEBUG, "periodic", task = name);
    tokio::spawn(
        async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                tick().await;
                tokio::select! {
                    _ = tokio::time::sleep(period()) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("{} shutting down", name);
        }
        .instrument(span),
    )
}
