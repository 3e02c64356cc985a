//! Shutdown signalling for background loops.

use tokio::sync::watch;

/// Resolve once `true` has been sent on the shutdown channel, or the sender
/// is gone.
///
/// The borrowed value is dropped before returning, so the future can sit in a
/// `select!` next to arms that await while the task must stay `Send`.
pub async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
