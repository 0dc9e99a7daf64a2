//! Ctrl+C handling for the binaries
//!
//! A broadcast channel fans the signal out to whoever needs it; the
//! acquisition core itself runs on plain threads and is stopped by the
//! binary once the signal arrives.

use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info};

pub type ShutdownSignal = ();

pub type ShutdownSender = broadcast::Sender<ShutdownSignal>;

pub type ShutdownReceiver = broadcast::Receiver<ShutdownSignal>;

/// Spawn a task that broadcasts once Ctrl+C is pressed
///
/// Keep the sender around to trigger shutdown from elsewhere (for example
/// when a fixed acquisition duration elapses).
///
/// # Example
/// ```ignore
/// let (_tx, mut rx) = setup_shutdown();
/// let _ = rx.recv().await;
/// acquisition.stop()?;
/// ```
pub fn setup_shutdown() -> (ShutdownSender, ShutdownReceiver) {
    let (tx, rx) = broadcast::channel::<ShutdownSignal>(1);

    let signal_tx = tx.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl+C received, stopping acquisition");
                let _ = signal_tx.send(());
            }
            Err(e) => error!(error = %e, "Failed to listen for Ctrl+C"),
        }
    });

    (tx, rx)
}
