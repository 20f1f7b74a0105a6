//! Unified shutdown handling for Digilynx components
//!
//! # Design Principles (KISS)
//! - Single function to setup Ctrl+C handler with broadcast channel
//! - Returns (sender, receiver) for component use
//! - Blocking loops observe the same signal through an `AtomicBool`

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shutdown signal type (unit type, just signals "shutdown now")
pub type ShutdownSignal = ();

/// Shutdown channel sender
pub type ShutdownSender = broadcast::Sender<ShutdownSignal>;

/// Shutdown channel receiver
pub type ShutdownReceiver = broadcast::Receiver<ShutdownSignal>;

/// Setup shutdown handling with Ctrl+C signal
///
/// Creates a broadcast channel and spawns a task that sends on Ctrl+C.
/// Returns (sender, receiver) - caller uses receiver for their component,
/// and can clone sender if needed for additional shutdown triggers.
///
/// # Example
/// ```ignore
/// let (_shutdown_tx, shutdown_rx) = setup_shutdown();
/// component.run(shutdown_rx).await?;
/// ```
pub fn setup_shutdown() -> (ShutdownSender, ShutdownReceiver) {
    let (tx, rx) = broadcast::channel::<ShutdownSignal>(1);

    let tx_clone = tx.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => info!("Ctrl+C received, initiating shutdown"),
            Err(e) => error!(error = %e, "Failed to listen for Ctrl+C, shutting down"),
        }
        let _ = tx_clone.send(());
    });

    (tx, rx)
}

/// Raise `flag` when the shutdown signal arrives
///
/// Blocking loops (UDP receive, packet generation) cannot await the
/// broadcast receiver and poll the flag between iterations instead. A
/// dropped sender counts as shutdown.
pub fn forward_to_flag(mut rx: ShutdownReceiver, flag: Arc<AtomicBool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let _ = rx.recv().await;
        flag.store(true, Ordering::SeqCst);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_channel_creation() {
        let (tx, mut rx) = broadcast::channel::<ShutdownSignal>(1);

        tx.send(()).unwrap();

        let result = rx.recv().await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_forward_to_flag() {
        let (tx, rx) = broadcast::channel::<ShutdownSignal>(1);
        let flag = Arc::new(AtomicBool::new(false));

        let handle = forward_to_flag(rx, flag.clone());
        assert!(!flag.load(Ordering::SeqCst));

        tx.send(()).unwrap();
        handle.await.unwrap();
        assert!(flag.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_forward_to_flag_on_dropped_sender() {
        let (tx, rx) = broadcast::channel::<ShutdownSignal>(1);
        let flag = Arc::new(AtomicBool::new(false));

        let handle = forward_to_flag(rx, flag.clone());
        drop(tx);
        handle.await.unwrap();
        assert!(flag.load(Ordering::SeqCst));
    }
}
