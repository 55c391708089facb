//! Process-wide shutdown signal
//!
//! Periodic tasks check the signal at tick boundaries and `select!` on
//! [`ShutdownSignal::wait`] while sleeping.

use tokio::sync::watch;

/// Sending half, held by `main`
pub struct ShutdownTrigger(watch::Sender<bool>);

/// Receiving half, cloned into every background task
#[derive(Clone)]
pub struct ShutdownSignal(watch::Receiver<bool>);

/// Create a linked trigger/signal pair
pub fn channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger(tx), ShutdownSignal(rx))
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.0.send_replace(true);
    }
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolve once shutdown is triggered (or the trigger is dropped)
    pub async fn wait(&mut self) {
        while !*self.0.borrow_and_update() {
            if self.0.changed().await.is_err() {
                return;
            }
        }
    }
}
