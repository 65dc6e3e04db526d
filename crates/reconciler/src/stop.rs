//! Cooperative shutdown signal shared by cycles, the monitor and promotion.

use tokio::sync::watch;

/// Create a connected stopper and signal.
pub fn stop_channel() -> (Stopper, StopSignal) {
    let (tx, rx) = watch::channel(false);
    (Stopper { tx }, StopSignal { rx })
}

/// Handle that requests shutdown.
#[derive(Debug, Clone)]
pub struct Stopper {
    tx: watch::Sender<bool>,
}

impl Stopper {
    /// Request shutdown. In-flight work finishes its current action.
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    /// A new signal observing this stopper.
    pub fn signal(&self) -> StopSignal {
        StopSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Observer side of a [`Stopper`].
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown is requested.
    pub async fn stopped(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                // Stopper dropped without stopping: nothing can fire anymore.
                std::future::pending::<()>().await;
            }
        }
    }
}
