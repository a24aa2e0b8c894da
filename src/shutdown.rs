//! Shutdown coordination for the server.
//!
//! A broadcast channel fans the stop signal out to the accept loop;
//! cloneable handles let signal handlers and tests trigger it.

use tokio::sync::broadcast;

/// Coordinator for graceful shutdown.
#[derive(Debug)]
pub struct Shutdown {
    tx: broadcast::Sender<()>,
}

impl Shutdown {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    /// Subscribe to the shutdown signal.
    ///
    /// Only signals triggered after subscription are observed, so the
    /// server subscribes at bind time rather than when the accept loop
    /// starts.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Obtain a cloneable trigger handle.
    pub fn handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.tx.clone(),
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable trigger for the shutdown signal.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: broadcast::Sender<()>,
}

impl ShutdownHandle {
    /// Signal shutdown. Safe to call more than once; calls after the
    /// first are no-ops for an already-stopped server.
    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }
}
