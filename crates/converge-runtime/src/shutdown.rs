//! Cooperative cancellation signals.
//!
//! A [`Shutdown`] owns the trigger; any number of [`ShutdownSignal`] clones
//! observe it. The same type backs the process-wide shutdown and the
//! per-term signal the leader elector hands to the workers; [`ShutdownSignal::or`]
//! joins the two so workers stop on whichever fires first.

use futures::future::select_all;
use tokio::sync::watch;

/// Trigger side of a cancellation signal.
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

/// Observer side of one or more cancellation signals. Fires when any of
/// its sources fires.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    sources: Vec<watch::Receiver<bool>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Fire the signal. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            sources: vec![self.tx.subscribe()],
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        self.sources.iter().any(|rx| *rx.borrow())
    }

    /// Resolves once the signal fires. A dropped trigger counts as fired.
    pub async fn triggered(&self) {
        let waits = self.sources.iter().map(|rx| {
            let mut rx = rx.clone();
            Box::pin(async move {
                let _ = rx.wait_for(|fired| *fired).await;
            })
        });
        select_all(waits).await;
    }

    /// A signal that fires as soon as either `self` or `other` does.
    pub fn or(mut self, other: ShutdownSignal) -> Self {
        self.sources.extend(other.sources);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn signal_observes_trigger() {
        let shutdown = Shutdown::new();
        let signal = shutdown.signal();
        assert!(!signal.is_triggered());

        let waiter = tokio::spawn({
            let signal = signal.clone();
            async move { signal.triggered().await }
        });

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should observe trigger")
            .unwrap();
        assert!(signal.is_triggered());
    }

    #[tokio::test]
    async fn dropped_trigger_releases_waiters() {
        let shutdown = Shutdown::new();
        let signal = shutdown.signal();
        drop(shutdown);
        tokio::time::timeout(Duration::from_secs(1), signal.triggered())
            .await
            .expect("dropped trigger should release waiters");
    }

    #[tokio::test]
    async fn combined_signal_fires_on_either_source() {
        let term = Shutdown::new();
        let process = Shutdown::new();
        let combined = term.signal().or(process.signal());
        assert!(!combined.is_triggered());

        process.trigger();
        assert!(combined.is_triggered());
        tokio::time::timeout(Duration::from_secs(1), combined.triggered())
            .await
            .expect("combined signal should fire");
        assert!(!term.is_triggered());
    }
}
