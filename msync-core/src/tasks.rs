use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Broadcast stop flag shared by a session's workers. Each worker finishes
/// its current loop iteration and exits; queues are not drained.
#[derive(Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

#[derive(Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

pub fn stop_channel() -> (StopHandle, StopSignal) {
    let (tx, rx) = watch::channel(false);
    (StopHandle { tx: Arc::new(tx) }, StopSignal { rx })
}

impl StopHandle {
    pub fn stop(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }
}

impl StopSignal {
    /// Resolves once stop is requested; used as a `select!` arm so blocked
    /// queue operations stay interruptible.
    pub async fn wait(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Lifecycle of a running session, observable by its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Syncing,
    Stopped,
    Failed(String),
}

/// Spawns a named worker; a worker returning an error flips the stop flag so
/// its siblings wind down too. The result is kept for the session supervisor.
pub fn spawn_worker<F>(name: &'static str, stop: StopHandle, fut: F) -> JoinHandle<anyhow::Result<()>>
where
    F: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        match fut.await {
            Ok(()) => {
                debug!(worker = name, "worker finished");
                Ok(())
            }
            // queues and streams close out from under workers during a
            // requested stop; that is not a failure
            Err(e) if stop.is_stopped() => {
                debug!(worker = name, error = %e, "worker exited during shutdown");
                Ok(())
            }
            Err(e) => {
                error!(worker = name, error = %e, "worker failed; stopping session");
                stop.stop();
                Err(e)
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn stop_wakes_waiters() {
        let (handle, mut signal) = stop_channel();
        let waiter = tokio::spawn(async move {
            signal.wait().await;
            true
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.stop();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_already_stopped() {
        let (handle, mut signal) = stop_channel();
        handle.stop();
        signal.wait().await;
        assert!(signal.is_stopped());
    }

    #[tokio::test]
    async fn failing_worker_flips_the_stop_flag() {
        let (handle, _signal) = stop_channel();
        let join = spawn_worker("boom", handle.clone(), async { anyhow::bail!("kaput") });
        assert!(join.await.unwrap().is_err());
        assert!(handle.is_stopped());
    }
}
