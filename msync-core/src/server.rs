use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::config::MountConfig;
use crate::fs_access::FileAccess;
use crate::proto::{PeerReceiver, PeerSender, WireMessage};
use crate::queues::Backlog;
use crate::session::{accept_session, SessionHandle, WatcherFactory};
use crate::tasks::SessionState;

/// A mount this server is willing to serve.
pub struct MountEndpoint {
    pub config: MountConfig,
    pub watcher_factory: Arc<WatcherFactory>,
    pub fs: Arc<dyn FileAccess>,
}

/// Accepts peers and holds at most one live session per mount key; a second
/// connect for the same key evicts the first.
#[derive(Default)]
pub struct Server {
    mounts: HashMap<String, MountEndpoint>,
    sessions: HashMap<String, SessionHandle>,
}

impl Server {
    pub fn new() -> Server {
        Server::default()
    }

    pub fn register_mount(&mut self, endpoint: MountEndpoint) -> anyhow::Result<()> {
        endpoint.config.validate()?;
        self.mounts.insert(endpoint.config.mount_key.clone(), endpoint);
        Ok(())
    }

    /// Reads the peer's hello, routes it to its mount, and starts a session.
    pub async fn accept(
        &mut self,
        peer_tx: Box<dyn PeerSender>,
        mut peer_rx: Box<dyn PeerReceiver>,
    ) -> anyhow::Result<Uuid> {
        let hello = match peer_rx.recv().await? {
            Some(WireMessage::Hello(h)) => h,
            Some(other) => anyhow::bail!("expected a hello, got {other:?}"),
            None => anyhow::bail!("peer closed before the handshake"),
        };
        let Some(endpoint) = self.mounts.get(&hello.mount_key) else {
            warn!(mount = %hello.mount_key, "rejecting connect for unknown mount");
            anyhow::bail!("unknown mount key {:?}", hello.mount_key);
        };
        if let Some(previous) = self.sessions.remove(&hello.mount_key) {
            info!(mount = %hello.mount_key, session = %previous.id, "evicting previous session");
            previous.stop();
        }
        let factory = endpoint.watcher_factory.clone();
        let handle = accept_session(
            endpoint.config.clone(),
            move |tx| factory(tx),
            endpoint.fs.clone(),
            peer_tx,
            peer_rx,
            &hello,
        )
        .await?;
        let id = handle.id;
        self.sessions.insert(hello.mount_key, handle);
        Ok(id)
    }

    /// Administrative query: queue depths of a live session.
    pub fn backlog(&self, mount_key: &str) -> Option<Backlog> {
        self.sessions.get(mount_key).map(SessionHandle::backlog)
    }

    pub fn session_state(&self, mount_key: &str) -> Option<SessionState> {
        self.sessions.get(mount_key).map(SessionHandle::state)
    }

    pub fn stop(&mut self, mount_key: &str) {
        if let Some(handle) = self.sessions.remove(mount_key) {
            handle.stop();
        }
    }

    pub fn stop_all(&mut self) {
        for (_, handle) in self.sessions.drain() {
            handle.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs_access::StubFileAccess;
    use crate::proto::{memory_pair, Hello};
    use crate::watcher::StubFileWatcher;

    fn endpoint(key: &str) -> MountEndpoint {
        MountEndpoint {
            config: MountConfig::new(key, "/tmp/server"),
            watcher_factory: Arc::new(|_tx| Box::new(StubFileWatcher::new(Vec::new())) as Box<dyn crate::watcher::FileWatcher>),
            fs: Arc::new(StubFileAccess::new()),
        }
    }

    #[tokio::test]
    async fn unknown_mount_key_is_rejected() {
        let mut server = Server::new();
        server.register_mount(endpoint("known")).unwrap();
        let ((mut a_tx, _a_rx), (b_tx, b_rx)) = memory_pair();
        a_tx.send(WireMessage::Hello(Hello { mount_key: "mystery".into(), remote_root: None }))
            .await
            .unwrap();
        let result = server.accept(Box::new(b_tx), Box::new(b_rx)).await;
        assert!(result.is_err());
        assert!(server.backlog("mystery").is_none());
    }

    #[tokio::test]
    async fn second_connect_evicts_the_first_session() {
        let mut server = Server::new();
        server.register_mount(endpoint("m1")).unwrap();

        let ((mut a_tx, mut a_rx), (b_tx, b_rx)) = memory_pair();
        a_tx.send(WireMessage::Hello(Hello { mount_key: "m1".into(), remote_root: None }))
            .await
            .unwrap();
        let first = server.accept(Box::new(b_tx), Box::new(b_rx)).await.unwrap();
        // the server answers with its own hello
        assert!(matches!(a_rx.recv().await.unwrap(), Some(WireMessage::Hello(_))));

        let ((mut c_tx, mut c_rx), (d_tx, d_rx)) = memory_pair();
        c_tx.send(WireMessage::Hello(Hello { mount_key: "m1".into(), remote_root: None }))
            .await
            .unwrap();
        let second = server.accept(Box::new(d_tx), Box::new(d_rx)).await.unwrap();
        assert!(matches!(c_rx.recv().await.unwrap(), Some(WireMessage::Hello(_))));
        assert_ne!(first, second);
        assert!(server.backlog("m1").is_some());

        // exactly one live session per key
        server.stop("m1");
        assert!(server.backlog("m1").is_none());
    }
}
