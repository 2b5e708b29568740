use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::MountConfig;
use crate::fs_access::FileAccess;
use crate::proto::{Hello, PeerReceiver, PeerSender, WireMessage};
use crate::queues::{Backlog, Queues, SyncEvent};
use crate::save_local::SaveToLocal;
use crate::save_remote::SaveToRemote;
use crate::sync::SyncLogic;
use crate::tasks::{spawn_worker, stop_channel, SessionState, StopHandle, StopSignal};
use crate::tree::now_millis;
use crate::update::{Update, UpdateKind, INITIAL_SYNC_MARKER};
use crate::watcher::FileWatcher;

/// Probe cadence and the silence we tolerate after one before giving up.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(20);
const KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Builds the watcher once the session's incoming queue exists.
pub type WatcherFactory = dyn Fn(mpsc::Sender<SyncEvent>) -> Box<dyn FileWatcher> + Send + Sync;

/// Owner's view of a running session: the queues, the tree's worker, both
/// save stages, the watcher, and the transport pumps. Dropped state is
/// rebuilt from scans on the next session; nothing persists.
pub struct SessionHandle {
    pub id: Uuid,
    pub mount_key: String,
    stop: StopHandle,
    queues: Queues,
    state: watch::Receiver<SessionState>,
    supervisor: JoinHandle<()>,
}

impl SessionHandle {
    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn backlog(&self) -> Backlog {
        self.queues.backlog()
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Resolves once every worker has wound down.
    pub async fn wait(self) {
        let _ = self.supervisor.await;
    }
}

/// Client side: greet first, then expect the peer's hello back.
pub async fn connect_session(
    config: MountConfig,
    watcher_factory: impl FnOnce(mpsc::Sender<SyncEvent>) -> Box<dyn FileWatcher>,
    fs: Arc<dyn FileAccess>,
    mut peer_tx: Box<dyn PeerSender>,
    mut peer_rx: Box<dyn PeerReceiver>,
) -> anyhow::Result<SessionHandle> {
    config.validate()?;
    peer_tx.send(WireMessage::Hello(hello_for(&config))).await?;
    let answer = peer_rx.recv().await?;
    let hello = match answer {
        Some(WireMessage::Hello(h)) => h,
        Some(other) => anyhow::bail!("expected a hello, got {other:?}"),
        None => anyhow::bail!("peer closed during handshake"),
    };
    if hello.mount_key != config.mount_key {
        anyhow::bail!("peer answered for mount {:?}, expected {:?}", hello.mount_key, config.mount_key);
    }
    info!(mount = %config.mount_key, peer_root = ?hello.remote_root, "session established");
    Ok(spawn_session(config, watcher_factory, fs, peer_tx, peer_rx))
}

/// Server side: the acceptor has already read the peer's hello to route it
/// here; answer it and start.
pub async fn accept_session(
    config: MountConfig,
    watcher_factory: impl FnOnce(mpsc::Sender<SyncEvent>) -> Box<dyn FileWatcher>,
    fs: Arc<dyn FileAccess>,
    mut peer_tx: Box<dyn PeerSender>,
    peer_rx: Box<dyn PeerReceiver>,
    peer_hello: &Hello,
) -> anyhow::Result<SessionHandle> {
    config.validate()?;
    if peer_hello.mount_key != config.mount_key {
        anyhow::bail!("hello for mount {:?} routed to {:?}", peer_hello.mount_key, config.mount_key);
    }
    peer_tx.send(WireMessage::Hello(hello_for(&config))).await?;
    info!(mount = %config.mount_key, peer_root = ?peer_hello.remote_root, "session accepted");
    Ok(spawn_session(config, watcher_factory, fs, peer_tx, peer_rx))
}

fn spawn_session(
    config: MountConfig,
    watcher_factory: impl FnOnce(mpsc::Sender<SyncEvent>) -> Box<dyn FileWatcher>,
    fs: Arc<dyn FileAccess>,
    peer_tx: Box<dyn PeerSender>,
    peer_rx: Box<dyn PeerReceiver>,
) -> SessionHandle {
    let (queues, receivers) = Queues::new();
    let (stop_handle, stop) = stop_channel();
    let (state_tx, state_rx) = watch::channel(SessionState::Starting);
    let logic = SyncLogic::new(config.new_tree(), &queues);
    let watcher = watcher_factory(queues.incoming.clone());
    let last_rx = Arc::new(AtomicI64::new(now_millis()));

    let workers = vec![
        spawn_worker("sync", stop_handle.clone(), logic.run(receivers.incoming, stop.clone())),
        spawn_worker(
            "save-to-local",
            stop_handle.clone(),
            SaveToLocal::new(fs.clone(), queues.incoming.clone()).run(receivers.save_to_local, stop.clone()),
        ),
        spawn_worker(
            "save-to-remote",
            stop_handle.clone(),
            SaveToRemote::new(fs, queues.outgoing.clone()).run(receivers.save_to_remote, stop.clone()),
        ),
        spawn_worker("watcher", stop_handle.clone(), watcher_worker(watcher, queues.clone(), stop.clone())),
        spawn_worker(
            "sender",
            stop_handle.clone(),
            sender_worker(peer_tx, receivers.outgoing, last_rx.clone(), stop.clone()),
        ),
        spawn_worker(
            "receiver",
            stop_handle.clone(),
            receive_worker(
                peer_rx,
                queues.incoming.clone(),
                queues.outgoing.clone(),
                last_rx,
                stop_handle.clone(),
                stop,
            ),
        ),
    ];
    let _ = state_tx.send(SessionState::Syncing);
    let supervisor = tokio::spawn(async move {
        let mut failure: Option<String> = None;
        for worker in workers {
            if let Ok(Err(e)) = worker.await {
                failure.get_or_insert(e.to_string());
            }
        }
        let final_state = match failure {
            Some(message) => SessionState::Failed(message),
            None => SessionState::Stopped,
        };
        let _ = state_tx.send(final_state);
    });

    SessionHandle {
        id: Uuid::new_v4(),
        mount_key: config.mount_key,
        stop: stop_handle,
        queues,
        state: state_rx,
        supervisor,
    }
}

fn hello_for(config: &MountConfig) -> Hello {
    Hello {
        mount_key: config.mount_key.clone(),
        remote_root: config
            .remote_root
            .clone()
            .or_else(|| Some(config.mount_root.to_string_lossy().into_owned())),
    }
}

/// The seed twin of a scan entry: same metadata, marker instead of a body so
/// the receiver knows to ask if it needs one.
fn seed_copy(update: &Update) -> Update {
    let mut seed = update.without_data();
    seed.local = false;
    if let UpdateKind::File { data, .. } = &mut seed.kind {
        *data = Some(INITIAL_SYNC_MARKER.to_vec());
    }
    seed
}

/// Empty path plus a stamp: "my seed is complete".
fn seed_complete_sentinel() -> Update {
    let mut sentinel = Update::directory("", now_millis().max(1));
    sentinel.local = false;
    sentinel
}

/// Runs the watcher: one scan feeding both our tree and the peer's seed,
/// then the live loop.
async fn watcher_worker(
    mut watcher: Box<dyn FileWatcher>,
    queues: Queues,
    mut stop: StopSignal,
) -> anyhow::Result<()> {
    watcher.on_start()?;
    let scan = watcher.perform_initial_scan().await?;
    let entries = scan.len();
    for update in scan {
        let seed = seed_copy(&update);
        queues
            .incoming
            .send(SyncEvent::Tree(update))
            .await
            .map_err(|_| anyhow::anyhow!("incoming queue closed"))?;
        queues
            .outgoing
            .send(WireMessage::Update(seed))
            .await
            .map_err(|_| anyhow::anyhow!("outgoing queue closed"))?;
    }
    queues
        .incoming
        .send(SyncEvent::ScanComplete)
        .await
        .map_err(|_| anyhow::anyhow!("incoming queue closed"))?;
    queues
        .outgoing
        .send(WireMessage::Update(seed_complete_sentinel()))
        .await
        .map_err(|_| anyhow::anyhow!("outgoing queue closed"))?;
    info!(entries, "initial scan streamed to peer");

    loop {
        if stop.is_stopped() {
            break;
        }
        let pause = tokio::select! {
            _ = stop.wait() => break,
            result = watcher.run_one_loop() => result?,
        };
        if let Some(pause) = pause {
            tokio::select! {
                _ = stop.wait() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }
    watcher.on_stop();
    Ok(())
}

/// Pumps the outgoing queue into the peer and keeps the link probed.
async fn sender_worker(
    mut peer: Box<dyn PeerSender>,
    mut outgoing: mpsc::Receiver<WireMessage>,
    last_rx: Arc<AtomicI64>,
    mut stop: StopSignal,
) -> anyhow::Result<()> {
    let mut probe = tokio::time::interval(KEEP_ALIVE_INTERVAL);
    probe.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.wait() => break,
            msg = outgoing.recv() => {
                let Some(msg) = msg else { break };
                peer.send(msg).await?;
            }
            _ = probe.tick() => {
                let silent = now_millis() - last_rx.load(Ordering::Relaxed);
                let limit = (KEEP_ALIVE_INTERVAL + KEEP_ALIVE_TIMEOUT).as_millis() as i64;
                if silent > limit {
                    anyhow::bail!("peer silent for {silent}ms, giving up");
                }
                peer.send(WireMessage::Ping).await?;
            }
        }
    }
    Ok(())
}

/// Pumps the peer stream into the incoming queue. End-of-stream winds the
/// whole session down; a transport error does the same, loudly.
async fn receive_worker(
    mut peer: Box<dyn PeerReceiver>,
    incoming: mpsc::Sender<SyncEvent>,
    outgoing: mpsc::Sender<WireMessage>,
    last_rx: Arc<AtomicI64>,
    stop_handle: StopHandle,
    mut stop: StopSignal,
) -> anyhow::Result<()> {
    loop {
        let msg = tokio::select! {
            _ = stop.wait() => break,
            msg = peer.recv() => msg?,
        };
        let Some(msg) = msg else {
            info!("peer closed the stream");
            stop_handle.stop();
            break;
        };
        last_rx.store(now_millis(), Ordering::Relaxed);
        match msg {
            WireMessage::Hello(h) => debug!(mount = %h.mount_key, "unexpected mid-stream hello"),
            WireMessage::Ping => {
                outgoing
                    .send(WireMessage::Pong)
                    .await
                    .map_err(|_| anyhow::anyhow!("outgoing queue closed"))?;
            }
            WireMessage::Pong => {}
            WireMessage::Update(mut update) => {
                let event = if update.path.is_empty() && update.mod_time != 0 {
                    SyncEvent::SeedComplete
                } else {
                    update.local = false;
                    SyncEvent::Tree(update)
                };
                incoming
                    .send(event)
                    .await
                    .map_err(|_| anyhow::anyhow!("incoming queue closed"))?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs_access::StubFileAccess;
    use crate::proto::memory_pair;
    use crate::watcher::StubFileWatcher;

    fn stub_factory() -> impl FnOnce(mpsc::Sender<SyncEvent>) -> Box<dyn FileWatcher> {
        |_tx| Box::new(StubFileWatcher::new(Vec::new())) as Box<dyn FileWatcher>
    }

    #[tokio::test]
    async fn handshake_rejects_mismatched_keys() {
        let ((a_tx, a_rx), (mut b_tx, mut b_rx)) = memory_pair();
        let answer = tokio::spawn(async move {
            // peer answers with the wrong mount
            let _ = b_rx.recv().await;
            b_tx.send(WireMessage::Hello(Hello { mount_key: "other".into(), remote_root: None }))
                .await
                .unwrap();
        });
        let result = connect_session(
            MountConfig::new("mine", "/tmp/mine"),
            stub_factory(),
            Arc::new(StubFileAccess::new()),
            Box::new(a_tx),
            Box::new(a_rx),
        )
        .await;
        assert!(result.is_err());
        answer.await.unwrap();
    }

    #[tokio::test]
    async fn stop_winds_the_session_down() {
        let ((a_tx, a_rx), (b_tx, b_rx)) = memory_pair();
        let fs = Arc::new(StubFileAccess::new());
        let client = tokio::spawn({
            let fs = fs.clone();
            async move {
                connect_session(
                    MountConfig::new("m1", "/tmp/a"),
                    stub_factory(),
                    fs,
                    Box::new(a_tx),
                    Box::new(a_rx),
                )
                .await
            }
        });
        // acceptor side
        let mut b_rx = b_rx;
        let hello = match b_rx.recv().await.unwrap() {
            Some(WireMessage::Hello(h)) => h,
            other => panic!("expected hello, got {other:?}"),
        };
        let server = accept_session(
            MountConfig::new("m1", "/tmp/b"),
            stub_factory(),
            Arc::new(StubFileAccess::new()),
            Box::new(b_tx),
            Box::new(b_rx),
            &hello,
        )
        .await
        .unwrap();
        let client = client.await.unwrap().unwrap();
        assert_eq!(client.state(), SessionState::Syncing);
        client.stop();
        client.wait().await;
        // the peer notices the closed stream and stops too
        server.wait().await;
    }
}
