use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::proto::WireMessage;
use crate::queues::{Queues, SyncEvent};
use crate::tasks::StopSignal;
use crate::tree::{sanity_check_timestamp, NodeId, UpdateTree, MINIMUM_MILLIS_PRECISION};
use crate::update::{abbreviate_path, Update, INITIAL_SYNC_MARKER};

/// How long a committed write may take to bounce back off the watcher before
/// we stop treating a matching event as our own echo. A tuning parameter.
const ECHO_WINDOW: Duration = Duration::from_secs(5);

/// Dirty nodes are also swept on a timer so batched bursts stay sub-second.
const DIFF_TICK: Duration = Duration::from_millis(100);

/// The single-threaded owner of the update tree.
///
/// Everything it reacts to arrives on one mailbox: watcher events, peer
/// updates, the two seed-completion markers, and our own save commits. That
/// single queue is what gives this side its total event order.
pub struct SyncLogic {
    tree: UpdateTree,
    save_to_local: mpsc::Sender<Update>,
    save_to_remote: mpsc::Sender<Update>,
    outgoing: mpsc::Sender<WireMessage>,
    /// Writes we just applied, keyed by path and quantized mod time; a
    /// matching local event within the window is an echo, consumed on hit.
    recently_saved: HashMap<(String, i64), Instant>,
    scan_done: bool,
    seed_done: bool,
    rejected_updates: u64,
    suppressed_echoes: u64,
}

impl SyncLogic {
    pub fn new(tree: UpdateTree, queues: &Queues) -> SyncLogic {
        SyncLogic {
            tree,
            save_to_local: queues.save_to_local.clone(),
            save_to_remote: queues.save_to_remote.clone(),
            outgoing: queues.outgoing.clone(),
            recently_saved: HashMap::new(),
            scan_done: false,
            seed_done: false,
            rejected_updates: 0,
            suppressed_echoes: 0,
        }
    }

    pub async fn run(
        mut self,
        mut incoming: mpsc::Receiver<SyncEvent>,
        mut stop: StopSignal,
    ) -> anyhow::Result<()> {
        let mut tick = tokio::time::interval(DIFF_TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = stop.wait() => break,
                _ = tick.tick() => self.diff().await?,
                event = incoming.recv() => {
                    let Some(event) = event else { break };
                    self.handle(event).await?;
                    // drain the burst before diffing once
                    while let Ok(event) = incoming.try_recv() {
                        self.handle(event).await?;
                    }
                    self.diff().await?;
                }
            }
        }
        Ok(())
    }

    pub async fn handle(&mut self, event: SyncEvent) -> anyhow::Result<()> {
        match event {
            SyncEvent::Tree(update) if update.local => self.handle_local(update),
            SyncEvent::Tree(update) => self.handle_remote(update).await?,
            SyncEvent::ScanComplete => self.scan_done = true,
            SyncEvent::SeedComplete => self.seed_done = true,
            SyncEvent::Saved(update) => self.handle_saved(update),
        }
        Ok(())
    }

    fn handle_local(&mut self, update: Update) {
        if self.is_echo(&update) {
            self.suppressed_echoes += 1;
            debug!(path = abbreviate_path(&update.path), "suppressing echo of our own write");
            return;
        }
        if let Err(e) = self.tree.add_local(update) {
            self.rejected_updates += 1;
            warn!(error = %e, rejected = self.rejected_updates, "rejecting local update");
        }
    }

    async fn handle_remote(&mut self, update: Update) -> anyhow::Result<()> {
        // A path plus the marker and nothing else is the peer asking for a
        // file body.
        if update.has_marker_data() && update.mod_time == 0 {
            return self.handle_body_request(&update.path).await;
        }
        if let Err(e) = self.tree.add_remote(update) {
            self.rejected_updates += 1;
            warn!(error = %e, rejected = self.rejected_updates, "rejecting remote update");
        }
        Ok(())
    }

    async fn handle_body_request(&mut self, path: &str) -> anyhow::Result<()> {
        let Some(id) = self.tree.get(path) else {
            debug!(path, "body requested for unknown path");
            return Ok(());
        };
        if self.tree.should_ignore(id) {
            return Ok(());
        }
        let Some(update) = self.tree.restore_local(id) else { return Ok(()) };
        if update.is_delete() || !update.is_file() {
            debug!(path, "body requested for non-file entry");
            return Ok(());
        }
        info!(path = abbreviate_path(path), "peer requested file body");
        self.save_to_remote
            .send(update)
            .await
            .map_err(|_| anyhow::anyhow!("save-to-remote queue closed"))
    }

    fn handle_saved(&mut self, update: Update) {
        let key = (update.path.clone(), sanity_check_timestamp(update.mod_time));
        self.recently_saved.insert(key, Instant::now());
        self.tree.set_applied_local(update);
    }

    fn is_echo(&mut self, update: &Update) -> bool {
        // delete events come in with no stamp; they echo the tombstone we
        // applied, whose stamp is in the local slot by now
        let effective = if update.is_delete() && update.mod_time == 0 {
            match self.tree.get(&update.path).and_then(|id| self.tree.local(id)) {
                Some(local) => local.mod_time,
                None => return false,
            }
        } else {
            update.mod_time
        };
        let now = Instant::now();
        self.recently_saved.retain(|_, at| now.duration_since(*at) < ECHO_WINDOW);
        let key = (update.path.clone(), sanity_check_timestamp(effective));
        self.recently_saved.remove(&key).is_some()
    }

    /// Sweeps dirty nodes and emits per-node actions. Held back until both
    /// the local scan and the remote seed are fully applied, so the initial
    /// reconciliation sees a complete picture.
    pub async fn diff(&mut self) -> anyhow::Result<()> {
        if !(self.scan_done && self.seed_done) {
            return Ok(());
        }
        for id in self.tree.visit_dirty() {
            self.diff_node(id).await?;
        }
        Ok(())
    }

    async fn diff_node(&mut self, id: NodeId) -> anyhow::Result<()> {
        if self.tree.should_ignore(id) {
            return Ok(());
        }
        if self.tree.is_local_newer(id) {
            self.tree.clear_remote_data(id);
            if let Some(update) = self.tree.restore_local(id) {
                if self.tree.should_debug(&update.path) {
                    info!(path = %update.path, mod_time = update.mod_time, "local side wins");
                }
                self.save_to_remote
                    .send(update)
                    .await
                    .map_err(|_| anyhow::anyhow!("save-to-remote queue closed"))?;
            }
        } else if self.tree.is_remote_newer(id) {
            let needs_body = self
                .tree
                .remote(id)
                .map(|r| r.is_file() && (r.data().is_none() || r.has_marker_data()))
                .unwrap_or(false);
            if needs_body {
                let path = self.tree.path_of(id);
                debug!(path = abbreviate_path(&path), "requesting file body from peer");
                let mut request = Update::file(path, 0).with_data(INITIAL_SYNC_MARKER.to_vec());
                request.local = false;
                self.outgoing
                    .send(WireMessage::Update(request))
                    .await
                    .map_err(|_| anyhow::anyhow!("outgoing queue closed"))?;
                // the node went clean with this sweep; the body response
                // re-dirties it and we emit then
                return Ok(());
            }
            // On a retype, delete the losing local entry first, stamped just
            // below the create so the ordering is unambiguous.
            let local_live = self.tree.local(id).map(|l| !l.is_delete()).unwrap_or(false);
            if local_live && !self.tree.is_same_type(id) {
                let path = self.tree.path_of(id);
                let create_time = self.tree.remote(id).map(|r| r.mod_time).unwrap_or(0);
                let mut tombstone = Update::tombstone(path, create_time - MINIMUM_MILLIS_PRECISION);
                tombstone.local = false;
                self.save_to_local
                    .send(tombstone)
                    .await
                    .map_err(|_| anyhow::anyhow!("save-to-local queue closed"))?;
            }
            if let Some(update) = self.tree.restore_remote_taking_data(id) {
                if self.tree.should_debug(&update.path) {
                    info!(path = %update.path, mod_time = update.mod_time, "remote side wins");
                }
                self.save_to_local
                    .send(update)
                    .await
                    .map_err(|_| anyhow::anyhow!("save-to-local queue closed"))?;
            }
        } else {
            // nothing to do; drop any stale body so the tree stays lean
            self.tree.clear_remote_data(id);
        }
        Ok(())
    }

    pub fn rejected_updates(&self) -> u64 {
        self.rejected_updates
    }

    pub fn suppressed_echoes(&self) -> u64 {
        self.suppressed_echoes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queues::{QueueReceivers, Queues};
    use crate::update::UpdateKind;

    fn seeded_logic() -> (SyncLogic, QueueReceivers) {
        let (queues, rx) = Queues::new();
        let mut logic = SyncLogic::new(UpdateTree::new_root(), &queues);
        logic.scan_done = true;
        logic.seed_done = true;
        (logic, rx)
    }

    fn remote(mut u: Update) -> Update {
        u.local = false;
        u
    }

    #[tokio::test]
    async fn local_update_flows_to_save_to_remote() {
        let (mut logic, mut rx) = seeded_logic();
        logic.handle(SyncEvent::Tree(Update::file("foo.txt", 5000))).await.unwrap();
        logic.diff().await.unwrap();
        let sent = rx.save_to_remote.try_recv().unwrap();
        assert_eq!(sent.path, "foo.txt");
        assert!(sent.data().is_none());
    }

    #[tokio::test]
    async fn remote_update_with_data_flows_to_save_to_local() {
        let (mut logic, mut rx) = seeded_logic();
        logic
            .handle(SyncEvent::Tree(remote(Update::file("foo.txt", 5000).with_data(b"abc".to_vec()))))
            .await
            .unwrap();
        logic.diff().await.unwrap();
        let saved = rx.save_to_local.try_recv().unwrap();
        assert_eq!(saved.path, "foo.txt");
        assert_eq!(saved.data(), Some(&b"abc"[..]));
        assert!(rx.save_to_remote.try_recv().is_err());
    }

    #[tokio::test]
    async fn remote_file_without_body_triggers_a_request() {
        let (mut logic, mut rx) = seeded_logic();
        let seed = remote(Update::file("big.bin", 5000).with_data(INITIAL_SYNC_MARKER.to_vec()));
        logic.handle(SyncEvent::Tree(seed)).await.unwrap();
        logic.diff().await.unwrap();
        match rx.outgoing.try_recv().unwrap() {
            WireMessage::Update(u) => {
                assert_eq!(u.path, "big.bin");
                assert_eq!(u.mod_time, 0);
                assert!(u.has_marker_data());
            }
            other => panic!("expected a body request, got {other:?}"),
        }
        assert!(rx.save_to_local.try_recv().is_err());

        // the body arrives as a normal update and is applied
        logic
            .handle(SyncEvent::Tree(remote(Update::file("big.bin", 5000).with_data(b"bytes".to_vec()))))
            .await
            .unwrap();
        logic.diff().await.unwrap();
        let saved = rx.save_to_local.try_recv().unwrap();
        assert_eq!(saved.data(), Some(&b"bytes"[..]));
    }

    #[tokio::test]
    async fn body_request_enqueues_a_save_to_remote() {
        let (mut logic, mut rx) = seeded_logic();
        logic.handle(SyncEvent::Tree(Update::file("src/lib.rs", 5000))).await.unwrap();
        logic.diff().await.unwrap();
        rx.save_to_remote.try_recv().unwrap();

        let request = remote(Update::file("src/lib.rs", 0).with_data(INITIAL_SYNC_MARKER.to_vec()));
        logic.handle(SyncEvent::Tree(request)).await.unwrap();
        let resent = rx.save_to_remote.try_recv().unwrap();
        assert_eq!(resent.path, "src/lib.rs");
        assert!(resent.data().is_none());
    }

    #[tokio::test]
    async fn echo_of_our_own_write_is_suppressed() {
        let (mut logic, mut rx) = seeded_logic();
        logic.handle(SyncEvent::Saved(remote(Update::file("foo.txt", 5000)))).await.unwrap();
        // the watcher reports the write we just made
        logic.handle(SyncEvent::Tree(Update::file("foo.txt", 5000))).await.unwrap();
        logic.diff().await.unwrap();
        assert_eq!(logic.suppressed_echoes(), 1);
        assert!(rx.save_to_remote.try_recv().is_err());
    }

    #[tokio::test]
    async fn echo_of_a_delete_uses_the_stored_stamp() {
        let (mut logic, mut rx) = seeded_logic();
        logic.handle(SyncEvent::Saved(remote(Update::tombstone("foo.txt", 3000)))).await.unwrap();
        // watcher delete events carry no stamp
        logic.handle(SyncEvent::Tree(Update::tombstone("foo.txt", 0))).await.unwrap();
        logic.diff().await.unwrap();
        assert_eq!(logic.suppressed_echoes(), 1);
        assert!(rx.save_to_remote.try_recv().is_err());
    }

    #[tokio::test]
    async fn a_second_event_with_the_same_stamp_is_not_an_echo() {
        let (mut logic, _rx) = seeded_logic();
        logic.handle(SyncEvent::Saved(remote(Update::file("foo.txt", 5000)))).await.unwrap();
        logic.handle(SyncEvent::Tree(Update::file("foo.txt", 5000))).await.unwrap();
        assert_eq!(logic.suppressed_echoes(), 1);
        // entries are consumed on match; a genuine same-stamp change later
        // goes through
        logic.handle(SyncEvent::Tree(Update::file("foo.txt", 5000))).await.unwrap();
        assert_eq!(logic.suppressed_echoes(), 1);
    }

    #[tokio::test]
    async fn ignored_paths_never_emit() {
        let (mut logic, mut rx) = seeded_logic();
        logic
            .handle(SyncEvent::Tree(Update::file(".gitignore", 1000).with_ignore_string("foo.txt")))
            .await
            .unwrap();
        logic.handle(SyncEvent::Tree(Update::file("foo.txt", 5000))).await.unwrap();
        logic.diff().await.unwrap();
        // .gitignore itself syncs, foo.txt does not
        let sent = rx.save_to_remote.try_recv().unwrap();
        assert_eq!(sent.path, ".gitignore");
        assert!(rx.save_to_remote.try_recv().is_err());
    }

    #[tokio::test]
    async fn no_diff_until_both_seeds_are_applied() {
        let (queues, mut rx) = Queues::new();
        let mut logic = SyncLogic::new(UpdateTree::new_root(), &queues);
        logic.handle(SyncEvent::Tree(Update::file("foo.txt", 5000))).await.unwrap();
        logic.diff().await.unwrap();
        assert!(rx.save_to_remote.try_recv().is_err());
        logic.handle(SyncEvent::ScanComplete).await.unwrap();
        logic.diff().await.unwrap();
        assert!(rx.save_to_remote.try_recv().is_err());
        logic.handle(SyncEvent::SeedComplete).await.unwrap();
        logic.diff().await.unwrap();
        assert_eq!(rx.save_to_remote.try_recv().unwrap().path, "foo.txt");
    }

    #[tokio::test]
    async fn retype_emits_delete_then_create() {
        let (mut logic, mut rx) = seeded_logic();
        // we think src is a symlink; the peer has a newer real directory
        logic.handle(SyncEvent::Tree(Update::symlink("src", 1000, "target"))).await.unwrap();
        logic.handle(SyncEvent::Tree(remote(Update::directory("src", 2000)))).await.unwrap();
        logic.diff().await.unwrap();
        let first = rx.save_to_local.try_recv().unwrap();
        assert!(first.is_delete());
        assert_eq!(first.path, "src");
        assert_eq!(first.mod_time, 1000);
        let second = rx.save_to_local.try_recv().unwrap();
        assert!(matches!(second.kind, UpdateKind::Directory));
        assert_eq!(second.mod_time, 2000);
    }

    #[tokio::test]
    async fn malformed_paths_are_rejected_and_counted() {
        let (mut logic, mut rx) = seeded_logic();
        logic.handle(SyncEvent::Tree(Update::file("../evil", 5000))).await.unwrap();
        logic.handle(SyncEvent::Tree(remote(Update::file("/abs", 5000)))).await.unwrap();
        logic.diff().await.unwrap();
        assert_eq!(logic.rejected_updates(), 2);
        assert!(rx.save_to_remote.try_recv().is_err());
        assert!(rx.save_to_local.try_recv().is_err());
    }

    #[tokio::test]
    async fn stale_remote_loses_and_nothing_is_emitted_locally() {
        let (mut logic, mut rx) = seeded_logic();
        logic.handle(SyncEvent::Tree(Update::file("foo.txt", 2_000_000))).await.unwrap();
        logic
            .handle(SyncEvent::Tree(remote(Update::file("foo.txt", 1_000_000).with_data(b"old".to_vec()))))
            .await
            .unwrap();
        logic.diff().await.unwrap();
        assert!(rx.save_to_local.try_recv().is_err());
        // our newer copy goes out instead
        assert_eq!(rx.save_to_remote.try_recv().unwrap().path, "foo.txt");
    }
}
