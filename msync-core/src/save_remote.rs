use std::io;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::fs_access::FileAccess;
use crate::proto::WireMessage;
use crate::tasks::StopSignal;
use crate::update::{abbreviate_path, Update, UpdateKind};

/// Reads file bodies off disk and forwards outgoing updates to the peer.
pub struct SaveToRemote {
    fs: Arc<dyn FileAccess>,
    outgoing: mpsc::Sender<WireMessage>,
}

impl SaveToRemote {
    pub fn new(fs: Arc<dyn FileAccess>, outgoing: mpsc::Sender<WireMessage>) -> SaveToRemote {
        SaveToRemote { fs, outgoing }
    }

    pub async fn run(
        self,
        mut rx: mpsc::Receiver<Update>,
        mut stop: StopSignal,
    ) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = stop.wait() => break,
                update = rx.recv() => {
                    let Some(update) = update else { break };
                    self.send(update).await?;
                }
            }
        }
        Ok(())
    }

    pub async fn send(&self, mut update: Update) -> anyhow::Result<()> {
        update.local = false;
        if let UpdateKind::File { data, .. } = &mut update.kind {
            if data.is_none() {
                match self.fs.read(&update.path).await {
                    Ok(bytes) => *data = Some(bytes),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        // the file was very transient; just drop it
                        debug!(path = %update.path, "file vanished before read, dropping");
                        return Ok(());
                    }
                    Err(e) => {
                        error!(path = %update.path, error = %e, "could not read file for sending");
                        return Ok(());
                    }
                }
            }
        }
        info!(
            path = abbreviate_path(&update.path),
            dir = update.is_directory(),
            delete = update.is_delete(),
            bytes = update.data().map(<[u8]>::len).unwrap_or(0),
            "sending"
        );
        self.outgoing
            .send(WireMessage::Update(update))
            .await
            .map_err(|_| anyhow::anyhow!("outgoing queue closed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs_access::StubFileAccess;
    use tokio::sync::mpsc;

    fn setup() -> (SaveToRemote, Arc<StubFileAccess>, mpsc::Receiver<WireMessage>) {
        let fs = Arc::new(StubFileAccess::new());
        let (tx, rx) = mpsc::channel(64);
        (SaveToRemote::new(fs.clone(), tx), fs, rx)
    }

    #[tokio::test]
    async fn file_body_is_read_from_disk() {
        let (save, fs, mut rx) = setup();
        fs.put_file("src/lib.rs", b"pub fn x() {}", 5000);
        save.send(Update::file("src/lib.rs", 5000)).await.unwrap();
        match rx.try_recv().unwrap() {
            WireMessage::Update(u) => {
                assert_eq!(u.data(), Some(&b"pub fn x() {}"[..]));
                assert!(!u.local);
            }
            other => panic!("expected an update, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn vanished_file_is_silently_dropped() {
        let (save, _fs, mut rx) = setup();
        save.send(Update::file("gone.txt", 5000)).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn deletes_and_symlinks_pass_through_without_reads() {
        let (save, _fs, mut rx) = setup();
        save.send(Update::tombstone("old.txt", 5000)).await.unwrap();
        save.send(Update::symlink("link", 5000, "a")).await.unwrap();
        save.send(Update::directory("dir", 5000)).await.unwrap();
        for _ in 0..3 {
            match rx.try_recv().unwrap() {
                WireMessage::Update(u) => assert!(u.data().is_none()),
                other => panic!("expected an update, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn already_attached_body_is_kept() {
        let (save, _fs, mut rx) = setup();
        save.send(Update::file("x", 5000).with_data(b"inline".to_vec())).await.unwrap();
        match rx.try_recv().unwrap() {
            WireMessage::Update(u) => assert_eq!(u.data(), Some(&b"inline"[..])),
            other => panic!("expected an update, got {other:?}"),
        }
    }
}
