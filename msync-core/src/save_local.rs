use std::io;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::fs_access::FileAccess;
use crate::queues::SyncEvent;
use crate::tasks::StopSignal;
use crate::update::{abbreviate_path, Update, UpdateKind};

/// Applies remote-origin updates to the local filesystem.
///
/// The sole writer within its mount. After each committed apply it reports
/// back on the incoming queue so the sync worker can recognize the watcher
/// echo and keep its local slot honest.
pub struct SaveToLocal {
    fs: Arc<dyn FileAccess>,
    incoming: mpsc::Sender<SyncEvent>,
}

impl SaveToLocal {
    pub fn new(fs: Arc<dyn FileAccess>, incoming: mpsc::Sender<SyncEvent>) -> SaveToLocal {
        SaveToLocal { fs, incoming }
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
                    self.save(update).await?;
                }
            }
        }
        Ok(())
    }

    /// Applies one update. I/O failures drop the single update with a log;
    /// the marker payload reaching this stage is a bug upstream and fatal.
    pub async fn save(&self, update: Update) -> anyhow::Result<()> {
        if update.has_marker_data() {
            anyhow::bail!("sync marker reached the local save stage for {:?}", update.path);
        }
        match self.apply(&update).await {
            Ok(()) => {
                self.incoming
                    .send(SyncEvent::Saved(update.without_data()))
                    .await
                    .map_err(|_| anyhow::anyhow!("incoming queue closed"))?;
            }
            Err(e) => error!(path = %update.path, error = %e, "could not apply remote update"),
        }
        Ok(())
    }

    async fn apply(&self, update: &Update) -> io::Result<()> {
        let path = update.path.as_str();
        match &update.kind {
            UpdateKind::Tombstone => {
                info!(path = abbreviate_path(path), "remote delete");
                self.fs.delete(path).await
            }
            UpdateKind::Symlink { target } => {
                info!(path = abbreviate_path(path), target = %target, "remote symlink");
                self.fs.create_symlink(path, target).await?;
                // must not follow: the stamp belongs to the link itself
                self.fs.set_mod_time(path, update.mod_time).await
            }
            UpdateKind::Directory => {
                info!(path = abbreviate_path(path), "remote directory");
                self.fs.mkdir(path).await?;
                self.fs.set_mod_time(path, update.mod_time).await
            }
            UpdateKind::File { executable, data } => {
                info!(
                    path = abbreviate_path(path),
                    bytes = data.as_ref().map(Vec::len).unwrap_or(0),
                    "remote update"
                );
                let data = data.as_deref().unwrap_or_default();
                if let Err(e) = self.fs.write(path, data).await {
                    if e.kind() != io::ErrorKind::PermissionDenied {
                        return Err(e);
                    }
                    // code generators like to leave read-only files behind
                    warn!(path, "write denied; forcing writable and retrying once");
                    self.fs.set_writable(path).await?;
                    self.fs.write(path, data).await?;
                }
                if *executable {
                    self.fs.set_executable(path).await?;
                }
                self.fs.set_mod_time(path, update.mod_time).await
            }
        }
    }
}
