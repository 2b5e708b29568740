use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use async_trait::async_trait;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{error, warn};
use walkdir::WalkDir;

use crate::queues::SyncEvent;
use crate::update::Update;

/// Suffix of our own atomic-replace temp files; their events are noise.
const TMP_SUFFIX: &str = ".msync-tmp";

/// Source of local filesystem events for one mount.
///
/// Implementations push [`SyncEvent::Tree`] items onto the incoming queue as
/// changes happen; the scan is pulled once at session start. Distinct
/// backends (OS-native, polling, editor-fed) plug in at session construction.
#[async_trait]
pub trait FileWatcher: Send + 'static {
    /// Metadata snapshot of the whole mount: directories, regular files
    /// (no bodies), and symlinks with their recorded targets. Never follows
    /// a link.
    async fn perform_initial_scan(&mut self) -> anyhow::Result<Vec<Update>>;

    fn on_start(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_stop(&mut self) {}

    /// One iteration of whatever the backend needs to do; returns an
    /// optional pause before the next call.
    async fn run_one_loop(&mut self) -> anyhow::Result<Option<Duration>>;
}

/// OS-native watcher: notify events, re-stat on arrival, pushed straight
/// onto the incoming queue from the callback thread. Blocking on a full
/// queue there is the backpressure the pipeline wants.
pub struct NotifyFileWatcher {
    root: PathBuf,
    events: mpsc::Sender<SyncEvent>,
    watcher: Option<RecommendedWatcher>,
}

impl NotifyFileWatcher {
    pub fn new(root: impl Into<PathBuf>, events: mpsc::Sender<SyncEvent>) -> NotifyFileWatcher {
        NotifyFileWatcher { root: root.into(), events, watcher: None }
    }
}

#[async_trait]
impl FileWatcher for NotifyFileWatcher {
    async fn perform_initial_scan(&mut self) -> anyhow::Result<Vec<Update>> {
        Ok(scan_mount(&self.root))
    }

    fn on_start(&mut self) -> anyhow::Result<()> {
        let root = self.root.clone();
        let tx = self.events.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    for path in &event.paths {
                        if let Some(update) = update_for_path(&root, path) {
                            let _ = tx.blocking_send(SyncEvent::Tree(update));
                        }
                    }
                }
                Err(e) => error!(error = %e, "watch error"),
            },
            notify::Config::default(),
        )?;
        watcher.watch(&self.root, RecursiveMode::Recursive)?;
        self.watcher = Some(watcher);
        Ok(())
    }

    fn on_stop(&mut self) {
        self.watcher.take();
    }

    async fn run_one_loop(&mut self) -> anyhow::Result<Option<Duration>> {
        // events arrive via the callback; nothing to poll here
        Ok(Some(Duration::from_millis(500)))
    }
}

/// Canned watcher for tests: serves a fixed scan and then idles. Live
/// events are injected by whoever holds the incoming queue sender.
pub struct StubFileWatcher {
    scan: Vec<Update>,
}

impl StubFileWatcher {
    pub fn new(scan: Vec<Update>) -> StubFileWatcher {
        StubFileWatcher { scan }
    }
}

#[async_trait]
impl FileWatcher for StubFileWatcher {
    async fn perform_initial_scan(&mut self) -> anyhow::Result<Vec<Update>> {
        Ok(self.scan.clone())
    }

    async fn run_one_loop(&mut self) -> anyhow::Result<Option<Duration>> {
        Ok(Some(Duration::from_millis(50)))
    }
}

/// Walks the mount (never following links) and produces metadata updates,
/// parents before children.
pub fn scan_mount(root: &Path) -> Vec<Update> {
    let mut out = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).into_iter().filter_map(|e| e.ok()) {
        if entry.path() == root {
            continue;
        }
        if let Some(update) = update_for_path(root, entry.path()) {
            out.push(update);
        }
    }
    out
}

/// Stats `abs` (without following links) and builds the update describing
/// its current state; a missing path becomes a tombstone. Returns `None`
/// for the root itself, paths outside the mount, and our own temp files.
pub fn update_for_path(root: &Path, abs: &Path) -> Option<Update> {
    let rel = abs.strip_prefix(root).ok()?;
    let rel = to_slash(rel);
    if rel.is_empty() || rel.ends_with(TMP_SUFFIX) {
        return None;
    }
    let meta = match std::fs::symlink_metadata(abs) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Some(Update::tombstone(rel, 0));
        }
        Err(e) => {
            warn!(path = %rel, error = %e, "could not stat changed path");
            return None;
        }
    };
    let mod_time = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    if meta.file_type().is_symlink() {
        let target = match std::fs::read_link(abs) {
            Ok(t) => t,
            Err(e) => {
                warn!(path = %rel, error = %e, "could not read symlink target");
                return None;
            }
        };
        let parent = rel.rsplit_once('/').map(|(p, _)| p).unwrap_or("");
        let target = rewrite_symlink_target(root, parent, &target);
        Some(Update::symlink(rel, mod_time, target))
    } else if meta.is_dir() {
        Some(Update::directory(rel, mod_time))
    } else {
        let mut update = Update::file(rel.clone(), mod_time).with_executable(is_executable(&meta));
        if rel == ".gitignore" || rel.ends_with("/.gitignore") {
            // best effort; a half-written or non-UTF-8 file just means no
            // rule change this round
            match std::fs::read_to_string(abs) {
                Ok(text) => update = update.with_ignore_string(text),
                Err(e) => warn!(path = %rel, error = %e, "could not read .gitignore contents"),
            }
        }
        Some(update)
    }
}

/// An absolute target inside the mount is rewritten relative to the link's
/// parent so it stays valid on the other side; anything else is kept as
/// recorded.
fn rewrite_symlink_target(root: &Path, link_parent: &str, target: &Path) -> String {
    if target.is_absolute() {
        if let Ok(stripped) = target.strip_prefix(root) {
            return relativize(link_parent, &to_slash(stripped));
        }
    }
    target.to_string_lossy().replace('\\', "/")
}

/// Relative path from directory `from_dir` to `to`, both mount-relative.
fn relativize(from_dir: &str, to: &str) -> String {
    let from: Vec<&str> = from_dir.split('/').filter(|s| !s.is_empty()).collect();
    let to_segs: Vec<&str> = to.split('/').filter(|s| !s.is_empty()).collect();
    let common = from.iter().zip(&to_segs).take_while(|(a, b)| a == b).count();
    let mut out: Vec<&str> = vec![".."; from.len() - common];
    out.extend(&to_segs[common..]);
    out.join("/")
}

fn to_slash(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(unix)]
fn is_executable(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &std::fs::Metadata) -> bool {
    false
}
