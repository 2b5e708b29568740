use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use filetime::FileTime;

use crate::update::Update;

/// Filesystem reads and writes, always mount-relative.
///
/// The save stages are the only writers within a mount, so implementations
/// may assume no concurrent mutation of the same path. The stub
/// implementation keeps session tests hermetic.
#[async_trait]
pub trait FileAccess: Send + Sync + 'static {
    async fn read(&self, path: &str) -> io::Result<Vec<u8>>;

    /// Atomic replace: the new contents appear under `path` all at once.
    /// Missing parent directories are created.
    async fn write(&self, path: &str, data: &[u8]) -> io::Result<()>;

    async fn mkdir(&self, path: &str) -> io::Result<()>;

    /// Removes a file, symlink, or directory tree; missing paths are fine.
    async fn delete(&self, path: &str) -> io::Result<()>;

    /// Replaces whatever is at `path` with a symlink to `target`.
    async fn create_symlink(&self, path: &str, target: &str) -> io::Result<()>;

    async fn read_symlink(&self, path: &str) -> io::Result<String>;

    /// Never follows a symlink; writes must be durable before this runs.
    async fn set_mod_time(&self, path: &str, millis: i64) -> io::Result<()>;

    async fn get_mod_time(&self, path: &str) -> io::Result<i64>;

    async fn set_executable(&self, path: &str) -> io::Result<()>;

    /// Clears a read-only bit left behind by overzealous code generators.
    async fn set_writable(&self, path: &str) -> io::Result<()>;

    async fn exists(&self, path: &str) -> bool;
}

/// Real filesystem access rooted at an absolute base directory.
pub struct NativeFileAccess {
    root: PathBuf,
}

impl NativeFileAccess {
    pub fn new(root: impl Into<PathBuf>) -> NativeFileAccess {
        NativeFileAccess { root: root.into() }
    }

    fn abs(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    fn tmp_path(abs: &Path) -> PathBuf {
        let name = abs.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        abs.with_file_name(format!(".{name}.msync-tmp"))
    }
}

#[async_trait]
impl FileAccess for NativeFileAccess {
    async fn read(&self, path: &str) -> io::Result<Vec<u8>> {
        tokio::fs::read(self.abs(path)).await
    }

    async fn write(&self, path: &str, data: &[u8]) -> io::Result<()> {
        let abs = self.abs(path);
        if let Some(parent) = abs.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = Self::tmp_path(&abs);
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &abs).await
    }

    async fn mkdir(&self, path: &str) -> io::Result<()> {
        tokio::fs::create_dir_all(self.abs(path)).await
    }

    async fn delete(&self, path: &str) -> io::Result<()> {
        let abs = self.abs(path);
        let meta = match tokio::fs::symlink_metadata(&abs).await {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        if meta.is_dir() {
            tokio::fs::remove_dir_all(&abs).await
        } else {
            tokio::fs::remove_file(&abs).await
        }
    }

    async fn create_symlink(&self, path: &str, target: &str) -> io::Result<()> {
        let abs = self.abs(path);
        if let Some(parent) = abs.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match tokio::fs::remove_file(&abs).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        #[cfg(unix)]
        {
            tokio::fs::symlink(target, &abs).await
        }
        #[cfg(not(unix))]
        {
            let _ = target;
            Err(io::Error::new(io::ErrorKind::Unsupported, "symlinks unsupported on this platform"))
        }
    }

    async fn read_symlink(&self, path: &str) -> io::Result<String> {
        let target = tokio::fs::read_link(self.abs(path)).await?;
        Ok(target.to_string_lossy().replace('\\', "/"))
    }

    async fn set_mod_time(&self, path: &str, millis: i64) -> io::Result<()> {
        let abs = self.abs(path);
        let time = FileTime::from_unix_time(millis / 1000, ((millis % 1000) * 1_000_000) as u32);
        tokio::task::spawn_blocking(move || filetime::set_symlink_file_times(&abs, time, time))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
    }

    async fn get_mod_time(&self, path: &str) -> io::Result<i64> {
        let meta = tokio::fs::symlink_metadata(self.abs(path)).await?;
        let mtime = FileTime::from_last_modification_time(&meta);
        Ok(mtime.unix_seconds() * 1000 + i64::from(mtime.nanoseconds()) / 1_000_000)
    }

    async fn set_executable(&self, path: &str) -> io::Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let abs = self.abs(path);
            let meta = tokio::fs::metadata(&abs).await?;
            let mut perms = meta.permissions();
            perms.set_mode(perms.mode() | 0o100);
            tokio::fs::set_permissions(&abs, perms).await
        }
        #[cfg(not(unix))]
        {
            let _ = path;
            Ok(())
        }
    }

    async fn set_writable(&self, path: &str) -> io::Result<()> {
        let abs = self.abs(path);
        let meta = tokio::fs::metadata(&abs).await?;
        let mut perms = meta.permissions();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            perms.set_mode(perms.mode() | 0o200);
        }
        #[cfg(not(unix))]
        perms.set_readonly(false);
        tokio::fs::set_permissions(&abs, perms).await
    }

    async fn exists(&self, path: &str) -> bool {
        tokio::fs::symlink_metadata(self.abs(path)).await.is_ok()
    }
}

#[derive(Debug, Clone)]
enum StubEntry {
    Dir,
    File { data: Vec<u8>, executable: bool, writable: bool },
    Symlink { target: String },
}

#[derive(Default)]
struct StubState {
    entries: HashMap<String, StubEntry>,
    mod_times: HashMap<String, i64>,
}

/// In-memory [`FileAccess`] for tests: a flat map of paths to entries plus
/// recorded mod times. Also doubles as the scan source for stubbed watchers.
#[derive(Default)]
pub struct StubFileAccess {
    state: Mutex<StubState>,
}

impl StubFileAccess {
    pub fn new() -> StubFileAccess {
        StubFileAccess::default()
    }

    pub fn put_file(&self, path: &str, data: &[u8], mod_time: i64) {
        let mut st = self.state.lock().unwrap();
        Self::ensure_parents(&mut st, path);
        st.entries.insert(
            path.to_string(),
            StubEntry::File { data: data.to_vec(), executable: false, writable: true },
        );
        st.mod_times.insert(path.to_string(), mod_time);
    }

    pub fn put_dir(&self, path: &str, mod_time: i64) {
        let mut st = self.state.lock().unwrap();
        Self::ensure_parents(&mut st, path);
        st.entries.insert(path.to_string(), StubEntry::Dir);
        st.mod_times.insert(path.to_string(), mod_time);
    }

    pub fn put_symlink(&self, path: &str, target: &str, mod_time: i64) {
        let mut st = self.state.lock().unwrap();
        Self::ensure_parents(&mut st, path);
        st.entries.insert(path.to_string(), StubEntry::Symlink { target: target.to_string() });
        st.mod_times.insert(path.to_string(), mod_time);
    }

    /// Marks an existing file read-only, as a code generator might.
    pub fn set_read_only(&self, path: &str) {
        let mut st = self.state.lock().unwrap();
        if let Some(StubEntry::File { writable, .. }) = st.entries.get_mut(path) {
            *writable = false;
        }
    }

    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        let st = self.state.lock().unwrap();
        match st.entries.get(path) {
            Some(StubEntry::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn symlink_target(&self, path: &str) -> Option<String> {
        let st = self.state.lock().unwrap();
        match st.entries.get(path) {
            Some(StubEntry::Symlink { target }) => Some(target.clone()),
            _ => None,
        }
    }

    pub fn is_dir(&self, path: &str) -> bool {
        matches!(self.state.lock().unwrap().entries.get(path), Some(StubEntry::Dir))
    }

    pub fn is_executable_entry(&self, path: &str) -> bool {
        matches!(
            self.state.lock().unwrap().entries.get(path),
            Some(StubEntry::File { executable: true, .. })
        )
    }

    pub fn mod_time(&self, path: &str) -> Option<i64> {
        self.state.lock().unwrap().mod_times.get(path).copied()
    }

    /// Metadata snapshot of everything in the stub, parents first, the shape
    /// an initial scan produces.
    pub fn scan(&self) -> Vec<Update> {
        let st = self.state.lock().unwrap();
        let mut paths: Vec<&String> = st.entries.keys().collect();
        paths.sort_by(|a, b| {
            (a.matches('/').count(), a.as_str()).cmp(&(b.matches('/').count(), b.as_str()))
        });
        paths
            .into_iter()
            .map(|p| {
                let mod_time = st.mod_times.get(p).copied().unwrap_or(0);
                match &st.entries[p] {
                    StubEntry::Dir => Update::directory(p.clone(), mod_time),
                    StubEntry::Symlink { target } => Update::symlink(p.clone(), mod_time, target.clone()),
                    StubEntry::File { executable, data, .. } => {
                        let mut u = Update::file(p.clone(), mod_time).with_executable(*executable);
                        if p == ".gitignore" || p.ends_with("/.gitignore") {
                            u = u.with_ignore_string(String::from_utf8_lossy(data).into_owned());
                        }
                        u
                    }
                }
            })
            .collect()
    }

    fn ensure_parents(st: &mut StubState, path: &str) {
        let mut prefix = String::new();
        let Some((dirs, _leaf)) = path.rsplit_once('/') else { return };
        for seg in dirs.split('/') {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(seg);
            st.entries.entry(prefix.clone()).or_insert(StubEntry::Dir);
        }
    }

    fn not_found(path: &str) -> io::Error {
        io::Error::new(io::ErrorKind::NotFound, format!("no such stub entry: {path}"))
    }
}

#[async_trait]
impl FileAccess for StubFileAccess {
    async fn read(&self, path: &str) -> io::Result<Vec<u8>> {
        let st = self.state.lock().unwrap();
        match st.entries.get(path) {
            Some(StubEntry::File { data, .. }) => Ok(data.clone()),
            _ => Err(Self::not_found(path)),
        }
    }

    async fn write(&self, path: &str, data: &[u8]) -> io::Result<()> {
        let mut st = self.state.lock().unwrap();
        if let Some(StubEntry::File { writable: false, .. }) = st.entries.get(path) {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, format!("read-only: {path}")));
        }
        Self::ensure_parents(&mut st, path);
        let executable = matches!(st.entries.get(path), Some(StubEntry::File { executable: true, .. }));
        st.entries.insert(path.to_string(), StubEntry::File { data: data.to_vec(), executable, writable: true });
        Ok(())
    }

    async fn mkdir(&self, path: &str) -> io::Result<()> {
        let mut st = self.state.lock().unwrap();
        Self::ensure_parents(&mut st, path);
        st.entries.entry(path.to_string()).or_insert(StubEntry::Dir);
        Ok(())
    }

    async fn delete(&self, path: &str) -> io::Result<()> {
        let mut st = self.state.lock().unwrap();
        st.entries.remove(path);
        st.mod_times.remove(path);
        let prefix = format!("{path}/");
        st.entries.retain(|p, _| !p.starts_with(&prefix));
        st.mod_times.retain(|p, _| !p.starts_with(&prefix));
        Ok(())
    }

    async fn create_symlink(&self, path: &str, target: &str) -> io::Result<()> {
        let mut st = self.state.lock().unwrap();
        Self::ensure_parents(&mut st, path);
        st.entries.insert(path.to_string(), StubEntry::Symlink { target: target.to_string() });
        Ok(())
    }

    async fn read_symlink(&self, path: &str) -> io::Result<String> {
        let st = self.state.lock().unwrap();
        match st.entries.get(path) {
            Some(StubEntry::Symlink { target }) => Ok(target.clone()),
            _ => Err(Self::not_found(path)),
        }
    }

    async fn set_mod_time(&self, path: &str, millis: i64) -> io::Result<()> {
        let mut st = self.state.lock().unwrap();
        if !st.entries.contains_key(path) {
            return Err(Self::not_found(path));
        }
        st.mod_times.insert(path.to_string(), millis);
        Ok(())
    }

    async fn get_mod_time(&self, path: &str) -> io::Result<i64> {
        let st = self.state.lock().unwrap();
        st.mod_times.get(path).copied().ok_or_else(|| Self::not_found(path))
    }

    async fn set_executable(&self, path: &str) -> io::Result<()> {
        let mut st = self.state.lock().unwrap();
        match st.entries.get_mut(path) {
            Some(StubEntry::File { executable, .. }) => {
                *executable = true;
                Ok(())
            }
            _ => Err(Self::not_found(path)),
        }
    }

    async fn set_writable(&self, path: &str) -> io::Result<()> {
        let mut st = self.state.lock().unwrap();
        match st.entries.get_mut(path) {
            Some(StubEntry::File { writable, .. }) => {
                *writable = true;
                Ok(())
            }
            _ => Err(Self::not_found(path)),
        }
    }

    async fn exists(&self, path: &str) -> bool {
        self.state.lock().unwrap().entries.contains_key(path)
    }
}
