use serde::{Deserialize, Serialize};

/// Placeholder body used during the seed exchange: a regular file streamed
/// with this payload is "metadata only, ask for the body if you need it".
/// The same bytes on an otherwise-empty update act as a body request.
pub const INITIAL_SYNC_MARKER: &[u8] = b"initialSyncMarker";

/// Longest path we accept at tree ingress.
pub const MAX_PATH_LEN: usize = 4096;

/// What kind of entry an [`Update`] describes.
///
/// Shared scalars (path, mod time) live on the `Update` itself; everything
/// kind-specific lives behind the tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateKind {
    File {
        executable: bool,
        /// Whole-file body. `None` for metadata-only messages; filled in by
        /// the save-to-remote stage right before a send.
        data: Option<Vec<u8>>,
    },
    Directory,
    Symlink {
        /// Raw target as recorded on disk, rewritten to be relative to the
        /// link's parent when the on-disk value was absolute inside the mount.
        target: String,
    },
    /// Delete marker. Keeps the pre-delete mod time for ordering.
    Tombstone,
}

/// A metadata record for one path, relative to the mount root.
///
/// `path` uses forward slashes, never starts or ends with one, and the empty
/// string means the mount root itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    pub path: String,
    /// Milliseconds since epoch; 0 is only ever valid on tombstones.
    pub mod_time: i64,
    pub kind: UpdateKind,
    /// Full `.gitignore` text; only populated when `path` ends with
    /// `.gitignore`.
    pub ignore_string: Option<String>,
    /// True when this update originated on this side of the session.
    pub local: bool,
}

impl Update {
    pub fn file(path: impl Into<String>, mod_time: i64) -> Update {
        Update {
            path: path.into(),
            mod_time,
            kind: UpdateKind::File { executable: false, data: None },
            ignore_string: None,
            local: true,
        }
    }

    pub fn directory(path: impl Into<String>, mod_time: i64) -> Update {
        Update {
            path: path.into(),
            mod_time,
            kind: UpdateKind::Directory,
            ignore_string: None,
            local: true,
        }
    }

    pub fn symlink(path: impl Into<String>, mod_time: i64, target: impl Into<String>) -> Update {
        Update {
            path: path.into(),
            mod_time,
            kind: UpdateKind::Symlink { target: target.into() },
            ignore_string: None,
            local: true,
        }
    }

    pub fn tombstone(path: impl Into<String>, mod_time: i64) -> Update {
        Update {
            path: path.into(),
            mod_time,
            kind: UpdateKind::Tombstone,
            ignore_string: None,
            local: true,
        }
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Update {
        if let UpdateKind::File { data: slot, .. } = &mut self.kind {
            *slot = Some(data);
        }
        self
    }

    pub fn with_executable(mut self, exec: bool) -> Update {
        if let UpdateKind::File { executable, .. } = &mut self.kind {
            *executable = exec;
        }
        self
    }

    pub fn with_ignore_string(mut self, text: impl Into<String>) -> Update {
        self.ignore_string = Some(text.into());
        self
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.kind, UpdateKind::Directory)
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self.kind, UpdateKind::Symlink { .. })
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind, UpdateKind::File { .. })
    }

    pub fn is_delete(&self) -> bool {
        matches!(self.kind, UpdateKind::Tombstone)
    }

    pub fn symlink_target(&self) -> Option<&str> {
        match &self.kind {
            UpdateKind::Symlink { target } => Some(target),
            _ => None,
        }
    }

    pub fn is_executable(&self) -> bool {
        matches!(self.kind, UpdateKind::File { executable: true, .. })
    }

    pub fn data(&self) -> Option<&[u8]> {
        match &self.kind {
            UpdateKind::File { data, .. } => data.as_deref(),
            _ => None,
        }
    }

    /// True when the body slot holds the seed placeholder instead of real
    /// contents.
    pub fn has_marker_data(&self) -> bool {
        self.data() == Some(INITIAL_SYNC_MARKER)
    }

    /// Drop any carried body, leaving a metadata-only record.
    pub fn clear_data(&mut self) {
        if let UpdateKind::File { data, .. } = &mut self.kind {
            *data = None;
        }
    }

    /// A metadata-only clone, no matter how large the carried body is.
    pub fn without_data(&self) -> Update {
        let mut u = self.clone();
        u.clear_data();
        u
    }
}

/// Validates a path at tree ingress. Rejects absolute and trailing-slash
/// forms, parent-directory escapes, and unreasonable lengths.
pub fn validate_path(path: &str) -> anyhow::Result<()> {
    if path.starts_with('/') || path.ends_with('/') {
        anyhow::bail!("path should not start or end with slash: {path:?}");
    }
    if path.len() > MAX_PATH_LEN {
        anyhow::bail!("path exceeds {MAX_PATH_LEN} bytes");
    }
    if path.split('/').any(|seg| seg == "..") {
        anyhow::bail!("path escapes the mount root: {path:?}");
    }
    Ok(())
}

/// Shortens long paths for log lines, keeping the tail that people care about.
pub fn abbreviate_path(path: &str) -> &str {
    const KEEP: usize = 60;
    if path.len() <= KEEP {
        return path;
    }
    let mut cut = path.len() - KEEP;
    while !path.is_char_boundary(cut) {
        cut += 1;
    }
    &path[cut..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tombstone_has_no_data_or_target() {
        let u = Update::tombstone("foo.txt", 100);
        assert!(u.is_delete());
        assert!(u.data().is_none());
        assert!(u.symlink_target().is_none());
    }

    #[test]
    fn marker_data_detected() {
        let u = Update::file("foo.txt", 100).with_data(INITIAL_SYNC_MARKER.to_vec());
        assert!(u.has_marker_data());
        assert!(!Update::file("foo.txt", 100).with_data(b"abc".to_vec()).has_marker_data());
    }

    #[test]
    fn without_data_strips_body_only() {
        let u = Update::file("foo.txt", 100).with_data(b"abc".to_vec()).with_executable(true);
        let stripped = u.without_data();
        assert!(stripped.data().is_none());
        assert!(stripped.is_executable());
        assert_eq!(stripped.mod_time, 100);
    }

    #[test]
    fn rejects_bad_paths() {
        assert!(validate_path("/foo").is_err());
        assert!(validate_path("foo/").is_err());
        assert!(validate_path("foo/../bar").is_err());
        assert!(validate_path("..").is_err());
        assert!(validate_path("").is_ok());
        assert!(validate_path("foo/bar.txt").is_ok());
    }
}
