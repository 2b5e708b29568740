use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::rules::PathRules;
use crate::tree::UpdateTree;

/// Everything a session needs to know about one mount.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    /// Identifies the mount to the peer; `[A-Za-z0-9_-]+`.
    pub mount_key: String,
    /// Absolute path of the tree on this side.
    pub mount_root: PathBuf,
    /// Advisory only; sent to the peer in the hello.
    #[serde(default)]
    pub remote_root: Option<String>,
    /// Extra include rules, anchored at the mount root.
    #[serde(default)]
    pub includes: Vec<String>,
    /// Extra exclude rules, anchored at the mount root.
    #[serde(default = "MountConfig::default_excludes")]
    pub excludes: Vec<String>,
    /// Paths (by prefix) that get verbose sync logging.
    #[serde(default)]
    pub debug_prefixes: Vec<String>,
}

impl MountConfig {
    pub fn new(mount_key: impl Into<String>, mount_root: impl Into<PathBuf>) -> MountConfig {
        MountConfig {
            mount_key: mount_key.into(),
            mount_root: mount_root.into(),
            remote_root: None,
            includes: Vec::new(),
            excludes: MountConfig::default_excludes(),
            debug_prefixes: Vec::new(),
        }
    }

    fn default_excludes() -> Vec<String> {
        vec!["target/".to_string()]
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mount_key.is_empty()
            || !self
                .mount_key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            anyhow::bail!("mount key must match [A-Za-z0-9_-]+: {:?}", self.mount_key);
        }
        if !self.mount_root.is_absolute() {
            anyhow::bail!("mount root must be absolute: {:?}", self.mount_root);
        }
        Ok(())
    }

    pub fn include_rules(&self) -> PathRules {
        PathRules::from_lines(self.includes.iter().map(String::as_str))
    }

    pub fn exclude_rules(&self) -> PathRules {
        PathRules::from_lines(self.excludes.iter().map(String::as_str))
    }

    /// A fresh tree carrying this mount's rules; built once per session.
    pub fn new_tree(&self) -> UpdateTree {
        UpdateTree::new(self.include_rules(), self.exclude_rules(), self.debug_prefixes.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_mount_key() {
        let mut cfg = MountConfig::new("work_repo-1", "/tmp/mount");
        assert!(cfg.validate().is_ok());
        cfg.mount_key = "bad key!".into();
        assert!(cfg.validate().is_err());
        cfg.mount_key = "".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_relative_mount_root() {
        let cfg = MountConfig::new("key", "relative/path");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn target_is_excluded_by_default() {
        let cfg = MountConfig::new("key", "/tmp/mount");
        let rules = cfg.exclude_rules();
        assert!(rules.matches("target", true));
        assert!(rules.matches("target/debug/foo", false));
        assert!(!rules.matches("src/main.rs", false));
    }
}
