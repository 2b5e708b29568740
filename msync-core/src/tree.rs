use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::info;

use crate::rules::PathRules;
use crate::update::{validate_path, Update, UpdateKind};

/// Stable handle into the tree's node arena.
pub type NodeId = usize;

pub const ROOT: NodeId = 0;

/// Mod times are compared at whole-second precision; this is also the bump
/// applied when a restored file has to beat its own tombstone.
pub const MINIMUM_MILLIS_PRECISION: i64 = 1000;
const ONE_HOUR_MILLIS: i64 = 60 * 60 * 1000;
const ONE_MINUTE_MILLIS: i64 = 60 * 1000;

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// The entry kind a side currently claims for a node. Tombstones report as
/// files so that a delete never looks like a retype on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    File,
    Directory,
    Symlink,
}

pub fn node_type(u: &Update) -> NodeType {
    match u.kind {
        UpdateKind::Directory => NodeType::Directory,
        UpdateKind::Symlink { .. } => NodeType::Symlink,
        UpdateKind::File { .. } | UpdateKind::Tombstone => NodeType::File,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Local,
    Remote,
}

/// One entry in the tree, either a directory or a file/symlink.
#[derive(Debug)]
pub struct Node {
    parent: Option<NodeId>,
    name: String,
    children: Vec<NodeId>,
    /// Last known update from each side, path stripped to save memory.
    local: Option<Update>,
    remote: Option<Update>,
    /// Rules from an immediate `.gitignore` child, if any.
    ignore_rules: Option<PathRules>,
    is_dirty: bool,
    has_dirty_descendant: bool,
    /// Memoized ignore verdict; cleared whenever rules in scope change.
    should_ignore: Option<bool>,
}

impl Node {
    fn new(parent: Option<NodeId>, name: String) -> Node {
        Node {
            parent,
            name,
            children: Vec::new(),
            local: None,
            remote: None,
            ignore_rules: None,
            is_dirty: false,
            has_dirty_descendant: false,
            should_ignore: None,
        }
    }
}

/// A tree of file and directory metadata ([`Update`]s).
///
/// Comparing remote against local state is the whole job, so both sides'
/// metadata live on the same node. Updates stored here are metadata only;
/// a remote file body rides its slot just long enough to be handed to the
/// save stage.
///
/// Not thread safe: the tree is owned by the sync worker and fed from its
/// single mailbox.
pub struct UpdateTree {
    nodes: Vec<Node>,
    includes: PathRules,
    excludes: PathRules,
    debug_prefixes: Vec<String>,
}

impl UpdateTree {
    pub fn new(includes: PathRules, excludes: PathRules, debug_prefixes: Vec<String>) -> UpdateTree {
        let mut tree = UpdateTree {
            nodes: vec![Node::new(None, String::new())],
            includes,
            excludes,
            debug_prefixes,
        };
        // The root is always a directory on both sides.
        tree.set_slot(ROOT, Update::directory("", 0), Side::Local, true);
        tree.set_slot(ROOT, { let mut u = Update::directory("", 0); u.local = false; u }, Side::Remote, true);
        tree
    }

    /// A tree with no configured rules; handy in tests.
    pub fn new_root() -> UpdateTree {
        UpdateTree::new(PathRules::default(), PathRules::default(), Vec::new())
    }

    pub fn add_local(&mut self, update: Update) -> anyhow::Result<()> {
        self.add_update(update, Side::Local)
    }

    pub fn add_remote(&mut self, update: Update) -> anyhow::Result<()> {
        self.add_update(update, Side::Remote)
    }

    fn add_update(&mut self, update: Update, side: Side) -> anyhow::Result<()> {
        validate_path(&update.path)?;
        let id = self.find(&update.path);
        self.set_slot(id, update, side, true);
        Ok(())
    }

    /// Stores the state our own save stage just committed to disk. The
    /// mod-time adjustment rules are bypassed since the written state is
    /// known exactly; cascades and dirty tracking still apply.
    pub fn set_applied_local(&mut self, update: Update) {
        let id = self.find(&update.path);
        self.set_slot(id, update, Side::Local, false);
    }

    /// Navigates to the node for `path`, creating placeholder intermediates
    /// (with neither side populated) as needed. An empty path is the root.
    pub fn find(&mut self, path: &str) -> NodeId {
        if path.is_empty() {
            return ROOT;
        }
        let mut current = ROOT;
        for segment in path.split('/') {
            current = self.child(current, segment);
        }
        current
    }

    /// Non-creating lookup.
    pub fn get(&self, path: &str) -> Option<NodeId> {
        if path.is_empty() {
            return Some(ROOT);
        }
        let mut current = ROOT;
        for segment in path.split('/') {
            current = *self.nodes[current]
                .children
                .iter()
                .find(|&&c| self.nodes[c].name == segment)?;
        }
        Some(current)
    }

    fn child(&mut self, id: NodeId, name: &str) -> NodeId {
        if let Some(&existing) = self.nodes[id].children.iter().find(|&&c| self.nodes[c].name == name) {
            return existing;
        }
        let child = self.nodes.len();
        self.nodes.push(Node::new(Some(id), name.to_string()));
        self.nodes[id].children.push(child);
        child
    }

    pub fn local(&self, id: NodeId) -> Option<&Update> {
        self.nodes[id].local.as_ref()
    }

    pub fn remote(&self, id: NodeId) -> Option<&Update> {
        self.nodes[id].remote.as_ref()
    }

    pub fn name_of(&self, id: NodeId) -> &str {
        &self.nodes[id].name
    }

    pub fn children_of(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id].children
    }

    /// Recomputes the stored-stripped path by walking parent edges.
    pub fn path_of(&self, id: NodeId) -> String {
        let mut segments = Vec::new();
        let mut current = Some(id);
        while let Some(c) = current {
            if c == ROOT {
                break;
            }
            segments.push(self.nodes[c].name.as_str());
            current = self.nodes[c].parent;
        }
        segments.reverse();
        segments.join("/")
    }

    /// Clone of the local slot with its path restored for emission. Local
    /// slots never carry bodies; the save-to-remote stage reads from disk.
    pub fn restore_local(&self, id: NodeId) -> Option<Update> {
        let mut u = self.nodes[id].local.clone()?;
        u.path = self.path_of(id);
        u.clear_data();
        Some(u)
    }

    /// The remote slot with path restored, moving any carried body out of the
    /// tree so stored state stays metadata-only.
    pub fn restore_remote_taking_data(&mut self, id: NodeId) -> Option<Update> {
        let path = self.path_of(id);
        let slot = self.nodes[id].remote.as_mut()?;
        let data = match &mut slot.kind {
            UpdateKind::File { data, .. } => data.take(),
            _ => None,
        };
        let mut u = slot.clone();
        u.path = path;
        if let UpdateKind::File { data: d, .. } = &mut u.kind {
            *d = data;
        }
        Some(u)
    }

    /// Drops any body the remote slot still carries (e.g. when the local side
    /// won the diff and the payload will never be applied).
    pub fn clear_remote_data(&mut self, id: NodeId) {
        if let Some(slot) = self.nodes[id].remote.as_mut() {
            slot.clear_data();
        }
    }

    pub fn is_local_newer(&self, id: NodeId) -> bool {
        is_newer(self.nodes[id].local.as_ref(), self.nodes[id].remote.as_ref())
    }

    pub fn is_remote_newer(&self, id: NodeId) -> bool {
        is_newer(self.nodes[id].remote.as_ref(), self.nodes[id].local.as_ref())
    }

    pub fn is_same_type(&self, id: NodeId) -> bool {
        let node = &self.nodes[id];
        match (&node.local, &node.remote) {
            (Some(l), Some(r)) => node_type(l) == node_type(r),
            _ => true,
        }
    }

    /// Whether this node is a directory as far as either side knows.
    pub fn is_directory(&self, id: NodeId) -> bool {
        let node = &self.nodes[id];
        if let Some(l) = &node.local {
            l.is_directory()
        } else if let Some(r) = &node.remote {
            r.is_directory()
        } else {
            false
        }
    }

    fn set_slot(&mut self, id: NodeId, mut update: Update, side: Side, adjust: bool) {
        let prior = match side {
            Side::Local => self.nodes[id].local.as_ref(),
            Side::Remote => self.nodes[id].remote.as_ref(),
        };
        if adjust {
            if let Some(prior) = prior {
                // Deletes don't carry a mod time, so keep the previous one.
                if update.is_delete() && update.mod_time == 0 {
                    update.mod_time = prior.mod_time;
                }
                // Every write to a child bumps a directory's mtime on disk,
                // which would drift us ahead of the peer, so directory mtimes
                // are pinned to their first-seen value.
                if update.is_directory() && prior.is_directory() {
                    update.mod_time = prior.mod_time;
                }
                // A restored file that kept its pre-delete timestamp (a `mv`
                // back, say) has to beat its own tombstone.
                if !update.is_delete() && prior.is_delete() && update.mod_time <= prior.mod_time {
                    update.mod_time = prior.mod_time + MINIMUM_MILLIS_PRECISION;
                }
                // Symmetrically, a delete arriving with a stale stamp has to
                // beat the live entry it is deleting.
                if update.is_delete() && !prior.is_delete() && update.mod_time < prior.mod_time {
                    update.mod_time = prior.mod_time + MINIMUM_MILLIS_PRECISION;
                }
            }
        }
        let was_directory = prior.map(|p| p.is_directory()).unwrap_or(false);
        let cascade = (was_directory && !update.is_directory()) || update.is_delete();
        update.path = String::new();
        match side {
            Side::Local => self.nodes[id].local = Some(update),
            Side::Remote => self.nodes[id].remote = Some(update),
        }
        if cascade {
            // No longer a directory, or deleted outright: every live
            // descendant on this side is now deleted too. Watchers usually
            // send the child deletes themselves; this covers the ones that
            // don't.
            let children = self.nodes[id].children.clone();
            for child in children {
                let live = match side {
                    Side::Local => self.nodes[child].local.as_ref(),
                    Side::Remote => self.nodes[child].remote.as_ref(),
                }
                .map(|u| !u.is_delete())
                .unwrap_or(false);
                if live {
                    self.set_slot(child, Update::tombstone("", 0), side, true);
                }
            }
        }
        self.update_parent_ignore_rules_if_needed(id);
        self.mark_dirty(id);
    }

    fn update_parent_ignore_rules_if_needed(&mut self, id: NodeId) {
        if self.nodes[id].name != ".gitignore" {
            return;
        }
        let Some(parent) = self.nodes[id].parent else { return };
        let text = if self.is_local_newer(id) {
            self.nodes[id].local.as_ref().and_then(|u| u.ignore_string.clone())
        } else if self.is_remote_newer(id) {
            self.nodes[id].remote.as_ref().and_then(|u| u.ignore_string.clone())
        } else {
            return;
        };
        self.set_ignore_rules(parent, &text.unwrap_or_default());
    }

    /// Installs `rules_text` on `id` and drops every memoized ignore verdict
    /// in its subtree.
    pub fn set_ignore_rules(&mut self, id: NodeId, rules_text: &str) {
        self.nodes[id].ignore_rules = Some(PathRules::new(rules_text));
        let mut queue = VecDeque::from([id]);
        while let Some(n) = queue.pop_front() {
            self.nodes[n].should_ignore = None;
            queue.extend(self.nodes[n].children.iter().copied());
        }
    }

    fn mark_dirty(&mut self, id: NodeId) {
        self.nodes[id].is_dirty = true;
        let mut current = self.nodes[id].parent;
        while let Some(p) = current {
            self.nodes[p].has_dirty_descendant = true;
            current = self.nodes[p].parent;
        }
    }

    /// Breadth-first sweep of dirty nodes, returning them in visit order.
    /// All dirty flags are cleared; clean subtrees are skipped entirely.
    pub fn visit_dirty(&mut self) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut queue = VecDeque::from([ROOT]);
        while let Some(id) = queue.pop_front() {
            if self.nodes[id].is_dirty {
                out.push(id);
                self.nodes[id].is_dirty = false;
            }
            let descend = self.nodes[id].has_dirty_descendant;
            self.nodes[id].has_dirty_descendant = false;
            if descend {
                queue.extend(self.nodes[id].children.iter().copied());
            }
        }
        out
    }

    /// Breadth-first walk of every node, descending while `visitor` returns
    /// true. Used for debugging and tests.
    pub fn visit(&self, visitor: &mut dyn FnMut(NodeId, &Node) -> bool) {
        let mut queue = VecDeque::from([ROOT]);
        while let Some(id) = queue.pop_front() {
            if visitor(id, &self.nodes[id]) {
                queue.extend(self.nodes[id].children.iter().copied());
            }
        }
    }

    pub fn visit_all(&self, visitor: &mut dyn FnMut(NodeId, &Node)) {
        self.visit(&mut |id, node| {
            visitor(id, node);
            true
        });
    }

    /// Whether this node is excluded from syncing.
    ///
    /// A node is ignored when any ancestor is ignored, when any ancestor's
    /// `.gitignore` rules match the path relative to that ancestor, or when
    /// the mount-wide extra excludes match — unless the extra includes match.
    /// Memoized per node; invalidated whenever rules in scope change.
    pub fn should_ignore(&mut self, id: NodeId) -> bool {
        if let Some(v) = self.nodes[id].should_ignore {
            return v;
        }
        let path = self.path_of(id);
        let is_dir = self.is_directory(id);
        let debug = self.debug_prefixes.iter().any(|p| path.starts_with(p.as_str()));
        let mut git_ignored = false;
        let mut ancestor = self.nodes[id].parent;
        while let Some(a) = ancestor {
            if self.should_ignore(a) {
                git_ignored = true;
                break;
            }
            let prefix_len = self.path_of(a).len();
            if let Some(rules) = &self.nodes[a].ignore_rules {
                // path dir1/dir2/foo.txt relative to dir1's rules is
                // dir2/foo.txt
                if rules.has_any_rules() && rules.matches(&path[prefix_len..], is_dir) {
                    git_ignored = true;
                    break;
                }
            }
            ancestor = self.nodes[a].parent;
        }
        let extra_included = self.includes.matches(&path, is_dir);
        let extra_excluded = self.excludes.matches(&path, is_dir);
        let verdict = (git_ignored || extra_excluded) && !extra_included;
        if debug {
            info!(path = %path, git_ignored, extra_included, extra_excluded, "ignore verdict");
        }
        self.nodes[id].should_ignore = Some(verdict);
        verdict
    }

    pub fn should_debug(&self, path: &str) -> bool {
        self.debug_prefixes.iter().any(|p| path.starts_with(p.as_str()))
    }

    /// One line per node with both sides' mod times; debugging aid.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        self.visit_all(&mut |id, node| {
            let fmt = |u: &Option<Update>| u.as_ref().map(|u| u.mod_time.to_string()).unwrap_or_else(|| "-".into());
            out.push_str(&format!(
                "{} local={} remote={}\n",
                self.path_of(id),
                fmt(&node.local),
                fmt(&node.remote),
            ));
        });
        out
    }
}

/// Whether `a` is the side to propagate from, given `b` as the other side.
///
/// Times are compared sanity-checked and second-quantized. On a tie, a
/// delete loses to a live entry with the same stamp (the live file wins a
/// restore race). A winning verdict is still suppressed for no-op deletes
/// and for live-directory mtime noise.
fn is_newer(a: Option<&Update>, b: Option<&Update>) -> bool {
    let Some(a) = a else { return false };
    let a_time = sanity_check_timestamp(a.mod_time);
    let b_time = b.map(|b| sanity_check_timestamp(b.mod_time)).unwrap_or(0);

    if a_time == b_time {
        if let Some(b) = b {
            // Deletes keep the mod time of the file they removed, so the
            // delete flag is the tie-break.
            if a.is_delete() && !b.is_delete() {
                return true;
            }
            if !a.is_delete() && b.is_delete() {
                return false;
            }
        }
    }

    let newer = a_time > b_time || b.is_none();
    // No point sending a delete for something already gone over there.
    let noop_delete = a.is_delete() && b.map(|b| b.is_delete()).unwrap_or(true);
    // Writes into a directory bump its mtime locally; both sides being live
    // directories means there is nothing real to sync.
    let dir_noise = !a.is_delete()
        && a.is_directory()
        && b.map(|b| b.is_directory() && !b.is_delete()).unwrap_or(false);
    newer && !noop_delete && !dir_noise
}

/// Guards against far-future stamps (a Jan-3000 mtime would be unbeatable)
/// and quantizes to whole seconds, since watchers and stat calls disagree
/// about sub-second precision. Literal values under a second pass through
/// untouched; unit tests lean on that.
pub fn sanity_check_timestamp(millis: i64) -> i64 {
    let now = now_millis();
    let millis = if millis > now + ONE_HOUR_MILLIS { now - ONE_MINUTE_MILLIS } else { millis };
    if millis < MINIMUM_MILLIS_PRECISION {
        millis
    } else {
        millis / MINIMUM_MILLIS_PRECISION * MINIMUM_MILLIS_PRECISION
    }
}
