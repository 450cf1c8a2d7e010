//! Hierarchical usage accountant mirroring the cache's directory tree.
//! Every LFN event (open/close/stat-update) is folded into
//! the node for its containing directory; periodic reconciliation rolls
//! per-directory "here" usage up into subtree "recursive" usage so a
//! snapshot at any depth reports a coherent total.

use std::{collections::HashMap, path::Path};

use parking_lot::Mutex;
use serde::Serialize;

use crate::{file::StatsDelta, oss::OssError};

/// Counts that apply directly to one directory level ("here"), as opposed to
/// the subtree rooted at it ("recursive").
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub n_files_opened: u64,
    pub n_files_closed: u64,
    pub n_directories: u64,
    pub n_directories_removed: u64,
    /// Running total of bytes durably on disk for files under this
    /// directory (this level's share, not yet folded into `recursive`).
    /// Incremented as blocks are written, decremented as files are purged.
    pub bytes_on_disk: u64,
}

impl Usage {
    fn add(&mut self, other: &Usage) {
        self.n_files_opened += other.n_files_opened;
        self.n_files_closed += other.n_files_closed;
        self.n_directories += other.n_directories;
        self.n_directories_removed += other.n_directories_removed;
        self.bytes_on_disk += other.bytes_on_disk;
    }
}

/// Byte/time totals, folded the same way as [`Usage`] but kept separate
/// since timestamps join by `max` rather than sum.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatTotals {
    pub bytes_hit: u64,
    pub bytes_missed: u64,
    pub bytes_bypassed: u64,
    pub bytes_written: u64,
    pub files_removed: u64,
    pub bytes_removed: u64,
    pub cksum_errors: u64,
    pub last_open: Option<i64>,
    pub last_close: Option<i64>,
}

impl StatTotals {
    fn add_bytes(&mut self, delta: &StatsDelta) {
        self.bytes_hit += delta.bytes_hit;
        self.bytes_missed += delta.bytes_missed;
        self.bytes_bypassed += delta.bytes_bypassed;
        self.bytes_written += delta.bytes_written;
    }

    fn fold_child(&mut self, child: &StatTotals) {
        self.bytes_hit += child.bytes_hit;
        self.bytes_missed += child.bytes_missed;
        self.bytes_bypassed += child.bytes_bypassed;
        self.bytes_written += child.bytes_written;
        self.files_removed += child.files_removed;
        self.bytes_removed += child.bytes_removed;
        self.cksum_errors += child.cksum_errors;
        self.last_open = max_opt(self.last_open, child.last_open);
        self.last_close = max_opt(self.last_close, child.last_close);
    }
}

fn max_opt(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (Some(a), None) => Some(a),
        (None, b) => b,
    }
}

struct Node {
    children: HashMap<String, Node>,
    here_usage: Usage,
    recursive_usage: Usage,
    here_stats: StatTotals,
    recursive_stats: StatTotals,
}

impl Node {
    fn new() -> Self {
        Self {
            children: HashMap::new(),
            here_usage: Usage::default(),
            recursive_usage: Usage::default(),
            here_stats: StatTotals::default(),
            recursive_stats: StatTotals::default(),
        }
    }

    fn find_child(&mut self, name: &str, create: bool) -> Option<&mut Node> {
        if create {
            Some(self.children.entry(name.to_string()).or_insert_with(|| {
                Node::new()
            }))
        } else {
            self.children.get_mut(name)
        }
    }

    /// Walks (creating if asked) the path components, tracking whether any
    /// directory was newly created along the way.
    fn find_path(&mut self, components: &[&str], max_depth: usize, create: bool) -> (Option<&mut Node>, u64) {
        let mut node = self;
        let mut created = 0u64;
        for (depth, name) in components.iter().enumerate() {
            if depth >= max_depth {
                break;
            }
            let existed = node.children.contains_key(*name);
            match node.find_child(name, create) {
                Some(next) => {
                    if create && !existed {
                        created += 1;
                    }
                    node = next;
                }
                None => return (None, created),
            }
        }
        (Some(node), created)
    }

    /// Returns whether this node (or any descendant) removed a subdirectory
    /// during this pass; a node that just did so is not itself eligible for
    /// removal until the *next* pass, even if it is otherwise empty.
    fn recurse_update(&mut self, purge_empty_dirs: bool, depth_path: &mut Vec<String>, unlink_fn: &dyn Fn(&Path) -> Result<(), OssError>, root: &Path, removed_total: &mut u64) -> bool {
        self.recursive_usage = self.here_usage;
        self.recursive_stats = self.here_stats;

        let mut to_remove = Vec::new();
        let mut removed_here = false;
        for (name, child) in self.children.iter_mut() {
            depth_path.push(name.clone());
            let child_removed_any = child.recurse_update(purge_empty_dirs, depth_path, unlink_fn, root, removed_total);
            depth_path.pop();

            self.recursive_usage.add(&child.recursive_usage);
            self.recursive_stats.fold_child(&child.recursive_stats);

            let is_empty = child.children.is_empty()
                && child.here_usage.n_files_opened == child.here_usage.n_files_closed
                && child.here_usage.n_directories == 0
                && !child_removed_any;

            if purge_empty_dirs && is_empty {
                let mut candidate = root.to_path_buf();
                for part in depth_path.iter() {
                    candidate.push(part);
                }
                candidate.push(name);
                if unlink_fn(&candidate).is_ok() {
                    to_remove.push(name.clone());
                }
            }
        }

        for name in to_remove {
            self.children.remove(&name);
            self.here_usage.n_directories_removed += 1;
            *removed_total += 1;
            removed_here = true;
        }
        removed_here
    }
}

/// Snapshot of one DirState node for the periodic `DirStat.json` export.
#[derive(Debug, Clone, Serialize)]
pub struct DirStatNode {
    pub name: String,
    pub here_usage: Usage,
    pub recursive_usage: Usage,
    pub here_stats: StatTotals,
    pub recursive_stats: StatTotals,
    pub children: Vec<DirStatNode>,
}

/// Tree rooted at `/`, guarded by a single mutex. Short critical sections:
/// every public method locks once and returns.
pub struct DirState {
    root: Mutex<Node>,
}

impl Default for DirState {
    fn default() -> Self {
        Self::new()
    }
}

/// Splits an LFN or directory path into components, dropping the file name
/// component when `parse_as_lfn` is set.
fn split_path(path: &str, parse_as_lfn: bool) -> Vec<&str> {
    let mut parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if parse_as_lfn {
        parts.pop();
    }
    parts
}

impl DirState {
    pub fn new() -> Self {
        Self { root: Mutex::new(Node::new()) }
    }

    /// Finds (optionally creating) the directory node for `path`, capped at
    /// `max_depth` components. `parse_as_lfn` drops the trailing file-name
    /// component before resolving.
    pub fn find_path(&self, path: &str, max_depth: u32, parse_as_lfn: bool, create_if_missing: bool) -> bool {
        let components = split_path(path, parse_as_lfn);
        let mut root = self.root.lock();
        let (node, _created) = root.find_path(&components, max_depth as usize, create_if_missing);
        node.is_some()
    }

    /// Single-step sibling of [`Self::find_path`]: finds or creates the
    /// immediate child `name` of the root.
    pub fn find_dir(&self, name: &str, create: bool) -> bool {
        self.root.lock().find_child(name, create).is_some()
    }

    fn with_dir_mut<R>(&self, lfn: &str, f: impl FnOnce(&mut Node) -> R) -> R {
        let components = split_path(lfn, true);
        let mut root = self.root.lock();
        let (node, _created) = root.find_path(&components, usize::MAX, true);
        f(node.expect("find_path with create_if_missing always returns Some"))
    }

    pub fn record_file_opened(&self, lfn: &str, now: i64) {
        self.with_dir_mut(lfn, |node| {
            node.here_usage.n_files_opened += 1;
            node.here_stats.last_open = Some(now);
        });
    }

    pub fn record_file_closed(&self, lfn: &str, now: i64, delta: &StatsDelta) {
        self.with_dir_mut(lfn, |node| {
            node.here_usage.n_files_closed += 1;
            node.here_stats.last_close = Some(now);
            node.here_stats.add_bytes(delta);
        });
    }

    pub fn record_stat_update(&self, lfn: &str, delta: &StatsDelta) {
        self.with_dir_mut(lfn, |node| {
            node.here_stats.add_bytes(delta);
            node.here_usage.bytes_on_disk += delta.bytes_written;
        });
    }

    /// Charges a purge-time removal against its directory's disk-usage
    /// accounting, so usage figures decrement as soon as a file is deleted.
    pub fn record_bytes_removed(&self, lfn: &str, bytes: u64) {
        self.with_dir_mut(lfn, |node| {
            node.here_usage.bytes_on_disk = node.here_usage.bytes_on_disk.saturating_sub(bytes);
            node.here_stats.files_removed += 1;
            node.here_stats.bytes_removed += bytes;
        });
    }

    /// Walks bottom-up right after the initial filesystem scan populated
    /// `here_usage` for every node: each parent's directory count is set to
    /// its number of children, and subtree totals are summed upward.
    pub fn upward_propagate_initial_scan_usages(&self) {
        fn visit(node: &mut Node) -> (Usage, StatTotals) {
            node.here_usage.n_directories = node.children.len() as u64;
            let mut recursive_usage = node.here_usage;
            let mut recursive_stats = node.here_stats;
            for child in node.children.values_mut() {
                let (child_recursive_usage, child_recursive_stats) = visit(child);
                recursive_usage.add(&child_recursive_usage);
                recursive_stats.fold_child(&child_recursive_stats);
            }
            node.recursive_usage = recursive_usage;
            node.recursive_stats = recursive_stats;
            (recursive_usage, recursive_stats)
        }
        visit(&mut self.root.lock());
    }

    /// Per-tick reconciliation: depth-first fold of child
    /// stats into recursive totals, with optional pruning of directories
    /// that have gone empty. Returns the number of directories removed this
    /// pass.
    pub fn update_stats_and_usages(&self, purge_empty_dirs: bool, root_path: &Path, unlink_fn: &dyn Fn(&Path) -> Result<(), OssError>) -> u64 {
        let mut removed = 0u64;
        let mut path = Vec::new();
        self.root.lock().recurse_update(purge_empty_dirs, &mut path, unlink_fn, root_path, &mut removed);
        removed
    }

    pub fn recursive_usage_at_root(&self) -> Usage {
        self.root.lock().recursive_usage
    }

    pub fn here_usage_at(&self, path: &str) -> Option<Usage> {
        let components = split_path(path, false);
        let mut root = self.root.lock();
        let (node, _) = root.find_path(&components, usize::MAX, false);
        node.map(|n| n.here_usage)
    }

    /// Serializes the tree (or a depth-limited prefix of it) for the
    /// periodic `pfc-stats/DirStat.json` export.
    pub fn snapshot(&self, max_depth: u32) -> DirStatNode {
        fn visit(name: &str, node: &Node, depth: u32, max_depth: u32) -> DirStatNode {
            let children = if depth >= max_depth {
                Vec::new()
            } else {
                node.children.iter().map(|(n, c)| visit(n, c, depth + 1, max_depth)).collect()
            };
            DirStatNode {
                name: name.to_string(),
                here_usage: node.here_usage,
                recursive_usage: node.recursive_usage,
                here_stats: node.here_stats,
                recursive_stats: node.recursive_stats,
                children,
            }
        }
        visit("/", &self.root.lock(), 0, max_depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_path_creates_missing_directories() {
        let ds = DirState::new();
        assert!(ds.find_path("a/b/c.dat", u32::MAX, true, true));
        assert!(ds.find_path("a/b", u32::MAX, false, false));
        assert!(!ds.find_path("a/x", u32::MAX, false, false));
    }

    #[test]
    fn record_open_increments_here_usage() {
        let ds = DirState::new();
        ds.record_file_opened("a/b/c.dat", 100);
        assert_eq!(ds.here_usage_at("a/b").unwrap().n_files_opened, 1);
    }

    #[test]
    fn recursive_usage_sums_per_file_usages_across_tree() {
        let ds = DirState::new();
        ds.record_file_opened("a/1.dat", 1);
        ds.record_file_opened("a/b/2.dat", 2);
        ds.record_file_opened("c/3.dat", 3);
        ds.update_stats_and_usages(false, Path::new("/cache"), &|_| Ok(()));
        assert_eq!(ds.recursive_usage_at_root().n_files_opened, 3);
    }

    #[test]
    fn update_stats_and_usages_folds_children_and_joins_timestamps() {
        let ds = DirState::new();
        ds.record_file_opened("a/1.dat", 10);
        ds.record_file_closed("a/1.dat", 20, &StatsDelta { bytes_hit: 5, bytes_missed: 0, bytes_bypassed: 0, bytes_written: 0 });
        ds.record_file_opened("a/b/2.dat", 30);
        ds.update_stats_and_usages(false, Path::new("/cache"), &|_| Ok(()));

        let root_usage = ds.recursive_usage_at_root();
        assert_eq!(root_usage.n_files_opened, 2);
        assert_eq!(root_usage.n_files_closed, 1);
    }

    #[test]
    fn purge_empty_dirs_removes_childless_unused_directory() {
        let ds = DirState::new();
        ds.find_path("empty", u32::MAX, false, true);
        let removed = ds.update_stats_and_usages(true, Path::new("/cache"), &|_| Ok(()));
        assert_eq!(removed, 1);
        assert!(!ds.find_path("empty", u32::MAX, false, false));
    }

    #[test]
    fn purge_empty_dirs_defers_parent_whose_child_was_just_removed() {
        let ds = DirState::new();
        ds.find_path("empty/dir", u32::MAX, false, true);
        let first_pass = ds.update_stats_and_usages(true, Path::new("/cache"), &|_| Ok(()));
        assert_eq!(first_pass, 1);
        assert!(ds.find_path("empty", u32::MAX, false, false));

        let second_pass = ds.update_stats_and_usages(true, Path::new("/cache"), &|_| Ok(()));
        assert_eq!(second_pass, 1);
        assert!(!ds.find_path("empty", u32::MAX, false, false));
    }

    #[test]
    fn upward_propagate_sets_directory_counts_from_initial_scan() {
        let ds = DirState::new();
        ds.find_path("a", u32::MAX, false, true);
        ds.find_path("b", u32::MAX, false, true);
        ds.upward_propagate_initial_scan_usages();
        assert_eq!(ds.here_usage_at("").unwrap().n_directories, 2);
    }
}
