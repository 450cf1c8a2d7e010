//! Stateful recursive walker over the cache's data+cinfo trees.
//! Used by the initial scan and by the purge candidate walk; both need to
//! pair up `name` and `name.cinfo` entries at each directory level and never
//! cross outside the configured cache root.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;

use crate::oss::{Oss, OssError};

/// Directory names skipped at traversal depth 0 regardless of configuration.
/// `Config::dir_stats.export_dir_name` is user-configurable and is merged
/// with this fixed set at traversal time.
static RESERVED_NAMES: Lazy<std::collections::HashSet<&'static str>> = Lazy::new(|| {
    let mut set = std::collections::HashSet::new();
    set.insert("pfc-stats");
    set
});

/// `stat(2)` fields captured for an entry during the directory scan that
/// first paired it, so later passes (e.g. purge candidate selection) don't
/// need to re-stat the same path.
#[derive(Debug, Clone, Copy, Default)]
pub struct EntryStat {
    pub mtime: i64,
    pub allocated_blocks: u64,
}

/// What's known about one paired (data, cinfo) entry at the current level.
#[derive(Debug, Clone, Copy, Default)]
pub struct PairedEntry {
    pub has_data: bool,
    pub stat_data: Option<EntryStat>,
    pub has_cinfo: bool,
    pub stat_cinfo: Option<EntryStat>,
}

/// One level of the traversal stack: the directory path and its children,
/// already partitioned into subdirectories and paired data/cinfo entries.
struct Level {
    path: PathBuf,
    subdirs: Vec<String>,
    entries: std::collections::HashMap<String, PairedEntry>,
}

/// Recursive walker over the cache root. `protected_names` lists directory
/// names skipped at depth 0 (e.g. the stats export directory).
pub struct FsTraversal {
    oss: std::sync::Arc<dyn Oss>,
    root: PathBuf,
    protected_names: std::collections::HashSet<String>,
    stack: Vec<Level>,
}

impl FsTraversal {
    pub fn new(oss: std::sync::Arc<dyn Oss>, root: impl Into<PathBuf>, protected_names: impl IntoIterator<Item = String>) -> Self {
        Self {
            oss,
            root: root.into(),
            protected_names: protected_names.into_iter().collect(),
            stack: Vec::new(),
        }
    }

    /// Opens `path` as the traversal root and loads its immediate children.
    pub fn begin_traversal(&mut self, path: impl Into<PathBuf>) -> Result<(), OssError> {
        self.stack.clear();
        let path = path.into();
        let level = self.load_level(&path, self.stack.is_empty())?;
        self.stack.push(level);
        Ok(())
    }

    fn load_level(&self, path: &Path, is_root_depth: bool) -> Result<Level, OssError> {
        let mut subdirs = Vec::new();
        let mut entries: std::collections::HashMap<String, PairedEntry> = std::collections::HashMap::new();

        for (name, is_dir) in self.oss.read_dir(path)? {
            if is_dir {
                if is_root_depth && (self.protected_names.contains(&name) || RESERVED_NAMES.contains(name.as_str())) {
                    continue;
                }
                subdirs.push(name);
                continue;
            }

            let stat = self.stat_entry(&path.join(&name))?;
            if let Some(stem) = name.strip_suffix(".cinfo") {
                let entry = entries.entry(stem.to_string()).or_default();
                entry.has_cinfo = true;
                entry.stat_cinfo = Some(stat);
            } else {
                let entry = entries.entry(name).or_default();
                entry.has_data = true;
                entry.stat_data = Some(stat);
            }
        }

        Ok(Level {
            path: path.to_path_buf(),
            subdirs,
            entries,
        })
    }

    fn stat_entry(&self, path: &Path) -> Result<EntryStat, OssError> {
        let mtime = self.oss.mtime(path)?.unwrap_or(0);
        let allocated_blocks = self.oss.allocated_blocks(path)?.unwrap_or(0);
        Ok(EntryStat { mtime, allocated_blocks })
    }

    /// Current directory path, relative to the cache root.
    pub fn current_path(&self) -> Option<&Path> {
        self.stack.last().map(|l| l.path.as_path())
    }

    /// Subdirectory names at the current level.
    pub fn subdirs(&self) -> &[String] {
        self.stack.last().map(|l| l.subdirs.as_slice()).unwrap_or(&[])
    }

    /// Paired (data, cinfo) entries at the current level.
    pub fn entries(&self) -> impl Iterator<Item = (&str, PairedEntry)> {
        self.stack
            .last()
            .into_iter()
            .flat_map(|l| l.entries.iter().map(|(k, v)| (k.as_str(), *v)))
    }

    /// Depth of the current level, `0` at the traversal root.
    pub fn depth(&self) -> usize {
        self.stack.len().saturating_sub(1)
    }

    /// Descends into subdirectory `name` of the current level.
    pub fn cd_down(&mut self, name: &str) -> Result<(), OssError> {
        let child_path = self
            .current_path()
            .ok_or_else(|| OssError::Io {
                path: self.root.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "traversal not started"),
            })?
            .join(name);
        let level = self.load_level(&child_path, false)?;
        self.stack.push(level);
        Ok(())
    }

    /// Returns to the parent directory. No-op at the traversal root.
    pub fn cd_up(&mut self) {
        if self.stack.len() > 1 {
            self.stack.pop();
        }
    }

    /// Opens `name` (a data file, or `name.cinfo`, at the current level) read-only.
    pub fn open_at_ro(&self, name: &str) -> Result<std::fs::File, OssError> {
        let path = self.current_path().map(|p| p.join(name)).unwrap_or_else(|| self.root.join(name));
        self.oss.open_ro(&path)
    }

    /// Resolves `name` to its full path at the current level, without
    /// opening it; used for `mtime`/`allocated_blocks` queries.
    pub fn path_at(&self, name: &str) -> PathBuf {
        self.current_path().map(|p| p.join(name)).unwrap_or_else(|| self.root.join(name))
    }

    /// The storage backend this traversal reads through.
    pub fn oss(&self) -> &std::sync::Arc<dyn Oss> {
        &self.oss
    }

    /// Deletes `name` (and, if present, `name.cinfo`) at the current level.
    /// Cinfo is removed first, then data, so a crash mid-delete never leaves
    /// a data file with no cinfo for a fresh download to misread as complete.
    pub fn unlink_at(&self, name: &str) -> Result<(), OssError> {
        let base = self.current_path().unwrap_or(&self.root);
        self.oss.unlink(&base.join(format!("{name}.cinfo")))?;
        self.oss.unlink(&base.join(name))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oss::StdOss;

    fn make_tree(dir: &Path) {
        std::fs::create_dir_all(dir.join("a")).unwrap();
        std::fs::create_dir_all(dir.join("pfc-stats")).unwrap();
        std::fs::write(dir.join("a/f1"), b"1").unwrap();
        std::fs::write(dir.join("a/f1.cinfo"), b"2").unwrap();
        std::fs::write(dir.join("a/f2"), b"3").unwrap();
    }

    #[test]
    fn skips_protected_dir_at_depth_zero() {
        let dir = tempfile::tempdir().unwrap();
        make_tree(dir.path());
        let mut t = FsTraversal::new(std::sync::Arc::new(StdOss), dir.path(), ["pfc-stats".to_string()]);
        t.begin_traversal(dir.path()).unwrap();
        assert_eq!(t.subdirs(), &["a".to_string()]);
    }

    #[test]
    fn reserved_name_is_skipped_even_without_explicit_config() {
        let dir = tempfile::tempdir().unwrap();
        make_tree(dir.path());
        let mut t = FsTraversal::new(std::sync::Arc::new(StdOss), dir.path(), Vec::<String>::new());
        t.begin_traversal(dir.path()).unwrap();
        assert_eq!(t.subdirs(), &["a".to_string()]);
    }

    #[test]
    fn pairs_data_and_cinfo_entries() {
        let dir = tempfile::tempdir().unwrap();
        make_tree(dir.path());
        let mut t = FsTraversal::new(std::sync::Arc::new(StdOss), dir.path(), Vec::<String>::new());
        t.begin_traversal(dir.path()).unwrap();
        t.cd_down("a").unwrap();
        let entries: std::collections::HashMap<_, _> = t.entries().collect();
        assert!(entries["f1"].has_data && entries["f1"].has_cinfo);
        assert!(entries["f2"].has_data && !entries["f2"].has_cinfo);
    }

    #[test]
    fn unlink_at_removes_both_files() {
        let dir = tempfile::tempdir().unwrap();
        make_tree(dir.path());
        let mut t = FsTraversal::new(std::sync::Arc::new(StdOss), dir.path(), Vec::<String>::new());
        t.begin_traversal(dir.path()).unwrap();
        t.cd_down("a").unwrap();
        t.unlink_at("f1").unwrap();
        assert!(!dir.path().join("a/f1").exists());
        assert!(!dir.path().join("a/f1.cinfo").exists());
    }
}
