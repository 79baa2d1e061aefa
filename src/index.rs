//! Shared entry index: last-known state of every monitored object.
//!
//! Two maps live behind one mutex: the entry index (ordered by path,
//! for deterministic traversal) and the inode index (for move
//! detection and hard-link deduplication). All three detection paths
//! race on the same key space, so every multi-step read-modify-write
//! runs under a single lock acquisition via [`FimIndex::apply`].
//! Content hashing must happen before locking; candidates arrive here
//! fully built.

use crate::events::ChangedField;
use crate::policy::CheckOptions;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Last-observed state of one monitored filesystem object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FimEntry {
    pub path: PathBuf,
    pub dev: u64,
    pub inode: u64,
    pub size: u64,
    /// Permission bits (mode & 0o7777).
    pub perm: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: i64,
    /// Sub-second part of mtime. Disambiguates unrelated files that
    /// share a size and a whole-second timestamp.
    pub mtime_nsec: i64,
    pub ctime: i64,
    /// Absent when hashing is disabled, the file exceeds the size
    /// ceiling, or hashing failed (degraded state).
    pub digest: Option<String>,
    pub link_target: Option<PathBuf>,
}

/// Result of applying a candidate entry against the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Added,
    Modified {
        fields: BTreeSet<ChangedField>,
        old_digest: Option<String>,
        new_digest: Option<String>,
    },
    Moved {
        from: PathBuf,
    },
    Unchanged,
}

#[derive(Debug, Default)]
struct IndexInner {
    entries: BTreeMap<PathBuf, FimEntry>,
    inodes: HashMap<(u64, u64), PathBuf>,
}

/// The entry index + inode index pair under one exclusive lock.
#[derive(Debug, Default)]
pub struct FimIndex {
    inner: Mutex<IndexInner>,
}

impl FimIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &Path) -> Option<FimEntry> {
        self.inner.lock().unwrap().entries.get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn lookup_by_inode(&self, dev: u64, inode: u64) -> Option<PathBuf> {
        self.inner.lock().unwrap().inodes.get(&(dev, inode)).cloned()
    }

    /// Insert or replace an entry without diffing.
    pub fn upsert(&self, entry: FimEntry) {
        let mut inner = self.inner.lock().unwrap();
        inner.inodes.insert((entry.dev, entry.inode), entry.path.clone());
        inner.entries.insert(entry.path.clone(), entry);
    }

    pub fn remove(&self, path: &Path) -> Option<FimEntry> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.entries.remove(path)?;
        // Only drop the inode mapping if it still points at this path;
        // a move may already have reassigned it.
        if inner
            .inodes
            .get(&(entry.dev, entry.inode))
            .is_some_and(|p| p == path)
        {
            inner.inodes.remove(&(entry.dev, entry.inode));
        }
        Some(entry)
    }

    /// Ordered list of indexed paths below `root`.
    pub fn paths_under(&self, root: &Path) -> Vec<PathBuf> {
        self.inner
            .lock()
            .unwrap()
            .entries
            .range(root.to_path_buf()..)
            .take_while(|(p, _)| p.starts_with(root))
            .map(|(p, _)| p.clone())
            .collect()
    }

    /// The shared compare-and-update step. Classifies the candidate
    /// against the stored state, updates both maps, and returns what
    /// happened. Runs under one lock acquisition; the candidate must be
    /// fully built (including its digest) before calling.
    pub fn apply(&self, candidate: FimEntry, opts: &CheckOptions) -> Outcome {
        let mut inner = self.inner.lock().unwrap();
        let key = (candidate.dev, candidate.inode);

        if let Some(prev) = inner.entries.get(&candidate.path) {
            let prev_key = (prev.dev, prev.inode);
            let fields = compare(prev, &candidate, opts);
            let old_digest = prev.digest.clone();
            let new_digest = candidate.digest.clone();

            if fields.is_empty() && prev_key == key {
                return Outcome::Unchanged;
            }

            // An in-place replacement changes the inode; retire the old
            // mapping so a later reuse of that inode cannot evict this
            // entry as a spurious move.
            if prev_key != key
                && inner.inodes.get(&prev_key).is_some_and(|p| p == &candidate.path)
            {
                inner.inodes.remove(&prev_key);
            }
            inner.inodes.insert(key, candidate.path.clone());
            inner.entries.insert(candidate.path.clone(), candidate);

            if fields.is_empty() {
                return Outcome::Unchanged;
            }
            return Outcome::Modified {
                fields,
                old_digest,
                new_digest,
            };
        }

        // New path. An inode already indexed under another path may be
        // a move, but inode numbers get reused; require identical size
        // and timestamps (to sub-second precision) and a vanished
        // source before reporting one. Anything weaker is an addition,
        // with the stale path reclaimed by the deleted sweep.
        if let Some(old_path) = inner.inodes.get(&key).cloned() {
            if old_path != candidate.path {
                let same_object = inner.entries.get(&old_path).is_some_and(|old| {
                    old.size == candidate.size
                        && old.mtime == candidate.mtime
                        && old.mtime_nsec == candidate.mtime_nsec
                });
                if same_object && fs::symlink_metadata(&old_path).is_err() {
                    inner.entries.remove(&old_path);
                    inner.inodes.insert(key, candidate.path.clone());
                    inner.entries.insert(candidate.path.clone(), candidate);
                    return Outcome::Moved { from: old_path };
                }
            }
        }

        inner.inodes.insert(key, candidate.path.clone());
        inner.entries.insert(candidate.path.clone(), candidate);
        Outcome::Added
    }
}

/// Field-by-field diff, limited to the checks the governing policy
/// enables. Digests are only compared when both sides have one, so a
/// degraded or oversize candidate never produces a digest-driven change.
fn compare(prev: &FimEntry, cand: &FimEntry, opts: &CheckOptions) -> BTreeSet<ChangedField> {
    let mut fields = BTreeSet::new();

    if opts.size && prev.size != cand.size {
        fields.insert(ChangedField::Size);
    }
    if opts.perms && prev.perm != cand.perm {
        fields.insert(ChangedField::Permissions);
    }
    if opts.owner {
        if prev.uid != cand.uid {
            fields.insert(ChangedField::Owner);
        }
        if prev.gid != cand.gid {
            fields.insert(ChangedField::Group);
        }
    }
    if opts.mtime && (prev.mtime != cand.mtime || prev.mtime_nsec != cand.mtime_nsec) {
        fields.insert(ChangedField::Mtime);
    }
    if opts.hash {
        if let (Some(old), Some(new)) = (&prev.digest, &cand.digest) {
            if old != new {
                fields.insert(ChangedField::Digest);
            }
        }
    }
    if opts.link_target && prev.link_target != cand.link_target {
        fields.insert(ChangedField::LinkTarget);
    }

    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, inode: u64) -> FimEntry {
        FimEntry {
            path: PathBuf::from(path),
            dev: 1,
            inode,
            size: 100,
            perm: 0o644,
            uid: 0,
            gid: 0,
            mtime: 1_700_000_000,
            mtime_nsec: 0,
            ctime: 1_700_000_000,
            digest: Some("d0".to_string()),
            link_target: None,
        }
    }

    #[test]
    fn test_apply_added_then_unchanged() {
        let index = FimIndex::new();
        let opts = CheckOptions::default();

        assert_eq!(index.apply(entry("/etc/passwd", 10), &opts), Outcome::Added);
        assert_eq!(
            index.apply(entry("/etc/passwd", 10), &opts),
            Outcome::Unchanged
        );
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_apply_modified_reports_fields() {
        let index = FimIndex::new();
        let opts = CheckOptions::default();
        index.apply(entry("/etc/passwd", 10), &opts);

        let mut changed = entry("/etc/passwd", 10);
        changed.size = 200;
        changed.digest = Some("d1".to_string());

        match index.apply(changed, &opts) {
            Outcome::Modified {
                fields,
                old_digest,
                new_digest,
            } => {
                assert!(fields.contains(&ChangedField::Size));
                assert!(fields.contains(&ChangedField::Digest));
                assert_eq!(old_digest.as_deref(), Some("d0"));
                assert_eq!(new_digest.as_deref(), Some("d1"));
            }
            other => panic!("expected Modified, got {:?}", other),
        }
    }

    #[test]
    fn test_apply_move_detected_via_inode() {
        let index = FimIndex::new();
        let opts = CheckOptions::default();
        index.apply(entry("/x", 42), &opts);

        let moved = FimEntry {
            path: PathBuf::from("/y"),
            ..entry("/x", 42)
        };
        assert_eq!(
            index.apply(moved, &opts),
            Outcome::Moved {
                from: PathBuf::from("/x")
            }
        );
        assert!(index.get(Path::new("/x")).is_none());
        assert!(index.get(Path::new("/y")).is_some());
        assert_eq!(index.lookup_by_inode(1, 42), Some(PathBuf::from("/y")));
    }

    #[test]
    fn test_reused_inode_without_confirmation_is_added() {
        let index = FimIndex::new();
        let opts = CheckOptions::default();
        index.apply(entry("/x", 42), &opts);

        // Same inode but different size and mtime: reused inode, not a move.
        let mut reused = entry("/y", 42);
        reused.size = 9;
        reused.mtime = 1_700_000_999;
        assert_eq!(index.apply(reused, &opts), Outcome::Added);
        // The stale path stays until the deleted sweep picks it up.
        assert!(index.get(Path::new("/x")).is_some());
    }

    #[test]
    fn test_reused_inode_same_second_is_added() {
        let index = FimIndex::new();
        let opts = CheckOptions::default();
        index.apply(entry("/x", 42), &opts);

        // Same size and whole-second mtime, different sub-second part:
        // an unrelated file on a reused inode, not a move.
        let mut reused = entry("/y", 42);
        reused.mtime_nsec = 750_000_000;
        assert_eq!(index.apply(reused, &opts), Outcome::Added);
        assert!(index.get(Path::new("/x")).is_some());
    }

    #[test]
    fn test_move_requires_vanished_source() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = dir.path().join("still-here");
        std::fs::write(&source, b"x").unwrap();

        let index = FimIndex::new();
        let opts = CheckOptions::default();
        let mut old = entry("unused", 42);
        old.path = source.clone();
        index.apply(old, &opts);

        // Identical size and timestamps, but the source path still
        // exists on disk: a hard link, not a move.
        let linked = FimEntry {
            path: PathBuf::from("/elsewhere/link"),
            ..entry("unused", 42)
        };
        assert_eq!(index.apply(linked, &opts), Outcome::Added);
        assert!(index.get(&source).is_some());
    }

    #[test]
    fn test_replacement_drops_stale_inode_mapping() {
        let index = FimIndex::new();
        let opts = CheckOptions::default();
        index.apply(entry("/etc/passwd", 10), &opts);

        // Replaced in place: same path, new inode.
        let mut replaced = entry("/etc/passwd", 20);
        replaced.digest = Some("d1".to_string());
        assert!(matches!(
            index.apply(replaced, &opts),
            Outcome::Modified { .. }
        ));

        assert_eq!(index.lookup_by_inode(1, 10), None);
        assert_eq!(
            index.lookup_by_inode(1, 20),
            Some(PathBuf::from("/etc/passwd"))
        );

        // A new file reusing the retired inode is an addition and must
        // not evict the live entry.
        let mut fresh = entry("/etc/shadow", 10);
        fresh.size = 50;
        assert_eq!(index.apply(fresh, &opts), Outcome::Added);
        assert!(index.get(Path::new("/etc/passwd")).is_some());
    }

    #[test]
    fn test_unreported_replacement_still_updates_inode_map() {
        let index = FimIndex::new();
        let opts = CheckOptions {
            mtime: false,
            ..CheckOptions::default()
        };
        index.apply(entry("/f", 10), &opts);

        // Nothing reportable changed, but the inode did.
        let swapped = entry("/f", 20);
        assert_eq!(index.apply(swapped, &opts), Outcome::Unchanged);
        assert_eq!(index.lookup_by_inode(1, 10), None);
        assert_eq!(index.lookup_by_inode(1, 20), Some(PathBuf::from("/f")));
    }

    #[test]
    fn test_link_target_check_can_be_disabled() {
        let index = FimIndex::new();
        let opts = CheckOptions {
            link_target: false,
            ..CheckOptions::default()
        };
        let mut link = entry("/lnk", 5);
        link.link_target = Some(PathBuf::from("/a"));
        index.apply(link, &opts);

        let mut retargeted = entry("/lnk", 5);
        retargeted.link_target = Some(PathBuf::from("/b"));
        assert_eq!(index.apply(retargeted, &opts), Outcome::Unchanged);
    }

    #[test]
    fn test_digest_absent_never_drives_change() {
        let index = FimIndex::new();
        let opts = CheckOptions::default();
        index.apply(entry("/big", 7), &opts);

        let mut degraded = entry("/big", 7);
        degraded.digest = None;
        assert_eq!(index.apply(degraded, &opts), Outcome::Unchanged);
    }

    #[test]
    fn test_disabled_checks_are_skipped() {
        let index = FimIndex::new();
        let opts = CheckOptions {
            size: false,
            mtime: false,
            ..CheckOptions::default()
        };
        index.apply(entry("/f", 1), &opts);

        let mut changed = entry("/f", 1);
        changed.size = 5;
        changed.mtime = 1;
        assert_eq!(index.apply(changed, &opts), Outcome::Unchanged);
    }

    #[test]
    fn test_remove_keeps_reassigned_inode_mapping() {
        let index = FimIndex::new();
        let opts = CheckOptions::default();
        index.apply(entry("/x", 42), &opts);
        index.apply(
            FimEntry {
                path: PathBuf::from("/y"),
                ..entry("/x", 42)
            },
            &opts,
        );

        // /x is gone already; removing it again is a no-op.
        assert!(index.remove(Path::new("/x")).is_none());
        assert_eq!(index.lookup_by_inode(1, 42), Some(PathBuf::from("/y")));
    }

    #[test]
    fn test_paths_under_is_ordered() {
        let index = FimIndex::new();
        let opts = CheckOptions::default();
        index.apply(entry("/etc/ssh/sshd_config", 3), &opts);
        index.apply(entry("/etc/passwd", 1), &opts);
        index.apply(entry("/var/log/auth.log", 2), &opts);

        let under_etc = index.paths_under(Path::new("/etc"));
        assert_eq!(
            under_etc,
            vec![
                PathBuf::from("/etc/passwd"),
                PathBuf::from("/etc/ssh/sshd_config")
            ]
        );
    }
}
