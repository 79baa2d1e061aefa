//! Scheduled scanner and the shared candidate/diff/emit pipeline.
//!
//! The scanner walks every configured root on a timer, diffing the
//! tree against the entry index. The real-time watcher and the whodata
//! subsystem reuse [`detect_change`] for their targeted updates, so all
//! three detection paths classify and emit identically.

use crate::config::ScanConfig;
use crate::events::{Actor, ChangeKind, FimEvent};
use crate::hasher;
use crate::index::{FimEntry, FimIndex, Outcome};
use crate::metrics::{EVENTS_EMITTED, FILES_SCANNED, SCANS_COMPLETED};
use crate::policy::{MonitoringPolicy, PolicyTable};
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};
use walkdir::WalkDir;

/// Counters from one full scheduled pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub scanned: u64,
    pub added: u64,
    pub modified: u64,
    pub moved: u64,
    pub deleted: u64,
    pub errors: u64,
}

impl ScanReport {
    fn record(&mut self, kind: &ChangeKind) {
        match kind {
            ChangeKind::Added => self.added += 1,
            ChangeKind::Modified => self.modified += 1,
            ChangeKind::Moved { .. } => self.moved += 1,
            ChangeKind::Deleted => self.deleted += 1,
        }
    }
}

/// Build a candidate entry from current filesystem state. Content is
/// hashed here, before the index lock is ever taken. Returns `None`
/// for objects that are not tracked (directories, sockets, ...).
pub fn build_candidate(
    path: &Path,
    policy: &MonitoringPolicy,
    file_max_size: u64,
) -> Result<Option<FimEntry>> {
    let metadata = if policy.opts.follow_symlinks {
        fs::metadata(path)
    } else {
        fs::symlink_metadata(path)
    }
    .context("Failed to stat")?;

    let file_type = metadata.file_type();
    if !file_type.is_file() && !file_type.is_symlink() {
        return Ok(None);
    }

    let link_target = if file_type.is_symlink() {
        fs::read_link(path).ok()
    } else {
        None
    };

    // Hashing reads file bytes and can block on slow storage; it always
    // happens outside the index lock. Oversize files keep their
    // metadata checks but skip the digest. A failed hash degrades to an
    // absent digest rather than aborting the item.
    let digest = if policy.opts.hash && file_type.is_file() && metadata.len() <= file_max_size {
        match hasher::hash_file(path) {
            Ok(d) => Some(d),
            Err(e) => {
                debug!("Could not hash {}: {}", path.display(), e);
                None
            }
        }
    } else {
        None
    };

    Ok(Some(FimEntry {
        path: path.to_path_buf(),
        dev: metadata.dev(),
        inode: metadata.ino(),
        size: metadata.len(),
        perm: metadata.mode() & 0o7777,
        uid: metadata.uid(),
        gid: metadata.gid(),
        mtime: metadata.mtime(),
        mtime_nsec: metadata.mtime_nsec(),
        ctime: metadata.ctime(),
        digest,
        link_target,
    }))
}

/// The shared build-candidate/diff/update/emit sequence.
///
/// Classifies the current state of `path` against the index, updates
/// the index, and emits an event for Added/Modified/Moved/Deleted.
/// Baseline passes update the index but stay silent: the initial
/// inventory is not change. Returns the classification, or `None` when
/// nothing happened or the object is untracked.
pub async fn detect_change(
    index: &FimIndex,
    event_tx: &mpsc::Sender<FimEvent>,
    policy: &MonitoringPolicy,
    path: &Path,
    file_max_size: u64,
    baseline: bool,
    actor: Option<Actor>,
) -> Result<Option<ChangeKind>> {
    let candidate = match build_candidate(path, policy, file_max_size) {
        Ok(Some(candidate)) => candidate,
        Ok(None) => return Ok(None),
        Err(e) => {
            let not_found = e
                .downcast_ref::<std::io::Error>()
                .is_some_and(|io| io.kind() == ErrorKind::NotFound);
            if !not_found {
                // Per-item recoverable: keep the prior entry, retry next pass.
                return Err(e);
            }
            // The path vanished. Remove it if we were tracking it.
            if index.remove(path).is_none() {
                return Ok(None);
            }
            let kind = ChangeKind::Deleted;
            if !baseline {
                emit(event_tx, policy, path, kind.clone(), None, actor).await;
            }
            return Ok(Some(kind));
        }
    };

    let outcome = index.apply(candidate, &policy.opts);
    let kind = match &outcome {
        Outcome::Added => ChangeKind::Added,
        Outcome::Modified { .. } => ChangeKind::Modified,
        Outcome::Moved { from } => ChangeKind::Moved { from: from.clone() },
        Outcome::Unchanged => return Ok(None),
    };

    if !baseline {
        emit(event_tx, policy, path, kind.clone(), Some(outcome), actor).await;
    }
    Ok(Some(kind))
}

async fn emit(
    event_tx: &mpsc::Sender<FimEvent>,
    policy: &MonitoringPolicy,
    path: &Path,
    kind: ChangeKind,
    outcome: Option<Outcome>,
    actor: Option<Actor>,
) {
    EVENTS_EMITTED.with_label_values(&[kind.label()]).inc();

    let mut event = FimEvent::new(path, kind).with_tag(policy.tag.clone());
    if let Some(Outcome::Modified {
        fields,
        old_digest,
        new_digest,
    }) = outcome
    {
        event = event.with_changed_fields(fields);
        if policy.opts.report_changes {
            event = event.with_digests(old_digest, new_digest);
        }
    }
    if let Some(actor) = actor {
        event = event.with_actor(actor);
    }

    event_tx.send(event).await.ok();
}

/// Walk one policy root, diffing every visited object, then sweep
/// entries that were not revisited as deleted. Shared between the
/// scheduled pass and the real-time watcher's degraded-root resync.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn scan_policy(
    policies: &PolicyTable,
    policy: &MonitoringPolicy,
    index: &FimIndex,
    event_tx: &mpsc::Sender<FimEvent>,
    scan: &ScanConfig,
    baseline: bool,
    shutdown: Option<&watch::Receiver<bool>>,
    report: &mut ScanReport,
) {
    let ignore = policies.ignore();
    let mut visited: HashSet<PathBuf> = HashSet::new();
    let mut since_sleep = 0usize;

    let walker = WalkDir::new(&policy.root)
        .max_depth(policy.max_depth)
        .follow_links(policy.opts.follow_symlinks)
        .sort_by_file_name()
        .into_iter()
        // Pruned subtrees are never stat'd.
        .filter_entry(|e| !ignore.is_ignored(e.path()));

    for item in walker {
        // Shutdown latency is bounded by single-item work.
        if shutdown.is_some_and(|rx| *rx.borrow()) {
            return;
        }

        let entry = match item {
            Ok(entry) => entry,
            Err(e) => {
                debug!("Walk error under {}: {}", policy.root.display(), e);
                report.errors += 1;
                continue;
            }
        };

        let file_type = entry.file_type();
        if !file_type.is_file() && !file_type.is_symlink() {
            continue;
        }

        // With overlapping roots the most specific policy owns the path.
        match policies.resolve(entry.path()) {
            Some(effective) if effective.policy.root == policy.root => {}
            _ => continue,
        }

        visited.insert(entry.path().to_path_buf());
        report.scanned += 1;
        FILES_SCANNED.inc();

        match detect_change(
            index,
            event_tx,
            policy,
            entry.path(),
            scan.file_max_size,
            baseline,
            None,
        )
        .await
        {
            Ok(Some(kind)) => report.record(&kind),
            Ok(None) => {}
            Err(e) => {
                debug!("Skipping {}: {}", entry.path().display(), e);
                report.errors += 1;
            }
        }

        since_sleep += 1;
        if scan.sleep_ms > 0 && since_sleep >= scan.sleep_after {
            tokio::time::sleep(Duration::from_millis(scan.sleep_ms)).await;
            since_sleep = 0;
        }
    }

    // Entries under this root that were not revisited have vanished.
    for path in index.paths_under(&policy.root) {
        if shutdown.is_some_and(|rx| *rx.borrow()) {
            return;
        }
        if visited.contains(&path) {
            continue;
        }
        if policies
            .resolve(&path)
            .is_some_and(|effective| effective.policy.root != policy.root)
        {
            continue;
        }
        if index.remove(&path).is_some() {
            report.record(&ChangeKind::Deleted);
            if !baseline {
                emit(event_tx, policy, &path, ChangeKind::Deleted, None, None).await;
            }
        }
    }
}

/// Periodic full-tree scanner. Always active; the authoritative
/// detection path that catches anything the event-driven paths miss.
pub struct ScheduledScanner {
    policies: Arc<PolicyTable>,
    index: Arc<FimIndex>,
    event_tx: mpsc::Sender<FimEvent>,
    scan: ScanConfig,
    shutdown: watch::Receiver<bool>,
}

impl ScheduledScanner {
    pub fn new(
        policies: Arc<PolicyTable>,
        index: Arc<FimIndex>,
        event_tx: mpsc::Sender<FimEvent>,
        scan: ScanConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            policies,
            index,
            event_tx,
            scan,
            shutdown,
        }
    }

    /// One full pass over every configured root.
    pub async fn run_once(&self, baseline: bool) -> ScanReport {
        let mut report = ScanReport::default();
        for policy in self.policies.policies() {
            scan_policy(
                &self.policies,
                policy,
                &self.index,
                &self.event_tx,
                &self.scan,
                baseline,
                Some(&self.shutdown),
                &mut report,
            )
            .await;
        }
        SCANS_COMPLETED.inc();
        report
    }

    /// Steady-state loop: re-run on the configured interval until
    /// shutdown.
    pub async fn run(&mut self) -> Result<()> {
        info!(
            "Scheduled scanner running (interval: {}s)",
            self.scan.interval_secs
        );

        loop {
            let interval = Duration::from_secs(self.scan.interval_secs);
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.shutdown.changed() => {}
            }
            if *self.shutdown.borrow() {
                info!("Scheduled scanner stopping");
                return Ok(());
            }

            let report = self.run_once(false).await;
            info!(
                scanned = report.scanned,
                added = report.added,
                modified = report.modified,
                moved = report.moved,
                deleted = report.deleted,
                errors = report.errors,
                "Scheduled scan completed"
            );
        }
    }
}
