//! Real-time watcher: event-driven detection via OS filesystem
//! notifications.
//!
//! One task services every realtime-flagged root. Each root moves
//! through a small state machine: Inactive until the OS watch is
//! registered, Subscribed while notifications flow, Degraded when the
//! notification channel reports loss. A degraded root is immediately
//! resynchronized with a scoped scan, then re-registered; if
//! re-registration fails it stays degraded and relies on the next
//! scheduled pass.

use crate::config::ScanConfig;
use crate::events::FimEvent;
use crate::index::FimIndex;
use crate::policy::{MonitoringPolicy, PolicyTable};
use crate::scanner::{self, ScanReport};
use anyhow::{Context, Result};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Per-root subscription state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Inactive,
    Subscribed,
    Degraded,
}

pub struct RealtimeWatcher {
    policies: Arc<PolicyTable>,
    index: Arc<FimIndex>,
    event_tx: mpsc::Sender<FimEvent>,
    scan: ScanConfig,
    shutdown: watch::Receiver<bool>,
    /// Also cover whodata-flagged roots (whodata initialization failed
    /// and those paths fell back to plain realtime).
    include_whodata_roots: bool,
    states: HashMap<PathBuf, WatchState>,
    degraded_logged: bool,
}

impl RealtimeWatcher {
    pub fn new(
        policies: Arc<PolicyTable>,
        index: Arc<FimIndex>,
        event_tx: mpsc::Sender<FimEvent>,
        scan: ScanConfig,
        shutdown: watch::Receiver<bool>,
        include_whodata_roots: bool,
    ) -> Self {
        Self {
            policies,
            index,
            event_tx,
            scan,
            shutdown,
            include_whodata_roots,
            states: HashMap::new(),
            degraded_logged: false,
        }
    }

    fn covers(&self, policy: &MonitoringPolicy) -> bool {
        policy.opts.realtime || (self.include_whodata_roots && policy.opts.whodata)
    }

    fn roots(&self) -> Vec<PathBuf> {
        self.policies
            .policies()
            .iter()
            .filter(|p| self.covers(p))
            .map(|p| p.root.clone())
            .collect()
    }

    pub fn state(&self, root: &Path) -> WatchState {
        self.states
            .get(root)
            .copied()
            .unwrap_or(WatchState::Inactive)
    }

    /// Service loop. Registers OS watches, then handles notification
    /// batches until shutdown; subscriptions are released on the way
    /// out.
    pub async fn run(&mut self) -> Result<()> {
        let roots = self.roots();
        if roots.is_empty() {
            info!("No realtime-monitored directories");
            return Ok(());
        }

        let (raw_tx, raw_rx) = std::sync::mpsc::channel();
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = raw_tx.send(res);
        })
        .context("Failed to initialize filesystem notifications")?;

        for root in &roots {
            match watcher.watch(root, RecursiveMode::Recursive) {
                Ok(()) => {
                    info!("Realtime watch established on {}", root.display());
                    self.states.insert(root.clone(), WatchState::Subscribed);
                }
                Err(e) => {
                    warn!("Could not watch {}: {}", root.display(), e);
                    self.states.insert(root.clone(), WatchState::Inactive);
                }
            }
        }

        // Bridge the watcher's callback channel into the async world.
        let (tx, mut rx) = mpsc::channel::<notify::Result<Event>>(1024);
        tokio::task::spawn_blocking(move || {
            while let Ok(res) = raw_rx.recv() {
                if tx.blocking_send(res).is_err() {
                    break;
                }
            }
        });

        info!("Realtime watcher running ({} roots)", roots.len());

        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                maybe = rx.recv() => {
                    match maybe {
                        Some(Ok(event)) => self.handle_notification(&mut watcher, event).await,
                        Some(Err(e)) => {
                            warn!("Notification channel error: {}", e);
                            self.degrade_all(&mut watcher).await;
                        }
                        None => break,
                    }
                }
            }
        }

        for root in &roots {
            let _ = watcher.unwatch(root);
        }
        info!("Realtime watcher stopped");
        Ok(())
    }

    async fn handle_notification(&mut self, watcher: &mut RecommendedWatcher, event: Event) {
        if event.need_rescan() {
            warn!("Notification queue overrun; resynchronizing watched roots");
            self.degrade_all(watcher).await;
            return;
        }
        self.handle_paths(&event.paths).await;
    }

    /// Targeted diff for a batch of affected paths. Never a full
    /// re-walk on the happy path.
    pub async fn handle_paths(&self, paths: &[PathBuf]) {
        // Surviving paths first, so a rename resolves to one Moved
        // event instead of Deleted + Added.
        let mut ordered: Vec<&PathBuf> = paths.iter().collect();
        ordered.sort_by_key(|p| !p.exists());

        for path in ordered {
            let Some(effective) = self.policies.resolve(path) else {
                continue;
            };
            let policy = effective.policy;
            if !self.covers(policy) {
                continue;
            }

            if let Err(e) = scanner::detect_change(
                &self.index,
                &self.event_tx,
                policy,
                path,
                self.scan.file_max_size,
                false,
                None,
            )
            .await
            {
                debug!("Realtime update failed for {}: {}", path.display(), e);
            }
        }
    }

    async fn degrade_all(&mut self, watcher: &mut RecommendedWatcher) {
        for root in self.roots() {
            self.degrade_root(watcher, &root).await;
        }
    }

    /// Overflow/loss recovery for one root: mark it degraded, resync
    /// it against ground truth, then try to re-register the watch.
    async fn degrade_root(&mut self, watcher: &mut RecommendedWatcher, root: &Path) {
        self.states
            .insert(root.to_path_buf(), WatchState::Degraded);
        self.resync_root(root).await;

        let _ = watcher.unwatch(root);
        match watcher.watch(root, RecursiveMode::Recursive) {
            Ok(()) => {
                info!("Realtime watch re-established on {}", root.display());
                self.states
                    .insert(root.to_path_buf(), WatchState::Subscribed);
            }
            Err(e) => {
                if !self.degraded_logged {
                    warn!(
                        "Could not re-establish watch on {}: {}; relying on scheduled scans",
                        root.display(),
                        e
                    );
                    self.degraded_logged = true;
                }
            }
        }
    }

    /// Full scoped re-scan of one root, using the scheduled scanner
    /// logic, to converge the index after notification loss.
    pub async fn resync_root(&self, root: &Path) -> ScanReport {
        let mut report = ScanReport::default();
        let Some(policy) = self
            .policies
            .policies()
            .iter()
            .find(|p| p.root == root)
        else {
            return report;
        };

        scanner::scan_policy(
            &self.policies,
            policy,
            &self.index,
            &self.event_tx,
            &self.scan,
            false,
            Some(&self.shutdown),
            &mut report,
        )
        .await;
        report
    }
}
