//! Whodata subsystem: audit-backed change detection with actor
//! attribution.
//!
//! A capability trait hides the platform audit facility; the Linux
//! implementation tails the kernel audit log and correlates SYSCALL
//! and PATH records into per-path [`AuditRecord`]s. Records feed the
//! same candidate/diff/emit pipeline as the other detection paths,
//! with the responsible user and process attached to the event.
//!
//! Initialization failure is degraded-but-running, never fatal: the
//! agent falls back to plain realtime monitoring for whodata-flagged
//! roots.

use crate::config::{ScanConfig, WhodataConfig};
use crate::events::{Actor, FimEvent};
use crate::index::FimIndex;
use crate::policy::PolicyTable;
use crate::scanner;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// Operation kind, mapped from a PATH record's `nametype`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditOp {
    Create,
    Write,
    Delete,
}

/// One audit record touching a filesystem path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    pub path: PathBuf,
    pub op: AuditOp,
    pub uid: u32,
    pub user: Option<String>,
    pub pid: u32,
    pub process: Option<String>,
}

impl AuditRecord {
    pub fn actor(&self) -> Actor {
        Actor {
            uid: self.uid,
            user: self.user.clone(),
            pid: self.pid,
            process: self.process.clone(),
        }
    }
}

/// Platform audit facility, behind a trait so the engine stays
/// testable and platform-portable.
pub trait AuditProvider: Send {
    fn subscribe(&mut self) -> Result<()>;
    fn poll(&mut self) -> Result<Vec<AuditRecord>>;
    fn unsubscribe(&mut self);
}

/// Tails the kernel audit log, parsing records appended after
/// subscription.
pub struct LinuxAuditProvider {
    log_path: PathBuf,
    offset: u64,
}

impl LinuxAuditProvider {
    pub fn new(log_path: PathBuf) -> Self {
        Self {
            log_path,
            offset: 0,
        }
    }

    pub fn from_config(config: &WhodataConfig) -> Self {
        Self::new(config.audit_log.clone())
    }
}

impl AuditProvider for LinuxAuditProvider {
    fn subscribe(&mut self) -> Result<()> {
        let metadata = std::fs::metadata(&self.log_path)
            .with_context(|| format!("Audit log {} unavailable", self.log_path.display()))?;
        File::open(&self.log_path)
            .with_context(|| format!("Audit log {} not readable", self.log_path.display()))?;
        // Only records appended after subscription count.
        self.offset = metadata.len();
        Ok(())
    }

    fn poll(&mut self) -> Result<Vec<AuditRecord>> {
        let mut file = File::open(&self.log_path).context("Failed to open audit log")?;
        let len = file.metadata().context("Failed to stat audit log")?.len();
        if len < self.offset {
            // Log rotated underneath us; start from the top.
            self.offset = 0;
        }
        if len == self.offset {
            return Ok(Vec::new());
        }

        file.seek(SeekFrom::Start(self.offset))
            .context("Failed to seek audit log")?;
        let mut chunk = String::new();
        file.read_to_string(&mut chunk)
            .context("Failed to read audit log")?;
        self.offset = len;

        Ok(parse_audit_batch(&chunk))
    }

    fn unsubscribe(&mut self) {
        self.offset = 0;
    }
}

/// Correlate a batch of audit log lines into per-path records.
///
/// Lines belonging to one kernel event share the `audit(ts:serial)`
/// id; the SYSCALL line carries the actor, each PATH line names an
/// affected object.
pub fn parse_audit_batch(text: &str) -> Vec<AuditRecord> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<&str>> = HashMap::new();

    for line in text.lines() {
        let Some(id) = audit_event_id(line) else {
            continue;
        };
        groups
            .entry(id.to_string())
            .or_insert_with(|| {
                order.push(id.to_string());
                Vec::new()
            })
            .push(line);
    }

    let mut records = Vec::new();
    for id in order {
        let lines = &groups[&id];
        let Some(syscall) = lines.iter().find(|l| l.contains("type=SYSCALL")) else {
            continue;
        };

        let uid = audit_field(syscall, "uid")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let pid = audit_field(syscall, "pid")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let process = audit_field(syscall, "exe")
            .or_else(|| audit_field(syscall, "comm"))
            .map(str::to_string);
        let user = audit_field(syscall, "AUID")
            .or_else(|| audit_field(syscall, "UID"))
            .map(str::to_string);

        for line in lines.iter().filter(|l| l.contains("type=PATH")) {
            let Some(name) = audit_field(line, "name") else {
                continue;
            };
            if !name.starts_with('/') {
                continue;
            }
            let op = match audit_field(line, "nametype") {
                Some("CREATE") => AuditOp::Create,
                Some("DELETE") => AuditOp::Delete,
                Some("PARENT") => continue,
                _ => AuditOp::Write,
            };
            records.push(AuditRecord {
                path: PathBuf::from(name),
                op,
                uid,
                user: user.clone(),
                pid,
                process: process.clone(),
            });
        }
    }
    records
}

/// Extract the `ts:serial` id from `msg=audit(ts:serial):`.
fn audit_event_id(line: &str) -> Option<&str> {
    let start = line.find("audit(")? + "audit(".len();
    let rest = &line[start..];
    let end = rest.find("):")?;
    Some(&rest[..end])
}

/// Extract a `key=value` field, stripping surrounding quotes.
fn audit_field<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    for token in line.split_whitespace() {
        if let Some(rest) = token.strip_prefix(key) {
            if let Some(value) = rest.strip_prefix('=') {
                return Some(value.trim_matches('"'));
            }
        }
    }
    None
}

/// Polls the audit provider and feeds matching records through the
/// shared detection pipeline with the actor attached.
pub struct WhodataMonitor {
    provider: Box<dyn AuditProvider>,
    policies: Arc<PolicyTable>,
    index: Arc<FimIndex>,
    event_tx: mpsc::Sender<FimEvent>,
    scan: ScanConfig,
    poll_interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl WhodataMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: Box<dyn AuditProvider>,
        policies: Arc<PolicyTable>,
        index: Arc<FimIndex>,
        event_tx: mpsc::Sender<FimEvent>,
        scan: ScanConfig,
        poll_interval_ms: u64,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            provider,
            policies,
            index,
            event_tx,
            scan,
            poll_interval: Duration::from_millis(poll_interval_ms),
            shutdown,
        }
    }

    /// Establish the audit subscription. Called by the startup
    /// sequencer so a failure can downgrade the affected roots before
    /// the watchers start.
    pub fn init(&mut self) -> Result<()> {
        self.provider.subscribe()
    }

    /// Drain one poll's worth of audit records through the pipeline.
    /// Returns how many records produced a change.
    pub async fn poll_once(&mut self) -> Result<usize> {
        let mut records = self.provider.poll()?;
        // Deletions last: a rename's surviving name is indexed first
        // and resolves to one Moved event.
        records.sort_by_key(|r| r.op == AuditOp::Delete);

        let mut handled = 0;
        for record in records {
            let Some(effective) = self.policies.resolve(&record.path) else {
                continue;
            };
            let policy = effective.policy;
            if !policy.opts.whodata {
                continue;
            }

            match scanner::detect_change(
                &self.index,
                &self.event_tx,
                policy,
                &record.path,
                self.scan.file_max_size,
                false,
                Some(record.actor()),
            )
            .await
            {
                Ok(Some(_)) => handled += 1,
                Ok(None) => {}
                Err(e) => debug!("Whodata update failed for {}: {}", record.path.display(), e),
            }
        }
        Ok(handled)
    }

    /// Poll loop; the subscription must already be established via
    /// [`Self::init`]. Releases the subscription on shutdown.
    pub async fn run(&mut self) -> Result<()> {
        info!("Whodata subsystem running");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
            }
            if let Err(e) = self.poll_once().await {
                debug!("Audit poll failed: {}", e);
            }
        }
        self.provider.unsubscribe();
        info!("Whodata subsystem stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    const SAMPLE: &str = concat!(
        "type=SYSCALL msg=audit(1700000000.100:42): arch=c000003e syscall=257 success=yes ",
        "pid=4242 uid=1000 gid=1000 comm=\"touch\" exe=\"/usr/bin/touch\"\n",
        "type=CWD msg=audit(1700000000.100:42): cwd=\"/home/alice\"\n",
        "type=PATH msg=audit(1700000000.100:42): item=0 name=\"/etc/ssh\" nametype=PARENT\n",
        "type=PATH msg=audit(1700000000.100:42): item=1 name=\"/etc/ssh/banner\" nametype=CREATE\n",
    );

    #[test]
    fn test_parse_audit_batch_single_event() {
        let records = parse_audit_batch(SAMPLE);
        assert_eq!(records.len(), 1);

        let record = &records[0];
        assert_eq!(record.path, PathBuf::from("/etc/ssh/banner"));
        assert_eq!(record.op, AuditOp::Create);
        assert_eq!(record.uid, 1000);
        assert_eq!(record.pid, 4242);
        assert_eq!(record.process.as_deref(), Some("/usr/bin/touch"));
    }

    #[test]
    fn test_parse_audit_batch_skips_parent_and_relative() {
        let text = concat!(
            "type=SYSCALL msg=audit(1.0:1): pid=1 uid=0 comm=\"rm\" exe=\"/bin/rm\"\n",
            "type=PATH msg=audit(1.0:1): item=0 name=\"relative.txt\" nametype=DELETE\n",
            "type=PATH msg=audit(1.0:1): item=1 name=\"/tmp/x\" nametype=DELETE\n",
        );
        let records = parse_audit_batch(text);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].op, AuditOp::Delete);
        assert_eq!(records[0].path, PathBuf::from("/tmp/x"));
    }

    #[test]
    fn test_parse_audit_batch_without_syscall_line() {
        let text = "type=PATH msg=audit(1.0:9): item=0 name=\"/tmp/orphan\" nametype=CREATE\n";
        assert!(parse_audit_batch(text).is_empty());
    }

    #[test]
    fn test_audit_field_does_not_match_suffix_keys() {
        let line = "type=SYSCALL msg=audit(1.0:1): auid=4294967295 uid=1000 euid=0";
        assert_eq!(audit_field(line, "uid"), Some("1000"));
    }

    #[test]
    fn test_provider_subscribe_fails_without_log() {
        let mut provider = LinuxAuditProvider::new(PathBuf::from("/nonexistent/audit.log"));
        assert!(provider.subscribe().is_err());
    }

    #[test]
    fn test_provider_tails_appended_records() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("audit.log");
        std::fs::write(&log, "type=SYSCALL msg=audit(1.0:1): pid=1 uid=0\n").unwrap();

        let mut provider = LinuxAuditProvider::new(log.clone());
        provider.subscribe().unwrap();

        // Nothing new yet.
        assert!(provider.poll().unwrap().is_empty());

        let mut file = std::fs::OpenOptions::new().append(true).open(&log).unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let records = provider.poll().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].path, PathBuf::from("/etc/ssh/banner"));

        // Already consumed.
        assert!(provider.poll().unwrap().is_empty());
    }

    #[test]
    fn test_provider_handles_rotation() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("audit.log");
        std::fs::write(&log, vec![b'x'; 4096]).unwrap();

        let mut provider = LinuxAuditProvider::new(log.clone());
        provider.subscribe().unwrap();

        // Rotation: the file shrinks, then new records arrive.
        std::fs::write(&log, SAMPLE).unwrap();
        let records = provider.poll().unwrap();
        assert_eq!(records.len(), 1);
    }
}
