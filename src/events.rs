//! Common types for emitted change events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// What happened to a monitored path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
    Moved { from: PathBuf },
}

impl ChangeKind {
    /// Short label used for logging and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Modified => "modified",
            Self::Deleted => "deleted",
            Self::Moved { .. } => "moved",
        }
    }
}

/// A single attribute that differed between the stored entry and the
/// current filesystem state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChangedField {
    Size,
    Permissions,
    Owner,
    Group,
    Mtime,
    Digest,
    LinkTarget,
}

/// Who caused a change, sourced from the kernel audit facility.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Actor {
    pub uid: u32,
    pub user: Option<String>,
    pub pid: u32,
    pub process: Option<String>,
}

/// A change event for one monitored filesystem object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FimEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub path: PathBuf,
    pub kind: ChangeKind,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub changed_fields: BTreeSet<ChangedField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<Actor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl FimEvent {
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            id: event_id(),
            timestamp: Utc::now(),
            path: path.into(),
            kind,
            changed_fields: BTreeSet::new(),
            old_digest: None,
            new_digest: None,
            actor: None,
            tag: None,
        }
    }

    pub fn with_changed_fields(mut self, fields: BTreeSet<ChangedField>) -> Self {
        self.changed_fields = fields;
        self
    }

    pub fn with_digests(mut self, old: Option<String>, new: Option<String>) -> Self {
        self.old_digest = old;
        self.new_digest = new;
        self
    }

    pub fn with_actor(mut self, actor: Actor) -> Self {
        self.actor = Some(actor);
        self
    }

    pub fn with_tag(mut self, tag: Option<String>) -> Self {
        self.tag = tag;
        self
    }
}

/// Generate a unique event ID using timestamp, counter, and random bytes.
fn event_id() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();

    let counter = COUNTER.fetch_add(1, Ordering::Relaxed);

    let random_part: u32 = {
        let mut buf = [0u8; 4];
        if getrandom::getrandom(&mut buf).is_ok() {
            u32::from_ne_bytes(buf)
        } else {
            // Fallback: mix counter, pid, and time
            let mix = counter
                .wrapping_mul(0x517cc1b727220a95)
                .wrapping_add(std::process::id() as u64)
                .wrapping_mul(0x2545f4914f6cdd1d);
            mix as u32
        }
    };

    format!(
        "fim-{:012x}-{:04x}-{:08x}",
        now.as_nanos() as u64 & 0xFFFFFFFFFFFF,
        counter & 0xFFFF,
        random_part
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_ids_unique() {
        let a = FimEvent::new("/etc/passwd", ChangeKind::Added);
        let b = FimEvent::new("/etc/passwd", ChangeKind::Added);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(ChangeKind::Added.label(), "added");
        assert_eq!(
            ChangeKind::Moved {
                from: PathBuf::from("/x")
            }
            .label(),
            "moved"
        );
    }

    #[test]
    fn test_event_serializes_moved_kind() {
        let event = FimEvent::new("/y", ChangeKind::Moved {
            from: PathBuf::from("/x"),
        });
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("moved"));
        assert!(json.contains("/x"));
    }
}
