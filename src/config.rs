//! TOML-based configuration for the monitoring engine.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const DEFAULT_SCAN_INTERVAL_SECS: u64 = 43200;
const DEFAULT_MAX_DEPTH: usize = 256;
const DEFAULT_FILE_MAX_SIZE: u64 = 1024 * 1024 * 1024;
const DEFAULT_SLEEP_AFTER: usize = 100;
const DEFAULT_WHODATA_POLL_MS: u64 = 500;
const DEFAULT_QUEUE_PATH: &str = "/var/run/vigil/queue.sock";
const DEFAULT_AUDIT_LOG: &str = "/var/log/audit/audit.log";

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub whodata: WhodataConfig,
    /// Monitored directory roots. Empty means monitoring is disabled.
    #[serde(default)]
    pub directories: Vec<DirectoryConfig>,
    #[serde(default)]
    pub ignore: IgnoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

/// Scheduled scanner knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Seconds between full scheduled passes.
    #[serde(default = "default_scan_interval")]
    pub interval_secs: u64,
    /// Files exceeding this size skip content hashing. Metadata checks
    /// still apply.
    #[serde(default = "default_file_max_size")]
    pub file_max_size: u64,
    /// Pacing: sleep after this many visited items.
    #[serde(default = "default_sleep_after")]
    pub sleep_after: usize,
    /// Pacing: milliseconds to sleep. Zero disables pacing.
    #[serde(default)]
    pub sleep_ms: u64,
}

fn default_scan_interval() -> u64 {
    DEFAULT_SCAN_INTERVAL_SECS
}

fn default_file_max_size() -> u64 {
    DEFAULT_FILE_MAX_SIZE
}

fn default_sleep_after() -> usize {
    DEFAULT_SLEEP_AFTER
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_SCAN_INTERVAL_SECS,
            file_max_size: DEFAULT_FILE_MAX_SIZE,
            sleep_after: DEFAULT_SLEEP_AFTER,
            sleep_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Emit events on stdout (foreground / debugging).
    #[default]
    Log,
    /// Deliver events to the collector queue over a Unix datagram socket.
    Socket,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub kind: TransportKind,
    #[serde(default = "default_queue_path")]
    pub queue_path: PathBuf,
    /// Escalating delays between connection attempts, in seconds. After
    /// the last delay one final attempt is made; failure is fatal.
    #[serde(default = "default_retry_delays")]
    pub retry_delays_secs: Vec<u64>,
}

fn default_queue_path() -> PathBuf {
    PathBuf::from(DEFAULT_QUEUE_PATH)
}

fn default_retry_delays() -> Vec<u64> {
    vec![5, 10]
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::default(),
            queue_path: default_queue_path(),
            retry_delays_secs: default_retry_delays(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhodataConfig {
    #[serde(default = "default_audit_log")]
    pub audit_log: PathBuf,
    #[serde(default = "default_whodata_poll")]
    pub poll_interval_ms: u64,
}

fn default_audit_log() -> PathBuf {
    PathBuf::from(DEFAULT_AUDIT_LOG)
}

fn default_whodata_poll() -> u64 {
    DEFAULT_WHODATA_POLL_MS
}

impl Default for WhodataConfig {
    fn default() -> Self {
        Self {
            audit_log: default_audit_log(),
            poll_interval_ms: DEFAULT_WHODATA_POLL_MS,
        }
    }
}

/// One monitored directory root and its per-path options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    pub path: PathBuf,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    /// Detect changes via OS filesystem notifications.
    #[serde(default)]
    pub realtime: bool,
    /// Detect changes via the kernel audit facility, with actor
    /// attribution. Takes precedence over `realtime`.
    #[serde(default)]
    pub whodata: bool,
    #[serde(default = "default_true")]
    pub check_hash: bool,
    #[serde(default = "default_true")]
    pub check_size: bool,
    #[serde(default = "default_true")]
    pub check_owner: bool,
    #[serde(default = "default_true")]
    pub check_perms: bool,
    #[serde(default = "default_true")]
    pub check_mtime: bool,
    #[serde(default = "default_true")]
    pub check_link_target: bool,
    #[serde(default)]
    pub follow_symlinks: bool,
    /// Include old/new content digests in modification events.
    #[serde(default)]
    pub report_changes: bool,
    #[serde(default)]
    pub tag: Option<String>,
}

fn default_max_depth() -> usize {
    DEFAULT_MAX_DEPTH
}

impl DirectoryConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_depth: DEFAULT_MAX_DEPTH,
            realtime: false,
            whodata: false,
            check_hash: true,
            check_size: true,
            check_owner: true,
            check_perms: true,
            check_mtime: true,
            check_link_target: true,
            follow_symlinks: false,
            report_changes: false,
            tag: None,
        }
    }
}

/// Paths excluded from monitoring, evaluated before index insertion.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IgnoreConfig {
    /// Literal entries; a prefix match excludes the whole subtree.
    #[serde(default)]
    pub paths: Vec<PathBuf>,
    /// Regex patterns matched against the full path.
    #[serde(default)]
    pub patterns: Vec<String>,
}

impl Config {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn load_or_default(path: &std::path::Path) -> Self {
        Self::load(path).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_is_disabled() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.directories.is_empty());
        assert_eq!(config.scan.interval_secs, DEFAULT_SCAN_INTERVAL_SECS);
        assert_eq!(config.transport.retry_delays_secs, vec![5, 10]);
    }

    #[test]
    fn test_directory_defaults() {
        let config: Config = toml::from_str(
            r#"
            [[directories]]
            path = "/etc"
            realtime = true
            tag = "system"
            "#,
        )
        .unwrap();

        let dir = &config.directories[0];
        assert_eq!(dir.path, PathBuf::from("/etc"));
        assert_eq!(dir.max_depth, DEFAULT_MAX_DEPTH);
        assert!(dir.realtime);
        assert!(!dir.whodata);
        assert!(dir.check_hash);
        assert!(dir.check_link_target);
        assert!(!dir.follow_symlinks);
        assert_eq!(dir.tag.as_deref(), Some("system"));
    }

    #[test]
    fn test_ignore_config() {
        let config: Config = toml::from_str(
            r#"
            [ignore]
            paths = ["/etc/mtab"]
            patterns = ["\\.log$"]
            "#,
        )
        .unwrap();
        assert_eq!(config.ignore.paths.len(), 1);
        assert_eq!(config.ignore.patterns.len(), 1);
    }
}
