//! Monitoring policy table: per-directory options, ignore rules, and
//! path-to-policy resolution.
//!
//! Built once from configuration at startup and immutable afterwards,
//! so detection threads can share it without synchronization.

use crate::config::{Config, DirectoryConfig};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Which attributes a policy checks, and which detection paths it uses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckOptions {
    pub hash: bool,
    pub size: bool,
    pub owner: bool,
    pub perms: bool,
    pub mtime: bool,
    pub link_target: bool,
    pub realtime: bool,
    pub whodata: bool,
    pub follow_symlinks: bool,
    pub report_changes: bool,
}

impl Default for CheckOptions {
    fn default() -> Self {
        Self {
            hash: true,
            size: true,
            owner: true,
            perms: true,
            mtime: true,
            link_target: true,
            realtime: false,
            whodata: false,
            follow_symlinks: false,
            report_changes: false,
        }
    }
}

impl CheckOptions {
    /// Compact option string for the startup listing.
    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        if self.hash {
            parts.push("hash");
        }
        if self.size {
            parts.push("size");
        }
        if self.owner {
            parts.push("owner");
        }
        if self.perms {
            parts.push("perms");
        }
        if self.mtime {
            parts.push("mtime");
        }
        if self.link_target {
            parts.push("link_target");
        }
        if self.realtime {
            parts.push("realtime");
        }
        if self.whodata {
            parts.push("whodata");
        }
        if self.follow_symlinks {
            parts.push("follow_symlinks");
        }
        if self.report_changes {
            parts.push("report_changes");
        }
        parts.join(" | ")
    }
}

/// One configured directory root.
#[derive(Debug, Clone)]
pub struct MonitoringPolicy {
    /// Resolved root used for matching and traversal.
    pub root: PathBuf,
    /// Maximum component distance below the root.
    pub max_depth: usize,
    pub opts: CheckOptions,
    pub tag: Option<String>,
    /// Original configured path when the root was itself a symlink and
    /// was resolved, kept so reports can show both.
    pub configured_path: Option<PathBuf>,
}

/// A policy matched to a concrete path.
#[derive(Debug, Clone, Copy)]
pub struct EffectivePolicy<'a> {
    pub policy: &'a MonitoringPolicy,
    /// Component distance of the path below the policy root.
    pub depth: usize,
}

/// Compiled ignore rules: literal prefixes plus regex patterns.
#[derive(Debug, Default)]
pub struct IgnoreSet {
    literals: Vec<PathBuf>,
    patterns: Vec<Regex>,
}

impl IgnoreSet {
    pub fn new(literals: Vec<PathBuf>, patterns: &[String]) -> Self {
        let compiled = patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!("Invalid ignore pattern {:?}: {}", p, e);
                    None
                }
            })
            .collect();
        Self {
            literals,
            patterns: compiled,
        }
    }

    pub fn is_ignored(&self, path: &Path) -> bool {
        if self.literals.iter().any(|lit| path.starts_with(lit)) {
            return true;
        }
        let text = path.to_string_lossy();
        self.patterns.iter().any(|re| re.is_match(&text))
    }

    pub fn is_empty(&self) -> bool {
        self.literals.is_empty() && self.patterns.is_empty()
    }
}

/// The full policy table: every configured root plus the ignore rules.
#[derive(Debug, Default)]
pub struct PolicyTable {
    policies: Vec<MonitoringPolicy>,
    ignore: IgnoreSet,
}

impl PolicyTable {
    pub fn from_config(config: &Config) -> Self {
        let mut policies = Vec::with_capacity(config.directories.len());
        let mut downgrade_noted = false;

        for dir in &config.directories {
            policies.push(build_policy(dir, &mut downgrade_noted));
        }

        let ignore = IgnoreSet::new(config.ignore.paths.clone(), &config.ignore.patterns);
        Self { policies, ignore }
    }

    /// Disabled sentinel: nothing configured means nothing to monitor.
    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    pub fn policies(&self) -> &[MonitoringPolicy] {
        &self.policies
    }

    pub fn ignore(&self) -> &IgnoreSet {
        &self.ignore
    }

    /// Most specific policy governing `path`: the longest matching root
    /// within its depth limit, unless an ignore rule excludes the path.
    pub fn resolve(&self, path: &Path) -> Option<EffectivePolicy<'_>> {
        if self.ignore.is_ignored(path) {
            return None;
        }

        let mut best: Option<EffectivePolicy<'_>> = None;
        for policy in &self.policies {
            let Ok(rel) = path.strip_prefix(&policy.root) else {
                continue;
            };
            let depth = rel.components().count();
            if depth > policy.max_depth {
                continue;
            }
            let longer = match best {
                Some(ref b) => policy.root.as_os_str().len() > b.policy.root.as_os_str().len(),
                None => true,
            };
            if longer {
                best = Some(EffectivePolicy { policy, depth });
            }
        }
        best
    }

    /// Log the monitored directories and ignore rules, once at startup.
    pub fn log_startup(&self) {
        for policy in &self.policies {
            match &policy.configured_path {
                Some(configured) => info!(
                    "Monitoring directory: {} (resolved from link {}), with options: {}",
                    policy.root.display(),
                    configured.display(),
                    policy.opts.describe()
                ),
                None => info!(
                    "Monitoring directory: {}, with options: {}",
                    policy.root.display(),
                    policy.opts.describe()
                ),
            }
            if let Some(tag) = &policy.tag {
                info!("Tag '{}' added to {}", tag, policy.root.display());
            }
        }
        for lit in &self.ignore.literals {
            info!("Ignoring entry: {}", lit.display());
        }
        for re in &self.ignore.patterns {
            info!("Ignoring pattern: {}", re.as_str());
        }
    }
}

fn build_policy(dir: &DirectoryConfig, downgrade_noted: &mut bool) -> MonitoringPolicy {
    let mut opts = CheckOptions {
        hash: dir.check_hash,
        size: dir.check_size,
        owner: dir.check_owner,
        perms: dir.check_perms,
        mtime: dir.check_mtime,
        link_target: dir.check_link_target,
        realtime: dir.realtime,
        whodata: dir.whodata,
        follow_symlinks: dir.follow_symlinks,
        report_changes: dir.report_changes,
    };

    // Whodata and realtime are mutually exclusive per path; whodata wins.
    if opts.whodata && opts.realtime {
        opts.realtime = false;
        if !*downgrade_noted {
            warn!(
                "Realtime and whodata requested for {}; whodata takes precedence",
                dir.path.display()
            );
            *downgrade_noted = true;
        }
    }

    // Symlink conversion: monitor the resolved target, remember the
    // configured name for reporting.
    let (root, configured_path) = if opts.follow_symlinks && is_symlink(&dir.path) {
        match fs::canonicalize(&dir.path) {
            Ok(resolved) => (resolved, Some(dir.path.clone())),
            Err(e) => {
                warn!(
                    "Could not resolve configured link {}: {}",
                    dir.path.display(),
                    e
                );
                (dir.path.clone(), None)
            }
        }
    } else {
        (dir.path.clone(), None)
    };

    MonitoringPolicy {
        root,
        max_depth: dir.max_depth,
        opts,
        tag: dir.tag.clone(),
        configured_path,
    }
}

fn is_symlink(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
}
