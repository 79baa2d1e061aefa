//! Shared test doubles and fixture helpers.

use anyhow::{bail, Result};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use vigil::events::FimEvent;
use vigil::transport::Transport;
use vigil::whodata::{AuditProvider, AuditRecord};

/// Transport that records every delivered event, optionally failing a
/// fixed number of connection attempts first.
pub struct MockTransport {
    pub sent: Arc<Mutex<Vec<FimEvent>>>,
    pub connect_failures: Arc<Mutex<usize>>,
    pub connect_attempts: Arc<Mutex<usize>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            sent: Arc::new(Mutex::new(Vec::new())),
            connect_failures: Arc::new(Mutex::new(0)),
            connect_attempts: Arc::new(Mutex::new(0)),
        }
    }

    pub fn failing_connects(n: usize) -> Self {
        let t = Self::new();
        *t.connect_failures.lock().unwrap() = n;
        t
    }
}

impl Transport for MockTransport {
    fn connect(&mut self) -> Result<()> {
        *self.connect_attempts.lock().unwrap() += 1;
        let mut failures = self.connect_failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            bail!("mock connect failure");
        }
        Ok(())
    }

    fn send(&mut self, event: &FimEvent) -> Result<()> {
        self.sent.lock().unwrap().push(event.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// Audit provider fed from a queue of prepared records.
pub struct MockAuditProvider {
    pub records: Arc<Mutex<VecDeque<Vec<AuditRecord>>>>,
    pub subscribe_fails: bool,
    pub subscribed: Arc<Mutex<bool>>,
}

impl MockAuditProvider {
    pub fn new() -> Self {
        Self {
            records: Arc::new(Mutex::new(VecDeque::new())),
            subscribe_fails: false,
            subscribed: Arc::new(Mutex::new(false)),
        }
    }

    pub fn unavailable() -> Self {
        let mut p = Self::new();
        p.subscribe_fails = true;
        p
    }

    pub fn push_batch(&self, batch: Vec<AuditRecord>) {
        self.records.lock().unwrap().push_back(batch);
    }
}

impl AuditProvider for MockAuditProvider {
    fn subscribe(&mut self) -> Result<()> {
        if self.subscribe_fails {
            bail!("audit facility unavailable");
        }
        *self.subscribed.lock().unwrap() = true;
        Ok(())
    }

    fn poll(&mut self) -> Result<Vec<AuditRecord>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default())
    }

    fn unsubscribe(&mut self) {
        *self.subscribed.lock().unwrap() = false;
    }
}

/// Build a small file tree under `root` from (relative path, contents)
/// pairs, creating parent directories as needed.
pub fn build_tree(root: &Path, files: &[(&str, &[u8])]) {
    for (rel, contents) in files {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, contents).unwrap();
    }
}
