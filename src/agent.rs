//! Startup sequencing and the steady-state detection loop.
//!
//! Order matters at startup: indices first, then policy resolution,
//! then the outbound transport (with bounded retries; exhaustion is
//! fatal), then a silent baseline pass, and only then the event-driven
//! detection paths. An unusable whodata facility downgrades the
//! affected roots to plain realtime monitoring instead of failing the
//! agent.

use crate::config::Config;
use crate::index::FimIndex;
use crate::metrics::ACTIVE_MONITORS;
use crate::policy::PolicyTable;
use crate::realtime::RealtimeWatcher;
use crate::scanner::ScheduledScanner;
use crate::transport::{self, EventDispatcher};
use crate::whodata::{LinuxAuditProvider, WhodataMonitor};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

pub struct Agent {
    config: Arc<Config>,
}

impl Agent {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let index = Arc::new(FimIndex::new());
        let policies = Arc::new(PolicyTable::from_config(&self.config));

        if policies.is_empty() {
            info!("No directories configured; file integrity monitoring is disabled");
            wait_for_shutdown(shutdown).await;
            return Ok(());
        }
        policies.log_startup();

        // Detection must not start before delivery is possible.
        let mut transport = transport::build_transport(
            &self.config.transport,
            self.config.general.log_format,
        );
        transport::connect_with_retry(
            transport.as_mut(),
            &self.config.transport.retry_delays_secs,
        )
        .await?;

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let dispatch_handle = tokio::spawn(EventDispatcher::new(transport).run(event_rx));

        // Silent baseline: populate the index without reporting the
        // initial inventory as change.
        let mut scanner = ScheduledScanner::new(
            policies.clone(),
            index.clone(),
            event_tx.clone(),
            self.config.scan.clone(),
            shutdown.clone(),
        );
        let report = scanner.run_once(true).await;
        info!(
            entries = index.len(),
            errors = report.errors,
            "Baseline established"
        );

        let mut handles = Vec::new();
        let mut whodata_fallback = false;

        if policies.policies().iter().any(|p| p.opts.whodata) {
            let provider = LinuxAuditProvider::from_config(&self.config.whodata);
            let mut monitor = WhodataMonitor::new(
                Box::new(provider),
                policies.clone(),
                index.clone(),
                event_tx.clone(),
                self.config.scan.clone(),
                self.config.whodata.poll_interval_ms,
                shutdown.clone(),
            );
            match monitor.init() {
                Ok(()) => {
                    info!("Whodata subsystem enabled");
                    ACTIVE_MONITORS.inc();
                    handles.push(tokio::spawn(async move {
                        if let Err(e) = monitor.run().await {
                            error!("Whodata subsystem error: {}", e);
                        }
                    }));
                }
                Err(e) => {
                    warn!(
                        "Whodata initialization failed: {}; falling back to realtime monitoring",
                        e
                    );
                    whodata_fallback = true;
                }
            }
        }

        let realtime_wanted =
            whodata_fallback || policies.policies().iter().any(|p| p.opts.realtime);
        if realtime_wanted {
            let mut watcher = RealtimeWatcher::new(
                policies.clone(),
                index.clone(),
                event_tx.clone(),
                self.config.scan.clone(),
                shutdown.clone(),
                whodata_fallback,
            );
            ACTIVE_MONITORS.inc();
            handles.push(tokio::spawn(async move {
                if let Err(e) = watcher.run().await {
                    error!("Realtime watcher error: {}", e);
                }
            }));
        }

        ACTIVE_MONITORS.inc();
        scanner.run().await?;

        // Shutdown: the watchers observe the same signal; wait for them,
        // then close the channel so the dispatcher drains and stops.
        for handle in handles {
            let _ = handle.await;
        }
        drop(scanner);
        drop(event_tx);
        let _ = dispatch_handle.await;
        info!("Agent stopped");
        Ok(())
    }
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
