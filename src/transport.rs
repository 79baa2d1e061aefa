//! Outbound delivery of change events.
//!
//! The startup sequencer owns the retry policy: a failed connection is
//! retried on an escalating delay schedule and only exhaustion is
//! fatal. Once running, a failed send is logged and the event dropped;
//! delivery failure never stops detection.

use crate::config::{LogFormat, TransportConfig, TransportKind};
use crate::events::FimEvent;
use crate::metrics::TRANSPORT_FAILURES;
use anyhow::{bail, Context, Result};
use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Where emitted events go.
pub trait Transport: Send {
    fn connect(&mut self) -> Result<()>;
    fn send(&mut self, event: &FimEvent) -> Result<()>;
    fn name(&self) -> &'static str;
}

/// Writes events to stdout, one per line. The foreground/debugging
/// transport.
pub struct LogTransport {
    format: LogFormat,
}

impl LogTransport {
    pub fn new(format: LogFormat) -> Self {
        Self { format }
    }
}

impl Transport for LogTransport {
    fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    fn send(&mut self, event: &FimEvent) -> Result<()> {
        match self.format {
            LogFormat::Json => {
                let line = serde_json::to_string(event).context("Failed to encode event")?;
                println!("{}", line);
            }
            LogFormat::Text => {
                println!(
                    "{} {} {} {}",
                    event.timestamp.to_rfc3339(),
                    event.kind.label(),
                    event.path.display(),
                    event.tag.as_deref().unwrap_or("-")
                );
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

/// Delivers events to the collector queue over a Unix datagram socket.
pub struct SocketTransport {
    path: PathBuf,
    socket: Option<UnixDatagram>,
}

impl SocketTransport {
    pub fn new(path: PathBuf) -> Self {
        Self { path, socket: None }
    }
}

impl Transport for SocketTransport {
    fn connect(&mut self) -> Result<()> {
        let socket = UnixDatagram::unbound().context("Failed to create socket")?;
        socket
            .connect(&self.path)
            .with_context(|| format!("Failed to connect to queue {}", self.path.display()))?;
        self.socket = Some(socket);
        Ok(())
    }

    fn send(&mut self, event: &FimEvent) -> Result<()> {
        let Some(socket) = &self.socket else {
            bail!("Queue socket not connected");
        };
        let payload = serde_json::to_vec(event).context("Failed to encode event")?;
        socket
            .send(&payload)
            .context("Failed to write to queue socket")?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "socket"
    }
}

pub fn build_transport(config: &TransportConfig, format: LogFormat) -> Box<dyn Transport> {
    match config.kind {
        TransportKind::Log => Box::new(LogTransport::new(format)),
        TransportKind::Socket => Box::new(SocketTransport::new(config.queue_path.clone())),
    }
}

/// Connect with an escalating retry schedule. One attempt per entry in
/// `delays_secs` plus the initial one; the last failure propagates and
/// the caller treats it as fatal.
pub async fn connect_with_retry(
    transport: &mut dyn Transport,
    delays_secs: &[u64],
) -> Result<()> {
    let mut attempt = 1;
    loop {
        match transport.connect() {
            Ok(()) => {
                info!("Connected to {} transport", transport.name());
                return Ok(());
            }
            Err(e) => {
                let Some(delay) = delays_secs.get(attempt - 1) else {
                    return Err(e).context("Transport connection attempts exhausted");
                };
                warn!(
                    "Transport connection failed (attempt {}): {}; retrying in {}s",
                    attempt, e, delay
                );
                tokio::time::sleep(Duration::from_secs(*delay)).await;
                attempt += 1;
            }
        }
    }
}

/// Drains the event channel into the transport until every sender is
/// gone.
pub struct EventDispatcher {
    transport: Box<dyn Transport>,
    failure_logged: bool,
}

impl EventDispatcher {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            failure_logged: false,
        }
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<FimEvent>) {
        info!("Event dispatcher started");
        while let Some(event) = rx.recv().await {
            match self.transport.send(&event) {
                Ok(()) => {
                    self.failure_logged = false;
                }
                Err(e) => {
                    TRANSPORT_FAILURES.inc();
                    // Surface the first failure; sustained failure would
                    // flood the log.
                    if self.failure_logged {
                        debug!("Dropped event {}: {}", event.id, e);
                    } else {
                        warn!("Failed to deliver event ({}); dropping", e);
                        self.failure_logged = true;
                    }
                }
            }
        }
        info!("Event dispatcher stopped");
    }
}
