//! Prometheus metrics and health/metrics HTTP endpoints

#[cfg(feature = "metrics")]
mod inner {
    use axum::{routing::get, Router};
    use once_cell::sync::Lazy;
    use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
    use std::net::SocketAddr;
    use tokio::sync::watch;
    use tracing::{error, info};

    pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

    pub static EVENTS_EMITTED: Lazy<IntCounterVec> = Lazy::new(|| {
        let opts = Opts::new("vigil_events_emitted_total", "Total change events by kind");
        let counter = IntCounterVec::new(opts, &["kind"]).unwrap();
        REGISTRY.register(Box::new(counter.clone())).unwrap();
        counter
    });

    pub static FILES_SCANNED: Lazy<IntCounter> = Lazy::new(|| {
        let counter = IntCounter::new("vigil_files_scanned_total", "Total files visited by scans").unwrap();
        REGISTRY.register(Box::new(counter.clone())).unwrap();
        counter
    });

    pub static SCANS_COMPLETED: Lazy<IntCounter> = Lazy::new(|| {
        let counter = IntCounter::new("vigil_scans_completed_total", "Completed full scan passes").unwrap();
        REGISTRY.register(Box::new(counter.clone())).unwrap();
        counter
    });

    pub static TRANSPORT_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
        let counter = IntCounter::new("vigil_transport_failures_total", "Failed event deliveries").unwrap();
        REGISTRY.register(Box::new(counter.clone())).unwrap();
        counter
    });

    pub static ACTIVE_MONITORS: Lazy<IntGauge> = Lazy::new(|| {
        let gauge = IntGauge::new("vigil_active_monitors", "Number of active detection paths").unwrap();
        REGISTRY.register(Box::new(gauge.clone())).unwrap();
        gauge
    });

    pub static START_TIME: Lazy<IntGauge> = Lazy::new(|| {
        let gauge = IntGauge::new("vigil_start_time_seconds", "Unix timestamp when the agent started").unwrap();
        REGISTRY.register(Box::new(gauge.clone())).unwrap();
        gauge.set(chrono::Utc::now().timestamp());
        gauge
    });

    async fn health_handler() -> &'static str {
        "OK"
    }

    async fn metrics_handler() -> String {
        let encoder = TextEncoder::new();
        let metric_families = REGISTRY.gather();
        encoder.encode_to_string(&metric_families).unwrap_or_default()
    }

    async fn ready_handler(
        ready: axum::extract::State<watch::Receiver<bool>>,
    ) -> (axum::http::StatusCode, &'static str) {
        if *ready.borrow() {
            (axum::http::StatusCode::OK, "READY")
        } else {
            (axum::http::StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
        }
    }

    pub async fn start_server(addr: SocketAddr, ready_rx: watch::Receiver<bool>) {
        let _ = &*START_TIME;
        let _ = &*ACTIVE_MONITORS;

        let app = Router::new()
            .route("/health", get(health_handler))
            .route("/healthz", get(health_handler))
            .route("/ready", get(ready_handler))
            .route("/readyz", get(ready_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(ready_rx);

        info!("Metrics server listening on {}", addr);

        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind metrics server to {}: {}", addr, e);
                return;
            }
        };

        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server error: {}", e);
        }
    }
}

#[cfg(feature = "metrics")]
pub use inner::*;

// Stub implementations when metrics feature is disabled
#[cfg(not(feature = "metrics"))]
pub mod stubs {
    use std::net::SocketAddr;
    use tokio::sync::watch;

    pub struct NoOpCounter;
    impl NoOpCounter {
        pub fn inc(&self) {}
        pub fn with_label_values(&self, _: &[&str]) -> Self {
            Self
        }
    }

    pub struct NoOpGauge;
    impl NoOpGauge {
        pub fn inc(&self) {}
        pub fn dec(&self) {}
        pub fn set(&self, _: i64) {}
    }

    pub static EVENTS_EMITTED: NoOpCounter = NoOpCounter;
    pub static FILES_SCANNED: NoOpCounter = NoOpCounter;
    pub static SCANS_COMPLETED: NoOpCounter = NoOpCounter;
    pub static TRANSPORT_FAILURES: NoOpCounter = NoOpCounter;
    pub static ACTIVE_MONITORS: NoOpGauge = NoOpGauge;

    pub async fn start_server(_addr: SocketAddr, _ready_rx: watch::Receiver<bool>) {
        // No-op when metrics disabled
    }
}

#[cfg(not(feature = "metrics"))]
pub use stubs::*;
