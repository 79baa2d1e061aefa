use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;
use vigil::agent::Agent;
use vigil::config::Config;
use vigil::metrics;
use vigil::policy::PolicyTable;

#[derive(Parser, Debug)]
#[command(name = "vigil", author = "REIUK LTD", version)]
#[command(about = "VIGIL - File integrity monitoring for Linux")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/vigil/config.toml")]
    config: PathBuf,

    /// Validate the configuration and exit
    #[arg(short = 't', long)]
    check_config: bool,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Output logs as JSON
    #[arg(long)]
    json: bool,

    /// Metrics/health endpoint address
    #[arg(long, default_value = "127.0.0.1:9091")]
    metrics_addr: SocketAddr,

    /// Disable metrics/health endpoint
    #[arg(long)]
    no_metrics: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if args.json {
        subscriber.json().init();
    } else {
        subscriber.with_target(false).init();
    }

    if args.check_config {
        let config = Config::load(&args.config)?;
        let policies = PolicyTable::from_config(&config);
        policies.log_startup();
        println!(
            "Configuration OK: {} monitored directories",
            policies.policies().len()
        );
        return Ok(());
    }

    let config = Config::load_or_default(&args.config);
    info!("Config: {}", args.config.display());

    let (ready_tx, ready_rx) = watch::channel(false);

    if !args.no_metrics {
        let metrics_addr = args.metrics_addr;
        let metrics_ready_rx = ready_rx.clone();
        tokio::spawn(async move {
            metrics::start_server(metrics_addr, metrics_ready_rx).await;
        });
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut agent_handle = tokio::spawn(Agent::new(config).run(shutdown_rx));

    let _ = ready_tx.send(true);

    info!("VIGIL running. Press Ctrl+C to stop.");
    if !args.no_metrics {
        info!("Metrics available at http://{}/metrics", args.metrics_addr);
        info!("Health check at http://{}/health", args.metrics_addr);
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            let _ = ready_tx.send(false);
            let _ = shutdown_tx.send(true);
            match agent_handle.await {
                Ok(result) => result?,
                Err(e) => error!("Agent task failed: {}", e),
            }
        }
        // A fatal startup error (transport exhaustion) ends the agent
        // before any signal arrives.
        joined = &mut agent_handle => {
            let _ = ready_tx.send(false);
            match joined {
                Ok(result) => result?,
                Err(e) => error!("Agent task failed: {}", e),
            }
        }
    }

    info!("VIGIL stopped.");
    Ok(())
}
