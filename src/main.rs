//! Chaos gateway CLI: validate and inspect route-table configuration.

use anyhow::Result;
use chaos_gateway::decision::ThreadRngSource;
use chaos_gateway::telemetry::TracingSink;
use chaos_gateway::{ChaosGateway, Config};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "chaos-gateway")]
#[command(
    about = "Fault-injection gateway - per-route latency, abort, and error injection for reverse proxies"
)]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "gateway.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: String,

    /// Print example configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,

    /// Compile routes in dry-run mode (log faults without applying)
    #[arg(long)]
    dry_run: bool,
}

fn print_example_config() {
    let example = r#"# Chaos gateway route table
#
# Any of the four chaos keys activates fault injection for a route; a route
# carrying none of them is proxied untouched. Requests with the header
#   x-chaos-stand-down: true
# bypass every stage, whatever the route is configured with.

settings:
  enabled: true                    # Global kill switch
  dry_run: false                   # Emit events and log faults without applying

routes:
  # Example: flaky order placement
  - name: "orders"
    path_prefix: "/orders"
    methods: ["GET", "POST"]
    upstream: "http://orders:8080"
    chaos:
      BeforeRequestFailurePercent: "25"   # integer 0-100
      AfterResponseMaxLatency: "2s"       # 250ms, 2s, 1m, or bare milliseconds

  # Example: slow menu lookups, occasionally corrupted after the fact
  - name: "menu"
    path_prefix: "/menu"
    upstream: "http://menu:8080"
    chaos:
      BeforeRequestMaxLatency: "500ms"
      AfterResponseFailurePercent: "10"

  # Example: untouched route
  - name: "loyalty"
    path_prefix: "/loyalty"
    upstream: "http://loyalty:8080"
"#;
    println!("{}", example);
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        print_example_config();
        return Ok(());
    }

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(config = %args.config.display(), "Loading configuration");
    let mut config = Config::from_file(&args.config)?;

    if args.dry_run {
        config.settings.dry_run = true;
        info!("Dry-run mode enabled via command line");
    }

    if args.validate {
        info!("Configuration is valid");
        return Ok(());
    }

    // Compiling the table exercises the same fatal checks the embedding
    // routing engine hits at startup; the serving loop lives over there.
    let gateway = ChaosGateway::new(config, Arc::new(ThreadRngSource), Arc::new(TracingSink))?;

    for route in gateway.routes() {
        match route.pipeline() {
            Some(pipeline) => info!(
                route = route.name(),
                upstream = route.upstream(),
                chaos = %pipeline.chaos().summary(),
                "route compiled"
            ),
            None => info!(
                route = route.name(),
                upstream = route.upstream(),
                "route compiled, pass-through"
            ),
        }
    }

    Ok(())
}
