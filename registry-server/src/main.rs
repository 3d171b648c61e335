//! Registry Server
//!
//! Central membership and event-ordering registry for process pools.

use clap::Parser;
use registry_core::config::DEFAULT_PORT;
use registry_core::{RegistryConfig, Server};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// Central pool registry server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TCP port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Address to bind to
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    bind: IpAddr,

    /// Seconds without contact before a member is pinged
    #[arg(long, default_value = "120")]
    heartbeat_interval: u64,

    /// Maximum seconds between two event pushes
    #[arg(long, default_value = "60")]
    push_interval: u64,

    /// Concurrent pushes per pool
    #[arg(long, default_value = "10")]
    push_threads: usize,

    /// Seconds to wait when connecting to a member
    #[arg(long, default_value = "10")]
    connect_timeout: u64,

    /// Seconds an ended pool is kept before it is removed
    #[arg(long, default_value = "120")]
    stale_timeout: u64,

    /// Seconds between two sweeps for stale pools
    #[arg(long, default_value = "60")]
    cleanup_interval: u64,

    /// Number of existing members handed to a joining member
    #[arg(long, default_value = "20")]
    bootstrap_size: usize,

    /// Log every membership event
    #[arg(long)]
    print_events: bool,

    /// Log statistics every N seconds
    #[arg(long, value_name = "SECONDS")]
    print_stats: Option<u64>,

    /// Log level (trace, debug, info, warn, error), overridden by RUST_LOG
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn config(&self) -> RegistryConfig {
        let mut config = RegistryConfig::new(SocketAddr::new(self.bind, self.port))
            .with_heartbeat_interval(Duration::from_secs(self.heartbeat_interval))
            .with_push_interval(Duration::from_secs(self.push_interval))
            .with_max_push_threads(self.push_threads)
            .with_connect_timeout(Duration::from_secs(self.connect_timeout))
            .with_stale_timeout(Duration::from_secs(self.stale_timeout))
            .with_cleanup_interval(Duration::from_secs(self.cleanup_interval.max(1)))
            .with_bootstrap_list_size(self.bootstrap_size)
            .with_print_events(self.print_events);

        if let Some(seconds) = self.print_stats {
            config = config.with_stats(Duration::from_secs(seconds.max(1)));
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    fmt().with_env_filter(filter).with_target(false).init();

    let config = args.config();
    info!(
        "Registry server starting (heartbeat {:?}, push interval {:?}, {} push threads)",
        config.heartbeat_interval, config.push_interval, config.max_push_threads
    );

    let mut server = Server::start(config).await?;
    info!("Registry server listening on {}", server.local_addr());

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, shutting down");

    if args.print_stats.is_some() {
        info!("Final statistics\n{}", server.registry().report());
    }
    server.shutdown();
    Ok(())
}
