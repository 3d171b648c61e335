//! Configuration for the registry server
//!
//! Every pool created by a server shares the same settings.

use std::net::SocketAddr;
use std::time::Duration;

/// Default TCP port the registry listens on
pub const DEFAULT_PORT: u16 = 8888;

/// Registry server configuration
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Address the accept loop binds to
    pub listen_addr: SocketAddr,

    /// Time without contact after which a member is probed
    pub heartbeat_interval: Duration,

    /// Maximum time between two dissemination rounds when no events happen
    pub push_interval: Duration,

    /// Upper bound on concurrent pushes within a round
    pub max_push_threads: usize,

    /// Timeout for connecting to a member and for waiting on its reply
    pub connect_timeout: Duration,

    /// Time an ended pool is kept before it is removed
    pub stale_timeout: Duration,

    /// Period of the ended-pool cleanup sweep
    pub cleanup_interval: Duration,

    /// Number of existing members handed to a joining member
    pub bootstrap_list_size: usize,

    /// Log every membership change at info level
    pub print_events: bool,

    /// Periodically log communication and pool statistics
    pub print_stats: bool,

    /// Period of the statistics report
    pub stats_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            heartbeat_interval: Duration::from_secs(120),
            push_interval: Duration::from_secs(60),
            max_push_threads: 10,
            connect_timeout: Duration::from_secs(10),
            stale_timeout: Duration::from_secs(120),
            cleanup_interval: Duration::from_secs(60),
            bootstrap_list_size: 20,
            print_events: false,
            print_stats: false,
            stats_interval: Duration::from_secs(60),
        }
    }
}

impl RegistryConfig {
    /// Create config listening on the given address
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_push_interval(mut self, interval: Duration) -> Self {
        self.push_interval = interval;
        self
    }

    /// Set push concurrency (at least one pusher always runs)
    pub fn with_max_push_threads(mut self, threads: usize) -> Self {
        self.max_push_threads = threads.max(1);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_stale_timeout(mut self, timeout: Duration) -> Self {
        self.stale_timeout = timeout;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn with_bootstrap_list_size(mut self, size: usize) -> Self {
        self.bootstrap_list_size = size;
        self
    }

    pub fn with_print_events(mut self, print: bool) -> Self {
        self.print_events = print;
        self
    }

    pub fn with_stats(mut self, interval: Duration) -> Self {
        self.print_stats = true;
        self.stats_interval = interval;
        self
    }
}
