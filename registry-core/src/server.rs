//! Central registry server.
//!
//! Implements:
//! - TCP accept loop with one handler task per connection
//! - Lazy pool creation on first join, with per-pool detector and pushers
//! - Removal of ended pools after their grace period
//! - Periodic statistics reports

use crate::config::RegistryConfig;
use crate::detector::FailureDetector;
use crate::disseminator::{push_stragglers, Disseminator};
use crate::error::{RegistryError, Result};
use crate::handler::handle_connection;
use crate::pool::Pool;
use crate::statistics::CommunicationStatistics;
use crate::types::Identity;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info};

/// Pause after a failed accept before trying again
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// All pools known to a server, by name
pub struct PoolRegistry {
    config: RegistryConfig,
    pools: Mutex<BTreeMap<String, Arc<Pool>>>,
    statistics: CommunicationStatistics,
}

impl PoolRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            pools: Mutex::new(BTreeMap::new()),
            statistics: CommunicationStatistics::default(),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn statistics(&self) -> &CommunicationStatistics {
        &self.statistics
    }

    /// Look up a pool, creating it and starting its background tasks if new.
    ///
    /// Must be called from within a tokio runtime.
    pub fn get_or_create_pool(&self, name: &str) -> Arc<Pool> {
        let mut pools = self.pools.lock();
        if let Some(pool) = pools.get(name) {
            return pool.clone();
        }

        let (pool, stragglers) = Pool::new(name, self.config.clone());
        let pool = Arc::new(pool);
        tokio::spawn(FailureDetector::new(pool.clone()).run());
        tokio::spawn(Disseminator::new(pool.clone()).run());
        tokio::spawn(push_stragglers(pool.clone(), stragglers));

        info!("Server: created pool \"{}\"", name);
        pools.insert(name.to_string(), pool.clone());
        pool
    }

    pub fn get_pool(&self, name: &str) -> Result<Arc<Pool>> {
        self.pools
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::PoolNotFound(name.to_string()))
    }

    /// Refresh the last contact time of a member, wherever it lives
    pub fn got_heartbeat(&self, identity: &Identity) {
        if let Ok(pool) = self.get_pool(identity.pool()) {
            pool.got_heartbeat(identity);
        }
    }

    pub fn pools(&self) -> Vec<Arc<Pool>> {
        self.pools.lock().values().cloned().collect()
    }

    /// Forget ended pools whose grace period is over, returning how many
    pub fn remove_stale_pools(&self) -> usize {
        let mut pools = self.pools.lock();
        let before = pools.len();
        pools.retain(|name, pool| {
            let stale = pool.stale();
            if stale {
                info!("Server: removing stale pool \"{}\"", name);
            }
            !stale
        });
        before - pools.len()
    }

    /// End every pool, stopping their background tasks
    pub fn end_all(&self) {
        for pool in self.pools() {
            pool.end();
        }
    }

    /// Statistics table of all pools followed by the communication report
    pub fn report(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{}", Pool::stats_header());
        for pool in self.pools() {
            let _ = writeln!(out, "{}", pool.stats_line());
        }
        out.push_str(&self.statistics.report());
        out
    }
}

/// A running registry server
pub struct Server {
    registry: Arc<PoolRegistry>,
    local_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl Server {
    /// Bind the listener and start accepting members
    pub async fn start(config: RegistryConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Server: listening on {}", local_addr);

        let registry = Arc::new(PoolRegistry::new(config.clone()));
        let mut tasks = vec![
            tokio::spawn(accept_loop(listener, registry.clone())),
            tokio::spawn(cleanup_loop(registry.clone())),
        ];
        if config.print_stats {
            tasks.push(tokio::spawn(stats_loop(registry.clone())));
        }

        Ok(Self {
            registry,
            local_addr,
            tasks,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<PoolRegistry> {
        &self.registry
    }

    pub fn get_pool(&self, name: &str) -> Option<Arc<Pool>> {
        self.registry.get_pool(name).ok()
    }

    /// Stop accepting and end every pool
    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.registry.end_all();
        info!("Server: shut down");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if !self.tasks.is_empty() {
            self.shutdown();
        }
    }
}

async fn accept_loop(listener: TcpListener, registry: Arc<PoolRegistry>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("Server: connection from {}", peer);
                let _ = stream.set_nodelay(true);
                tokio::spawn(handle_connection(registry.clone(), stream, peer));
            }
            Err(e) => {
                error!("Server: accept failed: {}", e);
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

async fn cleanup_loop(registry: Arc<PoolRegistry>) {
    let mut ticker = interval(registry.config().cleanup_interval);
    loop {
        ticker.tick().await;
        let removed = registry.remove_stale_pools();
        if removed > 0 {
            debug!("Server: removed {} stale pools", removed);
        }
    }
}

async fn stats_loop(registry: Arc<PoolRegistry>) {
    let mut ticker = interval(registry.config().stats_interval);
    // first tick completes immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        info!("Server: statistics\n{}", registry.report());
    }
}
