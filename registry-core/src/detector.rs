//! Failure detector.
//!
//! One loop per pool that keeps probing whichever member has gone longest
//! without contact. A member that does not answer a PING with its own
//! identity within the connect timeout is declared dead.

use crate::connection::Connection;
use crate::error::{RegistryError, Result};
use crate::pool::{Pool, Suspicion};
use crate::protocol::{Opcode, CLIENT_MAGIC_BYTE};
use crate::types::Identity;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info};

/// Probes the members of one pool until it ends
pub struct FailureDetector {
    pool: Arc<Pool>,
}

impl FailureDetector {
    pub fn new(pool: Arc<Pool>) -> Self {
        Self { pool }
    }

    pub async fn run(self) {
        info!("Detector: started for pool \"{}\"", self.pool.name());

        loop {
            // registered before looking at the pool so no change is missed
            let notified = self.pool.changed().notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.pool.has_ended() {
                break;
            }

            match self.pool.select_suspect() {
                Suspicion::Suspect(suspect) => {
                    tokio::spawn(probe(self.pool.clone(), suspect));
                }
                Suspicion::Wait(wait) => {
                    let _ = timeout(wait, notified).await;
                }
            }
        }

        info!("Detector: pool \"{}\" ended, stopping", self.pool.name());
    }
}

/// Ping a suspect, declaring it dead on any failure
async fn probe(pool: Arc<Pool>, suspect: Identity) {
    let connect_timeout = pool.config().connect_timeout;
    match ping(&suspect, connect_timeout).await {
        Ok(()) => {
            debug!("Detector: {} answered ping", suspect);
            pool.got_heartbeat(&suspect);
        }
        Err(e) => pool.dead(&suspect, &format!("ping failed: {}", e)),
    }
}

/// Send a PING to a member and check that it answers with `expected`
pub async fn ping(expected: &Identity, connect_timeout: Duration) -> Result<()> {
    timeout(connect_timeout, exchange_ping(expected, connect_timeout)).await?
}

async fn exchange_ping(expected: &Identity, connect_timeout: Duration) -> Result<()> {
    let mut conn = Connection::connect(expected.address(), connect_timeout).await?;
    conn.write_header(CLIENT_MAGIC_BYTE, Opcode::Ping.as_u8())
        .await?;
    conn.get_and_check_reply().await?;
    let answered: Identity = conn.read_value().await?;
    conn.close().await;

    if &answered != expected {
        return Err(RegistryError::protocol(format!(
            "expected {} but {} answered",
            expected, answered
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MemberEndpoint;
    use crate::config::RegistryConfig;
    use crate::types::{EventKind, Location};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_ping_checks_identity() {
        let endpoint = MemberEndpoint::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let (pool, _stragglers) = Pool::new("ping", RegistryConfig::default());
        let reply = pool
            .join("ipl", Vec::new(), endpoint.local_addr(), Location::default())
            .unwrap();
        endpoint.set_identity(reply.identity.clone());

        ping(&reply.identity, Duration::from_secs(5)).await.unwrap();

        let impostor = pool
            .join("ipl", Vec::new(), endpoint.local_addr(), Location::default())
            .unwrap()
            .identity;
        assert!(matches!(
            ping(&impostor, Duration::from_secs(5)).await,
            Err(RegistryError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_silent_member_times_out() {
        // accepts but never answers
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (pool, _stragglers) = Pool::new("silent", RegistryConfig::default());
        let identity = pool
            .join("ipl", Vec::new(), listener.local_addr().unwrap(), Location::default())
            .unwrap()
            .identity;

        let err = ping(&identity, Duration::from_millis(100))
            .await
            .err()
            .unwrap();
        assert!(err.is_network());
    }

    #[tokio::test]
    async fn test_detector_removes_unreachable_member() {
        let endpoint = MemberEndpoint::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = listener.local_addr().unwrap();
        drop(listener);

        let config = RegistryConfig::default()
            .with_heartbeat_interval(Duration::from_millis(50))
            .with_connect_timeout(Duration::from_millis(500));
        let (pool, _stragglers) = Pool::new("detect", config);
        let pool = Arc::new(pool);

        let alive = pool
            .join("ipl", Vec::new(), endpoint.local_addr(), Location::default())
            .unwrap()
            .identity;
        endpoint.set_identity(alive.clone());
        let gone = pool
            .join("ipl", Vec::new(), dead_addr, Location::default())
            .unwrap()
            .identity;

        let detector = tokio::spawn(FailureDetector::new(pool.clone()).run());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while pool.is_member(&gone) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert!(!pool.is_member(&gone));
        assert!(pool.is_member(&alive));
        assert_eq!(pool.event_count(EventKind::Died), 1);

        pool.end();
        tokio::time::timeout(Duration::from_secs(5), detector)
            .await
            .unwrap()
            .unwrap();
    }
}
