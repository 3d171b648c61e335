//! Event dissemination.
//!
//! Implements:
//! - Push rounds reaching every member once, with bounded concurrency
//! - History purging after each round
//! - A final best-effort push to members declared dead
//!
//! A push is one exchange on a fresh connection:
//!
//! ```text
//! registry -> member:  [CLIENT_MAGIC][PUSH] PushRequest
//! member -> registry:  PushAck
//! registry -> member:  [OK] PushEvents  |  [ERROR] message
//! member -> registry:  [OK]
//! ```

use crate::connection::Connection;
use crate::error::{RegistryError, Result};
use crate::member::Member;
use crate::pool::Pool;
use crate::protocol::{Opcode, PushAck, PushRequest, CLIENT_MAGIC_BYTE};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Pushes the event log of one pool to all of its members
pub struct Disseminator {
    pool: Arc<Pool>,
}

impl Disseminator {
    pub fn new(pool: Arc<Pool>) -> Self {
        Self { pool }
    }

    pub async fn run(self) {
        info!("Disseminator: started for pool \"{}\"", self.pool.name());
        let push_interval = self.pool.config().push_interval;

        while !self.pool.has_ended() {
            let (event_time, members) = self.pool.push_snapshot();
            push_round(&self.pool, members).await;
            self.pool.purge_history();
            self.pool
                .wait_for_event_after(event_time, push_interval)
                .await;
        }

        info!("Disseminator: pool \"{}\" ended, stopping", self.pool.name());
    }
}

/// Push to every member once, then return
pub async fn push_round(pool: &Arc<Pool>, mut members: Vec<Member>) {
    if members.is_empty() {
        return;
    }
    members.shuffle(&mut rand::thread_rng());

    let workers = pool.config().max_push_threads.min(members.len());
    let queue = Arc::new(Mutex::new(VecDeque::from(members)));
    debug!(
        "Disseminator: pool \"{}\" round with {} workers",
        pool.name(),
        workers
    );

    let mut tasks = JoinSet::new();
    for _ in 0..workers {
        let pool = pool.clone();
        let queue = queue.clone();
        tasks.spawn(async move {
            loop {
                let next = queue.lock().pop_front();
                let member = match next {
                    Some(member) => member,
                    None => break,
                };
                if let Err(e) = push(&pool, &member, false).await {
                    debug!(
                        "Disseminator: push to {} deferred: {}",
                        member.identity(),
                        e
                    );
                }
            }
        });
    }

    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            warn!("Disseminator: push worker failed: {}", e);
        }
    }
}

/// Bring one member up to date.
///
/// Without `force`, members that are no longer part of the pool are skipped.
pub async fn push(pool: &Pool, member: &Member, force: bool) -> Result<()> {
    let identity = member.identity();
    if !force && !pool.is_member(identity) {
        debug!("Disseminator: {} left, not pushing", identity);
        return Ok(());
    }

    let connect_timeout = pool.config().connect_timeout;
    let mut conn = Connection::connect(identity.address(), connect_timeout).await?;
    conn.write_header(CLIENT_MAGIC_BYTE, Opcode::Push.as_u8())
        .await?;
    conn.write_value(&PushRequest {
        pool: pool.name().to_string(),
        acknowledged: member.event_time_acknowledged(),
    })
    .await?;

    let ack: PushAck = timeout(connect_timeout, conn.read_value()).await??;

    let reply = match pool.push_events(ack.requested) {
        Ok(reply) => reply,
        Err(e @ RegistryError::StaleRequest { .. }) => {
            warn!("Disseminator: {} asked for purged events: {}", identity, e);
            conn.send_error(&e.to_string()).await?;
            conn.close().await;
            return Err(e);
        }
        Err(e) => return Err(e),
    };

    let acknowledged = reply.events.last().map(|e| e.time + 1).or(ack.requested);
    let count = reply.events.len();

    conn.send_ok_reply().await?;
    conn.write_value(&reply).await?;
    timeout(connect_timeout, conn.get_and_check_reply()).await??;
    conn.close().await;

    debug!("Disseminator: pushed {} events to {}", count, identity);
    if let Some(time) = acknowledged {
        pool.acknowledge(identity, time);
    }
    Ok(())
}

/// Give every member declared dead one last push; runs until the pool ends
pub async fn push_stragglers(pool: Arc<Pool>, mut stragglers: mpsc::UnboundedReceiver<Member>) {
    while let Some(member) = stragglers.recv().await {
        if let Err(e) = push(&pool, &member, true).await {
            debug!(
                "Disseminator: final push to {} failed: {}",
                member.identity(),
                e
            );
        }
    }
    debug!("Disseminator: straggler queue of \"{}\" closed", pool.name());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MemberEndpoint;
    use crate::config::RegistryConfig;
    use crate::types::{EventKind, Identity, Location};
    use std::time::Duration;

    async fn member(pool: &Pool) -> (MemberEndpoint, Identity) {
        let endpoint = MemberEndpoint::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let identity = pool
            .join("ipl", Vec::new(), endpoint.local_addr(), Location::default())
            .unwrap()
            .identity;
        endpoint.set_identity(identity.clone());
        (endpoint, identity)
    }

    fn config() -> RegistryConfig {
        RegistryConfig::default()
            .with_connect_timeout(Duration::from_secs(2))
            .with_max_push_threads(2)
    }

    #[tokio::test]
    async fn test_push_delivers_events_and_acknowledges() {
        let (pool, _stragglers) = Pool::new("push", config());
        let pool = Arc::new(pool);
        let (a, a_id) = member(&pool).await;
        let (b, _) = member(&pool).await;
        pool.signal("hello", &[a_id.clone()]);

        let (event_time, members) = pool.push_snapshot();
        assert_eq!(event_time, 3);
        push_round(&pool, members).await;

        for endpoint in [&a, &b] {
            let times: Vec<_> = endpoint.events().iter().map(|e| e.time).collect();
            assert_eq!(times, vec![0, 1, 2]);
        }

        // both members acknowledged everything
        pool.purge_history();
        assert_eq!(pool.min_event_time(), 2);

        // the next push only carries what is new
        pool.elect("leader", &a_id).unwrap();
        push_round(&pool, pool.push_snapshot().1).await;
        let events = a.events();
        assert_eq!(events.len(), 4);
        assert_eq!(events[3].kind, EventKind::Elect);
    }

    #[tokio::test]
    async fn test_unreachable_member_is_deferred_not_killed() {
        let (pool, _stragglers) = Pool::new("push", config());
        let pool = Arc::new(pool);
        let (endpoint, identity) = member(&pool).await;
        endpoint.set_responsive(false);

        let members = pool.push_snapshot().1;
        assert!(push(&pool, &members[0], false).await.is_err());
        assert!(pool.is_member(&identity));
        assert_eq!(pool.event_count(EventKind::Died), 0);
    }

    #[tokio::test]
    async fn test_stale_request_gets_error_reply() {
        let (pool, _stragglers) = Pool::new("push", config());
        let pool = Arc::new(pool);
        let (endpoint, identity) = member(&pool).await;
        for _ in 0..3 {
            pool.signal("tick", &[identity.clone()]);
        }
        pool.purge_upto(2);
        endpoint.set_next_event_time(1);

        let members = pool.push_snapshot().1;
        assert!(matches!(
            push(&pool, &members[0], false).await,
            Err(RegistryError::StaleRequest { .. })
        ));
        assert!(endpoint.events().is_empty());
    }

    #[tokio::test]
    async fn test_straggler_gets_final_push() {
        let (pool, stragglers) = Pool::new("push", config());
        let pool = Arc::new(pool);
        let (survivor, _) = member(&pool).await;
        let (victim, victim_id) = member(&pool).await;

        let pusher = tokio::spawn(push_stragglers(pool.clone(), stragglers));
        pool.dead(&victim_id, "test");

        assert!(victim.wait_for_event_time(3, Duration::from_secs(5)).await);
        let events = victim.events();
        assert_eq!(events.last().map(|e| e.kind), Some(EventKind::Died));

        drop(survivor);
        pool.end();
        tokio::time::timeout(Duration::from_secs(5), pusher)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_disseminator_pushes_new_events() {
        let config = config().with_push_interval(Duration::from_secs(30));
        let (pool, _stragglers) = Pool::new("push", config);
        let pool = Arc::new(pool);
        let (a, a_id) = member(&pool).await;

        let task = tokio::spawn(Disseminator::new(pool.clone()).run());
        assert!(a.wait_for_event_time(1, Duration::from_secs(5)).await);

        // woken by the event long before the push interval
        pool.signal("go", &[a_id.clone()]);
        assert!(a.wait_for_event_time(2, Duration::from_secs(5)).await);

        pool.leave(&a_id).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
