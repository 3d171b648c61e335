//! Pool aggregate: membership, event ordering and elections of one named group.
//!
//! Implements:
//! - JOIN / LEAVE / DIED bookkeeping with automatic UN_ELECT of freed labels
//! - First-come elections and pool-wide sequence numbers
//! - Signals to a subset of the members
//! - Suspect selection for the failure detector
//! - History purging bounded by what every member acknowledged
//!
//! Every operation is one critical section on the pool's mutex. Waiters are
//! woken through a [`Notify`] on every appended event, suspicion and pool end.

use crate::config::RegistryConfig;
use crate::election::{ElectOutcome, ElectionSet};
use crate::error::{RegistryError, Result};
use crate::event_log::EventLog;
use crate::member::{Member, MemberSet};
use crate::protocol::{JoinReply, PoolState, PushEvents};
use crate::types::{Event, EventKind, EventTime, Identity, Location};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Time the failure detector waits when a pool has no members
const EMPTY_POOL_WAIT: Duration = Duration::from_secs(1);

/// What the failure detector should do next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Suspicion {
    /// Probe this member now; it has already been marked as seen
    Suspect(Identity),
    /// Nobody is due yet, look again after this long (or on any change)
    Wait(Duration),
}

struct Inner {
    members: MemberSet,
    events: EventLog,
    elections: ElectionSet,
    next_member_id: u64,
    next_sequence_number: u64,
    sequencers: BTreeMap<String, u64>,
    /// Fixed by the first join
    implementation_id: Option<String>,
    ended: bool,
    ended_at: Option<Instant>,
    event_counts: [u64; EventKind::ALL.len()],
    /// Dead members awaiting a final push; dropped when the pool ends
    stragglers: Option<mpsc::UnboundedSender<Member>>,
}

/// One named group of processes
pub struct Pool {
    name: String,
    config: RegistryConfig,
    inner: Mutex<Inner>,
    changed: Notify,
}

impl Pool {
    /// Create an empty pool, returning the receiving end of its straggler queue
    pub fn new(
        name: impl Into<String>,
        config: RegistryConfig,
    ) -> (Self, mpsc::UnboundedReceiver<Member>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pool = Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                members: MemberSet::new(),
                events: EventLog::new(),
                elections: ElectionSet::new(),
                next_member_id: 0,
                next_sequence_number: 0,
                sequencers: BTreeMap::new(),
                implementation_id: None,
                ended: false,
                ended_at: None,
                event_counts: [0; EventKind::ALL.len()],
                stragglers: Some(tx),
            }),
            changed: Notify::new(),
        };
        (pool, rx)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Notified on every event, suspicion and on pool end
    pub fn changed(&self) -> &Notify {
        &self.changed
    }

    /// Admit a new member. All members of a pool run the same implementation.
    pub fn join(
        &self,
        implementation_id: &str,
        implementation_data: Vec<u8>,
        address: SocketAddr,
        location: Location,
    ) -> Result<JoinReply> {
        let mut inner = self.inner.lock();
        if inner.ended {
            return Err(RegistryError::PoolEnded(self.name.clone()));
        }
        match &inner.implementation_id {
            Some(expected) if expected != implementation_id => {
                return Err(RegistryError::ImplementationMismatch {
                    requested: implementation_id.to_string(),
                    expected: expected.clone(),
                });
            }
            Some(_) => {}
            None => inner.implementation_id = Some(implementation_id.to_string()),
        }

        let id = inner.next_member_id.to_string();
        inner.next_member_id += 1;
        let identity = Identity::new(id, &self.name, address, location, implementation_data);

        let bootstrap = inner
            .members
            .random_sample(self.config.bootstrap_list_size, None)
            .into_iter()
            .map(|m| m.identity().clone())
            .collect();

        let join_time = inner.events.current_event_time();
        inner.members.add(Member::new(identity.clone(), join_time));
        self.add_event(&mut inner, EventKind::Join, None, vec![identity.clone()]);

        Ok(JoinReply {
            identity,
            join_time,
            bootstrap,
        })
    }

    /// Remove a member that left on its own
    pub fn leave(&self, identity: &Identity) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.members.remove(identity).is_none() {
            return Err(RegistryError::UnknownMember(identity.to_string()));
        }

        self.add_event(&mut inner, EventKind::Leave, None, vec![identity.clone()]);
        self.after_removal(&mut inner, identity);
        Ok(())
    }

    /// Declare a member dead. A no-op when it was already removed.
    pub fn dead(&self, identity: &Identity, cause: &str) {
        let mut inner = self.inner.lock();
        let member = match inner.members.remove(identity) {
            Some(member) => member,
            None => {
                debug!(
                    "Pool \"{}\": {} already removed, ignoring death ({})",
                    self.name, identity, cause
                );
                return;
            }
        };

        warn!("Pool \"{}\": {} died: {}", self.name, identity, cause);
        self.add_event(&mut inner, EventKind::Died, None, vec![identity.clone()]);

        if let Some(stragglers) = &inner.stragglers {
            // receiver already gone when the pool is shutting down
            let _ = stragglers.send(member);
        }
        self.after_removal(&mut inner, identity);
    }

    /// Run an election; the first candidate the pool sees for a label wins.
    /// A standing winner is returned to anyone asking.
    pub fn elect(&self, label: &str, candidate: &Identity) -> Result<Identity> {
        let mut inner = self.inner.lock();
        if inner.elections.get(label).is_none() && !inner.members.contains(candidate) {
            return Err(RegistryError::UnknownMember(candidate.to_string()));
        }

        match inner.elections.elect(label, candidate) {
            ElectOutcome::Won(winner) => {
                self.add_event(
                    &mut inner,
                    EventKind::Elect,
                    Some(label.to_string()),
                    vec![winner.clone()],
                );
                Ok(winner)
            }
            ElectOutcome::Existing(winner) => Ok(winner),
        }
    }

    /// Next value of the named counter, or of the pool-wide one for `None`. Counters start at 0.
    pub fn next_sequence_number(&self, name: Option<&str>) -> u64 {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let counter = match name {
            None => &mut inner.next_sequence_number,
            Some(name) => inner.sequencers.entry(name.to_string()).or_insert(0),
        };
        let number = *counter;
        *counter += 1;
        number
    }

    /// Mark a member as suspect so the failure detector probes it next
    pub fn maybe_dead(&self, identity: &Identity) {
        let mut inner = self.inner.lock();
        if let Some(member) = inner.members.get_mut(identity) {
            debug!("Pool \"{}\": {} suspected", self.name, identity);
            member.clear_last_seen();
            self.changed.notify_waiters();
        }
    }

    /// Record a signal addressed to those `targets` that are still members
    pub fn signal(&self, label: &str, targets: &[Identity]) {
        let mut inner = self.inner.lock();
        let subjects: Vec<Identity> = targets
            .iter()
            .filter(|t| inner.members.contains(t))
            .cloned()
            .collect();
        self.add_event(&mut inner, EventKind::Signal, Some(label.to_string()), subjects);
    }

    /// Buffered events from `start` on; `None` returns the whole buffer
    pub fn events_since(&self, start: Option<EventTime>) -> Result<Vec<Event>> {
        self.inner.lock().events.events_since(start)
    }

    /// Events from `start` on together with the minimum event time, read atomically
    pub fn push_events(&self, start: Option<EventTime>) -> Result<PushEvents> {
        let inner = self.inner.lock();
        Ok(PushEvents {
            events: inner.events.events_since(start)?,
            min_event_time: inner.events.min_event_time(),
        })
    }

    /// Discard history before `time`
    pub fn purge_upto(&self, time: EventTime) -> bool {
        self.inner.lock().events.purge_upto(time)
    }

    /// Discard the history every member has already acknowledged
    pub fn purge_history(&self) {
        let mut inner = self.inner.lock();
        let current = inner.events.current_event_time();
        let min_acknowledged = match inner.members.minimum_acknowledged() {
            Some(time) => time,
            None => return,
        };
        if current == 0 {
            return;
        }

        let target = min_acknowledged.min(current - 1);
        if target > inner.events.min_event_time() {
            inner.events.purge_upto(target);
        }
    }

    /// Refresh the last contact time of a member
    pub fn got_heartbeat(&self, identity: &Identity) {
        if let Some(member) = self.inner.lock().members.get_mut(identity) {
            member.update_last_seen();
        }
    }

    /// A member confirmed it holds every event before `time`
    pub fn acknowledge(&self, identity: &Identity, time: EventTime) {
        if let Some(member) = self.inner.lock().members.get_mut(identity) {
            member.acknowledge(time);
            member.update_last_seen();
        }
    }

    /// Pick the member that has gone longest without contact.
    ///
    /// A member that is due is marked as seen before it is returned, so it is
    /// not selected again while its probe is running.
    pub fn select_suspect(&self) -> Suspicion {
        let mut inner = self.inner.lock();
        let (identity, last_seen) = match inner.members.least_recently_seen() {
            Some(oldest) => (oldest.identity().clone(), oldest.last_seen()),
            None => return Suspicion::Wait(EMPTY_POOL_WAIT),
        };

        if let Some(last_seen) = last_seen {
            let due = last_seen + self.config.heartbeat_interval;
            let now = Instant::now();
            if due > now {
                return Suspicion::Wait(due - now);
            }
        }

        if let Some(member) = inner.members.get_mut(&identity) {
            member.update_last_seen();
        }
        Suspicion::Suspect(identity)
    }

    /// Consistent snapshot for GET_STATE
    pub fn state(&self, requester: &Identity, join_time: Option<EventTime>) -> PoolState {
        let inner = self.inner.lock();
        let since = join_time.unwrap_or_else(|| inner.events.min_event_time());
        PoolState {
            members: inner.members.identities(),
            elections: inner.elections.snapshot(),
            signals: inner.events.signals_for(requester, since),
            event_time: inner.events.current_event_time(),
        }
    }

    /// Current event time and the members a dissemination round must reach
    pub fn push_snapshot(&self) -> (EventTime, Vec<Member>) {
        let inner = self.inner.lock();
        (inner.events.current_event_time(), inner.members.snapshot())
    }

    pub fn members(&self) -> Vec<Identity> {
        self.inner.lock().members.identities()
    }

    pub fn is_member(&self, identity: &Identity) -> bool {
        self.inner.lock().members.contains(identity)
    }

    /// Winner of an election, if any
    pub fn winner(&self, label: &str) -> Option<Identity> {
        self.inner.lock().elections.get(label).cloned()
    }

    pub fn size(&self) -> usize {
        self.inner.lock().members.len()
    }

    pub fn event_time(&self) -> EventTime {
        self.inner.lock().events.current_event_time()
    }

    pub fn min_event_time(&self) -> EventTime {
        self.inner.lock().events.min_event_time()
    }

    pub fn has_ended(&self) -> bool {
        self.inner.lock().ended
    }

    /// Whether an ended pool has outlived its grace period
    pub fn stale(&self) -> bool {
        let inner = self.inner.lock();
        match inner.ended_at {
            Some(ended_at) => ended_at.elapsed() > self.config.stale_timeout,
            None => false,
        }
    }

    /// End the pool regardless of its members
    pub fn end(&self) {
        let mut inner = self.inner.lock();
        if !inner.ended {
            self.mark_ended(&mut inner);
        }
    }

    /// Wait until an event after `time` exists, the pool ends or `timeout` passes
    pub async fn wait_for_event_after(&self, time: EventTime, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let inner = self.inner.lock();
                if inner.ended || inner.events.current_event_time() > time {
                    return;
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return;
            }
        }
    }

    /// Column headers matching [`Pool::stats_line`]
    pub fn stats_header() -> String {
        format!(
            "{:<16} {:>6} {:>10} {:>6} {:>6} {:>6} {:>6} {:>8} {:>6}",
            "POOL", "SIZE", "EVENT_TIME", "JOIN", "LEAVE", "DIED", "ELECT", "UN_ELECT", "SIGNAL"
        )
    }

    /// One formatted statistics line for this pool
    pub fn stats_line(&self) -> String {
        let inner = self.inner.lock();
        let counts = &inner.event_counts;
        format!(
            "{:<16} {:>6} {:>10} {:>6} {:>6} {:>6} {:>6} {:>8} {:>6}",
            self.name,
            inner.members.len(),
            inner.events.current_event_time(),
            counts[EventKind::Join.index()],
            counts[EventKind::Leave.index()],
            counts[EventKind::Died.index()],
            counts[EventKind::Elect.index()],
            counts[EventKind::UnElect.index()],
            counts[EventKind::Signal.index()],
        )
    }

    /// Number of events of one kind ever appended
    pub fn event_count(&self, kind: EventKind) -> u64 {
        self.inner.lock().event_counts[kind.index()]
    }

    fn add_event(
        &self,
        inner: &mut Inner,
        kind: EventKind,
        label: Option<String>,
        subjects: Vec<Identity>,
    ) {
        let event = inner.events.append(kind, label, subjects);
        if self.config.print_events {
            info!("Pool \"{}\": {}", self.name, event);
        } else {
            debug!("Pool \"{}\": {}", self.name, event);
        }
        inner.event_counts[kind.index()] += 1;
        self.changed.notify_waiters();
    }

    /// Shared tail of LEAVE and DIED
    fn after_removal(&self, inner: &mut Inner, identity: &Identity) {
        for label in inner.elections.remove_won_by(identity) {
            self.add_event(inner, EventKind::UnElect, Some(label), vec![identity.clone()]);
        }

        if inner.members.is_empty() {
            self.mark_ended(inner);
        }
    }

    fn mark_ended(&self, inner: &mut Inner) {
        inner.ended = true;
        inner.ended_at = Some(Instant::now());
        inner.stragglers = None;
        info!("Pool \"{}\": ended", self.name);
        self.changed.notify_waiters();
    }
}
