//! Member directory of a pool

use crate::types::{EventTime, Identity};
use rand::seq::{IteratorRandom, SliceRandom};
use tokio::time::Instant;

/// A currently joined process, as tracked by its pool
#[derive(Debug, Clone)]
pub struct Member {
    identity: Identity,
    /// Highest event time the member is known to have received
    event_time_acknowledged: EventTime,
    /// Last successful contact, `None` when the member is suspected
    last_seen: Option<Instant>,
}

impl Member {
    pub fn new(identity: Identity, event_time_acknowledged: EventTime) -> Self {
        Self {
            identity,
            event_time_acknowledged,
            last_seen: Some(Instant::now()),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn event_time_acknowledged(&self) -> EventTime {
        self.event_time_acknowledged
    }

    /// Raise the acknowledged event time; never moves it backwards
    pub fn acknowledge(&mut self, time: EventTime) {
        self.event_time_acknowledged = self.event_time_acknowledged.max(time);
    }

    pub fn last_seen(&self) -> Option<Instant> {
        self.last_seen
    }

    pub fn update_last_seen(&mut self) {
        self.last_seen = Some(Instant::now());
    }

    pub fn clear_last_seen(&mut self) {
        self.last_seen = None;
    }
}

/// Flat collection of the members of one pool, in join order
#[derive(Debug, Default)]
pub struct MemberSet {
    members: Vec<Member>,
}

impl MemberSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Member> {
        self.members.iter()
    }

    pub fn add(&mut self, member: Member) {
        self.members.push(member);
    }

    pub fn remove(&mut self, identity: &Identity) -> Option<Member> {
        let pos = self.members.iter().position(|m| &m.identity == identity)?;
        Some(self.members.remove(pos))
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.members.iter().any(|m| &m.identity == identity)
    }

    pub fn get(&self, identity: &Identity) -> Option<&Member> {
        self.members.iter().find(|m| &m.identity == identity)
    }

    pub fn get_mut(&mut self, identity: &Identity) -> Option<&mut Member> {
        self.members.iter_mut().find(|m| &m.identity == identity)
    }

    /// Up to `count` distinct members chosen uniformly, skipping `exclude`
    pub fn random_sample(&self, count: usize, exclude: Option<&Identity>) -> Vec<&Member> {
        let mut rng = rand::thread_rng();
        let mut sample = self
            .members
            .iter()
            .filter(|m| Some(&m.identity) != exclude)
            .choose_multiple(&mut rng, count);
        // choose_multiple does not randomise the order of the picked elements
        sample.shuffle(&mut rng);
        sample
    }

    /// The member contacted longest ago; suspected members come first
    pub fn least_recently_seen(&self) -> Option<&Member> {
        self.members.iter().min_by_key(|m| m.last_seen)
    }

    /// Lowest acknowledged event time over all members
    pub fn minimum_acknowledged(&self) -> Option<EventTime> {
        self.members.iter().map(|m| m.event_time_acknowledged).min()
    }

    pub fn identities(&self) -> Vec<Identity> {
        self.members.iter().map(|m| m.identity.clone()).collect()
    }

    pub fn snapshot(&self) -> Vec<Member> {
        self.members.clone()
    }
}
