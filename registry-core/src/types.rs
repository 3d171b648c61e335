//! Core types for the pool registry

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;

/// Pool-local index of the event log
pub type EventTime = u64;

/// Hierarchical location of a member, most specific level first
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    levels: Vec<String>,
}

impl Location {
    pub fn new(levels: Vec<String>) -> Self {
        Self { levels }
    }

    pub fn levels(&self) -> &[String] {
        &self.levels
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.levels.join("@"))
    }
}

impl std::str::FromStr for Location {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(Location::default());
        }
        Ok(Location::new(s.split('@').map(String::from).collect()))
    }
}

/// Identity of a pool member, issued by the registry on join.
///
/// Two identities are the same member when both the id and the pool match;
/// the registry never hands out the same id twice within a pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    id: String,
    pool: String,
    address: SocketAddr,
    location: Location,
    implementation_data: Vec<u8>,
}

impl Identity {
    pub fn new(
        id: impl Into<String>,
        pool: impl Into<String>,
        address: SocketAddr,
        location: Location,
        implementation_data: Vec<u8>,
    ) -> Self {
        Self {
            id: id.into(),
            pool: pool.into(),
            address,
            location,
            implementation_data,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    /// Endpoint the member accepts registry connections (PING, PUSH) on
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn implementation_data(&self) -> &[u8] {
        &self.implementation_data
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.pool == other.pool
    }
}

impl Eq for Identity {}

impl Hash for Identity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.pool.hash(state);
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(member {}, location {})", self.id, self.location)
    }
}

/// Kind of fact recorded in a pool's event log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Join,
    Leave,
    Died,
    Elect,
    UnElect,
    Signal,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::Join,
        EventKind::Leave,
        EventKind::Died,
        EventKind::Elect,
        EventKind::UnElect,
        EventKind::Signal,
    ];

    /// Dense index, used for per-kind counters
    pub fn index(self) -> usize {
        match self {
            EventKind::Join => 0,
            EventKind::Leave => 1,
            EventKind::Died => 2,
            EventKind::Elect => 3,
            EventKind::UnElect => 4,
            EventKind::Signal => 5,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::Join => "JOIN",
            EventKind::Leave => "LEAVE",
            EventKind::Died => "DIED",
            EventKind::Elect => "ELECT",
            EventKind::UnElect => "UN_ELECT",
            EventKind::Signal => "SIGNAL",
        };
        f.write_str(name)
    }
}

/// One immutable fact in a pool's totally ordered history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub time: EventTime,
    pub kind: EventKind,
    pub label: Option<String>,
    pub subjects: Vec<Identity>,
}

impl Event {
    pub fn new(
        time: EventTime,
        kind: EventKind,
        label: Option<String>,
        subjects: Vec<Identity>,
    ) -> Self {
        Self {
            time,
            kind,
            label,
            subjects,
        }
    }

    /// Whether the given member is one of the subjects of this event
    pub fn concerns(&self, identity: &Identity) -> bool {
        self.subjects.iter().any(|s| s == identity)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @{}", self.kind, self.time)?;
        if let Some(label) = &self.label {
            write!(f, " \"{}\"", label)?;
        }
        for subject in &self.subjects {
            write!(f, " {}", subject.id())?;
        }
        Ok(())
    }
}
