//! Wire protocol of the registry.
//!
//! Every connection starts with a magic byte and an opcode byte, followed by
//! a length-prefixed JSON body. Replies start with [`REPLY_OK`] followed by a
//! body, or [`REPLY_ERROR`] followed by a UTF string.
//!
//! ```text
//! request:  [magic u8][opcode u8][len u32][json ...]
//! reply:    [REPLY_OK u8][len u32][json ...]
//!           [REPLY_ERROR u8][len u16][utf-8 ...]
//! ```

use crate::error::{RegistryError, Result};
use crate::types::{Event, EventTime, Identity, Location};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// First byte of every request sent to the registry server
pub const SERVER_MAGIC_BYTE: u8 = 0x52;

/// First byte of every request the registry sends to a member
pub const CLIENT_MAGIC_BYTE: u8 = 0x4d;

pub const REPLY_OK: u8 = 1;
pub const REPLY_ERROR: u8 = 2;

/// Largest body frame accepted from the network (16 MiB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Operation selector, second byte of every request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Join = 0,
    Leave = 1,
    Elect = 2,
    SequenceNr = 3,
    Dead = 4,
    MaybeDead = 5,
    Signal = 6,
    GetState = 7,
    Heartbeat = 8,
    Ping = 9,
    Push = 10,
}

impl Opcode {
    pub const COUNT: usize = 11;

    pub const ALL: [Opcode; Opcode::COUNT] = [
        Opcode::Join,
        Opcode::Leave,
        Opcode::Elect,
        Opcode::SequenceNr,
        Opcode::Dead,
        Opcode::MaybeDead,
        Opcode::Signal,
        Opcode::GetState,
        Opcode::Heartbeat,
        Opcode::Ping,
        Opcode::Push,
    ];

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Opcode::Join => "JOIN",
            Opcode::Leave => "LEAVE",
            Opcode::Elect => "ELECT",
            Opcode::SequenceNr => "SEQUENCE_NR",
            Opcode::Dead => "DEAD",
            Opcode::MaybeDead => "MAYBE_DEAD",
            Opcode::Signal => "SIGNAL",
            Opcode::GetState => "GET_STATE",
            Opcode::Heartbeat => "HEARTBEAT",
            Opcode::Ping => "PING",
            Opcode::Push => "PUSH",
        }
    }
}

impl TryFrom<u8> for Opcode {
    type Error = RegistryError;

    fn try_from(value: u8) -> Result<Self> {
        Opcode::ALL
            .get(value as usize)
            .copied()
            .ok_or_else(|| RegistryError::protocol(format!("unknown opcode: {}", value)))
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Body of a JOIN request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    /// Endpoint the joining member accepts PING and PUSH on
    pub address: SocketAddr,
    pub pool: String,
    /// Must match the implementation of the pool's first member
    pub implementation_id: String,
    pub implementation_data: Vec<u8>,
    pub location: Location,
}

/// Reply to a JOIN request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinReply {
    pub identity: Identity,
    /// Time of the member's own JOIN event
    pub join_time: EventTime,
    /// Random selection of the other members
    pub bootstrap: Vec<Identity>,
}

/// Body of requests that only carry the requester (LEAVE, HEARTBEAT)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberRequest {
    pub identity: Identity,
}

/// Body of a SEQUENCE_NR request; without a name the pool-wide counter is used
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceRequest {
    pub identity: Identity,
    #[serde(default)]
    pub name: Option<String>,
}

/// Body of requests about another member (DEAD, MAYBE_DEAD)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectRequest {
    pub identity: Identity,
    pub subject: Identity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectRequest {
    pub identity: Identity,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRequest {
    pub identity: Identity,
    pub label: String,
    pub targets: Vec<Identity>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateRequest {
    pub identity: Identity,
    /// Signals addressed to the requester from this time on are included
    pub join_time: Option<EventTime>,
}

/// Consistent snapshot of a pool, reply to GET_STATE
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolState {
    pub members: Vec<Identity>,
    pub elections: Vec<(String, Identity)>,
    pub signals: Vec<Event>,
    pub event_time: EventTime,
}

/// First message of a PUSH, sent by the registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushRequest {
    pub pool: String,
    /// Event time the registry believes the member has reached
    pub acknowledged: EventTime,
}

/// Member's answer to a PUSH: the first event time it still needs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushAck {
    /// `None` when the member has not received any events yet
    pub requested: Option<EventTime>,
}

/// Events streamed to a member after its [`PushAck`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushEvents {
    pub events: Vec<Event>,
    /// Members may discard their own history before this time
    pub min_event_time: EventTime,
}

/// A decoded client request
#[derive(Debug, Clone)]
pub enum Request {
    Join(JoinRequest),
    Leave(MemberRequest),
    Elect(ElectRequest),
    SequenceNr(SequenceRequest),
    Dead(SubjectRequest),
    MaybeDead(SubjectRequest),
    Signal(SignalRequest),
    GetState(StateRequest),
    Heartbeat(MemberRequest),
}

impl Request {
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::Join(_) => Opcode::Join,
            Request::Leave(_) => Opcode::Leave,
            Request::Elect(_) => Opcode::Elect,
            Request::SequenceNr(_) => Opcode::SequenceNr,
            Request::Dead(_) => Opcode::Dead,
            Request::MaybeDead(_) => Opcode::MaybeDead,
            Request::Signal(_) => Opcode::Signal,
            Request::GetState(_) => Opcode::GetState,
            Request::Heartbeat(_) => Opcode::Heartbeat,
        }
    }

    /// The member sending the request; `None` for a JOIN
    pub fn requester(&self) -> Option<&Identity> {
        match self {
            Request::Join(_) => None,
            Request::Leave(r) | Request::Heartbeat(r) => Some(&r.identity),
            Request::SequenceNr(r) => Some(&r.identity),
            Request::Dead(r) | Request::MaybeDead(r) => Some(&r.identity),
            Request::Elect(r) => Some(&r.identity),
            Request::Signal(r) => Some(&r.identity),
            Request::GetState(r) => Some(&r.identity),
        }
    }

    /// Name of the pool the request is addressed to
    pub fn pool_name(&self) -> &str {
        match self {
            Request::Join(r) => &r.pool,
            _ => self.requester().map(|i| i.pool()).unwrap_or_default(),
        }
    }

    /// Decode a request body for the given opcode
    pub fn decode(opcode: Opcode, body: &[u8]) -> Result<Self> {
        let request = match opcode {
            Opcode::Join => Request::Join(decode(body)?),
            Opcode::Leave => Request::Leave(decode(body)?),
            Opcode::Elect => Request::Elect(decode(body)?),
            Opcode::SequenceNr => Request::SequenceNr(decode(body)?),
            Opcode::Dead => Request::Dead(decode(body)?),
            Opcode::MaybeDead => Request::MaybeDead(decode(body)?),
            Opcode::Signal => Request::Signal(decode(body)?),
            Opcode::GetState => Request::GetState(decode(body)?),
            Opcode::Heartbeat => Request::Heartbeat(decode(body)?),
            Opcode::Ping | Opcode::Push => {
                return Err(RegistryError::protocol(format!(
                    "{} is not a registry server operation",
                    opcode
                )))
            }
        };
        Ok(request)
    }

    pub fn encode_body(&self) -> Result<Vec<u8>> {
        let body = match self {
            Request::Join(r) => serde_json::to_vec(r)?,
            Request::Leave(r) | Request::Heartbeat(r) => serde_json::to_vec(r)?,
            Request::SequenceNr(r) => serde_json::to_vec(r)?,
            Request::Dead(r) | Request::MaybeDead(r) => serde_json::to_vec(r)?,
            Request::Elect(r) => serde_json::to_vec(r)?,
            Request::Signal(r) => serde_json::to_vec(r)?,
            Request::GetState(r) => serde_json::to_vec(r)?,
        };
        Ok(body)
    }
}

/// Successful outcome of a client request
#[derive(Debug, Clone)]
pub enum Response {
    Joined(JoinReply),
    Done,
    Winner(Identity),
    SequenceNumber(u64),
    State(PoolState),
}

impl Response {
    /// Encode the reply body; `Done` has an empty body
    pub fn encode_body(&self) -> Result<Vec<u8>> {
        let body = match self {
            Response::Joined(reply) => serde_json::to_vec(reply)?,
            Response::Done => Vec::new(),
            Response::Winner(winner) => serde_json::to_vec(winner)?,
            Response::SequenceNumber(number) => serde_json::to_vec(number)?,
            Response::State(state) => serde_json::to_vec(state)?,
        };
        Ok(body)
    }
}

/// Decode a JSON body
pub fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(body)?)
}
