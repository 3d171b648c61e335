//! Member side of the registry protocol.
//!
//! [`RegistryClient`] issues requests to a registry server, one connection per
//! request. [`MemberEndpoint`] is the listener a member registers as its
//! address: it answers the server's PING with the member's identity and
//! records the events the server pushes to it.

use crate::connection::Connection;
use crate::error::{RegistryError, Result};
use crate::protocol::{
    decode, ElectRequest, JoinReply, JoinRequest, MemberRequest, Opcode, PoolState, PushAck,
    PushEvents, PushRequest, Request, SequenceRequest, SignalRequest, StateRequest, SubjectRequest,
    CLIENT_MAGIC_BYTE, SERVER_MAGIC_BYTE,
};
use crate::types::{Event, EventTime, Identity, Location};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

/// Default timeout for client requests
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Issues requests to a registry server
#[derive(Debug, Clone)]
pub struct RegistryClient {
    server: SocketAddr,
    timeout: Duration,
}

impl RegistryClient {
    pub fn new(server: SocketAddr) -> Self {
        Self {
            server,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn join(
        &self,
        pool: &str,
        implementation_id: &str,
        address: SocketAddr,
        location: Location,
        implementation_data: Vec<u8>,
    ) -> Result<JoinReply> {
        let body = self
            .call(&Request::Join(JoinRequest {
                address,
                pool: pool.to_string(),
                implementation_id: implementation_id.to_string(),
                implementation_data,
                location,
            }))
            .await?;
        decode(&body)
    }

    pub async fn leave(&self, identity: &Identity) -> Result<()> {
        self.call(&Request::Leave(member(identity))).await?;
        Ok(())
    }

    pub async fn elect(&self, identity: &Identity, label: &str) -> Result<Identity> {
        let body = self
            .call(&Request::Elect(ElectRequest {
                identity: identity.clone(),
                label: label.to_string(),
            }))
            .await?;
        decode(&body)
    }

    /// Next value of the pool-wide counter, or of the counter called `name`
    pub async fn sequence_number(&self, identity: &Identity, name: Option<&str>) -> Result<u64> {
        let body = self
            .call(&Request::SequenceNr(SequenceRequest {
                identity: identity.clone(),
                name: name.map(str::to_string),
            }))
            .await?;
        decode(&body)
    }

    /// Report `subject` as dead
    pub async fn dead(&self, identity: &Identity, subject: &Identity) -> Result<()> {
        self.call(&Request::Dead(SubjectRequest {
            identity: identity.clone(),
            subject: subject.clone(),
        }))
        .await?;
        Ok(())
    }

    /// Ask the server to check on `subject`
    pub async fn maybe_dead(&self, identity: &Identity, subject: &Identity) -> Result<()> {
        self.call(&Request::MaybeDead(SubjectRequest {
            identity: identity.clone(),
            subject: subject.clone(),
        }))
        .await?;
        Ok(())
    }

    pub async fn signal(&self, identity: &Identity, label: &str, targets: &[Identity]) -> Result<()> {
        self.call(&Request::Signal(SignalRequest {
            identity: identity.clone(),
            label: label.to_string(),
            targets: targets.to_vec(),
        }))
        .await?;
        Ok(())
    }

    pub async fn get_state(
        &self,
        identity: &Identity,
        join_time: Option<EventTime>,
    ) -> Result<PoolState> {
        let body = self
            .call(&Request::GetState(StateRequest {
                identity: identity.clone(),
                join_time,
            }))
            .await?;
        decode(&body)
    }

    pub async fn heartbeat(&self, identity: &Identity) -> Result<()> {
        self.call(&Request::Heartbeat(member(identity))).await?;
        Ok(())
    }

    /// One request/reply exchange, returning the reply body
    async fn call(&self, request: &Request) -> Result<Vec<u8>> {
        let mut conn = Connection::connect(self.server, self.timeout).await?;
        conn.write_header(SERVER_MAGIC_BYTE, request.opcode().as_u8())
            .await?;
        conn.write_frame(&request.encode_body()?).await?;

        timeout(self.timeout, conn.get_and_check_reply()).await??;
        let body = timeout(self.timeout, conn.read_frame()).await??;
        conn.close().await;
        Ok(body)
    }
}

fn member(identity: &Identity) -> MemberRequest {
    MemberRequest {
        identity: identity.clone(),
    }
}

#[derive(Default)]
struct Received {
    identity: Option<Identity>,
    /// First event time still needed, `None` until the first push
    next_event_time: Option<EventTime>,
    events: Vec<Event>,
}

struct EndpointShared {
    received: Mutex<Received>,
    responsive: AtomicBool,
    changed: Notify,
}

/// Listener answering the registry's PING and PUSH requests for one member
pub struct MemberEndpoint {
    local_addr: SocketAddr,
    shared: Arc<EndpointShared>,
    task: JoinHandle<()>,
}

impl MemberEndpoint {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let shared = Arc::new(EndpointShared {
            received: Mutex::new(Received::default()),
            responsive: AtomicBool::new(true),
            changed: Notify::new(),
        });

        let task = tokio::spawn(serve_endpoint(listener, shared.clone()));
        Ok(Self {
            local_addr,
            shared,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Identity to answer PINGs with, known once the member has joined
    pub fn set_identity(&self, identity: Identity) {
        self.shared.received.lock().identity = Some(identity);
    }

    /// When false, every incoming connection is dropped without an answer
    pub fn set_responsive(&self, responsive: bool) {
        self.shared.responsive.store(responsive, Ordering::SeqCst);
    }

    /// Only accept pushed events from `time` on
    pub fn set_next_event_time(&self, time: EventTime) {
        self.shared.received.lock().next_event_time = Some(time);
    }

    pub fn next_event_time(&self) -> Option<EventTime> {
        self.shared.received.lock().next_event_time
    }

    /// All events received so far, in order
    pub fn events(&self) -> Vec<Event> {
        self.shared.received.lock().events.clone()
    }

    /// Wait until every event before `time` has arrived
    pub async fn wait_for_event_time(&self, time: EventTime, wait: Duration) -> bool {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.next_event_time().map(|t| t >= time).unwrap_or(false) {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return false;
            }
        }
    }
}

impl Drop for MemberEndpoint {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_endpoint(listener: TcpListener, shared: Arc<EndpointShared>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Endpoint: accept failed: {}", e);
                continue;
            }
        };

        if !shared.responsive.load(Ordering::SeqCst) {
            drop(stream);
            continue;
        }

        let shared = shared.clone();
        tokio::spawn(async move {
            if let Err(e) = answer(&shared, stream, peer).await {
                debug!("Endpoint: request from {} failed: {}", peer, e);
            }
        });
    }
}

async fn answer(shared: &EndpointShared, stream: TcpStream, peer: SocketAddr) -> Result<()> {
    let mut conn = Connection::new(stream, peer);
    let magic = conn.read_u8().await?;
    if magic != CLIENT_MAGIC_BYTE {
        return Err(RegistryError::protocol(format!(
            "invalid magic byte: {:#04x}",
            magic
        )));
    }

    match Opcode::try_from(conn.read_u8().await?)? {
        Opcode::Ping => {
            let identity = shared.received.lock().identity.clone();
            match identity {
                Some(identity) => {
                    conn.send_ok_reply().await?;
                    conn.write_value(&identity).await?;
                }
                None => conn.send_error("not joined yet").await?,
            }
        }
        Opcode::Push => {
            let request: PushRequest = conn.read_value().await?;
            let requested = shared.received.lock().next_event_time;
            conn.write_value(&PushAck { requested }).await?;

            conn.get_and_check_reply().await?;
            let pushed: PushEvents = conn.read_value().await?;
            debug!(
                "Endpoint: {} events for pool \"{}\" (history from {})",
                pushed.events.len(),
                request.pool,
                pushed.min_event_time
            );
            apply(shared, pushed.events);
            conn.send_ok_reply().await?;
        }
        other => {
            conn.send_error(&format!("unsupported opcode: {}", other))
                .await?
        }
    }

    conn.close().await;
    Ok(())
}

/// Record events in order, skipping ones already seen
fn apply(shared: &EndpointShared, events: Vec<Event>) {
    let mut received = shared.received.lock();
    for event in events {
        if received.next_event_time.map(|t| event.time < t).unwrap_or(false) {
            continue;
        }
        received.next_event_time = Some(event.time + 1);
        received.events.push(event);
    }
    drop(received);
    shared.changed.notify_waiters();
}
