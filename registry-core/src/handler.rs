//! Request handling for one accepted connection.
//!
//! Reads `[magic][opcode][body]`, routes the decoded request to the pool it
//! names and answers with `[OK][body]` or `[ERROR][message]`.

use crate::connection::Connection;
use crate::error::{RegistryError, Result};
use crate::protocol::{Opcode, Request, Response, SERVER_MAGIC_BYTE};
use crate::server::PoolRegistry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::debug;

/// Serve a single request and close the connection
pub async fn handle_connection(registry: Arc<PoolRegistry>, stream: TcpStream, peer: SocketAddr) {
    let started = Instant::now();
    let mut conn = Connection::new(stream, peer);

    match serve(&registry, &mut conn).await {
        Ok(opcode) => registry.statistics().record(
            opcode,
            conn.bytes_read(),
            conn.bytes_written(),
            started.elapsed(),
        ),
        Err(e) => {
            registry.statistics().record_failure();
            debug!("Handler: connection from {} dropped: {}", peer, e);
        }
    }

    conn.close().await;
}

async fn serve(registry: &PoolRegistry, conn: &mut Connection) -> Result<Opcode> {
    let read_timeout = registry.config().connect_timeout;

    let request = match timeout(read_timeout, read_request(conn)).await? {
        Ok(request) => request,
        Err(e @ RegistryError::Network(_)) => return Err(e),
        Err(e) => {
            // best effort, the connection is dropped either way
            let _ = conn.send_error(&e.to_string()).await;
            return Err(e);
        }
    };
    let opcode = request.opcode();

    match dispatch(registry, &request) {
        Ok(response) => {
            let body = response.encode_body()?;
            conn.send_ok_reply().await?;
            conn.write_frame(&body).await?;
            if let Some(requester) = request.requester() {
                registry.got_heartbeat(requester);
            }
        }
        Err(e) => {
            debug!("Handler: {} from {} failed: {}", opcode, conn.peer_addr(), e);
            conn.send_error(&e.to_string()).await?;
        }
    }

    Ok(opcode)
}

async fn read_request(conn: &mut Connection) -> Result<Request> {
    let magic = conn.read_u8().await?;
    if magic != SERVER_MAGIC_BYTE {
        return Err(RegistryError::protocol(format!(
            "invalid magic byte: {:#04x}",
            magic
        )));
    }

    let opcode = Opcode::try_from(conn.read_u8().await?)?;
    let body = conn.read_frame().await?;
    Request::decode(opcode, &body)
}

/// Route a decoded request to its pool operation
pub fn dispatch(registry: &PoolRegistry, request: &Request) -> Result<Response> {
    let pool = || registry.get_pool(request.pool_name());

    let response = match request {
        Request::Join(r) => {
            let reply = registry.get_or_create_pool(&r.pool).join(
                &r.implementation_id,
                r.implementation_data.clone(),
                r.address,
                r.location.clone(),
            )?;
            Response::Joined(reply)
        }
        Request::Leave(r) => {
            pool()?.leave(&r.identity)?;
            Response::Done
        }
        Request::Elect(r) => Response::Winner(pool()?.elect(&r.label, &r.identity)?),
        Request::SequenceNr(r) => {
            Response::SequenceNumber(pool()?.next_sequence_number(r.name.as_deref()))
        }
        Request::Dead(r) => {
            let cause = format!("reported dead by {}", r.identity);
            pool()?.dead(&r.subject, &cause);
            Response::Done
        }
        Request::MaybeDead(r) => {
            pool()?.maybe_dead(&r.subject);
            Response::Done
        }
        Request::Signal(r) => {
            pool()?.signal(&r.label, &r.targets);
            Response::Done
        }
        Request::GetState(r) => Response::State(pool()?.state(&r.identity, r.join_time)),
        Request::Heartbeat(_) => {
            // refreshed by the caller once the reply is out
            pool()?;
            Response::Done
        }
    };
    Ok(response)
}
