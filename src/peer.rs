use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::message::{read_frame, write_frame, NodeId, Request, Response};

/// Cap on establishing the TCP connection.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(2);
/// Hard deadline for one request/response exchange.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Outbound channel to one cluster member.
///
/// The connection is dialed on first use and cached. A deadline or transport
/// error drops the cached stream so the next call redials; the mutex keeps a
/// single call in flight per peer, which is what makes reusing the stream
/// safe.
#[derive(Debug)]
pub struct Peer {
    id: NodeId,
    addr: String,
    conn: Mutex<Option<TcpStream>>,
}

impl Peer {
    pub fn new(id: NodeId, addr: impl Into<String>) -> Self {
        Self {
            id,
            addr: addr.into(),
            conn: Mutex::new(None),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Sends one request and waits for its reply, redialing if needed.
    pub async fn call(&self, request: &Request) -> Result<Response> {
        let mut conn = self.conn.lock().await;

        if conn.is_none() {
            debug!(peer = self.id, addr = %self.addr, "dialing peer");
            let stream = match timeout(DIAL_TIMEOUT, TcpStream::connect(&self.addr)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(err)) => {
                    warn!(peer = self.id, error = %err, "failed to dial peer");
                    return Err(err.into());
                }
                Err(_) => {
                    warn!(peer = self.id, "dial timed out");
                    return Err(Error::Timeout);
                }
            };
            *conn = Some(stream);
        }
        let stream = conn.as_mut().ok_or(Error::ConnectionClosed)?;

        match timeout(CALL_TIMEOUT, exchange(stream, request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => {
                warn!(peer = self.id, error = %err, "call failed, dropping connection");
                *conn = None;
                Err(err)
            }
            Err(_) => {
                warn!(peer = self.id, "call timed out, dropping connection");
                *conn = None;
                Err(Error::Timeout)
            }
        }
    }

    /// Drops the cached connection, if any.
    pub async fn close(&self) {
        *self.conn.lock().await = None;
    }
}

async fn exchange(stream: &mut TcpStream, request: &Request) -> Result<Response> {
    write_frame(stream, request).await?;
    match read_frame::<_, Response>(stream).await? {
        Some(response) => Ok(response),
        None => Err(Error::ConnectionClosed),
    }
}
