//! TCP implementation of the update-push transport.
//!
//! Locators are plain socket-address strings ("10.0.0.7:11100"). Each
//! target gets one cached connection carrying length-prefixed MessagePack
//! frames: one `ListPayload` request, one `UpdateReply` response. Request
//! and response strictly alternate because the updater never has more than
//! one RPC in flight per target.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::ids::ServerId;
use crate::message::{ListPayload, UpdateReply};
use crate::transport::{Session, SessionFactory};
use crate::utils::RosterError;

use async_trait::async_trait;

use bytes::BytesMut;

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use serde::de::DeserializeOwned;
use serde::Serialize;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{self, Duration};

/// Interval between connection attempts while the port grace period lasts.
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Writes one length-prefixed MessagePack frame.
pub(crate) async fn send_framed<T, W>(
    conn_write: &mut W,
    obj: &T,
) -> Result<(), RosterError>
where
    T: Serialize,
    W: AsyncWriteExt + Unpin,
{
    let bytes = encode_to_vec(obj)?;
    conn_write.write_u64(bytes.len() as u64).await?;
    conn_write.write_all(&bytes).await?;
    conn_write.flush().await?;
    Ok(())
}

/// Reads one length-prefixed MessagePack frame, buffering partial reads in
/// `read_buf`.
pub(crate) async fn recv_framed<T, R>(
    read_buf: &mut BytesMut,
    conn_read: &mut R,
) -> Result<T, RosterError>
where
    T: DeserializeOwned,
    R: AsyncReadExt + Unpin,
{
    while read_buf.len() < 8 {
        if conn_read.read_buf(read_buf).await? == 0 {
            return Err(RosterError::Transport("connection closed".into()));
        }
    }
    let obj_len = u64::from_be_bytes(read_buf[..8].try_into().unwrap());
    let obj_end = 8 + obj_len as usize;
    while read_buf.len() < obj_end {
        if conn_read.read_buf(read_buf).await? == 0 {
            return Err(RosterError::Transport("connection closed".into()));
        }
    }
    let obj = decode_from_slice(&read_buf[8..obj_end])?;
    let _ = read_buf.split_to(obj_end);
    Ok(obj)
}

struct SessionIo {
    conn_read: OwnedReadHalf,
    conn_write: OwnedWriteHalf,
    read_buf: BytesMut,
}

/// One cached connection to a target server.
struct TcpSession {
    target: ServerId,
    io: AsyncMutex<SessionIo>,

    /// Set on any I/O failure; a broken session is evicted from the cache
    /// the next time the factory is asked for its target.
    broken: AtomicBool,

    /// Per-RPC deadline.
    timeout: Duration,
}

impl TcpSession {
    async fn exchange(
        io: &mut SessionIo,
        payload: &ListPayload,
    ) -> Result<UpdateReply, RosterError> {
        send_framed(&mut io.conn_write, payload).await?;
        recv_framed(&mut io.read_buf, &mut io.conn_read).await
    }
}

#[async_trait]
impl Session for TcpSession {
    async fn update_server_list(
        &self,
        payload: ListPayload,
    ) -> Result<bool, RosterError> {
        if self.broken.load(Ordering::Acquire) {
            return Err(RosterError::Transport(format!(
                "session to {} is broken",
                self.target
            )));
        }
        let mut io = self.io.lock().await;
        match time::timeout(self.timeout, Self::exchange(&mut io, &payload))
            .await
        {
            Ok(Ok(reply)) => Ok(reply.ack),
            Ok(Err(e)) => {
                self.broken.store(true, Ordering::Release);
                Err(RosterError::Transport(e.to_string()))
            }
            Err(_) => {
                // the frame exchange may be half done; never reuse
                self.broken.store(true, Ordering::Release);
                Err(RosterError::Transport(format!(
                    "update rpc to {} timed out",
                    self.target
                )))
            }
        }
    }
}

/// Session factory connecting over TCP, with one cached session per target.
pub struct TcpSessionFactory {
    /// Per-RPC deadline handed to sessions.
    session_timeout: Duration,

    /// How long to keep retrying the initial connect to a target.
    port_timeout: Duration,

    cache: Mutex<HashMap<ServerId, Arc<TcpSession>>>,
}

impl TcpSessionFactory {
    pub fn new(session_timeout: Duration, port_timeout: Duration) -> Self {
        TcpSessionFactory {
            session_timeout,
            port_timeout,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Connects to `addr`, retrying until the port grace period runs out.
    async fn connect_with_retry(
        &self,
        addr: SocketAddr,
    ) -> Result<TcpStream, RosterError> {
        let mut retries_left = (self.port_timeout.as_millis()
            / CONNECT_RETRY_INTERVAL.as_millis())
            as u32;
        loop {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
                Err(e) => {
                    if retries_left == 0 {
                        return Err(RosterError::Transport(e.to_string()));
                    }
                    retries_left -= 1;
                    time::sleep(CONNECT_RETRY_INTERVAL).await;
                }
            }
        }
    }
}

#[async_trait]
impl SessionFactory for TcpSessionFactory {
    async fn open(
        &self,
        target: ServerId,
        locator: &str,
    ) -> Result<Arc<dyn Session>, RosterError> {
        let cached = {
            let cache = self.cache.lock().unwrap();
            cache.get(&target).cloned()
        };
        if let Some(session) = cached {
            if !session.broken.load(Ordering::Acquire) {
                return Ok(session);
            }
        }

        let addr: SocketAddr = locator.parse().map_err(|_| {
            RosterError::Transport(format!(
                "unparseable locator '{}' for {}",
                locator, target
            ))
        })?;
        let stream = self.connect_with_retry(addr).await?;
        pf_debug!("t"; "connected to {} at '{}'", target, locator);
        let (conn_read, conn_write) = stream.into_split();
        let session = Arc::new(TcpSession {
            target,
            io: AsyncMutex::new(SessionIo {
                conn_read,
                conn_write,
                read_buf: BytesMut::with_capacity(8 + 1024),
            }),
            broken: AtomicBool::new(false),
            timeout: self.session_timeout,
        });
        self.cache
            .lock()
            .unwrap()
            .insert(target, session.clone());
        Ok(session)
    }
}
