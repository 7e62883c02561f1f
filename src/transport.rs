//! DNS transport abstraction
//!
//! The tunnel engine never touches sockets itself. It hands complete DNS
//! messages to a [`DnsTransport`] and gets the matching response back, which
//! keeps the engine testable against in-memory resolvers.

use async_trait::async_trait;
use log::debug;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::{timeout_at, Instant};

use crate::dns::{self, Message, MessageType};
use crate::error::{Result, TunnelError};

/// Largest datagram we are prepared to receive
const RECV_BUFFER_SIZE: usize = 65535;

/// Request/response primitive used by the tunnel
#[async_trait]
pub trait DnsTransport: Send + Sync {
    /// Send `query` and wait up to `timeout` for its response. Returns the
    /// response and the measured round-trip time.
    async fn send_and_receive(&self, query: &Message, timeout: Duration) -> Result<(Message, Duration)>;

    /// Release the underlying resources; later calls fail with `Closed`
    async fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;

    fn local_addr(&self) -> Option<SocketAddr>;

    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Latest instant a response may arrive, on top of the per-call timeout.
    /// Expiry fails the call with `DeadlineExceeded`.
    fn set_read_deadline(&self, deadline: Option<Instant>);

    /// Latest instant a query may still be sent
    fn set_write_deadline(&self, deadline: Option<Instant>);
}

/// DNS over a connected UDP socket
pub struct UdpTransport {
    // held for a whole exchange so responses cannot be stolen by another
    // caller; emptied by `close`
    socket: Mutex<Option<UdpSocket>>,
    local: SocketAddr,
    resolver: SocketAddr,
    closed: AtomicBool,
    read_deadline: StdMutex<Option<Instant>>,
    write_deadline: StdMutex<Option<Instant>>,
}

impl UdpTransport {
    /// Bind an ephemeral port and connect it to `resolver`
    pub async fn connect(resolver: SocketAddr) -> Result<Self> {
        let local: SocketAddr = match (resolver.is_ipv4(), resolver.ip().is_loopback()) {
            (true, true) => "127.0.0.1:0",
            (true, false) => "0.0.0.0:0",
            (false, true) => "[::1]:0",
            (false, false) => "[::]:0",
        }
        .parse()
        .map_err(|e| TunnelError::InvalidConfig(format!("bind address: {}", e)))?;

        let socket = UdpSocket::bind(local).await?;
        socket.connect(resolver).await?;
        let local = socket.local_addr()?;
        debug!("DNS transport {} -> {}", local, resolver);

        Ok(Self {
            socket: Mutex::new(Some(socket)),
            local,
            resolver,
            closed: AtomicBool::new(false),
            read_deadline: StdMutex::new(None),
            write_deadline: StdMutex::new(None),
        })
    }
}

fn lock<T>(m: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl DnsTransport for UdpTransport {
    async fn send_and_receive(&self, query: &Message, timeout: Duration) -> Result<(Message, Duration)> {
        if self.is_closed() {
            return Err(TunnelError::Closed);
        }
        let guard = self.socket.lock().await;
        let socket = guard.as_ref().ok_or(TunnelError::Closed)?;

        let bytes = dns::encode(query)?;
        let write_deadline = *lock(&self.write_deadline);
        match write_deadline {
            Some(deadline) => timeout_at(deadline, socket.send(&bytes))
                .await
                .map_err(|_| TunnelError::DeadlineExceeded)??,
            None => socket.send(&bytes).await?,
        };

        let started = Instant::now();
        let call_deadline = started + timeout;
        let read_deadline = *lock(&self.read_deadline);
        let (deadline, expired) = match read_deadline {
            Some(read) if read < call_deadline => (read, TunnelError::DeadlineExceeded),
            _ => (call_deadline, TunnelError::Timeout(timeout)),
        };

        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            let n = match timeout_at(deadline, socket.recv(&mut buf)).await {
                Ok(received) => received?,
                Err(_) => return Err(expired),
            };

            let response = match dns::decode(&buf[..n]) {
                Ok(response) => response,
                Err(e) => {
                    debug!("Dropping unparseable datagram: {}", e);
                    continue;
                }
            };
            // late answers to earlier, timed-out queries are discarded
            if response.message_type() != MessageType::Response || response.id() != query.id() {
                debug!("Dropping stale response id {}", response.id());
                continue;
            }
            return Ok((response, started.elapsed()));
        }
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        if self.socket.lock().await.take().is_some() {
            debug!("DNS transport {} released", self.local);
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local)
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.resolver)
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) {
        *lock(&self.read_deadline) = deadline;
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) {
        *lock(&self.write_deadline) = deadline;
    }
}
