//! Ordered byte streams built on the packet queues
//!
//! Both ends of a tunnel expose the same [`TunnelStream`] interface; the
//! shared plumbing (queues, deadlines, chunking) lives in [`PacketStream`].

use async_trait::async_trait;
use log::{debug, info};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::error::Result;
use crate::queue::{InQueue, OutQueue};

/// Size of the buffers used by [`relay`]
const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Ordered, bidirectional byte stream with cooperative deadlines
#[async_trait]
pub trait TunnelStream: Send + Sync {
    /// Read into `buf`, returning 0 at end of stream
    async fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Write all of `data`, returning once the peer has acknowledged it
    async fn write(&self, data: &[u8]) -> Result<usize>;

    async fn close(&self) -> Result<()>;

    fn set_read_deadline(&self, deadline: Option<Instant>);

    fn set_write_deadline(&self, deadline: Option<Instant>);
}

/// Queue pair plus the settings shared by client and server streams
#[derive(Debug)]
pub struct PacketStream {
    pub outbound: OutQueue,
    pub inbound: InQueue,
    mtu: AtomicUsize,
    read_deadline: Mutex<Option<Instant>>,
    write_deadline: Mutex<Option<Instant>>,
}

impl PacketStream {
    pub fn new(mtu: usize) -> Self {
        Self {
            outbound: OutQueue::new(),
            inbound: InQueue::new(),
            mtu: AtomicUsize::new(mtu),
            read_deadline: Mutex::new(None),
            write_deadline: Mutex::new(None),
        }
    }

    pub fn mtu(&self) -> usize {
        self.mtu.load(Ordering::Relaxed)
    }

    /// Chunk size for data queued from now on
    pub fn set_mtu(&self, mtu: usize) {
        self.mtu.store(mtu, Ordering::Relaxed);
    }

    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let deadline = *lock(&self.read_deadline);
        self.inbound.read(buf, deadline).await
    }

    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        let deadline = *lock(&self.write_deadline);
        self.outbound.write(data, self.mtu(), deadline).await
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        *lock(&self.read_deadline) = deadline;
    }

    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        *lock(&self.write_deadline) = deadline;
    }

    /// Wake blocked readers and writers for good
    pub async fn shutdown(&self) {
        self.outbound.close().await;
        self.inbound.close().await;
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Pump bytes between `stream` and `tcp`. The relay ends when the tunnel
/// side finishes; local EOF only stops the upload direction. Returns (bytes
/// sent into the tunnel, bytes received from it).
pub async fn relay(stream: Arc<dyn TunnelStream>, tcp: TcpStream) -> Result<(u64, u64)> {
    let peer = tcp.peer_addr().ok();
    let (mut tcp_read, mut tcp_write) = tcp.into_split();

    let upload = {
        let stream = stream.clone();
        async move {
            let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
            let mut total = 0u64;
            loop {
                let n = tcp_read.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                stream.write(&buf[..n]).await?;
                total += n as u64;
            }
            Ok::<u64, crate::error::TunnelError>(total)
        }
    };

    let download = {
        let stream = stream.clone();
        async move {
            let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
            let mut total = 0u64;
            loop {
                let n = stream.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                tcp_write.write_all(&buf[..n]).await?;
                total += n as u64;
            }
            tcp_write.shutdown().await?;
            Ok::<u64, crate::error::TunnelError>(total)
        }
    };

    tokio::pin!(upload);
    tokio::pin!(download);

    // local EOF is a half-close: keep delivering what the tunnel still sends
    let (sent, received) = tokio::select! {
        sent = &mut upload => {
            let sent = match sent {
                Ok(sent) => sent,
                Err(e) => {
                    stream.close().await?;
                    return Err(e);
                }
            };
            debug!("Relay {:?}: local side finished after {} bytes", peer, sent);
            let received = download.await;
            stream.close().await?;
            (sent, received?)
        }
        received = &mut download => {
            debug!("Relay {:?}: tunnel side finished", peer);
            stream.close().await?;
            (0, received?)
        }
    };
    info!("Relay {:?} closed (sent {}, received {})", peer, sent, received);
    Ok((sent, received))
}
