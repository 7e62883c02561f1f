//! Client end of the tunnel
//!
//! [`DnsClient::connect`] negotiates a session over an injected
//! [`DnsTransport`] and returns a [`DnsConn`]. A background poller then moves
//! queued chunks upstream and collects downstream data, one round trip at a
//! time; reads and writes only touch the queues.

use async_trait::async_trait;
use log::{debug, info, warn};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::command::{Request, Response, SessionOptions};
use crate::dns::name::normalize_domain;
use crate::encoding::Encoder;
use crate::error::{Result, TunnelError};
use crate::handshake::{self, Overrides};
use crate::session::{Channel, Serializer, MULTI_QUERY_BATCH};
use crate::stream::{PacketStream, TunnelStream};
use crate::transport::DnsTransport;

/// Identical consecutive poll failures that end the session
pub const MAX_CONSECUTIVE_ERRORS: u32 = 5;

const JITTER_MS: i64 = 150;
const ERROR_BACKOFF: Duration = Duration::from_millis(200);
const MIN_POLL_DELAY: Duration = Duration::from_millis(250);

/// Client settings
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub domain: String,
    pub overrides: Overrides,
    pub poll_interval: Duration,
    /// Poll interval once the server holds polls for us
    pub lazy_poll_interval: Duration,
    pub round_trip_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            domain: String::new(),
            overrides: Overrides::default(),
            poll_interval: Duration::from_secs(1),
            lazy_poll_interval: Duration::from_millis(250),
            round_trip_timeout: Duration::from_secs(5),
        }
    }
}

/// Opens tunnel sessions
#[derive(Debug, Clone)]
pub struct DnsClient {
    options: ClientOptions,
}

impl DnsClient {
    pub fn new(mut options: ClientOptions) -> Self {
        options.domain = normalize_domain(&options.domain);
        Self { options }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Negotiate a session over `transport` and start polling
    pub async fn connect(&self, transport: Arc<dyn DnsTransport>) -> Result<DnsConn> {
        let channel = Channel::new(transport);
        let domain = &self.options.domain;
        let overrides = &self.options.overrides;

        let serializer = match handshake::run(&channel, domain, overrides).await {
            Err(e) if encoder_unreliable(&e) && overrides.downstream_encoder.is_none() => {
                warn!("{}; retrying handshake with base32 downstream", root_cause(&e));
                let pinned = Overrides {
                    downstream_encoder: Some(Encoder::Base32),
                    ..overrides.clone()
                };
                handshake::run(&channel, domain, &pinned).await?
            }
            result => result?,
        };

        Ok(DnsConn::start(channel, serializer, self.options.clone()))
    }
}

fn encoder_unreliable(err: &TunnelError) -> bool {
    match err {
        TunnelError::EncoderUnreliable(_) => true,
        TunnelError::Handshake { source, .. } => encoder_unreliable(source),
        _ => false,
    }
}

fn root_cause(err: &TunnelError) -> &TunnelError {
    match err {
        TunnelError::Handshake { source, .. } | TunnelError::TooManyErrors(source) => root_cause(source),
        other => other,
    }
}

/// Delay before the next scheduled poll
fn poll_delay(base: Duration, consecutive_errors: u32, jitter_ms: i64) -> Duration {
    let millis = base.as_millis() as i64 + jitter_ms
        + (ERROR_BACKOFF.as_millis() as i64) * consecutive_errors as i64;
    Duration::from_millis(millis.max(0) as u64).max(MIN_POLL_DELAY)
}

/// Counts how often the same failure repeats
#[derive(Debug, Default)]
struct ErrorStreak {
    last: Option<String>,
    count: u32,
}

impl ErrorStreak {
    fn record(&mut self, err: &TunnelError) -> u32 {
        let text = err.to_string();
        if self.last.as_deref() == Some(text.as_str()) {
            self.count += 1;
        } else {
            self.last = Some(text);
            self.count = 1;
        }
        self.count
    }

    fn reset(&mut self) {
        self.last = None;
        self.count = 0;
    }
}

struct Inner {
    channel: Channel,
    serializer: Serializer,
    stream: PacketStream,
    options: ClientOptions,
    closed: AtomicBool,
    shutdown: Notify,
}

impl Inner {
    fn base_interval(&self) -> Duration {
        if self.serializer.use_lazy_mode {
            self.options.lazy_poll_interval
        } else {
            self.options.poll_interval
        }
    }

    /// One `Packet` round trip. Returns whether another poll should follow
    /// right away.
    async fn poll_once(&self) -> Result<bool> {
        let last_acked = self.stream.inbound.last_acked().await;
        let batch = if self.serializer.use_multi_query { MULTI_QUERY_BATCH } else { 1 };
        let chunks = self.stream.outbound.next_chunks(batch).await;

        let requests: Vec<Request> = if chunks.is_empty() {
            vec![Request::Packet {
                nonce: rand::random(),
                last_acked,
                packet: None,
            }]
        } else {
            chunks
                .into_iter()
                .map(|packet| Request::Packet {
                    nonce: rand::random(),
                    last_acked,
                    packet: Some(packet),
                })
                .collect()
        };

        let responses = self
            .channel
            .exchange(&self.serializer, &requests, self.options.round_trip_timeout)
            .await?;

        let mut received = false;
        for response in responses {
            match response {
                Response::Packet { last_acked, packet } => {
                    if let Some(seq) = last_acked {
                        self.stream.outbound.update_acked(seq).await;
                    }
                    received |= packet.is_some();
                    self.stream.inbound.append(packet).await?;
                }
                other => {
                    return Err(TunnelError::Corrupted(format!(
                        "unexpected {:?} response to a poll",
                        other.command()
                    )))
                }
            }
        }
        Ok(received || !self.stream.outbound.is_empty().await)
    }

    async fn run_poller(self: Arc<Self>) {
        let mut errors = ErrorStreak::default();
        let mut immediate = false;

        loop {
            if !immediate {
                let jitter = rand::thread_rng().gen_range(-JITTER_MS..=JITTER_MS);
                let delay = poll_delay(self.base_interval(), errors.count, jitter);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.stream.outbound.chunk_ready() => {}
                    _ = self.shutdown.notified() => break,
                }
            }
            if self.closed.load(Ordering::SeqCst) {
                break;
            }

            match self.poll_once().await {
                Ok(busy) => {
                    errors.reset();
                    immediate = busy;
                }
                Err(e) if e.is_fatal() => {
                    warn!("Tunnel session ended: {}", e);
                    self.stream.shutdown().await;
                    break;
                }
                Err(e) => {
                    immediate = false;
                    let repeats = errors.record(&e);
                    debug!("Poll failed ({} in a row): {}", repeats, e);
                    if repeats >= MAX_CONSECUTIVE_ERRORS {
                        let err = TunnelError::TooManyErrors(Box::new(e));
                        warn!("Tearing down tunnel session: {} ({})", err, root_cause(&err));
                        self.stream.shutdown().await;
                        break;
                    }
                }
            }
        }
        debug!("Poller stopped");
    }
}

/// Client end of an established session
pub struct DnsConn {
    inner: Arc<Inner>,
    poller: StdMutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for DnsConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsConn")
            .field("serializer", &self.inner.serializer)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl DnsConn {
    fn start(channel: Channel, serializer: Serializer, options: ClientOptions) -> Self {
        let stream = PacketStream::new(serializer.upstream.fragment_size);
        let inner = Arc::new(Inner {
            channel,
            serializer,
            stream,
            options,
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        });
        let poller = tokio::spawn(inner.clone().run_poller());
        Self {
            inner,
            poller: StdMutex::new(Some(poller)),
        }
    }

    /// Parameters the handshake settled on
    pub fn serializer(&self) -> &Serializer {
        &self.inner.serializer
    }

    pub fn user_id(&self) -> Option<u16> {
        self.inner.serializer.user_id
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn take_poller(&self) -> Option<JoinHandle<()>> {
        self.poller
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    async fn teardown(&self) {
        let inner = &self.inner;
        inner.shutdown.notify_one();
        if let Some(poller) = self.take_poller() {
            let _ = poller.await;
        }

        let timeout = inner.options.round_trip_timeout;
        let final_ack = Request::Packet {
            nonce: rand::random(),
            last_acked: inner.stream.inbound.last_acked().await,
            packet: None,
        };
        match inner.channel.call(&inner.serializer, final_ack, timeout).await {
            Ok(Response::Packet {
                last_acked: Some(seq),
                ..
            }) => inner.stream.outbound.update_acked(seq).await,
            Ok(_) => {}
            Err(e) => debug!("Final ack failed: {}", e),
        }

        let goodbye = Request::SetOptions(SessionOptions {
            closed: Some(true),
            ..Default::default()
        });
        match inner.channel.call(&inner.serializer, goodbye, timeout).await {
            Ok(_) => info!("Session {:?} closed", inner.serializer.user_id),
            Err(e) if e.is_bad_connection() => {
                debug!("Server had already dropped session {:?}", inner.serializer.user_id)
            }
            Err(e) => warn!("Teardown of session {:?} failed: {}", inner.serializer.user_id, e),
        }

        if let Err(e) = inner.channel.close().await {
            debug!("Closing transport: {}", e);
        }
        inner.stream.shutdown().await;
    }
}

#[async_trait]
impl TunnelStream for DnsConn {
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.inner.stream.read(buf).await
    }

    async fn write(&self, data: &[u8]) -> Result<usize> {
        if self.is_closed() {
            return Err(TunnelError::Closed);
        }
        self.inner.stream.write(data).await
    }

    async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.teardown().await;
        Ok(())
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.inner.stream.set_read_deadline(deadline);
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.inner.stream.set_write_deadline(deadline);
    }
}

impl Drop for DnsConn {
    fn drop(&mut self) {
        if let Some(poller) = self.take_poller() {
            poller.abort();
        }
    }
}
