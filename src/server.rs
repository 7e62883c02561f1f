//! Authoritative tunnel server
//!
//! [`DnsServer::handle`] answers one query at a time and never fails: broken
//! requests get a wire error token, foreign names get `REFUSED`. Sessions
//! start with `Version`, carry their negotiated parameters, and are handed to
//! the application as [`ServerConn`] streams once the first data packet
//! arrives.

use async_trait::async_trait;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout, Instant};

use crate::command::{
    fragment_pattern, split_request, Request, Response, SessionOptions, DOWNSTREAM_CANARY,
    PACKET_RESPONSE_HEADER, PROTOCOL_VERSION,
};
use crate::dns::name::{normalize_domain, strip_domain, undotify};
use crate::dns::{
    self, encode_within, name_bytes, response_to, udp_limit, Message, MessageType, Query, RData, Record,
    ResponseCode,
};
use crate::encoding::Encoder;
use crate::error::{DecodeError, Result, TunnelError, WireError};
use crate::records::{self, QueryType};
use crate::session::{DEFAULT_FRAGMENT_SIZE, MAX_FRAGMENT_SIZE, MIN_FRAGMENT_SIZE};
use crate::stream::{PacketStream, TunnelStream};

/// Server settings
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub domain: String,
    pub max_users: usize,
    pub idle_timeout: Duration,
    pub lazy_hold: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            domain: String::new(),
            max_users: 16,
            idle_timeout: Duration::from_secs(60),
            lazy_hold: Duration::from_millis(500),
        }
    }
}

/// Parameters a client negotiated for its session
#[derive(Debug, Clone, Copy)]
struct UserParams {
    upstream: Encoder,
    downstream: Encoder,
    fragment_size: usize,
    lazy_mode: bool,
    multi_query: bool,
}

impl Default for UserParams {
    fn default() -> Self {
        Self {
            upstream: Encoder::Base32,
            downstream: Encoder::Base32,
            fragment_size: DEFAULT_FRAGMENT_SIZE,
            lazy_mode: false,
            multi_query: false,
        }
    }
}

struct User {
    id: u16,
    /// Nonce of the `Version` request that created the session
    version_nonce: u32,
    params: StdMutex<UserParams>,
    stream: PacketStream,
    last_seen: StdMutex<Instant>,
    // set by the first request naming the session; a repeated Version can
    // only reclaim the user before that
    established: AtomicBool,
    accepted: AtomicBool,
    closed: AtomicBool,
}

impl User {
    fn new(id: u16, version_nonce: u32) -> Self {
        Self {
            id,
            version_nonce,
            params: StdMutex::new(UserParams::default()),
            stream: PacketStream::new(DEFAULT_FRAGMENT_SIZE - PACKET_RESPONSE_HEADER),
            last_seen: StdMutex::new(Instant::now()),
            established: AtomicBool::new(false),
            accepted: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    fn params(&self) -> UserParams {
        *lock(&self.params)
    }

    fn touch(&self) {
        *lock(&self.last_seen) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        lock(&self.last_seen).elapsed()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.stream.shutdown().await;
    }
}

fn lock<T>(m: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct Users {
    by_id: HashMap<u16, Arc<User>>,
    next_id: u16,
}

/// DNS tunnel server
pub struct DnsServer {
    options: ServerOptions,
    users: Mutex<Users>,
    accept_tx: mpsc::Sender<ServerConn>,
    accept_rx: Mutex<mpsc::Receiver<ServerConn>>,
}

impl DnsServer {
    pub fn new(mut options: ServerOptions) -> Self {
        options.domain = normalize_domain(&options.domain);
        let (accept_tx, accept_rx) = mpsc::channel(options.max_users.max(1));
        Self {
            options,
            users: Mutex::new(Users::default()),
            accept_tx,
            accept_rx: Mutex::new(accept_rx),
        }
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    /// Wait for the next session to start carrying data
    pub async fn accept(&self) -> Option<ServerConn> {
        self.accept_rx.lock().await.recv().await
    }

    /// Number of live sessions
    pub async fn user_count(&self) -> usize {
        self.users.lock().await.by_id.len()
    }

    /// Drop sessions that closed or went quiet; returns how many were removed
    pub async fn reap_idle(&self) -> usize {
        let idle_timeout = self.options.idle_timeout;
        let stale: Vec<Arc<User>> = {
            let mut users = self.users.lock().await;
            let ids: Vec<u16> = users
                .by_id
                .values()
                .filter(|u| u.is_closed() || u.idle_for() >= idle_timeout)
                .map(|u| u.id)
                .collect();
            ids.iter().filter_map(|id| users.by_id.remove(id)).collect()
        };
        for user in &stale {
            debug!("Reaping user {}", user.id);
            user.close().await;
        }
        stale.len()
    }

    /// Answer one query
    ///
    /// Every question is executed, but downstream data only rides in the
    /// answer to the last one; earlier packet questions are acknowledged
    /// without a payload so the response fits the negotiated fragment size.
    pub async fn handle(&self, query: &Message) -> Message {
        let mut response = response_to(query);
        response.set_authoritative(true);

        if query.message_type() == MessageType::Response || query.queries().is_empty() {
            response.set_response_code(ResponseCode::FormErr);
            return response;
        }

        let last = query.queries().len() - 1;
        for (i, question) in query.queries().iter().enumerate() {
            match self.answer(question, i == last).await {
                Ok(records) => {
                    for data in records {
                        response.add_answer(Record::from_rdata(question.name().clone(), 0, data));
                    }
                }
                Err(code) => {
                    response.take_answers();
                    response.set_response_code(code);
                    return response;
                }
            }
        }
        response
    }

    /// Answer records for one question, or the rcode to fail the query with
    async fn answer(
        &self,
        question: &Query,
        attach: bool,
    ) -> std::result::Result<Vec<RData>, ResponseCode> {
        let name = name_bytes(question.name());
        let text = strip_domain(&name, &self.options.domain).ok_or_else(|| {
            debug!("Refusing {}", String::from_utf8_lossy(&name));
            ResponseCode::Refused
        })?;
        let qtype = QueryType::from_record_type(question.query_type()).ok_or(ResponseCode::NotImp)?;

        let (response, downstream) = self.dispatch(&undotify(text), qtype, attach).await;
        records::wrap(qtype, &self.options.domain, &response.to_bytes(downstream)).map_err(|e| {
            warn!("Cannot answer {:?} with {} records: {}", response.command(), qtype, e);
            ResponseCode::ServFail
        })
    }

    /// Decode and execute one request; returns the response and the encoder
    /// its payload should use. `attach` allows a packet response to carry
    /// downstream data.
    async fn dispatch(&self, text: &[u8], qtype: QueryType, attach: bool) -> (Response, Encoder) {
        let (command, user_id, payload) = match split_request(text) {
            Ok(parts) => parts,
            Err(e) => {
                debug!("Unparseable request: {}", e);
                return (Response::Error(wire_error(&e)), Encoder::Base32);
            }
        };

        let user = match user_id {
            Some(id) => match self.user(id).await {
                Some(user) if !user.is_closed() => {
                    user.touch();
                    user.established.store(true, Ordering::SeqCst);
                    Some(user)
                }
                _ => {
                    debug!("Request for unknown or closed user {}", id);
                    return (Response::Error(WireError::BadConnection), Encoder::Base32);
                }
            },
            None => None,
        };
        let params = user.as_ref().map(|u| u.params()).unwrap_or_default();

        let request = match Request::decode(command, payload, params.upstream) {
            Ok(request) => request,
            Err(e) => {
                debug!("Bad {:?} request: {}", command, e);
                return (Response::Error(wire_error(&e)), params.downstream);
            }
        };

        let response = match self.execute(request, user.as_deref(), qtype, attach).await {
            Ok(response) => response,
            Err(err) => Response::Error(err),
        };
        (response, params.downstream)
    }

    async fn execute(
        &self,
        request: Request,
        user: Option<&User>,
        qtype: QueryType,
        attach: bool,
    ) -> std::result::Result<Response, WireError> {
        let user = match (request.command().requires_user(), user) {
            (true, None) => return Err(WireError::BadUser),
            (_, user) => user,
        };

        match request {
            Request::Version {
                client_version,
                nonce,
            } => {
                if client_version != PROTOCOL_VERSION {
                    info!("Rejecting client version {:#010x}", client_version);
                    return Err(WireError::BadVersion);
                }
                let user_id = self.allocate_user(nonce).await?;
                Ok(Response::Version {
                    server_version: PROTOCOL_VERSION,
                    user_id,
                })
            }
            Request::Login { .. } => Ok(Response::Login),
            Request::Ping { .. } => Ok(Response::Ping),
            Request::TestFragmentSize { size, .. } => {
                let size = size as usize;
                if size == 0 || size > MAX_FRAGMENT_SIZE {
                    return Err(WireError::BadFragment);
                }
                Ok(Response::TestFragmentSize {
                    honored: size as u32,
                    pattern: fragment_pattern(size),
                })
            }
            Request::SetOptions(options) => {
                let user = user.ok_or(WireError::BadUser)?;
                self.apply_options(user, options, qtype).await?;
                Ok(Response::SetOptions)
            }
            Request::TestUpstreamEncoder { pattern } => Ok(Response::TestUpstreamEncoder { pattern }),
            Request::TestDownstreamEncoder { encoder } => {
                if encoder == Encoder::Raw && !qtype.carries_raw() {
                    return Err(WireError::BadCodec);
                }
                Ok(Response::TestDownstreamEncoder {
                    encoder,
                    canary: DOWNSTREAM_CANARY.to_vec(),
                })
            }
            Request::Packet {
                last_acked, packet, ..
            } => {
                let user = user.ok_or(WireError::BadUser)?;
                self.exchange_packet(user, last_acked, packet, attach).await
            }
            Request::TestMultiQuery { index, .. } => Ok(Response::TestMultiQuery { index }),
        }
    }

    async fn user(&self, id: u16) -> Option<Arc<User>> {
        self.users.lock().await.by_id.get(&id).cloned()
    }

    async fn allocate_user(&self, nonce: u32) -> std::result::Result<u16, WireError> {
        {
            let users = self.users.lock().await;
            let retried = users.by_id.values().find(|u| {
                u.version_nonce == nonce && !u.established.load(Ordering::SeqCst) && !u.is_closed()
            });
            if let Some(user) = retried {
                debug!("Repeated Version; reusing user {}", user.id);
                user.touch();
                return Ok(user.id);
            }
        }

        if self.user_count().await >= self.options.max_users {
            self.reap_idle().await;
        }
        let mut users = self.users.lock().await;
        if users.by_id.len() >= self.options.max_users {
            warn!("Rejecting new session: {} users connected", users.by_id.len());
            return Err(WireError::ServerFull);
        }
        let mut id = users.next_id;
        while users.by_id.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        users.next_id = id.wrapping_add(1);
        users.by_id.insert(id, Arc::new(User::new(id, nonce)));
        info!("New session for user {}", id);
        Ok(id)
    }

    async fn apply_options(
        &self,
        user: &User,
        options: SessionOptions,
        qtype: QueryType,
    ) -> std::result::Result<(), WireError> {
        if let Some(encoder) = options.upstream_encoder {
            if !encoder.hostname_safe() {
                return Err(WireError::BadCodec);
            }
        }
        if options.downstream_encoder == Some(Encoder::Raw) && !qtype.carries_raw() {
            return Err(WireError::BadCodec);
        }
        if let Some(size) = options.fragment_size {
            let size = size as usize;
            if !(MIN_FRAGMENT_SIZE..=MAX_FRAGMENT_SIZE).contains(&size) {
                return Err(WireError::BadFragment);
            }
        }

        {
            let mut params = lock(&user.params);
            if let Some(encoder) = options.upstream_encoder {
                params.upstream = encoder;
            }
            if let Some(encoder) = options.downstream_encoder {
                params.downstream = encoder;
            }
            if let Some(size) = options.fragment_size {
                params.fragment_size = size as usize;
                user.stream.set_mtu(size as usize - PACKET_RESPONSE_HEADER);
            }
            if let Some(lazy) = options.lazy_mode {
                params.lazy_mode = lazy;
            }
            if let Some(multi) = options.multi_query {
                params.multi_query = multi;
            }
            debug!("User {} options now {:?}", user.id, *params);
        }

        if options.closed == Some(true) {
            info!("User {} closed the session", user.id);
            user.close().await;
            self.users.lock().await.by_id.remove(&user.id);
        }
        Ok(())
    }

    async fn exchange_packet(
        &self,
        user: &User,
        last_acked: Option<u16>,
        packet: Option<crate::queue::Packet>,
        attach: bool,
    ) -> std::result::Result<Response, WireError> {
        if let Some(seq) = last_acked {
            user.stream.outbound.update_acked(seq).await;
        }
        let carried_data = packet.is_some();
        if let Err(e) = user.stream.inbound.append(packet).await {
            // the streams are out of step; nothing sent later can be placed
            warn!("User {}: {}; dropping session", user.id, e);
            user.close().await;
            self.users.lock().await.by_id.remove(&user.id);
            return Err(WireError::BadSequence);
        }

        if !user.accepted.swap(true, Ordering::SeqCst) {
            if let Some(user) = self.user(user.id).await {
                if self.accept_tx.try_send(ServerConn { user }).is_err() {
                    warn!("Accept backlog full; session dropped");
                }
            }
        }

        if !attach {
            return Ok(Response::Packet {
                last_acked: user.stream.inbound.last_acked().await,
                packet: None,
            });
        }

        if user.params().lazy_mode && !carried_data && user.stream.outbound.is_empty().await {
            // hold the poll until there is something to send back
            let _ = timeout(self.options.lazy_hold, user.stream.outbound.chunk_ready()).await;
        }

        Ok(Response::Packet {
            last_acked: user.stream.inbound.last_acked().await,
            packet: user.stream.outbound.next_chunk().await,
        })
    }

    /// Answer queries arriving on `socket` until it fails
    pub async fn serve_udp(self: Arc<Self>, socket: UdpSocket) -> Result<()> {
        let socket = Arc::new(socket);
        info!(
            "Serving {} on {}",
            self.options.domain,
            socket.local_addr()?
        );

        let reap_every = (self.options.idle_timeout / 2).max(Duration::from_secs(1));
        let mut reaper = tokio::time::interval(reap_every);
        let mut buf = vec![0u8; 65535];

        loop {
            tokio::select! {
                _ = reaper.tick() => {
                    let reaped = self.reap_idle().await;
                    if reaped > 0 {
                        info!("Reaped {} idle sessions", reaped);
                    }
                }
                received = socket.recv_from(&mut buf) => {
                    let (n, peer) = received?;
                    let query = match dns::decode(&buf[..n]) {
                        Ok(query) => query,
                        Err(e) => {
                            debug!("Ignoring datagram from {}: {}", peer, e);
                            continue;
                        }
                    };
                    let server = self.clone();
                    let socket = socket.clone();
                    tokio::spawn(async move {
                        server.reply(&socket, &query, peer).await;
                    });
                }
            }
        }
    }

    async fn reply(&self, socket: &UdpSocket, query: &Message, peer: SocketAddr) {
        let response = self.handle(query).await;
        match encode_within(&response, udp_limit(query)) {
            Ok(bytes) => {
                if let Err(e) = socket.send_to(&bytes, peer).await {
                    warn!("Failed to answer {}: {}", peer, e);
                }
            }
            Err(e) => warn!("Failed to encode answer for {}: {}", peer, e),
        }
    }
}

fn wire_error(err: &TunnelError) -> WireError {
    match err {
        TunnelError::UnknownEncoder(_) => WireError::BadCodec,
        TunnelError::Decode(DecodeError::Truncated { .. }) => WireError::BadLength,
        _ => WireError::BadCommand,
    }
}

/// Server end of one tunnel session
pub struct ServerConn {
    user: Arc<User>,
}

impl ServerConn {
    pub fn user_id(&self) -> u16 {
        self.user.id
    }
}

#[async_trait]
impl TunnelStream for ServerConn {
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.user.stream.read(buf).await
    }

    async fn write(&self, data: &[u8]) -> Result<usize> {
        if self.user.is_closed() {
            return Err(TunnelError::Closed);
        }
        self.user.stream.write(data).await
    }

    async fn close(&self) -> Result<()> {
        if !self.user.is_closed() {
            info!("Closing session of user {}", self.user.id);
            self.user.close().await;
        }
        Ok(())
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.user.stream.set_read_deadline(deadline);
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.user.stream.set_write_deadline(deadline);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::{build_query, to_name, RecordType};
    use crate::queue::Packet;
    use crate::session::Serializer;

    const DOMAIN: &str = "t.example.org";

    fn server(max_users: usize) -> DnsServer {
        DnsServer::new(ServerOptions {
            domain: DOMAIN.into(),
            max_users,
            ..Default::default()
        })
    }

    async fn call(server: &DnsServer, serializer: &Serializer, request: Request) -> Result<Response> {
        let query = serializer.build_query(std::slice::from_ref(&request))?;
        let response = server.handle(&query).await;
        serializer.parse_response(&request, &query.queries()[0], &response)
    }

    async fn login(server: &DnsServer) -> Serializer {
        let mut serializer = Serializer::new(DOMAIN);
        serializer.upstream.query_type = Some(QueryType::Txt);
        let version = Request::Version {
            client_version: PROTOCOL_VERSION,
            nonce: rand::random(),
        };
        match call(server, &serializer, version).await.unwrap() {
            Response::Version { user_id, .. } => serializer.user_id = Some(user_id),
            other => panic!("unexpected {:?}", other),
        }
        serializer
    }

    #[tokio::test]
    async fn test_foreign_domain_is_refused() {
        let server = server(4);
        let query = build_query(1, vec![to_name(b"vabc.example.com").unwrap()], RecordType::TXT);
        assert_eq!(server.handle(&query).await.response_code(), ResponseCode::Refused);
    }

    #[tokio::test]
    async fn test_version_mismatch_and_full_server() {
        let server = server(1);
        let serializer = Serializer::new(DOMAIN);
        let old = Request::Version {
            client_version: 1,
            nonce: 1,
        };
        let err = call(&server, &serializer, old).await.unwrap_err();
        assert!(matches!(err, TunnelError::Remote(WireError::BadVersion)));

        login(&server).await;
        let another = Request::Version {
            client_version: PROTOCOL_VERSION,
            nonce: 2,
        };
        let err = call(&server, &serializer, another).await.unwrap_err();
        assert!(matches!(err, TunnelError::Remote(WireError::ServerFull)));
    }

    #[tokio::test]
    async fn test_unknown_user_gets_badconn() {
        let server = server(4);
        let mut serializer = Serializer::new(DOMAIN);
        serializer.user_id = Some(99);
        let err = call(&server, &serializer, Request::ping()).await.unwrap_err();
        assert!(err.is_bad_connection());
    }

    #[tokio::test]
    async fn test_options_are_validated() {
        let server = server(4);
        let serializer = login(&server).await;

        let raw_over_txt = SessionOptions {
            downstream_encoder: Some(Encoder::Raw),
            ..Default::default()
        };
        assert!(matches!(
            call(&server, &serializer, Request::SetOptions(raw_over_txt)).await,
            Err(TunnelError::Remote(WireError::BadCodec))
        ));

        let tiny = SessionOptions {
            fragment_size: Some(10),
            ..Default::default()
        };
        assert!(matches!(
            call(&server, &serializer, Request::SetOptions(tiny)).await,
            Err(TunnelError::Remote(WireError::BadFragment))
        ));
    }

    #[tokio::test]
    async fn test_packets_reach_the_accepted_stream() {
        let server = server(4);
        let serializer = login(&server).await;

        let request = Request::Packet {
            nonce: 1,
            last_acked: None,
            packet: Some(Packet {
                seq: 0,
                data: b"hello".to_vec(),
            }),
        };
        match call(&server, &serializer, request).await.unwrap() {
            Response::Packet { last_acked, packet } => {
                assert_eq!(last_acked, Some(0));
                assert!(packet.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }

        let conn = server.accept().await.unwrap();
        assert_eq!(Some(conn.user_id()), serializer.user_id);
        let mut buf = [0u8; 16];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn test_closed_session_is_removed() {
        let server = server(4);
        let serializer = login(&server).await;
        let closed = SessionOptions {
            closed: Some(true),
            ..Default::default()
        };
        call(&server, &serializer, Request::SetOptions(closed)).await.unwrap();
        assert_eq!(server.user_count().await, 0);

        let err = call(&server, &serializer, Request::ping()).await.unwrap_err();
        assert!(err.is_bad_connection());
    }

    #[tokio::test]
    async fn test_idle_sessions_are_reaped() {
        let server = DnsServer::new(ServerOptions {
            domain: DOMAIN.into(),
            idle_timeout: Duration::from_millis(10),
            ..Default::default()
        });
        login(&server).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(server.reap_idle().await, 1);
        assert_eq!(server.user_count().await, 0);
    }

    #[tokio::test]
    async fn test_repeated_version_reuses_the_user() {
        let server = server(4);
        let mut serializer = Serializer::new(DOMAIN);
        let version = Request::Version {
            client_version: PROTOCOL_VERSION,
            nonce: 77,
        };

        let first = call(&server, &serializer, version.clone()).await.unwrap();
        let again = call(&server, &serializer, version.clone()).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(server.user_count().await, 1);

        // once the session is in use the nonce no longer matches it
        let Response::Version { user_id, .. } = first else {
            panic!("expected a version reply");
        };
        serializer.user_id = Some(user_id);
        call(&server, &serializer, Request::ping()).await.unwrap();
        let fresh = call(&server, &serializer, version).await.unwrap();
        assert_ne!(fresh, again);
        assert_eq!(server.user_count().await, 2);
    }

    #[tokio::test]
    async fn test_out_of_window_packet_drops_the_session() {
        let server = server(4);
        let serializer = login(&server).await;

        let stray = Request::Packet {
            nonce: 3,
            last_acked: None,
            packet: Some(Packet {
                seq: 200,
                data: b"late".to_vec(),
            }),
        };
        let err = call(&server, &serializer, stray).await.unwrap_err();
        assert!(matches!(err, TunnelError::Remote(WireError::BadSequence)));
        assert!(err.is_fatal());
        assert_eq!(server.user_count().await, 0);

        let err = call(&server, &serializer, Request::ping()).await.unwrap_err();
        assert!(err.is_bad_connection());
    }

    #[tokio::test]
    async fn test_lazy_poll_is_released_by_a_write() {
        let server = DnsServer::new(ServerOptions {
            domain: DOMAIN.into(),
            lazy_hold: Duration::from_secs(5),
            ..Default::default()
        });
        let serializer = login(&server).await;
        let lazy = SessionOptions {
            lazy_mode: Some(true),
            ..Default::default()
        };
        call(&server, &serializer, Request::SetOptions(lazy)).await.unwrap();

        let first = Request::Packet {
            nonce: 1,
            last_acked: None,
            packet: Some(Packet {
                seq: 0,
                data: b"up".to_vec(),
            }),
        };
        call(&server, &serializer, first).await.unwrap();
        let conn = server.accept().await.unwrap();

        let poll = Request::Packet {
            nonce: 2,
            last_acked: None,
            packet: None,
        };
        let started = Instant::now();
        let (polled, _) = tokio::join!(call(&server, &serializer, poll), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            conn.write(b"down").await.unwrap();
        });
        match polled.unwrap() {
            Response::Packet { packet, .. } => assert_eq!(packet.unwrap().data, b"down"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_only_the_last_question_carries_data() {
        let server = server(4);
        let serializer = login(&server).await;

        let first = Request::Packet {
            nonce: 1,
            last_acked: None,
            packet: Some(Packet {
                seq: 0,
                data: b"up".to_vec(),
            }),
        };
        call(&server, &serializer, first).await.unwrap();
        let conn = server.accept().await.unwrap();
        conn.write(b"down").await.unwrap();

        let polls: Vec<Request> = (10..12)
            .map(|nonce| Request::Packet {
                nonce,
                last_acked: None,
                packet: None,
            })
            .collect();
        let query = serializer.build_query(&polls).unwrap();
        let response = server.handle(&query).await;

        let answers: Vec<Response> = polls
            .iter()
            .zip(query.queries())
            .map(|(request, question)| serializer.parse_response(request, question, &response).unwrap())
            .collect();
        assert!(matches!(&answers[0], Response::Packet { packet: None, .. }));
        match &answers[1] {
            Response::Packet {
                packet: Some(packet), ..
            } => assert_eq!(packet.data, b"down"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
