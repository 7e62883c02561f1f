//! In-memory resolver path between a client and a `DnsServer`

#![allow(dead_code)]

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use socketace::command::split_request;
use socketace::dns::name::{build_hostname, strip_domain, undotify};
use socketace::dns::{
    decode, encode, encode_within, name_bytes, to_name, Message, Name, Query, RData, Record, RecordType, TXT,
};
use socketace::{DnsServer, DnsTransport, Encoder, Request, Result, ServerOptions, TunnelError};

pub const DOMAIN: &str = "t.example.org";

/// Sequence shift applied by [`Resolver::desync_next_packet`]; well past the
/// receive window
pub const SEQ_SHIFT: u16 = 200;

/// Behaviour of the simulated resolver path
#[derive(Debug, Clone)]
pub struct PathProfile {
    /// Lower-case every query name before it reaches the server
    pub fold_case: bool,
    /// Query types the path silently drops
    pub blocked: Vec<RecordType>,
    /// Largest response delivered intact; larger ones arrive truncated
    pub udp_limit: usize,
    /// TXT answers longer than this have every non-alphanumeric octet replaced
    pub mangle_txt_over: Option<usize>,
    /// The server handles the first query with this command code, but its
    /// reply never comes back
    pub lose_first_reply: Option<u8>,
}

impl Default for PathProfile {
    fn default() -> Self {
        Self {
            fold_case: false,
            blocked: Vec::new(),
            udp_limit: socketace::dns::MAX_UDP_SIZE,
            mangle_txt_over: None,
            lose_first_reply: None,
        }
    }
}

/// A `DnsTransport` that pushes every query through wire bytes into a server
pub struct Resolver {
    server: Arc<DnsServer>,
    profile: PathProfile,
    queries: Mutex<Vec<u8>>,
    lost: AtomicBool,
    multi_packet_queries: AtomicUsize,
    desync_armed: AtomicBool,
    rewritten: AtomicUsize,
    closed: AtomicBool,
}

impl Resolver {
    pub fn new(server: Arc<DnsServer>, profile: PathProfile) -> Arc<Self> {
        Arc::new(Self {
            server,
            profile,
            queries: Mutex::new(Vec::new()),
            lost: AtomicBool::new(false),
            multi_packet_queries: AtomicUsize::new(0),
            desync_armed: AtomicBool::new(false),
            rewritten: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Command code of every query that reached the path, in order
    pub fn commands(&self) -> Vec<u8> {
        self.queries.lock().unwrap().clone()
    }

    pub fn query_count(&self) -> usize {
        self.queries.lock().unwrap().len()
    }

    /// Queries that carried more than one `Packet` question
    pub fn multi_packet_queries(&self) -> usize {
        self.multi_packet_queries.load(Ordering::SeqCst)
    }

    /// Push the sequence number of the next data-carrying packet out of the
    /// server's window. Expects a base32 upstream.
    pub fn desync_next_packet(&self) {
        self.desync_armed.store(true, Ordering::SeqCst);
    }

    /// Packets whose sequence number was shifted
    pub fn rewritten(&self) -> usize {
        self.rewritten.load(Ordering::SeqCst)
    }

    fn rewrite_questions(&self, query: &mut Message) {
        let fold = self.profile.fold_case;
        let armed = self.desync_armed.load(Ordering::SeqCst);
        if !fold && !armed {
            return;
        }

        let questions = query.take_queries();
        for question in questions {
            let mut name = question.name().clone();
            if armed && self.desync_armed.load(Ordering::SeqCst) {
                if let Some(shifted) = shift_packet_seq(&name) {
                    self.desync_armed.store(false, Ordering::SeqCst);
                    self.rewritten.fetch_add(1, Ordering::SeqCst);
                    name = shifted;
                }
            }
            if fold {
                name = name.to_lowercase();
            }
            query.add_query(Query::query(name, question.query_type()));
        }
    }

    fn mangle(&self, response: &mut Message) {
        let Some(limit) = self.profile.mangle_txt_over else {
            return;
        };
        for answer in response.take_answers() {
            let strings: Option<Vec<Vec<u8>>> = match answer.data() {
                Some(RData::TXT(txt)) if txt.txt_data().iter().map(|s| s.len()).sum::<usize>() > limit => Some(
                    txt.txt_data()
                        .iter()
                        .map(|s| {
                            s.iter()
                                .map(|&b| if b.is_ascii_alphanumeric() { b } else { b'.' })
                                .collect()
                        })
                        .collect(),
                ),
                _ => None,
            };
            let answer = match strings {
                Some(strings) => {
                    let refs: Vec<&[u8]> = strings.iter().map(Vec::as_slice).collect();
                    Record::from_rdata(answer.name().clone(), answer.ttl(), RData::TXT(TXT::from_bytes(refs)))
                }
                None => answer,
            };
            response.add_answer(answer);
        }
    }
}

/// `name` with its Packet sequence number moved [`SEQ_SHIFT`] ahead, if it
/// carries a data packet
fn shift_packet_seq(name: &Name) -> Option<Name> {
    let bytes = name_bytes(name);
    let text = undotify(strip_domain(&bytes, DOMAIN)?);
    let (command, user_id, payload) = split_request(&text).ok()?;
    let Request::Packet {
        nonce,
        last_acked,
        packet: Some(mut packet),
    } = Request::decode(command, payload, Encoder::Base32).ok()?
    else {
        return None;
    };
    packet.seq = packet.seq.wrapping_add(SEQ_SHIFT);
    let shifted = Request::Packet {
        nonce,
        last_acked,
        packet: Some(packet),
    };
    let text = shifted.to_text(user_id, Encoder::Base32).ok()?;
    to_name(&build_hostname(&text, DOMAIN).ok()?).ok()
}

pub fn server(options: ServerOptions) -> Arc<DnsServer> {
    Arc::new(DnsServer::new(ServerOptions {
        domain: DOMAIN.into(),
        ..options
    }))
}

#[async_trait]
impl DnsTransport for Resolver {
    async fn send_and_receive(&self, query: &Message, timeout: Duration) -> Result<(Message, Duration)> {
        if self.is_closed() {
            return Err(TunnelError::Closed);
        }
        let mut query = decode(&encode(query)?)?;
        let first_code = query
            .queries()
            .first()
            .and_then(|q| name_bytes(q.name()).first().copied())
            .map(|c| c.to_ascii_lowercase());
        if let Some(code) = first_code {
            self.queries.lock().unwrap().push(code);
            if code == b'k' && query.queries().len() > 1 {
                self.multi_packet_queries.fetch_add(1, Ordering::SeqCst);
            }
        }

        if query
            .queries()
            .iter()
            .any(|q| self.profile.blocked.contains(&q.query_type()))
        {
            return Err(TunnelError::Timeout(timeout));
        }
        self.rewrite_questions(&mut query);

        let mut response = tokio::time::timeout(timeout, self.server.handle(&query))
            .await
            .map_err(|_| TunnelError::Timeout(timeout))?;
        if first_code.is_some()
            && first_code == self.profile.lose_first_reply
            && !self.lost.swap(true, Ordering::SeqCst)
        {
            return Err(TunnelError::Timeout(timeout));
        }
        self.mangle(&mut response);

        let wire = encode_within(&response, self.profile.udp_limit)?;
        Ok((decode(&wire)?, Duration::ZERO))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    // answers are immediate; only the per-call timeout applies
    fn set_read_deadline(&self, _deadline: Option<Instant>) {}

    fn set_write_deadline(&self, _deadline: Option<Instant>) {}
}
