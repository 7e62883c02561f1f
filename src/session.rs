//! Negotiated session parameters and the serialized round-trip channel
//!
//! [`Serializer`] is filled in by the handshake and read-only afterwards. It
//! turns requests into DNS queries and answer records back into responses.
//! [`Channel`] pushes those queries through the injected transport, one at a
//! time.

use log::debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::command::{Request, Response, PACKET_REQUEST_HEADER, PACKET_RESPONSE_HEADER, REQUEST_PREFIX_LEN};
use crate::dns::name::{available_for, build_hostname, max_text_len};
use crate::dns::{self, set_edns0, to_name, Message, Query, ResponseCode, EDNS0_PAYLOAD_SIZE};
use crate::encoding::Encoder;
use crate::error::{Result, TunnelError};
use crate::records::{self, QueryType};
use crate::transport::DnsTransport;

/// Smallest downstream fragment that still carries useful data
pub const MIN_FRAGMENT_SIZE: usize = 82;

/// Largest downstream fragment the search will try
pub const MAX_FRAGMENT_SIZE: usize = 8192;

/// Fragment size used until one has been negotiated
pub const DEFAULT_FRAGMENT_SIZE: usize = 200;

/// Questions per query once multi-query is on
pub const MULTI_QUERY_BATCH: usize = 2;

/// Client-to-server direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Upstream {
    pub encoder: Option<Encoder>,
    pub query_type: Option<QueryType>,
    /// Raw bytes per `Packet` request
    pub fragment_size: usize,
}

/// Server-to-client direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Downstream {
    pub encoder: Option<Encoder>,
    /// Raw bytes per response payload
    pub fragment_size: usize,
}

impl Default for Downstream {
    fn default() -> Self {
        Self {
            encoder: None,
            fragment_size: DEFAULT_FRAGMENT_SIZE,
        }
    }
}

/// Negotiated parameters plus the request/response codec built on them
#[derive(Debug, Clone)]
pub struct Serializer {
    pub domain: String,
    pub upstream: Upstream,
    pub downstream: Downstream,
    pub use_edns0: bool,
    pub use_multi_query: bool,
    pub use_lazy_mode: bool,
    pub user_id: Option<u16>,
}

impl Serializer {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            upstream: Upstream::default(),
            downstream: Downstream::default(),
            use_edns0: false,
            use_multi_query: false,
            use_lazy_mode: false,
            user_id: None,
        }
    }

    pub fn upstream_encoder(&self) -> Encoder {
        self.upstream.encoder.unwrap_or(Encoder::Base32)
    }

    pub fn downstream_encoder(&self) -> Encoder {
        self.downstream.encoder.unwrap_or(Encoder::Base32)
    }

    pub fn query_type(&self) -> QueryType {
        self.upstream.query_type.unwrap_or(QueryType::Txt)
    }

    /// Raw data bytes that fit in one `Packet` request name
    pub fn upstream_capacity(&self) -> usize {
        let text = max_text_len(available_for(&self.domain)).saturating_sub(REQUEST_PREFIX_LEN);
        self.upstream_encoder()
            .max_raw_len(text)
            .saturating_sub(PACKET_REQUEST_HEADER)
    }

    /// Raw data bytes per downstream `Packet` response
    pub fn downstream_mtu(&self) -> usize {
        self.downstream
            .fragment_size
            .saturating_sub(PACKET_RESPONSE_HEADER)
    }

    /// Query name carrying `request`
    pub fn request_name(&self, request: &Request) -> Result<Vec<u8>> {
        let text = request.to_text(self.user_id, self.upstream_encoder())?;
        build_hostname(&text, &self.domain)
    }

    /// Build one query message carrying every request as its own question
    pub fn build_query(&self, requests: &[Request]) -> Result<Message> {
        let names = requests
            .iter()
            .map(|r| to_name(&self.request_name(r)?))
            .collect::<Result<Vec<_>>>()?;

        let mut query = dns::build_query(rand::random(), names, self.query_type().record_type());
        if self.use_edns0 {
            set_edns0(&mut query, EDNS0_PAYLOAD_SIZE);
        }
        Ok(query)
    }

    /// Decode the answer to `request`, asked as `question`, from `response`
    pub fn parse_response(&self, request: &Request, question: &Query, response: &Message) -> Result<Response> {
        if response.truncated() {
            return Err(TunnelError::Truncated);
        }
        match response.response_code() {
            ResponseCode::NoError => {}
            other => return Err(TunnelError::Rcode(other.low())),
        }

        // names compare case-insensitively
        let answers = response
            .answers()
            .iter()
            .filter(|a| response.queries().len() < 2 || a.name() == question.name())
            .filter_map(|a| a.data());
        let payload = records::unwrap(&self.domain, answers)?;
        Response::decode(request, &payload, self.downstream_encoder())
    }
}

/// Serialized access to the transport: exactly one round trip in flight
#[derive(Clone)]
pub struct Channel {
    transport: Arc<dyn DnsTransport>,
    call_lock: Arc<Mutex<()>>,
}

impl Channel {
    pub fn new(transport: Arc<dyn DnsTransport>) -> Self {
        Self {
            transport,
            call_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn transport(&self) -> &Arc<dyn DnsTransport> {
        &self.transport
    }

    /// Send `requests` in one query and decode one response per request
    pub async fn exchange(
        &self,
        serializer: &Serializer,
        requests: &[Request],
        timeout: Duration,
    ) -> Result<Vec<Response>> {
        let query = serializer.build_query(requests)?;
        let (response, rtt) = {
            let _call = self.call_lock.lock().await;
            self.transport.send_and_receive(&query, timeout).await?
        };
        debug!(
            "{} round trip {:?} with {} answers",
            requests
                .first()
                .map(|r| r.command().code() as char)
                .unwrap_or('-'),
            rtt,
            response.answers().len()
        );

        requests
            .iter()
            .zip(query.queries())
            .map(|(request, question)| serializer.parse_response(request, question, &response))
            .collect()
    }

    /// Send a single request
    pub async fn call(&self, serializer: &Serializer, request: Request, timeout: Duration) -> Result<Response> {
        self.exchange(serializer, std::slice::from_ref(&request), timeout)
            .await?
            .pop()
            .ok_or(TunnelError::NoAnswer)
    }

    pub async fn close(&self) -> Result<()> {
        self.transport.close().await
    }
}
