//! Handshake and path autodetection
//!
//! Runs the negotiation steps in a fixed order against an unknown resolver
//! path and returns the resulting [`Serializer`]:
//!
//! 1. query type, 2. version, 3. EDNS0, 4/5. upstream encoder,
//! 6/7. downstream encoder, 8. lazy mode, 8b. multi-query,
//! 9/10. downstream fragment size.
//!
//! Operator overrides pin a value and skip its detection step. Steps whose
//! failure is not fatal fall back to the safest known value.

use log::{debug, info, warn};
use std::future::Future;
use std::time::Duration;

use crate::command::{
    fragment_pattern, Request, Response, SessionOptions, DOWNSTREAM_CANARY, PROTOCOL_VERSION,
};
use crate::dns::MAX_NAME_LEN;
use crate::encoding::Encoder;
use crate::error::{Result, TunnelError};
use crate::records::QueryType;
use crate::session::{
    Channel, Serializer, DEFAULT_FRAGMENT_SIZE, MAX_FRAGMENT_SIZE, MIN_FRAGMENT_SIZE, MULTI_QUERY_BATCH,
};

/// Attempts per test before giving up on it
pub const MAX_ATTEMPTS: u32 = 5;

/// Full passes over the query types
const QUERY_TYPE_PASSES: u32 = 3;

/// Upstream candidates, most efficient first
const UPSTREAM_CANDIDATES: [Encoder; 5] = [
    Encoder::Base128,
    Encoder::Base91,
    Encoder::Base85,
    Encoder::Base64,
    Encoder::Base64Alt,
];

/// Downstream candidates, least efficient first
const DOWNSTREAM_CANDIDATES: [Encoder; 5] = [
    Encoder::Base64,
    Encoder::Base64Alt,
    Encoder::Base85,
    Encoder::Base91,
    Encoder::Base128,
];

/// First fragment size tried by the search
const FRAGMENT_SEARCH_START: usize = 768;

/// Confirmed size below which the search keeps narrowing to single bytes
const FRAGMENT_SEARCH_FLOOR: usize = 300;

/// Raw size of the EDNS0 test, large enough that its answer overflows a
/// classic 512-octet message with any record type
const EDNS_TEST_SIZE: u32 = 600;

/// Wire octets a question adds beyond its name: length prefix, root, type
/// and class
const QUESTION_OVERHEAD: usize = 6;

/// Answer record plus acknowledgement for each question that carries no data
const ACK_ANSWER_SIZE: usize = 32;

/// Time allowed for releasing the user after a failed handshake
const RELEASE_TIMEOUT: Duration = Duration::from_secs(1);

/// Values pinned by the operator; each one skips its detection step
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    pub query_type: Option<QueryType>,
    pub upstream_encoder: Option<Encoder>,
    pub downstream_encoder: Option<Encoder>,
    pub fragment_size: Option<usize>,
    /// Ask for lazy-mode polling
    pub lazy_mode: bool,
    /// Try to send several questions per query
    pub multi_query: bool,
}

/// Run every negotiation step and return the session parameters
pub async fn run(channel: &Channel, domain: &str, overrides: &Overrides) -> Result<Serializer> {
    let mut handshake = Handshake {
        channel,
        overrides,
        serializer: Serializer::new(domain),
    };

    handshake.detect_query_type().await?;
    handshake.version().await?;
    if let Err(e) = handshake.negotiate().await {
        handshake.release().await;
        return Err(e);
    }

    let serializer = handshake.serializer;
    info!(
        "Handshake complete: user {:?}, {} queries, upstream {} ({} bytes), downstream {} ({} bytes), edns0 {}, lazy {}, multi {}",
        serializer.user_id,
        serializer.query_type(),
        serializer.upstream_encoder(),
        serializer.upstream.fragment_size,
        serializer.downstream_encoder(),
        serializer.downstream.fragment_size,
        serializer.use_edns0,
        serializer.use_lazy_mode,
        serializer.use_multi_query,
    );
    Ok(serializer)
}

/// Per-attempt timeout: one second per attempt number
fn attempt_timeout(attempt: u32) -> Duration {
    Duration::from_secs(attempt as u64)
}

/// Retry `exchange` on transient failures, up to [`MAX_ATTEMPTS`] times.
/// SERVFAIL is retried once; a second one is final.
async fn retry<T, F, Fut>(what: &str, mut exchange: F) -> Result<T>
where
    F: FnMut(Duration) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    let mut server_failures = 0;
    loop {
        match exchange(attempt_timeout(attempt)).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_server_failure() && server_failures > 0 => return Err(e),
            Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                debug!("{} attempt {} failed: {}", what, attempt, e);
                if e.is_server_failure() {
                    server_failures += 1;
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

struct Handshake<'a> {
    channel: &'a Channel,
    overrides: &'a Overrides,
    serializer: Serializer,
}

impl Handshake<'_> {
    async fn call(&self, serializer: &Serializer, request: Request, timeout: Duration) -> Result<Response> {
        self.channel.call(serializer, request, timeout).await
    }

    /// Retry one request with the current parameters
    async fn request(&self, what: &str, request: Request) -> Result<Response> {
        let serializer = &self.serializer;
        retry(what, move |timeout| self.call(serializer, request.clone(), timeout)).await
    }

    /// Steps 3 to 10; they run once the server holds a user for us
    async fn negotiate(&mut self) -> Result<()> {
        self.detect_edns0().await;
        self.negotiate_upstream().await;
        self.negotiate_downstream().await;
        self.negotiate_lazy_mode().await;
        self.negotiate_multi_query().await;
        self.negotiate_fragment_size().await
    }

    /// Ask the server to drop the user a failed handshake leaves behind
    async fn release(&self) {
        let request = Request::SetOptions(SessionOptions {
            closed: Some(true),
            ..Default::default()
        });
        match self.call(&self.serializer, request, RELEASE_TIMEOUT).await {
            Ok(_) => debug!("Released user {:?}", self.serializer.user_id),
            Err(e) => debug!("Could not release user {:?}: {}", self.serializer.user_id, e),
        }
    }

    async fn set_options(&self, what: &str, options: SessionOptions) -> Result<()> {
        match self.request(what, Request::SetOptions(options)).await? {
            Response::SetOptions => Ok(()),
            other => Err(TunnelError::Corrupted(format!("unexpected {:?}", other.command()))),
        }
    }

    /// Step 1: find the best record type the path delivers intact
    async fn detect_query_type(&mut self) -> Result<()> {
        if let Some(pinned) = self.overrides.query_type {
            info!("Query type pinned to {}", pinned);
            self.serializer.upstream.query_type = Some(pinned);
            return Ok(());
        }

        let mut best: Option<QueryType> = None;
        for pass in 1..=QUERY_TYPE_PASSES {
            for qtype in QueryType::ALL {
                if best.is_some_and(|b| qtype.rank() >= b.rank()) {
                    break;
                }
                let mut trial = self.serializer.clone();
                trial.upstream.query_type = Some(qtype);
                let request = Request::TestDownstreamEncoder {
                    encoder: Encoder::Base32,
                };
                match self.call(&trial, request, attempt_timeout(pass)).await {
                    Ok(Response::TestDownstreamEncoder { canary, .. }) if canary == DOWNSTREAM_CANARY => {
                        debug!("Query type {} works (pass {})", qtype, pass);
                        best = Some(qtype);
                        break;
                    }
                    Ok(_) => debug!("Query type {} returned a damaged canary", qtype),
                    Err(e) => debug!("Query type {} failed: {}", qtype, e),
                }
            }
            if best == Some(QueryType::ALL[0]) {
                break;
            }
        }

        let qtype = best.ok_or_else(|| TunnelError::in_step("query type", TunnelError::NoQueryType))?;
        info!("Using {} queries", qtype);
        self.serializer.upstream.query_type = Some(qtype);
        Ok(())
    }

    /// Step 2: exchange protocol versions and obtain a user id
    async fn version(&mut self) -> Result<()> {
        // one nonce for every attempt, so a lost reply costs no extra user
        let request = Request::Version {
            client_version: PROTOCOL_VERSION,
            nonce: rand::random(),
        };
        match self.request("version", request).await {
            Ok(Response::Version {
                server_version,
                user_id,
            }) => {
                info!("Server version {:#010x}, assigned user {}", server_version, user_id);
                self.serializer.user_id = Some(user_id);
                Ok(())
            }
            Ok(other) => Err(TunnelError::in_step(
                "version",
                TunnelError::Corrupted(format!("unexpected {:?}", other.command())),
            )),
            Err(e) => Err(TunnelError::in_step("version", e)),
        }
    }

    /// Step 3: check whether large answers survive when advertised via EDNS0
    async fn detect_edns0(&mut self) {
        let mut trial = self.serializer.clone();
        trial.use_edns0 = true;
        let request = Request::TestFragmentSize {
            size: EDNS_TEST_SIZE,
            nonce: rand::random(),
        };
        let this = &*self;
        let trial = &trial;
        let result = retry("edns0", move |timeout| this.call(trial, request.clone(), timeout)).await;
        match result {
            Ok(response) if fragment_intact(&response, EDNS_TEST_SIZE as usize) => {
                info!("EDNS0 enabled");
                self.serializer.use_edns0 = true;
            }
            Ok(_) => debug!("EDNS0 test returned a damaged pattern"),
            Err(e) => debug!("EDNS0 unavailable: {}", e),
        }
    }

    /// Steps 4 and 5: pick and announce the upstream encoder
    async fn negotiate_upstream(&mut self) {
        let encoder = match self.overrides.upstream_encoder {
            Some(pinned) => pinned,
            None => self.detect_upstream().await,
        };
        if encoder == Encoder::Base32 {
            self.serializer.upstream.encoder = Some(Encoder::Base32);
            return;
        }

        let options = SessionOptions {
            upstream_encoder: Some(encoder),
            ..Default::default()
        };
        match self.set_options("upstream encoder", options).await {
            Ok(()) => {
                info!("Upstream encoder {}", encoder);
                self.serializer.upstream.encoder = Some(encoder);
            }
            Err(e) => {
                warn!("Server rejected upstream encoder {}: {}; using base32", encoder, e);
                self.serializer.upstream.encoder = Some(Encoder::Base32);
            }
        }
    }

    async fn detect_upstream(&self) -> Encoder {
        for candidate in UPSTREAM_CANDIDATES {
            match self.test_upstream(candidate).await {
                Ok(()) => return candidate,
                Err(UpstreamCheck::CaseFolded) => {
                    info!("Resolver folds case; upstream pinned to base32");
                    return Encoder::Base32;
                }
                Err(UpstreamCheck::Failed(reason)) => {
                    debug!("Upstream encoder {} unusable: {}", candidate, reason)
                }
            }
        }
        Encoder::Base32
    }

    async fn test_upstream(&self, candidate: Encoder) -> std::result::Result<(), UpstreamCheck> {
        for pattern in candidate.test_patterns() {
            let request = Request::TestUpstreamEncoder {
                pattern: pattern.clone(),
            };
            match self.request("upstream encoder", request).await {
                Ok(Response::TestUpstreamEncoder { pattern: echoed }) => {
                    check_upstream_echo(&pattern, &echoed)?;
                }
                Ok(_) => return Err(UpstreamCheck::Failed("unexpected response".into())),
                Err(e) => return Err(UpstreamCheck::Failed(e.to_string())),
            }
        }
        Ok(())
    }

    /// Steps 6 and 7: pick and announce the downstream encoder
    async fn negotiate_downstream(&mut self) {
        let qtype = self.serializer.query_type();
        let encoder = match self.overrides.downstream_encoder {
            Some(pinned) => pinned,
            None if qtype.carries_raw() => Encoder::Raw,
            None => self.detect_downstream().await,
        };
        if encoder == Encoder::Base32 {
            self.serializer.downstream.encoder = Some(Encoder::Base32);
            return;
        }

        let options = SessionOptions {
            downstream_encoder: Some(encoder),
            ..Default::default()
        };
        match self.set_options("downstream encoder", options).await {
            Ok(()) => {
                info!("Downstream encoder {}", encoder);
                self.serializer.downstream.encoder = Some(encoder);
            }
            Err(e) => {
                warn!("Server rejected downstream encoder {}: {}; using base32", encoder, e);
                self.serializer.downstream.encoder = Some(Encoder::Base32);
            }
        }
    }

    async fn detect_downstream(&self) -> Encoder {
        let mut best = Encoder::Base32;
        for candidate in DOWNSTREAM_CANDIDATES {
            let request = Request::TestDownstreamEncoder { encoder: candidate };
            match self.request("downstream encoder", request).await {
                Ok(Response::TestDownstreamEncoder { canary, .. }) if canary == DOWNSTREAM_CANARY => {
                    debug!("Downstream encoder {} works", candidate);
                    best = candidate;
                }
                Ok(_) => debug!("Downstream encoder {} damaged the canary", candidate),
                Err(e) => debug!("Downstream encoder {} failed: {}", candidate, e),
            }
        }
        best
    }

    /// Step 8: ask the server to hold polls until it has data
    async fn negotiate_lazy_mode(&mut self) {
        if !self.overrides.lazy_mode {
            return;
        }
        let options = SessionOptions {
            lazy_mode: Some(true),
            ..Default::default()
        };
        match self.set_options("lazy mode", options).await {
            Ok(()) => {
                info!("Lazy mode enabled");
                self.serializer.use_lazy_mode = true;
            }
            Err(e) => warn!("Lazy mode unavailable, using legacy polling: {}", e),
        }
    }

    /// Step 8b: check whether two questions per query come back intact
    async fn negotiate_multi_query(&mut self) {
        if !self.overrides.multi_query {
            return;
        }
        if !self.serializer.use_edns0 {
            debug!("Multi-query needs EDNS0; a classic message cannot hold two full questions");
            return;
        }
        let requests = [
            Request::TestMultiQuery {
                index: 0,
                nonce: rand::random(),
            },
            Request::TestMultiQuery {
                index: 1,
                nonce: rand::random(),
            },
        ];
        let (channel, serializer, requests) = (self.channel, &self.serializer, &requests);
        let result = retry("multi-query", move |timeout| {
            channel.exchange(serializer, requests, timeout)
        })
        .await;

        let intact = matches!(
            result.as_deref(),
            Ok([Response::TestMultiQuery { index: 0 }, Response::TestMultiQuery { index: 1 }])
        );
        if !intact {
            match result {
                Err(e) => debug!("Multi-query unavailable: {}", e),
                Ok(_) => debug!("Multi-query answers were mixed up"),
            }
            return;
        }

        let options = SessionOptions {
            multi_query: Some(true),
            ..Default::default()
        };
        match self.set_options("multi-query", options).await {
            Ok(()) => {
                info!("Multi-query enabled");
                self.serializer.use_multi_query = true;
            }
            Err(e) => debug!("Server rejected multi-query: {}", e),
        }
    }

    /// Steps 9 and 10: find and announce the largest intact downstream fragment
    async fn negotiate_fragment_size(&mut self) -> Result<()> {
        self.serializer.upstream.fragment_size = self.serializer.upstream_capacity();

        let size = match self.overrides.fragment_size {
            Some(pinned) => pinned,
            None => {
                let confirmed = self.search_fragment_size().await?;
                let size = confirmed.saturating_sub(self.question_slack()?);
                if size < MIN_FRAGMENT_SIZE {
                    return Err(TunnelError::in_step("fragment size", TunnelError::FragmentTooSmall(size)));
                }
                debug!("Fragment size {} confirmed, {} after question slack", confirmed, size);
                size
            }
        };

        let options = SessionOptions {
            fragment_size: Some(size as u32),
            ..Default::default()
        };
        match self.set_options("fragment size", options).await {
            Ok(()) => {
                info!("Downstream fragment size {}", size);
                self.serializer.downstream.fragment_size = size;
            }
            Err(e) => {
                warn!("Fragment size {} rejected: {}; keeping {}", size, e, DEFAULT_FRAGMENT_SIZE);
                self.serializer.downstream.fragment_size = DEFAULT_FRAGMENT_SIZE;
            }
        }
        Ok(())
    }

    /// Raw bytes to give up so that packet answers still fit once their
    /// questions carry full-length names instead of the short test name
    fn question_slack(&self) -> Result<usize> {
        let questions = if self.serializer.use_multi_query { MULTI_QUERY_BATCH } else { 1 };
        let test = Request::TestFragmentSize { size: 0, nonce: 0 };
        let test_name = self.serializer.request_name(&test)?.len();

        let octets = (questions * (MAX_NAME_LEN + QUESTION_OVERHEAD) + ACK_ANSWER_SIZE * (questions - 1))
            .saturating_sub(test_name + QUESTION_OVERHEAD);
        Ok(match self.serializer.downstream_encoder() {
            Encoder::Raw => octets,
            encoder => encoder.max_raw_len(octets) + 2,
        })
    }

    async fn search_fragment_size(&self) -> Result<usize> {
        let encoder = self.serializer.downstream_encoder();
        // largest size confirmed, smallest size known to fail
        let mut low = 0;
        let mut high = MAX_FRAGMENT_SIZE + 1;
        let mut size = FRAGMENT_SEARCH_START;

        loop {
            match self.test_fragment(size).await {
                Ok(()) => {
                    debug!("Fragment size {} ok", size);
                    low = size;
                }
                Err(FragmentCheck::Corrupted(reason)) => {
                    let cause = if encoder == Encoder::Base32 {
                        TunnelError::Corrupted(reason)
                    } else {
                        TunnelError::EncoderUnreliable(encoder)
                    };
                    return Err(TunnelError::in_step("fragment size", cause));
                }
                Err(FragmentCheck::Failed(e)) => {
                    debug!("Fragment size {} failed: {}", size, e);
                    high = size;
                }
            }

            let span = high - low;
            if !(span >= 8 || (low < FRAGMENT_SEARCH_FLOOR && span > 1)) {
                break;
            }
            size = low + span / 2;
        }

        if low < MIN_FRAGMENT_SIZE {
            return Err(TunnelError::in_step("fragment size", TunnelError::FragmentTooSmall(low)));
        }
        Ok(low)
    }

    async fn test_fragment(&self, size: usize) -> std::result::Result<(), FragmentCheck> {
        let request = Request::TestFragmentSize {
            size: size as u32,
            nonce: rand::random(),
        };
        match self.request("fragment size", request).await {
            Ok(response) if fragment_intact(&response, size) => Ok(()),
            Ok(_) => Err(FragmentCheck::Corrupted(format!("pattern of {} bytes damaged", size))),
            Err(TunnelError::Decode(e)) => Err(FragmentCheck::Corrupted(e.to_string())),
            Err(e) => Err(FragmentCheck::Failed(e)),
        }
    }
}

enum UpstreamCheck {
    CaseFolded,
    Failed(String),
}

enum FragmentCheck {
    Corrupted(String),
    Failed(TunnelError),
}

/// Compare an echoed upstream pattern with what was sent
fn check_upstream_echo(sent: &[u8], echoed: &[u8]) -> std::result::Result<(), UpstreamCheck> {
    if sent.starts_with(b"aA") && !echoed.starts_with(b"aA") {
        return Err(UpstreamCheck::CaseFolded);
    }
    if sent != echoed {
        return Err(UpstreamCheck::Failed("pattern damaged in transit".into()));
    }
    Ok(())
}

fn fragment_intact(response: &Response, size: usize) -> bool {
    match response {
        Response::TestFragmentSize { honored, pattern } => {
            *honored as usize == size && *pattern == fragment_pattern(size)
        }
        _ => false,
    }
}
