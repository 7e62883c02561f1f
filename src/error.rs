//! Error types for the DNS tunnel engine
//!
//! `TunnelError` is the single error type returned by every layer of the
//! crate. Errors reported by the peer travel as short ASCII tokens inside an
//! `Error` command response and are mapped onto [`WireError`] so callers can
//! branch on the cause.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::encoding::Encoder;

/// Failure to turn encoded text back into bytes
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid symbol 0x{symbol:02x} at offset {offset}")]
    InvalidSymbol { symbol: u8, offset: usize },

    #[error("invalid length {0} for encoding")]
    InvalidLength(usize),

    #[error("non-canonical trailing bits")]
    TrailingBits,

    #[error("group value out of range at offset {0}")]
    Overflow(usize),

    #[error("truncated payload: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("{0}")]
    Malformed(String),
}

/// Error tokens exchanged on the wire inside `Error` responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireError {
    BadVersion,
    BadLength,
    BadIp,
    BadCommand,
    BadCodec,
    BadFragment,
    BadUser,
    BadConnection,
    BadSequence,
    ServerFull,
    VersionOk,
    Timeout,
}

impl WireError {
    const ALL: [WireError; 12] = [
        WireError::BadVersion,
        WireError::BadLength,
        WireError::BadIp,
        WireError::BadCommand,
        WireError::BadCodec,
        WireError::BadFragment,
        WireError::BadUser,
        WireError::BadConnection,
        WireError::BadSequence,
        WireError::ServerFull,
        WireError::VersionOk,
        WireError::Timeout,
    ];

    /// Wire representation of this error
    pub fn token(&self) -> &'static str {
        match self {
            WireError::BadVersion => "BADVER",
            WireError::BadLength => "BADLEN",
            WireError::BadIp => "BADIP",
            WireError::BadCommand => "BADCOMMAND",
            WireError::BadCodec => "BADCODEC",
            WireError::BadFragment => "BADFRAG",
            WireError::BadUser => "BADUSER",
            WireError::BadConnection => "BADCONN",
            WireError::BadSequence => "BADSEQ",
            WireError::ServerFull => "VFUL",
            WireError::VersionOk => "VOK",
            WireError::Timeout => "TIMEOUT",
        }
    }

    /// Parse a wire token. Resolvers serving CNAME-style answers may fold
    /// case, so the comparison ignores it.
    pub fn from_token(token: &[u8]) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|e| e.token().as_bytes().eq_ignore_ascii_case(token))
    }
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Errors produced by the tunnel engine
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("hostname too long: {len} octets (max {max})")]
    NameTooLong { len: usize, max: usize },

    #[error("payload of {len} bytes exceeds capacity of {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("malformed DNS message: {0}")]
    Malformed(String),

    #[error("DNS wire format: {0}")]
    Dns(#[from] hickory_proto::error::ProtoError),

    #[error("response carries command '{got}', expected '{expected}'")]
    CommandMismatch { expected: char, got: char },

    #[error("unknown command code 0x{0:02x}")]
    UnknownCommand(u8),

    #[error("unknown encoder code 0x{0:02x}")]
    UnknownEncoder(u8),

    #[error("unsupported record type {0}")]
    UnsupportedRecordType(u16),

    #[error("peer reported {0}")]
    Remote(WireError),

    #[error("response contained no usable answer records")]
    NoAnswer,

    #[error("response truncated by the path")]
    Truncated,

    #[error("DNS server answered with rcode {0}")]
    Rcode(u8),

    #[error("round trip timed out after {0:?}")]
    Timeout(Duration),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("sequence desynchronized: expected {expected}, got {got}")]
    SequenceDesync { expected: u16, got: u16 },

    #[error("connection closed")]
    Closed,

    #[error("test response corrupted: {0}")]
    Corrupted(String),

    #[error("downstream encoder {0} corrupts data on this path")]
    EncoderUnreliable(Encoder),

    #[error("usable fragment size {0} is below the minimum of {min}", min = crate::session::MIN_FRAGMENT_SIZE)]
    FragmentTooSmall(usize),

    #[error("no query type survived probing")]
    NoQueryType,

    #[error("handshake step '{step}' failed")]
    Handshake {
        step: &'static str,
        #[source]
        source: Box<TunnelError>,
    },

    #[error("too many consecutive errors")]
    TooManyErrors(#[source] Box<TunnelError>),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    /// Wrap an error as the cause of a failed handshake step
    pub fn in_step(step: &'static str, source: TunnelError) -> Self {
        TunnelError::Handshake {
            step,
            source: Box::new(source),
        }
    }

    /// Errors after which the steady-state loop must stop immediately
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TunnelError::SequenceDesync { .. }
                | TunnelError::Closed
                | TunnelError::Remote(WireError::BadSequence)
                | TunnelError::Remote(WireError::BadConnection)
                | TunnelError::Remote(WireError::BadUser)
        )
    }

    /// Failures worth retrying with the same request
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TunnelError::Timeout(_) | TunnelError::Io(_) | TunnelError::NoAnswer | TunnelError::Rcode(2)
        )
    }

    /// SERVFAIL from the server or a resolver on the way
    pub fn is_server_failure(&self) -> bool {
        matches!(self, TunnelError::Rcode(2))
    }

    /// The peer has already discarded the session
    pub fn is_bad_connection(&self) -> bool {
        matches!(self, TunnelError::Remote(WireError::BadConnection))
    }
}

pub type Result<T> = std::result::Result<T, TunnelError>;
