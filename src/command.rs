//! Typed tunnel commands and their wire form
//!
//! A request travels in the query name:
//!
//! ```text
//! <code><user id: 4 base32 chars | 3 random chars><encoded payload>.<domain>
//! ```
//!
//! and its response in the answer records as `<code><encoded payload>`,
//! spread over records by [`crate::records`].

use bytes::{Buf, BufMut, BytesMut};
use rand::Rng;

use crate::encoding::{Encoder, BASE32_ALPHABET};
use crate::error::{DecodeError, Result, TunnelError, WireError};
use crate::queue::Packet;

/// Protocol version exchanged by the `Version` command
pub const PROTOCOL_VERSION: u32 = 0x5341_0001;

/// Raw bytes in front of a `Packet` request's data
pub const PACKET_REQUEST_HEADER: usize = 8;

/// Raw bytes in front of a `Packet` response's data
pub const PACKET_RESPONSE_HEADER: usize = 6;

/// Characters taken by the command code and user id in a request name
pub const REQUEST_PREFIX_LEN: usize = 1 + USER_ID_CHARS;

const USER_ID_CHARS: usize = 4;
const CACHE_BUST_CHARS: usize = 3;

/// Length of the login token
pub const LOGIN_TOKEN_LEN: usize = 16;

/// Fixed payload echoed by `TestDownstreamEncoder`, covering the byte values
/// most likely to be mangled on the way back
pub const DOWNSTREAM_CANARY: [u8; 48] = [
    0x00, 0x01, 0x02, 0x7f, 0x80, 0x81, 0xfe, 0xff, //
    0xaa, 0x55, 0xaa, 0x55, 0x00, 0xff, 0x00, 0xff, //
    b'a', b'A', b'z', b'Z', b'0', b'9', b'-', b'_', //
    b'.', b' ', b'+', b'/', b'=', b'\\', b'"', b'\'', //
    0x20, 0x2e, 0x3d, 0x40, 0x5c, 0x60, 0x7b, 0x7e, //
    0xbc, 0xc0, 0xdf, 0xe0, 0xef, 0xf0, 0xfd, 0x10,
];

/// Command kinds, one per wire code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Version,
    Login,
    Ping,
    TestFragmentSize,
    SetOptions,
    TestUpstreamEncoder,
    TestDownstreamEncoder,
    Packet,
    Error,
    TestMultiQuery,
}

impl Command {
    const ALL: [Command; 10] = [
        Command::Version,
        Command::Login,
        Command::Ping,
        Command::TestFragmentSize,
        Command::SetOptions,
        Command::TestUpstreamEncoder,
        Command::TestDownstreamEncoder,
        Command::Packet,
        Command::Error,
        Command::TestMultiQuery,
    ];

    pub fn code(self) -> u8 {
        match self {
            Command::Version => b'v',
            Command::Login => b'l',
            Command::Ping => b'p',
            Command::TestFragmentSize => b'f',
            Command::SetOptions => b'o',
            Command::TestUpstreamEncoder => b'z',
            Command::TestDownstreamEncoder => b'y',
            Command::Packet => b'k',
            Command::Error => b'x',
            Command::TestMultiQuery => b'm',
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        let code = code.to_ascii_lowercase();
        Self::ALL.iter().copied().find(|c| c.code() == code)
    }

    /// Whether the request names an established session
    pub fn requires_user(self) -> bool {
        !matches!(
            self,
            Command::Version | Command::TestDownstreamEncoder | Command::Error
        )
    }

    /// Whether a successful response carries no payload
    pub fn expects_empty_reply(self) -> bool {
        matches!(self, Command::Login | Command::Ping | Command::SetOptions)
    }
}

/// Per-field optional session settings carried by `SetOptions`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionOptions {
    pub lazy_mode: Option<bool>,
    pub multi_query: Option<bool>,
    pub downstream_encoder: Option<Encoder>,
    pub upstream_encoder: Option<Encoder>,
    pub fragment_size: Option<u32>,
    pub closed: Option<bool>,
}

impl SessionOptions {
    fn write(&self, buf: &mut BytesMut) {
        put_field(buf, self.lazy_mode, |b, v| b.put_u8(v as u8), 1);
        put_field(buf, self.multi_query, |b, v| b.put_u8(v as u8), 1);
        put_field(buf, self.downstream_encoder, |b, e| b.put_u8(e.code()), 1);
        put_field(buf, self.upstream_encoder, |b, e| b.put_u8(e.code()), 1);
        put_field(buf, self.fragment_size, |b, v| b.put_u32(v), 4);
        put_field(buf, self.closed, |b, v| b.put_u8(v as u8), 1);
    }

    fn read(buf: &mut &[u8]) -> Result<Self> {
        Ok(Self {
            lazy_mode: get_field(buf, 1, |b| get_bool(b.get_u8()))?,
            multi_query: get_field(buf, 1, |b| get_bool(b.get_u8()))?,
            downstream_encoder: get_field(buf, 1, |b| get_encoder(b.get_u8()))?,
            upstream_encoder: get_field(buf, 1, |b| get_encoder(b.get_u8()))?,
            fragment_size: get_field(buf, 4, |b| Ok(b.get_u32()))?,
            closed: get_field(buf, 1, |b| get_bool(b.get_u8()))?,
        })
    }
}

fn put_field<T: Copy>(buf: &mut BytesMut, value: Option<T>, put: impl Fn(&mut BytesMut, T), width: usize) {
    match value {
        Some(v) => {
            buf.put_u8(1);
            put(buf, v);
        }
        None => {
            buf.put_u8(0);
            buf.put_bytes(0, width);
        }
    }
}

fn get_field<T>(buf: &mut &[u8], width: usize, get: impl Fn(&mut &[u8]) -> Result<T>) -> Result<Option<T>> {
    need(buf, 1 + width)?;
    match buf.get_u8() {
        0 => {
            buf.advance(width);
            Ok(None)
        }
        1 => get(buf).map(Some),
        flag => Err(malformed(format!("invalid field sentinel {}", flag))),
    }
}

fn get_bool(value: u8) -> Result<bool> {
    match value {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(malformed(format!("invalid flag value {}", other))),
    }
}

fn get_encoder(code: u8) -> Result<Encoder> {
    Encoder::from_code(code).ok_or(TunnelError::UnknownEncoder(code))
}

/// A client request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Version {
        client_version: u32,
        /// Repeated on retries so the server hands out one user id
        nonce: u32,
    },
    Login {
        token: [u8; LOGIN_TOKEN_LEN],
    },
    Ping {
        nonce: u16,
    },
    TestFragmentSize {
        size: u32,
        nonce: u16,
    },
    SetOptions(SessionOptions),
    /// The pattern is placed in the name as is
    TestUpstreamEncoder {
        pattern: Vec<u8>,
    },
    TestDownstreamEncoder {
        encoder: Encoder,
    },
    Packet {
        nonce: u16,
        last_acked: Option<u16>,
        packet: Option<Packet>,
    },
    TestMultiQuery {
        index: u8,
        nonce: u16,
    },
}

impl Request {
    pub fn command(&self) -> Command {
        match self {
            Request::Version { .. } => Command::Version,
            Request::Login { .. } => Command::Login,
            Request::Ping { .. } => Command::Ping,
            Request::TestFragmentSize { .. } => Command::TestFragmentSize,
            Request::SetOptions(_) => Command::SetOptions,
            Request::TestUpstreamEncoder { .. } => Command::TestUpstreamEncoder,
            Request::TestDownstreamEncoder { .. } => Command::TestDownstreamEncoder,
            Request::Packet { .. } => Command::Packet,
            Request::TestMultiQuery { .. } => Command::TestMultiQuery,
        }
    }

    /// Build a cache-busting ping
    pub fn ping() -> Self {
        Request::Ping { nonce: rand::random() }
    }

    /// Encoder used for this request's payload, `None` when sent raw
    pub fn payload_encoder(&self, upstream: Encoder) -> Option<Encoder> {
        match self.command() {
            Command::Packet | Command::Ping => Some(upstream),
            Command::TestUpstreamEncoder => None,
            _ => Some(Encoder::Base32),
        }
    }

    fn payload(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        match self {
            Request::Version {
                client_version,
                nonce,
            } => {
                buf.put_u32(*client_version);
                buf.put_u32(*nonce);
            }
            Request::Login { token } => buf.put_slice(token),
            Request::Ping { nonce } => buf.put_u16(*nonce),
            Request::TestFragmentSize { size, nonce } => {
                buf.put_u32(*size);
                buf.put_u16(*nonce);
            }
            Request::SetOptions(options) => options.write(&mut buf),
            Request::TestUpstreamEncoder { pattern } => buf.put_slice(pattern),
            Request::TestDownstreamEncoder { encoder } => buf.put_u8(encoder.code()),
            Request::Packet {
                nonce,
                last_acked,
                packet,
            } => {
                buf.put_u16(*nonce);
                put_packet(&mut buf, *last_acked, packet.as_ref());
            }
            Request::TestMultiQuery { index, nonce } => {
                buf.put_u8(*index);
                buf.put_u16(*nonce);
            }
        }
        buf.to_vec()
    }

    /// Undotted query text for this request (the part in front of the domain)
    pub fn to_text(&self, user_id: Option<u16>, upstream: Encoder) -> Result<Vec<u8>> {
        let command = self.command();
        let mut text = vec![command.code()];

        if command.requires_user() {
            let id = user_id.ok_or_else(|| {
                TunnelError::InvalidConfig(format!("{:?} needs an established session", command))
            })?;
            text.extend_from_slice(&Encoder::Base32.encode(&id.to_be_bytes()));
        } else {
            let mut rng = rand::thread_rng();
            for _ in 0..CACHE_BUST_CHARS {
                text.push(BASE32_ALPHABET[rng.gen_range(0..BASE32_ALPHABET.len())]);
            }
        }

        let payload = self.payload();
        match self.payload_encoder(upstream) {
            Some(encoder) => text.extend_from_slice(&encoder.encode(&payload)),
            None => text.extend_from_slice(&payload),
        }
        Ok(text)
    }

    /// Decode a request payload once its command and session are known
    pub fn decode(command: Command, payload: &[u8], upstream: Encoder) -> Result<Self> {
        let raw;
        let mut buf: &[u8] = match command {
            Command::TestUpstreamEncoder => payload,
            Command::Packet | Command::Ping => {
                raw = upstream.decode(payload)?;
                &raw
            }
            _ => {
                raw = Encoder::Base32.decode(payload)?;
                &raw
            }
        };

        let request = match command {
            Command::Version => {
                need(buf, 8)?;
                Request::Version {
                    client_version: buf.get_u32(),
                    nonce: buf.get_u32(),
                }
            }
            Command::Login => {
                need(buf, LOGIN_TOKEN_LEN)?;
                let mut token = [0u8; LOGIN_TOKEN_LEN];
                buf.copy_to_slice(&mut token);
                Request::Login { token }
            }
            Command::Ping => {
                need(buf, 2)?;
                Request::Ping { nonce: buf.get_u16() }
            }
            Command::TestFragmentSize => {
                need(buf, 6)?;
                Request::TestFragmentSize {
                    size: buf.get_u32(),
                    nonce: buf.get_u16(),
                }
            }
            Command::SetOptions => Request::SetOptions(SessionOptions::read(&mut buf)?),
            Command::TestUpstreamEncoder => Request::TestUpstreamEncoder {
                pattern: buf.to_vec(),
            },
            Command::TestDownstreamEncoder => {
                need(buf, 1)?;
                Request::TestDownstreamEncoder {
                    encoder: get_encoder(buf.get_u8())?,
                }
            }
            Command::Packet => {
                need(buf, 2)?;
                let nonce = buf.get_u16();
                let (last_acked, packet) = get_packet(&mut buf)?;
                Request::Packet {
                    nonce,
                    last_acked,
                    packet,
                }
            }
            Command::TestMultiQuery => {
                need(buf, 3)?;
                Request::TestMultiQuery {
                    index: buf.get_u8(),
                    nonce: buf.get_u16(),
                }
            }
            Command::Error => return Err(TunnelError::UnknownCommand(command.code())),
        };
        Ok(request)
    }
}

/// Split undotted query text into command, user id and payload text
pub fn split_request(text: &[u8]) -> Result<(Command, Option<u16>, &[u8])> {
    let (&code, rest) = text
        .split_first()
        .ok_or_else(|| malformed("empty request name"))?;
    let command = Command::from_code(code).ok_or(TunnelError::UnknownCommand(code))?;

    if command.requires_user() {
        if rest.len() < USER_ID_CHARS {
            return Err(DecodeError::Truncated {
                needed: USER_ID_CHARS,
                available: rest.len(),
            }
            .into());
        }
        let id = Encoder::Base32.decode(&rest[..USER_ID_CHARS])?;
        if id.len() != 2 {
            return Err(malformed("user id is not 16 bits"));
        }
        Ok((
            command,
            Some(u16::from_be_bytes([id[0], id[1]])),
            &rest[USER_ID_CHARS..],
        ))
    } else {
        if rest.len() < CACHE_BUST_CHARS {
            return Err(malformed("request name too short"));
        }
        Ok((command, None, &rest[CACHE_BUST_CHARS..]))
    }
}

/// A server response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Version {
        server_version: u32,
        user_id: u16,
    },
    Login,
    Ping,
    TestFragmentSize {
        honored: u32,
        pattern: Vec<u8>,
    },
    SetOptions,
    TestUpstreamEncoder {
        pattern: Vec<u8>,
    },
    TestDownstreamEncoder {
        encoder: Encoder,
        canary: Vec<u8>,
    },
    Packet {
        last_acked: Option<u16>,
        packet: Option<Packet>,
    },
    TestMultiQuery {
        index: u8,
    },
    Error(WireError),
}

impl Response {
    pub fn command(&self) -> Command {
        match self {
            Response::Version { .. } => Command::Version,
            Response::Login => Command::Login,
            Response::Ping => Command::Ping,
            Response::TestFragmentSize { .. } => Command::TestFragmentSize,
            Response::SetOptions => Command::SetOptions,
            Response::TestUpstreamEncoder { .. } => Command::TestUpstreamEncoder,
            Response::TestDownstreamEncoder { .. } => Command::TestDownstreamEncoder,
            Response::Packet { .. } => Command::Packet,
            Response::TestMultiQuery { .. } => Command::TestMultiQuery,
            Response::Error(_) => Command::Error,
        }
    }

    /// Serialize as `<code><encoded payload>` ready for the record packer
    pub fn to_bytes(&self, downstream: Encoder) -> Vec<u8> {
        let mut out = vec![self.command().code()];
        let mut buf = BytesMut::new();
        let encoder = match self {
            Response::Version {
                server_version,
                user_id,
            } => {
                buf.put_u32(*server_version);
                buf.put_u16(*user_id);
                Encoder::Base32
            }
            Response::Login | Response::Ping | Response::SetOptions => downstream,
            Response::TestFragmentSize { honored, pattern } => {
                buf.put_u32(*honored);
                buf.put_slice(pattern);
                downstream
            }
            Response::TestUpstreamEncoder { pattern } => {
                buf.put_slice(pattern);
                Encoder::Base32
            }
            Response::TestDownstreamEncoder { encoder, canary } => {
                buf.put_slice(canary);
                *encoder
            }
            Response::Packet { last_acked, packet } => {
                put_packet(&mut buf, *last_acked, packet.as_ref());
                downstream
            }
            Response::TestMultiQuery { index } => {
                buf.put_u8(*index);
                downstream
            }
            Response::Error(err) => {
                out.extend_from_slice(err.token().as_bytes());
                return out;
            }
        };
        out.extend_from_slice(&encoder.encode(&buf));
        out
    }

    /// Decode the response to `request`. The leading code must match the
    /// request's command; an `Error` response becomes [`TunnelError::Remote`].
    pub fn decode(request: &Request, data: &[u8], downstream: Encoder) -> Result<Self> {
        let (&code, text) = data.split_first().ok_or(TunnelError::NoAnswer)?;
        let command = Command::from_code(code).ok_or(TunnelError::UnknownCommand(code))?;

        if command == Command::Error {
            let err = WireError::from_token(text).ok_or_else(|| {
                malformed(format!(
                    "unknown error token {:?}",
                    String::from_utf8_lossy(text)
                ))
            })?;
            return Err(TunnelError::Remote(err));
        }
        let expected = request.command();
        if command != expected {
            return Err(TunnelError::CommandMismatch {
                expected: expected.code() as char,
                got: code as char,
            });
        }

        let encoder = match request {
            Request::Version { .. } | Request::TestUpstreamEncoder { .. } => Encoder::Base32,
            Request::TestDownstreamEncoder { encoder } => *encoder,
            _ => downstream,
        };
        let raw = encoder.decode(text)?;
        if expected.expects_empty_reply() && !raw.is_empty() {
            return Err(malformed(format!(
                "{:?} reply carries {} unexpected bytes",
                expected,
                raw.len()
            )));
        }
        let mut buf: &[u8] = &raw;

        let response = match request {
            Request::Version { .. } => {
                need(buf, 6)?;
                Response::Version {
                    server_version: buf.get_u32(),
                    user_id: buf.get_u16(),
                }
            }
            Request::Login { .. } => Response::Login,
            Request::Ping { .. } => Response::Ping,
            Request::SetOptions(_) => Response::SetOptions,
            Request::TestFragmentSize { .. } => {
                need(buf, 4)?;
                let honored = buf.get_u32();
                Response::TestFragmentSize {
                    honored,
                    pattern: buf.to_vec(),
                }
            }
            Request::TestUpstreamEncoder { .. } => Response::TestUpstreamEncoder {
                pattern: buf.to_vec(),
            },
            Request::TestDownstreamEncoder { encoder } => Response::TestDownstreamEncoder {
                encoder: *encoder,
                canary: buf.to_vec(),
            },
            Request::Packet { .. } => {
                let (last_acked, packet) = get_packet(&mut buf)?;
                Response::Packet { last_acked, packet }
            }
            Request::TestMultiQuery { .. } => {
                need(buf, 1)?;
                Response::TestMultiQuery {
                    index: buf.get_u8(),
                }
            }
        };
        Ok(response)
    }
}

/// Deterministic pattern returned by `TestFragmentSize`
pub fn fragment_pattern(size: usize) -> Vec<u8> {
    let mut pattern = Vec::with_capacity(size);
    let mut b: u8 = 107;
    for _ in 0..size {
        pattern.push(b);
        b = b.wrapping_mul(107);
    }
    pattern
}

fn put_packet(buf: &mut BytesMut, last_acked: Option<u16>, packet: Option<&Packet>) {
    buf.put_u8(last_acked.is_some() as u8);
    buf.put_u16(last_acked.unwrap_or(0));
    match packet {
        Some(packet) => {
            buf.put_u8(1);
            buf.put_u16(packet.seq);
            buf.put_slice(&packet.data);
        }
        None => {
            buf.put_u8(0);
            buf.put_u16(0);
        }
    }
}

fn get_packet(buf: &mut &[u8]) -> Result<(Option<u16>, Option<Packet>)> {
    need(buf, PACKET_RESPONSE_HEADER)?;
    let has_ack = get_bool(buf.get_u8())?;
    let ack = buf.get_u16();
    let has_packet = get_bool(buf.get_u8())?;
    let seq = buf.get_u16();
    let packet = has_packet.then(|| Packet {
        seq,
        data: buf.to_vec(),
    });
    if !has_packet && !buf.is_empty() {
        return Err(malformed("data without a packet header"));
    }
    Ok((has_ack.then_some(ack), packet))
}

fn need(buf: &[u8], len: usize) -> Result<()> {
    if buf.len() < len {
        return Err(DecodeError::Truncated {
            needed: len,
            available: buf.len(),
        }
        .into());
    }
    Ok(())
}

fn malformed(msg: impl Into<String>) -> TunnelError {
    TunnelError::Decode(DecodeError::Malformed(msg.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange(request: &Request, user_id: Option<u16>, upstream: Encoder) -> Request {
        let text = request.to_text(user_id, upstream).unwrap();
        let (command, id, payload) = split_request(&text).unwrap();
        assert_eq!(command, request.command());
        assert_eq!(id, if command.requires_user() { user_id } else { None });
        Request::decode(command, payload, upstream).unwrap()
    }

    #[test]
    fn test_requests_survive_the_name() {
        let requests = vec![
            Request::Version {
                client_version: PROTOCOL_VERSION,
                nonce: 0xdead_beef,
            },
            Request::Login { token: [7; 16] },
            Request::ping(),
            Request::TestFragmentSize { size: 768, nonce: 9 },
            Request::SetOptions(SessionOptions {
                lazy_mode: Some(true),
                downstream_encoder: Some(Encoder::Base91),
                fragment_size: Some(1200),
                ..Default::default()
            }),
            Request::TestUpstreamEncoder {
                pattern: b"aAbcXYZ".to_vec(),
            },
            Request::TestDownstreamEncoder {
                encoder: Encoder::Raw,
            },
            Request::Packet {
                nonce: 1,
                last_acked: Some(65535),
                packet: Some(Packet {
                    seq: 42,
                    data: b"hello".to_vec(),
                }),
            },
            Request::Packet {
                nonce: 2,
                last_acked: None,
                packet: None,
            },
            Request::TestMultiQuery { index: 1, nonce: 3 },
        ];
        for request in requests {
            for upstream in [Encoder::Base32, Encoder::Base128] {
                assert_eq!(exchange(&request, Some(0xbeef), upstream), request);
            }
        }
    }

    #[test]
    fn test_user_id_is_base32_and_case_insensitive() {
        let text = Request::ping().to_text(Some(513), Encoder::Base32).unwrap();
        let upper = text.to_ascii_uppercase();
        let (command, id, _) = split_request(&upper).unwrap();
        assert_eq!(command, Command::Ping);
        assert_eq!(id, Some(513));
    }

    #[test]
    fn test_session_command_without_user_fails() {
        assert!(Request::ping().to_text(None, Encoder::Base32).is_err());
    }

    #[test]
    fn test_response_code_must_match() {
        let response = Response::Ping.to_bytes(Encoder::Base32);
        let err = Response::decode(&Request::SetOptions(Default::default()), &response, Encoder::Base32)
            .unwrap_err();
        assert!(matches!(
            err,
            TunnelError::CommandMismatch {
                expected: 'o',
                got: 'p'
            }
        ));
    }

    #[test]
    fn test_error_response_maps_to_wire_error() {
        let bytes = Response::Error(WireError::BadConnection).to_bytes(Encoder::Raw);
        assert_eq!(bytes, b"xBADCONN");
        let err = Response::decode(&Request::ping(), &bytes, Encoder::Raw).unwrap_err();
        assert!(err.is_bad_connection());

        // lower-cased by a CNAME path
        let err = Response::decode(&Request::ping(), b"Xvful", Encoder::Base32).unwrap_err();
        assert!(matches!(err, TunnelError::Remote(WireError::ServerFull)));
    }

    #[test]
    fn test_responses_roundtrip() {
        let cases = vec![
            (
                Request::Version {
                    client_version: 1,
                    nonce: 5,
                },
                Response::Version {
                    server_version: PROTOCOL_VERSION,
                    user_id: 3,
                },
            ),
            (
                Request::TestFragmentSize { size: 100, nonce: 0 },
                Response::TestFragmentSize {
                    honored: 100,
                    pattern: fragment_pattern(100),
                },
            ),
            (
                Request::TestDownstreamEncoder {
                    encoder: Encoder::Base85,
                },
                Response::TestDownstreamEncoder {
                    encoder: Encoder::Base85,
                    canary: DOWNSTREAM_CANARY.to_vec(),
                },
            ),
            (
                Request::Packet {
                    nonce: 0,
                    last_acked: None,
                    packet: None,
                },
                Response::Packet {
                    last_acked: Some(7),
                    packet: Some(Packet {
                        seq: 8,
                        data: vec![0; 33],
                    }),
                },
            ),
            (Request::SetOptions(Default::default()), Response::SetOptions),
        ];
        for (request, response) in cases {
            let bytes = response.to_bytes(Encoder::Base64);
            assert_eq!(Response::decode(&request, &bytes, Encoder::Base64).unwrap(), response);
        }
    }

    #[test]
    fn test_fragment_pattern() {
        assert_eq!(fragment_pattern(4), vec![107, 185, 83, 177]);
        assert_eq!(fragment_pattern(768).len(), 768);
    }

    #[test]
    fn test_empty_reply_with_payload_is_rejected() {
        let mut bytes = vec![b'p'];
        bytes.extend_from_slice(&Encoder::Base32.encode(b"junk"));
        let err = Response::decode(&Request::ping(), &bytes, Encoder::Base32).unwrap_err();
        assert!(matches!(err, TunnelError::Decode(DecodeError::Malformed(_))), "{:?}", err);

        let ok = Response::Login.to_bytes(Encoder::Base32);
        assert_eq!(
            Response::decode(&Request::Login { token: [0; 16] }, &ok, Encoder::Base32).unwrap(),
            Response::Login
        );
    }

    #[test]
    fn test_empty_reply_flags() {
        assert!(Command::Ping.expects_empty_reply());
        assert!(!Command::Packet.expects_empty_reply());
        assert!(!Command::Version.requires_user());
        assert!(Command::TestUpstreamEncoder.requires_user());
    }
}
