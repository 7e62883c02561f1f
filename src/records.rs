//! Record packer: spreads a response payload over DNS answer records
//!
//! Resolvers may reorder or duplicate answer records, so every record carries
//! its own order key inside its data. [`unwrap`] sorts by key (within a
//! per-type priority band), drops duplicates and concatenates the payload.
//!
//! | Type          | Key                           | Payload per record |
//! |---------------|-------------------------------|--------------------|
//! | NULL, PRIVATE | 2 bytes little-endian          | [`OPAQUE_CHUNK`]   |
//! | TXT           | 2 chars of `0-9a-z`, string 0  | [`TXT_CHUNK`]      |
//! | CNAME/MX/SRV  | 2 chars of `0-9a-z`, in target | domain dependent   |
//! | AAAA          | 2 bytes little-endian          | 14 bytes           |
//! | A             | 1 byte                         | 3 bytes            |

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use crate::dns::name::{available_for, build_hostname, max_text_len, strip_domain, undotify};
use crate::dns::{
    name_bytes, to_name, Name, RData, RecordType, A, AAAA, CNAME, MAX_NAME_LEN, MX, NULL, PRIVATE_TYPE, SRV, TXT,
};
use crate::error::{Result, TunnelError};

/// Symbols of the two-character order key used in text records
const KEY_ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Number of distinct two-character keys
const TEXT_KEYS: usize = KEY_ALPHABET.len() * KEY_ALPHABET.len();

/// Largest payload a single NULL/PRIVATE record can carry.
///
/// A DNS message is at most 65535 octets. Take away the header (12), the
/// longest question (255 + 4), the longest uncompressed answer owner and
/// fixed RR fields (255 + 10), an EDNS0 OPT record (11) and the order key.
pub const OPAQUE_CHUNK: usize = u16::MAX as usize - 12 - (255 + 4) - (255 + 10) - 11 - 2;

/// Longest TXT character-string we emit
const TXT_STRING_LEN: usize = 253;

/// TXT strings per record
const TXT_STRINGS: usize = 250;

/// Payload per TXT record (the first string also holds the key)
pub const TXT_CHUNK: usize = TXT_STRING_LEN * TXT_STRINGS - 2;

pub const AAAA_CHUNK: usize = 14;
pub const A_CHUNK: usize = 3;

/// A keys are one octet and at most 255 records are produced
const A_MAX_RECORDS: usize = 255;

/// ISO/IEC 7816-4 padding marker for fixed-size address records
const PAD_MARKER: u8 = 0x80;

/// MX/SRV fields carried alongside the target name
const SRV_WEIGHT: u16 = 10;
const SRV_PORT: u16 = 443;

/// Query types usable by the tunnel, best first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    Null,
    Private,
    Txt,
    Srv,
    Mx,
    Cname,
    Aaaa,
    A,
}

impl QueryType {
    /// Negotiation order, highest capacity first
    pub const ALL: [QueryType; 8] = [
        QueryType::Null,
        QueryType::Private,
        QueryType::Txt,
        QueryType::Srv,
        QueryType::Mx,
        QueryType::Cname,
        QueryType::Aaaa,
        QueryType::A,
    ];

    /// Position in the preference order; lower is better
    pub fn rank(self) -> usize {
        self as usize
    }

    pub fn record_type(self) -> RecordType {
        match self {
            QueryType::Null => RecordType::NULL,
            QueryType::Private => PRIVATE_TYPE,
            QueryType::Txt => RecordType::TXT,
            QueryType::Srv => RecordType::SRV,
            QueryType::Mx => RecordType::MX,
            QueryType::Cname => RecordType::CNAME,
            QueryType::Aaaa => RecordType::AAAA,
            QueryType::A => RecordType::A,
        }
    }

    pub fn from_record_type(rtype: RecordType) -> Option<Self> {
        Self::ALL.iter().copied().find(|q| q.record_type() == rtype)
    }

    /// Whether answers carry arbitrary octets rather than hostname text
    pub fn carries_raw(self) -> bool {
        matches!(self, QueryType::Null | QueryType::Private)
    }

    pub fn name(self) -> &'static str {
        match self {
            QueryType::Null => "null",
            QueryType::Private => "private",
            QueryType::Txt => "txt",
            QueryType::Srv => "srv",
            QueryType::Mx => "mx",
            QueryType::Cname => "cname",
            QueryType::Aaaa => "aaaa",
            QueryType::A => "a",
        }
    }

    /// Payload bytes a single record of this type can carry
    pub fn chunk_size(self, domain: &str) -> usize {
        match self {
            QueryType::Null | QueryType::Private => OPAQUE_CHUNK,
            QueryType::Txt => TXT_CHUNK,
            QueryType::Srv | QueryType::Mx | QueryType::Cname => {
                max_text_len(available_for(domain)).saturating_sub(2)
            }
            QueryType::Aaaa => AAAA_CHUNK,
            QueryType::A => A_CHUNK,
        }
    }

    /// Largest payload that fits the answer section, if bounded by the
    /// key space
    pub fn max_payload(self, domain: &str) -> Option<usize> {
        match self {
            QueryType::A => Some(A_MAX_RECORDS * A_CHUNK - 1),
            QueryType::Aaaa => Some((u16::MAX as usize + 1) * AAAA_CHUNK - 1),
            QueryType::Txt | QueryType::Srv | QueryType::Mx | QueryType::Cname => {
                Some(TEXT_KEYS * self.chunk_size(domain))
            }
            QueryType::Null | QueryType::Private => Some((u16::MAX as usize + 1) * OPAQUE_CHUNK),
        }
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for QueryType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|q| q.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown query type: {}", s))
    }
}

/// Split `payload` into answer records of type `qtype`
pub fn wrap(qtype: QueryType, domain: &str, payload: &[u8]) -> Result<Vec<RData>> {
    if let Some(max) = qtype.max_payload(domain) {
        if payload.len() > max {
            return Err(TunnelError::PayloadTooLarge {
                len: payload.len(),
                max,
            });
        }
    }

    match qtype {
        QueryType::Null | QueryType::Private => Ok(payload
            .chunks(OPAQUE_CHUNK)
            .enumerate()
            .map(|(key, chunk)| {
                let mut data = Vec::with_capacity(chunk.len() + 2);
                data.extend_from_slice(&(key as u16).to_le_bytes());
                data.extend_from_slice(chunk);
                if qtype == QueryType::Null {
                    RData::NULL(NULL::with(data))
                } else {
                    RData::Unknown {
                        code: PRIVATE_TYPE,
                        rdata: NULL::with(data),
                    }
                }
            })
            .collect()),
        QueryType::Txt => Ok(payload
            .chunks(TXT_CHUNK)
            .enumerate()
            .map(|(key, chunk)| {
                let mut data = text_key(key).to_vec();
                data.extend_from_slice(chunk);
                RData::TXT(TXT::from_bytes(data.chunks(TXT_STRING_LEN).collect()))
            })
            .collect()),
        QueryType::Srv | QueryType::Mx | QueryType::Cname => {
            if payload.contains(&b'.') {
                return Err(TunnelError::Malformed(
                    "hostname record payload contains a label separator".into(),
                ));
            }
            let chunk_size = qtype.chunk_size(domain);
            if chunk_size == 0 {
                return Err(TunnelError::NameTooLong {
                    len: domain.len(),
                    max: MAX_NAME_LEN,
                });
            }
            payload
                .chunks(chunk_size)
                .enumerate()
                .map(|(key, chunk)| {
                    let mut text = text_key(key).to_vec();
                    text.extend_from_slice(chunk);
                    let target = to_name(&build_hostname(&text, domain)?)?;
                    Ok(match qtype {
                        QueryType::Cname => RData::CNAME(CNAME(target)),
                        QueryType::Mx => RData::MX(MX::new(key as u16, target)),
                        _ => RData::SRV(SRV::new(key as u16, SRV_WEIGHT, SRV_PORT, target)),
                    })
                })
                .collect()
        }
        QueryType::Aaaa => Ok(pad(payload, AAAA_CHUNK)
            .chunks(AAAA_CHUNK)
            .enumerate()
            .map(|(key, chunk)| {
                let mut octets = [0u8; 16];
                octets[..2].copy_from_slice(&(key as u16).to_le_bytes());
                octets[2..].copy_from_slice(chunk);
                RData::AAAA(AAAA(Ipv6Addr::from(octets)))
            })
            .collect()),
        QueryType::A => Ok(pad(payload, A_CHUNK)
            .chunks(A_CHUNK)
            .enumerate()
            .map(|(key, chunk)| RData::A(A(Ipv4Addr::new(key as u8, chunk[0], chunk[1], chunk[2]))))
            .collect()),
    }
}

/// Reassemble the payload carried by `records`, whatever order they arrive in
pub fn unwrap<'a, I>(domain: &str, records: I) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = &'a RData>,
{
    let mut pieces: Vec<(QueryType, u64, Vec<u8>)> = Vec::new();
    for record in records {
        let (qtype, key, chunk) = split_record(domain, record)?;
        let band = qtype.rank() as u64 * 65536 + key as u64;
        pieces.push((qtype, band, chunk));
    }
    if pieces.is_empty() {
        return Err(TunnelError::NoAnswer);
    }

    pieces.sort_by_key(|(_, band, _)| *band);
    pieces.dedup_by_key(|(_, band, _)| *band);

    let mut payload = Vec::new();
    let mut padded = Vec::new();
    let mut current = pieces[0].0;
    for (qtype, _, chunk) in pieces {
        if qtype != current {
            flush(current, &mut padded, &mut payload)?;
            current = qtype;
        }
        padded.extend_from_slice(&chunk);
    }
    flush(current, &mut padded, &mut payload)?;
    Ok(payload)
}

fn flush(qtype: QueryType, run: &mut Vec<u8>, payload: &mut Vec<u8>) -> Result<()> {
    if matches!(qtype, QueryType::A | QueryType::Aaaa) {
        payload.extend_from_slice(unpad(run)?);
    } else {
        payload.extend_from_slice(run);
    }
    run.clear();
    Ok(())
}

fn split_record(domain: &str, record: &RData) -> Result<(QueryType, u16, Vec<u8>)> {
    match record {
        RData::NULL(null) => split_opaque(QueryType::Null, null.anything()),
        RData::Unknown { code, rdata } if *code == PRIVATE_TYPE => {
            split_opaque(QueryType::Private, rdata.anything())
        }
        RData::TXT(txt) => {
            let data = txt.txt_data().concat();
            let key = parse_text_key(&data)?;
            Ok((QueryType::Txt, key, data[2..].to_vec()))
        }
        RData::CNAME(cname) => split_target(QueryType::Cname, domain, &cname.0),
        RData::MX(mx) => split_target(QueryType::Mx, domain, mx.exchange()),
        RData::SRV(srv) => split_target(QueryType::Srv, domain, srv.target()),
        RData::AAAA(aaaa) => {
            let octets = aaaa.0.octets();
            Ok((
                QueryType::Aaaa,
                u16::from_le_bytes([octets[0], octets[1]]),
                octets[2..].to_vec(),
            ))
        }
        RData::A(a) => {
            let octets = a.0.octets();
            Ok((QueryType::A, octets[0] as u16, octets[1..].to_vec()))
        }
        other => Err(TunnelError::UnsupportedRecordType(u16::from(other.record_type()))),
    }
}

fn split_opaque(qtype: QueryType, data: &[u8]) -> Result<(QueryType, u16, Vec<u8>)> {
    if data.len() < 2 {
        return Err(TunnelError::Malformed("record shorter than its key".into()));
    }
    let key = u16::from_le_bytes([data[0], data[1]]);
    Ok((qtype, key, data[2..].to_vec()))
}

fn split_target(qtype: QueryType, domain: &str, target: &Name) -> Result<(QueryType, u16, Vec<u8>)> {
    let target = name_bytes(target);
    let text = strip_domain(&target, domain).ok_or_else(|| {
        TunnelError::Malformed(format!(
            "{} target outside of {}",
            qtype,
            domain
        ))
    })?;
    let text = undotify(text);
    let key = parse_text_key(&text)?;
    Ok((qtype, key, text[2..].to_vec()))
}

fn text_key(index: usize) -> [u8; 2] {
    [
        KEY_ALPHABET[index / KEY_ALPHABET.len()],
        KEY_ALPHABET[index % KEY_ALPHABET.len()],
    ]
}

fn parse_text_key(data: &[u8]) -> Result<u16> {
    let digit = |c: u8| {
        KEY_ALPHABET
            .iter()
            .position(|&k| k == c.to_ascii_lowercase())
            .ok_or_else(|| TunnelError::Malformed(format!("invalid order key symbol 0x{:02x}", c)))
    };
    match data {
        [hi, lo, ..] => Ok((digit(*hi)? * KEY_ALPHABET.len() + digit(*lo)?) as u16),
        _ => Err(TunnelError::Malformed("record shorter than its key".into())),
    }
}

fn pad(payload: &[u8], block: usize) -> Vec<u8> {
    let mut padded = payload.to_vec();
    padded.push(PAD_MARKER);
    while padded.len() % block != 0 {
        padded.push(0);
    }
    padded
}

fn unpad(data: &[u8]) -> Result<&[u8]> {
    let end = data
        .iter()
        .rposition(|&b| b != 0)
        .ok_or_else(|| TunnelError::Malformed("missing padding marker".into()))?;
    if data[end] != PAD_MARKER {
        return Err(TunnelError::Malformed("missing padding marker".into()));
    }
    Ok(&data[..end])
}
