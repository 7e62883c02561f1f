//! Byte/text codecs safe for DNS labels and answer records
//!
//! Every codec is a variant of [`Encoder`] and is identified on the wire by a
//! single character code. None of them emits `.`, which is reserved for
//! label splitting, except [`Encoder::Raw`]: raw payloads are only ever sent
//! downstream inside NULL/PRIVATE answers and never appear in hostnames.

mod base128;
mod base32;
mod base64;
mod base85;
mod base91;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::DecodeError;

pub use self::base32::ALPHABET as BASE32_ALPHABET;

/// Byte/text codec used for one direction of the tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoder {
    Base32,
    Base64,
    #[serde(rename = "base64u")]
    Base64Alt,
    Base85,
    Base91,
    Base128,
    Raw,
}

/// Width of the chunks the alphabet is cut into for test patterns
const PATTERN_CHUNK: usize = 48;

impl Encoder {
    pub const ALL: [Encoder; 7] = [
        Encoder::Base32,
        Encoder::Base64,
        Encoder::Base64Alt,
        Encoder::Base85,
        Encoder::Base91,
        Encoder::Base128,
        Encoder::Raw,
    ];

    /// Single-character wire code
    pub fn code(self) -> u8 {
        match self {
            Encoder::Base32 => b't',
            Encoder::Base64 => b's',
            Encoder::Base64Alt => b'u',
            Encoder::Base85 => b'e',
            Encoder::Base91 => b'n',
            Encoder::Base128 => b'h',
            Encoder::Raw => b'r',
        }
    }

    /// Look up an encoder by wire code, ignoring case
    pub fn from_code(code: u8) -> Option<Self> {
        let code = code.to_ascii_lowercase();
        Self::ALL.iter().copied().find(|e| e.code() == code)
    }

    pub fn name(self) -> &'static str {
        match self {
            Encoder::Base32 => "base32",
            Encoder::Base64 => "base64",
            Encoder::Base64Alt => "base64u",
            Encoder::Base85 => "base85",
            Encoder::Base91 => "base91",
            Encoder::Base128 => "base128",
            Encoder::Raw => "raw",
        }
    }

    pub fn encode(self, data: &[u8]) -> Vec<u8> {
        match self {
            Encoder::Base32 => base32::encode(data),
            Encoder::Base64 => base64::encode(data),
            Encoder::Base64Alt => base64::encode_alt(data),
            Encoder::Base85 => base85::encode(data),
            Encoder::Base91 => base91::encode(data),
            Encoder::Base128 => base128::encode(data),
            Encoder::Raw => data.to_vec(),
        }
    }

    pub fn decode(self, text: &[u8]) -> Result<Vec<u8>, DecodeError> {
        match self {
            Encoder::Base32 => base32::decode(text),
            Encoder::Base64 => base64::decode(text),
            Encoder::Base64Alt => base64::decode_alt(text),
            Encoder::Base85 => base85::decode(text),
            Encoder::Base91 => base91::decode(text),
            Encoder::Base128 => base128::decode(text),
            Encoder::Raw => Ok(text.to_vec()),
        }
    }

    /// Encoded characters per raw byte
    pub fn ratio(self) -> f64 {
        match self {
            Encoder::Base32 => 8.0 / 5.0,
            Encoder::Base64 | Encoder::Base64Alt => 4.0 / 3.0,
            Encoder::Base85 => 5.0 / 4.0,
            Encoder::Base91 => 8.0 / 6.5,
            Encoder::Base128 => 8.0 / 7.0,
            Encoder::Raw => 1.0,
        }
    }

    /// Upper bound on the encoded length of `len` raw bytes
    pub fn max_encoded_len(self, len: usize) -> usize {
        match self {
            Encoder::Base32 => (len * 8).div_ceil(5),
            Encoder::Base64 | Encoder::Base64Alt => (len * 4).div_ceil(3),
            Encoder::Base85 => base85::encoded_len(len),
            Encoder::Base91 => (len * 8).div_ceil(13) * 2,
            Encoder::Base128 => (len * 8).div_ceil(7),
            Encoder::Raw => len,
        }
    }

    /// Largest raw length whose encoding is guaranteed to fit in `chars`
    pub fn max_raw_len(self, chars: usize) -> usize {
        let mut len = (chars as f64 / self.ratio()) as usize + 1;
        while len > 0 && self.max_encoded_len(len) > chars {
            len -= 1;
        }
        len
    }

    /// Whether the encoder output may be placed in a hostname
    pub fn hostname_safe(self) -> bool {
        !matches!(self, Encoder::Raw)
    }

    /// Symbols the encoder emits
    pub fn alphabet(self) -> &'static [u8] {
        match self {
            Encoder::Base32 => base32::ALPHABET,
            Encoder::Base64 => base64::ALPHABET,
            Encoder::Base64Alt => base64::ALPHABET_ALT,
            Encoder::Base85 => base85::ALPHABET,
            Encoder::Base91 => base91::ALPHABET,
            Encoder::Base128 => &base128::ALPHABET,
            Encoder::Raw => &[],
        }
    }

    /// Canary strings used while negotiating this encoder.
    ///
    /// The first pattern always starts with `aA` so a resolver that folds
    /// case is detected even when the rest of the pattern survives.
    pub fn test_patterns(self) -> Vec<Vec<u8>> {
        let alphabet = self.alphabet();
        let mut patterns = Vec::new();

        let mut first = b"aA".to_vec();
        first.extend_from_slice(&alphabet[..alphabet.len().min(PATTERN_CHUNK)]);
        patterns.push(first);

        if alphabet.len() > PATTERN_CHUNK {
            patterns.extend(alphabet[PATTERN_CHUNK..].chunks(PATTERN_CHUNK).map(<[u8]>::to_vec));
        }
        patterns
    }
}

impl fmt::Display for Encoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Encoder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|e| e.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown encoder: {}", s))
    }
}

/// Reverse lookup table for a symbol set; `0xFF` marks invalid symbols
pub(crate) const fn decode_table(alphabet: &[u8]) -> [u8; 256] {
    let mut table = [0xFFu8; 256];
    let mut i = 0;
    while i < alphabet.len() {
        table[alphabet[i] as usize] = i as u8;
        i += 1;
    }
    table
}
