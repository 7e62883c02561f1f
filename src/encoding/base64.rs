//! Hostname-friendly Base64 variants.
//!
//! Both alphabets put lower case first so the leading test pattern `aA`
//! exercises a real case pair. The alternative alphabet swaps `+` for `_`
//! for resolvers that reject the former.

use base64::alphabet::Alphabet;
use base64::engine::general_purpose::{GeneralPurpose, NO_PAD};
use base64::Engine as _;
use std::sync::OnceLock;

use crate::error::DecodeError;

pub const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-+";
pub const ALPHABET_ALT: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_";

fn build(symbols: &str) -> GeneralPurpose {
    let alphabet = Alphabet::new(symbols).expect("static base64 alphabet is valid");
    GeneralPurpose::new(&alphabet, NO_PAD)
}

fn engine() -> &'static GeneralPurpose {
    static ENGINE: OnceLock<GeneralPurpose> = OnceLock::new();
    ENGINE.get_or_init(|| {
        build("abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-+")
    })
}

fn engine_alt() -> &'static GeneralPurpose {
    static ENGINE: OnceLock<GeneralPurpose> = OnceLock::new();
    ENGINE.get_or_init(|| {
        build("abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_")
    })
}

fn map_error(err: base64::DecodeError, text: &[u8]) -> DecodeError {
    match err {
        base64::DecodeError::InvalidByte(offset, symbol) => {
            DecodeError::InvalidSymbol { symbol, offset }
        }
        base64::DecodeError::InvalidLastSymbol(_, _) => DecodeError::TrailingBits,
        _ => DecodeError::InvalidLength(text.len()),
    }
}

pub fn encode(data: &[u8]) -> Vec<u8> {
    engine().encode(data).into_bytes()
}

pub fn decode(text: &[u8]) -> Result<Vec<u8>, DecodeError> {
    engine().decode(text).map_err(|e| map_error(e, text))
}

pub fn encode_alt(data: &[u8]) -> Vec<u8> {
    engine_alt().encode(data).into_bytes()
}

pub fn decode_alt(text: &[u8]) -> Result<Vec<u8>, DecodeError> {
    engine_alt().decode(text).map_err(|e| map_error(e, text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variants_differ_only_in_last_symbol() {
        let data = [0xfb, 0xff, 0xbf];
        assert_eq!(encode(&data), b"-+-+".to_vec());
        assert_eq!(encode_alt(&data), b"-_-_".to_vec());
        assert!(decode_alt(b"-+-+").is_err());
    }

    #[test]
    fn test_case_is_significant() {
        let lower = decode(b"aaaa").unwrap();
        let upper = decode(b"AAAA").unwrap();
        assert_ne!(lower, upper);
    }
}
