//! Seven bits per symbol using letters, digits and the Latin-1 range
//! `0xBC..=0xFD`, which some resolvers pass through unchanged.

use super::decode_table;
use crate::error::DecodeError;

pub const ALPHABET: [u8; 128] = build_alphabet();

const DECODE: [u8; 256] = decode_table(&ALPHABET);

const fn build_alphabet() -> [u8; 128] {
    let ascii = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut table = [0u8; 128];
    let mut i = 0;
    while i < ascii.len() {
        table[i] = ascii[i];
        i += 1;
    }
    let mut high = 0xBCu8;
    while i < 128 {
        table[i] = high;
        high += 1;
        i += 1;
    }
    table
}

pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity((data.len() * 8).div_ceil(7));
    let mut acc: u32 = 0;
    let mut bits: u32 = 0;

    for &byte in data {
        acc = (acc << 8) | byte as u32;
        bits += 8;
        while bits >= 7 {
            bits -= 7;
            out.push(ALPHABET[((acc >> bits) & 0x7f) as usize]);
        }
        acc &= (1 << bits) - 1;
    }
    if bits > 0 {
        out.push(ALPHABET[((acc << (7 - bits)) & 0x7f) as usize]);
    }
    out
}

pub fn decode(text: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let mut out = Vec::with_capacity(text.len() * 7 / 8);
    let mut acc: u32 = 0;
    let mut bits: u32 = 0;

    for (offset, &symbol) in text.iter().enumerate() {
        let digit = match DECODE[symbol as usize] {
            0xFF => return Err(DecodeError::InvalidSymbol { symbol, offset }),
            d => d as u32,
        };
        acc = (acc << 7) | digit;
        bits += 7;
        if bits >= 8 {
            bits -= 8;
            out.push((acc >> bits) as u8);
        }
        acc &= (1 << bits) - 1;
    }

    if (out.len() * 8).div_ceil(7) != text.len() {
        return Err(DecodeError::InvalidLength(text.len()));
    }
    if acc != 0 {
        return Err(DecodeError::TrailingBits);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alphabet_ends_in_latin1_block() {
        assert_eq!(ALPHABET[61], b'9');
        assert_eq!(ALPHABET[62], 0xBC);
        assert_eq!(ALPHABET[127], 0xFD);
    }

    #[test]
    fn test_rejects_dangling_symbol() {
        let mut text = encode(&[1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(text.len(), 8);
        text.push(b'a');
        assert_eq!(decode(&text), Err(DecodeError::InvalidLength(9)));
    }
}
