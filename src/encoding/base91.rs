//! basE91 with `-` standing in for `.` in the symbol table.

use super::decode_table;
use crate::error::DecodeError;

pub const ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789!#$%&()*+,-/:;<=>?@[]^_`{|}~\"";

const DECODE: [u8; 256] = decode_table(ALPHABET);

pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() * 16 / 13 + 2);
    let mut queue: u32 = 0;
    let mut bits: u32 = 0;

    for &byte in data {
        queue |= (byte as u32) << bits;
        bits += 8;
        if bits > 13 {
            let mut value = queue & 8191;
            if value > 88 {
                queue >>= 13;
                bits -= 13;
            } else {
                value = queue & 16383;
                queue >>= 14;
                bits -= 14;
            }
            out.push(ALPHABET[(value % 91) as usize]);
            out.push(ALPHABET[(value / 91) as usize]);
        }
    }

    if bits > 0 {
        out.push(ALPHABET[(queue % 91) as usize]);
        if bits > 7 || queue > 90 {
            out.push(ALPHABET[(queue / 91) as usize]);
        }
    }
    out
}

pub fn decode(text: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let mut out = Vec::with_capacity(text.len() * 13 / 16 + 1);
    let mut queue: u32 = 0;
    let mut bits: u32 = 0;
    let mut pending: Option<u32> = None;

    for (offset, &symbol) in text.iter().enumerate() {
        let digit = match DECODE[symbol as usize] {
            0xFF => return Err(DecodeError::InvalidSymbol { symbol, offset }),
            d => d as u32,
        };

        match pending.take() {
            None => pending = Some(digit),
            Some(low) => {
                let value = low + digit * 91;
                queue |= value << bits;
                bits += if value & 8191 > 88 { 13 } else { 14 };
                loop {
                    out.push(queue as u8);
                    queue >>= 8;
                    bits -= 8;
                    if bits <= 7 {
                        break;
                    }
                }
            }
        }
    }

    if let Some(low) = pending {
        out.push((queue | low << bits) as u8);
    }

    // several tails decode to the same bytes; accept only the one `encode` emits
    if encode(&out) != text {
        return Err(DecodeError::TrailingBits);
    }
    Ok(out)
}
