//! Base85 over the RFC 1924 symbol set.
//!
//! Four bytes map to five symbols. A trailing group of `n` bytes is emitted
//! as `n + 1` symbols and restored by padding with the highest digit.

use super::decode_table;
use crate::error::DecodeError;

pub const ALPHABET: &[u8] =
    b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz!#$%&()*+-;<=>?@^_`{|}~";

const DECODE: [u8; 256] = decode_table(ALPHABET);

pub fn encoded_len(len: usize) -> usize {
    let rem = len % 4;
    len / 4 * 5 + if rem > 0 { rem + 1 } else { 0 }
}

pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(encoded_len(data.len()));
    for chunk in data.chunks(4) {
        let mut group = [0u8; 4];
        group[..chunk.len()].copy_from_slice(chunk);
        let mut value = u32::from_be_bytes(group);

        let mut digits = [0u8; 5];
        for digit in digits.iter_mut().rev() {
            *digit = ALPHABET[(value % 85) as usize];
            value /= 85;
        }
        out.extend_from_slice(&digits[..chunk.len() + 1]);
    }
    out
}

pub fn decode(text: &[u8]) -> Result<Vec<u8>, DecodeError> {
    if text.len() % 5 == 1 {
        return Err(DecodeError::InvalidLength(text.len()));
    }

    let mut out = Vec::with_capacity(text.len() / 5 * 4 + 3);
    for (index, chunk) in text.chunks(5).enumerate() {
        let offset = index * 5;
        let mut value: u64 = 0;
        for i in 0..5 {
            let digit = match chunk.get(i) {
                Some(&symbol) => match DECODE[symbol as usize] {
                    0xFF => {
                        return Err(DecodeError::InvalidSymbol {
                            symbol,
                            offset: offset + i,
                        })
                    }
                    d => d,
                },
                None => 84,
            };
            value = value * 85 + digit as u64;
        }
        let value = u32::try_from(value).map_err(|_| DecodeError::Overflow(offset))?;
        out.extend_from_slice(&value.to_be_bytes()[..chunk.len() - 1]);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_sizes() {
        assert_eq!(encode(&[0, 0, 0, 0]), b"00000".to_vec());
        assert_eq!(encode(&[0xff]).len(), 2);
        assert_eq!(encode(&[1, 2, 3, 4, 5]).len(), 7);
    }

    #[test]
    fn test_overflowing_group() {
        assert_eq!(decode(b"~~~~~"), Err(DecodeError::Overflow(0)));
    }

    #[test]
    fn test_single_symbol_group_is_misgrouped() {
        assert_eq!(decode(b"000001"), Err(DecodeError::InvalidLength(6)));
    }
}
