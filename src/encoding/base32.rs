//! Lower-case Base32 without padding.
//!
//! This is the fallback codec for every path: it survives resolvers that
//! fold or randomise case, because decoding maps upper case back.

use data_encoding::{DecodeKind, Encoding, Specification};
use std::sync::OnceLock;

use crate::error::DecodeError;

pub const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz012345";

fn engine() -> &'static Encoding {
    static ENGINE: OnceLock<Encoding> = OnceLock::new();
    ENGINE.get_or_init(|| {
        let mut spec = Specification::new();
        spec.symbols.push_str("abcdefghijklmnopqrstuvwxyz012345");
        spec.translate.from.push_str("ABCDEFGHIJKLMNOPQRSTUVWXYZ");
        spec.translate.to.push_str("abcdefghijklmnopqrstuvwxyz");
        spec.encoding().expect("static base32 specification is valid")
    })
}

pub fn encode(data: &[u8]) -> Vec<u8> {
    engine().encode(data).into_bytes()
}

pub fn decode(text: &[u8]) -> Result<Vec<u8>, DecodeError> {
    engine().decode(text).map_err(|e| match e.kind {
        DecodeKind::Symbol => DecodeError::InvalidSymbol {
            symbol: text.get(e.position).copied().unwrap_or(0),
            offset: e.position,
        },
        DecodeKind::Trailing => DecodeError::TrailingBits,
        _ => DecodeError::InvalidLength(text.len()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vector() {
        assert_eq!(encode(b"foobar"), b"mzxw4ytboi".to_vec());
        assert_eq!(decode(b"MZXW4YTBOI").unwrap(), b"foobar");
    }

    #[test]
    fn test_misgrouped_input() {
        // 1, 3 and 6 trailing symbols never come out of the encoder
        assert_eq!(decode(b"m"), Err(DecodeError::InvalidLength(1)));
        assert_eq!(decode(b"mzx"), Err(DecodeError::InvalidLength(3)));
    }
}
