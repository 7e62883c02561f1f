//! Hostname construction helpers
//!
//! Payload text is split into labels of at most 60 characters (below the
//! 63-octet protocol limit, leaving headroom for resolvers that count
//! differently) and the whole name must stay within 253 octets.

use crate::error::{Result, TunnelError};

/// Maximum total name length, excluding the root dot (RFC 1035)
pub const MAX_NAME_LEN: usize = 253;

/// Longest run of characters placed in one label
pub const MAX_LABEL_LEN: usize = 60;

/// Insert a `.` after every 60 contiguous non-separator characters
pub fn dotify(text: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len() + text.len() / MAX_LABEL_LEN + 1);
    let mut run = 0;
    for &c in text {
        if c == b'.' {
            run = 0;
        } else {
            if run == MAX_LABEL_LEN {
                out.push(b'.');
                run = 0;
            }
            run += 1;
        }
        out.push(c);
    }
    out
}

/// Remove every label separator
pub fn undotify(text: &[u8]) -> Vec<u8> {
    text.iter().copied().filter(|&c| c != b'.').collect()
}

/// Length of `len` undotted characters once split into labels
pub fn dotted_len(len: usize) -> usize {
    if len == 0 {
        0
    } else {
        len + (len - 1) / MAX_LABEL_LEN
    }
}

/// Largest number of characters that still fit in `available` octets after
/// label splitting
pub fn max_text_len(available: usize) -> usize {
    let mut len = available;
    while len > 0 && dotted_len(len) > available {
        len -= 1;
    }
    len
}

/// Room left for payload text in front of `.<domain>`
pub fn available_for(domain: &str) -> usize {
    MAX_NAME_LEN.saturating_sub(domain.len() + 1)
}

/// Lower-case a configured domain and drop any trailing root dot
pub fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Build `<text re-split into labels>.<domain>`, enforcing the name ceiling
pub fn build_hostname(text: &[u8], domain: &str) -> Result<Vec<u8>> {
    let mut name = dotify(text);
    name.push(b'.');
    name.extend_from_slice(domain.as_bytes());

    if name.len() > MAX_NAME_LEN {
        return Err(TunnelError::NameTooLong {
            len: name.len(),
            max: MAX_NAME_LEN,
        });
    }
    Ok(name)
}

/// Return the part of `name` in front of `.<domain>`, ignoring case and a
/// trailing root dot
pub fn strip_domain<'a>(name: &'a [u8], domain: &str) -> Option<&'a [u8]> {
    let name = name.strip_suffix(b".").unwrap_or(name);
    let suffix = domain.as_bytes();
    if name.len() <= suffix.len() + 1 {
        return None;
    }
    let split = name.len() - suffix.len();
    if name[split - 1] != b'.' || !name[split..].eq_ignore_ascii_case(suffix) {
        return None;
    }
    Some(&name[..split - 1])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dotify_splits_long_runs() {
        let text = vec![b'a'; 130];
        let dotted = dotify(&text);
        let labels: Vec<&[u8]> = dotted.split(|&c| c == b'.').collect();
        assert_eq!(labels.iter().map(|l| l.len()).collect::<Vec<_>>(), vec![60, 60, 10]);
        assert_eq!(dotted.len(), dotted_len(130));
        assert_eq!(undotify(&dotted), text);
    }

    #[test]
    fn test_dotify_respects_existing_separators() {
        let mut text = vec![b'x'; 30];
        text.push(b'.');
        text.extend(vec![b'y'; 61]);
        let dotted = dotify(&text);
        assert_eq!(dotted.iter().filter(|&&c| c == b'.').count(), 2);
    }

    #[test]
    fn test_max_text_len() {
        for available in [1, 60, 61, 62, 122, 200, 240] {
            let len = max_text_len(available);
            assert!(dotted_len(len) <= available);
            assert!(dotted_len(len + 1) > available);
        }
    }

    #[test]
    fn test_build_hostname_limit() {
        let domain = "t.example.org";
        let fits = max_text_len(available_for(domain));
        assert_eq!(build_hostname(&vec![b'a'; fits], domain).unwrap().len(), MAX_NAME_LEN);
        assert!(matches!(
            build_hostname(&vec![b'a'; fits + 1], domain),
            Err(TunnelError::NameTooLong { .. })
        ));
    }

    #[test]
    fn test_strip_domain() {
        assert_eq!(strip_domain(b"abc.T.Example.ORG.", "t.example.org"), Some(&b"abc"[..]));
        assert_eq!(strip_domain(b"abc.xt.example.org", "t.example.org"), None);
        assert_eq!(strip_domain(b"t.example.org", "t.example.org"), None);
    }
}
