//! Modified UTF-8 strings.
//!
//! The encoding works on UTF-16 code units: NUL becomes `C0 80`, every other
//! unit takes one to three bytes, and supplementary characters are written as
//! two encoded surrogates. A plain `0x00` byte therefore never appears inside
//! an encoded string and can serve as a terminator.

use crate::error::{MuxwireError, Result};

/// Encode a string into modified UTF-8.
pub fn encode(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len());
    encode_into(s, &mut out);
    out
}

/// Append the modified UTF-8 encoding of `s` to `out`.
pub fn encode_into(s: &str, out: &mut Vec<u8>) {
    for unit in s.encode_utf16() {
        match unit {
            0x0001..=0x007F => out.push(unit as u8),
            0x0000 | 0x0080..=0x07FF => {
                out.push(0xC0 | ((unit >> 6) & 0x1F) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
            _ => {
                out.push(0xE0 | ((unit >> 12) & 0x0F) as u8);
                out.push(0x80 | ((unit >> 6) & 0x3F) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
        }
    }
}

/// Decode a complete modified UTF-8 byte string.
pub fn decode(bytes: &[u8]) -> Result<String> {
    let mut units = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let a = bytes[i];
        match a {
            0x00 => return Err(malformed("raw NUL byte")),
            0x01..=0x7F => {
                units.push(a as u16);
                i += 1;
            }
            0xC0..=0xDF => {
                let b = continuation(bytes, i + 1)?;
                units.push(((a as u16 & 0x1F) << 6) | (b as u16 & 0x3F));
                i += 2;
            }
            0xE0..=0xEF => {
                let b = continuation(bytes, i + 1)?;
                let c = continuation(bytes, i + 2)?;
                units.push(((a as u16 & 0x0F) << 12) | ((b as u16 & 0x3F) << 6) | (c as u16 & 0x3F));
                i += 3;
            }
            _ => return Err(malformed("invalid lead byte")),
        }
    }
    String::from_utf16(&units).map_err(|_| malformed("unpaired surrogate"))
}

/// Decode a NUL-terminated string from the front of `bytes`.
///
/// Returns the string and the number of bytes consumed, terminator included.
pub fn decode_terminated(bytes: &[u8]) -> Result<(String, usize)> {
    let end = bytes
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| malformed("missing NUL terminator"))?;
    Ok((decode(&bytes[..end])?, end + 1))
}

fn continuation(bytes: &[u8], index: usize) -> Result<u8> {
    match bytes.get(index) {
        Some(&b) if b & 0xC0 == 0x80 => Ok(b),
        Some(_) => Err(malformed("invalid continuation byte")),
        None => Err(malformed("truncated sequence")),
    }
}

fn malformed(what: &str) -> MuxwireError {
    MuxwireError::Protocol(format!("Malformed modified UTF-8: {}", what))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_is_unchanged() {
        assert_eq!(encode("jboss.remoting"), b"jboss.remoting");
    }

    #[test]
    fn test_nul_uses_two_bytes() {
        let encoded = encode("a\0b");
        assert_eq!(encoded, [b'a', 0xC0, 0x80, b'b']);
        assert_eq!(decode(&encoded).unwrap(), "a\0b");
    }

    #[test]
    fn test_supplementary_character_as_surrogate_pair() {
        let encoded = encode("\u{1F600}");
        // Two surrogates, three bytes each.
        assert_eq!(encoded.len(), 6);
        assert_eq!(encoded[0], 0xED);
        assert_eq!(decode(&encoded).unwrap(), "\u{1F600}");
    }

    #[test]
    fn test_two_and_three_byte_forms() {
        let s = "é€";
        let encoded = encode(s);
        assert_eq!(encoded.len(), 2 + 3);
        assert_eq!(decode(&encoded).unwrap(), s);
    }

    #[test]
    fn test_raw_nul_rejected() {
        assert!(decode(&[b'a', 0, b'b']).is_err());
    }

    #[test]
    fn test_truncated_sequence_rejected() {
        let err = decode(&[0xE2, 0x82]).unwrap_err();
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn test_decode_terminated() {
        let mut bytes = encode("svc");
        bytes.push(0);
        bytes.extend_from_slice(b"rest");
        let (s, used) = decode_terminated(&bytes).unwrap();
        assert_eq!(s, "svc");
        assert_eq!(used, 4);
    }

    #[test]
    fn test_decode_terminated_missing_nul() {
        assert!(decode_terminated(b"abc").is_err());
    }
}
