//! Bytea text forms: `\x`-prefixed hex and the legacy octal escape format.

#![allow(clippy::result_large_err)]

use kbwire_core::Error;
use kbwire_core::error::TypeError;

/// First server version that understands hex bytea input.
pub const HEX_BYTEA_MIN_VERSION: i32 = 90_000;

/// Decode a bytea text value, detecting the sub-format by its `\x` prefix.
pub fn parse_bytea(s: &[u8]) -> Result<Vec<u8>, Error> {
    if let Some(hex) = s.strip_prefix(b"\\x") {
        return decode_hex(hex);
    }

    let mut out = Vec::with_capacity(s.len());
    let mut rest = s;
    while let Some((&first, tail)) = rest.split_first() {
        if first != b'\\' {
            out.push(first);
            rest = tail;
            continue;
        }
        if tail.first() == Some(&b'\\') {
            out.push(b'\\');
            rest = &tail[1..];
            continue;
        }
        if rest.len() < 4 {
            return Err(bytea_error(format!("invalid bytea sequence {rest:?}")));
        }
        let octal = std::str::from_utf8(&rest[1..4])
            .ok()
            .and_then(|o| u16::from_str_radix(o, 8).ok())
            .filter(|v| *v <= 0xff)
            .ok_or_else(|| {
                bytea_error(format!(
                    "could not parse bytea value: {:?}",
                    String::from_utf8_lossy(&rest[1..4])
                ))
            })?;
        out.push(octal as u8);
        rest = &rest[4..];
    }
    Ok(out)
}

/// Encode bytes as bytea text input for a server of the given version.
pub fn encode_bytea(server_version: i32, v: &[u8]) -> Vec<u8> {
    if server_version >= HEX_BYTEA_MIN_VERSION {
        let mut out = Vec::with_capacity(2 + v.len() * 2);
        out.extend_from_slice(b"\\x");
        out.extend_from_slice(encode_hex(v).as_bytes());
        return out;
    }
    let mut out = Vec::with_capacity(v.len());
    for &b in v {
        if b == b'\\' {
            out.extend_from_slice(b"\\\\");
        } else if !(0x20..=0x7e).contains(&b) {
            out.extend_from_slice(format!("\\{b:03o}").as_bytes());
        } else {
            out.push(b);
        }
    }
    out
}

/// Lowercase hex without prefix.
pub fn encode_hex(v: &[u8]) -> String {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut s = String::with_capacity(v.len() * 2);
    for &b in v {
        s.push(DIGITS[usize::from(b >> 4)] as char);
        s.push(DIGITS[usize::from(b & 0x0f)] as char);
    }
    s
}

/// Decode hex digits (either case) to bytes.
pub fn decode_hex(s: &[u8]) -> Result<Vec<u8>, Error> {
    if s.len() % 2 != 0 {
        return Err(bytea_error(format!(
            "odd length hex string {:?}",
            String::from_utf8_lossy(s)
        )));
    }
    s.chunks_exact(2)
        .map(|pair| match (nibble(pair[0]), nibble(pair[1])) {
            (Some(hi), Some(lo)) => Ok(hi << 4 | lo),
            _ => Err(bytea_error(format!(
                "invalid hex byte {:?}",
                String::from_utf8_lossy(pair)
            ))),
        })
        .collect()
}

fn nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

fn bytea_error(actual: String) -> Error {
    Error::Type(TypeError {
        expected: "bytea",
        actual,
        column: None,
        rust_type: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_bytea(b"\\x00ff10").unwrap(), vec![0x00, 0xff, 0x10]);
        assert_eq!(parse_bytea(b"\\xABcd").unwrap(), vec![0xab, 0xcd]);
        assert!(parse_bytea(b"\\x0").is_err());
        assert!(parse_bytea(b"\\xzz").is_err());
    }

    #[test]
    fn test_parse_escape() {
        assert_eq!(parse_bytea(b"ab\\\\c\\000\\377").unwrap(), b"ab\\c\x00\xff".to_vec());
        assert_eq!(parse_bytea(b"").unwrap(), Vec::<u8>::new());
        assert!(parse_bytea(b"\\0").is_err());
        assert!(parse_bytea(b"\\999").is_err());
    }

    #[test]
    fn test_encode_hex_for_new_servers() {
        assert_eq!(encode_bytea(90_000, &[0xde, 0xad]), b"\\xdead".to_vec());
        assert_eq!(encode_bytea(120_004, &[]), b"\\x".to_vec());
    }

    #[test]
    fn test_encode_escape_for_old_servers() {
        assert_eq!(
            encode_bytea(80_400, b"a\\b\x01\x7f"),
            b"a\\\\b\\001\\177".to_vec()
        );
    }

    #[test]
    fn test_escape_round_trip() {
        let all: Vec<u8> = (0..=255).collect();
        assert_eq!(parse_bytea(&encode_bytea(80_000, &all)).unwrap(), all);
        assert_eq!(parse_bytea(&encode_bytea(90_000, &all)).unwrap(), all);
    }
}
