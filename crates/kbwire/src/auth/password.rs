//! Salted password digests for the MD5 and SM3 challenge methods.

use std::fmt::Write;

use hmac::{Mac, SimpleHmac};
use kbwire_core::Error;
use kbwire_core::error::ProtocolError;
use sm3::Sm3;

/// Compute the MD5 challenge response: `"md5" + md5(md5(password + user) + salt)`.
pub fn md5_password(user: &str, password: &str, salt: [u8; 4]) -> String {
    let inner = format!("{password}{user}");
    let inner_hash = md5::compute(inner.as_bytes());

    let mut outer_input = format!("{inner_hash:x}").into_bytes();
    outer_input.extend_from_slice(&salt);
    let outer_hash = md5::compute(&outer_input);

    format!("md5{outer_hash:x}")
}

/// Compute the SM3 challenge response.
///
/// Both rounds are keyed HMAC-SM3 rendered as lowercase hex: the password is
/// keyed by the user name, and that digest is keyed by the salt.
#[allow(clippy::result_large_err)]
pub fn sm3_password(user: &str, password: &str, salt: [u8; 4]) -> Result<String, Error> {
    let inner = hmac_sm3_hex(user.as_bytes(), password.as_bytes())?;
    let outer = hmac_sm3_hex(&salt, inner.as_bytes())?;
    Ok(format!("sm3{outer}"))
}

#[allow(clippy::result_large_err)]
fn hmac_sm3_hex(key: &[u8], data: &[u8]) -> Result<String, Error> {
    let mut mac = <SimpleHmac<Sm3> as Mac>::new_from_slice(key).map_err(|e| {
        Error::Protocol(ProtocolError {
            message: format!("HMAC init failed: {e}"),
            raw_data: None,
            source: None,
        })
    })?;
    mac.update(data);
    let digest = mac.finalize().into_bytes();

    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        let _ = write!(out, "{b:02x}");
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_password() {
        let hash = md5_password("postgres", "mysecretpassword", *b"abcd");
        assert!(hash.starts_with("md5"));
        assert_eq!(hash.len(), 35);
    }

    #[test]
    fn test_md5_password_known_value() {
        let inner = format!("{:x}", md5::compute(b"foobar"));
        assert_eq!(inner, "3858f62230ac3c915f300c664312c63f");
        let mut outer = inner.into_bytes();
        outer.extend_from_slice(&[1, 2, 3, 4]);
        let expected = format!("md5{:x}", md5::compute(&outer));
        assert_eq!(md5_password("bar", "foo", [1, 2, 3, 4]), expected);
    }

    #[test]
    fn test_sm3_password_shape() {
        let hash = sm3_password("system", "123456", [9, 8, 7, 6]).unwrap();
        assert!(hash.starts_with("sm3"));
        // SM3 digests are 32 bytes
        assert_eq!(hash.len(), 3 + 64);
        assert!(hash[3..].chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_sm3_password_depends_on_salt_and_user() {
        let a = sm3_password("system", "123456", [0, 0, 0, 1]).unwrap();
        let b = sm3_password("system", "123456", [0, 0, 0, 2]).unwrap();
        let c = sm3_password("other", "123456", [0, 0, 0, 1]).unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, sm3_password("system", "123456", [0, 0, 0, 1]).unwrap());
    }
}
