//! SCRAM authentication, generic over the hash primitive.
//!
//! `SCRAM-SHA-256` follows RFC 7677. `SCRAM-SM3` is the same exchange with
//! SM3 in place of SHA-256.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use hmac::digest::core_api::BlockSizeUser;
use hmac::{Mac, SimpleHmac};
use kbwire_core::Error;
use kbwire_core::error::{ConnectionError, ConnectionErrorKind, ProtocolError};
use rand::{Rng, distributions::Alphanumeric, thread_rng};
use sha2::{Digest, Sha256};
use sm3::Sm3;
use subtle::ConstantTimeEq;

/// A hash primitive and the SASL mechanism name it is advertised under.
pub trait ScramHash {
    const MECHANISM: &'static str;
    type Digest: Digest + BlockSizeUser + Clone + Sync;
}

/// SHA-256 (`SCRAM-SHA-256`)
#[derive(Debug)]
pub struct ScramSha256;

impl ScramHash for ScramSha256 {
    const MECHANISM: &'static str = "SCRAM-SHA-256";
    type Digest = Sha256;
}

/// SM3 (`SCRAM-SM3`)
#[derive(Debug)]
pub struct ScramSm3;

impl ScramHash for ScramSm3 {
    const MECHANISM: &'static str = "SCRAM-SM3";
    type Digest = Sm3;
}

pub struct ScramClient<H: ScramHash> {
    username: String,
    password: String,
    client_nonce: String,

    // Derived state, kept for verifying the server-final message
    salted_password: Option<Vec<u8>>,
    auth_message: Option<String>,

    _hash: std::marker::PhantomData<H>,
}

impl<H: ScramHash> ScramClient<H> {
    pub fn new(username: &str, password: &str) -> Self {
        let client_nonce: String = thread_rng()
            .sample_iter(&Alphanumeric)
            .take(24)
            .map(char::from)
            .collect();
        Self::with_nonce(username, password, &client_nonce)
    }

    /// Create a client with a fixed nonce.
    pub fn with_nonce(username: &str, password: &str, client_nonce: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            client_nonce: client_nonce.to_string(),
            salted_password: None,
            auth_message: None,
            _hash: std::marker::PhantomData,
        }
    }

    pub fn mechanism(&self) -> &'static str {
        H::MECHANISM
    }

    /// Generate client-first message
    pub fn client_first(&self) -> Vec<u8> {
        // gs2-header "n,," means no channel binding and no authzid
        format!("n,,n={},r={}", self.username, self.client_nonce).into_bytes()
    }

    /// Process server-first message and generate client-final
    #[allow(clippy::result_large_err)]
    pub fn process_server_first(&mut self, data: &[u8]) -> Result<Vec<u8>, Error> {
        let msg = std::str::from_utf8(data)
            .map_err(|e| protocol_error(format!("Invalid UTF-8 in SASL continue: {}", e)))?;

        let mut combined_nonce = None;
        let mut salt = None;
        let mut iterations = None;

        for part in msg.split(',') {
            if let Some(value) = part.strip_prefix("r=") {
                combined_nonce = Some(value.to_string());
            } else if let Some(value) = part.strip_prefix("s=") {
                salt = Some(
                    BASE64
                        .decode(value)
                        .map_err(|e| protocol_error(format!("Invalid base64 salt: {}", e)))?,
                );
            } else if let Some(value) = part.strip_prefix("i=") {
                iterations = Some(
                    value
                        .parse::<u32>()
                        .map_err(|e| protocol_error(format!("Invalid iterations: {}", e)))?,
                );
            }
        }

        let combined_nonce = combined_nonce.ok_or_else(|| protocol_error("Missing nonce"))?;
        let salt = salt.ok_or_else(|| protocol_error("Missing salt"))?;
        let iterations = iterations.ok_or_else(|| protocol_error("Missing iterations"))?;

        if !combined_nonce.starts_with(&self.client_nonce)
            || combined_nonce.len() == self.client_nonce.len()
        {
            return Err(protocol_error("Invalid server nonce"));
        }
        if iterations == 0 {
            return Err(protocol_error("Invalid iterations: 0"));
        }

        let mut salted_password = vec![0u8; <H::Digest as Digest>::output_size()];
        pbkdf2::pbkdf2::<SimpleHmac<H::Digest>>(
            self.password.as_bytes(),
            &salt,
            iterations,
            &mut salted_password,
        )
        .map_err(|e| protocol_error(format!("PBKDF2 failed: {}", e)))?;

        let client_first_bare = format!("n={},r={}", self.username, self.client_nonce);
        // biws = base64("n,,")
        let client_final_without_proof = format!("c=biws,r={}", combined_nonce);
        let auth_message = format!(
            "{},{},{}",
            client_first_bare, msg, client_final_without_proof
        );

        let client_key = hmac::<H>(&salted_password, b"Client Key")?;
        let stored_key = <H::Digest as Digest>::digest(&client_key);
        let client_signature = hmac::<H>(&stored_key, auth_message.as_bytes())?;

        let client_proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(a, b)| a ^ b)
            .collect();

        self.salted_password = Some(salted_password);
        self.auth_message = Some(auth_message);

        let client_final = format!(
            "{},p={}",
            client_final_without_proof,
            BASE64.encode(&client_proof)
        );
        Ok(client_final.into_bytes())
    }

    /// Verify server-final message
    #[allow(clippy::result_large_err)]
    pub fn verify_server_final(&self, data: &[u8]) -> Result<(), Error> {
        let msg = std::str::from_utf8(data)
            .map_err(|e| protocol_error(format!("Invalid UTF-8 in SASL final: {}", e)))?;

        if let Some(err) = msg.strip_prefix("e=") {
            return Err(auth_error(format!("SCRAM server error: {err}")));
        }
        let server_signature_b64 = msg
            .split(',')
            .next()
            .and_then(|v| v.strip_prefix("v="))
            .ok_or_else(|| protocol_error("Invalid server-final format"))?;

        let server_signature = BASE64
            .decode(server_signature_b64)
            .map_err(|e| protocol_error(format!("Invalid base64 server signature: {}", e)))?;

        let salted_password = self
            .salted_password
            .as_ref()
            .ok_or_else(|| protocol_error("Missing salted password state"))?;
        let auth_message = self
            .auth_message
            .as_ref()
            .ok_or_else(|| protocol_error("Missing auth message state"))?;

        let server_key = hmac::<H>(salted_password, b"Server Key")?;
        let expected_signature = hmac::<H>(&server_key, auth_message.as_bytes())?;

        if !bool::from(server_signature.as_slice().ct_eq(expected_signature.as_slice())) {
            return Err(auth_error("Server signature mismatch"));
        }
        Ok(())
    }
}

// Helpers

fn protocol_error(msg: impl Into<String>) -> Error {
    Error::Protocol(ProtocolError {
        message: msg.into(),
        raw_data: None,
        source: None,
    })
}

fn auth_error(msg: impl Into<String>) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Authentication,
        message: msg.into(),
        source: None,
    })
}

#[allow(clippy::result_large_err)]
fn hmac<H: ScramHash>(key: &[u8], data: &[u8]) -> Result<Vec<u8>, Error> {
    let mut mac = <SimpleHmac<H::Digest> as Mac>::new_from_slice(key)
        .map_err(|e| protocol_error(format!("HMAC init failed: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}
