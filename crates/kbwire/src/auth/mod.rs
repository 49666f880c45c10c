//! Authentication methods.
//!
//! The server picks the method with the code of its first `R` message:
//! cleartext (3), MD5 (5), SASL (10) or SM3 (13). SASL negotiates one of
//! the SCRAM mechanisms in [`scram`].

pub mod password;
pub mod scram;

pub use password::{md5_password, sm3_password};
pub use scram::{ScramClient, ScramHash, ScramSha256, ScramSm3};
