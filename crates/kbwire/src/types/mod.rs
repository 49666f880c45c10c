//! Type system and value conversion.
//!
//! This module provides:
//! - OID constants and the per-dialect catalogs
//! - Encoding of [`Value`]s into parameter bytes
//! - Decoding of column bytes (text or binary) into [`Value`]s
//! - The array, bytea and timestamp sub-codecs
//!
//! # Example
//!
//! ```rust,ignore
//! use kbwire::types::{Codec, CodecConfig, Format, oid::{self, Dialect}};
//!
//! let codec = Codec::new(Dialect::Oracle, 120_000, CodecConfig::default());
//! let value = codec.decode(oid::INT4, Some(&[0, 0, 0, 42]), Format::Binary)?;
//! assert_eq!(value, Value::Int(42));
//! ```

#![allow(clippy::result_large_err)]

pub mod array;
pub mod bytea;
pub mod decode;
pub mod encode;
pub mod oid;
pub mod timestamp;

use kbwire_core::error::ConfigError;
use kbwire_core::{Error, Value};

pub use decode::decode_value;
pub use encode::{Format, encode_param, encode_text};
pub use oid::{Dialect, OidCatalog, TypeKind};

/// Codec settings fixed when a connection is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CodecConfig {
    infinity: Option<(i64, i64)>,
}

impl CodecConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map the `-infinity` and `infinity` timestamp tokens to the given
    /// microsecond sentinels, in both directions.
    ///
    /// Fails when infinity mapping is already enabled or when `negative` is
    /// not strictly before `positive`.
    pub fn with_infinity(mut self, negative: i64, positive: i64) -> Result<Self, Error> {
        if self.infinity.is_some() {
            return Err(config_error("infinity timestamp enabled already"));
        }
        if negative >= positive {
            return Err(config_error(
                "negative value must be smaller (before) than positive",
            ));
        }
        self.infinity = Some((negative, positive));
        Ok(self)
    }

    /// The (negative, positive) sentinels, if enabled.
    pub fn infinity(&self) -> Option<(i64, i64)> {
        self.infinity
    }
}

fn config_error(message: &str) -> Error {
    Error::Config(ConfigError {
        message: message.to_string(),
        source: None,
    })
}

/// Everything the codec needs to know about one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Codec {
    pub dialect: Dialect,
    pub catalog: OidCatalog,
    /// `server_version` as `major*10000 + minor*100 + patch`
    pub server_version: i32,
    pub config: CodecConfig,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(Dialect::default(), 0, CodecConfig::default())
    }
}

impl Codec {
    pub fn new(dialect: Dialect, server_version: i32, config: CodecConfig) -> Self {
        Self {
            dialect,
            catalog: dialect.catalog(),
            server_version,
            config,
        }
    }

    /// Classify a type OID under this connection's dialect.
    pub fn kind(&self, oid: u32) -> TypeKind {
        self.catalog.kind(oid)
    }

    /// Decode one column value.
    pub fn decode(&self, oid: u32, data: Option<&[u8]>, format: Format) -> Result<Value, Error> {
        decode_value(self, oid, data, format)
    }

    /// Encode one parameter in text format. `None` is SQL NULL.
    pub fn encode(&self, value: &Value, target_oid: u32) -> Result<Option<Vec<u8>>, Error> {
        if value.is_null() {
            return Ok(None);
        }
        encode_text(self, value, target_oid).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infinity_config() {
        let cfg = CodecConfig::new().with_infinity(-10, 10).unwrap();
        assert_eq!(cfg.infinity(), Some((-10, 10)));

        let err = cfg.with_infinity(-5, 5).unwrap_err();
        assert!(err.to_string().contains("enabled already"));

        let err = CodecConfig::new().with_infinity(5, 5).unwrap_err();
        assert!(err.to_string().contains("must be smaller"));
    }

    #[test]
    fn test_codec_uses_dialect_catalog() {
        let codec = Codec::new(Dialect::SqlServer, 120_000, CodecConfig::default());
        assert_eq!(codec.kind(oid::SQLSERVER_TINYINT), TypeKind::TinyInt);
        assert_eq!(codec.encode(&Value::Null, oid::INT4).unwrap(), None);
        assert_eq!(
            codec.encode(&Value::Int(7), oid::INT4).unwrap(),
            Some(b"7".to_vec())
        );
    }
}
