//! Parameter encoding (`Value` → wire bytes).
//!
//! Parameters are sent in text format. Binary format is only used when the
//! connection runs with `binary_parameters`, and then only for byte strings
//! and for integers and UUIDs bound to a matching fixed-width target type.

#![allow(clippy::result_large_err)]
#![allow(clippy::cast_possible_truncation)]

use kbwire_core::error::TypeError;
use kbwire_core::{Error, Value};

use super::array::encode_array;
use super::bytea::{encode_bytea, encode_hex};
use super::oid::{self, TypeKind};
use super::timestamp::{format_date, format_time, format_timestamp};
use super::Codec;

/// Wire format of a parameter or result column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    /// Text format (human-readable strings)
    #[default]
    Text,
    /// Binary format (native big-endian representation)
    Binary,
}

impl Format {
    /// Get the format code for the wire protocol (0 = text, 1 = binary).
    #[must_use]
    pub const fn code(self) -> i16 {
        match self {
            Format::Text => 0,
            Format::Binary => 1,
        }
    }

    /// Create format from wire protocol code.
    #[must_use]
    pub const fn from_code(code: i16) -> Self {
        match code {
            1 => Format::Binary,
            _ => Format::Text,
        }
    }
}

// ==================== Text Encoding ====================

/// Encode a non-null value as text input for a parameter of `target_oid`.
///
/// `target_oid` may be 0 when the server did not describe the parameter.
pub fn encode_text(codec: &Codec, value: &Value, target_oid: u32) -> Result<Vec<u8>, Error> {
    let target = codec.kind(target_oid);
    let bytes = match value {
        Value::Null => return Err(unsupported(value, "NULL has no text form")),
        Value::Bool(b) => (if *b { "true" } else { "false" }).as_bytes().to_vec(),
        Value::TinyInt(v) => v.to_string().into_bytes(),
        Value::SmallInt(v) => v.to_string().into_bytes(),
        Value::Int(v) => v.to_string().into_bytes(),
        Value::BigInt(v) => v.to_string().into_bytes(),
        Value::Float(v) => float_text(f64::from(*v), v.to_string()),
        Value::Double(v) => float_text(*v, v.to_string()),
        Value::Decimal(s) => s.clone().into_bytes(),
        Value::Text(s) => match target {
            TypeKind::Bytea => encode_bytea(codec.server_version, s.as_bytes()),
            _ => s.clone().into_bytes(),
        },
        Value::Bytes(b) => match target {
            TypeKind::Bytea => encode_bytea(codec.server_version, b),
            TypeKind::Binary => format!("0x{}", encode_hex(b)).into_bytes(),
            _ => b.clone(),
        },
        Value::Date(days) => format_date(*days).into_bytes(),
        Value::Time(micros) => format_time(*micros).into_bytes(),
        Value::Timestamp(micros) => timestamp_text(codec, *micros, None),
        Value::TimestampTz(micros) => timestamp_text(codec, *micros, Some(0)),
        Value::Uuid(u) => format_uuid(u).into_bytes(),
        Value::Json(j) => serde_json::to_vec(j).map_err(|e| {
            Error::Type(TypeError {
                expected: "serializable JSON",
                actual: e.to_string(),
                column: None,
                rust_type: None,
            })
        })?,
        Value::Array(items) => {
            let elem_oid = match target {
                TypeKind::Array(elem) => elem,
                _ => 0,
            };
            encode_array(items, |v| encode_text(codec, v, elem_oid))?
        }
        Value::Cursor(name) => name.clone().into_bytes(),
    };
    Ok(bytes)
}

/// Encode one bound parameter. Returns its wire format and bytes
/// (`None` for NULL).
pub fn encode_param(
    codec: &Codec,
    value: &Value,
    target_oid: u32,
    binary_parameters: bool,
) -> Result<(Format, Option<Vec<u8>>), Error> {
    if value.is_null() {
        return Ok((Format::Text, None));
    }
    if binary_parameters {
        if let Some(bytes) = encode_binary(codec, value, target_oid)? {
            return Ok((Format::Binary, Some(bytes)));
        }
    }
    Ok((Format::Text, Some(encode_text(codec, value, target_oid)?)))
}

// ==================== Binary Encoding ====================

/// Binary form of `value` for `target_oid`, or `None` when the pair has no
/// binary encoding and must go as text.
pub fn encode_binary(
    codec: &Codec,
    value: &Value,
    target_oid: u32,
) -> Result<Option<Vec<u8>>, Error> {
    if let Value::Bytes(b) = value {
        return Ok(Some(b.clone()));
    }
    let bytes = match (codec.kind(target_oid), value.as_i64()) {
        (TypeKind::Int2, Some(v)) if !matches!(value, Value::Bool(_)) => i16::try_from(v)
            .map_err(|_| out_of_range(value, "int2"))?
            .to_be_bytes()
            .to_vec(),
        (TypeKind::Int4, Some(v)) if !matches!(value, Value::Bool(_)) => i32::try_from(v)
            .map_err(|_| out_of_range(value, "int4"))?
            .to_be_bytes()
            .to_vec(),
        (TypeKind::Int8, Some(v)) if !matches!(value, Value::Bool(_)) && target_oid != oid::OID => {
            v.to_be_bytes().to_vec()
        }
        (TypeKind::Uuid, _) => match value {
            Value::Uuid(u) => u.to_vec(),
            _ => return Ok(None),
        },
        _ => return Ok(None),
    };
    Ok(Some(bytes))
}

// ==================== Helper Functions ====================

fn float_text(v: f64, shortest: String) -> Vec<u8> {
    if v.is_nan() {
        b"NaN".to_vec()
    } else if v.is_infinite() {
        if v > 0.0 { b"Infinity".to_vec() } else { b"-Infinity".to_vec() }
    } else {
        shortest.into_bytes()
    }
}

fn timestamp_text(codec: &Codec, micros: i64, offset: Option<i32>) -> Vec<u8> {
    if let Some((negative, positive)) = codec.config.infinity() {
        if micros <= negative {
            return b"-infinity".to_vec();
        }
        if micros >= positive {
            return b"infinity".to_vec();
        }
    }
    format_timestamp(micros, offset).into_bytes()
}

/// Hyphenated lowercase UUID.
pub fn format_uuid(u: &[u8; 16]) -> String {
    let hex = encode_hex(u);
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

fn unsupported(value: &Value, why: &str) -> Error {
    Error::Type(TypeError {
        expected: "encodable value",
        actual: format!("{}: {}", value.type_name(), why),
        column: None,
        rust_type: None,
    })
}

fn out_of_range(value: &Value, target: &'static str) -> Error {
    Error::Type(TypeError {
        expected: target,
        actual: format!("{value:?} out of range"),
        column: None,
        rust_type: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CodecConfig, Dialect};

    fn codec(server_version: i32) -> Codec {
        Codec::new(Dialect::Oracle, server_version, CodecConfig::default())
    }

    fn text(v: Value, oid: u32) -> String {
        String::from_utf8(encode_text(&codec(120_000), &v, oid).unwrap()).unwrap()
    }

    #[test]
    fn test_format_codes() {
        assert_eq!(Format::Text.code(), 0);
        assert_eq!(Format::Binary.code(), 1);
        assert_eq!(Format::from_code(1), Format::Binary);
        assert_eq!(Format::from_code(7), Format::Text);
    }

    #[test]
    fn test_scalars() {
        assert_eq!(text(Value::Bool(true), 0), "true");
        assert_eq!(text(Value::BigInt(-42), 0), "-42");
        assert_eq!(text(Value::Double(0.1), 0), "0.1");
        assert_eq!(text(Value::Double(1e20), 0), "100000000000000000000");
        assert_eq!(text(Value::Double(f64::NEG_INFINITY), 0), "-Infinity");
        assert_eq!(text(Value::Float(f32::NAN), 0), "NaN");
        assert_eq!(text(Value::Decimal("12.50".into()), 0), "12.50");
        assert_eq!(text(Value::Cursor("c1".into()), 0), "c1");
    }

    #[test]
    fn test_bytes_depend_on_target() {
        assert_eq!(text(Value::Bytes(vec![1, 0xff]), oid::BYTEA), "\\x01ff");
        assert_eq!(text(Value::Bytes(vec![1, 0xff]), oid::VARBINARY), "0x01ff");
        assert_eq!(text(Value::Text("ab".into()), oid::BYTEA), "\\x6162");
        assert_eq!(text(Value::Text("ab".into()), oid::TEXT), "ab");

        let old = encode_text(&codec(80_400), &Value::Bytes(vec![b'\\', 1]), oid::BYTEA).unwrap();
        assert_eq!(old, b"\\\\\\001".to_vec());
    }

    #[test]
    fn test_dates_and_uuid() {
        assert_eq!(text(Value::Date(0), 0), "1970-01-01");
        assert_eq!(text(Value::Time(3_600_000_000), 0), "01:00:00");
        assert_eq!(text(Value::Timestamp(1_500_000), 0), "1970-01-01 00:00:01.5");
        assert_eq!(text(Value::TimestampTz(0), 0), "1970-01-01 00:00:00+00:00");
        let u = [
            0x55, 0x0e, 0x84, 0x00, 0xe2, 0x9b, 0x41, 0xd4, 0xa7, 0x16, 0x44, 0x66, 0x55, 0x44,
            0x00, 0x00,
        ];
        assert_eq!(text(Value::Uuid(u), 0), "550e8400-e29b-41d4-a716-446655440000");
    }

    #[test]
    fn test_infinity_sentinels() {
        let cfg = CodecConfig::new().with_infinity(-100, 100).unwrap();
        let c = Codec::new(Dialect::Oracle, 120_000, cfg);
        assert_eq!(encode_text(&c, &Value::Timestamp(-100), 0).unwrap(), b"-infinity");
        assert_eq!(encode_text(&c, &Value::TimestampTz(500), 0).unwrap(), b"infinity");
        assert_eq!(
            encode_text(&c, &Value::Timestamp(0), 0).unwrap(),
            b"1970-01-01 00:00:00"
        );
    }

    #[test]
    fn test_arrays() {
        let v = Value::Array(vec![Value::Int(1), Value::Null, Value::Int(3)]);
        assert_eq!(text(v, oid::INT4_ARRAY), "{1,NULL,3}");
        let v = Value::Array(vec![Value::Text("a,b".into())]);
        assert_eq!(text(v, oid::TEXT_ARRAY), "{\"a,b\"}");
        assert_eq!(text(Value::Array(vec![]), 0), "{}");
    }

    #[test]
    fn test_param_formats() {
        let c = codec(120_000);
        let (f, b) = encode_param(&c, &Value::Bytes(vec![1, 2]), oid::BYTEA, true).unwrap();
        assert_eq!((f, b), (Format::Binary, Some(vec![1, 2])));

        let (f, b) = encode_param(&c, &Value::Int(7), oid::INT8, true).unwrap();
        assert_eq!((f, b), (Format::Binary, Some(7_i64.to_be_bytes().to_vec())));

        let (f, b) = encode_param(&c, &Value::Int(7), oid::INT8, false).unwrap();
        assert_eq!((f, b), (Format::Text, Some(b"7".to_vec())));

        let (f, b) = encode_param(&c, &Value::Text("x".into()), oid::TEXT, true).unwrap();
        assert_eq!((f, b), (Format::Text, Some(b"x".to_vec())));

        assert_eq!(encode_param(&c, &Value::Null, 0, true).unwrap(), (Format::Text, None));
        assert!(encode_param(&c, &Value::BigInt(1 << 40), oid::INT4, true).is_err());
    }
}
