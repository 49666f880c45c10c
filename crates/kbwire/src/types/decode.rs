//! Column decoding (wire bytes → `Value`).
//!
//! Decoding is keyed by the [`TypeKind`] the connection's catalog assigns to
//! the column's OID, so the same bytes may decode differently per dialect:
//! sqlserver tinyint is unsigned, and sqlserver date/time columns are plain
//! civil values where the other modes read a timestamp.

#![allow(clippy::result_large_err)]
#![allow(clippy::cast_possible_truncation)]

use kbwire_core::error::TypeError;
use kbwire_core::{Error, Value};

use super::array::parse_linear_array;
use super::bytea::{decode_hex, parse_bytea};
use super::encode::Format;
use super::oid::{Dialect, TypeKind};
use super::timestamp::{
    MICROS_PER_DAY, ParsedTimestamp, parse_date, parse_time, parse_timestamp,
};
use super::Codec;

/// Decode a column value to a dynamic [`Value`].
///
/// # Arguments
/// * `codec` - The connection's codec context
/// * `type_oid` - The column's type OID
/// * `data` - The raw data bytes (None for NULL)
/// * `format` - Wire format (text or binary)
pub fn decode_value(
    codec: &Codec,
    type_oid: u32,
    data: Option<&[u8]>,
    format: Format,
) -> Result<Value, Error> {
    let Some(data) = data else {
        return Ok(Value::Null);
    };
    match format {
        Format::Binary => decode_binary(codec, type_oid, data),
        Format::Text => decode_text(codec, type_oid, data),
    }
}

// ==================== Binary Format ====================

fn decode_binary(codec: &Codec, type_oid: u32, data: &[u8]) -> Result<Value, Error> {
    match codec.kind(type_oid) {
        TypeKind::Bytea | TypeKind::RawBytes | TypeKind::Binary | TypeKind::Json => {
            Ok(Value::Bytes(data.to_vec()))
        }
        TypeKind::Bool => Ok(Value::Bool(fixed::<1>("bool", data)?[0] != 0)),
        TypeKind::Int2 => Ok(Value::SmallInt(i16::from_be_bytes(fixed("int2", data)?))),
        TypeKind::Int4 => Ok(Value::Int(i32::from_be_bytes(fixed("int4", data)?))),
        TypeKind::Int8 => match data.len() {
            // oid columns are four bytes wide
            4 => Ok(Value::BigInt(i64::from(u32::from_be_bytes(fixed("oid", data)?)))),
            _ => Ok(Value::BigInt(i64::from_be_bytes(fixed("int8", data)?))),
        },
        TypeKind::TinyInt => {
            if data.is_empty() || data.len() > 8 {
                return Err(binary_length_error("tinyint", 1, data.len()));
            }
            // Narrower than eight bytes means zero-extended; the value is the low byte.
            let low = data[data.len() - 1];
            Ok(tinyint(codec.dialect, low))
        }
        TypeKind::Float4 => Ok(Value::Float(f32::from_be_bytes(fixed("float4", data)?))),
        TypeKind::Float8 => Ok(Value::Double(f64::from_be_bytes(fixed("float8", data)?))),
        TypeKind::Uuid => Ok(Value::Uuid(fixed("uuid", data)?)),
        _ => Err(Error::Type(TypeError {
            expected: "binary-decodable type",
            actual: format!("don't know how to decode binary parameter of type {type_oid}"),
            column: None,
            rust_type: None,
        })),
    }
}

fn tinyint(dialect: Dialect, low: u8) -> Value {
    if dialect == Dialect::SqlServer {
        Value::SmallInt(i16::from(low))
    } else {
        Value::TinyInt(low as i8)
    }
}

// ==================== Text Format ====================

fn decode_text(codec: &Codec, type_oid: u32, data: &[u8]) -> Result<Value, Error> {
    let kind = codec.kind(type_oid);
    match kind {
        TypeKind::RawBytes => return Ok(Value::Bytes(data.to_vec())),
        TypeKind::Bytea => return parse_bytea(data).map(Value::Bytes),
        TypeKind::Binary => {
            return if data.len() > 2 {
                decode_hex(&data[2..]).map(Value::Bytes)
            } else {
                Ok(Value::Bytes(data.to_vec()))
            };
        }
        TypeKind::Unknown => {
            return Ok(match std::str::from_utf8(data) {
                Ok(s) => Value::Text(s.to_string()),
                Err(_) => Value::Bytes(data.to_vec()),
            });
        }
        _ => {}
    }

    let s = std::str::from_utf8(data).map_err(utf8_error)?;
    match kind {
        TypeKind::Text | TypeKind::TimeTz => Ok(Value::Text(s.to_string())),
        TypeKind::Json => serde_json::from_str(s)
            .map(Value::Json)
            .map_err(|e| type_error_with_source("json", s, e)),
        TypeKind::Bool => match s.as_bytes().first() {
            Some(c) => Ok(Value::Bool(*c == b't')),
            None => Err(type_error("bool", s)),
        },
        TypeKind::Int2 => s.parse().map(Value::SmallInt).map_err(|_| type_error("int2", s)),
        TypeKind::Int4 => s.parse().map(Value::Int).map_err(|_| type_error("int4", s)),
        TypeKind::Int8 => s.parse().map(Value::BigInt).map_err(|_| type_error("int8", s)),
        TypeKind::TinyInt => {
            let v: i64 = s.parse().map_err(|_| type_error("tinyint", s))?;
            Ok(tinyint(codec.dialect, v as u8))
        }
        TypeKind::Float4 => s.parse().map(Value::Float).map_err(|_| type_error("float4", s)),
        TypeKind::Float8 => s.parse().map(Value::Double).map_err(|_| type_error("float8", s)),
        TypeKind::Numeric => Ok(Value::Decimal(s.to_string())),
        TypeKind::Money => Ok(Value::Decimal(s.replace(',', ""))),
        TypeKind::Uuid => parse_uuid(s).map(Value::Uuid),
        TypeKind::Refcursor => Ok(Value::Cursor(s.to_string())),
        TypeKind::Timestamp => timestamp_value(codec, s, Value::Timestamp, |ts| {
            Ok(Value::Timestamp(ts.local_micros))
        }),
        TypeKind::TimestampTz => timestamp_value(codec, s, Value::TimestampTz, |ts| {
            Ok(Value::TimestampTz(ts.utc_micros()))
        }),
        TypeKind::Date if codec.dialect == Dialect::SqlServer => parse_date(s).map(Value::Date),
        TypeKind::Date => timestamp_value(codec, s, Value::Timestamp, |ts| {
            if ts.has_time {
                Ok(Value::Timestamp(ts.local_micros))
            } else {
                Ok(Value::Date(ts.local_micros.div_euclid(MICROS_PER_DAY) as i32))
            }
        }),
        TypeKind::Time => parse_time(s).map(|(micros, _)| Value::Time(micros)),
        TypeKind::Array(elem) => {
            let items = parse_linear_array(data, b",", "Vec<Value>")?;
            items
                .into_iter()
                .map(|item| decode_text_opt(codec, elem, item.as_deref()))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array)
        }
        TypeKind::RawBytes | TypeKind::Bytea | TypeKind::Binary | TypeKind::Unknown => {
            Ok(Value::Bytes(data.to_vec()))
        }
    }
}

fn decode_text_opt(codec: &Codec, oid: u32, data: Option<&[u8]>) -> Result<Value, Error> {
    match data {
        Some(d) => decode_text(codec, oid, d),
        None => Ok(Value::Null),
    }
}

/// Resolve the infinity tokens through `sentinel`, then hand real
/// timestamps to `build`.
fn timestamp_value<F>(
    codec: &Codec,
    s: &str,
    sentinel: fn(i64) -> Value,
    build: F,
) -> Result<Value, Error>
where
    F: FnOnce(ParsedTimestamp) -> Result<Value, Error>,
{
    let bound = match s {
        "-infinity" => codec.config.infinity().map(|(neg, _)| neg),
        "infinity" => codec.config.infinity().map(|(_, pos)| pos),
        _ => return build(parse_timestamp(s)?),
    };
    // Without sentinels the token is passed through as text.
    Ok(bound.map_or_else(|| Value::Text(s.to_string()), sentinel))
}

/// Parse a hyphenated (or bare) UUID.
pub fn parse_uuid(s: &str) -> Result<[u8; 16], Error> {
    let hex: Vec<u8> = s.bytes().filter(|&b| b != b'-').collect();
    let bytes = decode_hex(&hex).map_err(|_| type_error("uuid", s))?;
    bytes.try_into().map_err(|_| type_error("uuid", s))
}

// ==================== Helper Functions ====================

fn fixed<const N: usize>(type_name: &'static str, data: &[u8]) -> Result<[u8; N], Error> {
    data.try_into()
        .map_err(|_| binary_length_error(type_name, N, data.len()))
}

fn type_error(expected: &'static str, value: impl std::fmt::Display) -> Error {
    Error::Type(TypeError {
        expected,
        actual: format!("invalid value: {}", value),
        column: None,
        rust_type: None,
    })
}

fn type_error_with_source<E: std::error::Error>(
    expected: &'static str,
    value: impl std::fmt::Display,
    source: E,
) -> Error {
    Error::Type(TypeError {
        expected,
        actual: format!("invalid value: {} ({})", value, source),
        column: None,
        rust_type: None,
    })
}

fn binary_length_error(type_name: &'static str, expected: usize, actual: usize) -> Error {
    Error::Type(TypeError {
        expected: type_name,
        actual: format!("expected {} bytes, got {}", expected, actual),
        column: None,
        rust_type: None,
    })
}

fn utf8_error(_e: std::str::Utf8Error) -> Error {
    Error::Type(TypeError {
        expected: "valid UTF-8",
        actual: "invalid UTF-8 bytes".to_string(),
        column: None,
        rust_type: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::oid;
    use crate::types::timestamp::MICROS_PER_SEC;
    use crate::types::CodecConfig;

    fn codec(dialect: Dialect) -> Codec {
        Codec::new(dialect, 120_000, CodecConfig::default())
    }

    fn text(oid: u32, s: &str) -> Value {
        decode_value(&codec(Dialect::Oracle), oid, Some(s.as_bytes()), Format::Text).unwrap()
    }

    #[test]
    fn test_null() {
        let c = codec(Dialect::Oracle);
        assert_eq!(decode_value(&c, oid::INT4, None, Format::Binary).unwrap(), Value::Null);
    }

    #[test]
    fn test_binary_integers() {
        let c = codec(Dialect::Oracle);
        let d = |oid, data: &[u8]| decode_value(&c, oid, Some(data), Format::Binary).unwrap();
        assert_eq!(d(oid::INT4, &[0, 0, 0, 42]), Value::Int(42));
        assert_eq!(d(oid::INT2, &[0xff, 0xfe]), Value::SmallInt(-2));
        assert_eq!(d(oid::BIGINT, &7_i64.to_be_bytes()), Value::BigInt(7));
        assert_eq!(d(oid::TINYINT, &[0xff]), Value::TinyInt(-1));
        assert!(decode_value(&c, oid::INT4, Some(&[0, 1]), Format::Binary).is_err());
        assert!(decode_value(&c, oid::NUMERIC, Some(&[0, 1]), Format::Binary).is_err());
    }

    #[test]
    fn test_sqlserver_tinyint_is_unsigned() {
        let c = codec(Dialect::SqlServer);
        let v = decode_value(&c, oid::SQLSERVER_TINYINT, Some(&[0, 0, 0, 0, 0, 0, 0, 200]), Format::Binary)
            .unwrap();
        assert_eq!(v, Value::SmallInt(200));
        let v = decode_value(&c, oid::SQLSERVER_TINYINT, Some(b"255"), Format::Text).unwrap();
        assert_eq!(v, Value::SmallInt(255));
    }

    #[test]
    fn test_text_scalars() {
        assert_eq!(text(oid::BOOL, "t"), Value::Bool(true));
        assert_eq!(text(oid::BOOL, "f"), Value::Bool(false));
        assert_eq!(text(oid::INT8, "-9"), Value::BigInt(-9));
        assert_eq!(text(oid::FLOAT8, "Infinity"), Value::Double(f64::INFINITY));
        assert_eq!(text(oid::NUMERIC, "1.50"), Value::Decimal("1.50".into()));
        assert_eq!(text(oid::MONEY, "1,234.50"), Value::Decimal("1234.50".into()));
        assert_eq!(text(oid::VARCHAR, "héllo"), Value::Text("héllo".into()));
        assert_eq!(text(oid::REFCURSOR, "c1"), Value::Cursor("c1".into()));
        assert_eq!(text(oid::TIMETZ, "04:05:06+02"), Value::Text("04:05:06+02".into()));
        assert_eq!(
            text(oid::JSON, "{\"a\":1}"),
            Value::Json(serde_json::json!({"a": 1}))
        );
    }

    #[test]
    fn test_text_binary_types() {
        assert_eq!(text(oid::BYTEA, "\\x0102"), Value::Bytes(vec![1, 2]));
        assert_eq!(text(oid::VARBINARY, "0xABCD"), Value::Bytes(vec![0xab, 0xcd]));
        assert_eq!(text(oid::BLOB, "raw"), Value::Bytes(b"raw".to_vec()));
        assert_eq!(text(oid::BIT, "101"), Value::Bytes(b"101".to_vec()));
    }

    #[test]
    fn test_uuid() {
        let v = text(oid::UUID, "550e8400-e29b-41d4-a716-446655440000");
        let Value::Uuid(u) = v else { panic!("expected uuid") };
        assert_eq!(u[0], 0x55);
        assert_eq!(u[15], 0x00);
        assert!(parse_uuid("xyz").is_err());
    }

    #[test]
    fn test_timestamps() {
        assert_eq!(
            text(oid::TIMESTAMP, "1970-01-01 00:00:01"),
            Value::Timestamp(MICROS_PER_SEC)
        );
        assert_eq!(
            text(oid::TIMESTAMPTZ, "1970-01-01 01:00:00+01"),
            Value::TimestampTz(0)
        );
        assert_eq!(text(oid::TIME, "00:00:01.25"), Value::Time(1_250_000));
    }

    #[test]
    fn test_date_per_dialect() {
        assert_eq!(text(oid::ORA_DATE, "1970-01-02"), Value::Date(1));
        assert_eq!(
            text(oid::ORA_DATE, "1970-01-02 00:00:00"),
            Value::Timestamp(MICROS_PER_DAY)
        );

        let c = codec(Dialect::SqlServer);
        let v = decode_value(&c, oid::SQLSERVER_DATE, Some(b"1970-01-03"), Format::Text).unwrap();
        assert_eq!(v, Value::Date(2));
    }

    #[test]
    fn test_infinity_tokens() {
        assert_eq!(text(oid::TIMESTAMP, "infinity"), Value::Text("infinity".into()));

        let cfg = CodecConfig::new().with_infinity(-1, 1).unwrap();
        let c = Codec::new(Dialect::Oracle, 120_000, cfg);
        let v = decode_value(&c, oid::TIMESTAMPTZ, Some(b"-infinity"), Format::Text).unwrap();
        assert_eq!(v, Value::TimestampTz(-1));
    }

    #[test]
    fn test_arrays() {
        assert_eq!(
            text(oid::INT4_ARRAY, "{1,NULL,3}"),
            Value::Array(vec![Value::Int(1), Value::Null, Value::Int(3)])
        );
        assert_eq!(
            text(oid::TEXT_ARRAY, "{\"a,b\",c}"),
            Value::Array(vec![Value::Text("a,b".into()), Value::Text("c".into())])
        );
        let c = codec(Dialect::Oracle);
        let err = decode_value(&c, oid::INT4_ARRAY, Some(b"{{1},{2}}"), Format::Text).unwrap_err();
        assert!(matches!(err, Error::Usage(_)));
    }

    #[test]
    fn test_unknown_types_fall_back() {
        assert_eq!(text(999_999, "1 day"), Value::Text("1 day".into()));
    }
}
