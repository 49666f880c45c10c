//! Array literal codec: `{a,"b c",NULL}`.
//!
//! Parsing understands nested braces so that multi-dimensional input can be
//! detected and rejected; only one-dimensional arrays convert to values.

#![allow(clippy::result_large_err)]

use kbwire_core::error::{TypeError, UsageErrorKind};
use kbwire_core::{Error, Value};

/// A parsed array literal: per-dimension lengths and the flattened elements.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedArray {
    pub dims: Vec<usize>,
    pub elems: Vec<Option<Vec<u8>>>,
}

/// Parse an array literal using the given element delimiter.
pub fn parse_array(src: &[u8], delim: &[u8]) -> Result<ParsedArray, Error> {
    if src.first() != Some(&b'{') {
        return Err(array_error("unable to parse array; expected '{' at offset 0"));
    }

    let mut depth = 0;
    let mut i = 0;
    while src.get(i) == Some(&b'{') {
        depth += 1;
        i += 1;
    }

    if src.get(i) == Some(&b'}') {
        // Empty array; the remaining braces must all close.
        while depth > 0 {
            if src.get(i) != Some(&b'}') {
                return Err(array_error(format!("expected '}}' at offset {i}")));
            }
            depth -= 1;
            i += 1;
        }
        if i < src.len() {
            return Err(unexpected(src, i));
        }
        return Ok(ParsedArray::default());
    }

    let mut dims = vec![0_usize; depth];
    let mut elems = Vec::new();

    'element: loop {
        // One element, possibly preceded by opening braces of nested arrays.
        'scan: while i < src.len() {
            match src[i] {
                b'{' => {
                    if dims.len() == depth {
                        break 'scan;
                    }
                    depth += 1;
                    dims[depth - 1] = 0;
                    i += 1;
                }
                b'"' => {
                    let mut elem = Vec::new();
                    let mut escape = false;
                    i += 1;
                    while i < src.len() {
                        let c = src[i];
                        i += 1;
                        if escape {
                            elem.push(c);
                            escape = false;
                        } else if c == b'\\' {
                            escape = true;
                        } else if c == b'"' {
                            elems.push(Some(elem));
                            break 'scan;
                        } else {
                            elem.push(c);
                        }
                    }
                }
                _ => {
                    let start = i;
                    while i < src.len() {
                        if src[i..].starts_with(delim) || src[i] == b'}' {
                            let elem = &src[start..i];
                            if elem.is_empty() {
                                return Err(unexpected(src, i));
                            }
                            if elem == b"NULL" {
                                elems.push(None);
                            } else {
                                elems.push(Some(elem.to_vec()));
                            }
                            break 'scan;
                        }
                        i += 1;
                    }
                }
            }
        }

        // Delimiters and closing braces after the element.
        while i < src.len() {
            if src[i..].starts_with(delim) && depth > 0 {
                dims[depth - 1] += 1;
                i += delim.len();
                continue 'element;
            } else if src[i] == b'}' && depth > 0 {
                dims[depth - 1] += 1;
                depth -= 1;
                i += 1;
            } else {
                return Err(unexpected(src, i));
            }
        }
        break;
    }

    if depth > 0 {
        return Err(array_error(format!("expected '}}' at offset {i}")));
    }
    if dims.iter().any(|&d| d == 0 || elems.len() % d != 0) {
        return Err(array_error(
            "multidimensional arrays must have elements with matching dimensions",
        ));
    }
    Ok(ParsedArray { dims, elems })
}

/// Parse a one-dimensional array, rejecting nested input.
pub fn parse_linear_array(
    src: &[u8],
    delim: &[u8],
    target: &str,
) -> Result<Vec<Option<Vec<u8>>>, Error> {
    let parsed = parse_array(src, delim)?;
    if parsed.dims.len() > 1 {
        let shape: String = parsed.dims.iter().map(|d| format!("[{d}]")).collect();
        return Err(Error::usage(
            UsageErrorKind::ArrayDimensions,
            format!("cannot convert ARRAY{shape} to {target}"),
        ));
    }
    Ok(parsed.elems)
}

/// Append `elem` wrapped in double quotes, escaping `"` and `\`.
pub fn append_quoted(out: &mut Vec<u8>, elem: &[u8]) {
    out.push(b'"');
    for &c in elem {
        if c == b'"' || c == b'\\' {
            out.push(b'\\');
        }
        out.push(c);
    }
    out.push(b'"');
}

/// Encode a one-dimensional array of values as a literal.
///
/// `element_text` renders one non-null scalar to its text form.
pub fn encode_array<F>(values: &[Value], mut element_text: F) -> Result<Vec<u8>, Error>
where
    F: FnMut(&Value) -> Result<Vec<u8>, Error>,
{
    let mut out = Vec::with_capacity(2 + values.len() * 4);
    out.push(b'{');
    for (n, value) in values.iter().enumerate() {
        if n > 0 {
            out.push(b',');
        }
        match value {
            Value::Null => out.extend_from_slice(b"NULL"),
            Value::Array(_) => {
                return Err(Error::usage(
                    UsageErrorKind::ArrayDimensions,
                    "multidimensional arrays are not supported",
                ));
            }
            Value::Bool(b) => out.push(if *b { b't' } else { b'f' }),
            Value::TinyInt(_)
            | Value::SmallInt(_)
            | Value::Int(_)
            | Value::BigInt(_)
            | Value::Float(_)
            | Value::Double(_) => out.extend_from_slice(&element_text(value)?),
            Value::Bytes(b) => {
                let mut hex = b"\\x".to_vec();
                hex.extend_from_slice(super::bytea::encode_hex(b).as_bytes());
                append_quoted(&mut out, &hex);
            }
            other => append_quoted(&mut out, &element_text(other)?),
        }
    }
    out.push(b'}');
    Ok(out)
}

fn unexpected(src: &[u8], i: usize) -> Error {
    array_error(format!(
        "unable to parse array; unexpected {:?} at offset {}",
        src.get(i).map_or('\0', |&c| c as char),
        i
    ))
}

fn array_error(actual: impl Into<String>) -> Error {
    Error::Type(TypeError {
        expected: "array",
        actual: actual.into(),
        column: None,
        rust_type: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn text(v: &Value) -> Result<Vec<u8>, Error> {
        Ok(match v {
            Value::Text(s) => s.clone().into_bytes(),
            Value::BigInt(i) => i.to_string().into_bytes(),
            Value::Int(i) => i.to_string().into_bytes(),
            Value::Double(f) => f.to_string().into_bytes(),
            _ => unreachable!(),
        })
    }

    fn elems(list: &[Option<&str>]) -> Vec<Option<Vec<u8>>> {
        list.iter().map(|e| e.map(|s| s.as_bytes().to_vec())).collect()
    }

    #[test]
    fn test_parse_linear() {
        let p = parse_array(b"{a,\"b,c\",NULL,\"NULL\",\"q\\\"x\"}", b",").unwrap();
        assert_eq!(p.dims, vec![5]);
        assert_eq!(
            p.elems,
            elems(&[Some("a"), Some("b,c"), None, Some("NULL"), Some("q\"x")])
        );
    }

    #[test]
    fn test_parse_empty() {
        assert_eq!(parse_array(b"{}", b",").unwrap(), ParsedArray::default());
        assert_eq!(parse_array(b"{{}}", b",").unwrap(), ParsedArray::default());
    }

    #[test]
    fn test_parse_two_dimensional() {
        let p = parse_array(b"{{1,2},{3,4},{5,6}}", b",").unwrap();
        assert_eq!(p.dims, vec![3, 2]);
        assert_eq!(p.elems.len(), 6);

        let err = parse_linear_array(b"{{1,2},{3,4}}", b",", "Vec<i64>").unwrap_err();
        assert!(err.to_string().contains("cannot convert ARRAY[2][2] to Vec<i64>"));
    }

    #[test]
    fn test_parse_alternate_delimiter() {
        let p = parse_array(b"{(0,0),(1,1);(2,2),(3,3)}", b";").unwrap();
        assert_eq!(p.elems, elems(&[Some("(0,0),(1,1)"), Some("(2,2),(3,3)")]));
    }

    #[test]
    fn test_parse_errors() {
        assert!(
            parse_array(b"1,2", b",")
                .unwrap_err()
                .to_string()
                .contains("expected '{' at offset 0")
        );
        assert!(parse_array(b"{1,2", b",").unwrap_err().to_string().contains("expected '}'"));
        assert!(parse_array(b"{1,,2}", b",").unwrap_err().to_string().contains("unexpected"));
        assert!(parse_array(b"{1}x", b",").is_err());
        assert!(
            parse_array(b"{{1,2},{3}}", b",")
                .unwrap_err()
                .to_string()
                .contains("matching dimensions")
        );
        assert!(parse_array(b"{\"open", b",").is_err());
    }

    #[test]
    fn test_encode() {
        assert_eq!(encode_array(&[], text).unwrap(), b"{}".to_vec());
        let v = vec![
            Value::Text("a b".into()),
            Value::Null,
            Value::Text("q\"\\".into()),
        ];
        assert_eq!(encode_array(&v, text).unwrap(), b"{\"a b\",NULL,\"q\\\"\\\\\"}".to_vec());
        assert_eq!(
            encode_array(&[Value::Bool(true), Value::Bool(false)], text).unwrap(),
            b"{t,f}".to_vec()
        );
        assert_eq!(
            encode_array(&[Value::Bytes(vec![0xab])], text).unwrap(),
            b"{\"\\\\xab\"}".to_vec()
        );
        assert!(encode_array(&[Value::Array(vec![])], text).is_err());
    }

    proptest! {
        #[test]
        fn test_text_round_trip(items in prop::collection::vec(prop::option::of(".*"), 0..8)) {
            let values: Vec<Value> = items
                .iter()
                .map(|i| i.clone().map_or(Value::Null, Value::Text))
                .collect();
            let literal = encode_array(&values, text).unwrap();
            let parsed = parse_linear_array(&literal, b",", "Vec<String>").unwrap();
            let expected: Vec<Option<Vec<u8>>> =
                items.iter().map(|i| i.clone().map(String::into_bytes)).collect();
            prop_assert_eq!(parsed, expected);
        }

        #[test]
        fn test_int_round_trip(items in prop::collection::vec(any::<i64>(), 0..8)) {
            let values: Vec<Value> = items.iter().copied().map(Value::BigInt).collect();
            let literal = encode_array(&values, text).unwrap();
            let parsed = parse_linear_array(&literal, b",", "Vec<i64>").unwrap();
            let back: Vec<i64> = parsed
                .into_iter()
                .map(|e| String::from_utf8(e.unwrap()).unwrap().parse().unwrap())
                .collect();
            prop_assert_eq!(back, items);
        }
    }
}
