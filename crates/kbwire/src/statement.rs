//! Prepared statements.
//!
//! A [`Statement`] is created by [`KbConnection::prepare`] and parsed on the
//! server the first time it runs, when the argument types are known. Later
//! executions reuse the parsed statement and only Bind and Execute.
//!
//! [`KbConnection::prepare`]: crate::KbConnection::prepare

#![allow(clippy::result_large_err)]

use kbwire_core::error::UsageErrorKind;
use kbwire_core::{Error, Result, Value};

use crate::protocol::FieldDescription;
use crate::rows::ResultHeader;
use crate::types::{Codec, Format, oid};

/// Most parameters a single Bind message can carry.
pub const MAX_PARAMETERS: usize = 65535;

/// Marks a parameter type hint as an IN parameter.
pub const PARAM_IN_FLAG: u32 = 1 << 29;

/// A server-side prepared statement.
#[derive(Debug, Clone)]
pub struct Statement {
    pub(crate) name: String,
    pub(crate) query: String,
    pub(crate) param_types: Vec<u32>,
    pub(crate) header: ResultHeader,
    /// Result format codes sent with every Bind
    pub(crate) result_formats: Vec<i16>,
    pub(crate) prepared: bool,
    pub(crate) has_return_status: bool,
    /// The query was rewritten with `RETURNING *`
    pub(crate) is_insert: bool,
    pub(crate) closed: bool,
}

impl Statement {
    pub(crate) fn new(name: String, query: &str, has_return_status: bool) -> Self {
        Self {
            name,
            query: query.to_string(),
            param_types: Vec::new(),
            header: ResultHeader::default(),
            result_formats: Vec::new(),
            prepared: false,
            has_return_status,
            is_insert: false,
            closed: false,
        }
    }

    /// Server-side name; empty for the unnamed statement.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    /// Number of arguments the statement takes, including the return-status
    /// placeholder. `None` until the statement has been parsed.
    pub fn num_input(&self) -> Option<usize> {
        if !self.prepared {
            return None;
        }
        Some(self.param_types.len() + usize::from(self.has_return_status))
    }

    /// Parameter type OIDs reported by the server.
    pub fn param_types(&self) -> &[u32] {
        &self.param_types
    }

    /// Result columns; empty until parsed, or for statements without rows.
    pub fn columns(&self) -> &[String] {
        self.header.columns.names()
    }

    pub fn column_types(&self) -> &[FieldDescription] {
        &self.header.fields
    }

    pub fn has_return_status(&self) -> bool {
        self.has_return_status
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::usage(
                UsageErrorKind::StatementClosed,
                "statement has already been closed",
            ));
        }
        Ok(())
    }

    /// Check the argument count against the parsed statement and return the
    /// arguments to bind.
    ///
    /// With a return-status placeholder the caller passes one extra trailing
    /// argument, which is not sent.
    pub(crate) fn bind_arguments<'a>(&self, params: &'a [Value]) -> Result<&'a [Value]> {
        let expected = self.param_types.len();
        if params.len() == expected {
            return Ok(params);
        }
        if self.has_return_status && params.len() == expected + 1 {
            return Ok(&params[..expected]);
        }
        Err(Error::usage(
            UsageErrorKind::ParameterCount,
            format!("got {} parameters but the statement requires {expected}", params.len()),
        ))
    }
}

pub(crate) fn check_parameter_limit(params: &[Value]) -> Result<()> {
    if params.len() > MAX_PARAMETERS {
        return Err(Error::usage(
            UsageErrorKind::ParameterCount,
            format!(
                "got {} parameters but Kingbase only supports {MAX_PARAMETERS} parameters",
                params.len()
            ),
        ));
    }
    Ok(())
}

/// Parse type hints for the arguments: booleans and cursors are pinned,
/// everything else is left to the server. All are flagged as IN parameters.
pub(crate) fn param_type_hints(params: &[Value]) -> Vec<u32> {
    params
        .iter()
        .map(|value| {
            let hint = match value {
                Value::Bool(_) => oid::BOOL,
                Value::Cursor(_) => oid::REFCURSOR,
                _ => 0,
            };
            hint | PARAM_IN_FLAG
        })
        .collect()
}

/// Pick the wire format of each result column.
///
/// Columns whose type has a binary decoder are fetched in binary, the rest as
/// text. Returns the per-column formats and the compressed format codes for
/// Bind: empty when every column is text, a single code when every column
/// is binary.
pub fn decide_column_formats(
    codec: &Codec,
    fields: &[FieldDescription],
    force_text: bool,
) -> (Vec<Format>, Vec<i16>) {
    if fields.is_empty() {
        return (Vec::new(), Vec::new());
    }

    let formats: Vec<Format> = fields
        .iter()
        .map(|f| {
            if !force_text && codec.catalog.prefers_binary(f.type_oid) {
                Format::Binary
            } else {
                Format::Text
            }
        })
        .collect();

    let codes = if formats.iter().all(|&f| f == Format::Text) {
        Vec::new()
    } else if formats.iter().all(|&f| f == Format::Binary) {
        vec![Format::Binary.code()]
    } else {
        formats.iter().map(|f| f.code()).collect()
    };
    (formats, codes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CodecConfig, Dialect};

    fn field(type_oid: u32) -> FieldDescription {
        FieldDescription {
            name: format!("c{type_oid}"),
            table_oid: 0,
            column_id: 0,
            type_oid,
            type_size: -1,
            type_modifier: -1,
            format: 0,
        }
    }

    fn codec() -> Codec {
        Codec::new(Dialect::Oracle, 120_000, CodecConfig::default())
    }

    #[test]
    fn test_decide_column_formats() {
        let c = codec();

        let (formats, codes) = decide_column_formats(&c, &[field(oid::TEXT)], false);
        assert_eq!(formats, vec![Format::Text]);
        assert!(codes.is_empty());

        let (formats, codes) =
            decide_column_formats(&c, &[field(oid::INT8), field(oid::BYTEA)], false);
        assert_eq!(formats, vec![Format::Binary, Format::Binary]);
        assert_eq!(codes, vec![1]);

        let (formats, codes) =
            decide_column_formats(&c, &[field(oid::INT8), field(oid::TEXT)], false);
        assert_eq!(formats, vec![Format::Binary, Format::Text]);
        assert_eq!(codes, vec![1, 0]);

        let (formats, codes) =
            decide_column_formats(&c, &[field(oid::INT8), field(oid::BYTEA)], true);
        assert_eq!(formats, vec![Format::Text, Format::Text]);
        assert!(codes.is_empty());
    }

    #[test]
    fn test_param_type_hints() {
        let hints = param_type_hints(&[
            Value::Bool(true),
            Value::Cursor("c1".to_string()),
            Value::Int(1),
        ]);
        assert_eq!(
            hints,
            vec![
                oid::BOOL | PARAM_IN_FLAG,
                oid::REFCURSOR | PARAM_IN_FLAG,
                PARAM_IN_FLAG
            ]
        );
    }

    #[test]
    fn test_bind_arguments() {
        let mut stmt = Statement::new("1".to_string(), "SELECT $1", false);
        stmt.param_types = vec![oid::INT4];
        stmt.prepared = true;

        let params = [Value::Int(1)];
        assert_eq!(stmt.bind_arguments(&params).unwrap().len(), 1);
        assert!(stmt.bind_arguments(&[]).is_err());
        assert_eq!(stmt.num_input(), Some(1));

        stmt.has_return_status = true;
        let params = [Value::Int(1), Value::Null];
        assert_eq!(stmt.bind_arguments(&params).unwrap(), &[Value::Int(1)]);
        assert_eq!(stmt.num_input(), Some(2));
    }

    #[test]
    fn test_parameter_limit() {
        let params = vec![Value::Null; MAX_PARAMETERS + 1];
        let err = check_parameter_limit(&params).unwrap_err();
        assert_eq!(
            err.to_string(),
            "got 65536 parameters but Kingbase only supports 65535 parameters"
        );
        assert!(check_parameter_limit(&params[..MAX_PARAMETERS]).is_ok());
    }

    #[test]
    fn test_closed_statement() {
        let mut stmt = Statement::new(String::new(), "SELECT 1", false);
        assert!(stmt.check_open().is_ok());
        stmt.closed = true;
        assert!(matches!(
            stmt.check_open(),
            Err(Error::Usage(ref u)) if u.kind == UsageErrorKind::StatementClosed
        ));
    }
}
