//! Result cursors.
//!
//! [`Rows`] reads rows lazily from the connection's message stream. It holds
//! the connection mutably for its whole life, so no other statement can be
//! issued until the cursor is exhausted, closed or dropped.

#![allow(clippy::result_large_err)]

use std::sync::Arc;

use kbwire_core::{ColumnInfo, Error, Result, Row};

use crate::connection::{KbConnection, error_from_server, parse_complete};
use crate::protocol::{BackendMessage, FieldDescription};
use crate::types::Format;

/// Outcome of a statement that does not return rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecResult {
    /// Rows reported by the command tag
    pub rows_affected: u64,
    /// First column of the `RETURNING *` row, when last-insert-id capture is
    /// enabled and that column is an `int4`
    pub last_insert_id: Option<i64>,
}

/// Column metadata for one result set.
#[derive(Debug, Clone, Default)]
pub struct ResultHeader {
    pub fields: Vec<FieldDescription>,
    /// Wire format of each column
    pub formats: Vec<Format>,
    pub columns: Arc<ColumnInfo>,
}

impl ResultHeader {
    /// Header from a RowDescription, with formats as the server reported them.
    pub fn from_fields(fields: Vec<FieldDescription>) -> Self {
        let formats = fields.iter().map(|f| Format::from_code(f.format)).collect();
        Self::with_formats(fields, formats)
    }

    pub fn with_formats(fields: Vec<FieldDescription>, formats: Vec<Format>) -> Self {
        let names = fields.iter().map(|f| f.name.clone()).collect();
        Self {
            fields,
            formats,
            columns: Arc::new(ColumnInfo::new(names)),
        }
    }
}

/// Cursor state handed from the query path to [`Rows`].
#[derive(Debug, Default)]
pub(crate) struct RowsState {
    pub(crate) header: ResultHeader,
    /// ReadyForQuery has been consumed
    pub(crate) done: bool,
    /// The current result set has ended
    set_done: bool,
    pub(crate) result: ExecResult,
    pub(crate) tag: String,
    /// Header of the following result set, once seen
    next: Option<ResultHeader>,
    /// Server error waiting for its ReadyForQuery
    pending: Option<Error>,
}

impl RowsState {
    pub(crate) fn new(header: ResultHeader) -> Self {
        Self {
            header,
            ..Self::default()
        }
    }
}

/// A lazily read result.
///
/// Iterating yields `Result<Row>`. Dropping the cursor early drains the rest
/// of the response so the connection stays usable.
pub struct Rows<'c> {
    conn: &'c mut KbConnection,
    state: RowsState,
}

impl std::fmt::Debug for Rows<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rows")
            .field("columns", &self.columns())
            .field("done", &self.state.done)
            .finish_non_exhaustive()
    }
}

impl<'c> Rows<'c> {
    pub(crate) fn new(conn: &'c mut KbConnection, state: RowsState) -> Self {
        Self { conn, state }
    }

    /// Column names of the current result set.
    pub fn columns(&self) -> &[String] {
        self.state.header.columns.names()
    }

    pub fn column_info(&self) -> Arc<ColumnInfo> {
        Arc::clone(&self.state.header.columns)
    }

    /// Server metadata of each column: type OID, size and modifier.
    pub fn column_types(&self) -> &[FieldDescription] {
        &self.state.header.fields
    }

    /// Command word of the last CommandComplete seen, e.g. `SELECT`.
    pub fn tag(&self) -> &str {
        &self.state.tag
    }

    /// Row count of the last CommandComplete seen.
    pub fn result(&self) -> ExecResult {
        self.state.result
    }

    /// Fetch the next row of the current result set.
    pub fn next_row(&mut self) -> Result<Option<Row>> {
        if self.state.set_done || self.state.done {
            return Ok(None);
        }
        let result = self.read_next(false);
        self.conn.classify(result)
    }

    /// Whether another result set follows the current one.
    ///
    /// Only known once the current set has been read to its end.
    pub fn has_next_result_set(&self) -> bool {
        self.state.next.is_some() && !self.state.done
    }

    /// Move to the next result set. Returns `false` when there is none.
    pub fn next_result_set(&mut self) -> Result<bool> {
        // Finish the current set first so its successor's header is known
        while self.next_row()?.is_some() {}
        match self.state.next.take() {
            Some(header) if !self.state.done => {
                self.state.header = header;
                self.state.set_done = false;
                self.state.result = ExecResult::default();
                self.state.tag.clear();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Collect every remaining row of the current result set, then drain.
    pub fn fetch_all(mut self) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next_row()? {
            rows.push(row);
        }
        self.drain()?;
        Ok(rows)
    }

    /// Discard what is left of the response, surfacing any server error.
    pub fn close(mut self) -> Result<()> {
        self.drain()
    }

    fn drain(&mut self) -> Result<()> {
        while !self.state.done {
            if let Some(header) = self.state.next.take() {
                self.state.header = header;
            }
            self.state.set_done = false;
            let result = self.read_next(true);
            self.conn.classify(result)?;
        }
        Ok(())
    }

    fn read_next(&mut self, discard: bool) -> Result<Option<Row>> {
        loop {
            match self.conn.recv1()? {
                BackendMessage::DataRow(_) if discard => {}
                BackendMessage::DataRow(values) => {
                    let row = self.conn.decode_row(&self.state.header, values)?;
                    return Ok(Some(row));
                }
                BackendMessage::CommandComplete(tag) => {
                    let (result, command) = parse_complete(&tag)?;
                    self.state.result = result;
                    self.state.tag = command;
                }
                BackendMessage::EmptyQueryResponse | BackendMessage::NoData => {}
                BackendMessage::RowDescription(fields) => {
                    self.state.next = Some(ResultHeader::from_fields(fields));
                    self.state.set_done = true;
                    return Ok(None);
                }
                BackendMessage::ErrorResponse(e) => {
                    self.state.pending = Some(error_from_server(e, None));
                }
                BackendMessage::ReadyForQuery(status) => {
                    self.conn.set_transaction_status(status);
                    self.state.done = true;
                    return match self.state.pending.take() {
                        Some(err) => Err(err),
                        None => Ok(None),
                    };
                }
                other => {
                    return Err(Error::protocol(format!(
                        "unexpected message '{}' after execute",
                        char::from(other.tag())
                    )));
                }
            }
        }
    }
}

impl Iterator for Rows<'_> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_row().transpose()
    }
}

impl Drop for Rows<'_> {
    fn drop(&mut self) {
        if self.state.done || self.conn.is_bad() {
            return;
        }
        if let Err(e) = self.drain() {
            tracing::debug!(error = %e, "error while draining dropped result");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &str, type_oid: u32, format: i16) -> FieldDescription {
        FieldDescription {
            name: name.to_string(),
            table_oid: 0,
            column_id: 0,
            type_oid,
            type_size: 4,
            type_modifier: -1,
            format,
        }
    }

    #[test]
    fn test_header_from_fields() {
        let header = ResultHeader::from_fields(vec![field("id", 23, 1), field("name", 25, 0)]);
        assert_eq!(header.formats, vec![Format::Binary, Format::Text]);
        assert_eq!(header.columns.names(), &["id".to_string(), "name".to_string()]);
        assert_eq!(header.columns.index_of("name"), Some(1));
    }

    #[test]
    fn test_empty_header() {
        let header = ResultHeader::default();
        assert!(header.fields.is_empty());
        assert!(header.columns.is_empty());
    }

    #[test]
    fn test_exec_result_default() {
        let result = ExecResult::default();
        assert_eq!(result.rows_affected, 0);
        assert_eq!(result.last_insert_id, None);
    }
}
