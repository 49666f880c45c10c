//! Bulk loading with `COPY ... FROM STDIN`.
//!
//! [`KbConnection::prepare_copy`] sends the COPY statement and, once the
//! server accepts it, hands back a [`CopyIn`] writer. Rows are encoded in
//! the text format into a local buffer that is flushed as one CopyData
//! message whenever it grows past [`FLUSH_THRESHOLD`].
//!
//! While the COPY runs a background thread owns the read side of the socket,
//! so server errors are noticed without waiting for [`CopyIn::close`].
//!
//! ```rust,ignore
//! use kbwire::{copy_in, Value};
//!
//! conn.begin()?;
//! let mut copy = conn.prepare_copy(&copy_in("users", &["id", "name"]))?;
//! copy.write_row(&[Value::Int(1), Value::Text("alice".into())])?;
//! copy.write_row(&[Value::Int(2), Value::Null])?;
//! let copied = copy.close()?;
//! conn.commit()?;
//! ```

#![allow(clippy::result_large_err)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use kbwire_core::error::UsageErrorKind;
use kbwire_core::{Error, Result, Value};

use crate::connection::{
    KbConnection, KbStream, error_from_server, parse_complete, quote_identifier, read_message,
};
use crate::protocol::messages::frontend_type;
use crate::protocol::{BackendMessage, FrontendMessage, MessageReader, TransactionStatus, WriteBuffer};
use crate::types::bytea::encode_bytea;
use crate::types::encode_text;

/// Buffered rows are sent once the CopyData message reaches this size.
pub const FLUSH_THRESHOLD: usize = 63 * 1024;

const BUFFER_CAPACITY: usize = 64 * 1024;

/// Build `COPY "table" ("col", ...) FROM STDIN`.
pub fn copy_in(table: &str, columns: &[&str]) -> String {
    copy_statement(&quote_identifier(table), columns)
}

/// Build `COPY "schema"."table" ("col", ...) FROM STDIN`.
pub fn copy_in_schema(schema: &str, table: &str, columns: &[&str]) -> String {
    let target = format!("{}.{}", quote_identifier(schema), quote_identifier(table));
    copy_statement(&target, columns)
}

fn copy_statement(target: &str, columns: &[&str]) -> String {
    if columns.is_empty() {
        return format!("COPY {target} FROM STDIN");
    }
    let columns: Vec<String> = columns.iter().map(|c| quote_identifier(c)).collect();
    format!("COPY {target} ({}) FROM STDIN", columns.join(", "))
}

// ==================== Starting a COPY ====================

impl KbConnection {
    /// Start a `COPY ... FROM STDIN` and return the row writer.
    ///
    /// COPY runs only inside a transaction and only in text format.
    /// `COPY ... TO` is refused.
    pub fn prepare_copy(&mut self, sql: &str) -> Result<CopyIn<'_>> {
        self.check_usable()?;
        let result = self.start_copy(sql);
        self.classify(result)?;
        CopyIn::start(self)
    }

    fn start_copy(&mut self, sql: &str) -> Result<()> {
        if !self.in_transaction() {
            return Err(Error::usage(
                UsageErrorKind::CopyOutsideTransaction,
                "COPY is only allowed inside a transaction",
            ));
        }
        self.send_message(&FrontendMessage::Query(sql.to_string()))?;

        let mut err: Option<Error> = None;
        loop {
            match self.recv1()? {
                BackendMessage::CopyInResponse { format, .. } => {
                    if format != 0 {
                        return self.abort_copy(Error::usage(
                            UsageErrorKind::CopyUnsupported,
                            "only text format supported for COPY",
                        ));
                    }
                    tracing::debug!("COPY started");
                    return Ok(());
                }
                BackendMessage::CopyOutResponse { .. } => {
                    err = Some(Error::usage(
                        UsageErrorKind::CopyUnsupported,
                        "COPY TO is not supported",
                    ));
                }
                // Output of a refused COPY TO; discarded
                BackendMessage::CopyData(_) | BackendMessage::CopyDone => {}
                BackendMessage::CommandComplete(_) => {}
                BackendMessage::ErrorResponse(e) => {
                    err = Some(error_from_server(e, Some(sql)));
                }
                BackendMessage::ReadyForQuery(status) => {
                    self.set_transaction_status(status);
                    return Err(err.unwrap_or_else(|| {
                        Error::protocol("unexpected ReadyForQuery in response to COPY")
                    }));
                }
                other => {
                    return Err(Error::protocol(format!(
                        "unknown response for copy query: '{}'",
                        char::from(other.tag())
                    )));
                }
            }
        }
    }

    /// Refuse a COPY the server already entered, then wait for it to settle.
    fn abort_copy(&mut self, err: Error) -> Result<()> {
        self.send_message(&FrontendMessage::CopyFail(err.to_string()))?;
        loop {
            match self.recv1()? {
                BackendMessage::ReadyForQuery(status) => {
                    self.set_transaction_status(status);
                    return Err(err);
                }
                BackendMessage::ErrorResponse(e) => {
                    tracing::debug!(error = %e, "COPY aborted");
                }
                BackendMessage::CopyData(_)
                | BackendMessage::CopyDone
                | BackendMessage::CommandComplete(_) => {}
                other => {
                    return Err(Error::protocol(format!(
                        "unexpected message '{}' while aborting COPY",
                        char::from(other.tag())
                    )));
                }
            }
        }
    }
}

// ==================== Background Reader ====================

/// State shared between the writer and the reader thread.
#[derive(Default)]
struct CopyShared {
    /// First error seen by the reader
    error: Mutex<Option<Error>>,
    /// The reader saw the stream break
    bad: AtomicBool,
}

impl CopyShared {
    fn set_error(&self, err: Error) {
        let mut slot = self.error.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn take_error(&self) -> Option<Error> {
        self.error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn fail(&self, err: Error) {
        self.bad.store(true, Ordering::Release);
        self.set_error(err);
    }

    fn is_bad(&self) -> bool {
        self.bad.load(Ordering::Acquire)
    }
}

/// What the reader thread hands back when it exits.
struct CopyOutcome {
    reader: MessageReader,
    status: Option<TransactionStatus>,
    tag: Option<String>,
    parameters: Vec<(String, String)>,
}

fn run_reader(mut stream: KbStream, reader: MessageReader, shared: &CopyShared) -> CopyOutcome {
    let mut outcome = CopyOutcome {
        reader,
        status: None,
        tag: None,
        parameters: Vec::new(),
    };
    let mut buf = vec![0u8; 8192];
    loop {
        let msg = match read_message(&mut stream, &mut outcome.reader, &mut buf) {
            Ok(msg) => msg,
            Err(e) => {
                shared.fail(e);
                return outcome;
            }
        };
        match msg {
            BackendMessage::CommandComplete(tag) => outcome.tag = Some(tag),
            BackendMessage::ErrorResponse(e) => {
                let fatal = e.is_fatal();
                let err = error_from_server(e, None);
                if fatal {
                    shared.fail(err);
                    return outcome;
                }
                shared.set_error(err);
            }
            BackendMessage::ReadyForQuery(status) => {
                outcome.status = Some(status);
                return outcome;
            }
            BackendMessage::ParameterStatus { name, value } => {
                outcome.parameters.push((name, value));
            }
            BackendMessage::NoticeResponse(notice) => {
                tracing::debug!(code = %notice.code, message = %notice.message, "notice during COPY");
            }
            BackendMessage::NotificationResponse { .. } => {}
            other => {
                shared.fail(Error::protocol(format!(
                    "unexpected message '{}' during COPY",
                    char::from(other.tag())
                )));
                return outcome;
            }
        }
    }
}

// ==================== Writer ====================

/// An open `COPY ... FROM STDIN`.
///
/// Holds the connection until closed. Dropping an unclosed writer finishes
/// the COPY and discards the result.
pub struct CopyIn<'c> {
    conn: &'c mut KbConnection,
    buffer: WriteBuffer,
    /// Start of the CopyData message being filled
    message: usize,
    row: Vec<u8>,
    shared: Arc<CopyShared>,
    reader: Option<JoinHandle<CopyOutcome>>,
    closed: bool,
    rows: u64,
}

impl std::fmt::Debug for CopyIn<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CopyIn")
            .field("rows", &self.rows)
            .field("buffered", &self.buffer.len())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl<'c> CopyIn<'c> {
    fn start(conn: &'c mut KbConnection) -> Result<Self> {
        // The server is already in COPY mode: failing here leaves the
        // session unusable
        let (stream, reader) = match conn.split_reader() {
            Ok(split) => split,
            Err(e) => {
                conn.mark_bad();
                return Err(e);
            }
        };
        let shared = Arc::new(CopyShared::default());
        let thread_shared = Arc::clone(&shared);
        let handle = match thread::Builder::new()
            .name("kbwire-copy-reader".to_string())
            .spawn(move || run_reader(stream, reader, &thread_shared))
        {
            Ok(handle) => handle,
            Err(e) => {
                conn.mark_bad();
                return Err(Error::Io(e));
            }
        };
        conn.set_in_copy(true);

        let mut buffer = WriteBuffer::with_capacity(BUFFER_CAPACITY);
        let message = buffer.begin(frontend_type::COPY_DATA);
        Ok(Self {
            conn,
            buffer,
            message,
            row: Vec::with_capacity(256),
            shared,
            reader: Some(handle),
            closed: false,
            rows: 0,
        })
    }

    /// Rows written so far.
    pub fn rows_written(&self) -> u64 {
        self.rows
    }

    /// Append one row. An empty row closes the COPY.
    pub fn write_row(&mut self, values: &[Value]) -> Result<()> {
        if self.closed {
            return Err(closed_error());
        }
        if values.is_empty() {
            return self.finish().map(|_| ());
        }
        if let Some(err) = self.reader_error() {
            return Err(err);
        }

        self.row.clear();
        let codec = *self.conn.codec();
        for (i, value) in values.iter().enumerate() {
            if i > 0 {
                self.row.push(b'\t');
            }
            match value {
                Value::Null => self.row.extend_from_slice(b"\\N"),
                Value::Bytes(b) => {
                    append_escaped(&mut self.row, &encode_bytea(codec.server_version, b));
                }
                other => append_escaped(&mut self.row, &encode_text(&codec, other, 0)?),
            }
        }
        self.row.push(b'\n');
        self.buffer.put_bytes(&self.row);
        self.rows += 1;

        if self.buffer.len() >= FLUSH_THRESHOLD {
            let result = self.flush();
            self.conn.classify(result)?;
        }
        Ok(())
    }

    /// Flush the remaining rows, end the COPY and return the rows copied.
    pub fn close(mut self) -> Result<u64> {
        self.finish()
    }

    fn finish(&mut self) -> Result<u64> {
        if self.closed {
            return Err(closed_error());
        }
        self.closed = true;

        let sent = if self.shared.is_bad() {
            Ok(())
        } else {
            self.flush()
                .and_then(|()| self.conn.send_message(&FrontendMessage::CopyDone))
        };
        if sent.is_err() {
            // Wake the reader so it can be joined
            self.conn.shutdown_stream();
        }

        let outcome = self.join_reader();
        self.conn.set_in_copy(false);
        let reader_error = self.shared.take_error();
        if self.shared.is_bad() || sent.is_err() {
            self.conn.mark_bad();
        }

        let outcome = outcome?;
        self.conn.restore_reader(outcome.reader);
        for (name, value) in outcome.parameters {
            self.conn.process_parameter_status(name, value);
        }
        if let Some(status) = outcome.status {
            self.conn.set_transaction_status(status);
        }

        sent?;
        if let Some(err) = reader_error {
            return self.conn.classify(Err(err));
        }
        // No tag: the failure was already returned by write_row
        let Some(tag) = outcome.tag else {
            return Err(Error::Custom("COPY did not complete".to_string()));
        };
        let copied = parse_complete(&tag)?.0.rows_affected;
        tracing::debug!(rows = copied, "COPY finished");
        Ok(copied)
    }

    fn flush(&mut self) -> Result<()> {
        // Only the header so far
        if self.buffer.len() <= self.message + 5 {
            return Ok(());
        }
        self.buffer.finish(self.message);
        let result = self.conn.write_raw(self.buffer.as_bytes());
        self.buffer.clear();
        self.message = self.buffer.begin(frontend_type::COPY_DATA);
        result
    }

    fn reader_error(&mut self) -> Option<Error> {
        let err = self.shared.take_error()?;
        if self.shared.is_bad() {
            self.conn.mark_bad();
        }
        Some(err)
    }

    fn join_reader(&mut self) -> Result<CopyOutcome> {
        let handle = self
            .reader
            .take()
            .ok_or_else(|| Error::protocol("COPY reader already joined"))?;
        handle
            .join()
            .map_err(|_| Error::protocol("COPY reader thread panicked"))
    }
}

impl Drop for CopyIn<'_> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.finish() {
            tracing::debug!(error = %e, "error while closing dropped COPY");
        }
    }
}

fn closed_error() -> Error {
    Error::usage(
        UsageErrorKind::CopyClosed,
        "copyin statement has already been closed",
    )
}

/// Append `data` with the COPY text escapes applied.
fn append_escaped(out: &mut Vec<u8>, data: &[u8]) {
    for &b in data {
        match b {
            b'\\' => out.extend_from_slice(b"\\\\"),
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\r' => out.extend_from_slice(b"\\r"),
            b'\t' => out.extend_from_slice(b"\\t"),
            _ => out.push(b),
        }
    }
}
