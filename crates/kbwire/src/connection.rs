//! Kingbase connection implementation.
//!
//! This module implements the client side of the wire protocol: connection
//! establishment, authentication, the simple and extended query flows,
//! transactions and connection state tracking.
//!
//! A connection is synchronous and owned by one caller at a time. Every
//! public entry point funnels its outcome through [`KbConnection::classify`],
//! which marks the connection bad when the stream can no longer be trusted.
//! Once bad, every call returns [`Error::bad_connection`] without touching
//! the socket.
//!
//! ```rust,ignore
//! use kbwire::{KbConfig, KbConnection, Value};
//!
//! let config = KbConfig::new("localhost", "system", "test").password("secret");
//! let mut conn = KbConnection::connect(config)?;
//! let mut rows = conn.query("SELECT id, name FROM users WHERE id > $1", &[Value::Int(10)])?;
//! while let Some(row) = rows.next_row()? {
//!     println!("{:?}", row.get(0));
//! }
//! ```

#![allow(clippy::result_large_err)]

use std::borrow::Cow;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use kbwire_core::error::{
    ConnectionError, ConnectionErrorKind, QueryError, QueryErrorKind, TransactionError,
    TransactionErrorKind, UsageErrorKind,
};
use kbwire_core::{Error, Result, Row, ServerError, Value};

use crate::auth::{ScramClient, ScramHash, ScramSha256, ScramSm3, md5_password, sm3_password};
use crate::cancel::{CancelToken, CancelWatcher};
use crate::config::KbConfig;
use crate::protocol::{
    BackendMessage, DescribeKind, FieldDescription, FrontendMessage, MessageReader, MessageWriter,
    PROTOCOL_VERSION, TransactionStatus,
};
use crate::rows::{ExecResult, ResultHeader, Rows, RowsState};
use crate::statement::{Statement, check_parameter_limit, decide_column_formats, param_type_hints};
#[cfg(feature = "tls")]
use crate::tls::TlsStream;
use crate::types::{Codec, Dialect, Format, TypeKind, encode_param, oid};

// ==================== Stream ====================

/// The socket under a connection, plain or TLS.
pub(crate) enum KbStream {
    Plain(TcpStream),
    #[cfg(feature = "tls")]
    Tls(TlsStream),
    Closed,
}

impl KbStream {
    /// A second handle on the same socket, for a background reader.
    pub(crate) fn try_clone(&self) -> io::Result<Self> {
        match self {
            KbStream::Plain(s) => s.try_clone().map(KbStream::Plain),
            #[cfg(feature = "tls")]
            KbStream::Tls(s) => s.try_clone().map(KbStream::Tls),
            KbStream::Closed => Err(closed_stream()),
        }
    }

    fn tcp(&self) -> Option<&TcpStream> {
        match self {
            KbStream::Plain(s) => Some(s),
            #[cfg(feature = "tls")]
            KbStream::Tls(s) => Some(s.tcp()),
            KbStream::Closed => None,
        }
    }

    /// Shut down both directions; blocked readers on any clone wake up.
    pub(crate) fn shutdown(&self) -> io::Result<()> {
        match self {
            KbStream::Plain(s) => s.shutdown(Shutdown::Both),
            #[cfg(feature = "tls")]
            KbStream::Tls(s) => s.shutdown(),
            KbStream::Closed => Ok(()),
        }
    }

    fn set_timeouts(&self, timeout: Option<Duration>) -> io::Result<()> {
        if let Some(tcp) = self.tcp() {
            tcp.set_read_timeout(timeout)?;
            tcp.set_write_timeout(timeout)?;
        }
        Ok(())
    }
}

fn closed_stream() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection closed")
}

impl Read for KbStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            KbStream::Plain(s) => s.read(buf),
            #[cfg(feature = "tls")]
            KbStream::Tls(s) => s.read(buf),
            KbStream::Closed => Err(closed_stream()),
        }
    }
}

impl Write for KbStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            KbStream::Plain(s) => s.write(buf),
            #[cfg(feature = "tls")]
            KbStream::Tls(s) => s.write(buf),
            KbStream::Closed => Err(closed_stream()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            KbStream::Plain(s) => s.flush(),
            #[cfg(feature = "tls")]
            KbStream::Tls(s) => s.flush(),
            KbStream::Closed => Err(closed_stream()),
        }
    }
}

/// Read one complete backend message, pulling bytes from `stream` as needed.
///
/// Shared by the connection itself and by the COPY and LISTEN reader threads,
/// which take over the connection's `MessageReader`.
pub(crate) fn read_message(
    stream: &mut KbStream,
    reader: &mut MessageReader,
    buf: &mut [u8],
) -> Result<BackendMessage> {
    loop {
        if let Some(msg) = reader.next_message()? {
            tracing::trace!(tag = %char::from(msg.tag()), "received message");
            return Ok(msg);
        }
        let n = match stream.read(buf) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e)
                if e.kind() == io::ErrorKind::TimedOut || e.kind() == io::ErrorKind::WouldBlock =>
            {
                return Err(Error::Timeout);
            }
            Err(e) => {
                return Err(connection_error(
                    ConnectionErrorKind::Disconnected,
                    format!("Failed to read from server: {e}"),
                    Some(e),
                ));
            }
        };
        if n == 0 {
            return Err(connection_error(
                ConnectionErrorKind::Disconnected,
                "connection closed by server",
                None,
            ));
        }
        reader.feed(&buf[..n]);
    }
}

/// Open a TCP connection to the configured host, trying every resolved address.
pub(crate) fn dial(config: &KbConfig) -> Result<TcpStream> {
    let target = config.socket_addr();
    let addrs: Vec<_> = (config.host.as_str(), config.port)
        .to_socket_addrs()
        .map_err(|e| {
            connection_error(
                ConnectionErrorKind::DnsResolution,
                format!("Failed to resolve {target}: {e}"),
                Some(e),
            )
        })?
        .collect();

    let mut last_err = None;
    for addr in addrs {
        // A zero timeout means wait indefinitely
        let attempt = if config.connect_timeout.is_zero() {
            TcpStream::connect(addr)
        } else {
            TcpStream::connect_timeout(&addr, config.connect_timeout)
        };
        match attempt {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }

    let Some(e) = last_err else {
        return Err(connection_error(
            ConnectionErrorKind::DnsResolution,
            format!("No addresses found for {target}"),
            None,
        ));
    };
    let kind = if e.kind() == io::ErrorKind::ConnectionRefused {
        ConnectionErrorKind::Refused
    } else {
        ConnectionErrorKind::Connect
    };
    Err(connection_error(
        kind,
        format!("Failed to connect to {target}: {e}"),
        Some(e),
    ))
}

/// Dial and, when the SSL mode asks for it, upgrade the socket to TLS.
pub(crate) fn open_stream(config: &KbConfig) -> Result<KbStream> {
    let tcp = dial(config)?;
    tcp.set_nodelay(true).ok();
    if !config.connect_timeout.is_zero() {
        tcp.set_read_timeout(Some(config.connect_timeout)).ok();
        tcp.set_write_timeout(Some(config.connect_timeout)).ok();
    }

    if !config.ssl_mode.should_try_ssl() {
        return Ok(KbStream::Plain(tcp));
    }
    negotiate_ssl(tcp, config)
}

#[cfg(feature = "tls")]
fn negotiate_ssl(mut tcp: TcpStream, config: &KbConfig) -> Result<KbStream> {
    let mut writer = MessageWriter::new();
    tcp.write_all(writer.write(&FrontendMessage::SSLRequest))?;

    let mut reply = [0u8; 1];
    tcp.read_exact(&mut reply).map_err(|e| {
        connection_error(
            ConnectionErrorKind::Ssl,
            format!("Failed to read SSL response: {e}"),
            Some(e),
        )
    })?;
    if reply[0] != b'S' {
        return Err(connection_error(
            ConnectionErrorKind::Ssl,
            "TLS not supported by the server",
            None,
        ));
    }

    let stream = TlsStream::connect(tcp, config)?;
    tracing::debug!(ssl_mode = config.ssl_mode.as_str(), "TLS session established");
    Ok(KbStream::Tls(stream))
}

#[cfg(not(feature = "tls"))]
fn negotiate_ssl(_tcp: TcpStream, _config: &KbConfig) -> Result<KbStream> {
    Err(connection_error(
        ConnectionErrorKind::Ssl,
        "TLS requested but 'kbwire' was built without feature 'tls'",
        None,
    ))
}

// ==================== State ====================

/// Connection state in the protocol state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// TCP connection established, sending startup
    Connecting,
    /// Performing authentication handshake
    Authenticating,
    /// Ready for queries
    Ready(TransactionStatusState),
    /// The stream can no longer be trusted; the connection must be discarded
    Bad,
    /// Connection has been closed
    Closed,
}

/// Transaction status from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionStatusState {
    /// Not in a transaction block ('I')
    #[default]
    Idle,
    /// In a transaction block ('T')
    InTransaction,
    /// In a failed transaction block ('E')
    InFailed,
}

impl From<TransactionStatus> for TransactionStatusState {
    fn from(status: TransactionStatus) -> Self {
        match status {
            TransactionStatus::Idle => TransactionStatusState::Idle,
            TransactionStatus::Transaction => TransactionStatusState::InTransaction,
            TransactionStatus::Error => TransactionStatusState::InFailed,
        }
    }
}

type NoticeHandler = Box<dyn FnMut(&ServerError) + Send>;

/// Kingbase connection.
///
/// Manages a TCP connection to a Kingbase server, handling the wire protocol,
/// authentication, and state tracking.
pub struct KbConnection {
    /// Socket to the server
    stream: KbStream,
    /// Current connection state
    state: ConnectionState,
    /// Backend process ID (for query cancellation)
    process_id: i32,
    /// Secret key (for query cancellation)
    secret_key: i32,
    /// Server parameters received via ParameterStatus
    parameters: HashMap<String, String>,
    /// `server_version` as `major*10000 + minor*100 + patch`
    server_version: i32,
    time_zone: Option<String>,
    config: Arc<KbConfig>,
    codec: Codec,
    /// Message reader for parsing backend messages
    reader: MessageReader,
    /// Message writer for encoding frontend messages
    writer: MessageWriter,
    read_buf: Vec<u8>,
    /// A message read ahead and pushed back
    saved: Option<BackendMessage>,
    notice_handler: Option<NoticeHandler>,
    statement_seq: u64,
    in_copy: bool,
}

impl std::fmt::Debug for KbConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KbConnection")
            .field("state", &self.state)
            .field("process_id", &self.process_id)
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("database", &self.config.database)
            .field("dialect", &self.codec.dialect)
            .finish_non_exhaustive()
    }
}

impl KbConnection {
    /// Establish a new connection to the Kingbase server.
    ///
    /// This performs the complete connection handshake:
    /// 1. TCP connection, with the TLS upgrade when configured
    /// 2. Startup message
    /// 3. Authentication
    /// 4. Server parameters and ReadyForQuery
    /// 5. Compatibility-mode detection
    pub fn connect(config: KbConfig) -> Result<Self> {
        // 1. TCP connection with timeout
        let stream = open_stream(&config)?;
        let config = Arc::new(config);

        let mut conn = Self {
            stream,
            state: ConnectionState::Connecting,
            process_id: 0,
            secret_key: 0,
            parameters: HashMap::new(),
            server_version: 0,
            time_zone: None,
            codec: Codec::new(Dialect::default(), 0, config.codec),
            config,
            reader: MessageReader::new(),
            writer: MessageWriter::new(),
            read_buf: vec![0u8; 8192],
            saved: None,
            notice_handler: None,
            statement_seq: 0,
            in_copy: false,
        };

        // 2. Send startup message
        conn.send_startup()?;
        conn.state = ConnectionState::Authenticating;

        // 3 + 4. Authentication, then parameters until ReadyForQuery
        conn.read_startup_messages()?;

        // The connect timeout only covers the handshake
        conn.stream.set_timeouts(None).ok();

        // 5. Compatibility mode
        conn.detect_dialect()?;

        tracing::debug!(
            process_id = conn.process_id,
            server_version = conn.server_version,
            dialect = conn.codec.dialect.as_str(),
            "connected"
        );
        Ok(conn)
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Check if the connection is ready for queries.
    pub fn is_ready(&self) -> bool {
        matches!(self.state, ConnectionState::Ready(_))
    }

    /// Whether the connection was marked bad and must be discarded.
    pub fn is_bad(&self) -> bool {
        self.state == ConnectionState::Bad
    }

    /// Get the backend process ID (for query cancellation).
    pub fn process_id(&self) -> i32 {
        self.process_id
    }

    /// Get the secret key (for query cancellation).
    pub fn secret_key(&self) -> i32 {
        self.secret_key
    }

    /// Get a server parameter value.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(|s| s.as_str())
    }

    /// Get all server parameters.
    pub fn parameters(&self) -> &HashMap<String, String> {
        &self.parameters
    }

    /// Server version as `major*10000 + minor*100 + patch`, 0 if unknown.
    pub fn server_version(&self) -> i32 {
        self.server_version
    }

    /// The session time zone last reported by the server.
    pub fn time_zone(&self) -> Option<&str> {
        self.time_zone.as_deref()
    }

    /// The compatibility mode detected at connect time.
    pub fn dialect(&self) -> Dialect {
        self.codec.dialect
    }

    /// The codec used for this connection's parameters and columns.
    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    pub fn config(&self) -> &KbConfig {
        &self.config
    }

    /// Current transaction status, as of the last ReadyForQuery.
    pub fn transaction_status(&self) -> TransactionStatusState {
        match self.state {
            ConnectionState::Ready(status) => status,
            _ => TransactionStatusState::Idle,
        }
    }

    /// Whether a transaction block is open (possibly failed).
    pub fn in_transaction(&self) -> bool {
        self.transaction_status() != TransactionStatusState::Idle
    }

    /// Install a handler for `NoticeResponse` messages.
    ///
    /// Without a handler, notices are logged at debug level.
    pub fn set_notice_handler<F>(&mut self, handler: F)
    where
        F: FnMut(&ServerError) + Send + 'static,
    {
        self.notice_handler = Some(Box::new(handler));
    }

    pub fn clear_notice_handler(&mut self) {
        self.notice_handler = None;
    }

    /// A token that can cancel this connection's running statement from
    /// another thread.
    pub fn cancel_token(&self) -> CancelToken {
        CancelToken::new(Arc::clone(&self.config), self.process_id, self.secret_key)
    }

    /// Close the connection gracefully.
    pub fn close(&mut self) -> Result<()> {
        match self.state {
            ConnectionState::Closed => return Ok(()),
            ConnectionState::Bad => {
                self.state = ConnectionState::Closed;
                let _ = self.stream.shutdown();
                return Ok(());
            }
            _ => {}
        }

        // Send Terminate message
        let result = self.send_message(&FrontendMessage::Terminate);
        self.state = ConnectionState::Closed;
        let _ = self.stream.shutdown();
        result
    }

    // ==================== Queries ====================

    /// Run a query and return its rows.
    ///
    /// Without parameters the simple protocol is used; with parameters the
    /// query goes through an unnamed prepared statement, or through a single
    /// pipelined round trip when `binary_parameters` is enabled.
    pub fn query(&mut self, sql: &str, params: &[Value]) -> Result<Rows<'_>> {
        self.check_usable()?;
        let result = if params.is_empty() {
            self.simple_query(sql)
        } else if self.config.binary_parameters {
            self.binary_mode_query(sql, params)
        } else {
            let mut stmt = Statement::new(String::new(), sql, false);
            self.query_statement(&mut stmt, params)
        };
        let state = self.classify(result)?;
        Ok(Rows::new(self, state))
    }

    /// Execute a statement and return the affected row count.
    pub fn exec(&mut self, sql: &str, params: &[Value]) -> Result<ExecResult> {
        self.check_usable()?;
        let result = if params.is_empty() {
            self.simple_exec(sql).map(|(result, _)| result)
        } else if self.config.binary_parameters {
            self.binary_mode_exec(sql, params)
        } else {
            let mut stmt = Statement::new(String::new(), sql, false);
            self.exec_statement(&mut stmt, params)
        };
        self.classify(result)
    }

    /// Run a query, cancelling it on the server if it outlives `timeout`.
    ///
    /// Rows are collected before returning. A statement cancelled by the
    /// deadline is reported as [`Error::Timeout`].
    pub fn query_with_timeout(
        &mut self,
        sql: &str,
        params: &[Value],
        timeout: Duration,
    ) -> Result<Vec<Row>> {
        self.check_usable()?;
        let watcher = CancelWatcher::spawn(self.cancel_token(), timeout)?;
        let result = self.query(sql, params).and_then(Rows::fetch_all);
        finish_watched(watcher, result)
    }

    /// Execute a statement, cancelling it on the server if it outlives `timeout`.
    pub fn exec_with_timeout(
        &mut self,
        sql: &str,
        params: &[Value],
        timeout: Duration,
    ) -> Result<ExecResult> {
        self.check_usable()?;
        let watcher = CancelWatcher::spawn(self.cancel_token(), timeout)?;
        let result = self.exec(sql, params);
        finish_watched(watcher, result)
    }

    // ==================== Prepared Statements ====================

    /// Create a named prepared statement.
    ///
    /// Nothing is sent yet: the Parse round trip happens on first execution,
    /// when the argument types are known.
    pub fn prepare(&mut self, sql: &str) -> Result<Statement> {
        self.prepare_named(sql, false)
    }

    /// Like [`prepare`](Self::prepare), for a statement whose last argument is
    /// a return-status placeholder that is never sent to the server.
    pub fn prepare_with_return_status(&mut self, sql: &str) -> Result<Statement> {
        self.prepare_named(sql, true)
    }

    fn prepare_named(&mut self, sql: &str, has_return_status: bool) -> Result<Statement> {
        self.check_usable()?;
        if is_copy(sql) {
            return Err(Error::usage(
                UsageErrorKind::CopyUnsupported,
                "COPY statements are opened with prepare_copy",
            ));
        }
        self.statement_seq += 1;
        Ok(Statement::new(
            self.statement_seq.to_string(),
            sql,
            has_return_status,
        ))
    }

    /// Run a prepared statement and return its rows.
    pub fn query_prepared(&mut self, stmt: &mut Statement, params: &[Value]) -> Result<Rows<'_>> {
        self.check_usable()?;
        stmt.check_open()?;
        let result = self.query_statement(stmt, params);
        let state = self.classify(result)?;
        Ok(Rows::new(self, state))
    }

    /// Execute a prepared statement and return the affected row count.
    pub fn execute_prepared(&mut self, stmt: &mut Statement, params: &[Value]) -> Result<ExecResult> {
        self.check_usable()?;
        stmt.check_open()?;
        let result = self.exec_statement(stmt, params);
        self.classify(result)
    }

    /// Release a prepared statement on the server. Closing twice is a no-op.
    pub fn close_statement(&mut self, stmt: &mut Statement) -> Result<()> {
        if stmt.closed {
            return Ok(());
        }
        self.check_usable()?;
        stmt.closed = true;
        if !stmt.prepared {
            return Ok(());
        }
        let result = self.close_statement_inner(&stmt.name);
        self.classify(result)
    }

    fn close_statement_inner(&mut self, name: &str) -> Result<()> {
        self.send_batch(&[
            FrontendMessage::Close {
                kind: DescribeKind::Statement,
                name: name.to_string(),
            },
            FrontendMessage::Sync,
        ])?;

        match self.recv1()? {
            BackendMessage::CloseComplete => {}
            BackendMessage::ErrorResponse(e) => {
                tracing::warn!(statement = name, error = %e, "server rejected statement close");
                self.read_ready_for_query()?;
                return Err(error_from_server(e, None));
            }
            other => {
                return Err(Error::protocol(format!(
                    "unexpected message '{}' in response to Close",
                    char::from(other.tag())
                )));
            }
        }
        self.read_ready_for_query()
    }

    fn query_statement(&mut self, stmt: &mut Statement, params: &[Value]) -> Result<RowsState> {
        check_parameter_limit(params)?;
        if !stmt.prepared {
            self.prepare_statement(stmt, params)?;
        }
        let args = stmt.bind_arguments(params)?;
        self.bind_execute(stmt, args)?;
        let header = self.post_execute(stmt.header.clone(), &stmt.query)?;
        Ok(RowsState::new(header))
    }

    fn exec_statement(&mut self, stmt: &mut Statement, params: &[Value]) -> Result<ExecResult> {
        check_parameter_limit(params)?;
        if !stmt.prepared {
            self.prepare_statement(stmt, params)?;
        }
        let args = stmt.bind_arguments(params)?;
        self.bind_execute(stmt, args)?;
        let header = self.post_execute(stmt.header.clone(), &stmt.query)?;
        self.read_exec_response(Some(header), stmt.is_insert, &stmt.query)
            .map(|(result, _)| result)
    }

    /// Parse + Describe(statement) + Sync, then read the statement shape.
    fn prepare_statement(&mut self, stmt: &mut Statement, params: &[Value]) -> Result<()> {
        let typed = if stmt.has_return_status {
            &params[..params.len().saturating_sub(1)]
        } else {
            params
        };
        let (query, is_insert) = self.returning_rewrite(&stmt.query);
        let query = query.into_owned();

        self.send_batch(&[
            FrontendMessage::Parse {
                name: stmt.name.clone(),
                query,
                param_types: param_type_hints(typed),
            },
            FrontendMessage::Describe {
                kind: DescribeKind::Statement,
                name: stmt.name.clone(),
            },
            FrontendMessage::Sync,
        ])?;

        self.read_parse_response()?;
        let (param_types, fields) = self.read_statement_describe()?;
        let (formats, result_formats) = decide_column_formats(
            &self.codec,
            &fields,
            self.config.disable_prepared_binary_result,
        );
        self.read_ready_for_query()?;

        stmt.param_types = param_types;
        stmt.header = ResultHeader::with_formats(fields, formats);
        stmt.result_formats = result_formats;
        stmt.is_insert = is_insert;
        stmt.prepared = true;
        tracing::trace!(statement = %stmt.name, params = stmt.param_types.len(), "statement prepared");
        Ok(())
    }

    fn bind_execute(&mut self, stmt: &Statement, args: &[Value]) -> Result<()> {
        let (param_formats, values) = self.encode_params(args, &stmt.param_types)?;
        self.send_batch(&[
            FrontendMessage::Bind {
                portal: String::new(),
                statement: stmt.name.clone(),
                param_formats,
                params: values,
                result_formats: stmt.result_formats.clone(),
            },
            FrontendMessage::Execute {
                portal: String::new(),
                max_rows: 0,
            },
            FrontendMessage::Sync,
        ])?;
        self.read_bind_response()
    }

    fn encode_params(
        &self,
        params: &[Value],
        types: &[u32],
    ) -> Result<(Vec<i16>, Vec<Option<Vec<u8>>>)> {
        let mut formats = Vec::with_capacity(params.len());
        let mut values = Vec::with_capacity(params.len());
        for (i, value) in params.iter().enumerate() {
            let target = types.get(i).copied().unwrap_or(0);
            let (format, bytes) =
                encode_param(&self.codec, value, target, self.config.binary_parameters)?;
            formats.push(format.code());
            values.push(bytes);
        }
        // An empty format list means "all text"
        if formats.iter().all(|&f| f == Format::Text.code()) {
            formats.clear();
        }
        Ok((formats, values))
    }

    // ==================== Binary Parameters Mode ====================

    /// Parse, Bind, Describe(portal), Execute and Sync in one round trip.
    fn binary_mode_send(&mut self, sql: &str, params: &[Value]) -> Result<bool> {
        check_parameter_limit(params)?;
        let (query, is_insert) = self.returning_rewrite(sql);
        let query = query.into_owned();
        let (param_formats, values) = self.encode_params(params, &[])?;

        self.send_batch(&[
            FrontendMessage::Parse {
                name: String::new(),
                query,
                param_types: Vec::new(),
            },
            FrontendMessage::Bind {
                portal: String::new(),
                statement: String::new(),
                param_formats,
                params: values,
                result_formats: Vec::new(),
            },
            FrontendMessage::Describe {
                kind: DescribeKind::Portal,
                name: String::new(),
            },
            FrontendMessage::Execute {
                portal: String::new(),
                max_rows: 0,
            },
            FrontendMessage::Sync,
        ])?;

        self.read_parse_response()?;
        self.read_bind_response()?;
        Ok(is_insert)
    }

    fn binary_mode_query(&mut self, sql: &str, params: &[Value]) -> Result<RowsState> {
        self.binary_mode_send(sql, params)?;
        let header = self.read_portal_describe()?;
        let header = self.post_execute(header, sql)?;
        Ok(RowsState::new(header))
    }

    fn binary_mode_exec(&mut self, sql: &str, params: &[Value]) -> Result<ExecResult> {
        let is_insert = self.binary_mode_send(sql, params)?;
        let header = self.read_portal_describe()?;
        self.read_exec_response(Some(header), is_insert, sql)
            .map(|(result, _)| result)
    }

    // ==================== Transactions ====================

    /// Open a transaction block.
    pub fn begin(&mut self) -> Result<()> {
        self.check_usable()?;
        let result = self.begin_inner();
        self.classify(result)
    }

    /// Commit the open transaction.
    ///
    /// Committing a failed transaction rolls it back and reports
    /// [`TransactionErrorKind::InFailedTransaction`].
    pub fn commit(&mut self) -> Result<()> {
        self.check_usable()?;
        let result = self.commit_inner();
        self.classify(result)
    }

    /// Roll back the open transaction.
    pub fn rollback(&mut self) -> Result<()> {
        self.check_usable()?;
        let result = self.rollback_inner();
        self.classify(result)
    }

    fn begin_inner(&mut self) -> Result<()> {
        self.expect_transaction(false)?;
        let (_, tag) = self.simple_exec("BEGIN")?;
        if tag != "BEGIN" {
            return Err(transaction_error(
                TransactionErrorKind::UnexpectedStatus,
                format!("unexpected command tag {tag}"),
            ));
        }
        if self.transaction_status() != TransactionStatusState::InTransaction {
            return Err(transaction_error(
                TransactionErrorKind::UnexpectedStatus,
                format!(
                    "unexpected transaction status {:?}",
                    self.transaction_status()
                ),
            ));
        }
        tracing::debug!("transaction started");
        Ok(())
    }

    fn commit_inner(&mut self) -> Result<()> {
        self.expect_transaction(true)?;

        if self.transaction_status() == TransactionStatusState::InFailed {
            self.rollback_inner()?;
            return Err(transaction_error(
                TransactionErrorKind::InFailedTransaction,
                "could not complete operation in a failed transaction",
            ));
        }

        let tag = match self.simple_exec("COMMIT") {
            Ok((_, tag)) => tag,
            Err(e) => {
                if self.in_transaction() {
                    self.mark_bad();
                }
                return Err(e);
            }
        };
        if tag != "COMMIT" {
            return Err(transaction_error(
                TransactionErrorKind::UnexpectedStatus,
                format!("unexpected command tag {tag}"),
            ));
        }
        self.expect_transaction(false)?;
        tracing::debug!("transaction committed");
        Ok(())
    }

    fn rollback_inner(&mut self) -> Result<()> {
        self.expect_transaction(true)?;

        let tag = match self.simple_exec("ROLLBACK") {
            Ok((_, tag)) => tag,
            Err(e) => {
                if self.in_transaction() {
                    self.mark_bad();
                }
                return Err(e);
            }
        };
        if tag != "ROLLBACK" {
            return Err(Error::Custom(format!("unexpected command tag {tag}")));
        }
        self.expect_transaction(false)?;
        tracing::debug!("transaction rolled back");
        Ok(())
    }

    fn expect_transaction(&self, in_transaction: bool) -> Result<()> {
        if self.in_transaction() == in_transaction {
            return Ok(());
        }
        Err(transaction_error(
            TransactionErrorKind::UnexpectedStatus,
            format!(
                "unexpected transaction status {:?}",
                self.transaction_status()
            ),
        ))
    }

    // ==================== Simple Query Protocol ====================

    pub(crate) fn simple_query(&mut self, sql: &str) -> Result<RowsState> {
        self.send_message(&FrontendMessage::Query(sql.to_string()))?;

        let mut state: Option<RowsState> = None;
        let mut err: Option<Error> = None;
        loop {
            match self.recv1()? {
                msg @ (BackendMessage::CommandComplete(_) | BackendMessage::EmptyQueryResponse) => {
                    if err.is_some() {
                        return Err(Error::protocol(format!(
                            "unexpected message '{}' in simple query execution",
                            char::from(msg.tag())
                        )));
                    }
                    let st = state.get_or_insert_with(RowsState::default);
                    if let BackendMessage::CommandComplete(tag) = msg {
                        let (result, command) = parse_complete(&tag)?;
                        st.result = result;
                        st.tag = command;
                    }
                    st.done = true;
                }
                BackendMessage::ReadyForQuery(status) => {
                    self.set_transaction_status(status);
                    return match (state, err) {
                        (_, Some(e)) => Err(e),
                        (Some(mut st), None) => {
                            st.done = true;
                            Ok(st)
                        }
                        (None, None) => Err(unexpected_ready()),
                    };
                }
                BackendMessage::ErrorResponse(e) => {
                    state = None;
                    err = Some(error_from_server(e, Some(sql)));
                }
                BackendMessage::RowDescription(fields) => {
                    // Overwrites the result of an earlier statement in the batch
                    state = Some(RowsState::new(ResultHeader::from_fields(fields)));
                }
                msg @ BackendMessage::DataRow(_) => {
                    let Some(st) = state else {
                        return Err(Error::protocol(
                            "unexpected DataRow in simple query execution",
                        ));
                    };
                    self.save_message(msg)?;
                    return Ok(st);
                }
                other => {
                    return Err(Error::protocol(format!(
                        "unknown response for simple query: '{}'",
                        char::from(other.tag())
                    )));
                }
            }
        }
    }

    /// Run a statement over the simple protocol; returns the result and the
    /// command word of its tag.
    fn simple_exec(&mut self, sql: &str) -> Result<(ExecResult, String)> {
        let (query, is_insert) = self.returning_rewrite(sql);
        self.send_message(&FrontendMessage::Query(query.into_owned()))?;
        self.read_exec_response(None, is_insert, sql)
    }

    /// Read the tail of an execution up to ReadyForQuery.
    ///
    /// When `capture_id` is set, the first column of the first row is taken
    /// as the last insert id if it is an `int4`.
    fn read_exec_response(
        &mut self,
        mut header: Option<ResultHeader>,
        capture_id: bool,
        sql: &str,
    ) -> Result<(ExecResult, String)> {
        let mut last_insert_id: Option<i64> = None;
        let mut result: Option<(ExecResult, String)> = None;
        let mut err: Option<Error> = None;
        loop {
            match self.recv1()? {
                BackendMessage::CommandComplete(tag) => {
                    let (mut res, command) = parse_complete(&tag)?;
                    res.last_insert_id = last_insert_id;
                    result = Some((res, command));
                }
                BackendMessage::EmptyQueryResponse => {
                    result = Some((ExecResult::default(), String::new()));
                }
                BackendMessage::ReadyForQuery(status) => {
                    self.set_transaction_status(status);
                    return match (result, err) {
                        (_, Some(e)) => Err(e),
                        (Some(res), None) => Ok(res),
                        (None, None) => Err(unexpected_ready()),
                    };
                }
                BackendMessage::RowDescription(fields) => {
                    if capture_id {
                        header = Some(ResultHeader::from_fields(fields));
                    }
                }
                BackendMessage::DataRow(values) => {
                    if !capture_id {
                        continue;
                    }
                    let Some(h) = header.as_ref() else {
                        return Err(Error::protocol(
                            "unexpected DataRow in simple query execution",
                        ));
                    };
                    if let Some(e) = &err {
                        return Err(Error::protocol(format!(
                            "unexpected DataRow after error {e}"
                        )));
                    }
                    let (Some(field), Some(first)) = (h.fields.first(), values.first()) else {
                        return Err(Error::protocol(format!(
                            "unexpected returning num of columns: {}",
                            values.len()
                        )));
                    };
                    // The last returned row wins; a NULL id reads as 0
                    if field.type_oid == oid::INT4 {
                        let format = h.formats.first().copied().unwrap_or_default();
                        let id = self
                            .codec
                            .decode(field.type_oid, first.as_deref(), format)?;
                        last_insert_id = Some(id.as_i64().unwrap_or(0));
                    }
                }
                BackendMessage::ErrorResponse(e) => {
                    err = Some(error_from_server(e, Some(sql)));
                }
                BackendMessage::NoData => {}
                other => {
                    return Err(Error::protocol(format!(
                        "unknown response for simple query: '{}'",
                        char::from(other.tag())
                    )));
                }
            }
        }
    }

    // ==================== Extended Query Responses ====================

    fn read_parse_response(&mut self) -> Result<()> {
        match self.recv1()? {
            BackendMessage::ParseComplete => Ok(()),
            BackendMessage::ErrorResponse(e) => {
                let err = error_from_server(e, None);
                self.read_ready_for_query()?;
                Err(err)
            }
            other => Err(Error::protocol(format!(
                "unexpected Parse response '{}'",
                char::from(other.tag())
            ))),
        }
    }

    fn read_bind_response(&mut self) -> Result<()> {
        match self.recv1()? {
            BackendMessage::BindComplete => Ok(()),
            BackendMessage::ErrorResponse(e) => {
                let err = error_from_server(e, None);
                self.read_ready_for_query()?;
                Err(err)
            }
            other => Err(Error::protocol(format!(
                "unexpected Bind response '{}'",
                char::from(other.tag())
            ))),
        }
    }

    fn read_statement_describe(&mut self) -> Result<(Vec<u32>, Vec<FieldDescription>)> {
        let mut param_types = Vec::new();
        loop {
            match self.recv1()? {
                BackendMessage::ParameterDescription(types) => param_types = types,
                BackendMessage::RowDescription(mut fields) => {
                    // A statement describe always reports text; formats are chosen at Bind
                    for field in &mut fields {
                        field.format = Format::Text.code();
                    }
                    return Ok((param_types, fields));
                }
                BackendMessage::NoData => return Ok((param_types, Vec::new())),
                BackendMessage::ErrorResponse(e) => {
                    let err = error_from_server(e, None);
                    self.read_ready_for_query()?;
                    return Err(err);
                }
                other => {
                    return Err(Error::protocol(format!(
                        "unexpected Describe statement response '{}'",
                        char::from(other.tag())
                    )));
                }
            }
        }
    }

    fn read_portal_describe(&mut self) -> Result<ResultHeader> {
        match self.recv1()? {
            BackendMessage::RowDescription(fields) => Ok(ResultHeader::from_fields(fields)),
            BackendMessage::NoData => Ok(ResultHeader::default()),
            BackendMessage::ErrorResponse(e) => {
                let err = error_from_server(e, None);
                self.read_ready_for_query()?;
                Err(err)
            }
            other => Err(Error::protocol(format!(
                "unexpected Describe response '{}'",
                char::from(other.tag())
            ))),
        }
    }

    /// Read ahead until the first row or completion, so execution errors
    /// surface before rows are handed out.
    ///
    /// The message that ends the read-ahead is pushed back for the caller.
    /// A RowDescription seen here replaces `header`.
    fn post_execute(&mut self, header: ResultHeader, sql: &str) -> Result<ResultHeader> {
        let mut described: Option<ResultHeader> = None;
        loop {
            match self.recv1()? {
                BackendMessage::ErrorResponse(e) => {
                    let err = error_from_server(e, Some(sql));
                    self.read_ready_for_query()?;
                    return Err(err);
                }
                BackendMessage::RowDescription(fields) => {
                    described = Some(ResultHeader::from_fields(fields));
                }
                msg @ (BackendMessage::DataRow(_)
                | BackendMessage::CommandComplete(_)
                | BackendMessage::EmptyQueryResponse) => {
                    self.save_message(msg)?;
                    return Ok(described.unwrap_or(header));
                }
                BackendMessage::NoData => {}
                other => {
                    return Err(Error::protocol(format!(
                        "unexpected message '{}' during extended query execution",
                        char::from(other.tag())
                    )));
                }
            }
        }
    }

    pub(crate) fn read_ready_for_query(&mut self) -> Result<()> {
        match self.recv1()? {
            BackendMessage::ReadyForQuery(status) => {
                self.set_transaction_status(status);
                Ok(())
            }
            other => Err(Error::protocol(format!(
                "unexpected message '{}'; expected ReadyForQuery",
                char::from(other.tag())
            ))),
        }
    }

    // ==================== Startup ====================

    fn send_startup(&mut self) -> Result<()> {
        let params = self.config.startup_params();
        let msg = FrontendMessage::Startup {
            version: PROTOCOL_VERSION,
            params,
        };
        self.send_message(&msg)
    }

    fn read_startup_messages(&mut self) -> Result<()> {
        loop {
            match self.recv()? {
                BackendMessage::BackendKeyData {
                    process_id,
                    secret_key,
                } => {
                    self.process_id = process_id;
                    self.secret_key = secret_key;
                }
                BackendMessage::ParameterStatus { name, value } => {
                    self.process_parameter_status(name, value);
                }
                BackendMessage::ReadyForQuery(status) => {
                    self.state = ConnectionState::Ready(status.into());
                    return Ok(());
                }
                BackendMessage::ErrorResponse(e) => {
                    self.state = ConnectionState::Bad;
                    return Err(error_from_server(e, None));
                }
                msg @ (BackendMessage::AuthenticationOk
                | BackendMessage::AuthenticationCleartextPassword
                | BackendMessage::AuthenticationMD5Password(_)
                | BackendMessage::AuthenticationSM3Password(_)
                | BackendMessage::AuthenticationSASL(_)
                | BackendMessage::AuthenticationSASLContinue(_)
                | BackendMessage::AuthenticationSASLFinal(_)
                | BackendMessage::AuthenticationUnsupported(_)) => self.authenticate(msg)?,
                other => {
                    return Err(Error::protocol(format!(
                        "unknown response for startup: '{}'",
                        char::from(other.tag())
                    )));
                }
            }
        }
    }

    fn detect_dialect(&mut self) -> Result<()> {
        let mode = match self.query_text_value("show database_mode;") {
            Ok(mode) => mode.unwrap_or_default(),
            Err(Error::Query(e)) if !e.is_fatal() => {
                tracing::warn!(error = %e, "could not read database_mode, assuming oracle");
                String::new()
            }
            Err(e) => {
                self.state = ConnectionState::Bad;
                return Err(e);
            }
        };
        let dialect = Dialect::from_mode(&mode);
        self.codec = Codec::new(dialect, self.server_version, self.config.codec);
        tracing::debug!(dialect = dialect.as_str(), "compatibility mode detected");
        Ok(())
    }

    fn query_text_value(&mut self, sql: &str) -> Result<Option<String>> {
        let state = self.simple_query(sql)?;
        let rows = Rows::new(self, state).fetch_all()?;
        Ok(rows
            .first()
            .and_then(|row| row.get(0))
            .and_then(Value::as_str)
            .map(str::to_owned))
    }

    // ==================== Authentication ====================

    fn require_password(&self) -> Result<&str> {
        self.config
            .password
            .as_deref()
            .ok_or_else(|| auth_error("Password required but not provided"))
    }

    fn authenticate(&mut self, msg: BackendMessage) -> Result<()> {
        match msg {
            BackendMessage::AuthenticationOk => Ok(()),
            BackendMessage::AuthenticationCleartextPassword => {
                tracing::debug!(method = "cleartext", "authenticating");
                let password = self.require_password()?.to_string();
                self.send_message(&FrontendMessage::PasswordMessage(password))?;
                self.expect_auth_ok()
            }
            BackendMessage::AuthenticationMD5Password(salt) => {
                tracing::debug!(method = "md5", "authenticating");
                let hash = md5_password(&self.config.user, self.require_password()?, salt);
                self.send_message(&FrontendMessage::PasswordMessage(hash))?;
                self.expect_auth_ok()
            }
            BackendMessage::AuthenticationSM3Password(salt) => {
                tracing::debug!(method = "sm3", "authenticating");
                let hash = sm3_password(&self.config.user, self.require_password()?, salt)?;
                self.send_message(&FrontendMessage::PasswordMessage(hash))?;
                self.expect_auth_ok()
            }
            BackendMessage::AuthenticationSASL(mechanisms) => {
                if mechanisms.iter().any(|m| m == ScramSha256::MECHANISM) {
                    self.scram_auth::<ScramSha256>()
                } else if mechanisms.iter().any(|m| m == ScramSm3::MECHANISM) {
                    self.scram_auth::<ScramSm3>()
                } else {
                    Err(auth_error(format!(
                        "Unsupported SASL mechanisms: {:?}",
                        mechanisms
                    )))
                }
            }
            BackendMessage::AuthenticationUnsupported(code) => Err(auth_error(format!(
                "unknown authentication response: {code}"
            ))),
            other => Err(Error::protocol(format!(
                "unexpected authentication message out of sequence: {other:?}"
            ))),
        }
    }

    /// After a password message the server must answer with AuthenticationOk.
    fn expect_auth_ok(&mut self) -> Result<()> {
        match self.recv()? {
            BackendMessage::AuthenticationOk => Ok(()),
            BackendMessage::ErrorResponse(e) => {
                self.state = ConnectionState::Bad;
                Err(error_from_server(e, None))
            }
            other => Err(Error::protocol(format!(
                "unexpected authentication response: '{}'",
                char::from(other.tag())
            ))),
        }
    }

    fn scram_auth<H: ScramHash>(&mut self) -> Result<()> {
        tracing::debug!(method = H::MECHANISM, "authenticating");
        let password = self.require_password()?;
        let mut client = ScramClient::<H>::new(&self.config.user, password);

        // Send client-first message
        self.send_message(&FrontendMessage::SASLInitialResponse {
            mechanism: client.mechanism().to_string(),
            data: client.client_first(),
        })?;

        // Receive server-first
        let server_first = match self.recv()? {
            BackendMessage::AuthenticationSASLContinue(data) => data,
            BackendMessage::ErrorResponse(e) => {
                self.state = ConnectionState::Bad;
                return Err(error_from_server(e, None));
            }
            other => {
                return Err(Error::protocol(format!(
                    "unexpected authentication response: '{}'",
                    char::from(other.tag())
                )));
            }
        };

        // Generate and send client-final
        let client_final = client.process_server_first(&server_first)?;
        self.send_message(&FrontendMessage::SASLResponse(client_final))?;

        // Receive server-final
        let server_final = match self.recv()? {
            BackendMessage::AuthenticationSASLFinal(data) => data,
            BackendMessage::ErrorResponse(e) => {
                self.state = ConnectionState::Bad;
                return Err(error_from_server(e, None));
            }
            other => {
                return Err(Error::protocol(format!(
                    "unexpected authentication response: '{}'",
                    char::from(other.tag())
                )));
            }
        };

        // AuthenticationOk follows through the startup loop
        client.verify_server_final(&server_final)
    }

    // ==================== Parameter Status ====================

    pub(crate) fn process_parameter_status(&mut self, name: String, value: String) {
        match name.as_str() {
            "server_version" => match parse_server_version(&value) {
                Some(version) => {
                    self.server_version = version;
                    self.codec.server_version = version;
                }
                None => tracing::warn!(value = %value, "could not parse server_version"),
            },
            "TimeZone" => self.time_zone = Some(value.clone()),
            _ => {}
        }
        self.parameters.insert(name, value);
    }

    fn dispatch_notice(&mut self, notice: &ServerError) {
        match &mut self.notice_handler {
            Some(handler) => handler(notice),
            None => tracing::debug!(
                severity = %notice.severity,
                code = %notice.code,
                message = %notice.message,
                "server notice"
            ),
        }
    }

    // ==================== State Tracking ====================

    /// Reject calls on a connection that cannot run statements right now.
    pub(crate) fn check_usable(&self) -> Result<()> {
        match self.state {
            ConnectionState::Bad => return Err(Error::bad_connection()),
            ConnectionState::Closed => {
                return Err(connection_error(
                    ConnectionErrorKind::Disconnected,
                    "connection is closed",
                    None,
                ));
            }
            _ => {}
        }
        if self.in_copy {
            return Err(Error::usage(
                UsageErrorKind::CopyInProgress,
                "COPY in progress",
            ));
        }
        Ok(())
    }

    /// Mark the connection bad when `result` shows the stream is no longer
    /// in a known state.
    ///
    /// Stream failures are reported as the bad-connection sentinel carrying
    /// the original error as its source. Fatal server errors are returned
    /// unchanged; later calls get the sentinel.
    pub(crate) fn classify<T>(&mut self, result: Result<T>) -> Result<T> {
        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if !breaks_connection(&err) {
            return Err(err);
        }
        self.mark_bad();
        match err {
            err @ Error::Query(_) => Err(err),
            err if err.is_bad_connection() => Err(err),
            err => {
                tracing::debug!(error = %err, "connection marked bad");
                Err(Error::Connection(ConnectionError {
                    kind: ConnectionErrorKind::Bad,
                    message: "connection is unusable".to_string(),
                    source: Some(Box::new(err)),
                }))
            }
        }
    }

    pub(crate) fn mark_bad(&mut self) {
        if self.state != ConnectionState::Closed {
            self.state = ConnectionState::Bad;
        }
    }

    pub(crate) fn set_transaction_status(&mut self, status: TransactionStatus) {
        if matches!(self.state, ConnectionState::Bad | ConnectionState::Closed) {
            return;
        }
        self.state = ConnectionState::Ready(status.into());
    }

    pub(crate) fn set_in_copy(&mut self, in_copy: bool) {
        self.in_copy = in_copy;
    }

    fn returning_rewrite<'a>(&self, sql: &'a str) -> (Cow<'a, str>, bool) {
        if self.config.get_last_insert_id {
            add_returning(sql)
        } else {
            (Cow::Borrowed(sql), false)
        }
    }

    // ==================== Low-Level I/O ====================

    pub(crate) fn send_message(&mut self, msg: &FrontendMessage) -> Result<()> {
        let data = self.writer.write(msg);
        self.stream.write_all(data)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Write several messages with a single socket write.
    fn send_batch(&mut self, msgs: &[FrontendMessage]) -> Result<()> {
        self.writer.clear();
        for msg in msgs {
            self.writer.push(msg);
        }
        self.stream.write_all(self.writer.as_bytes())?;
        self.stream.flush()?;
        Ok(())
    }

    /// Write raw, already framed bytes.
    pub(crate) fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data)?;
        self.stream.flush()?;
        Ok(())
    }

    fn receive_message(&mut self) -> Result<BackendMessage> {
        if let Some(msg) = self.saved.take() {
            return Ok(msg);
        }
        read_message(&mut self.stream, &mut self.reader, &mut self.read_buf)
    }

    /// Receive during startup: notices go to the handler.
    fn recv(&mut self) -> Result<BackendMessage> {
        loop {
            match self.receive_message()? {
                BackendMessage::NoticeResponse(notice) => self.dispatch_notice(&notice),
                msg => return Ok(msg),
            }
        }
    }

    /// Receive during a query: notices, notifications and parameter updates
    /// are consumed here. A fatal error ends the session, so it is returned
    /// at once rather than waiting for a ReadyForQuery that never comes.
    pub(crate) fn recv1(&mut self) -> Result<BackendMessage> {
        loop {
            match self.receive_message()? {
                BackendMessage::NoticeResponse(notice) => self.dispatch_notice(&notice),
                BackendMessage::NotificationResponse { channel, .. } => {
                    tracing::trace!(channel = %channel, "ignoring notification outside a listener");
                }
                BackendMessage::ParameterStatus { name, value } => {
                    self.process_parameter_status(name, value);
                }
                BackendMessage::ErrorResponse(e) if e.is_fatal() => {
                    return Err(error_from_server(e, None));
                }
                msg => return Ok(msg),
            }
        }
    }

    /// Push a message back to be returned by the next receive.
    pub(crate) fn save_message(&mut self, msg: BackendMessage) -> Result<()> {
        if let Some(saved) = &self.saved {
            return Err(Error::protocol(format!(
                "unexpected save_message with message '{}' already saved",
                char::from(saved.tag())
            )));
        }
        self.saved = Some(msg);
        Ok(())
    }

    /// Hand the read side to a background reader: a second socket handle and
    /// the buffered reader state.
    pub(crate) fn split_reader(&mut self) -> Result<(KbStream, MessageReader)> {
        let stream = self.stream.try_clone()?;
        Ok((stream, std::mem::take(&mut self.reader)))
    }

    /// Take the read side back from a background reader.
    pub(crate) fn restore_reader(&mut self, reader: MessageReader) {
        self.reader = reader;
    }

    pub(crate) fn shutdown_stream(&self) {
        let _ = self.stream.shutdown();
    }

    pub(crate) fn decode_row(
        &self,
        header: &ResultHeader,
        values: Vec<Option<Vec<u8>>>,
    ) -> Result<Row> {
        let mut out = Vec::with_capacity(values.len());
        for (i, data) in values.into_iter().enumerate() {
            let field = header.fields.get(i).ok_or_else(|| {
                Error::protocol("DataRow has more columns than the RowDescription")
            })?;
            let format = header.formats.get(i).copied().unwrap_or_default();
            out.push(self.decode_column(field.type_oid, data.as_deref(), format)?);
        }
        Ok(Row::with_columns(Arc::clone(&header.columns), out))
    }

    fn decode_column(&self, type_oid: u32, data: Option<&[u8]>, format: Format) -> Result<Value> {
        // Zero-length values only mean something for textual and byte types
        if data.is_some_and(<[u8]>::is_empty)
            && !matches!(
                self.codec.kind(type_oid),
                TypeKind::Text
                    | TypeKind::Json
                    | TypeKind::Bytea
                    | TypeKind::RawBytes
                    | TypeKind::Binary
                    | TypeKind::Refcursor
                    | TypeKind::Array(_)
                    | TypeKind::Unknown
            )
        {
            return Ok(Value::Null);
        }
        self.codec.decode(type_oid, data, format)
    }
}

impl Drop for KbConnection {
    fn drop(&mut self) {
        // Try to close gracefully, ignore errors
        let _ = self.close();
    }
}

fn finish_watched<T>(watcher: CancelWatcher, result: Result<T>) -> Result<T> {
    let fired = watcher.stop();
    match result {
        Err(Error::Query(q)) if fired && q.kind == QueryErrorKind::Cancelled => {
            tracing::debug!("statement cancelled at deadline");
            Err(Error::Timeout)
        }
        other => other,
    }
}

// ==================== Helpers ====================

fn breaks_connection(err: &Error) -> bool {
    match err {
        Error::Protocol(_) | Error::Timeout => true,
        Error::Io(e) => stream_lost(e.kind()),
        Error::Query(q) => q.is_fatal(),
        Error::Connection(c) => matches!(
            c.kind,
            ConnectionErrorKind::Disconnected | ConnectionErrorKind::Ssl | ConnectionErrorKind::Bad
        ),
        Error::Transaction(t) => t.kind == TransactionErrorKind::UnexpectedStatus,
        _ => false,
    }
}

/// I/O failures after which the peer is gone or the stream is out of step.
fn stream_lost(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::WriteZero
            | io::ErrorKind::InvalidData
            | io::ErrorKind::TimedOut
            | io::ErrorKind::WouldBlock
    )
}

fn is_copy(sql: &str) -> bool {
    sql.trim_start()
        .get(..4)
        .is_some_and(|p| p.eq_ignore_ascii_case("copy"))
}

fn unexpected_ready() -> Error {
    Error::protocol("unexpected ReadyForQuery")
}

pub(crate) fn connection_error(
    kind: ConnectionErrorKind,
    message: impl Into<String>,
    source: Option<io::Error>,
) -> Error {
    Error::Connection(ConnectionError {
        kind,
        message: message.into(),
        source: source.map(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
    })
}

fn auth_error(msg: impl Into<String>) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Authentication,
        message: msg.into(),
        source: None,
    })
}

fn transaction_error(kind: TransactionErrorKind, message: impl Into<String>) -> Error {
    Error::Transaction(TransactionError {
        kind,
        message: message.into(),
    })
}

/// Map a server `ErrorResponse` onto the error taxonomy.
pub(crate) fn error_from_server(server: ServerError, sql: Option<&str>) -> Error {
    // Determine error kind from SQLSTATE
    let kind = match server.class() {
        "42" => QueryErrorKind::Syntax,
        "23" => QueryErrorKind::Constraint,
        "40" if server.code == "40001" => QueryErrorKind::Serialization,
        "40" => QueryErrorKind::Deadlock,
        "57" if server.code == "57014" => QueryErrorKind::Cancelled,
        "57" => QueryErrorKind::Timeout,
        "28" => QueryErrorKind::Permission,
        _ => QueryErrorKind::Database,
    };

    Error::Query(QueryError {
        kind,
        sql: sql.map(str::to_owned),
        sqlstate: (!server.code.is_empty()).then(|| server.code.clone()),
        message: server.message.clone(),
        detail: server.detail.clone(),
        hint: server.hint.clone(),
        position: server.position.as_deref().and_then(|p| p.parse().ok()),
        server: Some(server),
        source: None,
    })
}

/// Split a CommandComplete tag into its row count and command word.
pub(crate) fn parse_complete(tag: &str) -> Result<(ExecResult, String)> {
    const COMMANDS_WITH_COUNT: [&str; 6] =
        ["SELECT ", "UPDATE ", "DELETE ", "FETCH ", "MOVE ", "COPY "];

    let mut count = None;
    let mut command = tag;
    for prefix in COMMANDS_WITH_COUNT {
        if let Some(rest) = tag.strip_prefix(prefix) {
            count = Some(rest);
            command = prefix.trim_end();
            break;
        }
    }
    // INSERT carries "INSERT <oid> <rows>"
    if count.is_none() && tag.starts_with("INSERT ") {
        let parts: Vec<&str> = tag.split(' ').collect();
        if parts.len() != 3 {
            return Err(Error::protocol(format!(
                "unexpected INSERT command tag {tag}"
            )));
        }
        count = Some(parts[2]);
        command = "INSERT";
    }

    let rows_affected = match count {
        Some(n) => n
            .parse::<u64>()
            .map_err(|e| Error::protocol(format!("could not parse commandTag: {e}")))?,
        None => 0,
    };
    Ok((
        ExecResult {
            rows_affected,
            last_insert_id: None,
        },
        command.to_string(),
    ))
}

/// Append `RETURNING *` to an INSERT so the generated key comes back.
///
/// Returns the rewritten text and whether it was an INSERT.
pub(crate) fn add_returning(sql: &str) -> (Cow<'_, str>, bool) {
    let trimmed = sql.trim();
    let is_insert = trimmed
        .get(..6)
        .is_some_and(|p| p.eq_ignore_ascii_case("insert"));
    if !is_insert {
        return (Cow::Borrowed(sql), false);
    }
    let rewritten = match trimmed.strip_suffix(';') {
        Some(body) => format!("{body} RETURNING *;"),
        None => format!("{trimmed} RETURNING *"),
    };
    (Cow::Owned(rewritten), true)
}

/// Parse a `server_version` parameter into `major*10000 + minor*100 + patch`.
pub(crate) fn parse_server_version(value: &str) -> Option<i32> {
    let token = value.split_whitespace().next()?;
    let mut parts = token.split('.').map(|part| {
        let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
        digits.parse::<i32>().ok()
    });
    let major = parts.next().flatten()?;
    let minor = parts.next().flatten();
    let patch = parts.next().flatten();
    Some(match (minor, patch) {
        (Some(minor), Some(patch)) => major * 10000 + minor * 100 + patch,
        (Some(minor), None) => major * 10000 + minor,
        (None, _) => major * 10000,
    })
}

// ==================== Quoting ====================

/// Quote an identifier for use in SQL text.
///
/// The name is cut at the first NUL, wrapped in double quotes, and inner
/// double quotes are doubled.
pub fn quote_identifier(name: &str) -> String {
    let name = name.split('\0').next().unwrap_or_default();
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal for use in SQL text.
///
/// Text containing backslashes is written in the escape-string form
/// ` E'...'` with the backslashes doubled.
pub fn quote_literal(literal: &str) -> String {
    let literal = literal.replace('\'', "''");
    if literal.contains('\\') {
        format!(" E'{}'", literal.replace('\\', "\\\\"))
    } else {
        format!("'{literal}'")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_status_conversion() {
        assert_eq!(
            TransactionStatusState::from(TransactionStatus::Idle),
            TransactionStatusState::Idle
        );
        assert_eq!(
            TransactionStatusState::from(TransactionStatus::Transaction),
            TransactionStatusState::InTransaction
        );
        assert_eq!(
            TransactionStatusState::from(TransactionStatus::Error),
            TransactionStatusState::InFailed
        );
    }

    fn server_error(severity: &str, code: &str) -> ServerError {
        ServerError {
            severity: severity.to_string(),
            code: code.to_string(),
            message: "boom".to_string(),
            position: Some("8".to_string()),
            ..ServerError::default()
        }
    }

    fn kind_of(err: &Error) -> QueryErrorKind {
        match err {
            Error::Query(q) => q.kind,
            other => panic!("expected query error, got {other:?}"),
        }
    }

    #[test]
    fn test_error_classification() {
        let cases = [
            ("42601", QueryErrorKind::Syntax),
            ("42P01", QueryErrorKind::Syntax),
            ("23505", QueryErrorKind::Constraint),
            ("40001", QueryErrorKind::Serialization),
            ("40P01", QueryErrorKind::Deadlock),
            ("57014", QueryErrorKind::Cancelled),
            ("57P01", QueryErrorKind::Timeout),
            ("28P01", QueryErrorKind::Permission),
            ("08006", QueryErrorKind::Database),
            ("XX000", QueryErrorKind::Database),
        ];
        for (code, kind) in cases {
            let err = error_from_server(server_error("ERROR", code), Some("SELECT 1"));
            assert_eq!(kind_of(&err), kind, "sqlstate {code}");
        }

        let err = error_from_server(server_error("ERROR", "23505"), Some("INSERT"));
        let Error::Query(q) = err else {
            panic!("expected query error")
        };
        assert_eq!(q.position, Some(8));
        assert_eq!(q.sql.as_deref(), Some("INSERT"));
        assert_eq!(q.server.as_ref().map(|s| s.code.as_str()), Some("23505"));
        assert!(!q.is_fatal());
    }

    #[test]
    fn test_breaks_connection() {
        assert!(breaks_connection(&Error::protocol("bad frame")));
        assert!(breaks_connection(&error_from_server(
            server_error("FATAL", "57P01"),
            None
        )));
        assert!(!breaks_connection(&error_from_server(
            server_error("ERROR", "42601"),
            None
        )));
        assert!(breaks_connection(&connection_error(
            ConnectionErrorKind::Disconnected,
            "eof",
            None
        )));
        assert!(!breaks_connection(&Error::usage(
            UsageErrorKind::ParameterCount,
            "count"
        )));
        assert!(breaks_connection(&transaction_error(
            TransactionErrorKind::UnexpectedStatus,
            "status"
        )));
        assert!(!breaks_connection(&transaction_error(
            TransactionErrorKind::InFailedTransaction,
            "failed"
        )));
    }

    #[test]
    fn test_only_lost_streams_break_connection() {
        for kind in [
            io::ErrorKind::UnexpectedEof,
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::TimedOut,
        ] {
            assert!(breaks_connection(&Error::Io(io::Error::from(kind))), "{kind:?}");
        }
        for kind in [
            io::ErrorKind::PermissionDenied,
            io::ErrorKind::InvalidInput,
            io::ErrorKind::Other,
        ] {
            assert!(!breaks_connection(&Error::Io(io::Error::from(kind))), "{kind:?}");
        }
    }

    #[test]
    fn test_parse_complete() {
        let (res, cmd) = parse_complete("SELECT 3").unwrap();
        assert_eq!((res.rows_affected, cmd.as_str()), (3, "SELECT"));
        let (res, cmd) = parse_complete("INSERT 0 2").unwrap();
        assert_eq!((res.rows_affected, cmd.as_str()), (2, "INSERT"));
        let (res, cmd) = parse_complete("COPY 100").unwrap();
        assert_eq!((res.rows_affected, cmd.as_str()), (100, "COPY"));
        let (res, cmd) = parse_complete("CREATE TABLE").unwrap();
        assert_eq!((res.rows_affected, cmd.as_str()), (0, "CREATE TABLE"));
        let (res, cmd) = parse_complete("BEGIN").unwrap();
        assert_eq!((res.rows_affected, cmd.as_str()), (0, "BEGIN"));

        assert!(parse_complete("INSERT 5").is_err());
        assert!(parse_complete("UPDATE many").is_err());
    }

    #[test]
    fn test_add_returning() {
        let (sql, insert) = add_returning("  insert into t values (1)  ");
        assert!(insert);
        assert_eq!(sql, "insert into t values (1) RETURNING *");

        let (sql, insert) = add_returning("INSERT INTO t VALUES (1);");
        assert!(insert);
        assert_eq!(sql, "INSERT INTO t VALUES (1) RETURNING *;");

        let (sql, insert) = add_returning("update t set a = 1");
        assert!(!insert);
        assert_eq!(sql, "update t set a = 1");
    }

    #[test]
    fn test_parse_server_version() {
        assert_eq!(parse_server_version("12.1.4"), Some(120_104));
        assert_eq!(parse_server_version("8.4.22"), Some(80_422));
        assert_eq!(parse_server_version("12.4"), Some(120_004));
        assert_eq!(parse_server_version("12.1 (Kingbase)"), Some(120_001));
        assert_eq!(parse_server_version("V8R6"), None);
        assert_eq!(parse_server_version(""), None);
    }

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("users"), "\"users\"");
        assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_identifier("cut\0here"), "\"cut\"");
    }

    #[test]
    fn test_quote_literal() {
        assert_eq!(quote_literal("plain"), "'plain'");
        assert_eq!(quote_literal("it's"), "'it''s'");
        assert_eq!(quote_literal("C:\\dir"), " E'C:\\\\dir'");
    }

    #[test]
    fn test_is_copy() {
        assert!(is_copy("COPY t FROM STDIN"));
        assert!(is_copy("  copy t (a) from stdin"));
        assert!(!is_copy("SELECT 1"));
        assert!(!is_copy("cop"));
    }
}
