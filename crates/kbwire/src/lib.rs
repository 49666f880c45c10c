//! Kingbase wire-protocol client.
//!
//! `kbwire` speaks the PostgreSQL-family frontend/backend protocol as spoken
//! by Kingbase servers, over blocking sockets. It provides:
//!
//! - Message framing and parsing
//! - Authentication (cleartext, MD5, SM3, SCRAM-SHA-256, SCRAM-SM3)
//! - TLS upgrade with rustls (feature `tls`, on by default)
//! - Simple and extended query protocols, prepared statements and transactions
//! - Bulk loading with `COPY ... FROM STDIN`
//! - LISTEN/NOTIFY with automatic reconnection
//! - Out-of-band cancellation and statement timeouts
//!
//! # Compatibility modes
//!
//! A Kingbase server runs in Oracle, MySQL or SQL Server compatibility mode,
//! and each mode numbers some types differently. The mode is read once per
//! connection with `show database_mode` and selects the OID catalog used by
//! the [`types`] codec.
//!
//! # Errors
//!
//! Every call returns [`kbwire_core::Error`]. When the stream can no longer
//! be trusted (protocol violation, FATAL server error, EOF, TLS failure) the
//! connection is marked bad and every later call fails fast with the error
//! for which [`Error::is_bad_connection`] is true, so a pool can discard it.
//!
//! # Example
//!
//! ```rust,ignore
//! use kbwire::{KbConfig, KbConnection, Value};
//!
//! let config = KbConfig::new("localhost", "system", "test")
//!     .port(54321)
//!     .password("secret");
//!
//! let mut conn = KbConnection::connect(config)?;
//! conn.exec("CREATE TABLE t (id int, name text)", &[])?;
//! conn.exec("INSERT INTO t VALUES ($1, $2)", &[Value::Int(1), Value::Text("a".into())])?;
//! for row in conn.query("SELECT id, name FROM t", &[])? {
//!     let row = row?;
//!     println!("{:?}", row.get_named::<String>("name")?);
//! }
//! ```

pub mod auth;
pub mod cancel;
pub mod config;
pub mod connection;
pub mod copy;
pub mod error_codes;
pub mod notify;
pub mod protocol;
pub mod rows;
pub mod statement;
#[cfg(feature = "tls")]
mod tls;
pub mod types;

pub use cancel::CancelToken;
pub use config::{KbConfig, SslMode};
pub use connection::{
    ConnectionState, KbConnection, TransactionStatusState, quote_identifier, quote_literal,
};
pub use copy::{CopyIn, copy_in, copy_in_schema};
pub use notify::{Dialer, Listener, ListenerConn, ListenerEvent, Notification};
pub use rows::{ExecResult, Rows};
pub use statement::Statement;
pub use types::{CodecConfig, Dialect, Format};

pub use kbwire_core::{ColumnInfo, Error, FromValue, Result, Row, ServerError, Value};
