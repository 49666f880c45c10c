//! Core types shared by the kbwire client.
//!
//! This crate holds the vocabulary every layer of the wire client speaks:
//!
//! - `Error` and its per-category structs for typed failures
//! - `Value`, the closed set of SQL values the codec encodes and decodes
//! - `Row` and `ColumnInfo` for result rows

pub mod error;
pub mod row;
pub mod value;

pub use error::{
    ConfigError, ConnectionError, ConnectionErrorKind, Error, ProtocolError, QueryError,
    QueryErrorKind, Result, ServerError, TransactionError, TransactionErrorKind, TypeError,
    UsageError, UsageErrorKind,
};
pub use row::{ColumnInfo, FromValue, Row};
pub use value::Value;
