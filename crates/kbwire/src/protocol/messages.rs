//! Message catalogue for protocol version 3.0.
//!
//! Frontend messages are built by the caller and encoded by
//! [`MessageWriter`](super::MessageWriter); backend messages are produced by
//! [`MessageReader`](super::MessageReader).

use kbwire_core::ServerError;

/// Protocol version 3.0, sent in the startup packet.
pub const PROTOCOL_VERSION: i32 = 196_608;

/// Magic code of the SSLRequest pseudo-message.
pub const SSL_REQUEST_CODE: i32 = 80_877_103;

/// Magic code of the CancelRequest pseudo-message.
pub const CANCEL_REQUEST_CODE: i32 = 80_877_102;

/// Type tags of frontend messages.
pub mod frontend_type {
    pub const QUERY: u8 = b'Q';
    pub const PARSE: u8 = b'P';
    pub const BIND: u8 = b'B';
    pub const DESCRIBE: u8 = b'D';
    pub const EXECUTE: u8 = b'E';
    pub const SYNC: u8 = b'S';
    pub const CLOSE: u8 = b'C';
    pub const TERMINATE: u8 = b'X';
    pub const FLUSH: u8 = b'H';
    pub const PASSWORD: u8 = b'p';
    pub const COPY_DATA: u8 = b'd';
    pub const COPY_DONE: u8 = b'c';
    pub const COPY_FAIL: u8 = b'f';
}

/// Type tags of backend messages.
pub mod backend_type {
    pub const AUTHENTICATION: u8 = b'R';
    pub const BACKEND_KEY_DATA: u8 = b'K';
    pub const PARAMETER_STATUS: u8 = b'S';
    pub const READY_FOR_QUERY: u8 = b'Z';
    pub const ROW_DESCRIPTION: u8 = b'T';
    pub const DATA_ROW: u8 = b'D';
    pub const COMMAND_COMPLETE: u8 = b'C';
    pub const EMPTY_QUERY_RESPONSE: u8 = b'I';
    pub const ERROR_RESPONSE: u8 = b'E';
    pub const NOTICE_RESPONSE: u8 = b'N';
    pub const NOTIFICATION_RESPONSE: u8 = b'A';
    pub const PARSE_COMPLETE: u8 = b'1';
    pub const BIND_COMPLETE: u8 = b'2';
    pub const CLOSE_COMPLETE: u8 = b'3';
    pub const PARAMETER_DESCRIPTION: u8 = b't';
    pub const NO_DATA: u8 = b'n';
    pub const PORTAL_SUSPENDED: u8 = b's';
    pub const COPY_IN_RESPONSE: u8 = b'G';
    pub const COPY_OUT_RESPONSE: u8 = b'H';
    pub const COPY_DATA: u8 = b'd';
    pub const COPY_DONE: u8 = b'c';
}

/// Authentication request codes carried by `R` messages.
pub mod auth_code {
    pub const OK: i32 = 0;
    pub const CLEARTEXT: i32 = 3;
    pub const MD5: i32 = 5;
    pub const SASL: i32 = 10;
    pub const SASL_CONTINUE: i32 = 11;
    pub const SASL_FINAL: i32 = 12;
    pub const SM3: i32 = 13;
}

/// Target of a Describe or Close message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescribeKind {
    Statement,
    Portal,
}

impl DescribeKind {
    pub fn as_byte(self) -> u8 {
        match self {
            DescribeKind::Statement => b'S',
            DescribeKind::Portal => b'P',
        }
    }
}

/// Messages sent by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum FrontendMessage {
    Startup {
        version: i32,
        params: Vec<(String, String)>,
    },
    PasswordMessage(String),
    SASLInitialResponse {
        mechanism: String,
        data: Vec<u8>,
    },
    SASLResponse(Vec<u8>),
    Query(String),
    Parse {
        name: String,
        query: String,
        param_types: Vec<u32>,
    },
    Bind {
        portal: String,
        statement: String,
        param_formats: Vec<i16>,
        params: Vec<Option<Vec<u8>>>,
        result_formats: Vec<i16>,
    },
    Describe {
        kind: DescribeKind,
        name: String,
    },
    Execute {
        portal: String,
        max_rows: i32,
    },
    Close {
        kind: DescribeKind,
        name: String,
    },
    Sync,
    Flush,
    CopyData(Vec<u8>),
    CopyDone,
    CopyFail(String),
    Terminate,
    CancelRequest {
        process_id: i32,
        secret_key: i32,
    },
    SSLRequest,
}

/// Transaction status byte of ReadyForQuery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// 'I'
    Idle,
    /// 'T'
    Transaction,
    /// 'E'
    Error,
}

impl TransactionStatus {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'I' => Some(TransactionStatus::Idle),
            b'T' => Some(TransactionStatus::Transaction),
            b'E' => Some(TransactionStatus::Error),
            _ => None,
        }
    }
}

/// One column of a RowDescription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: u32,
    pub column_id: i16,
    pub type_oid: u32,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: i16,
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendMessage {
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMD5Password([u8; 4]),
    AuthenticationSM3Password([u8; 4]),
    AuthenticationSASL(Vec<String>),
    AuthenticationSASLContinue(Vec<u8>),
    AuthenticationSASLFinal(Vec<u8>),
    /// Any authentication code this client does not implement
    AuthenticationUnsupported(i32),
    BackendKeyData {
        process_id: i32,
        secret_key: i32,
    },
    ParameterStatus {
        name: String,
        value: String,
    },
    ReadyForQuery(TransactionStatus),
    RowDescription(Vec<FieldDescription>),
    DataRow(Vec<Option<Vec<u8>>>),
    CommandComplete(String),
    EmptyQueryResponse,
    ErrorResponse(ServerError),
    NoticeResponse(ServerError),
    NotificationResponse {
        process_id: i32,
        channel: String,
        payload: String,
    },
    ParseComplete,
    BindComplete,
    CloseComplete,
    ParameterDescription(Vec<u32>),
    NoData,
    PortalSuspended,
    CopyInResponse {
        format: i8,
        column_formats: Vec<i16>,
    },
    CopyOutResponse {
        format: i8,
        column_formats: Vec<i16>,
    },
    CopyData(Vec<u8>),
    CopyDone,
}

impl BackendMessage {
    /// The wire tag this message arrived with.
    pub fn tag(&self) -> u8 {
        use backend_type as t;
        match self {
            BackendMessage::AuthenticationOk
            | BackendMessage::AuthenticationCleartextPassword
            | BackendMessage::AuthenticationMD5Password(_)
            | BackendMessage::AuthenticationSM3Password(_)
            | BackendMessage::AuthenticationSASL(_)
            | BackendMessage::AuthenticationSASLContinue(_)
            | BackendMessage::AuthenticationSASLFinal(_)
            | BackendMessage::AuthenticationUnsupported(_) => t::AUTHENTICATION,
            BackendMessage::BackendKeyData { .. } => t::BACKEND_KEY_DATA,
            BackendMessage::ParameterStatus { .. } => t::PARAMETER_STATUS,
            BackendMessage::ReadyForQuery(_) => t::READY_FOR_QUERY,
            BackendMessage::RowDescription(_) => t::ROW_DESCRIPTION,
            BackendMessage::DataRow(_) => t::DATA_ROW,
            BackendMessage::CommandComplete(_) => t::COMMAND_COMPLETE,
            BackendMessage::EmptyQueryResponse => t::EMPTY_QUERY_RESPONSE,
            BackendMessage::ErrorResponse(_) => t::ERROR_RESPONSE,
            BackendMessage::NoticeResponse(_) => t::NOTICE_RESPONSE,
            BackendMessage::NotificationResponse { .. } => t::NOTIFICATION_RESPONSE,
            BackendMessage::ParseComplete => t::PARSE_COMPLETE,
            BackendMessage::BindComplete => t::BIND_COMPLETE,
            BackendMessage::CloseComplete => t::CLOSE_COMPLETE,
            BackendMessage::ParameterDescription(_) => t::PARAMETER_DESCRIPTION,
            BackendMessage::NoData => t::NO_DATA,
            BackendMessage::PortalSuspended => t::PORTAL_SUSPENDED,
            BackendMessage::CopyInResponse { .. } => t::COPY_IN_RESPONSE,
            BackendMessage::CopyOutResponse { .. } => t::COPY_OUT_RESPONSE,
            BackendMessage::CopyData(_) => t::COPY_DATA,
            BackendMessage::CopyDone => t::COPY_DONE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_status_bytes() {
        assert_eq!(TransactionStatus::from_byte(b'I'), Some(TransactionStatus::Idle));
        assert_eq!(
            TransactionStatus::from_byte(b'T'),
            Some(TransactionStatus::Transaction)
        );
        assert_eq!(TransactionStatus::from_byte(b'E'), Some(TransactionStatus::Error));
        assert_eq!(TransactionStatus::from_byte(b'X'), None);
    }

    #[test]
    fn test_backend_tags() {
        assert_eq!(BackendMessage::AuthenticationOk.tag(), b'R');
        assert_eq!(BackendMessage::NoData.tag(), b'n');
        assert_eq!(
            BackendMessage::CopyInResponse {
                format: 0,
                column_formats: vec![]
            }
            .tag(),
            b'G'
        );
    }
}
