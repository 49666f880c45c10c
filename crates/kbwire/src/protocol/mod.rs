//! Wire protocol framing.

pub mod buffer;
pub mod messages;
pub mod reader;
pub mod writer;

pub use buffer::{ReadBuffer, WriteBuffer};
pub use messages::{
    BackendMessage, CANCEL_REQUEST_CODE, DescribeKind, FieldDescription, FrontendMessage,
    PROTOCOL_VERSION, SSL_REQUEST_CODE, TransactionStatus,
};
pub use reader::MessageReader;
pub use writer::MessageWriter;
