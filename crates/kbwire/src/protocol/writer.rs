//! Frontend message encoder.
//!
//! `write` encodes one message into a fresh buffer; `push` appends so that the
//! extended-query pipeline (Parse, Bind, Describe, Execute, Sync) goes out in
//! a single socket write.

#![allow(clippy::cast_possible_truncation)]

use super::buffer::WriteBuffer;
use super::messages::{
    CANCEL_REQUEST_CODE, DescribeKind, FrontendMessage, SSL_REQUEST_CODE, frontend_type,
};

/// Buffer for writing protocol messages.
///
/// All multi-byte integers are written in big-endian (network) byte order.
#[derive(Debug, Clone)]
pub struct MessageWriter {
    buf: WriteBuffer,
}

impl Default for MessageWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageWriter {
    /// Create a new message writer with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// Create a new message writer with specified capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: WriteBuffer::with_capacity(capacity),
        }
    }

    /// Clear the internal buffer.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Get the current buffer contents.
    pub fn as_bytes(&self) -> &[u8] {
        self.buf.as_bytes()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Take ownership of the buffer, leaving an empty one in its place.
    pub fn take(&mut self) -> Vec<u8> {
        self.buf.take()
    }

    /// Encode a single frontend message, replacing anything buffered.
    pub fn write(&mut self, msg: &FrontendMessage) -> &[u8] {
        self.buf.clear();
        self.push(msg);
        self.buf.as_bytes()
    }

    /// Append a frontend message to whatever is already buffered.
    pub fn push(&mut self, msg: &FrontendMessage) {
        match msg {
            FrontendMessage::Startup { version, params } => {
                self.write_startup(*version, params);
            }
            FrontendMessage::PasswordMessage(password) => {
                self.write_string_message(frontend_type::PASSWORD, password);
            }
            FrontendMessage::SASLInitialResponse { mechanism, data } => {
                self.write_sasl_initial(mechanism, data);
            }
            FrontendMessage::SASLResponse(data) => {
                self.write_bytes_message(frontend_type::PASSWORD, data);
            }
            FrontendMessage::Query(query) => {
                self.write_string_message(frontend_type::QUERY, query);
            }
            FrontendMessage::Parse {
                name,
                query,
                param_types,
            } => {
                self.write_parse(name, query, param_types);
            }
            FrontendMessage::Bind {
                portal,
                statement,
                param_formats,
                params,
                result_formats,
            } => {
                self.write_bind(portal, statement, param_formats, params, result_formats);
            }
            FrontendMessage::Describe { kind, name } => {
                self.write_target(frontend_type::DESCRIBE, *kind, name);
            }
            FrontendMessage::Execute { portal, max_rows } => {
                let pos = self.buf.begin(frontend_type::EXECUTE);
                self.buf.put_cstr(portal);
                self.buf.put_i32(*max_rows);
                self.buf.finish(pos);
            }
            FrontendMessage::Close { kind, name } => {
                self.write_target(frontend_type::CLOSE, *kind, name);
            }
            FrontendMessage::Sync => self.write_empty_message(frontend_type::SYNC),
            FrontendMessage::Flush => self.write_empty_message(frontend_type::FLUSH),
            FrontendMessage::CopyData(data) => {
                self.write_bytes_message(frontend_type::COPY_DATA, data);
            }
            FrontendMessage::CopyDone => self.write_empty_message(frontend_type::COPY_DONE),
            FrontendMessage::CopyFail(message) => {
                self.write_string_message(frontend_type::COPY_FAIL, message);
            }
            FrontendMessage::Terminate => self.write_empty_message(frontend_type::TERMINATE),
            FrontendMessage::CancelRequest {
                process_id,
                secret_key,
            } => {
                let pos = self.buf.begin_untagged();
                self.buf.put_i32(CANCEL_REQUEST_CODE);
                self.buf.put_i32(*process_id);
                self.buf.put_i32(*secret_key);
                self.buf.finish(pos);
            }
            FrontendMessage::SSLRequest => {
                let pos = self.buf.begin_untagged();
                self.buf.put_i32(SSL_REQUEST_CODE);
                self.buf.finish(pos);
            }
        }
    }

    // ==================== Message Encoders ====================

    /// Startup packet: version, then key/value pairs, then an empty key.
    fn write_startup(&mut self, version: i32, params: &[(String, String)]) {
        let pos = self.buf.begin_untagged();
        self.buf.put_i32(version);
        for (key, value) in params {
            self.buf.put_cstr(key);
            self.buf.put_cstr(value);
        }
        self.buf.put_u8(0);
        self.buf.finish(pos);
    }

    fn write_sasl_initial(&mut self, mechanism: &str, data: &[u8]) {
        let pos = self.buf.begin(frontend_type::PASSWORD);
        self.buf.put_cstr(mechanism);
        if data.is_empty() {
            self.buf.put_i32(-1);
        } else {
            self.buf.put_i32(data.len() as i32);
            self.buf.put_bytes(data);
        }
        self.buf.finish(pos);
    }

    fn write_parse(&mut self, name: &str, query: &str, param_types: &[u32]) {
        let pos = self.buf.begin(frontend_type::PARSE);
        self.buf.put_cstr(name);
        self.buf.put_cstr(query);
        self.buf.put_i16(param_types.len() as i16);
        for &oid in param_types {
            self.buf.put_u32(oid);
        }
        self.buf.finish(pos);
    }

    fn write_bind(
        &mut self,
        portal: &str,
        statement: &str,
        param_formats: &[i16],
        params: &[Option<Vec<u8>>],
        result_formats: &[i16],
    ) {
        let pos = self.buf.begin(frontend_type::BIND);
        self.buf.put_cstr(portal);
        self.buf.put_cstr(statement);

        self.buf.put_i16(param_formats.len() as i16);
        for &fmt in param_formats {
            self.buf.put_i16(fmt);
        }

        self.buf.put_i16(params.len() as i16);
        for param in params {
            match param {
                Some(data) => {
                    self.buf.put_i32(data.len() as i32);
                    self.buf.put_bytes(data);
                }
                // NULL
                None => self.buf.put_i32(-1),
            }
        }

        self.buf.put_i16(result_formats.len() as i16);
        for &fmt in result_formats {
            self.buf.put_i16(fmt);
        }
        self.buf.finish(pos);
    }

    /// Describe and Close share a layout: kind byte plus name.
    fn write_target(&mut self, tag: u8, kind: DescribeKind, name: &str) {
        let pos = self.buf.begin(tag);
        self.buf.put_u8(kind.as_byte());
        self.buf.put_cstr(name);
        self.buf.finish(pos);
    }

    // ==================== Helper Methods ====================

    fn write_empty_message(&mut self, tag: u8) {
        let pos = self.buf.begin(tag);
        self.buf.finish(pos);
    }

    fn write_string_message(&mut self, tag: u8, s: &str) {
        let pos = self.buf.begin(tag);
        self.buf.put_cstr(s);
        self.buf.finish(pos);
    }

    fn write_bytes_message(&mut self, tag: u8, data: &[u8]) {
        let pos = self.buf.begin(tag);
        self.buf.put_bytes(data);
        self.buf.finish(pos);
    }
}
