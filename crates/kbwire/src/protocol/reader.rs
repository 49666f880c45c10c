//! Incremental backend message parser.
//!
//! Bytes from the socket are fed in arbitrary chunks; `next_message` yields a
//! message once its full frame has arrived.

use kbwire_core::{Error, ServerError};

use super::buffer::ReadBuffer;
use super::messages::{
    BackendMessage, FieldDescription, TransactionStatus, auth_code, backend_type,
};

/// Upper bound on a single backend frame.
const MAX_MESSAGE_LEN: usize = 1 << 30;

/// Accumulates socket bytes and splits them into backend messages.
#[derive(Debug, Default)]
pub struct MessageReader {
    buf: Vec<u8>,
    pos: usize,
}

impl MessageReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes read from the socket.
    pub fn feed(&mut self, data: &[u8]) {
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        self.buf.extend_from_slice(data);
    }

    /// Number of buffered bytes not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Split off the next complete frame as `(tag, body)`.
    pub fn next_frame(&mut self) -> Result<Option<(u8, Vec<u8>)>, Error> {
        let avail = &self.buf[self.pos..];
        if avail.len() < 5 {
            return Ok(None);
        }
        let tag = avail[0];
        let len = i32::from_be_bytes([avail[1], avail[2], avail[3], avail[4]]);
        let len = usize::try_from(len)
            .ok()
            .filter(|&l| (4..=MAX_MESSAGE_LEN).contains(&l))
            .ok_or_else(|| {
                Error::protocol(format!(
                    "invalid length {} for message '{}'",
                    len,
                    char::from(tag)
                ))
            })?;
        if avail.len() < 1 + len {
            return Ok(None);
        }
        let body = avail[5..=len].to_vec();
        self.pos += 1 + len;
        if self.pos == self.buf.len() {
            self.buf.clear();
            self.pos = 0;
        }
        Ok(Some((tag, body)))
    }

    /// Parse the next complete message, if one is buffered.
    pub fn next_message(&mut self) -> Result<Option<BackendMessage>, Error> {
        match self.next_frame()? {
            Some((tag, body)) => parse_message(tag, &body).map(Some),
            None => Ok(None),
        }
    }
}

/// Decode one backend message body.
pub fn parse_message(tag: u8, body: &[u8]) -> Result<BackendMessage, Error> {
    use backend_type as t;

    let mut r = ReadBuffer::new(body);
    let msg = match tag {
        t::AUTHENTICATION => parse_authentication(&mut r)?,
        t::BACKEND_KEY_DATA => BackendMessage::BackendKeyData {
            process_id: r.read_i32()?,
            secret_key: r.read_i32()?,
        },
        t::PARAMETER_STATUS => BackendMessage::ParameterStatus {
            name: r.read_cstr()?,
            value: r.read_cstr()?,
        },
        t::READY_FOR_QUERY => {
            let b = r.read_u8()?;
            let status = TransactionStatus::from_byte(b).ok_or_else(|| {
                Error::protocol(format!("unknown transaction status '{}'", char::from(b)))
            })?;
            BackendMessage::ReadyForQuery(status)
        }
        t::ROW_DESCRIPTION => {
            let n = r.read_u16()?;
            let mut fields = Vec::with_capacity(usize::from(n));
            for _ in 0..n {
                fields.push(FieldDescription {
                    name: r.read_cstr()?,
                    table_oid: r.read_u32()?,
                    column_id: r.read_i16()?,
                    type_oid: r.read_u32()?,
                    type_size: r.read_i16()?,
                    type_modifier: r.read_i32()?,
                    format: r.read_i16()?,
                });
            }
            BackendMessage::RowDescription(fields)
        }
        t::DATA_ROW => {
            let n = r.read_u16()?;
            let mut values = Vec::with_capacity(usize::from(n));
            for _ in 0..n {
                let len = r.read_i32()?;
                if len < 0 {
                    values.push(None);
                } else {
                    values.push(Some(r.next(len as usize)?.to_vec()));
                }
            }
            BackendMessage::DataRow(values)
        }
        t::COMMAND_COMPLETE => BackendMessage::CommandComplete(r.read_cstr()?),
        t::EMPTY_QUERY_RESPONSE => BackendMessage::EmptyQueryResponse,
        t::ERROR_RESPONSE => BackendMessage::ErrorResponse(parse_error_fields(&mut r)?),
        t::NOTICE_RESPONSE => BackendMessage::NoticeResponse(parse_error_fields(&mut r)?),
        t::NOTIFICATION_RESPONSE => BackendMessage::NotificationResponse {
            process_id: r.read_i32()?,
            channel: r.read_cstr()?,
            payload: r.read_cstr()?,
        },
        t::PARSE_COMPLETE => BackendMessage::ParseComplete,
        t::BIND_COMPLETE => BackendMessage::BindComplete,
        t::CLOSE_COMPLETE => BackendMessage::CloseComplete,
        t::PARAMETER_DESCRIPTION => {
            let n = r.read_u16()?;
            let mut oids = Vec::with_capacity(usize::from(n));
            for _ in 0..n {
                oids.push(r.read_u32()?);
            }
            BackendMessage::ParameterDescription(oids)
        }
        t::NO_DATA => BackendMessage::NoData,
        t::PORTAL_SUSPENDED => BackendMessage::PortalSuspended,
        t::COPY_IN_RESPONSE | t::COPY_OUT_RESPONSE => {
            let format = r.read_u8()? as i8;
            let n = r.read_u16()?;
            let mut column_formats = Vec::with_capacity(usize::from(n));
            for _ in 0..n {
                column_formats.push(r.read_i16()?);
            }
            if tag == t::COPY_IN_RESPONSE {
                BackendMessage::CopyInResponse {
                    format,
                    column_formats,
                }
            } else {
                BackendMessage::CopyOutResponse {
                    format,
                    column_formats,
                }
            }
        }
        t::COPY_DATA => BackendMessage::CopyData(r.rest().to_vec()),
        t::COPY_DONE => BackendMessage::CopyDone,
        other => {
            return Err(Error::protocol(format!(
                "unknown response for simple query: '{}'",
                char::from(other)
            )));
        }
    };
    Ok(msg)
}

fn parse_authentication(r: &mut ReadBuffer<'_>) -> Result<BackendMessage, Error> {
    let code = r.read_i32()?;
    let msg = match code {
        auth_code::OK => BackendMessage::AuthenticationOk,
        auth_code::CLEARTEXT => BackendMessage::AuthenticationCleartextPassword,
        auth_code::MD5 | auth_code::SM3 => {
            let salt = r.next(4)?;
            let salt = [salt[0], salt[1], salt[2], salt[3]];
            if code == auth_code::MD5 {
                BackendMessage::AuthenticationMD5Password(salt)
            } else {
                BackendMessage::AuthenticationSM3Password(salt)
            }
        }
        auth_code::SASL => {
            let mut mechanisms = Vec::new();
            loop {
                let m = r.read_cstr()?;
                if m.is_empty() {
                    break;
                }
                mechanisms.push(m);
            }
            BackendMessage::AuthenticationSASL(mechanisms)
        }
        auth_code::SASL_CONTINUE => BackendMessage::AuthenticationSASLContinue(r.rest().to_vec()),
        auth_code::SASL_FINAL => BackendMessage::AuthenticationSASLFinal(r.rest().to_vec()),
        other => BackendMessage::AuthenticationUnsupported(other),
    };
    Ok(msg)
}

/// Parse the field list of an ErrorResponse or NoticeResponse.
pub fn parse_error_fields(r: &mut ReadBuffer<'_>) -> Result<ServerError, Error> {
    let mut err = ServerError::default();
    loop {
        let field = r.read_u8()?;
        if field == 0 {
            break;
        }
        let value = r.read_cstr()?;
        match field {
            b'S' => err.severity = value,
            // Non-localized severity; only fills in when 'S' was absent.
            b'V' => {
                if err.severity.is_empty() {
                    err.severity = value;
                }
            }
            b'C' => err.code = value,
            b'M' => err.message = value,
            b'D' => err.detail = Some(value),
            b'H' => err.hint = Some(value),
            b'P' => err.position = Some(value),
            b'p' => err.internal_position = Some(value),
            b'q' => err.internal_query = Some(value),
            b'W' => err.where_ = Some(value),
            b's' => err.schema = Some(value),
            b't' => err.table = Some(value),
            b'c' => err.column = Some(value),
            b'd' => err.data_type_name = Some(value),
            b'n' => err.constraint = Some(value),
            b'F' => err.file = Some(value),
            b'L' => err.line = Some(value),
            b'R' => err.routine = Some(value),
            _ => {}
        }
    }
    Ok(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tag: u8, body: &[u8]) -> Vec<u8> {
        let mut out = vec![tag];
        out.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn test_partial_frames() {
        let bytes = frame(b'Z', b"I");
        let mut reader = MessageReader::new();
        reader.feed(&bytes[..3]);
        assert!(reader.next_message().unwrap().is_none());
        reader.feed(&bytes[3..]);
        assert_eq!(
            reader.next_message().unwrap(),
            Some(BackendMessage::ReadyForQuery(TransactionStatus::Idle))
        );
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn test_consumed_bytes_are_reclaimed_mid_frame() {
        let frame_bytes = frame(b'd', &[b'x'; 100]);
        let stream: Vec<u8> = (0..200).flat_map(|_| frame_bytes.clone()).collect();
        let mut reader = MessageReader::new();
        let mut decoded = 0;
        // 150-byte chunks rarely end on a 105-byte frame boundary
        for chunk in stream.chunks(150) {
            reader.feed(chunk);
            while let Some((tag, body)) = reader.next_frame().unwrap() {
                assert_eq!(tag, b'd');
                assert_eq!(body.len(), 100);
                decoded += 1;
            }
            assert!(
                reader.buf.len() <= frame_bytes.len() + 150,
                "buf grew to {}",
                reader.buf.len()
            );
        }
        assert_eq!(decoded, 200);
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn test_multiple_messages_in_one_feed() {
        let mut bytes = frame(b'C', b"SELECT 1\0");
        bytes.extend(frame(b'Z', b"T"));
        let mut reader = MessageReader::new();
        reader.feed(&bytes);
        assert_eq!(
            reader.next_message().unwrap(),
            Some(BackendMessage::CommandComplete("SELECT 1".into()))
        );
        assert_eq!(
            reader.next_message().unwrap(),
            Some(BackendMessage::ReadyForQuery(TransactionStatus::Transaction))
        );
        assert_eq!(reader.next_message().unwrap(), None);
    }

    #[test]
    fn test_data_row_with_null() {
        let mut body = vec![0, 2];
        body.extend_from_slice(&1i32.to_be_bytes());
        body.push(b'1');
        body.extend_from_slice(&(-1i32).to_be_bytes());
        let msg = parse_message(b'D', &body).unwrap();
        assert_eq!(msg, BackendMessage::DataRow(vec![Some(b"1".to_vec()), None]));
    }

    #[test]
    fn test_row_description() {
        let mut body = vec![0, 1];
        body.extend_from_slice(b"id\0");
        body.extend_from_slice(&0u32.to_be_bytes());
        body.extend_from_slice(&0i16.to_be_bytes());
        body.extend_from_slice(&23u32.to_be_bytes());
        body.extend_from_slice(&4i16.to_be_bytes());
        body.extend_from_slice(&(-1i32).to_be_bytes());
        body.extend_from_slice(&0i16.to_be_bytes());
        match parse_message(b'T', &body).unwrap() {
            BackendMessage::RowDescription(fields) => {
                assert_eq!(fields.len(), 1);
                assert_eq!(fields[0].name, "id");
                assert_eq!(fields[0].type_oid, 23);
                assert_eq!(fields[0].type_modifier, -1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_error_response_fields() {
        let body = b"SFATAL\0C28P01\0Mpassword authentication failed\0Rauth_failed\0\0";
        match parse_message(b'E', body).unwrap() {
            BackendMessage::ErrorResponse(e) => {
                assert_eq!(e.severity, "FATAL");
                assert_eq!(e.code, "28P01");
                assert_eq!(e.message, "password authentication failed");
                assert_eq!(e.routine.as_deref(), Some("auth_failed"));
                assert!(e.is_fatal());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_authentication_codes() {
        let mut body = 5i32.to_be_bytes().to_vec();
        body.extend_from_slice(b"salt");
        assert_eq!(
            parse_message(b'R', &body).unwrap(),
            BackendMessage::AuthenticationMD5Password(*b"salt")
        );

        let mut body = 13i32.to_be_bytes().to_vec();
        body.extend_from_slice(&[1, 2, 3, 4]);
        assert_eq!(
            parse_message(b'R', &body).unwrap(),
            BackendMessage::AuthenticationSM3Password([1, 2, 3, 4])
        );

        let mut body = 10i32.to_be_bytes().to_vec();
        body.extend_from_slice(b"SCRAM-SHA-256\0SCRAM-SM3\0\0");
        assert_eq!(
            parse_message(b'R', &body).unwrap(),
            BackendMessage::AuthenticationSASL(vec!["SCRAM-SHA-256".into(), "SCRAM-SM3".into()])
        );

        assert_eq!(
            parse_message(b'R', &7i32.to_be_bytes()).unwrap(),
            BackendMessage::AuthenticationUnsupported(7)
        );
    }

    #[test]
    fn test_notification() {
        let mut body = 42i32.to_be_bytes().to_vec();
        body.extend_from_slice(b"events\0hello\0");
        assert_eq!(
            parse_message(b'A', &body).unwrap(),
            BackendMessage::NotificationResponse {
                process_id: 42,
                channel: "events".into(),
                payload: "hello".into()
            }
        );
    }

    #[test]
    fn test_copy_in_response() {
        let body = [0u8, 0, 2, 0, 0, 0, 0];
        assert_eq!(
            parse_message(b'G', &body).unwrap(),
            BackendMessage::CopyInResponse {
                format: 0,
                column_formats: vec![0, 0]
            }
        );
    }

    #[test]
    fn test_bad_length_and_unknown_tag() {
        let mut reader = MessageReader::new();
        reader.feed(&[b'Z', 0, 0, 0, 2]);
        assert!(reader.next_message().is_err());
        assert!(parse_message(b'?', &[]).is_err());
    }
}
