//! Protocol tests against a scripted in-process backend.
//!
//! Each test binds a local listener and plays the server side of one
//! conversation byte for byte, so the client's framing, state tracking and
//! error classification are checked without a Kingbase server.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Mutex;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use kbwire_core::QueryErrorKind;

use kbwire::{
    Error, KbConfig, KbConnection, Listener, ListenerEvent, TransactionStatusState, Value, copy_in,
};

const INT4: u32 = 23;
const TEXT: u32 = 25;
const PID: i32 = 4242;
const SECRET: i32 = 99_887;
const IO_TIMEOUT: Duration = Duration::from_secs(10);

// ==================== Scripted Backend ====================

struct Backend {
    sock: TcpStream,
}

impl Backend {
    fn accept(listener: &TcpListener) -> Self {
        let (sock, _) = listener.accept().expect("accept");
        sock.set_read_timeout(Some(IO_TIMEOUT)).unwrap();
        Self { sock }
    }

    fn read_exact(&mut self, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        self.sock.read_exact(&mut buf).expect("read from client");
        buf
    }

    fn read_len(&mut self) -> usize {
        let b = self.read_exact(4);
        let len = i32::from_be_bytes([b[0], b[1], b[2], b[3]]);
        usize::try_from(len).expect("negative length") - 4
    }

    /// Startup and cancel packets have no tag byte.
    fn read_untagged(&mut self) -> Vec<u8> {
        let len = self.read_len();
        self.read_exact(len)
    }

    fn read_message(&mut self) -> (u8, Vec<u8>) {
        let tag = self.read_exact(1)[0];
        let len = self.read_len();
        (tag, self.read_exact(len))
    }

    fn expect(&mut self, tag: u8) -> Vec<u8> {
        let (got, body) = self.read_message();
        assert_eq!(
            char::from(got),
            char::from(tag),
            "unexpected frontend message"
        );
        body
    }

    fn expect_query(&mut self) -> String {
        let body = self.expect(b'Q');
        cstr_at(&body, 0)
    }

    fn send(&mut self, tag: u8, body: &[u8]) {
        let mut frame = Vec::with_capacity(body.len() + 5);
        frame.push(tag);
        frame.extend_from_slice(&(i32::try_from(body.len() + 4).unwrap()).to_be_bytes());
        frame.extend_from_slice(body);
        // The client may already be gone in failure scenarios
        let _ = self.sock.write_all(&frame);
    }

    fn ready(&mut self, status: u8) {
        self.send(b'Z', &[status]);
    }

    fn complete(&mut self, tag: &str) {
        self.send(b'C', &cstr(tag));
    }

    fn error(&mut self, severity: &str, code: &str, message: &str) {
        self.send(b'E', &error_body(severity, code, message));
    }

    /// Accept the startup packet and finish the handshake, answering the
    /// compatibility-mode probe as an Oracle-mode server.
    fn handshake(&mut self) -> Vec<u8> {
        let startup = self.read_untagged();
        self.send(b'R', &0i32.to_be_bytes());
        self.finish_startup();
        startup
    }

    fn finish_startup(&mut self) {
        let mut status = cstr("server_version");
        status.extend(cstr("12.1"));
        self.send(b'S', &status);
        let mut tz = cstr("TimeZone");
        tz.extend(cstr("Asia/Shanghai"));
        self.send(b'S', &tz);
        let mut key = PID.to_be_bytes().to_vec();
        key.extend_from_slice(&SECRET.to_be_bytes());
        self.send(b'K', &key);
        self.ready(b'I');

        assert_eq!(self.expect_query(), "show database_mode;");
        self.send(b'T', &row_description(&[("database_mode", TEXT)]));
        self.send(b'D', &data_row(&[Some("oracle".as_bytes())]));
        self.complete("SHOW");
        self.ready(b'I');
    }

    /// Read until the client hangs up or sends Terminate.
    fn wait_for_terminate(&mut self) {
        let mut tag = [0u8; 1];
        loop {
            match self.sock.read(&mut tag) {
                Ok(0) | Err(_) => return,
                Ok(_) if tag[0] == b'X' => return,
                Ok(_) => {
                    let len = self.read_len();
                    self.read_exact(len);
                }
            }
        }
    }
}

fn serve<T, F>(script: F) -> (KbConfig, JoinHandle<T>)
where
    T: Send + 'static,
    F: FnOnce(TcpListener) -> T + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || script(listener));
    let config = KbConfig::new("127.0.0.1", "system", "test")
        .port(port)
        .connect_timeout(IO_TIMEOUT);
    (config, handle)
}

fn cstr(s: &str) -> Vec<u8> {
    let mut v = s.as_bytes().to_vec();
    v.push(0);
    v
}

fn cstr_at(body: &[u8], start: usize) -> String {
    let end = body[start..]
        .iter()
        .position(|&b| b == 0)
        .map_or(body.len(), |p| start + p);
    String::from_utf8(body[start..end].to_vec()).unwrap()
}

fn row_description(columns: &[(&str, u32)]) -> Vec<u8> {
    let mut body = u16::try_from(columns.len()).unwrap().to_be_bytes().to_vec();
    for (name, oid) in columns {
        body.extend(cstr(name));
        body.extend_from_slice(&0u32.to_be_bytes());
        body.extend_from_slice(&0i16.to_be_bytes());
        body.extend_from_slice(&oid.to_be_bytes());
        body.extend_from_slice(&(-1i16).to_be_bytes());
        body.extend_from_slice(&(-1i32).to_be_bytes());
        body.extend_from_slice(&0i16.to_be_bytes());
    }
    body
}

fn data_row(values: &[Option<&[u8]>]) -> Vec<u8> {
    let mut body = u16::try_from(values.len()).unwrap().to_be_bytes().to_vec();
    for value in values {
        match value {
            Some(v) => {
                body.extend_from_slice(&i32::try_from(v.len()).unwrap().to_be_bytes());
                body.extend_from_slice(v);
            }
            None => body.extend_from_slice(&(-1i32).to_be_bytes()),
        }
    }
    body
}

fn error_body(severity: &str, code: &str, message: &str) -> Vec<u8> {
    let mut body = Vec::new();
    for (field, value) in [(b'S', severity), (b'V', severity), (b'C', code), (b'M', message)] {
        body.push(field);
        body.extend(cstr(value));
    }
    body.push(0);
    body
}

fn notification(channel: &str, payload: &str) -> Vec<u8> {
    let mut body = PID.to_be_bytes().to_vec();
    body.extend(cstr(channel));
    body.extend(cstr(payload));
    body
}

/// Key/value pairs of a startup packet, after the protocol version.
fn startup_params(packet: &[u8]) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut pos = 4;
    loop {
        let key = cstr_at(packet, pos);
        if key.is_empty() {
            return params;
        }
        pos += key.len() + 1;
        let value = cstr_at(packet, pos);
        pos += value.len() + 1;
        params.push((key, value));
    }
}

// ==================== Startup ====================

#[test]
fn test_startup_records_session_parameters() {
    let (config, server) = serve(|listener| {
        let mut b = Backend::accept(&listener);
        let startup = b.handshake();
        b.wait_for_terminate();
        startup
    });

    let mut conn = KbConnection::connect(config.application_name("mock-test")).unwrap();
    assert!(conn.is_ready());
    assert_eq!(conn.process_id(), PID);
    assert_eq!(conn.secret_key(), SECRET);
    assert_eq!(conn.parameter("server_version"), Some("12.1"));
    assert_eq!(conn.time_zone(), Some("Asia/Shanghai"));
    assert_eq!(conn.dialect(), kbwire::Dialect::Oracle);
    assert_eq!(conn.transaction_status(), TransactionStatusState::Idle);
    conn.close().unwrap();

    let startup = server.join().unwrap();
    assert_eq!(&startup[..4], &196_608i32.to_be_bytes());
    let params = startup_params(&startup);
    assert!(params.contains(&("user".to_string(), "system".to_string())));
    assert!(params.contains(&("database".to_string(), "test".to_string())));
    assert!(params.contains(&("application_name".to_string(), "mock-test".to_string())));
}

#[test]
fn test_md5_password_authentication() {
    let (config, server) = serve(|listener| {
        let mut b = Backend::accept(&listener);
        b.read_untagged();
        let mut request = 5i32.to_be_bytes().to_vec();
        request.extend_from_slice(&[1, 2, 3, 4]);
        b.send(b'R', &request);
        let password = cstr_at(&b.expect(b'p'), 0);
        b.send(b'R', &0i32.to_be_bytes());
        b.finish_startup();
        b.wait_for_terminate();
        password
    });

    let conn = KbConnection::connect(config.password("secret")).unwrap();
    drop(conn);

    let password = server.join().unwrap();
    assert_eq!(
        password,
        kbwire::auth::md5_password("system", "secret", [1, 2, 3, 4])
    );
}

#[test]
fn test_missing_password_fails_authentication() {
    let (config, server) = serve(|listener| {
        let mut b = Backend::accept(&listener);
        b.read_untagged();
        b.send(b'R', &3i32.to_be_bytes());
        b.wait_for_terminate();
    });

    let err = KbConnection::connect(config).unwrap_err();
    assert!(matches!(err, Error::Connection(_)), "got {err:?}");
    server.join().unwrap();
}

// ==================== Queries ====================

#[test]
fn test_simple_query_returns_rows() {
    let (config, server) = serve(|listener| {
        let mut b = Backend::accept(&listener);
        b.handshake();
        let sql = b.expect_query();
        b.send(b'T', &row_description(&[("n", INT4), ("s", TEXT)]));
        b.send(b'D', &data_row(&[Some("1".as_bytes()), Some("one".as_bytes())]));
        b.send(b'D', &data_row(&[Some("2".as_bytes()), None]));
        b.complete("SELECT 2");
        b.ready(b'I');
        b.wait_for_terminate();
        sql
    });

    let mut conn = KbConnection::connect(config).unwrap();
    let rows = conn.query("SELECT n, s FROM t", &[]).unwrap();
    assert_eq!(rows.columns(), ["n", "s"]);
    let rows = rows.fetch_all().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].get(0), Some(&Value::Int(1)));
    assert_eq!(rows[0].get_named::<String>("s").unwrap(), "one");
    assert_eq!(rows[1].get(1), Some(&Value::Null));
    assert!(conn.is_ready());
    drop(conn);

    assert_eq!(server.join().unwrap(), "SELECT n, s FROM t");
}

#[test]
fn test_insert_captures_last_insert_id() {
    let (config, server) = serve(|listener| {
        let mut b = Backend::accept(&listener);
        b.handshake();
        let sql = b.expect_query();
        b.send(b'T', &row_description(&[("id", INT4), ("name", TEXT)]));
        b.send(b'D', &data_row(&[Some("42".as_bytes()), Some("a".as_bytes())]));
        b.complete("INSERT 0 1");
        b.ready(b'I');
        b.wait_for_terminate();
        sql
    });

    let mut conn = KbConnection::connect(config.get_last_insert_id(true)).unwrap();
    let result = conn.exec("INSERT INTO t(name) VALUES ('a')", &[]).unwrap();
    assert_eq!(result.rows_affected, 1);
    assert_eq!(result.last_insert_id, Some(42));
    drop(conn);

    assert_eq!(
        server.join().unwrap(),
        "INSERT INTO t(name) VALUES ('a') RETURNING *"
    );
}

#[test]
fn test_insert_keeps_id_of_last_returned_row() {
    let (config, server) = serve(|listener| {
        let mut b = Backend::accept(&listener);
        b.handshake();
        b.expect_query();
        b.send(b'T', &row_description(&[("id", INT4)]));
        for id in ["1", "2", "3"] {
            b.send(b'D', &data_row(&[Some(id.as_bytes())]));
        }
        b.complete("INSERT 0 3");
        b.ready(b'I');

        b.expect_query();
        b.send(b'T', &row_description(&[("id", INT4)]));
        b.send(b'D', &data_row(&[Some("5".as_bytes())]));
        b.send(b'D', &data_row(&[None]));
        b.complete("INSERT 0 2");
        b.ready(b'I');
        b.wait_for_terminate();
    });

    let mut conn = KbConnection::connect(config.get_last_insert_id(true)).unwrap();
    let result = conn
        .exec("INSERT INTO t(name) VALUES ('a'), ('b'), ('c')", &[])
        .unwrap();
    assert_eq!(result.rows_affected, 3);
    assert_eq!(result.last_insert_id, Some(3));

    let result = conn
        .exec("INSERT INTO t(id) VALUES (5), (NULL)", &[])
        .unwrap();
    assert_eq!(result.rows_affected, 2);
    assert_eq!(result.last_insert_id, Some(0));
    drop(conn);
    server.join().unwrap();
}

#[test]
fn test_parameterized_query_uses_extended_protocol() {
    let (config, server) = serve(|listener| {
        let mut b = Backend::accept(&listener);
        b.handshake();
        b.expect(b'P');
        b.expect(b'D');
        b.expect(b'S');
        b.send(b'1', &[]);
        let mut params = 1u16.to_be_bytes().to_vec();
        params.extend_from_slice(&INT4.to_be_bytes());
        b.send(b't', &params);
        b.send(b'T', &row_description(&[("x", INT4)]));
        b.ready(b'I');

        let bind = b.expect(b'B');
        b.expect(b'E');
        b.expect(b'S');
        b.send(b'2', &[]);
        b.send(b'D', &data_row(&[Some(&7i32.to_be_bytes()[..])]));
        b.complete("SELECT 1");
        b.ready(b'I');
        b.wait_for_terminate();
        bind
    });

    let mut conn = KbConnection::connect(config).unwrap();
    let rows = conn
        .query("SELECT $1::int4 AS x", &[Value::Int(7)])
        .unwrap()
        .fetch_all()
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get(0), Some(&Value::Int(7)));
    drop(conn);

    // Unnamed portal and statement, text parameters, one binary result column
    let bind = server.join().unwrap();
    let mut expected = vec![0, 0];
    expected.extend_from_slice(&0u16.to_be_bytes());
    expected.extend_from_slice(&1u16.to_be_bytes());
    expected.extend_from_slice(&1i32.to_be_bytes());
    expected.push(b'7');
    expected.extend_from_slice(&1u16.to_be_bytes());
    expected.extend_from_slice(&1i16.to_be_bytes());
    assert_eq!(bind, expected);
}

#[test]
fn test_server_error_keeps_connection_usable() {
    let (config, server) = serve(|listener| {
        let mut b = Backend::accept(&listener);
        b.handshake();
        b.expect_query();
        b.error("ERROR", "42601", "syntax error at or near \"SELEC\"");
        b.ready(b'I');
        b.expect_query();
        b.complete("SELECT 0");
        b.ready(b'I');
        b.wait_for_terminate();
    });

    let mut conn = KbConnection::connect(config).unwrap();
    let err = conn.exec("SELEC 1", &[]).unwrap_err();
    assert!(
        matches!(&err, Error::Query(q) if q.kind == QueryErrorKind::Syntax),
        "got {err:?}"
    );
    assert!(!conn.is_bad());
    assert_eq!(conn.exec("SELECT 1", &[]).unwrap().rows_affected, 0);
    drop(conn);
    server.join().unwrap();
}

#[test]
fn test_fatal_error_marks_connection_bad() {
    let (config, server) = serve(|listener| {
        let mut b = Backend::accept(&listener);
        b.handshake();
        b.expect_query();
        b.error("FATAL", "57P01", "terminating connection due to administrator command");
    });

    let mut conn = KbConnection::connect(config).unwrap();
    let err = conn.query("SELECT 1", &[]).unwrap_err();
    match &err {
        Error::Query(q) => assert!(q.is_fatal()),
        other => panic!("expected a query error, got {other:?}"),
    }
    assert!(conn.is_bad());

    // Nothing is written to a bad connection
    let err = conn.exec("SELECT 1", &[]).unwrap_err();
    assert!(err.is_bad_connection());
    server.join().unwrap();
}

#[test]
fn test_eof_mid_query_is_bad_connection() {
    let (config, server) = serve(|listener| {
        let mut b = Backend::accept(&listener);
        b.handshake();
        b.expect_query();
    });

    let mut conn = KbConnection::connect(config).unwrap();
    let err = conn.query("SELECT 1", &[]).unwrap_err();
    assert!(err.is_bad_connection(), "got {err:?}");
    assert!(conn.is_bad());
    server.join().unwrap();
}

// ==================== Transactions ====================

#[test]
fn test_commit_in_failed_transaction_rolls_back() {
    let (config, server) = serve(|listener| {
        let mut b = Backend::accept(&listener);
        b.handshake();
        let mut seen = vec![b.expect_query()];
        b.complete("BEGIN");
        b.ready(b'T');

        seen.push(b.expect_query());
        b.error("ERROR", "42703", "column \"x\" does not exist");
        b.ready(b'E');

        seen.push(b.expect_query());
        b.complete("ROLLBACK");
        b.ready(b'I');
        b.wait_for_terminate();
        seen
    });

    let mut conn = KbConnection::connect(config).unwrap();
    conn.begin().unwrap();
    assert!(conn.in_transaction());
    assert!(conn.exec("SELECT x", &[]).is_err());
    assert_eq!(conn.transaction_status(), TransactionStatusState::InFailed);

    let err = conn.commit().unwrap_err();
    assert!(matches!(err, Error::Transaction(_)), "got {err:?}");
    assert_eq!(conn.transaction_status(), TransactionStatusState::Idle);
    assert!(!conn.is_bad());
    drop(conn);

    assert_eq!(server.join().unwrap(), ["BEGIN", "SELECT x", "ROLLBACK"]);
}

// ==================== COPY ====================

#[test]
fn test_copy_in_streams_rows_in_one_flush() {
    let (config, server) = serve(|listener| {
        let mut b = Backend::accept(&listener);
        b.handshake();
        b.expect_query();
        b.complete("BEGIN");
        b.ready(b'T');

        let sql = b.expect_query();
        let mut response = vec![0u8];
        response.extend_from_slice(&2u16.to_be_bytes());
        response.extend_from_slice(&[0, 0, 0, 0]);
        b.send(b'G', &response);

        let mut chunks = 0;
        let mut data = Vec::new();
        loop {
            let (tag, body) = b.read_message();
            match tag {
                b'd' => {
                    chunks += 1;
                    data.extend(body);
                }
                b'c' => break,
                other => panic!("unexpected message {}", char::from(other)),
            }
        }
        b.complete("COPY 5");
        b.ready(b'T');

        b.expect_query();
        b.complete("COMMIT");
        b.ready(b'I');
        b.wait_for_terminate();
        (sql, chunks, String::from_utf8(data).unwrap())
    });

    let mut conn = KbConnection::connect(config).unwrap();
    let sql = copy_in("items", &["id", "label"]);

    // Refused before anything is sent
    assert!(conn.prepare_copy(&sql).is_err());
    assert!(!conn.is_bad());

    conn.begin().unwrap();
    let mut copy = conn.prepare_copy(&sql).unwrap();
    for i in 0..4 {
        copy.write_row(&[Value::Int(i), Value::Text(format!("row {i}"))])
            .unwrap();
    }
    copy.write_row(&[Value::Int(4), Value::Text("tab\there".into())])
        .unwrap();
    assert_eq!(copy.rows_written(), 5);
    assert_eq!(copy.close().unwrap(), 5);
    assert!(conn.in_transaction());
    conn.commit().unwrap();
    drop(conn);

    let (sql, chunks, data) = server.join().unwrap();
    assert_eq!(sql, "COPY \"items\" (\"id\", \"label\") FROM STDIN");
    assert_eq!(chunks, 1);
    assert_eq!(data.lines().count(), 5);
    assert!(data.starts_with("0\trow 0\n"));
    assert!(data.ends_with("4\ttab\\there\n"));
}

// ==================== Cancellation ====================

#[test]
fn test_query_timeout_sends_cancel_request() {
    let (config, server) = serve(|listener| {
        let mut b = Backend::accept(&listener);
        b.handshake();
        b.expect_query();

        let mut cancel = Backend::accept(&listener);
        let packet = cancel.read_untagged();
        drop(cancel);

        b.error("ERROR", "57014", "canceling statement due to user request");
        b.ready(b'I');
        b.wait_for_terminate();
        packet
    });

    let mut conn = KbConnection::connect(config).unwrap();
    let err = conn
        .query_with_timeout("SELECT pg_sleep(10)", &[], Duration::from_millis(50))
        .unwrap_err();
    assert!(matches!(err, Error::Timeout), "got {err:?}");
    assert!(!conn.is_bad());
    drop(conn);

    let packet = server.join().unwrap();
    let mut expected = 80_877_102i32.to_be_bytes().to_vec();
    expected.extend_from_slice(&PID.to_be_bytes());
    expected.extend_from_slice(&SECRET.to_be_bytes());
    assert_eq!(packet, expected);
}

// ==================== LISTEN/NOTIFY ====================

#[test]
fn test_listener_resubscribes_after_reconnect() {
    let (config, server) = serve(|listener| {
        let mut first = Backend::accept(&listener);
        first.handshake();
        let mut commands = vec![first.expect_query()];
        first.complete("LISTEN");
        first.ready(b'I');
        first.send(b'A', &notification("events", "hello"));
        drop(first);

        let mut second = Backend::accept(&listener);
        second.handshake();
        commands.push(second.expect_query());
        second.complete("LISTEN");
        second.ready(b'I');
        // Ping from the test, once the replay is done
        commands.push(second.expect_query());
        second.send(b'I', &[]);
        second.ready(b'I');
        second.send(b'A', &notification("events", "again"));
        second.wait_for_terminate();
        commands
    });

    let (events_tx, events_rx) = mpsc::channel();
    let events_tx = Mutex::new(events_tx);
    let listener = Listener::with_event_callback(
        config,
        Duration::from_millis(10),
        Duration::from_millis(100),
        move |event, _| {
            let _ = events_tx.lock().unwrap().send(event);
        },
    )
    .unwrap();
    assert_eq!(
        events_rx.recv_timeout(IO_TIMEOUT).unwrap(),
        ListenerEvent::Connected
    );

    listener.listen("events").unwrap();
    let queue = listener.notifications();
    let hello = queue.recv_timeout(IO_TIMEOUT).unwrap().unwrap();
    assert_eq!(hello.channel, "events");
    assert_eq!(hello.payload, "hello");
    assert_eq!(hello.process_id, PID);

    assert!(queue.recv_timeout(IO_TIMEOUT).unwrap().is_none());
    listener.ping().unwrap();
    let again = queue.recv_timeout(IO_TIMEOUT).unwrap().unwrap();
    assert_eq!(again.payload, "again");
    listener.close();

    assert_eq!(
        server.join().unwrap(),
        ["LISTEN \"events\"", "LISTEN \"events\"", ""]
    );
}
