//! LISTEN/NOTIFY support.
//!
//! Two layers:
//! - [`ListenerConn`] wraps one connection. A background thread owns the read
//!   side and forwards notifications; commands are simple queries whose
//!   replies come back from that thread.
//! - [`Listener`] supervises a `ListenerConn`, remembers the subscribed
//!   channels and re-subscribes after reconnecting, with exponential backoff
//!   between attempts.
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use kbwire::{KbConfig, Listener};
//!
//! let config = KbConfig::new("localhost", "system", "test").password("secret");
//! let listener = Listener::new(config, Duration::from_secs(1), Duration::from_secs(60))?;
//! listener.listen("events")?;
//! for notification in listener.notifications() {
//!     match notification {
//!         Some(n) => println!("{}: {}", n.channel, n.payload),
//!         // Reconnected: notifications may have been missed
//!         None => resync_state()?,
//!     }
//! }
//! ```

#![allow(clippy::result_large_err)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use kbwire_core::error::{ConnectionErrorKind, UsageErrorKind};
use kbwire_core::{Error, Result};

use crate::config::KbConfig;
use crate::connection::{
    KbConnection, KbStream, connection_error, error_from_server, quote_identifier, read_message,
};
use crate::protocol::{BackendMessage, FrontendMessage, MessageReader};

/// Capacity of the notification queues.
const NOTIFICATION_QUEUE: usize = 32;

/// A notification received on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Process id of the notifying backend
    pub process_id: i32,
    pub channel: String,
    pub payload: String,
}

/// Connection lifecycle events reported by a [`Listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerEvent {
    /// The first connection was established
    Connected,
    /// The connection was lost
    Disconnected,
    /// A new connection replaced a lost one; notifications may have been missed
    Reconnected,
    /// A connection attempt failed; another follows after the backoff
    ConnectionAttemptFailed,
}

/// Opens the connections a [`Listener`] runs on.
pub trait Dialer: Send + Sync {
    fn dial(&self) -> Result<KbConnection>;
}

impl Dialer for KbConfig {
    fn dial(&self) -> Result<KbConnection> {
        KbConnection::connect(self.clone())
    }
}

impl<F> Dialer for F
where
    F: Fn() -> Result<KbConnection> + Send + Sync,
{
    fn dial(&self) -> Result<KbConnection> {
        self()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn listener_closed() -> Error {
    Error::usage(UsageErrorKind::ListenerClosed, "listener has been closed")
}

/// A server error means the command reached the server and was answered.
fn answered(err: &Error) -> bool {
    matches!(err, Error::Query(_))
}

// ==================== ListenerConn ====================

const STATE_IDLE: u8 = 0;
const STATE_EXPECT_RESPONSE: u8 = 1;
const STATE_EXPECT_READY: u8 = 2;

enum Reply {
    Error(Error),
    Ready,
}

/// A single connection dedicated to LISTEN/NOTIFY.
///
/// Notifications are pushed to the queue given at construction. The reader
/// thread blocks while that queue is full, which also stalls command replies.
pub struct ListenerConn {
    conn: Mutex<KbConnection>,
    /// Handle used to unblock the reader thread on close
    closer: KbStream,
    /// Protocol position: idle, waiting for a response, waiting for ready
    state: Arc<AtomicU8>,
    replies: Mutex<Receiver<Reply>>,
    failure: Arc<Mutex<Option<String>>>,
    reader: Mutex<Option<thread::JoinHandle<()>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for ListenerConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerConn")
            .field("state", &self.state.load(Ordering::Acquire))
            .field("failure", &self.err())
            .finish_non_exhaustive()
    }
}

impl ListenerConn {
    /// Dial a new connection and start listening on it.
    pub fn connect(dialer: &dyn Dialer, notifications: SyncSender<Notification>) -> Result<Self> {
        Self::new(dialer.dial()?, notifications)
    }

    /// Take over an established, idle connection.
    pub fn new(mut conn: KbConnection, notifications: SyncSender<Notification>) -> Result<Self> {
        conn.check_usable()?;
        let (stream, reader) = conn.split_reader()?;
        let closer = stream.try_clone()?;

        let state = Arc::new(AtomicU8::new(STATE_IDLE));
        let failure = Arc::new(Mutex::new(None));
        let (reply_tx, reply_rx) = mpsc::channel();

        let thread_state = Arc::clone(&state);
        let thread_failure = Arc::clone(&failure);
        let handle = thread::Builder::new()
            .name("kbwire-listener".to_string())
            .spawn(move || {
                let mut stream = stream;
                let result =
                    conn_loop(&mut stream, reader, &thread_state, &reply_tx, &notifications);
                let message = match result {
                    Ok(()) => "listener connection closed".to_string(),
                    Err(e) => e.to_string(),
                };
                tracing::debug!(reason = %message, "listener connection finished");
                lock(&thread_failure).get_or_insert(message);
                let _ = stream.shutdown();
                // Dropping reply_tx wakes a waiting command
            })
            .map_err(Error::Io)?;

        Ok(Self {
            conn: Mutex::new(conn),
            closer,
            state,
            replies: Mutex::new(reply_rx),
            failure,
            reader: Mutex::new(Some(handle)),
            closed: AtomicBool::new(false),
        })
    }

    /// Subscribe to `channel`.
    pub fn listen(&self, channel: &str) -> Result<()> {
        self.exec_simple_query(&format!("LISTEN {}", quote_identifier(channel)))
    }

    /// Unsubscribe from `channel`.
    pub fn unlisten(&self, channel: &str) -> Result<()> {
        self.exec_simple_query(&format!("UNLISTEN {}", quote_identifier(channel)))
    }

    /// Unsubscribe from every channel.
    pub fn unlisten_all(&self) -> Result<()> {
        self.exec_simple_query("UNLISTEN *")
    }

    /// Round-trip an empty query to check the connection is alive.
    pub fn ping(&self) -> Result<()> {
        self.exec_simple_query("")
    }

    /// Why the connection stopped, if it has.
    pub fn err(&self) -> Option<String> {
        lock(&self.failure).clone()
    }

    /// Close the connection. Closing twice is a no-op.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        lock(&self.failure).get_or_insert_with(|| "listener has been closed".to_string());
        let _ = self.closer.shutdown();
    }

    /// Block until the reader thread exits; returns why it stopped.
    pub fn wait(&self) -> Option<String> {
        let handle = lock(&self.reader).take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        self.err()
    }

    /// Run one simple query and wait for its ReadyForQuery.
    ///
    /// A server error is returned as [`Error::Query`]; any other error means
    /// the connection is gone.
    pub fn exec_simple_query(&self, sql: &str) -> Result<()> {
        let mut conn = lock(&self.conn);
        if self.closed.load(Ordering::Acquire) {
            return Err(listener_closed());
        }
        if let Some(message) = self.err() {
            return Err(connection_error(ConnectionErrorKind::Disconnected, message, None));
        }
        if self
            .state
            .compare_exchange(
                STATE_IDLE,
                STATE_EXPECT_RESPONSE,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(Error::protocol("listener connection is not idle"));
        }

        tracing::trace!(sql, "listener command");
        if let Err(e) = conn.send_message(&FrontendMessage::Query(sql.to_string())) {
            lock(&self.failure).get_or_insert_with(|| e.to_string());
            let _ = self.closer.shutdown();
            return Err(e);
        }

        let replies = lock(&self.replies);
        let mut err = None;
        loop {
            match replies.recv() {
                Ok(Reply::Error(e)) => err = Some(e),
                Ok(Reply::Ready) => return err.map_or(Ok(()), Err),
                // The reader thread is gone; the failure is recorded
                Err(_) => {
                    let message = self
                        .err()
                        .unwrap_or_else(|| "listener connection closed".to_string());
                    return Err(connection_error(
                        ConnectionErrorKind::Disconnected,
                        message,
                        None,
                    ));
                }
            }
        }
    }
}

impl Drop for ListenerConn {
    fn drop(&mut self) {
        self.close();
    }
}

fn transition(state: &AtomicU8, from: u8, to: u8) -> bool {
    state
        .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

fn conn_loop(
    stream: &mut KbStream,
    mut reader: MessageReader,
    state: &AtomicU8,
    replies: &Sender<Reply>,
    notifications: &SyncSender<Notification>,
) -> Result<()> {
    let mut buf = vec![0u8; 8192];
    loop {
        match read_message(stream, &mut reader, &mut buf)? {
            BackendMessage::NotificationResponse {
                process_id,
                channel,
                payload,
            } => {
                let notification = Notification {
                    process_id,
                    channel,
                    payload,
                };
                if notifications.send(notification).is_err() {
                    return Ok(());
                }
            }
            // Rows of a command; nothing to keep
            BackendMessage::RowDescription(_) | BackendMessage::DataRow(_) => {}
            BackendMessage::ErrorResponse(e) => {
                let err = error_from_server(e, None);
                // A stray error outside a command is the last word before
                // the server hangs up
                if !transition(state, STATE_EXPECT_RESPONSE, STATE_EXPECT_READY) {
                    return Err(err);
                }
                let _ = replies.send(Reply::Error(err));
            }
            BackendMessage::CommandComplete(_) | BackendMessage::EmptyQueryResponse => {
                if !transition(state, STATE_EXPECT_RESPONSE, STATE_EXPECT_READY) {
                    return Err(Error::protocol("unexpected CommandComplete"));
                }
            }
            BackendMessage::ReadyForQuery(_) => {
                if !transition(state, STATE_EXPECT_READY, STATE_IDLE) {
                    return Err(Error::protocol("unexpected ReadyForQuery"));
                }
                let _ = replies.send(Reply::Ready);
            }
            BackendMessage::ParameterStatus { .. } => {}
            BackendMessage::NoticeResponse(notice) => {
                tracing::debug!(code = %notice.code, message = %notice.message, "listener notice");
            }
            other => {
                return Err(Error::protocol(format!(
                    "unexpected message '{}' from server in listener loop",
                    char::from(other.tag())
                )));
            }
        }
    }
}

// ==================== Listener ====================

type EventCallback = Box<dyn Fn(ListenerEvent, Option<&Error>) + Send + Sync>;

struct ListenerState {
    closed: bool,
    conn: Option<Arc<ListenerConn>>,
    channels: HashSet<String>,
}

struct ListenerShared {
    dialer: Box<dyn Dialer>,
    min_reconnect: Duration,
    max_reconnect: Duration,
    callback: Option<EventCallback>,
    state: Mutex<ListenerState>,
    /// Signalled when a connection is installed or the listener closes
    changed: Condvar,
    notifications: SyncSender<Option<Notification>>,
}

/// A self-healing LISTEN session.
///
/// Notifications arrive on [`notifications`](Self::notifications). After a
/// reconnect a `None` is queued: notifications sent while disconnected are
/// lost, so callers should refresh whatever state they derive from them.
pub struct Listener {
    shared: Arc<ListenerShared>,
    notifications: Receiver<Option<Notification>>,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.shared.state);
        f.debug_struct("Listener")
            .field("closed", &state.closed)
            .field("connected", &state.conn.is_some())
            .field("channels", &state.channels)
            .finish_non_exhaustive()
    }
}

impl Listener {
    /// Start a listener. `min_reconnect` is the first backoff interval, which
    /// doubles after each failed attempt up to `max_reconnect`.
    pub fn new(
        dialer: impl Dialer + 'static,
        min_reconnect: Duration,
        max_reconnect: Duration,
    ) -> Result<Self> {
        Self::start(Box::new(dialer), min_reconnect, max_reconnect, None)
    }

    /// Like [`new`](Self::new), reporting lifecycle events to `callback`.
    pub fn with_event_callback<F>(
        dialer: impl Dialer + 'static,
        min_reconnect: Duration,
        max_reconnect: Duration,
        callback: F,
    ) -> Result<Self>
    where
        F: Fn(ListenerEvent, Option<&Error>) + Send + Sync + 'static,
    {
        Self::start(
            Box::new(dialer),
            min_reconnect,
            max_reconnect,
            Some(Box::new(callback)),
        )
    }

    fn start(
        dialer: Box<dyn Dialer>,
        min_reconnect: Duration,
        max_reconnect: Duration,
        callback: Option<EventCallback>,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::sync_channel(NOTIFICATION_QUEUE);
        let shared = Arc::new(ListenerShared {
            dialer,
            min_reconnect,
            max_reconnect: max_reconnect.max(min_reconnect),
            callback,
            state: Mutex::new(ListenerState {
                closed: false,
                conn: None,
                channels: HashSet::new(),
            }),
            changed: Condvar::new(),
            notifications: tx,
        });

        let worker = Arc::clone(&shared);
        // Detached: the worker exits on its own once the listener closes
        thread::Builder::new()
            .name("kbwire-listener-supervisor".to_string())
            .spawn(move || worker.run())
            .map_err(Error::Io)?;

        Ok(Self {
            shared,
            notifications: rx,
        })
    }

    /// The notification queue. `None` marks a reconnect.
    pub fn notifications(&self) -> &Receiver<Option<Notification>> {
        &self.notifications
    }

    /// Subscribe to `channel`.
    ///
    /// Blocks until the first connection is up. If the connection drops while
    /// subscribing, the channel is still recorded and subscribed on reconnect.
    pub fn listen(&self, channel: &str) -> Result<()> {
        let mut state = self.shared.lock();
        if state.closed {
            return Err(listener_closed());
        }
        if state.channels.contains(channel) {
            return Err(Error::usage(
                UsageErrorKind::ChannelAlreadyOpen,
                "channel is already open",
            ));
        }
        if let Some(conn) = &state.conn {
            if let Err(e) = conn.listen(channel) {
                if answered(&e) {
                    return Err(e);
                }
            }
        }
        state.channels.insert(channel.to_string());

        while state.conn.is_none() {
            state = self.shared.wait(state);
            if state.closed {
                return Err(listener_closed());
            }
        }
        Ok(())
    }

    /// Unsubscribe from `channel`.
    pub fn unlisten(&self, channel: &str) -> Result<()> {
        let mut state = self.shared.lock();
        if state.closed {
            return Err(listener_closed());
        }
        if !state.channels.contains(channel) {
            return Err(Error::usage(
                UsageErrorKind::ChannelNotOpen,
                "channel is not open",
            ));
        }
        if let Some(conn) = &state.conn {
            if let Err(e) = conn.unlisten(channel) {
                if answered(&e) {
                    return Err(e);
                }
            }
        }
        state.channels.remove(channel);
        Ok(())
    }

    /// Unsubscribe from every channel.
    pub fn unlisten_all(&self) -> Result<()> {
        let mut state = self.shared.lock();
        if state.closed {
            return Err(listener_closed());
        }
        if let Some(conn) = &state.conn {
            if let Err(e) = conn.unlisten_all() {
                if answered(&e) {
                    return Err(e);
                }
            }
        }
        state.channels.clear();
        Ok(())
    }

    /// Check the current connection with an empty query.
    pub fn ping(&self) -> Result<()> {
        let state = self.shared.lock();
        if state.closed {
            return Err(listener_closed());
        }
        match &state.conn {
            Some(conn) => conn.ping(),
            None => Err(connection_error(
                ConnectionErrorKind::Disconnected,
                "no connection",
                None,
            )),
        }
    }

    /// Stop listening and close the connection. Never blocks on the
    /// supervisor; closing twice is a no-op.
    pub fn close(&self) {
        let mut state = self.shared.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        if let Some(conn) = &state.conn {
            conn.close();
        }
        self.shared.changed.notify_all();
        tracing::debug!("listener closed");
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}

impl ListenerShared {
    fn lock(&self) -> MutexGuard<'_, ListenerState> {
        lock(&self.state)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, ListenerState>) -> MutexGuard<'a, ListenerState> {
        self.changed
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn emit(&self, event: ListenerEvent, err: Option<&Error>) {
        match err {
            Some(e) => tracing::warn!(?event, error = %e, "listener event"),
            None => tracing::debug!(?event, "listener event"),
        }
        if let Some(callback) = &self.callback {
            callback(event, err);
        }
    }

    /// Sleep until `deadline` or until the listener closes. Returns whether
    /// it closed.
    fn sleep_until(&self, deadline: Instant) -> bool {
        let mut state = self.lock();
        while !state.closed {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    fn run(&self) {
        let mut connected_before = false;
        let mut interval = self.min_reconnect;
        loop {
            let (conn, queue) = loop {
                match self.connect() {
                    Ok(connected) => break connected,
                    Err(e) => {
                        if self.is_closed() {
                            return;
                        }
                        self.emit(ListenerEvent::ConnectionAttemptFailed, Some(&e));
                        if self.sleep_until(Instant::now() + interval) {
                            return;
                        }
                        interval = (interval * 2).min(self.max_reconnect);
                    }
                }
            };

            if connected_before {
                self.emit(ListenerEvent::Reconnected, None);
                let _ = self.notifications.send(None);
            } else {
                self.emit(ListenerEvent::Connected, None);
            }
            connected_before = true;
            interval = self.min_reconnect;
            let next_attempt = Instant::now() + interval;

            // Ends when the connection's reader thread exits
            for notification in queue.iter() {
                if self.notifications.send(Some(notification)).is_err() {
                    conn.close();
                }
            }

            let reason = conn.wait();
            {
                let mut state = self.lock();
                if state
                    .conn
                    .as_ref()
                    .is_some_and(|current| Arc::ptr_eq(current, &conn))
                {
                    state.conn = None;
                }
            }
            let err = connection_error(
                ConnectionErrorKind::Disconnected,
                reason.unwrap_or_else(|| "listener connection closed".to_string()),
                None,
            );
            if self.is_closed() {
                return;
            }
            self.emit(ListenerEvent::Disconnected, Some(&err));
            if self.sleep_until(next_attempt) {
                return;
            }
        }
    }

    /// Open a connection, replay the subscriptions and install it.
    fn connect(&self) -> Result<(Arc<ListenerConn>, Receiver<Notification>)> {
        let (tx, rx) = mpsc::sync_channel(NOTIFICATION_QUEUE);
        let conn = Arc::new(ListenerConn::connect(self.dialer.as_ref(), tx)?);

        let mut state = self.lock();
        if state.closed {
            conn.close();
            return Err(listener_closed());
        }
        let rx = match resync(&conn, &state.channels, rx) {
            Ok(rx) => rx,
            Err(e) => {
                conn.close();
                return Err(e);
            }
        };
        state.conn = Some(Arc::clone(&conn));
        self.changed.notify_all();
        Ok((conn, rx))
    }
}

/// Re-issue LISTEN for every channel on a fresh connection.
///
/// Notifications arriving meanwhile are discarded so the reader thread
/// never blocks on a full queue.
fn resync(
    conn: &ListenerConn,
    channels: &HashSet<String>,
    queue: Receiver<Notification>,
) -> Result<Receiver<Notification>> {
    let done = AtomicBool::new(false);
    thread::scope(|scope| {
        let done = &done;
        let drain = scope.spawn(move || {
            while !done.load(Ordering::Acquire) {
                match queue.recv_timeout(Duration::from_millis(10)) {
                    Ok(n) => tracing::trace!(channel = %n.channel, "dropping notification during resync"),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            queue
        });

        let mut result = Ok(());
        for channel in channels {
            if let Err(e) = conn.listen(channel) {
                result = Err(e);
                break;
            }
        }
        done.store(true, Ordering::Release);

        let queue = drain
            .join()
            .map_err(|_| Error::protocol("resync drain thread panicked"))?;
        result.map(|()| queue)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        let state = AtomicU8::new(STATE_IDLE);
        assert!(!transition(&state, STATE_EXPECT_RESPONSE, STATE_EXPECT_READY));
        assert!(transition(&state, STATE_IDLE, STATE_EXPECT_RESPONSE));
        assert!(transition(&state, STATE_EXPECT_RESPONSE, STATE_EXPECT_READY));
        assert!(!transition(&state, STATE_EXPECT_RESPONSE, STATE_EXPECT_READY));
        assert!(transition(&state, STATE_EXPECT_READY, STATE_IDLE));
    }

    #[test]
    fn test_answered() {
        let server = error_from_server(
            kbwire_core::ServerError {
                severity: "ERROR".to_string(),
                code: "42601".to_string(),
                ..Default::default()
            },
            None,
        );
        assert!(answered(&server));
        assert!(!answered(&connection_error(
            ConnectionErrorKind::Disconnected,
            "gone",
            None
        )));
    }

    #[test]
    fn test_listener_close_is_idempotent() {
        let dialer = || -> Result<KbConnection> {
            Err(connection_error(ConnectionErrorKind::Refused, "refused", None))
        };
        let events = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&events);
        let listener = Listener::with_event_callback(
            dialer,
            Duration::from_millis(5),
            Duration::from_millis(20),
            move |event, _| lock(&seen).push(event),
        )
        .unwrap();

        // Give the supervisor a few failed attempts
        let deadline = Instant::now() + Duration::from_secs(5);
        while lock(&events).len() < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(
            lock(&events)
                .iter()
                .all(|e| *e == ListenerEvent::ConnectionAttemptFailed)
        );

        listener.close();
        listener.close();
        assert!(matches!(
            listener.listen("events"),
            Err(Error::Usage(ref u)) if u.kind == UsageErrorKind::ListenerClosed
        ));
        assert!(listener.ping().is_err());
    }
}
