//! Out-of-band query cancellation.
//!
//! A cancel request travels on a fresh socket and carries the target
//! session's process id and secret key. Delivery is best effort: the server
//! may already have finished the statement.

#![allow(clippy::result_large_err)]

use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use kbwire_core::{Error, Result};

use crate::config::KbConfig;
use crate::connection::open_stream;
use crate::protocol::{FrontendMessage, MessageWriter};

/// Everything needed to cancel a connection's running statement.
///
/// Tokens are cheap to clone and can be moved to other threads.
#[derive(Debug, Clone)]
pub struct CancelToken {
    config: Arc<KbConfig>,
    process_id: i32,
    secret_key: i32,
}

impl CancelToken {
    pub(crate) fn new(config: Arc<KbConfig>, process_id: i32, secret_key: i32) -> Self {
        Self {
            config,
            process_id,
            secret_key,
        }
    }

    pub fn process_id(&self) -> i32 {
        self.process_id
    }

    /// Send a cancel request and wait for the server to close the socket.
    pub fn cancel(&self) -> Result<()> {
        let mut stream = open_stream(&self.config)?;
        let mut writer = MessageWriter::new();
        stream.write_all(writer.write(&FrontendMessage::CancelRequest {
            process_id: self.process_id,
            secret_key: self.secret_key,
        }))?;
        stream.flush()?;

        // The server replies with nothing and closes the connection
        let mut sink = Vec::new();
        stream.read_to_end(&mut sink)?;
        tracing::debug!(process_id = self.process_id, "cancel request delivered");
        Ok(())
    }
}

/// Fires a cancel request if not stopped before the deadline.
pub(crate) struct CancelWatcher {
    stop: Sender<()>,
    handle: JoinHandle<bool>,
}

impl CancelWatcher {
    pub(crate) fn spawn(token: CancelToken, timeout: Duration) -> Result<Self> {
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("kbwire-cancel".to_string())
            .spawn(move || match stopped.recv_timeout(timeout) {
                Err(RecvTimeoutError::Timeout) => {
                    if let Err(e) = token.cancel() {
                        tracing::warn!(error = %e, "failed to send cancel request");
                    }
                    true
                }
                // Stopped, or the connection side went away
                Ok(()) | Err(RecvTimeoutError::Disconnected) => false,
            })
            .map_err(Error::Io)?;
        Ok(Self { stop, handle })
    }

    /// Stop the watcher and wait for it. Returns whether a cancel was sent.
    ///
    /// After this returns no cancel request can arrive for a later statement.
    pub(crate) fn stop(self) -> bool {
        let _ = self.stop.send(());
        self.handle.join().unwrap_or(false)
    }
}
