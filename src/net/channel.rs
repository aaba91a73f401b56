use std::sync::atomic::{AtomicBool, Ordering::SeqCst};

use tokio::{
    io::AsyncWriteExt,
    net::TcpStream,
    sync::Mutex,
};
use tracing::{debug, trace};

use crate::message::{Message, ProcessId};

use super::{
    error::Error::{self, *},
    framer,
};

/// A directed link from one process to another.
///
/// The socket is connected on the first send and reused for every send after
/// that. The mutex around it is the channel's send lock: one message is
/// written at a time, start to finish, so records from concurrent senders
/// never interleave.
pub struct Channel {
    source: ProcessId,
    dest: ProcessId,
    host: String,
    port: u16,
    socket: Mutex<Option<TcpStream>>,
    closed: AtomicBool,
}

impl Channel {
    pub fn new(source: ProcessId, dest: ProcessId, host: impl Into<String>, port: u16) -> Self {
        Self {
            source,
            dest,
            host: host.into(),
            port,
            socket: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn source(&self) -> ProcessId {
        self.source
    }

    pub fn dest(&self) -> ProcessId {
        self.dest
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub async fn is_connected(&self) -> bool {
        self.socket.lock().await.is_some()
    }

    /// Encodes and writes one message.
    ///
    /// A failed connect or write leaves the channel unconnected, so the next
    /// send starts over with a fresh connection. Nothing is retried here.
    pub async fn send(&self, msg: &Message) -> Result<(), Error> {
        let bytes = framer::encode(msg)?;
        let mut socket = self.socket.lock().await;
        if self.closed.load(SeqCst) {
            Err(Closed { dest: self.dest })?
        }

        if socket.is_none() {
            let stream = TcpStream::connect((self.host.as_str(), self.port))
                .await
                .map_err(|source| Connect {
                    addr: self.addr(),
                    source,
                })?;
            // small records; don't let nagle hold them back
            let _ = stream.set_nodelay(true);
            debug!(dest = self.dest, addr = %self.addr(), "channel connected");
            *socket = Some(stream);
        }
        let Some(stream) = socket.as_mut() else {
            return Err(Closed { dest: self.dest });
        };

        let written = stream.write_all(&bytes).await;
        if let Err(source) = written {
            *socket = None;
            Err(Write {
                addr: self.addr(),
                source,
            })?
        }
        trace!(%msg, bytes = bytes.len(), "sent");
        Ok(())
    }

    /// Shuts the socket down for good. Later sends fail with
    /// [`Error::Closed`].
    pub async fn close(&self) {
        let mut socket = self.socket.lock().await;
        self.closed.store(true, SeqCst);
        if let Some(mut stream) = socket.take() {
            let _ = stream.shutdown().await;
        }
    }
}
