use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, trace, warn};

use crate::{message::ProcessId, process::InboxSender};

use super::framer::Framer;

/// Owns one inbound socket and feeds everything decoded from it into the
/// owning process's inbox.
pub struct Reader<S> {
    stream: S,
    inbox: InboxSender,
    framer: Framer,
    read_buffer: usize,
}

impl<S: AsyncRead + Unpin> Reader<S> {
    pub fn new(stream: S, inbox: InboxSender, read_buffer: usize, max_record_len: usize) -> Self {
        Self {
            stream,
            inbox,
            framer: Framer::new(max_record_len),
            read_buffer: read_buffer.max(1),
        }
    }

    fn owner(&self) -> ProcessId {
        self.inbox.owner()
    }

    /// Reads until a terminate record, end of stream, a read error or a
    /// closed inbox, then drops the socket. Records decoded in the same read
    /// as a terminate are still delivered. Returns how many messages reached
    /// the inbox.
    pub async fn run(mut self) -> usize {
        let mut buf = vec![0u8; self.read_buffer];
        let mut delivered = 0;

        'read: loop {
            let n = match self.stream.read(&mut buf).await {
                Ok(0) => {
                    debug!("peer closed the connection");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, "read failed, stopping reader");
                    break;
                }
            };

            let mut terminated = false;
            for record in self.framer.feed(&buf[..n]) {
                let msg = match record {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!(error = %e, "dropping record");
                        continue;
                    }
                };
                if msg.header().dest != self.owner() {
                    warn!(%msg, owner = self.owner(), "dropping misaddressed message");
                    continue;
                }
                trace!(%msg, "received");
                terminated |= msg.is_terminate();
                if let Err(e) = self.inbox.push(msg) {
                    debug!(error = %e, "inbox gone, stopping reader");
                    break 'read;
                }
                delivered += 1;
            }

            if terminated {
                debug!("terminate received, stopping reader");
                break;
            }
        }

        if !self.framer.residual().is_empty() {
            warn!(
                bytes = self.framer.residual().len(),
                "discarding partial record at end of stream"
            );
        }
        delivered
    }
}
