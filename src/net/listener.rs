use std::{io, net::SocketAddr};

use tokio::{net::TcpListener, select, sync::watch};
use tracing::{debug, debug_span, warn, Instrument};

use crate::process::InboxSender;

use super::reader::Reader;

/// Accepts the inbound channels of one process.
pub struct Listener {
    inner: TcpListener,
    read_buffer: usize,
    max_record_len: usize,
}

impl Listener {
    pub async fn bind(
        host: &str,
        port: u16,
        read_buffer: usize,
        max_record_len: usize,
    ) -> io::Result<Self> {
        Ok(Self {
            inner: TcpListener::bind((host, port)).await?,
            read_buffer,
            max_record_len,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Accepts connections and gives each its own reader task until
    /// `shutdown` turns true (or its sender is dropped).
    /// This will run until the process shuts down, so it should be spawned in
    /// a dedicated task.
    pub async fn run(self, inbox: InboxSender, mut shutdown: watch::Receiver<bool>) {
        let owner = inbox.owner();
        debug!("listening");
        loop {
            if *shutdown.borrow() {
                break;
            }
            select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                accepted = self.inner.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "accepted channel");
                        let _ = stream.set_nodelay(true);
                        let reader = Reader::new(stream, inbox.clone(), self.read_buffer, self.max_record_len);
                        tokio::spawn(
                            async move {
                                let delivered = reader.run().await;
                                debug!(delivered, "reader finished");
                            }
                            .instrument(debug_span!("reader", owner, %peer)),
                        );
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                }
            }
        }
        debug!("listener stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        message::{Header, Message, Payload},
        net::Channel,
        process::inbox,
    };

    fn base(source: u32) -> Message {
        Message::new(
            Header {
                source,
                source_port: 0,
                dest: 0,
                dest_port: 0,
                round: 0,
                clock: 1,
            },
            Payload::Base {
                hops: 0,
                text: "hi".into(),
            },
        )
    }

    #[tokio::test]
    async fn one_reader_per_inbound_channel() {
        let listener = Listener::bind("127.0.0.1", 0, 256, 1 << 16).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, mut rx) = inbox(0);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(listener.run(tx, stop_rx));

        let a = Channel::new(1, 0, "127.0.0.1", port);
        let b = Channel::new(2, 0, "127.0.0.1", port);
        for _ in 0..3 {
            a.send(&base(1)).await.unwrap();
            b.send(&base(2)).await.unwrap();
        }

        let mut got = Vec::new();
        while got.len() < 6 {
            tokio::time::timeout(Duration::from_secs(2), rx.ready())
                .await
                .unwrap();
            rx.collect_arrivals();
            got.extend(std::iter::from_fn(|| rx.pop()));
        }
        assert_eq!(got.iter().filter(|m| m.source() == 1).count(), 3);
        assert_eq!(got.iter().filter(|m| m.source() == 2).count(), 3);

        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }
}
