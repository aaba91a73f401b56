use std::{collections::BTreeMap, sync::Arc};

use futures::future::join_all;

use crate::message::{Message, ProcessId};

use super::{
    channel::Channel,
    error::Error::{self, *},
};

/// The sending side of one process: its outgoing channels, by destination.
pub struct Sender {
    owner: ProcessId,
    channels: BTreeMap<ProcessId, Arc<Channel>>,
}

impl Sender {
    pub fn new(owner: ProcessId, channels: impl IntoIterator<Item = Channel>) -> Self {
        Self {
            owner,
            channels: channels
                .into_iter()
                .map(|channel| (channel.dest(), Arc::new(channel)))
                .collect(),
        }
    }

    pub fn owner(&self) -> ProcessId {
        self.owner
    }

    /// Destinations of the outgoing channels, in ascending order.
    pub fn dests(&self) -> Vec<ProcessId> {
        self.channels.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn channel(&self, dest: ProcessId) -> Option<&Arc<Channel>> {
        self.channels.get(&dest)
    }

    /// Port of the listener behind the channel to `dest`, or 0 when there is
    /// no such channel.
    pub fn dest_port(&self, dest: ProcessId) -> u16 {
        self.channels.get(&dest).map_or(0, |c| c.port())
    }

    pub async fn send(&self, dest: ProcessId, msg: &Message) -> Result<(), Error> {
        match self.channels.get(&dest) {
            Some(channel) => channel.send(msg).await,
            None => Err(Closed { dest }),
        }
    }

    /// Closes every channel concurrently.
    pub async fn close_all(&self) {
        join_all(self.channels.values().map(|channel| channel.close())).await;
    }
}
