use std::collections::HashMap;

use tokio::sync::mpsc;

use crate::client::{ChannelConfig, ChannelHandle};
use crate::error::InvalidRequest;
use crate::events::GatewayEvent;
use crate::supervisor::spawn_channel;
use crate::types::ChannelId;

/// The gateway's front door: owns one supervised channel per device and fans
/// every channel's events into a single sink.
pub struct Gateway {
    sink: mpsc::Sender<GatewayEvent>,
    next_id: u32,
    channels: HashMap<ChannelId, ChannelHandle>,
}

impl Gateway {
    /// Create a gateway publishing events to `sink`
    pub fn new(sink: mpsc::Sender<GatewayEvent>) -> Self {
        Self {
            sink,
            next_id: 0,
            channels: HashMap::new(),
        }
    }

    /// Validate the configuration and start a supervised channel for it.
    ///
    /// The channel begins connecting immediately; progress is reported on the
    /// event sink.
    pub fn add_channel(&mut self, config: ChannelConfig) -> Result<ChannelHandle, InvalidRequest> {
        let id = ChannelId(self.next_id);
        let handle = spawn_channel(id, config, self.sink.clone())?;
        self.next_id += 1;

        self.channels.insert(id, handle.clone());
        Ok(handle)
    }

    /// Look up the handle of a running channel
    pub fn channel(&self, id: ChannelId) -> Option<&ChannelHandle> {
        self.channels.get(&id)
    }

    /// Stop one channel, cancelling its pending requests and tearing down its
    /// session. Other channels are unaffected.
    ///
    /// Returns false if no such channel exists.
    pub async fn stop_channel(&mut self, id: ChannelId) -> bool {
        match self.channels.remove(&id) {
            Some(handle) => {
                handle.stop().await;
                true
            }
            None => false,
        }
    }

    /// Stop every channel
    pub async fn shutdown(&mut self) {
        for (_, handle) in self.channels.drain() {
            handle.stop().await;
        }
    }
}
