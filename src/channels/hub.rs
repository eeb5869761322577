use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::traits::Channel;

/// Central router for outbound messages across all registered transports.
///
/// Routes by channel-id ownership; unknown channel ids are refused rather
/// than broadcast, so a message can never leak to the wrong surface.
pub struct ChannelHub {
    channels: RwLock<Vec<Arc<dyn Channel>>>,
}

impl ChannelHub {
    pub fn new(channels: Vec<Arc<dyn Channel>>) -> Self {
        Self {
            channels: RwLock::new(channels),
        }
    }

    /// Register a new transport dynamically. Returns its name.
    pub async fn register_channel(&self, channel: Arc<dyn Channel>) -> String {
        let name = channel.name();
        let mut channels = self.channels.write().await;
        channels.push(channel);
        info!(channel = %name, total = channels.len(), "Registered channel");
        name
    }

    /// Deliver text into a channel via whichever transport owns it.
    pub async fn send_message(&self, channel_id: &str, text: &str) -> anyhow::Result<()> {
        let channels = self.channels.read().await;
        let Some(channel) = channels.iter().find(|c| c.handles(channel_id)) else {
            warn!(channel = %channel_id, "No transport owns this channel; refusing send");
            anyhow::bail!("no transport registered for channel '{}'", channel_id);
        };
        channel.send_message(channel_id, text).await
    }
}
