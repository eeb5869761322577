use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::traits::{Channel, Event, EventSender};
use crate::types::Message;

pub const CONSOLE_CHANNEL_ID: &str = "console:local";

/// Terminal transport for standalone operation: stdin lines become urgent
/// inbound events, outbound messages print to stdout.
pub struct ConsoleChannel;

#[async_trait]
impl Channel for ConsoleChannel {
    fn name(&self) -> String {
        "console".to_string()
    }

    fn handles(&self, channel_id: &str) -> bool {
        channel_id.starts_with("console:")
    }

    async fn send_message(&self, channel_id: &str, text: &str) -> anyhow::Result<()> {
        info!(channel = %channel_id, "Sending console message");
        println!("cadenced> {}", text);
        Ok(())
    }
}

/// Read stdin lines into the event bus. Each line is an explicit address,
/// so it takes the urgent path.
pub fn spawn_stdin_reader(sender: EventSender) {
    tokio::spawn(async move {
        let next_id = AtomicU64::new(1);
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim().to_string();
                    if line.is_empty() {
                        continue;
                    }
                    let event = Event {
                        channel_id: CONSOLE_CHANNEL_ID.to_string(),
                        message: Message {
                            id: next_id.fetch_add(1, Ordering::SeqCst),
                            channel_id: CONSOLE_CHANNEL_ID.to_string(),
                            author_id: "operator".to_string(),
                            timestamp: Utc::now(),
                            content: line,
                            has_attachments: false,
                        },
                        urgent: true,
                    };
                    if sender.send(event).is_err() {
                        warn!("No event receivers active");
                    }
                }
                Ok(None) => {
                    info!("stdin closed, console input stopped");
                    break;
                }
                Err(e) => {
                    warn!("Failed to read stdin: {}", e);
                    break;
                }
            }
        }
    });
}
