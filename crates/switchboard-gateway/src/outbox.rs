//! Bridges the `send_sms` tool to the configured SMS client.

use std::sync::Arc;

use async_trait::async_trait;

use switchboard_core::types::PhoneNumber;
use switchboard_services::SmsSender;
use switchboard_tools::SmsOutbox;

pub struct DirectSmsOutbox {
    sender: Option<Arc<dyn SmsSender>>,
}

impl DirectSmsOutbox {
    pub fn new(sender: Option<Arc<dyn SmsSender>>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl SmsOutbox for DirectSmsOutbox {
    async fn enqueue(&self, to: &PhoneNumber, body: &str) -> Result<(), String> {
        match &self.sender {
            Some(sender) => sender.send(to, body).await.map_err(|e| e.to_string()),
            None => Err("SMS delivery is not configured".to_string()),
        }
    }
}
