use a2::{Client, DefaultNotificationBuilder, NotificationBuilder, NotificationOptions, Priority as ApnsPriority};
use anyhow::{Context, Result};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::crypto::token_fingerprint;
use crate::error::DeliveryError;
use crate::models::PushMessage;
use crate::policy::Priority;
use crate::push::PushSender;

pub struct ApnsSender {
    client: Client,
    topic: String,
}

impl ApnsSender {
    pub fn new(key_path: &str, key_id: &str, team_id: &str, topic: &str, production: bool) -> Result<Self> {
        let key_path = Path::new(key_path);
        let key = std::fs::File::open(key_path).context(format!(
            "Failed to read APNs key file: {}",
            key_path.display()
        ))?;

        let config = a2::ClientConfig::new(if production {
            a2::Endpoint::Production
        } else {
            a2::Endpoint::Sandbox
        });

        let client = Client::token(key, key_id, team_id, config).context("Failed to create APNs client")?;
        info!(production, "APNs client initialised");

        Ok(Self {
            client,
            topic: topic.to_string(),
        })
    }
}

// Codes after which the token will never work again
fn is_dead_token(code: u16) -> bool {
    matches!(code, 400 | 403 | 410)
}

fn classify(error: a2::Error) -> DeliveryError {
    match error {
        a2::Error::ResponseError(response) if is_dead_token(response.code) => {
            DeliveryError::Permanent(format!("APNs rejected token with status {}", response.code))
        }
        a2::Error::ResponseError(response) => {
            DeliveryError::Transient(format!("APNs responded with status {}", response.code))
        }
        other => DeliveryError::Transient(other.to_string()),
    }
}

impl PushSender for ApnsSender {
    async fn send(&self, token: &str, message: &PushMessage) -> Result<(), DeliveryError> {
        let mut builder = DefaultNotificationBuilder::new()
            .set_title(&message.title)
            .set_body(&message.body);
        if let Some(sound) = &message.sound {
            builder = builder.set_sound(sound);
        }
        if let Some(badge) = message.badge {
            builder = builder.set_badge(badge);
        }

        let apns_priority = match message.priority {
            Priority::High | Priority::Urgent => ApnsPriority::High,
            Priority::Normal | Priority::Low => ApnsPriority::Normal,
        };

        let mut payload = builder.build(
            token,
            NotificationOptions {
                apns_topic: Some(&self.topic),
                apns_priority: Some(apns_priority),
                apns_collapse_id: None,
                apns_expiration: None,
                apns_push_type: None,
                apns_id: None,
            },
        );

        for (key, value) in &message.data {
            payload
                .add_custom_data(key, value)
                .map_err(|e| DeliveryError::Permanent(format!("unencodable custom data: {e}")))?;
        }

        debug!(token = %token_fingerprint(token), title = %message.title, "Sending APNs notification");

        match self.client.send(payload).await {
            Ok(response) if (200..300).contains(&response.code) => Ok(()),
            Ok(response) => {
                warn!(token = %token_fingerprint(token), status = response.code, "APNs accepted with non-success status");
                Err(DeliveryError::Transient(format!("APNs status {}", response.code)))
            }
            Err(e) => Err(classify(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dead_token_codes() {
        assert!(is_dead_token(410));
        assert!(is_dead_token(400));
        assert!(!is_dead_token(429));
        assert!(!is_dead_token(503));
    }
}
