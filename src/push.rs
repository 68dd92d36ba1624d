use tracing::warn;

use crate::apns::ApnsSender;
use crate::crypto::token_fingerprint;
use crate::error::DeliveryError;
use crate::expo::ExpoSender;
use crate::models::PushMessage;
use crate::validator::TokenFormat;

#[trait_variant::make(PushSender: Send)]
pub trait LocalPushSender {
    async fn send(&self, token: &str, message: &PushMessage) -> Result<(), DeliveryError>;
}

/// Picks a transport from the shape of the device token.
pub struct PushRouter {
    apns: Option<ApnsSender>,
    expo: Option<ExpoSender>,
}

impl PushRouter {
    pub fn new(apns: Option<ApnsSender>, expo: Option<ExpoSender>) -> Self {
        Self { apns, expo }
    }
}

impl PushSender for PushRouter {
    async fn send(&self, token: &str, message: &PushMessage) -> Result<(), DeliveryError> {
        match (TokenFormat::detect(token), &self.apns, &self.expo) {
            (Some(TokenFormat::Apns), Some(apns), _) => PushSender::send(apns, token, message).await,
            (Some(TokenFormat::Expo), _, Some(expo)) => PushSender::send(expo, token, message).await,
            (format, _, _) => {
                let format = format.map_or("unknown", |f| f.as_str());
                warn!(token = %token_fingerprint(token), format, "No transport configured for token");
                Err(DeliveryError::Permanent(format!("no transport configured for {format} tokens")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NotificationCandidate, NotificationKind};
    use crate::policy::Priority;
    use crate::testing::{APNS_TOKEN_SAMPLE, EXPO_TOKEN_SAMPLE};

    fn message() -> PushMessage {
        let candidate = NotificationCandidate::new(
            "user-1",
            EXPO_TOKEN_SAMPLE,
            NotificationKind::FriendRequest,
            "New friend request",
            "Sam wants to connect",
        );
        PushMessage::from_candidate(&candidate, Priority::High)
    }

    #[tokio::test]
    async fn test_missing_transport_is_permanent() {
        let router = PushRouter::new(None, None);
        for token in [EXPO_TOKEN_SAMPLE, APNS_TOKEN_SAMPLE, "not-a-token"] {
            let result = PushSender::send(&router, token, &message()).await;
            assert!(matches!(result, Err(ref e) if e.is_permanent()), "{token}");
        }
    }
}
