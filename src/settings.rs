use moka::future::Cache;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::models::RecipientPreferences;

#[trait_variant::make(SettingsProvider: Send)]
pub trait LocalSettingsProvider {
    async fn get_preferences(&self, recipient_id: &str) -> Result<RecipientPreferences, StoreError>;
    // Called when a transport reports a token as permanently dead
    async fn invalidate_token(&self, recipient_id: &str, token: &str) -> Result<(), StoreError>;
}

/// Wraps a provider with a bounded-staleness cache.
pub struct CachedSettings<S> {
    inner: Arc<S>,
    cache: Cache<String, RecipientPreferences>,
}

impl<S: SettingsProvider + Sync> CachedSettings<S> {
    pub fn new(inner: S, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(ttl)
            .build();
        Self {
            inner: Arc::new(inner),
            cache,
        }
    }

    pub async fn get(&self, recipient_id: &str) -> Result<RecipientPreferences, StoreError> {
        if let Some(prefs) = self.cache.get(recipient_id) {
            return Ok(prefs);
        }

        debug!(recipient_id = %recipient_id, "Loading preferences");
        let prefs = SettingsProvider::get_preferences(self.inner.as_ref(), recipient_id).await?;
        self.cache.insert(recipient_id.to_string(), prefs.clone()).await;
        Ok(prefs)
    }

    pub async fn invalidate_token(&self, recipient_id: &str, token: &str) -> Result<(), StoreError> {
        SettingsProvider::invalidate_token(self.inner.as_ref(), recipient_id, token).await?;
        // Device list changed, next lookup must go to the provider
        self.cache.invalidate(recipient_id).await;
        Ok(())
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

/// Preferences held in memory; unknown recipients get the defaults.
#[derive(Debug, Default)]
pub struct StaticSettings {
    recipients: RwLock<HashMap<String, RecipientPreferences>>,
    invalidated: RwLock<Vec<String>>,
}

impl StaticSettings {
    pub fn set(&self, recipient_id: &str, prefs: RecipientPreferences) {
        self.recipients
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(recipient_id.to_string(), prefs);
    }

    pub fn invalidated_tokens(&self) -> Vec<String> {
        self.invalidated.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl SettingsProvider for StaticSettings {
    async fn get_preferences(&self, recipient_id: &str) -> Result<RecipientPreferences, StoreError> {
        let recipients = self.recipients.read().unwrap_or_else(|e| e.into_inner());
        Ok(recipients.get(recipient_id).cloned().unwrap_or_default())
    }

    async fn invalidate_token(&self, recipient_id: &str, token: &str) -> Result<(), StoreError> {
        {
            let mut recipients = self.recipients.write().unwrap_or_else(|e| e.into_inner());
            if let Some(prefs) = recipients.get_mut(recipient_id) {
                prefs.device_tokens.retain(|t| t != token);
            }
        }
        self.invalidated
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(token.to_string());
        info!(recipient_id = %recipient_id, "Invalidated device token");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NotificationKind, QuietHours};

    #[tokio::test]
    async fn test_cached_settings_serves_from_cache() {
        let cached = CachedSettings::new(StaticSettings::default(), Duration::from_secs(60));
        let first = cached.get("user-1").await.unwrap();
        assert!(first.allows(NotificationKind::PostLike));

        // Provider changes are invisible until the entry expires
        cached.inner().set(
            "user-1",
            RecipientPreferences {
                quiet_hours: Some(QuietHours::new(0, 60)),
                ..Default::default()
            },
        );
        assert_eq!(cached.get("user-1").await.unwrap().quiet_hours, None);
    }

    #[tokio::test]
    async fn test_invalidate_token_refreshes_cache() {
        let settings = StaticSettings::default();
        settings.set(
            "user-1",
            RecipientPreferences {
                device_tokens: vec!["a".to_string(), "b".to_string()],
                ..Default::default()
            },
        );
        let cached = CachedSettings::new(settings, Duration::from_secs(60));
        assert_eq!(cached.get("user-1").await.unwrap().device_tokens.len(), 2);

        cached.invalidate_token("user-1", "a").await.unwrap();
        assert_eq!(cached.get("user-1").await.unwrap().device_tokens, vec!["b".to_string()]);
        assert_eq!(cached.inner().invalidated_tokens(), vec!["a".to_string()]);
    }
}
