// Shared fixtures and test doubles.
use chrono::{DateTime, TimeZone, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use crate::error::{DeliveryError, StoreError};
use crate::models::{NotificationCandidate, NotificationKind, PushMessage, RecipientPreferences};
use crate::push::PushSender;
use crate::settings::SettingsProvider;

pub const EXPO_TOKEN_SAMPLE: &str = "ExponentPushToken[xkT3nQ1b2c3d4e5f6g7h8i]";
pub const APNS_TOKEN_SAMPLE: &str = "5a1f0d6c9e2b4a7f8c3d1e0b9a8f7c6d5e4b3a2f1c0d9e8b7a6f5c4d3e2b1a0f";

pub fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    on_day(1, hour, minute)
}

// Days of March 2024
pub fn on_day(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, day, hour, minute, 0).unwrap()
}

pub fn candidate(kind: NotificationKind, title: &str, body: &str) -> NotificationCandidate {
    NotificationCandidate::new("user-1", EXPO_TOKEN_SAMPLE, kind, title, body)
}

/// Push sender that records every attempt and fails on demand.
#[derive(Debug, Clone, Default)]
pub struct RecordingSender {
    attempts: Arc<Mutex<Vec<(String, PushMessage)>>>,
    delivered: Arc<Mutex<Vec<(String, PushMessage)>>>,
    queued_failures: Arc<Mutex<VecDeque<DeliveryError>>>,
    always_fail: Arc<Mutex<Option<DeliveryError>>>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_with(error: DeliveryError) -> Self {
        let sender = Self::default();
        *sender.always_fail.lock().unwrap() = Some(error);
        sender
    }

    pub fn fail_next(&self, error: DeliveryError) {
        self.queued_failures.lock().unwrap().push_back(error);
    }

    pub fn attempts(&self) -> Vec<(String, PushMessage)> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn delivered(&self) -> Vec<(String, PushMessage)> {
        self.delivered.lock().unwrap().clone()
    }
}

impl PushSender for RecordingSender {
    async fn send(&self, token: &str, message: &PushMessage) -> Result<(), DeliveryError> {
        self.attempts.lock().unwrap().push((token.to_string(), message.clone()));
        if let Some(error) = self.always_fail.lock().unwrap().clone() {
            return Err(error);
        }
        if let Some(error) = self.queued_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        self.delivered.lock().unwrap().push((token.to_string(), message.clone()));
        Ok(())
    }
}

/// Settings provider whose backend is down.
#[derive(Debug, Default)]
pub struct UnavailableSettings;

impl SettingsProvider for UnavailableSettings {
    async fn get_preferences(&self, _recipient_id: &str) -> Result<RecipientPreferences, StoreError> {
        Err(StoreError::Unavailable("settings backend offline".to_string()))
    }

    async fn invalidate_token(&self, _recipient_id: &str, _token: &str) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("settings backend offline".to_string()))
    }
}

/// Push sender that parks every send until the test releases it.
#[derive(Debug, Clone, Default)]
pub struct GatedSender {
    pub started: Arc<Notify>,
    pub release: Arc<Notify>,
    outcome: Option<DeliveryError>,
}

impl GatedSender {
    pub fn failing_with(error: DeliveryError) -> Self {
        Self {
            outcome: Some(error),
            ..Self::default()
        }
    }
}

impl PushSender for GatedSender {
    async fn send(&self, _token: &str, _message: &PushMessage) -> Result<(), DeliveryError> {
        self.started.notify_one();
        self.release.notified().await;
        match &self.outcome {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

/// Push sender that never answers in time.
#[derive(Debug, Clone, Default)]
pub struct StallingSender {
    attempts: Arc<Mutex<usize>>,
}

impl StallingSender {
    pub fn attempts(&self) -> usize {
        *self.attempts.lock().unwrap()
    }
}

impl PushSender for StallingSender {
    async fn send(&self, _token: &str, _message: &PushMessage) -> Result<(), DeliveryError> {
        *self.attempts.lock().unwrap() += 1;
        tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        Ok(())
    }
}
