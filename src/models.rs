use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use uuid::Uuid;

use crate::policy::Priority;

pub type Payload = HashMap<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    FriendRequest,
    FriendAccepted,
    FriendPost,
    PostLike,
    PostComment,
    AchievementUnlocked,
    StreakReminder,
    GoalReminder,
    WeeklyProgress,
    SystemAlert,
}

impl NotificationKind {
    pub const COUNT: usize = 10;

    pub const ALL: [NotificationKind; Self::COUNT] = [
        NotificationKind::FriendRequest,
        NotificationKind::FriendAccepted,
        NotificationKind::FriendPost,
        NotificationKind::PostLike,
        NotificationKind::PostComment,
        NotificationKind::AchievementUnlocked,
        NotificationKind::StreakReminder,
        NotificationKind::GoalReminder,
        NotificationKind::WeeklyProgress,
        NotificationKind::SystemAlert,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FriendRequest => "friend_request",
            Self::FriendAccepted => "friend_accepted",
            Self::FriendPost => "friend_post",
            Self::PostLike => "post_like",
            Self::PostComment => "post_comment",
            Self::AchievementUnlocked => "achievement_unlocked",
            Self::StreakReminder => "streak_reminder",
            Self::GoalReminder => "goal_reminder",
            Self::WeeklyProgress => "weekly_progress",
            Self::SystemAlert => "system_alert",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }

    // Position in the policy table
    pub(crate) fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A notification proposed for delivery, before any admission checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationCandidate {
    pub recipient_id: String,
    pub recipient_token: String,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub payload: Payload,
    #[serde(default)]
    pub badge_count: Option<u32>,
}

impl NotificationCandidate {
    pub fn new(
        recipient_id: impl Into<String>,
        recipient_token: impl Into<String>,
        kind: NotificationKind,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            recipient_id: recipient_id.into(),
            recipient_token: recipient_token.into(),
            kind,
            title: title.into(),
            body: body.into(),
            payload: Payload::new(),
            badge_count: None,
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    // Same notification addressed to another device of the same recipient
    pub fn for_token(&self, token: &str) -> Self {
        Self {
            recipient_token: token.to_string(),
            ..self.clone()
        }
    }
}

/// What actually goes over the wire to a push transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushMessage {
    pub title: String,
    pub body: String,
    pub data: Payload,
    pub badge: Option<u32>,
    pub sound: Option<String>,
    pub priority: Priority,
}

impl PushMessage {
    pub fn from_candidate(candidate: &NotificationCandidate, priority: Priority) -> Self {
        Self {
            title: candidate.title.clone(),
            body: candidate.body.clone(),
            data: candidate.payload.clone(),
            badge: candidate.badge_count,
            sound: Some("default".to_string()),
            priority,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Pending,
    Sent,
    Failed,
    Cancelled,
}

impl EntryStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Durable record for a candidate awaiting delivery or retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledEntry {
    pub id: Uuid,
    pub candidate: NotificationCandidate,
    pub scheduled_for: DateTime<Utc>,
    pub status: EntryStatus,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl ScheduledEntry {
    pub fn new(candidate: NotificationCandidate, scheduled_for: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            candidate,
            scheduled_for,
            status: EntryStatus::Pending,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            last_error: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == EntryStatus::Pending && self.scheduled_for <= now
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitCounter {
    pub hourly_count: u32,
    pub daily_count: u32,
    pub hour_reset_at: DateTime<Utc>,
    pub day_reset_at: DateTime<Utc>,
    pub last_sent_at: Option<DateTime<Utc>>,
}

impl RateLimitCounter {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            hourly_count: 0,
            daily_count: 0,
            hour_reset_at: now + Duration::hours(1),
            day_reset_at: now + Duration::hours(24),
            last_sent_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentNotificationRecord {
    pub candidate: NotificationCandidate,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAnalyticsRecord {
    pub entry_id: Uuid,
    // Other entries delivered as part of the same merged push
    #[serde(default)]
    pub merged_entry_ids: Vec<Uuid>,
    pub recipient_id: String,
    pub kind: NotificationKind,
    pub delivered_at: DateTime<Utc>,
    pub opened_at: Option<DateTime<Utc>>,
    pub response_time_seconds: Option<i64>,
    pub batch_count: usize,
    // Cancel arrived while the push was already on its way
    pub cancelled_late: bool,
}

/// Daily quiet window, both ends as minute-of-day in the recipient's local time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHours {
    pub start_minute: u16,
    pub end_minute: u16,
}

impl QuietHours {
    pub fn new(start_minute: u16, end_minute: u16) -> Self {
        Self {
            start_minute: start_minute % 1440,
            end_minute: end_minute % 1440,
        }
    }

    // Parses "HH:MM" pairs as stored by the settings screens
    pub fn parse(start: &str, end: &str) -> Option<Self> {
        Some(Self::new(parse_minute_of_day(start)?, parse_minute_of_day(end)?))
    }

    pub fn wraps_midnight(&self) -> bool {
        self.start_minute > self.end_minute
    }
}

fn parse_minute_of_day(value: &str) -> Option<u16> {
    let (hours, minutes) = value.trim().split_once(':')?;
    let hours: u16 = hours.parse().ok()?;
    let minutes: u16 = minutes.parse().ok()?;
    if hours >= 24 || minutes >= 60 {
        return None;
    }
    Some(hours * 60 + minutes)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipientPreferences {
    pub quiet_hours: Option<QuietHours>,
    pub utc_offset_minutes: i32,
    pub enabled_kinds: HashSet<NotificationKind>,
    pub device_tokens: Vec<String>,
    pub fan_out_to_all_tokens: bool,
}

impl Default for RecipientPreferences {
    fn default() -> Self {
        Self {
            quiet_hours: None,
            utc_offset_minutes: 0,
            enabled_kinds: NotificationKind::ALL.into_iter().collect(),
            device_tokens: Vec::new(),
            fan_out_to_all_tokens: false,
        }
    }
}

impl RecipientPreferences {
    pub fn allows(&self, kind: NotificationKind) -> bool {
        self.enabled_kinds.contains(&kind)
    }
}
