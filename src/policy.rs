// Per-kind delivery policy. New kinds get a row here, not a branch in the pipeline.
use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::models::NotificationKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitPolicy {
    pub max_per_hour: u32,
    pub max_per_day: u32,
    pub cooldown: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateConfig {
    pub time_window: Duration,
    pub similarity_threshold: f64,
    pub max_similar: usize,
}

/// Title/body used when several notifications are merged; `{count}` is replaced
/// with the number of merged notifications.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateTemplate {
    pub title: String,
    pub body: String,
}

impl AggregateTemplate {
    pub fn new(title: &str, body: &str) -> Self {
        Self {
            title: title.to_string(),
            body: body.to_string(),
        }
    }

    pub fn render(&self, count: usize) -> (String, String) {
        let count = count.to_string();
        (
            self.title.replace("{count}", &count),
            self.body.replace("{count}", &count),
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct KindPolicy {
    pub priority: Priority,
    pub batchable: bool,
    pub base_delay: Duration,
    pub rate_limit: RateLimitPolicy,
    pub duplicate: DuplicateConfig,
    pub aggregate: Option<AggregateTemplate>,
}

impl KindPolicy {
    pub fn with_rate_limit(mut self, max_per_hour: u32, max_per_day: u32, cooldown: Duration) -> Self {
        self.rate_limit = RateLimitPolicy {
            max_per_hour,
            max_per_day,
            cooldown,
        };
        self
    }

}

#[derive(Debug, Clone)]
pub struct PolicyTable {
    policies: [KindPolicy; NotificationKind::COUNT],
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self {
            policies: NotificationKind::ALL.map(default_policy),
        }
    }
}

impl PolicyTable {
    pub fn get(&self, kind: NotificationKind) -> &KindPolicy {
        &self.policies[kind.index()]
    }

    pub fn with_policy(mut self, kind: NotificationKind, policy: KindPolicy) -> Self {
        self.policies[kind.index()] = policy;
        self
    }

    // Recent-notification records older than this can never match again
    pub fn longest_duplicate_window(&self) -> Duration {
        self.policies
            .iter()
            .map(|policy| policy.duplicate.time_window)
            .max()
            .unwrap_or_else(Duration::zero)
    }
}

fn policy(
    priority: Priority,
    batchable: bool,
    base_delay: Duration,
    (max_per_hour, max_per_day, cooldown): (u32, u32, Duration),
    (time_window, similarity_threshold, max_similar): (Duration, f64, usize),
    aggregate: Option<AggregateTemplate>,
) -> KindPolicy {
    KindPolicy {
        priority,
        batchable,
        base_delay,
        rate_limit: RateLimitPolicy {
            max_per_hour,
            max_per_day,
            cooldown,
        },
        duplicate: DuplicateConfig {
            time_window,
            similarity_threshold,
            max_similar,
        },
        aggregate,
    }
}

fn default_policy(kind: NotificationKind) -> KindPolicy {
    use NotificationKind::*;

    let none = Duration::zero();
    match kind {
        FriendRequest => policy(
            Priority::High,
            false,
            none,
            (10, 50, Duration::seconds(30)),
            (Duration::hours(1), 0.9, 1),
            None,
        ),
        FriendAccepted => policy(
            Priority::Normal,
            false,
            none,
            (10, 50, none),
            (Duration::hours(1), 0.9, 1),
            None,
        ),
        // Delayed so a burst of friends posting collapses into one push
        FriendPost => policy(
            Priority::Normal,
            true,
            Duration::minutes(5),
            (20, 100, none),
            (Duration::minutes(30), 0.95, 1),
            Some(AggregateTemplate::new(
                "{count} friends shared new meals",
                "See what your friends have been cooking",
            )),
        ),
        PostLike => policy(
            Priority::Low,
            true,
            none,
            (30, 200, none),
            (Duration::minutes(10), 0.95, 1),
            Some(AggregateTemplate::new(
                "{count} people liked your post",
                "Your meal is getting some love",
            )),
        ),
        PostComment => policy(
            Priority::Normal,
            true,
            none,
            (20, 100, none),
            (Duration::minutes(10), 0.9, 1),
            Some(AggregateTemplate::new(
                "{count} new comments on your post",
                "Join the conversation",
            )),
        ),
        AchievementUnlocked => policy(
            Priority::High,
            false,
            none,
            (5, 20, none),
            (Duration::hours(24), 0.8, 1),
            None,
        ),
        StreakReminder => policy(
            Priority::Normal,
            false,
            none,
            (1, 2, Duration::hours(4)),
            (Duration::hours(12), 0.7, 1),
            None,
        ),
        GoalReminder => policy(
            Priority::Normal,
            false,
            none,
            (2, 4, Duration::hours(1)),
            (Duration::hours(6), 0.7, 1),
            None,
        ),
        WeeklyProgress => policy(
            Priority::Low,
            false,
            none,
            (1, 1, Duration::hours(24)),
            (Duration::days(7), 0.7, 1),
            None,
        ),
        SystemAlert => policy(
            Priority::Urgent,
            false,
            none,
            (10, 30, none),
            (Duration::minutes(5), 0.95, 1),
            None,
        ),
    }
}
