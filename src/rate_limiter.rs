// rate_limiter.rs
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::models::{NotificationKind, RateLimitCounter};
use crate::policy::RateLimitPolicy;
use crate::store::{self, StateStore, Table};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitReason {
    Cooldown,
    HourlyLimit,
    DailyLimit,
}

impl LimitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cooldown => "cooldown",
            Self::HourlyLimit => "hourly-limit",
            Self::DailyLimit => "daily-limit",
        }
    }
}

impl fmt::Display for LimitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Denied(LimitReason),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateKey {
    pub recipient_id: String,
    pub kind: NotificationKind,
}

impl RateKey {
    pub fn new(recipient_id: &str, kind: NotificationKind) -> Self {
        Self {
            recipient_id: recipient_id.to_string(),
            kind,
        }
    }

    fn storage_key(&self) -> String {
        format!("{}|{}", self.recipient_id, self.kind.as_str())
    }

    // Kind is always the last segment, recipient ids may contain anything
    fn from_storage_key(key: &str) -> Option<Self> {
        let (recipient_id, kind) = key.rsplit_once('|')?;
        Some(Self {
            recipient_id: recipient_id.to_string(),
            kind: NotificationKind::parse(kind)?,
        })
    }
}

/// Lazily rolls the hourly and daily windows forward once their reset time has passed.
pub fn advance_window(mut counter: RateLimitCounter, now: DateTime<Utc>) -> RateLimitCounter {
    if now > counter.hour_reset_at {
        counter.hourly_count = 0;
        counter.hour_reset_at = now + Duration::hours(1);
    }
    if now > counter.day_reset_at {
        counter.daily_count = 0;
        counter.day_reset_at = now + Duration::hours(24);
    }
    counter
}

fn check(counter: &RateLimitCounter, policy: &RateLimitPolicy, now: DateTime<Utc>) -> RateLimitDecision {
    if let Some(last_sent_at) = counter.last_sent_at {
        if now - last_sent_at < policy.cooldown {
            return RateLimitDecision::Denied(LimitReason::Cooldown);
        }
    }
    if counter.hourly_count >= policy.max_per_hour {
        return RateLimitDecision::Denied(LimitReason::HourlyLimit);
    }
    if counter.daily_count >= policy.max_per_day {
        return RateLimitDecision::Denied(LimitReason::DailyLimit);
    }
    RateLimitDecision::Allowed
}

// One slot per (recipient, kind); the slot mutex is the critical section for check-and-increment
type Slot = Arc<AsyncMutex<Option<RateLimitCounter>>>;

pub struct RateLimiter<K> {
    store: Arc<K>,
    slots: Mutex<HashMap<RateKey, Slot>>,
}

impl<K: StateStore + Sync> RateLimiter<K> {
    pub fn new(store: Arc<K>) -> Self {
        Self {
            store,
            slots: Mutex::new(HashMap::new()),
        }
    }

    // Restore persisted counters after a restart
    pub async fn load(&self) -> Result<usize, StoreError> {
        let rows: Vec<(String, RateLimitCounter)> =
            store::load_json(self.store.as_ref(), Table::RateLimitCounters).await?;
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let mut restored = 0;
        for (key, counter) in rows {
            match RateKey::from_storage_key(&key) {
                Some(rate_key) => {
                    slots.insert(rate_key, Arc::new(AsyncMutex::new(Some(counter))));
                    restored += 1;
                }
                None => warn!(key = %key, "Ignoring rate limit counter with unknown key"),
            }
        }
        info!(count = restored, "Restored rate limit counters");
        Ok(restored)
    }

    fn slot(&self, key: &RateKey) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.entry(key.clone()).or_default().clone()
    }

    /// Checks the policy and, when allowed, consumes one slot and persists the counter.
    /// Concurrent calls for the same key are serialized.
    pub async fn try_consume(
        &self,
        recipient_id: &str,
        kind: NotificationKind,
        policy: &RateLimitPolicy,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, StoreError> {
        let key = RateKey::new(recipient_id, kind);
        let slot = self.slot(&key);
        let mut guard = slot.lock().await;

        let previous = guard.clone();
        let counter = advance_window(previous.clone().unwrap_or_else(|| RateLimitCounter::new(now)), now);

        if let RateLimitDecision::Denied(reason) = check(&counter, policy, now) {
            debug!(recipient_id = %recipient_id, kind = %kind, reason = %reason, "Rate limit denied");
            *guard = Some(counter);
            return Ok(RateLimitDecision::Denied(reason));
        }

        let mut next = counter;
        next.hourly_count += 1;
        next.daily_count += 1;
        next.last_sent_at = Some(now);

        if let Err(e) = store::put_json(self.store.as_ref(), Table::RateLimitCounters, &key.storage_key(), &next).await {
            // Leave the in-memory counter as it was so memory and store agree
            *guard = previous;
            return Err(e);
        }

        *guard = Some(next);
        Ok(RateLimitDecision::Allowed)
    }

    /// Gives back a slot taken by `try_consume` at `consumed_at` when the admission
    /// it belonged to did not go through. Any send allowed at `consumed_at` was
    /// already past the previous send's cooldown, so clearing `last_sent_at` is
    /// equivalent to restoring it.
    pub async fn refund(
        &self,
        recipient_id: &str,
        kind: NotificationKind,
        consumed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let key = RateKey::new(recipient_id, kind);
        let slot = self.slot(&key);
        let mut guard = slot.lock().await;

        let Some(mut counter) = guard.clone() else {
            return Ok(());
        };
        if counter.last_sent_at != Some(consumed_at) {
            // A window rolled over or a later send landed; nothing left to give back
            return Ok(());
        }
        counter.hourly_count = counter.hourly_count.saturating_sub(1);
        counter.daily_count = counter.daily_count.saturating_sub(1);
        counter.last_sent_at = None;

        *guard = Some(counter.clone());
        store::put_json(self.store.as_ref(), Table::RateLimitCounters, &key.storage_key(), &counter).await
    }

    pub async fn counter(&self, recipient_id: &str, kind: NotificationKind) -> Option<RateLimitCounter> {
        let slot = {
            let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.get(&RateKey::new(recipient_id, kind)).cloned()
        }?;
        let counter = slot.lock().await.clone();
        counter
    }

    // Drops counters whose daily window ran out; a fresh counter is equivalent
    pub async fn prune_idle(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<RateKey> = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            let mut expired = Vec::new();
            slots.retain(|key, slot| {
                // Callers clone a slot under this same lock, so an extra owner means
                // a consume or refund is about to run against it
                if Arc::strong_count(slot) > 1 {
                    return true;
                }
                let idle = match slot.try_lock() {
                    Ok(counter) => counter.as_ref().map_or(true, |c| now > c.day_reset_at),
                    Err(_) => false,
                };
                if idle {
                    expired.push(key.clone());
                }
                !idle
            });
            expired
        };

        for key in &expired {
            if let Err(e) = StateStore::delete(self.store.as_ref(), Table::RateLimitCounters, &key.storage_key()).await {
                warn!(recipient_id = %key.recipient_id, kind = %key.kind, error = %e, "Failed to delete idle counter");
            }
        }
        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::at;

    fn policy(max_per_hour: u32, max_per_day: u32, cooldown: Duration) -> RateLimitPolicy {
        RateLimitPolicy {
            max_per_hour,
            max_per_day,
            cooldown,
        }
    }

    #[test]
    fn test_advance_window_is_lazy() {
        let start = at(10, 0);
        let mut counter = RateLimitCounter::new(start);
        counter.hourly_count = 3;
        counter.daily_count = 7;

        // Exactly at the reset time nothing changes yet
        let same = advance_window(counter.clone(), start + Duration::hours(1));
        assert_eq!(same, counter);

        let later = start + Duration::hours(1) + Duration::seconds(1);
        let rolled = advance_window(counter.clone(), later);
        assert_eq!(rolled.hourly_count, 0);
        assert_eq!(rolled.hour_reset_at, later + Duration::hours(1));
        assert_eq!(rolled.daily_count, 7);
        assert_eq!(rolled.day_reset_at, counter.day_reset_at);

        let next_day = start + Duration::hours(25);
        let rolled = advance_window(counter, next_day);
        assert_eq!(rolled.daily_count, 0);
        assert_eq!(rolled.day_reset_at, next_day + Duration::hours(24));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_hourly_limit_under_concurrency() {
        let limiter = Arc::new(RateLimiter::new(Arc::new(MemoryStore::new())));
        let policy = policy(3, 10, Duration::zero());
        let now = at(14, 0);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let limiter = limiter.clone();
            let policy = policy.clone();
            handles.push(tokio::spawn(async move {
                limiter
                    .try_consume("user-1", NotificationKind::PostLike, &policy, now)
                    .await
                    .unwrap()
            }));
        }

        let mut allowed = 0;
        let mut denied = Vec::new();
        for handle in handles {
            match handle.await.unwrap() {
                RateLimitDecision::Allowed => allowed += 1,
                RateLimitDecision::Denied(reason) => denied.push(reason),
            }
        }
        assert_eq!(allowed, 3);
        assert_eq!(denied, vec![LimitReason::HourlyLimit]);
    }

    #[tokio::test]
    async fn test_counter_resets_after_hour() {
        let limiter = RateLimiter::new(Arc::new(MemoryStore::new()));
        let policy = policy(1, 10, Duration::zero());
        let start = at(9, 0);
        let kind = NotificationKind::GoalReminder;

        assert_eq!(limiter.try_consume("u", kind, &policy, start).await.unwrap(), RateLimitDecision::Allowed);
        assert_eq!(
            limiter.try_consume("u", kind, &policy, start + Duration::minutes(30)).await.unwrap(),
            RateLimitDecision::Denied(LimitReason::HourlyLimit)
        );

        let later = start + Duration::minutes(61);
        assert_eq!(limiter.try_consume("u", kind, &policy, later).await.unwrap(), RateLimitDecision::Allowed);
        let counter = limiter.counter("u", kind).await.unwrap();
        assert_eq!(counter.hourly_count, 1);
        assert_eq!(counter.daily_count, 2);
    }

    #[tokio::test]
    async fn test_daily_limit_and_cooldown() {
        let limiter = RateLimiter::new(Arc::new(MemoryStore::new()));
        let kind = NotificationKind::StreakReminder;
        let start = at(8, 0);

        let daily = policy(10, 2, Duration::zero());
        assert_eq!(limiter.try_consume("u", kind, &daily, start).await.unwrap(), RateLimitDecision::Allowed);
        assert_eq!(limiter.try_consume("u", kind, &daily, start).await.unwrap(), RateLimitDecision::Allowed);
        assert_eq!(
            limiter.try_consume("u", kind, &daily, start + Duration::hours(3)).await.unwrap(),
            RateLimitDecision::Denied(LimitReason::DailyLimit)
        );

        let cooling = policy(10, 10, Duration::minutes(10));
        let other = NotificationKind::GoalReminder;
        assert_eq!(limiter.try_consume("u", other, &cooling, start).await.unwrap(), RateLimitDecision::Allowed);
        assert_eq!(
            limiter.try_consume("u", other, &cooling, start + Duration::minutes(9)).await.unwrap(),
            RateLimitDecision::Denied(LimitReason::Cooldown)
        );
        assert_eq!(
            limiter.try_consume("u", other, &cooling, start + Duration::minutes(10)).await.unwrap(),
            RateLimitDecision::Allowed
        );
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let limiter = RateLimiter::new(Arc::new(MemoryStore::new()));
        let policy = policy(1, 1, Duration::zero());
        let now = at(12, 0);

        assert_eq!(limiter.try_consume("a", NotificationKind::PostLike, &policy, now).await.unwrap(), RateLimitDecision::Allowed);
        assert_eq!(limiter.try_consume("b", NotificationKind::PostLike, &policy, now).await.unwrap(), RateLimitDecision::Allowed);
        assert_eq!(limiter.try_consume("a", NotificationKind::PostComment, &policy, now).await.unwrap(), RateLimitDecision::Allowed);
    }

    #[tokio::test]
    async fn test_counters_survive_restart() {
        let store = Arc::new(MemoryStore::new());
        let policy = policy(2, 10, Duration::zero());
        let now = at(12, 0);

        let limiter = RateLimiter::new(store.clone());
        limiter.try_consume("user|with|pipes", NotificationKind::PostLike, &policy, now).await.unwrap();
        limiter.try_consume("user|with|pipes", NotificationKind::PostLike, &policy, now).await.unwrap();

        let restarted = RateLimiter::new(store);
        assert_eq!(restarted.load().await.unwrap(), 1);
        assert_eq!(
            restarted.try_consume("user|with|pipes", NotificationKind::PostLike, &policy, now).await.unwrap(),
            RateLimitDecision::Denied(LimitReason::HourlyLimit)
        );
    }

    #[tokio::test]
    async fn test_store_failure_does_not_consume() {
        let store = Arc::new(MemoryStore::new());
        let limiter = RateLimiter::new(store.clone());
        let policy = policy(1, 1, Duration::zero());
        let now = at(12, 0);

        store.set_unavailable(true);
        assert!(limiter.try_consume("u", NotificationKind::PostLike, &policy, now).await.is_err());
        store.set_unavailable(false);
        assert_eq!(limiter.try_consume("u", NotificationKind::PostLike, &policy, now).await.unwrap(), RateLimitDecision::Allowed);
    }

    #[tokio::test]
    async fn test_prune_idle_counters() {
        let store = Arc::new(MemoryStore::new());
        let limiter = RateLimiter::new(store.clone());
        let policy = policy(5, 5, Duration::zero());
        let now = at(12, 0);

        limiter.try_consume("u", NotificationKind::PostLike, &policy, now).await.unwrap();
        assert_eq!(limiter.prune_idle(now + Duration::hours(2)).await, 0);
        assert_eq!(limiter.prune_idle(now + Duration::hours(25)).await, 1);
        assert_eq!(store.len(Table::RateLimitCounters).await, 0);
        assert!(limiter.counter("u", NotificationKind::PostLike).await.is_none());
    }

    #[tokio::test]
    async fn test_refund_returns_the_slot() {
        let store = Arc::new(MemoryStore::new());
        let limiter = RateLimiter::new(store.clone());
        let policy = policy(1, 1, Duration::minutes(30));
        let now = at(12, 0);
        let kind = NotificationKind::FriendAccepted;

        assert_eq!(limiter.try_consume("u", kind, &policy, now).await.unwrap(), RateLimitDecision::Allowed);
        limiter.refund("u", kind, now).await.unwrap();

        let counter = limiter.counter("u", kind).await.unwrap();
        assert_eq!((counter.hourly_count, counter.daily_count, counter.last_sent_at), (0, 0, None));
        let later = now + Duration::minutes(1);
        assert_eq!(limiter.try_consume("u", kind, &policy, later).await.unwrap(), RateLimitDecision::Allowed);

        // The persisted counter follows the refund
        let restarted = RateLimiter::new(store);
        restarted.load().await.unwrap();
        assert_eq!(restarted.counter("u", kind).await.unwrap().hourly_count, 1);

        // Stale refunds leave newer sends alone
        limiter.refund("u", kind, now).await.unwrap();
        assert_eq!(limiter.counter("u", kind).await.unwrap().last_sent_at, Some(later));
    }

    #[tokio::test]
    async fn test_prune_skips_slot_in_use() {
        let store = Arc::new(MemoryStore::new());
        let limiter = RateLimiter::new(store.clone());
        let policy = policy(5, 5, Duration::zero());
        let now = at(12, 0);

        limiter.try_consume("u", NotificationKind::PostLike, &policy, now).await.unwrap();
        let held = limiter.slot(&RateKey::new("u", NotificationKind::PostLike));

        assert_eq!(limiter.prune_idle(now + Duration::hours(25)).await, 0);
        assert_eq!(store.len(Table::RateLimitCounters).await, 1);

        drop(held);
        assert_eq!(limiter.prune_idle(now + Duration::hours(25)).await, 1);
    }
}
