// Admission, scheduling and delivery of notifications.
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::ops::AddAssign;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::analytics::DeliveryAnalytics;
use crate::batcher::{self, Batch};
use crate::clock::Clock;
use crate::config::PipelineConfig;
use crate::crypto::token_fingerprint;
use crate::dedup::{DuplicateCheck, DuplicateDetector};
use crate::error::{DeliveryError, Rejection, StoreError};
use crate::metrics::{
    BATCH_SIZE, CANDIDATES_REJECTED, CANDIDATES_SUBMITTED, DELIVERY_FAILURES, ENTRIES_ADMITTED, ENTRIES_CANCELLED,
    ENTRIES_FAILED, NOTIFICATIONS_SENT, RETRIES_SCHEDULED, SEND_LATENCY, TICK_DURATION,
};
use crate::models::{
    DeliveryAnalyticsRecord, EntryStatus, NotificationCandidate, NotificationKind, PushMessage, RecipientPreferences,
    ScheduledEntry,
};
use crate::planner;
use crate::policy::Priority;
use crate::push::PushSender;
use crate::rate_limiter::{RateLimitDecision, RateLimiter};
use crate::settings::{CachedSettings, SettingsProvider};
use crate::store::{self, StateStore, Table};
use crate::validator::{self, TokenFormat};

/// What happened to a submitted candidate. Producers are free to ignore it.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    // Entries handed to the immediate lane
    Immediate(Vec<Uuid>),
    Scheduled {
        entry_ids: Vec<Uuid>,
        scheduled_for: DateTime<Utc>,
    },
    Rejected(Rejection),
}

impl Admission {
    pub fn entry_ids(&self) -> &[Uuid] {
        match self {
            Self::Immediate(ids) | Self::Scheduled { entry_ids: ids, .. } => ids,
            Self::Rejected(_) => &[],
        }
    }

    pub fn is_admitted(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }
}

/// Entry-level outcome of one or more push attempts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub pushes: usize,
    pub sent: usize,
    pub retried: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl AddAssign for DeliveryReport {
    fn add_assign(&mut self, other: Self) {
        self.pushes += other.pushes;
        self.sent += other.sent;
        self.retried += other.retried;
        self.failed += other.failed;
        self.cancelled += other.cancelled;
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    pub entries_removed: usize,
    pub recent_pruned: usize,
    pub counters_pruned: usize,
}

#[derive(Debug, Default)]
struct EntryTable {
    entries: HashMap<Uuid, ScheduledEntry>,
    // Claimed by a send that has not reported back yet
    in_flight: HashSet<Uuid>,
    late_cancelled: HashSet<Uuid>,
    // Latest state not yet in the store
    dirty: HashSet<Uuid>,
}

impl EntryTable {
    fn claim_due(&mut self, now: DateTime<Utc>) -> Vec<(Uuid, NotificationCandidate)> {
        let mut due: Vec<&ScheduledEntry> = self
            .entries
            .values()
            .filter(|entry| entry.is_due(now) && !self.in_flight.contains(&entry.id))
            .collect();
        due.sort_by_key(|entry| (entry.scheduled_for, entry.created_at));

        let claimed: Vec<(Uuid, NotificationCandidate)> =
            due.into_iter().map(|entry| (entry.id, entry.candidate.clone())).collect();
        self.in_flight.extend(claimed.iter().map(|(id, _)| *id));
        claimed
    }

    fn claim(&mut self, id: Uuid, now: DateTime<Utc>) -> Option<NotificationCandidate> {
        if self.in_flight.contains(&id) {
            return None;
        }
        let entry = self.entries.get(&id).filter(|entry| entry.is_due(now))?;
        let candidate = entry.candidate.clone();
        self.in_flight.insert(id);
        Some(candidate)
    }
}

pub struct Scheduler<P, S, K> {
    config: PipelineConfig,
    clock: Arc<dyn Clock>,
    sender: P,
    settings: CachedSettings<S>,
    store: Arc<K>,
    rate_limiter: RateLimiter<K>,
    duplicates: DuplicateDetector<K>,
    analytics: DeliveryAnalytics,
    table: Mutex<EntryTable>,
    immediate_tx: mpsc::Sender<Uuid>,
    closed: AtomicBool,
}

impl<P, S, K> Scheduler<P, S, K>
where
    P: PushSender + Sync + 'static,
    S: SettingsProvider + Sync + 'static,
    K: StateStore + Sync + 'static,
{
    /// Restores persisted state and returns the scheduler together with the
    /// receiving end of its immediate lane.
    pub async fn open(
        config: PipelineConfig,
        clock: Arc<dyn Clock>,
        sender: P,
        settings: S,
        store: Arc<K>,
    ) -> Result<(Self, mpsc::Receiver<Uuid>), StoreError> {
        let rate_limiter = RateLimiter::new(store.clone());
        rate_limiter.load().await?;

        let duplicates = DuplicateDetector::new(store.clone(), config.policies.longest_duplicate_window());
        duplicates.load().await?;

        let rows: Vec<(String, ScheduledEntry)> = store::load_json(store.as_ref(), Table::ScheduledEntries).await?;
        let entries: HashMap<Uuid, ScheduledEntry> = rows.into_iter().map(|(_, entry)| (entry.id, entry)).collect();
        let pending = entries.values().filter(|e| e.status == EntryStatus::Pending).count();
        info!(entries = entries.len(), pending, "Restored scheduled entries");

        let (immediate_tx, immediate_rx) = mpsc::channel(config.immediate_capacity.max(1));
        let settings = CachedSettings::new(settings, config.preferences_ttl);

        let scheduler = Self {
            config,
            clock,
            sender,
            settings,
            store,
            rate_limiter,
            duplicates,
            analytics: DeliveryAnalytics::new(),
            table: Mutex::new(EntryTable {
                entries,
                ..Default::default()
            }),
            immediate_tx,
            closed: AtomicBool::new(false),
        };
        Ok((scheduler, immediate_rx))
    }

    fn lock_table(&self) -> MutexGuard<'_, EntryTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn settings(&self) -> &CachedSettings<S> {
        &self.settings
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Runs the admission checks and, on success, creates the scheduled entries.
    /// Never performs network I/O towards a push transport.
    pub async fn submit(&self, candidate: NotificationCandidate) -> Admission {
        CANDIDATES_SUBMITTED.inc();
        let recipient_id = candidate.recipient_id.clone();
        let kind = candidate.kind;

        match self.admit(candidate).await {
            Ok(admission) => admission,
            Err(rejection) => {
                CANDIDATES_REJECTED.with_label_values(&[rejection.reason_code()]).inc();
                info!(
                    recipient_id = %recipient_id,
                    kind = %kind,
                    reason = rejection.reason_code(),
                    detail = %rejection,
                    "Candidate dropped"
                );
                Admission::Rejected(rejection)
            }
        }
    }

    async fn admit(&self, candidate: NotificationCandidate) -> Result<Admission, Rejection> {
        if self.is_closed() {
            return Err(Rejection::Closed);
        }
        validator::validate(&candidate)?;

        let prefs = self.settings.get(&candidate.recipient_id).await.map_err(|e| {
            warn!(recipient_id = %candidate.recipient_id, error = %e, "Could not load preferences");
            Rejection::PreferencesUnavailable
        })?;
        if !prefs.allows(candidate.kind) {
            return Err(Rejection::Disabled);
        }

        let policy = self.config.policies.get(candidate.kind);
        let now = self.clock.now();

        match self
            .rate_limiter
            .try_consume(&candidate.recipient_id, candidate.kind, &policy.rate_limit, now)
            .await
        {
            Ok(RateLimitDecision::Allowed) => {}
            Ok(RateLimitDecision::Denied(reason)) => return Err(Rejection::RateLimited(reason)),
            Err(e) => {
                warn!(recipient_id = %candidate.recipient_id, error = %e, "Rate limit counter not persisted");
                return Err(Rejection::Persistence);
            }
        }

        let recent_seq = match self.duplicates.observe(&candidate, &policy.duplicate, now).await {
            Ok(DuplicateCheck::Recorded(seq)) => seq,
            Ok(DuplicateCheck::Duplicate) => return Err(Rejection::Duplicate),
            Err(e) => {
                warn!(recipient_id = %candidate.recipient_id, error = %e, "Recent notification not persisted");
                self.release_admission(&candidate, None, now).await;
                return Err(Rejection::Persistence);
            }
        };

        let peak_hours = if policy.priority == Priority::Low {
            self.analytics.peak_hours(&candidate.recipient_id, prefs.utc_offset_minutes)
        } else {
            None
        };
        let planned = planner::plan_delivery_time(policy, &prefs, peak_hours.as_deref(), now);

        // Batchable kinds always wait for a tick so they can be merged
        let immediate = !policy.batchable && planned - now <= self.config.immediate_threshold;
        let scheduled_for = if immediate { now } else { planned };

        let entries: Vec<ScheduledEntry> = delivery_tokens(&candidate, &prefs)
            .iter()
            .map(|token| ScheduledEntry::new(candidate.for_token(token), scheduled_for, now))
            .collect();
        let entry_ids: Vec<Uuid> = entries.iter().map(|entry| entry.id).collect();

        if let Err(e) = self.persist_new(&entries).await {
            warn!(recipient_id = %candidate.recipient_id, error = %e, "Scheduled entry not persisted");
            self.release_admission(&candidate, Some(recent_seq), now).await;
            return Err(Rejection::Persistence);
        }
        {
            let mut table = self.lock_table();
            for entry in entries {
                table.entries.insert(entry.id, entry);
            }
        }

        let lane = if immediate { "immediate" } else { "scheduled" };
        ENTRIES_ADMITTED.with_label_values(&[lane]).inc_by(entry_ids.len() as u64);
        info!(
            recipient_id = %candidate.recipient_id,
            kind = %candidate.kind,
            entries = entry_ids.len(),
            lane,
            scheduled_for = %scheduled_for,
            "Candidate admitted"
        );

        if immediate {
            for id in &entry_ids {
                if let Err(e) = self.immediate_tx.try_send(*id) {
                    debug!(entry_id = %id, error = %e, "Immediate lane unavailable, leaving entry for the tick");
                }
            }
            Ok(Admission::Immediate(entry_ids))
        } else {
            Ok(Admission::Scheduled {
                entry_ids,
                scheduled_for,
            })
        }
    }

    // Nothing was scheduled, so the rate-limit slot and recent record taken on the way are handed back
    async fn release_admission(&self, candidate: &NotificationCandidate, recent_seq: Option<u64>, now: DateTime<Utc>) {
        if let Some(seq) = recent_seq {
            self.duplicates.forget(seq).await;
        }
        if let Err(e) = self.rate_limiter.refund(&candidate.recipient_id, candidate.kind, now).await {
            warn!(recipient_id = %candidate.recipient_id, kind = %candidate.kind, error = %e, "Refunded rate limit counter not persisted");
        }
    }

    // All or nothing: a partial write is rolled back before the rejection
    async fn persist_new(&self, entries: &[ScheduledEntry]) -> Result<(), StoreError> {
        for (written, entry) in entries.iter().enumerate() {
            if let Err(e) =
                store::put_json(self.store.as_ref(), Table::ScheduledEntries, &entry.id.to_string(), entry).await
            {
                for earlier in &entries[..written] {
                    let key = earlier.id.to_string();
                    if let Err(e) = StateStore::delete(self.store.as_ref(), Table::ScheduledEntries, &key).await {
                        warn!(entry_id = %earlier.id, error = %e, "Failed to roll back partially admitted entry");
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    async fn persist_updates(&self, entries: Vec<ScheduledEntry>) {
        for entry in entries {
            let key = entry.id.to_string();
            if let Err(e) = store::put_json(self.store.as_ref(), Table::ScheduledEntries, &key, &entry).await {
                warn!(entry_id = %entry.id, error = %e, "Entry update not persisted, will retry on next tick");
                self.lock_table().dirty.insert(entry.id);
            }
        }
    }

    // Re-writes entries whose last persistence attempt failed
    async fn flush_dirty(&self) -> usize {
        let snapshot: Vec<ScheduledEntry> = {
            let mut guard = self.lock_table();
            let table = &mut *guard;
            table.dirty.retain(|id| table.entries.contains_key(id));
            table.dirty.iter().filter_map(|id| table.entries.get(id).cloned()).collect()
        };

        let mut flushed = 0;
        for entry in snapshot {
            let key = entry.id.to_string();
            match store::put_json(self.store.as_ref(), Table::ScheduledEntries, &key, &entry).await {
                Ok(()) => {
                    let mut table = self.lock_table();
                    // Only clear the mark if nothing changed meanwhile
                    if table.entries.get(&entry.id) == Some(&entry) {
                        table.dirty.remove(&entry.id);
                    }
                    flushed += 1;
                }
                Err(e) => warn!(entry_id = %entry.id, error = %e, "Entry still not persisted"),
            }
        }
        if flushed > 0 {
            info!(flushed, "Persisted previously failed entry updates");
        }
        flushed
    }

    /// Processing tick: claims every due entry, batches and delivers them.
    pub async fn process_due(&self) -> DeliveryReport {
        let _timer = TICK_DURATION.start_timer();
        self.flush_dirty().await;

        let now = self.clock.now();
        let due = self.lock_table().claim_due(now);
        if due.is_empty() {
            return DeliveryReport::default();
        }

        let due_count = due.len();
        let batches = batcher::batch(due, &self.config.policies);
        debug!(due = due_count, pushes = batches.len(), "Delivering due entries");

        let mut report = DeliveryReport::default();
        for outcome in join_all(batches.into_iter().map(|batch| self.deliver(batch))).await {
            report += outcome;
        }

        info!(
            due = due_count,
            pushes = report.pushes,
            sent = report.sent,
            retried = report.retried,
            failed = report.failed,
            cancelled = report.cancelled,
            "Processing tick complete"
        );
        report
    }

    /// Delivers one entry from the immediate lane, unless a tick got to it first.
    pub async fn deliver_immediate(&self, id: Uuid) -> DeliveryReport {
        let now = self.clock.now();
        let claimed = self.lock_table().claim(id, now);
        match claimed {
            Some(candidate) => {
                self.deliver(Batch {
                    entry_ids: vec![id],
                    candidate,
                })
                .await
            }
            None => {
                debug!(entry_id = %id, "Immediate entry already handled");
                DeliveryReport::default()
            }
        }
    }

    async fn deliver(&self, batch: Batch) -> DeliveryReport {
        let priority = self.config.policies.get(batch.candidate.kind).priority;
        let message = PushMessage::from_candidate(&batch.candidate, priority);
        let token = batch.candidate.recipient_token.as_str();
        BATCH_SIZE.observe(batch.size() as f64);

        let started = Instant::now();
        let send = PushSender::send(&self.sender, token, &message);
        let result = match tokio::time::timeout(self.config.send_timeout, send).await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Timeout(self.config.send_timeout)),
        };
        SEND_LATENCY.observe(started.elapsed().as_secs_f64());

        if let Err(e) = &result {
            DELIVERY_FAILURES.with_label_values(&[e.class()]).inc();
            warn!(
                recipient_id = %batch.candidate.recipient_id,
                kind = %batch.candidate.kind,
                token = %token_fingerprint(token),
                entries = batch.size(),
                error = %e,
                "Push attempt failed"
            );
        }

        self.finish(&batch, result).await
    }

    async fn finish(&self, batch: &Batch, result: Result<(), DeliveryError>) -> DeliveryReport {
        let now = self.clock.now();
        let mut report = DeliveryReport {
            pushes: 1,
            ..Default::default()
        };

        let (updated, cancelled_late) = {
            let mut guard = self.lock_table();
            let table = &mut *guard;
            let mut updated = Vec::with_capacity(batch.size());
            let mut cancelled_late = false;

            for id in &batch.entry_ids {
                table.in_flight.remove(id);
                let late = table.late_cancelled.remove(id);
                cancelled_late |= late;
                let Some(entry) = table.entries.get_mut(id) else {
                    continue;
                };

                entry.updated_at = now;
                match &result {
                    Ok(()) => {
                        entry.status = EntryStatus::Sent;
                        entry.last_error = None;
                        report.sent += 1;
                    }
                    Err(e) => {
                        entry.last_error = Some(e.to_string());
                        if late {
                            entry.status = EntryStatus::Cancelled;
                            report.cancelled += 1;
                        } else if e.is_permanent() || entry.retry_count >= self.config.max_retries {
                            entry.status = EntryStatus::Failed;
                            report.failed += 1;
                        } else {
                            entry.retry_count += 1;
                            entry.scheduled_for = now + self.config.retry_backoff;
                            report.retried += 1;
                        }
                    }
                }
                updated.push(entry.clone());
            }
            (updated, cancelled_late)
        };

        RETRIES_SCHEDULED.inc_by(report.retried as u64);
        ENTRIES_FAILED.inc_by(report.failed as u64);
        ENTRIES_CANCELLED.inc_by(report.cancelled as u64);
        for entry in updated.iter().filter(|e| e.status == EntryStatus::Failed) {
            warn!(
                entry_id = %entry.id,
                recipient_id = %entry.candidate.recipient_id,
                kind = %entry.candidate.kind,
                attempts = entry.retry_count + 1,
                "Entry permanently failed"
            );
        }
        self.persist_updates(updated).await;

        let candidate = &batch.candidate;
        match result {
            Ok(()) => {
                NOTIFICATIONS_SENT.inc();
                if let Some((&entry_id, merged)) = batch.entry_ids.split_first() {
                    self.analytics.record_delivery(DeliveryAnalyticsRecord {
                        entry_id,
                        merged_entry_ids: merged.to_vec(),
                        recipient_id: candidate.recipient_id.clone(),
                        kind: candidate.kind,
                        delivered_at: now,
                        opened_at: None,
                        response_time_seconds: None,
                        batch_count: batch.size(),
                        cancelled_late,
                    });
                }
                info!(
                    recipient_id = %candidate.recipient_id,
                    kind = %candidate.kind,
                    token = %token_fingerprint(&candidate.recipient_token),
                    batch_count = batch.size(),
                    cancelled_late,
                    "Notification delivered"
                );
            }
            Err(e) if e.is_permanent() => {
                if let Err(err) = self
                    .settings
                    .invalidate_token(&candidate.recipient_id, &candidate.recipient_token)
                    .await
                {
                    warn!(recipient_id = %candidate.recipient_id, error = %err, "Failed to invalidate dead token");
                }
            }
            Err(_) => {}
        }

        report
    }

    /// Cancels a pending entry. A cancel that races an in-flight send lets the
    /// send finish and is recorded against the delivery instead.
    pub async fn cancel(&self, id: Uuid) -> bool {
        let cancelled = {
            let mut guard = self.lock_table();
            let table = &mut *guard;
            if table.in_flight.contains(&id) {
                table.late_cancelled.insert(id);
                info!(entry_id = %id, "Cancel arrived while the push is in flight");
                return true;
            }
            match table.entries.get_mut(&id) {
                Some(entry) if entry.status == EntryStatus::Pending => {
                    entry.status = EntryStatus::Cancelled;
                    entry.updated_at = self.clock.now();
                    entry.clone()
                }
                _ => return false,
            }
        };

        ENTRIES_CANCELLED.inc();
        info!(
            entry_id = %id,
            recipient_id = %cancelled.candidate.recipient_id,
            kind = %cancelled.candidate.kind,
            "Entry cancelled"
        );
        self.persist_updates(vec![cancelled]).await;
        true
    }

    // Used when a recipient turns a category off
    pub async fn cancel_matching(&self, recipient_id: &str, kind: NotificationKind) -> usize {
        let ids: Vec<Uuid> = self
            .lock_table()
            .entries
            .values()
            .filter(|e| e.status == EntryStatus::Pending)
            .filter(|e| e.candidate.recipient_id == recipient_id && e.candidate.kind == kind)
            .map(|e| e.id)
            .collect();

        let mut cancelled = 0;
        for id in ids {
            if self.cancel(id).await {
                cancelled += 1;
            }
        }
        cancelled
    }

    pub fn record_open(&self, entry_id: Uuid, opened_at: DateTime<Utc>) -> bool {
        self.analytics.record_open(entry_id, opened_at)
    }

    pub fn delivery_history(&self) -> Vec<DeliveryAnalyticsRecord> {
        self.analytics.snapshot()
    }

    pub fn entry(&self, id: Uuid) -> Option<ScheduledEntry> {
        self.lock_table().entries.get(&id).cloned()
    }

    pub fn entries_with_status(&self, status: EntryStatus) -> Vec<ScheduledEntry> {
        let mut entries: Vec<ScheduledEntry> = self
            .lock_table()
            .entries
            .values()
            .filter(|e| e.status == status)
            .cloned()
            .collect();
        entries.sort_by_key(|e| (e.created_at, e.id));
        entries
    }

    /// Cleanup tick: drops old terminal entries, stale recent records and idle counters.
    pub async fn cleanup(&self) -> CleanupReport {
        let now = self.clock.now();
        let cutoff = now - self.config.terminal_retention;

        let expired: Vec<Uuid> = {
            let mut guard = self.lock_table();
            let table = &mut *guard;
            let expired: Vec<Uuid> = table
                .entries
                .values()
                .filter(|e| e.status.is_terminal() && e.updated_at < cutoff && !table.in_flight.contains(&e.id))
                .map(|e| e.id)
                .collect();
            for id in &expired {
                table.entries.remove(id);
                table.dirty.remove(id);
            }
            expired
        };

        for id in &expired {
            if let Err(e) = StateStore::delete(self.store.as_ref(), Table::ScheduledEntries, &id.to_string()).await {
                // Reloaded as terminal after a restart and removed again
                warn!(entry_id = %id, error = %e, "Failed to delete expired entry");
            }
        }

        let report = CleanupReport {
            entries_removed: expired.len(),
            recent_pruned: self.duplicates.prune(now).await,
            counters_pruned: self.rate_limiter.prune_idle(now).await,
        };
        info!(
            entries_removed = report.entries_removed,
            recent_pruned = report.recent_pruned,
            counters_pruned = report.counters_pruned,
            "Cleanup complete"
        );
        report
    }

    /// Stops admission and writes out any state that failed to persist earlier.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let flushed = self.flush_dirty().await;
        let remaining = self.lock_table().dirty.len();
        if remaining > 0 {
            warn!(remaining, "Scheduler closed with unpersisted entry updates");
        } else {
            info!(flushed, "Scheduler closed");
        }
    }
}

// The candidate's own token first, then other registered devices when fan-out is on
fn delivery_tokens(candidate: &NotificationCandidate, prefs: &RecipientPreferences) -> Vec<String> {
    let mut tokens = vec![candidate.recipient_token.clone()];
    if prefs.fan_out_to_all_tokens {
        for token in &prefs.device_tokens {
            if tokens.contains(token) {
                continue;
            }
            if TokenFormat::detect(token).is_none() {
                debug!(token = %token_fingerprint(token), "Skipping unrecognised device token");
                continue;
            }
            tokens.push(token.clone());
        }
    }
    tokens
}
