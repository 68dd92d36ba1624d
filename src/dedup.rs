//! Similarity-based duplicate detection over a bounded window of recently
//! admitted notifications.
//!
//! Each signal contributes `weight * value` to a score in `[0, 1]`:
//! same kind (0.4), same recipient token (0.3), title word overlap (0.2) and
//! body word overlap (0.1). The score is symmetric, so the order in which two
//! notifications arrive never changes the outcome.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::models::{NotificationCandidate, RecentNotificationRecord};
use crate::policy::DuplicateConfig;
use crate::store::{self, StateStore, Table};

/// Hard cap on remembered notifications; on overflow the oldest half is dropped.
pub const RECENT_CAPACITY: usize = 1000;

const KIND_WEIGHT: f64 = 0.4;
const TOKEN_WEIGHT: f64 = 0.3;
const TITLE_WEIGHT: f64 = 0.2;
const BODY_WEIGHT: f64 = 0.1;

pub fn similarity(a: &NotificationCandidate, b: &NotificationCandidate) -> f64 {
    let mut score = 0.0;
    if a.kind == b.kind {
        score += KIND_WEIGHT;
    }
    if a.recipient_token == b.recipient_token {
        score += TOKEN_WEIGHT;
    }
    score += TITLE_WEIGHT * word_overlap(&a.title, &b.title);
    score += BODY_WEIGHT * word_overlap(&a.body, &b.body);
    score
}

/// Jaccard ratio of lower-cased, whitespace-separated words.
pub fn word_overlap(a: &str, b: &str) -> f64 {
    let left: HashSet<String> = a.split_whitespace().map(str::to_lowercase).collect();
    let right: HashSet<String> = b.split_whitespace().map(str::to_lowercase).collect();
    let union = left.union(&right).count();
    if union == 0 {
        return 1.0;
    }
    left.intersection(&right).count() as f64 / union as f64
}

struct RecentWindow {
    records: VecDeque<(u64, RecentNotificationRecord)>,
    next_seq: u64,
}

impl RecentWindow {
    // Removes records too old to ever match again, returns their sequence numbers
    fn prune_older_than(&mut self, cutoff: DateTime<Utc>) -> Vec<u64> {
        let mut removed = Vec::new();
        while let Some((seq, record)) = self.records.front() {
            if record.observed_at >= cutoff {
                break;
            }
            removed.push(*seq);
            self.records.pop_front();
        }
        removed
    }

    fn push(&mut self, record: RecentNotificationRecord) -> (u64, Vec<u64>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.records.push_back((seq, record));

        let mut trimmed = Vec::new();
        if self.records.len() > RECENT_CAPACITY {
            let excess = self.records.len() - RECENT_CAPACITY / 2;
            trimmed.extend(self.records.drain(..excess).map(|(seq, _)| seq));
        }
        (seq, trimmed)
    }
}

fn storage_key(seq: u64) -> String {
    format!("{seq:020}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateCheck {
    Duplicate,
    // Sequence number of the record added to the window
    Recorded(u64),
}

impl DuplicateCheck {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, DuplicateCheck::Duplicate)
    }
}

pub struct DuplicateDetector<K> {
    store: Arc<K>,
    retention: Duration,
    window: Mutex<RecentWindow>,
}

impl<K: StateStore + Sync> DuplicateDetector<K> {
    /// `retention` should be the longest duplicate window of any kind.
    pub fn new(store: Arc<K>, retention: Duration) -> Self {
        Self {
            store,
            retention,
            window: Mutex::new(RecentWindow {
                records: VecDeque::new(),
                next_seq: 0,
            }),
        }
    }

    pub async fn load(&self) -> Result<usize, StoreError> {
        let rows: Vec<(String, RecentNotificationRecord)> =
            store::load_json(self.store.as_ref(), Table::RecentNotifications).await?;
        let mut restored: Vec<(u64, RecentNotificationRecord)> = rows
            .into_iter()
            .filter_map(|(key, record)| key.parse::<u64>().ok().map(|seq| (seq, record)))
            .collect();
        restored.sort_by_key(|(seq, _)| *seq);

        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        window.next_seq = restored.last().map_or(0, |(seq, _)| seq + 1);
        window.records = restored.into();
        info!(count = window.records.len(), "Restored recent notification window");
        Ok(window.records.len())
    }

    /// Checks the candidate against the window. A non-duplicate is recorded in
    /// the window as part of the same check, so two identical candidates racing
    /// each other cannot both pass.
    pub async fn observe(
        &self,
        candidate: &NotificationCandidate,
        config: &DuplicateConfig,
        now: DateTime<Utc>,
    ) -> Result<DuplicateCheck, StoreError> {
        let (accepted, mut stale) = {
            let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
            let mut stale = window.prune_older_than(now - self.retention);

            let since = now - config.time_window;
            let similar = window
                .records
                .iter()
                .filter(|(_, record)| record.observed_at >= since)
                .filter(|(_, record)| similarity(candidate, &record.candidate) >= config.similarity_threshold)
                .count();

            if similar >= config.max_similar {
                debug!(
                    recipient_id = %candidate.recipient_id,
                    kind = %candidate.kind,
                    similar,
                    "Candidate matches recent notifications"
                );
                (None, stale)
            } else {
                let record = RecentNotificationRecord {
                    candidate: candidate.clone(),
                    observed_at: now,
                };
                let (seq, trimmed) = window.push(record.clone());
                stale.extend(trimmed);
                (Some((seq, record)), stale)
            }
        };

        stale.sort_unstable();
        self.delete_records(&stale).await;

        let Some((seq, record)) = accepted else {
            return Ok(DuplicateCheck::Duplicate);
        };
        if let Err(e) = store::put_json(self.store.as_ref(), Table::RecentNotifications, &storage_key(seq), &record).await {
            self.remove_from_window(seq);
            return Err(e);
        }
        Ok(DuplicateCheck::Recorded(seq))
    }

    /// Drops a record taken by `observe` whose admission did not go through.
    pub async fn forget(&self, seq: u64) {
        self.remove_from_window(seq);
        self.delete_records(&[seq]).await;
    }

    fn remove_from_window(&self, seq: u64) {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        window.records.retain(|(recorded, _)| *recorded != seq);
    }

    // Lazy pruning also runs from the hourly cleanup so idle windows shrink
    pub async fn prune(&self, now: DateTime<Utc>) -> usize {
        let stale = {
            let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
            window.prune_older_than(now - self.retention)
        };
        self.delete_records(&stale).await;
        stale.len()
    }

    pub fn len(&self) -> usize {
        self.window.lock().unwrap_or_else(|e| e.into_inner()).records.len()
    }

    async fn delete_records(&self, seqs: &[u64]) {
        for seq in seqs {
            if let Err(e) = StateStore::delete(self.store.as_ref(), Table::RecentNotifications, &storage_key(*seq)).await {
                warn!(seq, error = %e, "Failed to delete recent notification record");
            }
        }
    }
}
