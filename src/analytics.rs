use chrono::{DateTime, Timelike, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use uuid::Uuid;

use crate::models::DeliveryAnalyticsRecord;

pub const ANALYTICS_CAPACITY: usize = 1000;

// Below this many opens a recipient has no usable activity model
const MIN_OPENS_FOR_PEAKS: usize = 3;
const PEAK_HOURS: usize = 3;

/// Append-only delivery history, used to refine delivery timing.
#[derive(Debug, Default)]
pub struct DeliveryAnalytics {
    records: Mutex<VecDeque<DeliveryAnalyticsRecord>>,
}

impl DeliveryAnalytics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_delivery(&self, record: DeliveryAnalyticsRecord) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.push_back(record);
        while records.len() > ANALYTICS_CAPACITY {
            records.pop_front();
        }
    }

    // Matches either the record's own entry or any entry merged into it
    pub fn record_open(&self, entry_id: Uuid, opened_at: DateTime<Utc>) -> bool {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let Some(record) = records
            .iter_mut()
            .rev()
            .find(|r| r.entry_id == entry_id || r.merged_entry_ids.contains(&entry_id))
        else {
            return false;
        };
        if record.opened_at.is_none() {
            record.opened_at = Some(opened_at);
            record.response_time_seconds = Some((opened_at - record.delivered_at).num_seconds().max(0));
        }
        true
    }

    /// Local hours (0-23) in which the recipient most often opens notifications.
    pub fn peak_hours(&self, recipient_id: &str, utc_offset_minutes: i32) -> Option<Vec<u32>> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let mut opens_per_hour: HashMap<u32, usize> = HashMap::new();
        let mut total = 0;
        for opened_at in records
            .iter()
            .filter(|r| r.recipient_id == recipient_id)
            .filter_map(|r| r.opened_at)
        {
            let local = opened_at + chrono::Duration::minutes(i64::from(utc_offset_minutes));
            *opens_per_hour.entry(local.hour()).or_default() += 1;
            total += 1;
        }
        if total < MIN_OPENS_FOR_PEAKS {
            return None;
        }

        let mut ranked: Vec<(u32, usize)> = opens_per_hour.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        Some(ranked.into_iter().take(PEAK_HOURS).map(|(hour, _)| hour).collect())
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<DeliveryAnalyticsRecord> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).iter().cloned().collect()
    }
}
