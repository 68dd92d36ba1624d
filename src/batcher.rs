// Merges same-recipient, same-kind batchable notifications into one push.
use std::collections::HashMap;
use uuid::Uuid;

use crate::models::{NotificationCandidate, NotificationKind, Payload};
use crate::policy::{AggregateTemplate, PolicyTable};

/// One push to send, plus the scheduled entries it stands for.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub entry_ids: Vec<Uuid>,
    pub candidate: NotificationCandidate,
}

impl Batch {
    pub fn size(&self) -> usize {
        self.entry_ids.len()
    }
}

pub fn batch(items: Vec<(Uuid, NotificationCandidate)>, policies: &PolicyTable) -> Vec<Batch> {
    // Groups keep first-seen order so output is deterministic
    let mut groups: Vec<Vec<(Uuid, NotificationCandidate)>> = Vec::new();
    let mut index: HashMap<(String, NotificationKind), usize> = HashMap::new();

    for (id, candidate) in items {
        if !policies.get(candidate.kind).batchable {
            groups.push(vec![(id, candidate)]);
            continue;
        }
        let key = (candidate.recipient_token.clone(), candidate.kind);
        match index.get(&key) {
            Some(&position) => groups[position].push((id, candidate)),
            None => {
                index.insert(key, groups.len());
                groups.push(vec![(id, candidate)]);
            }
        }
    }

    groups
        .into_iter()
        .filter_map(|group| {
            if group.len() == 1 {
                return group.into_iter().next().map(|(id, candidate)| Batch {
                    entry_ids: vec![id],
                    candidate,
                });
            }
            let template = policies
                .get(group[0].1.kind)
                .aggregate
                .clone()
                .unwrap_or_else(|| AggregateTemplate::new("{count} new notifications", "Open the app to catch up"));
            Some(merge(group, &template))
        })
        .collect()
}

fn merge(group: Vec<(Uuid, NotificationCandidate)>, template: &AggregateTemplate) -> Batch {
    let count = group.len();
    let (title, body) = template.render(count);
    let entry_ids: Vec<Uuid> = group.iter().map(|(id, _)| *id).collect();
    let first = &group[0].1;

    let mut payload = Payload::new();
    payload.insert("type".to_string(), serde_json::json!(first.kind.as_str()));
    payload.insert("batched".to_string(), serde_json::json!(true));
    payload.insert("batchCount".to_string(), serde_json::json!(count));
    payload.insert(
        "mergedIds".to_string(),
        serde_json::json!(entry_ids.iter().map(Uuid::to_string).collect::<Vec<_>>()),
    );

    let candidate = NotificationCandidate {
        recipient_id: first.recipient_id.clone(),
        recipient_token: first.recipient_token.clone(),
        kind: first.kind,
        title,
        body,
        payload,
        badge_count: Some(count as u32),
    };

    Batch { entry_ids, candidate }
}
