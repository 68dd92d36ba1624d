// Background loops driving the scheduler.
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};
use uuid::Uuid;

use crate::push::PushSender;
use crate::scheduler::Scheduler;
use crate::settings::SettingsProvider;
use crate::store::StateStore;

pub async fn run_processing_loop<P, S, K>(
    scheduler: Arc<Scheduler<P, S, K>>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) where
    P: PushSender + Sync + 'static,
    S: SettingsProvider + Sync + 'static,
    K: StateStore + Sync + 'static,
{
    info!(period_secs = period.as_secs(), "Starting processing loop");
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                scheduler.process_due().await;
            }
            _ = shutdown.changed() => break,
        }
    }
    info!("Processing loop stopped");
}

pub async fn run_cleanup_loop<P, S, K>(
    scheduler: Arc<Scheduler<P, S, K>>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) where
    P: PushSender + Sync + 'static,
    S: SettingsProvider + Sync + 'static,
    K: StateStore + Sync + 'static,
{
    info!(period_secs = period.as_secs(), "Starting cleanup loop");
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; nothing is old enough yet
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                scheduler.cleanup().await;
            }
            _ = shutdown.changed() => break,
        }
    }
    info!("Cleanup loop stopped");
}

/// Drains the immediate lane. Each entry is delivered on its own task so one
/// slow push does not hold up the rest.
pub async fn run_immediate_sender<P, S, K>(
    scheduler: Arc<Scheduler<P, S, K>>,
    mut receiver: mpsc::Receiver<Uuid>,
    mut shutdown: watch::Receiver<bool>,
) where
    P: PushSender + Sync + 'static,
    S: SettingsProvider + Sync + 'static,
    K: StateStore + Sync + 'static,
{
    info!("Starting immediate sender");
    loop {
        tokio::select! {
            next = receiver.recv() => {
                let Some(entry_id) = next else { break };
                let scheduler = scheduler.clone();
                tokio::spawn(async move {
                    let report = scheduler.deliver_immediate(entry_id).await;
                    debug!(entry_id = %entry_id, sent = report.sent, "Immediate delivery finished");
                });
            }
            _ = shutdown.changed() => break,
        }
    }
    // Anything still queued stays pending and goes out with the next tick after restart
    info!(queued = receiver.len(), "Immediate sender stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::PipelineConfig;
    use crate::models::{EntryStatus, NotificationKind};
    use crate::settings::StaticSettings;
    use crate::store::MemoryStore;
    use crate::testing::{at, candidate, RecordingSender};

    #[tokio::test]
    async fn test_immediate_sender_delivers_and_stops() {
        let clock = ManualClock::new(at(14, 0));
        let sender = RecordingSender::new();
        let (scheduler, receiver) = Scheduler::open(
            PipelineConfig::default(),
            Arc::new(clock),
            sender.clone(),
            StaticSettings::default(),
            Arc::new(MemoryStore::new()),
        )
        .await
        .unwrap();
        let scheduler = Arc::new(scheduler);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(run_immediate_sender(scheduler.clone(), receiver, shutdown_rx));

        let id = scheduler
            .submit(candidate(NotificationKind::FriendRequest, "New friend request", "Sam wants to connect"))
            .await
            .entry_ids()[0];

        for _ in 0..100 {
            if scheduler.entry(id).map(|e| e.status) == Some(EntryStatus::Sent) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(scheduler.entry(id).unwrap().status, EntryStatus::Sent);
        assert_eq!(sender.delivered().len(), 1);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
