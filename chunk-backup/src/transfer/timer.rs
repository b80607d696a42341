//! Periodic backup progress notifications.
//!
//! Progress is reported from two independent sources: the engine loop every
//! N chunks, and a timer task on a fixed wall-clock interval. Both go through
//! the same [`ProgressReporter`]; events near a boundary may be duplicated.

use super::progress::{format_speed, percent_complete, ProgressCounters, SpeedMeter};
use crate::events::{BackupEvent, BackupProgressPayload, EventBus, ProgressTrigger};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Builds and publishes progress events for one backup.
pub struct ProgressReporter {
    events: EventBus,
    backup_id: String,
    volume_id: String,
    total_bytes: u64,
    counters: Arc<ProgressCounters>,
    meter: Mutex<SpeedMeter>,
}

impl ProgressReporter {
    pub fn new(
        events: EventBus,
        backup_id: String,
        volume_id: String,
        total_bytes: u64,
        counters: Arc<ProgressCounters>,
    ) -> Self {
        Self {
            events,
            backup_id,
            volume_id,
            total_bytes,
            counters,
            meter: Mutex::new(SpeedMeter::new()),
        }
    }

    pub fn counters(&self) -> &Arc<ProgressCounters> {
        &self.counters
    }

    /// Publish the current progress.
    pub fn report(&self, trigger: ProgressTrigger) {
        let snap = self.counters.snapshot();
        let bytes_per_second = self
            .meter
            .lock()
            .map(|mut meter| meter.sample(snap.processed_bytes))
            .unwrap_or(0);

        let percent = percent_complete(snap.processed_bytes, self.total_bytes);
        debug!(
            "Backup {} progress: {:.1}% ({:?})",
            self.backup_id, percent, trigger
        );

        self.events
            .emit(BackupEvent::BackupProgress(BackupProgressPayload {
                backup_id: self.backup_id.clone(),
                volume_id: self.volume_id.clone(),
                percent,
                processed_bytes: snap.processed_bytes,
                total_bytes: self.total_bytes,
                bytes_per_second,
                speed: format_speed(bytes_per_second),
                chunks_processed: snap.chunks,
                objects_written: snap.objects,
                trigger,
            }));
    }
}

/// Background task reporting progress on a fixed interval.
///
/// The task ends when [`ProgressTimer::stop`] is awaited or, at the latest,
/// at its next tick after the timer is dropped.
pub struct ProgressTimer {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ProgressTimer {
    /// Start reporting every `period`. The first report fires after one period.
    pub fn start(period: Duration, reporter: Arc<ProgressReporter>) -> Self {
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => reporter.report(ProgressTrigger::Timer),
                    _ = task_cancel.cancelled() => break,
                }
            }
        });

        Self {
            cancel,
            handle: Some(handle),
        }
    }

    /// A timer that never fires, for when periodic reporting is disabled.
    pub fn disabled() -> Self {
        Self {
            cancel: CancellationToken::new(),
            handle: None,
        }
    }

    /// Stop the task and wait for it to exit.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for ProgressTimer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reporter(events: &EventBus, counters: Arc<ProgressCounters>) -> Arc<ProgressReporter> {
        Arc::new(ProgressReporter::new(
            events.clone(),
            "b1".to_string(),
            "vol".to_string(),
            1000,
            counters,
        ))
    }

    #[tokio::test]
    async fn test_report_payload() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let counters = Arc::new(ProgressCounters::new());
        counters.add_chunk(250);
        counters.add_object(250, 100);

        reporter(&events, counters).report(ProgressTrigger::ChunkCount);

        match rx.recv().await.unwrap() {
            BackupEvent::BackupProgress(payload) => {
                assert_eq!(payload.trigger, ProgressTrigger::ChunkCount);
                assert!((payload.percent - 25.0).abs() < 0.01);
                assert_eq!(payload.chunks_processed, 1);
                assert_eq!(payload.objects_written, 1);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_on_interval_and_stops() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let counters = Arc::new(ProgressCounters::new());

        let timer = ProgressTimer::start(Duration::from_secs(10), reporter(&events, counters));

        tokio::time::sleep(Duration::from_secs(25)).await;
        timer.stop().await;

        let mut ticks = 0;
        while let Ok(event) = rx.try_recv() {
            if let BackupEvent::BackupProgress(payload) = event {
                assert_eq!(payload.trigger, ProgressTrigger::Timer);
                ticks += 1;
            }
        }
        assert_eq!(ticks, 2);

        // Nothing more arrives once stopped
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disabled_timer_stops_immediately() {
        ProgressTimer::disabled().stop().await;
    }
}
