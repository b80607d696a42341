//! Backup and restore notifications.
//!
//! Engines publish events on a broadcast channel; the CLI (or any embedding
//! service) subscribes and forwards them wherever it likes. Emitting never
//! blocks and never fails when nobody is listening.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Maximum number of queued events per subscriber
const EVENT_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum BackupEvent {
    #[serde(rename = "backup:started")]
    BackupStarted {
        backup_id: String,
        volume_id: String,
        incremental: bool,
    },

    #[serde(rename = "backup:progress")]
    BackupProgress(BackupProgressPayload),

    #[serde(rename = "backup:completed")]
    BackupCompleted {
        backup_id: String,
        object_count: u64,
        /// Uncompressed bytes written as chunk objects
        changed_bytes: u64,
        /// Bytes actually stored after compression
        stored_bytes: u64,
    },

    /// Backup stopped because its record was marked for deletion
    #[serde(rename = "backup:cancelled")]
    BackupCancelled {
        backup_id: String,
        objects_removed: usize,
    },

    #[serde(rename = "backup:failed")]
    BackupFailed { backup_id: String, error: String },

    #[serde(rename = "restore:started")]
    RestoreStarted {
        backup_id: String,
        chain_length: usize,
        segments: usize,
    },

    #[serde(rename = "restore:progress")]
    RestoreProgress {
        backup_id: String,
        percent: f64,
        restored_bytes: u64,
        total_bytes: u64,
    },

    #[serde(rename = "restore:completed")]
    RestoreCompleted {
        backup_id: String,
        restored_bytes: u64,
    },
}

/// What caused a progress notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressTrigger {
    /// Fixed wall-clock interval elapsed
    Timer,
    /// Another batch of chunks was processed
    ChunkCount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupProgressPayload {
    pub backup_id: String,
    pub volume_id: String,
    pub percent: f64,
    pub processed_bytes: u64,
    pub total_bytes: u64,
    pub bytes_per_second: u64,
    pub speed: String,
    pub chunks_processed: u64,
    pub objects_written: u64,
    pub trigger: ProgressTrigger,
}

/// Broadcast hub for [`BackupEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BackupEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BackupEvent> {
        self.tx.subscribe()
    }

    /// Publish an event to all current subscribers.
    pub fn emit(&self, event: BackupEvent) {
        // No receivers is normal
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_format() {
        let event = BackupEvent::BackupCancelled {
            backup_id: "b1".to_string(),
            objects_removed: 3,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "backup:cancelled");
        assert_eq!(json["payload"]["objects_removed"], 3);
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.emit(BackupEvent::RestoreCompleted {
            backup_id: "b".to_string(),
            restored_bytes: 0,
        });

        let mut rx = bus.subscribe();
        bus.emit(BackupEvent::BackupFailed {
            backup_id: "b".to_string(),
            error: "boom".to_string(),
        });
        match rx.recv().await.unwrap() {
            BackupEvent::BackupFailed { error, .. } => assert_eq!(error, "boom"),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
