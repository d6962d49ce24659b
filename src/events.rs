//! Engine event bus
//!
//! Services publish operational events (rate adjustments, backoff, memory
//! pressure, dedup fallback, scan lifecycle) on a bounded broadcast
//! channel. Subscribers may lag and drop messages under pressure; nothing
//! in the engine depends on an event being observed.

use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    RateAdjusted {
        key: String,
        old_rate: f64,
        new_rate: f64,
    },
    BackoffApplied {
        key: String,
        delay_ms: u64,
    },
    MemoryWarning {
        used_bytes: u64,
        cap_bytes: u64,
    },
    MemoryCritical {
        used_bytes: u64,
        cap_bytes: u64,
    },
    EmergencyEntered,
    EmergencyExited,
    DedupFallback {
        reason: String,
    },
    ScanAdmitted {
        scan_id: uuid::Uuid,
    },
    ScanEvicted {
        scan_id: uuid::Uuid,
    },
    TempDirEvicted {
        path: std::path::PathBuf,
    },
}

/// Shared handle for publishing and subscribing.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Publish, ignoring the no-subscriber case.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
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

    #[tokio::test]
    async fn events_reach_subscribers() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(EngineEvent::EmergencyEntered);
        assert_eq!(rx.recv().await.unwrap(), EngineEvent::EmergencyEntered);
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(EngineEvent::DedupFallback {
            reason: "performance_limit".into(),
        });
    }
}
