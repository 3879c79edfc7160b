use libfakeseed_core::Id20;
use serde::Serialize;
use tracker_comms::AnnounceEvent;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SeedEvent {
    SeedStarted,
    SeedStopped,
    TorrentAdded {
        info_hash: Id20,
        name: String,
    },
    TorrentRemoved {
        info_hash: Id20,
    },
    Announcing {
        info_hash: Id20,
        tracker: String,
        event: AnnounceEvent,
    },
    AnnounceSucceeded {
        info_hash: Id20,
        tracker: String,
        event: AnnounceEvent,
        interval_secs: u64,
        seeders: u32,
        leechers: u32,
    },
    AnnounceFailed {
        info_hash: Id20,
        tracker: String,
        event: AnnounceEvent,
        error: String,
    },
    SwarmChanged {
        info_hash: Id20,
        seeders: u32,
        leechers: u32,
    },
    GlobalBandwidthChanged {
        bytes_per_second: u64,
    },
    WeightChanged {
        info_hash: Id20,
        weight: f64,
    },
}

/// Fan-out of [`SeedEvent`]s to any number of listeners.
///
/// Emitting never blocks: with no listeners the event is dropped, and a listener that
/// falls behind loses the oldest events.
#[derive(Clone, Debug)]
pub struct EventBus {
    event_tx: tokio::sync::broadcast::Sender<SeedEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (event_tx, _) = tokio::sync::broadcast::channel(256);
        Self { event_tx }
    }

    pub fn emit(&self, event: SeedEvent) {
        let _ = self.event_tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SeedEvent> {
        self.event_tx.subscribe()
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
    async fn test_every_listener_gets_events() {
        let bus = EventBus::new();
        bus.emit(SeedEvent::SeedStarted);

        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        bus.emit(SeedEvent::GlobalBandwidthChanged {
            bytes_per_second: 42,
        });

        for rx in [&mut rx1, &mut rx2] {
            assert_eq!(
                rx.recv().await.unwrap(),
                SeedEvent::GlobalBandwidthChanged {
                    bytes_per_second: 42
                }
            );
        }
    }

    #[test]
    fn test_serialize() {
        let json = serde_json::to_string(&SeedEvent::TorrentRemoved {
            info_hash: Id20::new([1; 20]),
        })
        .unwrap();
        assert_eq!(
            json,
            format!(
                r#"{{"type":"torrent_removed","info_hash":"{}"}}"#,
                "01".repeat(20)
            )
        );
    }
}
