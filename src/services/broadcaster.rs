//! Status broadcaster
//!
//! Fans workstation state changes out to map viewers over a tokio broadcast
//! channel. A subscription starts with a registry snapshot and then yields
//! deltas, dropping any event whose version the viewer has already seen.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};

use crate::models::{Computer, MapUpdate, StatusEvent};
use crate::services::registry::Registry;

pub struct Broadcaster {
    tx: broadcast::Sender<StatusEvent>,
    registry: Arc<Registry>,
}

impl Broadcaster {
    pub fn new(registry: Arc<Registry>, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx, registry }
    }

    /// Publish the state of a computer right after it changed
    pub fn publish_computer(&self, computer: &Computer) {
        self.publish(StatusEvent::from(computer));
    }

    pub fn publish(&self, event: StatusEvent) {
        // No receivers is fine; nobody is watching the map.
        let _ = self.tx.send(event);
    }

    /// Subscribe first, snapshot second: anything that changes in between is
    /// both in the channel and possibly in the snapshot, and the version
    /// filter drops the copy.
    pub fn subscribe(&self) -> Subscription {
        let rx = self.tx.subscribe();
        let snapshot = self.registry.list_all();
        Subscription {
            rx,
            registry: self.registry.clone(),
            seen: HashMap::new(),
            pending_snapshot: Some(snapshot),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

pub struct Subscription {
    rx: broadcast::Receiver<StatusEvent>,
    registry: Arc<Registry>,
    seen: HashMap<String, u64>,
    pending_snapshot: Option<Vec<Computer>>,
}

impl Subscription {
    /// Next message for this viewer; `None` once the broadcaster is gone
    pub async fn next(&mut self) -> Option<MapUpdate> {
        if let Some(computers) = self.pending_snapshot.take() {
            return Some(self.snapshot(computers));
        }

        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    let newer = self
                        .seen
                        .get(&event.computer_id)
                        .map_or(true, |v| event.version > *v);
                    if newer {
                        self.seen.insert(event.computer_id.clone(), event.version);
                        return Some(MapUpdate::Status(event));
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Map viewer lagged by {} events, resending snapshot", skipped);
                    let computers = self.registry.list_all();
                    return Some(self.snapshot(computers));
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    fn snapshot(&mut self, computers: Vec<Computer>) -> MapUpdate {
        self.seen = computers
            .iter()
            .map(|c| (c.id.clone(), c.version))
            .collect();
        MapUpdate::Snapshot { computers }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ComputerStatus;
    use std::time::Duration;
    use uuid::Uuid;

    fn setup(ids: &[&str], capacity: usize) -> (Arc<Registry>, Broadcaster) {
        let registry = Arc::new(Registry::new());
        registry.load(ids.iter().map(|id| Computer::new(*id, "main", 0, 0)).collect());
        let broadcaster = Broadcaster::new(registry.clone(), capacity);
        (registry, broadcaster)
    }

    async fn next(sub: &mut Subscription) -> MapUpdate {
        tokio::time::timeout(Duration::from_secs(1), sub.next())
            .await
            .expect("timed out waiting for update")
            .expect("broadcaster closed")
    }

    #[tokio::test]
    async fn test_first_message_is_snapshot() {
        let (registry, broadcaster) = setup(&["PC-02", "PC-01"], 16);
        registry.try_claim("PC-01", Uuid::new_v4()).unwrap();

        let expected = registry.list_all();
        let mut sub = broadcaster.subscribe();
        assert_eq!(next(&mut sub).await, MapUpdate::Snapshot { computers: expected });
    }

    #[tokio::test]
    async fn test_change_between_subscribe_and_publish_is_not_duplicated() {
        let (registry, broadcaster) = setup(&["PC-01"], 16);

        // Changed before the snapshot, published after the subscribe.
        let claimed = registry.try_claim("PC-01", Uuid::new_v4()).unwrap();
        let mut sub = broadcaster.subscribe();
        broadcaster.publish_computer(&claimed);

        let released = registry
            .release("PC-01", claimed.current_reservation.unwrap())
            .unwrap()
            .unwrap();
        broadcaster.publish_computer(&released);

        match next(&mut sub).await {
            MapUpdate::Snapshot { computers } => {
                assert_eq!(computers[0].status, ComputerStatus::Reserved)
            }
            other => panic!("expected snapshot, got {:?}", other),
        }
        match next(&mut sub).await {
            MapUpdate::Status(event) => {
                assert_eq!(event.status, ComputerStatus::Available);
                assert_eq!(event.version, released.version);
            }
            other => panic!("expected status, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stale_versions_are_dropped() {
        let (registry, broadcaster) = setup(&["PC-01"], 16);
        let mut sub = broadcaster.subscribe();
        next(&mut sub).await;

        let rid = Uuid::new_v4();
        let reserved = registry.try_claim("PC-01", rid).unwrap();
        let in_use = registry.mark_in_use("PC-01", rid).unwrap();

        // Published out of order: the older one must not follow the newer.
        broadcaster.publish_computer(&in_use);
        broadcaster.publish_computer(&reserved);
        let marker = registry.release("PC-01", rid).unwrap().unwrap();
        broadcaster.publish_computer(&marker);

        let mut versions = Vec::new();
        for _ in 0..2 {
            if let MapUpdate::Status(event) = next(&mut sub).await {
                versions.push(event.version);
            }
        }
        assert_eq!(versions, vec![in_use.version, marker.version]);
    }

    #[tokio::test]
    async fn test_lagging_viewer_gets_fresh_snapshot() {
        let (registry, broadcaster) = setup(&["PC-01"], 2);
        let mut sub = broadcaster.subscribe();
        next(&mut sub).await;

        for _ in 0..5 {
            let rid = Uuid::new_v4();
            broadcaster.publish_computer(&registry.try_claim("PC-01", rid).unwrap());
            broadcaster.publish_computer(&registry.release("PC-01", rid).unwrap().unwrap());
        }

        match next(&mut sub).await {
            MapUpdate::Snapshot { computers } => {
                assert_eq!(computers, registry.list_all());
            }
            other => panic!("expected snapshot, got {:?}", other),
        }
        assert_eq!(broadcaster.subscriber_count(), 1);
    }
}
