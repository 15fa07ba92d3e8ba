//! Event fan-out to subscribers.
//!
//! Publishing never blocks: the bus is a single `tokio::sync::broadcast`
//! channel and subscribers filter by room locally. With no subscriber the
//! event is dropped; lagging subscribers skip events.

use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

use crate::models::{GatewayEvent, Room};

/// Sink for gateway events, injected into every publishing component.
pub trait Notifier: Send + Sync {
    fn publish(&self, event: GatewayEvent);
}

/// In-process broadcast hub. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<GatewayEvent>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<GatewayEvent>> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Notifier for EventBus {
    fn publish(&self, event: GatewayEvent) {
        tracing::trace!(event = event.name(), user_id = %event.user_id, "Publishing event");
        // Err only means nobody is listening
        let _ = self.sender.send(Arc::new(event));
    }
}

/// Receiver that yields only events for one set of rooms.
pub struct RoomSubscription {
    receiver: broadcast::Receiver<Arc<GatewayEvent>>,
    rooms: Vec<Room>,
}

impl RoomSubscription {
    pub fn new(bus: &EventBus, rooms: Vec<Room>) -> Self {
        Self {
            receiver: bus.subscribe(),
            rooms,
        }
    }

    /// Waits for the next matching event. Returns `None` once the bus is
    /// gone. Lagged events are skipped.
    pub async fn next(&mut self) -> Option<Arc<GatewayEvent>> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.rooms.iter().all(|room| event.is_in(room)) => {
                    return Some(event)
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Event subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Notifier that keeps every event, for tests.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<GatewayEvent>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<GatewayEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Event names in publish order.
    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(|e| e.name()).collect()
    }
}

impl Notifier for RecordingNotifier {
    fn publish(&self, event: GatewayEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
