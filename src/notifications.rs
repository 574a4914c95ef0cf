// Notifications published to downstream consumers (live views, alerting, CLI)
//
// The registry and the clip writer publish; consumers subscribe with their own
// bounded queue and drain it on their own schedule. Publishing never blocks:
// a full queue drops the event for that subscriber only. Frames may only fill
// part of a queue; the rest is kept for lifecycle events.

use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;

use crate::capture::Frame;
use crate::encoding::RecordingEvent;

/// Why a source left the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// Closed on request
    Closed,
    /// Reconnection attempts ran out
    ReconnectExhausted,
}

#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A new (possibly annotated, possibly placeholder) frame for a source
    FrameReady {
        source: String,
        frame: Arc<Frame>,
        placeholder: bool,
    },
    /// A source opened, or came back after reconnecting
    SourceOpened { source: String },
    /// A source stopped delivering frames and is being reconnected
    SourceReconnecting { source: String, reason: String },
    SourceRemoved { source: String, reason: RemovalReason },
    OpenFailed { source: String, reason: String },
    RecordingStarted { source: String, start_index: u64, manual: bool },
    RecordingFinished(RecordingEvent),
    /// A clip was rejected or could not be written
    ClipFailed { source: String, reason: String },
}

impl RegistryEvent {
    fn is_frame(&self) -> bool {
        matches!(self, RegistryEvent::FrameReady { .. })
    }
}

struct Subscriber {
    tx: Sender<RegistryEvent>,
    /// Queue depth beyond which frames are dropped
    frame_limit: usize,
}

impl Subscriber {
    fn new(tx: Sender<RegistryEvent>, capacity: usize) -> Self {
        Self {
            tx,
            frame_limit: capacity - capacity / 4,
        }
    }

    /// False once the receiver is gone
    fn offer(&self, event: &RegistryEvent) -> bool {
        if event.is_frame() && self.tx.len() >= self.frame_limit {
            return true;
        }
        match self.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(dropped)) => {
                if !dropped.is_frame() {
                    log::warn!("[Events] Subscriber queue full, dropped {}", describe(&dropped));
                }
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Fan-out of registry events to any number of subscribers
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe with a queue of `capacity` events
    pub fn subscribe(&self, capacity: usize) -> Receiver<RegistryEvent> {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        self.subscribers.lock().push(Subscriber::new(tx, capacity));
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn publish(&self, event: RegistryEvent) {
        self.subscribers.lock().retain(|sub| sub.offer(&event));
    }
}

fn describe(event: &RegistryEvent) -> String {
    match event {
        RegistryEvent::FrameReady { source, .. } => format!("frame from {}", source),
        RegistryEvent::SourceOpened { source } => format!("{} opened", source),
        RegistryEvent::SourceReconnecting { source, .. } => format!("{} reconnecting", source),
        RegistryEvent::SourceRemoved { source, reason } => format!("{} removed ({:?})", source, reason),
        RegistryEvent::OpenFailed { source, .. } => format!("{} failed to open", source),
        RegistryEvent::RecordingStarted { source, .. } => format!("{} recording started", source),
        RegistryEvent::RecordingFinished(event) => format!("{} recording finished", event.source),
        RegistryEvent::ClipFailed { source, .. } => format!("{} clip failed", source),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_subscriber_gets_each_event() {
        let bus = EventBus::new();
        let a = bus.subscribe(4);
        let b = bus.subscribe(4);

        bus.publish(RegistryEvent::SourceOpened { source: "porch".into() });

        assert!(matches!(a.try_recv(), Ok(RegistryEvent::SourceOpened { .. })));
        assert!(matches!(b.try_recv(), Ok(RegistryEvent::SourceOpened { .. })));
    }

    #[test]
    fn full_queue_drops_instead_of_blocking() {
        let bus = EventBus::new();
        let rx = bus.subscribe(1);
        for _ in 0..3 {
            bus.publish(RegistryEvent::FrameReady {
                source: "porch".into(),
                frame: Arc::new(Frame::placeholder(2, 2)),
                placeholder: true,
            });
        }
        assert_eq!(rx.try_iter().count(), 1);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn frames_leave_room_for_lifecycle_events() {
        let bus = EventBus::new();
        let rx = bus.subscribe(4);
        for _ in 0..10 {
            bus.publish(RegistryEvent::FrameReady {
                source: "porch".into(),
                frame: Arc::new(Frame::placeholder(2, 2)),
                placeholder: false,
            });
        }
        bus.publish(RegistryEvent::SourceRemoved {
            source: "porch".into(),
            reason: RemovalReason::ReconnectExhausted,
        });

        let received: Vec<RegistryEvent> = rx.try_iter().collect();
        assert_eq!(received.len(), 4);
        assert_eq!(received.iter().filter(|e| e.is_frame()).count(), 3);
        assert!(matches!(
            received.last(),
            Some(RegistryEvent::SourceRemoved { reason: RemovalReason::ReconnectExhausted, .. })
        ));
    }

    #[test]
    fn dropped_receivers_are_forgotten() {
        let bus = EventBus::new();
        drop(bus.subscribe(1));
        bus.publish(RegistryEvent::SourceOpened { source: "x".into() });
        assert_eq!(bus.subscriber_count(), 0);
    }
}
