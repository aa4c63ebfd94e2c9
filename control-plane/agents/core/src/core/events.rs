//! Registry events and their fan-out to in-process consumers.
//!
//! Every mutation observed by a node sync (or performed through a node
//! wrapper) is published as an `Event`. Consumers pull from their own
//! `EventQueue`; a slow consumer never blocks the producer because `mod`
//! events are coalescable by key once the queue grows past its cap.

use mbus_api::v0::{Nexus, Node, NodeId, Pool, Replica, VolumeId, VolumeState};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};
use tokio::sync::Notify;

/// What happened to the object
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum EventAction {
    /// object appeared
    New,
    /// object changed
    Mod,
    /// object disappeared
    Del,
    /// a node finished replaying its initial state (nodes only)
    Sync,
}

/// The object an event refers to
#[derive(Debug, Clone)]
pub(crate) enum EventObject {
    Node(Node),
    Pool(Pool),
    Replica(Replica),
    Nexus(Nexus),
    Volume(VolumeSummary),
}

/// Externally visible volume information carried by volume events
#[derive(Debug, Clone)]
pub(crate) struct VolumeSummary {
    pub(crate) uuid: VolumeId,
    pub(crate) size: u64,
    pub(crate) state: VolumeState,
}

/// A single registry or volume event
#[derive(Debug, Clone)]
pub(crate) struct Event {
    pub(crate) action: EventAction,
    pub(crate) object: EventObject,
}

impl Event {
    pub(crate) fn new(action: EventAction, object: EventObject) -> Self {
        Self { action, object }
    }

    /// Coalescing key: two `mod` events with the same key supersede each other
    fn key(&self) -> String {
        match &self.object {
            EventObject::Node(node) => format!("node/{}", node.id),
            EventObject::Pool(pool) => format!("pool/{}", pool.id),
            EventObject::Replica(replica) => {
                format!("replica/{}/{}", replica.node, replica.uuid)
            }
            EventObject::Nexus(nexus) => format!("nexus/{}", nexus.uuid),
            EventObject::Volume(volume) => format!("volume/{}", volume.uuid),
        }
    }
}

/// Queue cap past which `mod` events start being coalesced by key
const COALESCE_THRESHOLD: usize = 1024;

/// Per-consumer event queue; the producer side never blocks
pub(crate) struct EventQueue {
    queue: Mutex<VecDeque<Event>>,
    notify: Notify,
    closed: AtomicBool,
}

impl EventQueue {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn push(&self, event: Event) {
        {
            let mut queue = self.queue.lock().expect("event queue poisoned");
            if queue.len() >= COALESCE_THRESHOLD && event.action == EventAction::Mod {
                let key = event.key();
                if let Some(stale) = queue
                    .iter_mut()
                    .find(|queued| queued.action == EventAction::Mod && queued.key() == key)
                {
                    *stale = event;
                    self.notify.notify_one();
                    return;
                }
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
    }

    /// Push an event at the front, used for replaying initial state
    pub(crate) fn push_front(&self, event: Event) {
        self.queue
            .lock()
            .expect("event queue poisoned")
            .push_front(event);
        self.notify.notify_one();
    }

    /// Wait for the next event
    pub(crate) async fn next(&self) -> Event {
        loop {
            if let Some(event) = self.queue.lock().expect("event queue poisoned").pop_front() {
                return event;
            }
            self.notify.notified().await;
        }
    }

    /// Try to pop the next event without waiting
    pub(crate) fn try_next(&self) -> Option<Event> {
        self.queue.lock().expect("event queue poisoned").pop_front()
    }

    /// Mark the queue as no longer consumed so the producer drops it
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

/// Fan-out of events to all live consumer queues
#[derive(Clone, Default)]
pub(crate) struct EventFanout {
    subscribers: Arc<Mutex<Vec<Arc<EventQueue>>>>,
}

impl EventFanout {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// New consumer queue which receives all events from now on
    pub(crate) fn subscribe(&self) -> Arc<EventQueue> {
        let queue = Arc::new(EventQueue::new());
        self.subscribers
            .lock()
            .expect("subscriber list poisoned")
            .push(queue.clone());
        queue
    }

    /// Publish an event to all consumers
    pub(crate) fn publish(&self, event: Event) {
        let mut subscribers = self.subscribers.lock().expect("subscriber list poisoned");
        subscribers.retain(|queue| !queue.closed.load(Ordering::Relaxed));
        for queue in subscribers.iter() {
            queue.push(event.clone());
        }
    }
}

impl std::fmt::Debug for EventFanout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventFanout").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mbus_api::v0::Pool;

    fn pool_mod(id: &str, used: u64) -> Event {
        Event::new(
            EventAction::Mod,
            EventObject::Pool(Pool {
                id: id.into(),
                used,
                ..Default::default()
            }),
        )
    }

    #[tokio::test]
    async fn events_are_delivered_in_order() {
        let fanout = EventFanout::new();
        let queue = fanout.subscribe();
        fanout.publish(pool_mod("a", 1));
        fanout.publish(pool_mod("b", 1));
        match queue.next().await.object {
            EventObject::Pool(pool) => assert_eq!(pool.id.as_str(), "a"),
            _ => panic!("expected a pool event"),
        }
        match queue.next().await.object {
            EventObject::Pool(pool) => assert_eq!(pool.id.as_str(), "b"),
            _ => panic!("expected a pool event"),
        }
    }

    #[tokio::test]
    async fn saturated_queue_coalesces_mod_events_by_key() {
        let fanout = EventFanout::new();
        let queue = fanout.subscribe();
        for i in 0..COALESCE_THRESHOLD {
            fanout.publish(pool_mod(&format!("pool-{}", i), 0));
        }
        // these two hit the cap and refer to the same key
        fanout.publish(pool_mod("pool-0", 0));
        fanout.publish(pool_mod("pool-0", 42));

        let mut seen = 0;
        let mut last_pool_0_used = None;
        while let Some(event) = queue.try_next() {
            seen += 1;
            if let EventObject::Pool(pool) = event.object {
                if pool.id.as_str() == "pool-0" {
                    last_pool_0_used = Some(pool.used);
                }
            }
        }
        // both extra mods were folded into the queued pool-0 entry
        assert_eq!(seen, COALESCE_THRESHOLD);
        assert_eq!(last_pool_0_used, Some(42));
    }

    #[tokio::test]
    async fn closed_queues_are_dropped_from_the_fanout() {
        let fanout = EventFanout::new();
        let queue = fanout.subscribe();
        queue.close();
        fanout.publish(pool_mod("a", 1));
        assert!(queue.try_next().is_none());
    }
}
