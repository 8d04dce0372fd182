//! Table lifecycle event bus.
//!
//! The world publishes a [`TableEvent`] whenever a table is created or
//! deleted; caches subscribe at construction and drain their subscription
//! on every sync. Events fan out to all live subscribers over unbounded
//! channels, stamped with a monotonically increasing `event_id`.
//!
//! Delivery is at-least-once from the bus's point of view: an event may
//! reach the same subscriber through more than one path (e.g. after a
//! resubscription). Subscribers are expected to de-duplicate on `event_id`;
//! the query cache keeps its `last_event_id` for exactly this.

use crossbeam::channel::{Receiver, Sender, unbounded};

use crate::storage::table;

/// The kind of a table lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableEventKind {
    /// A table was created.
    Create,
    /// A table is being deleted.
    Delete,
}

/// A table lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableEvent {
    /// What happened.
    pub kind: TableEventKind,
    /// The affected table.
    pub table: table::Id,
    /// Monotonic delivery stamp, for subscriber-side de-duplication.
    pub event_id: u64,
}

/// The event bus: fan-out of table events to all subscribers.
#[derive(Debug, Default)]
pub struct Bus {
    /// Live subscriber channels; pruned when a receiver disconnects.
    subscribers: Vec<Sender<TableEvent>>,

    /// The last event id handed out.
    next_event_id: u64,
}

impl Bus {
    /// Create a bus with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to table events. Events published after this call are
    /// delivered to the returned receiver.
    pub fn subscribe(&mut self) -> Receiver<TableEvent> {
        let (sender, receiver) = unbounded();
        self.subscribers.push(sender);
        receiver
    }

    /// Publish an event to every live subscriber, returning its event id.
    pub fn publish(&mut self, kind: TableEventKind, table: table::Id) -> u64 {
        self.next_event_id += 1;
        let event = TableEvent {
            kind,
            table,
            event_id: self.next_event_id,
        };
        // Drop subscribers whose receiver hung up.
        self.subscribers.retain(|sender| sender.send(event).is_ok());
        event.event_id
    }

    /// The number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_fans_out() {
        // Given
        let mut bus = Bus::new();
        let rx1 = bus.subscribe();
        let rx2 = bus.subscribe();

        // When
        bus.publish(TableEventKind::Create, table::Id::new(3));

        // Then - both subscribers see the same event
        let e1 = rx1.try_recv().unwrap();
        let e2 = rx2.try_recv().unwrap();
        assert_eq!(e1, e2);
        assert_eq!(e1.kind, TableEventKind::Create);
        assert_eq!(e1.table, table::Id::new(3));
    }

    #[test]
    fn event_ids_increase() {
        let mut bus = Bus::new();
        let rx = bus.subscribe();

        bus.publish(TableEventKind::Create, table::Id::new(0));
        bus.publish(TableEventKind::Delete, table::Id::new(0));

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert!(second.event_id > first.event_id);
    }

    #[test]
    fn disconnected_subscribers_are_pruned() {
        // Given
        let mut bus = Bus::new();
        let rx = bus.subscribe();
        drop(rx);

        // When
        bus.publish(TableEventKind::Create, table::Id::new(0));

        // Then
        assert_eq!(bus.subscriber_count(), 0);
    }
}
