/// Delivery queue for outbound events.
///
/// Every event lives in exactly one of two sets: `unsent` (not yet handed
/// to the link) or `pending` (handed to the link, awaiting a response).
/// unsent → pending on a successful send, pending → gone on acknowledgment,
/// pending → head of unsent on disconnect. Nothing leaves the queue except
/// through `acknowledge`.
///
/// Pure logic, no I/O. The runtime owns the queue and passes a transmit
/// closure to `flush`.
use std::collections::{HashMap, HashSet, VecDeque};

use serde_json::Value;
use tether_transport::Envelope;

use crate::types::{EventId, Topic};

/// Stale ids tolerated in an order sequence before it is compacted.
const COMPACT_SLACK: usize = 64;

/// An event waiting for delivery or acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedEvent {
    pub event_id: EventId,
    pub topic: Topic,
    /// The serialized envelope, exactly as it goes on the wire.
    pub text: String,
}

/// Queue sizes, for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub unsent: usize,
    pub pending: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Unsent,
    Pending,
}

#[derive(Debug)]
struct Entry {
    event: QueuedEvent,
    slot: Slot,
}

/// Two ordered ownership sets over one id-keyed map.
///
/// Acknowledgment is O(1): it only touches the map. The order sequences
/// may keep ids of acknowledged events until they are skipped or compacted.
#[derive(Debug, Default)]
pub struct DeliveryQueue {
    entries: HashMap<EventId, Entry>,
    unsent: VecDeque<EventId>,
    pending: VecDeque<EventId>,
    unsent_count: usize,
    pending_count: usize,
}

impl DeliveryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a message under a fresh event id. Always succeeds.
    pub fn enqueue(&mut self, topic: Topic, message: Value) -> EventId {
        self.enqueue_envelope(Envelope::new(topic, message))
    }

    /// Queue an envelope that already carries its event id.
    ///
    /// Re-enqueueing an id that is still queued is a no-op.
    pub fn enqueue_envelope(&mut self, envelope: Envelope) -> EventId {
        let event_id = envelope.event_id.clone();
        if self.entries.contains_key(&event_id) {
            return event_id;
        }

        let event = QueuedEvent {
            event_id: event_id.clone(),
            topic: envelope.topic,
            text: envelope.to_text(),
        };
        self.entries.insert(
            event_id.clone(),
            Entry {
                event,
                slot: Slot::Unsent,
            },
        );
        self.unsent.push_back(event_id.clone());
        self.unsent_count += 1;
        event_id
    }

    /// Drop an event from whichever set holds it.
    ///
    /// Returns `false` for unknown or already acknowledged ids; that is not
    /// an error (duplicate responses happen).
    pub fn acknowledge(&mut self, event_id: &str) -> bool {
        let Some(entry) = self.entries.remove(event_id) else {
            return false;
        };
        match entry.slot {
            Slot::Unsent => self.unsent_count -= 1,
            Slot::Pending => self.pending_count -= 1,
        }
        self.compact_if_needed();
        true
    }

    /// Hand unsent events to `transmit` in FIFO order.
    ///
    /// Each event `transmit` accepts moves to pending. The first refusal
    /// stops the drain; that event and everything behind it stay unsent.
    /// Returns the number of events sent.
    pub fn flush<F>(&mut self, mut transmit: F) -> usize
    where
        F: FnMut(&QueuedEvent) -> bool,
    {
        let mut sent = 0;
        while let Some(event_id) = self.unsent.front() {
            let Some(entry) = self.entries.get_mut(event_id) else {
                // Acknowledged while waiting.
                self.unsent.pop_front();
                continue;
            };
            if entry.slot != Slot::Unsent {
                self.unsent.pop_front();
                continue;
            }
            if !transmit(&entry.event) {
                break;
            }

            entry.slot = Slot::Pending;
            if let Some(event_id) = self.unsent.pop_front() {
                self.pending.push_back(event_id);
            }
            self.unsent_count -= 1;
            self.pending_count += 1;
            sent += 1;
        }
        sent
    }

    /// Move every pending event back to the head of unsent.
    ///
    /// Called on disconnect. Relative order is kept and redelivered events
    /// go out before anything that was already waiting. Returns how many
    /// events moved.
    pub fn requeue_pending(&mut self) -> usize {
        let mut order: VecDeque<EventId> =
            VecDeque::with_capacity(self.pending_count + self.unsent_count);

        for event_id in self.pending.drain(..) {
            if let Some(entry) = self.entries.get_mut(&event_id) {
                if entry.slot == Slot::Pending {
                    entry.slot = Slot::Unsent;
                    order.push_back(event_id);
                }
            }
        }
        let moved = order.len();

        let mut seen: HashSet<EventId> = order.iter().cloned().collect();
        for event_id in self.unsent.drain(..) {
            if matches!(self.entries.get(&event_id), Some(e) if e.slot == Slot::Unsent)
                && seen.insert(event_id.clone())
            {
                order.push_back(event_id);
            }
        }

        self.unsent = order;
        self.pending_count = 0;
        self.unsent_count = self.unsent.len();
        moved
    }

    /// Whether the event is still queued (unsent or pending).
    pub fn contains(&self, event_id: &str) -> bool {
        self.entries.contains_key(event_id)
    }

    pub fn is_unsent(&self, event_id: &str) -> bool {
        matches!(self.entries.get(event_id), Some(e) if e.slot == Slot::Unsent)
    }

    pub fn is_pending(&self, event_id: &str) -> bool {
        matches!(self.entries.get(event_id), Some(e) if e.slot == Slot::Pending)
    }

    /// Unsent event ids in flush order.
    pub fn unsent_ids(&self) -> Vec<EventId> {
        self.live_ids(&self.unsent, Slot::Unsent)
    }

    /// Pending event ids in send order.
    pub fn pending_ids(&self) -> Vec<EventId> {
        self.live_ids(&self.pending, Slot::Pending)
    }

    pub fn unsent_len(&self) -> usize {
        self.unsent_count
    }

    pub fn pending_len(&self) -> usize {
        self.pending_count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            unsent: self.unsent_count,
            pending: self.pending_count,
        }
    }

    // ── Internal ───────────────────────────────────────────────────────

    fn live_ids(&self, order: &VecDeque<EventId>, slot: Slot) -> Vec<EventId> {
        order
            .iter()
            .filter(|id| matches!(self.entries.get(*id), Some(e) if e.slot == slot))
            .cloned()
            .collect()
    }

    /// Drop acknowledged ids from the order sequences once they pile up.
    fn compact_if_needed(&mut self) {
        let entries = &self.entries;
        if self.pending.len() > 2 * self.pending_count + COMPACT_SLACK {
            self.pending
                .retain(|id| matches!(entries.get(id), Some(e) if e.slot == Slot::Pending));
        }
        if self.unsent.len() > 2 * self.unsent_count + COMPACT_SLACK {
            self.unsent
                .retain(|id| matches!(entries.get(id), Some(e) if e.slot == Slot::Unsent));
        }
    }
}
