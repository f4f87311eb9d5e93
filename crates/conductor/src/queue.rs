//! Due-queue ordered by (seconds, kind, id).

use crate::event::{Event, EventId, EventKind};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy)]
struct EventKey {
    seconds: f64,
    kind: EventKind,
    id: EventId,
}

impl Ord for EventKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.seconds
            .total_cmp(&other.seconds)
            .then_with(|| self.kind.cmp(&other.kind))
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for EventKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for EventKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for EventKey {}

impl EventKey {
    fn of(event: &Event) -> Self {
        Self {
            seconds: event.seconds,
            kind: event.kind(),
            id: event.id,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct EventQueue {
    events: BTreeMap<EventKey, Event>,
    index: HashMap<EventId, EventKey>,
}

impl EventQueue {
    pub fn push(&mut self, event: Event) {
        self.remove(event.id);
        let key = EventKey::of(&event);
        self.index.insert(event.id, key);
        self.events.insert(key, event);
    }

    pub fn remove(&mut self, id: EventId) -> Option<Event> {
        let key = self.index.remove(&id)?;
        self.events.remove(&key)
    }

    #[cfg(test)]
    pub fn contains(&self, id: EventId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn peek(&self) -> Option<&Event> {
        self.events.values().next()
    }

    /// Earliest event whose due time is not after `now`.
    pub fn pop_due(&mut self, now: f64) -> Option<Event> {
        let key = *self.events.keys().next()?;
        if key.seconds > now {
            return None;
        }
        self.index.remove(&key.id);
        self.events.remove(&key)
    }

    /// Re-resolve every queued event and re-key it by its new due time.
    pub fn retime(&mut self, mut resolve: impl FnMut(&mut Event)) {
        let keys: Vec<EventKey> = self.events.keys().copied().collect();
        for key in keys {
            if let Some(mut event) = self.events.remove(&key) {
                resolve(&mut event);
                let key = EventKey::of(&event);
                self.index.insert(event.id, key);
                self.events.insert(key, event);
            }
        }
    }

    pub fn drain(&mut self) -> Vec<Event> {
        self.index.clear();
        std::mem::take(&mut self.events).into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Action, Anchor};

    fn change(id: u64, seconds: f64) -> Event {
        Event {
            id: EventId(id),
            action: Action::Change {
                beats_per_minute: Some(90.0),
                time_signature: None,
            },
            seconds,
            offset: seconds * 2.0,
            anchor: Anchor::Offset,
        }
    }

    fn callback(id: u64, seconds: f64) -> Event {
        Event {
            id: EventId(id),
            action: Action::Callback(crate::Procedure::sync(|_| Ok(None))),
            seconds,
            offset: seconds * 2.0,
            anchor: Anchor::Offset,
        }
    }

    #[test]
    fn ties_put_changes_first_then_submission_order() {
        let mut queue = EventQueue::default();
        queue.push(callback(3, 1.0));
        queue.push(callback(1, 1.0));
        queue.push(change(4, 1.0));
        queue.push(callback(2, 0.5));

        let order: Vec<u64> = std::iter::from_fn(|| queue.pop_due(1.0))
            .map(|event| event.id.0)
            .collect();
        assert_eq!(order, vec![2, 4, 1, 3]);
    }

    #[test]
    fn pop_due_leaves_future_events() {
        let mut queue = EventQueue::default();
        queue.push(callback(1, 2.0));
        assert!(queue.pop_due(1.999).is_none());
        assert_eq!(queue.len(), 1);
        assert!(queue.pop_due(2.0).is_some());
        assert!(queue.is_empty());
    }

    #[test]
    fn remove_and_retime_keep_the_index_consistent() {
        let mut queue = EventQueue::default();
        queue.push(callback(1, 1.0));
        queue.push(callback(2, 2.0));

        queue.retime(|event| event.seconds = 5.0 - event.seconds);
        assert_eq!(queue.peek().map(|e| e.id), Some(EventId(2)));

        assert!(queue.remove(EventId(2)).is_some());
        assert!(!queue.contains(EventId(2)));
        assert!(queue.remove(EventId(2)).is_none());
        assert_eq!(queue.peek().map(|e| e.id), Some(EventId(1)));
    }
}
