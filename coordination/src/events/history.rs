//! Bounded event history
//!
//! Keeps the most recent events in emission order. When the capacity is
//! reached the oldest event is dropped first.

use std::collections::{HashMap, VecDeque};

use super::types::GameEvent;

/// Default number of events retained.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// FIFO-bounded log of emitted events.
#[derive(Debug)]
pub struct EventHistory {
    events: VecDeque<GameEvent>,
    capacity: usize,
}

impl EventHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity.min(DEFAULT_HISTORY_CAPACITY)),
            capacity,
        }
    }

    /// Append an event, evicting the oldest entries beyond capacity.
    pub fn record(&mut self, event: GameEvent) {
        if self.capacity == 0 {
            return;
        }
        self.events.push_back(event);
        while self.events.len() > self.capacity {
            self.events.pop_front();
        }
    }

    /// Events in emission order, optionally filtered by type.
    ///
    /// With a `limit`, only the most recent `limit` matching events are
    /// returned (still oldest first).
    pub fn query(&self, event_type: Option<&str>, limit: Option<usize>) -> Vec<GameEvent> {
        let matching: Vec<&GameEvent> = self
            .events
            .iter()
            .filter(|e| event_type.map_or(true, |t| e.event_type == t))
            .collect();
        let skip = match limit {
            Some(limit) => matching.len().saturating_sub(limit),
            None => 0,
        };
        matching.into_iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Count of retained events per type.
    pub fn counts_by_type(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for event in &self.events {
            *counts.entry(event.event_type.clone()).or_insert(0) += 1;
        }
        counts
    }
}

impl Default for EventHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}
