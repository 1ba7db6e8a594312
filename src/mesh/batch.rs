//! Counter-update batching.
//!
//! Updates accumulate until the buffer hits the size limit or the oldest
//! entry has waited past the time limit. On emission, entries from the same
//! origin node merge into one (deltas summed, max logical timestamp), so a
//! burst of local increments costs one frame.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::counter::CounterUpdate;

#[derive(Debug, Default)]
pub struct BatchCoalescer {
    buffer: Vec<CounterUpdate>,
    first_enqueue: Option<Instant>,
}

impl BatchCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, update: CounterUpdate) {
        if self.buffer.is_empty() {
            self.first_enqueue = Some(Instant::now());
        }
        self.buffer.push(update);
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Take the merged batch if either emission condition holds.
    pub fn drain_ready(
        &mut self,
        size_limit: usize,
        time_limit: Duration,
    ) -> Option<Vec<CounterUpdate>> {
        if self.buffer.is_empty() {
            return None;
        }
        let elapsed = self
            .first_enqueue
            .map(|t| t.elapsed())
            .unwrap_or(Duration::ZERO);
        if self.buffer.len() >= size_limit.max(1) || elapsed >= time_limit {
            return Some(self.drain_all());
        }
        None
    }

    /// Take everything regardless of limits (shutdown flush).
    pub fn drain_all(&mut self) -> Vec<CounterUpdate> {
        self.first_enqueue = None;
        merge_per_origin(std::mem::take(&mut self.buffer))
    }
}

/// Merge updates from the same origin: deltas sum, logical timestamp takes
/// the max. Output order follows first appearance of each origin.
pub fn merge_per_origin(updates: Vec<CounterUpdate>) -> Vec<CounterUpdate> {
    let mut order: Vec<String> = Vec::new();
    let mut merged: HashMap<String, CounterUpdate> = HashMap::new();
    for update in updates {
        match merged.get_mut(&update.node_id) {
            Some(existing) => {
                existing.delta += update.delta;
                existing.logical_ts = existing.logical_ts.max(update.logical_ts);
            }
            None => {
                order.push(update.node_id.clone());
                merged.insert(update.node_id.clone(), update);
            }
        }
    }
    order
        .into_iter()
        .map(|node| merged.remove(&node).expect("merged entry exists"))
        .collect()
}
