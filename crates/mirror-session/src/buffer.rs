use std::collections::VecDeque;

use mirror_proto::{Chunk, RecordedEvent};

use crate::error::BufferError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferStats {
    pub pending: usize,
    pub next_id: u64,
    pub last_acked: Option<u64>,
}

/// Unacknowledged recorded events of the current recording run.
///
/// Ids start at 0 and increase by one per `add`. Acknowledgment is cumulative,
/// so the retained entries always form one contiguous id range and lookups are
/// an offset from the oldest entry.
#[derive(Debug, Default)]
pub struct SourceBuffer {
    entries: VecDeque<Chunk<RecordedEvent>>,
    next_id: u64,
    last_acked: Option<u64>,
    capacity: Option<usize>,
}

impl SourceBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::default()
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Buffers `event` under the next id and returns the stored chunk.
    pub fn add(&mut self, event: RecordedEvent) -> Result<Chunk<RecordedEvent>, BufferError> {
        if let Some(capacity) = self.capacity {
            if self.entries.len() >= capacity {
                return Err(BufferError::Full { capacity });
            }
        }
        let chunk = Chunk {
            id: self.next_id,
            data: event,
        };
        self.next_id += 1;
        self.entries.push_back(chunk.clone());
        Ok(chunk)
    }

    pub fn get(&self, id: u64) -> Option<&Chunk<RecordedEvent>> {
        let front = self.entries.front()?.id;
        let offset = id.checked_sub(front)?;
        self.entries.get(usize::try_from(offset).ok()?)
    }

    /// Drops every entry with an id up to and including `id`; returns how many.
    pub fn ack(&mut self, id: u64) -> usize {
        let mut removed = 0;
        while self.entries.front().is_some_and(|chunk| chunk.id <= id) {
            self.entries.pop_front();
            removed += 1;
        }
        if id < self.next_id && self.last_acked.is_none_or(|last| id > last) {
            self.last_acked = Some(id);
        }
        removed
    }

    /// Starts a new run: drops every entry and restarts ids at 0.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.next_id = 0;
        self.last_acked = None;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pending(&self) -> impl Iterator<Item = &Chunk<RecordedEvent>> {
        self.entries.iter()
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            pending: self.entries.len(),
            next_id: self.next_id,
            last_acked: self.last_acked,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ids_increase_from_zero() {
        let mut buffer = SourceBuffer::new();
        let ids: Vec<u64> = (0..4)
            .map(|n| buffer.add(json!({ "n": n })).unwrap().id)
            .collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        assert_eq!(buffer.get(2).unwrap().data, json!({ "n": 2 }));
        assert!(buffer.get(4).is_none());
    }

    #[test]
    fn reset_restarts_ids() {
        let mut buffer = SourceBuffer::new();
        buffer.add(json!(1)).unwrap();
        buffer.add(json!(2)).unwrap();
        buffer.reset();
        assert!(buffer.is_empty());
        assert!(buffer.get(0).is_none());
        assert_eq!(buffer.add(json!(3)).unwrap().id, 0);
        assert_eq!(buffer.stats().last_acked, None);
    }

    #[test]
    fn ack_is_cumulative() {
        let mut buffer = SourceBuffer::new();
        for n in 0..5 {
            buffer.add(json!(n)).unwrap();
        }
        assert_eq!(buffer.ack(2), 3);
        assert!(buffer.get(0).is_none());
        assert!(buffer.get(2).is_none());
        assert_eq!(buffer.get(3).unwrap().id, 3);
        assert_eq!(buffer.ack(1), 0, "stale ack is a no-op");
        assert_eq!(
            buffer.stats(),
            BufferStats {
                pending: 2,
                next_id: 5,
                last_acked: Some(2),
            }
        );
        let pending: Vec<u64> = buffer.pending().map(|chunk| chunk.id).collect();
        assert_eq!(pending, vec![3, 4]);
    }

    #[test]
    fn ack_of_unknown_id_is_ignored_for_stats() {
        let mut buffer = SourceBuffer::new();
        buffer.add(json!(0)).unwrap();
        assert_eq!(buffer.ack(10), 1);
        assert_eq!(buffer.stats().last_acked, None);
    }

    #[test]
    fn full_buffer_rejects_without_evicting() {
        let mut buffer = SourceBuffer::with_capacity(2);
        buffer.add(json!("a")).unwrap();
        buffer.add(json!("b")).unwrap();
        assert_eq!(
            buffer.add(json!("c")),
            Err(BufferError::Full { capacity: 2 })
        );
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.get(0).unwrap().data, json!("a"));
        buffer.ack(0);
        assert_eq!(buffer.add(json!("c")).unwrap().id, 2);
    }
}
