//! Cross-thread event queues.
//!
//! The only channel allowed to cross from control threads into the render
//! thread without a lock. Producers never block: a full queue drops the
//! event, an accepted loss under extreme load. The render thread drains each
//! queue in FIFO order once per block.

use crossbeam_queue::ArrayQueue;

/// Events dropped beyond this many pending entries per queue.
const QUEUE_CAPACITY: usize = 512;

/// A pending note edge. Velocity 0.0 is the wire encoding for note-off;
/// downstream dispatch relies on it, so producers must preserve it.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct NoteEvent {
    pub note: f32,
    pub velocity: f32,
}

/// A pending parameter change addressed by flat parameter index.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct ValueEvent {
    pub index: usize,
    pub value: f32,
}

/// The two per-instance queues: note events and parameter-value events.
///
/// Drained independently; value changes are applied before note events each
/// block because modulation routing may depend on the block's parameter
/// state.
pub struct EventQueues {
    notes: ArrayQueue<NoteEvent>,
    values: ArrayQueue<ValueEvent>,
}

impl EventQueues {
    pub fn new() -> Self {
        Self {
            notes: ArrayQueue::new(QUEUE_CAPACITY),
            values: ArrayQueue::new(QUEUE_CAPACITY),
        }
    }

    /// Push a note event. Never blocks; overflow is silently dropped.
    pub fn push_note(&self, note: f32, velocity: f32) {
        let _ = self.notes.push(NoteEvent { note, velocity });
    }

    /// Push a parameter-value event. Never blocks; overflow is dropped.
    pub fn push_value(&self, index: usize, value: f32) {
        let _ = self.values.push(ValueEvent { index, value });
    }

    pub fn pop_note(&self) -> Option<NoteEvent> {
        self.notes.pop()
    }

    pub fn pop_value(&self) -> Option<ValueEvent> {
        self.values.pop()
    }

    /// Drop all pending note events without applying them.
    pub fn discard_notes(&self) {
        while self.notes.pop().is_some() {}
    }
}

impl Default for EventQueues {
    fn default() -> Self {
        Self::new()
    }
}
