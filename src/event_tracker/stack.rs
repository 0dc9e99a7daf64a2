//! Fixed-capacity event list for one acquisition cycle

use crate::common::SoftwareEvent;

/// Maximum number of events kept per cycle
pub const EVENT_STACK_CAPACITY: usize = 16;

/// Append-only list of the events received during one read cycle
///
/// Insertion order is arrival order. Once full, further pushes are
/// dropped until the stack is cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventStack {
    events: [SoftwareEvent; EVENT_STACK_CAPACITY],
    count: usize,
}

impl Default for EventStack {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStack {
    pub const fn new() -> Self {
        Self {
            events: [SoftwareEvent {
                position: 0,
                event_type: 0,
            }; EVENT_STACK_CAPACITY],
            count: 0,
        }
    }

    /// Append an event; returns false (and stores nothing) when full
    pub fn push(&mut self, event: SoftwareEvent) -> bool {
        if self.count == EVENT_STACK_CAPACITY {
            return false;
        }
        self.events[self.count] = event;
        self.count += 1;
        true
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == EVENT_STACK_CAPACITY
    }

    pub fn as_slice(&self) -> &[SoftwareEvent] {
        &self.events[..self.count]
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SoftwareEvent> {
        self.as_slice().iter()
    }

    pub fn clear(&mut self) {
        self.count = 0;
    }
}

impl<'a> IntoIterator for &'a EventStack {
    type Item = &'a SoftwareEvent;
    type IntoIter = std::slice::Iter<'a, SoftwareEvent>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
