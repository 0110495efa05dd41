//! Clock-sweep victim selection.
//!
//! The hand keeps its position between sweeps so that the cost of clearing
//! reference bits is spread over many evictions.

use crate::buffer::frame::Frame;
use std::sync::atomic::{AtomicUsize, Ordering};

pub(crate) struct ClockHand {
    hand: AtomicUsize,
}

impl ClockHand {
    pub(crate) fn new() -> Self {
        Self {
            hand: AtomicUsize::new(0),
        }
    }

    /// Pick an unpinned frame, giving referenced frames a second chance.
    ///
    /// Gives up after two full turns; every frame was pinned.
    pub(crate) fn find_victim(&self, frames: &[Frame]) -> Option<usize> {
        let capacity = frames.len();
        for _ in 0..2 * capacity {
            let idx = self.hand.fetch_add(1, Ordering::AcqRel) % capacity;
            let frame = &frames[idx];
            if frame.is_pinned() {
                continue;
            }
            if frame.take_reference() {
                continue;
            }
            return Some(idx);
        }
        None
    }

    pub(crate) fn position(&self, capacity: usize) -> usize {
        self.hand.load(Ordering::Acquire) % capacity
    }
}
