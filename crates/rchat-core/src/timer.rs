//! Logical-clock timer service.
//!
//! [`TimerQueue`] keeps scheduled timers in a min-heap ordered by deadline.
//! Cancellation only forgets the handle; the heap entry stays behind and is
//! discarded when it reaches the top, so a cancelled timer can never fire.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use rchat_abstract::{TimerHandle, TimerService, TimerToken};
use tracing::debug;

#[derive(Debug)]
struct Pending {
    deadline: u64,
    handle: TimerHandle,
    token: TimerToken,
}

// Custom Ord for Min-Heap (earliest deadline pops first, ties by schedule order)
impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.handle == other.handle
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.handle.cmp(&self.handle))
    }
}

#[derive(Debug, Default)]
pub struct TimerQueue {
    now: u64,
    next_handle: u64,
    heap: BinaryHeap<Pending>,
    armed: HashMap<TimerHandle, TimerToken>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    /// Move the clock forward without firing anything.
    pub fn advance_to(&mut self, time: u64) {
        self.now = self.now.max(time);
    }

    pub fn is_armed(&self, handle: TimerHandle) -> bool {
        self.armed.contains_key(&handle)
    }

    pub fn armed_count(&self) -> usize {
        self.armed.len()
    }

    /// Deadline of the earliest live timer.
    pub fn next_deadline(&mut self) -> Option<u64> {
        self.discard_cancelled();
        self.heap.peek().map(|p| p.deadline)
    }

    /// Pop the earliest live timer whose deadline is at or before `until`,
    /// advancing the clock to its deadline.
    pub fn pop_due(&mut self, until: u64) -> Option<(TimerHandle, TimerToken)> {
        self.discard_cancelled();
        if self.heap.peek()?.deadline > until {
            return None;
        }
        let pending = self.heap.pop()?;
        self.armed.remove(&pending.handle);
        self.now = self.now.max(pending.deadline);
        Some((pending.handle, pending.token))
    }

    /// Forget every timer. Returns how many were still armed.
    pub fn cancel_all(&mut self) -> usize {
        let count = self.armed.len();
        self.armed.clear();
        self.heap.clear();
        count
    }

    fn discard_cancelled(&mut self) {
        while let Some(top) = self.heap.peek() {
            if self.armed.contains_key(&top.handle) {
                break;
            }
            debug!("Discarding cancelled timer {:?}", top.handle);
            self.heap.pop();
        }
    }
}

impl TimerService for TimerQueue {
    fn schedule(&mut self, delay_ms: u64, token: TimerToken) -> TimerHandle {
        let handle = TimerHandle(self.next_handle);
        self.next_handle += 1;
        self.armed.insert(handle, token);
        self.heap.push(Pending {
            deadline: self.now + delay_ms,
            handle,
            token,
        });
        handle
    }

    fn cancel(&mut self, handle: TimerHandle) {
        self.armed.remove(&handle);
    }
}
