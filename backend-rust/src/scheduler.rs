//! One time-ordered queue of delayed tasks for every component.
//!
//! Dispatch pacing, calibration resumptions, playback emissions, pursuit
//! ticks, pose samples and reconnect attempts all live here, so cancelling an
//! activity is a single `cancel_where` call.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    DispatchNext,
    CalibrationWake,
    PlaybackEmit { index: usize },
    PursuitTick,
    PoseSample,
    Reconnect { attempt: u32 },
}

impl Task {
    pub fn is_playback(&self) -> bool {
        matches!(self, Task::PlaybackEmit { .. } | Task::PursuitTick)
    }
}

#[derive(Debug)]
struct Scheduled {
    at: Instant,
    id: TaskId,
    task: Task,
}

// Min-heap on (at, id): earliest first, FIFO among equal deadlines.
impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.id.0.cmp(&self.id.0))
    }
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Scheduled {}

#[derive(Debug, Default)]
pub struct Scheduler {
    heap: BinaryHeap<Scheduled>,
    next_id: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule_at(&mut self, at: Instant, task: Task) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        self.heap.push(Scheduled { at, id, task });
        id
    }

    /// Schedule `task` unless an equal task is already pending.
    pub fn schedule_once(&mut self, at: Instant, task: Task) -> Option<TaskId> {
        if self.heap.iter().any(|s| s.task == task) {
            return None;
        }
        Some(self.schedule_at(at, task))
    }

    pub fn cancel(&mut self, id: TaskId) -> bool {
        let before = self.heap.len();
        self.heap.retain(|s| s.id != id);
        self.heap.len() != before
    }

    /// Drop every pending task matching `pred`; returns how many went.
    pub fn cancel_where(&mut self, pred: impl Fn(&Task) -> bool) -> usize {
        let before = self.heap.len();
        self.heap.retain(|s| !pred(&s.task));
        before - self.heap.len()
    }

    /// Earliest task due at or before `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<(TaskId, Task)> {
        if self.heap.peek().is_some_and(|s| s.at <= now) {
            self.heap.pop().map(|s| (s.id, s.task))
        } else {
            None
        }
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.heap.peek().map(|s| s.at)
    }

    pub fn contains(&self, pred: impl Fn(&Task) -> bool) -> bool {
        self.heap.iter().any(|s| pred(&s.task))
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
