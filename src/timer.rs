//! The timer heap of §4.1: a min-heap ordered by deadline, with a
//! back-pointer slot per job so that a caller who holds a [`TimerIdx`] can
//! always find (or cancel) its own job in `O(log n)`, even after other
//! insertions and removals have shuffled the heap around it.
//!
//! This mirrors the original's `hio_tmr_t` (`original_source/hio/lib/tmr.c`):
//! `sift_up`/`sift_down` relocate the back-pointer of every entry they move,
//! and `delete` swaps the removed slot with the last entry before re-sifting
//! rather than shifting the whole array down.

use std::time::{Duration, Instant};

/// Index of a scheduled job within a [`TimerHeap`]. Kept by the owner so it
/// can `update` or `delete` its own job later. `TimerIdx::INVALID` is what a
/// cancelled or already-fired job's back-pointer is set to; holding onto a
/// stale index is always safe because the heap nulls it out on removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerIdx(usize);

impl TimerIdx {
    pub const INVALID: TimerIdx = TimerIdx(usize::MAX);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl Default for TimerIdx {
    fn default() -> Self {
        Self::INVALID
    }
}

/// A scheduled job. `ctx` is opaque to the heap; the reactor hands it back
/// unchanged to whatever fires the job.
pub struct TimerJob<C> {
    deadline: Instant,
    ctx: C,
}

impl<C> TimerJob<C> {
    pub fn new(deadline: Instant, ctx: C) -> TimerJob<C> {
        TimerJob { deadline, ctx }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn ctx(&self) -> &C {
        &self.ctx
    }

    pub fn into_ctx(self) -> C {
        self.ctx
    }
}

struct Entry<C> {
    job: TimerJob<C>,
    /// Index into the owner's storage of the `TimerIdx` to keep synchronized
    /// with this entry's position. `None` for jobs nobody needs to track
    /// (fire-and-forget).
    back_ref: Option<Box<dyn Fn(TimerIdx) + 'static>>,
}

/// A min-heap of timer jobs ordered by deadline.
///
/// Capacity grows by doubling (via `Vec`'s own growth); shrinking is never
/// required, matching §4.1.
pub struct TimerHeap<C> {
    entries: Vec<Entry<C>>,
}

impl<C> Default for TimerHeap<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> TimerHeap<C> {
    pub fn new() -> TimerHeap<C> {
        TimerHeap {
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert a job, returning its index. `on_reindex` is called every time
    /// the heap relocates this entry (including immediately, with its
    /// initial index) so the owner's back-pointer slot stays accurate.
    pub fn insert_with<F>(&mut self, job: TimerJob<C>, on_reindex: F) -> TimerIdx
    where
        F: Fn(TimerIdx) + 'static,
    {
        let idx = self.entries.len();
        self.entries.push(Entry {
            job,
            back_ref: Some(Box::new(on_reindex)),
        });
        self.notify(idx);
        TimerIdx(self.sift_up(idx))
    }

    /// Insert a job without a back-pointer callback (the caller never needs
    /// to find it again before it fires).
    pub fn insert(&mut self, job: TimerJob<C>) -> TimerIdx {
        let idx = self.entries.len();
        self.entries.push(Entry {
            job,
            back_ref: None,
        });
        TimerIdx(self.sift_up(idx))
    }

    /// Replace the job at `idx` and re-establish heap order, returning the
    /// job's (possibly new) index. A handler may call this from within its
    /// own firing to reschedule itself without risking aliasing, since
    /// `fire_due` always removes a job from the heap before invoking its
    /// handler.
    pub fn update(&mut self, idx: TimerIdx, job: TimerJob<C>) -> TimerIdx {
        let i = idx.0;
        let younger = job.deadline < self.entries[i].job.deadline;
        self.entries[i].job = job;
        let new_idx = if younger {
            self.sift_up(i)
        } else {
            self.sift_down(i)
        };
        self.notify(new_idx);
        TimerIdx(new_idx)
    }

    /// Remove and return the job at `idx`, nulling out its back-pointer.
    pub fn delete(&mut self, idx: TimerIdx) -> TimerJob<C> {
        let index = idx.0;
        if let Some(back_ref) = &self.entries[index].back_ref {
            back_ref(TimerIdx::INVALID);
        }

        let last = self.entries.len() - 1;
        if index != last {
            self.entries.swap(index, last);
        }
        let removed = self.entries.pop().expect("delete on empty heap");

        if index != last && !self.entries.is_empty() {
            let moved_is_younger = self.entries[index].job.deadline < removed.job.deadline;
            let new_idx = if moved_is_younger {
                self.sift_up(index)
            } else {
                self.sift_down(index)
            };
            self.notify(new_idx);
        }

        removed.job
    }

    /// Peek the next deadline, if any job is scheduled.
    pub fn peek_deadline(&self) -> Option<Instant> {
        self.entries.first().map(|e| e.job.deadline)
    }

    /// How long until the next job is due, clamped to zero if it is already
    /// overdue, or `None` if the heap is empty (the loop should then block
    /// indefinitely, per §4.8 step 1).
    pub fn next_timeout(&self, now: Instant) -> Option<Duration> {
        self.peek_deadline()
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Pop and return every job whose deadline is `<= now`, in
    /// extraction order (not a stable tie-break across equal deadlines,
    /// per the open design note in §5).
    pub fn fire_due(&mut self, now: Instant) -> Vec<TimerJob<C>> {
        let mut due = Vec::new();
        while let Some(deadline) = self.peek_deadline() {
            if deadline > now {
                break;
            }
            due.push(self.delete(TimerIdx(0)));
        }
        due
    }

    fn notify(&self, idx: usize) {
        if let Some(back_ref) = &self.entries[idx].back_ref {
            back_ref(TimerIdx(idx));
        }
    }

    fn sift_up(&mut self, mut index: usize) -> usize {
        while index > 0 {
            let parent = (index - 1) / 2;
            if self.entries[index].job.deadline < self.entries[parent].job.deadline {
                self.entries.swap(index, parent);
                self.notify(index);
                index = parent;
            } else {
                break;
            }
        }
        self.notify(index);
        index
    }

    fn sift_down(&mut self, mut index: usize) -> usize {
        let len = self.entries.len();
        loop {
            let left = index * 2 + 1;
            let right = index * 2 + 2;
            let mut youngest = index;

            if left < len && self.entries[left].job.deadline < self.entries[youngest].job.deadline {
                youngest = left;
            }
            if right < len && self.entries[right].job.deadline < self.entries[youngest].job.deadline
            {
                youngest = right;
            }
            if youngest == index {
                break;
            }
            self.entries.swap(index, youngest);
            self.notify(index);
            index = youngest;
        }
        self.notify(index);
        index
    }

    #[cfg(test)]
    fn assert_heap_property(&self) {
        for i in 0..self.entries.len() {
            let left = i * 2 + 1;
            let right = i * 2 + 2;
            if left < self.entries.len() {
                assert!(self.entries[i].job.deadline <= self.entries[left].job.deadline);
            }
            if right < self.entries.len() {
                assert!(self.entries[i].job.deadline <= self.entries[right].job.deadline);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    fn at(ms: u64) -> Instant {
        Instant::now() + Duration::from_millis(ms)
    }

    #[test]
    fn insert_and_fire_in_deadline_order() {
        let mut heap: TimerHeap<u32> = TimerHeap::new();
        let base = Instant::now();
        heap.insert(TimerJob::new(base + Duration::from_millis(30), 3));
        heap.insert(TimerJob::new(base + Duration::from_millis(10), 1));
        heap.insert(TimerJob::new(base + Duration::from_millis(20), 2));
        heap.assert_heap_property();

        let due = heap.fire_due(base + Duration::from_millis(25));
        let mut ctxs: Vec<u32> = due.iter().map(|j| *j.ctx()).collect();
        ctxs.sort();
        assert_eq!(ctxs, vec![1, 2]);
        assert_eq!(heap.len(), 1);
    }

    #[test]
    fn back_pointer_tracks_relocation() {
        let mut heap: TimerHeap<u32> = TimerHeap::new();
        let slot = Rc::new(Cell::new(TimerIdx::INVALID));
        let slot2 = slot.clone();
        let idx = heap.insert_with(TimerJob::new(at(50), 9), move |i| slot2.set(i));
        assert_eq!(slot.get(), idx);

        // Insert several jobs that sift-up above it to force relocation.
        for ms in [1, 2, 3, 4, 5] {
            heap.insert(TimerJob::new(at(ms), 0));
        }
        heap.assert_heap_property();
        // The back-pointer must have been kept in sync with every swap.
        assert_ne!(slot.get(), TimerIdx::INVALID);
        let tracked = slot.get();
        let job = heap.delete(tracked);
        assert_eq!(*job.ctx(), 9);
    }

    #[test]
    fn delete_nulls_back_pointer() {
        let mut heap: TimerHeap<u32> = TimerHeap::new();
        let slot = Rc::new(Cell::new(TimerIdx::INVALID));
        let slot2 = slot.clone();
        let idx = heap.insert_with(TimerJob::new(at(10), 1), move |i| slot2.set(i));
        heap.delete(idx);
        assert_eq!(slot.get(), TimerIdx::INVALID);
        assert!(heap.is_empty());
    }

    #[test]
    fn update_reschedules_without_aliasing() {
        let mut heap: TimerHeap<u32> = TimerHeap::new();
        let a = heap.insert(TimerJob::new(at(10), 1));
        let b = heap.insert(TimerJob::new(at(20), 2));
        let a = heap.update(a, TimerJob::new(at(30), 1));
        heap.assert_heap_property();
        let job = heap.delete(b);
        assert_eq!(*job.ctx(), 2);
        let job = heap.delete(a);
        assert_eq!(*job.ctx(), 1);
    }

    #[test]
    fn next_timeout_clamps_to_zero_when_overdue() {
        let mut heap: TimerHeap<u32> = TimerHeap::new();
        let past = Instant::now() - Duration::from_millis(5);
        heap.insert(TimerJob::new(past, 1));
        let now = Instant::now();
        assert_eq!(heap.next_timeout(now), Some(Duration::ZERO));
    }
}
