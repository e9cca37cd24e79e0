// This file is part of Detection Supervisor, a CCTV parking-violation detector.
// Copyright (C) 2026 The Detection Supervisor Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Task Queue (C3, §4.3). A bounded priority FIFO coupling per-stream
//! producers to the worker pool, with eviction-based backpressure so a flood
//! of low-priority tasks can never starve an urgent one.

use std::collections::BTreeMap;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use jiff::Timestamp;

use crate::model::{AnalysisTask, Priority};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PushResult {
    Accepted,
    DroppedLow,
    Blocked,
}

#[derive(Debug)]
pub enum PopResult {
    Task(AnalysisTask),
    Timeout,
    Closed,
}

/// Snapshot of queue occupancy by priority, for the health pulse (§4.6).
#[derive(Copy, Clone, Debug, Default)]
pub struct SizeByPriority {
    pub urgent: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
}

impl SizeByPriority {
    pub fn total(&self) -> usize {
        self.urgent + self.high + self.normal + self.low
    }
}

/// Ordering key: `(-priority, created_at)`. A `BTreeMap` keyed on this tuple
/// gives O(log Q) insert, O(log Q) pop-min, and O(log Q) eviction of the
/// current minimum — the only contended lock in the system (§5), held only
/// for these operations, never across a blocking wait.
type OrderKey = (std::cmp::Reverse<Priority>, Timestamp, u64);

struct Inner {
    tasks: BTreeMap<OrderKey, AnalysisTask>,
    capacity: usize,
    closed: bool,
    dropped_low: u64,
    /// Tie-breaker for tasks with identical `(priority, created_at)`, so the
    /// map key stays unique without silently overwriting an entry.
    seq: u64,
}

impl Inner {
    fn key_for(&mut self, task: &AnalysisTask) -> OrderKey {
        let (rev_prio, created_at) = task.order_key();
        let seq = self.seq;
        self.seq += 1;
        (rev_prio, created_at, seq)
    }

    /// The task to evict when the queue is full and a higher-priority task
    /// arrives: among the lowest-priority tasks present, the oldest one.
    fn min_priority_key(&self) -> Option<OrderKey> {
        let worst_rev_prio = self.tasks.keys().next_back()?.0;
        let lower = (worst_rev_prio, Timestamp::MIN, u64::MIN);
        self.tasks
            .range(lower..)
            .take_while(|(k, _)| k.0 == worst_rev_prio)
            .next()
            .map(|(k, _)| *k)
    }

    fn size_by_priority(&self) -> SizeByPriority {
        let mut s = SizeByPriority::default();
        for task in self.tasks.values() {
            match task.priority {
                Priority::Urgent => s.urgent += 1,
                Priority::High => s.high += 1,
                Priority::Normal => s.normal += 1,
                Priority::Low => s.low += 1,
            }
        }
        s
    }
}

/// A bounded priority FIFO queue of [`AnalysisTask`]. Safe under concurrent
/// producers (one per stream) and multiple consumers (the worker pool).
pub struct TaskQueue {
    inner: Mutex<Inner>,
    not_empty: Condvar,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        TaskQueue {
            inner: Mutex::new(Inner {
                tasks: BTreeMap::new(),
                capacity,
                closed: false,
                dropped_low: 0,
                seq: 0,
            }),
            not_empty: Condvar::new(),
        }
    }

    /// Never blocks longer than 50 ms (§5); on lock contention beyond that it
    /// returns `Blocked` so the caller can retry or drop the oldest `Low`
    /// task itself.
    pub fn push(&self, task: AnalysisTask) -> PushResult {
        let mut inner = match self.inner.try_lock() {
            Ok(g) => g,
            Err(std::sync::TryLockError::WouldBlock) => {
                // A single retry after a short wait covers the "never longer
                // than 50ms" suspension-point rule without spinning.
                std::thread::sleep(Duration::from_millis(5));
                match self.inner.try_lock() {
                    Ok(g) => g,
                    Err(_) => return PushResult::Blocked,
                }
            }
            Err(std::sync::TryLockError::Poisoned(e)) => e.into_inner(),
        };

        if inner.closed {
            return PushResult::Blocked;
        }

        if inner.tasks.len() < inner.capacity {
            let key = inner.key_for(&task);
            inner.tasks.insert(key, task);
            drop(inner);
            self.not_empty.notify_one();
            return PushResult::Accepted;
        }

        // Full: admit only if strictly higher priority than the current
        // minimum, evicting the oldest task at that minimum priority.
        let min_key = inner.min_priority_key().expect("capacity > 0 implies non-empty when full");
        let min_priority = min_key.0 .0;
        if task.priority > min_priority {
            inner.tasks.remove(&min_key);
            inner.dropped_low += 1;
            let key = inner.key_for(&task);
            inner.tasks.insert(key, task);
            drop(inner);
            self.not_empty.notify_one();
            PushResult::Accepted
        } else {
            PushResult::DroppedLow
        }
    }

    /// Blocks on the internal condition until a task is available, `deadline`
    /// passes, or the queue is closed and drained.
    pub fn pop(&self, deadline: Timestamp, now_fn: &dyn Fn() -> Timestamp) -> PopResult {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some((&key, _)) = inner.tasks.iter().next() {
                let task = inner.tasks.remove(&key).unwrap();
                return PopResult::Task(task);
            }
            if inner.closed {
                return PopResult::Closed;
            }
            let now = now_fn();
            if now >= deadline {
                return PopResult::Timeout;
            }
            let remaining_secs = (deadline.as_second() - now.as_second()).max(0) as u64;
            let wait = Duration::from_secs(remaining_secs).min(Duration::from_millis(100));
            let (guard, _timeout) = self
                .not_empty
                .wait_timeout(inner, wait)
                .unwrap();
            inner = guard;
        }
    }

    pub fn size_by_priority(&self) -> SizeByPriority {
        self.inner.lock().unwrap().size_by_priority()
    }

    pub fn dropped_low(&self) -> u64 {
        self.inner.lock().unwrap().dropped_low
    }

    /// Further `push` returns `Blocked`; `pop` keeps draining until empty,
    /// then returns `Closed`.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        drop(inner);
        self.not_empty.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BBox, LonLat, ParkingEvent, SessionEpoch, StreamId, TrackId};
    use jiff::SignedDuration;

    fn task_at(priority: Priority, created_at: Timestamp) -> AnalysisTask {
        let frame = crate::model::Frame {
            stream_id: StreamId::from("cam-1"),
            seq: 1,
            captured_at: created_at,
            location: LonLat { lon: 0.0, lat: 0.0 },
            location_name: "x".into(),
            width: 1,
            height: 1,
            jpeg_bytes: std::sync::Arc::from(&b""[..]),
        };
        let event = ParkingEvent {
            stream_id: frame.stream_id.clone(),
            session_epoch: SessionEpoch(0),
            track_id: TrackId(1),
            bbox: BBox { x: 0.0, y: 0.0, w: 1.0, h: 1.0 },
            frame,
            location: LonLat { lon: 0.0, lat: 0.0 },
            location_name: "x".into(),
            parking_start: created_at,
            duration: SignedDuration::from_secs(60),
        };
        AnalysisTask::new(event, priority, created_at, SignedDuration::from_secs(120))
    }

    #[test]
    fn fifo_within_priority() {
        let q = TaskQueue::new(10);
        let t0 = Timestamp::UNIX_EPOCH;
        q.push(task_at(Priority::Normal, t0));
        q.push(task_at(Priority::Normal, t0 + SignedDuration::from_secs(1)));
        let far = t0 + SignedDuration::from_secs(10);
        let PopResult::Task(first) = q.pop(far, &|| t0) else { panic!() };
        let PopResult::Task(second) = q.pop(far, &|| t0) else { panic!() };
        assert!(first.created_at < second.created_at);
    }

    #[test]
    fn higher_priority_pops_first() {
        let q = TaskQueue::new(10);
        let t0 = Timestamp::UNIX_EPOCH;
        q.push(task_at(Priority::Normal, t0));
        q.push(task_at(Priority::Urgent, t0 + SignedDuration::from_secs(1)));
        let far = t0 + SignedDuration::from_secs(10);
        let PopResult::Task(first) = q.pop(far, &|| t0) else { panic!() };
        assert_eq!(first.priority, Priority::Urgent);
    }

    #[test]
    fn eviction_admits_urgent_over_full_normal_queue() {
        let q = TaskQueue::new(4);
        let t0 = Timestamp::UNIX_EPOCH;
        for i in 0..4 {
            assert_eq!(
                q.push(task_at(Priority::Normal, t0 + SignedDuration::from_secs(i))),
                PushResult::Accepted
            );
        }
        assert_eq!(
            q.push(task_at(Priority::Urgent, t0 + SignedDuration::from_secs(10))),
            PushResult::Accepted
        );
        assert_eq!(q.dropped_low(), 1);
        assert_eq!(q.size_by_priority().total(), 4);
    }

    #[test]
    fn full_queue_rejects_equal_or_lower_priority() {
        let q = TaskQueue::new(2);
        let t0 = Timestamp::UNIX_EPOCH;
        q.push(task_at(Priority::Normal, t0));
        q.push(task_at(Priority::Normal, t0 + SignedDuration::from_secs(1)));
        assert_eq!(
            q.push(task_at(Priority::Low, t0 + SignedDuration::from_secs(2))),
            PushResult::DroppedLow
        );
        assert_eq!(
            q.push(task_at(Priority::Normal, t0 + SignedDuration::from_secs(3))),
            PushResult::DroppedLow
        );
    }

    #[test]
    fn close_then_pop_drains_then_closed() {
        let q = TaskQueue::new(10);
        let t0 = Timestamp::UNIX_EPOCH;
        q.push(task_at(Priority::Normal, t0));
        q.close();
        assert_eq!(q.push(task_at(Priority::Normal, t0)), PushResult::Blocked);
        let far = t0 + SignedDuration::from_secs(1);
        assert!(matches!(q.pop(far, &|| t0), PopResult::Task(_)));
        assert!(matches!(q.pop(far, &|| t0), PopResult::Closed));
    }
}
