// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 itsakeyfut
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Timing Event System
//!
//! Discrete-event queue that drives the whole simulation.
//!
//! # Architecture
//!
//! Simulated time is a single monotonically increasing tick counter. Components
//! never block: they schedule a callback at some future tick and return. The
//! manager hands events back in (tick, insertion order), so two events scheduled
//! for the same tick fire in the order they were scheduled.
//!
//! Cancelled events stay in the heap and are skipped lazily when they reach the
//! front.
//!
//! # Example
//!
//! ```
//! use snoopsim::core::timing::TimingEventManager;
//!
//! let mut timing = TimingEventManager::new();
//!
//! timing.schedule(1000, "late");
//! timing.schedule(500, "early");
//!
//! assert_eq!(timing.pop_next(), Some((500, "early")));
//! assert_eq!(timing.pop_next(), Some((1000, "late")));
//! assert_eq!(timing.now(), 1000);
//! ```

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::fmt;

use super::error::{Result, SimError};

/// Absolute simulated time
pub type Tick = u64;

/// Largest representable tick, used as "never"
pub const MAX_TICK: Tick = Tick::MAX;

/// Handle of a scheduled event
///
/// Handles are never reused, so a stale handle can be passed to
/// [`TimingEventManager::deschedule`] safely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventHandle(u64);

struct Scheduled<E> {
    when: Tick,
    seq: u64,
    event: E,
}

impl<E> PartialEq for Scheduled<E> {
    fn eq(&self, other: &Self) -> bool {
        self.when == other.when && self.seq == other.seq
    }
}

impl<E> Eq for Scheduled<E> {}

impl<E> PartialOrd for Scheduled<E> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<E> Ord for Scheduled<E> {
    // BinaryHeap is a max-heap; invert so the earliest (when, seq) is on top.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .when
            .cmp(&self.when)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Timing Event Manager
///
/// Owns the global tick counter and the queue of pending events.
///
/// # Design
///
/// - Events are stored in a binary heap keyed by (tick, sequence number)
/// - Time only advances when an event is popped or [`advance_to`] is called
/// - Scheduling into the past is rejected by [`schedule_at`]
///
/// [`advance_to`]: TimingEventManager::advance_to
/// [`schedule_at`]: TimingEventManager::schedule_at
pub struct TimingEventManager<E> {
    /// Current simulated time
    current_tick: Tick,

    /// Sequence number for the next scheduled event
    next_seq: u64,

    /// Pending events
    queue: BinaryHeap<Scheduled<E>>,

    /// Sequence numbers of events that are scheduled and not cancelled
    live: HashSet<u64>,

    /// Number of events handed out by `pop_next`
    events_run: u64,
}

impl<E: fmt::Debug> TimingEventManager<E> {
    /// Create a new timing event manager at tick 0
    ///
    /// # Example
    ///
    /// ```
    /// use snoopsim::core::timing::TimingEventManager;
    ///
    /// let timing: TimingEventManager<u32> = TimingEventManager::new();
    /// assert_eq!(timing.now(), 0);
    /// assert_eq!(timing.pending(), 0);
    /// ```
    pub fn new() -> Self {
        Self {
            current_tick: 0,
            next_seq: 0,
            queue: BinaryHeap::new(),
            live: HashSet::new(),
            events_run: 0,
        }
    }

    /// Current simulated time
    #[inline]
    pub fn now(&self) -> Tick {
        self.current_tick
    }

    /// Schedule an event `delay` ticks from now
    ///
    /// # Arguments
    ///
    /// * `delay` - Ticks until the event fires (0 fires at the current tick,
    ///   after everything already scheduled for it)
    /// * `event` - Payload handed back by [`pop_next`](Self::pop_next)
    ///
    /// # Returns
    ///
    /// Handle that can be used to deschedule the event
    pub fn schedule(&mut self, delay: Tick, event: E) -> EventHandle {
        let when = self.current_tick.saturating_add(delay);
        self.push(when, event)
    }

    /// Schedule an event at an absolute tick
    ///
    /// # Errors
    ///
    /// Returns [`SimError::EventInPast`] if `when` is earlier than the current tick.
    pub fn schedule_at(&mut self, when: Tick, event: E) -> Result<EventHandle> {
        if when < self.current_tick {
            return Err(SimError::EventInPast {
                when,
                now: self.current_tick,
            });
        }
        Ok(self.push(when, event))
    }

    fn push(&mut self, when: Tick, event: E) -> EventHandle {
        let seq = self.next_seq;
        self.next_seq += 1;

        log::trace!("Timing: scheduling {:?} at tick {}", event, when);

        self.queue.push(Scheduled { when, seq, event });
        self.live.insert(seq);
        EventHandle(seq)
    }

    /// Cancel a scheduled event
    ///
    /// # Returns
    ///
    /// true if the event was pending and is now cancelled
    pub fn deschedule(&mut self, handle: EventHandle) -> bool {
        self.live.remove(&handle.0)
    }

    /// Check whether an event is still pending
    pub fn is_scheduled(&self, handle: EventHandle) -> bool {
        self.live.contains(&handle.0)
    }

    /// Tick of the earliest pending event
    pub fn next_event_time(&mut self) -> Option<Tick> {
        self.discard_cancelled();
        self.queue.peek().map(|s| s.when)
    }

    /// Remove the earliest pending event and advance time to it
    pub fn pop_next(&mut self) -> Option<(Tick, E)> {
        self.discard_cancelled();
        let scheduled = self.queue.pop()?;
        self.live.remove(&scheduled.seq);

        self.current_tick = scheduled.when;
        self.events_run += 1;

        log::trace!(
            "Timing: running {:?} at tick {}",
            scheduled.event,
            scheduled.when
        );

        Some((scheduled.when, scheduled.event))
    }

    /// Advance time without running events
    ///
    /// Time never moves backwards, and never past a pending event.
    pub fn advance_to(&mut self, tick: Tick) {
        let limit = self.next_event_time().unwrap_or(MAX_TICK);
        self.current_tick = self.current_tick.max(tick.min(limit));
    }

    /// Number of pending (not cancelled) events
    pub fn pending(&self) -> usize {
        self.live.len()
    }

    /// Number of events run since the last reset
    pub fn events_run(&self) -> u64 {
        self.events_run
    }

    /// Reset the timing system
    ///
    /// Drops every pending event and rewinds time to 0.
    pub fn reset(&mut self) {
        self.current_tick = 0;
        self.next_seq = 0;
        self.queue.clear();
        self.live.clear();
        self.events_run = 0;
    }

    fn discard_cancelled(&mut self) {
        while let Some(top) = self.queue.peek() {
            if self.live.contains(&top.seq) {
                break;
            }
            self.queue.pop();
        }
    }
}

impl<E: fmt::Debug> Default for TimingEventManager<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for TimingEventManager<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimingEventManager")
            .field("current_tick", &self.current_tick)
            .field("pending", &self.live.len())
            .field("events_run", &self.events_run)
            .finish()
    }
}
