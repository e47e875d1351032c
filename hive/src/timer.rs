// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Hierarchical timing wheel: one 256-slot near wheel plus four 64-slot
//! cascade wheels, ticking every 10 ms.
//!
//! Fired nodes are collected under the wheel lock and returned to the
//! caller, which pushes the response messages after the lock is released;
//! mailbox pushes never happen with the wheel locked.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::handle::Handle;

/// Milliseconds per tick ("centisecond" clock).
pub const TICK_MS: u64 = 10;

const NEAR_SHIFT: u32 = 8;
const NEAR: usize = 1 << NEAR_SHIFT;
const NEAR_MASK: u32 = NEAR as u32 - 1;

const LEVEL_SHIFT: u32 = 6;
const LEVEL: usize = 1 << LEVEL_SHIFT;
const LEVEL_MASK: u32 = LEVEL as u32 - 1;

/// A scheduled timeout: fire a `Response` carrying `session` at `handle`
/// once the wheel reaches `expire`.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct TimerNode {
    expire: u32,
    pub handle: Handle,
    pub session: i32,
}

struct Wheel {
    near: Vec<Vec<TimerNode>>,
    level: [Vec<Vec<TimerNode>>; 4],
    /// Tick counter the wheel geometry is indexed by; wraps at 2^32.
    time: u32,
}

impl Wheel {
    fn new() -> Wheel {
        Wheel {
            near: (0..NEAR).map(|_| Vec::new()).collect(),
            level: std::array::from_fn(|_| (0..LEVEL).map(|_| Vec::new()).collect()),
            time: 0,
        }
    }

    fn add(&mut self, node: TimerNode) {
        let time = node.expire;
        let current = self.time;

        if (time | NEAR_MASK) == (current | NEAR_MASK) {
            self.near[(time & NEAR_MASK) as usize].push(node);
            return;
        }

        // Pick the innermost cascade level whose window still contains the
        // expiry.
        let mut mask = (NEAR as u32) << LEVEL_SHIFT;
        let mut level = 0;
        while level < 3 {
            if (time | (mask - 1)) == (current | (mask - 1)) {
                break;
            }
            mask <<= LEVEL_SHIFT;
            level += 1;
        }

        let index = ((time >> (NEAR_SHIFT + level as u32 * LEVEL_SHIFT)) & LEVEL_MASK) as usize;
        self.level[level][index].push(node);
    }

    fn drain_near(&mut self, fired: &mut Vec<TimerNode>) {
        let index = (self.time & NEAR_MASK) as usize;
        if !self.near[index].is_empty() {
            fired.append(&mut self.near[index]);
        }
    }

    fn migrate(&mut self, level: usize, index: usize) {
        let nodes = std::mem::take(&mut self.level[level][index]);
        for node in nodes {
            self.add(node);
        }
    }

    fn shift(&mut self) {
        self.time = self.time.wrapping_add(1);
        let ct = self.time;

        if ct == 0 {
            self.migrate(3, 0);
            return;
        }

        let mut mask = NEAR as u32;
        let mut time = ct >> NEAR_SHIFT;
        let mut level = 0;

        while (ct & (mask - 1)) == 0 {
            let index = (time & LEVEL_MASK) as usize;
            if index != 0 {
                self.migrate(level, index);
                break;
            }
            mask <<= LEVEL_SHIFT;
            time >>= LEVEL_SHIFT;
            level += 1;
        }
    }
}

pub struct Timer {
    wheel: Mutex<Wheel>,
    /// Ticks since boot, for `now()`. Monotonic, never wraps in practice.
    current: AtomicU64,
    /// Last observed monotonic tick count; only the timer thread advances
    /// it.
    current_point: Mutex<u64>,
    origin: Instant,
    starttime: u64,
}

impl Timer {
    pub fn new() -> Timer {
        let starttime = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        Timer {
            wheel: Mutex::new(Wheel::new()),
            current: AtomicU64::new(0),
            current_point: Mutex::new(0),
            origin: Instant::now(),
            starttime,
        }
    }

    /// Ticks elapsed since the runtime started.
    pub fn now(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    /// Wall-clock seconds at boot.
    pub fn starttime(&self) -> u64 {
        self.starttime
    }

    /// Schedule a node `ticks` from now. Non-positive delays are the
    /// caller's business (they respond immediately, bypassing the wheel).
    pub(crate) fn insert(&self, handle: Handle, ticks: u32, session: i32) {
        let mut wheel = self.wheel.lock().expect("timer lock poisoned");
        let expire = wheel.time.wrapping_add(ticks);
        wheel.add(TimerNode {
            expire,
            handle,
            session,
        });
    }

    /// Advance one tick and collect everything that fired.
    pub(crate) fn advance(&self, fired: &mut Vec<TimerNode>) {
        let mut wheel = self.wheel.lock().expect("timer lock poisoned");
        wheel.drain_near(fired);
        wheel.shift();
        wheel.drain_near(fired);
    }

    /// Catch the wheel up with the monotonic clock; one `advance` per
    /// elapsed 10 ms, however long the caller was away.
    pub(crate) fn update_from_clock(&self, fired: &mut Vec<TimerNode>) {
        let point = self.origin.elapsed().as_millis() as u64 / TICK_MS;

        let mut current_point = self.current_point.lock().expect("timer lock poisoned");
        let diff = point.saturating_sub(*current_point);
        if diff == 0 {
            return;
        }
        *current_point = point;
        drop(current_point);

        self.current.fetch_add(diff, Ordering::Relaxed);
        for _ in 0..diff {
            self.advance(fired);
        }
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Advance `n` ticks, returning the tick offsets (1-based) at which
    /// anything fired.
    fn fire_offsets(timer: &Timer, n: u32) -> Vec<(u32, i32)> {
        let mut out = Vec::new();
        for tick in 1..=n {
            let mut fired = Vec::new();
            timer.advance(&mut fired);
            for node in fired {
                out.push((tick, node.session));
            }
        }
        out
    }

    #[test]
    fn fires_at_exact_tick() {
        let timer = Timer::new();
        timer.insert(Handle::new(1), 5, 42);

        let fired = fire_offsets(&timer, 10);
        assert_eq!(fired, vec![(5, 42)]);
    }

    #[test]
    fn never_fires_early() {
        let timer = Timer::new();
        for delay in [1u32, 2, 255, 256, 257, 1000] {
            timer.insert(Handle::new(1), delay, delay as i32);
        }

        let fired = fire_offsets(&timer, 1100);
        for (tick, session) in fired {
            assert_eq!(tick, session as u32, "delay {session} fired at {tick}");
        }
    }

    #[test]
    fn cascade_boundaries() {
        // 2^14 - 1 sits in cascade level 1, 2^14 in level 2; both must still
        // fire at exactly their delay.
        let timer = Timer::new();
        let low = (1 << 14) - 1;
        let high = 1 << 14;
        timer.insert(Handle::new(1), low, 1);
        timer.insert(Handle::new(1), high, 2);

        let fired = fire_offsets(&timer, high + 10);
        assert_eq!(fired, vec![(low, 1), (high, 2)]);
    }

    #[test]
    fn many_timers_one_slot() {
        let timer = Timer::new();
        for session in 0..100 {
            timer.insert(Handle::new(1), 3, session);
        }

        let mut fired = Vec::new();
        timer.advance(&mut fired);
        timer.advance(&mut fired);
        assert!(fired.is_empty());
        timer.advance(&mut fired);
        assert_eq!(fired.len(), 100);
    }

    #[test]
    fn clock_catchup_is_bounded_by_elapsed_time() {
        let timer = Timer::new();
        timer.insert(Handle::new(1), 1, 7);

        std::thread::sleep(std::time::Duration::from_millis(3 * TICK_MS));
        let mut fired = Vec::new();
        timer.update_from_clock(&mut fired);

        assert_eq!(fired.len(), 1);
        assert!(timer.now() >= 3);
    }
}
