//! Hierarchical timing wheels, tick = 10 ms.
//!
//! A 256-slot near wheel holds everything expiring within 256 ticks;
//! four 64-slot cascade wheels hold the rest, indexed by successively
//! higher 6-bit groups of the expire counter. Advancing the tick drains
//! the matching near slot; each 256-tick boundary cascades one slot of
//! the next wheel down. Insert and amortized advance are O(1).
//!
//! The timer thread sleeps ~2.5 ms between passes and advances by the
//! number of 10 ms units elapsed on the monotonic clock, so delivery
//! never runs ahead of wall time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use warren_core::Handle;

const TIME_NEAR_SHIFT: u32 = 8;
const TIME_NEAR: usize = 1 << TIME_NEAR_SHIFT;
const TIME_LEVEL_SHIFT: u32 = 6;
const TIME_LEVEL: usize = 1 << TIME_LEVEL_SHIFT;
const TIME_NEAR_MASK: u32 = TIME_NEAR as u32 - 1;
const TIME_LEVEL_MASK: u32 = TIME_LEVEL as u32 - 1;

/// One pending expiration.
#[derive(Debug, Clone, Copy)]
struct TimerEvent {
    expire: u32,
    handle: Handle,
    session: i32,
}

struct Wheel {
    near: Vec<Vec<TimerEvent>>,
    level: Vec<Vec<Vec<TimerEvent>>>,
    /// The global tick counter `T`.
    time: u32,
}

impl Wheel {
    fn new() -> Wheel {
        Wheel {
            near: (0..TIME_NEAR).map(|_| Vec::new()).collect(),
            level: (0..4)
                .map(|_| (0..TIME_LEVEL).map(|_| Vec::new()).collect())
                .collect(),
            time: 0,
        }
    }

    /// Link a node into the wheel matching its distance from now.
    fn add_node(&mut self, node: TimerEvent) {
        let time = node.expire;
        let current = self.time;
        if (time | TIME_NEAR_MASK) == (current | TIME_NEAR_MASK) {
            self.near[(time & TIME_NEAR_MASK) as usize].push(node);
        } else {
            let mut mask: u32 = (TIME_NEAR << TIME_LEVEL_SHIFT) as u32;
            let mut i = 0;
            while i < 3 {
                if (time | (mask - 1)) == (current | (mask - 1)) {
                    break;
                }
                mask <<= TIME_LEVEL_SHIFT;
                i += 1;
            }
            let slot =
                (time >> (TIME_NEAR_SHIFT + i as u32 * TIME_LEVEL_SHIFT)) & TIME_LEVEL_MASK;
            self.level[i][slot as usize].push(node);
        }
    }

    /// Re-link every node of one cascade slot.
    fn move_list(&mut self, level: usize, idx: usize) {
        let nodes = std::mem::take(&mut self.level[level][idx]);
        for node in nodes {
            self.add_node(node);
        }
    }

    /// Advance the tick counter and cascade whichever wheel completed a
    /// revolution. Counter overflow cascades slot 0 of the top wheel.
    fn shift(&mut self) {
        let mut mask = TIME_NEAR as u32;
        self.time = self.time.wrapping_add(1);
        let ct = self.time;
        if ct == 0 {
            self.move_list(3, 0);
        } else {
            let mut time = ct >> TIME_NEAR_SHIFT;
            let mut i = 0;
            while (ct & (mask - 1)) == 0 {
                let idx = (time & TIME_LEVEL_MASK) as usize;
                if idx != 0 {
                    self.move_list(i, idx);
                    break;
                }
                mask <<= TIME_LEVEL_SHIFT;
                time >>= TIME_LEVEL_SHIFT;
                i += 1;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Timer
// ---------------------------------------------------------------------------

/// The node's timer: wheels plus the wall/monotonic correlation.
pub struct Timer {
    wheel: Mutex<Wheel>,
    /// Wall-clock seconds at startup.
    starttime: u32,
    /// 10 ms ticks elapsed since startup (includes the startup
    /// sub-second fraction, like the tick counter it feeds).
    current: AtomicU64,
    /// Last observed monotonic reading, in 10 ms units.
    current_point: AtomicU64,
    origin: Instant,
}

impl Timer {
    pub fn new() -> Timer {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let starttime = now.as_secs() as u32;
        let fraction_cs = u64::from(now.subsec_millis()) / 10;
        let timer = Timer {
            wheel: Mutex::new(Wheel::new()),
            starttime,
            current: AtomicU64::new(fraction_cs),
            current_point: AtomicU64::new(0),
            origin: Instant::now(),
        };
        timer
            .current_point
            .store(timer.monotonic_cs(), Ordering::Relaxed);
        timer
    }

    fn monotonic_cs(&self) -> u64 {
        let elapsed = self.origin.elapsed();
        elapsed.as_secs() * 100 + u64::from(elapsed.subsec_millis()) / 10
    }

    fn lock(&self) -> MutexGuard<'_, Wheel> {
        self.wheel.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wall-clock seconds at node startup.
    pub fn starttime(&self) -> u32 {
        self.starttime
    }

    /// Ticks (10 ms units) since startup.
    pub fn now(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    /// Schedule a response for `handle` after `ticks`. Non-positive
    /// delays are the caller's job (deliver immediately); this only
    /// links a node.
    pub fn schedule(&self, handle: Handle, session: i32, ticks: i32) {
        let mut wheel = self.lock();
        let expire = wheel.time.wrapping_add(ticks as u32);
        wheel.add_node(TimerEvent {
            expire,
            handle,
            session,
        });
    }

    /// Drain every node due at the current tick, handing each to
    /// `deliver` with the wheel lock released (delivery pushes into
    /// mailboxes and may take their locks).
    fn execute<'a>(
        &'a self,
        mut guard: MutexGuard<'a, Wheel>,
        deliver: &mut dyn FnMut(Handle, i32),
    ) -> MutexGuard<'a, Wheel> {
        loop {
            let idx = (guard.time & TIME_NEAR_MASK) as usize;
            if guard.near[idx].is_empty() {
                return guard;
            }
            let due = std::mem::take(&mut guard.near[idx]);
            drop(guard);
            for node in due {
                deliver(node.handle, node.session);
            }
            guard = self.lock();
        }
    }

    /// Advance one tick: fire due nodes, shift, fire again (a zero-delay
    /// node linked during delivery lands in the current slot).
    fn update(&self, deliver: &mut dyn FnMut(Handle, i32)) {
        let guard = self.lock();
        let mut guard = self.execute(guard, deliver);
        guard.shift();
        drop(self.execute(guard, deliver));
    }

    /// One timer-thread pass: advance by however many ticks elapsed on
    /// the monotonic clock since the previous pass.
    pub fn advance(&self, deliver: &mut dyn FnMut(Handle, i32)) {
        let cp = self.monotonic_cs();
        let last = self.current_point.load(Ordering::Relaxed);
        if cp < last {
            // The tick source is monotonic, so this is a saturating
            // guard; resync without advancing if it ever fires.
            tracing::error!("time diff error: change from {cp} to {last}");
            self.current_point.store(cp, Ordering::Relaxed);
        } else if cp != last {
            let diff = cp - last;
            self.current_point.store(cp, Ordering::Relaxed);
            self.current.fetch_add(diff, Ordering::Relaxed);
            for _ in 0..diff {
                self.update(deliver);
            }
        }
    }

    /// Test/driver entry: advance exactly `ticks` ticks.
    pub fn advance_ticks(&self, ticks: u32, deliver: &mut dyn FnMut(Handle, i32)) {
        self.current.fetch_add(u64::from(ticks), Ordering::Relaxed);
        for _ in 0..ticks {
            self.update(deliver);
        }
    }
}

impl Default for Timer {
    fn default() -> Self {
        Timer::new()
    }
}

/// Per-thread CPU time in microseconds, for profiling dispatch cost.
pub(crate) fn thread_time_micros() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_THREAD_CPUTIME_ID, &mut ts) };
    if rc != 0 {
        return 0;
    }
    ts.tv_sec as u64 * 1_000_000 + ts.tv_nsec as u64 / 1_000
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn h(raw: u32) -> Handle {
        Handle::from_raw(raw)
    }

    fn drain(timer: &Timer, ticks: u32) -> Vec<(Handle, i32)> {
        let mut fired = Vec::new();
        timer.advance_ticks(ticks, &mut |handle, session| fired.push((handle, session)));
        fired
    }

    #[test]
    fn short_delay_fires_at_exact_tick() {
        let timer = Timer::new();
        timer.schedule(h(1), 7, 10);
        assert!(drain(&timer, 9).is_empty());
        assert_eq!(drain(&timer, 1), vec![(h(1), 7)]);
        // Exactly once.
        assert!(drain(&timer, 300).is_empty());
    }

    #[test]
    fn near_wheel_boundary_delay() {
        let timer = Timer::new();
        timer.schedule(h(2), 1, 255);
        timer.schedule(h(2), 2, 256);
        let fired = drain(&timer, 255);
        assert_eq!(fired, vec![(h(2), 1)]);
        assert_eq!(drain(&timer, 1), vec![(h(2), 2)]);
    }

    #[test]
    fn long_delay_cascades_out_of_level_wheels() {
        let timer = Timer::new();
        // Beyond the near wheel and the first cascade wheel.
        let delay = 256 * 64 + 123;
        timer.schedule(h(3), 9, delay);
        assert!(drain(&timer, delay as u32 - 1).is_empty());
        assert_eq!(drain(&timer, 1), vec![(h(3), 9)]);
    }

    #[test]
    fn many_timers_fire_in_tick_order() {
        let timer = Timer::new();
        for session in 1..=100 {
            timer.schedule(h(4), session, session);
        }
        let fired = drain(&timer, 100);
        let sessions: Vec<i32> = fired.iter().map(|(_, s)| *s).collect();
        assert_eq!(sessions, (1..=100).collect::<Vec<i32>>());
    }

    #[test]
    fn delivery_never_runs_early() {
        let timer = Timer::new();
        timer.schedule(h(5), 1, 50);
        let before = timer.now();
        let mut fired_at = None;
        for tick in 1..=60u32 {
            let mut hit = false;
            timer.advance_ticks(1, &mut |_, _| hit = true);
            if hit {
                fired_at = Some(tick);
                break;
            }
        }
        assert_eq!(fired_at, Some(50));
        assert_eq!(timer.now() - before, 50);
    }

    #[test]
    fn reschedule_during_delivery_fires_on_a_later_tick() {
        let timer = Timer::new();
        timer.schedule(h(6), 1, 1);
        let mut sessions = Vec::new();
        let mut deliver = |handle: Handle, session: i32| {
            sessions.push(session);
            if session == 1 {
                timer.schedule(handle, 2, 1);
            }
        };
        timer.advance_ticks(2, &mut deliver);
        assert_eq!(sessions, vec![1, 2]);
    }
}
