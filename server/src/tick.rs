//! Fixed-rate tick scheduling for the simulation thread
//!
//! Deadlines are derived from the tick index (`start + n * interval`), never
//! from "now + interval", so timing error cannot accumulate. When the thread
//! falls behind, backlogged ticks run back to back without sleeping until the
//! next deadline is in the future again. No tick is ever skipped.

use crate::scheduler::DeferredQueue;
use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The simulation driven by the tick loop.
///
/// All methods run on the simulation thread, after the deferred queue has
/// been drained for the current tick (`tick`) or from inside a drained
/// action (`on_connect`/`on_disconnect`).
pub trait Simulation: Send + 'static {
    /// Advances the simulation by one tick
    fn tick(&mut self);

    /// A stream connection was bound to `slot`
    fn on_connect(&mut self, _slot: u32) {}

    /// The connection in `slot` was torn down
    fn on_disconnect(&mut self, _slot: u32) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickStep {
    /// Run one tick now
    Run,
    /// Nothing due; sleep this long before polling again
    Sleep(Duration),
}

#[derive(Debug, Clone)]
pub struct TickClock {
    start: Instant,
    interval: Duration,
    ticks: u64,
}

impl TickClock {
    pub fn new(ticks_per_second: u32, start: Instant) -> Self {
        let rate = u64::from(ticks_per_second.max(1));
        Self {
            start,
            interval: Duration::from_nanos(1_000_000_000 / rate),
            ticks: 0,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Number of ticks run so far
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Target time of tick `n`
    pub fn deadline_of(&self, n: u64) -> Instant {
        let nanos = self.interval.as_nanos() as u64 * n;
        self.start + Duration::from_nanos(nanos)
    }

    /// Target time of the next tick to run
    pub fn next_deadline(&self) -> Instant {
        self.deadline_of(self.ticks)
    }

    /// Decides what to do at `now`. Returning `Run` consumes the tick.
    pub fn poll(&mut self, now: Instant) -> TickStep {
        let deadline = self.next_deadline();
        if now >= deadline {
            self.ticks += 1;
            TickStep::Run
        } else {
            TickStep::Sleep(deadline - now)
        }
    }

    /// How far `now` is past the deadline of the tick about to run
    pub fn lag(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.next_deadline())
    }
}

/// Runs the tick loop on the calling thread until `running` goes false.
///
/// Each tick drains the deferred queue into `sim`, then advances `sim`.
pub fn run_simulation<S: Simulation>(
    mut sim: S,
    queue: Arc<DeferredQueue<S>>,
    tick_rate: u32,
    running: Arc<AtomicBool>,
) -> S {
    let mut clock = TickClock::new(tick_rate, Instant::now());
    let mut scratch = Vec::new();
    let mut behind: u64 = 0;
    let mut last_report = Instant::now();

    info!(
        "Simulation thread started at {} ticks per second ({:?} per tick)",
        tick_rate,
        clock.interval()
    );

    while running.load(Ordering::Acquire) {
        let now = Instant::now();
        let lag = clock.lag(now);
        match clock.poll(now) {
            TickStep::Run => {
                if lag > clock.interval() {
                    behind += 1;
                }
                queue.drain(&mut scratch, &mut sim);
                sim.tick();
            }
            TickStep::Sleep(remaining) => {
                if behind > 0 && last_report.elapsed() >= Duration::from_secs(1) {
                    warn!("Simulation fell behind, caught up {} late ticks", behind);
                    behind = 0;
                    last_report = Instant::now();
                }
                std::thread::sleep(remaining);
            }
        }
    }

    info!("Simulation thread stopped after {} ticks", clock.ticks());
    sim
}
