//! Settle delays and bounded two-phase polling.
//!
//! Every hardware wait in the driver goes through [`Poller`]: a short
//! busy-poll window nested inside a longer overall window. Once the busy
//! window is spent the poller backs off to a sleeping cadence; once the
//! overall window is spent it yields a typed [`DriverError::Timeout`].
//!
//! ```text
//!   0 ─── busy_max ───────────────────────── overall_max
//!   │ Busy: busy_step │ Sleep: sleep_step    │ TimedOut
//! ```
//!
//! How the thread actually waits is the [`Clock`]'s business. [`HostClock`]
//! spins, yields or sleeps on the real monotonic clock; [`VirtualClock`]
//! only advances a counter, so the same poll loops run instantly in tests
//! with exact timing assertions.

use crate::config::{Timing, YieldStrategy};
use crate::error::{DriverError, Result};
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Phase of a two-phase wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPhase {
    /// Short fixed delays, thread stays runnable.
    Busy,
    /// Longer delays, thread gives up the CPU.
    Sleep,
    /// Overall budget exhausted.
    TimedOut,
}

/// Time source and waiting strategy.
pub trait Clock: Debug + Send + Sync {
    /// Monotonic time since the clock was created.
    fn elapsed(&self) -> Duration;

    /// Inter-access settle delay before a register access.
    fn settle(&self, delay: Duration);

    /// Wait `delay` in the given poll phase.
    fn pause(&self, phase: PollPhase, delay: Duration);
}

/// Real-time clock.
#[derive(Debug)]
pub struct HostClock {
    origin: Instant,
    strategy: YieldStrategy,
}

impl HostClock {
    /// Create a clock with the busy-phase strategy to use.
    pub fn new(strategy: YieldStrategy) -> Self {
        Self {
            origin: Instant::now(),
            strategy,
        }
    }

    fn spin_for(delay: Duration) {
        let until = Instant::now() + delay;
        while Instant::now() < until {
            std::hint::spin_loop();
        }
    }
}

impl Default for HostClock {
    fn default() -> Self {
        Self::new(YieldStrategy::default())
    }
}

impl Clock for HostClock {
    fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }

    fn settle(&self, delay: Duration) {
        // Sub-microsecond: sleeping would overshoot by orders of magnitude
        Self::spin_for(delay);
    }

    fn pause(&self, phase: PollPhase, delay: Duration) {
        match (phase, self.strategy) {
            (PollPhase::Busy, YieldStrategy::Spin) => Self::spin_for(delay),
            (PollPhase::Busy, YieldStrategy::ThreadYield) => {
                let until = Instant::now() + delay;
                while Instant::now() < until {
                    std::thread::yield_now();
                }
            }
            (PollPhase::Busy, YieldStrategy::Sleep) | (PollPhase::Sleep, _) => {
                std::thread::sleep(delay);
            }
            (PollPhase::TimedOut, _) => {}
        }
    }
}

/// Clock that advances only when asked to wait.
///
/// Register settle delays and poll pauses add to a counter instead of
/// blocking, and the counts per phase are kept for assertions.
#[derive(Debug, Default)]
pub struct VirtualClock {
    now_ns: AtomicU64,
    busy_pauses: AtomicU64,
    sleep_pauses: AtomicU64,
}

impl VirtualClock {
    /// Create a clock at time zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward without a wait.
    pub fn advance(&self, by: Duration) {
        self.now_ns.fetch_add(saturating_nanos(by), Ordering::SeqCst);
    }

    /// Number of busy-phase pauses taken.
    pub fn busy_pauses(&self) -> u64 {
        self.busy_pauses.load(Ordering::SeqCst)
    }

    /// Number of sleep-phase pauses taken.
    pub fn sleep_pauses(&self) -> u64 {
        self.sleep_pauses.load(Ordering::SeqCst)
    }
}

impl Clock for VirtualClock {
    fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.now_ns.load(Ordering::SeqCst))
    }

    fn settle(&self, delay: Duration) {
        self.advance(delay);
    }

    fn pause(&self, phase: PollPhase, delay: Duration) {
        match phase {
            PollPhase::Busy => self.busy_pauses.fetch_add(1, Ordering::SeqCst),
            PollPhase::Sleep => self.sleep_pauses.fetch_add(1, Ordering::SeqCst),
            PollPhase::TimedOut => return,
        };
        self.advance(delay);
    }
}

fn saturating_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

/// Two bounded windows for one hardware wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitBudget {
    /// Delay between polls while busy-waiting.
    pub busy_step: Duration,
    /// How long busy-waiting lasts before backing off.
    pub busy_max: Duration,
    /// Delay between polls once backed off.
    pub sleep_step: Duration,
    /// Total time before the wait fails.
    pub overall_max: Duration,
}

impl From<&Timing> for WaitBudget {
    fn from(t: &Timing) -> Self {
        Self {
            busy_step: t.busy_step,
            busy_max: t.busy_max,
            sleep_step: t.sleep_step,
            overall_max: t.overall_max,
        }
    }
}

/// Explicit busy → sleep → timed-out state machine for one wait.
#[derive(Debug)]
pub struct Poller<'c> {
    clock: &'c dyn Clock,
    budget: WaitBudget,
    started: Duration,
    phase: PollPhase,
}

impl<'c> Poller<'c> {
    /// Start a wait now.
    pub fn start(clock: &'c dyn Clock, budget: WaitBudget) -> Self {
        Self {
            clock,
            budget,
            started: clock.elapsed(),
            phase: PollPhase::Busy,
        }
    }

    /// Current phase.
    pub const fn phase(&self) -> PollPhase {
        self.phase
    }

    /// Time spent in this wait so far.
    pub fn waited(&self) -> Duration {
        self.clock.elapsed().saturating_sub(self.started)
    }

    /// Pause before the next poll.
    ///
    /// # Errors
    ///
    /// Returns `DriverError::Timeout` once the overall budget is spent. The
    /// last pause is clamped so the wait never overshoots the budget by
    /// more than one poll.
    pub fn pause(&mut self) -> Result<()> {
        let waited = self.waited();
        if waited >= self.budget.overall_max {
            self.phase = PollPhase::TimedOut;
            return Err(DriverError::timeout(self.budget.overall_max));
        }

        let step = if waited < self.budget.busy_max {
            self.phase = PollPhase::Busy;
            self.budget.busy_step
        } else {
            self.phase = PollPhase::Sleep;
            self.budget.sleep_step
        };

        let remaining = self.budget.overall_max - waited;
        self.clock.pause(self.phase, step.min(remaining));
        Ok(())
    }
}

/// Poll `probe` until it yields a value or the budget runs out.
///
/// # Errors
///
/// Returns `DriverError::Timeout` when the overall budget is exhausted.
pub fn poll_until<T>(
    clock: &dyn Clock,
    budget: WaitBudget,
    mut probe: impl FnMut() -> Option<T>,
) -> Result<T> {
    let mut poller = Poller::start(clock, budget);
    loop {
        if let Some(value) = probe() {
            return Ok(value);
        }
        poller.pause()?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budget() -> WaitBudget {
        WaitBudget {
            busy_step: Duration::from_micros(1),
            busy_max: Duration::from_micros(50),
            sleep_step: Duration::from_millis(10),
            overall_max: Duration::from_millis(100),
        }
    }

    #[test]
    fn never_ready_times_out_exactly_at_budget() {
        let clock = VirtualClock::new();
        let result: Result<()> = poll_until(&clock, budget(), || None);

        assert!(matches!(result, Err(DriverError::Timeout { duration_ms: 100 })));
        assert_eq!(clock.elapsed(), Duration::from_millis(100));
        assert_eq!(clock.busy_pauses(), 50);
        assert!(clock.sleep_pauses() >= 9);
    }

    #[test]
    fn ready_after_a_few_polls_stays_busy() {
        let clock = VirtualClock::new();
        let mut polls = 0;
        let value = poll_until(&clock, budget(), || {
            polls += 1;
            (polls == 4).then_some(polls)
        })
        .unwrap();

        assert_eq!(value, 4);
        assert_eq!(clock.busy_pauses(), 3);
        assert_eq!(clock.sleep_pauses(), 0);
    }

    #[test]
    fn poller_moves_through_phases() {
        let clock = VirtualClock::new();
        let mut p = Poller::start(&clock, budget());
        assert_eq!(p.phase(), PollPhase::Busy);

        clock.advance(Duration::from_micros(60));
        p.pause().unwrap();
        assert_eq!(p.phase(), PollPhase::Sleep);

        clock.advance(Duration::from_millis(200));
        assert!(p.pause().is_err());
        assert_eq!(p.phase(), PollPhase::TimedOut);
    }

    #[test]
    fn host_clock_spin_strategy_returns() {
        let clock = HostClock::new(YieldStrategy::Spin);
        let before = clock.elapsed();
        clock.pause(PollPhase::Busy, Duration::from_micros(20));
        assert!(clock.elapsed() >= before + Duration::from_micros(20));
    }
}
