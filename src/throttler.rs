//! Rate-limits repeated "run" requests, typically online transitions and stream reconnects,
//! using randomized exponential backoff to avoid thundering-herd reconnection.
use std::sync::mpsc::{sync_channel, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::{thread_rng, Rng};

use crate::environment::EnvironmentReporter;

/// Default ceiling for the backoff delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(600);

type RunClosure = Box<dyn FnOnce() + Send>;

struct ThrottleState {
    run_attempts: u32,
    delay: Duration,
    pending_run: Option<RunClosure>,
    // Dropping the sender cancels the armed timer thread.
    timer_stop: Option<SyncSender<()>>,
    // Bumped whenever the timer is re-armed or cancelled, so a superseded timer that already
    // timed out does not fire.
    generation: u64,
}

/// Randomized exponential backoff gate.
///
/// The first call since construction or since the last timer fire runs synchronously. Later
/// calls are scheduled after a delay uniformly drawn from `[2^(n-1), 2^n)` seconds (capped at
/// `max_delay`) and coalesce: only the most recently supplied closure runs when the timer fires.
pub struct Throttler {
    max_delay: Duration,
    throttling_enabled: bool,
    state: Arc<Mutex<ThrottleState>>,
}

impl Throttler {
    /// Create a throttler with the given delay ceiling. Throttling is disabled entirely when the
    /// environment says so (debug/integration builds).
    pub fn new(max_delay: Duration, environment: &EnvironmentReporter) -> Throttler {
        Throttler {
            max_delay,
            throttling_enabled: environment.throttling_enabled(),
            state: Arc::new(Mutex::new(ThrottleState {
                run_attempts: 0,
                delay: Duration::ZERO,
                pending_run: None,
                timer_stop: None,
                generation: 0,
            })),
        }
    }

    /// The number of attempts after which the delay saturates at `max_delay`.
    pub fn max_attempts(max_delay: Duration) -> u32 {
        max_delay.as_secs_f64().log2().ceil() as u32 + 1
    }

    /// Run `run` now if this is the first call since the last reset, otherwise schedule it after
    /// the current backoff delay, superseding any previously scheduled closure.
    pub fn run_throttled(&self, run: RunClosure) {
        if !self.throttling_enabled {
            log::debug!(target: "flagsync", "executing run closure unthrottled: throttling is disabled");
            run();
            return;
        }

        let mut state = self
            .state
            .lock()
            .expect("thread holding throttler lock should not panic");
        if state.run_attempts == 0 {
            state.run_attempts = 1;
            state.delay = Duration::ZERO;
            self.arm_timer(&mut state, Duration::ZERO);
            drop(state);
            log::debug!(target: "flagsync", "executing run closure unthrottled");
            run();
            return;
        }

        let attempts = state.run_attempts;
        state.delay = delay_for_attempt(attempts, self.max_delay);
        state.pending_run = Some(run);
        state.run_attempts += 1;
        let delay = state.delay;
        self.arm_timer(&mut state, delay);
        log::debug!(
            target: "flagsync",
            "throttling run closure: attempts={}, delay={:?}", attempts + 1, delay
        );
    }

    /// Abort any pending scheduled run without executing it and reset to the initial state.
    pub fn cancel(&self) {
        let mut state = self
            .state
            .lock()
            .expect("thread holding throttler lock should not panic");
        state.generation += 1;
        state.timer_stop = None;
        state.pending_run = None;
        state.run_attempts = 0;
        state.delay = Duration::ZERO;
    }

    /// Run attempts since the last reset.
    pub fn run_attempts(&self) -> u32 {
        self.state
            .lock()
            .expect("thread holding throttler lock should not panic")
            .run_attempts
    }

    /// The delay computed for the most recent call.
    pub fn delay(&self) -> Duration {
        self.state
            .lock()
            .expect("thread holding throttler lock should not panic")
            .delay
    }

    // Replaces any armed timer with one firing after `delay`. Firing runs the most recently
    // supplied closure (if any) and resets the throttler to its initial state.
    fn arm_timer(&self, state: &mut ThrottleState, delay: Duration) {
        state.generation += 1;
        let generation = state.generation;
        let (stop_tx, stop_rx) = sync_channel::<()>(1);
        state.timer_stop = Some(stop_tx);

        let shared = Arc::clone(&self.state);
        std::thread::spawn(move || {
            match stop_rx.recv_timeout(delay) {
                Err(RecvTimeoutError::Timeout) => {}
                // Cancelled or superseded by a newer timer.
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
            }
            let mut state = shared
                .lock()
                .expect("thread holding throttler lock should not panic");
            if state.generation != generation {
                return;
            }
            let pending = state.pending_run.take();
            state.run_attempts = 0;
            state.delay = Duration::ZERO;
            state.timer_stop = None;
            drop(state);
            if let Some(run) = pending {
                run();
            }
        });
    }
}

// Uniformly random delay in [2^(attempt-1), 2^attempt) seconds, saturating at max_delay.
fn delay_for_attempt(attempt: u32, max_delay: Duration) -> Duration {
    if attempt >= Throttler::max_attempts(max_delay) {
        return max_delay;
    }
    let upper = 2f64.powi(attempt as i32);
    let sample = thread_rng().gen_range(upper / 2.0..upper);
    Duration::from_secs_f64(sample.min(max_delay.as_secs_f64()))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::{delay_for_attempt, Throttler, DEFAULT_MAX_DELAY};
    use crate::environment::{CapabilityProvider, EnvironmentReporter};

    struct DebugBuildProvider;
    impl CapabilityProvider for DebugBuildProvider {
        fn debug_build(&self) -> Option<bool> {
            Some(true)
        }
    }

    fn throttler() -> Throttler {
        Throttler::new(DEFAULT_MAX_DELAY, &EnvironmentReporter::default())
    }

    #[test]
    fn first_call_runs_synchronously() {
        let throttler = throttler();
        let runs = Arc::new(AtomicU32::new(0));

        let counter = runs.clone();
        throttler.run_throttled(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        throttler.cancel();
    }

    #[test]
    fn disabled_throttling_always_runs_immediately() {
        let environment = EnvironmentReporter::new(vec![Box::new(DebugBuildProvider)]);
        let throttler = Throttler::new(DEFAULT_MAX_DELAY, &environment);
        let runs = Arc::new(AtomicU32::new(0));

        for _ in 0..5 {
            let counter = runs.clone();
            throttler.run_throttled(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }

        assert_eq!(runs.load(Ordering::SeqCst), 5);
        // Disabled throttling accumulates no state.
        assert_eq!(throttler.run_attempts(), 0);
    }

    #[test]
    fn delays_grow_strictly_and_stay_capped() {
        let max_delay = Duration::from_secs(600);
        let mut previous = Duration::ZERO;
        for attempt in 1..Throttler::max_attempts(max_delay) {
            let delay = delay_for_attempt(attempt, max_delay);
            assert!(delay > previous, "attempt {attempt}: {delay:?} <= {previous:?}");
            assert!(delay <= max_delay);
            // The sampling ranges for consecutive attempts are disjoint, so any sample from the
            // next attempt beats any sample from this one.
            previous = Duration::from_secs_f64(2f64.powi(attempt as i32).min(max_delay.as_secs_f64()));
        }
        assert_eq!(
            delay_for_attempt(Throttler::max_attempts(max_delay), max_delay),
            max_delay
        );
        assert_eq!(delay_for_attempt(u32::MAX, max_delay), max_delay);
    }

    #[test]
    fn cancel_discards_the_pending_run() {
        let throttler = throttler();
        let runs = Arc::new(AtomicU32::new(0));

        throttler.run_throttled(Box::new(|| {}));
        let counter = runs.clone();
        throttler.run_throttled(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        throttler.cancel();
        // The zero-delay watchdog can beat the second call, making it run synchronously; all
        // that matters is that nothing fires after cancel.
        let runs_at_cancel = runs.load(Ordering::SeqCst);

        std::thread::sleep(Duration::from_millis(2_500));
        assert_eq!(runs.load(Ordering::SeqCst), runs_at_cancel);
        assert_eq!(throttler.run_attempts(), 0);
    }

    #[test]
    fn scheduled_runs_coalesce_to_the_most_recent() {
        let throttler = throttler();
        let last_run = Arc::new(AtomicU32::new(0));

        throttler.run_throttled(Box::new(|| {}));
        for id in 1..=3u32 {
            let last = last_run.clone();
            throttler.run_throttled(Box::new(move || {
                last.store(id, Ordering::SeqCst);
            }));
        }

        // Delays for attempts 1..=3 all fall below 8s; wait for the final run and the reset.
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while (last_run.load(Ordering::SeqCst) != 3 || throttler.run_attempts() != 0)
            && std::time::Instant::now() < deadline
        {
            std::thread::sleep(Duration::from_millis(50));
        }
        assert_eq!(last_run.load(Ordering::SeqCst), 3);
        assert_eq!(throttler.run_attempts(), 0);
    }
}
