//!
//! Loop pacing and timers.
//!
//! A [`Rate`] paces a loop on the caller's thread.  A [`Timer`] schedules a
//! callback that runs from [`RosNode::spin_once`](crate::RosNode::spin_once),
//! the same way subscriber callbacks do.
//!

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread,
    time::Duration,
};

use quanta::{Clock, Instant};
use tracing::warn;

/// Keeps a loop running at a fixed frequency
pub struct Rate {
    clock: Clock,
    period: Duration,
    last: Instant,
}

impl Rate {
    /// A rate of one iteration every `period`, measured with `clock`
    pub(crate) fn with_clock(clock: Clock, period: Duration) -> Self {
        let last = clock.now();
        Self {
            clock,
            period,
            last,
        }
    }

    /// A rate of `hz` iterations per second.
    ///
    /// Returns `None` unless `hz` is finite and positive.
    pub fn new(hz: f64) -> Option<Self> {
        period_of(hz).map(|period| Self::with_clock(Clock::new(), period))
    }

    /// The time between two iterations
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Sleep out the rest of the current period.
    ///
    /// An iteration that overran its period does not sleep, and the next
    /// period starts now instead of trying to catch up.
    pub fn sleep(&mut self) {
        let now = self.clock.now();
        if self.last > now {
            self.last = now;
        }
        let elapsed = now.saturating_duration_since(self.last);
        if elapsed > self.period {
            self.last = now;
        } else {
            thread::sleep(self.period - elapsed);
            self.last += self.period;
        }
    }
}

/// The period of `hz`, if it is a usable frequency
pub(crate) fn period_of(hz: f64) -> Option<Duration> {
    if !hz.is_finite() || hz <= 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(1.0 / hz)
        .ok()
        .filter(|period| !period.is_zero())
}

/// What a timer callback is told about the current and previous firing
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerEvent {
    /// When the previous firing was scheduled
    pub last_expected: Option<Instant>,
    /// When the previous firing actually happened
    pub last_real: Option<Instant>,
    /// When this firing was scheduled
    pub current_expected: Instant,
    /// When this firing actually happened
    pub current_real: Instant,
    /// How long the previous callback ran
    pub last_duration: Option<Duration>,
}

/// A callback run whenever its timer fires
pub type TimerCallback = Box<dyn FnMut(&TimerEvent) + Send>;

/// A handle to a periodic or one-shot timer.
///
/// Dropping the handle leaves the timer running; [`Timer::shutdown`] stops it.
#[derive(Clone, Debug)]
pub struct Timer {
    period: Duration,
    oneshot: bool,
    active: Arc<AtomicBool>,
}

impl Timer {
    /// The time between two firings
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Whether the timer fires only once
    pub fn is_oneshot(&self) -> bool {
        self.oneshot
    }

    /// Whether the timer will fire again
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Stop the timer.  A callback already running finishes.
    pub fn shutdown(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

struct Scheduled {
    timer: Timer,
    next: Instant,
    last_expected: Option<Instant>,
    last_real: Option<Instant>,
    last_duration: Option<Duration>,
    callback: TimerCallback,
}

/// Every timer of a node
pub(crate) struct TimerQueue {
    clock: Clock,
    scheduled: Mutex<Vec<Scheduled>>,
}

impl TimerQueue {
    pub(crate) fn new(clock: Clock) -> Self {
        Self {
            clock,
            scheduled: Mutex::new(Vec::new()),
        }
    }

    fn scheduled(&self) -> MutexGuard<'_, Vec<Scheduled>> {
        self.scheduled.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Schedule `callback` to fire `period` from now
    pub(crate) fn add(&self, period: Duration, oneshot: bool, callback: TimerCallback) -> Timer {
        let timer = Timer {
            period,
            oneshot,
            active: Arc::new(AtomicBool::new(true)),
        };
        self.scheduled().push(Scheduled {
            timer: timer.clone(),
            next: self.clock.now() + period,
            last_expected: None,
            last_real: None,
            last_duration: None,
            callback,
        });
        timer
    }

    /// Run the callback of every timer that is due.
    ///
    /// Returns the number of callbacks run.
    pub(crate) fn fire_due(&self) -> usize {
        // callbacks may create timers, so none run under the lock
        let mut scheduled = std::mem::take(&mut *self.scheduled());
        let mut fired = 0;

        for entry in scheduled.iter_mut() {
            let now = self.clock.now();
            if !entry.timer.is_active() || now < entry.next {
                continue;
            }

            let event = TimerEvent {
                last_expected: entry.last_expected,
                last_real: entry.last_real,
                current_expected: entry.next,
                current_real: now,
                last_duration: entry.last_duration,
            };
            let callback = &mut entry.callback;
            if panic::catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                warn!(period = ?entry.timer.period, "timer callback panicked");
            }
            fired += 1;

            entry.last_duration = Some(self.clock.now().saturating_duration_since(now));
            entry.last_expected = Some(event.current_expected);
            entry.last_real = Some(now);
            if entry.timer.oneshot {
                entry.timer.shutdown();
            } else {
                while entry.next <= now {
                    entry.next += entry.timer.period;
                }
            }
        }

        scheduled.retain(|entry| entry.timer.is_active());
        let mut guard = self.scheduled();
        let added = std::mem::replace(&mut *guard, scheduled);
        guard.extend(added);
        fired
    }

    /// Stop and forget every timer
    pub(crate) fn shutdown(&self) {
        for entry in self.scheduled().drain(..) {
            entry.timer.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Instant as StdInstant;

    fn recording(events: Arc<Mutex<Vec<TimerEvent>>>) -> TimerCallback {
        Box::new(move |event: &TimerEvent| events.lock().unwrap().push(*event))
    }

    #[test]
    fn test_period_of() {
        assert_eq!(period_of(10.0), Some(Duration::from_millis(100)));
        assert_eq!(period_of(0.5), Some(Duration::from_secs(2)));
        assert_eq!(period_of(0.0), None);
        assert_eq!(period_of(-1.0), None);
        assert_eq!(period_of(f64::NAN), None);
        assert_eq!(period_of(f64::INFINITY), None);
    }

    #[test]
    fn test_rate_paces_iterations() {
        let mut rate = Rate::new(100.0).unwrap();
        let start = StdInstant::now();
        for _ in 0..5 {
            rate.sleep();
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(45), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(1), "{elapsed:?}");
    }

    #[test]
    fn test_rate_does_not_sleep_after_overrun() {
        let (clock, mock) = Clock::mock();
        let mut rate = Rate::with_clock(clock, Duration::from_secs(5));

        mock.increment(Duration::from_secs(6));
        let start = StdInstant::now();
        rate.sleep();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_periodic_timer_fires_once_per_period() {
        let (clock, mock) = Clock::mock();
        let timers = TimerQueue::new(clock.clone());
        let events = Arc::new(Mutex::new(Vec::new()));
        let start = clock.now();
        let timer = timers.add(Duration::from_secs(1), false, recording(events.clone()));

        assert_eq!(timers.fire_due(), 0);
        mock.increment(Duration::from_millis(1200));
        assert_eq!(timers.fire_due(), 1);
        assert_eq!(timers.fire_due(), 0);
        mock.increment(Duration::from_secs(1));
        assert_eq!(timers.fire_due(), 1);

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].last_expected, None);
        assert_eq!(events[0].current_expected, start + Duration::from_secs(1));
        assert_eq!(events[0].current_real, start + Duration::from_millis(1200));
        assert_eq!(events[1].last_expected, Some(events[0].current_expected));
        assert_eq!(events[1].last_real, Some(events[0].current_real));
        assert_eq!(events[1].current_expected, start + Duration::from_secs(2));
        assert!(events[1].last_duration.is_some());
        assert!(timer.is_active());
    }

    #[test]
    fn test_late_timer_skips_missed_periods() {
        let (clock, mock) = Clock::mock();
        let timers = TimerQueue::new(clock.clone());
        let events = Arc::new(Mutex::new(Vec::new()));
        let start = clock.now();
        timers.add(Duration::from_secs(1), false, recording(events.clone()));

        mock.increment(Duration::from_millis(3500));
        assert_eq!(timers.fire_due(), 1);
        assert_eq!(timers.fire_due(), 0);
        mock.increment(Duration::from_millis(500));
        assert_eq!(timers.fire_due(), 1);
        assert_eq!(
            events.lock().unwrap()[1].current_expected,
            start + Duration::from_secs(4)
        );
    }

    #[test]
    fn test_oneshot_timer_fires_once() {
        let (clock, mock) = Clock::mock();
        let timers = TimerQueue::new(clock);
        let events = Arc::new(Mutex::new(Vec::new()));
        let timer = timers.add(Duration::from_millis(10), true, recording(events.clone()));
        assert!(timer.is_oneshot());

        mock.increment(Duration::from_millis(10));
        assert_eq!(timers.fire_due(), 1);
        mock.increment(Duration::from_secs(1));
        assert_eq!(timers.fire_due(), 0);
        assert!(!timer.is_active());
        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_shutdown_timer_never_fires() {
        let (clock, mock) = Clock::mock();
        let timers = TimerQueue::new(clock);
        let events = Arc::new(Mutex::new(Vec::new()));
        let timer = timers.add(Duration::from_millis(10), false, recording(events.clone()));

        timer.shutdown();
        mock.increment(Duration::from_secs(1));
        assert_eq!(timers.fire_due(), 0);
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_callbacks_may_schedule_and_stop_timers() {
        let (clock, mock) = Clock::mock();
        let timers = Arc::new(TimerQueue::new(clock));
        let nested = Arc::new(Mutex::new(Vec::new()));

        let slot: Arc<Mutex<Option<Timer>>> = Arc::new(Mutex::new(None));
        let callback = {
            let timers = timers.clone();
            let nested = nested.clone();
            let slot = slot.clone();
            Box::new(move |_: &TimerEvent| {
                timers.add(Duration::from_millis(10), true, recording(nested.clone()));
                if let Some(timer) = slot.lock().unwrap().as_ref() {
                    timer.shutdown();
                }
            })
        };
        let timer = timers.add(Duration::from_millis(10), false, callback);
        *slot.lock().unwrap() = Some(timer.clone());

        mock.increment(Duration::from_millis(10));
        assert_eq!(timers.fire_due(), 1);
        assert!(!timer.is_active());

        mock.increment(Duration::from_millis(10));
        assert_eq!(timers.fire_due(), 1);
        assert_eq!(nested.lock().unwrap().len(), 1);
        assert_eq!(timers.fire_due(), 0);
    }

    #[test]
    fn test_panicking_callback_keeps_timer() {
        let (clock, mock) = Clock::mock();
        let timers = TimerQueue::new(clock);
        let timer = timers.add(
            Duration::from_millis(10),
            false,
            Box::new(|_: &TimerEvent| panic!("timer failure")),
        );

        mock.increment(Duration::from_millis(10));
        assert_eq!(timers.fire_due(), 1);
        assert!(timer.is_active());
        mock.increment(Duration::from_millis(10));
        assert_eq!(timers.fire_due(), 1);
    }

    #[test]
    fn test_queue_shutdown_stops_every_timer() {
        let (clock, mock) = Clock::mock();
        let timers = TimerQueue::new(clock);
        let first = timers.add(Duration::from_millis(10), false, Box::new(|_: &TimerEvent| {}));
        let second = timers.add(Duration::from_millis(10), true, Box::new(|_: &TimerEvent| {}));

        timers.shutdown();
        mock.increment(Duration::from_secs(1));
        assert_eq!(timers.fire_due(), 0);
        assert!(!first.is_active() && !second.is_active());
    }
}
