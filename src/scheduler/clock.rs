use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Roughly 30 years; stands in for a deadline that would overflow `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `period` from now, clamped to a far-future instant.
pub(super) fn instant_after(period: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(period).unwrap_or_else(|| now + FAR_FUTURE)
}

struct Window {
    started_at: Instant,
    length: Duration,
}

/// Reference clock of the current batching window.
///
/// Shared by the scheduler, which resets it whenever a batch is executed on
/// its own initiative, and the engine, which reports the time left as ETA.
pub struct BatchClock {
    window: Mutex<Window>,
}

impl BatchClock {
    pub fn new(length: Duration) -> Self {
        Self {
            window: Mutex::new(Window {
                started_at: Instant::now(),
                length,
            }),
        }
    }

    fn window(&self) -> MutexGuard<'_, Window> {
        self.window.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start a new window now.
    pub fn reset(&self) {
        self.window().started_at = Instant::now();
    }

    /// Change the window length and start a new window.
    pub fn reconfigure(&self, length: Duration) {
        let mut window = self.window();
        window.length = length;
        window.started_at = Instant::now();
    }

    pub fn length(&self) -> Duration {
        self.window().length
    }

    /// Instant at which the current window ends.
    pub fn deadline(&self) -> Instant {
        let window = self.window();
        window
            .started_at
            .checked_add(window.length)
            .unwrap_or_else(|| window.started_at + FAR_FUTURE)
    }

    /// Whole seconds until the window ends, rounded to nearest.
    ///
    /// Goes negative when an execution is overdue.
    pub fn time_left_secs(&self) -> i64 {
        let window = self.window();
        let elapsed_ms = window.started_at.elapsed().as_millis() as i64;
        let left_ms = window.length.as_millis() as i64 - elapsed_ms;
        (left_ms as f64 / 1000.0).round() as i64
    }
}
