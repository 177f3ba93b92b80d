use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Throughput and time left, derived from how much got done so far.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rate {
    pub per_sec: f64,
    pub eta: Duration,
}

/// `rate = completed / elapsed`, `eta = (total - completed) / rate`.
/// Both fall back to zero instead of dividing by zero.
pub fn report(completed: usize, total: usize, elapsed: Duration) -> Rate {
    let secs = elapsed.as_secs_f64();
    let per_sec = if secs > 0.0 {
        completed as f64 / secs
    } else {
        0.0
    };
    let remaining = total.saturating_sub(completed);
    let eta = if per_sec > 0.0 {
        Duration::from_secs((remaining as f64 / per_sec) as u64)
    } else {
        Duration::ZERO
    };
    Rate { per_sec, eta }
}

/// `H:MM:SS`, hours are not wrapped into days.
pub fn format_eta(eta: Duration) -> String {
    let secs = eta.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Rate: {:.2}/sec | ETA: {}",
            self.per_sec,
            format_eta(self.eta)
        )
    }
}

/// Completed counter shared by the workers. Only ever read for logging.
#[derive(Debug)]
pub struct Progress {
    total: usize,
    completed: AtomicUsize,
    started: Instant,
}

impl Progress {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            completed: AtomicUsize::new(0),
            started: Instant::now(),
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Returns the new completed count.
    pub fn mark_done(&self) -> usize {
        self.completed.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn rate(&self) -> Rate {
        report(self.completed(), self.total, self.elapsed())
    }

    pub fn log_claim(&self, index: usize, roll: &str) {
        tracing::info!(
            "[{}/{}] Fetching roll: {} | {}",
            index,
            self.total,
            roll,
            self.rate()
        );
    }

    pub fn log_summary(&self) {
        tracing::info!(
            "Processed {}/{} rolls in {} | {}",
            self.completed(),
            self.total,
            format_eta(self.elapsed()),
            self.rate()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_and_eta() {
        let rate = report(50, 150, Duration::from_secs(10));
        assert_eq!(rate.per_sec, 5.0);
        assert_eq!(rate.eta, Duration::from_secs(20));
        assert_eq!(rate.to_string(), "Rate: 5.00/sec | ETA: 0:00:20");
    }

    #[test]
    fn zero_elapsed_or_zero_done_gives_zero() {
        assert_eq!(
            report(10, 100, Duration::ZERO),
            Rate {
                per_sec: 0.0,
                eta: Duration::ZERO
            }
        );
        assert_eq!(report(0, 100, Duration::from_secs(3)).eta, Duration::ZERO);
    }

    #[test]
    fn eta_formatting() {
        assert_eq!(format_eta(Duration::from_secs(0)), "0:00:00");
        assert_eq!(format_eta(Duration::from_secs(3725)), "1:02:05");
        assert_eq!(format_eta(Duration::from_secs(90_000)), "25:00:00");
    }

    #[test]
    fn completed_counter_is_monotonic() {
        let progress = Progress::new(3);
        assert_eq!(progress.mark_done(), 1);
        assert_eq!(progress.mark_done(), 2);
        assert_eq!(progress.completed(), 2);
        assert_eq!(progress.total(), 3);
    }
}
