use std::{fmt, time::Duration};

/// Snapshot taken at a mini-batch boundary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub rows_done: usize,
    pub rows_total: usize,
    pub elapsed: Duration,
}

impl Progress {
    pub fn rows_remaining(&self) -> usize {
        self.rows_total.saturating_sub(self.rows_done)
    }

    pub fn percent(&self) -> f64 {
        if self.rows_total == 0 {
            return 100.0;
        }
        self.rows_done as f64 / self.rows_total as f64 * 100.0
    }

    /// Estimated time to finish, from the average time per row so far.
    pub fn eta(&self) -> Duration {
        if self.rows_done == 0 {
            return Duration::ZERO;
        }
        let per_row = self.elapsed.as_secs_f64() / self.rows_done as f64;
        Duration::from_secs_f64(per_row * self.rows_remaining() as f64)
    }

    /// `~N sec` under 90 seconds, `~N min` beyond.
    pub fn eta_display(&self) -> String {
        let secs = self.eta().as_secs_f64();
        if secs < 90.0 {
            format!("~{secs:.0} sec")
        } else {
            format!("~{:.0} min", secs / 60.0)
        }
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Query {:5} / {:5} ({:3.0}%) Time Remaining: {}...",
            self.rows_done,
            self.rows_total,
            self.percent(),
            self.eta_display()
        )
    }
}

/// Called at each mini-batch boundary after the first.
///
/// Observers only watch; they cannot influence dispatch or results.
pub trait ProgressObserver {
    fn on_batch(&mut self, progress: &Progress);
}

impl<F: FnMut(&Progress)> ProgressObserver for F {
    fn on_batch(&mut self, progress: &Progress) {
        self(progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(done: usize, total: usize, secs: u64) -> Progress {
        Progress {
            rows_done: done,
            rows_total: total,
            elapsed: Duration::from_secs(secs),
        }
    }

    #[test]
    fn eta_scales_with_remaining_rows() {
        let p = progress(1000, 3000, 10);
        assert_eq!(p.eta(), Duration::from_secs(20));
        assert_eq!(p.eta_display(), "~20 sec");
    }

    #[test]
    fn long_eta_is_in_minutes() {
        let p = progress(100, 1000, 60);
        assert_eq!(p.eta(), Duration::from_secs(540));
        assert_eq!(p.eta_display(), "~9 min");
    }

    #[test]
    fn display_shows_counts() {
        let line = progress(1024, 2500, 1).to_string();
        assert!(line.starts_with("Query  1024 /  2500 ( 41%)"));
    }
}
