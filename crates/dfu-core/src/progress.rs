//! Transfer progress and speed figures.

use std::fmt;
use std::time::Instant;

/// One progress report, produced on every chunk boundary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSample {
    /// 1-based index of the part being uploaded.
    pub part: usize,
    pub total_parts: usize,
    /// Percent of the current part, 0-100.
    pub percent: u8,
    /// Bytes since the previous sample over the time since that sample.
    pub current_speed_bps: f64,
    /// Bytes since start over the time since start.
    pub avg_speed_bps: f64,
}

impl ProgressSample {
    pub fn current_speed_kbps(&self) -> f64 {
        self.current_speed_bps / 1024.0
    }

    pub fn avg_speed_kbps(&self) -> f64 {
        self.avg_speed_bps / 1024.0
    }
}

impl fmt::Display for ProgressSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Part: {}/{} Speed: {:.1} KB/s Average Speed: {:.1} KB/s",
            self.part,
            self.total_parts,
            self.current_speed_kbps(),
            self.avg_speed_kbps()
        )
    }
}

/// Turns byte counts into [`ProgressSample`]s.
///
/// Every method has an `_at` twin taking the current instant so tests can
/// drive the clock.
#[derive(Debug)]
pub struct ProgressTracker {
    total_parts: usize,
    part: usize,
    part_len: usize,
    part_sent: usize,
    started: Instant,
    total_sent: u64,
    last_at: Instant,
}

impl ProgressTracker {
    pub fn new(total_parts: usize) -> Self {
        Self::start_at(total_parts, Instant::now())
    }

    pub fn start_at(total_parts: usize, now: Instant) -> Self {
        Self {
            total_parts,
            part: 0,
            part_len: 0,
            part_sent: 0,
            started: now,
            total_sent: 0,
            last_at: now,
        }
    }

    /// Start counting a new part. `index` is 0-based.
    pub fn begin_part(&mut self, index: usize, len: usize) {
        self.part = index;
        self.part_len = len;
        self.part_sent = 0;
    }

    pub fn record(&mut self, bytes: usize) -> ProgressSample {
        self.record_at(bytes, Instant::now())
    }

    pub fn record_at(&mut self, bytes: usize, now: Instant) -> ProgressSample {
        self.part_sent = (self.part_sent + bytes).min(self.part_len);
        self.total_sent += bytes as u64;

        let current = rate(bytes as u64, now.saturating_duration_since(self.last_at).as_secs_f64());
        let average = rate(
            self.total_sent,
            now.saturating_duration_since(self.started).as_secs_f64(),
        );
        self.last_at = now;

        ProgressSample {
            part: self.part + 1,
            total_parts: self.total_parts,
            percent: self.percent(),
            current_speed_bps: current,
            avg_speed_bps: average,
        }
    }

    /// Restart the instantaneous baseline after a pause.
    pub fn resume(&mut self) {
        self.resume_at(Instant::now());
    }

    pub fn resume_at(&mut self, now: Instant) {
        self.last_at = now;
    }

    pub fn percent(&self) -> u8 {
        if self.part_len == 0 {
            100
        } else {
            ((self.part_sent * 100) / self.part_len) as u8
        }
    }

    pub fn total_sent(&self) -> u64 {
        self.total_sent
    }
}

fn rate(bytes: u64, secs: f64) -> f64 {
    if secs > 0.0 { bytes as f64 / secs } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_percent_per_part() {
        let t0 = Instant::now();
        let mut tracker = ProgressTracker::start_at(2, t0);

        tracker.begin_part(0, 100);
        let first: Vec<u8> = (0..5)
            .map(|_| tracker.record_at(20, t0).percent)
            .collect();
        assert_eq!(first, vec![20, 40, 60, 80, 100]);

        tracker.begin_part(1, 50);
        let second: Vec<_> = [20, 20, 10]
            .into_iter()
            .map(|n| tracker.record_at(n, t0))
            .collect();
        assert_eq!(
            second.iter().map(|s| s.percent).collect::<Vec<_>>(),
            vec![40, 80, 100]
        );
        assert!(second.iter().all(|s| s.part == 2 && s.total_parts == 2));
    }

    #[test]
    fn test_rates() {
        let t0 = Instant::now();
        let mut tracker = ProgressTracker::start_at(1, t0);
        tracker.begin_part(0, 4096);

        let s1 = tracker.record_at(1024, t0 + Duration::from_secs(1));
        assert_eq!(s1.current_speed_bps, 1024.0);
        assert_eq!(s1.avg_speed_bps, 1024.0);

        let s2 = tracker.record_at(2048, t0 + Duration::from_millis(1500));
        assert_eq!(s2.current_speed_bps, 4096.0);
        assert_eq!(s2.avg_speed_bps, 2048.0);
        assert_eq!(tracker.total_sent(), 3072);
    }

    #[test]
    fn test_zero_elapsed_reports_zero_rate() {
        let t0 = Instant::now();
        let mut tracker = ProgressTracker::start_at(1, t0);
        tracker.begin_part(0, 10);

        let sample = tracker.record_at(5, t0);
        assert_eq!(sample.current_speed_bps, 0.0);
        assert_eq!(sample.avg_speed_bps, 0.0);
    }

    #[test]
    fn test_resume_resets_instantaneous_baseline() {
        let t0 = Instant::now();
        let mut tracker = ProgressTracker::start_at(1, t0);
        tracker.begin_part(0, 4096);
        tracker.record_at(1024, t0 + Duration::from_secs(1));

        tracker.resume_at(t0 + Duration::from_secs(10));
        let sample = tracker.record_at(1024, t0 + Duration::from_secs(11));
        assert_eq!(sample.current_speed_bps, 1024.0);
    }

    #[test]
    fn test_display() {
        let sample = ProgressSample {
            part: 1,
            total_parts: 2,
            percent: 50,
            current_speed_bps: 2048.0,
            avg_speed_bps: 1536.0,
        };
        assert_eq!(
            sample.to_string(),
            "Part: 1/2 Speed: 2.0 KB/s Average Speed: 1.5 KB/s"
        );
    }
}
