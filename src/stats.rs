//! Timing helpers for the bench binary. Not part of the ring protocol.

use std::io::{self, BufWriter, Write};
use std::path::Path;

/// Current `CLOCK_MONOTONIC` time in nanoseconds.
#[inline(never)]
pub fn mono_time_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// Latency sample collector with percentile reporting.
#[derive(Debug, Default)]
pub struct Samples {
    values: Vec<u64>,
}

impl Samples {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            values: Vec::with_capacity(capacity),
        }
    }

    #[inline(always)]
    pub fn record(&mut self, value: u64) {
        self.values.push(value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Sorts the samples and returns the value at quantile `q` in `0..=1`.
    ///
    /// # Panics
    ///
    /// Panics on an empty collector or a quantile outside `0..=1`.
    pub fn quantile(&mut self, q: f64) -> u64 {
        assert!(!self.values.is_empty());
        assert!((0.0..=1.0).contains(&q));
        self.values.sort_unstable();
        self.at(q)
    }

    /// One-line percentile summary, ready for printing.
    pub fn report(&mut self, label: &str) -> String {
        assert!(!self.values.is_empty());
        self.values.sort_unstable();
        format!(
            "{label}: n={} min={} p50={} p90={} p99={} p99.9={} max={}",
            self.values.len(),
            self.at(0.0),
            self.at(0.5),
            self.at(0.9),
            self.at(0.99),
            self.at(0.999),
            self.at(1.0),
        )
    }

    fn at(&self, q: f64) -> u64 {
        let idx = ((self.values.len() - 1) as f64 * q).round() as usize;
        self.values[idx]
    }
}

/// Writes paired push/pop timestamps as CSV for offline lag analysis.
pub fn dump_lag_csv(path: &Path, pushed_ns: &[u64], popped_ns: &[u64]) -> io::Result<()> {
    let mut out = BufWriter::new(std::fs::File::create(path)?);
    writeln!(out, "push,pop")?;
    for (push, pop) in pushed_ns.iter().zip(popped_ns) {
        writeln!(out, "{push},{pop}")?;
    }
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mono_time_moves_forward() {
        let t1 = mono_time_ns();
        let t2 = mono_time_ns();
        assert!(t1 > 0);
        assert!(t2 >= t1);
    }

    #[test]
    fn quantiles_hit_known_positions() {
        let mut samples = Samples::with_capacity(5);
        for v in [5u64, 1, 9, 3, 7] {
            samples.record(v);
        }
        assert_eq!(samples.len(), 5);
        assert_eq!(samples.quantile(0.0), 1);
        assert_eq!(samples.quantile(0.5), 5);
        assert_eq!(samples.quantile(1.0), 9);
    }

    #[test]
    #[should_panic]
    fn quantile_rejects_empty() {
        let mut samples = Samples::default();
        let _ = samples.quantile(0.5);
    }

    #[test]
    fn report_mentions_every_field() {
        let mut samples = Samples::with_capacity(3);
        samples.record(10);
        samples.record(20);
        samples.record(30);
        let line = samples.report("lat");
        assert!(line.starts_with("lat: n=3"));
        assert!(line.contains("min=10"));
        assert!(line.contains("max=30"));
    }

    #[test]
    fn lag_csv_round_trip() {
        let path = std::env::temp_dir().join(format!("ringcast-lag-{}.csv", std::process::id()));
        dump_lag_csv(&path, &[1, 2, 3], &[4, 5, 6]).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "push,pop\n1,4\n2,5\n3,6\n");
        let _ = std::fs::remove_file(&path);
    }
}
