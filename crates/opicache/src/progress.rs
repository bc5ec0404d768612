use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::info;

const MIN_INTERVAL: Duration = Duration::from_millis(200);

/// Rate-limited progress logging shared by the workers of one fan-out.
///
/// Logs on every `every`-th completed item, at most once per 200 ms, plus once
/// when the last item completes.
pub struct Progress {
    label: &'static str,
    total: usize,
    every: usize,
    done: AtomicUsize,
    start: Instant,
    last: Mutex<Instant>,
}

impl Progress {
    pub fn new(label: &'static str, total: usize) -> Self {
        let now = Instant::now();
        Self {
            label,
            total,
            every: (total / 100).max(1),
            done: AtomicUsize::new(0),
            start: now,
            last: Mutex::new(now),
        }
    }

    #[inline]
    fn rate(&self, count: usize) -> f64 {
        count as f64 / self.start.elapsed().as_secs_f64().max(1e-9)
    }

    /// Records one completed item.
    pub fn tick(&self) {
        let count = self.done.fetch_add(1, Ordering::Relaxed) + 1;
        let last_item = count == self.total;
        if count % self.every != 0 && !last_item {
            return;
        }
        // Another worker is logging right now; skip.
        let Ok(mut last) = self.last.try_lock() else {
            return;
        };
        if last_item || last.elapsed() >= MIN_INTERVAL {
            *last = Instant::now();
            info!(
                "{}: {}/{} ({:.1}/s)",
                self.label,
                count,
                self.total,
                self.rate(count)
            );
        }
    }

    pub fn done(&self) -> usize {
        self.done.load(Ordering::Relaxed)
    }
}
