use std::time::{Duration, Instant};

use data_model::StatsSample;
use parking_lot::Mutex;

pub const STATS_WINDOW: Duration = Duration::from_secs(30);

struct Window {
    last: StatsSample,
    current: StatsSample,
    started: Option<Instant>,
}

/// Rolling statistics over the current window plus the previous one, so a
/// freshly rotated window still reports recent history.
pub struct StatsHolder {
    window: Duration,
    inner: Mutex<Window>,
}

impl Default for StatsHolder {
    fn default() -> Self {
        Self::new(STATS_WINDOW)
    }
}

impl StatsHolder {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            inner: Mutex::new(Window {
                last: StatsSample::default(),
                current: StatsSample::default(),
                started: None,
            }),
        }
    }

    pub fn add(&self, sample: StatsSample) {
        self.add_at(sample, Instant::now());
    }

    fn add_at(&self, sample: StatsSample, now: Instant) {
        let mut inner = self.inner.lock();
        let expired = inner
            .started
            .is_none_or(|started| now.duration_since(started) > self.window);
        if expired {
            inner.last = inner.current;
            inner.current = sample;
            inner.started = Some(now);
            return;
        }
        inner.current = inner.current.add(&sample);
    }

    pub fn get(&self) -> StatsSample {
        let inner = self.inner.lock();
        inner.last.add(&inner.current)
    }
}
