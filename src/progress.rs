//! Progress events and throttling
//!
//! Downloaders and uploaders own a [`ProgressThrottle`] that sees every chunk
//! but only lets an event through on a time or percentage boundary, so the
//! chat message showing progress is edited a handful of times per transfer.

use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::config::{DOWNLOAD_PROGRESS_INTERVAL, UPLOAD_PROGRESS_INTERVAL, UPLOAD_PROGRESS_STEP};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Download,
    Upload,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Download => write!(f, "download"),
            Phase::Upload => write!(f, "upload"),
        }
    }
}

/// Progress event payload
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub phase: Phase,
    pub bytes_done: u64,
    /// 0 when the size is unknown
    pub bytes_total: u64,
    pub rate: f64, // bytes per second
}

impl ProgressEvent {
    /// Percent complete, `None` when the total is unknown
    pub fn percent(&self) -> Option<u32> {
        if self.bytes_total == 0 {
            return None;
        }
        Some(std::cmp::min(
            ((self.bytes_done as f64 / self.bytes_total as f64) * 100.0) as u32,
            100,
        ))
    }
}

/// Receives throttled progress events.
///
/// Implementations must not fail the transfer: a lost update is only logged.
pub trait ProgressSink: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Sink that drops every event
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RateMode {
    /// Bytes since the last tick over time since the last tick
    SinceLastTick,
    /// Bytes so far over time since the throttle started
    SinceStart,
}

/// Decides when a progress event is worth emitting
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    phase: Phase,
    total: u64,
    interval: Duration,
    percent_step: Option<u32>,
    rate_mode: RateMode,
    started: Instant,
    last_tick: Instant,
    last_bytes: u64,
    last_percent: u32,
}

impl ProgressThrottle {
    /// Download throttle: one event per interval, instantaneous rate
    pub fn download(total: u64) -> Self {
        Self::download_at(total, Instant::now())
    }

    pub fn download_at(total: u64, now: Instant) -> Self {
        Self {
            phase: Phase::Download,
            total,
            interval: DOWNLOAD_PROGRESS_INTERVAL,
            percent_step: None,
            rate_mode: RateMode::SinceLastTick,
            started: now,
            last_tick: now,
            last_bytes: 0,
            last_percent: 0,
        }
    }

    /// Upload throttle: an event per percent step or interval, whichever comes
    /// first; the rate is measured from the start of the upload only
    pub fn upload(total: u64) -> Self {
        Self::upload_at(total, Instant::now())
    }

    pub fn upload_at(total: u64, now: Instant) -> Self {
        Self {
            phase: Phase::Upload,
            total,
            interval: UPLOAD_PROGRESS_INTERVAL,
            percent_step: Some(UPLOAD_PROGRESS_STEP),
            rate_mode: RateMode::SinceStart,
            started: now,
            last_tick: now,
            last_bytes: 0,
            last_percent: 0,
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Record progress; returns an event when a boundary was crossed
    pub fn observe(&mut self, bytes_done: u64) -> Option<ProgressEvent> {
        self.observe_at(bytes_done, Instant::now())
    }

    pub fn observe_at(&mut self, bytes_done: u64, now: Instant) -> Option<ProgressEvent> {
        let elapsed = now.saturating_duration_since(self.last_tick);
        let percent = self.percent_of(bytes_done);

        let time_due = elapsed >= self.interval;
        let step_due = match (self.percent_step, percent) {
            (Some(step), Some(percent)) => percent.saturating_sub(self.last_percent) >= step,
            _ => false,
        };
        if !time_due && !step_due {
            return None;
        }
        Some(self.tick(bytes_done, now))
    }

    /// Final event, always emitted
    pub fn finish(&mut self, bytes_done: u64) -> ProgressEvent {
        self.finish_at(bytes_done, Instant::now())
    }

    pub fn finish_at(&mut self, bytes_done: u64, now: Instant) -> ProgressEvent {
        self.tick(bytes_done, now)
    }

    /// Average rate since the throttle started
    pub fn average_rate(&self, bytes_done: u64) -> f64 {
        self.average_rate_at(bytes_done, Instant::now())
    }

    pub fn average_rate_at(&self, bytes_done: u64, now: Instant) -> f64 {
        rate(bytes_done, now.saturating_duration_since(self.started))
    }

    fn tick(&mut self, bytes_done: u64, now: Instant) -> ProgressEvent {
        let rate = match self.rate_mode {
            RateMode::SinceLastTick => rate(
                bytes_done.saturating_sub(self.last_bytes),
                now.saturating_duration_since(self.last_tick),
            ),
            RateMode::SinceStart => rate(bytes_done, now.saturating_duration_since(self.started)),
        };

        self.last_tick = now;
        self.last_bytes = bytes_done;
        if let Some(percent) = self.percent_of(bytes_done) {
            self.last_percent = percent;
        }

        ProgressEvent {
            phase: self.phase,
            bytes_done,
            bytes_total: self.total,
            rate,
        }
    }

    fn percent_of(&self, bytes_done: u64) -> Option<u32> {
        ProgressEvent {
            phase: self.phase,
            bytes_done,
            bytes_total: self.total,
            rate: 0.0,
        }
        .percent()
    }
}

fn rate(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        bytes as f64 / secs
    } else {
        0.0
    }
}

/// A throttle bound to a sink, shareable with stream adapters
#[derive(Clone)]
pub struct ProgressReporter {
    throttle: Arc<Mutex<ProgressThrottle>>,
    sink: Arc<dyn ProgressSink>,
}

impl ProgressReporter {
    pub fn new(throttle: ProgressThrottle, sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            throttle: Arc::new(Mutex::new(throttle)),
            sink,
        }
    }

    /// Feed the running byte count; forwards the event if one is due
    pub fn advance(&self, bytes_done: u64) {
        let event = self
            .throttle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .observe(bytes_done);
        if let Some(event) = event {
            self.sink.report(event);
        }
    }

    /// Emit the final event and return it
    pub fn finish(&self, bytes_done: u64) -> ProgressEvent {
        let event = self
            .throttle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .finish(bytes_done);
        self.sink.report(event);
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn download_throttle_is_time_based() {
        let start = Instant::now();
        let mut throttle = ProgressThrottle::download_at(100 * MIB, start);

        // Plenty of bytes but no time elapsed: nothing
        assert!(throttle
            .observe_at(90 * MIB, start + Duration::from_millis(500))
            .is_none());

        let event = throttle
            .observe_at(90 * MIB, start + Duration::from_secs(3))
            .unwrap();
        assert_eq!(event.phase, Phase::Download);
        assert_eq!(event.percent(), Some(90));
        assert_eq!(event.rate, (90 * MIB) as f64 / 3.0);

        // Next rate only covers bytes since the previous tick
        let event = throttle
            .observe_at(96 * MIB, start + Duration::from_secs(6))
            .unwrap();
        assert_eq!(event.rate, (6 * MIB) as f64 / 3.0);
    }

    #[test]
    fn upload_throttle_emits_on_percent_step_or_interval() {
        let start = Instant::now();
        let mut throttle = ProgressThrottle::upload_at(1000, start);

        assert!(throttle
            .observe_at(50, start + Duration::from_millis(100))
            .is_none());
        let event = throttle
            .observe_at(100, start + Duration::from_millis(200))
            .unwrap();
        assert_eq!(event.percent(), Some(10));

        assert!(throttle
            .observe_at(150, start + Duration::from_millis(300))
            .is_none());
        let event = throttle
            .observe_at(160, start + Duration::from_millis(2300))
            .unwrap();
        assert_eq!(event.percent(), Some(16));
        // Rate since the upload started, not since the last tick
        assert!((event.rate - 160.0 / 2.3).abs() < 1e-6);
    }

    #[test]
    fn unknown_total_has_no_percent_but_still_ticks() {
        let start = Instant::now();
        let mut throttle = ProgressThrottle::upload_at(0, start);
        assert!(throttle.observe_at(10, start).is_none());
        let event = throttle
            .observe_at(10, start + Duration::from_secs(2))
            .unwrap();
        assert_eq!(event.percent(), None);
        assert_eq!(event.bytes_total, 0);
    }

    #[test]
    fn finish_always_emits() {
        let start = Instant::now();
        let mut throttle = ProgressThrottle::download_at(10, start);
        let event = throttle.finish_at(10, start);
        assert_eq!(event.percent(), Some(100));
        assert_eq!(event.rate, 0.0);
    }

    struct Collect(Mutex<Vec<ProgressEvent>>);

    impl ProgressSink for Collect {
        fn report(&self, event: ProgressEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    #[test]
    fn reporter_forwards_only_due_events() {
        let sink = Arc::new(Collect(Mutex::new(Vec::new())));
        let reporter = ProgressReporter::new(ProgressThrottle::upload(100), sink.clone());
        reporter.advance(1);
        reporter.advance(2);
        reporter.advance(50);
        reporter.finish(100);

        let events = sink.0.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].bytes_done, 50);
        assert_eq!(events[1].percent(), Some(100));
    }
}
