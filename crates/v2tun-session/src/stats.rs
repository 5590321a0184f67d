//! Periodic status reporting
//!
//! While the session is connected, a reporter thread publishes a
//! [`StatusReport`] every interval: elapsed time, transfer speeds and
//! totals. It reads the state cell and the engine counters; it never
//! changes either.

use crate::message::{SessionEvent, SessionState, StateCell};
use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::debug;

/// Cumulative engine byte counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficCounters {
    pub uplink: u64,
    pub downlink: u64,
}

/// One status sample
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    /// Time since the session connected, `HH:MM:SS`
    pub duration: String,
    /// Bytes per second
    pub upload_speed: u64,
    pub download_speed: u64,
    pub total_upload: u64,
    pub total_download: u64,
    pub state: SessionState,
}

/// `HH:MM:SS`; hours keep growing past 99.
pub fn format_duration(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// Turns successive counter readings into reports.
#[derive(Debug, Clone)]
pub struct SpeedMeter {
    started: Instant,
    last: TrafficCounters,
    last_at: Instant,
}

impl SpeedMeter {
    pub fn new(started: Instant, baseline: TrafficCounters) -> Self {
        Self {
            started,
            last: baseline,
            last_at: started,
        }
    }

    pub fn sample(&mut self, now: Instant, counters: TrafficCounters, state: SessionState) -> StatusReport {
        let span_ms = now.saturating_duration_since(self.last_at).as_millis().max(1) as u64;
        // Counters restart with the engine
        let delta = |now: u64, before: u64| now.saturating_sub(before);
        let per_sec = |bytes: u64| bytes.saturating_mul(1000) / span_ms;

        let report = StatusReport {
            duration: format_duration(now.saturating_duration_since(self.started)),
            upload_speed: per_sec(delta(counters.uplink, self.last.uplink)),
            download_speed: per_sec(delta(counters.downlink, self.last.downlink)),
            total_upload: counters.uplink,
            total_download: counters.downlink,
            state,
        };

        self.last = counters;
        self.last_at = now;
        report
    }
}

/// Source of traffic counters
pub type TrafficSource = Arc<dyn Fn() -> TrafficCounters + Send + Sync>;

/// Background thread emitting [`SessionEvent::Status`].
pub struct StatsReporter {
    stop: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl StatsReporter {
    pub fn spawn(
        interval: Duration,
        state: StateCell,
        traffic: TrafficSource,
        events: Sender<SessionEvent>,
    ) -> std::io::Result<Self> {
        let (stop, stop_rx) = bounded::<()>(1);

        let handle = thread::Builder::new()
            .name("session-stats".to_string())
            .spawn(move || {
                let mut meter = SpeedMeter::new(Instant::now(), traffic());
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        _ => break,
                    }
                    let current = state.get();
                    if !current.is_connected() {
                        continue;
                    }
                    let report = meter.sample(Instant::now(), traffic(), current);
                    if events.send(SessionEvent::Status(report)).is_err() {
                        break;
                    }
                }
                debug!("stats reporter stopped");
            })?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.stop.try_send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StatsReporter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::ZERO), "00:00:00");
        assert_eq!(format_duration(Duration::from_secs(3_723)), "01:02:03");
        assert_eq!(format_duration(Duration::from_secs(360_000)), "100:00:00");
    }

    #[test]
    fn test_speed_meter() {
        let t0 = Instant::now();
        let mut meter = SpeedMeter::new(t0, TrafficCounters::default());

        let report = meter.sample(
            t0 + Duration::from_secs(2),
            TrafficCounters { uplink: 2_000, downlink: 10_000 },
            SessionState::Connected,
        );
        assert_eq!(report.duration, "00:00:02");
        assert_eq!(report.upload_speed, 1_000);
        assert_eq!(report.download_speed, 5_000);
        assert_eq!(report.total_download, 10_000);

        // Engine restarted: counters went backwards
        let report = meter.sample(
            t0 + Duration::from_secs(3),
            TrafficCounters { uplink: 100, downlink: 0 },
            SessionState::Connected,
        );
        assert_eq!(report.upload_speed, 0);
        assert_eq!(report.total_upload, 100);
    }

    #[test]
    fn test_reporter_only_reports_when_connected() {
        let state = StateCell::new(SessionState::Connecting);
        let counter = Arc::new(Mutex::new(0u64));
        let source = counter.clone();
        let traffic: TrafficSource = Arc::new(move || {
            let mut bytes = source.lock().unwrap();
            *bytes += 100;
            TrafficCounters { uplink: *bytes, downlink: *bytes * 2 }
        });
        let (tx, rx) = crossbeam_channel::unbounded();

        let reporter = StatsReporter::spawn(Duration::from_millis(20), state.clone(), traffic, tx).unwrap();
        thread::sleep(Duration::from_millis(100));
        assert!(rx.try_recv().is_err());

        state.set(SessionState::Connected);
        let event = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        match event {
            SessionEvent::Status(report) => {
                assert_eq!(report.state, SessionState::Connected);
                assert!(report.total_download > 0);
            }
            other => panic!("unexpected event {:?}", other),
        }

        reporter.stop();
        while rx.try_recv().is_ok() {}
        thread::sleep(Duration::from_millis(60));
        assert!(rx.try_recv().is_err());
    }
}
