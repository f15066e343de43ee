//! Readiness detection through a marker file
//!
//! The agent signals that it finished initializing by creating a file whose path
//! it receives on the command line. [`ReadinessMonitor::wait`] polls for that file
//! while racing an abort future (process exit, fatal output); whichever finishes
//! first decides the single outcome.

use crate::config::ReadinessConfig;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

/// How a readiness wait ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessOutcome<T> {
    /// The marker appeared
    Ready { elapsed: Duration },
    /// The abort future completed first
    Aborted(T),
    /// The attempt ceiling was reached
    TimedOut { elapsed: Duration },
}

/// Polls for the readiness marker
#[derive(Debug, Clone)]
pub struct ReadinessMonitor {
    marker: PathBuf,
    poll_interval: Duration,
    max_attempts: u32,
}

impl ReadinessMonitor {
    pub fn new(marker: impl Into<PathBuf>, poll_interval: Duration, max_attempts: u32) -> Self {
        Self {
            marker: marker.into(),
            poll_interval,
            max_attempts,
        }
    }

    pub fn from_config(config: &ReadinessConfig) -> Self {
        Self::new(&config.marker_path, config.poll_interval, config.max_attempts)
    }

    pub fn marker(&self) -> &Path {
        &self.marker
    }

    /// Remove a marker left behind by an earlier run.
    ///
    /// Returns whether a file was removed.
    pub async fn clear_stale_marker(&self) -> std::io::Result<bool> {
        match tokio::fs::remove_file(&self.marker).await {
            Ok(()) => {
                info!(path = %self.marker.display(), "Readiness marker already existed, removed it");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Wait for the marker, giving up when `abort` completes or the poll count
    /// exceeds `max_attempts`.
    ///
    /// The first poll happens immediately. `abort` is checked before every poll so
    /// an abort that is already complete always wins over a marker that shows up
    /// in the same tick.
    pub async fn wait<F>(&self, abort: F) -> ReadinessOutcome<F::Output>
    where
        F: Future,
    {
        let started = Instant::now();
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(abort);

        let mut attempts: u32 = 0;
        loop {
            tokio::select! {
                biased;
                reason = &mut abort => return ReadinessOutcome::Aborted(reason),
                _ = ticker.tick() => {
                    if tokio::fs::try_exists(&self.marker).await.unwrap_or(false) {
                        let elapsed = truncate_millis(started.elapsed());
                        debug!(path = %self.marker.display(), ?elapsed, "Readiness marker found");
                        return ReadinessOutcome::Ready { elapsed };
                    }
                    attempts += 1;
                    if attempts > self.max_attempts {
                        return ReadinessOutcome::TimedOut {
                            elapsed: truncate_millis(started.elapsed()),
                        };
                    }
                }
            }
        }
    }
}

fn truncate_millis(d: Duration) -> Duration {
    Duration::from_millis(d.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::pending;

    fn monitor(dir: &Path, attempts: u32) -> ReadinessMonitor {
        ReadinessMonitor::new(dir.join("agent.ready"), Duration::from_millis(10), attempts)
    }

    #[tokio::test]
    async fn clears_stale_marker() {
        let dir = tempfile::TempDir::new().unwrap();
        let monitor = monitor(dir.path(), 3);
        std::fs::write(monitor.marker(), "").unwrap();

        assert!(monitor.clear_stale_marker().await.unwrap());
        assert!(!monitor.marker().exists());
        assert!(!monitor.clear_stale_marker().await.unwrap());
    }

    #[tokio::test]
    async fn ready_when_marker_appears() {
        let dir = tempfile::TempDir::new().unwrap();
        let monitor = monitor(dir.path(), 200);
        let marker = monitor.marker().to_path_buf();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            tokio::fs::write(marker, "").await.unwrap();
        });

        let outcome = monitor.wait(pending::<()>()).await;
        assert!(matches!(outcome, ReadinessOutcome::Ready { .. }));
    }

    #[tokio::test]
    async fn times_out_after_max_attempts() {
        let dir = tempfile::TempDir::new().unwrap();
        let outcome = monitor(dir.path(), 3).wait(pending::<()>()).await;
        match outcome {
            ReadinessOutcome::TimedOut { elapsed } => {
                assert!(elapsed >= Duration::from_millis(20), "{elapsed:?}")
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn abort_wins_over_polling() {
        let dir = tempfile::TempDir::new().unwrap();
        let abort = async {
            tokio::time::sleep(Duration::from_millis(25)).await;
            7
        };
        let outcome = monitor(dir.path(), 1_000).wait(abort).await;
        assert_eq!(outcome, ReadinessOutcome::Aborted(7));
    }

    #[tokio::test]
    async fn completed_abort_beats_existing_marker() {
        let dir = tempfile::TempDir::new().unwrap();
        let monitor = monitor(dir.path(), 5);
        std::fs::write(monitor.marker(), "").unwrap();

        let outcome = monitor.wait(std::future::ready("exited")).await;
        assert_eq!(outcome, ReadinessOutcome::Aborted("exited"));
    }
}
