//! Queue-depth health signal.

use std::fmt;

use serde::Serialize;
use tracing::{debug, warn};

use crate::message::OutboxStatus;
use crate::store::OutboxStore;

/// Overall outbox health, worst first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    /// Failed or dead messages exceed the error threshold, or counts are
    /// unavailable.
    ///
    /// Messages waiting for a retry sit in `FAILED`, not `PENDING`, so a
    /// burst of retryable failures counts toward `DOWN` rather than
    /// `OUT_OF_SERVICE`.
    Down,
    /// The pending backlog exceeds the error threshold.
    OutOfService,
    /// A count exceeds the warning threshold.
    Degraded,
    Up,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HealthStatus::Down => "DOWN",
            HealthStatus::OutOfService => "OUT_OF_SERVICE",
            HealthStatus::Degraded => "DEGRADED",
            HealthStatus::Up => "UP",
        })
    }
}

/// Count thresholds for [`HealthAggregator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthThresholds {
    /// Default: 1000.
    pub warning_threshold: i64,
    /// Default: 100.
    pub error_threshold: i64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            warning_threshold: 1000,
            error_threshold: 100,
        }
    }
}

impl HealthThresholds {
    /// Replace negative thresholds with their defaults.
    pub fn normalized(self) -> Self {
        let defaults = Self::default();
        let mut thresholds = self;

        if thresholds.warning_threshold < 0 {
            warn!(
                value = thresholds.warning_threshold,
                "health warning_threshold is negative, using {}", defaults.warning_threshold
            );
            thresholds.warning_threshold = defaults.warning_threshold;
        }
        if thresholds.error_threshold < 0 {
            warn!(
                value = thresholds.error_threshold,
                "health error_threshold is negative, using {}", defaults.error_threshold
            );
            thresholds.error_threshold = defaults.error_threshold;
        }

        thresholds
    }
}

/// Per-status message counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: i64,
    pub processing: i64,
    pub published: i64,
    pub failed: i64,
    pub dead: i64,
}

impl StatusCounts {
    pub fn get(&self, status: OutboxStatus) -> i64 {
        match status {
            OutboxStatus::Pending => self.pending,
            OutboxStatus::Processing => self.processing,
            OutboxStatus::Published => self.published,
            OutboxStatus::Failed => self.failed,
            OutboxStatus::Dead => self.dead,
        }
    }

    fn set(&mut self, status: OutboxStatus, count: i64) {
        let slot = match status {
            OutboxStatus::Pending => &mut self.pending,
            OutboxStatus::Processing => &mut self.processing,
            OutboxStatus::Published => &mut self.published,
            OutboxStatus::Failed => &mut self.failed,
            OutboxStatus::Dead => &mut self.dead,
        };
        *slot = count;
    }

    /// Messages whose last attempt failed: `failed + dead`.
    pub fn failing(&self) -> i64 {
        self.failed.saturating_add(self.dead)
    }

    /// Classify these counts.
    ///
    /// Checked in order: `DOWN` when `failing() > error_threshold`,
    /// `OUT_OF_SERVICE` when `pending > error_threshold`, `DEGRADED` when
    /// either exceeds `warning_threshold`, else `UP`.
    pub fn evaluate(&self, thresholds: &HealthThresholds) -> HealthStatus {
        if self.failing() > thresholds.error_threshold {
            HealthStatus::Down
        } else if self.pending > thresholds.error_threshold {
            HealthStatus::OutOfService
        } else if self.pending > thresholds.warning_threshold
            || self.failing() > thresholds.warning_threshold
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Up
        }
    }
}

/// Result of a health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    /// Counts, absent when the store could not be read.
    pub counts: Option<StatusCounts>,
    /// Why the counts could not be read.
    pub error: Option<String>,
}

/// Derives a [`HealthReport`] from store counts.
#[derive(Debug, Clone)]
pub struct HealthAggregator<S> {
    store: S,
    thresholds: HealthThresholds,
}

impl<S> HealthAggregator<S>
where
    S: OutboxStore,
{
    pub fn new(store: S, thresholds: HealthThresholds) -> Self {
        Self {
            store,
            thresholds: thresholds.normalized(),
        }
    }

    pub fn thresholds(&self) -> &HealthThresholds {
        &self.thresholds
    }

    /// Count messages per status and classify the result.
    ///
    /// A store error is reported as `DOWN` rather than returned.
    pub async fn check(&self) -> HealthReport {
        let mut counts = StatusCounts::default();

        for status in OutboxStatus::ALL {
            match self.store.count_by_status(status).await {
                Ok(count) => counts.set(status, count),
                Err(e) => {
                    warn!(error = %e, %status, "Outbox health check could not count messages");
                    return HealthReport {
                        status: HealthStatus::Down,
                        counts: None,
                        error: Some(e.to_string()),
                    };
                }
            }
        }

        let status = counts.evaluate(&self.thresholds);
        debug!(%status, ?counts, "Outbox health evaluated");

        HealthReport {
            status,
            counts: Some(counts),
            error: None,
        }
    }
}
