//! Downtime accounting.
//!
//! Downtime is wall-clock time a device spends at or above its red threshold.
//! It is credited per sample: while a window is open, each reading credits
//! the time elapsed since the window was last credited. A window still open
//! at the end of a bucket is credited up to the bucket end and carried into
//! the next bucket, so the sum over buckets matches the wall-clock time.

use chrono::{DateTime, Duration, Utc};

use crate::model::Reading;
use crate::storage::alert_state::DowntimeWindow;

/// Result of accruing one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accrual {
    /// Seconds credited to the bucket.
    pub seconds: i64,
    /// Window left open at the bucket end.
    pub window: Option<DowntimeWindow>,
    /// Whether a window was dropped because readings stopped for longer
    /// than the stale threshold.
    pub closed_stale: bool,
}

/// Walk a bucket's readings (oldest first) and credit downtime.
///
/// `window` is the window carried over from the previous bucket. A gap
/// between credits longer than `stale` closes the window at its last
/// credited instant without crediting the gap.
#[must_use]
pub fn accrue(
    window: Option<DowntimeWindow>,
    readings: &[Reading],
    red: f64,
    bucket_end: DateTime<Utc>,
    stale: Duration,
) -> Accrual {
    let mut window = window;
    let mut credited = Duration::zero();
    let mut closed_stale = false;

    for reading in readings {
        if let Some(open) = window.as_mut() {
            let gap = reading.timestamp - open.accrued_until;
            if gap > stale {
                window = None;
                closed_stale = true;
            } else if gap > Duration::zero() {
                credited += gap;
                open.accrued_until = reading.timestamp;
            }
        }

        if reading.wind_speed >= red {
            window.get_or_insert(DowntimeWindow {
                started_at: reading.timestamp,
                accrued_until: reading.timestamp,
            });
        } else {
            window = None;
        }
    }

    if let Some(open) = window.as_mut() {
        let gap = bucket_end - open.accrued_until;
        if gap > stale {
            window = None;
            closed_stale = true;
        } else if gap > Duration::zero() {
            credited += gap;
            open.accrued_until = bucket_end;
        }
    }

    Accrual {
        seconds: credited.num_seconds(),
        window,
        closed_stale,
    }
}
