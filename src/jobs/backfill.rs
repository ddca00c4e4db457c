//! Historical backfill workers.
//!
//! The *main* worker starts two epochs behind the live tip and walks
//! backwards indefinitely, stopping at epoch 1. The *side* worker
//! re-scans the five most recent closed epochs every five minutes to pick
//! up rounds the main pass saw before they were closable. Both funnel
//! through `EpochProcessor`, so natural-key idempotency makes their
//! interleaving harmless.

use crate::error::EpochError;
use crate::jobs::epoch_sync::{EpochOutcome, EpochProcessor};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pause between epochs in the main backwards walk.
const MAIN_PACING: Duration = Duration::from_secs(2);

/// Cadence of the recent-window re-scan.
const SIDE_INTERVAL: Duration = Duration::from_secs(300);

/// The recent window is `[tip - 6, tip - 2]`, five epochs.
const RECENT_WINDOW_BACK: u64 = 6;
pub const TIP_LAG: u64 = 2;

/// Outcome tally for the on-demand range mode.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RangeReport {
    pub committed: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Main backtracking worker. Finishes the epoch in flight when `stop`
/// fires, then returns.
pub async fn run_main(processor: Arc<EpochProcessor>, stop: CancellationToken) {
    let tip = match wait_for_tip(&processor, &stop).await {
        Some(tip) => tip,
        None => return,
    };

    let mut epoch = tip.saturating_sub(TIP_LAG);
    info!(start_epoch = epoch, "main backfill started");

    while epoch > 0 {
        if stop.is_cancelled() {
            info!(epoch, "main backfill stopping on signal");
            break;
        }

        match processor.process_epoch(epoch).await {
            Ok(EpochOutcome::Committed { bets, claims }) => {
                debug!(epoch, bets, claims, "backfill committed epoch");
            }
            Ok(EpochOutcome::AlreadyStored) => {
                debug!(epoch, "epoch already stored");
            }
            Ok(EpochOutcome::Quarantined) => {
                warn!(epoch, "epoch quarantined, moving on");
            }
            Err(e) if e.is_silent_skip() => {
                debug!(epoch, reason = %e, "epoch not ready");
            }
            Err(EpochError::IntegrityFailed { .. }) => {
                // Retry the same epoch until its third strike quarantines it.
                pace(&stop).await;
                continue;
            }
            Err(e) => {
                error!(epoch, error = %e, "epoch processing failed");
            }
        }

        epoch -= 1;
        pace(&stop).await;
    }

    info!("main backfill finished");
}

/// Side worker: every five minutes, re-process the recent closed window.
pub async fn run_side(processor: Arc<EpochProcessor>, stop: CancellationToken) {
    let mut ticker = interval(SIDE_INTERVAL);
    info!("recent-scan worker started");

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = scan_recent(&processor, &stop).await {
                    error!(error = %e, "recent scan failed");
                }
            }
        }
    }

    info!("recent-scan worker stopped");
}

/// Bounds of the recent re-scan window for a given live tip, clamped to
/// epoch 1. `None` until enough epochs exist to form a window.
pub fn recent_window(tip: u64) -> Option<(u64, u64)> {
    let from = tip.saturating_sub(RECENT_WINDOW_BACK).max(1);
    let to = tip.saturating_sub(TIP_LAG);
    if to < from {
        None
    } else {
        Some((from, to))
    }
}

async fn scan_recent(
    processor: &EpochProcessor,
    stop: &CancellationToken,
) -> Result<(), EpochError> {
    let tip = processor.chain().current_epoch().await?;
    let Some((from, to)) = recent_window(tip) else {
        return Ok(());
    };

    debug!(from, to, "scanning recent window");
    for epoch in from..=to {
        if stop.is_cancelled() {
            break;
        }
        match processor.process_epoch(epoch).await {
            Ok(EpochOutcome::Committed { bets, claims }) => {
                info!(epoch, bets, claims, "recent scan committed epoch");
            }
            Ok(_) => {}
            Err(e) if e.is_silent_skip() => {}
            Err(e) => warn!(epoch, error = %e, "recent scan epoch failed"),
        }
    }
    Ok(())
}

/// On-demand bounded backfill for the CLI `process` mode.
pub async fn run_range(processor: &EpochProcessor, from: u64, to: u64) -> RangeReport {
    let mut report = RangeReport::default();

    for epoch in from..=to {
        match processor.process_epoch(epoch).await {
            Ok(EpochOutcome::Committed { bets, claims }) => {
                info!(epoch, bets, claims, "range mode committed epoch");
                report.committed += 1;
            }
            Ok(EpochOutcome::AlreadyStored) => {
                debug!(epoch, "range mode: already stored");
                report.skipped += 1;
            }
            Ok(EpochOutcome::Quarantined) => {
                warn!(epoch, "range mode: quarantined");
                report.skipped += 1;
            }
            Err(e) if e.is_silent_skip() => {
                debug!(epoch, reason = %e, "range mode: not ready");
                report.skipped += 1;
            }
            Err(e) => {
                error!(epoch, error = %e, "range mode: failed");
                report.failed += 1;
            }
        }
    }

    report
}

async fn wait_for_tip(processor: &EpochProcessor, stop: &CancellationToken) -> Option<u64> {
    loop {
        if stop.is_cancelled() {
            return None;
        }
        match processor.chain().current_epoch().await {
            Ok(tip) => return Some(tip),
            Err(e) => {
                error!(error = %e, "cannot read current epoch, retrying");
                tokio::select! {
                    _ = stop.cancelled() => return None,
                    _ = tokio::time::sleep(Duration::from_secs(10)) => {}
                }
            }
        }
    }
}

async fn pace(stop: &CancellationToken) {
    tokio::select! {
        _ = stop.cancelled() => {}
        _ = tokio::time::sleep(MAIN_PACING) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recent_window_spans_five_epochs() {
        assert_eq!(recent_window(100), Some((94, 98)));
        assert_eq!(recent_window(10), Some((4, 8)));
    }

    #[test]
    fn recent_window_clamps_at_genesis() {
        assert_eq!(recent_window(5), Some((1, 3)));
        assert_eq!(recent_window(3), Some((1, 1)));
    }

    #[test]
    fn recent_window_is_empty_before_enough_epochs() {
        assert_eq!(recent_window(2), None);
        assert_eq!(recent_window(0), None);
    }
}
