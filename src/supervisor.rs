//! Lifecycle coordination.
//!
//! Wires the construction graph (store, chain facade, detector, time
//! service) into the requested daemon mode, schedules the historical
//! pipeline's periodic graceful restart and routes process signals into
//! cooperative cancellation.

use crate::config::Config;
use crate::jobs::backfill::{self, RangeReport};
use crate::jobs::epoch_sync::EpochProcessor;
use crate::jobs::realtime::RealtimePipeline;
use crate::services::chain::ChainClient;
use crate::services::chain_stream::ChainStream;
use crate::services::detector::{Detector, DetectorConfig};
use crate::services::fanout::FanoutServer;
use crate::services::store::Store;
use crate::services::timefmt::TimeService;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Cadence of the historical pipeline's graceful restart.
const RESTART_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Drain budget for the main worker's in-flight epoch.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

/// Pause for in-flight database writes after the drain.
const SETTLE_DELAY: Duration = Duration::from_secs(3);

/// Pause between validation and the main worker respawn.
const RESTART_DELAY: Duration = Duration::from_secs(5);

struct CoreDeps {
    store: Arc<Store>,
    chain: Arc<ChainClient>,
    detector: Arc<Detector>,
    time: TimeService,
}

async fn build_core(cfg: &Config) -> anyhow::Result<CoreDeps> {
    let store = Arc::new(Store::connect(&cfg.database_url).await?);
    let time = TimeService::new(cfg.timezone);
    let chain = Arc::new(ChainClient::new(
        &cfg.rpc_url,
        &cfg.contract_address,
        cfg.rate_limit_rps,
    )?);
    let detector_cfg = DetectorConfig {
        multi_claim_threshold: cfg.multi_claim_threshold,
        ..DetectorConfig::default()
    };
    let detector = Arc::new(Detector::new(detector_cfg, store.clone(), time));
    Ok(CoreDeps {
        store,
        chain,
        detector,
        time,
    })
}

/// History mode: main backfill + recent-scan worker + restart scheduler.
pub async fn run_history(cfg: Config) -> anyhow::Result<()> {
    let deps = build_core(&cfg).await?;
    let processor = Arc::new(EpochProcessor::new(
        deps.chain.clone(),
        deps.store.clone(),
        deps.detector.clone(),
        deps.time,
    ));

    let side_stop = CancellationToken::new();
    let mut main_stop = CancellationToken::new();
    let mut main_handle = tokio::spawn(backfill::run_main(processor.clone(), main_stop.clone()));
    let side_handle = tokio::spawn(backfill::run_side(processor.clone(), side_stop.clone()));

    let mut restart_timer = interval(RESTART_INTERVAL);
    restart_timer.tick().await; // consume the immediate first tick

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = restart_timer.tick() => {
                let (stop, handle) =
                    graceful_restart(&processor, &deps.detector, main_stop, main_handle).await;
                main_stop = stop;
                main_handle = handle;
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping history daemon");
                main_stop.cancel();
                side_stop.cancel();
                let _ = timeout(DRAIN_TIMEOUT, main_handle).await;
                let _ = timeout(Duration::from_secs(10), side_handle).await;
                break;
            }
        }
    }

    Ok(())
}

/// Realtime mode: live pipeline + fan-out server.
pub async fn run_realtime(cfg: Config) -> anyhow::Result<()> {
    let deps = build_core(&cfg).await?;
    let fanout = Arc::new(FanoutServer::new(deps.time));

    // A taken port must fail startup, so bind before spawning anything.
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", cfg.fanout_port)).await?;

    let stop = CancellationToken::new();
    let fanout_handle = tokio::spawn(fanout.clone().serve_on(listener, stop.clone()));

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let stream = ChainStream::new(&cfg.rpc_ws_url, &cfg.contract_address)?;
    let stream_handle = stream.start(event_tx, stop.clone());

    let pipeline = Arc::new(RealtimePipeline::new(
        deps.chain.clone(),
        deps.store.clone(),
        deps.detector.clone(),
        fanout.clone(),
        deps.time,
    ));
    let pipeline_handle = tokio::spawn(pipeline.run(event_rx, stop.clone()));

    shutdown_signal().await;
    info!("shutdown signal received, stopping realtime daemon");
    stop.cancel();

    let _ = timeout(Duration::from_secs(10), pipeline_handle).await;
    let _ = timeout(Duration::from_secs(10), stream_handle).await;
    let _ = timeout(Duration::from_secs(10), fanout_handle).await;
    Ok(())
}

/// On-demand bounded backfill: process `[from, to]` and report counts.
pub async fn run_process_range(cfg: Config, from: u64, to: u64) -> anyhow::Result<RangeReport> {
    anyhow::ensure!(from >= 1, "from must be at least 1");
    anyhow::ensure!(from <= to, "from must not exceed to");

    let deps = build_core(&cfg).await?;
    let processor = EpochProcessor::new(
        deps.chain.clone(),
        deps.store.clone(),
        deps.detector.clone(),
        deps.time,
    );

    Ok(backfill::run_range(&processor, from, to).await)
}

/// The restart sequence: drain, settle, validate, pause, respawn. Every
/// step logs; no step's failure prevents the respawn.
async fn graceful_restart(
    processor: &Arc<EpochProcessor>,
    detector: &Arc<Detector>,
    stop: CancellationToken,
    handle: JoinHandle<()>,
) -> (CancellationToken, JoinHandle<()>) {
    info!("graceful restart: signalling main worker to stop");
    stop.cancel();
    match timeout(DRAIN_TIMEOUT, handle).await {
        Ok(_) => info!("graceful restart: main worker drained"),
        Err(_) => warn!("graceful restart: main worker did not drain in time, proceeding"),
    }

    info!("graceful restart: letting in-flight writes settle");
    tokio::time::sleep(SETTLE_DELAY).await;

    validate_recent_window(processor, detector).await;

    tokio::time::sleep(RESTART_DELAY).await;

    let fresh_stop = CancellationToken::new();
    let fresh_handle = tokio::spawn(backfill::run_main(processor.clone(), fresh_stop.clone()));
    info!("graceful restart: main worker restarted");
    (fresh_stop, fresh_handle)
}

/// Consistency checks over the recent closed window. Findings are logged,
/// never fatal.
async fn validate_recent_window(processor: &Arc<EpochProcessor>, detector: &Arc<Detector>) {
    let store = processor.store();
    let tip = match processor.chain().current_epoch().await {
        Ok(tip) => tip,
        Err(e) => {
            warn!(error = %e, "validation skipped: current epoch unavailable");
            return;
        }
    };
    let Some((from, to)) = backfill::recent_window(tip) else {
        return;
    };

    info!(from, to, "graceful restart: validating recent window");

    match store.rounds_in_range(from, to).await {
        Ok(rounds) => {
            for epoch in from..=to {
                if !rounds.iter().any(|r| r.epoch == epoch as i64) {
                    warn!(epoch, "validation: round row missing");
                    continue;
                }
                match store.hisbet_count_for_epoch(epoch).await {
                    Ok(0) => warn!(epoch, "validation: round stored without bets"),
                    Ok(count) => info!(epoch, bets = count, "validation: round ok"),
                    Err(e) => warn!(epoch, error = %e, "validation: bet count failed"),
                }
            }
        }
        Err(e) => warn!(error = %e, "validation: round range query failed"),
    }

    match store.realbet_count_below(to).await {
        Ok(0) => info!("validation: hot table swept"),
        Ok(stale) => warn!(stale, "validation: hot table still holds processed epochs"),
        Err(e) => warn!(error = %e, "validation: hot table count failed"),
    }

    for epoch in from..=to {
        match detector.audit_distinct_bet_epochs(epoch).await {
            Ok(findings) if findings.is_empty() => {}
            Ok(findings) => match store.multi_claims_for_epoch(epoch).await {
                Ok(recorded) => {
                    for (wallet, distinct, total) in findings {
                        let present = recorded.iter().any(|m| m.wallet_address == wallet);
                        if !present {
                            warn!(
                                epoch,
                                wallet = %wallet,
                                distinct,
                                %total,
                                "validation: multi-claim wallet unrecorded"
                            );
                        }
                    }
                }
                Err(e) => warn!(epoch, error = %e, "validation: multi-claim lookup failed"),
            },
            Err(e) => warn!(epoch, error = %e, "validation: claim audit failed"),
        }
    }
}

/// SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_sequence_timings() {
        assert_eq!(RESTART_INTERVAL, Duration::from_secs(1800));
        assert_eq!(DRAIN_TIMEOUT, Duration::from_secs(60));
        assert_eq!(SETTLE_DELAY, Duration::from_secs(3));
        assert_eq!(RESTART_DELAY, Duration::from_secs(5));
    }
}
