//! Real-time pipeline.
//!
//! Consumes the chain facade's push surface, de-duplicates live bets,
//! broadcasts them to fan-out clients and persists them to the hot table.
//! Broadcast happens before persistence on purpose: a failed insert is
//! logged and never delays the live feed.

use crate::entities::real_bets;
use crate::models::market::{BetEvent, ChainEvent};
use crate::models::messages::FanoutMessage;
use crate::services::chain::ChainClient;
use crate::services::detector::Detector;
use crate::services::fanout::FanoutServer;
use crate::services::store::Store;
use crate::services::timefmt::TimeService;
use dashmap::DashMap;
use sea_orm::{NotSet, Set};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How many hot rows seed the dedup set after a restart.
const WARM_RESTORE_ROWS: u64 = 1000;

/// Fallback age limit for dedup entries; lock-time purges normally clear
/// them first.
const DEDUP_MAX_AGE: Duration = Duration::from_secs(3600);

const DEDUP_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

pub struct RealtimePipeline {
    chain: Arc<ChainClient>,
    store: Arc<Store>,
    detector: Arc<Detector>,
    fanout: Arc<FanoutServer>,
    time: TimeService,
    dedup: DashMap<(u64, String), Instant>,
    current_epoch: AtomicU64,
}

impl RealtimePipeline {
    pub fn new(
        chain: Arc<ChainClient>,
        store: Arc<Store>,
        detector: Arc<Detector>,
        fanout: Arc<FanoutServer>,
        time: TimeService,
    ) -> Self {
        Self {
            chain,
            store,
            detector,
            fanout,
            time,
            dedup: DashMap::new(),
            current_epoch: AtomicU64::new(0),
        }
    }

    /// Drive the pipeline until the event channel closes or `stop` fires.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<ChainEvent>,
        stop: CancellationToken,
    ) {
        self.init().await;

        let mut sweep = interval(DEDUP_SWEEP_INTERVAL);
        sweep.tick().await; // the first tick fires immediately

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = sweep.tick() => {
                    self.sweep_dedup();
                    self.detector.sweep(self.current_epoch.load(Ordering::SeqCst));
                }
                event = events.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => {
                            info!("chain event channel closed");
                            break;
                        }
                    }
                }
            }
        }

        info!("realtime pipeline stopped");
    }

    async fn init(&self) {
        match self.chain.current_epoch().await {
            Ok(epoch) => {
                self.current_epoch.store(epoch, Ordering::SeqCst);
                self.broadcast_round_update(epoch).await;
            }
            Err(e) => warn!(error = %e, "could not read current epoch at startup"),
        }

        match self.store.recent_realbets(WARM_RESTORE_ROWS).await {
            Ok(rows) => {
                let now = Instant::now();
                for row in &rows {
                    self.dedup
                        .insert((row.epoch as u64, row.wallet_address.clone()), now);
                }
                info!(restored = rows.len(), "dedup set warm-restored from hot table");
            }
            Err(e) => warn!(error = %e, "dedup warm restore failed"),
        }
    }

    async fn handle_event(&self, event: ChainEvent) {
        match event {
            ChainEvent::BetBull(bet) | ChainEvent::BetBear(bet) => self.handle_bet(bet).await,
            ChainEvent::StartRound(epoch) => {
                info!(epoch, "round started");
                self.current_epoch.store(epoch, Ordering::SeqCst);
                self.broadcast_round_update(epoch).await;
                if let Err(e) = self
                    .store
                    .sweep_realbets_below(epoch.saturating_sub(2))
                    .await
                {
                    warn!(error = %e, "hot table sweep on round start failed");
                }
            }
            ChainEvent::LockRound(epoch) => {
                info!(epoch, "round locked");
                // New bets now target the following epoch.
                self.broadcast_round_update(epoch + 1).await;
                self.purge_dedup_for_epoch(epoch);
                self.fanout.broadcast(FanoutMessage::RoundLock {
                    epoch,
                    timestamp: self.time.now(),
                });
            }
            ChainEvent::Connected => {
                self.fanout.broadcast(FanoutMessage::ConnectionStatus {
                    connected: true,
                    timestamp: self.time.now(),
                });
            }
            ChainEvent::Disconnected { reason } => {
                warn!(reason = %reason, "chain subscription lost");
                self.fanout.broadcast(FanoutMessage::ConnectionStatus {
                    connected: false,
                    timestamp: self.time.now(),
                });
            }
        }
    }

    async fn handle_bet(&self, bet: BetEvent) {
        if !claim_bet_key(&self.dedup, bet.epoch, &bet.sender) {
            debug!(epoch = bet.epoch, wallet = %bet.sender, "duplicate live bet dropped");
            return;
        }

        let timestamp = self.time.now();
        let verdict = self
            .detector
            .inspect_bet(&bet.sender, bet.epoch, bet.amount)
            .await;

        // Broadcast first, persist second.
        let flags = verdict.is_suspicious().then(|| verdict.flag_names());
        self.fanout.broadcast(FanoutMessage::NewBet {
            wallet: bet.sender.clone(),
            epoch: bet.epoch,
            direction: bet.direction,
            amount: bet.amount,
            timestamp: timestamp.clone(),
            suspicious: verdict.is_suspicious(),
            flags,
        });

        if verdict.is_suspicious() {
            self.fanout.broadcast(FanoutMessage::SuspiciousActivity {
                wallet: bet.sender.clone(),
                epoch: bet.epoch,
                direction: bet.direction,
                amount: bet.amount,
                flags: verdict.flag_names(),
                total_bets: verdict.total_bets,
                total_amount: verdict.total_amount,
                timestamp: timestamp.clone(),
            });
        }

        let row = real_bets::ActiveModel {
            id: NotSet,
            epoch: Set(bet.epoch as i64),
            bet_ts: Set(timestamp),
            wallet_address: Set(bet.sender.clone()),
            bet_direction: Set(bet.direction.as_str().to_string()),
            amount: Set(bet.amount),
        };
        if let Err(e) = self.store.insert_realbet(row).await {
            error!(epoch = bet.epoch, wallet = %bet.sender, error = %e, "hot table insert failed");
        }
    }

    async fn broadcast_round_update(&self, epoch: u64) {
        match self.chain.round(epoch).await {
            Ok(view) => {
                self.fanout.broadcast(FanoutMessage::RoundUpdate {
                    epoch,
                    status: view.status(),
                    start_timestamp: view.start_timestamp,
                    lock_timestamp: view.lock_timestamp,
                    close_timestamp: view.close_timestamp,
                    lock_price: view.lock_price,
                    close_price: view.close_price,
                    total_amount: view.total_amount,
                    bull_amount: view.up_amount,
                    bear_amount: view.down_amount,
                    timestamp: self.time.now(),
                });
            }
            Err(e) => warn!(epoch, error = %e, "round view unavailable for update"),
        }
    }

    fn purge_dedup_for_epoch(&self, epoch: u64) {
        let purged = purge_epoch_keys(&self.dedup, epoch);
        debug!(epoch, purged, "dedup purged for locked round");
    }

    fn sweep_dedup(&self) {
        let removed = sweep_stale_keys(&self.dedup, DEDUP_MAX_AGE);
        if removed > 0 {
            debug!(removed, "hourly dedup sweep");
        }
    }
}

/// Claim the dedup slot for one live bet. Returns false when the key is
/// already held, i.e. the bet is a duplicate and must be dropped silently.
fn claim_bet_key(dedup: &DashMap<(u64, String), Instant>, epoch: u64, wallet: &str) -> bool {
    let key = (epoch, wallet.to_string());
    if dedup.contains_key(&key) {
        return false;
    }
    dedup.insert(key, Instant::now());
    true
}

/// Drop every dedup entry of a locked round; its keys can never collide
/// with new bets again.
fn purge_epoch_keys(dedup: &DashMap<(u64, String), Instant>, epoch: u64) -> usize {
    let before = dedup.len();
    dedup.retain(|(e, _), _| *e != epoch);
    before - dedup.len()
}

/// Fallback sweep for entries the lock-time purge missed.
fn sweep_stale_keys(dedup: &DashMap<(u64, String), Instant>, max_age: Duration) -> usize {
    let before = dedup.len();
    dedup.retain(|_, seen| seen.elapsed() < max_age);
    before - dedup.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_bet_for_same_key_is_dropped() {
        let dedup = DashMap::new();
        assert!(claim_bet_key(&dedup, 5, "0xccc"));
        assert!(!claim_bet_key(&dedup, 5, "0xccc"));
        assert_eq!(dedup.len(), 1);
    }

    #[test]
    fn distinct_epochs_and_wallets_do_not_collide() {
        let dedup = DashMap::new();
        assert!(claim_bet_key(&dedup, 5, "0xccc"));
        assert!(claim_bet_key(&dedup, 6, "0xccc"));
        assert!(claim_bet_key(&dedup, 5, "0xddd"));
        assert_eq!(dedup.len(), 3);
    }

    #[test]
    fn lock_purge_reopens_only_the_locked_epoch() {
        let dedup = DashMap::new();
        claim_bet_key(&dedup, 5, "0xccc");
        claim_bet_key(&dedup, 6, "0xccc");
        assert_eq!(purge_epoch_keys(&dedup, 5), 1);
        assert!(claim_bet_key(&dedup, 5, "0xccc"));
        assert!(!claim_bet_key(&dedup, 6, "0xccc"));
    }

    #[test]
    fn stale_sweep_honours_the_age_limit() {
        let dedup = DashMap::new();
        claim_bet_key(&dedup, 5, "0xccc");
        claim_bet_key(&dedup, 6, "0xddd");
        assert_eq!(sweep_stale_keys(&dedup, Duration::from_secs(3600)), 0);
        assert_eq!(dedup.len(), 2);
        assert_eq!(sweep_stale_keys(&dedup, Duration::ZERO), 2);
        assert!(dedup.is_empty());
    }
}
