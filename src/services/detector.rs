//! Suspicious-wallet detection.
//!
//! Two modes. *Online* runs inside the live pipeline's hot path and keeps
//! per-wallet counters plus a bounded sliding window of recent bet times.
//! *Offline* runs after each epoch commit and surfaces wallets whose claim
//! activity inside the epoch's window exceeded the configured threshold.
//!
//! Detector state lives in this process only; it is rebuilt from scratch
//! after a restart.

use crate::entities::claims;
use crate::error::StoreError;
use crate::services::store::Store;
use crate::services::timefmt::TimeService;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Independently evaluated online flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SuspicionFlag {
    /// Single bet above the amount threshold.
    LargeAmount,
    /// Cumulative bet count above the lifetime threshold.
    HighTotal,
    /// Too many bets inside the sliding window.
    HighFrequency,
    /// Second or later bet from the same wallet in the same epoch.
    RepeatInRound,
}

impl fmt::Display for SuspicionFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SuspicionFlag::LargeAmount => write!(f, "LARGE_AMOUNT"),
            SuspicionFlag::HighTotal => write!(f, "HIGH_TOTAL"),
            SuspicionFlag::HighFrequency => write!(f, "HIGH_FREQUENCY"),
            SuspicionFlag::RepeatInRound => write!(f, "REPEAT_IN_ROUND"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Single-bet amount threshold, in asset units.
    pub large_amount: Decimal,
    /// Lifetime bet-count threshold.
    pub high_total: u64,
    /// Sliding window length.
    pub window: Duration,
    /// Ring capacity of the sliding window.
    pub window_capacity: usize,
    /// Bets inside the window before HighFrequency fires.
    pub high_frequency: usize,
    /// Offline multi-claim threshold.
    pub multi_claim_threshold: u32,
    /// Upper bound on tracked wallets before idle entries are evicted.
    pub max_wallets: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            large_amount: Decimal::from(10),
            high_total: 100,
            window: Duration::from_secs(60),
            window_capacity: 128,
            high_frequency: 10,
            multi_claim_threshold: 3,
            max_wallets: 10_000,
        }
    }
}

/// Result of one online inspection.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub flags: Vec<SuspicionFlag>,
    pub total_bets: u64,
    pub total_amount: Decimal,
}

impl Verdict {
    pub fn is_suspicious(&self) -> bool {
        !self.flags.is_empty()
    }

    pub fn flag_names(&self) -> Vec<String> {
        self.flags.iter().map(|f| f.to_string()).collect()
    }
}

#[derive(Debug, Default)]
struct WalletStats {
    total_bets: u64,
    total_amount: Decimal,
    window: VecDeque<Instant>,
    per_epoch: HashMap<u64, u32>,
}

impl WalletStats {
    fn prune_window(&mut self, window: Duration) {
        let cutoff = Instant::now() - window;
        while self.window.front().is_some_and(|t| *t < cutoff) {
            self.window.pop_front();
        }
    }
}

pub struct Detector {
    cfg: DetectorConfig,
    store: Arc<Store>,
    time: TimeService,
    wallets: Mutex<HashMap<String, WalletStats>>,
    noted: Mutex<HashSet<String>>,
}

impl Detector {
    pub fn new(cfg: DetectorConfig, store: Arc<Store>, time: TimeService) -> Self {
        Self {
            cfg,
            store,
            time,
            wallets: Mutex::new(HashMap::new()),
            noted: Mutex::new(HashSet::new()),
        }
    }

    /// Online mode: update the wallet's counters for one live bet and
    /// return every flag that fired. Writes an auto-note the first time a
    /// wallet is flagged.
    pub async fn inspect_bet(&self, wallet: &str, epoch: u64, amount: Decimal) -> Verdict {
        let verdict = {
            let mut wallets = self.wallets.lock().expect("detector mutex poisoned");
            if wallets.len() >= self.cfg.max_wallets {
                evict_idle(&mut wallets, self.cfg.window);
            }
            let stats = wallets.entry(wallet.to_string()).or_default();
            update_and_evaluate(stats, epoch, amount, &self.cfg)
        };

        if verdict.is_suspicious() {
            self.note_wallet(wallet, epoch, &verdict).await;
        }
        verdict
    }

    async fn note_wallet(&self, wallet: &str, epoch: u64, verdict: &Verdict) {
        {
            let noted = self.noted.lock().expect("detector mutex poisoned");
            if noted.contains(wallet) {
                return;
            }
        }

        match self.store.wallet_note_exists(wallet).await {
            Ok(true) => {
                self.noted
                    .lock()
                    .expect("detector mutex poisoned")
                    .insert(wallet.to_string());
            }
            Ok(false) => {
                let flags = verdict.flag_names().join(",");
                let note = format!(
                    "auto-flagged at epoch {epoch}: {flags} ({} bets, {} total)",
                    verdict.total_bets, verdict.total_amount
                );
                let now = self.time.now();
                if let Err(e) = self.store.upsert_wallet_note(wallet, &note, &flags, &now).await {
                    warn!(wallet, error = %e, "failed to write wallet note");
                } else {
                    info!(wallet, flags = %flags, "wallet auto-noted");
                    self.noted
                        .lock()
                        .expect("detector mutex poisoned")
                        .insert(wallet.to_string());
                }
            }
            Err(e) => warn!(wallet, error = %e, "wallet note lookup failed"),
        }
    }

    /// Hourly maintenance: drop expired window entries and stale per-round
    /// counters so state stays bounded.
    pub fn sweep(&self, current_epoch: u64) {
        let mut wallets = self.wallets.lock().expect("detector mutex poisoned");
        let floor = current_epoch.saturating_sub(2);
        for stats in wallets.values_mut() {
            stats.prune_window(self.cfg.window);
            stats.per_epoch.retain(|epoch, _| *epoch >= floor);
        }
        let before = wallets.len();
        wallets.retain(|_, s| !s.window.is_empty() || !s.per_epoch.is_empty());
        debug!(tracked = wallets.len(), evicted = before - wallets.len(), "detector sweep");
    }

    /// Offline mode: group the epoch's claim rows by wallet and record
    /// every wallet whose row count exceeds the threshold.
    pub async fn run_offline(&self, epoch: u64) -> Result<usize, StoreError> {
        let rows = self.store.claims_for_epoch(epoch).await?;
        let grouped = group_claims_by_rows(&rows);

        let mut findings = 0;
        let now = self.time.now();
        for (wallet, (count, total)) in grouped {
            if count > self.cfg.multi_claim_threshold {
                self.store
                    .upsert_multi_claim(epoch, &wallet, count as i32, total, &now)
                    .await?;
                info!(epoch, wallet = %wallet, count, %total, "multi-claim recorded");
                findings += 1;
            }
        }
        Ok(findings)
    }

    /// Restart-validation variant: counts distinct `bet_epoch`s per wallet
    /// instead of raw rows, flagging wallets that claimed many different
    /// prior rounds inside one window. Returns findings without persisting.
    pub async fn audit_distinct_bet_epochs(
        &self,
        epoch: u64,
    ) -> Result<Vec<(String, u32, Decimal)>, StoreError> {
        let rows = self.store.claims_for_epoch(epoch).await?;
        let grouped = group_claims_by_distinct_bet_epoch(&rows);
        Ok(grouped
            .into_iter()
            .filter(|(_, (count, _))| *count > self.cfg.multi_claim_threshold)
            .map(|(wallet, (count, total))| (wallet, count, total))
            .collect())
    }

    pub fn multi_claim_threshold(&self) -> u32 {
        self.cfg.multi_claim_threshold
    }
}

/// Record one bet against a wallet's counters and evaluate every flag.
/// The hot-path logic lives here, free of locks and store access.
fn update_and_evaluate(
    stats: &mut WalletStats,
    epoch: u64,
    amount: Decimal,
    cfg: &DetectorConfig,
) -> Verdict {
    stats.prune_window(cfg.window);
    if stats.window.len() == cfg.window_capacity {
        stats.window.pop_front();
    }
    stats.window.push_back(Instant::now());

    stats.total_bets += 1;
    stats.total_amount += amount;
    let in_round = stats.per_epoch.entry(epoch).or_insert(0);
    *in_round += 1;

    let mut flags = Vec::new();
    if amount > cfg.large_amount {
        flags.push(SuspicionFlag::LargeAmount);
    }
    if stats.total_bets > cfg.high_total {
        flags.push(SuspicionFlag::HighTotal);
    }
    if stats.window.len() > cfg.high_frequency {
        flags.push(SuspicionFlag::HighFrequency);
    }
    if *in_round >= 2 {
        flags.push(SuspicionFlag::RepeatInRound);
    }

    Verdict {
        flags,
        total_bets: stats.total_bets,
        total_amount: stats.total_amount,
    }
}

fn evict_idle(wallets: &mut HashMap<String, WalletStats>, window: Duration) {
    let before = wallets.len();
    wallets.retain(|_, s| {
        s.prune_window(window);
        !s.window.is_empty()
    });
    debug!(evicted = before - wallets.len(), "detector wallet cap reached, evicted idle entries");
}

/// Claim rows per wallet: `(row count, summed amount)`.
pub fn group_claims_by_rows(rows: &[claims::Model]) -> HashMap<String, (u32, Decimal)> {
    let mut grouped: HashMap<String, (u32, Decimal)> = HashMap::new();
    for row in rows {
        let entry = grouped
            .entry(row.wallet_address.clone())
            .or_insert((0, Decimal::ZERO));
        entry.0 += 1;
        entry.1 += row.claim_amount;
    }
    grouped
}

/// Distinct `bet_epoch`s per wallet: `(distinct count, summed amount)`.
pub fn group_claims_by_distinct_bet_epoch(
    rows: &[claims::Model],
) -> HashMap<String, (u32, Decimal)> {
    let mut epochs: HashMap<String, HashSet<i64>> = HashMap::new();
    let mut totals: HashMap<String, Decimal> = HashMap::new();
    for row in rows {
        epochs
            .entry(row.wallet_address.clone())
            .or_default()
            .insert(row.bet_epoch);
        *totals.entry(row.wallet_address.clone()).or_default() += row.claim_amount;
    }
    epochs
        .into_iter()
        .map(|(wallet, set)| {
            let total = totals.get(&wallet).copied().unwrap_or_default();
            (wallet, (set.len() as u32, total))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn claim(id: i64, wallet: &str, bet_epoch: i64, amount: Decimal) -> claims::Model {
        claims::Model {
            id,
            epoch: 500,
            claim_ts: "2024-05-01 12:00:00".to_string(),
            wallet_address: wallet.to_string(),
            claim_amount: amount,
            bet_epoch,
            tx_hash: format!("0x{id:064x}"),
        }
    }

    #[test]
    fn row_grouping_counts_every_row() {
        let rows = vec![
            claim(1, "0xddd", 496, dec!(1)),
            claim(2, "0xddd", 497, dec!(2)),
            claim(3, "0xddd", 498, dec!(3)),
            claim(4, "0xddd", 499, dec!(4)),
            claim(5, "0xeee", 499, dec!(9)),
        ];
        let grouped = group_claims_by_rows(&rows);
        assert_eq!(grouped["0xddd"], (4, dec!(10)));
        assert_eq!(grouped["0xeee"], (1, dec!(9)));
    }

    #[test]
    fn distinct_grouping_collapses_repeated_bet_epochs() {
        let rows = vec![
            claim(1, "0xddd", 496, dec!(1)),
            claim(2, "0xddd", 496, dec!(1)),
            claim(3, "0xddd", 497, dec!(2)),
        ];
        let grouped = group_claims_by_distinct_bet_epoch(&rows);
        assert_eq!(grouped["0xddd"].0, 2);
        assert_eq!(grouped["0xddd"].1, dec!(4));
    }

    #[test]
    fn flags_render_screaming_snake() {
        assert_eq!(SuspicionFlag::LargeAmount.to_string(), "LARGE_AMOUNT");
        assert_eq!(SuspicionFlag::RepeatInRound.to_string(), "REPEAT_IN_ROUND");
    }

    #[test]
    fn small_first_bet_raises_no_flags() {
        let cfg = DetectorConfig::default();
        let mut stats = WalletStats::default();
        let verdict = update_and_evaluate(&mut stats, 10, dec!(0.5), &cfg);
        assert!(verdict.flags.is_empty());
        assert_eq!(verdict.total_bets, 1);
        assert_eq!(verdict.total_amount, dec!(0.5));
    }

    #[test]
    fn large_single_bet_fires_large_amount() {
        let cfg = DetectorConfig::default();
        let mut stats = WalletStats::default();
        let verdict = update_and_evaluate(&mut stats, 10, dec!(10.5), &cfg);
        assert_eq!(verdict.flags, vec![SuspicionFlag::LargeAmount]);
    }

    #[test]
    fn second_bet_in_same_epoch_fires_repeat_in_round() {
        let cfg = DetectorConfig::default();
        let mut stats = WalletStats::default();
        assert!(update_and_evaluate(&mut stats, 10, dec!(1), &cfg)
            .flags
            .is_empty());
        let verdict = update_and_evaluate(&mut stats, 10, dec!(1), &cfg);
        assert!(verdict.flags.contains(&SuspicionFlag::RepeatInRound));
        // A different epoch starts clean again.
        let verdict = update_and_evaluate(&mut stats, 11, dec!(1), &cfg);
        assert!(!verdict.flags.contains(&SuspicionFlag::RepeatInRound));
    }

    #[test]
    fn burst_of_bets_fires_high_frequency() {
        let cfg = DetectorConfig::default();
        let mut stats = WalletStats::default();
        let mut last = Verdict {
            flags: Vec::new(),
            total_bets: 0,
            total_amount: Decimal::ZERO,
        };
        for epoch in 0..11u64 {
            last = update_and_evaluate(&mut stats, epoch, dec!(0.1), &cfg);
        }
        assert!(last.flags.contains(&SuspicionFlag::HighFrequency));
    }

    #[test]
    fn lifetime_count_past_threshold_fires_high_total() {
        let cfg = DetectorConfig {
            high_frequency: 1000,
            window_capacity: 2048,
            ..DetectorConfig::default()
        };
        let mut stats = WalletStats::default();
        let mut last = Verdict {
            flags: Vec::new(),
            total_bets: 0,
            total_amount: Decimal::ZERO,
        };
        for epoch in 0..101u64 {
            last = update_and_evaluate(&mut stats, epoch, dec!(0.1), &cfg);
        }
        assert!(last.flags.contains(&SuspicionFlag::HighTotal));
        assert_eq!(last.total_bets, 101);
    }

    #[test]
    fn window_ring_never_exceeds_capacity() {
        let cfg = DetectorConfig {
            window_capacity: 4,
            ..DetectorConfig::default()
        };
        let mut stats = WalletStats::default();
        for epoch in 0..20u64 {
            update_and_evaluate(&mut stats, epoch, dec!(0.1), &cfg);
        }
        assert!(stats.window.len() <= 4);
    }
}
