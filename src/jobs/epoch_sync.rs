//! Per-epoch ingestion.
//!
//! One closed epoch is processed as: block-range resolution → parallel
//! event fetch → row assembly → integrity check → atomic commit → hot
//! table cleanup → offline claim inspection. Both backfill workers and
//! the on-demand range mode funnel through `EpochProcessor::process_epoch`.

use crate::entities::rounds;
use crate::error::{ChainError, EpochError, StoreError};
use crate::models::market::{BetDirection, BetOutcome, EpochEvents, RoundView};
use crate::services::chain::ChainClient;
use crate::services::detector::Detector;
use crate::services::store::{NewBetRow, NewClaimRow, Store};
use crate::services::timefmt::TimeService;
use rust_decimal::Decimal;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Attempts an epoch gets before it is quarantined.
pub const MAX_FAILURES: i32 = 3;

/// Treasury keeps 3% of the pool; winners split the rest.
const FEE_FACTOR_NUMERATOR: i64 = 97;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EpochOutcome {
    Committed { bets: usize, claims: usize },
    AlreadyStored,
    Quarantined,
}

/// Seam for the quarantine bookkeeping. `Store` is the production
/// implementation; tests drive the three-strike sequence with an
/// in-memory fake.
pub trait FailureLedger {
    fn failure_count(&self, epoch: u64) -> impl Future<Output = Result<i32, StoreError>> + Send;

    fn record_failure(
        &self,
        epoch: u64,
        reason: &str,
        attempt_ts: &str,
    ) -> impl Future<Output = Result<i32, StoreError>> + Send;

    fn clear_epoch_rows(&self, epoch: u64) -> impl Future<Output = Result<(), StoreError>> + Send;
}

impl FailureLedger for Store {
    fn failure_count(&self, epoch: u64) -> impl Future<Output = Result<i32, StoreError>> + Send {
        async move {
            Ok(self
                .failed_epoch(epoch)
                .await?
                .map_or(0, |f| f.failure_count))
        }
    }

    fn record_failure(
        &self,
        epoch: u64,
        reason: &str,
        attempt_ts: &str,
    ) -> impl Future<Output = Result<i32, StoreError>> + Send {
        async move { self.record_epoch_failure(epoch, reason, attempt_ts).await }
    }

    fn clear_epoch_rows(&self, epoch: u64) -> impl Future<Output = Result<(), StoreError>> + Send {
        async move { self.delete_epoch_rows(epoch).await }
    }
}

/// An epoch is quarantined once it has used up all its attempts.
pub async fn is_quarantined<L: FailureLedger>(ledger: &L, epoch: u64) -> Result<bool, StoreError> {
    Ok(ledger.failure_count(epoch).await? >= MAX_FAILURES)
}

/// One failed attempt: the partial row set is wiped, then the strike is
/// recorded. Returns the updated count; at `MAX_FAILURES` the epoch is
/// quarantined and skipped by every later pass.
pub async fn register_integrity_failure<L: FailureLedger>(
    ledger: &L,
    epoch: u64,
    reason: &str,
    attempt_ts: &str,
) -> Result<i32, StoreError> {
    ledger.clear_epoch_rows(epoch).await?;
    ledger.record_failure(epoch, reason, attempt_ts).await
}

/// Everything destined for one epoch's atomic commit.
#[derive(Debug, Clone)]
pub struct AssembledEpoch {
    pub round: rounds::Model,
    pub bets: Vec<NewBetRow>,
    pub claims: Vec<NewClaimRow>,
}

pub struct EpochProcessor {
    chain: Arc<ChainClient>,
    store: Arc<Store>,
    detector: Arc<Detector>,
    time: TimeService,
}

impl EpochProcessor {
    pub fn new(
        chain: Arc<ChainClient>,
        store: Arc<Store>,
        detector: Arc<Detector>,
        time: TimeService,
    ) -> Self {
        Self {
            chain,
            store,
            detector,
            time,
        }
    }

    pub fn chain(&self) -> &ChainClient {
        &self.chain
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub async fn process_epoch(&self, epoch: u64) -> Result<EpochOutcome, EpochError> {
        if is_quarantined(self.store.as_ref(), epoch).await? {
            debug!(epoch, "epoch quarantined, skipping");
            return Ok(EpochOutcome::Quarantined);
        }
        if self.store.round_exists(epoch).await? {
            return Ok(EpochOutcome::AlreadyStored);
        }

        let round = self.chain.round(epoch).await?;
        if !round.is_closed() {
            return Err(EpochError::RoundNotClosed(epoch));
        }

        // The ingestion window runs from this round's start to the next
        // round's start so late bets and payouts land in exactly one epoch.
        let next = self.chain.round(epoch + 1).await?;
        if !next.has_started() {
            return Err(EpochError::NextRoundNotStarted(epoch));
        }

        let from_block = self
            .chain
            .find_block_by_timestamp(round.start_timestamp)
            .await?;
        let to_block = self
            .chain
            .find_block_by_timestamp(next.start_timestamp)
            .await?;

        let events = self.chain.fetch_events(from_block, to_block).await?;
        let stamps = self.block_timestamps(&events).await?;
        let assembled = assemble_epoch(epoch, &round, &events, &stamps, &self.time)?;

        if let Err(reason) = check_integrity(&assembled) {
            let now = self.time.now();
            let count =
                register_integrity_failure(self.store.as_ref(), epoch, &reason, &now).await?;
            warn!(epoch, failures = count, reason = %reason, "integrity check failed");
            return Err(EpochError::IntegrityFailed { epoch, reason });
        }

        let bet_count = assembled.bets.len();
        let claim_count = assembled.claims.len();
        self.store
            .commit_epoch(assembled.round, assembled.bets, assembled.claims)
            .await?;

        self.cleanup_hot_table(epoch).await;

        if let Err(e) = self.detector.run_offline(epoch).await {
            warn!(epoch, error = %e, "offline claim inspection failed");
        }

        info!(epoch, bets = bet_count, claims = claim_count, "epoch ingested");
        Ok(EpochOutcome::Committed {
            bets: bet_count,
            claims: claim_count,
        })
    }

    /// Resolve the timestamp of every block that carries an event in this
    /// window. Bets cluster in few blocks, so lookups are cached per call.
    async fn block_timestamps(
        &self,
        events: &EpochEvents,
    ) -> Result<HashMap<u64, u64>, ChainError> {
        let mut blocks: BTreeSet<u64> = BTreeSet::new();
        for bet in events.bull.iter().chain(events.bear.iter()) {
            blocks.insert(bet.block_number);
        }
        for claim in &events.claims {
            blocks.insert(claim.block_number);
        }
        blocks.remove(&0);

        let mut stamps = HashMap::with_capacity(blocks.len());
        for number in blocks {
            let block = self.chain.block(number).await?;
            stamps.insert(number, block.timestamp);
        }
        Ok(stamps)
    }

    async fn cleanup_hot_table(&self, epoch: u64) {
        if let Err(e) = self.store.delete_realbets_for_epoch(epoch).await {
            warn!(epoch, error = %e, "hot table cleanup failed");
        }
        match self.chain.current_epoch().await {
            Ok(tip) => {
                if let Err(e) = self.store.sweep_realbets_below(tip.saturating_sub(2)).await {
                    warn!(error = %e, "hot table sweep failed");
                }
            }
            Err(e) => debug!(error = %e, "skipping hot sweep, tip unavailable"),
        }
    }
}

/// Winning-side payout multipliers, four fixed fractional digits. Only the
/// winning pool pays out; the losing side and drawn rounds get zero.
pub fn compute_payouts(
    total: Decimal,
    up_amount: Decimal,
    down_amount: Decimal,
    result: Option<BetDirection>,
) -> (Decimal, Decimal) {
    let fee_factor = Decimal::new(FEE_FACTOR_NUMERATOR, 2);
    let after_fee = total * fee_factor;
    match result {
        Some(BetDirection::Up) if up_amount > Decimal::ZERO => {
            ((after_fee / up_amount).round_dp(4), Decimal::ZERO)
        }
        Some(BetDirection::Down) if down_amount > Decimal::ZERO => {
            (Decimal::ZERO, (after_fee / down_amount).round_dp(4))
        }
        _ => (Decimal::ZERO, Decimal::ZERO),
    }
}

/// Build the commit payload for one epoch from its raw event streams.
pub fn assemble_epoch(
    epoch: u64,
    round: &RoundView,
    events: &EpochEvents,
    block_timestamps: &HashMap<u64, u64>,
    time: &TimeService,
) -> Result<AssembledEpoch, EpochError> {
    let result = round.result();
    let (up_payout, down_payout) =
        compute_payouts(round.total_amount, round.up_amount, round.down_amount, result);

    let round_row = rounds::Model {
        epoch: epoch as i64,
        start_ts: time.format_unix(round.start_timestamp as i64)?,
        lock_ts: time.format_unix(round.lock_timestamp as i64)?,
        close_ts: time.format_unix(round.close_timestamp as i64)?,
        lock_price: round.lock_price,
        close_price: round.close_price,
        result: result.map(|d| d.as_str().to_string()),
        total_amount: round.total_amount,
        up_amount: round.up_amount,
        down_amount: round.down_amount,
        up_payout,
        down_payout,
    };

    let event_ts = |block_number: u64| -> Result<String, EpochError> {
        let unix = block_timestamps
            .get(&block_number)
            .copied()
            .unwrap_or(round.start_timestamp);
        Ok(time.format_unix(unix as i64)?)
    };

    let mut bets = Vec::with_capacity(events.bet_count());
    for bet in events.bull.iter().chain(events.bear.iter()) {
        let outcome = result.map(|winner| {
            if bet.direction == winner {
                BetOutcome::Win
            } else {
                BetOutcome::Loss
            }
        });
        bets.push(NewBetRow {
            epoch: epoch as i64,
            bet_ts: event_ts(bet.block_number)?,
            wallet_address: bet.sender.clone(),
            direction: bet.direction,
            amount: bet.amount,
            result: outcome,
            tx_hash: bet.tx_hash.clone(),
        });
    }

    let mut claims = Vec::with_capacity(events.claims.len());
    for claim in &events.claims {
        claims.push(NewClaimRow {
            epoch: epoch as i64,
            claim_ts: event_ts(claim.block_number)?,
            wallet_address: claim.sender.clone(),
            claim_amount: claim.amount,
            bet_epoch: claim.epoch as i64,
            tx_hash: claim.tx_hash.clone(),
        });
    }

    Ok(AssembledEpoch {
        round: round_row,
        bets,
        claims,
    })
}

/// Validation before commit: the round must carry bets on both sides.
/// Claims may legitimately be empty.
pub fn check_integrity(assembled: &AssembledEpoch) -> Result<(), String> {
    let ups = assembled
        .bets
        .iter()
        .filter(|b| b.direction == BetDirection::Up)
        .count();
    let downs = assembled.bets.len() - ups;

    if ups == 0 && downs == 0 {
        return Err("no bets found in epoch window".to_string());
    }
    if ups == 0 {
        return Err("no UP bets found in epoch window".to_string());
    }
    if downs == 0 {
        return Err("no DOWN bets found in epoch window".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::market::{BetEvent, ClaimEvent};
    use rust_decimal_macros::dec;

    fn time() -> TimeService {
        TimeService::new(chrono_tz::Asia::Taipei)
    }

    fn round_view(lock_price: Decimal, close_price: Decimal) -> RoundView {
        RoundView {
            epoch: 100,
            start_timestamp: 1_625_097_600,
            lock_timestamp: 1_625_097_900,
            close_timestamp: 1_625_098_200,
            lock_price,
            close_price,
            total_amount: dec!(10),
            up_amount: dec!(6),
            down_amount: dec!(4),
            oracle_called: true,
        }
    }

    fn bet(sender: &str, direction: BetDirection, amount: Decimal, tx: &str) -> BetEvent {
        BetEvent {
            epoch: 100,
            sender: sender.to_string(),
            amount,
            tx_hash: tx.to_string(),
            block_number: 42,
            direction,
        }
    }

    fn events_two_sided() -> EpochEvents {
        EpochEvents {
            bull: vec![bet("0xaaa", BetDirection::Up, dec!(6), "0x01")],
            bear: vec![bet("0xbbb", BetDirection::Down, dec!(4), "0x02")],
            claims: vec![ClaimEvent {
                epoch: 100,
                sender: "0xaaa".to_string(),
                amount: dec!(5.82),
                tx_hash: "0x03".to_string(),
                block_number: 43,
            }],
        }
    }

    fn stamps() -> HashMap<u64, u64> {
        HashMap::from([(42, 1_625_097_700), (43, 1_625_098_100)])
    }

    #[test]
    fn winning_side_payout_matches_fee_formula() {
        let (up, down) = compute_payouts(dec!(10), dec!(6), dec!(4), Some(BetDirection::Up));
        assert_eq!(up, dec!(1.6167));
        assert_eq!(down, dec!(0));

        let (up, down) = compute_payouts(dec!(10), dec!(6), dec!(4), Some(BetDirection::Down));
        assert_eq!(up, dec!(0));
        assert_eq!(down, dec!(2.4250));
    }

    #[test]
    fn draw_pays_nobody() {
        assert_eq!(
            compute_payouts(dec!(10), dec!(6), dec!(4), None),
            (dec!(0), dec!(0))
        );
    }

    #[test]
    fn empty_winning_pool_pays_zero() {
        assert_eq!(
            compute_payouts(dec!(4), dec!(0), dec!(4), Some(BetDirection::Up)),
            (dec!(0), dec!(0))
        );
    }

    #[test]
    fn normal_epoch_assembles_results_and_provenance() {
        let round = round_view(dec!(300.00000000), dec!(301.50000000));
        let assembled =
            assemble_epoch(100, &round, &events_two_sided(), &stamps(), &time()).unwrap();

        assert_eq!(assembled.round.result.as_deref(), Some("UP"));
        assert_eq!(assembled.round.up_payout, dec!(1.6167));
        assert_eq!(assembled.round.down_payout, dec!(0));

        let up_bet = assembled
            .bets
            .iter()
            .find(|b| b.wallet_address == "0xaaa")
            .unwrap();
        assert_eq!(up_bet.result, Some(BetOutcome::Win));
        let down_bet = assembled
            .bets
            .iter()
            .find(|b| b.wallet_address == "0xbbb")
            .unwrap();
        assert_eq!(down_bet.result, Some(BetOutcome::Loss));

        let claim = &assembled.claims[0];
        assert_eq!(claim.epoch, 100);
        assert_eq!(claim.bet_epoch, 100);
        assert_eq!(claim.claim_amount, dec!(5.82));
    }

    #[test]
    fn draw_epoch_leaves_results_absent() {
        let round = round_view(dec!(300), dec!(300));
        let assembled =
            assemble_epoch(100, &round, &events_two_sided(), &stamps(), &time()).unwrap();
        assert_eq!(assembled.round.result, None);
        assert!(assembled.bets.iter().all(|b| b.result.is_none()));
        assert_eq!(assembled.round.up_payout, dec!(0));
        assert_eq!(assembled.round.down_payout, dec!(0));
    }

    #[test]
    fn bet_timestamps_come_from_event_blocks() {
        let round = round_view(dec!(300), dec!(301));
        let assembled =
            assemble_epoch(100, &round, &events_two_sided(), &stamps(), &time()).unwrap();
        // block 42 at 1_625_097_700 UTC == 08:01:40 Taipei
        assert_eq!(assembled.bets[0].bet_ts, "2021-07-01 08:01:40");
        assert_eq!(assembled.claims[0].claim_ts, "2021-07-01 08:08:20");
    }

    #[test]
    fn one_sided_epoch_fails_integrity() {
        let round = round_view(dec!(300), dec!(301));
        let events = EpochEvents {
            bull: vec![bet("0xaaa", BetDirection::Up, dec!(6), "0x01")],
            bear: vec![],
            claims: vec![],
        };
        let assembled = assemble_epoch(100, &round, &events, &stamps(), &time()).unwrap();
        let err = check_integrity(&assembled).unwrap_err();
        assert!(err.contains("DOWN"));
    }

    #[test]
    fn two_sided_epoch_passes_integrity_without_claims() {
        let round = round_view(dec!(300), dec!(301));
        let mut events = events_two_sided();
        events.claims.clear();
        let assembled = assemble_epoch(100, &round, &events, &stamps(), &time()).unwrap();
        assert!(check_integrity(&assembled).is_ok());
    }

    #[derive(Default)]
    struct FakeLedger {
        counts: std::sync::Mutex<HashMap<u64, i32>>,
        cleared: std::sync::Mutex<Vec<u64>>,
    }

    impl FailureLedger for FakeLedger {
        fn failure_count(&self, epoch: u64) -> impl Future<Output = Result<i32, StoreError>> + Send {
            async move { Ok(self.counts.lock().unwrap().get(&epoch).copied().unwrap_or(0)) }
        }

        fn record_failure(
            &self,
            epoch: u64,
            _reason: &str,
            _attempt_ts: &str,
        ) -> impl Future<Output = Result<i32, StoreError>> + Send {
            async move {
                let mut counts = self.counts.lock().unwrap();
                let count = counts.entry(epoch).or_insert(0);
                *count += 1;
                Ok(*count)
            }
        }

        fn clear_epoch_rows(
            &self,
            epoch: u64,
        ) -> impl Future<Output = Result<(), StoreError>> + Send {
            async move {
                self.cleared.lock().unwrap().push(epoch);
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn third_strike_quarantines_the_epoch() {
        let ledger = FakeLedger::default();

        for attempt in 1..=2 {
            let count =
                register_integrity_failure(&ledger, 100, "no DOWN bets", "2024-05-01 12:00:00")
                    .await
                    .unwrap();
            assert_eq!(count, attempt);
            assert!(!is_quarantined(&ledger, 100).await.unwrap());
        }

        let count =
            register_integrity_failure(&ledger, 100, "no DOWN bets", "2024-05-01 12:00:00")
                .await
                .unwrap();
        assert_eq!(count, MAX_FAILURES);
        assert!(is_quarantined(&ledger, 100).await.unwrap());

        // Every attempt wiped the partial row set before recording a strike.
        assert_eq!(ledger.cleared.lock().unwrap().as_slice(), &[100, 100, 100]);
    }

    #[tokio::test]
    async fn strike_counts_are_tracked_per_epoch() {
        let ledger = FakeLedger::default();

        for _ in 0..3 {
            register_integrity_failure(&ledger, 100, "no UP bets", "2024-05-01 12:00:00")
                .await
                .unwrap();
        }
        register_integrity_failure(&ledger, 101, "no UP bets", "2024-05-01 12:05:00")
            .await
            .unwrap();

        assert!(is_quarantined(&ledger, 100).await.unwrap());
        assert!(!is_quarantined(&ledger, 101).await.unwrap());
        assert!(!is_quarantined(&ledger, 102).await.unwrap());
    }
}
