//! Pull surface of the chain facade.
//!
//! Rate-limited, retrying HTTP access to the prediction contract: round
//! views, the current epoch, block lookups, the block-by-timestamp
//! bisection, and ranged event queries for BetBull / BetBear / Claim.

use crate::error::ChainError;
use crate::models::market::{BetDirection, BetEvent, ClaimEvent, EpochEvents, RoundView};
use crate::services::rate_limit::RateLimiter;
use alloy::{
    eips::BlockNumberOrTag,
    primitives::{Address, I256, U256},
    providers::{DynProvider, Provider, ProviderBuilder},
    rpc::types::{Filter, Log},
    sol,
    sol_types::SolEvent,
};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

sol! {
    #[sol(rpc)]
    interface IPrediction {
        function currentEpoch() external view returns (uint256);

        function rounds(uint256 epoch) external view returns (
            uint256 epoch_,
            uint256 startTimestamp,
            uint256 lockTimestamp,
            uint256 closeTimestamp,
            int256 lockPrice,
            int256 closePrice,
            uint256 lockOracleId,
            uint256 closeOracleId,
            uint256 totalAmount,
            uint256 bullAmount,
            uint256 bearAmount,
            uint256 rewardBaseCalAmount,
            uint256 rewardAmount,
            bool oracleCalled
        );

        event BetBull(address indexed sender, uint256 indexed epoch, uint256 amount);
        event BetBear(address indexed sender, uint256 indexed epoch, uint256 amount);
        event Claim(address indexed sender, uint256 indexed epoch, uint256 amount);
        event StartRound(uint256 indexed epoch);
        event LockRound(uint256 indexed epoch, uint256 indexed roundId, int256 price);
    }
}

/// Oracle prices carry 8 fractional digits, pool amounts 18.
const PRICE_SCALE: u32 = 8;
const AMOUNT_SCALE: u32 = 18;

/// Largest value representable in a `Decimal` mantissa (96 bits).
const MANTISSA_MAX: i128 = (1i128 << 96) - 1;

/// Linear backoff: `base_delay * attempt`, up to `attempts` tries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub number: u64,
    pub timestamp: u64,
}

pub struct ChainClient {
    provider: DynProvider,
    contract: Address,
    limiter: RateLimiter,
    retry: RetryPolicy,
}

impl ChainClient {
    pub fn new(rpc_url: &str, contract: &str, rate_limit_rps: u32) -> Result<Self, ChainError> {
        let url = rpc_url
            .parse()
            .map_err(|_| ChainError::InvalidEndpoint(rpc_url.to_string()))?;
        let provider = ProviderBuilder::new().connect_http(url).erased();
        let contract = Address::from_str(contract)
            .map_err(|_| ChainError::InvalidAddress(contract.to_string()))?;
        Ok(Self {
            provider,
            contract,
            limiter: RateLimiter::new(rate_limit_rps),
            retry: RetryPolicy::default(),
        })
    }

    pub fn contract_address(&self) -> Address {
        self.contract
    }

    async fn with_retry<T, E, F, Fut>(&self, op: &'static str, mut f: F) -> Result<T, ChainError>
    where
        E: std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let mut last = String::new();
        for attempt in 1..=self.retry.attempts {
            self.limiter.acquire().await;
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    last = e.to_string();
                    warn!(op, attempt, error = %last, "chain request failed");
                    if attempt < self.retry.attempts {
                        tokio::time::sleep(self.retry.delay(attempt)).await;
                    }
                }
            }
        }
        Err(ChainError::RequestFailed {
            attempts: self.retry.attempts,
            message: format!("{op}: {last}"),
        })
    }

    pub async fn current_epoch(&self) -> Result<u64, ChainError> {
        let contract = IPrediction::new(self.contract, &self.provider);
        let ret = self
            .with_retry("currentEpoch", || async {
                contract.currentEpoch().call().await
            })
            .await?;
        u256_to_u64(ret, "currentEpoch")
    }

    /// Read the `rounds(epoch)` view and convert its fixed-point fields.
    pub async fn round(&self, epoch: u64) -> Result<RoundView, ChainError> {
        let contract = IPrediction::new(self.contract, &self.provider);
        let ret = self
            .with_retry("rounds", || async {
                contract.rounds(U256::from(epoch)).call().await
            })
            .await?;
        Ok(RoundView {
            epoch,
            start_timestamp: u256_to_u64(ret.startTimestamp, "startTimestamp")?,
            lock_timestamp: u256_to_u64(ret.lockTimestamp, "lockTimestamp")?,
            close_timestamp: u256_to_u64(ret.closeTimestamp, "closeTimestamp")?,
            lock_price: price_to_decimal(ret.lockPrice),
            close_price: price_to_decimal(ret.closePrice),
            total_amount: wei_to_decimal(ret.totalAmount),
            up_amount: wei_to_decimal(ret.bullAmount),
            down_amount: wei_to_decimal(ret.bearAmount),
            oracle_called: ret.oracleCalled,
        })
    }

    pub async fn block_number(&self) -> Result<u64, ChainError> {
        self.with_retry("blockNumber", || async {
            self.provider.get_block_number().await
        })
        .await
    }

    pub async fn block(&self, number: u64) -> Result<BlockInfo, ChainError> {
        let block = self
            .with_retry("getBlock", || async {
                self.provider
                    .get_block_by_number(BlockNumberOrTag::Number(number))
                    .await
            })
            .await?;
        match block {
            Some(block) => Ok(BlockInfo {
                number,
                timestamp: block.header.timestamp,
            }),
            None => Err(ChainError::RangeOutOfBounds { target: number }),
        }
    }

    /// Bisect `[1, currentBlock]` for the block whose timestamp is closest
    /// to `target_ts`. Exact hits return immediately; ties resolve to the
    /// earlier block.
    pub async fn find_block_by_timestamp(&self, target_ts: u64) -> Result<u64, ChainError> {
        let mut lo = 1u64;
        let mut hi = self.block_number().await?;
        if hi == 0 {
            return Err(ChainError::RangeOutOfBounds { target: target_ts });
        }

        let mut best: Option<(u64, u64)> = None;
        while lo <= hi {
            let mid = lo + (hi - lo) / 2;
            let block = self.block(mid).await?;
            let diff = block.timestamp.abs_diff(target_ts);

            if improves_candidate(best, mid, diff) {
                best = Some((mid, diff));
            }

            if block.timestamp == target_ts {
                return Ok(mid);
            }
            if block.timestamp < target_ts {
                lo = mid + 1;
            } else {
                if mid == 1 {
                    break;
                }
                hi = mid - 1;
            }
        }

        best.map(|(block, _)| block)
            .ok_or(ChainError::RangeOutOfBounds { target: target_ts })
    }

    /// Fetch the three event streams of one ingestion window. The three
    /// range queries run concurrently; the shared limiter paces them.
    pub async fn fetch_events(&self, from: u64, to: u64) -> Result<EpochEvents, ChainError> {
        let base = Filter::new()
            .address(self.contract)
            .from_block(from)
            .to_block(to);

        let bull_filter = base.clone().event_signature(IPrediction::BetBull::SIGNATURE_HASH);
        let bear_filter = base.clone().event_signature(IPrediction::BetBear::SIGNATURE_HASH);
        let claim_filter = base.event_signature(IPrediction::Claim::SIGNATURE_HASH);

        let (bull_logs, bear_logs, claim_logs) = tokio::join!(
            self.get_logs("getLogs.BetBull", &bull_filter),
            self.get_logs("getLogs.BetBear", &bear_filter),
            self.get_logs("getLogs.Claim", &claim_filter),
        );

        let (bull_logs, bear_logs, claim_logs) = (bull_logs?, bear_logs?, claim_logs?);
        let mut events = EpochEvents::default();
        for log in &bull_logs {
            events.bull.push(decode_bet_log(log, BetDirection::Up)?);
        }
        for log in &bear_logs {
            events.bear.push(decode_bet_log(log, BetDirection::Down)?);
        }
        for log in &claim_logs {
            events.claims.push(decode_claim_log(log)?);
        }

        debug!(
            from,
            to,
            bull = events.bull.len(),
            bear = events.bear.len(),
            claims = events.claims.len(),
            "fetched epoch event window"
        );
        Ok(events)
    }

    async fn get_logs(&self, op: &'static str, filter: &Filter) -> Result<Vec<Log>, ChainError> {
        self.with_retry(op, || async { self.provider.get_logs(filter).await })
            .await
    }
}

/// Closest-block selection rule for the bisection: smaller distance wins,
/// and on equal distance the earlier block wins.
fn improves_candidate(best: Option<(u64, u64)>, block: u64, diff: u64) -> bool {
    match best {
        None => true,
        Some((best_block, best_diff)) => diff < best_diff || (diff == best_diff && block < best_block),
    }
}

/// All three prediction events share one layout: `sender` in topic 1,
/// `epoch` in topic 2, `amount` as the sole data word.
fn decode_sender_epoch_amount(log: &Log) -> Result<(String, u64, Decimal, String, u64), ChainError> {
    let tx_hash = log
        .transaction_hash
        .map(|h| format!("{h:#x}"))
        .unwrap_or_default();
    let bad = |reason: &str| ChainError::BadEvent {
        tx_hash: tx_hash.clone(),
        reason: reason.to_string(),
    };

    let topics = log.topics();
    if topics.len() < 3 {
        return Err(bad("missing indexed parameters"));
    }
    let sender = Address::from_slice(&topics[1][12..]);
    let epoch = u256_to_u64(U256::from_be_bytes(topics[2].0), "event epoch")?;

    let data = &log.data().data;
    if data.len() < 32 {
        return Err(bad("missing amount word"));
    }
    let raw: [u8; 32] = data[0..32].try_into().map_err(|_| bad("short data word"))?;
    let amount = wei_to_decimal(U256::from_be_bytes(raw));

    Ok((
        format!("{sender:#x}"),
        epoch,
        amount,
        tx_hash,
        log.block_number.unwrap_or_default(),
    ))
}

pub(crate) fn decode_bet_log(log: &Log, direction: BetDirection) -> Result<BetEvent, ChainError> {
    let (sender, epoch, amount, tx_hash, block_number) = decode_sender_epoch_amount(log)?;
    Ok(BetEvent {
        epoch,
        sender,
        amount,
        tx_hash,
        block_number,
        direction,
    })
}

pub(crate) fn decode_claim_log(log: &Log) -> Result<ClaimEvent, ChainError> {
    let (sender, epoch, amount, tx_hash, block_number) = decode_sender_epoch_amount(log)?;
    Ok(ClaimEvent {
        epoch,
        sender,
        amount,
        tx_hash,
        block_number,
    })
}

fn u256_to_u64(value: U256, field: &str) -> Result<u64, ChainError> {
    u64::try_from(value).map_err(|_| ChainError::BadEvent {
        tx_hash: String::new(),
        reason: format!("{field} out of u64 range: {value}"),
    })
}

/// 18-decimal wei quantity to `Decimal`. Values past the 96-bit mantissa
/// cannot occur for real pool sizes; they are clamped to zero with a log
/// line rather than panicking mid-pipeline.
pub(crate) fn wei_to_decimal(value: U256) -> Decimal {
    match u128::try_from(value) {
        Ok(v) if v <= MANTISSA_MAX as u128 => {
            Decimal::from_i128_with_scale(v as i128, AMOUNT_SCALE)
        }
        _ => {
            warn!(%value, "amount exceeds decimal mantissa, storing zero");
            Decimal::ZERO
        }
    }
}

/// 8-decimal signed oracle price to `Decimal`.
pub(crate) fn price_to_decimal(value: I256) -> Decimal {
    match i128::try_from(value) {
        Ok(v) if v.abs() <= MANTISSA_MAX => Decimal::from_i128_with_scale(v, PRICE_SCALE),
        _ => {
            warn!(%value, "price exceeds decimal mantissa, storing zero");
            Decimal::ZERO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn wei_conversion_uses_18_digits() {
        assert_eq!(
            wei_to_decimal(U256::from(1_500_000_000_000_000_000u128)),
            dec!(1.5)
        );
        assert_eq!(wei_to_decimal(U256::ZERO), Decimal::ZERO);
    }

    #[test]
    fn price_conversion_uses_8_digits() {
        assert_eq!(price_to_decimal(I256::try_from(30_000_000_000i64).unwrap()), dec!(300));
        assert_eq!(
            price_to_decimal(I256::try_from(-12_345_678i64).unwrap()),
            dec!(-0.12345678)
        );
    }

    #[test]
    fn oversized_amounts_clamp_to_zero() {
        assert_eq!(wei_to_decimal(U256::MAX), Decimal::ZERO);
        // Values in [2^127, 2^128) fit u128 but not the mantissa; they must
        // clamp instead of wrapping into a negative i128.
        assert_eq!(wei_to_decimal(U256::from(1u128 << 127)), Decimal::ZERO);
        assert_eq!(wei_to_decimal(U256::from(u128::MAX)), Decimal::ZERO);
        assert_eq!(
            wei_to_decimal(U256::from((1u128 << 96) - 1)),
            Decimal::from_i128_with_scale((1i128 << 96) - 1, 18)
        );
    }

    #[test]
    fn retry_policy_backs_off_linearly() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
        assert_eq!(policy.delay(3), Duration::from_secs(6));
    }

    #[test]
    fn closer_blocks_replace_the_candidate() {
        assert!(improves_candidate(None, 50, 7));
        assert!(improves_candidate(Some((50, 7)), 80, 3));
        assert!(!improves_candidate(Some((80, 3)), 90, 5));
    }

    #[test]
    fn equal_distance_resolves_to_earlier_block() {
        assert!(improves_candidate(Some((80, 3)), 79, 3));
        assert!(!improves_candidate(Some((79, 3)), 80, 3));
    }

    #[test]
    fn event_signatures_are_distinct() {
        let topics = [
            IPrediction::BetBull::SIGNATURE_HASH,
            IPrediction::BetBear::SIGNATURE_HASH,
            IPrediction::Claim::SIGNATURE_HASH,
            IPrediction::StartRound::SIGNATURE_HASH,
            IPrediction::LockRound::SIGNATURE_HASH,
        ];
        for (i, a) in topics.iter().enumerate() {
            for b in &topics[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
