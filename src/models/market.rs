//! Core domain types shared by the historical and real-time pipelines.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which side of the round a bet was placed on. Maps 1:1 to the on-chain
/// "bull" / "bear" vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BetDirection {
    Up,
    Down,
}

impl BetDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            BetDirection::Up => "UP",
            BetDirection::Down => "DOWN",
        }
    }
}

impl fmt::Display for BetDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BetDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UP" => Ok(BetDirection::Up),
            "DOWN" => Ok(BetDirection::Down),
            other => Err(format!("unknown bet direction: {other}")),
        }
    }
}

/// Outcome of a single historical bet relative to the round result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BetOutcome {
    Win,
    Loss,
}

impl BetOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            BetOutcome::Win => "WIN",
            BetOutcome::Loss => "LOSS",
        }
    }
}

/// Lifecycle phase of a round, derived from which of its on-chain fields
/// have been populated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundStatus {
    Pending,
    Betting,
    Locked,
    Ended,
}

/// Snapshot of the on-chain `rounds(epoch)` view, with raw fixed-point
/// values already converted to decimals (prices carry 8 fractional digits,
/// pool amounts 18).
#[derive(Debug, Clone, PartialEq)]
pub struct RoundView {
    pub epoch: u64,
    pub start_timestamp: u64,
    pub lock_timestamp: u64,
    pub close_timestamp: u64,
    pub lock_price: Decimal,
    pub close_price: Decimal,
    pub total_amount: Decimal,
    pub up_amount: Decimal,
    pub down_amount: Decimal,
    pub oracle_called: bool,
}

impl RoundView {
    /// A round only becomes visible to the historical pipeline once it has
    /// closed on-chain.
    pub fn is_closed(&self) -> bool {
        self.close_timestamp != 0
    }

    pub fn has_started(&self) -> bool {
        self.start_timestamp != 0
    }

    /// Winning direction, or `None` when lock and close price are equal
    /// (a draw).
    pub fn result(&self) -> Option<BetDirection> {
        if self.close_price > self.lock_price {
            Some(BetDirection::Up)
        } else if self.close_price < self.lock_price {
            Some(BetDirection::Down)
        } else {
            None
        }
    }

    pub fn status(&self) -> RoundStatus {
        if self.close_timestamp != 0 && !self.close_price.is_zero() {
            RoundStatus::Ended
        } else if self.lock_timestamp != 0 && !self.lock_price.is_zero() {
            RoundStatus::Locked
        } else if self.start_timestamp != 0 {
            RoundStatus::Betting
        } else {
            RoundStatus::Pending
        }
    }
}

/// A decoded BetBull / BetBear log.
#[derive(Debug, Clone)]
pub struct BetEvent {
    pub epoch: u64,
    /// Lowercased hex wallet address.
    pub sender: String,
    pub amount: Decimal,
    pub tx_hash: String,
    pub block_number: u64,
    pub direction: BetDirection,
}

/// A decoded Claim log. `epoch` here is the epoch the payout is *for*
/// (the event's own epoch argument); the processing epoch is assigned by
/// the pipeline when the row is assembled.
#[derive(Debug, Clone)]
pub struct ClaimEvent {
    pub epoch: u64,
    pub sender: String,
    pub amount: Decimal,
    pub tx_hash: String,
    pub block_number: u64,
}

/// The three event streams of one epoch's ingestion window.
#[derive(Debug, Clone, Default)]
pub struct EpochEvents {
    pub bull: Vec<BetEvent>,
    pub bear: Vec<BetEvent>,
    pub claims: Vec<ClaimEvent>,
}

impl EpochEvents {
    pub fn bet_count(&self) -> usize {
        self.bull.len() + self.bear.len()
    }
}

/// Typed events emitted by the push surface of the chain facade.
#[derive(Debug, Clone)]
pub enum ChainEvent {
    BetBull(BetEvent),
    BetBear(BetEvent),
    StartRound(u64),
    LockRound(u64),
    Connected,
    Disconnected { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn view(lock: Decimal, close: Decimal) -> RoundView {
        RoundView {
            epoch: 100,
            start_timestamp: 1_700_000_000,
            lock_timestamp: 1_700_000_300,
            close_timestamp: 1_700_000_600,
            lock_price: lock,
            close_price: close,
            total_amount: dec!(10),
            up_amount: dec!(6),
            down_amount: dec!(4),
            oracle_called: true,
        }
    }

    #[test]
    fn result_up_when_price_rose() {
        assert_eq!(
            view(dec!(300.0), dec!(301.5)).result(),
            Some(BetDirection::Up)
        );
    }

    #[test]
    fn result_down_when_price_fell() {
        assert_eq!(
            view(dec!(300.0), dec!(299.9)).result(),
            Some(BetDirection::Down)
        );
    }

    #[test]
    fn draw_has_no_result() {
        assert_eq!(view(dec!(300.0), dec!(300.0)).result(), None);
    }

    #[test]
    fn direction_round_trips_through_str() {
        assert_eq!("UP".parse::<BetDirection>().unwrap(), BetDirection::Up);
        assert_eq!("DOWN".parse::<BetDirection>().unwrap(), BetDirection::Down);
        assert!("SIDEWAYS".parse::<BetDirection>().is_err());
        assert_eq!(BetDirection::Up.to_string(), "UP");
    }

    #[test]
    fn status_follows_populated_fields() {
        let mut v = view(dec!(300), dec!(301));
        assert_eq!(v.status(), RoundStatus::Ended);
        v.close_price = dec!(0);
        v.close_timestamp = 0;
        assert_eq!(v.status(), RoundStatus::Locked);
        v.lock_price = dec!(0);
        assert_eq!(v.status(), RoundStatus::Betting);
        v.start_timestamp = 0;
        assert_eq!(v.status(), RoundStatus::Pending);
    }
}
