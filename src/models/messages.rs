//! JSON messages exchanged with fan-out clients.
//!
//! Live `NewBet` messages are broadcast *before* the hot-table insert; a
//! failed insert therefore leaves clients with a bet the `real_bets` table
//! never saw. This is a deliberate latency trade-off; consumers that need
//! the authoritative record must read the historical tables.

use crate::models::market::{BetDirection, RoundStatus};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Server → client messages, tagged with a `type` field.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FanoutMessage {
    #[serde(rename_all = "camelCase")]
    Welcome {
        message: String,
        timestamp: String,
        client_count: usize,
    },
    #[serde(rename_all = "camelCase")]
    NewBet {
        wallet: String,
        epoch: u64,
        direction: BetDirection,
        amount: Decimal,
        timestamp: String,
        suspicious: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        flags: Option<Vec<String>>,
    },
    #[serde(rename_all = "camelCase")]
    RoundUpdate {
        epoch: u64,
        status: RoundStatus,
        start_timestamp: u64,
        lock_timestamp: u64,
        close_timestamp: u64,
        lock_price: Decimal,
        close_price: Decimal,
        total_amount: Decimal,
        bull_amount: Decimal,
        bear_amount: Decimal,
        timestamp: String,
    },
    #[serde(rename_all = "camelCase")]
    RoundLock { epoch: u64, timestamp: String },
    #[serde(rename_all = "camelCase")]
    ConnectionStatus { connected: bool, timestamp: String },
    #[serde(rename_all = "camelCase")]
    SuspiciousActivity {
        wallet: String,
        epoch: u64,
        direction: BetDirection,
        amount: Decimal,
        flags: Vec<String>,
        total_bets: u64,
        total_amount: Decimal,
        timestamp: String,
    },
    #[serde(rename_all = "camelCase")]
    Pong { timestamp: String },
}

/// Client → server messages.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn new_bet_serializes_with_snake_type_and_camel_fields() {
        let msg = FanoutMessage::NewBet {
            wallet: "0xabc".to_string(),
            epoch: 42,
            direction: BetDirection::Up,
            amount: dec!(1.25),
            timestamp: "2024-05-01 12:00:00".to_string(),
            suspicious: false,
            flags: None,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "new_bet");
        assert_eq!(json["direction"], "UP");
        assert_eq!(json["amount"], "1.25");
        assert!(json.get("flags").is_none());
    }

    #[test]
    fn round_update_uses_camel_case_keys() {
        let msg = FanoutMessage::RoundUpdate {
            epoch: 7,
            status: RoundStatus::Betting,
            start_timestamp: 1,
            lock_timestamp: 2,
            close_timestamp: 0,
            lock_price: dec!(0),
            close_price: dec!(0),
            total_amount: dec!(3),
            bull_amount: dec!(2),
            bear_amount: dec!(1),
            timestamp: "2024-05-01 12:00:00".to_string(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "round_update");
        assert_eq!(json["status"], "betting");
        assert!(json.get("startTimestamp").is_some());
        assert!(json.get("bullAmount").is_some());
    }

    #[test]
    fn ping_parses_from_client_json() {
        let parsed: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(parsed, ClientMessage::Ping));
    }
}
