//! Push surface of the chain facade.
//!
//! Subscribes to the streaming RPC endpoint for live BetBull / BetBear /
//! StartRound / LockRound logs and emits typed `ChainEvent`s over a tokio
//! channel. Sessions reconnect after a bounded delay; bets missed during
//! an outage are recovered by the historical pipeline once the epoch
//! closes.

use crate::models::market::{BetDirection, ChainEvent};
use crate::services::chain::{decode_bet_log, IPrediction};
use alloy::{
    primitives::Address,
    providers::{Provider, ProviderBuilder, WsConnect},
    rpc::types::Filter,
    sol_types::SolEvent,
};
use futures_util::StreamExt;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ChainStream {
    ws_url: String,
    contract: Address,
    /// Delay before the first reconnect attempt.
    reconnect_base: Duration,
    /// Exponential growth stops after this many failed attempts; further
    /// retries keep the capped interval.
    max_backoff_attempts: u32,
}

impl ChainStream {
    pub fn new(ws_url: &str, contract: &str) -> Result<Self, crate::error::ChainError> {
        let contract = Address::from_str(contract)
            .map_err(|_| crate::error::ChainError::InvalidAddress(contract.to_string()))?;
        Ok(Self {
            ws_url: ws_url.to_string(),
            contract,
            reconnect_base: Duration::from_secs(10),
            max_backoff_attempts: 5,
        })
    }

    /// Spawn the subscription loop. Events arrive on `tx` until `stop` is
    /// cancelled; the task reconnects on every socket close.
    pub fn start(
        self,
        tx: mpsc::UnboundedSender<ChainEvent>,
        stop: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run_forever(tx, stop).await;
        })
    }

    async fn run_forever(&self, tx: mpsc::UnboundedSender<ChainEvent>, stop: CancellationToken) {
        let mut consecutive_failures: u32 = 0;

        loop {
            if stop.is_cancelled() {
                break;
            }

            info!(url = %self.ws_url, "connecting to streaming rpc");
            match self.run_session(&tx, &stop).await {
                Ok(()) => {
                    if stop.is_cancelled() {
                        break;
                    }
                    info!("streaming session ended, reconnecting");
                    let _ = tx.send(ChainEvent::Disconnected {
                        reason: "stream ended".to_string(),
                    });
                    consecutive_failures = 0;
                }
                Err(e) => {
                    error!(error = %e, "streaming session error");
                    let _ = tx.send(ChainEvent::Disconnected {
                        reason: e.to_string(),
                    });
                    consecutive_failures += 1;
                    if consecutive_failures == self.max_backoff_attempts {
                        warn!(
                            attempts = consecutive_failures,
                            "reconnect attempts exhausted, holding at capped interval"
                        );
                    }
                }
            }

            let backoff = self.backoff(consecutive_failures);
            debug!(backoff_secs = backoff.as_secs(), "scheduling reconnect");
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
        }

        info!("streaming subscription stopped");
    }

    fn backoff(&self, failures: u32) -> Duration {
        let exp = failures
            .saturating_sub(1)
            .min(self.max_backoff_attempts.saturating_sub(1));
        self.reconnect_base * 2u32.saturating_pow(exp)
    }

    /// One WebSocket session: connect, subscribe, forward events until the
    /// stream closes or the stop token fires.
    async fn run_session(
        &self,
        tx: &mpsc::UnboundedSender<ChainEvent>,
        stop: &CancellationToken,
    ) -> anyhow::Result<()> {
        let ws = WsConnect::new(&self.ws_url);
        let provider = ProviderBuilder::new().connect_ws(ws).await?;

        let filter = Filter::new().address(self.contract).event_signature(vec![
            IPrediction::BetBull::SIGNATURE_HASH,
            IPrediction::BetBear::SIGNATURE_HASH,
            IPrediction::StartRound::SIGNATURE_HASH,
            IPrediction::LockRound::SIGNATURE_HASH,
        ]);

        let sub = provider.subscribe_logs(&filter).await?;
        let mut stream = sub.into_stream();

        let _ = tx.send(ChainEvent::Connected);
        info!("subscribed to live prediction events");

        loop {
            tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                log = stream.next() => {
                    let Some(log) = log else { return Ok(()) };
                    let Some(topic0) = log.topic0().copied() else {
                        debug!("log without topic0, skipping");
                        continue;
                    };

                    let event = if topic0 == IPrediction::BetBull::SIGNATURE_HASH {
                        decode_bet_log(&log, BetDirection::Up).map(ChainEvent::BetBull)
                    } else if topic0 == IPrediction::BetBear::SIGNATURE_HASH {
                        decode_bet_log(&log, BetDirection::Down).map(ChainEvent::BetBear)
                    } else if topic0 == IPrediction::StartRound::SIGNATURE_HASH {
                        decode_epoch_only(&log).map(ChainEvent::StartRound)
                    } else if topic0 == IPrediction::LockRound::SIGNATURE_HASH {
                        decode_epoch_only(&log).map(ChainEvent::LockRound)
                    } else {
                        debug!(topic = %topic0, "unrecognised event topic");
                        continue;
                    };

                    match event {
                        Ok(event) => {
                            let _ = tx.send(event);
                        }
                        Err(e) => warn!(error = %e, "failed to decode live log"),
                    }
                }
            }
        }
    }
}

/// StartRound / LockRound carry the epoch as their first indexed topic.
fn decode_epoch_only(log: &alloy::rpc::types::Log) -> Result<u64, crate::error::ChainError> {
    use alloy::primitives::U256;

    let topics = log.topics();
    if topics.len() < 2 {
        return Err(crate::error::ChainError::BadEvent {
            tx_hash: log
                .transaction_hash
                .map(|h| format!("{h:#x}"))
                .unwrap_or_default(),
            reason: "missing epoch topic".to_string(),
        });
    }
    let epoch = U256::from_be_bytes(topics[1].0);
    u64::try_from(epoch).map_err(|_| crate::error::ChainError::BadEvent {
        tx_hash: String::new(),
        reason: format!("epoch out of range: {epoch}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_then_caps() {
        let stream = ChainStream {
            ws_url: "wss://example".to_string(),
            contract: Address::ZERO,
            reconnect_base: Duration::from_secs(10),
            max_backoff_attempts: 5,
        };
        assert_eq!(stream.backoff(0), Duration::from_secs(10));
        assert_eq!(stream.backoff(1), Duration::from_secs(10));
        assert_eq!(stream.backoff(2), Duration::from_secs(20));
        assert_eq!(stream.backoff(5), Duration::from_secs(160));
        assert_eq!(stream.backoff(12), Duration::from_secs(160));
    }
}
