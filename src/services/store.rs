//! Transactional Postgres access.
//!
//! The store is the single writer for every table in the system. Writes
//! are idempotent by natural key: rounds by `epoch`, historical bets and
//! claims by `tx_hash`, multi-claim findings by `(epoch, wallet)`. The
//! per-epoch commit is one database transaction; a rollback leaves no
//! partial round behind.
//!
//! Connection discipline: one pool per process. When an operation fails
//! the pool is marked unhealthy and re-established before the next call.

use crate::entities::prelude::*;
use crate::entities::{
    claims, failed_epochs, his_bets, multi_claims, real_bets, rounds, wallet_notes,
};
use crate::error::StoreError;
use crate::models::market::{BetDirection, BetOutcome};
use rust_decimal::Decimal;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Database, DatabaseConnection, EntityTrait, NotSet,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Insert payload for one historical bet row.
#[derive(Debug, Clone)]
pub struct NewBetRow {
    pub epoch: i64,
    pub bet_ts: String,
    pub wallet_address: String,
    pub direction: BetDirection,
    pub amount: Decimal,
    pub result: Option<BetOutcome>,
    pub tx_hash: String,
}

/// Insert payload for one claim row. `epoch` is the processing epoch,
/// `bet_epoch` the payout's provenance.
#[derive(Debug, Clone)]
pub struct NewClaimRow {
    pub epoch: i64,
    pub claim_ts: String,
    pub wallet_address: String,
    pub claim_amount: Decimal,
    pub bet_epoch: i64,
    pub tx_hash: String,
}

pub struct Store {
    database_url: String,
    db: RwLock<DatabaseConnection>,
    unhealthy: AtomicBool,
}

impl Store {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let db = Database::connect(database_url).await?;
        Ok(Self {
            database_url: database_url.to_string(),
            db: RwLock::new(db),
            unhealthy: AtomicBool::new(false),
        })
    }

    /// Hand out a pool handle, re-establishing the connection first if a
    /// previous operation flagged it.
    async fn conn(&self) -> Result<DatabaseConnection, StoreError> {
        if self.unhealthy.load(Ordering::SeqCst) {
            self.reconnect().await?;
        }
        Ok(self.db.read().await.clone())
    }

    async fn reconnect(&self) -> Result<(), StoreError> {
        warn!("database pool flagged unhealthy, reconnecting");
        let fresh = Database::connect(&self.database_url).await?;
        *self.db.write().await = fresh;
        self.unhealthy.store(false, Ordering::SeqCst);
        info!("database pool re-established");
        Ok(())
    }

    fn flag<T>(&self, result: Result<T, sea_orm::DbErr>) -> Result<T, StoreError> {
        result.map_err(|e| {
            self.unhealthy.store(true, Ordering::SeqCst);
            StoreError::Unavailable(e)
        })
    }

    /// Liveness probe (`SELECT 1`).
    pub async fn ping(&self) -> bool {
        match self.conn().await {
            Ok(db) => db.ping().await.is_ok(),
            Err(_) => false,
        }
    }

    // ── rounds ──────────────────────────────────────────────────────────

    pub async fn round_exists(&self, epoch: u64) -> Result<bool, StoreError> {
        let db = self.conn().await?;
        let found = self.flag(
            Rounds::find_by_id(epoch as i64).one(&db).await,
        )?;
        Ok(found.is_some())
    }

    pub async fn rounds_in_range(&self, from: u64, to: u64) -> Result<Vec<rounds::Model>, StoreError> {
        let db = self.conn().await?;
        self.flag(
            Rounds::find()
                .filter(rounds::Column::Epoch.between(from as i64, to as i64))
                .order_by_asc(rounds::Column::Epoch)
                .all(&db)
                .await,
        )
    }

    /// Atomic commit of one closed epoch: round row, all its bets, all its
    /// claims. Conflicting natural keys are ignored so re-processing an
    /// epoch yields the same row set.
    pub async fn commit_epoch(
        &self,
        round: rounds::Model,
        bets: Vec<NewBetRow>,
        claims: Vec<NewClaimRow>,
    ) -> Result<(), StoreError> {
        let db = self.conn().await?;
        let result: Result<(), sea_orm::DbErr> = async {
            let txn = db.begin().await?;

            let epoch = round.epoch;
            let round_am = rounds::ActiveModel {
                epoch: Set(round.epoch),
                start_ts: Set(round.start_ts),
                lock_ts: Set(round.lock_ts),
                close_ts: Set(round.close_ts),
                lock_price: Set(round.lock_price),
                close_price: Set(round.close_price),
                result: Set(round.result),
                total_amount: Set(round.total_amount),
                up_amount: Set(round.up_amount),
                down_amount: Set(round.down_amount),
                up_payout: Set(round.up_payout),
                down_payout: Set(round.down_payout),
            };
            Rounds::insert(round_am)
                .on_conflict(
                    OnConflict::column(rounds::Column::Epoch)
                        .update_columns([
                            rounds::Column::StartTs,
                            rounds::Column::LockTs,
                            rounds::Column::CloseTs,
                            rounds::Column::LockPrice,
                            rounds::Column::ClosePrice,
                            rounds::Column::Result,
                            rounds::Column::TotalAmount,
                            rounds::Column::UpAmount,
                            rounds::Column::DownAmount,
                            rounds::Column::UpPayout,
                            rounds::Column::DownPayout,
                        ])
                        .to_owned(),
                )
                .exec_without_returning(&txn)
                .await?;

            if !bets.is_empty() {
                let models = bets.into_iter().map(|b| his_bets::ActiveModel {
                    id: NotSet,
                    epoch: Set(b.epoch),
                    bet_ts: Set(b.bet_ts),
                    wallet_address: Set(b.wallet_address),
                    bet_direction: Set(b.direction.as_str().to_string()),
                    amount: Set(b.amount),
                    result: Set(b.result.map(|r| r.as_str().to_string())),
                    tx_hash: Set(b.tx_hash),
                });
                HisBets::insert_many(models)
                    .on_conflict(
                        OnConflict::column(his_bets::Column::TxHash)
                            .do_nothing()
                            .to_owned(),
                    )
                    .exec_without_returning(&txn)
                    .await?;
            }

            if !claims.is_empty() {
                let models = claims.into_iter().map(|c| claims::ActiveModel {
                    id: NotSet,
                    epoch: Set(c.epoch),
                    claim_ts: Set(c.claim_ts),
                    wallet_address: Set(c.wallet_address),
                    claim_amount: Set(c.claim_amount),
                    bet_epoch: Set(c.bet_epoch),
                    tx_hash: Set(c.tx_hash),
                });
                Claims::insert_many(models)
                    .on_conflict(
                        OnConflict::column(claims::Column::TxHash)
                            .do_nothing()
                            .to_owned(),
                    )
                    .exec_without_returning(&txn)
                    .await?;
            }

            txn.commit().await?;
            debug!(epoch, "epoch committed");
            Ok(())
        }
        .await;
        self.flag(result)
    }

    /// Remove every row of a partially-ingested epoch (bets, claims and the
    /// round itself) so a later attempt starts clean.
    pub async fn delete_epoch_rows(&self, epoch: u64) -> Result<(), StoreError> {
        let db = self.conn().await?;
        let result: Result<(), sea_orm::DbErr> = async {
            let txn = db.begin().await?;
            HisBets::delete_many()
                .filter(his_bets::Column::Epoch.eq(epoch as i64))
                .exec(&txn)
                .await?;
            Claims::delete_many()
                .filter(claims::Column::Epoch.eq(epoch as i64))
                .exec(&txn)
                .await?;
            Rounds::delete_many()
                .filter(rounds::Column::Epoch.eq(epoch as i64))
                .exec(&txn)
                .await?;
            txn.commit().await?;
            Ok(())
        }
        .await;
        self.flag(result)
    }

    pub async fn hisbet_count_for_epoch(&self, epoch: u64) -> Result<u64, StoreError> {
        let db = self.conn().await?;
        self.flag(
            HisBets::find()
                .filter(his_bets::Column::Epoch.eq(epoch as i64))
                .count(&db)
                .await,
        )
    }

    // ── hot table ───────────────────────────────────────────────────────

    pub async fn insert_realbet(&self, model: real_bets::ActiveModel) -> Result<(), StoreError> {
        let db = self.conn().await?;
        self.flag(RealBets::insert(model).exec_without_returning(&db).await)?;
        Ok(())
    }

    pub async fn delete_realbets_for_epoch(&self, epoch: u64) -> Result<u64, StoreError> {
        let db = self.conn().await?;
        let res = self.flag(
            RealBets::delete_many()
                .filter(real_bets::Column::Epoch.eq(epoch as i64))
                .exec(&db)
                .await,
        )?;
        Ok(res.rows_affected)
    }

    /// Routine cleanup: drop every hot row older than `epoch`.
    pub async fn sweep_realbets_below(&self, epoch: u64) -> Result<u64, StoreError> {
        let db = self.conn().await?;
        let res = self.flag(
            RealBets::delete_many()
                .filter(real_bets::Column::Epoch.lt(epoch as i64))
                .exec(&db)
                .await,
        )?;
        if res.rows_affected > 0 {
            debug!(below = epoch, rows = res.rows_affected, "swept hot table");
        }
        Ok(res.rows_affected)
    }

    pub async fn realbet_count_below(&self, epoch: u64) -> Result<u64, StoreError> {
        let db = self.conn().await?;
        self.flag(
            RealBets::find()
                .filter(real_bets::Column::Epoch.lt(epoch as i64))
                .count(&db)
                .await,
        )
    }

    /// Most recent hot rows, newest first. Used to warm the live dedup set
    /// after a restart.
    pub async fn recent_realbets(&self, limit: u64) -> Result<Vec<real_bets::Model>, StoreError> {
        let db = self.conn().await?;
        self.flag(
            RealBets::find()
                .order_by_desc(real_bets::Column::Id)
                .limit(limit)
                .all(&db)
                .await,
        )
    }

    // ── claims & findings ───────────────────────────────────────────────

    pub async fn claims_for_epoch(&self, epoch: u64) -> Result<Vec<claims::Model>, StoreError> {
        let db = self.conn().await?;
        self.flag(
            Claims::find()
                .filter(claims::Column::Epoch.eq(epoch as i64))
                .all(&db)
                .await,
        )
    }

    pub async fn upsert_multi_claim(
        &self,
        epoch: u64,
        wallet_address: &str,
        claim_count: i32,
        total_amount: Decimal,
        created_at: &str,
    ) -> Result<(), StoreError> {
        let db = self.conn().await?;
        let model = multi_claims::ActiveModel {
            epoch: Set(epoch as i64),
            wallet_address: Set(wallet_address.to_string()),
            claim_count: Set(claim_count),
            total_amount: Set(total_amount),
            created_at: Set(created_at.to_string()),
        };
        self.flag(
            MultiClaims::insert(model)
                .on_conflict(
                    OnConflict::columns([
                        multi_claims::Column::Epoch,
                        multi_claims::Column::WalletAddress,
                    ])
                    .update_columns([
                        multi_claims::Column::ClaimCount,
                        multi_claims::Column::TotalAmount,
                    ])
                    .to_owned(),
                )
                .exec_without_returning(&db)
                .await,
        )?;
        Ok(())
    }

    pub async fn multi_claims_for_epoch(
        &self,
        epoch: u64,
    ) -> Result<Vec<multi_claims::Model>, StoreError> {
        let db = self.conn().await?;
        self.flag(
            MultiClaims::find()
                .filter(multi_claims::Column::Epoch.eq(epoch as i64))
                .all(&db)
                .await,
        )
    }

    // ── quarantine ──────────────────────────────────────────────────────

    pub async fn failed_epoch(&self, epoch: u64) -> Result<Option<failed_epochs::Model>, StoreError> {
        let db = self.conn().await?;
        self.flag(FailedEpochs::find_by_id(epoch as i64).one(&db).await)
    }

    /// Record one more failed attempt for an epoch; returns the new count.
    pub async fn record_epoch_failure(
        &self,
        epoch: u64,
        error_message: &str,
        attempt_ts: &str,
    ) -> Result<i32, StoreError> {
        let db = self.conn().await?;
        let existing = self.flag(FailedEpochs::find_by_id(epoch as i64).one(&db).await)?;
        match existing {
            Some(record) => {
                let count = record.failure_count + 1;
                let mut active: failed_epochs::ActiveModel = record.into();
                active.failure_count = Set(count);
                active.error_message = Set(error_message.to_string());
                active.last_attempt_ts = Set(attempt_ts.to_string());
                self.flag(active.update(&db).await)?;
                Ok(count)
            }
            None => {
                let active = failed_epochs::ActiveModel {
                    epoch: Set(epoch as i64),
                    error_message: Set(error_message.to_string()),
                    last_attempt_ts: Set(attempt_ts.to_string()),
                    failure_count: Set(1),
                };
                self.flag(active.insert(&db).await)?;
                Ok(1)
            }
        }
    }

    // ── wallet notes ────────────────────────────────────────────────────

    pub async fn wallet_note_exists(&self, wallet_address: &str) -> Result<bool, StoreError> {
        let db = self.conn().await?;
        let found = self.flag(
            WalletNotes::find_by_id(wallet_address.to_string())
                .one(&db)
                .await,
        )?;
        Ok(found.is_some())
    }

    pub async fn upsert_wallet_note(
        &self,
        wallet_address: &str,
        note: &str,
        flags: &str,
        now: &str,
    ) -> Result<(), StoreError> {
        let db = self.conn().await?;
        let model = wallet_notes::ActiveModel {
            wallet_address: Set(wallet_address.to_string()),
            note: Set(note.to_string()),
            flags: Set(flags.to_string()),
            created_at: Set(now.to_string()),
            updated_at: Set(now.to_string()),
        };
        self.flag(
            WalletNotes::insert(model)
                .on_conflict(
                    OnConflict::column(wallet_notes::Column::WalletAddress)
                        .update_columns([
                            wallet_notes::Column::Flags,
                            wallet_notes::Column::UpdatedAt,
                        ])
                        .to_owned(),
                )
                .exec_without_returning(&db)
                .await,
        )?;
        Ok(())
    }
}
