//! `SeaORM` Entity for the claims table
//!
//! One row per payout event. `epoch` is the epoch in which the payout
//! transaction landed (the crawler's processing epoch); `bet_epoch` is the
//! epoch the reward is for. The two differ whenever a wallet claims an old
//! round late; both are persisted and callers pick the grouping they need.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "claims")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub epoch: i64,
    pub claim_ts: String,
    pub wallet_address: String,
    pub claim_amount: Decimal,
    pub bet_epoch: i64,
    #[sea_orm(unique)]
    pub tx_hash: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
