//! `SeaORM` Entity for the his_bets table
//!
//! One row per on-chain bet event in a closed epoch. `tx_hash` is globally
//! unique; the same wallet may appear several times per epoch under distinct
//! transaction hashes.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "his_bets")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub epoch: i64,
    pub bet_ts: String,
    pub wallet_address: String,
    pub bet_direction: String,
    pub amount: Decimal,
    /// WIN / LOSS, NULL when the round drew or the result is unknown.
    pub result: Option<String>,
    #[sea_orm(unique)]
    pub tx_hash: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
