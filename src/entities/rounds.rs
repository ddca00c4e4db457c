//! `SeaORM` Entity for the rounds table
//!
//! One row per closed epoch. Timestamps are canonical wall-clock strings
//! (see `services::timefmt`), prices and pool amounts are fixed-precision
//! decimals. `result` is NULL when the round drew.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "rounds")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub epoch: i64,
    pub start_ts: String,
    pub lock_ts: String,
    pub close_ts: String,
    pub lock_price: Decimal,
    pub close_price: Decimal,
    pub result: Option<String>,
    pub total_amount: Decimal,
    pub up_amount: Decimal,
    pub down_amount: Decimal,
    pub up_payout: Decimal,
    pub down_payout: Decimal,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
