//! `SeaORM` Entity for the real_bets table
//!
//! Short-lived buffer of live bets. Rows are inserted by the real-time
//! pipeline as events arrive and deleted once the historical pipeline has
//! committed the epoch; a sweep keeps only the most recent three epochs.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "real_bets")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub epoch: i64,
    pub bet_ts: String,
    pub wallet_address: String,
    pub bet_direction: String,
    pub amount: Decimal,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
