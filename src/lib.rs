//! Ingestion backend for an on-chain binary-outcome prediction market.
//!
//! Two pipelines share one Postgres store and one rate-limited chain
//! facade: a historical backfill that walks closed epochs and commits
//! them atomically, and a real-time pipeline that mirrors live bets into
//! a short-lived hot table and fans them out to websocket clients.

pub mod config;
pub mod error;
pub mod supervisor;

pub mod entities {
    pub mod prelude;

    pub mod claims;
    pub mod failed_epochs;
    pub mod his_bets;
    pub mod multi_claims;
    pub mod real_bets;
    pub mod rounds;
    pub mod wallet_notes;
}

pub mod models;

pub mod services {
    pub mod chain;
    pub mod chain_stream;
    pub mod detector;
    pub mod fanout;
    pub mod rate_limit;
    pub mod store;
    pub mod timefmt;
}

pub mod jobs {
    pub mod backfill;
    pub mod epoch_sync;
    pub mod realtime;
}
