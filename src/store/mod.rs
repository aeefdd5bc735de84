//! Durable state for the orchestrator: domain records and the SQLite
//! access layer behind them.

pub mod db;
pub mod models;

pub use db::{Db, DbHandle};
