//! Database lifecycle: open with recovery, write transactions, checkpoints.

mod config;
mod database;
mod recovery;
mod transaction;

pub use config::DatabaseOptions;
pub use database::Database;
pub use recovery::{RecoveryMode, RecoveryReport};
pub use transaction::{TxState, WriteTxn};
