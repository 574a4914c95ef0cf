// Durable state: storage layout and the SQLite log

pub mod database;
pub mod storage;

pub use database::*;
pub use storage::*;
