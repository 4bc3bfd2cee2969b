// pgsnapshot/src/lib.rs
//! Online physical backups of PostgreSQL into a kopia repository, plus a
//! sharded WAL archive for point-in-time recovery.
pub mod backup;
pub mod config;
pub mod errors;
pub mod repository;
pub mod storage;
pub mod utils;
pub mod wal;
