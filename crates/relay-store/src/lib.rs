//! SQLite persistence for relaymux
//!
//! [`SqliteStore`] keeps fetched events, follow sets and per-author relay
//! scores; [`SqliteKv`] is the expiring key-value store behind the
//! replaceable event resolver. Both share one connection per database file.

pub mod error;
pub mod kv;
pub mod store;

pub use error::StoreError;
pub use kv::SqliteKv;
pub use store::SqliteStore;
