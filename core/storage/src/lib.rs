//! Local store abstraction for fitsync.
//!
//! The sync engine never talks to a database directly. It opens a
//! transaction on a [`LocalStore`] and works on table-bound [`Collection`]s,
//! so the same engine runs against the in-memory store in tests and the
//! SQLite store in the application.
//!
//! # Design Principles
//! - One writer: a store hands out a single transaction at a time
//! - All-or-nothing: dropping a transaction rolls it back
//! - Typed records: business fields are an [`fitsync_common::EntityFields`] variant

pub mod kv;
pub mod memory;
pub mod sqlite;
pub mod store;
pub mod writes;

pub use kv::{FileKvStore, KeyValueStore, MemoryKvStore};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use store::{Collection, LocalStore, NewRecord, Predicate, StoreTxn};
pub use writes::{create_local, delete_local, update_local};
