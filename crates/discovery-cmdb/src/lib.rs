//! Encrypted embedded CMDB: configuration items, parent/child relationships
//! and AEAD-sealed credentials (`spec.md` §2.2, §4.6), grounded on
//! `ratchet-storage`'s connection/transaction split
//! (`examples/michiel-ratchet/ratchet-storage/src/connection.rs`) but
//! simplified to the single `sqlx::SqlitePool` this crate actually needs.

#![warn(missing_docs, clippy::all)]

mod store;

pub use store::{CiRecord, CmdbError, CmdbStats, Store};
