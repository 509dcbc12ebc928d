//! EmberDB: an embedded, single-writer / many-reader key-value database
//! backed by a single append-only file per data directory.
//!
//! # Architecture
//!
//! The storage engine is an immutable copy-on-write B-tree written as
//! self-describing node frames into an append-only file. A mutation copies
//! the path from the touched leaf to the root and commits by appending a
//! checksummed header frame; every previously committed root remains a valid
//! snapshot, so readers never block the writer.
//!
//! ```text
//!                    ┌─────────────┐  commands   ┌─────────────┐
//!  Database handles ─┤   mailbox   ├────────────►│ Coordinator │
//!                    └─────────────┘             └──────┬──────┘
//!                                                       │ owns current tree
//!                  ┌──────────┬──────────┬──────────────┤
//!                  ▼          ▼          ▼              ▼
//!              Readers    Compactor   CatchUp        CleanUp
//!            (snapshots)  (new file)  (diff replay)  (file removal)
//! ```
//!
//! A single coordinator task serializes all mutations and owns the current
//! tree. Reads are dispatched to per-request reader tasks over frozen
//! snapshots. Compaction streams the live entries into a fresh file in the
//! background; catch-up passes replay writes that landed meanwhile; once the
//! compacted tree has caught up it is promoted, and obsolete files are
//! removed after the last reader of the old file checks out.
//!
//! Durability follows the header-commit protocol: nodes are synced before
//! the header referencing them is written, and recovery scans the file tail
//! backwards for the newest header with a valid checksum. A crash at any
//! point reopens the database at the last successful commit.

pub mod btree;
pub mod config;
pub mod encoding;
pub mod error;
pub mod store;

mod cache;
mod catch_up;
mod clean_up;
mod compactor;
mod coordinator;
mod db;
mod flock;
mod reader;

pub use config::{AutoCompact, Config};
pub use coordinator::Event;
pub use db::{Database, SelectOptions};
pub use encoding::{Key, Value};
pub use error::{Error, Result};
