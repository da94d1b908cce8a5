//! Warden Storage - key-value persistence layer.
//!
//! A single byte-level [`KvStore`] trait with namespaced keys backs
//! everything that must survive a restart: durable audit entries,
//! persistent capability grants, the cluster node directory, and the
//! store-backed rate limiter.
//!
//! Two implementations:
//!
//! - [`MemoryKvStore`]: `HashMap` behind an async lock, for tests and
//!   single-process development.
//! - [`SqliteKvStore`]: one embedded `SQLite` database (bundled build,
//!   WAL mode), one row per `(namespace, key)`.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod error;
pub mod kv;
pub mod sqlite;

pub use error::{StorageError, StorageResult};
pub use kv::{KvStore, MemoryKvStore};
pub use sqlite::SqliteKvStore;
