//! On-disk persistence for execution locks
//!
//! Every lock is a single JSON object stored at `<lock_dir>/<name>.json`.
//! [`PersistentRecord`] owns one such file; [`LockDirectory`] enumerates
//! them.

pub mod directory;
pub mod record;

pub use directory::{LockDirectory, LockEntry};
pub use record::{PersistentRecord, RECORD_EXTENSION};
