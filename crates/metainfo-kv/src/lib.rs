#![warn(missing_docs)]

//! Metainfo key-value layer: ordered byte-key storage used to persist segment pointers.
//!
//! Keys are compared lexicographically, which is what lets the coordinator serve
//! prefix listings as bounded range scans.

pub mod error;
pub mod file_store;
pub mod kvstore;

pub use error::KvError;
pub use file_store::FileKvStore;
pub use kvstore::{Key, KvStore, MemoryKvStore, Value};
