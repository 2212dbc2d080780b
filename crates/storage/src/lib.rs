#![forbid(unsafe_code)]

pub mod repository;
pub mod sqlite;

pub use repository::{
    InMemoryStore, KeyValueStore, Namespace, SnapshotRecord, SnapshotStore, Storage, StorageError,
    StoreKey,
};
