//! `batchforge-storage`: persistence backends for batch runs.
//!
//! - [`NoopStorage`]: accepts every write, keeps nothing.
//! - [`LocalStorage`]: SQLite metadata (`metadata.db`) plus content-addressed JSON blobs.

pub mod blob;
pub mod config;
pub mod local;
pub mod noop;
pub mod sqlite;
pub mod store;

pub use blob::{BlobStore, config_ref, record_data_ref};
pub use config::{StorageConfig, open};
pub use local::LocalStorage;
pub use noop::NoopStorage;
pub use sqlite::{SqliteMetadataStore, WriteRetry};
pub use store::{MasterJobFilter, Pagination, RecordFilter, Storage, StorageError};
