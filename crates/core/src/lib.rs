//! `batchforge-core`: data model and pure building blocks of the batch orchestrator.
//!
//! This crate contains no I/O: identifiers, statuses, persisted entities, input
//! assembly and content hashing.

pub mod assemble;
pub mod error;
pub mod hash;
pub mod id;
pub mod model;

pub use assemble::{ArgValue, Args, INDEX_KEY, Inputs, assemble, record_index, strip_index};
pub use error::{CoreError, CoreResult};
pub use hash::{canonical_json, content_hash, sha256_hex};
pub use id::{ExecutionJobId, MasterJobId, ProjectId, RecordId};
pub use model::{
    ExecutionJob, JobTotals, MasterJob, MasterJobStatus, Project, Record, RecordCounts,
    RecordStatus,
};
