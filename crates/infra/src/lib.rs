//! Infrastructure adapters: job store, blob storage, cold archive, profiles,
//! durable queues and configuration.
//!
//! Every port has an in-memory implementation for tests/dev. Redis-backed
//! implementations are behind the `redis` feature.

pub mod archive;
pub mod blob_store;
pub mod config;
pub mod job_store;
pub mod profiles;
pub mod queue;

pub use archive::{ArchiveError, ColdArchive, FsArchive, InMemoryArchive, RetrievalStatus};
pub use blob_store::{BlobError, BlobStore, FsBlobStore, InMemoryBlobStore};
pub use config::{ConfigError, PipelineConfig, QueueNames, TopicNames};
pub use job_store::{Completion, InMemoryJobStore, JobStore, JobStoreError, Mutation};
pub use profiles::{InMemoryProfiles, ProfileDirectory, ProfileError};

#[cfg(feature = "redis")]
pub use job_store::RedisJobStore;
#[cfg(feature = "redis")]
pub use profiles::RedisProfiles;
#[cfg(feature = "redis")]
pub use queue::RedisStreamsQueue;
