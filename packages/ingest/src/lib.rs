// ABOUTME: Ingestion of asynchronous sandbox progress messages into durable task state
// ABOUTME: Serializes each sandbox through a distributed lock while sandboxes run in parallel

pub mod consumer;
pub mod dead_letter;
pub mod envelope;
pub mod error;
pub mod lock;
pub mod queue;
pub mod usage;

pub use consumer::{IngestOutcome, IngestionConsumer, ReplayReport};
pub use dead_letter::{
    DeadLetter, DeadLetterReason, DeadLetterSink, MemoryDeadLetterSink, SqliteDeadLetterSink,
};
pub use envelope::{EnvelopeFormat, EnvelopeMetadata, EnvelopePayload, SandboxEnvelope};
pub use error::{IngestError, Result};
pub use lock::{acquire_with_retry, DistributedLock, LockLease, MemoryLock, SqliteLock};
pub use queue::{IngestQueue, QueueMessage, QueuePublisher};
pub use usage::extract_token_usage;
