//! Queue infrastructure
//!
//! Named job queues with producers, bounded-concurrency workers, repeating
//! schedules and stalled-job recovery. Every pipeline hand-off goes through
//! a queue; no stage calls the next one directly.

mod job;
mod memory;
mod redis;
mod scheduler;
mod store;
mod worker;

pub use job::{backoff_delay, Job, JobOptions, JobState};
pub use memory::MemoryJobStore;
pub use redis::RedisJobStore;
pub use scheduler::Scheduler;
pub use store::{JobStore, Schedule, ScheduleTemplate};
pub use worker::{concurrency_from_memory, JobProcessor, Worker, WorkerConfig};

/// One job per source document: split into page jobs
pub const QUEUE_DOCUMENT_SPLIT: &str = "document-split";

/// One job per page: text extraction via the fallback chain
pub const QUEUE_PAGE_EXTRACT: &str = "page-extract";

/// One job per resolved page: embedding persistence
pub const QUEUE_PAGE_EMBED: &str = "page-embed";

/// One job per embedded page: structured extraction
pub const QUEUE_PAGE_STRUCTURE: &str = "page-structure";

/// Document-level merge, deduplicated per document
pub const QUEUE_DOCUMENT_MERGE: &str = "document-merge";

/// Scheduled re-checks of asynchronous cloud OCR jobs
pub const QUEUE_OCR_POLL: &str = "ocr-poll";

/// The repeating "process next pending case" tick
pub const QUEUE_CASE_TICK: &str = "case-tick";
