//! Shared data models for the basejobs job execution core.
//!
//! This crate provides Serde-serializable types for:
//! - Job records, statuses and categorized failures
//! - Job events published on the event bus
//! - Job log lines
//! - The live channel (WebSocket) protocol

pub mod event;
pub mod job;
pub mod log;
pub mod ws;

// Re-export common types
pub use event::{EventData, EventMessage};
pub use job::{ErrorCategory, Job, JobError, JobId, JobStatus, JobType, Room, UnknownJobType};
pub use log::JobLogLine;
pub use ws::{ClientMessage, ServerMessage};
