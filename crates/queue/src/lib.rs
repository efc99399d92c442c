//! Job queue coordinator for ComfyUI image processing.
//!
//! [`JobQueue`] accepts jobs, runs each one on its own task (upload,
//! submit, track, collect outputs) and reports every state change as a
//! [`QueueEvent`] to subscribers.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod runner;

pub use config::AppConfig;
pub use coordinator::JobQueue;
pub use error::{JobError, QueueError, StartError};
pub use events::{QueueEvent, QueueEvents};
