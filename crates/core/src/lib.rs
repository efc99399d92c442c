//! Domain types and pure logic for the atelier job queue.
//!
//! Nothing in this crate performs I/O. The ComfyUI gateway and the job
//! coordinator build on these types.

pub mod error;
pub mod job;
pub mod progress;
pub mod size;
pub mod types;
pub mod workflow;
