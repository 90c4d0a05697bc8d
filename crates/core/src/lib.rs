//! Domain logic for the face-swap queue worker.
//!
//! Holds everything that does not talk to the ComfyUI engine: job input
//! validation, workflow graph loading and patching, and the JSON payloads
//! returned to the job queue.

pub mod result;
pub mod types;
pub mod validation;
pub mod workflow;
