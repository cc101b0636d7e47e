//! Unified mobility.raw_event.v1 schema
//!
//! This module defines the raw input records for each modality and the
//! helpers that parse and validate batches of them.

mod adapter;
mod raw_event;

pub use adapter::*;
pub use raw_event::*;
