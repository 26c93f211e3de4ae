//! EngineLink Synchronization Engine
//!
//! Versioned shared documents with subscriptions, optimistic concurrency,
//! JSON-patch style operations and delta payloads.

pub mod engine;
pub mod history;
pub mod patch;
pub mod payload;

pub use engine::*;
pub use history::*;
pub use patch::*;
pub use payload::*;
