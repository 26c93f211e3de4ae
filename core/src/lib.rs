//! EngineLink Core Library
//! 
//! Shared types, error taxonomy, configuration and event plumbing used by the
//! state store and the synchronization engine.

pub mod types;
pub mod traits;
pub mod error;
pub mod config;
pub mod events;
pub mod scheduler;

pub use types::*;
pub use traits::*;
pub use error::*;
pub use config::*;
pub use events::*;
pub use scheduler::*;
