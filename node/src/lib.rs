//! EngineLink Node Implementation
//!
//! Combines the bridge components under one lifecycle:
//! - Transactional state store
//! - Synchronization engine
//! - Sync dispatcher pushing payloads to sessions

mod dispatcher;
mod node;
mod runtime;

pub use dispatcher::*;
pub use node::*;
pub use runtime::*;
