//! EngineLink Transactional State Store
//! 
//! A capacity-bounded, in-memory mapping from key to versioned entry with
//! grouped atomic transactions and point-in-time snapshots. Every entry and
//! transaction transition is published on the store's event bus.

pub mod store;
pub mod transaction;
pub mod snapshot;

pub use store::*;
pub use transaction::*;
pub use snapshot::*;
