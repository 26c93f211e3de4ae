//! Core traits shared across EngineLink components

use std::fmt::Debug;
use std::hash::Hash;

/// Result type for EngineLink operations
pub type BridgeResult<T> = Result<T, crate::error::BridgeError>;

/// An event emitted by a store or engine
///
/// Each event belongs to exactly one kind; observers register handlers per
/// kind on an [`EventBus`](crate::events::EventBus).
pub trait Event: Debug + Clone + Send + Sync + 'static {
    /// Discriminant used for handler registration
    type Kind: Copy + Eq + Hash + Debug + Send + Sync + 'static;

    /// Get the kind of this event
    fn kind(&self) -> Self::Kind;
}
