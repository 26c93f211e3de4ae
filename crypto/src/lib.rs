//! EngineLink Hashing Module
//! 
//! Content checksums for document values, used for integrity checks and
//! cheap change detection. Not intended as a security primitive.

pub mod hashing;

pub use hashing::*;
