//! Durable storage for learned knowledge.
//!
//! [`KnowledgeVault`] keeps the serialized knowledge store in an embedded
//! redb database under the agent's data directory.

pub mod durable;

pub use durable::KnowledgeVault;

use crate::error::StoreError;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
