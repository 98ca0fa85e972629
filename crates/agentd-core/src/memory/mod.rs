//! Memory system
//!
//! Structured facts about each user with categories, visibility, and a
//! supersede chain that preserves how a fact evolved over time.

mod store;
mod types;

pub use store::{MemoryStats, MemoryStore, NewMemory, SearchQuery};
pub use types::{default_visibility, Memory, MemoryCategory, SourceType, Visibility};
