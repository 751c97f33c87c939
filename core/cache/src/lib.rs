//! Cache store abstraction for the asset sync engine.
//!
//! The cache mirrors the source of truth in a key-value store using a fixed
//! key layout (see [`keys`]). Every record-level mutation is one atomic unit
//! covering the detail hash, the summary index, the category sets and the
//! change log, so readers never observe a partially written record.

pub mod keys;
pub mod memory;
pub mod redis_store;
pub mod store;
pub mod stored;

pub use memory::{KeyValue, MemoryCache};
pub use redis_store::{RedisCache, RedisCacheConfig};
pub use store::{CacheSnapshot, CacheStore, CachedEntry, ConsistencyReport};
pub use stored::StoredRecord;
