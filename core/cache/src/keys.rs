//! Persisted key layout.
//!
//! These names are shared with every other reader of the cache and must not
//! change.

use assetsync_common::Category;

/// Prefix of per-record detail hashes.
pub const DETAIL_PREFIX: &str = "asset:metadata:";
/// SCAN pattern matching every detail hash.
pub const DETAIL_PATTERN: &str = "asset:metadata:*";
/// Global summary index: hash of id -> compact summary JSON.
pub const SUMMARY_INDEX: &str = "asset:index";
/// Prefix of per-category id sets.
pub const CATEGORY_PREFIX: &str = "asset:category:";
/// Sync state hash.
pub const SYNC_STATE: &str = "asset:sync:state";
/// Change log list of recently touched ids.
pub const CHANGE_LOG: &str = "asset:sync:changed";

/// Entries retained in the change log unless configured otherwise.
pub const DEFAULT_CHANGE_LOG_CAPACITY: usize = 1000;

pub mod state_fields {
    pub const LAST_SYNC_TIME: &str = "lastSyncTime";
    pub const LAST_REVISION_TOKEN: &str = "lastRevisionToken";
    pub const RECORD_COUNT: &str = "recordCount";
    pub const STATUS: &str = "status";
    /// Lease timestamp of the running cycle.
    pub const SYNC_STARTED_AT: &str = "syncStartedAt";
}

pub fn detail_key(id: &str) -> String {
    format!("{}{}", DETAIL_PREFIX, id)
}

pub fn category_key(category: Category) -> String {
    format!("{}{}", CATEGORY_PREFIX, category.as_str())
}

/// Extract the id from a detail key.
pub fn id_from_detail_key(key: &str) -> Option<&str> {
    key.strip_prefix(DETAIL_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(detail_key("http_request"), "asset:metadata:http_request");
        assert_eq!(category_key(Category::Tool), "asset:category:tool");
        assert_eq!(id_from_detail_key("asset:metadata:a-b"), Some("a-b"));
        assert_eq!(id_from_detail_key("asset:index"), None);
    }
}
