mod block;
mod links;
mod metadata;

pub use block::{BlockCache, CacheParams, Download, RespHeaders, STATIC_HEADERS, spawn_prefetch_workers};
pub use links::{EtagCache, TempLinkCache};
pub use metadata::{MetadataCache, SUBSCRIBE_DEADLINE, Subscription};

/// Lookup key shared by all the caches: path relative to the root, lowered.
pub(crate) fn lowered_key(path: &str) -> String {
    path.trim_matches('/').to_lowercase()
}
