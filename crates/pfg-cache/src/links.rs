use crate::lowered_key;
use crate::metadata::MetadataCache;
use pfg_models::{FileMeta, GatewayError, RemoteFiles};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

const TEMPLINK_TTL: Duration = Duration::from_secs(60 * 60 * 3);

/// Memo of the ETag served for a path, valid as long as the rev it was
/// recorded at is still current. Answers conditional requests.
pub struct EtagCache<R> {
    metadata: Arc<MetadataCache<R>>,
    cache: Mutex<HashMap<String, (String, String)>>, // key -> (rev, etag)
}

impl<R: RemoteFiles> EtagCache<R> {
    pub fn new(metadata: Arc<MetadataCache<R>>) -> Self {
        Self { metadata, cache: Mutex::new(HashMap::new()) }
    }

    pub fn register(&self, path: &str, st: &FileMeta, etag: &str) {
        self.cache
            .lock()
            .unwrap()
            .insert(lowered_key(path), (st.rev.clone(), etag.to_string()));
    }

    pub fn is_current(&self, path: &str, etag: &str) -> bool {
        let key = lowered_key(path);
        let mut cache = self.cache.lock().unwrap();
        let Some((rev, cur_tag)) = cache.get(&key).cloned() else {
            return false;
        };
        if cur_tag != etag {
            return false;
        }
        // the tag only stays valid while its rev is the current one
        match self.metadata.stat(path) {
            Ok(st) if st.rev == rev => true,
            _ => {
                cache.remove(&key);
                false
            }
        }
    }
}

struct TempLink {
    rev: String,
    expires_at: Instant,
    url: String,
}

/// Memo of short-lived direct-download URLs, used to redirect range
/// requests straight at the remote.
pub struct TempLinkCache<R> {
    remote: Arc<R>,
    metadata: Arc<MetadataCache<R>>,
    cache: Mutex<HashMap<String, TempLink>>,
}

impl<R: RemoteFiles> TempLinkCache<R> {
    pub fn new(remote: Arc<R>, metadata: Arc<MetadataCache<R>>) -> Self {
        Self { remote, metadata, cache: Mutex::new(HashMap::new()) }
    }

    pub async fn get(&self, path: &str) -> Result<String, GatewayError> {
        let st = self.metadata.stat(path)?;
        let key = lowered_key(path);
        {
            let mut cache = self.cache.lock().unwrap();
            let stale = match cache.get(&key) {
                Some(tl) if tl.rev == st.rev && Instant::now() < tl.expires_at => {
                    return Ok(tl.url.clone());
                }
                Some(_) => true,
                None => false,
            };
            if stale {
                cache.remove(&key);
            }
        }

        // fetch senza lock, si installa dopo
        tracing::info!(path, "fetching temporary link");
        let url = self.remote.temporary_link(&st.path_display).await?;
        self.cache.lock().unwrap().insert(
            key,
            TempLink { rev: st.rev, expires_at: Instant::now() + TEMPLINK_TTL, url: url.clone() },
        );
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pfg_api::stub::StubRemote;
    use pfg_models::{ListFolderResult, RawEntry};

    fn file(path: &str, rev: &str, size: u64) -> RawEntry {
        RawEntry::File(FileMeta {
            path_display: path.to_string(),
            rev: rev.to_string(),
            size,
            server_modified: None,
        })
    }

    fn batch(cursor: &str, entries: Vec<RawEntry>) -> ListFolderResult {
        ListFolderResult { entries, cursor: cursor.to_string(), has_more: false }
    }

    fn setup() -> (Arc<StubRemote>, Arc<MetadataCache<StubRemote>>) {
        let remote = Arc::new(StubRemote::new());
        let meta = Arc::new(MetadataCache::new(Arc::clone(&remote), "/Public"));
        meta.apply_batch(&batch("c1", vec![file("/Public/x.txt", "r1", 3)]))
            .unwrap();
        (remote, meta)
    }

    #[test]
    fn etag_valid_while_rev_is_current() {
        let (_, meta) = setup();
        let etags = EtagCache::new(Arc::clone(&meta));
        let st = meta.stat("x.txt").unwrap();

        etags.register("x.txt", &st, "\"tag1\"");
        assert!(etags.is_current("x.txt", "\"tag1\""));
        assert!(!etags.is_current("x.txt", "\"tag2\""));
        assert!(!etags.is_current("other.txt", "\"tag1\""));

        // a new rev invalidates the recorded tag
        meta.apply_batch(&batch("c2", vec![file("/Public/x.txt", "r2", 3)]))
            .unwrap();
        assert!(!etags.is_current("x.txt", "\"tag1\""));
    }

    #[test]
    fn etag_lookup_is_case_insensitive() {
        let (_, meta) = setup();
        let etags = EtagCache::new(Arc::clone(&meta));
        let st = meta.stat("x.txt").unwrap();
        etags.register("x.txt", &st, "\"tag1\"");
        assert!(etags.is_current("X.TXT", "\"tag1\""));
    }

    #[tokio::test(start_paused = true)]
    async fn templink_cached_until_rev_change() {
        let (remote, meta) = setup();
        let links = TempLinkCache::new(Arc::clone(&remote), Arc::clone(&meta));

        let first = links.get("x.txt").await.unwrap();
        let second = links.get("x.txt").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(remote.templinks_issued(), 1);

        meta.apply_batch(&batch("c2", vec![file("/Public/x.txt", "r2", 3)]))
            .unwrap();
        let third = links.get("x.txt").await.unwrap();
        assert_ne!(first, third);
        assert_eq!(remote.templinks_issued(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn templink_expires_after_ttl() {
        let (remote, meta) = setup();
        let links = TempLinkCache::new(Arc::clone(&remote), Arc::clone(&meta));

        links.get("x.txt").await.unwrap();
        tokio::time::advance(TEMPLINK_TTL + Duration::from_secs(1)).await;
        links.get("x.txt").await.unwrap();
        assert_eq!(remote.templinks_issued(), 2);
    }

    #[tokio::test]
    async fn templink_propagates_stat_errors() {
        let (remote, meta) = setup();
        let links = TempLinkCache::new(Arc::clone(&remote), Arc::clone(&meta));
        assert!(matches!(
            links.get("missing").await,
            Err(GatewayError::NotFound(_))
        ));
        assert!(matches!(
            links.get("/").await,
            Err(GatewayError::IsDirectory(_))
        ));
        assert_eq!(remote.templinks_issued(), 0);
    }
}
