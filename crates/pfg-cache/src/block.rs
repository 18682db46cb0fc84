use crate::lowered_key;
use crate::metadata::MetadataCache;
use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt, stream};
use lru::LruCache;
use pfg_models::{ByteStream, FileMeta, GatewayError, RemoteFiles};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;

/// Headers every file response carries besides the per-file ones.
pub const STATIC_HEADERS: [(&str, &str); 3] = [
    ("Accept-Ranges", "bytes"),
    ("Cache-Control", "no-cache"),
    ("Pragma", "no-cache"),
];

#[derive(Debug, Clone)]
pub struct CacheParams {
    pub chunk_size: usize,    // stream granularity
    pub prefetch_size: u64,   // larger files are never primed speculatively
    pub cacheable_size: u64,  // larger files bypass the cache entirely
    pub max_size: u64,        // total on-disk budget
    pub prefetch_threads: usize,
}

/// Per-file headers the cache synthesizes for the HTTP layer.
#[derive(Debug, Clone)]
pub struct RespHeaders {
    pub content_length: u64,
    pub etag: String,
    pub content_type: Option<String>,
}

/// A body ready to stream to a client, along with the stat it was served for.
pub struct Download {
    pub meta: FileMeta,
    pub headers: RespHeaders,
    pub body: ByteStream,
}

struct CacheEntry {
    rev: String,
    size: u64,
    headers: RespHeaders,
    disk_path: PathBuf,
}

struct BlockMap {
    // recency is the LRU order; the map is unbounded, the byte budget below
    // is what gets enforced
    entries: LruCache<String, CacheEntry>,
    total: u64, // installed entries plus in-flight reservations
}

enum Probe {
    Hit(RespHeaders, PathBuf),
    Stale(PathBuf),
    Miss,
}

fn cache_file_name(path_display: &str, rev: &str) -> String {
    format!("{:x}", md5::compute(format!("{}{}", path_display, rev)))
}

/// Bounded disk cache for file bodies. Misses tee the remote download to
/// disk while it streams to the client; hits stream back from disk.
pub struct BlockCache<R> {
    remote: Arc<R>,
    metadata: Arc<MetadataCache<R>>,
    params: CacheParams,
    dir: PathBuf,
    inner: Arc<Mutex<BlockMap>>,
    tmp_counter: AtomicU64,
}

impl<R: RemoteFiles> BlockCache<R> {
    /// The cache directory is scratch space: it is emptied at every boot.
    pub fn new(
        remote: Arc<R>,
        metadata: Arc<MetadataCache<R>>,
        dir: &Path,
        params: CacheParams,
    ) -> Result<Self, GatewayError> {
        if dir.exists() {
            std::fs::remove_dir_all(dir)?;
        }
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            remote,
            metadata,
            params,
            dir: dir.to_path_buf(),
            inner: Arc::new(Mutex::new(BlockMap { entries: LruCache::unbounded(), total: 0 })),
            tmp_counter: AtomicU64::new(0),
        })
    }

    pub fn params(&self) -> &CacheParams {
        &self.params
    }

    pub async fn get(&self, path: &str) -> Result<Download, GatewayError> {
        let st = match self.metadata.stat(path) {
            Ok(st) => st,
            Err(e @ GatewayError::NotFound(_)) => {
                // the file is gone, drop whatever we still hold for it
                self.evict_key(&lowered_key(path));
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        if st.size > self.params.cacheable_size || st.size > self.params.max_size {
            tracing::debug!(path, size = st.size, "too large for the cache, streaming direct");
            return self.direct(st).await;
        }

        let key = lowered_key(path);
        let probe = {
            let mut m = self.inner.lock().unwrap();
            let rev_matches = m.entries.get(&key).map(|e| e.rev == st.rev);
            match rev_matches {
                Some(true) => match m.entries.peek(&key) {
                    Some(e) => Probe::Hit(e.headers.clone(), e.disk_path.clone()),
                    None => Probe::Miss,
                },
                Some(false) => match m.entries.pop(&key) {
                    Some(e) => {
                        m.total -= e.size;
                        Probe::Stale(e.disk_path)
                    }
                    None => Probe::Miss,
                },
                None => Probe::Miss,
            }
        };

        match probe {
            Probe::Hit(headers, disk_path) => match tokio::fs::File::open(&disk_path).await {
                Ok(file) => {
                    tracing::debug!(path, "cache hit");
                    let body = ReaderStream::with_capacity(file, self.params.chunk_size)
                        .map_err(GatewayError::from);
                    return Ok(Download { meta: st, headers, body: Box::pin(body) });
                }
                Err(e) => {
                    tracing::warn!(path, error = %e, "cache file unreadable, refetching");
                    self.evict_key(&key);
                }
            },
            Probe::Stale(old_path) => {
                let _ = tokio::fs::remove_file(&old_path).await;
            }
            Probe::Miss => {}
        }

        self.fetch_and_tee(key, st).await
    }

    /// Speculatively pull a dirty path into the cache. Best effort: folders,
    /// missing paths and files over the prefetch limit are skipped silently.
    pub async fn prime(&self, path: &str) {
        let st = match self.metadata.stat(path) {
            Ok(st) => st,
            Err(GatewayError::NotFound(_)) | Err(GatewayError::IsDirectory(_)) => return,
            Err(e) => {
                tracing::debug!(path, error = %e, "prefetch stat failed");
                return;
            }
        };
        if st.size > self.params.prefetch_size {
            return;
        }
        {
            let m = self.inner.lock().unwrap();
            // peek: il prefetch non deve toccare la recency
            if let Some(e) = m.entries.peek(&lowered_key(path)) {
                if e.rev == st.rev {
                    return;
                }
            }
        }
        match self.get(path).await {
            Ok(mut dl) => {
                while let Some(item) = dl.body.next().await {
                    if item.is_err() {
                        break;
                    }
                }
            }
            Err(e) => tracing::warn!(path, error = %e, "prefetch failed"),
        }
    }

    async fn direct(&self, st: FileMeta) -> Result<Download, GatewayError> {
        let dl = self.remote.download(&st.path_display).await?;
        let headers = RespHeaders {
            content_length: dl.content_length.unwrap_or(st.size),
            etag: dl.etag.unwrap_or_else(|| format!("\"{}\"", st.rev)),
            content_type: dl.content_type,
        };
        Ok(Download { meta: st, headers, body: dl.body })
    }

    async fn fetch_and_tee(&self, key: String, st: FileMeta) -> Result<Download, GatewayError> {
        self.reserve(st.size);
        let dl = match self.remote.download(&st.path_display).await {
            Ok(dl) => dl,
            Err(e) if e.is_transient() => {
                tracing::warn!(path = %st.path_display, error = %e, "download failed, retrying once");
                match self.remote.download(&st.path_display).await {
                    Ok(dl) => dl,
                    Err(e) => {
                        self.unreserve(st.size);
                        return Err(e);
                    }
                }
            }
            Err(e) => {
                self.unreserve(st.size);
                return Err(e);
            }
        };
        let headers = RespHeaders {
            content_length: st.size,
            etag: dl.etag.unwrap_or_else(|| format!("\"{}\"", st.rev)),
            content_type: dl.content_type,
        };

        let name = cache_file_name(&st.path_display, &st.rev);
        let final_path = self.dir.join(&name);
        let tmp_path = self
            .dir
            .join(format!("{}.part{}", name, self.tmp_counter.fetch_add(1, Ordering::Relaxed)));

        let file = match tokio::fs::File::create(&tmp_path).await {
            Ok(f) => f,
            Err(e) => {
                // niente cache per questa richiesta, si passa il body diretto
                tracing::warn!(error = %e, "cannot create cache file, streaming direct");
                self.unreserve(st.size);
                return Ok(Download { meta: st, headers, body: dl.body });
            }
        };

        tracing::info!(path = %st.path_display, size = st.size, "downloading");
        let tee = TeeState {
            upstream: dl.body,
            file: Some(file),
            tmp_path,
            final_path,
            written: 0,
            expected: st.size,
            key,
            rev: st.rev.clone(),
            headers: headers.clone(),
            map: Arc::clone(&self.inner),
            write_failed: false,
            done: false,
        };
        let body = stream::try_unfold(tee, |mut tee| async move {
            match tee.upstream.next().await {
                Some(Ok(chunk)) => {
                    tee.write(&chunk).await;
                    Ok(Some((chunk, tee)))
                }
                Some(Err(e)) => Err(e),
                None => {
                    tee.finish().await;
                    Ok(None)
                }
            }
        });
        Ok(Download { meta: st, headers, body: Box::pin(body) })
    }

    /// Make room for `size` bytes, evicting least-recently-used entries. The
    /// scan runs under the lock; files are unlinked after it drops.
    fn reserve(&self, size: u64) {
        let victims = {
            let mut m = self.inner.lock().unwrap();
            let mut victims = Vec::new();
            while m.total + size > self.params.max_size {
                match m.entries.pop_lru() {
                    Some((_, e)) => {
                        m.total -= e.size;
                        victims.push(e.disk_path);
                    }
                    None => break, // only in-flight reservations left
                }
            }
            m.total += size;
            victims
        };
        if !victims.is_empty() {
            tracing::debug!(evicted = victims.len(), "evicted LRU entries");
        }
        for path in &victims {
            let _ = std::fs::remove_file(path);
        }
    }

    fn unreserve(&self, size: u64) {
        if let Ok(mut m) = self.inner.lock() {
            m.total -= size;
        }
    }

    fn evict_key(&self, key: &str) {
        let removed = {
            let mut m = self.inner.lock().unwrap();
            let e = m.entries.pop(key);
            if let Some(e) = &e {
                m.total -= e.size;
            }
            e
        };
        if let Some(e) = removed {
            let _ = std::fs::remove_file(&e.disk_path);
        }
    }
}

#[cfg(test)]
impl<R: RemoteFiles> BlockCache<R> {
    fn total(&self) -> u64 {
        self.inner.lock().unwrap().total
    }

    fn resident(&self, path: &str) -> Option<PathBuf> {
        self.inner
            .lock()
            .unwrap()
            .entries
            .peek(&lowered_key(path))
            .map(|e| e.disk_path.clone())
    }

    fn entry_count(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }
}

/// State threaded through the tee stream. Until `finish` installs the cache
/// entry, dropping this cleans up the partial file and the reservation.
struct TeeState {
    upstream: ByteStream,
    file: Option<tokio::fs::File>,
    tmp_path: PathBuf,
    final_path: PathBuf,
    written: u64,
    expected: u64,
    key: String,
    rev: String,
    headers: RespHeaders,
    map: Arc<Mutex<BlockMap>>,
    write_failed: bool,
    done: bool,
}

impl TeeState {
    async fn write(&mut self, chunk: &Bytes) {
        self.written += chunk.len() as u64;
        if self.write_failed {
            return;
        }
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = file.write_all(chunk).await {
                // keep the download flowing to the client, just stop teeing
                tracing::warn!(error = %e, "cache write failed, continuing uncached");
                self.write_failed = true;
                self.file = None;
            }
        }
    }

    async fn finish(&mut self) {
        if self.write_failed {
            self.cleanup();
            return;
        }
        if self.written != self.expected {
            tracing::warn!(
                expected = self.expected,
                written = self.written,
                "short download, not installing"
            );
            self.cleanup();
            return;
        }
        let Some(mut file) = self.file.take() else {
            self.cleanup();
            return;
        };
        if file.flush().await.is_err() {
            self.cleanup();
            return;
        }
        drop(file);
        if tokio::fs::rename(&self.tmp_path, &self.final_path).await.is_err() {
            self.cleanup();
            return;
        }

        let Ok(mut m) = self.map.lock() else {
            self.done = true;
            return;
        };
        if let Some(old) = m.entries.pop(&self.key) {
            m.total -= old.size;
            // same (path, rev) hashes to the same file name; never unlink
            // what was just renamed into place
            if old.disk_path != self.final_path {
                let _ = std::fs::remove_file(&old.disk_path);
            }
        }
        m.entries.put(
            self.key.clone(),
            CacheEntry {
                rev: self.rev.clone(),
                size: self.expected,
                headers: self.headers.clone(),
                disk_path: self.final_path.clone(),
            },
        );
        self.done = true;
    }

    fn cleanup(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        self.file = None;
        let _ = std::fs::remove_file(&self.tmp_path);
        if let Ok(mut m) = self.map.lock() {
            m.total -= self.expected;
        }
    }
}

impl Drop for TeeState {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Workers draining the metadata cache's dirty stream into `prime`.
pub fn spawn_prefetch_workers<R: RemoteFiles>(
    cache: Arc<BlockCache<R>>,
    rx: mpsc::Receiver<String>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    (0..cache.params.prefetch_threads)
        .map(|worker| {
            let cache = Arc::clone(&cache);
            let rx = Arc::clone(&rx);
            tokio::spawn(async move {
                loop {
                    let path = { rx.lock().await.recv().await };
                    match path {
                        Some(path) => {
                            tracing::debug!(worker, path = %path, "prefetching");
                            cache.prime(&path).await;
                        }
                        None => break, // producer gone
                    }
                }
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pfg_api::stub::StubRemote;
    use pfg_models::{ListFolderResult, RawEntry};
    use tempfile::TempDir;

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

    fn params(max_size: u64) -> CacheParams {
        CacheParams {
            chunk_size: 4,
            prefetch_size: 1000,
            cacheable_size: 1000,
            max_size,
            prefetch_threads: 2,
        }
    }

    struct Fixture {
        remote: Arc<StubRemote>,
        meta: Arc<MetadataCache<StubRemote>>,
        cache: Arc<BlockCache<StubRemote>>,
        _dir: TempDir,
    }

    fn fixture(params: CacheParams, entries: Vec<RawEntry>, bodies: &[(&str, &str)]) -> Fixture {
        let remote = Arc::new(StubRemote::new());
        remote.set_chunk_size(4);
        for (path, body) in bodies {
            remote.set_body(path, body.to_string());
        }
        let meta = Arc::new(MetadataCache::new(Arc::clone(&remote), "/Public"));
        meta.apply_batch(&batch("c1", entries)).unwrap();
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(
            BlockCache::new(Arc::clone(&remote), Arc::clone(&meta), dir.path(), params).unwrap(),
        );
        Fixture { remote, meta, cache, _dir: dir }
    }

    async fn drain(mut dl: Download) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = dl.body.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn miss_then_hit_downloads_once() {
        let fx = fixture(
            params(100),
            vec![file("/Public/x.txt", "r1", 11)],
            &[("/Public/x.txt", "hello world")],
        );
        let body = drain(fx.cache.get("x.txt").await.unwrap()).await;
        assert_eq!(body, b"hello world");
        assert_eq!(fx.remote.downloads("/Public/x.txt"), 1);
        assert_eq!(fx.cache.total(), 11);

        // second read comes from disk, byte-identical
        let body = drain(fx.cache.get("x.txt").await.unwrap()).await;
        assert_eq!(body, b"hello world");
        assert_eq!(fx.remote.downloads("/Public/x.txt"), 1);
    }

    #[tokio::test]
    async fn lru_eviction_keeps_budget() {
        let fx = fixture(
            params(100),
            vec![
                file("/Public/f1", "r1", 40),
                file("/Public/f2", "r2", 40),
                file("/Public/f3", "r3", 40),
            ],
            &[
                ("/Public/f1", "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"),
                ("/Public/f2", "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb"),
                ("/Public/f3", "cccccccccccccccccccccccccccccccccccccccc"),
            ],
        );
        drain(fx.cache.get("f1").await.unwrap()).await;
        drain(fx.cache.get("f2").await.unwrap()).await;
        drain(fx.cache.get("f3").await.unwrap()).await;

        assert_eq!(fx.cache.total(), 80);
        assert_eq!(fx.cache.entry_count(), 2);
        // f1 was the least recently used
        assert!(fx.cache.resident("f1").is_none());
        let f2 = fx.cache.resident("f2").unwrap();
        let f3 = fx.cache.resident("f3").unwrap();
        assert_eq!(std::fs::metadata(&f2).unwrap().len(), 40);
        assert_eq!(std::fs::metadata(&f3).unwrap().len(), 40);
    }

    #[tokio::test]
    async fn stale_rev_is_refetched() {
        let fx = fixture(
            params(100),
            vec![file("/Public/x.txt", "r1", 3)],
            &[("/Public/x.txt", "one")],
        );
        drain(fx.cache.get("x.txt").await.unwrap()).await;
        let old_disk = fx.cache.resident("x.txt").unwrap();

        fx.remote.set_body("/Public/x.txt", "two".to_string());
        fx.meta
            .apply_batch(&batch("c2", vec![file("/Public/x.txt", "r2", 3)]))
            .unwrap();

        let body = drain(fx.cache.get("x.txt").await.unwrap()).await;
        assert_eq!(body, b"two");
        assert_eq!(fx.remote.downloads("/Public/x.txt"), 2);
        assert_eq!(fx.cache.entry_count(), 1);
        assert_eq!(fx.cache.total(), 3);
        assert!(!old_disk.exists());
    }

    #[tokio::test]
    async fn oversized_file_bypasses_cache() {
        let fx = fixture(
            CacheParams { cacheable_size: 4, ..params(100) },
            vec![file("/Public/big", "r1", 10)],
            &[("/Public/big", "0123456789")],
        );
        let body = drain(fx.cache.get("big").await.unwrap()).await;
        assert_eq!(body, b"0123456789");
        assert!(fx.cache.resident("big").is_none());
        assert_eq!(fx.cache.total(), 0);

        drain(fx.cache.get("big").await.unwrap()).await;
        assert_eq!(fx.remote.downloads("/Public/big"), 2);
    }

    #[tokio::test]
    async fn abandoned_download_installs_nothing() {
        let fx = fixture(
            params(100),
            vec![file("/Public/x.txt", "r1", 12)],
            &[("/Public/x.txt", "abcdefghijkl")],
        );
        {
            let mut dl = fx.cache.get("x.txt").await.unwrap();
            let first = dl.body.next().await.unwrap().unwrap();
            assert_eq!(first, b"abcd".as_slice());
            // client walks away mid-stream
        }
        assert_eq!(fx.cache.entry_count(), 0);
        assert_eq!(fx.cache.total(), 0);

        // the next request starts over and caches normally
        let body = drain(fx.cache.get("x.txt").await.unwrap()).await;
        assert_eq!(body, b"abcdefghijkl");
        assert_eq!(fx.cache.total(), 12);
    }

    #[tokio::test]
    async fn deleted_file_clears_entry() {
        let fx = fixture(
            params(100),
            vec![file("/Public/x.txt", "r1", 3)],
            &[("/Public/x.txt", "one")],
        );
        drain(fx.cache.get("x.txt").await.unwrap()).await;
        let disk = fx.cache.resident("x.txt").unwrap();

        fx.meta
            .apply_batch(&batch(
                "c2",
                vec![RawEntry::Deleted { path_display: "/Public/x.txt".to_string() }],
            ))
            .unwrap();
        assert!(matches!(
            fx.cache.get("x.txt").await,
            Err(GatewayError::NotFound(_))
        ));
        assert_eq!(fx.cache.entry_count(), 0);
        assert_eq!(fx.cache.total(), 0);
        assert!(!disk.exists());
    }

    #[tokio::test]
    async fn empty_file_round_trips() {
        let fx = fixture(
            params(100),
            vec![file("/Public/empty", "r1", 0)],
            &[("/Public/empty", "")],
        );
        let dl = fx.cache.get("empty").await.unwrap();
        assert_eq!(dl.headers.content_length, 0);
        let body = drain(dl).await;
        assert!(body.is_empty());
        assert_eq!(fx.cache.entry_count(), 1);
        assert_eq!(fx.cache.total(), 0);
    }

    #[tokio::test]
    async fn prime_then_get_serves_identical_bytes() {
        let fx = fixture(
            params(100),
            vec![file("/Public/x.txt", "r1", 9)],
            &[("/Public/x.txt", "九 bytes")],
        );
        fx.cache.prime("x.txt").await;
        assert_eq!(fx.remote.downloads("/Public/x.txt"), 1);

        let body = drain(fx.cache.get("x.txt").await.unwrap()).await;
        assert_eq!(body, "九 bytes".as_bytes());
        assert_eq!(fx.remote.downloads("/Public/x.txt"), 1);

        // priming twice is a no-op
        fx.cache.prime("x.txt").await;
        assert_eq!(fx.remote.downloads("/Public/x.txt"), 1);
    }

    #[tokio::test]
    async fn prime_skips_folders_and_large_files() {
        let fx = fixture(
            CacheParams { prefetch_size: 4, ..params(100) },
            vec![
                RawEntry::Folder(pfg_models::FolderMeta {
                    path_display: "/Public/dir".to_string(),
                }),
                file("/Public/big", "r1", 10),
            ],
            &[("/Public/big", "0123456789")],
        );
        fx.cache.prime("dir").await;
        fx.cache.prime("big").await;
        fx.cache.prime("missing").await;
        assert_eq!(fx.remote.downloads("/Public/big"), 0);
        assert_eq!(fx.cache.total(), 0);
    }

    #[tokio::test]
    async fn prefetch_workers_drain_the_dirty_stream() {
        let fx = fixture(
            params(100),
            vec![file("/Public/x.txt", "r1", 3)],
            &[("/Public/x.txt", "one")],
        );
        let (tx, rx) = mpsc::channel(16);
        let handles = spawn_prefetch_workers(Arc::clone(&fx.cache), rx);

        tx.send("x.txt".to_string()).await.unwrap();
        tx.send("nope".to_string()).await.unwrap();
        drop(tx);
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(fx.remote.downloads("/Public/x.txt"), 1);
        assert!(fx.cache.resident("x.txt").is_some());
    }
}
