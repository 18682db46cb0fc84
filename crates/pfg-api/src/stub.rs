use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream;
use pfg_models::{
    GatewayError, ListFolderResult, LongpollResult, RawEntry, RemoteDownload, RemoteFiles,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

/// In-memory remote used by the test suites: batches of entries are scripted
/// with `push_batch`, longpoll wakes up when a new batch arrives.
pub struct StubRemote {
    queue: Mutex<VecDeque<ListFolderResult>>,
    last_cursor: Mutex<String>,
    bodies: Mutex<HashMap<String, Bytes>>,
    download_counts: Mutex<HashMap<String, usize>>,
    next_cursor: AtomicUsize,
    templinks_issued: AtomicUsize,
    chunk_size: AtomicUsize,
    notify: Notify,
}

impl StubRemote {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            last_cursor: Mutex::new("cursor-0".to_string()),
            bodies: Mutex::new(HashMap::new()),
            download_counts: Mutex::new(HashMap::new()),
            next_cursor: AtomicUsize::new(1),
            templinks_issued: AtomicUsize::new(0),
            chunk_size: AtomicUsize::new(8192),
            notify: Notify::new(),
        }
    }

    /// Queue a delta batch; any parked longpoll wakes up.
    pub fn push_batch(&self, entries: Vec<RawEntry>) -> String {
        let n = self.next_cursor.fetch_add(1, Ordering::SeqCst);
        let cursor = format!("cursor-{}", n);
        self.queue.lock().unwrap().push_back(ListFolderResult {
            entries,
            cursor: cursor.clone(),
            has_more: false,
        });
        // notify_one parks a permit, so a poller that checks the queue just
        // before the push still wakes up
        self.notify.notify_one();
        cursor
    }

    pub fn set_body(&self, path_display: &str, body: impl Into<Bytes>) {
        self.bodies
            .lock()
            .unwrap()
            .insert(path_display.to_string(), body.into());
    }

    pub fn set_chunk_size(&self, n: usize) {
        self.chunk_size.store(n, Ordering::SeqCst);
    }

    /// How many times a path was downloaded, for cache-hit assertions.
    pub fn downloads(&self, path_display: &str) -> usize {
        self.download_counts
            .lock()
            .unwrap()
            .get(path_display)
            .copied()
            .unwrap_or(0)
    }

    pub fn templinks_issued(&self) -> usize {
        self.templinks_issued.load(Ordering::SeqCst)
    }

    fn pop_batch(&self) -> ListFolderResult {
        let mut queue = self.queue.lock().unwrap();
        match queue.pop_front() {
            Some(res) => {
                *self.last_cursor.lock().unwrap() = res.cursor.clone();
                res
            }
            None => ListFolderResult {
                entries: Vec::new(),
                cursor: self.last_cursor.lock().unwrap().clone(),
                has_more: false,
            },
        }
    }
}

impl Default for StubRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteFiles for StubRemote {
    async fn list_folder(
        &self,
        _path: &str,
        _recursive: bool,
        _include_deleted: bool,
    ) -> Result<ListFolderResult, GatewayError> {
        Ok(self.pop_batch())
    }

    async fn list_folder_continue(&self, _cursor: &str) -> Result<ListFolderResult, GatewayError> {
        Ok(self.pop_batch())
    }

    async fn longpoll(&self, _cursor: &str) -> Result<LongpollResult, GatewayError> {
        loop {
            if !self.queue.lock().unwrap().is_empty() {
                return Ok(LongpollResult { changes: true, backoff: None });
            }
            self.notify.notified().await;
        }
    }

    async fn download(&self, path_display: &str) -> Result<RemoteDownload, GatewayError> {
        let body = self
            .bodies
            .lock()
            .unwrap()
            .get(path_display)
            .cloned()
            .ok_or_else(|| GatewayError::remote_fatal(format!("no body for {}", path_display)))?;
        *self
            .download_counts
            .lock()
            .unwrap()
            .entry(path_display.to_string())
            .or_insert(0) += 1;

        let chunk_size = self.chunk_size.load(Ordering::SeqCst).max(1);
        let mut chunks = Vec::new();
        let mut rest = body.clone();
        while rest.len() > chunk_size {
            chunks.push(Ok(rest.split_to(chunk_size)));
        }
        chunks.push(Ok(rest));

        Ok(RemoteDownload {
            content_length: Some(body.len() as u64),
            etag: Some(format!("\"etag:{}\"", path_display)),
            content_type: None,
            body: Box::pin(stream::iter(chunks)),
        })
    }

    async fn temporary_link(&self, path_display: &str) -> Result<String, GatewayError> {
        let n = self.templinks_issued.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("https://stub.invalid/tl/{}{}", n, path_display))
    }
}
