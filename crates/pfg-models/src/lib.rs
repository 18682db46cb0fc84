use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use thiserror::Error;
use tokio_stream::Stream;

/// Streaming body coming from the remote or from the disk cache.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, GatewayError>> + Send>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMeta {
    pub path_display: String, // absolute remote path, original casing
    pub rev: String, // remote revision id, changes on every content change
    pub size: u64,
    pub server_modified: Option<String>, // ISO timestamp as the remote reports it
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FolderMeta {
    pub path_display: String,
}

/// Entry stored in the metadata tree and returned by listdir.
#[derive(Debug, Clone, PartialEq)]
pub enum Entry {
    File(FileMeta),
    Folder(FolderMeta),
}

/// Entry as it arrives on the remote's delta stream. Deletions are only a
/// wire-level concept, they never end up in the tree.
#[derive(Debug, Clone, PartialEq)]
pub enum RawEntry {
    File(FileMeta),
    Folder(FolderMeta),
    Deleted { path_display: String },
}

impl RawEntry {
    pub fn path_display(&self) -> &str {
        match self {
            RawEntry::File(f) => &f.path_display,
            RawEntry::Folder(f) => &f.path_display,
            RawEntry::Deleted { path_display } => path_display,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ListFolderResult {
    pub entries: Vec<RawEntry>,
    pub cursor: String, // opaque position in the change stream
    pub has_more: bool,
}

#[derive(Debug, Clone)]
pub struct LongpollResult {
    pub changes: bool,
    pub backoff: Option<u64>, // seconds the remote asks us to wait before polling again
}

/// Headers of a streaming download, as read off the remote's response.
pub struct RemoteDownload {
    pub content_length: Option<u64>,
    pub etag: Option<String>,
    pub content_type: Option<String>,
    pub body: ByteStream,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("is a directory: {0}")]
    IsDirectory(String),
    #[error("is a file: {0}")]
    IsFile(String),
    #[error("remote error: {message}")]
    Remote { message: String, transient: bool },
    #[error("inconsistent remote: {0}")]
    InconsistentRemote(String),
}

impl GatewayError {
    pub fn remote_transient(message: impl Into<String>) -> Self {
        GatewayError::Remote { message: message.into(), transient: true }
    }

    pub fn remote_fatal(message: impl Into<String>) -> Self {
        GatewayError::Remote { message: message.into(), transient: false }
    }

    /// Transient errors are retried by the sync worker and surfaced as 503.
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Remote { transient: true, .. })
    }
}

/// The slice of the remote's API this gateway consumes.
#[async_trait]
pub trait RemoteFiles: Send + Sync + 'static {
    async fn list_folder(
        &self,
        path: &str,
        recursive: bool,
        include_deleted: bool,
    ) -> Result<ListFolderResult, GatewayError>;

    async fn list_folder_continue(&self, cursor: &str) -> Result<ListFolderResult, GatewayError>;

    async fn longpoll(&self, cursor: &str) -> Result<LongpollResult, GatewayError>;

    async fn download(&self, path_display: &str) -> Result<RemoteDownload, GatewayError>;

    async fn temporary_link(&self, path_display: &str) -> Result<String, GatewayError>;
}
