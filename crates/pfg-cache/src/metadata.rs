use pfg_models::{
    Entry, FileMeta, FolderMeta, GatewayError, ListFolderResult, RawEntry, RemoteFiles,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

pub const SUBSCRIBE_DEADLINE: Duration = Duration::from_secs(15);

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

// il prefetch è best-effort: se la coda è piena i path in eccesso si perdono
const DIRTY_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subscription {
    Unchanged,
    Changed,
}

#[derive(Debug)]
enum Child {
    Folder(TreeNode),
    File(FileMeta),
}

/// Folder node of the in-memory tree. Children are keyed by lowered name,
/// `orig_names` keeps the spelling to display; the two maps always hold the
/// same key set.
#[derive(Debug, Default)]
struct TreeNode {
    children: BTreeMap<String, Child>,
    orig_names: HashMap<String, String>,
}

impl TreeNode {
    fn merge(&mut self, rel: &str, entry: &RawEntry) -> Result<(), GatewayError> {
        let comps: Vec<&str> = rel.split('/').collect();
        let mut node = self;
        for comp in &comps[..comps.len() - 1] {
            let lowered = comp.to_lowercase();
            node.orig_names
                .entry(lowered.clone())
                .or_insert_with(|| (*comp).to_string());
            let child = node
                .children
                .entry(lowered)
                .or_insert_with(|| Child::Folder(TreeNode::default()));
            node = match child {
                Child::Folder(n) => n,
                Child::File(_) => {
                    return Err(GatewayError::InconsistentRemote(format!(
                        "child announced under file parent: {}",
                        rel
                    )));
                }
            };
        }

        let leaf = comps[comps.len() - 1];
        let lowered = leaf.to_lowercase();
        match entry {
            RawEntry::File(meta) => {
                // qualunque cosa ci fosse prima viene sostituita dal file
                node.children.insert(lowered.clone(), Child::File(meta.clone()));
                node.orig_names.insert(lowered, leaf.to_string());
            }
            RawEntry::Folder(_) => {
                match node.children.get(&lowered) {
                    Some(Child::Folder(_)) => {} // folders are idempotent
                    _ => {
                        node.children
                            .insert(lowered.clone(), Child::Folder(TreeNode::default()));
                    }
                }
                node.orig_names.insert(lowered, leaf.to_string());
            }
            RawEntry::Deleted { .. } => {
                // children of a deleted folder arrive with their own Deleted entries
                node.children.remove(&lowered);
                node.orig_names.remove(&lowered);
            }
        }
        Ok(())
    }
}

struct TreeState {
    tree: TreeNode,
    cursor: String,
}

enum SyncState {
    Listing(Option<String>),
    Longpolling(String),
}

fn normalize(path: &str) -> Result<&str, GatewayError> {
    let trimmed = path.trim_matches('/');
    if trimmed.split('/').any(|c| c == "..") {
        return Err(GatewayError::NotFound(path.to_string()));
    }
    Ok(trimmed)
}

/// Case-insensitive snapshot of the remote tree, kept fresh by `run_sync`.
pub struct MetadataCache<R> {
    remote: Arc<R>,
    root: String,
    state: Mutex<TreeState>,
    cursor_tx: watch::Sender<String>,
    dirty_tx: mpsc::Sender<String>,
    dirty_rx: Mutex<Option<mpsc::Receiver<String>>>,
    degraded: AtomicBool,
}

impl<R: RemoteFiles> MetadataCache<R> {
    pub fn new(remote: Arc<R>, root: &str) -> Self {
        let (cursor_tx, _) = watch::channel(String::new());
        let (dirty_tx, dirty_rx) = mpsc::channel(DIRTY_QUEUE_CAPACITY);
        Self {
            remote,
            root: root.to_string(),
            state: Mutex::new(TreeState { tree: TreeNode::default(), cursor: String::new() }),
            cursor_tx,
            dirty_tx,
            dirty_rx: Mutex::new(Some(dirty_rx)),
            degraded: AtomicBool::new(false),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Consumer side of the dirty-path stream. Single consumer; the prefetch
    /// workers share it behind a lock.
    pub fn take_dirty_paths(&self) -> mpsc::Receiver<String> {
        self.dirty_rx
            .lock()
            .unwrap()
            .take()
            .expect("dirty paths already taken")
    }

    /// True once the sync worker gave up on a non-transient error. Readers
    /// keep serving the last good snapshot.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn stat(&self, path: &str) -> Result<FileMeta, GatewayError> {
        let rel = normalize(path)?;
        if rel.is_empty() {
            return Err(GatewayError::IsDirectory("/".to_string()));
        }
        let Ok(st) = self.state.lock() else {
            return Err(GatewayError::NotFound(path.to_string()));
        };
        let comps: Vec<&str> = rel.split('/').collect();
        let mut node = &st.tree;
        for (i, comp) in comps.iter().enumerate() {
            match node.children.get(&comp.to_lowercase()) {
                None => return Err(GatewayError::NotFound(path.to_string())),
                Some(Child::File(meta)) => {
                    if i == comps.len() - 1 {
                        return Ok(meta.clone());
                    }
                    // un file non ha figli
                    return Err(GatewayError::NotFound(path.to_string()));
                }
                Some(Child::Folder(n)) => {
                    if i == comps.len() - 1 {
                        return Err(GatewayError::IsDirectory(path.to_string()));
                    }
                    node = n;
                }
            }
        }
        Err(GatewayError::NotFound(path.to_string()))
    }

    /// Entries of a folder, ascending by lowered name, together with the
    /// cursor the listing was read at.
    pub fn listdir(&self, path: &str) -> Result<(Vec<(String, Entry)>, String), GatewayError> {
        let rel = normalize(path)?;
        let Ok(st) = self.state.lock() else {
            return Err(GatewayError::NotFound(path.to_string()));
        };
        let mut node = &st.tree;
        let mut display_prefix = self.root.trim_end_matches('/').to_string();
        if !rel.is_empty() {
            for comp in rel.split('/') {
                let lowered = comp.to_lowercase();
                match node.children.get(&lowered) {
                    None => return Err(GatewayError::NotFound(path.to_string())),
                    Some(Child::File(_)) => {
                        return Err(GatewayError::IsFile(path.to_string()));
                    }
                    Some(Child::Folder(n)) => {
                        let disp = node
                            .orig_names
                            .get(&lowered)
                            .cloned()
                            .unwrap_or_else(|| lowered.clone());
                        display_prefix.push('/');
                        display_prefix.push_str(&disp);
                        node = n;
                    }
                }
            }
        }

        let mut result = Vec::with_capacity(node.children.len());
        for (lowered, child) in &node.children {
            let name = node
                .orig_names
                .get(lowered)
                .cloned()
                .unwrap_or_else(|| lowered.clone());
            let entry = match child {
                Child::File(meta) => Entry::File(meta.clone()),
                Child::Folder(_) => Entry::Folder(FolderMeta {
                    path_display: format!("{}/{}", display_prefix, name),
                }),
            };
            result.push((name, entry));
        }
        Ok((result, st.cursor.clone()))
    }

    /// Blocks until the published cursor differs from `client_cursor` or the
    /// deadline expires. Never errors: internal failures report `Changed` so
    /// the client refreshes.
    pub async fn subscribe(&self, client_cursor: &str, deadline: Duration) -> Subscription {
        let mut rx = self.cursor_tx.subscribe();
        {
            let Ok(st) = self.state.lock() else {
                return Subscription::Changed;
            };
            if st.cursor != client_cursor {
                return Subscription::Changed;
            }
        }
        let wait = async {
            loop {
                if rx.changed().await.is_err() {
                    return; // sender gone, force a refresh
                }
                if *rx.borrow() != client_cursor {
                    return;
                }
            }
        };
        match tokio::time::timeout(deadline, wait).await {
            Ok(()) => Subscription::Changed,
            Err(_) => Subscription::Unchanged,
        }
    }

    /// Relative path of a remote entry, checked against the root prefix.
    fn relative(&self, path_display: &str) -> Result<String, GatewayError> {
        if !path_display.to_lowercase().starts_with(&self.root.to_lowercase()) {
            return Err(GatewayError::InconsistentRemote(format!(
                "entry {} outside of root {}",
                path_display, self.root
            )));
        }
        Ok(path_display[self.root.len()..].trim_matches('/').to_string())
    }

    /// Merge one delta batch and publish its cursor. Returns the dirty paths.
    pub(crate) fn apply_batch(
        &self,
        resp: &ListFolderResult,
    ) -> Result<Vec<String>, GatewayError> {
        let mut dirty = Vec::with_capacity(resp.entries.len());
        {
            let mut st = self.state.lock().unwrap();
            for entry in &resp.entries {
                let rel = self.relative(entry.path_display())?;
                if rel.is_empty() {
                    // the first listing announces the root folder itself
                    match entry {
                        RawEntry::Folder(_) => continue,
                        _ => {
                            return Err(GatewayError::InconsistentRemote(format!(
                                "non-folder entry at root: {}",
                                entry.path_display()
                            )));
                        }
                    }
                }
                st.tree.merge(&rel, entry)?;
                dirty.push(rel);
            }
            st.cursor = resp.cursor.clone();
        }
        self.cursor_tx.send_replace(resp.cursor.clone());
        Ok(dirty)
    }

    async fn list_once(&self, cursor: Option<&str>) -> Result<(String, bool), GatewayError> {
        let resp = match cursor {
            None => self.remote.list_folder(&self.root, true, true).await?,
            Some(c) => self.remote.list_folder_continue(c).await?,
        };
        tracing::info!(entries = resp.entries.len(), cursor = %resp.cursor, "merged listing batch");
        let dirty = self.apply_batch(&resp)?;
        for path in dirty {
            if self.dirty_tx.try_send(path).is_err() {
                tracing::debug!("dirty queue full, dropping prefetch candidate");
            }
        }
        Ok((resp.cursor, resp.has_more))
    }

    fn mark_degraded(&self, err: &GatewayError) {
        tracing::error!(error = %err, "sync worker halted, serving the last good snapshot");
        self.degraded.store(true, Ordering::SeqCst);
    }

    /// Sync worker: lists until the remote has no more, then long-polls.
    /// Transient errors back off exponentially; anything else degrades.
    pub async fn run_sync(self: Arc<Self>) {
        let mut state = SyncState::Listing(None);
        let mut backoff = BACKOFF_BASE;
        loop {
            state = match state {
                SyncState::Listing(cursor) => {
                    match self.list_once(cursor.as_deref()).await {
                        Ok((next, true)) => {
                            backoff = BACKOFF_BASE;
                            SyncState::Listing(Some(next))
                        }
                        Ok((next, false)) => {
                            backoff = BACKOFF_BASE;
                            SyncState::Longpolling(next)
                        }
                        Err(e) if e.is_transient() => {
                            tracing::warn!(error = %e, delay = ?backoff, "listing failed, retrying");
                            tokio::time::sleep(backoff).await;
                            backoff = (backoff * 2).min(BACKOFF_CAP);
                            SyncState::Listing(cursor)
                        }
                        Err(e) => {
                            self.mark_degraded(&e);
                            return;
                        }
                    }
                }
                SyncState::Longpolling(cursor) => match self.remote.longpoll(&cursor).await {
                    Ok(resp) => {
                        backoff = BACKOFF_BASE;
                        if let Some(secs) = resp.backoff {
                            tokio::time::sleep(Duration::from_secs(secs)).await;
                        }
                        if resp.changes {
                            tracing::debug!("woke up from longpoll, listing");
                            SyncState::Listing(Some(cursor))
                        } else {
                            SyncState::Longpolling(cursor)
                        }
                    }
                    Err(e) if e.is_transient() => {
                        tracing::warn!(error = %e, delay = ?backoff, "longpoll failed, retrying");
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(BACKOFF_CAP);
                        SyncState::Longpolling(cursor)
                    }
                    Err(e) => {
                        self.mark_degraded(&e);
                        return;
                    }
                },
            };
        }
    }
}
