use async_trait::async_trait;
use futures_util::TryStreamExt;
use pfg_models::{
    GatewayError, ListFolderResult, LongpollResult, RawEntry, RemoteDownload, RemoteFiles,
};
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

pub mod stub;

const API_BASE: &str = "https://api.dropboxapi.com/2/";
const CONTENT_BASE: &str = "https://content.dropboxapi.com/2/";
const NOTIFY_BASE: &str = "https://notify.dropboxapi.com/2/";

// il longpoll lato remoto tiene la richiesta aperta fino a questo timeout
const LONGPOLL_TIMEOUT_SECS: u64 = 30;

#[derive(Deserialize, Debug)]
#[serde(tag = ".tag", rename_all = "lowercase")]
enum EntryWire {
    File {
        path_display: String,
        rev: String,
        size: u64,
        server_modified: Option<String>,
    },
    Folder {
        path_display: String,
    },
    Deleted {
        path_display: String,
    },
}

impl From<EntryWire> for RawEntry {
    fn from(wire: EntryWire) -> Self {
        match wire {
            EntryWire::File { path_display, rev, size, server_modified } => {
                RawEntry::File(pfg_models::FileMeta { path_display, rev, size, server_modified })
            }
            EntryWire::Folder { path_display } => {
                RawEntry::Folder(pfg_models::FolderMeta { path_display })
            }
            EntryWire::Deleted { path_display } => RawEntry::Deleted { path_display },
        }
    }
}

#[derive(Deserialize)]
struct ListFolderWire {
    entries: Vec<EntryWire>,
    cursor: String,
    has_more: bool,
}

#[derive(Serialize)]
struct ListFolderArg<'a> {
    path: &'a str,
    recursive: bool,
    include_deleted: bool,
}

#[derive(Serialize)]
struct CursorArg<'a> {
    cursor: &'a str,
}

#[derive(Serialize)]
struct LongpollArg<'a> {
    cursor: &'a str,
    timeout: u64,
}

#[derive(Deserialize)]
struct LongpollWire {
    changes: bool,
    backoff: Option<u64>,
}

#[derive(Serialize)]
struct PathArg<'a> {
    path: &'a str,
}

#[derive(Deserialize)]
struct TempLinkWire {
    link: String,
}

fn classify_send_error(e: reqwest::Error) -> GatewayError {
    // errori di rete sono transitori e vanno ritentati, il resto no
    if e.is_connect() || e.is_timeout() {
        GatewayError::remote_transient(e.to_string())
    } else {
        GatewayError::remote_fatal(e.to_string())
    }
}

fn classify_status(status: StatusCode, body: &str) -> GatewayError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        GatewayError::remote_transient(format!("{}: {}", status, body))
    } else {
        GatewayError::remote_fatal(format!("{}: {}", status, body))
    }
}

/// Client for the remote's split RPC/content/notify hosts.
pub struct HttpRemote {
    client: Client,
    api_base: Url,
    content_base: Url,
    notify_base: Url,
    token: String,
}

impl HttpRemote {
    pub fn new(access_token: &str) -> Self {
        let client = reqwest::Client::builder()
            .build()
            .expect("Unable to build the Client object");
        Self {
            client,
            api_base: Url::from_str(API_BASE).expect("static url"),
            content_base: Url::from_str(CONTENT_BASE).expect("static url"),
            notify_base: Url::from_str(NOTIFY_BASE).expect("static url"),
            token: access_token.to_string(),
        }
    }

    async fn rpc<B: Serialize, R: DeserializeOwned>(
        &self,
        base: &Url,
        endpoint: &str,
        body: &B,
        authenticated: bool,
    ) -> Result<R, GatewayError> {
        let url = base
            .join(endpoint)
            .map_err(|e| GatewayError::remote_fatal(e.to_string()))?;
        let mut req = self.client.post(url).json(body);
        if authenticated {
            req = req.bearer_auth(&self.token);
        }
        let resp = req.send().await.map_err(classify_send_error)?;
        let status = resp.status();
        if status.is_success() {
            resp.json::<R>()
                .await
                .map_err(|e| GatewayError::remote_fatal(format!("bad answer format: {}", e)))
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(classify_status(status, &body))
        }
    }
}

#[async_trait]
impl RemoteFiles for HttpRemote {
    async fn list_folder(
        &self,
        path: &str,
        recursive: bool,
        include_deleted: bool,
    ) -> Result<ListFolderResult, GatewayError> {
        // la root dell'account si indica con stringa vuota, non con "/"
        let path = if path == "/" { "" } else { path };
        let arg = ListFolderArg { path, recursive, include_deleted };
        let wire: ListFolderWire = self
            .rpc(&self.api_base, "files/list_folder", &arg, true)
            .await?;
        Ok(ListFolderResult {
            entries: wire.entries.into_iter().map(RawEntry::from).collect(),
            cursor: wire.cursor,
            has_more: wire.has_more,
        })
    }

    async fn list_folder_continue(&self, cursor: &str) -> Result<ListFolderResult, GatewayError> {
        let arg = CursorArg { cursor };
        let wire: ListFolderWire = self
            .rpc(&self.api_base, "files/list_folder/continue", &arg, true)
            .await?;
        Ok(ListFolderResult {
            entries: wire.entries.into_iter().map(RawEntry::from).collect(),
            cursor: wire.cursor,
            has_more: wire.has_more,
        })
    }

    async fn longpoll(&self, cursor: &str) -> Result<LongpollResult, GatewayError> {
        // the notify host takes no auth header
        let arg = LongpollArg { cursor, timeout: LONGPOLL_TIMEOUT_SECS };
        let wire: LongpollWire = self
            .rpc(&self.notify_base, "files/list_folder/longpoll", &arg, false)
            .await?;
        Ok(LongpollResult { changes: wire.changes, backoff: wire.backoff })
    }

    async fn download(&self, path_display: &str) -> Result<RemoteDownload, GatewayError> {
        tracing::debug!(path = %path_display, "remote download");
        let url = self
            .content_base
            .join("files/download")
            .map_err(|e| GatewayError::remote_fatal(e.to_string()))?;
        let arg = serde_json::to_string(&PathArg { path: path_display })
            .map_err(|e| GatewayError::remote_fatal(e.to_string()))?;
        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .header("Dropbox-API-Arg", arg)
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let header = |name: &str| {
            resp.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let content_length = header("Content-Length").and_then(|v| v.parse::<u64>().ok());
        let etag = header("ETag");
        let content_type = header("Content-Type");

        Ok(RemoteDownload {
            content_length,
            etag,
            content_type,
            body: Box::pin(resp.bytes_stream().map_err(classify_send_error)),
        })
    }

    async fn temporary_link(&self, path_display: &str) -> Result<String, GatewayError> {
        tracing::debug!(path = %path_display, "remote temporary link");
        let arg = PathArg { path: path_display };
        let wire: TempLinkWire = self
            .rpc(&self.api_base, "files/get_temporary_link", &arg, true)
            .await?;
        Ok(wire.link)
    }
}
