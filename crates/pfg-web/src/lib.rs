use axum::body::Body;
use axum::extract::{Path as UrlPath, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use axum::{Json, Router};
use axum::routing::get;
use pfg_cache::{
    BlockCache, Download, EtagCache, MetadataCache, SUBSCRIBE_DEADLINE, STATIC_HEADERS,
    Subscription, TempLinkCache,
};
use pfg_models::{GatewayError, RemoteFiles};
use std::sync::Arc;

mod html;

/// Everything a request handler needs: the caches and, through them, the
/// remote. Built once at startup and shared.
pub struct Server<R: RemoteFiles> {
    metadata: Arc<MetadataCache<R>>,
    blocks: Arc<BlockCache<R>>,
    etags: EtagCache<R>,
    templinks: TempLinkCache<R>,
}

impl<R: RemoteFiles> Server<R> {
    pub fn new(
        remote: Arc<R>,
        metadata: Arc<MetadataCache<R>>,
        blocks: Arc<BlockCache<R>>,
    ) -> Self {
        Self {
            etags: EtagCache::new(Arc::clone(&metadata)),
            templinks: TempLinkCache::new(remote, Arc::clone(&metadata)),
            metadata,
            blocks,
        }
    }
}

pub fn router<R: RemoteFiles>(server: Arc<Server<R>>) -> Router {
    let root = server.metadata.root().trim_end_matches('/').to_string();
    let index = if root.is_empty() { "/".to_string() } else { format!("{}/", root) };
    let wildcard = format!("{}/{{*path}}", root);
    Router::new()
        .route(&index, get(folder_index::<R>))
        .route(&wildcard, get(serve_path::<R>))
        .route("/subscribe/{cursor}", get(subscribe::<R>))
        .with_state(server)
}

async fn folder_index<R: RemoteFiles>(
    State(server): State<Arc<Server<R>>>,
    headers: HeaderMap,
) -> Response {
    serve(&server, "", &headers).await
}

async fn serve_path<R: RemoteFiles>(
    State(server): State<Arc<Server<R>>>,
    UrlPath(path): UrlPath<String>,
    headers: HeaderMap,
) -> Response {
    serve(&server, &path, &headers).await
}

async fn serve<R: RemoteFiles>(
    server: &Server<R>,
    path: &str,
    req_headers: &HeaderMap,
) -> Response {
    match server.metadata.listdir(path) {
        Ok((entries, cursor)) => {
            Html(html::folder_page(server.metadata.root(), path, &entries, &cursor))
                .into_response()
        }
        Err(GatewayError::IsFile(_)) => serve_file(server, path, req_headers).await,
        Err(e) => error_response(&e),
    }
}

async fn serve_file<R: RemoteFiles>(
    server: &Server<R>,
    path: &str,
    req_headers: &HeaderMap,
) -> Response {
    if let Some(tag) = req_headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
    {
        if server.etags.is_current(path, tag) {
            return StatusCode::NOT_MODIFIED.into_response();
        }
    }

    if req_headers.contains_key(header::RANGE) {
        // byte ranges are the remote's job: hand the client a direct link
        return match server.templinks.get(path).await {
            Ok(url) => (StatusCode::FOUND, [(header::LOCATION, url)]).into_response(),
            Err(e) => error_response(&e),
        };
    }

    match server.blocks.get(path).await {
        Ok(dl) => {
            server.etags.register(path, &dl.meta, &dl.headers.etag);
            file_response(path, dl)
        }
        Err(e) => error_response(&e),
    }
}

fn file_response(path: &str, dl: Download) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_LENGTH, dl.headers.content_length)
        .header(header::ETAG, dl.headers.etag.clone());
    for (name, value) in STATIC_HEADERS {
        builder = builder.header(name, value);
    }
    let filename = path.rsplit('/').next().unwrap_or("");
    builder = match mime_guess::from_path(filename).first() {
        Some(mime) => builder
            .header(header::CONTENT_TYPE, mime.as_ref())
            .header(header::CONTENT_DISPOSITION, "inline"),
        None => builder
            .header(
                header::CONTENT_TYPE,
                dl.headers
                    .content_type
                    .as_deref()
                    .unwrap_or("application/octet-stream"),
            )
            .header(header::CONTENT_DISPOSITION, "attachment"),
    };
    match builder.body(Body::from_stream(dl.body)) {
        Ok(resp) => resp,
        Err(e) => {
            tracing::error!(error = %e, "failed to build file response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn subscribe<R: RemoteFiles>(
    State(server): State<Arc<Server<R>>>,
    UrlPath(cursor): UrlPath<String>,
) -> Json<serde_json::Value> {
    let result = match server.metadata.subscribe(&cursor, SUBSCRIBE_DEADLINE).await {
        Subscription::Unchanged => "ok",
        Subscription::Changed => "refresh",
    };
    Json(serde_json::json!({ "result": result }))
}

fn error_response(err: &GatewayError) -> Response {
    let status = match err {
        GatewayError::NotFound(_) | GatewayError::IsDirectory(_) => StatusCode::NOT_FOUND,
        GatewayError::Remote { transient: true, .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status != StatusCode::NOT_FOUND {
        tracing::error!(error = %err, "request failed");
    }
    status.into_response()
}
