//! HTTP config server
//!
//! Phones that speak HTTP fetch the same rendered configs TFTP clients do.
//! Every `GET` goes through the dispatcher; anything it cannot answer is a
//! plain 404 so that probing devices learn nothing about installed plugins.

use crate::dispatch::{Dispatcher, HttpRequest, RawRequest};
use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info};

/// Header some phones use to announce their MAC address
pub const MAC_HEADER: &str = "x-mac-address";

/// Build the config router
pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/", get(serve_config))
        .route("/{*path}", get(serve_config))
        .with_state(dispatcher)
}

/// Serve the router until the shutdown signal fires
pub async fn serve(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    info!(bind_addr = %addr, "HTTP config server listening");

    axum::serve(listener, router(dispatcher))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;

    info!(bind_addr = %addr, "HTTP config server stopped");
    Ok(())
}

/// Bind the HTTP listener
pub async fn bind(addr: SocketAddr) -> std::io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

fn header_str(headers: &HeaderMap, name: impl header::AsHeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Strong ETag over the body
fn etag(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    format!("\"{:x}\"", hasher.finalize())
}

async fn serve_config(
    State(dispatcher): State<Arc<Dispatcher>>,
    uri: Uri,
    Query(query): Query<BTreeMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let request = RawRequest::Http(HttpRequest {
        path: uri.path().to_string(),
        query,
        mac_header: header_str(&headers, MAC_HEADER),
        user_agent: header_str(&headers, header::USER_AGENT),
    });

    let resolution = match dispatcher.resolve(&request, None).await {
        Ok(resolution) => resolution,
        Err(e) => {
            debug!(path = %uri.path(), error = %e, "HTTP config request refused");
            return StatusCode::NOT_FOUND.into_response();
        }
    };

    let tag = etag(&resolution.content);
    if header_str(&headers, header::IF_NONE_MATCH).is_some_and(|seen| seen == tag) {
        return (StatusCode::NOT_MODIFIED, [(header::ETAG, tag)]).into_response();
    }

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, resolution.content_type),
            (header::ETAG, tag),
        ],
        resolution.content,
    )
        .into_response()
}
