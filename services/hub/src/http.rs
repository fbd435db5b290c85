//! Optional HTTP side-channels: `/proxy` and `/asset`.
//!
//! These are conveniences for dashboard-hosted apps; the core protocol is
//! the `/ws` endpoint.  Errors come back as JSON `{"error": ...}`.

use std::path::Component;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use hub_protocol::Identifier;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::state::Hub;

#[derive(Debug, Deserialize)]
pub struct ProxyParams {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub no_cache: bool,
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

/// Streams an upstream GET through, mirroring status and content type.
pub async fn proxy_handler(
    State(hub): State<Arc<Hub>>,
    Query(params): Query<ProxyParams>,
) -> Response {
    let Some(url) = params.url.filter(|url| !url.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "No URL");
    };
    let upstream = match hub.http_client.get(&url).send().await {
        Ok(upstream) => upstream,
        Err(err) => {
            warn!(url, error = %err, "proxy request failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string());
        }
    };
    let status =
        StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    if !status.is_success() {
        return error_response(status, &format!("upstream returned {status}"));
    }
    let content_type = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_owned();
    let cache_control = if params.no_cache {
        "no-cache"
    } else {
        "max-age=3600"
    };
    match upstream.bytes().await {
        Ok(body) => (
            status,
            [
                (header::CONTENT_TYPE, content_type),
                (header::CACHE_CONTROL, cache_control.to_owned()),
            ],
            body,
        )
            .into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

#[derive(Debug, Deserialize)]
pub struct AssetParams {
    #[serde(default)]
    pub id: Option<String>,
    /// When set, the response may be cached for an hour.
    #[serde(default)]
    pub max_age: bool,
}

/// Serves a file under the assets directory addressed by identifier key.
pub async fn asset_handler(
    State(hub): State<Arc<Hub>>,
    Query(params): Query<AssetParams>,
) -> Response {
    let Some(id) = params.id.filter(|id| !id.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "No ID");
    };
    let identifier = match Identifier::from_key(&id) {
        Ok(identifier) => identifier,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    };
    let relative = identifier.sanitized_path();
    // Sanitization never yields parent components, but the guard stays.
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return error_response(StatusCode::BAD_REQUEST, "invalid asset path");
    }
    let path = hub.directories.assets().join(relative);
    match tokio::fs::read(&path).await {
        Ok(body) => {
            let cache_control = if params.max_age {
                "max-age=3600"
            } else {
                "no-cache"
            };
            (
                StatusCode::OK,
                [
                    (
                        header::CONTENT_TYPE,
                        "application/octet-stream".to_owned(),
                    ),
                    (header::CACHE_CONTROL, cache_control.to_owned()),
                ],
                body,
            )
                .into_response()
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            error_response(StatusCode::NOT_FOUND, "Asset not found")
        }
        Err(err) => {
            warn!(id, error = %err, "asset read failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
        }
    }
}
