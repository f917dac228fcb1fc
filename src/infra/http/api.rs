use axum::{
    Json,
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::HttpState;
use crate::application::error::{AppError, HttpError};
use crate::application::render::RenderTask;
use crate::application::sync::SnapshotRefreshed;
use crate::domain::snapshot::Snapshot;

const TARGET: &str = "ogsync::infra::http::api";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(super) struct SocialImageQuery {
    path: Option<String>,
    url: Option<String>,
    #[serde(rename = "imageUrl")]
    image_url: Option<String>,
}

impl SocialImageQuery {
    fn target(&self) -> &str {
        self.url
            .as_deref()
            .or(self.path.as_deref())
            .filter(|value| !value.is_empty())
            .unwrap_or("/")
    }
}

/// Renders a card on demand for the requested page.
pub(super) async fn generate_social_image(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Query(query): Query<SocialImageQuery>,
) -> Response {
    const SOURCE: &str = "infra::http::api::generate_social_image";

    let target = query.target().to_string();
    let base_url = request_base_url(&headers, state.base_url.as_deref());
    let task = RenderTask::for_url(target.clone(), state.snapshots.current())
        .with_image_override(query.image_url.filter(|url| !url.is_empty()))
        .with_base_url(base_url);

    match state.renderer.render(&task).await {
        Ok(jpeg) => {
            info!(
                target = TARGET,
                op = "generate_social_image",
                result = "ok",
                url = %target,
                bytes = jpeg.len(),
                "Rendered social image on demand"
            );
            let mut response = jpeg.into_response();
            let headers = response.headers_mut();
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("image/jpeg"));
            headers.insert(
                header::CACHE_CONTROL,
                HeaderValue::from_static("s-maxage=0, stale-while-revalidate"),
            );
            response
        }
        Err(err) => HttpError::from_error(
            SOURCE,
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to generate social image.",
            &err,
        )
        .into_response(),
    }
}

pub(super) async fn method_not_allowed() -> Response {
    HttpError::new(
        "infra::http::api::method_not_allowed",
        StatusCode::METHOD_NOT_ALLOWED,
        "Method not allowed",
        "only GET is supported",
    )
    .into_response()
}

#[derive(Debug, Serialize)]
pub(super) struct SnapshotAccepted {
    accepted: bool,
}

/// Replaces the current snapshot and schedules a sync against it.
pub(super) async fn accept_snapshot(
    State(state): State<HttpState>,
    Json(snapshot): Json<Snapshot>,
) -> Result<(StatusCode, Json<SnapshotAccepted>), AppError> {
    snapshot.validate()?;
    let refreshed = SnapshotRefreshed::new(snapshot);
    state.snapshots.replace(refreshed.snapshot.clone());

    let accepted = state.orchestrator.trigger(refreshed);
    if !accepted {
        warn!(
            target = TARGET,
            op = "accept_snapshot",
            result = "dropped",
            "Sync already running; snapshot stored for on-demand rendering only"
        );
    }

    Ok((StatusCode::ACCEPTED, Json(SnapshotAccepted { accepted })))
}

pub(super) async fn sync_status(State(state): State<HttpState>) -> Response {
    Json(state.orchestrator.status()).into_response()
}

pub(super) async fn health() -> StatusCode {
    StatusCode::NO_CONTENT
}

/// Local hosts render against themselves so relative assets resolve.
fn request_base_url(headers: &HeaderMap, configured: Option<&str>) -> Option<String> {
    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .filter(|host| !host.is_empty());

    match (host, configured) {
        (Some(host), _) if host.contains("localhost") || host.contains("127.0.0.1") => {
            Some(format!("http://{host}"))
        }
        (Some(host), None) => Some(format!("http://{host}")),
        (_, Some(configured)) => Some(configured.to_string()),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn url_wins_over_path() {
        let query = SocialImageQuery {
            path: Some("/en/post/a".to_string()),
            url: Some("https://blog.example.com/en/post/b".to_string()),
            image_url: None,
        };
        assert_eq!(query.target(), "https://blog.example.com/en/post/b");
        assert_eq!(SocialImageQuery::default().target(), "/");
    }

    #[test]
    fn local_hosts_render_against_themselves() {
        assert_eq!(
            request_base_url(&host("localhost:3000"), Some("https://blog.example.com")),
            Some("http://localhost:3000".to_string())
        );
        assert_eq!(
            request_base_url(&host("127.0.0.1:8080"), None),
            Some("http://127.0.0.1:8080".to_string())
        );
    }

    #[test]
    fn configured_base_url_applies_to_public_hosts() {
        assert_eq!(
            request_base_url(&host("preview.example.com"), Some("https://blog.example.com")),
            Some("https://blog.example.com".to_string())
        );
        assert_eq!(
            request_base_url(&host("preview.example.com"), None),
            Some("http://preview.example.com".to_string())
        );
        assert_eq!(request_base_url(&HeaderMap::new(), None), None);
    }
}
