//! Read-only serving of the public directory, artifacts included.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::{Request, State},
    http::{HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::application::error::{ErrorReport, HttpError};
use crate::domain::artifact::{ARTIFACT_ROOT, decode_component};
use crate::infra::error::InfraError;

const TARGET: &str = "ogsync::infra::http::public";

#[derive(Debug, Clone)]
pub struct PublicDir {
    root: PathBuf,
}

impl PublicDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a raw request path onto a file below the root.
    ///
    /// The path is not percent-decoded, so artifact file names, which are
    /// stored encoded, match verbatim. Anything but plain segments is
    /// rejected.
    pub fn resolve(&self, raw_path: &str) -> Option<PathBuf> {
        let relative = Path::new(raw_path.trim_start_matches('/'));
        if relative.as_os_str().is_empty()
            || raw_path.ends_with('/')
            || relative
                .components()
                .any(|component| !matches!(component, Component::Normal(_)))
        {
            return None;
        }
        Some(self.root.join(relative))
    }

    /// Reads the file at the raw path, then at the decoded path for plain
    /// site files whose names need escaping in a URL.
    pub async fn read(&self, raw_path: &str) -> Result<Option<Bytes>, std::io::Error> {
        if let Some(bytes) = self.read_resolved(raw_path).await? {
            return Ok(Some(bytes));
        }
        let decoded = decode_component(raw_path);
        if decoded == raw_path {
            return Ok(None);
        }
        self.read_resolved(&decoded).await
    }

    async fn read_resolved(&self, path: &str) -> Result<Option<Bytes>, std::io::Error> {
        let Some(path) = self.resolve(path) else {
            return Ok(None);
        };
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(err) if matches!(err.kind(), ErrorKind::NotFound | ErrorKind::IsADirectory) => {
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}

/// Router that serves every file below `public`.
pub fn static_router(public: Arc<PublicDir>) -> Router {
    Router::new().fallback(serve_file).with_state(public)
}

async fn serve_file(State(public): State<Arc<PublicDir>>, request: Request) -> Response {
    const SOURCE: &str = "infra::http::public::serve_file";

    if !matches!(*request.method(), Method::GET | Method::HEAD) {
        return HttpError::new(
            SOURCE,
            StatusCode::METHOD_NOT_ALLOWED,
            "Method not allowed",
            "static files are read-only",
        )
        .into_response();
    }

    let raw_path = request.uri().path();
    match public.read(raw_path).await {
        Ok(Some(bytes)) => build_file_response(raw_path, bytes),
        Ok(None) => {
            let mut response = StatusCode::NOT_FOUND.into_response();
            ErrorReport::from_message(SOURCE, StatusCode::NOT_FOUND, "Static file not found")
                .attach(&mut response);
            response
        }
        Err(err) => {
            error!(
                target = TARGET,
                op = "public::read",
                result = "error",
                path = %raw_path,
                error = %err,
                "Failed to read public file"
            );
            HttpError::from_error(
                SOURCE,
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to read file",
                &err,
            )
            .into_response()
        }
    }
}

fn build_file_response(raw_path: &str, bytes: Bytes) -> Response {
    let len = bytes.len();
    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = StatusCode::OK;

    let headers = response.headers_mut();
    let mime = mime_guess::from_path(raw_path).first_or_octet_stream();
    if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    if let Ok(value) = HeaderValue::from_str(&len.to_string()) {
        headers.insert(header::CONTENT_LENGTH, value);
    }
    // Artifacts are replaced in place whenever content changes.
    let cache = if raw_path.starts_with(&format!("/{ARTIFACT_ROOT}/")) {
        "public, max-age=0, must-revalidate"
    } else {
        "public, max-age=3600"
    };
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(cache));

    response
}

/// Loopback server that exposes the public directory while a batch renders,
/// so cards can resolve relative assets without a deployed site.
pub struct LocalServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<std::io::Result<()>>,
}

impl LocalServer {
    pub async fn start(public: PublicDir) -> Result<Self, InfraError> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let addr = listener.local_addr()?;
        let router = static_router(Arc::new(public));
        let (shutdown, signal) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            axum::serve(listener, router.into_make_service())
                .with_graceful_shutdown(async {
                    let _ = signal.await;
                })
                .await
        });
        info!(
            target = TARGET,
            op = "local_server::start",
            result = "ok",
            addr = %addr,
            "Local asset server listening"
        );

        Ok(Self {
            addr,
            shutdown: Some(shutdown),
            task,
        })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        match (&mut self.task).await {
            Ok(Ok(())) => info!(
                target = TARGET,
                op = "local_server::stop",
                result = "ok",
                "Local asset server stopped"
            ),
            Ok(Err(err)) => warn!(
                target = TARGET,
                op = "local_server::stop",
                result = "error",
                error = %err,
                "Local asset server failed"
            ),
            Err(err) => warn!(
                target = TARGET,
                op = "local_server::stop",
                result = "error",
                error = %err,
                "Local asset server task aborted"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;
    use tempfile::TempDir;
    use tower::ServiceExt;

    use super::*;

    #[test]
    fn resolve_rejects_traversal_and_directories() {
        let public = PublicDir::new("/srv/public");

        assert_eq!(
            public.resolve("/social-images/en/tag/c%2B%2B.jpg"),
            Some(PathBuf::from("/srv/public/social-images/en/tag/c%2B%2B.jpg"))
        );
        assert_eq!(public.resolve("/../etc/passwd"), None);
        assert_eq!(public.resolve("/social-images/"), None);
        assert_eq!(public.resolve("/"), None);
    }

    #[tokio::test]
    async fn serves_encoded_artifact_names_verbatim() {
        let dir = TempDir::new().expect("temp dir");
        let tag_dir = dir.path().join("social-images/en/tag");
        std::fs::create_dir_all(&tag_dir).expect("dirs");
        std::fs::write(tag_dir.join("c%2B%2B.jpg"), b"jpeg").expect("write");

        let router = static_router(Arc::new(PublicDir::new(dir.path())));
        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .uri("/social-images/en/tag/c%2B%2B.jpg")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE),
            Some(&HeaderValue::from_static("image/jpeg"))
        );
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        assert_eq!(&body[..], b"jpeg");
    }

    #[tokio::test]
    async fn plain_site_files_are_found_by_decoded_name() {
        let dir = TempDir::new().expect("temp dir");
        std::fs::write(dir.path().join("cover image.png"), b"png").expect("write");
        let public = PublicDir::new(dir.path());

        let bytes = public.read("/cover%20image.png").await.expect("read");
        assert_eq!(bytes.as_deref(), Some(&b"png"[..]));
        assert!(public.read("/..%2Fsecret").await.expect("read").is_none());
    }

    #[tokio::test]
    async fn missing_files_are_not_found() {
        let dir = TempDir::new().expect("temp dir");
        let router = static_router(Arc::new(PublicDir::new(dir.path())));

        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .uri("/social-images/root.jpg")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn local_server_binds_an_ephemeral_port() {
        let dir = TempDir::new().expect("temp dir");
        let server = LocalServer::start(PublicDir::new(dir.path()))
            .await
            .expect("start");

        assert!(server.base_url().starts_with("http://127.0.0.1:"));
        assert!(!server.base_url().ends_with(":0"));
        server.stop().await;
    }
}
