mod api;
mod middleware;
mod public;

use std::sync::{Arc, RwLock};

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post},
};

pub use public::{LocalServer, PublicDir, static_router};

use crate::application::render::CardRenderer;
use crate::application::sync::SyncOrchestrator;
use crate::domain::snapshot::Snapshot;
use crate::util::lock::{rw_read, rw_write};
use middleware::{log_responses, set_request_context};

const TARGET: &str = "ogsync::infra::http";

/// The most recent snapshot, shared between the hook and on-demand renders.
#[derive(Clone)]
pub struct SnapshotCell {
    inner: Arc<RwLock<Arc<Snapshot>>>,
}

impl SnapshotCell {
    pub fn new(snapshot: Arc<Snapshot>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(snapshot)),
        }
    }

    pub fn current(&self) -> Arc<Snapshot> {
        rw_read(&self.inner, TARGET, "snapshot_cell::current").clone()
    }

    pub fn replace(&self, snapshot: Arc<Snapshot>) {
        *rw_write(&self.inner, TARGET, "snapshot_cell::replace") = snapshot;
    }
}

#[derive(Clone)]
pub struct HttpState {
    pub renderer: Arc<dyn CardRenderer>,
    pub orchestrator: Arc<SyncOrchestrator>,
    pub snapshots: SnapshotCell,
    pub public: Arc<PublicDir>,
    pub base_url: Option<String>,
}

/// Public listener: on-demand cards, health and the static site tree.
pub fn build_router(state: HttpState) -> Router {
    let public = static_router(state.public.clone());

    Router::new()
        .route(
            "/api/generate-social-image",
            get(api::generate_social_image).fallback(api::method_not_allowed),
        )
        .route("/_health", get(api::health))
        .with_state(state)
        .fallback_service(public)
        .layer(axum_middleware::from_fn(log_responses))
        .layer(axum_middleware::from_fn(set_request_context))
}

/// Administrative listener. The snapshot hook can delete every artifact, so
/// it is never mounted on the public router.
pub fn build_admin_router(state: HttpState) -> Router {
    Router::new()
        .route("/api/snapshots", post(api::accept_snapshot))
        .route("/api/sync/status", get(api::sync_status))
        .route("/_health", get(api::health))
        .with_state(state)
        .layer(axum_middleware::from_fn(log_responses))
        .layer(axum_middleware::from_fn(set_request_context))
}
