pub mod handlers;

pub use handlers::*;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, patch, post, put},
    Router,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;

use crate::db::DocumentStore;
use crate::error::AppResult;
use crate::service::{with_timeout, MatchService, UploadStore};

/// multipart 其余字段的余量
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// 路由共享状态
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DocumentStore>,
    pub matcher: Arc<MatchService>,
    pub uploads: UploadStore,
    pub timeout: Duration,
}

impl AppState {
    pub fn new(store: Arc<dyn DocumentStore>, matcher: MatchService, uploads: UploadStore) -> Self {
        let timeout = matcher.timeout();
        Self {
            store,
            matcher: Arc::new(matcher),
            uploads,
            timeout,
        }
    }

    async fn bounded<T>(&self, op: &str, fut: impl Future<Output = AppResult<T>>) -> AppResult<T> {
        with_timeout(self.timeout, op, fut).await
    }
}

/// 构建完整路由: `/health` 在根路径，其余接口挂在 `/api` 下
pub fn router(state: AppState) -> Router {
    let upload_limit = state.uploads.max_bytes() + MULTIPART_OVERHEAD;

    let api = Router::new()
        .route("/companies", post(create_company).get(list_companies))
        .route("/companies/:id/contact", patch(update_company_contact))
        .route(
            "/upload",
            post(upload_document).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/documents", get(list_documents))
        .route("/documents/:id", get(get_document))
        .route("/documents/:id/parsed", put(attach_parsed))
        .route("/match", post(run_match))
        .route("/match/:id", get(get_match))
        .route("/matches/latest", get(latest_match))
        .route("/reports/:name", get(get_report));

    Router::new()
        .route("/health", get(health_check))
        .nest("/api", api)
        .layer(ServiceBuilder::new())
        .with_state(state)
}
