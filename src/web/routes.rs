use crate::db::DbPool;
use crate::github::GitHubAppClient;
use crate::oidc::OidcValidator;
use crate::requesters::RequesterStrategy;
use crate::responders::{ResponderStrategy, SlackResponder};
use crate::web::{requester, slack};
use axum::{
    middleware,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use zeroize::Zeroizing;

/// Shared state for every handler
#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub requesters: Arc<Vec<Arc<dyn RequesterStrategy>>>,
    pub responder: Arc<dyn ResponderStrategy>,
    pub slack: Arc<SlackResponder>,
    pub github: Arc<GitHubAppClient>,
    pub oidc: Arc<OidcValidator>,
    pub slack_signing_secret: Zeroizing<String>,
    /// Skip the bearer check on requester routes. Test harnesses only.
    pub bypass_requester_auth: bool,
}

impl AppState {
    pub fn requester(&self, slug: &str) -> Option<Arc<dyn RequesterStrategy>> {
        self.requesters.iter().find(|r| r.slug() == slug).cloned()
    }
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Health check endpoint
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let requests = Router::new()
        .route("/{project_id}/{slug}", post(requester::create_request))
        .route("/{project_id}/{slug}/test", post(requester::test_auth))
        .route("/{project_id}/{slug}/credentials", post(requester::exchange_credentials))
        .route("/{project_id}/{slug}/{request_id}", post(requester::fetch_request))
        .route("/{project_id}/{slug}/{request_id}/validate", post(requester::validate_request));

    let slack_events = Router::new()
        .route("/events", post(slack::handle_event))
        .route_layer(middleware::from_fn_with_state(state.clone(), slack::verify_signature));

    Router::new()
        .route("/health", get(health))
        .nest("/api/request", requests)
        .nest("/api/services/slack", slack_events)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
}
