//! Routes a CI job talks to: create, validate and fetch OTP requests, plus
//! the OIDC credential exchange.

use crate::db::models::{FullProject, OtpRequest, RequestState};
use crate::db::{OtpRequestRepo, ProjectRepo};
use crate::error::{AppError, AppResult};
use crate::requesters::{AllowedState, RequesterStrategy};
use crate::web::routes::AppState;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde_json::{json, Value};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};
use uuid::Uuid;

const INVALID_BUILD: &str = "Invalid build provided, check the CFA dashboard for reasoning.";
const PROOF_NOT_FOUND: &str =
    "Failed to validate build.  Could not find the proof in the build logs in an adaquete time period.";

fn parse_project_id(raw: &str) -> AppResult<i64> {
    raw.parse()
        .map_err(|_| AppError::ParamsValidation("\"projectId\" must be a number".to_string()))
}

fn parse_request_id(raw: &str) -> AppResult<Uuid> {
    Uuid::parse_str(raw)
        .ok()
        .filter(|id| id.get_version_num() == 4)
        .ok_or_else(|| AppError::ParamsValidation("\"requestId\" must be a valid GUID".to_string()))
}

fn requester_for(state: &AppState, slug: &str) -> AppResult<Arc<dyn RequesterStrategy>> {
    state
        .requester(slug)
        .ok_or_else(|| AppError::not_found("Not Found"))
}

/// JSON body, `{}` when empty. Malformed JSON reads as `null` so the
/// schema check reports it.
fn json_body(body: &Bytes) -> Value {
    if body.is_empty() {
        return json!({});
    }
    serde_json::from_slice(body).unwrap_or(Value::Null)
}

/// Gate for every requester route. Unknown, disabled and wrong-secret
/// projects are indistinguishable to the caller.
async fn authorize(state: &AppState, project_id: &str, headers: &HeaderMap) -> AppResult<i64> {
    let project_id = parse_project_id(project_id)?;
    if state.bypass_requester_auth {
        return Ok(project_id);
    }

    let header = headers
        .get(AUTHORIZATION)
        .ok_or(AppError::MissingAuthorization)?
        .to_str()
        .unwrap_or_default();

    let project = ProjectRepo::get_enabled(&state.pool, project_id)
        .await?
        .ok_or(AppError::ProjectNotAuthorized)?;

    let secret = match header.get(..7) {
        Some(scheme) if scheme.eq_ignore_ascii_case("bearer ") => &header[7..],
        _ => return Err(AppError::ProjectNotAuthorized),
    };
    if !bool::from(secret.as_bytes().ct_eq(project.secret.as_bytes())) {
        debug!("Rejected bad secret for project {}", project_id);
        return Err(AppError::ProjectNotAuthorized);
    }

    if !project.is_fully_configured() {
        return Err(AppError::ProjectIncomplete);
    }
    Ok(project_id)
}

async fn ready_project(state: &AppState, project_id: i64) -> AppResult<FullProject> {
    let project = ProjectRepo::get_enabled(&state.pool, project_id)
        .await?
        .ok_or_else(|| AppError::not_found("Could not find project"))?;
    ProjectRepo::with_configs(&state.pool, project).await
}

async fn fail_request(state: &AppState, request: &OtpRequest, reason: &str) -> AppResult<()> {
    if !OtpRequestRepo::mark_errored(&state.pool, request.id, request.state, reason).await? {
        warn!("Request {} left {} before it could be failed", request.id, request.state);
    }
    Ok(())
}

/// `POST /{project_id}/{slug}/test`
pub async fn test_auth(
    State(state): State<AppState>,
    Path((project_id, slug)): Path<(String, String)>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    requester_for(&state, &slug)?;
    authorize(&state, &project_id, &headers).await?;
    Ok(Json(json!({ "ok": true })))
}

/// `POST /{project_id}/{slug}`
pub async fn create_request(
    State(state): State<AppState>,
    Path((project_id, slug)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<OtpRequest>> {
    let requester = requester_for(&state, &slug)?;
    let project_id = authorize(&state, &project_id, &headers).await?;

    let project = ready_project(&state, project_id).await?;
    let config = requester
        .config_for_project(&project)
        .ok_or_else(|| AppError::unprocessable("Project is not configured to use this requester"))?;

    let metadata = requester
        .metadata_for_initial_request(&json_body(&body))
        .map_err(AppError::RequestValidation)?;

    let created = OtpRequestRepo::create(&state.pool, project_id, &metadata).await?;
    let request = OtpRequestRepo::get_for_project(&state.pool, project_id, created.id)
        .await?
        .ok_or_else(|| AppError::internal("Created request disappeared"))?;
    if !requester.is_request_valid_for_requester(&request) {
        return Err(AppError::unprocessable("CFA Requester is misconfigured"));
    }

    if let AllowedState::Err(reason) = requester
        .validate_active_request(&request, &project.project, &config)
        .await
    {
        info!("Request {} for {} refused: {}", request.id, project.project.slug(), reason);
        fail_request(&state, &request, &reason).await?;
        return Err(AppError::bad_request(INVALID_BUILD));
    }

    info!("Created request {} for {} via {}", request.id, project.project.slug(), slug);
    Ok(Json(request))
}

/// `POST /{project_id}/{slug}/{request_id}/validate`
pub async fn validate_request(
    State(state): State<AppState>,
    Path((project_id, slug, request_id)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> AppResult<Json<OtpRequest>> {
    let requester = requester_for(&state, &slug)?;
    let project_id = authorize(&state, &project_id, &headers).await?;
    let request_id = parse_request_id(&request_id)?;

    let not_found = || AppError::not_found("That request does not exist or is invalid");
    let request = OtpRequestRepo::get_for_project(&state.pool, project_id, request_id)
        .await?
        .ok_or_else(not_found)?;
    let project = ProjectRepo::get_full(&state.pool, project_id)
        .await?
        .ok_or_else(not_found)?;

    if !requester.is_request_valid_for_requester(&request) {
        return Err(AppError::unprocessable("Project is not configured to use this requester"));
    }
    let config = requester.config_for_project(&project).ok_or_else(|| {
        AppError::unprocessable("Project is missing the required configuration to use this requester")
    })?;
    if config.kind() != requester.kind() {
        return Err(AppError::Contract(format!(
            "{} requester returned a {} configuration",
            requester.kind(),
            config.kind()
        )));
    }

    if request.state != RequestState::Requested {
        return Err(AppError::UnexpectedState {
            expected: RequestState::Requested,
            actual: request.state,
        });
    }

    if let AllowedState::Err(reason) = requester
        .validate_active_request(&request, &project.project, &config)
        .await
    {
        info!("Request {} refused at validation: {}", request.id, reason);
        fail_request(&state, &request, &reason).await?;
        return Err(AppError::bad_request(INVALID_BUILD));
    }

    if requester.needs_log_based_proof()
        && !requester
            .validate_proof_for_request(&request, &project.project, &config)
            .await
    {
        fail_request(&state, &request, PROOF_NOT_FOUND).await?;
        return Err(AppError::Forbidden(
            "Failed to validate the build, check the CFA dashboard for reasoning.".to_string(),
        ));
    }

    if !OtpRequestRepo::mark_validated(&state.pool, request.id).await? {
        let actual = OtpRequestRepo::get(&state.pool, request.id)
            .await?
            .map(|r| r.state)
            .unwrap_or(RequestState::Error);
        return Err(AppError::UnexpectedState {
            expected: RequestState::Requested,
            actual,
        });
    }

    // Snapshot before the responder attaches its metadata
    let validated = OtpRequestRepo::get(&state.pool, request.id)
        .await?
        .ok_or_else(not_found)?;

    let info = requester.request_information(&validated, &project.project, &config);
    state.responder.request_otp(&validated, &project, Some(&info)).await;

    info!("Request {} validated for {}", validated.id, project.project.slug());
    Ok(Json(validated))
}

/// `POST /{project_id}/{slug}/{request_id}`. 204 until a human has answered.
pub async fn fetch_request(
    State(state): State<AppState>,
    Path((project_id, slug, request_id)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> AppResult<Response> {
    requester_for(&state, &slug)?;
    let project_id = authorize(&state, &project_id, &headers).await?;
    let request_id = parse_request_id(&request_id)?;

    let request = OtpRequestRepo::get_for_project(&state.pool, project_id, request_id)
        .await?
        .ok_or_else(|| {
            AppError::not_found("That request does not exist or you do not have permission to see it")
        })?;

    if request.state != RequestState::Responded {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }
    Ok(Json(request).into_response())
}

/// `POST /{project_id}/{slug}/credentials`: swap a CI OIDC token for a
/// GitHub installation token scoped to the project's repository.
pub async fn exchange_credentials(
    State(state): State<AppState>,
    Path((project_id, slug)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<Value>> {
    let requester = requester_for(&state, &slug)?;
    let project_id = authorize(&state, &project_id, &headers).await?;

    let body = json_body(&body);
    let token = match body.get("token") {
        Some(Value::String(token)) if !token.is_empty() => token.as_str(),
        Some(Value::String(_)) => {
            return Err(AppError::BodyValidation("\"token\" is not allowed to be empty".to_string()))
        }
        Some(_) => return Err(AppError::BodyValidation("\"token\" must be a string".to_string())),
        None => return Err(AppError::BodyValidation("\"token\" is required".to_string())),
    };

    let project = ready_project(&state, project_id).await?;
    let config = requester
        .config_for_project(&project)
        .ok_or_else(|| AppError::unprocessable("Project is not configured to use this requester"))?;

    let discovery_url = requester.oidc_discovery_url(&project.project, &config).await;
    let claims = state
        .oidc
        .validate(discovery_url.as_deref(), token)
        .await
        .map_err(|e| AppError::unprocessable(e.to_string()))?;

    if !requester
        .oidc_claims_match_project(&claims, &project.project, &config)
        .await
    {
        return Err(AppError::unprocessable("Provided OIDC token does not match project"));
    }

    let github_token = state
        .github
        .installation_token(&project.project.repo_owner, &project.project.repo_name, &[])
        .await
        .map_err(|e| {
            warn!("Credential exchange for {} failed: {}", project.project.slug(), e);
            AppError::unprocessable("Failed to obtain access token for project")
        })?;

    info!("Issued repository token for {}", project.project.slug());
    Ok(Json(json!({ "GITHUB_TOKEN": github_token })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{setup_test_db, NewRequesterConfig};
    use crate::testing::{seed_project, PROJECT_ID, PROJECT_SECRET};
    use axum::http::HeaderValue;

    async fn state() -> AppState {
        let pool = setup_test_db().await;
        seed_project(&pool, NewRequesterConfig::CircleCi { access_token: "t".into() }).await;
        crate::web::testing::state(pool, "http://127.0.0.1:1")
    }

    fn bearer(secret: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {}", secret)).unwrap());
        headers
    }

    #[tokio::test]
    async fn test_authorize_accepts_project_secret() {
        let state = state().await;
        let id = authorize(&state, &PROJECT_ID.to_string(), &bearer(PROJECT_SECRET)).await.unwrap();
        assert_eq!(id, PROJECT_ID);

        let mut lower = HeaderMap::new();
        lower.insert(AUTHORIZATION, HeaderValue::from_str(&format!("bearer {}", PROJECT_SECRET)).unwrap());
        assert!(authorize(&state, &PROJECT_ID.to_string(), &lower).await.is_ok());
    }

    #[tokio::test]
    async fn test_authorize_failures_do_not_leak() {
        let state = state().await;
        let id = PROJECT_ID.to_string();

        assert!(matches!(
            authorize(&state, &id, &HeaderMap::new()).await,
            Err(AppError::MissingAuthorization)
        ));
        assert!(matches!(
            authorize(&state, "abc", &bearer(PROJECT_SECRET)).await,
            Err(AppError::ParamsValidation(_))
        ));

        let mut basic = HeaderMap::new();
        basic.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        for (project, headers) in [
            (id.as_str(), bearer("wrong")),
            ("999", bearer(PROJECT_SECRET)),
            (id.as_str(), basic),
        ] {
            let err = authorize(&state, project, &headers).await.unwrap_err();
            assert!(matches!(err, AppError::ProjectNotAuthorized));
        }

        ProjectRepo::set_enabled(&state.pool, PROJECT_ID, false).await.unwrap();
        assert!(matches!(
            authorize(&state, &id, &bearer(PROJECT_SECRET)).await,
            Err(AppError::ProjectNotAuthorized)
        ));
    }

    #[test]
    fn test_request_id_must_be_v4() {
        assert!(parse_request_id(&Uuid::new_v4().to_string()).is_ok());
        assert!(parse_request_id("00000000-0000-1000-8000-000000000000").is_err());
        assert!(parse_request_id("nope").is_err());
    }

    #[test]
    fn test_json_body() {
        assert_eq!(json_body(&Bytes::new()), json!({}));
        assert_eq!(json_body(&Bytes::from_static(b"{\"a\":1}")), json!({ "a": 1 }));
        assert_eq!(json_body(&Bytes::from_static(b"{nope")), Value::Null);
    }
}
