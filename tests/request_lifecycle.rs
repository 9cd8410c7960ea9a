//! Drives the requester API through the router the way a CI job would, with
//! CircleCI, GitHub and an OIDC provider served by wiremock and a recording
//! responder standing in for Slack.

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use continuousauth::config::{GitHubConfig, OidcConfig, ProvidersConfig};
use continuousauth::db::models::{
    FullProject, NewProject, NewRequesterConfig, NewSlackResponderConfig, OtpRequest, RequestInformation,
    RequestState,
};
use continuousauth::db::{
    init_db, DbPool, OtpRequestRepo, ProjectRepo, SlackLinkerRepo, SlackResponderConfigRepo,
};
use continuousauth::github::GitHubAppClient;
use continuousauth::oidc::OidcValidator;
use continuousauth::proof::ProofPolicy;
use continuousauth::requesters::{Requester, RequesterContext};
use continuousauth::responders::{ResponderStrategy, SlackResponder};
use continuousauth::slack::SlackClient;
use continuousauth::web::{create_router, AppState};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde_json::{json, Value};
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::ServiceExt;
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use zeroize::Zeroizing;

const PROJECT_ID: i64 = 77;
const SECRET: &str = "hunter2";
const BUILD_PATH: &str = "/v1.1/project/github/electron/forge/42";
const BUILD_URL: &str = "https://github.com/electron/forge/actions/runs/99";

const SIGNING_KEY_PEM: &str = include_str!("fixtures/oidc_signing_key.pem");
const SIGNING_KEY_N: &str = include_str!("fixtures/oidc_signing_key.n");
const KID: &str = "forge-key";

/// Remembers every request it was asked to put in front of a human. With a
/// pool it also stamps response metadata the way the Slack responder does.
#[derive(Default)]
struct RecordingResponder {
    seen: Mutex<Vec<(Uuid, String)>>,
    pool: Option<DbPool>,
}

#[async_trait]
impl ResponderStrategy for RecordingResponder {
    async fn request_otp(&self, request: &OtpRequest, _project: &FullProject, info: Option<&RequestInformation>) {
        let url = info.map(|i| i.url.clone()).unwrap_or_default();
        self.seen.lock().unwrap().push((request.id, url));
        if let Some(pool) = &self.pool {
            OtpRequestRepo::set_response_metadata(pool, request.id, &json!({ "request_ts": "1.2" }))
                .await
                .unwrap();
        }
    }
}

fn circleci() -> NewRequesterConfig {
    NewRequesterConfig::CircleCi {
        access_token: "circle-token".into(),
    }
}

async fn pool() -> DbPool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    init_db(&pool).await.unwrap();
    pool
}

async fn seed(pool: &DbPool, requester: NewRequesterConfig) {
    ProjectRepo::create(
        pool,
        NewProject {
            id: PROJECT_ID,
            repo_owner: "electron".into(),
            repo_name: "forge".into(),
            secret: SECRET.into(),
            default_branch: "main".into(),
        },
    )
    .await
    .unwrap();
    ProjectRepo::attach_requester(pool, PROJECT_ID, requester).await.unwrap();
    let linker = SlackLinkerRepo::create(pool, PROJECT_ID).await.unwrap();
    SlackResponderConfigRepo::link(
        pool,
        &linker,
        NewSlackResponderConfig {
            team_name: "Electron".into(),
            team_id: "T1".into(),
            team_icon: String::new(),
            channel_name: "releases".into(),
            channel_id: "C1".into(),
            enterprise_id: String::new(),
            username_to_mention: "release-wg".into(),
        },
    )
    .await
    .unwrap();
}

fn app(pool: DbPool, base: &str, responder: Arc<RecordingResponder>) -> Router {
    let http = Client::new();
    let oidc = Arc::new(OidcValidator::new(http.clone(), 600));
    let github = Arc::new(GitHubAppClient::new(
        http.clone(),
        &GitHubConfig {
            app_id: "4242".into(),
            private_key: Zeroizing::new(SIGNING_KEY_PEM.to_string()),
            api_url: base.to_string(),
        },
    ));
    let ctx = RequesterContext {
        http: http.clone(),
        providers: ProvidersConfig {
            circleci_url: base.to_string(),
            travisci_url: base.to_string(),
            azure_release_url: base.to_string(),
        },
        proof: ProofPolicy {
            attempts: 2,
            delay: Duration::from_millis(5),
        },
        oidc_settings: OidcConfig {
            github_issuer_url: format!("{}/gha", base),
            ..OidcConfig::default()
        },
        oidc: oidc.clone(),
        github: github.clone(),
    };

    create_router(AppState {
        requesters: Arc::new(Requester::all(&ctx)),
        responder,
        slack: Arc::new(SlackResponder::new(
            pool.clone(),
            Arc::new(SlackClient::new(http, base)),
            "/cfa-link",
        )),
        github,
        oidc,
        slack_signing_secret: Zeroizing::new(String::new()),
        bypass_requester_auth: false,
        pool,
    })
}

fn post(uri: &str, auth: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(auth) = auth {
        builder = builder.header("authorization", auth);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn bearer() -> String {
    format!("Bearer {}", SECRET)
}

fn running_build() -> Value {
    json!({
        "branch": "main",
        "why": "github",
        "status": "running",
        "ssh_disabled": true,
        "steps": [{ "actions": [{ "step": 3, "index": 0 }] }]
    })
}

/// Discovery document and JWKS for the Actions issuer at `{base}/gha`
async fn mount_oidc_provider(server: &MockServer) -> String {
    let issuer = format!("{}/gha", server.uri());
    Mock::given(method("GET"))
        .and(path("/gha/.well-known/openid-configuration"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "issuer": issuer,
            "jwks_uri": format!("{}/jwks", issuer),
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/gha/jwks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "keys": [{
                "kty": "RSA",
                "use": "sig",
                "alg": "RS256",
                "kid": KID,
                "n": SIGNING_KEY_N.trim(),
                "e": "AQAB"
            }]
        })))
        .mount(server)
        .await;
    issuer
}

fn mint(claims: &Value, kid: &str) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(kid.to_string());
    let key = EncodingKey::from_rsa_pem(SIGNING_KEY_PEM.as_bytes()).unwrap();
    jsonwebtoken::encode(&header, claims, &key).unwrap()
}

fn actions_claims(issuer: &str) -> Value {
    json!({
        "iss": issuer,
        "exp": chrono::Utc::now().timestamp() + 300,
        "aud": "continuousauth.dev",
        "repository_id": PROJECT_ID.to_string(),
        "repository_owner": "electron",
        "repository": "electron/forge",
        "sub": "repo:electron/forge:environment:npm",
        "ref": "refs/heads/main",
        "event_name": "push",
        "run_id": "99",
        "run_attempt": "1",
        "runner_environment": "github-hosted"
    })
}

/// The app installation and an in-progress run. Read-only tokens are always
/// granted; the unscoped token used for credential exchange is `full_token`,
/// or refused when `None`.
async fn mount_github(server: &MockServer, full_token: Option<&str>) {
    Mock::given(method("GET"))
        .and(path("/repos/electron/forge/installation"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": 5 })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/app/installations/5/access_tokens"))
        .and(body_partial_json(json!({ "permissions": { "contents": "read" } })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "token": "ghs_read" })))
        .mount(server)
        .await;
    let full = match full_token {
        Some(token) => ResponseTemplate::new(201).set_body_json(json!({ "token": token })),
        None => ResponseTemplate::new(403).set_body_json(json!({ "message": "Resource not accessible by integration" })),
    };
    Mock::given(method("POST"))
        .and(path("/app/installations/5/access_tokens"))
        .respond_with(full)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/repos/electron/forge/actions/runs/99/attempts/1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": 99, "status": "in_progress" })))
        .mount(server)
        .await;
}

fn credentials_uri() -> String {
    format!("/api/request/{}/github/credentials", PROJECT_ID)
}

#[tokio::test]
async fn test_circleci_request_from_creation_to_answer() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(BUILD_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(running_build()))
        .mount(&server)
        .await;

    let pool = pool().await;
    seed(&pool, circleci()).await;
    let responder = Arc::new(RecordingResponder::default());
    let app = app(pool.clone(), &server.uri(), responder.clone());

    let (status, created) = send(
        &app,
        post(
            &format!("/api/request/{}/circleci", PROJECT_ID),
            Some(&bearer()),
            json!({ "buildNumber": 42 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(created["state"], "requested");
    let id = created["id"].as_str().unwrap().to_string();
    let proof = created["proof"].as_str().unwrap().to_string();

    // The job echoes the proof into its log
    Mock::given(method("GET"))
        .and(path(format!("{}/output/3/0", BUILD_PATH)))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([{ "message": format!("Proof:\n{}\n", proof) }])),
        )
        .mount(&server)
        .await;

    let request_uri = format!("/api/request/{}/circleci/{}", PROJECT_ID, id);
    let (status, validated) = send(
        &app,
        post(&format!("{}/validate", request_uri), Some(&bearer()), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(validated["state"], "validated");
    assert_eq!(
        responder.seen.lock().unwrap().as_slice(),
        &[(
            Uuid::parse_str(&id).unwrap(),
            "https://circleci.com/gh/electron/forge/42".to_string()
        )]
    );

    // Nobody has answered yet
    let (status, body) = send(&app, post(&request_uri, Some(&bearer()), json!({}))).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(body, Value::Null);

    let request_id = Uuid::parse_str(&id).unwrap();
    assert!(OtpRequestRepo::mark_responded(&pool, request_id, "424242", "sam").await.unwrap());

    let (status, answered) = send(&app, post(&request_uri, Some(&bearer()), json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(answered["state"], "responded");
    assert_eq!(answered["response"], "424242");
    assert_eq!(answered["userThatResponded"], "sam");
}

#[tokio::test]
async fn test_unknown_disabled_and_wrong_secret_look_the_same() {
    let pool = pool().await;
    seed(&pool, circleci()).await;
    let app = app(pool.clone(), "http://127.0.0.1:1", Arc::default());

    let wrong_secret = send(
        &app,
        post(&format!("/api/request/{}/circleci/test", PROJECT_ID), Some("Bearer nope"), json!({})),
    )
    .await;
    let unknown = send(
        &app,
        post("/api/request/999/circleci/test", Some(&bearer()), json!({})),
    )
    .await;
    ProjectRepo::set_enabled(&pool, PROJECT_ID, false).await.unwrap();
    let disabled = send(
        &app,
        post(&format!("/api/request/{}/circleci/test", PROJECT_ID), Some(&bearer()), json!({})),
    )
    .await;

    assert_eq!(wrong_secret.0, StatusCode::NOT_FOUND);
    assert_eq!(wrong_secret, unknown);
    assert_eq!(wrong_secret, disabled);

    let (status, _) = send(
        &app,
        post(&format!("/api/request/{}/circleci/test", PROJECT_ID), None, json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_errored_request_stays_errored() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(BUILD_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(running_build()))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    let mut finished = running_build();
    finished["status"] = json!("success");
    Mock::given(method("GET"))
        .and(path(BUILD_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(finished))
        .mount(&server)
        .await;

    let pool = pool().await;
    seed(&pool, circleci()).await;
    let responder = Arc::new(RecordingResponder::default());
    let app = app(pool.clone(), &server.uri(), responder.clone());

    let (status, created) = send(
        &app,
        post(
            &format!("/api/request/{}/circleci", PROJECT_ID),
            Some(&bearer()),
            json!({ "buildNumber": 42 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let id = created["id"].as_str().unwrap().to_string();
    let validate_uri = format!("/api/request/{}/circleci/{}/validate", PROJECT_ID, id);

    // The build finished before the job asked for validation
    let (status, body) = send(&app, post(&validate_uri, Some(&bearer()), json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body["error"],
        "Invalid build provided, check the CFA dashboard for reasoning."
    );

    let stored = OtpRequestRepo::get(&pool, Uuid::parse_str(&id).unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.state, RequestState::Error);
    assert_eq!(stored.error_reason.as_deref(), Some("CircleCI build is not running"));
    assert!(stored.errored.is_some());

    let (status, body) = send(&app, post(&validate_uri, Some(&bearer()), json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body["error"],
        "Expected the request to be in state \"requested\" but was in state \"error\""
    );

    // A human cannot answer it either
    assert!(!OtpRequestRepo::mark_responded(&pool, stored.id, "1", "sam").await.unwrap());
    let (status, _) = send(
        &app,
        post(
            &format!("/api/request/{}/circleci/{}", PROJECT_ID, id),
            Some(&bearer()),
            json!({}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(responder.seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_project_without_responder_is_incomplete() {
    let pool = pool().await;
    ProjectRepo::create(
        &pool,
        NewProject {
            id: PROJECT_ID,
            repo_owner: "electron".into(),
            repo_name: "forge".into(),
            secret: SECRET.into(),
            default_branch: "main".into(),
        },
    )
    .await
    .unwrap();
    let app = app(pool, "http://127.0.0.1:1", Arc::default());

    let (status, body) = send(
        &app,
        post(&format!("/api/request/{}/circleci", PROJECT_ID), Some(&bearer()), json!({ "buildNumber": 1 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Project not completely configured");
}

#[tokio::test]
async fn test_missing_proof_fails_validation_without_asking_anyone() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(BUILD_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(running_build()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{}/output/3/0", BUILD_PATH)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "message": "npm publish\n" }])))
        .expect(2)
        .mount(&server)
        .await;

    let pool = pool().await;
    seed(&pool, circleci()).await;
    let responder = Arc::new(RecordingResponder::default());
    let app = app(pool.clone(), &server.uri(), responder.clone());

    let (status, created) = send(
        &app,
        post(
            &format!("/api/request/{}/circleci", PROJECT_ID),
            Some(&bearer()),
            json!({ "buildNumber": 42 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let id = Uuid::parse_str(created["id"].as_str().unwrap()).unwrap();

    let (status, body) = send(
        &app,
        post(
            &format!("/api/request/{}/circleci/{}/validate", PROJECT_ID, id),
            Some(&bearer()),
            json!({}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(
        body["error"],
        "Failed to validate the build, check the CFA dashboard for reasoning."
    );

    let stored = OtpRequestRepo::get(&pool, id).await.unwrap().unwrap();
    assert_eq!(stored.state, RequestState::Error);
    assert_eq!(
        stored.error_reason.as_deref(),
        Some("Failed to validate build.  Could not find the proof in the build logs in an adaquete time period.")
    );
    assert!(responder.seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_github_actions_request_skips_log_proof() {
    let server = MockServer::start().await;
    let issuer = mount_oidc_provider(&server).await;
    mount_github(&server, None).await;

    let pool = pool().await;
    seed(&pool, NewRequesterConfig::GitHubActions).await;
    let responder = Arc::new(RecordingResponder {
        pool: Some(pool.clone()),
        ..Default::default()
    });
    let app = app(pool.clone(), &server.uri(), responder.clone());

    let (status, created) = send(
        &app,
        post(
            &format!("/api/request/{}/github", PROJECT_ID),
            Some(&bearer()),
            json!({ "oidcToken": mint(&actions_claims(&issuer), KID), "buildUrl": BUILD_URL }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(created["state"], "requested");
    let id = Uuid::parse_str(created["id"].as_str().unwrap()).unwrap();

    // Nothing serves build logs, so validation cannot be reading them
    let (status, validated) = send(
        &app,
        post(
            &format!("/api/request/{}/github/{}/validate", PROJECT_ID, id),
            Some(&bearer()),
            json!({}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(validated["state"], "validated");
    assert_eq!(responder.seen.lock().unwrap().as_slice(), &[(id, BUILD_URL.to_string())]);

    // The body is the row as it was before the responder touched it
    assert_eq!(validated["responseMetadata"], json!({}));
    let stored = OtpRequestRepo::get(&pool, id).await.unwrap().unwrap();
    assert_eq!(stored.state, RequestState::Validated);
    assert_eq!(stored.response_metadata, json!({ "request_ts": "1.2" }));
}

#[tokio::test]
async fn test_credentials_require_a_token() {
    let pool = pool().await;
    seed(&pool, NewRequesterConfig::GitHubActions).await;
    let app = app(pool, "http://127.0.0.1:1", Arc::default());

    let (status, body) = send(&app, post(&credentials_uri(), Some(&bearer()), json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "\"token\" is required");

    let (status, body) = send(&app, post(&credentials_uri(), Some(&bearer()), json!({ "token": "" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "\"token\" is not allowed to be empty");
}

#[tokio::test]
async fn test_credentials_exchange_for_github_token() {
    let server = MockServer::start().await;
    let issuer = mount_oidc_provider(&server).await;
    mount_github(&server, Some("ghs_forge")).await;

    let pool = pool().await;
    seed(&pool, NewRequesterConfig::GitHubActions).await;
    let app = app(pool, &server.uri(), Arc::default());

    let token = mint(&actions_claims(&issuer), KID);
    let (status, body) = send(&app, post(&credentials_uri(), Some(&bearer()), json!({ "token": token }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "GITHUB_TOKEN": "ghs_forge" }));
}

#[tokio::test]
async fn test_credentials_refusals_carry_their_reason() {
    let server = MockServer::start().await;
    let issuer = mount_oidc_provider(&server).await;
    mount_github(&server, None).await;

    let pool = pool().await;
    seed(&pool, NewRequesterConfig::GitHubActions).await;
    let app = app(pool, &server.uri(), Arc::default());

    let mut other_repo = actions_claims(&issuer);
    other_repo["repository_id"] = json!("78");
    other_repo["repository"] = json!("electron/fiddle");

    let cases = [
        (
            mint(&actions_claims(&issuer), "rotated-key"),
            "Invalid kid found in the token provided",
        ),
        (mint(&other_repo, KID), "Provided OIDC token does not match project"),
        (
            mint(&actions_claims(&issuer), KID),
            "Failed to obtain access token for project",
        ),
    ];
    for (token, reason) in cases {
        let (status, body) = send(&app, post(&credentials_uri(), Some(&bearer()), json!({ "token": token }))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY, "{}", reason);
        assert_eq!(body["error"], reason);
    }
}
