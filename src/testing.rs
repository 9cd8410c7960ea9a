//! Fixtures shared by unit tests: an RSA signing key with its JWK, an
//! OIDC provider on wiremock, and seeded projects.

use crate::db::{DbPool, NewProject, NewRequesterConfig, ProjectRepo, SlackLinkerRepo, SlackResponderConfigRepo};
use crate::db::models::{FullProject, NewSlackResponderConfig};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const TEST_KEY_PEM: &str = include_str!("../tests/fixtures/oidc_signing_key.pem");
pub const TEST_KEY_N: &str = include_str!("../tests/fixtures/oidc_signing_key.n");
pub const TEST_KID: &str = "test-key-1";

pub const PROJECT_ID: i64 = 1234;
pub const PROJECT_SECRET: &str = "project-secret";

pub fn test_jwk() -> Value {
    json!({
        "kty": "RSA",
        "use": "sig",
        "alg": "RS256",
        "kid": TEST_KID,
        "n": TEST_KEY_N.trim(),
        "e": "AQAB"
    })
}

/// Sign `claims` with the test key under `kid`
pub fn mint_token(claims: &Value, kid: &str) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(kid.to_string());
    let key = EncodingKey::from_rsa_pem(TEST_KEY_PEM.as_bytes()).unwrap();
    jsonwebtoken::encode(&header, claims, &key).unwrap()
}

pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Serve a discovery document and JWKS under `prefix` on `server`.
/// Returns the discovery base URL.
pub async fn mount_oidc_provider(server: &MockServer, prefix: &str) -> String {
    let issuer = format!("{}{}", server.uri(), prefix);
    Mock::given(method("GET"))
        .and(path(format!("{}/.well-known/openid-configuration", prefix)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "issuer": issuer,
            "jwks_uri": format!("{}/jwks", issuer),
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{}/jwks", prefix)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "keys": [test_jwk()] })))
        .mount(server)
        .await;
    issuer
}

/// Enabled project `electron/fiddle` on branch `main` with the given requester
/// and a Slack responder attached.
pub async fn seed_project(pool: &DbPool, requester: NewRequesterConfig) -> FullProject {
    ProjectRepo::create(
        pool,
        NewProject {
            id: PROJECT_ID,
            repo_owner: "electron".into(),
            repo_name: "fiddle".into(),
            secret: PROJECT_SECRET.into(),
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
            team_icon: "https://example.com/icon.png".into(),
            channel_name: "releases".into(),
            channel_id: "C1".into(),
            enterprise_id: String::new(),
            username_to_mention: "release-wg".into(),
        },
    )
    .await
    .unwrap();

    ProjectRepo::get_full(pool, PROJECT_ID).await.unwrap().unwrap()
}
