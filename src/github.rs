//! GitHub App client: app JWTs, installation tokens and the two read
//! endpoints the Actions requester needs.

use crate::config::{join_url, GitHubConfig};
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::{Client, Method, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};
use zeroize::Zeroizing;

const USER_AGENT: &str = "continuousauth";

/// Permissions asked for when the app only needs to read the repository
pub const READ_ONLY: &[(&str, &str)] = &[("metadata", "read"), ("contents", "read")];

#[derive(Debug, thiserror::Error)]
pub enum GitHubError {
    #[error("GitHub App credentials are not configured")]
    NotConfigured,

    #[error("Failed to sign GitHub App JWT: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("GitHub request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("GitHub returned {status}: {message}")]
    Status { status: u16, message: String },
}

/// Result of `GET /repos/{owner}/{repo}/compare/{basehead}`
#[derive(Debug, Clone, Deserialize)]
pub struct CommitComparison {
    pub status: String,
    pub ahead_by: i64,
    pub behind_by: i64,
}

/// Result of `GET /repos/{owner}/{repo}/actions/runs/{id}/attempts/{n}`
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowRunAttempt {
    pub id: u64,
    pub status: String,
}

#[derive(Deserialize)]
struct Installation {
    id: u64,
}

#[derive(Deserialize)]
struct InstallationToken {
    token: String,
}

#[derive(Serialize)]
struct InstallationTokenRequest<'a> {
    repositories: Vec<&'a str>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    permissions: BTreeMap<&'a str, &'a str>,
}

#[derive(Serialize)]
struct AppClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

pub struct GitHubAppClient {
    http: Client,
    api_url: String,
    app_id: String,
    private_key: Zeroizing<String>,
}

impl std::fmt::Debug for GitHubAppClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubAppClient")
            .field("api_url", &self.api_url)
            .field("app_id", &self.app_id)
            .finish_non_exhaustive()
    }
}

impl GitHubAppClient {
    pub fn new(http: Client, config: &GitHubConfig) -> Self {
        Self {
            http,
            api_url: config.api_url.clone(),
            app_id: config.app_id.clone(),
            private_key: config.private_key.clone(),
        }
    }

    /// Short-lived RS256 JWT identifying the app itself
    fn app_jwt(&self) -> Result<String, GitHubError> {
        if self.app_id.is_empty() || self.private_key.is_empty() {
            return Err(GitHubError::NotConfigured);
        }
        let now = Utc::now().timestamp();
        let claims = AppClaims {
            iat: now - 60,
            exp: now + 600,
            iss: self.app_id.clone(),
        };
        let key = EncodingKey::from_rsa_pem(self.private_key.as_bytes())?;
        Ok(jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)?)
    }

    fn request(&self, method: Method, path: &str, bearer: &str) -> RequestBuilder {
        self.http
            .request(method, join_url(&self.api_url, path))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT)
            .header("X-GitHub-Api-Version", "2022-11-28")
            .bearer_auth(bearer)
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, GitHubError> {
        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unable to read response body".to_string());
            return Err(GitHubError::Status {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response.json().await?)
    }

    /// Installation token scoped to a single repository. An empty
    /// `permissions` slice asks for everything the installation grants.
    pub async fn installation_token(
        &self,
        owner: &str,
        repo: &str,
        permissions: &[(&str, &str)],
    ) -> Result<String, GitHubError> {
        let jwt = self.app_jwt()?;

        let response = self
            .request(Method::GET, &format!("/repos/{}/{}/installation", owner, repo), &jwt)
            .send()
            .await?;
        let installation: Installation = Self::read_json(response).await?;
        debug!("Found installation {} for {}/{}", installation.id, owner, repo);

        let body = InstallationTokenRequest {
            repositories: vec![repo],
            permissions: permissions.iter().copied().collect(),
        };
        let response = self
            .request(
                Method::POST,
                &format!("/app/installations/{}/access_tokens", installation.id),
                &jwt,
            )
            .json(&body)
            .send()
            .await?;
        let token: InstallationToken = Self::read_json(response).await.map_err(|e| {
            warn!("Failed to mint installation token for {}/{}: {}", owner, repo, e);
            e
        })?;

        Ok(token.token)
    }

    pub async fn compare_commits(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        basehead: &str,
    ) -> Result<CommitComparison, GitHubError> {
        let response = self
            .request(
                Method::GET,
                &format!("/repos/{}/{}/compare/{}", owner, repo, basehead),
                token,
            )
            .send()
            .await?;
        Self::read_json(response).await
    }

    pub async fn workflow_run_attempt(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        run_id: &str,
        attempt: &str,
    ) -> Result<WorkflowRunAttempt, GitHubError> {
        let response = self
            .request(
                Method::GET,
                &format!("/repos/{}/{}/actions/runs/{}/attempts/{}", owner, repo, run_id, attempt),
                token,
            )
            .send()
            .await?;
        Self::read_json(response).await
    }
}
