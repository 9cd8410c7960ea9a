use super::{claim_str, non_empty_string, require_object, AllowedState, RequesterConfig, RequesterContext, RequesterKind, RequesterStrategy};
use crate::db::models::{OtpRequest, Project, RequestInformation};
use crate::github::READ_ONLY;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
struct GitHubActionsMetadata {
    oidc_token: String,
    build_url: String,
}

impl GitHubActionsMetadata {
    fn parse(body: &Value) -> Result<Self, String> {
        let body = require_object(body)?;
        let oidc_token = non_empty_string(body, "oidcToken")?;
        let build_url = non_empty_string(body, "buildUrl")?;
        match reqwest::Url::parse(build_url) {
            Ok(url) if url.scheme() == "https" && url.has_host() => {}
            _ => return Err("\"buildUrl\" must be a valid uri with a scheme matching the https pattern".to_string()),
        }
        Ok(Self {
            oidc_token: oidc_token.to_string(),
            build_url: build_url.to_string(),
        })
    }
}

/// GitHub Actions builds. Identity comes from the job's OIDC token rather
/// than from the build log.
#[derive(Debug)]
pub struct GitHubActionsRequester {
    ctx: RequesterContext,
}

impl GitHubActionsRequester {
    pub fn new(ctx: RequesterContext) -> Self {
        Self { ctx }
    }

    fn audience_matches(&self, claims: &Value) -> bool {
        let audience = self.ctx.oidc_settings.audience.as_str();
        match claims.get("aud") {
            Some(Value::String(aud)) => aud == audience,
            Some(Value::Array(auds)) => auds.iter().any(|aud| aud.as_str() == Some(audience)),
            _ => false,
        }
    }

    /// Every claim check in order, stopping at the first failure
    async fn check_claims(&self, claims: &Value, project: &Project) -> AllowedState {
        let owner = project.repo_owner.as_str();
        let repo = project.repo_name.as_str();

        if !self.audience_matches(claims) {
            return AllowedState::err("Token audience is not correct");
        }
        if claim_str(claims, "repository_id") != Some(project.id.to_string()) {
            return AllowedState::err("GitHub Actions build is for incorrect repository id");
        }
        if claim_str(claims, "repository_owner").as_deref() != Some(owner) {
            return AllowedState::err("GitHub Actions build is for incorrect repository owner");
        }
        if claim_str(claims, "repository") != Some(format!("{}/{}", owner, repo)) {
            return AllowedState::err("GitHub Actions build is for incorrect repository");
        }
        let subject = format!(
            "repo:{}/{}:environment:{}",
            owner, repo, self.ctx.oidc_settings.github_environment
        );
        if claim_str(claims, "sub") != Some(subject) {
            return AllowedState::err("GitHub Actions build is for incorrect environment");
        }

        let git_ref = claim_str(claims, "ref").unwrap_or_default();
        if git_ref.starts_with("refs/tags/") {
            if !self.tag_is_on_default_branch(claims, project).await {
                return AllowedState::err("GitHub Actions build is for a tag not on the default branch");
            }
        } else if git_ref != format!("refs/heads/{}", project.default_branch) {
            return AllowedState::err("GitHub Actions build is not for the default branch");
        }

        if claim_str(claims, "event_name").as_deref() != Some("push") {
            return AllowedState::err("GitHub Actions build was triggered by not-a-push");
        }

        if !self.run_is_in_progress(claims, project).await {
            return AllowedState::err("GitHub Actions build is not running");
        }

        // No SSH signal exists for Actions yet, GitHub-hosted runners are the proxy
        if claim_str(claims, "runner_environment").as_deref() != Some("github-hosted") {
            return AllowedState::err("GitHub Actions build could have SSH enabled, this is not allowed");
        }

        AllowedState::Ok
    }

    /// The tagged commit is not behind the default branch. Compares by sha so
    /// a re-pointed tag cannot race the check.
    async fn tag_is_on_default_branch(&self, claims: &Value, project: &Project) -> bool {
        let Some(sha) = claim_str(claims, "sha") else {
            return false;
        };
        let github = &self.ctx.github;
        let token = match github
            .installation_token(&project.repo_owner, &project.repo_name, READ_ONLY)
            .await
        {
            Ok(token) => token,
            Err(e) => {
                warn!("Could not get installation token for {}: {}", project.slug(), e);
                return false;
            }
        };
        match github
            .compare_commits(
                &token,
                &project.repo_owner,
                &project.repo_name,
                &format!("{}...{}", sha, project.default_branch),
            )
            .await
        {
            Ok(comparison) => comparison.behind_by == 0 && comparison.ahead_by >= 0,
            Err(e) => {
                debug!("Tag comparison failed for {}: {}", project.slug(), e);
                false
            }
        }
    }

    async fn run_is_in_progress(&self, claims: &Value, project: &Project) -> bool {
        let (Some(run_id), Some(attempt)) = (claim_str(claims, "run_id"), claim_str(claims, "run_attempt")) else {
            return false;
        };
        let github = &self.ctx.github;
        let token = match github
            .installation_token(&project.repo_owner, &project.repo_name, READ_ONLY)
            .await
        {
            Ok(token) => token,
            Err(e) => {
                warn!("Could not get installation token for {}: {}", project.slug(), e);
                return false;
            }
        };
        github
            .workflow_run_attempt(&token, &project.repo_owner, &project.repo_name, &run_id, &attempt)
            .await
            .map(|run| run.status == "in_progress")
            .unwrap_or(false)
    }
}

#[async_trait]
impl RequesterStrategy for GitHubActionsRequester {
    fn kind(&self) -> RequesterKind {
        RequesterKind::GitHubActions
    }

    fn metadata_for_initial_request(&self, body: &Value) -> Result<Value, String> {
        let metadata = GitHubActionsMetadata::parse(body)?;
        Ok(json!({
            "oidcToken": metadata.oidc_token,
            "buildUrl": metadata.build_url,
        }))
    }

    fn is_request_valid_for_requester(&self, request: &OtpRequest) -> bool {
        GitHubActionsMetadata::parse(&request.request_metadata).is_ok()
    }

    fn needs_log_based_proof(&self) -> bool {
        false
    }

    async fn validate_active_request(
        &self,
        request: &OtpRequest,
        project: &Project,
        config: &RequesterConfig,
    ) -> AllowedState {
        let Ok(metadata) = GitHubActionsMetadata::parse(&request.request_metadata) else {
            return AllowedState::err("Failed to validate OIDC token");
        };

        let discovery_url = self.oidc_discovery_url(project, config).await;
        let claims = match self
            .ctx
            .oidc
            .validate(discovery_url.as_deref(), &metadata.oidc_token)
            .await
        {
            Ok(claims) => claims,
            Err(e) => return AllowedState::err(e.to_string()),
        };

        self.check_claims(&claims, project).await
    }

    async fn validate_proof_for_request(
        &self,
        _request: &OtpRequest,
        _project: &Project,
        _config: &RequesterConfig,
    ) -> bool {
        false
    }

    fn request_information(
        &self,
        request: &OtpRequest,
        project: &Project,
        _config: &RequesterConfig,
    ) -> RequestInformation {
        RequestInformation {
            description: format!("GitHub Actions Build for {}/{}", project.repo_owner, project.repo_name),
            url: GitHubActionsMetadata::parse(&request.request_metadata)
                .map(|m| m.build_url)
                .unwrap_or_default(),
        }
    }

    async fn oidc_discovery_url(&self, _project: &Project, _config: &RequesterConfig) -> Option<String> {
        Some(self.ctx.oidc_settings.github_issuer_url.clone())
    }

    async fn oidc_claims_match_project(
        &self,
        claims: &Value,
        project: &Project,
        _config: &RequesterConfig,
    ) -> bool {
        match self.check_claims(claims, project).await {
            AllowedState::Ok => true,
            AllowedState::Err(reason) => {
                warn!("Failed to match OIDC claims to project {}: {}", project.slug(), reason);
                false
            }
        }
    }
}
