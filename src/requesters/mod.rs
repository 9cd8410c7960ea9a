//! Requester strategies: one per CI provider. Each one knows how to read the
//! build metadata a CI job sends, check that build is live and trustworthy,
//! and prove the build is the one asking.

pub mod azure_devops;
pub mod circleci;
pub mod github_actions;
pub mod travisci;

pub use azure_devops::AzureDevOpsRequester;
pub use circleci::CircleCiRequester;
pub use github_actions::GitHubActionsRequester;
pub use travisci::TravisCiRequester;

use crate::config::{OidcConfig, ProvidersConfig};
use crate::db::models::{
    AzureDevOpsRequesterConfig, CircleCiRequesterConfig, FullProject, GitHubActionsRequesterConfig,
    OtpRequest, Project, RequestInformation, TravisCiRequesterConfig,
};
use crate::github::GitHubAppClient;
use crate::oidc::OidcValidator;
use crate::proof::ProofPolicy;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;

/// Outcome of checking that a build may be trusted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowedState {
    Ok,
    Err(String),
}

impl AllowedState {
    pub fn err<S: Into<String>>(reason: S) -> Self {
        Self::Err(reason.into())
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// The four supported CI providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequesterKind {
    CircleCi,
    TravisCi,
    GitHubActions,
    AzureDevOps,
}

impl RequesterKind {
    pub const ALL: [RequesterKind; 4] = [
        RequesterKind::CircleCi,
        RequesterKind::TravisCi,
        RequesterKind::GitHubActions,
        RequesterKind::AzureDevOps,
    ];

    /// URL segment the routes for this provider live under
    pub fn slug(&self) -> &'static str {
        match self {
            Self::CircleCi => "circleci",
            Self::TravisCi => "travisci",
            Self::GitHubActions => "github",
            Self::AzureDevOps => "azuredevops-release",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.slug() == slug)
    }
}

impl std::fmt::Display for RequesterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.slug())
    }
}

/// A project's active requester settings
#[derive(Debug, Clone)]
pub enum RequesterConfig {
    CircleCi(CircleCiRequesterConfig),
    TravisCi(TravisCiRequesterConfig),
    GitHubActions(GitHubActionsRequesterConfig),
    AzureDevOps(AzureDevOpsRequesterConfig),
}

impl RequesterConfig {
    pub fn kind(&self) -> RequesterKind {
        match self {
            Self::CircleCi(_) => RequesterKind::CircleCi,
            Self::TravisCi(_) => RequesterKind::TravisCi,
            Self::GitHubActions(_) => RequesterKind::GitHubActions,
            Self::AzureDevOps(_) => RequesterKind::AzureDevOps,
        }
    }

    /// The config of `kind` attached to `project`, if any
    pub fn for_project(kind: RequesterKind, project: &FullProject) -> Option<Self> {
        match kind {
            RequesterKind::CircleCi => project.circleci.clone().map(Self::CircleCi),
            RequesterKind::TravisCi => project.travisci.clone().map(Self::TravisCi),
            RequesterKind::GitHubActions => project.github.clone().map(Self::GitHubActions),
            RequesterKind::AzureDevOps => project.azuredevops.clone().map(Self::AzureDevOps),
        }
    }
}

/// The seam between the request orchestrator and a CI provider
#[async_trait]
pub trait RequesterStrategy: Send + Sync {
    fn kind(&self) -> RequesterKind;

    fn slug(&self) -> &'static str {
        self.kind().slug()
    }

    /// The project's config for this provider, `None` when it uses another one
    fn config_for_project(&self, project: &FullProject) -> Option<RequesterConfig> {
        RequesterConfig::for_project(self.kind(), project)
    }

    /// Validate the body of a create call into the metadata to store
    fn metadata_for_initial_request(&self, body: &Value) -> Result<Value, String>;

    /// Stored metadata still fits this provider's schema
    fn is_request_valid_for_requester(&self, request: &OtpRequest) -> bool;

    /// The build is running, on the default branch, triggered by a push and safe
    async fn validate_active_request(
        &self,
        request: &OtpRequest,
        project: &Project,
        config: &RequesterConfig,
    ) -> AllowedState;

    /// Whether validate must find the proof in the build log. Providers
    /// that prove identity with OIDC during the active check skip it.
    fn needs_log_based_proof(&self) -> bool {
        true
    }

    /// The build has echoed the request's proof into its log
    async fn validate_proof_for_request(
        &self,
        request: &OtpRequest,
        project: &Project,
        config: &RequesterConfig,
    ) -> bool;

    /// Description and link the responder shows to the human
    fn request_information(
        &self,
        request: &OtpRequest,
        project: &Project,
        config: &RequesterConfig,
    ) -> RequestInformation;

    /// Where this provider publishes its OIDC discovery document, if it has one
    async fn oidc_discovery_url(&self, _project: &Project, _config: &RequesterConfig) -> Option<String> {
        None
    }

    /// Verified OIDC claims belong to a build of `project`
    async fn oidc_claims_match_project(
        &self,
        _claims: &Value,
        _project: &Project,
        _config: &RequesterConfig,
    ) -> bool {
        false
    }
}

/// Everything the strategies need to talk to the outside world
#[derive(Debug, Clone)]
pub struct RequesterContext {
    pub http: Client,
    pub providers: ProvidersConfig,
    pub proof: ProofPolicy,
    pub oidc_settings: OidcConfig,
    pub oidc: Arc<OidcValidator>,
    pub github: Arc<GitHubAppClient>,
}

/// Closed set of requesters, dispatched exhaustively
#[derive(Debug)]
pub enum Requester {
    CircleCi(CircleCiRequester),
    TravisCi(TravisCiRequester),
    GitHubActions(GitHubActionsRequester),
    AzureDevOps(AzureDevOpsRequester),
}

impl Requester {
    pub fn new(kind: RequesterKind, ctx: RequesterContext) -> Self {
        match kind {
            RequesterKind::CircleCi => Self::CircleCi(CircleCiRequester::new(ctx)),
            RequesterKind::TravisCi => Self::TravisCi(TravisCiRequester::new(ctx)),
            RequesterKind::GitHubActions => Self::GitHubActions(GitHubActionsRequester::new(ctx)),
            RequesterKind::AzureDevOps => Self::AzureDevOps(AzureDevOpsRequester::new(ctx)),
        }
    }

    /// One of every requester, ready to mount
    pub fn all(ctx: &RequesterContext) -> Vec<Arc<dyn RequesterStrategy>> {
        RequesterKind::ALL
            .into_iter()
            .map(|kind| Arc::new(Self::new(kind, ctx.clone())) as Arc<dyn RequesterStrategy>)
            .collect()
    }

    fn strategy(&self) -> &dyn RequesterStrategy {
        match self {
            Self::CircleCi(r) => r,
            Self::TravisCi(r) => r,
            Self::GitHubActions(r) => r,
            Self::AzureDevOps(r) => r,
        }
    }
}

#[async_trait]
impl RequesterStrategy for Requester {
    fn kind(&self) -> RequesterKind {
        self.strategy().kind()
    }

    fn metadata_for_initial_request(&self, body: &Value) -> Result<Value, String> {
        self.strategy().metadata_for_initial_request(body)
    }

    fn is_request_valid_for_requester(&self, request: &OtpRequest) -> bool {
        self.strategy().is_request_valid_for_requester(request)
    }

    fn needs_log_based_proof(&self) -> bool {
        self.strategy().needs_log_based_proof()
    }

    async fn validate_active_request(
        &self,
        request: &OtpRequest,
        project: &Project,
        config: &RequesterConfig,
    ) -> AllowedState {
        self.strategy().validate_active_request(request, project, config).await
    }

    async fn validate_proof_for_request(
        &self,
        request: &OtpRequest,
        project: &Project,
        config: &RequesterConfig,
    ) -> bool {
        self.strategy().validate_proof_for_request(request, project, config).await
    }

    fn request_information(
        &self,
        request: &OtpRequest,
        project: &Project,
        config: &RequesterConfig,
    ) -> RequestInformation {
        self.strategy().request_information(request, project, config)
    }

    async fn oidc_discovery_url(&self, project: &Project, config: &RequesterConfig) -> Option<String> {
        self.strategy().oidc_discovery_url(project, config).await
    }

    async fn oidc_claims_match_project(
        &self,
        claims: &Value,
        project: &Project,
        config: &RequesterConfig,
    ) -> bool {
        self.strategy().oidc_claims_match_project(claims, project, config).await
    }
}

// --- metadata validation helpers ---

/// The body must be a JSON object
pub(crate) fn require_object(body: &Value) -> Result<&serde_json::Map<String, Value>, String> {
    body.as_object()
        .ok_or_else(|| "\"value\" must be an object".to_string())
}

/// A required integer >= 1. Numeric strings are accepted.
pub(crate) fn positive_integer(body: &serde_json::Map<String, Value>, key: &str) -> Result<i64, String> {
    let value = body
        .get(key)
        .ok_or_else(|| format!("\"{}\" is required", key))?;
    let number = match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
    .ok_or_else(|| format!("\"{}\" must be an integer", key))?;
    if number < 1 {
        return Err(format!("\"{}\" must be larger than or equal to 1", key));
    }
    Ok(number)
}

/// A required non-empty string
pub(crate) fn non_empty_string<'a>(
    body: &'a serde_json::Map<String, Value>,
    key: &str,
) -> Result<&'a str, String> {
    match body.get(key) {
        None => Err(format!("\"{}\" is required", key)),
        Some(Value::String(s)) if !s.is_empty() => Ok(s),
        Some(Value::String(_)) => Err(format!("\"{}\" is not allowed to be empty", key)),
        Some(_) => Err(format!("\"{}\" must be a string", key)),
    }
}

/// Read a claim as a string. Numeric claims are rendered in decimal.
pub(crate) fn claim_str(claims: &Value, key: &str) -> Option<String> {
    match claims.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
