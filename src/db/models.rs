use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

/// A GitHub repository enrolled with CFA. The id is the GitHub repository id.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub repo_owner: String,
    pub repo_name: String,
    pub enabled: bool,
    pub secret: String,
    pub default_branch: String,
    pub requester_circleci_id: Option<Uuid>,
    pub requester_travisci_id: Option<Uuid>,
    pub requester_github_id: Option<Uuid>,
    pub requester_azuredevops_id: Option<Uuid>,
    pub responder_slack_id: Option<Uuid>,
}

impl Project {
    /// `owner/name`
    pub fn slug(&self) -> String {
        format!("{}/{}", self.repo_owner, self.repo_name)
    }

    pub fn has_requester(&self) -> bool {
        self.requester_circleci_id.is_some()
            || self.requester_travisci_id.is_some()
            || self.requester_github_id.is_some()
            || self.requester_azuredevops_id.is_some()
    }

    pub fn has_responder(&self) -> bool {
        self.responder_slack_id.is_some()
    }

    /// Both a requester and a responder are attached
    pub fn is_fully_configured(&self) -> bool {
        self.has_requester() && self.has_responder()
    }
}

/// New project to enroll
#[derive(Debug, Clone)]
pub struct NewProject {
    pub id: i64,
    pub repo_owner: String,
    pub repo_name: String,
    pub secret: String,
    pub default_branch: String,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CircleCiRequesterConfig {
    pub id: Uuid,
    pub access_token: String,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TravisCiRequesterConfig {
    pub id: Uuid,
    pub access_token: String,
}

/// GitHub Actions needs no settings; trust comes from the OIDC token
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct GitHubActionsRequesterConfig {
    pub id: Uuid,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AzureDevOpsRequesterConfig {
    pub id: Uuid,
    pub organization_name: String,
    pub project_name: String,
    pub access_token: String,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SlackResponderConfig {
    pub id: Uuid,
    pub team_name: String,
    pub team_id: String,
    pub team_icon: String,
    pub channel_name: String,
    pub channel_id: String,
    pub enterprise_id: String,
    pub username_to_mention: String,
}

/// Slack channel details captured by the link command
#[derive(Debug, Clone)]
pub struct NewSlackResponderConfig {
    pub team_name: String,
    pub team_id: String,
    pub team_icon: String,
    pub channel_name: String,
    pub channel_id: String,
    pub enterprise_id: String,
    pub username_to_mention: String,
}

/// One-time token binding a Slack channel to a project
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SlackResponderLinker {
    pub id: Uuid,
    pub project_id: i64,
}

/// Bot credentials for a Slack workspace
#[derive(Debug, Clone, FromRow)]
pub struct SlackInstall {
    pub id: Uuid,
    pub bot_token: String,
    pub bot_id: String,
    pub bot_user_id: String,
    pub team_id: String,
    pub enterprise_id: String,
}

#[derive(Debug, Clone)]
pub struct NewSlackInstall {
    pub bot_token: String,
    pub bot_id: String,
    pub bot_user_id: String,
    pub team_id: String,
    pub enterprise_id: String,
}

/// Requester settings to attach to a project
#[derive(Debug, Clone)]
pub enum NewRequesterConfig {
    CircleCi { access_token: String },
    TravisCi { access_token: String },
    GitHubActions,
    AzureDevOps {
        organization_name: String,
        project_name: String,
        access_token: String,
    },
}

/// A project together with every strategy config it points at
#[derive(Debug, Clone)]
pub struct FullProject {
    pub project: Project,
    pub circleci: Option<CircleCiRequesterConfig>,
    pub travisci: Option<TravisCiRequesterConfig>,
    pub github: Option<GitHubActionsRequesterConfig>,
    pub azuredevops: Option<AzureDevOpsRequesterConfig>,
    pub slack: Option<SlackResponderConfig>,
}

/// Lifecycle of an OTP request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestState {
    Requested,
    Validated,
    Responded,
    Error,
}

impl RequestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Validated => "validated",
            Self::Responded => "responded",
            Self::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "requested" => Some(Self::Requested),
            "validated" => Some(Self::Validated),
            "responded" => Some(Self::Responded),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// `responded` and `error` never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Responded | Self::Error)
    }

    pub fn can_transition_to(&self, next: RequestState) -> bool {
        matches!(
            (self, next),
            (Self::Requested, Self::Validated)
                | (Self::Requested, Self::Error)
                | (Self::Validated, Self::Responded)
                | (Self::Validated, Self::Error)
        )
    }
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Raw `otp_requests` row
#[derive(Debug, Clone, FromRow)]
pub struct OtpRequestRow {
    pub id: Uuid,
    pub project_id: i64,
    pub state: String,
    pub proof: String,
    pub request_metadata: String,  // JSON
    pub response_metadata: String, // JSON
    pub response: Option<String>,
    pub error_reason: Option<String>,
    pub requested: DateTime<Utc>,
    pub validated: Option<DateTime<Utc>>,
    pub responded: Option<DateTime<Utc>>,
    pub errored: Option<DateTime<Utc>>,
    pub user_that_responded: Option<String>,
}

/// An OTP request as the API and strategies see it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OtpRequest {
    pub id: Uuid,
    pub project_id: i64,
    pub state: RequestState,
    pub proof: String,
    pub request_metadata: Value,
    pub response_metadata: Value,
    pub response: Option<String>,
    pub error_reason: Option<String>,
    pub requested: DateTime<Utc>,
    pub validated: Option<DateTime<Utc>>,
    pub responded: Option<DateTime<Utc>>,
    pub errored: Option<DateTime<Utc>>,
    pub user_that_responded: Option<String>,
}

impl From<OtpRequestRow> for OtpRequest {
    fn from(row: OtpRequestRow) -> Self {
        Self {
            id: row.id,
            project_id: row.project_id,
            // The column is CHECK constrained, error is the safe reading of anything else
            state: RequestState::from_str(&row.state).unwrap_or(RequestState::Error),
            proof: row.proof,
            request_metadata: serde_json::from_str(&row.request_metadata).unwrap_or(Value::Null),
            response_metadata: serde_json::from_str(&row.response_metadata)
                .unwrap_or_else(|_| Value::Object(Default::default())),
            response: row.response,
            error_reason: row.error_reason,
            requested: row.requested,
            validated: row.validated,
            responded: row.responded,
            errored: row.errored,
            user_that_responded: row.user_that_responded,
        }
    }
}

/// What a responder shows the human about the build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestInformation {
    pub description: String,
    pub url: String,
}
