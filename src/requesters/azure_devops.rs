use super::{positive_integer, require_object, AllowedState, RequesterConfig, RequesterContext, RequesterKind, RequesterStrategy};
use crate::config::join_url;
use crate::db::models::{AzureDevOpsRequesterConfig, OtpRequest, Project, RequestInformation};
use crate::proof::output_contains_proof;
use async_trait::async_trait;
use chrono::DateTime;
use futures::future::join_all;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

const IN_PROGRESS: &str = "phaseInProgress";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AzureDevOpsMetadata {
    release_id: i64,
}

impl AzureDevOpsMetadata {
    fn parse(body: &Value) -> Result<Self, String> {
        let body = require_object(body)?;
        Ok(Self {
            release_id: positive_integer(body, "releaseId")?,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Release {
    operation_status: Option<String>,
    #[serde(default)]
    environments: Vec<ReleaseEnvironment>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReleaseEnvironment {
    #[serde(default)]
    deploy_steps: Vec<DeployStep>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeployStep {
    operation_status: Option<String>,
    #[serde(default)]
    release_deploy_phases: Vec<DeployPhase>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeployPhase {
    #[serde(default)]
    deployment_jobs: Vec<DeploymentJob>,
}

#[derive(Debug, Deserialize)]
struct DeploymentJob {
    #[serde(default)]
    tasks: Vec<DeploymentTask>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeploymentTask {
    log_url: Option<String>,
}

impl Release {
    /// Top-level status, else the status of the most recent deploy step
    fn operation_status(&self) -> Option<&str> {
        self.operation_status.as_deref().or_else(|| {
            self.environments
                .iter()
                .rev()
                .find_map(|env| env.deploy_steps.last())
                .and_then(|step| step.operation_status.as_deref())
        })
    }

    fn task_log_urls(&self) -> Vec<&str> {
        self.environments
            .iter()
            .flat_map(|env| &env.deploy_steps)
            .flat_map(|step| &step.release_deploy_phases)
            .flat_map(|phase| &phase.deployment_jobs)
            .flat_map(|job| &job.tasks)
            .filter_map(|task| task.log_url.as_deref())
            .collect()
    }
}

/// Drop the timestamp Azure prefixes to every log line
fn strip_timestamps(log: &str) -> String {
    log.lines()
        .map(|line| match line.split_once(' ') {
            Some((stamp, rest)) if DateTime::parse_from_rfc3339(stamp).is_ok() => rest,
            None if DateTime::parse_from_rfc3339(line.trim()).is_ok() => "",
            _ => line,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Azure DevOps classic releases, authenticated with a PAT
#[derive(Debug)]
pub struct AzureDevOpsRequester {
    ctx: RequesterContext,
}

impl AzureDevOpsRequester {
    pub fn new(ctx: RequesterContext) -> Self {
        Self { ctx }
    }

    fn config<'a>(&self, config: &'a RequesterConfig) -> Option<&'a AzureDevOpsRequesterConfig> {
        match config {
            RequesterConfig::AzureDevOps(config) => Some(config),
            _ => None,
        }
    }

    async fn release(&self, config: &AzureDevOpsRequesterConfig, release_id: i64) -> Option<Release> {
        let url = join_url(
            &self.ctx.providers.azure_release_url,
            &format!(
                "/{}/{}/_apis/release/releases/{}?api-version=7.0",
                config.organization_name, config.project_name, release_id
            ),
        );
        let response = self
            .ctx
            .http
            .get(&url)
            .basic_auth("", Some(config.access_token.as_str()))
            .send()
            .await
            .map_err(|e| warn!("Azure DevOps request to {} failed: {}", url, e))
            .ok()?;
        if response.status() != reqwest::StatusCode::OK {
            debug!("Azure DevOps returned {} for release {}", response.status(), release_id);
            return None;
        }
        response.json().await.ok()
    }

    async fn task_log(&self, config: &AzureDevOpsRequesterConfig, url: &str) -> Option<String> {
        let response = self
            .ctx
            .http
            .get(url)
            .basic_auth("", Some(config.access_token.as_str()))
            .send()
            .await
            .ok()?;
        if response.status() != reqwest::StatusCode::OK {
            return None;
        }
        response.text().await.ok()
    }

    /// Any single task log of the release ends with the proof
    async fn release_logs_contain_proof(
        &self,
        config: &AzureDevOpsRequesterConfig,
        release_id: i64,
        proof: &str,
    ) -> bool {
        let Some(release) = self.release(config, release_id).await else {
            return false;
        };
        let urls = release.task_log_urls();
        let logs = join_all(urls.iter().map(|url| self.task_log(config, url))).await;
        let skipped = logs.iter().filter(|log| log.is_none()).count();
        if skipped > 0 {
            debug!("Skipped {} unreadable task logs for release {}", skipped, release_id);
        }
        logs.into_iter()
            .flatten()
            .any(|log| output_contains_proof(&strip_timestamps(&log), proof))
    }
}

#[async_trait]
impl RequesterStrategy for AzureDevOpsRequester {
    fn kind(&self) -> RequesterKind {
        RequesterKind::AzureDevOps
    }

    fn metadata_for_initial_request(&self, body: &Value) -> Result<Value, String> {
        let metadata = AzureDevOpsMetadata::parse(body)?;
        Ok(json!({ "releaseId": metadata.release_id }))
    }

    fn is_request_valid_for_requester(&self, request: &OtpRequest) -> bool {
        AzureDevOpsMetadata::parse(&request.request_metadata).is_ok()
    }

    async fn validate_active_request(
        &self,
        request: &OtpRequest,
        _project: &Project,
        config: &RequesterConfig,
    ) -> AllowedState {
        let release_id = AzureDevOpsMetadata::parse(&request.request_metadata)
            .map(|m| m.release_id)
            .unwrap_or_default();
        let Some(config) = self.config(config) else {
            return AllowedState::err(format!("Release with id {} does not exist!", release_id));
        };

        match self.release(config, release_id).await {
            None => AllowedState::err(format!("Release with id {} does not exist!", release_id)),
            Some(release) if release.operation_status() == Some(IN_PROGRESS) => AllowedState::Ok,
            Some(_) => AllowedState::err(format!("Release with id {} is not in progress!", release_id)),
        }
    }

    async fn validate_proof_for_request(
        &self,
        request: &OtpRequest,
        _project: &Project,
        config: &RequesterConfig,
    ) -> bool {
        let (Some(config), Ok(metadata)) = (self.config(config), AzureDevOpsMetadata::parse(&request.request_metadata)) else {
            return false;
        };

        self.ctx
            .proof
            .poll(|_| self.release_logs_contain_proof(config, metadata.release_id, &request.proof))
            .await
    }

    fn request_information(
        &self,
        request: &OtpRequest,
        project: &Project,
        config: &RequesterConfig,
    ) -> RequestInformation {
        let release_id = AzureDevOpsMetadata::parse(&request.request_metadata)
            .map(|m| m.release_id)
            .unwrap_or_default();
        let url = match self.config(config) {
            Some(config) => format!(
                "https://dev.azure.com/{}/{}/_releaseProgress?releaseId={}",
                config.organization_name, config.project_name, release_id
            ),
            None => String::new(),
        };
        RequestInformation {
            description: format!(
                "Azure DevOps Release for {}/{}#{}",
                project.repo_owner, project.repo_name, release_id
            ),
            url,
        }
    }
}
