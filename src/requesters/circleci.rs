use super::{positive_integer, require_object, AllowedState, RequesterConfig, RequesterContext, RequesterKind, RequesterStrategy};
use crate::config::join_url;
use crate::db::models::{CircleCiRequesterConfig, OtpRequest, Project, RequestInformation};
use crate::proof::output_contains_proof;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CircleCiMetadata {
    build_number: i64,
}

impl CircleCiMetadata {
    fn parse(body: &Value) -> Result<Self, String> {
        let body = require_object(body)?;
        Ok(Self {
            build_number: positive_integer(body, "buildNumber")?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct CircleCiBuild {
    branch: Option<String>,
    why: Option<String>,
    status: Option<String>,
    #[serde(default)]
    ssh_disabled: bool,
    #[serde(default)]
    steps: Vec<CircleCiStep>,
}

#[derive(Debug, Deserialize)]
struct CircleCiStep {
    #[serde(default)]
    actions: Vec<CircleCiAction>,
}

#[derive(Debug, Deserialize)]
struct CircleCiAction {
    step: u64,
    index: u64,
}

#[derive(Debug, Deserialize)]
struct CircleCiOutput {
    message: String,
}

#[derive(Debug, Deserialize)]
struct CircleCiProject {
    id: String,
    organization_id: String,
}

/// CircleCI builds, checked through the v1.1 API with the project's token
#[derive(Debug)]
pub struct CircleCiRequester {
    ctx: RequesterContext,
}

impl CircleCiRequester {
    pub fn new(ctx: RequesterContext) -> Self {
        Self { ctx }
    }

    fn config<'a>(&self, config: &'a RequesterConfig) -> Option<&'a CircleCiRequesterConfig> {
        match config {
            RequesterConfig::CircleCi(config) => Some(config),
            _ => None,
        }
    }

    fn build_path(project: &Project, build_number: i64) -> String {
        format!(
            "/v1.1/project/github/{}/{}/{}",
            project.repo_owner, project.repo_name, build_number
        )
    }

    async fn get_v1<T: serde::de::DeserializeOwned>(
        &self,
        config: &CircleCiRequesterConfig,
        path: &str,
    ) -> Option<T> {
        let url = join_url(&self.ctx.providers.circleci_url, path);
        let response = match self
            .ctx
            .http
            .get(&url)
            .basic_auth(&config.access_token, Some(""))
            .header("Accept", "application/json")
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!("CircleCI request to {} failed: {}", url, e);
                return None;
            }
        };
        if response.status() != reqwest::StatusCode::OK {
            debug!("CircleCI returned {} for {}", response.status(), url);
            return None;
        }
        response.json().await.ok()
    }

    /// v2 project lookup, unauthenticated
    async fn project_v2(&self, project: &Project) -> Option<CircleCiProject> {
        let url = join_url(
            &self.ctx.providers.circleci_url,
            &format!("/v2/project/gh/{}/{}", project.repo_owner, project.repo_name),
        );
        let response = self.ctx.http.get(&url).send().await.ok()?;
        if response.status() != reqwest::StatusCode::OK {
            return None;
        }
        response.json().await.ok()
    }

    /// Last message of the last action of the last step
    async fn final_output(
        &self,
        config: &CircleCiRequesterConfig,
        project: &Project,
        build_number: i64,
    ) -> Option<String> {
        let build_path = Self::build_path(project, build_number);
        let build: CircleCiBuild = self.get_v1(config, &build_path).await?;
        let action = build.steps.last()?.actions.last()?;
        let output: Vec<CircleCiOutput> = self
            .get_v1(
                config,
                &format!("{}/output/{}/{}", build_path, action.step, action.index),
            )
            .await?;
        output.into_iter().next().map(|o| o.message)
    }
}

#[async_trait]
impl RequesterStrategy for CircleCiRequester {
    fn kind(&self) -> RequesterKind {
        RequesterKind::CircleCi
    }

    fn metadata_for_initial_request(&self, body: &Value) -> Result<Value, String> {
        let metadata = CircleCiMetadata::parse(body)?;
        Ok(json!({ "buildNumber": metadata.build_number }))
    }

    fn is_request_valid_for_requester(&self, request: &OtpRequest) -> bool {
        CircleCiMetadata::parse(&request.request_metadata).is_ok()
    }

    async fn validate_active_request(
        &self,
        request: &OtpRequest,
        project: &Project,
        config: &RequesterConfig,
    ) -> AllowedState {
        let (Some(config), Ok(metadata)) = (self.config(config), CircleCiMetadata::parse(&request.request_metadata)) else {
            return AllowedState::err("CircleCI build does not exist");
        };

        let Some(build) = self
            .get_v1::<CircleCiBuild>(config, &Self::build_path(project, metadata.build_number))
            .await
        else {
            return AllowedState::err("CircleCI build does not exist");
        };

        if build.branch.as_deref() != Some(project.default_branch.as_str()) {
            return AllowedState::err("CircleCI build is not for the default branch");
        }
        if build.why.as_deref() != Some("github") {
            return AllowedState::err("CircleCI build was triggered manually, not by GitHub");
        }
        if build.status.as_deref() != Some("running") {
            return AllowedState::err("CircleCI build is not running");
        }
        if !build.ssh_disabled {
            return AllowedState::err("CircleCI build had SSH enabled, this is not allowed");
        }

        AllowedState::Ok
    }

    async fn validate_proof_for_request(
        &self,
        request: &OtpRequest,
        project: &Project,
        config: &RequesterConfig,
    ) -> bool {
        let (Some(config), Ok(metadata)) = (self.config(config), CircleCiMetadata::parse(&request.request_metadata)) else {
            return false;
        };

        self.ctx
            .proof
            .poll(|_| async move {
                match self.final_output(config, project, metadata.build_number).await {
                    Some(output) => output_contains_proof(&output, &request.proof),
                    None => false,
                }
            })
            .await
    }

    fn request_information(
        &self,
        request: &OtpRequest,
        project: &Project,
        _config: &RequesterConfig,
    ) -> RequestInformation {
        let build_number = CircleCiMetadata::parse(&request.request_metadata)
            .map(|m| m.build_number)
            .unwrap_or_default();
        RequestInformation {
            description: format!(
                "Circle CI Build for {}/{}#{}",
                project.repo_owner, project.repo_name, build_number
            ),
            url: format!(
                "https://circleci.com/gh/{}/{}/{}",
                project.repo_owner, project.repo_name, build_number
            ),
        }
    }

    async fn oidc_discovery_url(&self, project: &Project, _config: &RequesterConfig) -> Option<String> {
        let circle_project = self.project_v2(project).await?;
        Some(format!("https://oidc.circleci.com/org/{}", circle_project.organization_id))
    }

    async fn oidc_claims_match_project(
        &self,
        claims: &Value,
        project: &Project,
        _config: &RequesterConfig,
    ) -> bool {
        let Some(circle_project) = self.project_v2(project).await else {
            return false;
        };
        claims.get("oidc.circleci.com/project-id").and_then(Value::as_str)
            == Some(circle_project.id.as_str())
    }
}
