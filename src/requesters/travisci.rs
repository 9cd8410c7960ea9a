use super::{positive_integer, require_object, AllowedState, RequesterConfig, RequesterContext, RequesterKind, RequesterStrategy};
use crate::config::join_url;
use crate::db::models::{OtpRequest, Project, RequestInformation, TravisCiRequesterConfig};
use crate::proof::output_contains_proof;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
struct TravisCiMetadata {
    build_id: i64,
    build_number: String,
    job_id: i64,
}

impl TravisCiMetadata {
    fn parse(body: &Value) -> Result<Self, String> {
        let body = require_object(body)?;
        Ok(Self {
            build_id: positive_integer(body, "buildId")?,
            build_number: positive_integer(body, "buildNumber")?.to_string(),
            job_id: positive_integer(body, "jobId")?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct TravisCiBuild {
    number: String,
    state: String,
    event_type: Option<String>,
    repository: TravisCiRepository,
    branch: Option<TravisCiBranch>,
    #[serde(default)]
    jobs: Vec<TravisCiJob>,
}

#[derive(Debug, Deserialize)]
struct TravisCiRepository {
    github_id: i64,
}

#[derive(Debug, Deserialize)]
struct TravisCiBranch {
    name: String,
}

#[derive(Debug, Deserialize)]
struct TravisCiJob {
    id: i64,
    state: String,
}

#[derive(Debug, Deserialize)]
struct TravisCiJobLog {
    content: Option<String>,
}

/// Travis CI builds, read through the v3 API
#[derive(Debug)]
pub struct TravisCiRequester {
    ctx: RequesterContext,
}

impl TravisCiRequester {
    pub fn new(ctx: RequesterContext) -> Self {
        Self { ctx }
    }

    fn config<'a>(&self, config: &'a RequesterConfig) -> Option<&'a TravisCiRequesterConfig> {
        match config {
            RequesterConfig::TravisCi(config) => Some(config),
            _ => None,
        }
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        config: &TravisCiRequesterConfig,
        path: &str,
    ) -> Option<T> {
        let url = join_url(&self.ctx.providers.travisci_url, path);
        let response = self
            .ctx
            .http
            .get(&url)
            .header("Travis-API-Version", "3")
            .header("Authorization", format!("token {}", config.access_token))
            .send()
            .await
            .map_err(|e| warn!("Travis CI request to {} failed: {}", url, e))
            .ok()?;
        if response.status() != reqwest::StatusCode::OK {
            return None;
        }
        response.json().await.ok()
    }
}

#[async_trait]
impl RequesterStrategy for TravisCiRequester {
    fn kind(&self) -> RequesterKind {
        RequesterKind::TravisCi
    }

    fn metadata_for_initial_request(&self, body: &Value) -> Result<Value, String> {
        let metadata = TravisCiMetadata::parse(body)?;
        Ok(json!({
            "buildId": metadata.build_id,
            "buildNumber": metadata.build_number,
            "jobId": metadata.job_id,
        }))
    }

    fn is_request_valid_for_requester(&self, request: &OtpRequest) -> bool {
        TravisCiMetadata::parse(&request.request_metadata).is_ok()
    }

    async fn validate_active_request(
        &self,
        request: &OtpRequest,
        project: &Project,
        config: &RequesterConfig,
    ) -> AllowedState {
        let (Some(config), Ok(metadata)) = (self.config(config), TravisCiMetadata::parse(&request.request_metadata)) else {
            return AllowedState::err("Travis CI build does not exist");
        };

        let Some(build) = self
            .get::<TravisCiBuild>(
                config,
                &format!("/build/{}?include=build.jobs,build.repository", metadata.build_id),
            )
            .await
        else {
            return AllowedState::err("Travis CI build does not exist");
        };

        if build.repository.github_id != project.id {
            return AllowedState::err("Travis CI build is not for this project");
        }
        if build.number != metadata.build_number {
            return AllowedState::err("Travis CI build does not match the initially provided build number");
        }
        if build.branch.as_ref().map(|b| b.name.as_str()) != Some(project.default_branch.as_str()) {
            return AllowedState::err("Travis CI build is not for the default branch");
        }
        if build.event_type.as_deref() != Some("push") {
            return AllowedState::err("Travis CI build was triggered manually, not by GitHub");
        }
        if build.state != "started" {
            return AllowedState::err("Travis CI build is not running");
        }
        let Some(job) = build.jobs.iter().find(|job| job.id == metadata.job_id) else {
            return AllowedState::err("Travis CI job does not appear to exist in that build");
        };
        if job.state != "started" {
            return AllowedState::err("Travis CI job is not running");
        }

        AllowedState::Ok
    }

    async fn validate_proof_for_request(
        &self,
        request: &OtpRequest,
        _project: &Project,
        config: &RequesterConfig,
    ) -> bool {
        let (Some(config), Ok(metadata)) = (self.config(config), TravisCiMetadata::parse(&request.request_metadata)) else {
            return false;
        };
        let log_path = format!("/job/{}/log", metadata.job_id);

        self.ctx
            .proof
            .poll(|_| {
                let log_path = log_path.as_str();
                async move {
                    match self.get::<TravisCiJobLog>(config, log_path).await {
                        Some(TravisCiJobLog { content: Some(content) }) => {
                            output_contains_proof(&content, &request.proof)
                        }
                        _ => false,
                    }
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
        let (build_id, build_number) = match TravisCiMetadata::parse(&request.request_metadata) {
            Ok(m) => (m.build_id, m.build_number),
            Err(_) => (0, String::new()),
        };
        RequestInformation {
            description: format!(
                "Travis CI Build for {}/{}#{}",
                project.repo_owner, project.repo_name, build_number
            ),
            url: format!(
                "https://travis-ci.org/{}/{}/builds/{}",
                project.repo_owner, project.repo_name, build_id
            ),
        }
    }
}
