use anyhow::{bail, Context};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use zeroize::Zeroizing;

/// The slice of an OTP request the CLI cares about.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OtpRequest {
    pub id: String,
    pub state: String,
    pub proof: String,
    pub response: Option<String>,
    pub error_reason: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
    message: Option<String>,
}

/// Requester API client bound to one project and one CI provider.
pub struct ApiClient {
    http: Client,
    base: String,
    secret: Zeroizing<String>,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base", &self.base)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl ApiClient {
    pub fn new(server: &str, project_id: &str, slug: &str, secret: String) -> Self {
        Self {
            http: Client::new(),
            base: format!(
                "{}/api/request/{}/{}",
                server.trim_end_matches('/'),
                project_id,
                slug
            ),
            secret: Zeroizing::new(secret),
        }
    }

    async fn post(&self, path: &str, body: &Value) -> anyhow::Result<Response> {
        let url = format!("{}{}", self.base, path);
        self.http
            .post(&url)
            .bearer_auth(self.secret.as_str())
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", url))
    }

    pub async fn test_auth(&self) -> anyhow::Result<()> {
        let resp = self.post("/test", &Value::Object(Default::default())).await?;
        check(resp).await.map(|_| ())
    }

    pub async fn create(&self, metadata: &Value) -> anyhow::Result<OtpRequest> {
        let resp = self.post("", metadata).await?;
        Ok(check(resp).await?.json().await?)
    }

    pub async fn validate(&self, request_id: &str) -> anyhow::Result<OtpRequest> {
        let resp = self
            .post(&format!("/{}/validate", request_id), &Value::Null)
            .await?;
        Ok(check(resp).await?.json().await?)
    }

    /// `None` while nobody has answered the request yet.
    pub async fn fetch(&self, request_id: &str) -> anyhow::Result<Option<OtpRequest>> {
        let resp = self.post(&format!("/{}", request_id), &Value::Null).await?;
        if resp.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        Ok(Some(check(resp).await?.json().await?))
    }

    pub async fn exchange_credentials(&self, token: &str) -> anyhow::Result<String> {
        let resp = self
            .post("/credentials", &serde_json::json!({ "token": token }))
            .await?;
        let body: Value = check(resp).await?.json().await?;
        match body.get("GITHUB_TOKEN").and_then(Value::as_str) {
            Some(token) => Ok(token.to_string()),
            None => bail!("Server response did not include a GITHUB_TOKEN"),
        }
    }
}

async fn check(resp: Response) -> anyhow::Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let text = resp.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorBody>(&text) {
        Ok(ErrorBody {
            error,
            message: Some(message),
        }) => bail!("{} ({}): {}", error, status, message),
        Ok(ErrorBody { error, .. }) => bail!("{} ({})", error, status),
        Err(_) => bail!("Unexpected response ({}): {}", status, text),
    }
}
