use crate::config::join_url;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error};

#[derive(Debug, thiserror::Error)]
pub enum SlackError {
    #[error("Slack request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Slack API call {method} failed: {error}")]
    Api { method: &'static str, error: String },
}

/// Envelope every Web API method answers with
#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    error: Option<String>,
    #[serde(flatten)]
    rest: serde_json::Map<String, Value>,
}

/// Subset of `team.info` the link command needs
#[derive(Debug, Clone, Deserialize)]
pub struct TeamInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub icon: TeamIcon,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TeamIcon {
    #[serde(default)]
    pub image_68: String,
}

/// Thin Slack Web API client. Bot tokens are per workspace so every call
/// takes one.
pub struct SlackClient {
    http: Client,
    api_url: String,
}

impl std::fmt::Debug for SlackClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlackClient")
            .field("api_url", &self.api_url)
            .finish_non_exhaustive()
    }
}

impl SlackClient {
    pub fn new(http: Client, api_url: &str) -> Self {
        Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
        }
    }

    async fn call(
        &self,
        method: &'static str,
        token: &str,
        body: &Value,
    ) -> Result<serde_json::Map<String, Value>, SlackError> {
        let url = join_url(&self.api_url, method);
        debug!("Calling Slack {}", method);

        let response: ApiResponse = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(body)
            .send()
            .await?
            .json()
            .await?;

        if !response.ok {
            let error = response.error.unwrap_or_else(|| "unknown_error".to_string());
            error!("Slack {} returned {}", method, error);
            return Err(SlackError::Api { method, error });
        }
        Ok(response.rest)
    }

    /// Post a message, returning its `ts`
    pub async fn post_message(&self, token: &str, message: &Value) -> Result<String, SlackError> {
        let rest = self.call("chat.postMessage", token, message).await?;
        rest.get("ts")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(SlackError::Api {
                method: "chat.postMessage",
                error: "missing_ts".to_string(),
            })
    }

    pub async fn update_message(&self, token: &str, message: &Value) -> Result<(), SlackError> {
        self.call("chat.update", token, message).await.map(|_| ())
    }

    pub async fn open_dialog(&self, token: &str, trigger_id: &str, dialog: &Value) -> Result<(), SlackError> {
        let body = json!({ "trigger_id": trigger_id, "dialog": dialog });
        self.call("dialog.open", token, &body).await.map(|_| ())
    }

    pub async fn team_info(&self, token: &str, team_id: &str) -> Result<TeamInfo, SlackError> {
        let rest = self.call("team.info", token, &json!({ "team": team_id })).await?;
        let team = rest.get("team").cloned().unwrap_or(Value::Null);
        serde_json::from_value(team).map_err(|e| SlackError::Api {
            method: "team.info",
            error: e.to_string(),
        })
    }

    /// Ephemeral reply through an interaction's `response_url`
    pub async fn respond(&self, response_url: &str, text: &str) -> Result<(), SlackError> {
        self.http
            .post(response_url)
            .json(&json!({ "response_type": "ephemeral", "text": text }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_post_message_returns_ts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat.postMessage"))
            .and(header("Authorization", "Bearer xoxb-1"))
            .and(body_partial_json(json!({ "channel": "C1" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true, "ts": "1700000000.0001" })))
            .mount(&server)
            .await;

        let client = SlackClient::new(Client::new(), &server.uri());
        let ts = client
            .post_message("xoxb-1", &json!({ "channel": "C1", "text": "hi" }))
            .await
            .unwrap();
        assert_eq!(ts, "1700000000.0001");
    }

    #[tokio::test]
    async fn test_api_error_surfaces() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/dialog.open"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": false, "error": "expired_trigger_id" })))
            .mount(&server)
            .await;

        let client = SlackClient::new(Client::new(), &server.uri());
        let err = client.open_dialog("xoxb-1", "trig", &json!({})).await.unwrap_err();
        assert!(matches!(err, SlackError::Api { method: "dialog.open", ref error } if error == "expired_trigger_id"));
    }

    #[tokio::test]
    async fn test_team_info() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/team.info"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "team": { "id": "T1", "name": "Electron", "icon": { "image_68": "https://img/68.png" } }
            })))
            .mount(&server)
            .await;

        let client = SlackClient::new(Client::new(), &server.uri());
        let team = client.team_info("xoxb-1", "T1").await.unwrap();
        assert_eq!(team.name, "Electron");
        assert_eq!(team.icon.image_68, "https://img/68.png");
    }
}
