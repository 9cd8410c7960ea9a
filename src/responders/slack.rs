use super::ResponderStrategy;
use crate::db::models::{FullProject, NewSlackResponderConfig, OtpRequest, RequestInformation, RequestState};
use crate::db::{DbPool, OtpRequestRepo, ProjectRepo, SlackInstallRepo, SlackLinkerRepo, SlackResponderConfigRepo};
use crate::slack::SlackClient;
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const OPEN_DIALOG: &str = "open-otp-dialog";
const CALLBACK_PREFIX: &str = "otp:";

const UNEXPECTED_PROCESSING: &str =
    ":red_circle: CFA experienced an unexpected error while processing your response, please try again later.";
const UNEXPECTED_FINDING: &str =
    ":red_circle: CFA experienced an unexpected error while finding your request, please try again later.";
const UNEXPECTED_UPDATING: &str =
    ":red_circle: CFA experienced an unexpected error while updating your request, please try again later.";
const INVALID_STATE: &str = ":red_circle: This OTP request is in an invalid state and can not be responded to.";

/// Slash command form fields
#[derive(Debug, Clone, Deserialize)]
pub struct SlashCommand {
    pub command: String,
    #[serde(default)]
    pub text: String,
    pub team_id: String,
    #[serde(default)]
    pub enterprise_id: Option<String>,
    pub channel_id: String,
    #[serde(default)]
    pub channel_name: String,
    pub user_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SlackTeamRef {
    pub id: String,
    #[serde(default)]
    pub enterprise_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SlackUserRef {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SlackChannelRef {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SlackAction {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub value: Option<String>,
}

/// The `payload` field of an interactive request
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InteractionPayload {
    InteractiveMessage {
        team: SlackTeamRef,
        trigger_id: String,
        #[serde(default)]
        actions: Vec<SlackAction>,
    },
    DialogSubmission {
        team: SlackTeamRef,
        user: SlackUserRef,
        channel: SlackChannelRef,
        callback_id: String,
        #[serde(default)]
        submission: HashMap<String, String>,
        #[serde(default)]
        response_url: Option<String>,
    },
    #[serde(other)]
    Unsupported,
}

fn ephemeral(text: impl Into<String>) -> Value {
    json!({ "response_type": "ephemeral", "text": text.into() })
}

fn otp_text(project: &FullProject, username: &str) -> String {
    format!(
        ":warning: Attention on deck, @{}! The CFA system needs a 2FA OTP token to publish a new release of `{}/{}`.",
        username, project.project.repo_owner, project.project.repo_name
    )
}

fn info_attachment(info: &RequestInformation) -> Value {
    json!({
        "fallback": format!("Request: {}", info.url),
        "color": "#6554C0",
        "pretext": "The request source is linked below",
        "title": info.description,
        "title_link": info.url,
        "text": "This request has been validated by CFA and now just requires a OTP code.",
        "footer": "CFA Auth",
        "ts": Utc::now().timestamp().to_string(),
    })
}

fn action_attachment(request_id: Uuid) -> Value {
    json!({
        "text": "Submit OTP Token & Confirm Release",
        "fallback": "You are unable to confirm the release",
        "callback_id": Uuid::new_v4().to_string(),
        "color": "#00B8D9",
        "actions": [{
            "name": request_id.to_string(),
            "text": "Enter OTP Token",
            "style": "danger",
            "type": "button",
            "value": OPEN_DIALOG,
        }],
    })
}

fn responded_attachment(user_name: &str) -> Value {
    json!({
        "fallback": "OTP provided by:",
        "pretext": "We've received an OTP and will transmit to the requester shortly.",
        "title": format!("OTP provided by: @{}", user_name),
        "color": "#36B37E",
        "footer": "CFA Auth",
        "ts": Utc::now().timestamp().to_string(),
    })
}

/// Slack channel responder: posts the prompt, opens the OTP dialog and
/// records the answer.
#[derive(Debug)]
pub struct SlackResponder {
    pool: DbPool,
    client: Arc<SlackClient>,
    link_command: String,
}

impl SlackResponder {
    pub fn new(pool: DbPool, client: Arc<SlackClient>, link_command: &str) -> Self {
        Self {
            pool,
            client,
            link_command: link_command.to_string(),
        }
    }

    pub fn link_command(&self) -> &str {
        &self.link_command
    }

    async fn bot_token(&self, team_id: &str, enterprise_id: &str) -> Option<String> {
        match SlackInstallRepo::find(&self.pool, team_id, enterprise_id).await {
            Ok(Some(install)) => Some(install.bot_token),
            Ok(None) => {
                warn!("No Slack install for {}/{}", enterprise_id, team_id);
                None
            }
            Err(e) => {
                error!("Failed to load Slack install for {}/{}: {}", enterprise_id, team_id, e);
                None
            }
        }
    }

    /// Link the channel a slash command came from to the linker's project.
    /// Returns the ephemeral reply.
    pub async fn handle_link_command(&self, command: &SlashCommand) -> Value {
        let linker_id = command.text.trim();
        if linker_id.is_empty() {
            return ephemeral(
                "Missing required argument \"link-id\", please ensure you followed the instructions on CFA exactly.",
            );
        }
        let Some(linker_uuid) = Uuid::parse_str(linker_id).ok().filter(|id| id.get_version_num() == 4) else {
            return ephemeral(format!(
                "The linker ID `{}` provided is invalid, please head back to CFA and try again.",
                linker_id
            ));
        };

        let linker = match SlackLinkerRepo::get(&self.pool, linker_uuid).await {
            Ok(Some(linker)) => linker,
            Ok(None) => {
                return ephemeral(
                    "The linker ID provided has either already been used or does not exist, please head back to CFA and try again.",
                )
            }
            Err(e) => {
                error!("Failed to load linker {}: {}", linker_uuid, e);
                return ephemeral(
                    "An internal error occurred while trying to link this Slack team to CFA.  Please try again later.",
                );
            }
        };

        let enterprise_id = command.enterprise_id.clone().unwrap_or_default();
        let team = match self.bot_token(&command.team_id, &enterprise_id).await {
            Some(token) => self.client.team_info(&token, &command.team_id).await.ok(),
            None => None,
        };
        let Some(team) = team else {
            error!("Failed to link team {}", command.team_id);
            return ephemeral(
                "An internal error occurred while trying to link this Slack team to CFA.  Please try again later.",
            );
        };

        let new_config = NewSlackResponderConfig {
            team_name: team.name,
            team_id: command.team_id.clone(),
            team_icon: team.icon.image_68,
            channel_name: command.channel_name.clone(),
            channel_id: command.channel_id.clone(),
            enterprise_id,
            username_to_mention: command.user_name.clone(),
        };
        let linked = async {
            SlackResponderConfigRepo::link(&self.pool, &linker, new_config).await?;
            ProjectRepo::get(&self.pool, linker.project_id).await
        }
        .await;

        match linked {
            Ok(Some(project)) => {
                info!("Linked Slack channel {} to {}", command.channel_id, project.slug());
                ephemeral(format!("Successfully linked this channel to `{}`", project.slug()))
            }
            Ok(None) | Err(_) => ephemeral(
                "An internal error occurred while trying to link this Slack team to CFA.  Please try again later.",
            ),
        }
    }

    pub async fn handle_interaction(&self, payload: &InteractionPayload) {
        match payload {
            InteractionPayload::InteractiveMessage { team, trigger_id, actions } => {
                let Some(action) = actions
                    .iter()
                    .find(|a| a.kind == "button" && a.value.as_deref() == Some(OPEN_DIALOG))
                else {
                    debug!("Ignoring interactive message without an OTP button");
                    return;
                };
                self.open_otp_dialog(team, trigger_id, &action.name).await;
            }
            InteractionPayload::DialogSubmission {
                team,
                user,
                channel,
                callback_id,
                submission,
                response_url,
            } => {
                let Some(request_id) = callback_id.strip_prefix(CALLBACK_PREFIX) else {
                    debug!("Ignoring dialog {}", callback_id);
                    return;
                };
                let otp = submission.get("otp").map(String::as_str).unwrap_or_default();
                if let Err(reply) = self.submit_otp(team, user, channel, request_id, otp).await {
                    if let Some(url) = response_url {
                        if let Err(e) = self.client.respond(url, reply).await {
                            warn!("Failed to send ephemeral reply: {}", e);
                        }
                    }
                }
            }
            InteractionPayload::Unsupported => debug!("Ignoring unsupported Slack interaction"),
        }
    }

    async fn open_otp_dialog(&self, team: &SlackTeamRef, trigger_id: &str, request_id: &str) {
        let enterprise_id = team.enterprise_id.clone().unwrap_or_default();
        let Some(token) = self.bot_token(&team.id, &enterprise_id).await else {
            return;
        };
        let dialog = json!({
            "title": "Enter 2FA OTP",
            "callback_id": format!("{}{}", CALLBACK_PREFIX, request_id),
            "elements": [{ "type": "text", "label": "OTP", "name": "otp" }],
        });
        if let Err(e) = self.client.open_dialog(&token, trigger_id, &dialog).await {
            error!("Failed to open OTP dialog for {}: {}", request_id, e);
        }
    }

    /// Record a submitted OTP. `Err` carries the ephemeral reply for the user.
    async fn submit_otp(
        &self,
        team: &SlackTeamRef,
        user: &SlackUserRef,
        channel: &SlackChannelRef,
        request_id: &str,
        otp: &str,
    ) -> Result<(), &'static str> {
        let request_id = Uuid::parse_str(request_id)
            .ok()
            .filter(|id| id.get_version_num() == 4)
            .ok_or(UNEXPECTED_PROCESSING)?;

        let request = OtpRequestRepo::get(&self.pool, request_id)
            .await
            .ok()
            .flatten()
            .ok_or(UNEXPECTED_FINDING)?;

        if request.state != RequestState::Validated {
            return Err(INVALID_STATE);
        }

        let Some(message_ts) = request.response_metadata.get("request_ts").and_then(Value::as_str) else {
            match OtpRequestRepo::mark_errored(
                &self.pool,
                request.id,
                RequestState::Validated,
                "Invalid responseMetadata on the backend",
            )
            .await
            {
                Ok(true) => {}
                Ok(false) => warn!("Request {} left validated before it could be failed", request.id),
                Err(e) => warn!("Failed to mark request {} as errored: {}", request.id, e),
            }
            return Err(UNEXPECTED_UPDATING);
        };

        // Only the submission that wins the transition touches the message
        match OtpRequestRepo::mark_responded(&self.pool, request.id, otp, &user.name).await {
            Ok(true) => info!("Request {} answered by {}", request.id, user.name),
            Ok(false) => return Err(INVALID_STATE),
            Err(e) => {
                error!("Failed to store OTP for {}: {}", request.id, e);
                return Err(UNEXPECTED_UPDATING);
            }
        }

        let mut attachments = request
            .response_metadata
            .get("attachments")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        attachments.push(responded_attachment(&user.name));
        let update = json!({
            "channel": channel.id,
            "ts": message_ts,
            "text": request.response_metadata.get("messageText").cloned().unwrap_or(Value::Null),
            "parse": "full",
            "attachments": attachments,
        });

        let enterprise_id = team.enterprise_id.clone().unwrap_or_default();
        if let Some(token) = self.bot_token(&team.id, &enterprise_id).await {
            if let Err(e) = self.client.update_message(&token, &update).await {
                warn!("Failed to update OTP message for {}: {}", request.id, e);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ResponderStrategy for SlackResponder {
    async fn request_otp(&self, request: &OtpRequest, project: &FullProject, info: Option<&RequestInformation>) {
        let Some(config) = &project.slack else {
            return;
        };
        let Some(token) = self.bot_token(&config.team_id, &config.enterprise_id).await else {
            debug!(
                "attempted to request OTP from {}/{} but failed to obtain credentials",
                config.enterprise_id, config.team_id
            );
            return;
        };

        let message_text = otp_text(project, &config.username_to_mention);
        let attachments: Vec<Value> = info.map(info_attachment).into_iter().collect();
        let mut all_attachments = attachments.clone();
        all_attachments.push(action_attachment(request.id));

        let message = json!({
            "channel": config.channel_id,
            "text": message_text,
            "parse": "full",
            "attachments": all_attachments,
        });

        match self.client.post_message(&token, &message).await {
            Ok(ts) => {
                let metadata = json!({
                    "request_ts": ts,
                    "messageText": message_text,
                    "attachments": attachments,
                });
                if let Err(e) = OtpRequestRepo::set_response_metadata(&self.pool, request.id, &metadata).await {
                    error!("Failed to store Slack metadata for {}: {}", request.id, e);
                }
            }
            Err(e) => error!("failed to send OTP request message for {}: {}", request.id, e),
        }
    }
}
