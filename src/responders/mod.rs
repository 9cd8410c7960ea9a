//! Responders put a validated request in front of a human and carry their
//! answer back to the request row.

pub mod slack;

pub use slack::{InteractionPayload, SlackResponder, SlashCommand};

use crate::db::models::{FullProject, OtpRequest, RequestInformation};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

#[async_trait]
pub trait ResponderStrategy: Send + Sync {
    /// Ask a human for the OTP. Failures are logged, never retried; the
    /// request stays `validated`.
    async fn request_otp(&self, request: &OtpRequest, project: &FullProject, info: Option<&RequestInformation>);
}

/// Routes each project to the responder it is configured with
#[derive(Debug, Clone)]
pub struct Responder {
    slack: Arc<SlackResponder>,
}

impl Responder {
    pub fn new(slack: Arc<SlackResponder>) -> Self {
        Self { slack }
    }

    pub fn slack(&self) -> &SlackResponder {
        &self.slack
    }
}

#[async_trait]
impl ResponderStrategy for Responder {
    async fn request_otp(&self, request: &OtpRequest, project: &FullProject, info: Option<&RequestInformation>) {
        if project.slack.is_some() {
            self.slack.request_otp(request, project, info).await;
        } else {
            warn!(
                "Request {} validated for {} but the project has no responder",
                request.id,
                project.project.slug()
            );
        }
    }
}
