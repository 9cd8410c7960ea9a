//! Slack Web API plumbing shared by the Slack responder.

pub mod client;
pub mod signature;

pub use client::{SlackClient, SlackError, TeamInfo};
