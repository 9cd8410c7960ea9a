pub mod config;
pub mod db;
pub mod error;
pub mod github;
pub mod oidc;
pub mod proof;
pub mod requesters;
pub mod responders;
pub mod slack;
pub mod web;

#[cfg(test)]
mod testing;

pub use config::AppConfig;
pub use error::{AppError, AppResult};
