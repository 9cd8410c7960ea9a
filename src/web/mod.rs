pub mod requester;
pub mod routes;
pub mod slack;

pub use routes::{create_router, AppState};

#[cfg(test)]
pub(crate) mod testing {
    use super::AppState;
    use crate::config::GitHubConfig;
    use crate::db::DbPool;
    use crate::github::GitHubAppClient;
    use crate::oidc::OidcValidator;
    use crate::requesters::test_support::context;
    use crate::requesters::Requester;
    use crate::responders::{Responder, SlackResponder};
    use crate::slack::SlackClient;
    use reqwest::Client;
    use std::sync::Arc;
    use zeroize::Zeroizing;

    /// State with every outbound service pointed at `base`
    pub fn state(pool: DbPool, base: &str) -> AppState {
        let http = Client::new();
        let slack = Arc::new(SlackResponder::new(
            pool.clone(),
            Arc::new(SlackClient::new(http.clone(), base)),
            "/cfa-link",
        ));
        AppState {
            requesters: Arc::new(Requester::all(&context(base))),
            responder: Arc::new(Responder::new(slack.clone())),
            slack,
            github: Arc::new(GitHubAppClient::new(
                http.clone(),
                &GitHubConfig {
                    app_id: "4242".into(),
                    private_key: Zeroizing::new(crate::testing::TEST_KEY_PEM.to_string()),
                    api_url: base.to_string(),
                },
            )),
            oidc: Arc::new(OidcValidator::new(http, 600)),
            slack_signing_secret: Zeroizing::new(String::new()),
            bypass_requester_auth: false,
            pool,
        }
    }
}
