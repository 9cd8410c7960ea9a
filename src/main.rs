use continuousauth::{
    config::AppConfig,
    db,
    github::GitHubAppClient,
    oidc::OidcValidator,
    proof::ProofPolicy,
    requesters::{Requester, RequesterContext},
    responders::{Responder, SlackResponder},
    slack::SlackClient,
    web,
};
use reqwest::Client;
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "continuousauth=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting ContinuousAuth v{}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::init()?;
    info!("Configuration loaded");

    if config.slack.signing_secret.is_empty() {
        warn!("slack.signing_secret is not set, Slack requests will not be verified");
    }
    if config.github.app_id.is_empty() {
        warn!("GitHub App is not configured, credential exchange and tag checks will fail");
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await?;
    info!("Database connected: {}", config.database.url);

    db::init_db(&pool).await?;

    let http = Client::builder()
        .timeout(Duration::from_secs(config.http.timeout_secs))
        .build()?;

    let oidc = Arc::new(OidcValidator::new(http.clone(), config.oidc.jwks_cache_ttl_secs));
    let github = Arc::new(GitHubAppClient::new(http.clone(), &config.github));

    let ctx = RequesterContext {
        http: http.clone(),
        providers: config.providers.clone(),
        proof: ProofPolicy::from(&config.proof),
        oidc_settings: config.oidc.clone(),
        oidc: oidc.clone(),
        github: github.clone(),
    };
    let requesters = Requester::all(&ctx);
    info!(
        "Requesters mounted: {}",
        requesters.iter().map(|r| r.slug()).collect::<Vec<_>>().join(", ")
    );

    let slack = Arc::new(SlackResponder::new(
        pool.clone(),
        Arc::new(SlackClient::new(http, &config.slack.api_url)),
        &config.slack.link_command,
    ));

    let state = web::AppState {
        pool,
        requesters: Arc::new(requesters),
        responder: Arc::new(Responder::new(slack.clone())),
        slack,
        github,
        oidc,
        slack_signing_secret: config.slack.signing_secret.clone(),
        bypass_requester_auth: false,
    };

    let app = web::create_router(state);

    let addr = format!("{}:{}", config.web.host, config.web.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Web server listening on http://{}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
