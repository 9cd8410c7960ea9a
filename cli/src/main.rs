mod client;

use anyhow::bail;
use clap::{Parser, Subcommand};
use client::ApiClient;
use std::time::{Duration, Instant};
use tracing::{debug, info};

const REQUESTERS: [&str; 4] = ["circleci", "travisci", "github", "azuredevops-release"];

#[derive(Parser)]
#[command(name = "cfa")]
#[command(about = "Request a one-time password from ContinuousAuth inside a CI build")]
struct Cli {
    /// ContinuousAuth server
    #[arg(long, env = "CFA_SERVER", default_value = "https://continuousauth.dev")]
    server: String,

    #[arg(long, env = "CFA_PROJECT_ID")]
    project_id: String,

    /// Requester slug
    #[arg(long, env = "CFA_REQUESTER", value_parser = REQUESTERS)]
    requester: String,

    #[arg(long, env = "CFA_SECRET", hide_env_values = true)]
    secret: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the project secret is accepted
    Test,
    /// Create a request, prove the build and wait for the OTP
    Request {
        /// Requester metadata as a JSON object, e.g. '{"buildNumber": 42}'
        #[arg(long, default_value = "{}")]
        metadata: String,

        /// Seconds to let the proof reach the build log before validating
        #[arg(long, default_value_t = 5)]
        proof_delay: u64,

        #[arg(long, default_value_t = 5)]
        poll_interval: u64,

        /// Give up waiting for a human after this many seconds
        #[arg(long, default_value_t = 600)]
        timeout: u64,
    },
    /// Exchange a CI OIDC token for a GitHub token scoped to the repository
    Credentials {
        #[arg(long, env = "CFA_OIDC_TOKEN", hide_env_values = true)]
        token: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "continuousauth_cli=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let api = ApiClient::new(&cli.server, &cli.project_id, &cli.requester, cli.secret);

    match cli.command {
        Commands::Test => {
            api.test_auth().await?;
            println!("Authentication OK");
            Ok(())
        }
        Commands::Request {
            metadata,
            proof_delay,
            poll_interval,
            timeout,
        } => {
            let metadata: serde_json::Value = serde_json::from_str(&metadata)?;
            let otp = request_otp(
                &api,
                &metadata,
                Duration::from_secs(proof_delay),
                Duration::from_secs(poll_interval),
                Duration::from_secs(timeout),
            )
            .await?;
            println!("{}", otp);
            Ok(())
        }
        Commands::Credentials { token } => {
            println!("{}", api.exchange_credentials(&token).await?);
            Ok(())
        }
    }
}

async fn request_otp(
    api: &ApiClient,
    metadata: &serde_json::Value,
    proof_delay: Duration,
    poll_interval: Duration,
    timeout: Duration,
) -> anyhow::Result<String> {
    let request = api.create(metadata).await?;
    info!("Created request {}", request.id);

    // The server searches the build log for exactly this block
    eprintln!("Proof:\n{}", request.proof);
    tokio::time::sleep(proof_delay).await;

    let validated = api.validate(&request.id).await?;
    info!("Request {} is {}, waiting for a response", validated.id, validated.state);

    let started = Instant::now();
    loop {
        if let Some(answered) = api.fetch(&request.id).await? {
            return match answered.response {
                Some(otp) => Ok(otp),
                None => bail!(
                    "Request {} ended without a response: {}",
                    answered.id,
                    answered.error_reason.unwrap_or_else(|| answered.state.clone())
                ),
            };
        }
        if started.elapsed() >= timeout {
            bail!("Timed out waiting for a response to request {}", request.id);
        }
        debug!("No response yet for {}", request.id);
        tokio::time::sleep(poll_interval).await;
    }
}
