use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::sync::OnceLock;
use std::time::Duration;
use zeroize::Zeroizing;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Web server configuration
#[derive(Debug, Deserialize, Clone)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
}

/// Database configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// Outbound HTTP settings shared by every third-party client
#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// How hard to look for the proof in build logs
#[derive(Debug, Deserialize, Clone)]
pub struct ProofConfig {
    #[serde(default = "default_proof_attempts")]
    pub attempts: u32,
    #[serde(default = "default_proof_delay_ms")]
    pub delay_ms: u64,
}

fn default_proof_attempts() -> u32 {
    3
}

fn default_proof_delay_ms() -> u64 {
    5000
}

impl Default for ProofConfig {
    fn default() -> Self {
        Self {
            attempts: default_proof_attempts(),
            delay_ms: default_proof_delay_ms(),
        }
    }
}

impl ProofConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// OIDC settings
#[derive(Debug, Deserialize, Clone)]
pub struct OidcConfig {
    /// Audience GitHub Actions tokens must be minted for
    #[serde(default = "default_audience")]
    pub audience: String,
    /// GitHub environment release jobs must run in
    #[serde(default = "default_github_environment")]
    pub github_environment: String,
    /// Discovery base for GitHub Actions tokens
    #[serde(default = "default_github_issuer_url")]
    pub github_issuer_url: String,
    #[serde(default = "default_jwks_cache_ttl_secs")]
    pub jwks_cache_ttl_secs: u64,
}

fn default_audience() -> String {
    "continuousauth.dev".to_string()
}

fn default_github_environment() -> String {
    "npm".to_string()
}

fn default_github_issuer_url() -> String {
    "https://token.actions.githubusercontent.com".to_string()
}

fn default_jwks_cache_ttl_secs() -> u64 {
    600
}

impl Default for OidcConfig {
    fn default() -> Self {
        Self {
            audience: default_audience(),
            github_environment: default_github_environment(),
            github_issuer_url: default_github_issuer_url(),
            jwks_cache_ttl_secs: default_jwks_cache_ttl_secs(),
        }
    }
}

/// GitHub App credentials
#[derive(Debug, Deserialize, Clone)]
pub struct GitHubConfig {
    #[serde(default)]
    pub app_id: String,
    /// PEM encoded RSA key for the app
    #[serde(default)]
    pub private_key: Zeroizing<String>,
    #[serde(default = "default_github_api_url")]
    pub api_url: String,
}

fn default_github_api_url() -> String {
    "https://api.github.com".to_string()
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            private_key: Zeroizing::new(String::new()),
            api_url: default_github_api_url(),
        }
    }
}

/// Slack app settings
#[derive(Debug, Deserialize, Clone)]
pub struct SlackConfig {
    /// Empty disables signature verification
    #[serde(default)]
    pub signing_secret: Zeroizing<String>,
    #[serde(default = "default_slack_api_url")]
    pub api_url: String,
    #[serde(default = "default_link_command")]
    pub link_command: String,
}

fn default_slack_api_url() -> String {
    "https://slack.com/api".to_string()
}

fn default_link_command() -> String {
    "/cfa-link".to_string()
}

impl Default for SlackConfig {
    fn default() -> Self {
        Self {
            signing_secret: Zeroizing::new(String::new()),
            api_url: default_slack_api_url(),
            link_command: default_link_command(),
        }
    }
}

/// Base URLs of the CI provider APIs
#[derive(Debug, Deserialize, Clone)]
pub struct ProvidersConfig {
    #[serde(default = "default_circleci_url")]
    pub circleci_url: String,
    #[serde(default = "default_travisci_url")]
    pub travisci_url: String,
    #[serde(default = "default_azure_release_url")]
    pub azure_release_url: String,
}

fn default_circleci_url() -> String {
    "https://circleci.com/api".to_string()
}

fn default_travisci_url() -> String {
    "https://api.travis-ci.org".to_string()
}

fn default_azure_release_url() -> String {
    "https://vsrm.dev.azure.com".to_string()
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            circleci_url: default_circleci_url(),
            travisci_url: default_travisci_url(),
            azure_release_url: default_azure_release_url(),
        }
    }
}

/// Root application configuration
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub web: WebConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub proof: ProofConfig,
    #[serde(default)]
    pub oidc: OidcConfig,
    #[serde(default)]
    pub github: GitHubConfig,
    #[serde(default)]
    pub slack: SlackConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
}

impl AppConfig {
    /// Load configuration from files and environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // e.g. CONTINUOUSAUTH_GITHUB__APP_ID, CONTINUOUSAUTH_PROOF__DELAY_MS
            .add_source(
                Environment::with_prefix("CONTINUOUSAUTH")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Initialize the global config singleton
    pub fn init() -> Result<&'static Self, ConfigError> {
        let config = Self::load()?;
        Ok(CONFIG.get_or_init(|| config))
    }

    /// Get reference to the global config, if initialized
    pub fn get() -> Option<&'static Self> {
        CONFIG.get()
    }
}

/// Join a base URL and a path without doubling slashes
pub fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    format!("{}/{}", base, path)
}
