use crate::db::models::*;
use crate::error::{AppError, AppResult};
use crate::proof::generate_proof;
use chrono::Utc;
use serde_json::Value;
use sqlx::{Pool, Sqlite, SqliteConnection};
use tracing::{debug, info};
use uuid::Uuid;

pub type DbPool = Pool<Sqlite>;

/// Database operations for projects
pub struct ProjectRepo;

impl ProjectRepo {
    /// Get project by GitHub repository id, enabled or not
    pub async fn get(pool: &DbPool, id: i64) -> AppResult<Option<Project>> {
        let project = sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await?;

        Ok(project)
    }

    /// Get project only if it is enabled
    pub async fn get_enabled(pool: &DbPool, id: i64) -> AppResult<Option<Project>> {
        let project =
            sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = ? AND enabled = 1")
                .bind(id)
                .fetch_optional(pool)
                .await?;

        Ok(project)
    }

    /// Enabled project with every attached strategy config loaded
    pub async fn get_full(pool: &DbPool, id: i64) -> AppResult<Option<FullProject>> {
        match Self::get_enabled(pool, id).await? {
            Some(project) => Ok(Some(Self::with_configs(pool, project).await?)),
            None => Ok(None),
        }
    }

    /// Load the configs a project points at
    pub async fn with_configs(pool: &DbPool, project: Project) -> AppResult<FullProject> {
        let circleci = match project.requester_circleci_id {
            Some(id) => {
                sqlx::query_as::<_, CircleCiRequesterConfig>(
                    "SELECT * FROM circleci_requester_configs WHERE id = ?",
                )
                .bind(id)
                .fetch_optional(pool)
                .await?
            }
            None => None,
        };
        let travisci = match project.requester_travisci_id {
            Some(id) => {
                sqlx::query_as::<_, TravisCiRequesterConfig>(
                    "SELECT * FROM travisci_requester_configs WHERE id = ?",
                )
                .bind(id)
                .fetch_optional(pool)
                .await?
            }
            None => None,
        };
        let github = match project.requester_github_id {
            Some(id) => {
                sqlx::query_as::<_, GitHubActionsRequesterConfig>(
                    "SELECT * FROM github_requester_configs WHERE id = ?",
                )
                .bind(id)
                .fetch_optional(pool)
                .await?
            }
            None => None,
        };
        let azuredevops = match project.requester_azuredevops_id {
            Some(id) => {
                sqlx::query_as::<_, AzureDevOpsRequesterConfig>(
                    "SELECT * FROM azuredevops_requester_configs WHERE id = ?",
                )
                .bind(id)
                .fetch_optional(pool)
                .await?
            }
            None => None,
        };
        let slack = match project.responder_slack_id {
            Some(id) => SlackResponderConfigRepo::get(pool, id).await?,
            None => None,
        };

        Ok(FullProject {
            project,
            circleci,
            travisci,
            github,
            azuredevops,
            slack,
        })
    }

    /// Enroll a project, or re-enable it if it already exists
    pub async fn create(pool: &DbPool, new_project: NewProject) -> AppResult<Project> {
        sqlx::query(
            r#"
            INSERT INTO projects (id, repo_owner, repo_name, enabled, secret, default_branch)
            VALUES (?, ?, ?, 1, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                repo_owner = excluded.repo_owner,
                repo_name = excluded.repo_name,
                enabled = 1,
                secret = excluded.secret,
                default_branch = excluded.default_branch
            "#,
        )
        .bind(new_project.id)
        .bind(&new_project.repo_owner)
        .bind(&new_project.repo_name)
        .bind(&new_project.secret)
        .bind(&new_project.default_branch)
        .execute(pool)
        .await?;

        Self::get(pool, new_project.id)
            .await?
            .ok_or_else(|| AppError::internal("Failed to retrieve created project"))
    }

    pub async fn set_enabled(pool: &DbPool, id: i64, enabled: bool) -> AppResult<()> {
        sqlx::query("UPDATE projects SET enabled = ? WHERE id = ?")
            .bind(enabled)
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Detach and delete every requester config of a project.
    /// Runs on the caller's connection so it can share a transaction.
    pub async fn reset_all_requesters(conn: &mut SqliteConnection, project_id: i64) -> AppResult<()> {
        let project = sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = ?")
            .bind(project_id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| AppError::not_found("Could not find project"))?;

        sqlx::query(
            r#"
            UPDATE projects SET
                requester_circleci_id = NULL,
                requester_travisci_id = NULL,
                requester_github_id = NULL,
                requester_azuredevops_id = NULL
            WHERE id = ?
            "#,
        )
        .bind(project_id)
        .execute(&mut *conn)
        .await?;

        let owned = [
            ("circleci_requester_configs", project.requester_circleci_id),
            ("travisci_requester_configs", project.requester_travisci_id),
            ("github_requester_configs", project.requester_github_id),
            ("azuredevops_requester_configs", project.requester_azuredevops_id),
        ];
        for (table, id) in owned {
            if let Some(id) = id {
                sqlx::query(&format!("DELETE FROM {} WHERE id = ?", table))
                    .bind(id)
                    .execute(&mut *conn)
                    .await?;
            }
        }

        Ok(())
    }

    /// Detach and delete every responder config of a project
    pub async fn reset_all_responders(conn: &mut SqliteConnection, project_id: i64) -> AppResult<()> {
        let slack_id: Option<Option<Uuid>> =
            sqlx::query_scalar("SELECT responder_slack_id FROM projects WHERE id = ?")
                .bind(project_id)
                .fetch_optional(&mut *conn)
                .await?;
        let slack_id = slack_id.ok_or_else(|| AppError::not_found("Could not find project"))?;

        sqlx::query("UPDATE projects SET responder_slack_id = NULL WHERE id = ?")
            .bind(project_id)
            .execute(&mut *conn)
            .await?;

        if let Some(id) = slack_id {
            sqlx::query("DELETE FROM slack_responder_configs WHERE id = ?")
                .bind(id)
                .execute(&mut *conn)
                .await?;
        }

        Ok(())
    }

    /// Replace whatever requester the project had with a new one
    pub async fn attach_requester(
        pool: &DbPool,
        project_id: i64,
        config: NewRequesterConfig,
    ) -> AppResult<Uuid> {
        let id = Uuid::new_v4();
        let mut tx = pool.begin().await?;

        Self::reset_all_requesters(&mut *tx, project_id).await?;

        let column = match &config {
            NewRequesterConfig::CircleCi { access_token } => {
                sqlx::query("INSERT INTO circleci_requester_configs (id, access_token) VALUES (?, ?)")
                    .bind(id)
                    .bind(access_token)
                    .execute(&mut *tx)
                    .await?;
                "requester_circleci_id"
            }
            NewRequesterConfig::TravisCi { access_token } => {
                sqlx::query("INSERT INTO travisci_requester_configs (id, access_token) VALUES (?, ?)")
                    .bind(id)
                    .bind(access_token)
                    .execute(&mut *tx)
                    .await?;
                "requester_travisci_id"
            }
            NewRequesterConfig::GitHubActions => {
                sqlx::query("INSERT INTO github_requester_configs (id) VALUES (?)")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                "requester_github_id"
            }
            NewRequesterConfig::AzureDevOps {
                organization_name,
                project_name,
                access_token,
            } => {
                sqlx::query(
                    r#"
                    INSERT INTO azuredevops_requester_configs (id, organization_name, project_name, access_token)
                    VALUES (?, ?, ?, ?)
                    "#,
                )
                .bind(id)
                .bind(organization_name)
                .bind(project_name)
                .bind(access_token)
                .execute(&mut *tx)
                .await?;
                "requester_azuredevops_id"
            }
        };

        sqlx::query(&format!("UPDATE projects SET {} = ? WHERE id = ?", column))
            .bind(id)
            .bind(project_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!("Attached {} to project {}", column, project_id);
        Ok(id)
    }
}

/// Database operations for OTP requests
pub struct OtpRequestRepo;

impl OtpRequestRepo {
    /// Insert a new `requested` row with a fresh proof
    pub async fn create(pool: &DbPool, project_id: i64, request_metadata: &Value) -> AppResult<OtpRequest> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO otp_requests (id, project_id, state, proof, request_metadata, response_metadata, requested)
            VALUES (?, ?, 'requested', ?, ?, '{}', ?)
            "#,
        )
        .bind(id)
        .bind(project_id)
        .bind(generate_proof())
        .bind(request_metadata.to_string())
        .bind(Utc::now())
        .execute(pool)
        .await?;

        Self::get(pool, id)
            .await?
            .ok_or_else(|| AppError::internal("Failed to retrieve created request"))
    }

    pub async fn get(pool: &DbPool, id: Uuid) -> AppResult<Option<OtpRequest>> {
        let row = sqlx::query_as::<_, OtpRequestRow>("SELECT * FROM otp_requests WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await?;

        Ok(row.map(Into::into))
    }

    /// Get a request only if it belongs to the given project
    pub async fn get_for_project(pool: &DbPool, project_id: i64, id: Uuid) -> AppResult<Option<OtpRequest>> {
        let row = sqlx::query_as::<_, OtpRequestRow>(
            "SELECT * FROM otp_requests WHERE id = ? AND project_id = ?",
        )
        .bind(id)
        .bind(project_id)
        .fetch_optional(pool)
        .await?;

        Ok(row.map(Into::into))
    }

    /// `requested -> validated`. False when another writer got there first.
    pub async fn mark_validated(pool: &DbPool, id: Uuid) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE otp_requests SET state = 'validated', validated = ? WHERE id = ? AND state = 'requested'",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// `from -> error`, recording why. `from` must be a non-terminal state.
    pub async fn mark_errored(pool: &DbPool, id: Uuid, from: RequestState, reason: &str) -> AppResult<bool> {
        if !from.can_transition_to(RequestState::Error) {
            return Ok(false);
        }
        let result = sqlx::query(
            "UPDATE otp_requests SET state = 'error', errored = ?, error_reason = ? WHERE id = ? AND state = ?",
        )
        .bind(Utc::now())
        .bind(reason)
        .bind(id)
        .bind(from.as_str())
        .execute(pool)
        .await?;

        let moved = result.rows_affected() == 1;
        if moved {
            info!("Request {} moved to error: {}", id, reason);
        }
        Ok(moved)
    }

    /// `validated -> responded`, storing the human's answer
    pub async fn mark_responded(pool: &DbPool, id: Uuid, response: &str, user: &str) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE otp_requests
            SET state = 'responded', responded = ?, response = ?, user_that_responded = ?
            WHERE id = ? AND state = 'validated'
            "#,
        )
        .bind(Utc::now())
        .bind(response)
        .bind(user)
        .bind(id)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn set_response_metadata(pool: &DbPool, id: Uuid, metadata: &Value) -> AppResult<()> {
        sqlx::query("UPDATE otp_requests SET response_metadata = ? WHERE id = ?")
            .bind(metadata.to_string())
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }
}

/// Database operations for Slack responder configs
pub struct SlackResponderConfigRepo;

impl SlackResponderConfigRepo {
    pub async fn get(pool: &DbPool, id: Uuid) -> AppResult<Option<SlackResponderConfig>> {
        let config = sqlx::query_as::<_, SlackResponderConfig>(
            "SELECT * FROM slack_responder_configs WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;

        Ok(config)
    }

    /// Atomically swap the project's responder for a new Slack channel and
    /// burn the linker that authorized it.
    pub async fn link(
        pool: &DbPool,
        linker: &SlackResponderLinker,
        config: NewSlackResponderConfig,
    ) -> AppResult<SlackResponderConfig> {
        let id = Uuid::new_v4();
        let mut tx = pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO slack_responder_configs
                (id, team_name, team_id, team_icon, channel_name, channel_id, enterprise_id, username_to_mention)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(&config.team_name)
        .bind(&config.team_id)
        .bind(&config.team_icon)
        .bind(&config.channel_name)
        .bind(&config.channel_id)
        .bind(&config.enterprise_id)
        .bind(&config.username_to_mention)
        .execute(&mut *tx)
        .await?;

        ProjectRepo::reset_all_responders(&mut *tx, linker.project_id).await?;

        sqlx::query("UPDATE projects SET responder_slack_id = ? WHERE id = ?")
            .bind(id)
            .bind(linker.project_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM slack_responder_linkers WHERE id = ?")
            .bind(linker.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(SlackResponderConfig {
            id,
            team_name: config.team_name,
            team_id: config.team_id,
            team_icon: config.team_icon,
            channel_name: config.channel_name,
            channel_id: config.channel_id,
            enterprise_id: config.enterprise_id,
            username_to_mention: config.username_to_mention,
        })
    }
}

/// Database operations for Slack linkers
pub struct SlackLinkerRepo;

impl SlackLinkerRepo {
    /// Mint a linker for a project
    pub async fn create(pool: &DbPool, project_id: i64) -> AppResult<SlackResponderLinker> {
        let linker = SlackResponderLinker {
            id: Uuid::new_v4(),
            project_id,
        };
        sqlx::query("INSERT INTO slack_responder_linkers (id, project_id) VALUES (?, ?)")
            .bind(linker.id)
            .bind(linker.project_id)
            .execute(pool)
            .await?;
        Ok(linker)
    }

    pub async fn get(pool: &DbPool, id: Uuid) -> AppResult<Option<SlackResponderLinker>> {
        let linker = sqlx::query_as::<_, SlackResponderLinker>(
            "SELECT * FROM slack_responder_linkers WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;

        Ok(linker)
    }
}

/// Database operations for Slack workspace installs
pub struct SlackInstallRepo;

impl SlackInstallRepo {
    /// Credentials for a (team, enterprise) pair. Non-enterprise teams use ''.
    pub async fn find(pool: &DbPool, team_id: &str, enterprise_id: &str) -> AppResult<Option<SlackInstall>> {
        let install = sqlx::query_as::<_, SlackInstall>(
            "SELECT * FROM slack_installs WHERE team_id = ? AND enterprise_id = ?",
        )
        .bind(team_id)
        .bind(enterprise_id)
        .fetch_optional(pool)
        .await?;

        Ok(install)
    }

    /// Store or refresh a workspace install
    pub async fn upsert(pool: &DbPool, install: NewSlackInstall) -> AppResult<SlackInstall> {
        sqlx::query(
            r#"
            INSERT INTO slack_installs (id, bot_token, bot_id, bot_user_id, team_id, enterprise_id)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(team_id, enterprise_id) DO UPDATE SET
                bot_token = excluded.bot_token,
                bot_id = excluded.bot_id,
                bot_user_id = excluded.bot_user_id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&install.bot_token)
        .bind(&install.bot_id)
        .bind(&install.bot_user_id)
        .bind(&install.team_id)
        .bind(&install.enterprise_id)
        .execute(pool)
        .await?;

        Self::find(pool, &install.team_id, &install.enterprise_id)
            .await?
            .ok_or_else(|| AppError::internal("Failed to retrieve slack install"))
    }
}

#[cfg(test)]
pub async fn setup_test_db() -> DbPool {
    use sqlx::sqlite::SqlitePoolOptions;
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");
    init_db(&pool).await.expect("Failed to init database");
    pool
}

/// Initialize database with migrations
pub async fn init_db(pool: &DbPool) -> AppResult<()> {
    info!("Running database migrations");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS circleci_requester_configs (
            id BLOB PRIMARY KEY NOT NULL,
            access_token TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS travisci_requester_configs (
            id BLOB PRIMARY KEY NOT NULL,
            access_token TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS github_requester_configs (
            id BLOB PRIMARY KEY NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS azuredevops_requester_configs (
            id BLOB PRIMARY KEY NOT NULL,
            organization_name TEXT NOT NULL,
            project_name TEXT NOT NULL,
            access_token TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS slack_responder_configs (
            id BLOB PRIMARY KEY NOT NULL,
            team_name TEXT NOT NULL,
            team_id TEXT NOT NULL,
            team_icon TEXT NOT NULL,
            channel_name TEXT NOT NULL,
            channel_id TEXT NOT NULL,
            enterprise_id TEXT NOT NULL DEFAULT '',
            username_to_mention TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS projects (
            id INTEGER PRIMARY KEY NOT NULL,
            repo_owner TEXT NOT NULL,
            repo_name TEXT NOT NULL,
            enabled BOOLEAN NOT NULL DEFAULT true,
            secret TEXT NOT NULL,
            default_branch TEXT NOT NULL DEFAULT 'master',
            requester_circleci_id BLOB REFERENCES circleci_requester_configs(id),
            requester_travisci_id BLOB REFERENCES travisci_requester_configs(id),
            requester_github_id BLOB REFERENCES github_requester_configs(id),
            requester_azuredevops_id BLOB REFERENCES azuredevops_requester_configs(id),
            responder_slack_id BLOB REFERENCES slack_responder_configs(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS slack_responder_linkers (
            id BLOB PRIMARY KEY NOT NULL,
            project_id INTEGER NOT NULL REFERENCES projects(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS slack_installs (
            id BLOB PRIMARY KEY NOT NULL,
            bot_token TEXT NOT NULL,
            bot_id TEXT NOT NULL,
            bot_user_id TEXT NOT NULL,
            team_id TEXT NOT NULL,
            enterprise_id TEXT NOT NULL DEFAULT '',
            UNIQUE(team_id, enterprise_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS otp_requests (
            id BLOB PRIMARY KEY NOT NULL,
            project_id INTEGER NOT NULL REFERENCES projects(id),
            state TEXT NOT NULL CHECK (state IN ('requested', 'validated', 'responded', 'error')),
            proof TEXT NOT NULL,
            request_metadata TEXT NOT NULL,
            response_metadata TEXT NOT NULL DEFAULT '{}',
            response TEXT,
            error_reason TEXT,
            requested DATETIME NOT NULL,
            validated DATETIME,
            responded DATETIME,
            errored DATETIME,
            user_that_responded TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_otp_requests_project ON otp_requests(project_id)")
        .execute(pool)
        .await?;

    info!("Database migrations complete");
    Ok(())
}
