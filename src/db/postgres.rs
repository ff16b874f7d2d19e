// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! PostgreSQL credential store.
//!
//! Row-scoped atomicity comes from the database:
//! - backup codes are consumed by `UPDATE ... WHERE used = FALSE` and the
//!   affected row count decides the winner
//! - refresh tokens and OAuth states are consumed by `DELETE ... RETURNING`
//! - a connection is upserted on `(user_id, app_id)`, which locks the row for
//!   the mutation that follows in the same transaction
//! - uniqueness of live users and devices is enforced by partial indexes
//!
//! Queries are built at runtime so the crate builds without a database.

use super::{ConnectionMutation, CredentialStore};
use crate::error::AppError;
use crate::models::{
    AppConnection, BackupCode, ConnectionHealthMetric, MfaSetup, OAuthState, RefreshTokenRecord,
    SecurityEvent, SecurityEventType, Session, TrustedDevice, User,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use std::time::Duration;
use uuid::Uuid;

/// [`CredentialStore`] over a PostgreSQL connection pool.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Open a pool against `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(db_error)?;
        tracing::info!(max_connections, "Connected to PostgreSQL");
        Ok(Self::new(pool))
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply pending schema migrations.
    pub async fn migrate(&self) -> Result<(), AppError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::Database(format!("Migration failed: {}", e)))?;
        tracing::info!("Database migrations applied");
        Ok(())
    }
}

fn db_error(e: sqlx::Error) -> AppError {
    if let Some(db) = e.as_database_error() {
        if db.is_unique_violation() {
            let message = match db.constraint() {
                Some("users_email_key") => "email already registered",
                Some("users_username_key") => "username already taken",
                Some("users_external_id_key") => "identity already linked to a user",
                Some("trusted_devices_fingerprint_key") => "device fingerprint already registered",
                Some("sessions_session_token_key") => "session token collision",
                Some("oauth_states_pkey") => "state token collision",
                _ => "duplicate record",
            };
            return AppError::Conflict(message.to_string());
        }
    }
    AppError::Database(e.to_string())
}

// ─── Column Encoding ─────────────────────────────────────────

/// Enums are stored as their snake_case serde names.
fn enum_text<T: Serialize>(value: &T) -> Result<String, AppError> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(text)) => Ok(text),
        _ => Err(AppError::Internal(anyhow::anyhow!(
            "enum does not serialize to a string"
        ))),
    }
}

fn enum_from<T: DeserializeOwned>(column: &str, text: String) -> Result<T, AppError> {
    serde_json::from_value(serde_json::Value::String(text))
        .map_err(|e| AppError::Database(format!("invalid {}: {}", column, e)))
}

fn unsigned<T: TryFrom<i64>>(column: &str, value: i64) -> Result<T, AppError> {
    T::try_from(value).map_err(|_| AppError::Database(format!("invalid {}: {}", column, value)))
}

fn signed(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn count(value: i64) -> usize {
    usize::try_from(value).unwrap_or_default()
}

#[derive(sqlx::FromRow)]
struct ConnectionRow {
    id: Uuid,
    user_id: Uuid,
    app_id: String,
    provider: String,
    status: String,
    access_token: Option<String>,
    refresh_token: Option<String>,
    scope: Option<String>,
    token_expires_at: Option<DateTime<Utc>>,
    account_email: Option<String>,
    connected_at: Option<DateTime<Utc>>,
    last_health_check: Option<DateTime<Utc>>,
    health_status: String,
    response_time_ms: Option<i64>,
    error_count: i64,
    uptime_percent: f64,
    usage_count: i64,
    data_transferred: i64,
    last_used_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

impl TryFrom<ConnectionRow> for AppConnection {
    type Error = AppError;

    fn try_from(row: ConnectionRow) -> Result<Self, AppError> {
        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            app_id: row.app_id,
            provider: row.provider,
            status: enum_from("status", row.status)?,
            access_token: row.access_token,
            refresh_token: row.refresh_token,
            scope: row.scope,
            token_expires_at: row.token_expires_at,
            account_email: row.account_email,
            connected_at: row.connected_at,
            last_health_check: row.last_health_check,
            health_status: enum_from("health_status", row.health_status)?,
            response_time_ms: row
                .response_time_ms
                .map(|ms| unsigned("response_time_ms", ms))
                .transpose()?,
            error_count: unsigned("error_count", row.error_count)?,
            uptime_percent: row.uptime_percent,
            usage_count: unsigned("usage_count", row.usage_count)?,
            data_transferred: unsigned("data_transferred", row.data_transferred)?,
            last_used_at: row.last_used_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            deleted_at: row.deleted_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct HealthMetricRow {
    id: Uuid,
    connection_id: Uuid,
    checked_at: DateTime<Utc>,
    success: bool,
    response_time_ms: i64,
    error: Option<String>,
}

impl TryFrom<HealthMetricRow> for ConnectionHealthMetric {
    type Error = AppError;

    fn try_from(row: HealthMetricRow) -> Result<Self, AppError> {
        Ok(Self {
            id: row.id,
            connection_id: row.connection_id,
            checked_at: row.checked_at,
            success: row.success,
            response_time_ms: unsigned("response_time_ms", row.response_time_ms)?,
            error: row.error,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SecurityEventRow {
    id: Uuid,
    user_id: Uuid,
    connection_id: Option<Uuid>,
    event_type: String,
    severity: String,
    risk_score: f64,
    ip_address: Option<String>,
    user_agent: Option<String>,
    details: Option<String>,
    resolved: bool,
    resolved_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

impl TryFrom<SecurityEventRow> for SecurityEvent {
    type Error = AppError;

    fn try_from(row: SecurityEventRow) -> Result<Self, AppError> {
        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            connection_id: row.connection_id,
            event_type: enum_from("event_type", row.event_type)?,
            severity: enum_from("severity", row.severity)?,
            risk_score: row.risk_score,
            ip_address: row.ip_address,
            user_agent: row.user_agent,
            details: row.details,
            resolved: row.resolved,
            resolved_at: row.resolved_at,
            created_at: row.created_at,
            deleted_at: row.deleted_at,
        })
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>, AppError>
where
    T: TryFrom<R, Error = AppError>,
{
    rows.into_iter().map(T::try_from).collect()
}

// ─── Connection Rows ─────────────────────────────────────────

/// Write every column of `conn` back to the row currently keyed by `row_id`.
async fn write_connection(
    db: &mut PgConnection,
    row_id: Uuid,
    conn: &AppConnection,
) -> Result<(), AppError> {
    sqlx::query(
        "UPDATE app_connections SET \
            id = $2, provider = $3, status = $4, access_token = $5, refresh_token = $6, \
            scope = $7, token_expires_at = $8, account_email = $9, connected_at = $10, \
            last_health_check = $11, health_status = $12, response_time_ms = $13, \
            error_count = $14, uptime_percent = $15, usage_count = $16, \
            data_transferred = $17, last_used_at = $18, created_at = $19, \
            updated_at = $20, deleted_at = $21 \
         WHERE id = $1",
    )
    .bind(row_id)
    .bind(conn.id)
    .bind(&conn.provider)
    .bind(enum_text(&conn.status)?)
    .bind(&conn.access_token)
    .bind(&conn.refresh_token)
    .bind(&conn.scope)
    .bind(conn.token_expires_at)
    .bind(&conn.account_email)
    .bind(conn.connected_at)
    .bind(conn.last_health_check)
    .bind(enum_text(&conn.health_status)?)
    .bind(conn.response_time_ms.map(signed))
    .bind(i64::from(conn.error_count))
    .bind(conn.uptime_percent)
    .bind(signed(conn.usage_count))
    .bind(signed(conn.data_transferred))
    .bind(conn.last_used_at)
    .bind(conn.created_at)
    .bind(conn.updated_at)
    .bind(conn.deleted_at)
    .execute(db)
    .await
    .map_err(db_error)?;
    Ok(())
}

#[async_trait]
impl CredentialStore for PostgresStore {
    // ─── Users ───────────────────────────────────────────────────

    async fn insert_user(&self, user: User) -> Result<User, AppError> {
        sqlx::query_as::<_, User>(
            "INSERT INTO users \
                (id, external_id, email, username, email_verified, is_active, \
                 created_at, updated_at, last_login_at, deleted_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             RETURNING *",
        )
        .bind(user.id)
        .bind(&user.external_id)
        .bind(&user.email)
        .bind(&user.username)
        .bind(user.email_verified)
        .bind(user.is_active)
        .bind(user.created_at)
        .bind(user.updated_at)
        .bind(user.last_login_at)
        .bind(user.deleted_at)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)
    }

    async fn get_user(&self, id: Uuid) -> Result<Option<User>, AppError> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1 AND deleted_at IS NULL")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)
    }

    async fn get_user_by_external_id(&self, external_id: &str) -> Result<Option<User>, AppError> {
        sqlx::query_as::<_, User>(
            "SELECT * FROM users WHERE external_id = $1 AND deleted_at IS NULL",
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, AppError> {
        sqlx::query_as::<_, User>(
            "SELECT * FROM users WHERE LOWER(email) = LOWER($1) AND deleted_at IS NULL",
        )
        .bind(email.trim())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)
    }

    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>, AppError> {
        sqlx::query_as::<_, User>(
            "SELECT * FROM users WHERE LOWER(username) = LOWER($1) AND deleted_at IS NULL",
        )
        .bind(username.trim())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)
    }

    async fn update_user(&self, user: &User) -> Result<(), AppError> {
        let result = sqlx::query(
            "UPDATE users SET email_verified = $2, is_active = $3, last_login_at = $4, \
                updated_at = $5 \
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(user.id)
        .bind(user.email_verified)
        .bind(user.is_active)
        .bind(user.last_login_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("User {}", user.id)));
        }
        Ok(())
    }

    async fn soft_delete_user(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE users SET deleted_at = $2, is_active = FALSE \
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(result.rows_affected() == 1)
    }

    // ─── Sessions ────────────────────────────────────────────────

    async fn insert_session(&self, session: Session) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO sessions \
                (id, user_id, session_token, ip_address, user_agent, created_at, \
                 last_seen_at, expires_at, is_active) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(session.id)
        .bind(session.user_id)
        .bind(&session.session_token)
        .bind(&session.ip_address)
        .bind(&session.user_agent)
        .bind(session.created_at)
        .bind(session.last_seen_at)
        .bind(session.expires_at)
        .bind(session.is_active)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn get_session(&self, token: &str) -> Result<Option<Session>, AppError> {
        sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE session_token = $1")
            .bind(token)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)
    }

    async fn get_session_by_id(&self, id: Uuid) -> Result<Option<Session>, AppError> {
        sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)
    }

    async fn extend_session(
        &self,
        token: &str,
        expires_at: DateTime<Utc>,
        seen_at: DateTime<Utc>,
    ) -> Result<Option<Session>, AppError> {
        sqlx::query_as::<_, Session>(
            "UPDATE sessions SET expires_at = $2, last_seen_at = $3 \
             WHERE session_token = $1 RETURNING *",
        )
        .bind(token)
        .bind(expires_at)
        .bind(seen_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)
    }

    async fn deactivate_session(&self, token: &str) -> Result<Option<Session>, AppError> {
        sqlx::query_as::<_, Session>(
            "UPDATE sessions SET is_active = FALSE WHERE session_token = $1 RETURNING *",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)
    }

    async fn deactivate_user_sessions(&self, user_id: Uuid) -> Result<Vec<Uuid>, AppError> {
        sqlx::query_scalar::<_, Uuid>(
            "UPDATE sessions SET is_active = FALSE \
             WHERE user_id = $1 AND is_active RETURNING id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)
    }

    async fn list_user_sessions(&self, user_id: Uuid) -> Result<Vec<Session>, AppError> {
        sqlx::query_as::<_, Session>(
            "SELECT * FROM sessions WHERE user_id = $1 ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)
    }

    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<usize, AppError> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at < $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(result.rows_affected() as usize)
    }

    // ─── Refresh Tokens ──────────────────────────────────────────

    async fn insert_refresh_token(&self, record: RefreshTokenRecord) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO refresh_tokens (jti, user_id, session_id, issued_at, expires_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(record.jti)
        .bind(record.user_id)
        .bind(record.session_id)
        .bind(record.issued_at)
        .bind(record.expires_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn take_refresh_token(&self, jti: Uuid) -> Result<Option<RefreshTokenRecord>, AppError> {
        sqlx::query_as::<_, RefreshTokenRecord>(
            "DELETE FROM refresh_tokens WHERE jti = $1 RETURNING *",
        )
        .bind(jti)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)
    }

    async fn delete_session_refresh_tokens(&self, session_id: Uuid) -> Result<usize, AppError> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE session_id = $1")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(result.rows_affected() as usize)
    }

    async fn delete_expired_refresh_tokens(&self, now: DateTime<Utc>) -> Result<usize, AppError> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE expires_at < $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(result.rows_affected() as usize)
    }

    // ─── MFA ─────────────────────────────────────────────────────

    async fn replace_mfa_setup(
        &self,
        setup: MfaSetup,
        codes: Vec<BackupCode>,
    ) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        // Codes of the prior setup go with it.
        sqlx::query("DELETE FROM mfa_setups WHERE user_id = $1")
            .bind(setup.user_id)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

        sqlx::query(
            "INSERT INTO mfa_setups (id, user_id, secret, enabled, created_at, updated_at, deleted_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(setup.id)
        .bind(setup.user_id)
        .bind(&setup.secret)
        .bind(setup.enabled)
        .bind(setup.created_at)
        .bind(setup.updated_at)
        .bind(setup.deleted_at)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        for code in &codes {
            insert_backup_code(&mut tx, setup.id, code).await?;
        }

        tx.commit().await.map_err(db_error)
    }

    async fn get_mfa_setup(&self, user_id: Uuid) -> Result<Option<MfaSetup>, AppError> {
        sqlx::query_as::<_, MfaSetup>(
            "SELECT * FROM mfa_setups WHERE user_id = $1 AND deleted_at IS NULL",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)
    }

    async fn set_mfa_enabled(
        &self,
        user_id: Uuid,
        enabled: bool,
    ) -> Result<Option<MfaSetup>, AppError> {
        sqlx::query_as::<_, MfaSetup>(
            "UPDATE mfa_setups SET enabled = $2, updated_at = $3 \
             WHERE user_id = $1 AND deleted_at IS NULL RETURNING *",
        )
        .bind(user_id)
        .bind(enabled)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)
    }

    async fn list_backup_codes(&self, user_id: Uuid) -> Result<Vec<BackupCode>, AppError> {
        sqlx::query_as::<_, BackupCode>(
            "SELECT c.* FROM backup_codes c \
             JOIN mfa_setups s ON s.id = c.setup_id \
             WHERE s.user_id = $1 AND s.deleted_at IS NULL AND c.deleted_at IS NULL \
             ORDER BY c.created_at",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)
    }

    async fn consume_backup_code(
        &self,
        user_id: Uuid,
        code_hash: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        // A concurrent consumer re-checks `used` after the first commits and
        // matches nothing.
        let result = sqlx::query(
            "UPDATE backup_codes SET used = TRUE, used_at = $3 \
             WHERE code_hash = $2 AND used = FALSE AND deleted_at IS NULL \
               AND setup_id = (SELECT id FROM mfa_setups \
                               WHERE user_id = $1 AND deleted_at IS NULL)",
        )
        .bind(user_id)
        .bind(code_hash)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(result.rows_affected() == 1)
    }

    async fn replace_backup_codes(
        &self,
        user_id: Uuid,
        codes: Vec<BackupCode>,
    ) -> Result<bool, AppError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let setup_id = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM mfa_setups WHERE user_id = $1 AND deleted_at IS NULL FOR UPDATE",
        )
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error)?;
        let Some(setup_id) = setup_id else {
            return Ok(false);
        };

        let now = Utc::now();
        sqlx::query(
            "UPDATE backup_codes SET deleted_at = $2 WHERE setup_id = $1 AND deleted_at IS NULL",
        )
        .bind(setup_id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        for code in &codes {
            insert_backup_code(&mut tx, setup_id, code).await?;
        }

        sqlx::query("UPDATE mfa_setups SET updated_at = $2 WHERE id = $1")
            .bind(setup_id)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;
        Ok(true)
    }

    // ─── OAuth State ─────────────────────────────────────────────

    async fn insert_oauth_state(&self, state: OAuthState) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO oauth_states (state, user_id, app_id, redirect_uri, created_at, expires_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&state.state)
        .bind(state.user_id)
        .bind(&state.app_id)
        .bind(&state.redirect_uri)
        .bind(state.created_at)
        .bind(state.expires_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn take_oauth_state(&self, state: &str) -> Result<Option<OAuthState>, AppError> {
        sqlx::query_as::<_, OAuthState>("DELETE FROM oauth_states WHERE state = $1 RETURNING *")
            .bind(state)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)
    }

    async fn delete_expired_oauth_states(&self, now: DateTime<Utc>) -> Result<usize, AppError> {
        let result = sqlx::query("DELETE FROM oauth_states WHERE expires_at < $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(result.rows_affected() as usize)
    }

    // ─── Connections ─────────────────────────────────────────────

    async fn get_connection(&self, id: Uuid) -> Result<Option<AppConnection>, AppError> {
        sqlx::query_as::<_, ConnectionRow>(
            "SELECT * FROM app_connections WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?
        .map(AppConnection::try_from)
        .transpose()
    }

    async fn find_connection(
        &self,
        user_id: Uuid,
        app_id: &str,
    ) -> Result<Option<AppConnection>, AppError> {
        sqlx::query_as::<_, ConnectionRow>(
            "SELECT * FROM app_connections \
             WHERE user_id = $1 AND app_id = $2 AND deleted_at IS NULL",
        )
        .bind(user_id)
        .bind(app_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?
        .map(AppConnection::try_from)
        .transpose()
    }

    async fn list_connections(&self, user_id: Uuid) -> Result<Vec<AppConnection>, AppError> {
        let rows = sqlx::query_as::<_, ConnectionRow>(
            "SELECT * FROM app_connections \
             WHERE user_id = $1 AND deleted_at IS NULL ORDER BY app_id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;
        convert_all(rows)
    }

    async fn count_connections(&self, user_id: Uuid) -> Result<usize, AppError> {
        let n = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM app_connections \
             WHERE user_id = $1 AND deleted_at IS NULL AND status <> 'revoked'",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(count(n))
    }

    async fn upsert_connection(
        &self,
        user_id: Uuid,
        app_id: &str,
        provider: &str,
        mutate: ConnectionMutation,
    ) -> Result<AppConnection, AppError> {
        let fresh = AppConnection::new(user_id, app_id, provider);
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        // Either inserts the fresh row or takes the row lock on the existing
        // one; both leave the row locked until commit.
        let row = sqlx::query_as::<_, ConnectionRow>(
            "INSERT INTO app_connections \
                (id, user_id, app_id, provider, status, health_status, error_count, \
                 uptime_percent, usage_count, data_transferred, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, 0, $7, 0, 0, $8, $8) \
             ON CONFLICT (user_id, app_id) \
                DO UPDATE SET updated_at = app_connections.updated_at \
             RETURNING *",
        )
        .bind(fresh.id)
        .bind(user_id)
        .bind(app_id)
        .bind(provider)
        .bind(enum_text(&fresh.status)?)
        .bind(enum_text(&fresh.health_status)?)
        .bind(fresh.uptime_percent)
        .bind(fresh.created_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error)?;

        let row_id = row.id;
        let mut conn = AppConnection::try_from(row)?;
        if conn.deleted_at.is_some() {
            conn = fresh;
        }
        mutate(&mut conn);
        conn.updated_at = Utc::now();

        write_connection(&mut tx, row_id, &conn).await?;
        tx.commit().await.map_err(db_error)?;
        Ok(conn)
    }

    async fn update_connection(
        &self,
        id: Uuid,
        mutate: ConnectionMutation,
    ) -> Result<Option<AppConnection>, AppError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let row = sqlx::query_as::<_, ConnectionRow>(
            "SELECT * FROM app_connections WHERE id = $1 AND deleted_at IS NULL FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error)?;
        let Some(row) = row else {
            return Ok(None);
        };

        let mut conn = AppConnection::try_from(row)?;
        mutate(&mut conn);
        conn.updated_at = Utc::now();

        write_connection(&mut tx, id, &conn).await?;
        tx.commit().await.map_err(db_error)?;
        Ok(Some(conn))
    }

    async fn append_health_metric(&self, metric: ConnectionHealthMetric) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO connection_health_metrics \
                (id, connection_id, checked_at, success, response_time_ms, error) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(metric.id)
        .bind(metric.connection_id)
        .bind(metric.checked_at)
        .bind(metric.success)
        .bind(signed(metric.response_time_ms))
        .bind(&metric.error)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn recent_health_metrics(
        &self,
        connection_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ConnectionHealthMetric>, AppError> {
        let rows = sqlx::query_as::<_, HealthMetricRow>(
            "SELECT * FROM connection_health_metrics \
             WHERE connection_id = $1 ORDER BY checked_at DESC LIMIT $2",
        )
        .bind(connection_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;
        convert_all(rows)
    }

    // ─── Security Events ─────────────────────────────────────────

    async fn insert_security_event(&self, event: SecurityEvent) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO security_events \
                (id, user_id, connection_id, event_type, severity, risk_score, ip_address, \
                 user_agent, details, resolved, resolved_at, created_at, deleted_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(event.id)
        .bind(event.user_id)
        .bind(event.connection_id)
        .bind(enum_text(&event.event_type)?)
        .bind(enum_text(&event.severity)?)
        .bind(event.risk_score)
        .bind(&event.ip_address)
        .bind(&event.user_agent)
        .bind(&event.details)
        .bind(event.resolved)
        .bind(event.resolved_at)
        .bind(event.created_at)
        .bind(event.deleted_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn get_security_event(&self, id: Uuid) -> Result<Option<SecurityEvent>, AppError> {
        sqlx::query_as::<_, SecurityEventRow>(
            "SELECT * FROM security_events WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?
        .map(SecurityEvent::try_from)
        .transpose()
    }

    async fn resolve_security_event(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<SecurityEvent>, AppError> {
        sqlx::query_as::<_, SecurityEventRow>(
            "UPDATE security_events SET resolved = TRUE, resolved_at = COALESCE(resolved_at, $2) \
             WHERE id = $1 AND deleted_at IS NULL RETURNING *",
        )
        .bind(id)
        .bind(at)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?
        .map(SecurityEvent::try_from)
        .transpose()
    }

    async fn list_security_events(&self, user_id: Uuid) -> Result<Vec<SecurityEvent>, AppError> {
        let rows = sqlx::query_as::<_, SecurityEventRow>(
            "SELECT * FROM security_events \
             WHERE user_id = $1 AND deleted_at IS NULL ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;
        convert_all(rows)
    }

    async fn count_security_events_since(
        &self,
        user_id: Uuid,
        event_type: SecurityEventType,
        since: DateTime<Utc>,
    ) -> Result<usize, AppError> {
        let n = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM security_events \
             WHERE user_id = $1 AND event_type = $2 AND created_at >= $3 AND deleted_at IS NULL",
        )
        .bind(user_id)
        .bind(enum_text(&event_type)?)
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(count(n))
    }

    // ─── Devices ─────────────────────────────────────────────────

    async fn get_device_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<TrustedDevice>, AppError> {
        sqlx::query_as::<_, TrustedDevice>(
            "SELECT * FROM trusted_devices WHERE fingerprint = $1 AND deleted_at IS NULL",
        )
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)
    }

    async fn insert_device(&self, device: TrustedDevice) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO trusted_devices \
                (id, user_id, fingerprint, trusted, last_ip, user_agent, first_seen, \
                 last_seen, deleted_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(device.id)
        .bind(device.user_id)
        .bind(&device.fingerprint)
        .bind(device.trusted)
        .bind(&device.last_ip)
        .bind(&device.user_agent)
        .bind(device.first_seen)
        .bind(device.last_seen)
        .bind(device.deleted_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn touch_device(
        &self,
        id: Uuid,
        ip_address: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<Option<TrustedDevice>, AppError> {
        sqlx::query_as::<_, TrustedDevice>(
            "UPDATE trusted_devices SET last_seen = $3, last_ip = COALESCE($2, last_ip) \
             WHERE id = $1 AND deleted_at IS NULL RETURNING *",
        )
        .bind(id)
        .bind(ip_address)
        .bind(at)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)
    }

    async fn set_device_trusted(
        &self,
        user_id: Uuid,
        id: Uuid,
        trusted: bool,
    ) -> Result<Option<TrustedDevice>, AppError> {
        sqlx::query_as::<_, TrustedDevice>(
            "UPDATE trusted_devices SET trusted = $3 \
             WHERE id = $1 AND user_id = $2 AND deleted_at IS NULL RETURNING *",
        )
        .bind(id)
        .bind(user_id)
        .bind(trusted)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)
    }

    async fn list_devices(&self, user_id: Uuid) -> Result<Vec<TrustedDevice>, AppError> {
        sqlx::query_as::<_, TrustedDevice>(
            "SELECT * FROM trusted_devices \
             WHERE user_id = $1 AND deleted_at IS NULL ORDER BY last_seen DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)
    }
}

async fn insert_backup_code(
    db: &mut PgConnection,
    setup_id: Uuid,
    code: &BackupCode,
) -> Result<(), AppError> {
    sqlx::query(
        "INSERT INTO backup_codes (id, setup_id, code_hash, used, used_at, created_at, deleted_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(code.id)
    .bind(setup_id)
    .bind(&code.code_hash)
    .bind(code.used)
    .bind(code.used_at)
    .bind(code.created_at)
    .bind(code.deleted_at)
    .execute(db)
    .await
    .map_err(db_error)?;
    Ok(())
}
