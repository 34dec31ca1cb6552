//! PostgreSQL record store.
//!
//! Inserts use `ON CONFLICT DO NOTHING` so that a uniqueness clash surfaces as
//! [`StoreError::Conflict`] without aborting the surrounding transaction.
//! Expiry is evaluated with the database clock (`NOW()`), which keeps every
//! instance of the service in agreement.

use super::{
    Expiry, NewUser, PasswordReset, PreUser, RecordStore, Session, StoreError, StoreResult,
    StoreTx, SweepReport, User,
};
use anyhow::Context;
use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgPool, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::Instrument;
use uuid::Uuid;

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, PgArguments>;

const USER_COLUMNS: &str =
    "user_id, email_address, password_hash, first_name, last_name, created_time, login_notify";

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}

fn classify(err: sqlx::Error, what: &'static str) -> StoreError {
    if is_unique_violation(&err) {
        StoreError::Conflict(what.to_string())
    } else {
        StoreError::Backend(anyhow::Error::new(err).context(what))
    }
}

fn db_span(operation: &'static str, statement: &str) -> tracing::Span {
    tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

fn user_from_row(row: &PgRow) -> User {
    User {
        user_id: row.get("user_id"),
        email_address: row.get("email_address"),
        password_hash: row.get("password_hash"),
        first_name: row.get("first_name"),
        last_name: row.get("last_name"),
        created_time: row.get("created_time"),
        login_notify: row.get("login_notify"),
    }
}

fn pre_user_from_row(row: &PgRow) -> PreUser {
    PreUser {
        email_address: row.get("email_address"),
        verify_code: row.get("verify_code"),
        created_time: row.get("created_time"),
        failed_attempts: row.get("failed_attempts"),
    }
}

fn session_from_row(row: &PgRow) -> Session {
    Session {
        session_id: row.get("session_id"),
        client_token: row.get("client_token"),
        user_id: row.get("user_id"),
        created_time: row.get("created_time"),
    }
}

fn reset_from_row(row: &PgRow) -> PasswordReset {
    PasswordReset {
        reset_code: row.get("reset_code"),
        user_id: row.get("user_id"),
        created_time: row.get("created_time"),
    }
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    expiry: Expiry,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool, expiry: Expiry) -> Self {
        Self { pool, expiry }
    }

    /// Apply the bundled schema migrations.
    ///
    /// # Errors
    /// Returns an error if a migration fails to apply.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to apply database migrations")
    }

    async fn sweep_table(
        tx: &mut Transaction<'static, Postgres>,
        query: &'static str,
        ttl_seconds: i64,
    ) -> StoreResult<u64> {
        let result = sqlx::query(query)
            .bind(ttl_seconds)
            .execute(&mut **tx)
            .instrument(db_span("DELETE", query))
            .await
            .map_err(|err| classify(err, "failed to sweep expired rows"))?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl RecordStore for PgStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>> {
        let tx = self
            .pool
            .begin()
            .await
            .context("failed to begin transaction")?;
        Ok(Box::new(PgTx {
            tx,
            expiry: self.expiry,
        }))
    }

    async fn sweep_expired(&self) -> StoreResult<SweepReport> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin sweep transaction")?;

        let pre_users = Self::sweep_table(
            &mut tx,
            "DELETE FROM pre_users WHERE created_time <= NOW() - ($1 * INTERVAL '1 second')",
            self.expiry.pre_user_ttl_seconds(),
        )
        .await?;
        let sessions = Self::sweep_table(
            &mut tx,
            "DELETE FROM sessions WHERE created_time <= NOW() - ($1 * INTERVAL '1 second')",
            self.expiry.session_ttl_seconds(),
        )
        .await?;
        let password_resets = Self::sweep_table(
            &mut tx,
            "DELETE FROM password_resets WHERE created_time <= NOW() - ($1 * INTERVAL '1 second')",
            self.expiry.password_reset_ttl_seconds(),
        )
        .await?;

        tx.commit()
            .await
            .context("failed to commit sweep transaction")?;

        Ok(SweepReport {
            pre_users,
            sessions,
            password_resets,
        })
    }
}

struct PgTx {
    tx: Transaction<'static, Postgres>,
    expiry: Expiry,
}

impl PgTx {
    async fn fetch_user<'q>(
        &mut self,
        query: &'q str,
        bind: impl FnOnce(PgQuery<'q>) -> PgQuery<'q> + Send,
        operation: &'static str,
        what: &'static str,
    ) -> StoreResult<Option<User>> {
        let row = bind(sqlx::query(query))
            .fetch_optional(&mut *self.tx)
            .instrument(db_span(operation, query))
            .await
            .map_err(|err| classify(err, what))?;
        Ok(row.as_ref().map(user_from_row))
    }

    async fn execute_delete<'q>(
        &mut self,
        query: &'q str,
        bind: impl FnOnce(PgQuery<'q>) -> PgQuery<'q> + Send,
        what: &'static str,
    ) -> StoreResult<()> {
        let result = bind(sqlx::query(query))
            .execute(&mut *self.tx)
            .instrument(db_span("DELETE", query))
            .await
            .map_err(|err| classify(err, what))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(what.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl StoreTx for PgTx {
    async fn create_user(&mut self, user: NewUser) -> StoreResult<User> {
        let query = format!(
            r"
            INSERT INTO users (user_id, email_address, password_hash, first_name, last_name)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT DO NOTHING
            RETURNING {USER_COLUMNS}
            "
        );
        let created = self
            .fetch_user(
                &query,
                |q| {
                    q.bind(user.user_id)
                        .bind(&user.email_address)
                        .bind(&user.password_hash)
                        .bind(&user.first_name)
                        .bind(&user.last_name)
                },
                "INSERT",
                "failed to insert user",
            )
            .await?;
        created.ok_or_else(|| StoreError::Conflict(format!("user {}", user.email_address)))
    }

    async fn find_user_by_id(&mut self, user_id: Uuid) -> StoreResult<Option<User>> {
        let query = format!("SELECT {USER_COLUMNS} FROM users WHERE user_id = $1");
        self.fetch_user(&query, |q| q.bind(user_id), "SELECT", "failed to lookup user")
            .await
    }

    async fn find_user_by_email(&mut self, email_address: &str) -> StoreResult<Option<User>> {
        let query = format!("SELECT {USER_COLUMNS} FROM users WHERE email_address = $1");
        self.fetch_user(
            &query,
            |q| q.bind(email_address),
            "SELECT",
            "failed to lookup user by email",
        )
        .await
    }

    async fn update_user_name(
        &mut self,
        user_id: Uuid,
        first_name: &str,
        last_name: &str,
    ) -> StoreResult<User> {
        let query = format!(
            "UPDATE users SET first_name = $2, last_name = $3 WHERE user_id = $1 RETURNING {USER_COLUMNS}"
        );
        self.fetch_user(
            &query,
            |q| q.bind(user_id).bind(first_name).bind(last_name),
            "UPDATE",
            "failed to update user name",
        )
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("user {user_id}")))
    }

    async fn update_user_password(
        &mut self,
        user_id: Uuid,
        password_hash: &str,
    ) -> StoreResult<User> {
        let query = format!(
            "UPDATE users SET password_hash = $2 WHERE user_id = $1 RETURNING {USER_COLUMNS}"
        );
        self.fetch_user(
            &query,
            |q| q.bind(user_id).bind(password_hash),
            "UPDATE",
            "failed to update password hash",
        )
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("user {user_id}")))
    }

    async fn update_user_login_notify(
        &mut self,
        user_id: Uuid,
        enabled: bool,
    ) -> StoreResult<User> {
        let query = format!(
            "UPDATE users SET login_notify = $2 WHERE user_id = $1 RETURNING {USER_COLUMNS}"
        );
        self.fetch_user(
            &query,
            |q| q.bind(user_id).bind(enabled),
            "UPDATE",
            "failed to update login notify",
        )
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("user {user_id}")))
    }

    async fn delete_user(&mut self, user_id: Uuid) -> StoreResult<()> {
        self.execute_delete(
            "DELETE FROM users WHERE user_id = $1",
            |q| q.bind(user_id),
            "user",
        )
        .await
    }

    async fn create_pre_user(
        &mut self,
        email_address: &str,
        verify_code: &str,
    ) -> StoreResult<PreUser> {
        let ttl = self.expiry.pre_user_ttl_seconds();

        // An expired row still holds the unique key until it is swept.
        let query = r"
            DELETE FROM pre_users
            WHERE email_address = $1
              AND created_time <= NOW() - ($2 * INTERVAL '1 second')
        ";
        sqlx::query(query)
            .bind(email_address)
            .bind(ttl)
            .execute(&mut *self.tx)
            .instrument(db_span("DELETE", query))
            .await
            .map_err(|err| classify(err, "failed to supersede expired pre-user"))?;

        let query = r"
            INSERT INTO pre_users (email_address, verify_code, failed_attempts)
            VALUES ($1, $2, 0)
            ON CONFLICT DO NOTHING
            RETURNING email_address, verify_code, created_time, failed_attempts
        ";
        let row = sqlx::query(query)
            .bind(email_address)
            .bind(verify_code)
            .fetch_optional(&mut *self.tx)
            .instrument(db_span("INSERT", query))
            .await
            .map_err(|err| classify(err, "failed to insert pre-user"))?;

        row.as_ref()
            .map(pre_user_from_row)
            .ok_or_else(|| StoreError::Conflict(format!("pre-user {email_address}")))
    }

    async fn find_pre_user(&mut self, email_address: &str) -> StoreResult<Option<PreUser>> {
        let query = r"
            SELECT email_address, verify_code, created_time, failed_attempts
            FROM pre_users
            WHERE email_address = $1
              AND created_time > NOW() - ($2 * INTERVAL '1 second')
        ";
        let row = sqlx::query(query)
            .bind(email_address)
            .bind(self.expiry.pre_user_ttl_seconds())
            .fetch_optional(&mut *self.tx)
            .instrument(db_span("SELECT", query))
            .await
            .map_err(|err| classify(err, "failed to lookup pre-user"))?;
        Ok(row.as_ref().map(pre_user_from_row))
    }

    async fn update_pre_user_code(
        &mut self,
        email_address: &str,
        verify_code: &str,
    ) -> StoreResult<PreUser> {
        let query = r"
            UPDATE pre_users SET verify_code = $2
            WHERE email_address = $1
              AND created_time > NOW() - ($3 * INTERVAL '1 second')
            RETURNING email_address, verify_code, created_time, failed_attempts
        ";
        let row = sqlx::query(query)
            .bind(email_address)
            .bind(verify_code)
            .bind(self.expiry.pre_user_ttl_seconds())
            .fetch_optional(&mut *self.tx)
            .instrument(db_span("UPDATE", query))
            .await
            .map_err(|err| classify(err, "failed to rotate verify code"))?;
        row.as_ref()
            .map(pre_user_from_row)
            .ok_or_else(|| StoreError::NotFound(format!("pre-user {email_address}")))
    }

    async fn increment_failed_attempts(
        &mut self,
        email_address: &str,
        by: i32,
    ) -> StoreResult<PreUser> {
        let query = r"
            UPDATE pre_users SET failed_attempts = failed_attempts + $2
            WHERE email_address = $1
              AND created_time > NOW() - ($3 * INTERVAL '1 second')
            RETURNING email_address, verify_code, created_time, failed_attempts
        ";
        let row = sqlx::query(query)
            .bind(email_address)
            .bind(by)
            .bind(self.expiry.pre_user_ttl_seconds())
            .fetch_optional(&mut *self.tx)
            .instrument(db_span("UPDATE", query))
            .await
            .map_err(|err| classify(err, "failed to increment failed attempts"))?;
        row.as_ref()
            .map(pre_user_from_row)
            .ok_or_else(|| StoreError::NotFound(format!("pre-user {email_address}")))
    }

    async fn delete_pre_user(&mut self, email_address: &str) -> StoreResult<()> {
        let ttl = self.expiry.pre_user_ttl_seconds();
        self.execute_delete(
            r"
            DELETE FROM pre_users
            WHERE email_address = $1
              AND created_time > NOW() - ($2 * INTERVAL '1 second')
            ",
            |q| q.bind(email_address).bind(ttl),
            "pre-user",
        )
        .await
    }

    async fn create_session(
        &mut self,
        session_id: Uuid,
        client_token: Uuid,
        user_id: Uuid,
    ) -> StoreResult<Session> {
        let query = r"
            INSERT INTO sessions (session_id, client_token, user_id)
            VALUES ($1, $2, $3)
            ON CONFLICT DO NOTHING
            RETURNING session_id, client_token, user_id, created_time
        ";
        let row = sqlx::query(query)
            .bind(session_id)
            .bind(client_token)
            .bind(user_id)
            .fetch_optional(&mut *self.tx)
            .instrument(db_span("INSERT", query))
            .await
            .map_err(|err| classify(err, "failed to insert session"))?;
        row.as_ref()
            .map(session_from_row)
            .ok_or_else(|| StoreError::Conflict("session".to_string()))
    }

    async fn find_session_by_id(&mut self, session_id: Uuid) -> StoreResult<Option<Session>> {
        let query = r"
            SELECT session_id, client_token, user_id, created_time
            FROM sessions
            WHERE session_id = $1
              AND created_time > NOW() - ($2 * INTERVAL '1 second')
        ";
        let row = sqlx::query(query)
            .bind(session_id)
            .bind(self.expiry.session_ttl_seconds())
            .fetch_optional(&mut *self.tx)
            .instrument(db_span("SELECT", query))
            .await
            .map_err(|err| classify(err, "failed to lookup session"))?;
        Ok(row.as_ref().map(session_from_row))
    }

    async fn find_session_by_token(
        &mut self,
        client_token: Uuid,
    ) -> StoreResult<Option<Session>> {
        let query = r"
            SELECT session_id, client_token, user_id, created_time
            FROM sessions
            WHERE client_token = $1
              AND created_time > NOW() - ($2 * INTERVAL '1 second')
        ";
        let row = sqlx::query(query)
            .bind(client_token)
            .bind(self.expiry.session_ttl_seconds())
            .fetch_optional(&mut *self.tx)
            .instrument(db_span("SELECT", query))
            .await
            .map_err(|err| classify(err, "failed to lookup session by token"))?;
        Ok(row.as_ref().map(session_from_row))
    }

    async fn delete_session_by_id(&mut self, session_id: Uuid) -> StoreResult<()> {
        let ttl = self.expiry.session_ttl_seconds();
        self.execute_delete(
            r"
            DELETE FROM sessions
            WHERE session_id = $1
              AND created_time > NOW() - ($2 * INTERVAL '1 second')
            ",
            |q| q.bind(session_id).bind(ttl),
            "session",
        )
        .await
    }

    async fn delete_session_by_token(&mut self, client_token: Uuid) -> StoreResult<()> {
        let ttl = self.expiry.session_ttl_seconds();
        self.execute_delete(
            r"
            DELETE FROM sessions
            WHERE client_token = $1
              AND created_time > NOW() - ($2 * INTERVAL '1 second')
            ",
            |q| q.bind(client_token).bind(ttl),
            "session",
        )
        .await
    }

    async fn create_password_reset(
        &mut self,
        reset_code: Uuid,
        user_id: Uuid,
    ) -> StoreResult<PasswordReset> {
        let ttl = self.expiry.password_reset_ttl_seconds();

        let query = r"
            DELETE FROM password_resets
            WHERE user_id = $1
              AND created_time <= NOW() - ($2 * INTERVAL '1 second')
        ";
        sqlx::query(query)
            .bind(user_id)
            .bind(ttl)
            .execute(&mut *self.tx)
            .instrument(db_span("DELETE", query))
            .await
            .map_err(|err| classify(err, "failed to supersede expired password reset"))?;

        let query = r"
            INSERT INTO password_resets (reset_code, user_id)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            RETURNING reset_code, user_id, created_time
        ";
        let row = sqlx::query(query)
            .bind(reset_code)
            .bind(user_id)
            .fetch_optional(&mut *self.tx)
            .instrument(db_span("INSERT", query))
            .await
            .map_err(|err| classify(err, "failed to insert password reset"))?;
        row.as_ref()
            .map(reset_from_row)
            .ok_or_else(|| StoreError::Conflict(format!("password reset for user {user_id}")))
    }

    async fn find_password_reset_by_code(
        &mut self,
        reset_code: Uuid,
    ) -> StoreResult<Option<PasswordReset>> {
        let query = r"
            SELECT reset_code, user_id, created_time
            FROM password_resets
            WHERE reset_code = $1
              AND created_time > NOW() - ($2 * INTERVAL '1 second')
        ";
        let row = sqlx::query(query)
            .bind(reset_code)
            .bind(self.expiry.password_reset_ttl_seconds())
            .fetch_optional(&mut *self.tx)
            .instrument(db_span("SELECT", query))
            .await
            .map_err(|err| classify(err, "failed to lookup password reset"))?;
        Ok(row.as_ref().map(reset_from_row))
    }

    async fn find_password_reset_by_user(
        &mut self,
        user_id: Uuid,
    ) -> StoreResult<Option<PasswordReset>> {
        let query = r"
            SELECT reset_code, user_id, created_time
            FROM password_resets
            WHERE user_id = $1
              AND created_time > NOW() - ($2 * INTERVAL '1 second')
        ";
        let row = sqlx::query(query)
            .bind(user_id)
            .bind(self.expiry.password_reset_ttl_seconds())
            .fetch_optional(&mut *self.tx)
            .instrument(db_span("SELECT", query))
            .await
            .map_err(|err| classify(err, "failed to lookup password reset by user"))?;
        Ok(row.as_ref().map(reset_from_row))
    }

    async fn delete_password_reset(&mut self, reset_code: Uuid) -> StoreResult<()> {
        let ttl = self.expiry.password_reset_ttl_seconds();
        self.execute_delete(
            r"
            DELETE FROM password_resets
            WHERE reset_code = $1
              AND created_time > NOW() - ($2 * INTERVAL '1 second')
            ",
            |q| q.bind(reset_code).bind(ttl),
            "password reset",
        )
        .await
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx.commit().await.context("failed to commit transaction")?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.tx
            .rollback()
            .await
            .context("failed to rollback transaction")?;
        Ok(())
    }
}
