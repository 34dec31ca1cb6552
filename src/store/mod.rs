//! Record storage for identities, pending registrations, sessions and reset grants.
//!
//! The engine never talks to a database directly. Every operation opens a
//! [`StoreTx`] through a [`RecordStore`], works against it, and then commits or
//! rolls back. Two backends are provided:
//!
//! - [`postgres::PgStore`]: the production backend, built on `sqlx`.
//! - [`memory::MemoryStore`]: an in-process backend for tests and local runs.
//!
//! ### Expiry
//!
//! `PreUser`, `Session` and `PasswordReset` rows are bounded by a TTL taken from
//! [`Expiry`]. A row is live while `created_time + ttl > now`. Finders, updates
//! and deletes only ever see live rows; expired rows linger until
//! [`RecordStore::sweep_expired`] removes them or a new row for the same key
//! supersedes them.

pub mod memory;
pub mod postgres;
mod records;

pub use records::{NewUser, PasswordReset, PreUser, Session, User};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write.
    #[error("unique constraint violated: {0}")]
    Conflict(String),
    /// The targeted row does not exist (or is no longer live).
    #[error("record not found: {0}")]
    NotFound(String),
    /// A re-read did not match the copy the caller holds.
    #[error("{0} deviation from store")]
    Diverged(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// TTLs applied to the ephemeral records, in seconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Expiry {
    pre_user_ttl_seconds: i64,
    session_ttl_seconds: i64,
    password_reset_ttl_seconds: i64,
}

impl Expiry {
    #[must_use]
    pub fn new(
        pre_user_ttl_seconds: i64,
        session_ttl_seconds: i64,
        password_reset_ttl_seconds: i64,
    ) -> Self {
        Self {
            pre_user_ttl_seconds,
            session_ttl_seconds,
            password_reset_ttl_seconds,
        }
    }

    #[must_use]
    pub fn pre_user_ttl_seconds(&self) -> i64 {
        self.pre_user_ttl_seconds
    }

    #[must_use]
    pub fn session_ttl_seconds(&self) -> i64 {
        self.session_ttl_seconds
    }

    #[must_use]
    pub fn password_reset_ttl_seconds(&self) -> i64 {
        self.password_reset_ttl_seconds
    }

    /// Whether a row created at `created` with the given TTL is still live at `now`.
    #[must_use]
    pub fn is_live(created: DateTime<Utc>, ttl_seconds: i64, now: DateTime<Utc>) -> bool {
        created + TimeDelta::seconds(ttl_seconds) > now
    }
}

/// Row counts removed by one sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub pre_users: u64,
    pub sessions: u64,
    pub password_resets: u64,
}

impl SweepReport {
    #[must_use]
    pub fn total(&self) -> u64 {
        self.pre_users + self.sessions + self.password_resets
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Open a transaction. Dropping it without `commit` discards its writes.
    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>>;

    /// Delete every expired `PreUser`, `Session` and `PasswordReset` row.
    /// Users are never touched.
    async fn sweep_expired(&self) -> StoreResult<SweepReport>;
}

/// One unit of work against the store.
///
/// `create_*` returns [`StoreError::Conflict`] on a uniqueness violation.
/// `update_*` and `delete_*` return [`StoreError::NotFound`] when the row is absent.
#[async_trait]
pub trait StoreTx: Send {
    async fn create_user(&mut self, user: NewUser) -> StoreResult<User>;
    async fn find_user_by_id(&mut self, user_id: Uuid) -> StoreResult<Option<User>>;
    async fn find_user_by_email(&mut self, email_address: &str) -> StoreResult<Option<User>>;
    async fn update_user_name(
        &mut self,
        user_id: Uuid,
        first_name: &str,
        last_name: &str,
    ) -> StoreResult<User>;
    async fn update_user_password(&mut self, user_id: Uuid, password_hash: &str)
        -> StoreResult<User>;
    async fn update_user_login_notify(&mut self, user_id: Uuid, enabled: bool)
        -> StoreResult<User>;
    /// Deleting a user also deletes its sessions and reset grant.
    async fn delete_user(&mut self, user_id: Uuid) -> StoreResult<()>;

    /// Supersedes an expired row for the same address.
    async fn create_pre_user(&mut self, email_address: &str, verify_code: &str)
        -> StoreResult<PreUser>;
    async fn find_pre_user(&mut self, email_address: &str) -> StoreResult<Option<PreUser>>;
    async fn update_pre_user_code(
        &mut self,
        email_address: &str,
        verify_code: &str,
    ) -> StoreResult<PreUser>;
    /// Atomically add `by` to `failed_attempts`.
    async fn increment_failed_attempts(&mut self, email_address: &str, by: i32)
        -> StoreResult<PreUser>;
    async fn delete_pre_user(&mut self, email_address: &str) -> StoreResult<()>;

    async fn create_session(
        &mut self,
        session_id: Uuid,
        client_token: Uuid,
        user_id: Uuid,
    ) -> StoreResult<Session>;
    async fn find_session_by_id(&mut self, session_id: Uuid) -> StoreResult<Option<Session>>;
    async fn find_session_by_token(&mut self, client_token: Uuid)
        -> StoreResult<Option<Session>>;
    async fn delete_session_by_id(&mut self, session_id: Uuid) -> StoreResult<()>;
    async fn delete_session_by_token(&mut self, client_token: Uuid) -> StoreResult<()>;

    /// Supersedes an expired grant for the same user.
    async fn create_password_reset(
        &mut self,
        reset_code: Uuid,
        user_id: Uuid,
    ) -> StoreResult<PasswordReset>;
    async fn find_password_reset_by_code(
        &mut self,
        reset_code: Uuid,
    ) -> StoreResult<Option<PasswordReset>>;
    async fn find_password_reset_by_user(
        &mut self,
        user_id: Uuid,
    ) -> StoreResult<Option<PasswordReset>>;
    async fn delete_password_reset(&mut self, reset_code: Uuid) -> StoreResult<()>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;
    async fn rollback(self: Box<Self>) -> StoreResult<()>;

    async fn assert_user_consistent(&mut self, user: &User) -> StoreResult<()> {
        match self.find_user_by_id(user.user_id).await? {
            Some(found) if found == *user => Ok(()),
            _ => Err(StoreError::Diverged(format!("user {}", user.user_id))),
        }
    }

    async fn assert_pre_user_consistent(&mut self, pre_user: &PreUser) -> StoreResult<()> {
        match self.find_pre_user(&pre_user.email_address).await? {
            Some(found) if found == *pre_user => Ok(()),
            _ => Err(StoreError::Diverged(format!(
                "pre-user {}",
                pre_user.email_address
            ))),
        }
    }

    async fn assert_session_consistent(&mut self, session: &Session) -> StoreResult<()> {
        match self.find_session_by_id(session.session_id).await? {
            Some(found) if found == *session => Ok(()),
            _ => Err(StoreError::Diverged(format!("session {}", session.session_id))),
        }
    }

    async fn assert_password_reset_consistent(&mut self, reset: &PasswordReset) -> StoreResult<()> {
        match self.find_password_reset_by_code(reset.reset_code).await? {
            Some(found) if found == *reset => Ok(()),
            _ => Err(StoreError::Diverged(format!(
                "password reset for user {}",
                reset.user_id
            ))),
        }
    }
}
