//! In-process record store.
//!
//! Committed state lives behind a mutex. A transaction never holds the lock
//! across an await: it keeps a log of its own writes, and every read rebuilds a
//! view from the latest committed state plus that log (read committed). Commit
//! replays the log against the committed state and publishes the result only if
//! every write still satisfies the constraints.

use super::{
    Expiry, NewUser, PasswordReset, PreUser, RecordStore, Session, StoreError, StoreResult,
    StoreTx, SweepReport, User,
};
use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Clone, Default)]
struct Tables {
    users: HashMap<Uuid, User>,
    pre_users: HashMap<String, PreUser>,
    sessions: HashMap<Uuid, Session>,
    password_resets: HashMap<Uuid, PasswordReset>,
}

#[derive(Clone)]
enum Write {
    InsertUser(User),
    SetUserName {
        user_id: Uuid,
        first_name: String,
        last_name: String,
    },
    SetUserPassword {
        user_id: Uuid,
        password_hash: String,
    },
    SetUserLoginNotify {
        user_id: Uuid,
        enabled: bool,
    },
    DeleteUser(Uuid),
    InsertPreUser(PreUser),
    SetVerifyCode {
        email_address: String,
        verify_code: String,
    },
    AddFailedAttempts {
        email_address: String,
        by: i32,
    },
    DeletePreUser(String),
    InsertSession(Session),
    DeleteSession(Uuid),
    InsertPasswordReset(PasswordReset),
    DeletePasswordReset(Uuid),
}

impl Tables {
    fn live_pre_user(
        &self,
        email_address: &str,
        expiry: &Expiry,
        now: DateTime<Utc>,
    ) -> Option<&PreUser> {
        self.pre_users
            .get(email_address)
            .filter(|p| Expiry::is_live(p.created_time, expiry.pre_user_ttl_seconds(), now))
    }

    fn live_session(
        &self,
        session_id: Uuid,
        expiry: &Expiry,
        now: DateTime<Utc>,
    ) -> Option<&Session> {
        self.sessions
            .get(&session_id)
            .filter(|s| Expiry::is_live(s.created_time, expiry.session_ttl_seconds(), now))
    }

    fn live_reset(
        &self,
        reset_code: Uuid,
        expiry: &Expiry,
        now: DateTime<Utc>,
    ) -> Option<&PasswordReset> {
        self.password_resets
            .get(&reset_code)
            .filter(|r| Expiry::is_live(r.created_time, expiry.password_reset_ttl_seconds(), now))
    }

    fn user_mut(&mut self, user_id: Uuid) -> StoreResult<&mut User> {
        self.users
            .get_mut(&user_id)
            .ok_or_else(|| StoreError::NotFound(format!("user {user_id}")))
    }

    fn apply(&mut self, write: &Write, expiry: &Expiry, now: DateTime<Utc>) -> StoreResult<()> {
        match write {
            Write::InsertUser(user) => {
                if self.users.contains_key(&user.user_id)
                    || self
                        .users
                        .values()
                        .any(|u| u.email_address == user.email_address)
                {
                    return Err(StoreError::Conflict(format!(
                        "user {}",
                        user.email_address
                    )));
                }
                self.users.insert(user.user_id, user.clone());
            }
            Write::SetUserName {
                user_id,
                first_name,
                last_name,
            } => {
                let user = self.user_mut(*user_id)?;
                user.first_name.clone_from(first_name);
                user.last_name.clone_from(last_name);
            }
            Write::SetUserPassword {
                user_id,
                password_hash,
            } => {
                self.user_mut(*user_id)?.password_hash.clone_from(password_hash);
            }
            Write::SetUserLoginNotify { user_id, enabled } => {
                self.user_mut(*user_id)?.login_notify = *enabled;
            }
            Write::DeleteUser(user_id) => {
                if self.users.remove(user_id).is_none() {
                    return Err(StoreError::NotFound(format!("user {user_id}")));
                }
                self.sessions.retain(|_, s| s.user_id != *user_id);
                self.password_resets.retain(|_, r| r.user_id != *user_id);
            }
            Write::InsertPreUser(pre_user) => {
                if self
                    .live_pre_user(&pre_user.email_address, expiry, now)
                    .is_some()
                {
                    return Err(StoreError::Conflict(format!(
                        "pre-user {}",
                        pre_user.email_address
                    )));
                }
                self.pre_users
                    .insert(pre_user.email_address.clone(), pre_user.clone());
            }
            Write::SetVerifyCode {
                email_address,
                verify_code,
            } => {
                self.live_pre_user_mut(email_address, expiry, now)?
                    .verify_code
                    .clone_from(verify_code);
            }
            Write::AddFailedAttempts { email_address, by } => {
                let pre_user = self.live_pre_user_mut(email_address, expiry, now)?;
                pre_user.failed_attempts = pre_user.failed_attempts.saturating_add(*by);
            }
            Write::DeletePreUser(email_address) => {
                self.live_pre_user_mut(email_address, expiry, now)?;
                self.pre_users.remove(email_address);
            }
            Write::InsertSession(session) => {
                if !self.users.contains_key(&session.user_id) {
                    return Err(StoreError::Backend(anyhow!(
                        "session owner {} does not exist",
                        session.user_id
                    )));
                }
                if self.sessions.contains_key(&session.session_id)
                    || self
                        .sessions
                        .values()
                        .any(|s| s.client_token == session.client_token)
                {
                    return Err(StoreError::Conflict("session".to_string()));
                }
                self.sessions.insert(session.session_id, session.clone());
            }
            Write::DeleteSession(session_id) => {
                if self.live_session(*session_id, expiry, now).is_none() {
                    return Err(StoreError::NotFound(format!("session {session_id}")));
                }
                self.sessions.remove(session_id);
            }
            Write::InsertPasswordReset(reset) => {
                if !self.users.contains_key(&reset.user_id) {
                    return Err(StoreError::Backend(anyhow!(
                        "password reset owner {} does not exist",
                        reset.user_id
                    )));
                }
                let prior = self
                    .password_resets
                    .values()
                    .find(|r| r.user_id == reset.user_id)
                    .map(|r| r.reset_code);
                if let Some(prior) = prior {
                    if self.live_reset(prior, expiry, now).is_some() {
                        return Err(StoreError::Conflict(format!(
                            "password reset for user {}",
                            reset.user_id
                        )));
                    }
                    self.password_resets.remove(&prior);
                }
                if self.password_resets.contains_key(&reset.reset_code) {
                    return Err(StoreError::Conflict("password reset code".to_string()));
                }
                self.password_resets.insert(reset.reset_code, reset.clone());
            }
            Write::DeletePasswordReset(reset_code) => {
                if self.live_reset(*reset_code, expiry, now).is_none() {
                    return Err(StoreError::NotFound(format!("password reset {reset_code}")));
                }
                self.password_resets.remove(reset_code);
            }
        }
        Ok(())
    }

    fn live_pre_user_mut(
        &mut self,
        email_address: &str,
        expiry: &Expiry,
        now: DateTime<Utc>,
    ) -> StoreResult<&mut PreUser> {
        self.pre_users
            .get_mut(email_address)
            .filter(|p| Expiry::is_live(p.created_time, expiry.pre_user_ttl_seconds(), now))
            .ok_or_else(|| StoreError::NotFound(format!("pre-user {email_address}")))
    }

    fn sweep(&mut self, expiry: &Expiry, now: DateTime<Utc>) -> SweepReport {
        let before = (
            self.pre_users.len(),
            self.sessions.len(),
            self.password_resets.len(),
        );
        self.pre_users
            .retain(|_, p| Expiry::is_live(p.created_time, expiry.pre_user_ttl_seconds(), now));
        self.sessions
            .retain(|_, s| Expiry::is_live(s.created_time, expiry.session_ttl_seconds(), now));
        self.password_resets.retain(|_, r| {
            Expiry::is_live(r.created_time, expiry.password_reset_ttl_seconds(), now)
        });
        let removed = |before: usize, after: usize| u64::try_from(before - after).unwrap_or(0);
        SweepReport {
            pre_users: removed(before.0, self.pre_users.len()),
            sessions: removed(before.1, self.sessions.len()),
            password_resets: removed(before.2, self.password_resets.len()),
        }
    }
}

fn lock(tables: &Mutex<Tables>) -> StoreResult<MutexGuard<'_, Tables>> {
    tables
        .lock()
        .map_err(|_| StoreError::Backend(anyhow!("memory store lock poisoned")))
}

/// Record store kept entirely in process memory.
#[derive(Clone)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    expiry: Expiry,
}

impl MemoryStore {
    #[must_use]
    pub fn new(expiry: Expiry) -> Self {
        Self {
            tables: Arc::new(Mutex::new(Tables::default())),
            expiry,
        }
    }

    /// Age every stored record by `by`, as if that much time had passed.
    #[cfg(test)]
    pub(crate) fn rewind(&self, by: chrono::TimeDelta) {
        let mut tables = self.tables.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        for user in tables.users.values_mut() {
            user.created_time -= by;
        }
        for pre_user in tables.pre_users.values_mut() {
            pre_user.created_time -= by;
        }
        for session in tables.sessions.values_mut() {
            session.created_time -= by;
        }
        for reset in tables.password_resets.values_mut() {
            reset.created_time -= by;
        }
    }

    /// Physical row counts, expired rows included: (pre_users, sessions, password_resets).
    #[cfg(test)]
    pub(crate) fn row_counts(&self) -> (usize, usize, usize) {
        let tables = self.tables.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        (
            tables.pre_users.len(),
            tables.sessions.len(),
            tables.password_resets.len(),
        )
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>> {
        Ok(Box::new(MemoryTx {
            tables: Arc::clone(&self.tables),
            expiry: self.expiry,
            writes: Vec::new(),
        }))
    }

    async fn sweep_expired(&self) -> StoreResult<SweepReport> {
        let mut tables = lock(&self.tables)?;
        Ok(tables.sweep(&self.expiry, Utc::now()))
    }
}

struct MemoryTx {
    tables: Arc<Mutex<Tables>>,
    expiry: Expiry,
    writes: Vec<Write>,
}

impl MemoryTx {
    fn view(&self) -> StoreResult<Tables> {
        let mut view = lock(&self.tables)?.clone();
        let now = Utc::now();
        for write in &self.writes {
            view.apply(write, &self.expiry, now)?;
        }
        Ok(view)
    }

    /// Apply `write` to a fresh view, keep it in the log, and return the updated view.
    fn record(&mut self, write: Write) -> StoreResult<Tables> {
        let mut view = self.view()?;
        view.apply(&write, &self.expiry, Utc::now())?;
        self.writes.push(write);
        Ok(view)
    }

    fn user_in(view: &Tables, user_id: Uuid) -> StoreResult<User> {
        view.users
            .get(&user_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("user {user_id}")))
    }

    fn pre_user_in(view: &Tables, email_address: &str) -> StoreResult<PreUser> {
        view.pre_users
            .get(email_address)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("pre-user {email_address}")))
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn create_user(&mut self, user: NewUser) -> StoreResult<User> {
        let user = User {
            user_id: user.user_id,
            email_address: user.email_address,
            password_hash: user.password_hash,
            first_name: user.first_name,
            last_name: user.last_name,
            created_time: Utc::now(),
            login_notify: false,
        };
        self.record(Write::InsertUser(user.clone()))?;
        Ok(user)
    }

    async fn find_user_by_id(&mut self, user_id: Uuid) -> StoreResult<Option<User>> {
        Ok(self.view()?.users.get(&user_id).cloned())
    }

    async fn find_user_by_email(&mut self, email_address: &str) -> StoreResult<Option<User>> {
        Ok(self
            .view()?
            .users
            .values()
            .find(|u| u.email_address == email_address)
            .cloned())
    }

    async fn update_user_name(
        &mut self,
        user_id: Uuid,
        first_name: &str,
        last_name: &str,
    ) -> StoreResult<User> {
        let view = self.record(Write::SetUserName {
            user_id,
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
        })?;
        Self::user_in(&view, user_id)
    }

    async fn update_user_password(
        &mut self,
        user_id: Uuid,
        password_hash: &str,
    ) -> StoreResult<User> {
        let view = self.record(Write::SetUserPassword {
            user_id,
            password_hash: password_hash.to_string(),
        })?;
        Self::user_in(&view, user_id)
    }

    async fn update_user_login_notify(
        &mut self,
        user_id: Uuid,
        enabled: bool,
    ) -> StoreResult<User> {
        let view = self.record(Write::SetUserLoginNotify { user_id, enabled })?;
        Self::user_in(&view, user_id)
    }

    async fn delete_user(&mut self, user_id: Uuid) -> StoreResult<()> {
        self.record(Write::DeleteUser(user_id))?;
        Ok(())
    }

    async fn create_pre_user(
        &mut self,
        email_address: &str,
        verify_code: &str,
    ) -> StoreResult<PreUser> {
        let pre_user = PreUser {
            email_address: email_address.to_string(),
            verify_code: verify_code.to_string(),
            created_time: Utc::now(),
            failed_attempts: 0,
        };
        self.record(Write::InsertPreUser(pre_user.clone()))?;
        Ok(pre_user)
    }

    async fn find_pre_user(&mut self, email_address: &str) -> StoreResult<Option<PreUser>> {
        let view = self.view()?;
        Ok(view
            .live_pre_user(email_address, &self.expiry, Utc::now())
            .cloned())
    }

    async fn update_pre_user_code(
        &mut self,
        email_address: &str,
        verify_code: &str,
    ) -> StoreResult<PreUser> {
        let view = self.record(Write::SetVerifyCode {
            email_address: email_address.to_string(),
            verify_code: verify_code.to_string(),
        })?;
        Self::pre_user_in(&view, email_address)
    }

    async fn increment_failed_attempts(
        &mut self,
        email_address: &str,
        by: i32,
    ) -> StoreResult<PreUser> {
        let view = self.record(Write::AddFailedAttempts {
            email_address: email_address.to_string(),
            by,
        })?;
        Self::pre_user_in(&view, email_address)
    }

    async fn delete_pre_user(&mut self, email_address: &str) -> StoreResult<()> {
        self.record(Write::DeletePreUser(email_address.to_string()))?;
        Ok(())
    }

    async fn create_session(
        &mut self,
        session_id: Uuid,
        client_token: Uuid,
        user_id: Uuid,
    ) -> StoreResult<Session> {
        let session = Session {
            session_id,
            client_token,
            user_id,
            created_time: Utc::now(),
        };
        self.record(Write::InsertSession(session.clone()))?;
        Ok(session)
    }

    async fn find_session_by_id(&mut self, session_id: Uuid) -> StoreResult<Option<Session>> {
        let view = self.view()?;
        Ok(view
            .live_session(session_id, &self.expiry, Utc::now())
            .cloned())
    }

    async fn find_session_by_token(
        &mut self,
        client_token: Uuid,
    ) -> StoreResult<Option<Session>> {
        let view = self.view()?;
        let now = Utc::now();
        Ok(view
            .sessions
            .values()
            .find(|s| s.client_token == client_token)
            .and_then(|s| view.live_session(s.session_id, &self.expiry, now))
            .cloned())
    }

    async fn delete_session_by_id(&mut self, session_id: Uuid) -> StoreResult<()> {
        self.record(Write::DeleteSession(session_id))?;
        Ok(())
    }

    async fn delete_session_by_token(&mut self, client_token: Uuid) -> StoreResult<()> {
        let session = self
            .find_session_by_token(client_token)
            .await?
            .ok_or_else(|| StoreError::NotFound("session".to_string()))?;
        self.record(Write::DeleteSession(session.session_id))?;
        Ok(())
    }

    async fn create_password_reset(
        &mut self,
        reset_code: Uuid,
        user_id: Uuid,
    ) -> StoreResult<PasswordReset> {
        let reset = PasswordReset {
            reset_code,
            user_id,
            created_time: Utc::now(),
        };
        self.record(Write::InsertPasswordReset(reset.clone()))?;
        Ok(reset)
    }

    async fn find_password_reset_by_code(
        &mut self,
        reset_code: Uuid,
    ) -> StoreResult<Option<PasswordReset>> {
        let view = self.view()?;
        Ok(view.live_reset(reset_code, &self.expiry, Utc::now()).cloned())
    }

    async fn find_password_reset_by_user(
        &mut self,
        user_id: Uuid,
    ) -> StoreResult<Option<PasswordReset>> {
        let view = self.view()?;
        let now = Utc::now();
        Ok(view
            .password_resets
            .values()
            .find(|r| r.user_id == user_id)
            .and_then(|r| view.live_reset(r.reset_code, &self.expiry, now))
            .cloned())
    }

    async fn delete_password_reset(&mut self, reset_code: Uuid) -> StoreResult<()> {
        self.record(Write::DeletePasswordReset(reset_code))?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let mut tables = lock(&self.tables)?;
        let mut next = tables.clone();
        let now = Utc::now();
        for write in &self.writes {
            next.apply(write, &self.expiry, now)?;
        }
        *tables = next;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }
}
