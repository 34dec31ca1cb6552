//! Identity and session lifecycle engine.
//!
//! [`Engine`] owns the state machine for an account:
//!
//! - **Registration** (`preregister` → `verify_code` → `register`): a `PreUser`
//!   holds a numeric code for the address. Wrong codes and resends share one
//!   failed-attempt counter; at [`EngineConfig::allowed_failed_verifications`]
//!   the address is locked out until the `PreUser` expires.
//! - **Account maintenance**: name, password and login-notify changes, deletion.
//! - **Sessions**: `login` mints a session with a random client token, `logout`
//!   revokes it, `find_user_by_token` resolves a bearer token to its owner.
//! - **Password reset**: one outstanding grant per user, single use.
//!
//! Every operation validates its input first and then runs inside one store
//! transaction that commits on success and rolls back on failure. The only
//! exception is the failed-attempt increment, which commits in a transaction of
//! its own so that lockout survives the rollback of the attempt that tripped it.
//!
//! When no [`Notifier`] is configured, notifications are disabled and the secret
//! a message would have carried is returned to the caller instead.

mod account;
pub mod config;
mod error;
pub mod notify;
mod password_reset;
mod registration;
mod session;
pub mod sweeper;
mod utils;

#[cfg(test)]
mod tests;

pub use config::{EngineConfig, NotificationPolicy};
pub use error::{Error, ErrorKind, Result};
pub use notify::{LogNotifier, Notification, Notifier};
pub use password_reset::PendingReset;
pub use registration::PendingRegistration;

use crate::store::{RecordStore, StoreError, StoreTx, User};
use anyhow::Context;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, error, warn};

pub(crate) const MSG_INVALID_EMAIL: &str = "Invalid email address";
pub(crate) const MSG_INVALID_PASSWORD: &str = "Invalid password";
pub(crate) const MSG_USER_NOT_FOUND: &str = "Failed to find given user";

pub struct Engine {
    store: Arc<dyn RecordStore>,
    config: EngineConfig,
    notifier: Option<Arc<dyn Notifier>>,
    // Verified against when the login address is unknown, hashed at the configured cost.
    dummy_hash: OnceCell<String>,
}

impl Engine {
    /// Build an engine with notifications disabled.
    #[must_use]
    pub fn new(store: Arc<dyn RecordStore>, config: EngineConfig) -> Self {
        Self {
            store,
            config: config.normalize(),
            notifier: None,
            dummy_hash: OnceCell::new(),
        }
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn notifications_enabled(&self) -> bool {
        self.notifier.is_some()
    }

    async fn begin(&self) -> Result<Box<dyn StoreTx>> {
        Ok(self.store.begin().await?)
    }

    /// Commit on success, roll back on failure.
    async fn finish<T>(tx: Box<dyn StoreTx>, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => {
                tx.commit().await.map_err(|err| match err {
                    StoreError::Conflict(what) | StoreError::NotFound(what) => {
                        Error::client(format!("Concurrent update rejected: {what}"))
                    }
                    other => Error::from(other),
                })?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!("failed to rollback transaction: {rollback_err}");
                }
                if err.is_defect() {
                    error!(error = ?err, "identity operation failed");
                }
                Err(err)
            }
        }
    }

    /// Await `attempt`; on a code mismatch record the failed attempt in its own
    /// transaction and report the mismatch as a client error.
    pub(crate) async fn counting_failed_attempts<T, F>(
        &self,
        email_address: &str,
        attempt: F,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send,
    {
        match attempt.await {
            Err(Error::VerifyFailed(message)) => {
                self.record_failed_attempt(email_address).await?;
                Err(Error::Client(message))
            }
            other => other,
        }
    }

    /// Increment `failed_attempts` and commit immediately.
    pub(crate) async fn record_failed_attempt(&self, email_address: &str) -> Result<()> {
        let mut tx = self.begin().await?;
        match tx.increment_failed_attempts(email_address, 1).await {
            Ok(pre_user) => {
                tx.commit().await?;
                debug!(
                    failed_attempts = pre_user.failed_attempts,
                    "recorded failed verification"
                );
                Ok(())
            }
            Err(StoreError::NotFound(_)) => {
                // Registered or expired in the meantime; nothing left to lock.
                warn!("pre-user vanished before failed attempt could be recorded");
                tx.rollback().await?;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn notify(&self, notification: &Notification) -> Result<()> {
        let Some(notifier) = &self.notifier else {
            return Ok(());
        };
        match notifier.send(notification) {
            Ok(()) => Ok(()),
            Err(err) => match self.config.notification_policy() {
                NotificationPolicy::BestEffort => {
                    warn!(subject = %notification.subject, "notification send failed: {err:#}");
                    Ok(())
                }
                NotificationPolicy::Required => {
                    Err(Error::Internal(err.context("failed to send notification")))
                }
            },
        }
    }

    async fn hash_password(&self, password: &str) -> Result<String> {
        let password = password.to_string();
        let cost = self.config.hash_cost();
        let hash = tokio::task::spawn_blocking(move || utils::hash_password(&password, cost))
            .await
            .context("password hashing task failed")??;
        Ok(hash)
    }

    async fn verify_password(&self, password: &str, password_hash: &str) -> Result<bool> {
        let password = password.to_string();
        let password_hash = password_hash.to_string();
        let matches =
            tokio::task::spawn_blocking(move || utils::verify_password(&password, &password_hash))
                .await
                .context("password verification task failed")??;
        Ok(matches)
    }

    async fn require_user(tx: &mut dyn StoreTx, email_address: &str) -> Result<User> {
        tx.find_user_by_email(email_address)
            .await?
            .ok_or_else(|| Error::not_found(MSG_USER_NOT_FOUND))
    }
}

fn require(condition: bool, message: &str) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(Error::client(message))
    }
}

/// Normalize and validate an email address.
fn checked_email(email_address: &str) -> Result<String> {
    let email_address = utils::normalize_email(email_address);
    require(utils::valid_email(&email_address), MSG_INVALID_EMAIL)?;
    Ok(email_address)
}
