use super::utils::{random_digits, valid_name, valid_password, valid_verify_code};
use super::{checked_email, require, Engine, Error, Notification, Result, MSG_INVALID_PASSWORD};
use crate::store::{NewUser, PreUser, StoreError, StoreTx, User};
use serde::Serialize;
use tracing::{info, instrument};
use uuid::Uuid;

const MSG_VERIFICATION_EXPIRED: &str = "Verification invalid or expired";
const MSG_CODE_INVALID: &str = "Verification code invalid";

/// Result of a preregistration. `verify_code` is only set when notifications
/// are disabled and the caller is expected to relay the code itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PendingRegistration {
    pub email_address: String,
    pub verify_code: Option<String>,
}

fn already_claimed(email_address: &str) -> Error {
    Error::client(format!("Email address {email_address} already claimed"))
}

impl Engine {
    fn lockout(&self) -> Error {
        Error::client(format!(
            "Maximum failed registrations for {} period",
            self.config.lockout_period()
        ))
    }

    fn checked_code(&self, verify_code: &str) -> Result<()> {
        require(
            valid_verify_code(verify_code, self.config.verify_code_length()),
            "Invalid verify code",
        )
    }

    /// Load the live `PreUser` for `email_address`, refusing locked-out ones.
    async fn unlocked_pre_user(
        &self,
        tx: &mut dyn StoreTx,
        email_address: &str,
    ) -> Result<PreUser> {
        let pre_user = tx
            .find_pre_user(email_address)
            .await?
            .ok_or_else(|| Error::client(MSG_VERIFICATION_EXPIRED))?;
        if pre_user.failed_attempts >= self.config.allowed_failed_verifications() {
            return Err(self.lockout());
        }
        Ok(pre_user)
    }

    /// Start (or restart) email verification for an address.
    ///
    /// A repeated call rotates the code and counts as a failed attempt.
    ///
    /// # Errors
    /// [`Error::Client`] for an invalid or claimed address, or once locked out.
    #[instrument(skip_all)]
    pub async fn preregister(&self, email_address: &str) -> Result<PendingRegistration> {
        let email_address = checked_email(email_address)?;

        // Each step runs in its own transaction, one at a time.
        let mut tx = self.begin().await?;
        let result = self.preregister_check(tx.as_mut(), &email_address).await;
        let resend = Self::finish(tx, result).await?;

        if resend {
            // Committed on its own; a failed rotation below still counts.
            self.record_failed_attempt(&email_address).await?;
        }

        let mut tx = self.begin().await?;
        let result = self.preregister_in(tx.as_mut(), &email_address, resend).await;
        let verify_code = Self::finish(tx, result).await?;

        info!(resend, "preregistration pending");
        Ok(PendingRegistration {
            email_address,
            verify_code: (!self.notifications_enabled()).then_some(verify_code),
        })
    }

    /// Refuse claimed or locked-out addresses; report whether this is a resend.
    async fn preregister_check(
        &self,
        tx: &mut dyn StoreTx,
        email_address: &str,
    ) -> Result<bool> {
        if tx.find_user_by_email(email_address).await?.is_some() {
            return Err(already_claimed(email_address));
        }
        match tx.find_pre_user(email_address).await? {
            Some(pre_user)
                if pre_user.failed_attempts >= self.config.allowed_failed_verifications() =>
            {
                Err(self.lockout())
            }
            Some(_) => Ok(true),
            None => Ok(false),
        }
    }

    async fn preregister_in(
        &self,
        tx: &mut dyn StoreTx,
        email_address: &str,
        resend: bool,
    ) -> Result<String> {
        if tx.find_user_by_email(email_address).await?.is_some() {
            return Err(already_claimed(email_address));
        }

        let verify_code = random_digits(self.config.verify_code_length());
        if resend {
            let updated = tx
                .update_pre_user_code(email_address, &verify_code)
                .await
                .map_err(|err| match err {
                    StoreError::NotFound(_) => Error::client(MSG_VERIFICATION_EXPIRED),
                    other => other.into(),
                })?;
            tx.assert_pre_user_consistent(&updated).await?;
        } else {
            let created = tx
                .create_pre_user(email_address, &verify_code)
                .await
                .map_err(|err| match err {
                    StoreError::Conflict(_) => Error::client(format!(
                        "Preregistration for {email_address} already in progress"
                    )),
                    other => other.into(),
                })?;
            tx.assert_pre_user_consistent(&created).await?;
        }

        self.notify(&Notification::verification(email_address, &verify_code))?;
        Ok(verify_code)
    }

    /// Check a verification code without consuming it.
    ///
    /// # Errors
    /// [`Error::Client`] for invalid input, a missing or locked-out
    /// preregistration, or a wrong code (which is counted).
    #[instrument(skip_all)]
    pub async fn verify_code(&self, email_address: &str, verify_code: &str) -> Result<()> {
        let email_address = checked_email(email_address)?;
        self.checked_code(verify_code)?;

        let attempt = async {
            let mut tx = self.begin().await?;
            let result = self
                .matching_pre_user(tx.as_mut(), &email_address, verify_code)
                .await
                .map(|_| ());
            Self::finish(tx, result).await
        };
        self.counting_failed_attempts(&email_address, attempt).await
    }

    async fn matching_pre_user(
        &self,
        tx: &mut dyn StoreTx,
        email_address: &str,
        verify_code: &str,
    ) -> Result<PreUser> {
        let pre_user = self.unlocked_pre_user(tx, email_address).await?;
        if pre_user.verify_code != verify_code {
            return Err(Error::VerifyFailed(MSG_CODE_INVALID.to_string()));
        }
        Ok(pre_user)
    }

    /// Turn a verified preregistration into an account.
    ///
    /// The `PreUser` is consumed and the `User` created in one transaction.
    ///
    /// # Errors
    /// [`Error::Client`] for invalid input, a claimed address, a missing or
    /// locked-out preregistration, or a wrong code (which is counted).
    #[instrument(skip_all)]
    pub async fn register(
        &self,
        email_address: &str,
        password: &str,
        first_name: &str,
        last_name: &str,
        verify_code: &str,
    ) -> Result<User> {
        let email_address = checked_email(email_address)?;
        require(valid_password(password), MSG_INVALID_PASSWORD)?;
        require(valid_name(first_name), "Invalid first name")?;
        require(valid_name(last_name), "Invalid last name")?;
        self.checked_code(verify_code)?;

        let attempt = async {
            let mut tx = self.begin().await?;
            let result = self
                .register_in(
                    tx.as_mut(),
                    &email_address,
                    password,
                    first_name,
                    last_name,
                    verify_code,
                )
                .await;
            Self::finish(tx, result).await
        };
        let user = self.counting_failed_attempts(&email_address, attempt).await?;

        info!(user_id = %user.user_id, "user registered");
        Ok(user)
    }

    async fn register_in(
        &self,
        tx: &mut dyn StoreTx,
        email_address: &str,
        password: &str,
        first_name: &str,
        last_name: &str,
        verify_code: &str,
    ) -> Result<User> {
        if tx.find_user_by_email(email_address).await?.is_some() {
            return Err(already_claimed(email_address));
        }
        self.matching_pre_user(tx, email_address, verify_code).await?;

        // A racing register may have consumed it since the read above.
        tx.delete_pre_user(email_address)
            .await
            .map_err(|err| match err {
                StoreError::NotFound(_) => Error::client(MSG_VERIFICATION_EXPIRED),
                other => other.into(),
            })?;

        let password_hash = self.hash_password(password).await?;
        let user = tx
            .create_user(NewUser {
                user_id: Uuid::new_v4(),
                email_address: email_address.to_string(),
                password_hash,
                first_name: first_name.to_string(),
                last_name: last_name.to_string(),
            })
            .await
            .map_err(|err| match err {
                StoreError::Conflict(_) => already_claimed(email_address),
                other => other.into(),
            })?;
        tx.assert_user_consistent(&user).await?;

        self.notify(&Notification::welcome(&user))?;
        Ok(user)
    }
}
