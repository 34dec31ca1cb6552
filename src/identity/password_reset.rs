use super::utils::valid_password;
use super::{checked_email, require, Engine, Error, Notification, Result, MSG_INVALID_PASSWORD};
use crate::store::{StoreError, StoreTx, User};
use serde::Serialize;
use tracing::{info, instrument};
use uuid::Uuid;

const MSG_RESET_PENDING: &str = "Password reset request already pending";
const MSG_RESET_CODE_INVALID: &str = "Password reset code invalid";

/// Result of a reset request. `reset_code` is only set when notifications are
/// disabled.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PendingReset {
    pub user_id: Uuid,
    pub reset_code: Option<Uuid>,
}

impl Engine {
    /// Issue a reset grant for an existing account.
    ///
    /// # Errors
    /// [`Error::NotFound`] for an unknown address, [`Error::Client`] while
    /// another grant for the same user is still live.
    #[instrument(skip_all)]
    pub async fn request_password_reset(&self, email_address: &str) -> Result<PendingReset> {
        let email_address = checked_email(email_address)?;

        let mut tx = self.begin().await?;
        let result = self.request_reset_in(tx.as_mut(), &email_address).await;
        let (user_id, reset_code) = Self::finish(tx, result).await?;

        info!(%user_id, "password reset requested");
        Ok(PendingReset {
            user_id,
            reset_code: (!self.notifications_enabled()).then_some(reset_code),
        })
    }

    async fn request_reset_in(
        &self,
        tx: &mut dyn StoreTx,
        email_address: &str,
    ) -> Result<(Uuid, Uuid)> {
        let user = Self::require_user(tx, email_address).await?;
        if tx.find_password_reset_by_user(user.user_id).await?.is_some() {
            return Err(Error::client(MSG_RESET_PENDING));
        }

        let reset = tx
            .create_password_reset(Uuid::new_v4(), user.user_id)
            .await
            .map_err(|err| match err {
                StoreError::Conflict(_) => Error::client(MSG_RESET_PENDING),
                other => other.into(),
            })?;
        tx.assert_password_reset_consistent(&reset).await?;

        self.notify(&Notification::password_reset(&user, &reset.reset_code))?;
        Ok((user.user_id, reset.reset_code))
    }

    /// Redeem a reset grant and set a new password. The grant is consumed.
    ///
    /// # Errors
    /// [`Error::Client`] for invalid input or a code that is missing, expired
    /// or issued to someone else; [`Error::NotFound`] for an unknown address.
    #[instrument(skip_all)]
    pub async fn fulfill_password_reset(
        &self,
        email_address: &str,
        new_password: &str,
        reset_code: Uuid,
    ) -> Result<User> {
        let email_address = checked_email(email_address)?;
        require(valid_password(new_password), MSG_INVALID_PASSWORD)?;

        let mut tx = self.begin().await?;
        let result = self
            .fulfill_reset_in(tx.as_mut(), &email_address, new_password, reset_code)
            .await;
        let user = Self::finish(tx, result).await?;

        info!(user_id = %user.user_id, "password reset fulfilled");
        Ok(user)
    }

    async fn fulfill_reset_in(
        &self,
        tx: &mut dyn StoreTx,
        email_address: &str,
        new_password: &str,
        reset_code: Uuid,
    ) -> Result<User> {
        let user = Self::require_user(tx, email_address).await?;
        let reset = match tx.find_password_reset_by_code(reset_code).await? {
            Some(reset) if reset.user_id == user.user_id => reset,
            _ => return Err(Error::client(MSG_RESET_CODE_INVALID)),
        };

        let password_hash = self.hash_password(new_password).await?;
        let updated = tx
            .update_user_password(user.user_id, &password_hash)
            .await?;
        tx.assert_user_consistent(&updated).await?;
        tx.delete_password_reset(reset.reset_code).await?;
        Ok(updated)
    }
}
