use super::utils::{valid_name, valid_password};
use super::{checked_email, require, Engine, Error, Result, MSG_INVALID_PASSWORD};
use crate::store::{StoreTx, User};
use tracing::{info, instrument};

impl Engine {
    /// Change either or both names. With neither given this is a no-op that
    /// returns the current record.
    ///
    /// # Errors
    /// [`Error::Client`] for invalid names, [`Error::NotFound`]
    /// for an unknown address.
    #[instrument(skip_all)]
    pub async fn change_name(
        &self,
        email_address: &str,
        first_name: Option<&str>,
        last_name: Option<&str>,
    ) -> Result<User> {
        let email_address = checked_email(email_address)?;
        if let Some(first_name) = first_name {
            require(valid_name(first_name), "Invalid first name")?;
        }
        if let Some(last_name) = last_name {
            require(valid_name(last_name), "Invalid last name")?;
        }

        let mut tx = self.begin().await?;
        let result =
            Self::change_name_in(tx.as_mut(), &email_address, first_name, last_name).await;
        let user = Self::finish(tx, result).await?;

        info!(user_id = %user.user_id, "name changed");
        Ok(user)
    }

    async fn change_name_in(
        tx: &mut dyn StoreTx,
        email_address: &str,
        first_name: Option<&str>,
        last_name: Option<&str>,
    ) -> Result<User> {
        let user = Self::require_user(tx, email_address).await?;
        if first_name.is_none() && last_name.is_none() {
            return Ok(user);
        }
        tx.assert_user_consistent(&user).await?;

        let updated = tx
            .update_user_name(
                user.user_id,
                first_name.unwrap_or(&user.first_name),
                last_name.unwrap_or(&user.last_name),
            )
            .await?;
        tx.assert_user_consistent(&updated).await?;
        Ok(updated)
    }

    /// Replace the password of an existing account.
    ///
    /// # Errors
    /// [`Error::Client`] for an invalid password,
    /// [`Error::NotFound`] for an unknown address.
    #[instrument(skip_all)]
    pub async fn change_password(&self, email_address: &str, new_password: &str) -> Result<User> {
        let email_address = checked_email(email_address)?;
        require(valid_password(new_password), MSG_INVALID_PASSWORD)?;

        let mut tx = self.begin().await?;
        let result = self
            .change_password_in(tx.as_mut(), &email_address, new_password)
            .await;
        let user = Self::finish(tx, result).await?;

        info!(user_id = %user.user_id, "password changed");
        Ok(user)
    }

    async fn change_password_in(
        &self,
        tx: &mut dyn StoreTx,
        email_address: &str,
        new_password: &str,
    ) -> Result<User> {
        let user = Self::require_user(tx, email_address).await?;
        let password_hash = self.hash_password(new_password).await?;
        let updated = tx
            .update_user_password(user.user_id, &password_hash)
            .await?;
        tx.assert_user_consistent(&updated).await?;
        Ok(updated)
    }

    /// Turn login notifications on or off.
    ///
    /// # Errors
    /// [`Error::NotFound`] for an unknown address.
    #[instrument(skip_all)]
    pub async fn change_login_notify(&self, email_address: &str, enabled: bool) -> Result<User> {
        let email_address = checked_email(email_address)?;

        let mut tx = self.begin().await?;
        let result = async {
            let user = Self::require_user(tx.as_mut(), &email_address).await?;
            let updated = tx.update_user_login_notify(user.user_id, enabled).await?;
            tx.assert_user_consistent(&updated).await?;
            Ok::<_, Error>(updated)
        }
        .await;
        let user = Self::finish(tx, result).await?;

        info!(user_id = %user.user_id, enabled, "login notify changed");
        Ok(user)
    }

    /// Delete an account together with its sessions and reset grant.
    ///
    /// # Errors
    /// [`Error::NotFound`] for an unknown address.
    #[instrument(skip_all)]
    pub async fn delete(&self, email_address: &str) -> Result<()> {
        let email_address = checked_email(email_address)?;

        let mut tx = self.begin().await?;
        let result = async {
            let user = Self::require_user(tx.as_mut(), &email_address).await?;
            tx.assert_user_consistent(&user).await?;
            tx.delete_user(user.user_id).await?;
            Ok::<_, Error>(user.user_id)
        }
        .await;
        let user_id = Self::finish(tx, result).await?;

        info!(%user_id, "user deleted");
        Ok(())
    }
}
