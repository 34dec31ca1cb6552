use super::utils::valid_password;
use super::{checked_email, require, Engine, Error, Notification, Result, MSG_INVALID_PASSWORD};
use crate::store::{Session, StoreError, StoreTx, User};
use anyhow::anyhow;
use tracing::{info, instrument};
use uuid::Uuid;

const MSG_BAD_CREDENTIALS: &str = "Invalid email address or password";
const MSG_SESSION_NOT_FOUND: &str = "Failed to find given session";
const SESSION_MINT_ATTEMPTS: usize = 3;
const DUMMY_PASSWORD: &str = "signet-unknown-user-password";

fn session_not_found(err: StoreError) -> Error {
    match err {
        StoreError::NotFound(_) => Error::not_found(MSG_SESSION_NOT_FOUND),
        other => other.into(),
    }
}

impl Engine {
    /// Authenticate and open a new session.
    ///
    /// Unknown addresses and wrong passwords fail identically.
    ///
    /// # Errors
    /// [`Error::Client`] for invalid input or bad credentials.
    #[instrument(skip_all)]
    pub async fn login(&self, email_address: &str, password: &str) -> Result<Session> {
        let email_address = checked_email(email_address)?;
        require(valid_password(password), MSG_INVALID_PASSWORD)?;

        let mut tx = self.begin().await?;
        let result = self.login_in(tx.as_mut(), &email_address, password).await;
        let session = Self::finish(tx, result).await?;

        info!(user_id = %session.user_id, session_id = %session.session_id, "session opened");
        Ok(session)
    }

    async fn login_in(
        &self,
        tx: &mut dyn StoreTx,
        email_address: &str,
        password: &str,
    ) -> Result<Session> {
        let Some(user) = tx.find_user_by_email(email_address).await? else {
            // Same bcrypt work as a wrong password.
            let dummy_hash = self
                .dummy_hash
                .get_or_try_init(|| self.hash_password(DUMMY_PASSWORD))
                .await?;
            self.verify_password(password, dummy_hash).await?;
            return Err(Error::client(MSG_BAD_CREDENTIALS));
        };
        if !self.verify_password(password, &user.password_hash).await? {
            return Err(Error::client(MSG_BAD_CREDENTIALS));
        }

        let session = Self::mint_session(tx, user.user_id).await?;
        if user.login_notify {
            self.notify(&Notification::login_alert(&user))?;
        }
        Ok(session)
    }

    async fn mint_session(tx: &mut dyn StoreTx, user_id: Uuid) -> Result<Session> {
        for _ in 0..SESSION_MINT_ATTEMPTS {
            match tx
                .create_session(Uuid::new_v4(), Uuid::new_v4(), user_id)
                .await
            {
                Ok(session) => {
                    tx.assert_session_consistent(&session).await?;
                    return Ok(session);
                }
                Err(StoreError::Conflict(_)) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(Error::Internal(anyhow!(
            "failed to mint a unique session after {SESSION_MINT_ATTEMPTS} attempts"
        )))
    }

    /// Revoke the session with this id.
    ///
    /// # Errors
    /// [`Error::NotFound`] if no live session has this id.
    #[instrument(skip_all)]
    pub async fn logout_by_session_id(&self, session_id: Uuid) -> Result<()> {
        let mut tx = self.begin().await?;
        let result = tx
            .delete_session_by_id(session_id)
            .await
            .map_err(session_not_found);
        Self::finish(tx, result).await?;
        info!(%session_id, "session closed");
        Ok(())
    }

    /// Revoke the session holding this client token.
    ///
    /// # Errors
    /// [`Error::NotFound`] if no live session holds this token.
    #[instrument(skip_all)]
    pub async fn logout_by_client_token(&self, client_token: Uuid) -> Result<()> {
        let mut tx = self.begin().await?;
        let result = tx
            .delete_session_by_token(client_token)
            .await
            .map_err(session_not_found);
        Self::finish(tx, result).await?;
        info!("session closed");
        Ok(())
    }

    /// Revoke a session given either its id or its client token. The id is
    /// tried first.
    ///
    /// # Errors
    /// [`Error::NotFound`] if neither matches a live session.
    #[instrument(skip_all)]
    pub async fn logout(&self, session_id_or_token: Uuid) -> Result<()> {
        let mut tx = self.begin().await?;
        let result = Self::logout_in(tx.as_mut(), session_id_or_token).await;
        Self::finish(tx, result).await?;
        info!("session closed");
        Ok(())
    }

    async fn logout_in(tx: &mut dyn StoreTx, session_id_or_token: Uuid) -> Result<()> {
        if tx.find_session_by_id(session_id_or_token).await?.is_some() {
            return tx
                .delete_session_by_id(session_id_or_token)
                .await
                .map_err(session_not_found);
        }
        tx.delete_session_by_token(session_id_or_token)
            .await
            .map_err(session_not_found)
    }

    /// Resolve a client token to the user that owns its session.
    ///
    /// Returns `Ok(None)` when no live session holds the token.
    ///
    /// # Errors
    /// [`Error::Internal`] if the session exists but its owner does not.
    #[instrument(skip_all)]
    pub async fn find_user_by_token(&self, client_token: Uuid) -> Result<Option<User>> {
        let mut tx = self.begin().await?;
        let result = Self::find_user_by_token_in(tx.as_mut(), client_token).await;
        Self::finish(tx, result).await
    }

    async fn find_user_by_token_in(
        tx: &mut dyn StoreTx,
        client_token: Uuid,
    ) -> Result<Option<User>> {
        let Some(session) = tx.find_session_by_token(client_token).await? else {
            return Ok(None);
        };
        match tx.find_user_by_id(session.user_id).await? {
            Some(user) => Ok(Some(user)),
            None => Err(Error::Internal(anyhow!(
                "session {} references missing user {}",
                session.session_id,
                session.user_id
            ))),
        }
    }
}
