use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// A registered account.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub user_id: Uuid,
    pub email_address: String,
    #[serde(skip_serializing)]
    pub(crate) password_hash: String,
    pub first_name: String,
    pub last_name: String,
    pub created_time: DateTime<Utc>,
    /// Send a notification on every successful login.
    pub login_notify: bool,
}

impl User {
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }

    /// Mailbox form used when addressing notifications: `First Last <email>`.
    #[must_use]
    pub fn recipient(&self) -> String {
        format!("{} <{}>", self.full_name(), self.email_address)
    }
}

impl std::fmt::Debug for User {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("User")
            .field("user_id", &self.user_id)
            .field("email_address", &self.email_address)
            .field("password_hash", &"***")
            .field("first_name", &self.first_name)
            .field("last_name", &self.last_name)
            .field("created_time", &self.created_time)
            .field("login_notify", &self.login_notify)
            .finish()
    }
}

/// Insert payload for [`User`]; the store assigns `created_time`.
#[derive(Clone)]
pub struct NewUser {
    pub user_id: Uuid,
    pub email_address: String,
    pub password_hash: String,
    pub first_name: String,
    pub last_name: String,
}

/// An email address waiting for its verification code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreUser {
    pub email_address: String,
    pub verify_code: String,
    pub created_time: DateTime<Utc>,
    pub failed_attempts: i32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Session {
    pub session_id: Uuid,
    /// Bearer credential handed to the caller.
    pub client_token: Uuid,
    pub user_id: Uuid,
    pub created_time: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PasswordReset {
    pub reset_code: Uuid,
    pub user_id: Uuid,
    pub created_time: DateTime<Utc>,
}
