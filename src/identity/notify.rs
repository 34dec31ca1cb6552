//! Outbound notifications.
//!
//! The engine composes a [`Notification`] and hands it to a [`Notifier`]; how
//! it is delivered (SMTP, a provider API, a queue) is up to the implementation.
//! [`LogNotifier`] logs instead of sending and is meant for local runs.

use crate::store::User;
use anyhow::Result;
use tracing::info;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Delivery seam for engine notifications.
pub trait Notifier: Send + Sync {
    /// Deliver a message or return an error describing why it failed.
    fn send(&self, notification: &Notification) -> Result<()>;
}

#[derive(Clone, Debug)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send(&self, notification: &Notification) -> Result<()> {
        info!(
            to = %notification.to,
            subject = %notification.subject,
            "notification send stub"
        );
        Ok(())
    }
}

impl Notification {
    pub(crate) fn verification(email_address: &str, verify_code: &str) -> Self {
        Self {
            to: email_address.to_string(),
            subject: "Verify your email address".to_string(),
            body: format!("Your verification code is {verify_code}"),
        }
    }

    pub(crate) fn welcome(user: &User) -> Self {
        Self {
            to: user.recipient(),
            subject: "Welcome".to_string(),
            body: format!("Welcome, {}! Your account is ready.", user.first_name),
        }
    }

    pub(crate) fn password_reset(user: &User, reset_code: &uuid::Uuid) -> Self {
        Self {
            to: user.recipient(),
            subject: "Password reset requested".to_string(),
            body: format!("Use reset code {reset_code} to choose a new password."),
        }
    }

    pub(crate) fn login_alert(user: &User) -> Self {
        Self {
            to: user.recipient(),
            subject: "New login to your account".to_string(),
            body: format!(
                "Hi {}, your account was just used to sign in.",
                user.first_name
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn user() -> User {
        User {
            user_id: Uuid::new_v4(),
            email_address: "ada@example.com".to_string(),
            password_hash: String::new(),
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
            created_time: Utc::now(),
            login_notify: true,
        }
    }

    #[test]
    fn verification_carries_the_code() {
        let message = Notification::verification("a@b.com", "123456");
        assert_eq!(message.to, "a@b.com");
        assert!(message.body.contains("123456"));
    }

    #[test]
    fn user_messages_use_full_name_recipient() {
        let user = user();
        let code = Uuid::new_v4();
        for message in [
            Notification::welcome(&user),
            Notification::password_reset(&user, &code),
            Notification::login_alert(&user),
        ] {
            assert_eq!(message.to, "Ada Lovelace <ada@example.com>");
        }
        assert!(Notification::password_reset(&user, &code)
            .body
            .contains(&code.to_string()));
    }

    #[test]
    fn log_notifier_accepts_everything() {
        assert!(LogNotifier.send(&Notification::login_alert(&user())).is_ok());
    }
}
