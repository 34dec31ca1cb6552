#![allow(clippy::unwrap_used)]

use super::config::MIN_HASH_COST;
use super::*;
use crate::store::memory::MemoryStore;
use crate::store::{
    NewUser, PasswordReset, PreUser, RecordStore, Session, StoreResult, StoreTx, SweepReport,
};
use anyhow::anyhow;
use chrono::TimeDelta;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

const EMAIL: &str = "a@b.com";
const PASSWORD: &str = "correct-horse";

fn config() -> EngineConfig {
    EngineConfig::new().with_hash_cost(MIN_HASH_COST)
}

fn engine_with(config: EngineConfig) -> (Engine, MemoryStore) {
    let store = MemoryStore::new(config.expiry());
    let engine = Engine::new(Arc::new(store.clone()), config);
    (engine, store)
}

fn engine() -> (Engine, MemoryStore) {
    engine_with(config())
}

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    fail: bool,
}

impl RecordingNotifier {
    fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    fn subjects(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|n| n.subject.clone())
            .collect()
    }

    fn last(&self) -> Notification {
        self.sent.lock().unwrap().last().cloned().unwrap()
    }
}

impl Notifier for RecordingNotifier {
    fn send(&self, notification: &Notification) -> anyhow::Result<()> {
        if self.fail {
            return Err(anyhow!("smtp relay refused connection"));
        }
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

async fn preregistered(engine: &Engine, email: &str) -> String {
    engine
        .preregister(email)
        .await
        .unwrap()
        .verify_code
        .unwrap()
}

async fn registered(engine: &Engine, email: &str) -> User {
    let code = preregistered(engine, email).await;
    engine
        .register(email, PASSWORD, "Ada", "Lovelace", &code)
        .await
        .unwrap()
}

fn wrong_code(code: &str) -> String {
    if code == "000000" {
        "111111".to_string()
    } else {
        "000000".to_string()
    }
}

fn client_message<T: std::fmt::Debug>(result: Result<T>) -> String {
    match result {
        Err(Error::Client(message)) => message,
        other => panic!("expected a client error, got {other:?}"),
    }
}

#[tokio::test]
async fn preregister_verify_register_login() -> anyhow::Result<()> {
    let (engine, store) = engine();

    let pending = engine.preregister("  A@B.com ").await?;
    assert_eq!(pending.email_address, EMAIL);
    let code = pending.verify_code.unwrap();
    assert_eq!(code.len(), 6);

    engine.verify_code(EMAIL, &code).await?;
    // Verification leaves the preregistration in place.
    engine.verify_code(EMAIL, &code).await?;

    let user = engine
        .register(EMAIL, PASSWORD, "Ada", "Lovelace", &code)
        .await?;
    assert_eq!(user.email_address, EMAIL);
    assert_eq!(user.full_name(), "Ada Lovelace");
    assert!(!user.login_notify);
    assert_ne!(user.password_hash, PASSWORD);
    assert_eq!(store.row_counts().0, 0);

    let session = engine.login(EMAIL, PASSWORD).await?;
    assert_eq!(session.user_id, user.user_id);
    assert_ne!(session.client_token, session.session_id);

    let owner = engine.find_user_by_token(session.client_token).await?;
    assert_eq!(owner.map(|u| u.user_id), Some(user.user_id));
    Ok(())
}

#[tokio::test]
async fn every_login_gets_a_fresh_session() -> anyhow::Result<()> {
    let (engine, _) = engine();
    registered(&engine, EMAIL).await;

    let first = engine.login(EMAIL, PASSWORD).await?;
    let second = engine.login(EMAIL, PASSWORD).await?;
    assert_ne!(first.session_id, second.session_id);
    assert_ne!(first.client_token, second.client_token);
    assert!(engine.find_user_by_token(first.client_token).await?.is_some());
    assert!(engine.find_user_by_token(second.client_token).await?.is_some());
    Ok(())
}

#[tokio::test]
async fn invalid_input_is_rejected_before_the_store() {
    let (engine, store) = engine();

    assert_eq!(
        client_message(engine.preregister("not-an-email").await),
        "Invalid email address"
    );
    assert_eq!(
        client_message(engine.verify_code(EMAIL, "12ab56").await),
        "Invalid verify code"
    );
    assert_eq!(
        client_message(engine.register(EMAIL, "short", "Ada", "Lovelace", "123456").await),
        "Invalid password"
    );
    assert_eq!(
        client_message(engine.register(EMAIL, PASSWORD, "Ada1", "Lovelace", "123456").await),
        "Invalid first name"
    );
    assert_eq!(
        client_message(engine.register(EMAIL, PASSWORD, "Ada", "", "123456").await),
        "Invalid last name"
    );
    assert_eq!(
        client_message(engine.login(EMAIL, &"x".repeat(73)).await),
        "Invalid password"
    );
    assert_eq!(store.row_counts(), (0, 0, 0));
}

#[tokio::test]
async fn preregister_rejects_claimed_address() {
    let (engine, _) = engine();
    registered(&engine, EMAIL).await;

    assert_eq!(
        client_message(engine.preregister(EMAIL).await),
        "Email address a@b.com already claimed"
    );
}

#[tokio::test]
async fn resend_rotates_the_code_and_counts_an_attempt() -> anyhow::Result<()> {
    let (engine, store) = engine();
    let first = preregistered(&engine, EMAIL).await;
    let second = preregistered(&engine, EMAIL).await;

    let mut tx = store.begin().await?;
    let pre_user = tx.find_pre_user(EMAIL).await?.unwrap();
    assert_eq!(pre_user.failed_attempts, 1);
    assert_eq!(pre_user.verify_code, second);
    tx.rollback().await?;

    if first != second {
        let result = engine.verify_code(EMAIL, &first).await;
        assert_eq!(client_message(result), "Verification code invalid");
    }
    engine.verify_code(EMAIL, &second).await?;
    Ok(())
}

#[tokio::test]
async fn wrong_codes_lock_the_address_out() -> anyhow::Result<()> {
    let (engine, _) = engine();
    let code = preregistered(&engine, EMAIL).await;
    let wrong = wrong_code(&code);

    for _ in 0..5 {
        let result = engine.verify_code(EMAIL, &wrong).await;
        assert_eq!(client_message(result), "Verification code invalid");
    }

    let lockout = "Maximum failed registrations for 24 hour period";
    assert_eq!(client_message(engine.preregister(EMAIL).await), lockout);
    assert_eq!(client_message(engine.verify_code(EMAIL, &code).await), lockout);
    assert_eq!(
        client_message(
            engine
                .register(EMAIL, PASSWORD, "Ada", "Lovelace", &code)
                .await
        ),
        lockout
    );
    Ok(())
}

#[tokio::test]
async fn failed_register_attempts_count_towards_lockout() -> anyhow::Result<()> {
    let (engine, store) = engine_with(config().with_allowed_failed_verifications(2));
    let code = preregistered(&engine, EMAIL).await;
    let wrong = wrong_code(&code);

    for _ in 0..2 {
        let result = engine
            .register(EMAIL, PASSWORD, "Ada", "Lovelace", &wrong)
            .await;
        assert_eq!(client_message(result), "Verification code invalid");
    }

    let mut tx = store.begin().await?;
    assert!(tx.find_user_by_email(EMAIL).await?.is_none());
    assert_eq!(tx.find_pre_user(EMAIL).await?.unwrap().failed_attempts, 2);
    tx.rollback().await?;

    let result = engine
        .register(EMAIL, PASSWORD, "Ada", "Lovelace", &code)
        .await;
    assert!(client_message(result).starts_with("Maximum failed registrations"));
    Ok(())
}

#[tokio::test]
async fn lockout_lifts_once_the_preregistration_expires() -> anyhow::Result<()> {
    let (engine, store) = engine();
    let code = preregistered(&engine, EMAIL).await;
    for _ in 0..5 {
        let _ = engine.verify_code(EMAIL, &wrong_code(&code)).await;
    }
    assert!(engine.preregister(EMAIL).await.is_err());

    store.rewind(TimeDelta::hours(24));

    let result = engine.verify_code(EMAIL, &code).await;
    assert_eq!(client_message(result), "Verification invalid or expired");

    let fresh = preregistered(&engine, EMAIL).await;
    engine.verify_code(EMAIL, &fresh).await?;
    Ok(())
}

#[tokio::test]
async fn verify_without_preregistration() {
    let (engine, _) = engine();
    assert_eq!(
        client_message(engine.verify_code(EMAIL, "123456").await),
        "Verification invalid or expired"
    );
}

#[tokio::test]
async fn custom_code_length() -> anyhow::Result<()> {
    let (engine, _) = engine_with(config().with_verify_code_length(8));
    let code = preregistered(&engine, EMAIL).await;
    assert_eq!(code.len(), 8);
    assert_eq!(
        client_message(engine.verify_code(EMAIL, &code[..6]).await),
        "Invalid verify code"
    );
    engine.verify_code(EMAIL, &code).await?;
    Ok(())
}

#[tokio::test]
async fn login_does_not_reveal_which_part_was_wrong() {
    let (engine, _) = engine();
    registered(&engine, EMAIL).await;

    let unknown = client_message(engine.login("nobody@b.com", PASSWORD).await);
    let wrong = client_message(engine.login(EMAIL, "wrong-horse").await);
    assert_eq!(unknown, "Invalid email address or password");
    assert_eq!(unknown, wrong);
}

#[tokio::test]
async fn logout_twice_is_not_found() -> anyhow::Result<()> {
    let (engine, _) = engine();
    registered(&engine, EMAIL).await;
    let session = engine.login(EMAIL, PASSWORD).await?;

    engine.logout_by_client_token(session.client_token).await?;
    let second = engine.logout_by_client_token(session.client_token).await;
    assert_eq!(second.unwrap_err().kind(), ErrorKind::NotFound);
    assert!(engine
        .find_user_by_token(session.client_token)
        .await?
        .is_none());
    Ok(())
}

#[tokio::test]
async fn logout_accepts_id_or_token() -> anyhow::Result<()> {
    let (engine, _) = engine();
    registered(&engine, EMAIL).await;

    let by_id = engine.login(EMAIL, PASSWORD).await?;
    engine.logout(by_id.session_id).await?;
    assert!(engine.find_user_by_token(by_id.client_token).await?.is_none());

    let by_token = engine.login(EMAIL, PASSWORD).await?;
    engine.logout(by_token.client_token).await?;
    assert!(engine
        .find_user_by_token(by_token.client_token)
        .await?
        .is_none());

    let session = engine.login(EMAIL, PASSWORD).await?;
    engine.logout_by_session_id(session.session_id).await?;
    let err = engine.logout_by_session_id(session.session_id).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(ref m) if m == "Failed to find given session"));

    let err = engine.logout(Uuid::new_v4()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    Ok(())
}

#[tokio::test]
async fn expired_sessions_are_dead_before_the_sweep() -> anyhow::Result<()> {
    let (engine, store) = engine();
    registered(&engine, EMAIL).await;
    let session = engine.login(EMAIL, PASSWORD).await?;

    store.rewind(TimeDelta::hours(12));

    assert!(engine.find_user_by_token(session.client_token).await?.is_none());
    let err = engine.logout(session.client_token).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(store.row_counts().1, 1);

    let report = store.sweep_expired().await?;
    assert_eq!(report.sessions, 1);

    // The account itself is not subject to expiry.
    engine.login(EMAIL, PASSWORD).await?;
    Ok(())
}

#[tokio::test]
async fn change_password_swaps_credentials_only_for_that_user() -> anyhow::Result<()> {
    let (engine, _) = engine();
    registered(&engine, EMAIL).await;
    registered(&engine, "c@d.com").await;
    let other = engine.login("c@d.com", PASSWORD).await?;

    engine.change_password(EMAIL, "battery-staple").await?;

    assert_eq!(
        client_message(engine.login(EMAIL, PASSWORD).await),
        "Invalid email address or password"
    );
    engine.login(EMAIL, "battery-staple").await?;
    assert!(engine.find_user_by_token(other.client_token).await?.is_some());
    Ok(())
}

#[tokio::test]
async fn change_name_updates_given_parts() -> anyhow::Result<()> {
    let (engine, _) = engine();
    let user = registered(&engine, EMAIL).await;

    let unchanged = engine.change_name(EMAIL, None, None).await?;
    assert_eq!(unchanged, user);

    let renamed = engine.change_name(EMAIL, Some("Grace"), None).await?;
    assert_eq!(renamed.full_name(), "Grace Lovelace");

    let renamed = engine.change_name(EMAIL, None, Some("Hopper")).await?;
    assert_eq!(renamed.full_name(), "Grace Hopper");

    assert_eq!(
        client_message(engine.change_name(EMAIL, Some("Gr4ce"), None).await),
        "Invalid first name"
    );
    let err = engine
        .change_name("nobody@b.com", Some("Grace"), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    Ok(())
}

#[tokio::test]
async fn delete_cascades_to_sessions_and_resets() -> anyhow::Result<()> {
    let (engine, store) = engine();
    registered(&engine, EMAIL).await;
    let session = engine.login(EMAIL, PASSWORD).await?;
    engine.request_password_reset(EMAIL).await?;
    assert_eq!(store.row_counts(), (0, 1, 1));

    engine.delete(EMAIL).await?;

    assert_eq!(store.row_counts(), (0, 0, 0));
    assert!(engine.find_user_by_token(session.client_token).await?.is_none());
    assert_eq!(engine.delete(EMAIL).await.unwrap_err().kind(), ErrorKind::NotFound);

    // The address is free again.
    registered(&engine, EMAIL).await;
    Ok(())
}

#[tokio::test]
async fn password_reset_is_single_use_and_bound_to_its_user() -> anyhow::Result<()> {
    let (engine, _) = engine();
    let user = registered(&engine, EMAIL).await;
    registered(&engine, "c@d.com").await;

    let pending = engine.request_password_reset(EMAIL).await?;
    assert_eq!(pending.user_id, user.user_id);
    let code = pending.reset_code.unwrap();

    assert_eq!(
        client_message(engine.request_password_reset(EMAIL).await),
        "Password reset request already pending"
    );

    let other_code = engine
        .request_password_reset("c@d.com")
        .await?
        .reset_code
        .unwrap();
    assert_eq!(
        client_message(
            engine
                .fulfill_password_reset(EMAIL, "battery-staple", other_code)
                .await
        ),
        "Password reset code invalid"
    );

    engine
        .fulfill_password_reset(EMAIL, "battery-staple", code)
        .await?;
    engine.login(EMAIL, "battery-staple").await?;

    assert_eq!(
        client_message(
            engine
                .fulfill_password_reset(EMAIL, "another-staple", code)
                .await
        ),
        "Password reset code invalid"
    );

    // The grant was consumed, so a new request is allowed.
    engine.request_password_reset(EMAIL).await?;
    Ok(())
}

#[tokio::test]
async fn expired_reset_is_superseded() -> anyhow::Result<()> {
    let (engine, store) = engine();
    registered(&engine, EMAIL).await;
    let stale = engine.request_password_reset(EMAIL).await?.reset_code.unwrap();

    store.rewind(TimeDelta::hours(12));

    assert_eq!(
        client_message(
            engine
                .fulfill_password_reset(EMAIL, "battery-staple", stale)
                .await
        ),
        "Password reset code invalid"
    );
    let fresh = engine.request_password_reset(EMAIL).await?.reset_code.unwrap();
    assert_ne!(fresh, stale);
    assert_eq!(store.row_counts().2, 1);
    Ok(())
}

#[tokio::test]
async fn reset_for_unknown_user_is_not_found() {
    let (engine, _) = engine();
    let err = engine.request_password_reset(EMAIL).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(ref m) if m == "Failed to find given user"));
}

#[tokio::test]
async fn notifications_replace_disclosed_secrets() -> anyhow::Result<()> {
    let (engine, _) = engine();
    let notifier = Arc::new(RecordingNotifier::default());
    let engine = engine.with_notifier(notifier.clone());
    assert!(engine.notifications_enabled());

    let pending = engine.preregister(EMAIL).await?;
    assert!(pending.verify_code.is_none());
    let message = notifier.last();
    assert_eq!(message.to, EMAIL);
    let code: String = message.body.chars().filter(char::is_ascii_digit).collect();

    let user = engine
        .register(EMAIL, PASSWORD, "Ada", "Lovelace", &code)
        .await?;
    assert_eq!(notifier.last().to, "Ada Lovelace <a@b.com>");

    let pending = engine.request_password_reset(EMAIL).await?;
    assert_eq!(pending.user_id, user.user_id);
    assert!(pending.reset_code.is_none());

    assert_eq!(
        notifier.subjects(),
        vec![
            "Verify your email address".to_string(),
            "Welcome".to_string(),
            "Password reset requested".to_string(),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn login_alerts_follow_the_preference() -> anyhow::Result<()> {
    let (engine, _) = engine();
    let notifier = Arc::new(RecordingNotifier::default());
    let engine = engine.with_notifier(notifier.clone());

    engine.preregister(EMAIL).await?;
    let code: String = notifier
        .last()
        .body
        .chars()
        .filter(char::is_ascii_digit)
        .collect();
    engine
        .register(EMAIL, PASSWORD, "Ada", "Lovelace", &code)
        .await?;

    engine.login(EMAIL, PASSWORD).await?;
    assert_eq!(notifier.subjects().len(), 2);

    let user = engine.change_login_notify(EMAIL, true).await?;
    assert!(user.login_notify);
    engine.login(EMAIL, PASSWORD).await?;
    assert_eq!(notifier.last().subject, "New login to your account");

    engine.change_login_notify(EMAIL, false).await?;
    engine.login(EMAIL, PASSWORD).await?;
    assert_eq!(notifier.subjects().len(), 3);
    Ok(())
}

#[tokio::test]
async fn best_effort_notifications_do_not_fail_the_operation() -> anyhow::Result<()> {
    let (engine, store) = engine();
    let engine = engine.with_notifier(Arc::new(RecordingNotifier::failing()));

    let pending = engine.preregister(EMAIL).await?;
    assert!(pending.verify_code.is_none());
    assert_eq!(store.row_counts().0, 1);
    Ok(())
}

#[tokio::test]
async fn required_notifications_roll_back_on_failure() {
    let (engine, store) =
        engine_with(config().with_notification_policy(NotificationPolicy::Required));
    let engine = engine.with_notifier(Arc::new(RecordingNotifier::failing()));

    let err = engine.preregister(EMAIL).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);
    assert_eq!(err.to_string(), "internal error");
    assert_eq!(store.row_counts().0, 0);
}

#[derive(Default)]
struct TxCounters {
    open: AtomicUsize,
    peak: AtomicUsize,
}

struct OpenTx(Arc<TxCounters>);

impl OpenTx {
    fn new(counters: &Arc<TxCounters>) -> Self {
        let open = counters.open.fetch_add(1, Ordering::SeqCst) + 1;
        counters.peak.fetch_max(open, Ordering::SeqCst);
        Self(Arc::clone(counters))
    }
}

impl Drop for OpenTx {
    fn drop(&mut self) {
        self.0.open.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Wraps a memory store, tracking how many transactions are open at once.
/// With `corrupt_names` set, renamed users come back altered.
struct TrackedStore {
    inner: MemoryStore,
    counters: Arc<TxCounters>,
    corrupt_names: bool,
}

impl TrackedStore {
    fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            counters: Arc::default(),
            corrupt_names: false,
        }
    }

    fn corrupting_names(inner: MemoryStore) -> Self {
        Self {
            corrupt_names: true,
            ..Self::new(inner)
        }
    }

    fn peak(&self) -> usize {
        self.counters.peak.load(Ordering::SeqCst)
    }
}

struct TrackedTx {
    inner: Box<dyn StoreTx>,
    corrupt_names: bool,
    _open: OpenTx,
}

#[async_trait::async_trait]
impl RecordStore for TrackedStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>> {
        let inner = self.inner.begin().await?;
        Ok(Box::new(TrackedTx {
            inner,
            corrupt_names: self.corrupt_names,
            _open: OpenTx::new(&self.counters),
        }))
    }

    async fn sweep_expired(&self) -> StoreResult<SweepReport> {
        self.inner.sweep_expired().await
    }
}

#[async_trait::async_trait]
impl StoreTx for TrackedTx {
    async fn create_user(&mut self, user: NewUser) -> StoreResult<User> {
        self.inner.create_user(user).await
    }
    async fn find_user_by_id(&mut self, user_id: Uuid) -> StoreResult<Option<User>> {
        self.inner.find_user_by_id(user_id).await
    }
    async fn find_user_by_email(&mut self, email: &str) -> StoreResult<Option<User>> {
        self.inner.find_user_by_email(email).await
    }
    async fn update_user_name(
        &mut self,
        user_id: Uuid,
        first_name: &str,
        last_name: &str,
    ) -> StoreResult<User> {
        let mut user = self
            .inner
            .update_user_name(user_id, first_name, last_name)
            .await?;
        if self.corrupt_names {
            user.first_name.push('x');
        }
        Ok(user)
    }
    async fn update_user_password(&mut self, user_id: Uuid, hash: &str) -> StoreResult<User> {
        self.inner.update_user_password(user_id, hash).await
    }
    async fn update_user_login_notify(
        &mut self,
        user_id: Uuid,
        enabled: bool,
    ) -> StoreResult<User> {
        self.inner.update_user_login_notify(user_id, enabled).await
    }
    async fn delete_user(&mut self, user_id: Uuid) -> StoreResult<()> {
        self.inner.delete_user(user_id).await
    }
    async fn create_pre_user(&mut self, email: &str, code: &str) -> StoreResult<PreUser> {
        self.inner.create_pre_user(email, code).await
    }
    async fn find_pre_user(&mut self, email: &str) -> StoreResult<Option<PreUser>> {
        self.inner.find_pre_user(email).await
    }
    async fn update_pre_user_code(&mut self, email: &str, code: &str) -> StoreResult<PreUser> {
        self.inner.update_pre_user_code(email, code).await
    }
    async fn increment_failed_attempts(&mut self, email: &str, by: i32) -> StoreResult<PreUser> {
        self.inner.increment_failed_attempts(email, by).await
    }
    async fn delete_pre_user(&mut self, email: &str) -> StoreResult<()> {
        self.inner.delete_pre_user(email).await
    }
    async fn create_session(
        &mut self,
        session_id: Uuid,
        client_token: Uuid,
        user_id: Uuid,
    ) -> StoreResult<Session> {
        self.inner
            .create_session(session_id, client_token, user_id)
            .await
    }
    async fn find_session_by_id(&mut self, session_id: Uuid) -> StoreResult<Option<Session>> {
        self.inner.find_session_by_id(session_id).await
    }
    async fn find_session_by_token(&mut self, client_token: Uuid) -> StoreResult<Option<Session>> {
        self.inner.find_session_by_token(client_token).await
    }
    async fn delete_session_by_id(&mut self, session_id: Uuid) -> StoreResult<()> {
        self.inner.delete_session_by_id(session_id).await
    }
    async fn delete_session_by_token(&mut self, client_token: Uuid) -> StoreResult<()> {
        self.inner.delete_session_by_token(client_token).await
    }
    async fn create_password_reset(
        &mut self,
        reset_code: Uuid,
        user_id: Uuid,
    ) -> StoreResult<PasswordReset> {
        self.inner.create_password_reset(reset_code, user_id).await
    }
    async fn find_password_reset_by_code(
        &mut self,
        reset_code: Uuid,
    ) -> StoreResult<Option<PasswordReset>> {
        self.inner.find_password_reset_by_code(reset_code).await
    }
    async fn find_password_reset_by_user(
        &mut self,
        user_id: Uuid,
    ) -> StoreResult<Option<PasswordReset>> {
        self.inner.find_password_reset_by_user(user_id).await
    }
    async fn delete_password_reset(&mut self, reset_code: Uuid) -> StoreResult<()> {
        self.inner.delete_password_reset(reset_code).await
    }
    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.inner.commit().await
    }
    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.inner.rollback().await
    }
}

#[tokio::test]
async fn divergence_is_an_internal_error_and_rolls_back() -> anyhow::Result<()> {
    let config = config();
    let memory = MemoryStore::new(config.expiry());
    let plain = Engine::new(Arc::new(memory.clone()), config.clone());
    registered(&plain, EMAIL).await;

    let engine = Engine::new(Arc::new(TrackedStore::corrupting_names(memory)), config);
    let err = engine
        .change_name(EMAIL, Some("Grace"), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);
    assert!(format!("{err:?}").contains("deviation from store"));

    let user = plain.change_name(EMAIL, None, None).await?;
    assert_eq!(user.first_name, "Ada");
    Ok(())
}

#[tokio::test]
async fn operations_never_hold_two_transactions() -> anyhow::Result<()> {
    let config = config();
    let store = Arc::new(TrackedStore::new(MemoryStore::new(config.expiry())));
    let engine = Engine::new(store.clone(), config);

    engine.preregister(EMAIL).await?;
    let code = engine.preregister(EMAIL).await?.verify_code.unwrap();
    engine
        .verify_code(EMAIL, &wrong_code(&code))
        .await
        .unwrap_err();
    engine
        .register(EMAIL, PASSWORD, "Ada", "Lovelace", &wrong_code(&code))
        .await
        .unwrap_err();
    engine
        .register(EMAIL, PASSWORD, "Ada", "Lovelace", &code)
        .await?;
    engine.login(EMAIL, PASSWORD).await?;

    assert_eq!(store.peak(), 1);
    Ok(())
}

#[tokio::test]
async fn racing_registers_admit_one_and_reject_the_other() -> anyhow::Result<()> {
    let (engine, store) = engine();
    let code = preregistered(&engine, EMAIL).await;

    let (first, second) = tokio::join!(
        engine.register(EMAIL, PASSWORD, "Ada", "Lovelace", &code),
        engine.register(EMAIL, PASSWORD, "Grace", "Hopper", &code),
    );
    let (winner, loser) = match (first, second) {
        (Ok(user), Err(err)) | (Err(err), Ok(user)) => (user, err),
        other => panic!("expected exactly one registration, got {other:?}"),
    };
    assert_eq!(loser.kind(), ErrorKind::Client);

    let mut tx = store.begin().await?;
    let stored = tx.find_user_by_email(EMAIL).await?.unwrap();
    assert_eq!(stored.user_id, winner.user_id);
    assert!(tx.find_pre_user(EMAIL).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn failed_resend_keeps_the_count_and_the_old_code() -> anyhow::Result<()> {
    let (plain, store) = engine();
    let code = preregistered(&plain, EMAIL).await;

    let strict = Engine::new(
        Arc::new(store.clone()),
        config().with_notification_policy(NotificationPolicy::Required),
    )
    .with_notifier(Arc::new(RecordingNotifier::failing()));
    let err = strict.preregister(EMAIL).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);

    let mut tx = store.begin().await?;
    let pre_user = tx.find_pre_user(EMAIL).await?.unwrap();
    tx.rollback().await?;
    assert_eq!(pre_user.failed_attempts, 1);
    assert_eq!(pre_user.verify_code, code);

    plain.verify_code(EMAIL, &code).await?;
    Ok(())
}

#[tokio::test]
async fn unknown_address_login_still_checks_a_hash() -> anyhow::Result<()> {
    let (engine, _store) = engine();
    registered(&engine, EMAIL).await;
    assert!(!engine.dummy_hash.initialized());

    let unknown = client_message(engine.login("nobody@b.com", PASSWORD).await);
    assert!(engine.dummy_hash.initialized());

    let wrong = client_message(engine.login(EMAIL, "wrong-password").await);
    assert_eq!(unknown, wrong);
    Ok(())
}
