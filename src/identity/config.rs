use crate::store::Expiry;

pub const DEFAULT_ALLOWED_FAILED_VERIFICATIONS: i32 = 5;
pub const DEFAULT_VERIFY_CODE_LENGTH: usize = 6;
pub const DEFAULT_PRE_USER_TTL_SECONDS: i64 = 24 * 60 * 60;
pub const DEFAULT_SESSION_TTL_SECONDS: i64 = 12 * 60 * 60;
pub const DEFAULT_PASSWORD_RESET_TTL_SECONDS: i64 = 12 * 60 * 60;
pub const DEFAULT_HASH_COST: u32 = bcrypt::DEFAULT_COST;

const MAX_VERIFY_CODE_LENGTH: usize = 16;
/// bcrypt accepts costs in this range only.
pub const MIN_HASH_COST: u32 = 4;
const MAX_HASH_COST: u32 = 31;

/// What a failed notification send means for the operation that triggered it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NotificationPolicy {
    /// Log the failure and carry on.
    #[default]
    BestEffort,
    /// Fail the operation, rolling back its writes.
    Required,
}

/// Immutable engine settings, built once at startup.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    allowed_failed_verifications: i32,
    verify_code_length: usize,
    pre_user_ttl_seconds: i64,
    session_ttl_seconds: i64,
    password_reset_ttl_seconds: i64,
    hash_cost: u32,
    notification_policy: NotificationPolicy,
}

impl EngineConfig {
    /// Defaults: 5 failed verifications, 6 digit codes, 24h pre-registration,
    /// 12h sessions and reset grants, bcrypt cost 12.
    #[must_use]
    pub fn new() -> Self {
        Self {
            allowed_failed_verifications: DEFAULT_ALLOWED_FAILED_VERIFICATIONS,
            verify_code_length: DEFAULT_VERIFY_CODE_LENGTH,
            pre_user_ttl_seconds: DEFAULT_PRE_USER_TTL_SECONDS,
            session_ttl_seconds: DEFAULT_SESSION_TTL_SECONDS,
            password_reset_ttl_seconds: DEFAULT_PASSWORD_RESET_TTL_SECONDS,
            hash_cost: DEFAULT_HASH_COST,
            notification_policy: NotificationPolicy::BestEffort,
        }
    }

    #[must_use]
    pub fn with_allowed_failed_verifications(mut self, attempts: i32) -> Self {
        self.allowed_failed_verifications = attempts;
        self
    }

    #[must_use]
    pub fn with_verify_code_length(mut self, length: usize) -> Self {
        self.verify_code_length = length;
        self
    }

    #[must_use]
    pub fn with_pre_user_ttl_seconds(mut self, seconds: i64) -> Self {
        self.pre_user_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_session_ttl_seconds(mut self, seconds: i64) -> Self {
        self.session_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_password_reset_ttl_seconds(mut self, seconds: i64) -> Self {
        self.password_reset_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_hash_cost(mut self, cost: u32) -> Self {
        self.hash_cost = cost;
        self
    }

    #[must_use]
    pub fn with_notification_policy(mut self, policy: NotificationPolicy) -> Self {
        self.notification_policy = policy;
        self
    }

    /// Clamp every setting into a usable range.
    #[must_use]
    pub fn normalize(self) -> Self {
        Self {
            allowed_failed_verifications: self.allowed_failed_verifications.max(1),
            verify_code_length: self.verify_code_length.clamp(1, MAX_VERIFY_CODE_LENGTH),
            pre_user_ttl_seconds: self.pre_user_ttl_seconds.max(1),
            session_ttl_seconds: self.session_ttl_seconds.max(1),
            password_reset_ttl_seconds: self.password_reset_ttl_seconds.max(1),
            hash_cost: self.hash_cost.clamp(MIN_HASH_COST, MAX_HASH_COST),
            notification_policy: self.notification_policy,
        }
    }

    #[must_use]
    pub fn allowed_failed_verifications(&self) -> i32 {
        self.allowed_failed_verifications
    }

    #[must_use]
    pub fn verify_code_length(&self) -> usize {
        self.verify_code_length
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

    #[must_use]
    pub fn hash_cost(&self) -> u32 {
        self.hash_cost
    }

    #[must_use]
    pub fn notification_policy(&self) -> NotificationPolicy {
        self.notification_policy
    }

    /// TTLs in the form the record store expects.
    #[must_use]
    pub fn expiry(&self) -> Expiry {
        Expiry::new(
            self.pre_user_ttl_seconds,
            self.session_ttl_seconds,
            self.password_reset_ttl_seconds,
        )
    }

    /// Human form of the pre-registration window, used in lockout messages.
    pub(crate) fn lockout_period(&self) -> String {
        let seconds = self.pre_user_ttl_seconds;
        if seconds % 3600 == 0 {
            format!("{} hour", seconds / 3600)
        } else {
            format!("{seconds} second")
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}
