//! Input validation, code generation and password hashing.

use anyhow::{Context, Result};
use rand::{rngs::OsRng, Rng};
use regex::Regex;

const MAX_EMAIL_BYTES: usize = 320;
const MAX_PASSWORD_BYTES: usize = 72;
const MAX_NAME_BYTES: usize = 32;

/// Normalize an email for lookup and uniqueness checks.
pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Format and length check on already-normalized input. Mixed case is rejected.
pub(crate) fn valid_email(email: &str) -> bool {
    email.len() <= MAX_EMAIL_BYTES
        && email.to_lowercase() == email
        && Regex::new(r"^[a-zA-Z0-9_.+-]+@[a-zA-Z0-9-]+\.[a-zA-Z0-9.-]+$")
            .is_ok_and(|regex| regex.is_match(email))
}

/// 8 to 72 characters from letters, digits and printable ASCII symbols.
/// bcrypt ignores input past 72 bytes, so longer passwords are refused.
pub(crate) fn valid_password(password: &str) -> bool {
    password.len() <= MAX_PASSWORD_BYTES
        && Regex::new(r#"^[a-zA-Z0-9`~!@#$%^&*()\-=_+\[\]}{\\|;:'",<.>/?]{8,72}$"#)
            .is_ok_and(|regex| regex.is_match(password))
}

pub(crate) fn valid_name(name: &str) -> bool {
    name.len() <= MAX_NAME_BYTES
        && Regex::new(r"^[a-zA-Z-]+$").is_ok_and(|regex| regex.is_match(name))
}

pub(crate) fn valid_verify_code(code: &str, length: usize) -> bool {
    code.len() == length && code.bytes().all(|b| b.is_ascii_digit())
}

/// Random decimal string drawn from the OS CSPRNG.
pub(crate) fn random_digits(length: usize) -> String {
    (0..length)
        .map(|_| char::from(b'0' + OsRng.gen_range(0..10u8)))
        .collect()
}

pub(crate) fn hash_password(password: &str, cost: u32) -> Result<String> {
    bcrypt::hash(password, cost).context("failed to hash password")
}

pub(crate) fn verify_password(password: &str, password_hash: &str) -> Result<bool> {
    bcrypt::verify(password, password_hash).context("failed to verify password hash")
}
