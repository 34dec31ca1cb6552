use crate::identity::EngineConfig;
use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};

pub const ARG_PRE_USER_TTL_HOURS: &str = "pre-user-ttl-hours";
pub const ARG_SESSION_TTL_HOURS: &str = "session-ttl-hours";
pub const ARG_PASSWORD_RESET_TTL_HOURS: &str = "password-reset-ttl-hours";
pub const ARG_ALLOWED_FAILED_VERIFICATIONS: &str = "allowed-failed-verifications";
pub const ARG_VERIFY_CODE_LENGTH: &str = "verify-code-length";

const SECONDS_PER_HOUR: i64 = 60 * 60;

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_PRE_USER_TTL_HOURS)
                .long(ARG_PRE_USER_TTL_HOURS)
                .help("Hours a preregistration stays valid; also the lockout window")
                .env("SIGNET_PRE_USER_TTL_HOURS")
                .default_value("24")
                .global(true)
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new(ARG_SESSION_TTL_HOURS)
                .long(ARG_SESSION_TTL_HOURS)
                .help("Hours a login session stays valid")
                .env("SIGNET_SESSION_TTL_HOURS")
                .default_value("12")
                .global(true)
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new(ARG_PASSWORD_RESET_TTL_HOURS)
                .long(ARG_PASSWORD_RESET_TTL_HOURS)
                .help("Hours a password reset grant stays valid")
                .env("SIGNET_PASSWORD_RESET_TTL_HOURS")
                .default_value("12")
                .global(true)
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new(ARG_ALLOWED_FAILED_VERIFICATIONS)
                .long(ARG_ALLOWED_FAILED_VERIFICATIONS)
                .help("Failed verifications and resends allowed before lockout")
                .env("SIGNET_ALLOWED_FAILED_VERIFICATIONS")
                .default_value("5")
                .global(true)
                .value_parser(clap::value_parser!(i32).range(1..)),
        )
        .arg(
            Arg::new(ARG_VERIFY_CODE_LENGTH)
                .long(ARG_VERIFY_CODE_LENGTH)
                .help("Number of digits in a verification code")
                .env("SIGNET_VERIFY_CODE_LENGTH")
                .default_value("6")
                .global(true)
                .value_parser(clap::value_parser!(u8).range(1..=16)),
        )
}

/// Build the engine config from parsed arguments.
///
/// # Errors
/// Returns an error if a defaulted argument is missing.
pub fn parse(matches: &ArgMatches) -> Result<EngineConfig> {
    let ttl_seconds = |arg: &str| -> Result<i64> {
        let hours = matches
            .get_one::<i64>(arg)
            .copied()
            .with_context(|| format!("missing required argument: --{arg}"))?;
        Ok(hours.saturating_mul(SECONDS_PER_HOUR))
    };

    let attempts = matches
        .get_one::<i32>(ARG_ALLOWED_FAILED_VERIFICATIONS)
        .copied()
        .context("missing required argument: --allowed-failed-verifications")?;
    let code_length = matches
        .get_one::<u8>(ARG_VERIFY_CODE_LENGTH)
        .copied()
        .context("missing required argument: --verify-code-length")?;

    Ok(EngineConfig::new()
        .with_pre_user_ttl_seconds(ttl_seconds(ARG_PRE_USER_TTL_HOURS)?)
        .with_session_ttl_seconds(ttl_seconds(ARG_SESSION_TTL_HOURS)?)
        .with_password_reset_ttl_seconds(ttl_seconds(ARG_PASSWORD_RESET_TTL_HOURS)?)
        .with_allowed_failed_verifications(attempts)
        .with_verify_code_length(usize::from(code_length))
        .normalize())
}
