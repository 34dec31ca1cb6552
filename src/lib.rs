//! # Signet
//!
//! `signet` is a user identity and session lifecycle engine: email
//! preregistration with numeric verification codes and brute-force lockout,
//! account creation and maintenance, bearer-token sessions, and single-use
//! password reset grants.
//!
//! The engine ([`identity::Engine`]) is transport agnostic. It takes
//! already-parsed values and returns records or a classified
//! [`identity::Error`]; mapping those onto HTTP or any other surface is up to
//! the caller. State lives in a [`store::RecordStore`] (PostgreSQL in
//! production), and ephemeral records expire at read time and are reclaimed by
//! [`identity::sweeper`].
//!
//! The `signet` binary applies database migrations and runs the expiry sweeper.

pub mod cli;
pub mod identity;
pub mod store;
