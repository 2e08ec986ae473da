//! Authentication module for managing tokens and credentials.
//!
//! This module provides:
//! - `AccessToken`: JWT bearer token with unverified `exp` decoding
//! - `TokenPair`: the access/refresh pair returned by login and refresh
//! - `CredentialStore`: durable key/value storage for the refresh token and
//!   cached user profile (keychain, file, or in-memory)
//! - `SessionEvent`: notifications of session lifecycle transitions
//!
//! Access tokens live only in memory. Refresh tokens are rotated on every
//! refresh and persisted so a cold start can resume the session.

pub mod credentials;
pub mod session;
pub mod token;

pub use credentials::{
    CredentialStore, FileStore, KeyringStore, MemoryStore, REFRESH_TOKEN_KEY, USER_KEY,
};
pub use session::{SessionEvent, TerminationReason};
pub use token::{AccessToken, TokenPair};
