use std::fmt;

use super::token::{AccessToken, TokenPair};

/// Why a session was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// No refresh token in memory or durable storage
    NoRefreshToken,
    /// The refresh endpoint rejected the token or could not be reached
    RefreshFailed,
    /// A request was still unauthorized after a successful refresh
    Rejected,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TerminationReason::NoRefreshToken => "no refresh token available",
            TerminationReason::RefreshFailed => "token refresh failed",
            TerminationReason::Rejected => "request rejected after refresh",
        };
        f.write_str(text)
    }
}

/// Session lifecycle notifications broadcast by the gateway.
///
/// `Terminated` is only sent after the session's tokens and cached profile
/// have been wiped, so a listener can route straight to the login screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    LoggedIn,
    Refreshed,
    Terminated(TerminationReason),
    LoggedOut,
}

/// In-memory token pair. The durable refresh token copy lives in the
/// credential store; this is a cache of it.
#[derive(Default)]
pub(crate) struct SessionTokens {
    access: Option<AccessToken>,
    refresh: Option<String>,
}

impl SessionTokens {
    pub fn update(&mut self, pair: &TokenPair) {
        self.access = Some(AccessToken::new(pair.access_token.clone()));
        self.refresh = Some(pair.refresh_token.clone());
    }

    pub fn clear(&mut self) {
        self.access = None;
        self.refresh = None;
    }

    pub fn access(&self) -> Option<AccessToken> {
        self.access.clone()
    }

    pub fn refresh(&self) -> Option<String> {
        self.refresh.clone()
    }
}

impl fmt::Debug for SessionTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionTokens")
            .field("has_access", &self.access.is_some())
            .field("has_refresh", &self.refresh.is_some())
            .finish()
    }
}
