//! Access and refresh token types.
//!
//! The `exp` claim is read from the JWT payload without verifying the
//! signature. It is only used to schedule refreshes; authorization is
//! enforced by the server.

use std::fmt;

use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Tokens closer than this to their `exp` are refreshed before use.
pub const DEFAULT_REFRESH_MARGIN_SECS: i64 = 120;

#[derive(Debug, Deserialize)]
struct Claims {
    exp: Option<f64>,
}

/// A JWT bearer token held in memory only.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Expiry in Unix milliseconds, or `None` if the payload can't be decoded
    /// or `exp` is outside the representable range.
    pub fn expires_at_ms(&self) -> Option<i64> {
        let exp_ms = decode_claims(&self.0)?.exp? * 1000.0;
        if exp_ms.is_finite() && exp_ms >= i64::MIN as f64 && exp_ms < i64::MAX as f64 {
            Some(exp_ms as i64)
        } else {
            None
        }
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at_ms().and_then(DateTime::from_timestamp_millis)
    }

    /// A token is still valid when `exp_ms - now_ms >= margin`.
    /// Undecodable tokens count as expiring.
    pub fn is_expiring_at(&self, now_ms: i64, margin: Duration) -> bool {
        match self.expires_at_ms() {
            Some(exp_ms) => exp_ms.saturating_sub(now_ms) < margin.num_milliseconds(),
            None => true,
        }
    }

    pub fn is_expiring(&self, margin: Duration) -> bool {
        self.is_expiring_at(Utc::now().timestamp_millis(), margin)
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AccessToken").field(&"<redacted>").finish()
    }
}

impl From<String> for AccessToken {
    fn from(token: String) -> Self {
        Self(token)
    }
}

/// Access/refresh pair as returned by `/auth/refresh`.
#[derive(Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

fn decode_claims(jwt: &str) -> Option<Claims> {
    let mut parts = jwt.split('.');
    let payload = match (parts.next(), parts.next()) {
        (Some(_), Some(payload)) if !payload.is_empty() => payload,
        _ => return None,
    };

    // Some issuers pad their segments
    let bytes = URL_SAFE_NO_PAD.decode(payload).ok().or_else(|| {
        let padded = match payload.len() % 4 {
            2 => format!("{}==", payload),
            3 => format!("{}=", payload),
            _ => payload.to_string(),
        };
        STANDARD
            .decode(padded.replace('-', "+").replace('_', "/"))
            .ok()
    })?;

    serde_json::from_slice(&bytes).ok()
}
