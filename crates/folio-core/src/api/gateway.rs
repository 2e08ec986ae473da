//! Authenticated request gateway.
//!
//! Every non-public request carries the current access token. Tokens within
//! the refresh margin of their `exp` are refreshed before sending, and a 401
//! triggers one refresh and one replay. Concurrent refreshes collapse onto a
//! single `/auth/refresh` call whose outcome every waiter shares. When
//! authentication can't be recovered the tokens and cached profile are wiped
//! and `SessionEvent::Terminated` is broadcast.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::{Client, Response, StatusCode};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{ApiError, ApiRequest, GatewayError, RefreshError};
use crate::auth::session::SessionTokens;
use crate::auth::{
    AccessToken, CredentialStore, SessionEvent, TerminationReason, TokenPair, REFRESH_TOKEN_KEY,
    USER_KEY,
};
use crate::config::{GatewayConfig, REFRESH_PATH};

/// Buffered session events per subscriber
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// The one outstanding refresh, shared by every caller that needs a token.
type RefreshFlight = Shared<BoxFuture<'static, Result<AccessToken, RefreshError>>>;

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

/// Handle to the session's gateway. Clone is cheap; clones share tokens,
/// the in-flight refresh and the event channel.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<Inner>,
}

struct Inner {
    client: Client,
    config: GatewayConfig,
    store: Arc<dyn CredentialStore>,
    tokens: Mutex<SessionTokens>,
    in_flight: Mutex<Option<RefreshFlight>>,
    events: broadcast::Sender<SessionEvent>,
}

impl Gateway {
    pub fn new(config: GatewayConfig, store: Arc<dyn CredentialStore>) -> Result<Self, GatewayError> {
        let client = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self::with_client(client, config, store))
    }

    /// Build a gateway around an existing client, sharing its connection pool.
    pub fn with_client(client: Client, config: GatewayConfig, store: Arc<dyn CredentialStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                client,
                config,
                store,
                tokens: Mutex::new(SessionTokens::default()),
                in_flight: Mutex::new(None),
                events,
            }),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Install a freshly issued token pair. The refresh token is persisted.
    pub fn set_tokens(&self, access: impl Into<String>, refresh: impl Into<String>) {
        let pair = TokenPair {
            access_token: access.into(),
            refresh_token: refresh.into(),
        };
        self.inner.install(&pair);
    }

    pub fn access_token(&self) -> Option<AccessToken> {
        self.inner.tokens().access()
    }

    /// Wipe in-memory tokens, the durable refresh token and the cached
    /// profile. Safe to call repeatedly.
    pub fn clear_tokens(&self) {
        self.inner.clear_tokens();
    }

    /// Whether a request could be authenticated without logging in again.
    pub fn has_session(&self) -> bool {
        if self.access_token().is_some() || self.inner.tokens().refresh().is_some() {
            return true;
        }
        matches!(self.inner.store.get(REFRESH_TOKEN_KEY), Ok(Some(_)))
    }

    pub fn cached_user(&self) -> Option<serde_json::Value> {
        let raw = match self.inner.store.get(USER_KEY) {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(error = %e, "Failed to read cached user profile");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(user) => Some(user),
            Err(e) => {
                warn!(error = %e, "Cached user profile is not valid JSON");
                None
            }
        }
    }

    pub fn cache_user(&self, user: &serde_json::Value) {
        if let Err(e) = self.inner.store.set(USER_KEY, &user.to_string()) {
            warn!(error = %e, "Failed to cache user profile");
        }
    }

    pub(crate) fn notify(&self, event: SessionEvent) {
        self.inner.notify(event);
    }

    /// Send a request, handling token injection, refresh and replay.
    ///
    /// Responses with any status other than an unrecoverable 401 are
    /// returned unchanged, as are transport errors.
    pub async fn dispatch(&self, mut request: ApiRequest) -> Result<Response, GatewayError> {
        let url = self.inner.config.url(&request.path);

        if self.inner.config.is_public(&request.path) {
            debug!(method = %request.method, path = %request.path, "Sending unauthenticated request");
            return Ok(request.build(&self.inner.client, &url, None)?.send().await?);
        }

        // Snapshot before the first suspension point
        let mut token = self.access_token();
        let mut refresh_failure = None;

        let expiring = token
            .as_ref()
            .is_some_and(|t| t.is_expiring(self.inner.config.refresh_margin));
        if expiring {
            debug!(path = %request.path, "Access token expiring, refreshing before send");
            match self.refresh().await {
                Ok(fresh) => token = Some(fresh),
                Err(e) => {
                    warn!(error = %e, path = %request.path, "Refresh failed, sending without token");
                    token = None;
                    refresh_failure = Some(e);
                }
            }
        }

        let response = self.send(&request, &url, token.as_ref()).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        // Already torn down by the failed refresh above
        if let Some(e) = refresh_failure {
            return Err(e.into());
        }

        debug!(method = %request.method, path = %request.path, "Unauthorized, refreshing and retrying once");
        request.mark_retried();
        let fresh = self.refresh().await?;

        let response = self.send(&request, &url, Some(&fresh)).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            warn!(method = %request.method, path = %request.path, "Still unauthorized after refresh");
            self.inner.terminate(TerminationReason::Rejected);
            return Err(GatewayError::AuthenticationRejected);
        }

        Ok(response)
    }

    /// Obtain a new access token, joining the refresh already in flight if
    /// there is one. A failed refresh ends the session.
    pub async fn refresh(&self) -> Result<AccessToken, RefreshError> {
        let flight = {
            let mut slot = self.inner.in_flight();
            if let Some(flight) = slot.clone() {
                debug!("Joining in-flight token refresh");
                flight
            } else {
                let inner = Arc::clone(&self.inner);
                let flight = async move {
                    let result = inner.perform_refresh().await;
                    if let Err(ref e) = result {
                        inner.terminate(e.termination_reason());
                    }
                    inner.in_flight().take();
                    result
                }
                .boxed()
                .shared();
                *slot = Some(flight.clone());
                flight
            }
        };

        flight.await
    }

    async fn send(
        &self,
        request: &ApiRequest,
        url: &str,
        token: Option<&AccessToken>,
    ) -> Result<Response, GatewayError> {
        let response = request.build(&self.inner.client, url, token)?.send().await?;
        debug!(
            method = %request.method,
            path = %request.path,
            status = response.status().as_u16(),
            authenticated = token.is_some(),
            retried = request.is_retried(),
            "Request completed"
        );
        Ok(response)
    }
}

impl Inner {
    fn tokens(&self) -> MutexGuard<'_, SessionTokens> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn in_flight(&self) -> MutexGuard<'_, Option<RefreshFlight>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn install(&self, pair: &TokenPair) {
        self.tokens().update(pair);
        if let Err(e) = self.store.set(REFRESH_TOKEN_KEY, &pair.refresh_token) {
            warn!(error = %e, "Failed to persist refresh token");
        }
    }

    fn clear_tokens(&self) {
        self.tokens().clear();
        for key in [REFRESH_TOKEN_KEY, USER_KEY] {
            if let Err(e) = self.store.remove(key) {
                warn!(key, error = %e, "Failed to remove stored credential");
            }
        }
    }

    fn terminate(&self, reason: TerminationReason) {
        self.clear_tokens();
        warn!(%reason, "Session terminated");
        self.notify(SessionEvent::Terminated(reason));
    }

    async fn perform_refresh(&self) -> Result<AccessToken, RefreshError> {
        let cached = self.tokens().refresh();
        let refresh_token = match cached {
            Some(token) => token,
            None => match self.store.get(REFRESH_TOKEN_KEY) {
                Ok(Some(token)) => {
                    debug!("Using refresh token from durable storage");
                    token
                }
                Ok(None) => return Err(RefreshError::NoRefreshToken),
                Err(e) => {
                    warn!(error = %e, "Failed to read refresh token from storage");
                    return Err(RefreshError::NoRefreshToken);
                }
            },
        };

        debug!("Requesting new access token");
        let response = self
            .client
            .post(self.config.url(REFRESH_PATH))
            .json(&RefreshRequest {
                refresh_token: &refresh_token,
            })
            .send()
            .await
            .map_err(|e| RefreshError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RefreshError::Rejected {
                status: status.as_u16(),
                body: ApiError::truncate_body(&body),
            });
        }

        let pair: TokenPair = response
            .json()
            .await
            .map_err(|e| RefreshError::InvalidResponse(e.to_string()))?;

        self.install(&pair);
        info!("Access token refreshed");
        self.notify(SessionEvent::Refreshed);

        Ok(AccessToken::new(pair.access_token))
    }
}
