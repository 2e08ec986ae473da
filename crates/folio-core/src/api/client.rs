//! Typed API client for the FOLIO LMS backend.
//!
//! `ApiClient` sits on top of the `Gateway`: it logs in and out, decodes JSON
//! responses, maps error statuses to `ApiError`, and retries rate-limited
//! requests with exponential backoff. Authentication failures are handled by
//! the gateway before they reach this layer.

use std::time::Duration;

use reqwest::{Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{ApiError, ApiRequest, Gateway};
use crate::auth::SessionEvent;
use crate::config::LOGIN_PATH;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

/// Body returned by `POST /auth/login`.
#[derive(Deserialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub user: Option<serde_json::Value>,
}

/// Filtering and paging for list endpoints (catalog, users, reserves).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListParams {
    pub query: Option<String>,
    pub offset: Option<u32>,
    pub limit: Option<u32>,
    pub sort: Option<String>,
}

impl ListParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn page(mut self, offset: u32, limit: u32) -> Self {
        self.offset = Some(offset);
        self.limit = Some(limit);
        self
    }

    pub fn sort(mut self, sort: impl Into<String>) -> Self {
        self.sort = Some(sort.into());
        self
    }

    fn apply(&self, mut request: ApiRequest) -> ApiRequest {
        if let Some(ref query) = self.query {
            request = request.query("query", query.as_str());
        }
        if let Some(offset) = self.offset {
            request = request.query("offset", offset.to_string());
        }
        if let Some(limit) = self.limit {
            request = request.query("limit", limit.to_string());
        }
        if let Some(ref sort) = self.sort {
            request = request.query("sort", sort.as_str());
        }
        request
    }
}

/// Clone is cheap - the gateway is shared between clones.
#[derive(Clone)]
pub struct ApiClient {
    gateway: Gateway,
    initial_backoff: Duration,
}

impl ApiClient {
    pub fn new(gateway: Gateway) -> Self {
        Self {
            gateway,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        }
    }

    /// Override the first rate-limit backoff delay
    pub fn with_backoff(mut self, initial: Duration) -> Self {
        self.initial_backoff = initial;
        self
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    /// Authenticate and install the issued tokens. Returns the user profile
    /// when the backend includes one.
    pub async fn login(&self, username: &str, password: &str) -> Result<Option<serde_json::Value>, ApiError> {
        let request = ApiRequest::post(LOGIN_PATH).json(&LoginRequest { username, password })?;
        let response = self.gateway.dispatch(request).await?;
        let response = Self::check_response(response).await?;

        let login: LoginResponse = response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse login response: {}", e)))?;

        self.gateway.set_tokens(login.access_token, login.refresh_token);
        if let Some(ref user) = login.user {
            self.gateway.cache_user(user);
        }
        self.gateway.notify(SessionEvent::LoggedIn);
        info!(username, "Login successful");

        Ok(login.user)
    }

    /// End the session locally
    pub fn logout(&self) {
        self.gateway.clear_tokens();
        self.gateway.notify(SessionEvent::LoggedOut);
        info!("Logged out");
    }

    /// Dispatch a request, retrying 429s with exponential backoff and
    /// mapping any other error status to `ApiError`.
    pub async fn send(&self, request: ApiRequest) -> Result<Response, ApiError> {
        let mut retries = 0;
        let mut backoff = self.initial_backoff;

        loop {
            let response = self.gateway.dispatch(request.clone()).await?;
            if response.status() != StatusCode::TOO_MANY_REQUESTS {
                return Self::check_response(response).await;
            }

            retries += 1;
            if retries > MAX_RATE_LIMIT_RETRIES {
                return Err(ApiError::RateLimited);
            }
            warn!(
                path = %request.path,
                retry = retries,
                backoff_ms = backoff.as_millis() as u64,
                "Rate limited, backing off"
            );
            tokio::time::sleep(backoff).await;
            backoff *= 2;
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let response = self.send(ApiRequest::get(path)).await?;
        Self::decode(response).await
    }

    pub async fn list<T: DeserializeOwned>(&self, path: &str, params: &ListParams) -> Result<T, ApiError> {
        let response = self.send(params.apply(ApiRequest::get(path))).await?;
        Self::decode(response).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        let response = self.send(ApiRequest::post(path).json(body)?).await?;
        Self::decode(response).await
    }

    pub async fn put<T: DeserializeOwned, B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        let response = self.send(ApiRequest::put(path).json(body)?).await?;
        Self::decode(response).await
    }

    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        self.send(ApiRequest::delete(path)).await?;
        Ok(())
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: Response) -> Result<Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    /// Decode a JSON body. Empty bodies (204) decode as `null`.
    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
        let url = response.url().path().to_string();
        let text = response.text().await?;
        let text = if text.trim().is_empty() { "null" } else { text.as_str() };
        serde_json::from_str(text).map_err(|e| {
            debug!(path = %url, error = %e, "Unexpected response body");
            ApiError::InvalidResponse(format!("Failed to parse JSON response from {}: {}", url, e))
        })
    }
}
