//! REST API access for the FOLIO LMS backend.
//!
//! This module provides the `Gateway`, which attaches bearer tokens to
//! outbound requests, refreshes expiring or rejected access tokens with a
//! single refresh call shared by every waiting request, and tears the session
//! down when authentication can't be recovered.
//!
//! `ApiClient` layers login/logout, typed JSON helpers and rate-limit backoff
//! on top of the gateway.

pub mod client;
pub mod error;
pub mod gateway;
pub mod request;

pub use client::{ApiClient, ListParams, LoginResponse};
pub use error::{ApiError, GatewayError, RefreshError};
pub use gateway::Gateway;
pub use request::ApiRequest;
