//! Core library for the FOLIO LMS client.
//!
//! - `api`: the authenticated request gateway and a typed client on top of it
//! - `auth`: access/refresh tokens, durable credential storage, session events
//! - `config`: persisted client configuration

pub mod api;
pub mod auth;
pub mod config;

pub use api::{ApiClient, ApiError, ApiRequest, Gateway, GatewayError, ListParams};
pub use auth::{CredentialStore, SessionEvent};
pub use config::{Config, GatewayConfig};
