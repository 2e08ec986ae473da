// Shared by several test binaries; not every helper is used in each.
#![allow(dead_code)]

use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use folio_core::auth::MemoryStore;
use folio_core::{Gateway, GatewayConfig, SessionEvent};
use tokio::sync::broadcast;

pub fn gateway(server_url: &str) -> (Gateway, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let gateway = Gateway::new(GatewayConfig::new(server_url), store.clone()).unwrap();
    (gateway, store)
}

pub fn jwt_with_exp(exp: i64) -> String {
    format!(
        "{}.{}.signature",
        URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#),
        URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"u1","exp":{}}}"#, exp))
    )
}

/// JWT whose `exp` is `secs` seconds from now, rounded down.
pub fn jwt_expiring_in(secs: i64) -> String {
    jwt_with_exp(Utc::now().timestamp() + secs)
}

pub fn token_body(access: &str, refresh: &str) -> String {
    serde_json::json!({ "access_token": access, "refresh_token": refresh }).to_string()
}

pub fn drain(events: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}
