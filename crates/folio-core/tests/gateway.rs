mod common;

use chrono::Utc;
use folio_core::auth::{CredentialStore, TerminationReason, REFRESH_TOKEN_KEY, USER_KEY};
use folio_core::api::RefreshError;
use folio_core::{ApiRequest, GatewayError, SessionEvent};
use futures::future::join_all;
use mockito::{Matcher, Server};
use serde_json::json;

use common::{drain, gateway, jwt_expiring_in, jwt_with_exp, token_body};

#[tokio::test]
async fn concurrent_dispatches_share_one_refresh() {
    let mut server = Server::new_async().await;
    let (gateway, store) = gateway(&server.url());
    gateway.set_tokens(jwt_expiring_in(60), "R1");

    let refresh = server
        .mock("POST", "/auth/refresh")
        .match_body(Matcher::Json(json!({ "refresh_token": "R1" })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(token_body("A2", "R2"))
        .expect(1)
        .create_async()
        .await;
    let users = server
        .mock("GET", "/users")
        .match_header("authorization", "Bearer A2")
        .with_status(200)
        .with_body("[]")
        .expect(2)
        .create_async()
        .await;

    let (first, second) = tokio::join!(
        gateway.dispatch(ApiRequest::get("/users")),
        gateway.dispatch(ApiRequest::get("/users")),
    );

    assert_eq!(first.unwrap().status(), 200);
    assert_eq!(second.unwrap().status(), 200);
    refresh.assert_async().await;
    users.assert_async().await;
    assert_eq!(store.get(REFRESH_TOKEN_KEY).unwrap().as_deref(), Some("R2"));
}

#[tokio::test]
async fn many_waiters_observe_the_same_refresh() {
    let mut server = Server::new_async().await;
    let (gateway, _store) = gateway(&server.url());
    gateway.set_tokens(jwt_expiring_in(10), "R1");
    let fresh = jwt_expiring_in(3600);

    let refresh = server
        .mock("POST", "/auth/refresh")
        .with_status(200)
        .with_body(token_body(&fresh, "R2"))
        .expect(1)
        .create_async()
        .await;
    let loans = server
        .mock("GET", "/circulation/loans")
        .match_header("authorization", format!("Bearer {}", fresh).as_str())
        .with_status(200)
        .with_body("{}")
        .expect(5)
        .create_async()
        .await;

    let results = join_all((0..5).map(|_| gateway.dispatch(ApiRequest::get("/circulation/loans")))).await;

    for result in results {
        assert_eq!(result.unwrap().status(), 200);
    }
    refresh.assert_async().await;
    loans.assert_async().await;
    assert_eq!(gateway.access_token().unwrap().as_str(), fresh);
}

#[tokio::test]
async fn concurrent_waiters_fail_identically() {
    let mut server = Server::new_async().await;
    let (gateway, store) = gateway(&server.url());
    gateway.set_tokens(jwt_expiring_in(30), "R1");
    let mut events = gateway.subscribe();

    let refresh = server
        .mock("POST", "/auth/refresh")
        .with_status(500)
        .with_body("refresh backend down")
        .expect(1)
        .create_async()
        .await;
    let users = server
        .mock("GET", "/users")
        .match_header("authorization", Matcher::Missing)
        .with_status(401)
        .expect(3)
        .create_async()
        .await;

    let results = join_all((0..3).map(|_| gateway.dispatch(ApiRequest::get("/users")))).await;

    for result in results {
        match result {
            Err(GatewayError::RefreshRequestFailed(e)) => assert_eq!(
                e,
                folio_core::api::RefreshError::Rejected {
                    status: 500,
                    body: "refresh backend down".into(),
                }
            ),
            other => panic!("unexpected result: {:?}", other.map(|r| r.status())),
        }
    }
    refresh.assert_async().await;
    users.assert_async().await;
    assert!(gateway.access_token().is_none());
    assert_eq!(store.get(REFRESH_TOKEN_KEY).unwrap(), None);
    assert_eq!(
        drain(&mut events),
        vec![SessionEvent::Terminated(TerminationReason::RefreshFailed)]
    );
}

#[tokio::test]
async fn token_inside_margin_is_refreshed_before_sending() {
    let mut server = Server::new_async().await;
    let (gateway, _store) = gateway(&server.url());
    let now_secs = Utc::now().timestamp_millis() / 1000;
    gateway.set_tokens(jwt_with_exp(now_secs + 119), "R1");

    let refresh = server
        .mock("POST", "/auth/refresh")
        .with_status(200)
        .with_body(token_body("A2", "R2"))
        .expect(1)
        .create_async()
        .await;
    let instances = server
        .mock("GET", "/inventory/instances")
        .match_header("authorization", "Bearer A2")
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let response = gateway
        .dispatch(ApiRequest::get("/inventory/instances"))
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    refresh.assert_async().await;
    instances.assert_async().await;
}

#[tokio::test]
async fn token_outside_margin_is_sent_as_is() {
    let mut server = Server::new_async().await;
    let (gateway, _store) = gateway(&server.url());
    // Round up so sub-second drift can't pull it inside the margin
    let next_secs = Utc::now().timestamp_millis() / 1000 + 1;
    let token = jwt_with_exp(next_secs + 121);
    gateway.set_tokens(token.clone(), "R1");

    let refresh = server
        .mock("POST", "/auth/refresh")
        .expect(0)
        .create_async()
        .await;
    let instances = server
        .mock("GET", "/inventory/instances")
        .match_header("authorization", format!("Bearer {}", token).as_str())
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let response = gateway
        .dispatch(ApiRequest::get("/inventory/instances"))
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    refresh.assert_async().await;
    instances.assert_async().await;
}

#[tokio::test]
async fn unauthorized_request_is_retried_once_with_new_token() {
    let mut server = Server::new_async().await;
    let (gateway, store) = gateway(&server.url());
    let stale = jwt_expiring_in(3600);
    let fresh = jwt_expiring_in(3600 * 2);
    gateway.set_tokens(stale.clone(), "R1");

    let rejected = server
        .mock("PUT", "/users/u1")
        .match_header("authorization", format!("Bearer {}", stale).as_str())
        .with_status(401)
        .expect(1)
        .create_async()
        .await;
    let refresh = server
        .mock("POST", "/auth/refresh")
        .match_body(Matcher::Json(json!({ "refresh_token": "R1" })))
        .with_status(200)
        .with_body(token_body(&fresh, "R2"))
        .expect(1)
        .create_async()
        .await;
    let accepted = server
        .mock("PUT", "/users/u1")
        .match_header("authorization", format!("Bearer {}", fresh).as_str())
        .match_body(Matcher::Json(json!({ "active": false })))
        .with_status(204)
        .expect(1)
        .create_async()
        .await;

    let request = ApiRequest::put("/users/u1").json(&json!({ "active": false })).unwrap();
    let response = gateway.dispatch(request).await.unwrap();

    assert_eq!(response.status(), 204);
    rejected.assert_async().await;
    refresh.assert_async().await;
    accepted.assert_async().await;
    assert_eq!(store.get(REFRESH_TOKEN_KEY).unwrap().as_deref(), Some("R2"));
}

#[tokio::test]
async fn second_unauthorized_tears_down_session() {
    let mut server = Server::new_async().await;
    let (gateway, store) = gateway(&server.url());
    gateway.set_tokens(jwt_expiring_in(3600), "R1");
    gateway.cache_user(&json!({ "id": "u1", "username": "librarian" }));
    let mut events = gateway.subscribe();

    let users = server
        .mock("GET", "/users")
        .with_status(401)
        .expect(2)
        .create_async()
        .await;
    let refresh = server
        .mock("POST", "/auth/refresh")
        .with_status(200)
        .with_body(token_body(&jwt_expiring_in(3600), "R2"))
        .expect(1)
        .create_async()
        .await;

    let result = gateway.dispatch(ApiRequest::get("/users")).await;

    assert!(matches!(result, Err(GatewayError::AuthenticationRejected)));
    users.assert_async().await;
    refresh.assert_async().await;

    assert!(gateway.access_token().is_none());
    assert!(gateway.cached_user().is_none());
    assert_eq!(store.get(REFRESH_TOKEN_KEY).unwrap(), None);
    assert_eq!(store.get(USER_KEY).unwrap(), None);
    assert_eq!(
        drain(&mut events),
        vec![
            SessionEvent::Refreshed,
            SessionEvent::Terminated(TerminationReason::Rejected),
        ]
    );
}

#[tokio::test]
async fn non_auth_errors_pass_through_without_refresh() {
    let mut server = Server::new_async().await;
    let (gateway, _store) = gateway(&server.url());
    let token = jwt_expiring_in(3600);
    gateway.set_tokens(token.clone(), "R1");

    let refresh = server
        .mock("POST", "/auth/refresh")
        .expect(0)
        .create_async()
        .await;
    let broken = server
        .mock("GET", "/courses/reserves")
        .with_status(500)
        .with_body("database unavailable")
        .create_async()
        .await;
    let missing = server
        .mock("GET", "/users/nobody")
        .with_status(404)
        .with_body("User not found")
        .create_async()
        .await;

    let response = gateway
        .dispatch(ApiRequest::get("/courses/reserves"))
        .await
        .unwrap();
    assert_eq!(response.status(), 500);
    assert_eq!(response.text().await.unwrap(), "database unavailable");

    let response = gateway
        .dispatch(ApiRequest::get("/users/nobody"))
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    assert_eq!(response.text().await.unwrap(), "User not found");

    refresh.assert_async().await;
    broken.assert_async().await;
    missing.assert_async().await;
    assert_eq!(gateway.access_token().unwrap().as_str(), token);
}

#[tokio::test]
async fn transport_errors_pass_through() {
    // Nothing listens on port 1
    let (gateway, store) = gateway("http://127.0.0.1:1");
    gateway.set_tokens(jwt_expiring_in(3600), "R1");

    let result = gateway.dispatch(ApiRequest::get("/users")).await;

    assert!(matches!(result, Err(GatewayError::Transport(_))));
    assert!(gateway.access_token().is_some());
    assert_eq!(store.get(REFRESH_TOKEN_KEY).unwrap().as_deref(), Some("R1"));
}

#[tokio::test]
async fn refresh_rotates_tokens_in_memory_and_storage() {
    let mut server = Server::new_async().await;
    let (gateway, store) = gateway(&server.url());
    gateway.set_tokens(jwt_expiring_in(3600), "R1");

    let first = server
        .mock("POST", "/auth/refresh")
        .match_body(Matcher::Json(json!({ "refresh_token": "R1" })))
        .with_status(200)
        .with_body(token_body("A2", "R2"))
        .expect(1)
        .create_async()
        .await;
    let second = server
        .mock("POST", "/auth/refresh")
        .match_body(Matcher::Json(json!({ "refresh_token": "R2" })))
        .with_status(200)
        .with_body(token_body("A3", "R3"))
        .expect(1)
        .create_async()
        .await;

    let token = gateway.refresh().await.unwrap();
    assert_eq!(token.as_str(), "A2");
    assert_eq!(store.get(REFRESH_TOKEN_KEY).unwrap().as_deref(), Some("R2"));

    // The in-memory copy is used even when storage is empty
    store.remove(REFRESH_TOKEN_KEY).unwrap();
    let token = gateway.refresh().await.unwrap();
    assert_eq!(token.as_str(), "A3");
    assert_eq!(gateway.access_token().unwrap().as_str(), "A3");
    assert_eq!(store.get(REFRESH_TOKEN_KEY).unwrap().as_deref(), Some("R3"));

    first.assert_async().await;
    second.assert_async().await;
}

#[tokio::test]
async fn cold_start_recovers_from_durable_refresh_token() {
    let mut server = Server::new_async().await;
    let (gateway, store) = gateway(&server.url());
    store.set(REFRESH_TOKEN_KEY, "R1").unwrap();
    let fresh = jwt_expiring_in(3600);

    let anonymous = server
        .mock("GET", "/users")
        .match_header("authorization", Matcher::Missing)
        .with_status(401)
        .expect(1)
        .create_async()
        .await;
    let refresh = server
        .mock("POST", "/auth/refresh")
        .match_body(Matcher::Json(json!({ "refresh_token": "R1" })))
        .with_status(200)
        .with_body(token_body(&fresh, "R2"))
        .expect(1)
        .create_async()
        .await;
    let authenticated = server
        .mock("GET", "/users")
        .match_header("authorization", format!("Bearer {}", fresh).as_str())
        .with_status(200)
        .with_body("[]")
        .expect(1)
        .create_async()
        .await;

    let response = gateway.dispatch(ApiRequest::get("/users")).await.unwrap();

    assert_eq!(response.status(), 200);
    anonymous.assert_async().await;
    refresh.assert_async().await;
    authenticated.assert_async().await;
    assert_eq!(store.get(REFRESH_TOKEN_KEY).unwrap().as_deref(), Some("R2"));
}

#[tokio::test]
async fn missing_refresh_token_tears_down_without_calling_endpoint() {
    let mut server = Server::new_async().await;
    let (gateway, store) = gateway(&server.url());
    store.set(USER_KEY, r#"{"id":"u1"}"#).unwrap();
    let mut events = gateway.subscribe();

    let refresh = server
        .mock("POST", "/auth/refresh")
        .expect(0)
        .create_async()
        .await;
    let users = server
        .mock("GET", "/users")
        .with_status(401)
        .expect(1)
        .create_async()
        .await;

    let result = gateway.dispatch(ApiRequest::get("/users")).await;

    assert!(matches!(result, Err(GatewayError::NoRefreshTokenAvailable)));
    refresh.assert_async().await;
    users.assert_async().await;
    assert_eq!(store.get(USER_KEY).unwrap(), None);
    assert_eq!(
        drain(&mut events),
        vec![SessionEvent::Terminated(TerminationReason::NoRefreshToken)]
    );
}

#[tokio::test]
async fn failed_proactive_refresh_still_sends_request() {
    let mut server = Server::new_async().await;
    let (gateway, store) = gateway(&server.url());
    gateway.set_tokens(jwt_expiring_in(30), "R1");
    let mut events = gateway.subscribe();

    let refresh = server
        .mock("POST", "/auth/refresh")
        .with_status(400)
        .with_body(r#"{"error":"invalid_grant"}"#)
        .expect(1)
        .create_async()
        .await;
    let health = server
        .mock("GET", "/admin/health")
        .match_header("authorization", Matcher::Missing)
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    // The endpoint doesn't require auth, so the response comes back as-is
    let response = gateway.dispatch(ApiRequest::get("/admin/health")).await.unwrap();

    assert_eq!(response.status(), 200);
    refresh.assert_async().await;
    health.assert_async().await;
    assert!(gateway.access_token().is_none());
    assert_eq!(store.get(REFRESH_TOKEN_KEY).unwrap(), None);
    assert_eq!(
        drain(&mut events),
        vec![SessionEvent::Terminated(TerminationReason::RefreshFailed)]
    );
}

#[tokio::test]
async fn malformed_token_forces_refresh() {
    let mut server = Server::new_async().await;
    let (gateway, _store) = gateway(&server.url());
    gateway.set_tokens("not-a-jwt", "R1");

    let refresh = server
        .mock("POST", "/auth/refresh")
        .with_status(200)
        .with_body(token_body("A2", "R2"))
        .expect(1)
        .create_async()
        .await;
    let users = server
        .mock("GET", "/users")
        .match_header("authorization", "Bearer A2")
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    gateway.dispatch(ApiRequest::get("/users")).await.unwrap();

    refresh.assert_async().await;
    users.assert_async().await;
}

#[tokio::test]
async fn public_endpoints_bypass_token_handling() {
    let mut server = Server::new_async().await;
    let (gateway, _store) = gateway(&server.url());
    // Expiring token would normally trigger a refresh
    gateway.set_tokens(jwt_expiring_in(5), "R1");

    let refresh = server
        .mock("POST", "/auth/refresh")
        .expect(0)
        .create_async()
        .await;
    let login = server
        .mock("POST", "/auth/login")
        .match_header("authorization", Matcher::Missing)
        .with_status(401)
        .with_body("bad credentials")
        .expect(1)
        .create_async()
        .await;

    let request = ApiRequest::post("/auth/login")
        .json(&json!({ "username": "u", "password": "wrong" }))
        .unwrap();
    let response = gateway.dispatch(request).await.unwrap();

    // A 401 from a public endpoint is not an auth failure of the session
    assert_eq!(response.status(), 401);
    refresh.assert_async().await;
    login.assert_async().await;
    assert!(gateway.access_token().is_some());
}

#[tokio::test]
async fn unreachable_refresh_endpoint_ends_session() {
    let mut server = Server::new_async().await;
    // Nothing listens on port 1, so only the refresh call fails to connect
    let (gateway, store) = gateway("http://127.0.0.1:1");
    gateway.set_tokens(jwt_expiring_in(30), "R1");
    gateway.cache_user(&json!({ "id": "u1" }));
    let mut events = gateway.subscribe();

    let users = server
        .mock("GET", "/users")
        .match_header("authorization", Matcher::Missing)
        .with_status(401)
        .expect(1)
        .create_async()
        .await;

    let result = gateway
        .dispatch(ApiRequest::get(format!("{}/users", server.url())))
        .await;

    assert!(matches!(
        result,
        Err(GatewayError::RefreshRequestFailed(RefreshError::Transport(_)))
    ));
    users.assert_async().await;
    assert!(gateway.access_token().is_none());
    assert!(gateway.cached_user().is_none());
    assert_eq!(store.get(REFRESH_TOKEN_KEY).unwrap(), None);
    assert_eq!(store.get(USER_KEY).unwrap(), None);
    assert_eq!(
        drain(&mut events),
        vec![SessionEvent::Terminated(TerminationReason::RefreshFailed)]
    );
}

#[tokio::test]
async fn unparseable_refresh_response_ends_session() {
    let mut server = Server::new_async().await;
    let (gateway, store) = gateway(&server.url());
    gateway.set_tokens(jwt_expiring_in(30), "R1");
    let mut events = gateway.subscribe();

    let refresh = server
        .mock("POST", "/auth/refresh")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body("{}")
        .expect(1)
        .create_async()
        .await;
    let users = server
        .mock("GET", "/users")
        .match_header("authorization", Matcher::Missing)
        .with_status(401)
        .expect(1)
        .create_async()
        .await;

    let result = gateway.dispatch(ApiRequest::get("/users")).await;

    assert!(matches!(
        result,
        Err(GatewayError::RefreshRequestFailed(RefreshError::InvalidResponse(_)))
    ));
    refresh.assert_async().await;
    users.assert_async().await;
    assert!(gateway.access_token().is_none());
    assert_eq!(store.get(REFRESH_TOKEN_KEY).unwrap(), None);
    assert_eq!(
        drain(&mut events),
        vec![SessionEvent::Terminated(TerminationReason::RefreshFailed)]
    );
}
