//! The admin token surface.

use std::sync::Arc;

use axum::Router;
use http::StatusCode;
use serde_json::{json, Value};

use portcullis_core::{
    auth::{CachedTokenStore, JwtResponse, JwtVerifier, KvTokenStore, TokenStore},
    kv::MemoryKv,
    testutil,
    types::BufferedResponse,
};
use server::admin::{create_admin_router, AdminState};

use crate::mock_infrastructure::{bytes_body, empty_body, gateway_request, send};

struct AdminFixture {
    router: Router,
    token_store: Arc<dyn TokenStore>,
}

fn admin_fixture() -> AdminFixture {
    let kv = Arc::new(MemoryKv::new());
    let verifier = Arc::new(JwtVerifier::new(&testutil::auth_config()).unwrap());
    let token_store: Arc<dyn TokenStore> = Arc::new(CachedTokenStore::new(Arc::new(
        KvTokenStore::new(kv, verifier.clone()),
    )));
    let router = create_admin_router(AdminState::new(token_store.clone(), verifier));
    AdminFixture { router, token_store }
}

async fn post_jwt(router: &Router, uri: &str, method: &str, jwt: &str) -> BufferedResponse {
    send(
        router,
        gateway_request(method, uri)
            .header("Content-Type", "application/jwt")
            .body(bytes_body(jwt.as_bytes()))
            .unwrap(),
    )
    .await
}

#[tokio::test]
async fn post_tokens_mints_and_reports_expiry() {
    let fixture = admin_fixture();
    let exp = testutil::unix_now() + 3600;
    let jwt = testutil::signed_jwt(json!({ "sub": "u", "exp": exp }));

    let response = post_jwt(&fixture.router, "/tokens", "POST", &jwt).await;
    assert_eq!(response.status, StatusCode::OK);

    let body: Value = serde_json::from_slice(&response.body).unwrap();
    let token = body["token"].as_str().unwrap();
    let expires = chrono::DateTime::parse_from_rfc3339(body["expires"].as_str().unwrap()).unwrap();
    assert_eq!(expires.timestamp(), exp);

    assert_eq!(fixture.token_store.get_token(token).await.unwrap().jwt, jwt);
}

#[tokio::test]
async fn post_tokens_without_exp_omits_expires() {
    let fixture = admin_fixture();
    let jwt = testutil::signed_jwt(json!({ "sub": "u" }));

    let response = post_jwt(&fixture.router, "/tokens", "POST", &jwt).await;
    assert_eq!(response.status, StatusCode::OK);

    let body: Value = serde_json::from_slice(&response.body).unwrap();
    assert!(body.get("expires").is_none());
}

#[tokio::test]
async fn put_tokens_uses_the_callers_token() {
    let fixture = admin_fixture();
    let jwt = testutil::signed_jwt(json!({ "sub": "u" }));

    let response = post_jwt(&fixture.router, "/tokens/my-chosen-token", "PUT", &jwt).await;
    assert_eq!(response.status, StatusCode::OK);

    let body: Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(body["token"], "my-chosen-token");
    assert_eq!(
        fixture.token_store.get_token("my-chosen-token").await.unwrap().jwt,
        jwt
    );
}

#[tokio::test]
async fn wrong_content_type_is_415() {
    let fixture = admin_fixture();
    let jwt = testutil::signed_jwt(json!({ "sub": "u" }));

    let response = send(
        &fixture.router,
        gateway_request("POST", "/tokens")
            .header("Content-Type", "text/plain")
            .body(bytes_body(jwt.as_bytes()))
            .unwrap(),
    )
    .await;

    assert_eq!(response.status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
}

#[tokio::test]
async fn invalid_jwt_is_400_with_reason() {
    let fixture = admin_fixture();

    let response = post_jwt(&fixture.router, "/tokens", "POST", "not-a-jwt").await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);

    let body: Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(body["msg"], "invalid token");
    assert!(body["reason"].is_string());
}

#[tokio::test]
async fn get_tokens_lists_stored_records_with_href() {
    let fixture = admin_fixture();
    let jwt = testutil::signed_jwt(json!({ "sub": "u" }));
    let (token, _) = fixture
        .token_store
        .add_token(&JwtResponse::new(jwt.clone()))
        .await
        .unwrap();

    let response = send(
        &fixture.router,
        gateway_request("GET", "/tokens").body(empty_body()).unwrap(),
    )
    .await;
    assert_eq!(response.status, StatusCode::OK);

    let listing: Value = serde_json::from_slice(&response.body).unwrap();
    let entries = listing.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["token"], token.as_str());
    assert_eq!(entries[0]["jwt"], jwt.as_str());
    assert_eq!(
        entries[0]["href"],
        format!("http://gateway.test/tokens/{token}")
    );
}

#[tokio::test]
async fn get_tokens_on_an_empty_store_is_an_empty_array() {
    let fixture = admin_fixture();

    let response = send(
        &fixture.router,
        gateway_request("GET", "/tokens").body(empty_body()).unwrap(),
    )
    .await;

    assert_eq!(response.status, StatusCode::OK);
    let listing: Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(listing, json!([]));
}
