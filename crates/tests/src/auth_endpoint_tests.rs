//! The authentication endpoint and provider-app token reminting.

use http::StatusCode;
use serde_json::{json, Value};

use portcullis_core::testutil;

use crate::mock_infrastructure::{
    build_gateway, bytes_body, config_with_app, empty_body, gateway_request, path_app, send,
};

/// Token mint on authenticate: the provider's JWT comes back as an opaque
/// token with an RFC3339 expiry, and the admin listing knows the pair.
#[tokio::test]
async fn authenticate_mints_an_opaque_token() {
    let exp = testutil::unix_now() + 3600;
    let jwt = testutil::signed_jwt(json!({ "sub": "u", "exp": exp }));

    let mut provider = mockito::Server::new_async().await;
    let provider_mock = provider
        .mock("POST", "/authenticate")
        .match_header("accept", "application/jwt")
        .with_status(200)
        .with_header("content-type", "application/jwt")
        .with_body(jwt.clone())
        .create_async()
        .await;

    let mut config = config_with_app("svc", path_app("/s", "http://127.0.0.1:9"));
    config.authentication.provider.url = Some(provider.url());
    config.authentication.provider.allow_authentication = true;
    let gateway = build_gateway(config);

    let response = send(
        &gateway.router,
        gateway_request("POST", "/authenticate")
            .header("Content-Type", "application/json")
            .body(bytes_body(br#"{"username":"u","password":"p"}"#))
            .unwrap(),
    )
    .await;

    assert_eq!(response.status, StatusCode::OK);
    provider_mock.assert_async().await;

    let body: Value = serde_json::from_slice(&response.body).unwrap();
    let token = body["token"].as_str().unwrap();
    assert!(!token.is_empty());
    let expires = chrono::DateTime::parse_from_rfc3339(body["expires"].as_str().unwrap()).unwrap();
    assert_eq!(expires.timestamp(), exp);

    let stored = gateway.token_store.get_token(token).await.unwrap();
    assert_eq!(stored.jwt, jwt);
}

/// Invalid credentials from the provider surface as 403.
#[tokio::test]
async fn authenticate_rejects_invalid_credentials() {
    let mut provider = mockito::Server::new_async().await;
    provider
        .mock("POST", "/authenticate")
        .with_status(403)
        .with_body("nope")
        .create_async()
        .await;

    let mut config = config_with_app("svc", path_app("/s", "http://127.0.0.1:9"));
    config.authentication.provider.url = Some(provider.url());
    config.authentication.provider.allow_authentication = true;
    let gateway = build_gateway(config);

    let response = send(
        &gateway.router,
        gateway_request("POST", "/authenticate")
            .header("Content-Type", "application/json")
            .body(bytes_body(br#"{"username":"u","password":"wrong"}"#))
            .unwrap(),
    )
    .await;

    assert_eq!(response.status, StatusCode::FORBIDDEN);
    assert_eq!(&response.body[..], br#"{"msg":"invalid credentials"}"#);
}

/// A 202 from the provider relays its body as additional properties.
#[tokio::test]
async fn authenticate_relays_incomplete_authentication() {
    let mut provider = mockito::Server::new_async().await;
    provider
        .mock("POST", "/authenticate")
        .with_status(202)
        .with_header("content-type", "application/json")
        .with_body(r#"{"challenge":"otp","sessionId":"abc"}"#)
        .create_async()
        .await;

    let mut config = config_with_app("svc", path_app("/s", "http://127.0.0.1:9"));
    config.authentication.provider.url = Some(provider.url());
    config.authentication.provider.allow_authentication = true;
    let gateway = build_gateway(config);

    let response = send(
        &gateway.router,
        gateway_request("POST", "/authenticate")
            .header("Content-Type", "application/json")
            .body(bytes_body(br#"{"username":"u","password":"p"}"#))
            .unwrap(),
    )
    .await;

    assert_eq!(response.status, StatusCode::ACCEPTED);
    let body: Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(body["challenge"], "otp");
    assert_eq!(body["sessionId"], "abc");
}

/// CORS preflight on the authentication endpoint when enabled.
#[tokio::test]
async fn authentication_endpoint_answers_preflight() {
    let mut config = config_with_app("svc", path_app("/s", "http://127.0.0.1:9"));
    config.authentication.provider.url = Some("http://127.0.0.1:9".to_string());
    config.authentication.provider.allow_authentication = true;
    config.authentication.enable_cors = true;
    let gateway = build_gateway(config);

    let response = send(
        &gateway.router,
        gateway_request("OPTIONS", "/authenticate").body(empty_body()).unwrap(),
    )
    .await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.header("Access-Control-Allow-Origin"), Some("*"));
    assert_eq!(response.header("Access-Control-Allow-Methods"), Some("POST, OPTIONS"));
}

/// A whole-body `application/jwt` response from the provider application is
/// replaced by a freshly minted opaque token.
#[tokio::test]
async fn provider_app_responses_are_reminted() {
    let jwt = testutil::signed_jwt(json!({ "sub": "u" }));

    let mut provider_backend = mockito::Server::new_async().await;
    provider_backend
        .mock("GET", "/login")
        .with_status(200)
        .with_header("content-type", "application/jwt")
        .with_body(jwt.clone())
        .create_async()
        .await;

    let mut app = path_app("/idp", &provider_backend.url());
    app.auth.disable = false;
    let mut config = config_with_app("idp", app);
    // Backend-URL equality marks the app as the provider.
    config.authentication.provider.url = Some(provider_backend.url());
    let gateway = build_gateway(config);

    let response = send(
        &gateway.router,
        gateway_request("GET", "/idp/login").body(empty_body()).unwrap(),
    )
    .await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.header("Content-Type"), Some("text/plain"));

    let opaque = String::from_utf8(response.body.to_vec()).unwrap();
    assert_ne!(opaque, jwt);
    let stored = gateway.token_store.get_token(&opaque).await.unwrap();
    assert_eq!(stored.jwt, jwt);
}

/// `X-Gateway-BodyToken` reminting replaces the named JSON field.
#[tokio::test]
async fn body_token_field_is_reminted() {
    let jwt = testutil::signed_jwt(json!({ "sub": "u" }));

    let mut provider_backend = mockito::Server::new_async().await;
    provider_backend
        .mock("GET", "/session")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_header("X-Gateway-BodyToken", "accessToken")
        .with_body(json!({ "accessToken": jwt, "user": "u" }).to_string())
        .create_async()
        .await;

    let mut app = path_app("/idp", &provider_backend.url());
    app.auth.disable = false;
    let mut config = config_with_app("idp", app);
    config.authentication.provider.service = Some("idp".to_string());
    let gateway = build_gateway(config);

    let response = send(
        &gateway.router,
        gateway_request("GET", "/idp/session").body(empty_body()).unwrap(),
    )
    .await;

    assert_eq!(response.status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(body["user"], "u");

    let opaque = body["accessToken"].as_str().unwrap();
    assert_ne!(opaque, jwt);
    let stored = gateway.token_store.get_token(opaque).await.unwrap();
    assert_eq!(stored.jwt, jwt);
}
