//! End-to-end pipeline scenarios against a mock upstream.

use http::StatusCode;
use serde_json::{json, Value};

use portcullis_core::auth::JwtResponse;
use portcullis_core::testutil;

use crate::mock_infrastructure::{
    build_gateway, bytes_body, config_with_app, empty_body, gateway_request, path_app,
    pattern_app, send,
};

/// Proxied GET with caching: MISS, HIT, PURGED, MISS again; JSON links are
/// rewritten onto the public host.
#[tokio::test]
async fn proxied_get_with_caching_and_auto_flush() {
    let mut upstream = mockito::Server::new_async().await;
    let get_mock = upstream
        .mock("GET", "/1")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"ok":true,"_links":{"self":{"href":"http://up/s/1"}}}"#)
        .expect(2)
        .create_async()
        .await;
    let delete_mock = upstream
        .mock("DELETE", "/1")
        .with_status(204)
        .expect(1)
        .create_async()
        .await;

    let mut app = path_app("/s", &upstream.url());
    app.caching.enabled = true;
    app.caching.auto_flush = true;
    let gateway = build_gateway(config_with_app("svc", app));

    let expected_body =
        json!({"ok": true, "_links": {"self": {"href": "https://gateway.test/s/1"}}});

    let first = send(
        &gateway.router,
        gateway_request("GET", "/s/1").body(empty_body()).unwrap(),
    )
    .await;
    assert_eq!(first.status, StatusCode::OK);
    assert_eq!(first.header("X-Cache"), Some("MISS"));
    let body: Value = serde_json::from_slice(&first.body).unwrap();
    assert_eq!(body, expected_body);

    let second = send(
        &gateway.router,
        gateway_request("GET", "/s/1").body(empty_body()).unwrap(),
    )
    .await;
    assert_eq!(second.header("X-Cache"), Some("HIT"));
    assert_eq!(second.body, first.body);

    let purged = send(
        &gateway.router,
        gateway_request("DELETE", "/s/1").body(empty_body()).unwrap(),
    )
    .await;
    assert_eq!(purged.header("X-Cache"), Some("PURGED"));
    delete_mock.assert_async().await;

    let third = send(
        &gateway.router,
        gateway_request("GET", "/s/1").body(empty_body()).unwrap(),
    )
    .await;
    assert_eq!(third.header("X-Cache"), Some("MISS"));
    get_mock.assert_async().await;
}

/// A valid token whitelisted for another application is rejected with 403
/// and the upstream is never called.
#[tokio::test]
async fn auth_whitelist_rejection() {
    let mut upstream = mockito::Server::new_async().await;
    let upstream_mock = upstream
        .mock("GET", "/1")
        .with_status(200)
        .expect(0)
        .create_async()
        .await;

    let mut app = path_app("/s", &upstream.url());
    app.auth.disable = false;
    let gateway = build_gateway(config_with_app("svc", app));

    let jwt = testutil::signed_jwt(json!({
        "sub": "u",
        "exp": testutil::unix_now() + 3600,
    }));
    let (token, _) = gateway
        .token_store
        .add_token(&JwtResponse {
            jwt,
            allowed_applications: vec!["otherapp".to_string()],
        })
        .await
        .unwrap();

    let response = send(
        &gateway.router,
        gateway_request("GET", "/s/1")
            .header("Authorization", format!("Bearer {token}"))
            .body(empty_body())
            .unwrap(),
    )
    .await;

    assert_eq!(response.status, StatusCode::FORBIDDEN);
    assert_eq!(&response.body[..], br#"{"msg":"not authenticated"}"#);
    upstream_mock.assert_async().await;
}

/// An empty whitelist means any application is allowed.
#[tokio::test]
async fn empty_whitelist_allows_any_app() {
    let mut upstream = mockito::Server::new_async().await;
    upstream.mock("GET", "/1").with_status(200).with_body("ok").create_async().await;

    let mut app = path_app("/s", &upstream.url());
    app.auth.disable = false;
    let gateway = build_gateway(config_with_app("svc", app));

    let jwt = testutil::signed_jwt(json!({ "sub": "u" }));
    let (token, _) = gateway.token_store.add_token(&JwtResponse::new(jwt)).await.unwrap();

    let response = send(
        &gateway.router,
        gateway_request("GET", "/s/1")
            .header("Authorization", format!("Bearer {token}"))
            .body(empty_body())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status, StatusCode::OK);
}

/// No credential on an auth-enabled application → 403, upstream untouched.
#[tokio::test]
async fn missing_credential_is_rejected() {
    let mut upstream = mockito::Server::new_async().await;
    let upstream_mock = upstream
        .mock("GET", "/1")
        .with_status(200)
        .expect(0)
        .create_async()
        .await;

    let mut app = path_app("/s", &upstream.url());
    app.auth.disable = false;
    let gateway = build_gateway(config_with_app("svc", app));

    let response = send(
        &gateway.router,
        gateway_request("GET", "/s/1").body(empty_body()).unwrap(),
    )
    .await;

    assert_eq!(response.status, StatusCode::FORBIDDEN);
    upstream_mock.assert_async().await;
}

/// The verified JWT is installed on the upstream request through the
/// configured writer.
#[tokio::test]
async fn jwt_is_installed_for_the_upstream() {
    let jwt = testutil::signed_jwt(json!({ "sub": "u" }));

    let mut upstream = mockito::Server::new_async().await;
    let upstream_mock = upstream
        .mock("GET", "/1")
        .match_header("X-JWT", jwt.as_str())
        .with_status(200)
        .create_async()
        .await;

    let mut app = path_app("/s", &upstream.url());
    app.auth.disable = false;
    let gateway = build_gateway(config_with_app("svc", app));

    let (token, _) = gateway
        .token_store
        .add_token(&JwtResponse::new(jwt.clone()))
        .await
        .unwrap();

    let response = send(
        &gateway.router,
        gateway_request("GET", "/s/1")
            .header("Authorization", format!("Bearer {token}"))
            .body(empty_body())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status, StatusCode::OK);
    upstream_mock.assert_async().await;
}

/// Rate-limit burst: statuses 200, 200, 200, 429 and Remaining 2, 1, 0, 0.
#[tokio::test]
async fn rate_limit_burst_admits_exactly_burst_requests() {
    let mut upstream = mockito::Server::new_async().await;
    upstream.mock("GET", "/1").with_status(200).with_body("ok").create_async().await;

    let mut app = path_app("/r", &upstream.url());
    app.rate_limiting = true;
    let gateway = build_gateway(config_with_app("svc", app));

    let mut statuses = Vec::new();
    let mut remaining = Vec::new();
    for _ in 0..4 {
        let response = send(
            &gateway.router,
            gateway_request("GET", "/r/1").body(empty_body()).unwrap(),
        )
        .await;
        statuses.push(response.status.as_u16());
        assert_eq!(response.header("X-RateLimit"), Some("3"));
        remaining.push(response.header("X-RateLimit-Remaining").unwrap().to_string());
    }

    assert_eq!(statuses, vec![200, 200, 200, 429]);
    assert_eq!(remaining, vec!["2", "1", "0", "0"]);
}

/// Hyperlink elision: unmappable links under `_links` elide their map, an
/// unmappable array element is dropped.
#[tokio::test]
async fn hyperlink_elision_in_json_bodies() {
    let mut upstream = mockito::Server::new_async().await;
    upstream
        .mock("GET", "/known/1")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "items": [
                    {"href": "http://up/known/1"},
                    {"href": "http://up/unknown"}
                ],
                "_links": {"next": {"href": "http://up/unknown"}}
            })
            .to_string(),
        )
        .create_async()
        .await;

    let app = pattern_app(&[("/k/:id", "/known/:id")], &upstream.url());
    let gateway = build_gateway(config_with_app("items", app));

    let response = send(
        &gateway.router,
        gateway_request("GET", "/k/1").body(empty_body()).unwrap(),
    )
    .await;

    assert_eq!(response.status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(body, json!({"items": [{"href": "https://gateway.test/k/1"}]}));
}

/// Redirect Location rewriting: the upstream 302 goes back to the client
/// with the public URL.
#[tokio::test]
async fn redirect_location_is_rewritten() {
    let mut upstream = mockito::Server::new_async().await;
    upstream
        .mock("GET", "/known/42")
        .with_status(302)
        .with_header("Location", "http://up/known/42")
        .create_async()
        .await;

    let app = pattern_app(&[("/k/:id", "/known/:id")], &upstream.url());
    let gateway = build_gateway(config_with_app("items", app));

    let response = send(
        &gateway.router,
        gateway_request("GET", "/k/42").body(empty_body()).unwrap(),
    )
    .await;

    assert_eq!(response.status, StatusCode::FOUND);
    assert_eq!(response.header("Location"), Some("https://gateway.test/k/42"));
}

/// Path routing boundary: `/a` serves `/a` and `/a/b` but not `/ab`.
#[tokio::test]
async fn path_prefix_does_not_match_sibling_paths() {
    let mut upstream = mockito::Server::new_async().await;
    upstream.mock("GET", "/").with_status(200).with_body("root").create_async().await;
    upstream.mock("GET", "/b").with_status(200).with_body("b").create_async().await;

    let gateway = build_gateway(config_with_app("svc", path_app("/a", &upstream.url())));

    let root = send(
        &gateway.router,
        gateway_request("GET", "/a").body(empty_body()).unwrap(),
    )
    .await;
    assert_eq!(root.status, StatusCode::OK);

    let nested = send(
        &gateway.router,
        gateway_request("GET", "/a/b").body(empty_body()).unwrap(),
    )
    .await;
    assert_eq!(nested.status, StatusCode::OK);

    let sibling = send(
        &gateway.router,
        gateway_request("GET", "/ab").body(empty_body()).unwrap(),
    )
    .await;
    assert_eq!(sibling.status, StatusCode::NOT_FOUND);
}

/// Unknown routes answer 404 with the gateway envelope.
#[tokio::test]
async fn unknown_route_is_404() {
    let mut upstream = mockito::Server::new_async().await;
    let gateway = build_gateway(config_with_app("svc", path_app("/a", &upstream.url())));

    let response = send(
        &gateway.router,
        gateway_request("GET", "/nowhere").body(empty_body()).unwrap(),
    )
    .await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
    assert_eq!(&response.body[..], br#"{"msg":"not found"}"#);
}

/// Synthesized OPTIONS: enabled options config answers preflight with
/// `Allow` and CORS headers without consulting the upstream handler chain's
/// cache semantics.
#[tokio::test]
async fn options_synthesis_overlays_cors_headers() {
    let mut upstream = mockito::Server::new_async().await;
    upstream.mock("OPTIONS", "/1").with_status(200).create_async().await;

    let mut config = config_with_app("svc", path_app("/s", &upstream.url()));
    config.proxy.options.enabled = true;
    config.proxy.options.cors = true;
    let gateway = build_gateway(config);

    let response = send(
        &gateway.router,
        gateway_request("OPTIONS", "/s/1").body(empty_body()).unwrap(),
    )
    .await;

    assert_eq!(response.status, StatusCode::OK);
    assert!(response.header("Allow").is_some());
    assert_eq!(response.header("Access-Control-Allow-Origin"), Some("*"));
}

/// The forwarder answers 503 with the standard envelope when the upstream
/// is unreachable.
#[tokio::test]
async fn unreachable_upstream_is_503() {
    // Port 9 is discard; nothing listens there in the test environment.
    let gateway = build_gateway(config_with_app(
        "svc",
        path_app("/s", "http://127.0.0.1:9"),
    ));

    let response = send(
        &gateway.router,
        gateway_request("GET", "/s/1").body(empty_body()).unwrap(),
    )
    .await;

    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(body["msg"], "service unavailable");
    assert_eq!(body["reason"], "no can do; sorry.");
}

/// POST bodies reach the upstream unchanged.
#[tokio::test]
async fn request_bodies_are_forwarded() {
    let mut upstream = mockito::Server::new_async().await;
    let upstream_mock = upstream
        .mock("POST", "/submit")
        .match_body(r#"{"value":7}"#)
        .with_status(201)
        .create_async()
        .await;

    let gateway = build_gateway(config_with_app("svc", path_app("/s", &upstream.url())));

    let response = send(
        &gateway.router,
        gateway_request("POST", "/s/submit")
            .header("Content-Type", "application/json")
            .body(bytes_body(br#"{"value":7}"#))
            .unwrap(),
    )
    .await;

    assert_eq!(response.status, StatusCode::CREATED);
    upstream_mock.assert_async().await;
}
