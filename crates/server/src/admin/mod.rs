//! Admin API module.
//!
//! A separate HTTP server, bound to localhost by default, for inspecting and
//! installing access tokens. Shares the token store and verifier with the
//! proxy process via `Arc` references.
//!
//! - `GET /tokens` — streams the stored tokens as a JSON array
//! - `POST /tokens` — mint a token for a compact JWT (`application/jwt`)
//! - `PUT /tokens/{token}` — same, with a caller-chosen opaque token

use std::{convert::Infallible, sync::Arc};

use axum::{
    body::Body,
    extract::{Path, State},
    response::Response,
    routing::{get, put},
    Router,
};
use bytes::Bytes;
use futures::StreamExt;
use http::{header, HeaderMap, HeaderValue, StatusCode};
use serde::Serialize;

use portcullis_core::{
    auth::{JwtResponse, JwtVerifier, TokenStore},
    types::{error_response, error_response_with_reason, JSON_CONTENT_TYPE},
};

/// Shared state for the admin handlers.
#[derive(Clone)]
pub struct AdminState {
    pub token_store: Arc<dyn TokenStore>,
    pub verifier: Arc<JwtVerifier>,
}

impl AdminState {
    #[must_use]
    pub fn new(token_store: Arc<dyn TokenStore>, verifier: Arc<JwtVerifier>) -> Self {
        Self { token_store, verifier }
    }
}

/// Builds the admin router.
#[must_use]
pub fn create_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/tokens", get(handle_list_tokens).post(handle_add_token))
        .route("/tokens/{token}", put(handle_set_token))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct TokenJson {
    jwt: String,
    token: String,
    href: String,
}

#[derive(Debug, Serialize)]
struct StoredTokenResponse {
    token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires: Option<String>,
}

async fn handle_list_tokens(State(state): State<AdminState>, headers: HeaderMap) -> Response {
    let scan = match state.token_store.list_tokens().await {
        Ok(scan) => scan,
        Err(e) => {
            tracing::error!(error = %e, "could not load tokens");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "could not load tokens");
        }
    };

    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost")
        .to_string();

    // The array is encoded incrementally so the listing never needs all
    // records in memory at once.
    let entries = scan
        .filter_map(|item| async move {
            match item {
                Ok(token) => Some(token),
                Err(e) => {
                    tracing::error!(error = %e, "skipping unreadable token record");
                    None
                }
            }
        })
        .enumerate()
        .map(move |(index, mapped)| {
            let escaped: String =
                url::form_urlencoded::byte_serialize(mapped.token.as_bytes()).collect();
            let entry = TokenJson {
                jwt: mapped.jwt,
                token: mapped.token,
                href: format!("http://{host}/tokens/{escaped}"),
            };
            let json = serde_json::to_string(&entry).unwrap_or_default();
            let chunk = if index == 0 { json } else { format!(",{json}") };
            Ok::<Bytes, Infallible>(Bytes::from(chunk))
        });

    let body = futures::stream::once(async { Ok(Bytes::from_static(b"[")) })
        .chain(entries)
        .chain(futures::stream::once(async { Ok(Bytes::from_static(b"]")) }));

    let mut response = Response::new(Body::from_stream(body));
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));
    response
}

async fn handle_add_token(
    State(state): State<AdminState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let jwt = match accept_jwt_body(&headers, &body, &state).await {
        Ok(jwt) => jwt,
        Err(rejection) => return rejection,
    };

    match state.token_store.add_token(&JwtResponse::new(jwt)).await {
        Ok((token, expires_at)) => stored_response(token, expires_at),
        Err(e) => {
            tracing::error!(error = %e, "error while storing token");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "could not store token")
        }
    }
}

async fn handle_set_token(
    State(state): State<AdminState>,
    Path(token): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let jwt = match accept_jwt_body(&headers, &body, &state).await {
        Ok(jwt) => jwt,
        Err(rejection) => return rejection,
    };

    match state.token_store.set_token(&token, &JwtResponse::new(jwt)).await {
        Ok(expires_at) => stored_response(token, expires_at),
        Err(e) => {
            tracing::error!(error = %e, "error while storing token");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "could not store token")
        }
    }
}

/// Checks the `application/jwt` content type and verifies the body,
/// returning the ready-made rejection response otherwise.
async fn accept_jwt_body(
    headers: &HeaderMap,
    body: &Bytes,
    state: &AdminState,
) -> Result<String, Response> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if content_type != "application/jwt" {
        return Err(error_response(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "only 'application/jwt' is allowed as content-type",
        ));
    }

    let jwt = String::from_utf8_lossy(body).to_string();
    match state.verifier.verify(&jwt).await {
        Ok(_) => Ok(jwt),
        Err(e) => Err(error_response_with_reason(
            StatusCode::BAD_REQUEST,
            "invalid token",
            &e.to_string(),
        )),
    }
}

fn stored_response(token: String, expires_at: i64) -> Response {
    let expires = (expires_at != 0)
        .then(|| chrono::DateTime::from_timestamp(expires_at, 0))
        .flatten()
        .map(|t| t.to_rfc3339());
    let body = serde_json::to_vec(&StoredTokenResponse { token, expires }).unwrap_or_default();
    let mut response = Response::new(Body::from(body));
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));
    response
}
