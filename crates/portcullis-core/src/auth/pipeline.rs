//! The per-route authentication pipeline.
//!
//! Wraps route handlers with credential extraction, token resolution, JWT
//! verification (behind a per-process expiry cache), the per-application
//! whitelist, and credential injection for the upstream. Responses from the
//! provider application are scanned for freshly issued JWTs, which are
//! replaced by opaque tokens before they reach the client.
//!
//! The pipeline also contributes the optional authentication endpoint
//! (`POST /authenticate` by default) to the top-level route table.

use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use axum::{
    body::Body,
    extract::State,
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use bytes::Bytes;
use dashmap::DashMap;
use http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    auth::{
        AuthError, AuthRequestListener, AuthenticationHandler, BearerTokenReader, JwtResponse,
        JwtVerifier, TokenStore, TokenWriter,
    },
    config::Configuration,
    types::{error_response, BufferedResponse, ProxyRequest, RouteHandler, JSON_CONTENT_TYPE},
};

/// Response header naming a JSON body field holding a JWT to remint.
const BODY_TOKEN_HEADER: &str = "X-Gateway-BodyToken";
/// Response header naming another response header holding a JWT to remint.
const HEADER_TOKEN_HEADER: &str = "X-Gateway-HeaderToken";
/// Response header naming a response cookie holding a JWT to remint.
const COOKIE_TOKEN_HEADER: &str = "X-Gateway-CookieToken";

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// The authentication middleware and endpoint.
pub struct AuthPipeline {
    config: Arc<Configuration>,
    handler: AuthenticationHandler,
    token_store: Arc<dyn TokenStore>,
    verifier: Arc<JwtVerifier>,
    reader: BearerTokenReader,
    /// jwt → absolute expiry (0 ≡ none). A live entry bypasses the
    /// verifier.
    exp_cache: Arc<DashMap<String, i64>>,
    listeners: parking_lot::RwLock<Vec<Arc<dyn AuthRequestListener>>>,
}

impl AuthPipeline {
    #[must_use]
    pub fn new(
        config: Arc<Configuration>,
        token_store: Arc<dyn TokenStore>,
        verifier: Arc<JwtVerifier>,
    ) -> Self {
        let handler = AuthenticationHandler::new(Arc::new(config.authentication.clone()));
        Self {
            config,
            handler,
            token_store: token_store.clone(),
            verifier,
            reader: BearerTokenReader::new(token_store),
            exp_cache: Arc::new(DashMap::new()),
            listeners: parking_lot::RwLock::new(Vec::new()),
        }
    }

    /// Registers an observer for authenticated requests.
    pub fn register_listener(&self, listener: Arc<dyn AuthRequestListener>) {
        self.listeners.write().push(listener);
    }

    fn notify_listeners(&self, request: &ProxyRequest, jwt: &str) {
        for listener in self.listeners.read().iter() {
            listener.on_authenticated_request(request, jwt);
        }
    }

    /// Whether `app_name` fronts the authentication provider, by name or by
    /// backend-URL equality. Provider apps bypass whitelist and liveness
    /// checks, and their responses are scanned for reminting triggers.
    #[must_use]
    pub fn is_provider_app(&self, app_name: &str) -> bool {
        let provider = &self.config.authentication.provider;
        if provider.service.as_deref() == Some(app_name) {
            return true;
        }
        match (self.config.applications.get(app_name), provider.url.as_deref()) {
            (Some(app), Some(provider_url)) => {
                app.backend.url.as_deref() == Some(provider_url)
            }
            _ => false,
        }
    }

    /// Resolves and verifies the request's credential.
    ///
    /// `Ok(None)` means unauthenticated; errors mean a gateway dependency
    /// failed and the caller answers 503.
    async fn is_authenticated(
        &self,
        token_str: &str,
    ) -> Result<Option<JwtResponse>, AuthError> {
        let Some(token) = self.reader.resolve_token(token_str).await? else {
            return Ok(None);
        };

        if let Some(expires_at) = self.exp_cache.get(&token.jwt).map(|e| *e) {
            if expires_at == 0 || expires_at > unix_now() {
                return Ok(Some(token));
            }
            return Ok(None);
        }

        match self.verifier.verify(&token.jwt).await {
            Ok(verified) => {
                let expires_at = verified.expires_at();
                if expires_at == 0 {
                    self.exp_cache.insert(token.jwt.clone(), 0);
                    return Ok(Some(token));
                }
                if expires_at > unix_now() {
                    tracing::debug!(expires_at, "caching JWT expiry");
                    self.exp_cache.insert(token.jwt.clone(), expires_at);
                    self.schedule_eviction(token.jwt.clone(), expires_at);
                    return Ok(Some(token));
                }
                Ok(None)
            }
            Err(e) if e.is_unauthenticated() => Ok(None),
            Err(e) => Err(AuthError::KeyFetch(e.to_string())),
        }
    }

    /// Evicts the expiry-cache entry once the JWT has expired. Concurrent
    /// promotions each schedule one of these; the extra delete is a no-op.
    fn schedule_eviction(&self, jwt: String, expires_at: i64) {
        let cache = self.exp_cache.clone();
        let delay = u64::try_from(expires_at - unix_now()).unwrap_or(0);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(delay)).await;
            cache.remove(&jwt);
        });
    }

    /// Wraps a route handler of `app_name` with the authentication check.
    pub fn decorate(self: &Arc<Self>, handler: RouteHandler, app_name: &str) -> RouteHandler {
        let pipeline = self.clone();
        let app_name = app_name.to_string();
        let writer = self
            .config
            .applications
            .get(&app_name)
            .map(|app| TokenWriter::from_config(&app.auth.writer))
            .unwrap_or_default();

        Arc::new(move |mut request: ProxyRequest| {
            let pipeline = pipeline.clone();
            let inner = handler.clone();
            let app_name = app_name.clone();
            let writer = writer.clone();
            Box::pin(async move {
                // Preflight never carries credentials.
                if request.method() == Method::OPTIONS {
                    return inner(request).await;
                }

                let token_str = match crate::auth::reader::token_string_from_request(&request) {
                    Ok(token_str) => Some(token_str),
                    Err(crate::auth::reader::MissingCredential::NoToken) => None,
                    Err(crate::auth::reader::MissingCredential::UnsupportedScheme(scheme)) => {
                        tracing::debug!(scheme = %scheme, "unsupported authorization scheme");
                        None
                    }
                };
                let token = match token_str {
                    None => None,
                    Some(token_str) => match pipeline.is_authenticated(&token_str).await {
                        Ok(token) => token,
                        Err(e) => {
                            tracing::error!(error = %e, application = %app_name, "authentication dependency failure");
                            return error_response(
                                StatusCode::SERVICE_UNAVAILABLE,
                                "service unavailable",
                            );
                        }
                    },
                };

                let provider_app = pipeline.is_provider_app(&app_name);
                let authorized = provider_app
                    || match &token {
                        None => false,
                        Some(token) => {
                            if token.allowed_applications.is_empty()
                                || token.allowed_applications.iter().any(|a| a == &app_name)
                            {
                                true
                            } else {
                                tracing::warn!(
                                    application = %app_name,
                                    whitelist = ?token.allowed_applications,
                                    "token is not whitelisted for application"
                                );
                                false
                            }
                        }
                    };

                if !authorized {
                    return error_response(StatusCode::FORBIDDEN, "not authenticated");
                }

                if let Some(token) = &token {
                    writer.write(request.headers_mut(), &token.jwt);
                    pipeline.notify_listeners(&request, &token.jwt);
                }

                let response = inner(request).await;
                let mut buffered = match BufferedResponse::record(response).await {
                    Ok(buffered) => buffered,
                    Err(e) => {
                        tracing::error!(error = %e, "could not buffer downstream response");
                        return error_response(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "internal server error",
                        );
                    }
                };

                if provider_app {
                    if let Err(e) = pipeline.remint_tokens(&mut buffered).await {
                        tracing::error!(error = %e, "error while reminting access tokens");
                        return error_response(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "internal server error",
                        );
                    }
                }

                buffered.into_response()
            })
        })
    }

    /// Replaces JWTs the provider put into a response with opaque tokens.
    async fn remint_tokens(&self, response: &mut BufferedResponse) -> Result<(), AuthError> {
        self.remint_body(response).await?;
        self.remint_header(response).await?;
        self.remint_cookie(response).await
    }

    async fn remint_body(&self, response: &mut BufferedResponse) -> Result<(), AuthError> {
        if response.header(header::CONTENT_TYPE.as_str()) == Some("application/jwt") {
            let jwt = String::from_utf8_lossy(&response.body).to_string();
            let (token, _) = self.token_store.add_token(&JwtResponse::new(jwt)).await?;

            response.body = Bytes::from(token);
            response
                .headers
                .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
            set_content_length(&mut response.headers, response.body.len());
            return Ok(());
        }

        let Some(field) = response.header(BODY_TOKEN_HEADER).map(str::to_string) else {
            return Ok(());
        };
        let mut body: Map<String, Value> = serde_json::from_slice(&response.body)
            .map_err(|e| AuthError::Provider(format!("provider body is not JSON: {e}")))?;
        let Some(Value::String(jwt)) = body.get(&field).cloned() else {
            return Ok(());
        };

        let (token, _) = self.token_store.add_token(&JwtResponse::new(jwt)).await?;
        body.insert(field, Value::String(token));
        response.body = Bytes::from(serde_json::to_vec(&body).unwrap_or_default());
        set_content_length(&mut response.headers, response.body.len());
        Ok(())
    }

    async fn remint_header(&self, response: &mut BufferedResponse) -> Result<(), AuthError> {
        let Some(name) = response.header(HEADER_TOKEN_HEADER).map(str::to_string) else {
            return Ok(());
        };
        let Some(jwt) = response.header(&name).map(str::to_string) else {
            return Ok(());
        };

        let (token, _) = self.token_store.add_token(&JwtResponse::new(jwt)).await?;
        if let (Ok(name), Ok(value)) =
            (http::HeaderName::try_from(name.as_str()), HeaderValue::from_str(&token))
        {
            response.headers.insert(name, value);
        }
        Ok(())
    }

    async fn remint_cookie(&self, response: &mut BufferedResponse) -> Result<(), AuthError> {
        let Some(name) = response.header(COOKIE_TOKEN_HEADER).map(str::to_string) else {
            return Ok(());
        };

        let cookies: Vec<String> = response
            .headers
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok().map(str::to_string))
            .collect();

        let jwt = cookies
            .iter()
            .find_map(|cookie| cookie_value(cookie, &name))
            .ok_or_else(|| AuthError::Provider(format!("cookie {name} not found")))?;

        let (token, _) = self.token_store.add_token(&JwtResponse::new(jwt)).await?;

        response.headers.remove(header::SET_COOKIE);
        for cookie in cookies {
            let rewritten = match cookie_value(&cookie, &name) {
                Some(_) => replace_cookie_value(&cookie, &token),
                None => cookie,
            };
            if let Ok(value) = HeaderValue::from_str(&rewritten) {
                response.headers.append(header::SET_COOKIE, value);
            }
        }
        Ok(())
    }

    /// Top-level routes the pipeline contributes: the authentication
    /// endpoint, when the provider allows it.
    #[must_use]
    pub fn routes(self: &Arc<Self>) -> Option<Router> {
        if !self.config.authentication.provider.allow_authentication {
            return None;
        }

        let uri = self
            .config
            .authentication
            .provider
            .authentication_uri
            .clone()
            .unwrap_or_else(|| "/authenticate".to_string());

        let method_router = if self.config.authentication.enable_cors {
            post(handle_authenticate).options(handle_preflight)
        } else {
            post(handle_authenticate)
        };
        Some(Router::new().route(&uri, method_router).with_state(self.clone()))
    }
}

/// Body shape of the authentication endpoint.
#[derive(Debug, Deserialize)]
struct ExternalAuthenticationRequest {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

#[derive(Debug, Serialize)]
struct ExternalAuthenticationResponse {
    token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires: Option<String>,
}

async fn handle_preflight(State(pipeline): State<Arc<AuthPipeline>>) -> Response {
    let mut response = StatusCode::OK.into_response();
    if pipeline.config.authentication.enable_cors {
        set_cors_headers(response.headers_mut());
    }
    response
}

async fn handle_authenticate(
    State(pipeline): State<Arc<AuthPipeline>>,
    body: Bytes,
) -> Response {
    let cors = pipeline.config.authentication.enable_cors;

    // The body is parsed twice: once into the known shape, once into the
    // free-form map that rides along to the provider.
    let request: ExternalAuthenticationRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            tracing::error!(error = %e, "bad authentication request body");
            return finish(
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error"),
                cors,
            );
        }
    };
    let generic: Map<String, Value> = serde_json::from_slice(&body).unwrap_or_default();

    let authenticated = pipeline
        .handler
        .authenticate(&request.username, &request.password, &generic)
        .await;

    let response = match authenticated {
        Ok(jwt_response) => match pipeline.token_store.add_token(&jwt_response).await {
            Ok((token, expires_at)) => {
                let expires = (expires_at != 0)
                    .then(|| chrono::DateTime::from_timestamp(expires_at, 0))
                    .flatten()
                    .map(|t| t.to_rfc3339());
                json_response(
                    StatusCode::OK,
                    &ExternalAuthenticationResponse { token, expires },
                )
            }
            Err(e) => {
                tracing::error!(error = %e, "error while storing token");
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
            }
        },
        Err(AuthError::InvalidCredentials) => {
            error_response(StatusCode::FORBIDDEN, "invalid credentials")
        }
        Err(AuthError::Incomplete(properties)) => {
            json_response(StatusCode::ACCEPTED, &Value::Object(properties))
        }
        Err(e) => {
            tracing::error!(error = %e, "error while handling authentication request");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
        }
    };

    finish(response, cors)
}

fn finish(mut response: Response, cors: bool) -> Response {
    if cors {
        set_cors_headers(response.headers_mut());
    }
    response
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response {
    let body = serde_json::to_vec(value).unwrap_or_default();
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));
    response
}

fn set_cors_headers(headers: &mut HeaderMap) {
    headers.insert(
        "Access-Control-Allow-Methods",
        HeaderValue::from_static("POST, OPTIONS"),
    );
    headers.insert(
        "Access-Control-Allow-Headers",
        HeaderValue::from_static("X-Requested-With, Authorization, Content-Type"),
    );
    headers.insert("Access-Control-Allow-Origin", HeaderValue::from_static("*"));
    headers.insert("Access-Control-Allow-Credentials", HeaderValue::from_static("true"));
}

fn set_content_length(headers: &mut HeaderMap, len: usize) {
    if let Ok(value) = HeaderValue::from_str(&len.to_string()) {
        headers.insert(header::CONTENT_LENGTH, value);
    }
}

/// Extracts a cookie's value from one `Set-Cookie` line.
fn cookie_value(set_cookie: &str, name: &str) -> Option<String> {
    let first = set_cookie.split(';').next()?;
    let (cookie_name, value) = first.split_once('=')?;
    (cookie_name.trim() == name).then(|| value.to_string())
}

/// Replaces the value of the leading `name=value` pair, keeping attributes.
fn replace_cookie_value(set_cookie: &str, new_value: &str) -> String {
    match set_cookie.split_once(';') {
        Some((first, rest)) => match first.split_once('=') {
            Some((name, _)) => format!("{name}={new_value};{rest}"),
            None => set_cookie.to_string(),
        },
        None => match set_cookie.split_once('=') {
            Some((name, _)) => format!("{name}={new_value}"),
            None => set_cookie.to_string(),
        },
    }
}
