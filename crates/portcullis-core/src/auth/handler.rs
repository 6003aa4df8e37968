//! The authentication provider client.
//!
//! Turns `(username, password, extra body)` into a JWT by calling the
//! configured provider, optionally running a pre-authentication hook first.
//! The hook is an external command: it receives the credentials as JSON on
//! stdin and answers on stdout with something false-y to reject, or an
//! object that may replace the request body, override the provider URL, and
//! restrict the applications the minted token is valid for.

use std::{process::Stdio, sync::Arc, time::Duration};

use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;

use crate::{
    auth::{AuthError, JwtResponse},
    config::AuthenticationConfig,
};

const HOOK_TIMEOUT: Duration = Duration::from_secs(5);

/// What a pre-authentication hook may override.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HookOverride {
    pub body: Option<Map<String, Value>>,
    pub url: Option<String>,
    pub allowed_applications: Option<Vec<String>>,
}

/// Client for the upstream identity provider.
pub struct AuthenticationHandler {
    config: Arc<AuthenticationConfig>,
    http: reqwest::Client,
}

impl AuthenticationHandler {
    #[must_use]
    pub fn new(config: Arc<AuthenticationConfig>) -> Self {
        Self { config, http: reqwest::Client::new() }
    }

    /// Authenticates a user against the provider.
    ///
    /// `request_body` is the client's full request body; its extra fields
    /// ride along to the provider on top of the configured parameters.
    ///
    /// # Errors
    ///
    /// - [`AuthError::InvalidCredentials`] when the hook rejects or the
    ///   provider answers 403
    /// - [`AuthError::Incomplete`] when the provider answers 202
    /// - [`AuthError::Provider`] / [`AuthError::Hook`] for other faults
    pub async fn authenticate(
        &self,
        username: &str,
        password: &str,
        request_body: &Map<String, Value>,
    ) -> Result<JwtResponse, AuthError> {
        let mut parameters = self.config.provider.parameters.clone();
        for (key, value) in request_body {
            parameters.insert(key.clone(), value.clone());
        }
        parameters.insert("username".to_string(), Value::String(username.to_string()));
        parameters.insert("password".to_string(), Value::String(password.to_string()));

        let mut request_url = self
            .config
            .provider
            .url
            .as_deref()
            .map(|url| format!("{url}/authenticate"))
            .ok_or_else(|| AuthError::Provider("no provider URL configured".to_string()))?;
        let mut allowed_applications = Vec::new();

        if let Some(hook) = self.run_pre_auth_hook(username, password).await? {
            if let Some(body) = hook.body {
                tracing::debug!("hook replaced the authentication request body");
                parameters = body;
            }
            if let Some(url) = hook.url {
                tracing::debug!(url = %url, "hook set the provider request URL");
                request_url = url;
            }
            if let Some(apps) = hook.allowed_applications {
                tracing::debug!(applications = ?apps, "token will be restricted");
                allowed_applications = apps;
            }
        }

        let mut redacted = parameters.clone();
        if redacted.contains_key("password") {
            redacted.insert("password".to_string(), Value::String("*REDACTED*".to_string()));
        }
        tracing::info!(username = %username, "authenticating user");
        let redacted_request = Value::Object(redacted);
        tracing::debug!(request = %redacted_request, "authentication request");

        let response = self
            .http
            .post(&request_url)
            .header("Accept", "application/jwt")
            .json(&parameters)
            .timeout(self.config.provider.timeout_duration())
            .send()
            .await
            .map_err(|e| AuthError::Provider(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::FORBIDDEN {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(username = %username, body = %body, "invalid credentials");
            return Err(AuthError::InvalidCredentials);
        }
        if status == reqwest::StatusCode::ACCEPTED {
            let body = response.text().await.unwrap_or_default();
            let properties = serde_json::from_str::<Map<String, Value>>(&body).unwrap_or_default();
            return Err(AuthError::Incomplete(properties));
        }
        if status.as_u16() >= 400 {
            let body = response.text().await.unwrap_or_default();
            let message =
                format!("unexpected status code {status} for user {username}: {body}");
            tracing::error!("{message}");
            return Err(AuthError::Provider(message));
        }

        let jwt = response
            .text()
            .await
            .map_err(|e| AuthError::Provider(e.to_string()))?;

        Ok(JwtResponse { jwt, allowed_applications })
    }

    /// Runs the configured pre-authentication hook, if any.
    ///
    /// Returns `Ok(None)` when no hook is configured. A false-y hook result
    /// (`null`, `false`, empty output) rejects the authentication attempt.
    async fn run_pre_auth_hook(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<HookOverride>, AuthError> {
        let Some(hook) = self.config.provider.pre_authentication_hook.as_deref() else {
            return Ok(None);
        };

        let mut child = tokio::process::Command::new(hook)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| AuthError::Hook(format!("could not start '{hook}': {e}")))?;

        let input = serde_json::json!({ "username": username, "password": password });
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(input.to_string().as_bytes())
                .await
                .map_err(|e| AuthError::Hook(e.to_string()))?;
        }

        let output = tokio::time::timeout(HOOK_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| AuthError::Hook(format!("'{hook}' timed out")))?
            .map_err(|e| AuthError::Hook(e.to_string()))?;

        if !output.status.success() {
            return Err(AuthError::Hook(format!("'{hook}' exited with {}", output.status)));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let result: Value = match serde_json::from_str(stdout.trim()) {
            Ok(value) => value,
            Err(_) if stdout.trim().is_empty() => Value::Null,
            Err(e) => return Err(AuthError::Hook(format!("bad hook output: {e}"))),
        };

        match result {
            Value::Null | Value::Bool(false) => Err(AuthError::InvalidCredentials),
            Value::Object(map) => {
                let over: HookOverride = serde_json::from_value(Value::Object(map))
                    .map_err(|e| AuthError::Hook(format!("bad hook result shape: {e}")))?;
                Ok(Some(over))
            }
            other => Err(AuthError::Hook(format!(
                "hook result must be an object, got {other}"
            ))),
        }
    }
}
