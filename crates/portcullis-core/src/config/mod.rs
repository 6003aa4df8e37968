//! Gateway configuration with file and environment loading.
//!
//! Configuration is loaded in this order (later overrides earlier):
//!
//! 1. **Compiled defaults**: hardcoded in the `Default` implementations
//! 2. **Config file**: JSON or TOML file passed on the command line
//! 3. **Environment variables**: `PORTCULLIS_*` overrides for specific fields
//!
//! # Sections
//!
//! - [`Application`]: one proxied application (routing, backend, auth,
//!   caching, rate limiting)
//! - [`RateLimitingConfig`]: global token bucket parameters
//! - [`AuthenticationConfig`]: JWT verification and the authentication
//!   provider
//! - [`ProxyConfig`]: header policies, OPTIONS behavior, upstream timeout
//! - [`RedisConfig`]: the shared key-value backend
//! - [`ConsulConfig`]: optional service discovery
//!
//! # Validation
//!
//! Configuration is validated at load time. Invalid routing or backend
//! definitions are fatal at startup rather than failing on the first request.
//!
//! # Example
//!
//! ```json
//! {
//!   "applications": {
//!     "svc": {
//!       "routing": { "type": "path", "path": "/s" },
//!       "backend": { "url": "http://upstream.internal:8000" },
//!       "caching": { "enabled": true, "autoFlush": true },
//!       "rateLimiting": true
//!     }
//!   },
//!   "rateLimiting": { "burst": 100, "window": 60 },
//!   "redis": { "address": "127.0.0.1:6379" }
//! }
//! ```

use std::{collections::BTreeMap, path::Path, time::Duration};

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Configuration {
    /// Proxied applications, keyed by name. Registration iterates in key
    /// order, which keeps route setup deterministic.
    pub applications: BTreeMap<String, Application>,

    /// Global rate limiter parameters, shared by all rate-limited apps.
    pub rate_limiting: RateLimitingConfig,

    /// JWT verification and authentication provider settings.
    pub authentication: AuthenticationConfig,

    /// Header policies and OPTIONS handling.
    pub proxy: ProxyConfig,

    /// Shared key-value backend.
    pub redis: RedisConfig,

    /// Optional service discovery settings.
    pub consul: Option<ConsulConfig>,

    /// Audit log sinks.
    pub logging: Vec<LoggingConfig>,
}

/// A single proxied application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    pub routing: Routing,
    pub backend: Backend,
    #[serde(default)]
    pub auth: ApplicationAuth,
    #[serde(default)]
    pub caching: Caching,
    #[serde(default)]
    pub rate_limiting: bool,
}

/// How requests are matched to an application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Routing {
    #[serde(rename = "type")]
    pub kind: RoutingKind,

    /// Path prefix for `path` routing, e.g. `/s`.
    #[serde(default)]
    pub path: String,

    /// Public pattern → backend target template for `pattern` routing,
    /// e.g. `"/k/:id" → "/known/:id"`.
    #[serde(default)]
    pub patterns: BTreeMap<String, String>,

    /// Reserved for host-based dispatching, which this build does not
    /// support.
    #[serde(default)]
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingKind {
    #[default]
    Path,
    Pattern,
}

/// Where an application's requests are forwarded to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Backend {
    /// Direct upstream base URL. Mutually exclusive with `service`.
    pub url: Option<String>,

    /// Discovery service name; the base URL is derived as
    /// `http://[<tag>.]<service>.<domain>`.
    pub service: Option<String>,
    pub tag: Option<String>,

    /// Optional HTTP basic auth applied to upstream requests.
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Per-application authentication settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApplicationAuth {
    /// Disables the auth pipeline for this application entirely.
    pub disable: bool,
    pub writer: TokenWriterConfig,
}

/// How the verified JWT is installed on the upstream request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TokenWriterConfig {
    /// `"header"` or `"authorization"`. Empty selects the default header
    /// writer.
    pub mode: String,
    /// Header name for `"header"` mode. Empty selects `X-JWT`.
    pub name: String,
}

/// Per-application response caching.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Caching {
    pub enabled: bool,
    /// Entry lifetime in seconds. `0` means entries live until evicted.
    pub ttl: u64,
    /// Evict the fingerprint when a mutating method hits the route.
    pub auto_flush: bool,
}

/// Global token bucket parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitingConfig {
    /// Tokens granted when a bucket window opens.
    pub burst: i64,
    /// Window length in seconds.
    pub window: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self { burst: 100, window: 60 }
    }
}

impl RateLimitingConfig {
    #[must_use]
    pub fn window_duration(&self) -> Duration {
        Duration::from_secs(self.window)
    }
}

/// JWT verification and authentication provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthenticationConfig {
    /// Authentication mode. Only `"rest"` is supported.
    pub mode: String,

    pub provider: ProviderConfig,

    /// Static PEM-encoded RSA public key. Takes precedence over the URL.
    pub verification_key: Option<String>,

    /// URL the verification key is fetched from when no static key is set.
    pub verification_key_url: Option<String>,

    /// Seconds a fetched verification key stays cached.
    pub key_cache_ttl: u64,

    #[serde(rename = "enableCORS")]
    pub enable_cors: bool,
}

impl Default for AuthenticationConfig {
    fn default() -> Self {
        Self {
            mode: "rest".to_string(),
            provider: ProviderConfig::default(),
            verification_key: None,
            verification_key_url: None,
            key_cache_ttl: 300,
            enable_cors: false,
        }
    }
}

impl AuthenticationConfig {
    #[must_use]
    pub fn key_cache_ttl_duration(&self) -> Duration {
        Duration::from_secs(self.key_cache_ttl)
    }
}

/// The upstream identity provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderConfig {
    /// Provider base URL; the authentication call goes to
    /// `<url>/authenticate`.
    pub url: Option<String>,

    /// Name of the application that fronts the provider. Responses from it
    /// may carry token reminting triggers.
    pub service: Option<String>,

    /// Extra parameters sent with every authentication request.
    pub parameters: serde_json::Map<String, serde_json::Value>,

    /// Whether the gateway exposes its own authentication endpoint.
    pub allow_authentication: bool,

    /// Route of the authentication endpoint. Empty selects `/authenticate`.
    pub authentication_uri: Option<String>,

    /// Path of an executable pre-authentication hook. It receives
    /// `{"username": …, "password": …}` on stdin and answers with `false`
    /// (reject) or `{"body"?, "url"?, "allowedApplications"?}` on stdout.
    pub pre_authentication_hook: Option<String>,

    /// Deadline for the provider call, in seconds. Independent of the
    /// per-application proxy timeout.
    pub timeout: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            url: None,
            service: None,
            parameters: serde_json::Map::new(),
            allow_authentication: false,
            authentication_uri: None,
            pre_authentication_hook: None,
            timeout: 10,
        }
    }
}

impl ProviderConfig {
    #[must_use]
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

/// Header policies, OPTIONS behavior and the upstream deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyConfig {
    /// Upstream response headers the gateway removes.
    pub strip_response_headers: Vec<String>,

    /// Headers overlaid onto every response.
    pub set_response_headers: BTreeMap<String, String>,

    /// Headers set on every upstream request.
    pub set_request_headers: BTreeMap<String, String>,

    pub options: OptionsConfig,

    /// Upstream request deadline in seconds.
    pub timeout: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            strip_response_headers: Vec::new(),
            set_response_headers: BTreeMap::new(),
            set_request_headers: BTreeMap::new(),
            options: OptionsConfig::default(),
            timeout: 30,
        }
    }
}

impl ProxyConfig {
    #[must_use]
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

/// OPTIONS handling: synthesized preflight or pass-through.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OptionsConfig {
    /// Synthesize OPTIONS responses instead of binding the safe handler.
    pub enabled: bool,
    /// Overlay `Access-Control-*` headers on synthesized responses.
    pub cors: bool,
}

/// Shared key-value backend connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RedisConfig {
    /// `host:port` of the backend.
    pub address: String,
    pub password: Option<String>,
    pub database: i64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self { address: "127.0.0.1:6379".to_string(), password: None, database: 0 }
    }
}

/// Optional service discovery settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConsulConfig {
    pub host: String,
    pub port: u16,
    pub datacenter: Option<String>,
}

/// One audit log sink.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    /// Sink kind. This build ships `"audit"` (structured tracing events).
    pub kind: String,
    #[serde(default)]
    pub target: Option<String>,
}

impl Configuration {
    /// Loads configuration from a file, with `PORTCULLIS_*` environment
    /// variables overriding individual fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or a value has
    /// the wrong type.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(Environment::with_prefix("PORTCULLIS").separator("__"))
            .build()?
            .try_deserialize()
    }

    /// Validates the loaded configuration.
    ///
    /// # Errors
    ///
    /// Returns a human-readable description of the first problem found.
    /// A failed validation is fatal at startup.
    pub fn validate(&self) -> Result<(), String> {
        for (name, app) in &self.applications {
            match app.routing.kind {
                RoutingKind::Path => {
                    if !app.routing.path.starts_with('/') {
                        return Err(format!(
                            "application '{name}': routing path must start with '/'"
                        ));
                    }
                    if app.routing.path.len() > 1 && app.routing.path.ends_with('/') {
                        return Err(format!(
                            "application '{name}': routing path must not end with '/'"
                        ));
                    }
                }
                RoutingKind::Pattern => {
                    if app.routing.patterns.is_empty() {
                        return Err(format!(
                            "application '{name}': pattern routing requires at least one pattern"
                        ));
                    }
                    for pattern in app.routing.patterns.keys() {
                        if !pattern.starts_with('/') {
                            return Err(format!(
                                "application '{name}': pattern '{pattern}' must start with '/'"
                            ));
                        }
                    }
                }
            }

            match (&app.backend.url, &app.backend.service) {
                (None, None) => {
                    return Err(format!(
                        "application '{name}': backend requires either a url or a service"
                    ));
                }
                (Some(url), _) => {
                    url::Url::parse(url).map_err(|e| {
                        format!("application '{name}': invalid backend url '{url}': {e}")
                    })?;
                }
                _ => {}
            }
        }

        if self.applications.values().any(|a| a.rate_limiting) {
            if self.rate_limiting.burst <= 0 {
                return Err("rateLimiting.burst must be greater than zero".to_string());
            }
            if self.rate_limiting.window == 0 {
                return Err("rateLimiting.window must be greater than zero".to_string());
            }
        }

        let auth_needed = self.applications.values().any(|a| !a.auth.disable);
        if auth_needed
            && self.authentication.verification_key.is_none()
            && self.authentication.verification_key_url.is_none()
        {
            return Err(
                "authentication requires a verificationKey or verificationKeyUrl".to_string()
            );
        }

        if self.authentication.mode != "rest" {
            return Err(format!(
                "unsupported authentication mode: '{}'",
                self.authentication.mode
            ));
        }

        Ok(())
    }
}
