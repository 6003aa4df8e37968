//! Hyperlink rewriting for upstream responses.
//!
//! Backends emit links that point at themselves. Before a response leaves
//! the gateway, URLs in `Location` headers and in JSON bodies are mapped
//! into the gateway's public namespace; links that have no public
//! counterpart are removed from bodies rather than leaked.
//!
//! A rewriter is compiled per application from its routing configuration:
//! each mapping pairs a regex over backend paths with a public path template
//! whose `:name` placeholders are filled from the regex's named groups.

use std::sync::Arc;

use axum::response::IntoResponse;
use http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use crate::types::{error_response, BufferedResponse, ProxyRequest, RouteHandler};

/// Header a client sets to opt out of body rewriting.
const X_NO_REWRITE: &str = "X-No-Rewrite";

/// Matches `:name` placeholders in routing patterns and templates.
fn placeholder_regex() -> Regex {
    Regex::new(":([a-zA-Z0-9]+)").expect("placeholder regex is valid")
}

#[derive(Debug, Error)]
pub enum RewriteError {
    /// The URL's path matches none of the application's mappings.
    #[error("unmappable URL")]
    Unmappable,

    #[error("could not parse URL '{0}'")]
    InvalidUrl(String),

    #[error("response body is not valid JSON: {0}")]
    InvalidBody(#[from] serde_json::Error),

    #[error("invalid URL mapping: {0}")]
    InvalidMapping(#[from] regex::Error),
}

/// The scheme and host links are rewritten onto.
#[derive(Debug, Clone)]
pub struct PublicUrl {
    pub scheme: String,
    pub host: String,
}

impl PublicUrl {
    /// Derives the public URL from the incoming request: host from the
    /// client-visible `Host`, scheme from `X-Forwarded-Proto` when it names
    /// a known scheme, https otherwise.
    #[must_use]
    pub fn from_request(request: &ProxyRequest) -> Self {
        let scheme = match request.header("X-Forwarded-Proto") {
            Some(proto @ ("http" | "https")) => proto.to_string(),
            _ => "https".to_string(),
        };
        Self { scheme, host: request.host().to_string() }
    }
}

struct Mapping {
    source: Regex,
    target: String,
    group_names: Vec<String>,
}

impl Mapping {
    fn substitute(&self, captures: &regex::Captures<'_>) -> String {
        let mut path = self.target.clone();
        // Longer names first so ":id" cannot clobber a ":idx" placeholder.
        let mut names: Vec<&String> = self.group_names.iter().collect();
        names.sort_by_key(|n| std::cmp::Reverse(n.len()));
        for name in names {
            if let Some(value) = captures.name(name) {
                path = path.replace(&format!(":{name}"), value.as_str());
            }
        }
        path
    }
}

/// Pattern-based URL rewriter for one application.
pub struct HyperlinkRewriter {
    mappings: Vec<Mapping>,
}

impl HyperlinkRewriter {
    /// Rewriter for a path-prefix application: every backend path is kept
    /// as-is under the public host.
    ///
    /// # Errors
    ///
    /// Never fails in practice; the signature matches
    /// [`for_patterns`](Self::for_patterns).
    pub fn for_path_prefix() -> Result<Self, RewriteError> {
        Self::compile(&[("^/(?P<path>.*)$".to_string(), "/:path".to_string())])
    }

    /// Rewriter for a pattern-routed application. Each configured
    /// `public pattern → backend target` entry becomes one mapping: the
    /// backend target (with `:name` placeholders turned into named groups)
    /// is the source, the public pattern is the template.
    ///
    /// # Errors
    ///
    /// Returns an error if a generated source regex does not compile.
    pub fn for_patterns<'a, I>(patterns: I) -> Result<Self, RewriteError>
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let placeholder = placeholder_regex();
        let entries: Vec<(String, String)> = patterns
            .into_iter()
            .map(|(public, target)| {
                let source = format!(
                    "^{}$",
                    placeholder.replace_all(target, "(?P<$1>[^/]+?)")
                );
                (source, public.clone())
            })
            .collect();
        Self::compile(&entries)
    }

    fn compile(entries: &[(String, String)]) -> Result<Self, RewriteError> {
        let placeholder = placeholder_regex();
        let mut mappings = Vec::with_capacity(entries.len());
        for (source, target) in entries {
            let source = Regex::new(source)?;
            let group_names = placeholder
                .captures_iter(target)
                .filter_map(|c| c.get(1))
                .map(|m| m.as_str().to_string())
                .collect();
            mappings.push(Mapping { source, target: target.clone(), group_names });
        }
        Ok(Self { mappings })
    }

    /// Maps one URL into the public namespace.
    ///
    /// Matching considers the path only; scheme and host are replaced by
    /// the public ones, the query string is preserved.
    ///
    /// # Errors
    ///
    /// [`RewriteError::Unmappable`] when no mapping matches,
    /// [`RewriteError::InvalidUrl`] when the input does not parse.
    pub fn rewrite_url(&self, url: &str, public: &PublicUrl) -> Result<String, RewriteError> {
        let parsed =
            url::Url::parse(url).map_err(|_| RewriteError::InvalidUrl(url.to_string()))?;

        for mapping in &self.mappings {
            if let Some(captures) = mapping.source.captures(parsed.path()) {
                let path = mapping.substitute(&captures);
                let mut rewritten = format!("{}://{}{}", public.scheme, public.host, path);
                if let Some(query) = parsed.query() {
                    rewritten.push('?');
                    rewritten.push_str(query);
                }
                return Ok(rewritten);
            }
        }

        Err(RewriteError::Unmappable)
    }

    /// Rewrites every link in a JSON body.
    ///
    /// # Errors
    ///
    /// Returns an error if the body is not valid JSON.
    pub fn rewrite_body(&self, body: &[u8], public: &PublicUrl) -> Result<Vec<u8>, RewriteError> {
        let value: Value = serde_json::from_slice(body)?;
        let rewritten = self.walk(value, public, false).unwrap_or(Value::Null);
        Ok(serde_json::to_vec(&rewritten)?)
    }

    /// Single-pass JSON traversal. Returns `None` when the element requests
    /// elision from its parent:
    ///
    /// - an `href` with an unmappable URL elides its containing map when the
    ///   path to it went through a `links`/`_links` key; otherwise only the
    ///   `href` key is dropped;
    /// - a container that was non-empty and lost all of its members is
    ///   elided as a whole.
    fn walk(&self, value: Value, public: &PublicUrl, in_links: bool) -> Option<Value> {
        match value {
            Value::Object(map) => {
                let was_empty = map.is_empty();
                let mut out = serde_json::Map::with_capacity(map.len());
                for (key, child) in map {
                    if key == "href" {
                        if let Value::String(href) = &child {
                            match self.rewrite_url(href, public) {
                                Ok(rewritten) => {
                                    out.insert(key, Value::String(rewritten));
                                }
                                Err(RewriteError::Unmappable) => {
                                    if in_links {
                                        return None;
                                    }
                                }
                                Err(e) => {
                                    tracing::error!(url = %href, error = %e, "could not map URL");
                                }
                            }
                        } else {
                            out.insert(key, child);
                        }
                    } else {
                        let links = in_links || key == "links" || key == "_links";
                        if let Some(kept) = self.walk(child, public, links) {
                            out.insert(key, kept);
                        }
                    }
                }
                if out.is_empty() && !was_empty {
                    None
                } else {
                    Some(Value::Object(out))
                }
            }
            Value::Array(items) => {
                let was_empty = items.is_empty();
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    if let Some(kept) = self.walk(item, public, in_links) {
                        out.push(kept);
                    }
                }
                if out.is_empty() && !was_empty {
                    None
                } else {
                    Some(Value::Array(out))
                }
            }
            other => Some(other),
        }
    }

    /// Rewrites `Location` values in place. Unmappable or unparsable values
    /// stay untouched.
    fn rewrite_location_headers(&self, headers: &mut HeaderMap, public: &PublicUrl) {
        let locations: Vec<String> = headers
            .get_all(header::LOCATION)
            .iter()
            .filter_map(|v| v.to_str().ok().map(str::to_string))
            .collect();
        if locations.is_empty() {
            return;
        }

        headers.remove(header::LOCATION);
        for location in locations {
            let value = match self.rewrite_url(&location, public) {
                Ok(rewritten) => rewritten,
                Err(e) => {
                    tracing::warn!(location = %location, error = %e, "leaving Location header unmapped");
                    location
                }
            };
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.append(header::LOCATION, value);
            }
        }
    }

    /// Wraps a handler with link rewriting.
    ///
    /// `X-No-Rewrite` skips body rewriting entirely. Bodies are rewritten
    /// only for `application/json` responses to non-HEAD requests; all
    /// other responses stream through with just their `Location` headers
    /// mapped. `Accept-Encoding` is dropped from the outbound request so
    /// the upstream body arrives uncompressed.
    pub fn decorate(self: Arc<Self>, handler: RouteHandler) -> RouteHandler {
        Arc::new(move |mut request: ProxyRequest| {
            let rewriter = self.clone();
            let inner = handler.clone();
            Box::pin(async move {
                if request.header(X_NO_REWRITE).is_some() {
                    tracing::debug!("skipping JSON rewriting on client request");
                    return inner(request).await;
                }

                let public = PublicUrl::from_request(&request);
                let is_head = request.method() == Method::HEAD;
                request.headers_mut().remove(header::ACCEPT_ENCODING);

                let mut response = inner(request).await;

                let json_body = response
                    .headers()
                    .get(header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .is_some_and(|ct| ct.starts_with("application/json"));

                if !json_body || is_head {
                    rewriter.rewrite_location_headers(response.headers_mut(), &public);
                    return response;
                }

                let mut buffered = match BufferedResponse::record(response).await {
                    Ok(buffered) => buffered,
                    Err(e) => {
                        tracing::error!(error = %e, "error while reading response body");
                        return error_response(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "internal server error",
                        );
                    }
                };

                match rewriter.rewrite_body(&buffered.body, &public) {
                    Ok(body) => {
                        if let Ok(len) = HeaderValue::from_str(&body.len().to_string()) {
                            buffered.headers.insert(header::CONTENT_LENGTH, len);
                        }
                        buffered.body = body.into();
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "error while rewriting response body");
                        return error_response(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "internal server error",
                        );
                    }
                }

                rewriter.rewrite_location_headers(&mut buffered.headers, &public);
                buffered.into_response()
            })
        })
    }
}
