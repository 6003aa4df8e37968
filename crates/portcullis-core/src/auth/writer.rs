//! Credential injection into upstream requests.

use http::{header, HeaderMap, HeaderName, HeaderValue};

use crate::config::TokenWriterConfig;

const DEFAULT_HEADER: &str = "X-JWT";

/// How a verified JWT is handed to the upstream.
#[derive(Debug, Clone)]
pub enum TokenWriter {
    /// Writes the raw JWT into the named header.
    Header(HeaderName),
    /// Writes `Authorization: Bearer <jwt>`.
    Authorization,
}

impl TokenWriter {
    /// Builds a writer from an application's configuration. Unknown modes
    /// and bad header names fall back to the default `X-JWT` header writer.
    #[must_use]
    pub fn from_config(config: &TokenWriterConfig) -> Self {
        match config.mode.as_str() {
            "authorization" => TokenWriter::Authorization,
            "header" | "" => {
                let name = if config.name.is_empty() { DEFAULT_HEADER } else { &config.name };
                match HeaderName::try_from(name) {
                    Ok(name) => TokenWriter::Header(name),
                    Err(_) => {
                        tracing::error!(name = %name, "bad token writer header name");
                        TokenWriter::default()
                    }
                }
            }
            other => {
                tracing::error!(mode = %other, "bad token writer mode");
                TokenWriter::default()
            }
        }
    }

    /// Installs the JWT on a request's headers.
    pub fn write(&self, headers: &mut HeaderMap, jwt: &str) {
        match self {
            TokenWriter::Header(name) => {
                if let Ok(value) = HeaderValue::from_str(jwt) {
                    headers.insert(name.clone(), value);
                }
            }
            TokenWriter::Authorization => {
                if let Ok(value) = HeaderValue::from_str(&format!("Bearer {jwt}")) {
                    headers.insert(header::AUTHORIZATION, value);
                }
            }
        }
    }
}

impl Default for TokenWriter {
    fn default() -> Self {
        TokenWriter::Header(HeaderName::from_static("x-jwt"))
    }
}
