use thiserror::Error;

/// Errors raised while setting up the upstream client or a request.
///
/// Transport failures during forwarding are not represented here: the
/// forwarder renders them into the gateway's error envelope directly, so
/// a broken upstream never propagates past it.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("could not build upstream HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),
}
