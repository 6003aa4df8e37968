//! # Portcullis Core
//!
//! Core library for the portcullis microservice gateway.
//!
//! The gateway terminates client HTTP connections, authenticates requests
//! against opaque tokens backed by stored JWTs, applies per-application rate
//! limiting and response caching, rewrites backend hyperlinks into the
//! public namespace, and forwards requests to the matched backend.
//!
//! - **[`dispatcher`]**: the route table; derives routes from application
//!   configuration and composes the per-route middleware stack.
//!
//! - **[`auth`]**: JWT verification with a TTL-cached key, the two-tier
//!   opaque-token store, credential readers/writers, and the per-route
//!   authentication pipeline with token reminting.
//!
//! - **[`ratelimit`]**: fixed-window burst buckets over the shared backend.
//!
//! - **[`cache`]**: in-process LRU of buffered responses with safe/unsafe
//!   decorators.
//!
//! - **[`rewrite`]**: pattern-based rewriting of `Location` headers and
//!   URLs embedded in JSON bodies.
//!
//! - **[`proxy`]**: the upstream forwarder (header policies, streaming,
//!   timings).
//!
//! - **[`kv`]**, **[`discovery`]**, **[`config`]**, **[`metrics`]**: the
//!   backends and configuration the pipeline consumes.
//!
//! ## Request Flow
//!
//! ```text
//! Client Request
//!       │
//!       ▼
//! ┌────────────┐     ┌──────────────┐     ┌─────────────┐
//! │ Dispatcher │ ──► │ rate limiter │ ──► │ auth        │
//! │ (route)    │     │ (outermost)  │     │ (whitelist) │
//! └────────────┘     └──────────────┘     └──────┬──────┘
//!                                                │
//!                       cache hit ◄── ┌──────────▼──────┐
//!                                     │ response cache  │
//!                                     └──────────┬──────┘
//!                                                │ miss
//!                                     ┌──────────▼──────┐
//!                                     │ ProxyForwarder  │
//!                                     └──────────┬──────┘
//!                                                │
//!                                     ┌──────────▼──────┐
//!                                     │ link rewriting  │
//!                                     └──────────┬──────┘
//!                                                ▼
//!                                            Response
//! ```
//!
//! The behavior stack is `[cache, auth, rateLimit]`, applied LIFO: the
//! rate limiter decides first, authentication second, and the cache sits
//! innermost so entries are request-identity-agnostic.

pub mod auth;
pub mod cache;
pub mod config;
pub mod discovery;
pub mod dispatcher;
pub mod kv;
pub mod metrics;
pub mod proxy;
pub mod ratelimit;
pub mod rewrite;
pub mod testutil;
pub mod types;
