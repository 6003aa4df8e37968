//! Mock infrastructure for gateway testing.
//!
//! Provides the gateway assembly helper (full pipeline wiring over the
//! in-memory backend) and request helpers used by every test module.
//! Upstreams are mocked with mockito servers owned by the individual tests.

pub mod test_helpers;

pub use test_helpers::*;
