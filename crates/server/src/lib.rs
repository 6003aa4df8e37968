//! Server-side surfaces of the portcullis gateway: the admin API, the
//! monitoring endpoint, and the audit log listener. The binary in `main.rs`
//! wires these around the core library.

pub mod admin;
pub mod audit;
pub mod monitoring;
