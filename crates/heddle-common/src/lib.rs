//! Shared building blocks for the heddle crates: a minimal HTTP client
//! abstraction and validated AT Protocol string types.

pub mod http_client;
pub mod types;

pub use http_client::HttpClient;
pub use types::{Did, Handle, IdentParseError};
