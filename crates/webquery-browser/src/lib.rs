//! Browser side of query orchestration: session pool, fetch executor, and
//! the HTTP client for the browser infrastructure service.

pub mod capability;
pub mod client;
pub mod executor;
pub mod pool;
pub mod types;

pub use capability::BrowserCapability;
pub use client::HttpBrowserClient;
pub use executor::FetchExecutor;
pub use pool::{SessionLease, SessionPool, SessionPoolConfig};
pub use types::*;
