//! cachegrid: a multi-tenant, horizontally-scalable, in-memory key-value
//! cache. A Router authenticates tenants, places keys on a consistent-hash
//! ring, and fans requests out to Storage Worker processes; a Config
//! Subscriber keeps the Router's routing table hot-reloadable.

pub mod config;
pub mod error;
pub mod metrics;
pub mod ratelimit;
pub mod ring;
pub mod router;
pub mod store;
pub mod wire;
pub mod worker;

pub use error::{CacheError, Result};
