//! Transfer optimization layer.
//!
//! Everything that sits between the sync pipeline and the wire: batch
//! payload compression, token-bucket rate limiting, the endpoint-keyed
//! connection pool, and the TTL'd schema cache.

pub mod cache;
pub mod compress;
pub mod pool;
pub mod rate_limit;

pub use cache::{schema_key, SchemaCache, TtlCache};
pub use compress::Compressor;
pub use pool::{ConnectionFactory, ConnectionPool, EndpointKey, PooledConn};
pub use rate_limit::RateLimiter;
