//! Composition connectors: processors that nest other processors.

pub mod circuit_breaker;
pub mod concurrent;
pub mod fallback;
pub mod handle;
pub mod race;
pub mod rate_limiter;
pub mod retry;
pub mod scaffold;
pub mod sequence;
pub mod switch;
pub mod timeout;
pub mod worker_pool;
