//! Rate limiting.
//!
//! Two halves that never talk to each other directly:
//!
//! - **Admission**: [`RateLimiter`] gates outbound requests with a weighted
//!   sliding window per [`RateLimitKey`]. Each API key has its own bucket and
//!   unauthenticated traffic shares one bucket per exchange.
//! - **Observation**: [`parse`] reads the quota headers exchanges send back and
//!   [`RateLimitStore`] keeps the latest snapshot for callers to inspect.
//!
//! State lives in the process only; separate processes do not share buckets.

mod headers;
mod key;
mod limiter;
mod store;
mod window;

pub use headers::{HeaderSource, RateLimitInfo, parse, parse_at};
pub use key::{Discriminator, RateLimitKey};
pub use limiter::{DEFAULT_IDLE_EVICTION, RateLimiter};
pub use store::RateLimitStore;
pub use window::{Admission, LimitConfig, WeightedWindow};
