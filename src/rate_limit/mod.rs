//! Rate Limiting Module
//!
//! Token-bucket rate limiting with two layers:
//!
//! - a per-identity bucket, sized by the identity's privilege tier, created
//!   lazily on first use and reclaimed after an idle TTL
//! - a single global bucket that caps aggregate throughput regardless of
//!   how many identities are active
//!
//! Buckets mutate through atomics, so unrelated callers never serialize on
//! a shared lock; the identity map is only locked to insert or reclaim.

pub mod bucket;
pub mod limiter;

pub use bucket::TokenBucket;
pub use limiter::RateLimiter;
