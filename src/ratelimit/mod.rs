//! Rate limiting logic and state management.

mod algorithm;
mod drainer;
pub mod keys;
mod limiter;
mod registry;

pub use algorithm::Algorithm;
pub use drainer::{DrainerHandle, LeakyBucketDrainer};
pub use limiter::{Decision, FailurePolicy, RateLimiter};
pub use registry::{LimitRegistry, LimitSettings, DEFAULT_LIMIT, DEFAULT_WINDOW_SECS};
