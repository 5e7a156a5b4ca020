//! Control components of the protection cycle
//!
//! - Rate-limit feedback loop with hysteresis and saturation bounds
//! - Monotonic blocklist reconciliation
//! - Bounded threat sampling

pub mod blocklist;
pub mod rate_limit;
pub mod sampler;

pub use blocklist::BlocklistManager;
pub use rate_limit::{decide, LimitBounds, RateLimitController};
pub use sampler::ThreatSampler;
