//! Rate limiting logic and state management.

mod bucket;
pub mod identity;
mod overrides;
mod registry;
mod sweeper;

pub use bucket::{Decision, Quota, TokenBucket};
pub use identity::ClientIdentity;
pub use overrides::{Override, OverrideLists};
pub use registry::{LimiterEntry, LimiterRegistry, RegistryConfig, DEFAULT_MAX_IDLE, DEFAULT_SWEEP_INTERVAL};
pub use sweeper::{Sweeper, SweeperHandle};
