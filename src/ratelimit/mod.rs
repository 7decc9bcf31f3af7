//! Rate limiting logic and state management.

mod clock;
mod engine;
mod fallback;
mod identity;
mod policy;
mod registry;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{Decision, PolicyEngine, RateLimitHeaders, DEFAULT_STORE_TIMEOUT, KEY_PREFIX};
pub use fallback::{FallbackCount, FallbackSweeper, FallbackTable, RateLimitEntry};
pub use identity::{fingerprint, ClientIdentityResolver, FINGERPRINT_PREFIX};
pub use policy::{KeyStrategy, Policy, RequestInfo, SkipRule};
pub use registry::{LimiterKind, PolicySpec, Registry, HEALTH_PATH, POLICY_TABLE};
pub use store::{CounterStore, RedisCounterStore, StoreError, WindowCount};
