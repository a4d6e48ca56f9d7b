//! Rate limiting logic and state management.

mod clock;
mod limiter;
mod lru;
mod policy;
mod registry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use limiter::{Limiter, Rate};
pub use lru::{Insertion, LruCache};
pub use policy::{Policy, PolicyRule, PolicySet};
pub use registry::{LimiterRegistry, DEFAULT_CAPACITY};
