//! Two-tier read-through cache.
//!
//! - L1: bounded in-process cache with cost-based admission ([`LocalCache`])
//! - L2: shared Redis cache behind a pooled client ([`RedisCache`])
//!
//! [`ReadThrough`] composes both tiers with request coalescing
//! ([`SingleFlight`]), a negative cache for confirmed absences
//! ([`NegativeCache`]) and an optional probabilistic pre-filter
//! ([`MembershipFilter`]).

pub mod codec;
pub mod error;
pub mod local;
pub mod membership;
pub mod metrics;
pub mod negative;
pub mod pattern;
pub mod read_through;
pub mod remote;
pub mod singleflight;
pub mod store;

pub use codec::Codec;
pub use error::{CacheError, Result};
pub use local::{LocalCache, LocalCacheConfig, LocalStats};
pub use membership::MembershipFilter;
pub use negative::NegativeCache;
pub use read_through::{ReadThrough, ReadThroughConfig};
pub use remote::{RedisCache, RedisCacheConfig, scripts};
pub use singleflight::{Flight, SingleFlight};
pub use store::{MemoryStore, SharedStore};
