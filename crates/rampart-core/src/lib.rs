pub mod clock;
pub mod context;
pub mod error;
pub mod id;
pub mod pool;

pub use clock::{Clock, ManualClock, SystemClock, now_rfc3339};
pub use context::{Identity, RequestContext};
pub use error::{CoreError, Result};
pub use id::{REQUEST_ID_HEADER, RequestId};
pub use pool::PoolSnapshot;
