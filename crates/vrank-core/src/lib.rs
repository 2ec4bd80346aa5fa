pub mod backoff;
pub mod eligibility;
pub mod error;
pub mod events;
pub mod ids;
pub mod model;
pub mod snapshot;
pub mod types;

pub use backoff::*;
pub use eligibility::*;
pub use error::*;
pub use events::*;
pub use ids::*;
pub use model::*;
pub use snapshot::*;
pub use types::*;

/// Maximum number of concurrently flagged favorite tasks per user.
pub const FAVORITE_CAPACITY: usize = 25;
