pub mod config;
pub mod dispatch;
pub mod engine;
pub mod fanout;
pub mod favorites;
pub mod invariants;
pub mod listops;
pub mod query;
pub mod reconcile;
pub mod reorder;
pub mod scenario;
pub mod util;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use config::*;
pub use dispatch::*;
pub use engine::*;
pub use invariants::*;
pub use reconcile::*;
pub use util::*;
pub use worker::*;
