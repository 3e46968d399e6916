pub mod model;
pub mod search;
pub mod store;
mod tls;

pub use store::{CleanupLock, FlagOp, FlagRewrite, MetaStore};
