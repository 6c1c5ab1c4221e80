pub use bootstrap::*;
pub use routing::*;
pub use worker_pool::*;

mod bootstrap;
mod routing;
mod worker_pool;
