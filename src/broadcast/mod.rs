pub use handler::*;
pub use observer::*;
pub use pool::*;
pub use server_pool::*;

mod handler;
mod observer;
mod pool;
mod server_pool;
