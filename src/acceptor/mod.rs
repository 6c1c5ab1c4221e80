pub use acceptor::*;
pub use connection::*;
pub use events::*;
pub use factory::*;

mod acceptor;
mod connection;
mod events;
mod factory;
