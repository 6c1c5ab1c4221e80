pub use chain::*;
pub use codec::*;
pub use factory::*;

mod chain;
mod codec;
mod factory;
