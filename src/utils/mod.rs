pub use cancel_token::*;
pub use health_flag::*;
pub use pinning::*;
pub use state::*;

mod cancel_token;
mod health_flag;
pub mod logger;
mod pinning;
mod state;
