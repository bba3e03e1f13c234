pub mod base;
pub mod health;
pub mod logging;
pub mod pipeline;

pub use base::*;
pub use health::*;
pub use logging::*;
pub use pipeline::*;
