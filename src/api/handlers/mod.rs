pub mod control;
pub mod system;

pub use control::*;
pub use system::*;
