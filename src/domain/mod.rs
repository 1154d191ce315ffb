pub mod ess;
pub mod types;

pub use ess::*;
pub use types::*;
