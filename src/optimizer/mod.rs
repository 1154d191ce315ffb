pub mod apparent_power;
pub mod coefficients;
pub mod constraints;
pub mod extrema;
pub mod factories;
pub mod merger;
pub mod qp;
pub mod solver;
pub mod store;
pub mod strategies;

pub use apparent_power::*;
pub use coefficients::*;
pub use constraints::*;
pub use extrema::*;
pub use factories::*;
pub use merger::*;
pub use qp::QpOutcome;
pub use solver::*;
pub use store::*;
pub use strategies::*;
