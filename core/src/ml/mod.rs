//! Machine learning: feature assembly and linear regression.

pub mod feature;
pub mod regression;
pub mod solver;

pub use feature::{HandleInvalid, VectorAssembler};
pub use regression::{LinearRegression, LinearRegressionModel, LinearRegressionSummary};
pub use solver::Solver;
