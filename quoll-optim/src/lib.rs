//! Gradient descent building blocks on top of `quoll`: the optimization
//! context that compiles a function, its gradient and its line function into
//! one JIT call context, and the 1-D line search along the gradient
//! direction.

pub mod context;
pub mod line_search;

pub use context::{LineSearchContext, OptimizationContext, OptimizeError};
pub use line_search::{
    line_search, line_search_with_params, IntermediatePoint, LineSearchParams, LineSearchResult,
};
