//! Symbolic expression DAG with reverse-style differentiation and a native
//! x86-64 JIT, built for gradient descent with line search.
//!
//! The pipeline: build an expression over a tree of named variables, freeze
//! the tree to assign dense indices, differentiate symbolically, and compile
//! the function, its gradient and the 1-D line function to machine code that
//! shares one scratch buffer — so each compiled function reuses what the
//! previous ones already computed.
//!
//! ```
//! use quoll::{JITCallContext, JITCompiler, VarsContext};
//!
//! let context = VarsContext::new().unwrap();
//! let x = context.x();
//! x.key("a").unwrap().set(1.0).unwrap();
//! let a = x.key("a").unwrap().value().unwrap();
//! let v = a + a;
//!
//! let call_context = JITCallContext::new().unwrap();
//! let f = JITCompiler::new(&call_context).unwrap().compile(v).unwrap();
//! assert_eq!(f.call(&call_context, &[2.5]).unwrap(), 5.0);
//! ```
//!
//! The `quoll-optim` crate builds the gradient-descent optimization context
//! and the line search on top of this one.

pub mod differentiate;
pub mod expression;
pub mod index;
pub mod jit;
pub mod vars;

pub use differentiate::{
    build_1d_function, compute_gradient, differentiate, differentiate_by_lambda,
    differentiate_with_stack, generate_line_search_function, DifferentiateError,
    DifferentiatorStack,
};
pub use expression::{ExpressionNode, FnKind, OpKind, Value};
pub use index::{IndexKind, NodeIndex};
pub use jit::{
    JITCallContext, JITCompiledFunction, JITCompiledFunctionReturningVector,
    JITCompiledFunctionWithArgument, JITCompiler, JitError,
};
pub use vars::{Var, VarsContext, VarsDump, VarsError, VarsMapper, VarsMapperConfig};
