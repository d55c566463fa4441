//! The optimization context: everything needed for gradient descent over
//! one objective, compiled once.
//!
//! Construction differentiates the objective by every variable, builds the
//! 1-D line function `l(λ) = f(x₀ + λ·g)` and its derivative by λ, and
//! JIT-compiles all of them — in the order `f`, `g`, `l`, `l′` — into one
//! shared call context. That order is load-bearing: each compiled function
//! assumes the scratch slots of the previous ones are current, which the
//! call-order guard enforces at run time.

use std::fmt;

use quoll::jit::JITCompiledFunctionWithArgument;
use quoll::{
    compute_gradient, differentiate_by_lambda, generate_line_search_function, DifferentiateError,
    JITCallContext, JITCompiledFunction, JITCompiledFunctionReturningVector, JITCompiler,
    JitError, Value, VarsContext, VarsError, VarsMapper, VarsMapperConfig,
};

/// Errors from the optimizer layer: a union of the layers below it.
#[derive(Debug)]
pub enum OptimizeError {
    Vars(VarsError),
    Differentiate(DifferentiateError),
    Jit(JitError),
}

impl fmt::Display for OptimizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizeError::Vars(e) => write!(f, "{}", e),
            OptimizeError::Differentiate(e) => write!(f, "{}", e),
            OptimizeError::Jit(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for OptimizeError {}

impl From<VarsError> for OptimizeError {
    fn from(e: VarsError) -> Self {
        OptimizeError::Vars(e)
    }
}

impl From<DifferentiateError> for OptimizeError {
    fn from(e: DifferentiateError) -> Self {
        OptimizeError::Differentiate(e)
    }
}

impl From<JitError> for OptimizeError {
    fn from(e: JitError) -> Self {
        OptimizeError::Jit(e)
    }
}

/// A function, its gradient, its line function and the line function's
/// derivatives, all JIT-compiled into one call context, plus the mutable
/// current point.
pub struct OptimizationContext {
    f: Value,
    g: Vec<Value>,
    l: Value,
    ds: Vec<Value>,
    vars_mapper: VarsMapper,
    jit_call_context: JITCallContext,
    compiled_f: JITCompiledFunction,
    compiled_g: JITCompiledFunctionReturningVector,
    compiled_l: JITCompiledFunctionWithArgument,
    compiled_ds: Vec<JITCompiledFunctionWithArgument>,
}

impl OptimizationContext {
    /// Build and compile everything for the objective `f`. The variables
    /// context must be the active, unfrozen one the expression was built in.
    pub fn new(vars_context: &VarsContext, f: Value) -> Result<Self, OptimizeError> {
        // Freeze to assign flat indices, differentiate, then unfreeze so the
        // JIT call context can take its own freeze over the full arena
        // (differentiation grows the arena; the scratch has to cover it).
        let config = vars_context.freeze()?;
        let built = Self::build_derived_expressions(&config, f);
        vars_context.unfreeze()?;
        let (g, l, ds) = built?;

        let jit_call_context = JITCallContext::new()?;
        let mut compiler = JITCompiler::new(&jit_call_context)?;
        let compiled_f = compiler.compile(f)?;
        let compiled_g = compiler.compile_vector(&g)?;
        let compiled_l = compiler.compile_with_argument(l)?;
        let compiled_ds = ds
            .iter()
            .map(|&d| compiler.compile_with_argument(d))
            .collect::<Result<Vec<_>, _>>()?;
        let vars_mapper = VarsMapper::new(jit_call_context.config());

        Ok(OptimizationContext {
            f,
            g,
            l,
            ds,
            vars_mapper,
            jit_call_context,
            compiled_f,
            compiled_g,
            compiled_l,
            compiled_ds,
        })
    }

    /// The derivative chain is prepared as a vector so higher orders can be
    /// added; only the first is taken today.
    fn build_derived_expressions(
        config: &VarsMapperConfig,
        f: Value,
    ) -> Result<(Vec<Value>, Value, Vec<Value>), OptimizeError> {
        let g = compute_gradient(f)?;
        let l = generate_line_search_function(config, f, &g)?;
        let d1 = differentiate_by_lambda(l)?;
        Ok((g, l, vec![d1]))
    }

    pub fn objective(&self) -> Value {
        self.f
    }

    pub fn gradient(&self) -> &[Value] {
        &self.g
    }

    pub fn line_function(&self) -> Value {
        self.l
    }

    pub fn line_derivatives(&self) -> &[Value] {
        &self.ds
    }

    pub fn config(&self) -> &VarsMapperConfig {
        self.jit_call_context.config()
    }

    pub fn jit_call_context(&self) -> &JITCallContext {
        &self.jit_call_context
    }

    pub fn vars_mapper(&self) -> &VarsMapper {
        &self.vars_mapper
    }

    pub fn vars_mapper_mut(&mut self) -> &mut VarsMapper {
        &mut self.vars_mapper
    }

    pub fn compiled_f(&self) -> &JITCompiledFunction {
        &self.compiled_f
    }

    pub fn compiled_g(&self) -> &JITCompiledFunctionReturningVector {
        &self.compiled_g
    }

    pub fn compiled_l(&self) -> &JITCompiledFunctionWithArgument {
        &self.compiled_l
    }

    /// Compiled derivatives of the line function, ascending order; only the
    /// first is populated today.
    pub fn compiled_line_derivatives(&self) -> &[JITCompiledFunctionWithArgument] {
        &self.compiled_ds
    }

    /// A snapshot of the current point.
    pub fn current_point(&self) -> Vec<f64> {
        self.vars_mapper.x.clone()
    }

    /// Evaluate the compiled objective at the current point. This also
    /// primes the scratch, making the gradient legal to evaluate next.
    pub fn compute_current_objective_function_value(&self) -> Result<f64, OptimizeError> {
        Ok(self.compiled_f.call(&self.jit_call_context, &self.vars_mapper.x)?)
    }

    /// Evaluate the compiled gradient at the current point. The objective
    /// must have been evaluated first on this point.
    pub fn compute_current_gradient(&self) -> Result<Vec<f64>, OptimizeError> {
        Ok(self.compiled_g.call(&self.jit_call_context, &self.vars_mapper.x)?)
    }

    /// Move the point along the gradient: `x[i] += k * g_i` for every
    /// non-constant variable. Reads the gradient values from the scratch, so
    /// `f` and `g` must have been evaluated on the current point. Marks the
    /// new point afterwards.
    pub fn move_point_along_gradient(&mut self, k: f64) {
        let config = self.jit_call_context.config();
        let steps: Vec<Option<f64>> = self
            .g
            .iter()
            .enumerate()
            .map(|(i, g_i)| {
                if config.is_constant[i] {
                    None
                } else {
                    Some(k * self.jit_call_context.value_of(g_i.index(), &self.vars_mapper.x))
                }
            })
            .collect();
        for (i, step) in steps.into_iter().enumerate() {
            if let Some(step) = step {
                self.vars_mapper.x[i] += step;
            }
        }
        self.jit_call_context.mark_new_point();
    }

    /// The borrowed view the 1-D line search consumes.
    pub fn line_search_context(&self) -> LineSearchContext<'_> {
        LineSearchContext {
            jit_call_context: &self.jit_call_context,
            vars_mapper: &self.vars_mapper,
            l: &self.compiled_l,
            d: &self.compiled_ds[0],
            more_ds: self.compiled_ds[1..].iter().collect(),
        }
    }
}

/// The slice of an [`OptimizationContext`] the line search needs: the call
/// context, the current point, the compiled line function and its first
/// derivative. Higher-order derivatives ride along for line searches that
/// can use them.
pub struct LineSearchContext<'a> {
    pub(crate) jit_call_context: &'a JITCallContext,
    pub(crate) vars_mapper: &'a VarsMapper,
    pub(crate) l: &'a JITCompiledFunctionWithArgument,
    pub(crate) d: &'a JITCompiledFunctionWithArgument,
    pub(crate) more_ds: Vec<&'a JITCompiledFunctionWithArgument>,
}

impl<'a> LineSearchContext<'a> {
    /// Compiled derivatives of the line function beyond the first, in
    /// ascending order. Empty with the default derivative chain.
    pub fn higher_order_derivatives(&self) -> &[&'a JITCompiledFunctionWithArgument] {
        &self.more_ds
    }
}
