//! 1-D line search along the gradient direction.
//!
//! Works on the compiled line function `l(λ) = f(x + λ·g)` and its
//! derivative `l′`. Since `l′(0) = Σ gᵢ² ≥ 0`, the minimum lies at negative
//! λ: the search doubles negative candidate steps until `l′` changes sign,
//! then bisects the bracket until the derivative is inside tolerance or the
//! step budget runs out.
//!
//! Precondition: the compiled objective and gradient must have been
//! evaluated on the current point, so the call context's scratch holds the
//! values the line function's code builds on. The call-order guard turns a
//! violation into a typed error instead of a wrong number.

use crate::context::{LineSearchContext, OptimizeError};

/// Tunables of the bracketing + bisection search.
#[derive(Clone, Debug)]
pub struct LineSearchParams {
    /// The search stops once `|l′(λ)| < tolerance`.
    pub tolerance: f64,
    /// Budget of doubling steps while bracketing a sign change of `l′`.
    pub max_expansion_steps: usize,
    /// Budget of bisection steps inside the bracket.
    pub max_bisection_steps: usize,
    /// Magnitude of the first probe step.
    pub initial_step: f64,
}

impl Default for LineSearchParams {
    fn default() -> Self {
        LineSearchParams {
            tolerance: 1e-9,
            max_expansion_steps: 40,
            max_bisection_steps: 80,
            initial_step: 1.0,
        }
    }
}

/// One evaluated candidate step.
#[derive(Clone, Copy, Debug)]
pub struct IntermediatePoint {
    /// The candidate λ.
    pub step: f64,
    /// `l(λ)`.
    pub f: f64,
    /// `l′(λ)`.
    pub df: f64,
}

/// Outcome of a line search.
#[derive(Debug)]
pub struct LineSearchResult {
    /// The chosen step λ*; apply it with `move_point_along_gradient`.
    pub best_step: f64,
    /// The bracketing trajectory.
    pub path1: Vec<IntermediatePoint>,
    /// The refinement trajectory.
    pub path2: Vec<IntermediatePoint>,
    /// Human-readable notes on how the search concluded.
    pub comments: Vec<String>,
}

/// Evaluate `l` and `l′` at a candidate step, in that order — the
/// derivative's emitted code reads the slots the line function computes.
fn probe(context: &LineSearchContext<'_>, step: f64) -> Result<IntermediatePoint, OptimizeError> {
    let x = &context.vars_mapper.x;
    let f = context.l.call(context.jit_call_context, x, step)?;
    let df = context.d.call(context.jit_call_context, x, step)?;
    Ok(IntermediatePoint { step, f, df })
}

/// [`line_search_with_params`] with the default tunables.
pub fn line_search(context: &LineSearchContext<'_>) -> Result<LineSearchResult, OptimizeError> {
    line_search_with_params(context, &LineSearchParams::default())
}

/// Find a step λ* minimizing `l(λ)` along the gradient direction.
pub fn line_search_with_params(
    context: &LineSearchContext<'_>,
    params: &LineSearchParams,
) -> Result<LineSearchResult, OptimizeError> {
    let mut path1 = Vec::new();
    let mut path2 = Vec::new();
    let mut comments = Vec::new();

    let origin = probe(context, 0.0)?;
    path1.push(origin);

    if origin.df.abs() < params.tolerance {
        comments.push("the current point is already a critical point".to_string());
        return Ok(LineSearchResult {
            best_step: 0.0,
            path1,
            path2,
            comments,
        });
    }

    // Walk away from zero against the slope: for the canonical l′(0) > 0
    // the candidates go negative. Doubling continues until l′ flips sign.
    let direction = if origin.df > 0.0 { -1.0 } else { 1.0 };
    let mut near = origin;
    let mut far = None;
    let mut step = direction * params.initial_step;
    for _ in 0..params.max_expansion_steps {
        let candidate = probe(context, step)?;
        path1.push(candidate);
        if candidate.df == 0.0 || (candidate.df > 0.0) != (origin.df > 0.0) {
            far = Some(candidate);
            break;
        }
        near = candidate;
        step *= 2.0;
    }

    let mut far = match far {
        Some(far) => {
            comments.push("bracketed a sign change of the derivative".to_string());
            far
        }
        None => {
            // No sign change within the horizon. Fall back to the best
            // sampled step rather than diverging.
            let best = path1
                .iter()
                .copied()
                .min_by(|a, b| a.f.total_cmp(&b.f))
                .expect("path1 holds at least the origin");
            comments.push(
                "no derivative sign change within the search horizon; taking the best sampled step"
                    .to_string(),
            );
            return Ok(LineSearchResult {
                best_step: best.step,
                path1,
                path2,
                comments,
            });
        }
    };

    // Bisect the bracket down to tolerance.
    let mut best = far;
    for _ in 0..params.max_bisection_steps {
        if best.df.abs() < params.tolerance {
            break;
        }
        let middle = probe(context, 0.5 * (near.step + far.step))?;
        path2.push(middle);
        best = middle;
        if (middle.df > 0.0) == (origin.df > 0.0) {
            near = middle;
        } else {
            far = middle;
        }
    }
    if best.df.abs() < params.tolerance {
        comments.push("refined to derivative tolerance by bisection".to_string());
    } else {
        comments.push("bisection budget exhausted; returning the last midpoint".to_string());
    }

    Ok(LineSearchResult {
        best_step: best.step,
        path1,
        path2,
        comments,
    })
}
