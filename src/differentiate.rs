//! Non-recursive symbolic differentiation over the expression DAG.
//!
//! The differentiator walks an expression with a manually managed stack of
//! frames instead of recursion, so arbitrarily deep expressions cannot blow
//! the call stack. The stack's backing storage grows geometrically and never
//! shrinks, so computing a full gradient — one differentiation pass per
//! variable — makes no allocations for the stack after the first few pushes.
//!
//! Derivatives are themselves expressions: every rule appends nodes to the
//! active context's arena and returns a [`Value`]. The zeroes and ones
//! minted for variable leaves are ordinary immediate nodes, deliberately not
//! deduplicated.

use std::fmt;

use crate::expression::{ExpressionNode, FnKind, OpKind};
use crate::index::{IndexKind, NodeIndex};
use crate::vars::{self, VarsError, VarsMapperConfig};
use crate::Value;

/// Errors from the differentiation layer.
#[derive(Clone, Debug, PartialEq)]
pub enum DifferentiateError {
    /// An index did not resolve to a differentiable node (stale index from
    /// another context, or an arena that has been torn down).
    NodeTypeNotImplemented,
    /// `unit_step` has no useful derivative; differentiate `ramp` instead.
    UnitStep,
    /// `sigmoid` is deliberately not differentiated; differentiate
    /// `log_sigmoid` instead.
    Sigmoid,
    /// A lambda marker was encountered while differentiating by a variable.
    LambdaOutsideLambdaDifferentiation,
    /// A substitution or gradient vector does not match the frozen config's
    /// dimension.
    GradientDimMismatch,
    /// A variables-layer failure, e.g. differentiating against an unfrozen
    /// tree.
    Vars(VarsError),
}

impl fmt::Display for DifferentiateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DifferentiateError::NodeTypeNotImplemented => {
                write!(f, "the expression index does not resolve to a differentiable node")
            }
            DifferentiateError::UnitStep => {
                write!(f, "unit_step is not differentiable; use ramp for the integrated form")
            }
            DifferentiateError::Sigmoid => {
                write!(f, "sigmoid is not differentiated directly; use log_sigmoid")
            }
            DifferentiateError::LambdaOutsideLambdaDifferentiation => {
                write!(f, "lambda encountered while differentiating by a variable")
            }
            DifferentiateError::GradientDimMismatch => {
                write!(f, "substitution vector dimension does not match the frozen config")
            }
            DifferentiateError::Vars(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for DifferentiateError {}

impl From<VarsError> for DifferentiateError {
    fn from(e: VarsError) -> Self {
        DifferentiateError::Vars(e)
    }
}

/// One frame of the manual stack. The ready bit lives in the scratch bits of
/// `index`; `ret_slot_times_2` is the parent frame index doubled, with the
/// low bit selecting the lhs/rhs return slot.
#[derive(Clone, Copy)]
struct Frame {
    index: NodeIndex,
    ret: [NodeIndex; 2],
    ret_slot_times_2: usize,
}

const EMPTY_FRAME: Frame = Frame {
    index: NodeIndex::from_node(0),
    ret: [NodeIndex::from_node(0), NodeIndex::from_node(0)],
    ret_slot_times_2: 0,
};

/// Reusable manual stack for the differentiator.
///
/// The stack starts with a single sentinel frame whose slot 0 receives the
/// ultimate result, so the generic return path needs no special case. The
/// backing storage never shrinks: a stack that served one gradient pass
/// serves the next one allocation-free.
pub struct DifferentiatorStack {
    frames: Vec<Frame>,
    size: usize,
}

impl Default for DifferentiatorStack {
    fn default() -> Self {
        Self::new()
    }
}

impl DifferentiatorStack {
    pub fn new() -> Self {
        DifferentiatorStack {
            frames: vec![EMPTY_FRAME],
            size: 1,
        }
    }

    fn reset(&mut self) {
        self.size = 1;
    }

    fn grow_if_necessary(&mut self) {
        if self.size == self.frames.len() {
            let mut target = std::cmp::max(256, self.frames.len() * 2);
            let node_count = vars::with_active(|inner| inner.arena.node_count()).unwrap_or(0);
            if node_count > target {
                target += (node_count - target) / 4;
            }
            self.frames.resize(target, EMPTY_FRAME);
        }
    }

    fn push(&mut self, index: NodeIndex, ret_slot_times_2: usize) -> usize {
        self.grow_if_necessary();
        let at = self.size;
        self.frames[at].index = index;
        self.frames[at].ret_slot_times_2 = ret_slot_times_2;
        self.size += 1;
        at
    }

    fn pop(&mut self) -> Frame {
        self.size -= 1;
        self.frames[self.size]
    }

    fn not_empty(&self) -> bool {
        self.size > 1
    }

    fn set_return(&mut self, ret_slot_times_2: usize, value: NodeIndex) {
        self.frames[ret_slot_times_2 >> 1].ret[ret_slot_times_2 & 1] = value;
    }

    fn result(&self) -> NodeIndex {
        self.frames[0].ret[0]
    }
}

enum Target {
    /// d/dv_i by the finalized (flat) variable index.
    Var(usize),
    /// d/dλ of a 1-D line function.
    Lambda,
}

struct Differentiator<'a> {
    stack: &'a mut DifferentiatorStack,
    target: Target,
    /// `q -> i` translation, populated for `Target::Var`.
    finalized_of_q: Vec<u32>,
}

impl Differentiator<'_> {
    fn leaf_derivative(&self, q: usize) -> Result<f64, DifferentiateError> {
        match self.target {
            // When differentiating by lambda, every variable is a constant.
            Target::Lambda => Ok(0.0),
            Target::Var(k) => {
                let i = self
                    .finalized_of_q
                    .get(q)
                    .copied()
                    .ok_or(DifferentiateError::NodeTypeNotImplemented)?;
                Ok(if i as usize == k { 1.0 } else { 0.0 })
            }
        }
    }

    /// Variables, immediates and the lambda marker skip the stack entirely:
    /// their derivatives are materialized into the caller's return slot.
    fn push_child(
        &mut self,
        index: NodeIndex,
        ret_slot_times_2: usize,
    ) -> Result<(), DifferentiateError> {
        match index.kind() {
            IndexKind::Node(_) => {
                self.stack.push(index, ret_slot_times_2);
            }
            IndexKind::Var(q) => {
                let d = self.leaf_derivative(q)?;
                self.stack
                    .set_return(ret_slot_times_2, Value::immediate(d).index());
            }
            IndexKind::Immediate(_) => {
                self.stack
                    .set_return(ret_slot_times_2, Value::immediate(0.0).index());
            }
            IndexKind::Lambda => match self.target {
                Target::Lambda => {
                    self.stack
                        .set_return(ret_slot_times_2, Value::immediate(1.0).index());
                }
                Target::Var(_) => {
                    return Err(DifferentiateError::LambdaOutsideLambdaDifferentiation)
                }
            },
        }
        Ok(())
    }

    fn push_ready(&mut self, node_index: usize, ret_slot_times_2: usize) -> usize {
        let mut index = NodeIndex::from_node(node_index);
        index.set_scratch_bits(1);
        self.stack.push(index, ret_slot_times_2)
    }

    fn run(&mut self, f: Value) -> Result<Value, DifferentiateError> {
        self.stack.reset();
        self.push_child(f.index(), 0)?;

        while self.stack.not_empty() {
            let frame = self.stack.pop();
            let mut index = frame.index;
            let ready = index.clear_scratch_bits() != 0;
            // Only arena node indices are ever pushed.
            let node_index = index.node_index_unchecked();
            let node = vars::with_active(|inner| inner.arena.node(node_index))?
                .ok_or(DifferentiateError::NodeTypeNotImplemented)?;

            match node {
                ExpressionNode::Immediate(_) => {
                    self.stack
                        .set_return(frame.ret_slot_times_2, Value::immediate(0.0).index());
                }
                ExpressionNode::Op { kind, lhs, rhs } => {
                    if !ready {
                        let at = self.push_ready(node_index, frame.ret_slot_times_2);
                        // rhs first, so the lhs derivative is built first.
                        self.push_child(rhs, at * 2 + 1)?;
                        self.push_child(lhs, at * 2)?;
                    } else {
                        let a = Value::from_index(lhs);
                        let b = Value::from_index(rhs);
                        let da = Value::from_index(frame.ret[0]);
                        let db = Value::from_index(frame.ret[1]);
                        let df = match kind {
                            OpKind::Add => da + db,
                            OpKind::Sub => da - db,
                            OpKind::Mul => a * db + b * da,
                            OpKind::Div => (b * da - a * db) / (b * b),
                        };
                        self.stack.set_return(frame.ret_slot_times_2, df.index());
                    }
                }
                ExpressionNode::Fn { kind, arg } => {
                    if !ready {
                        let at = self.push_ready(node_index, frame.ret_slot_times_2);
                        self.push_child(arg, at * 2)?;
                    } else {
                        let x = Value::from_index(arg);
                        // The function node itself, reused where the rule
                        // wants f(x), e.g. d exp = dx * exp(x).
                        let f_node = Value::from_index(NodeIndex::from_node(node_index));
                        let dx = Value::from_index(frame.ret[0]);
                        let df = match kind {
                            FnKind::Exp => dx * f_node,
                            FnKind::Log => dx / x,
                            FnKind::Sin => dx * x.cos(),
                            FnKind::Cos => -dx * x.sin(),
                            FnKind::Tan => dx / x.cos().sqr(),
                            FnKind::Sqr => dx * 2.0 * x,
                            FnKind::Sqrt => dx / (2.0 * f_node),
                            FnKind::Asin => dx / (1.0 - x.sqr()).sqrt(),
                            FnKind::Acos => -dx / (1.0 - x.sqr()).sqrt(),
                            FnKind::Atan => dx / (1.0 + x.sqr()),
                            FnKind::UnitStep => return Err(DifferentiateError::UnitStep),
                            FnKind::Ramp => dx * x.unit_step(),
                            FnKind::Sigmoid => return Err(DifferentiateError::Sigmoid),
                            FnKind::LogSigmoid => dx * (-x).sigmoid(),
                        };
                        self.stack.set_return(frame.ret_slot_times_2, df.index());
                    }
                }
            }
        }

        Ok(Value::from_index(self.stack.result()))
    }
}

fn frozen_translation_table() -> Result<Vec<u32>, DifferentiateError> {
    vars::with_active(|inner| inner.finalized_of_q().map(<[u32]>::to_vec))?
        .ok_or(DifferentiateError::Vars(VarsError::NotFrozen))
}

/// ∂f/∂v_k, where `k` is the finalized (flat) variable index. The variables
/// tree must be frozen; the arena may still grow with derivative nodes.
pub fn differentiate(f: Value, var_index: usize) -> Result<Value, DifferentiateError> {
    let mut stack = DifferentiatorStack::new();
    differentiate_with_stack(f, var_index, &mut stack)
}

/// [`differentiate`] against a caller-provided reusable stack.
pub fn differentiate_with_stack(
    f: Value,
    var_index: usize,
    stack: &mut DifferentiatorStack,
) -> Result<Value, DifferentiateError> {
    let finalized_of_q = frozen_translation_table()?;
    Differentiator {
        stack,
        target: Target::Var(var_index),
        finalized_of_q,
    }
    .run(f)
}

/// ∂f/∂λ of a 1-D line function built by
/// [`generate_line_search_function`].
pub fn differentiate_by_lambda(f: Value) -> Result<Value, DifferentiateError> {
    vars::with_active(|_| ())?;
    let mut stack = DifferentiatorStack::new();
    Differentiator {
        stack: &mut stack,
        target: Target::Lambda,
        finalized_of_q: Vec::new(),
    }
    .run(f)
}

/// The full gradient: one differentiation pass per finalized variable,
/// sharing a single manual stack.
pub fn compute_gradient(f: Value) -> Result<Vec<Value>, DifferentiateError> {
    let n = frozen_translation_table()?.len();
    let mut stack = DifferentiatorStack::new();
    (0..n)
        .map(|k| differentiate_with_stack(f, k, &mut stack))
        .collect()
}

/// Rebuild `f` with every variable leaf `v_i` replaced by
/// `substitutions[i]` (indexed by flat index). A non-recursive post-order
/// rebuild with an arena-indexed memo, so DAG sharing in `f` is preserved in
/// the result.
pub fn build_1d_function(
    f: Value,
    config: &VarsMapperConfig,
    substitutions: &[Value],
) -> Result<Value, DifferentiateError> {
    if substitutions.len() != config.len() {
        return Err(DifferentiateError::GradientDimMismatch);
    }

    let start_len = vars::with_active(|inner| inner.arena.node_count())?;
    let mut memo: Vec<Option<NodeIndex>> = vec![None; start_len];

    // Resolve an operand against the memo / substitutions. `None` means the
    // operand is an unprocessed arena node.
    let resolve = |memo: &[Option<NodeIndex>], index: NodeIndex| -> Result<Option<NodeIndex>, DifferentiateError> {
        match index.kind() {
            IndexKind::Node(n) => Ok(memo.get(n).copied().flatten()),
            IndexKind::Var(q) => {
                let i = config
                    .finalized_index_of(q)
                    .ok_or(DifferentiateError::GradientDimMismatch)?;
                Ok(Some(substitutions[i].index()))
            }
            IndexKind::Immediate(_) | IndexKind::Lambda => Ok(Some(index)),
        }
    };

    let mut stack: Vec<NodeIndex> = Vec::new();
    if let IndexKind::Node(_) = f.index().kind() {
        stack.push(f.index());
    }

    while let Some(top) = stack.last().copied() {
        let mut index = top;
        let ready = index.clear_scratch_bits() != 0;
        let node_index = index.node_index_unchecked();
        if memo[node_index].is_some() {
            stack.pop();
            continue;
        }
        let node = vars::with_active(|inner| inner.arena.node(node_index))?
            .ok_or(DifferentiateError::NodeTypeNotImplemented)?;

        match node {
            ExpressionNode::Immediate(_) => {
                // Immediates carry no variables; the original node is reused.
                memo[node_index] = Some(NodeIndex::from_node(node_index));
                stack.pop();
            }
            ExpressionNode::Op { kind, lhs, rhs } => {
                if !ready {
                    let top = stack.last_mut().expect("the stack is non-empty");
                    top.set_scratch_bits(1);
                    for child in [rhs, lhs] {
                        if child.is_node() && memo[child.node_index_unchecked()].is_none() {
                            stack.push(child);
                        }
                    }
                } else {
                    let l = resolve(&memo, lhs)?.ok_or(DifferentiateError::NodeTypeNotImplemented)?;
                    let r = resolve(&memo, rhs)?.ok_or(DifferentiateError::NodeTypeNotImplemented)?;
                    memo[node_index] =
                        Some(vars::with_active(|inner| inner.arena.op(kind, l, r))?);
                    stack.pop();
                }
            }
            ExpressionNode::Fn { kind, arg } => {
                if !ready {
                    let top = stack.last_mut().expect("the stack is non-empty");
                    top.set_scratch_bits(1);
                    if arg.is_node() && memo[arg.node_index_unchecked()].is_none() {
                        stack.push(arg);
                    }
                } else {
                    let a = resolve(&memo, arg)?.ok_or(DifferentiateError::NodeTypeNotImplemented)?;
                    memo[node_index] =
                        Some(vars::with_active(|inner| inner.arena.fn_node(kind, a))?);
                    stack.pop();
                }
            }
        }
    }

    let result =
        resolve(&memo, f.index())?.ok_or(DifferentiateError::NodeTypeNotImplemented)?;
    Ok(Value::from_index(result))
}

/// Build the 1-D line function `l(λ) = f(x₀ + λ·g)`: every non-constant
/// variable `v_i` is substituted with `v_i + λ·g_i`. Constants are excluded
/// from gradient steps, so they substitute to themselves and the line
/// function describes exactly the move the optimizer will take.
pub fn generate_line_search_function(
    config: &VarsMapperConfig,
    f: Value,
    g: &[Value],
) -> Result<Value, DifferentiateError> {
    if g.len() != config.len() {
        return Err(DifferentiateError::GradientDimMismatch);
    }
    let lambda = Value::lambda();
    let substitutions: Vec<Value> = (0..config.len())
        .map(|i| {
            let v = Value::from_var(config.q_of_finalized[i] as usize);
            if config.is_constant[i] {
                v
            } else {
                v + lambda * g[i]
            }
        })
        .collect();
    build_1d_function(f, config, &substitutions)
}
