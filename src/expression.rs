//! Expression DAG: arena storage and the `Value` builder DSL.
//!
//! Expressions are built against the active thread-local [`VarsContext`]
//! (the arena lives inside it, next to the variable tree). [`Value`] is a
//! `Copy` wrapper over a packed [`NodeIndex`]; arithmetic operators and the
//! unary-function methods append nodes to the arena and return new handles.
//!
//! No per-node caching is performed: textually identical subexpressions
//! produce distinct nodes, and the zeroes/ones minted by differentiation are
//! not deduplicated either. Compacting popular constants into the packed
//! index itself is a possible future optimization.
//!
//! [`VarsContext`]: crate::vars::VarsContext

use crate::index::{IndexKind, NodeIndex};
use crate::vars;

/// Binary operation kinds.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpKind {
    Add,
    Sub,
    Mul,
    Div,
}

impl OpKind {
    /// Symbol used by the debug rendering.
    pub fn symbol(self) -> char {
        match self {
            OpKind::Add => '+',
            OpKind::Sub => '-',
            OpKind::Mul => '*',
            OpKind::Div => '/',
        }
    }
}

/// Unary function kinds. The discriminant doubles as the index into the
/// JIT call context's function pointer table, so the order here is part of
/// the emitted-code contract.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FnKind {
    Exp,
    Log,
    Sin,
    Cos,
    Tan,
    Sqr,
    Sqrt,
    Asin,
    Acos,
    Atan,
    UnitStep,
    Ramp,
    Sigmoid,
    LogSigmoid,
}

/// All unary function kinds, in function-table order.
pub const FN_KINDS: [FnKind; 14] = [
    FnKind::Exp,
    FnKind::Log,
    FnKind::Sin,
    FnKind::Cos,
    FnKind::Tan,
    FnKind::Sqr,
    FnKind::Sqrt,
    FnKind::Asin,
    FnKind::Acos,
    FnKind::Atan,
    FnKind::UnitStep,
    FnKind::Ramp,
    FnKind::Sigmoid,
    FnKind::LogSigmoid,
];

impl FnKind {
    /// Index into the JIT function pointer table.
    #[inline]
    pub fn table_index(self) -> u8 {
        self as u8
    }

    /// Evaluate the function at `x`. This is the same arithmetic the
    /// JIT-emitted code reaches through the function pointer table.
    pub fn apply(self, x: f64) -> f64 {
        match self {
            FnKind::Exp => x.exp(),
            FnKind::Log => x.ln(),
            FnKind::Sin => x.sin(),
            FnKind::Cos => x.cos(),
            FnKind::Tan => x.tan(),
            FnKind::Sqr => x * x,
            FnKind::Sqrt => x.sqrt(),
            FnKind::Asin => x.asin(),
            FnKind::Acos => x.acos(),
            FnKind::Atan => x.atan(),
            FnKind::UnitStep => {
                if x >= 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            FnKind::Ramp => {
                if x > 0.0 {
                    x
                } else {
                    0.0
                }
            }
            FnKind::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            FnKind::LogSigmoid => -(-x).exp().ln_1p(),
        }
    }

    /// Name used by the debug rendering.
    pub fn name(self) -> &'static str {
        match self {
            FnKind::Exp => "exp",
            FnKind::Log => "log",
            FnKind::Sin => "sin",
            FnKind::Cos => "cos",
            FnKind::Tan => "tan",
            FnKind::Sqr => "sqr",
            FnKind::Sqrt => "sqrt",
            FnKind::Asin => "asin",
            FnKind::Acos => "acos",
            FnKind::Atan => "atan",
            FnKind::UnitStep => "unit_step",
            FnKind::Ramp => "ramp",
            FnKind::Sigmoid => "sigmoid",
            FnKind::LogSigmoid => "log_sigmoid",
        }
    }
}

/// One record in the append-only expression arena.
///
/// Variables, packed immediates and the lambda are not arena nodes; they are
/// encoded directly inside [`NodeIndex`] operands.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ExpressionNode {
    /// A literal `f64` materialized in the arena.
    Immediate(f64),
    /// A binary operation over two operands.
    Op {
        kind: OpKind,
        lhs: NodeIndex,
        rhs: NodeIndex,
    },
    /// A unary function application.
    Fn { kind: FnKind, arg: NodeIndex },
}

/// Append-only storage for expression nodes. Owned by the active
/// [`VarsContext`](crate::vars::VarsContext); nodes are immutable once
/// pushed.
#[derive(Default)]
pub(crate) struct ExpressionArena {
    nodes: Vec<ExpressionNode>,
}

impl ExpressionArena {
    pub(crate) fn new() -> Self {
        ExpressionArena { nodes: Vec::new() }
    }

    /// Number of nodes pushed so far.
    #[inline]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Copy out the node at `index`, if it exists.
    #[inline]
    pub fn node(&self, index: usize) -> Option<ExpressionNode> {
        self.nodes.get(index).copied()
    }

    /// Append an immediate node.
    pub fn immediate(&mut self, value: f64) -> NodeIndex {
        self.push(ExpressionNode::Immediate(value))
    }

    /// Append a binary operation node.
    pub fn op(&mut self, kind: OpKind, lhs: NodeIndex, rhs: NodeIndex) -> NodeIndex {
        self.push(ExpressionNode::Op { kind, lhs, rhs })
    }

    /// Append a unary function node.
    pub fn fn_node(&mut self, kind: FnKind, arg: NodeIndex) -> NodeIndex {
        self.push(ExpressionNode::Fn { kind, arg })
    }

    fn push(&mut self, node: ExpressionNode) -> NodeIndex {
        let index = self.nodes.len();
        self.nodes.push(node);
        NodeIndex::from_node(index)
    }
}

/// A handle to an expression: a packed node index with builder ergonomics.
///
/// Arithmetic on `Value` (and the mixed `Value`/`f64` forms) appends nodes
/// to the active context's arena. Like the rest of the builder DSL, the
/// operators panic if no [`VarsContext`](crate::vars::VarsContext) is active
/// on the current thread.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Value(NodeIndex);

impl Value {
    /// Wrap an existing packed index.
    #[inline]
    pub fn from_index(index: NodeIndex) -> Self {
        Value(index)
    }

    /// The underlying packed index.
    #[inline]
    pub fn index(self) -> NodeIndex {
        self.0
    }

    /// Materialize a literal as an arena node.
    pub fn immediate(value: f64) -> Self {
        Value(vars::with_active_or_panic(|inner| {
            inner.arena.immediate(value)
        }))
    }

    /// The free variable of a 1-D line function. A packed marker, not an
    /// arena node: it evaluates to the call context's lambda slot.
    #[inline]
    pub fn lambda() -> Self {
        Value(NodeIndex::lambda())
    }

    /// A reference to the variable with introduction-order index `q`.
    pub(crate) fn from_var(q: usize) -> Self {
        Value(NodeIndex::from_var(q))
    }

    /// Construct a binary operation node explicitly; the operator overloads
    /// are the usual spelling.
    pub fn op(kind: OpKind, lhs: Value, rhs: Value) -> Value {
        lhs.binary(kind, rhs)
    }

    /// Construct a unary function node explicitly; the named methods are
    /// the usual spelling.
    pub fn function(kind: FnKind, arg: Value) -> Value {
        arg.unary(kind)
    }

    fn binary(self, kind: OpKind, rhs: Value) -> Value {
        Value(vars::with_active_or_panic(|inner| {
            inner.arena.op(kind, self.0, rhs.0)
        }))
    }

    fn unary(self, kind: FnKind) -> Value {
        Value(vars::with_active_or_panic(|inner| {
            inner.arena.fn_node(kind, self.0)
        }))
    }

    pub fn exp(self) -> Value {
        self.unary(FnKind::Exp)
    }
    pub fn log(self) -> Value {
        self.unary(FnKind::Log)
    }
    pub fn sin(self) -> Value {
        self.unary(FnKind::Sin)
    }
    pub fn cos(self) -> Value {
        self.unary(FnKind::Cos)
    }
    pub fn tan(self) -> Value {
        self.unary(FnKind::Tan)
    }
    pub fn sqr(self) -> Value {
        self.unary(FnKind::Sqr)
    }
    pub fn sqrt(self) -> Value {
        self.unary(FnKind::Sqrt)
    }
    pub fn asin(self) -> Value {
        self.unary(FnKind::Asin)
    }
    pub fn acos(self) -> Value {
        self.unary(FnKind::Acos)
    }
    pub fn atan(self) -> Value {
        self.unary(FnKind::Atan)
    }
    pub fn unit_step(self) -> Value {
        self.unary(FnKind::UnitStep)
    }
    pub fn ramp(self) -> Value {
        self.unary(FnKind::Ramp)
    }
    pub fn sigmoid(self) -> Value {
        self.unary(FnKind::Sigmoid)
    }
    pub fn log_sigmoid(self) -> Value {
        self.unary(FnKind::LogSigmoid)
    }

    /// Render the expression as a string, for tests and debugging.
    /// Structural: two values with identical renderings are built the same
    /// way up to arena identity.
    pub fn to_debug_string(self) -> String {
        fn render(inner: &vars::VarsInner, index: NodeIndex, out: &mut String) {
            match index.kind() {
                IndexKind::Node(node) => match inner.arena.node(node) {
                    Some(ExpressionNode::Immediate(v)) => {
                        out.push_str(&format!("{:?}", v));
                    }
                    Some(ExpressionNode::Op { kind, lhs, rhs }) => {
                        out.push('(');
                        render(inner, lhs, out);
                        out.push(kind.symbol());
                        render(inner, rhs, out);
                        out.push(')');
                    }
                    Some(ExpressionNode::Fn { kind, arg }) => {
                        out.push_str(kind.name());
                        out.push('(');
                        render(inner, arg, out);
                        out.push(')');
                    }
                    None => out.push_str("<dangling>"),
                },
                IndexKind::Var(q) => out.push_str(&format!("x{{{}}}", q)),
                IndexKind::Immediate(v) => out.push_str(&format!("{:?}", v)),
                IndexKind::Lambda => out.push_str("lambda"),
            }
        }
        vars::with_active_or_panic(|inner| {
            let mut out = String::new();
            render(inner, self.0, &mut out);
            out
        })
    }
}

impl std::ops::Add for Value {
    type Output = Value;
    fn add(self, rhs: Value) -> Value {
        self.binary(OpKind::Add, rhs)
    }
}

impl std::ops::Sub for Value {
    type Output = Value;
    fn sub(self, rhs: Value) -> Value {
        self.binary(OpKind::Sub, rhs)
    }
}

impl std::ops::Mul for Value {
    type Output = Value;
    fn mul(self, rhs: Value) -> Value {
        self.binary(OpKind::Mul, rhs)
    }
}

impl std::ops::Div for Value {
    type Output = Value;
    fn div(self, rhs: Value) -> Value {
        self.binary(OpKind::Div, rhs)
    }
}

impl std::ops::Add<f64> for Value {
    type Output = Value;
    fn add(self, rhs: f64) -> Value {
        self.binary(OpKind::Add, Value::immediate(rhs))
    }
}

impl std::ops::Sub<f64> for Value {
    type Output = Value;
    fn sub(self, rhs: f64) -> Value {
        self.binary(OpKind::Sub, Value::immediate(rhs))
    }
}

impl std::ops::Mul<f64> for Value {
    type Output = Value;
    fn mul(self, rhs: f64) -> Value {
        self.binary(OpKind::Mul, Value::immediate(rhs))
    }
}

impl std::ops::Div<f64> for Value {
    type Output = Value;
    fn div(self, rhs: f64) -> Value {
        self.binary(OpKind::Div, Value::immediate(rhs))
    }
}

impl std::ops::Add<Value> for f64 {
    type Output = Value;
    fn add(self, rhs: Value) -> Value {
        Value::immediate(self).binary(OpKind::Add, rhs)
    }
}

impl std::ops::Sub<Value> for f64 {
    type Output = Value;
    fn sub(self, rhs: Value) -> Value {
        Value::immediate(self).binary(OpKind::Sub, rhs)
    }
}

impl std::ops::Mul<Value> for f64 {
    type Output = Value;
    fn mul(self, rhs: Value) -> Value {
        Value::immediate(self).binary(OpKind::Mul, rhs)
    }
}

impl std::ops::Div<Value> for f64 {
    type Output = Value;
    fn div(self, rhs: Value) -> Value {
        Value::immediate(self).binary(OpKind::Div, rhs)
    }
}

impl std::ops::Neg for Value {
    type Output = Value;
    fn neg(self) -> Value {
        Value::immediate(0.0).binary(OpKind::Sub, self)
    }
}
