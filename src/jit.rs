//! JIT compilation of expression DAGs to native x86-64 code.
//!
//! A [`JITCallContext`] freezes the active variables tree and owns the
//! scratch RAM the emitted code computes into: one `f64` slot per arena
//! node, mirroring arena indices one-to-one, plus at least one extra slot —
//! the lambda slot — at the tail. A [`JITCompiler`] tied to the context
//! walks expression DAGs with a manual stack and emits straight-line code.
//!
//! Compiling several functions through one compiler is the intended use:
//! the compiler remembers which nodes already have emitted code, so a
//! function compiled later reads the slots a function compiled earlier
//! computes instead of recomputing them. The price is an ordering
//! precondition at call time, enforced by the call-order guard: on a fresh
//! point, functions must be invoked in compilation order, one rung of the
//! ladder at a time (see [`JITCallContext::mark_new_point`]).

use std::cell::{Cell, UnsafeCell};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::expression::{ExpressionNode, FnKind, OpKind};
use crate::index::{IndexKind, NodeIndex};
use crate::vars::{self, VarsError, VarsMapperConfig};
use crate::Value;

pub mod exec;
pub mod opcodes;

pub use exec::{ExecutableBuffer, MathFn};

/// Errors from the JIT layer.
#[derive(Debug)]
pub enum JitError {
    /// A compiled function was invoked out of compilation order on a fresh
    /// point; its prerequisites have not populated the shared scratch yet.
    InvokedBeforePrerequisites,
    /// A compiled function was invoked with a different call context than
    /// the one it was compiled against.
    CallContextMismatch,
    /// The call context's scratch has no slot for the requested node: either
    /// it was created with zero extra slots, or expression nodes were added
    /// after its creation.
    NotEnoughExtraNodes,
    /// Mapping or sealing executable memory failed.
    ExecutableMemory(io::Error),
    /// A variables-layer failure, e.g. constructing a context over an
    /// already frozen tree.
    Vars(VarsError),
}

impl fmt::Display for JitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JitError::InvokedBeforePrerequisites => {
                write!(f, "compiled function invoked before its prerequisites on a fresh point")
            }
            JitError::CallContextMismatch => {
                write!(f, "compiled function invoked with a different call context")
            }
            JitError::NotEnoughExtraNodes => {
                write!(f, "not enough extra scratch slots allocated in the call context")
            }
            JitError::ExecutableMemory(e) => write!(f, "executable memory: {}", e),
            JitError::Vars(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for JitError {}

impl From<VarsError> for JitError {
    fn from(e: VarsError) -> Self {
        JitError::Vars(e)
    }
}

// ── The unary math function table ──

extern "C" fn math_exp(x: f64) -> f64 {
    FnKind::Exp.apply(x)
}
extern "C" fn math_log(x: f64) -> f64 {
    FnKind::Log.apply(x)
}
extern "C" fn math_sin(x: f64) -> f64 {
    FnKind::Sin.apply(x)
}
extern "C" fn math_cos(x: f64) -> f64 {
    FnKind::Cos.apply(x)
}
extern "C" fn math_tan(x: f64) -> f64 {
    FnKind::Tan.apply(x)
}
extern "C" fn math_sqr(x: f64) -> f64 {
    FnKind::Sqr.apply(x)
}
extern "C" fn math_sqrt(x: f64) -> f64 {
    FnKind::Sqrt.apply(x)
}
extern "C" fn math_asin(x: f64) -> f64 {
    FnKind::Asin.apply(x)
}
extern "C" fn math_acos(x: f64) -> f64 {
    FnKind::Acos.apply(x)
}
extern "C" fn math_atan(x: f64) -> f64 {
    FnKind::Atan.apply(x)
}
extern "C" fn math_unit_step(x: f64) -> f64 {
    FnKind::UnitStep.apply(x)
}
extern "C" fn math_ramp(x: f64) -> f64 {
    FnKind::Ramp.apply(x)
}
extern "C" fn math_sigmoid(x: f64) -> f64 {
    FnKind::Sigmoid.apply(x)
}
extern "C" fn math_log_sigmoid(x: f64) -> f64 {
    FnKind::LogSigmoid.apply(x)
}

/// The function pointer table emitted code reaches through `rdx`. Indexed by
/// [`FnKind::table_index`].
pub static MATH_FUNCTIONS: [MathFn; 14] = [
    math_exp,
    math_log,
    math_sin,
    math_cos,
    math_tan,
    math_sqr,
    math_sqrt,
    math_asin,
    math_acos,
    math_atan,
    math_unit_step,
    math_ramp,
    math_sigmoid,
    math_log_sigmoid,
];

static NEXT_CALL_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

// ── The call context ──

/// Owns the scratch RAM for a family of compiled functions and the
/// call-order guard state. Construction freezes the active variables tree
/// (failing if it is already frozen, which also rules out overlapping
/// contexts); drop unfreezes it.
pub struct JITCallContext {
    id: u64,
    vars_context_id: u64,
    config: VarsMapperConfig,
    number_of_nodes: usize,
    ram: UnsafeCell<Box<[f64]>>,
    functions_declared: Cell<usize>,
    next_legal_function_index: Cell<usize>,
}

impl JITCallContext {
    /// A context with the default single extra slot (the lambda slot).
    pub fn new() -> Result<Self, JitError> {
        Self::with_extra_slots(1)
    }

    /// A context with `extra` scratch slots past the arena mirror. At least
    /// one is required: slot `N` is the lambda slot.
    pub fn with_extra_slots(extra: usize) -> Result<Self, JitError> {
        if extra < 1 {
            return Err(JitError::NotEnoughExtraNodes);
        }
        let (config, number_of_nodes, vars_context_id) =
            vars::with_active(|inner| -> Result<_, VarsError> {
                let config = inner.freeze()?;
                Ok((config, inner.arena.node_count(), inner.id))
            })??;
        Ok(JITCallContext {
            id: NEXT_CALL_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            vars_context_id,
            config,
            number_of_nodes,
            ram: UnsafeCell::new(vec![0.0; number_of_nodes + extra].into_boxed_slice()),
            functions_declared: Cell::new(0),
            next_legal_function_index: Cell::new(0),
        })
    }

    /// The frozen config this context was created against.
    pub fn config(&self) -> &VarsMapperConfig {
        &self.config
    }

    /// Number of arena nodes mirrored by the scratch; also the index of the
    /// lambda slot.
    pub fn number_of_nodes(&self) -> usize {
        self.number_of_nodes
    }

    /// Reset the call-order guard. Must be called whenever the point `x`
    /// changes, so that on the new point the compiled functions are again
    /// invoked in compilation order.
    pub fn mark_new_point(&self) {
        self.next_legal_function_index.set(0);
    }

    fn declare_function(&self) -> usize {
        let ordinal = self.functions_declared.get();
        self.functions_declared.set(ordinal + 1);
        ordinal
    }

    fn check_and_mark_computed(&self, ordinal: usize) -> Result<(), JitError> {
        // The caller climbs the ladder of compiled functions one rung at a
        // time; earlier rungs may be re-run freely.
        if ordinal > self.next_legal_function_index.get() {
            return Err(JitError::InvokedBeforePrerequisites);
        }
        self.next_legal_function_index
            .set(self.next_legal_function_index.get().max(ordinal + 1));
        Ok(())
    }

    fn ram_ptr(&self) -> *mut f64 {
        // SAFETY: the box itself is never reallocated; callers only use the
        // pointer for the duration of one single-threaded call.
        unsafe { (*self.ram.get()).as_mut_ptr() }
    }

    fn ram_len(&self) -> usize {
        // SAFETY: shared read of the stable box length.
        unsafe { (&*self.ram.get()).len() }
    }

    fn set_lambda(&self, value: f64) {
        // SAFETY: slot `number_of_nodes` exists (extra >= 1), and no other
        // reference into the scratch is live.
        unsafe {
            (*self.ram.get())[self.number_of_nodes] = value;
        }
    }

    /// Read a scratch slot. Valid after the function computing it has run.
    pub fn ram_value(&self, slot: usize) -> f64 {
        assert!(slot < self.ram_len(), "scratch slot out of range");
        // SAFETY: bounds-checked shared read; no mutable access is live.
        unsafe { (*self.ram.get())[slot] }
    }

    /// The value an index denotes under the current scratch and point:
    /// arena nodes read their slot, variables read `x`, immediates are
    /// literal, the lambda reads the lambda slot.
    pub fn value_of(&self, index: NodeIndex, x: &[f64]) -> f64 {
        match index.kind() {
            IndexKind::Node(n) => self.ram_value(n),
            IndexKind::Var(q) => {
                let i = self
                    .config
                    .finalized_index_of(q)
                    .expect("variable created after the context was frozen");
                x[i]
            }
            IndexKind::Immediate(v) => v,
            IndexKind::Lambda => self.ram_value(self.number_of_nodes),
        }
    }
}

impl Drop for JITCallContext {
    fn drop(&mut self) {
        // Unfreeze the variables tree this context froze, if it is still the
        // active one. Errors are moot during teardown.
        let _ = vars::with_active(|inner| {
            if inner.id == self.vars_context_id {
                let _ = inner.unfreeze();
            }
        });
    }
}

// ── The compiler ──

/// Emits native code for expression DAGs against one [`JITCallContext`].
///
/// The compiler can be dropped once the functions are emitted; only the
/// context has to outlive the calls. Use a single compiler per context so
/// the computed-node map stays consistent across functions.
pub struct JITCompiler<'a> {
    context: &'a JITCallContext,
    node_computed: Vec<bool>,
    manual_stack: Vec<NodeIndex>,
}

impl<'a> JITCompiler<'a> {
    /// Requires the variables context the call context froze to still be
    /// active on this thread.
    pub fn new(context: &'a JITCallContext) -> Result<Self, JitError> {
        let active_id = vars::with_active(|inner| inner.id)?;
        if active_id != context.vars_context_id {
            return Err(JitError::Vars(VarsError::Management(
                "the call context belongs to a different VarsContext".to_string(),
            )));
        }
        Ok(JITCompiler {
            context,
            node_computed: vec![false; context.number_of_nodes],
            manual_stack: Vec::new(),
        })
    }

    fn var_slot(&self, q: usize) -> Result<usize, JitError> {
        self.context
            .config
            .finalized_index_of(q)
            .ok_or(JitError::NotEnoughExtraNodes)
    }

    /// Emit code so that the slot of `requested` holds its value, skipping
    /// nodes that earlier compilations already cover. Non-recursive: the
    /// manual stack reuses the scratch bits of the packed index for the
    /// ready-to-emit flag.
    fn ensure_node_computed(
        &mut self,
        code: &mut Vec<u8>,
        requested: NodeIndex,
    ) -> Result<(), JitError> {
        debug_assert!(self.manual_stack.is_empty());

        if self.push_if_pending(requested)? {
            while let Some(mut index) = self.manual_stack.pop() {
                let ready = index.clear_scratch_bits() != 0;
                let node_index = index.node_index_unchecked();
                if self.node_computed[node_index] {
                    continue;
                }
                let node = vars::with_active(|inner| inner.arena.node(node_index))?
                    .ok_or(JitError::NotEnoughExtraNodes)?;

                match node {
                    ExpressionNode::Immediate(value) => {
                        opcodes::load_immediate_to_memory_by_rbx_offset(code, node_index, value);
                        self.node_computed[node_index] = true;
                    }
                    ExpressionNode::Op { kind, lhs, rhs } => {
                        if !ready {
                            self.push_ready(node_index);
                            self.push_if_pending(rhs)?;
                            self.push_if_pending(lhs)?;
                        } else {
                            self.emit_op(code, kind, lhs, rhs, node_index)?;
                            self.node_computed[node_index] = true;
                        }
                    }
                    ExpressionNode::Fn { kind, arg } => {
                        if !ready {
                            self.push_ready(node_index);
                            self.push_if_pending(arg)?;
                        } else {
                            self.emit_fn(code, kind, arg, node_index)?;
                            self.node_computed[node_index] = true;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Push an arena node that still needs code. Variables, immediates and
    /// the lambda have their values available without any emitted code.
    fn push_if_pending(&mut self, index: NodeIndex) -> Result<bool, JitError> {
        if !index.is_node() {
            return Ok(false);
        }
        let node_index = index.node_index_unchecked();
        if node_index >= self.node_computed.len() {
            // The node was created after the call context froze the arena
            // size; its slot does not exist.
            return Err(JitError::NotEnoughExtraNodes);
        }
        if self.node_computed[node_index] {
            return Ok(false);
        }
        self.manual_stack.push(index);
        Ok(true)
    }

    fn push_ready(&mut self, node_index: usize) {
        let mut index = NodeIndex::from_node(node_index);
        index.set_scratch_bits(1);
        self.manual_stack.push(index);
    }

    fn emit_op(
        &self,
        code: &mut Vec<u8>,
        kind: OpKind,
        lhs: NodeIndex,
        rhs: NodeIndex,
        node_index: usize,
    ) -> Result<(), JitError> {
        let lambda_slot = self.context.number_of_nodes;

        match lhs.kind() {
            IndexKind::Node(n) => opcodes::load_from_memory_by_rbx_offset_to_xmm0(code, n),
            IndexKind::Var(q) => {
                opcodes::load_from_memory_by_rdi_offset_to_xmm0(code, self.var_slot(q)?)
            }
            IndexKind::Immediate(v) => opcodes::load_immediate_to_xmm0(code, v),
            IndexKind::Lambda => opcodes::load_from_memory_by_rbx_offset_to_xmm0(code, lambda_slot),
        }

        match rhs.kind() {
            IndexKind::Node(n) => match kind {
                OpKind::Add => opcodes::add_from_memory_by_rbx_offset_to_xmm0(code, n),
                OpKind::Sub => opcodes::sub_from_memory_by_rbx_offset_to_xmm0(code, n),
                OpKind::Mul => opcodes::mul_from_memory_by_rbx_offset_to_xmm0(code, n),
                OpKind::Div => opcodes::div_from_memory_by_rbx_offset_to_xmm0(code, n),
            },
            IndexKind::Var(q) => {
                let slot = self.var_slot(q)?;
                match kind {
                    OpKind::Add => opcodes::add_from_memory_by_rdi_offset_to_xmm0(code, slot),
                    OpKind::Sub => opcodes::sub_from_memory_by_rdi_offset_to_xmm0(code, slot),
                    OpKind::Mul => opcodes::mul_from_memory_by_rdi_offset_to_xmm0(code, slot),
                    OpKind::Div => opcodes::div_from_memory_by_rdi_offset_to_xmm0(code, slot),
                }
            }
            IndexKind::Immediate(v) => {
                opcodes::load_immediate_to_xmm1(code, v);
                match kind {
                    OpKind::Add => opcodes::add_xmm1_xmm0(code),
                    OpKind::Sub => opcodes::sub_xmm1_xmm0(code),
                    OpKind::Mul => opcodes::mul_xmm1_xmm0(code),
                    OpKind::Div => opcodes::div_xmm1_xmm0(code),
                }
            }
            IndexKind::Lambda => match kind {
                OpKind::Add => opcodes::add_from_memory_by_rbx_offset_to_xmm0(code, lambda_slot),
                OpKind::Sub => opcodes::sub_from_memory_by_rbx_offset_to_xmm0(code, lambda_slot),
                OpKind::Mul => opcodes::mul_from_memory_by_rbx_offset_to_xmm0(code, lambda_slot),
                OpKind::Div => opcodes::div_from_memory_by_rbx_offset_to_xmm0(code, lambda_slot),
            },
        }

        opcodes::store_xmm0_to_memory_by_rbx_offset(code, node_index);
        Ok(())
    }

    fn emit_fn(
        &self,
        code: &mut Vec<u8>,
        kind: FnKind,
        arg: NodeIndex,
        node_index: usize,
    ) -> Result<(), JitError> {
        match arg.kind() {
            IndexKind::Node(n) => opcodes::load_from_memory_by_rbx_offset_to_xmm0(code, n),
            IndexKind::Var(q) => {
                opcodes::load_from_memory_by_rdi_offset_to_xmm0(code, self.var_slot(q)?)
            }
            IndexKind::Immediate(v) => opcodes::load_immediate_to_xmm0(code, v),
            IndexKind::Lambda => {
                opcodes::load_from_memory_by_rbx_offset_to_xmm0(code, self.context.number_of_nodes)
            }
        }
        // rdi and rdx are caller-saved from the emitted code's point of
        // view; the body needs them back after the table call. The two
        // pushes also keep the stack 16-byte aligned at the call.
        opcodes::push_rdi(code);
        opcodes::push_rdx(code);
        opcodes::call_function_from_rdx_pointers_array_by_index(code, kind.table_index());
        opcodes::pop_rdx(code);
        opcodes::pop_rdi(code);
        opcodes::store_xmm0_to_memory_by_rbx_offset(code, node_index);
        Ok(())
    }

    /// Compile a single-valued function of the point `x`.
    pub fn compile(&mut self, f: Value) -> Result<JITCompiledFunction, JitError> {
        let code = self.emit_single(f)?;
        Ok(JITCompiledFunction {
            inner: CompiledCode::new(self.context, &code)?,
        })
    }

    /// Compile a function returning one value per entry of `fs`.
    pub fn compile_vector(
        &mut self,
        fs: &[Value],
    ) -> Result<JITCompiledFunctionReturningVector, JitError> {
        let mut code = Vec::new();
        opcodes::push_rbx(&mut code);
        opcodes::mov_rsi_rbx(&mut code);
        let output_indexes: Vec<NodeIndex> = fs.iter().map(|v| v.index()).collect();
        for &index in &output_indexes {
            if index.is_node() {
                self.ensure_node_computed(&mut code, index)?;
            }
        }
        opcodes::pop_rbx(&mut code);
        opcodes::ret(&mut code);
        Ok(JITCompiledFunctionReturningVector {
            inner: CompiledCode::new(self.context, &code)?,
            output_indexes,
        })
    }

    /// Compile a 1-argument function `f(λ)`; the wrapper writes λ into the
    /// scratch's lambda slot before each invocation.
    pub fn compile_with_argument(
        &mut self,
        f: Value,
    ) -> Result<JITCompiledFunctionWithArgument, JitError> {
        let code = self.emit_single(f)?;
        Ok(JITCompiledFunctionWithArgument {
            inner: CompiledCode::new(self.context, &code)?,
        })
    }

    fn emit_single(&mut self, f: Value) -> Result<Vec<u8>, JitError> {
        let mut code = Vec::new();
        match f.index().kind() {
            IndexKind::Node(node_index) => {
                if node_index >= self.context.number_of_nodes {
                    return Err(JitError::NotEnoughExtraNodes);
                }
                opcodes::push_rbx(&mut code);
                opcodes::mov_rsi_rbx(&mut code);
                self.ensure_node_computed(&mut code, f.index())?;
                opcodes::load_from_memory_by_rbx_offset_to_xmm0(&mut code, node_index);
                opcodes::pop_rbx(&mut code);
            }
            // Degenerate roots need no scratch and no prologue.
            IndexKind::Var(q) => {
                opcodes::load_from_memory_by_rdi_offset_to_xmm0(&mut code, self.var_slot(q)?);
            }
            IndexKind::Immediate(v) => {
                opcodes::load_immediate_to_xmm0(&mut code, v);
            }
            IndexKind::Lambda => {
                opcodes::load_from_memory_by_rsi_offset_to_xmm0(
                    &mut code,
                    self.context.number_of_nodes,
                );
            }
        }
        opcodes::ret(&mut code);
        Ok(code)
    }
}

// ── Compiled function wrappers ──

/// The pieces shared by every compiled form: sealed code, the identity of
/// the context it was compiled against, and its rung on the call-order
/// ladder. The scratch pointer is taken from the context passed at call
/// time, never captured.
struct CompiledCode {
    code: ExecutableBuffer,
    call_context_id: u64,
    ordinal: usize,
}

impl CompiledCode {
    fn new(context: &JITCallContext, code: &[u8]) -> Result<Self, JitError> {
        Ok(CompiledCode {
            code: ExecutableBuffer::new(code)?,
            call_context_id: context.id,
            ordinal: context.declare_function(),
        })
    }

    fn invoke(&self, context: &JITCallContext, x: &[f64]) -> Result<f64, JitError> {
        if context.id != self.call_context_id {
            return Err(JitError::CallContextMismatch);
        }
        context.check_and_mark_computed(self.ordinal)?;
        assert!(
            x.len() >= context.config.len(),
            "input point has fewer entries than the frozen config"
        );
        // SAFETY: the dimension is checked above, the scratch belongs to the
        // verified context, and the table matches the kind enumeration the
        // code was emitted against.
        Ok(unsafe {
            self.code
                .call(x.as_ptr(), context.ram_ptr(), MATH_FUNCTIONS.as_ptr())
        })
    }
}

/// A compiled `f(x)`.
pub struct JITCompiledFunction {
    inner: CompiledCode,
}

impl JITCompiledFunction {
    pub fn call(&self, context: &JITCallContext, x: &[f64]) -> Result<f64, JitError> {
        self.inner.invoke(context, x)
    }

    /// Size of the emitted machine code in bytes.
    pub fn code_size(&self) -> usize {
        self.inner.code.len()
    }
}

/// A compiled vector-valued function, e.g. a gradient.
pub struct JITCompiledFunctionReturningVector {
    inner: CompiledCode,
    output_indexes: Vec<NodeIndex>,
}

impl JITCompiledFunctionReturningVector {
    pub fn call(&self, context: &JITCallContext, x: &[f64]) -> Result<Vec<f64>, JitError> {
        self.inner.invoke(context, x)?;
        Ok(self
            .output_indexes
            .iter()
            .map(|&index| context.value_of(index, x))
            .collect())
    }

    pub fn dim(&self) -> usize {
        self.output_indexes.len()
    }

    pub fn code_size(&self) -> usize {
        self.inner.code.len()
    }
}

/// A compiled 1-argument function `f(λ)` over a fixed point `x`.
pub struct JITCompiledFunctionWithArgument {
    inner: CompiledCode,
}

impl JITCompiledFunctionWithArgument {
    pub fn call(&self, context: &JITCallContext, x: &[f64], lambda: f64) -> Result<f64, JitError> {
        if context.id != self.inner.call_context_id {
            return Err(JitError::CallContextMismatch);
        }
        context.set_lambda(lambda);
        self.inner.invoke(context, x)
    }

    pub fn code_size(&self) -> usize {
        self.inner.code.len()
    }
}
