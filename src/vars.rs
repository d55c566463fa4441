//! The variables tree and its freeze lifecycle.
//!
//! A [`VarsContext`] owns a tree of named/indexed variable nodes plus the
//! expression arena for its thread. Exactly one context may be active per
//! thread; it is installed into a thread-local on construction and removed
//! on drop, and the expression DSL reaches it implicitly (same shape as an
//! active AD tape).
//!
//! Leaves carry two indices: `q`, stamped in introduction order when the
//! leaf is created, and `i`, stamped by [`VarsContext::freeze`] in
//! lexicographic tree order. Expression nodes reference variables by `q`
//! (stable across freeze/unfreeze cycles); the frozen config carries the
//! `q -> i` translation used by the differentiator and the JIT.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::expression::ExpressionArena;
use crate::Value;

/// Upper bound on a dense vector dimension.
pub const MAX_DENSE_DIM: usize = 1_000_000;

/// Errors from the variables layer (tree building, freeze lifecycle, and the
/// frozen-config mapper).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VarsError {
    /// Context management failure: no active context, nested contexts,
    /// dense dimension out of range, or a dense access past the bound.
    Management(String),
    /// The node already exists with a different type.
    NodeTypeMismatch,
    /// The leaf has already been assigned a different value.
    ReassignmentAttempt,
    /// The tree is frozen and the operation would create a node.
    Frozen,
    /// `freeze()` called on an already frozen tree.
    AlreadyFrozen,
    /// `unfreeze()` called on a tree that is not frozen.
    NotFrozen,
    /// A leaf-only operation was applied to a non-leaf node.
    NotLeaf,
    /// Mapper access path does not name a node of the frozen config.
    MapperWrongVar,
    /// Mapper access path names an interior node, not a variable.
    MapperNodeNotVar,
    /// Mapper write to a variable declared constant.
    MapperVarIsConstant,
}

impl fmt::Display for VarsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VarsError::Management(msg) => write!(f, "vars management error: {}", msg),
            VarsError::NodeTypeMismatch => {
                write!(f, "the variable node is already of a different type")
            }
            VarsError::ReassignmentAttempt => {
                write!(f, "the variable has already been assigned a different value")
            }
            VarsError::Frozen => write!(f, "the variables tree is frozen"),
            VarsError::AlreadyFrozen => write!(f, "the variables tree is already frozen"),
            VarsError::NotFrozen => write!(f, "the variables tree is not frozen"),
            VarsError::NotLeaf => write!(f, "the variable node is not a leaf"),
            VarsError::MapperWrongVar => write!(f, "no such variable in the frozen config"),
            VarsError::MapperNodeNotVar => {
                write!(f, "the access path names an interior node, not a variable")
            }
            VarsError::MapperVarIsConstant => write!(f, "the variable is declared constant"),
        }
    }
}

impl std::error::Error for VarsError {}

// ── Thread-local active context ──

thread_local! {
    static ACTIVE_CONTEXT: Cell<*mut VarsInner> = const { Cell::new(std::ptr::null_mut()) };
}

/// Run `f` against the active context of this thread.
pub(crate) fn with_active<R>(f: impl FnOnce(&mut VarsInner) -> R) -> Result<R, VarsError> {
    ACTIVE_CONTEXT.with(|cell| {
        let ptr = cell.get();
        if ptr.is_null() {
            return Err(VarsError::Management(
                "no active VarsContext on this thread".to_string(),
            ));
        }
        // SAFETY: the pointer is installed by `VarsContext::new` and cleared
        // by its `Drop`; the context is single-threaded and no reference
        // escapes the closure.
        Ok(f(unsafe { &mut *ptr }))
    })
}

/// Same as [`with_active`], for the operator DSL which has no way to return
/// an error.
pub(crate) fn with_active_or_panic<R>(f: impl FnOnce(&mut VarsInner) -> R) -> R {
    with_active(f).expect("no active VarsContext; construct one before building expressions")
}

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

// ── The tree itself ──

type PoolId = u32;

enum VarNode {
    /// Placeholder: a dense slot or a freshly created map entry.
    Unset,
    Vector(Vec<PoolId>),
    IntMap(BTreeMap<u64, PoolId>),
    StringMap(BTreeMap<String, PoolId>),
    Leaf(Leaf),
}

struct Leaf {
    value: f64,
    constant: bool,
    q: u32,
    i: Option<u32>,
}

enum PathKey {
    Root,
    Int(u64),
    Str(String),
}

struct PoolEntry {
    node: VarNode,
    parent: PoolId,
    key: PathKey,
}

enum SetMode {
    Assign(f64),
    MarkConstant,
    AssignConstant(f64),
}

pub(crate) struct VarsInner {
    pub(crate) id: u64,
    pool: Vec<PoolEntry>,
    leaf_count: u32,
    frozen: bool,
    /// `q -> i` and `i -> q`, present while frozen.
    tables: Option<(Vec<u32>, Vec<u32>)>,
    pub(crate) arena: ExpressionArena,
}

impl VarsInner {
    fn new(id: u64) -> Self {
        VarsInner {
            id,
            pool: vec![PoolEntry {
                node: VarNode::Unset,
                parent: 0,
                key: PathKey::Root,
            }],
            leaf_count: 0,
            frozen: false,
            tables: None,
            arena: ExpressionArena::new(),
        }
    }

    pub(crate) fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub(crate) fn num_vars(&self) -> usize {
        self.leaf_count as usize
    }

    /// The `q -> i` table, present while frozen.
    pub(crate) fn finalized_of_q(&self) -> Option<&[u32]> {
        self.tables.as_ref().map(|(f, _)| f.as_slice())
    }

    fn alloc(&mut self, parent: PoolId, key: PathKey) -> PoolId {
        let id = self.pool.len() as PoolId;
        self.pool.push(PoolEntry {
            node: VarNode::Unset,
            parent,
            key,
        });
        id
    }

    fn child_int(&mut self, node: PoolId, key: u64) -> Result<PoolId, VarsError> {
        match &self.pool[node as usize].node {
            VarNode::Unset => {
                if self.frozen {
                    return Err(VarsError::Frozen);
                }
            }
            VarNode::IntMap(map) => {
                if let Some(&child) = map.get(&key) {
                    return Ok(child);
                }
                if self.frozen {
                    return Err(VarsError::Frozen);
                }
            }
            VarNode::Vector(children) => {
                return if let Some(&child) = children.get(key as usize) {
                    Ok(child)
                } else if self.frozen {
                    Err(VarsError::Frozen)
                } else {
                    Err(VarsError::Management(format!(
                        "dense vector access past the declared bound: {}",
                        key
                    )))
                };
            }
            VarNode::StringMap(_) | VarNode::Leaf(_) => return Err(VarsError::NodeTypeMismatch),
        }
        // Creation path: an `Unset` node becomes an int map, an existing int
        // map gains a child.
        let child = self.alloc(node, PathKey::Int(key));
        match &mut self.pool[node as usize].node {
            VarNode::IntMap(map) => {
                map.insert(key, child);
            }
            n => {
                let mut map = BTreeMap::new();
                map.insert(key, child);
                *n = VarNode::IntMap(map);
            }
        }
        Ok(child)
    }

    fn child_str(&mut self, node: PoolId, key: &str) -> Result<PoolId, VarsError> {
        match &self.pool[node as usize].node {
            VarNode::Unset => {
                if self.frozen {
                    return Err(VarsError::Frozen);
                }
            }
            VarNode::StringMap(map) => {
                if let Some(&child) = map.get(key) {
                    return Ok(child);
                }
                if self.frozen {
                    return Err(VarsError::Frozen);
                }
            }
            VarNode::Vector(_) | VarNode::IntMap(_) | VarNode::Leaf(_) => {
                return Err(VarsError::NodeTypeMismatch)
            }
        }
        let child = self.alloc(node, PathKey::Str(key.to_string()));
        match &mut self.pool[node as usize].node {
            VarNode::StringMap(map) => {
                map.insert(key.to_string(), child);
            }
            n => {
                let mut map = BTreeMap::new();
                map.insert(key.to_string(), child);
                *n = VarNode::StringMap(map);
            }
        }
        Ok(child)
    }

    fn dense_double_vector(&mut self, node: PoolId, dim: usize) -> Result<(), VarsError> {
        if dim < 1 || dim > MAX_DENSE_DIM {
            return Err(VarsError::Management(format!(
                "dense vector dimension out of range: {}",
                dim
            )));
        }
        match &self.pool[node as usize].node {
            VarNode::Unset => {
                if self.frozen {
                    return Err(VarsError::Frozen);
                }
            }
            VarNode::Vector(children) => {
                // Re-declaring with the same dimension is a no-op.
                return if children.len() == dim {
                    Ok(())
                } else {
                    Err(VarsError::NodeTypeMismatch)
                };
            }
            _ => return Err(VarsError::NodeTypeMismatch),
        }
        let children: Vec<PoolId> = (0..dim)
            .map(|j| self.alloc(node, PathKey::Int(j as u64)))
            .collect();
        self.pool[node as usize].node = VarNode::Vector(children);
        Ok(())
    }

    fn set_leaf(&mut self, node: PoolId, mode: SetMode) -> Result<(), VarsError> {
        let frozen = self.frozen;
        let next_q = self.leaf_count;
        let mut created_leaf = false;
        let result = match &mut self.pool[node as usize].node {
            n @ VarNode::Unset => {
                if frozen {
                    return Err(VarsError::Frozen);
                }
                let (value, constant) = match mode {
                    SetMode::Assign(v) => (v, false),
                    SetMode::AssignConstant(v) => (v, true),
                    SetMode::MarkConstant => return Err(VarsError::NotLeaf),
                };
                *n = VarNode::Leaf(Leaf {
                    value,
                    constant,
                    q: next_q,
                    i: None,
                });
                created_leaf = true;
                Ok(())
            }
            VarNode::Leaf(leaf) => match mode {
                // Writing the exact same value again is a no-op; leaves are
                // otherwise write-once.
                SetMode::Assign(v) => {
                    if v == leaf.value {
                        Ok(())
                    } else {
                        Err(VarsError::ReassignmentAttempt)
                    }
                }
                SetMode::MarkConstant => {
                    leaf.constant = true;
                    Ok(())
                }
                SetMode::AssignConstant(v) => {
                    if v == leaf.value {
                        leaf.constant = true;
                        Ok(())
                    } else {
                        Err(VarsError::ReassignmentAttempt)
                    }
                }
            },
            _ => Err(VarsError::NodeTypeMismatch),
        };
        if created_leaf {
            self.leaf_count += 1;
        }
        result
    }

    fn leaf_q(&self, node: PoolId) -> Result<usize, VarsError> {
        match &self.pool[node as usize].node {
            VarNode::Leaf(leaf) => Ok(leaf.q as usize),
            _ => Err(VarsError::NotLeaf),
        }
    }

    fn full_name(&self, node: PoolId) -> String {
        let mut components = Vec::new();
        let mut cursor = node;
        loop {
            let entry = &self.pool[cursor as usize];
            match &entry.key {
                PathKey::Root => break,
                PathKey::Int(k) => components.push(format!("[{}]", k)),
                PathKey::Str(s) => components.push(format!("[\"{}\"]", s)),
            }
            cursor = entry.parent;
        }
        components.reverse();
        let mut name = String::from("x");
        for c in components {
            name.push_str(&c);
        }
        if let VarNode::Leaf(leaf) = &self.pool[node as usize].node {
            if let Some(i) = leaf.i {
                name.push_str(&format!("{{{}}}", i));
            }
        }
        name
    }

    pub(crate) fn freeze(&mut self) -> Result<VarsMapperConfig, VarsError> {
        if self.frozen {
            return Err(VarsError::AlreadyFrozen);
        }
        let mut name = Vec::new();
        let mut x0 = Vec::new();
        let mut is_constant = Vec::new();
        let mut finalized_of_q = vec![0u32; self.leaf_count as usize];
        let mut q_of_finalized = Vec::new();

        // First pass: stamp `i` in lexicographic tree order.
        let order = self.walk_order(0);
        for (i, &node) in order.iter().enumerate() {
            if let VarNode::Leaf(leaf) = &mut self.pool[node as usize].node {
                leaf.i = Some(i as u32);
                finalized_of_q[leaf.q as usize] = i as u32;
                q_of_finalized.push(leaf.q);
                x0.push(leaf.value);
                is_constant.push(leaf.constant);
            }
        }
        // Second pass: names include the freshly stamped `{i}` suffix.
        for &node in &order {
            name.push(self.full_name(node));
        }

        self.frozen = true;
        self.tables = Some((finalized_of_q.clone(), q_of_finalized.clone()));

        Ok(VarsMapperConfig {
            name,
            x0,
            is_constant,
            finalized_of_q,
            q_of_finalized,
            tree: self.mapper_snapshot(0),
        })
    }

    pub(crate) fn unfreeze(&mut self) -> Result<(), VarsError> {
        if !self.frozen {
            return Err(VarsError::NotFrozen);
        }
        for entry in &mut self.pool {
            if let VarNode::Leaf(leaf) = &mut entry.node {
                leaf.i = None;
            }
        }
        self.frozen = false;
        self.tables = None;
        Ok(())
    }

    /// Leaves of the subtree in lexicographic order: dense elements by
    /// position, int keys ascending, string keys ascending.
    fn walk_order(&self, node: PoolId) -> Vec<PoolId> {
        let mut order = Vec::new();
        self.collect_leaves(node, &mut order);
        order
    }

    fn collect_leaves(&self, node: PoolId, out: &mut Vec<PoolId>) {
        match &self.pool[node as usize].node {
            VarNode::Unset => {}
            VarNode::Leaf(_) => out.push(node),
            VarNode::Vector(children) => {
                for &child in children {
                    self.collect_leaves(child, out);
                }
            }
            VarNode::IntMap(map) => {
                for &child in map.values() {
                    self.collect_leaves(child, out);
                }
            }
            VarNode::StringMap(map) => {
                for &child in map.values() {
                    self.collect_leaves(child, out);
                }
            }
        }
    }

    fn mapper_snapshot(&self, node: PoolId) -> MapperNode {
        match &self.pool[node as usize].node {
            VarNode::Unset => MapperNode::Unset,
            VarNode::Leaf(leaf) => MapperNode::Leaf {
                index: leaf.i.expect("mapper snapshot taken while frozen"),
                constant: leaf.constant,
            },
            VarNode::Vector(children) => {
                MapperNode::Vector(children.iter().map(|&c| self.mapper_snapshot(c)).collect())
            }
            VarNode::IntMap(map) => MapperNode::IntMap(
                map.iter()
                    .map(|(&k, &c)| (k, self.mapper_snapshot(c)))
                    .collect(),
            ),
            VarNode::StringMap(map) => MapperNode::StringMap(
                map.iter()
                    .map(|(k, &c)| (k.clone(), self.mapper_snapshot(c)))
                    .collect(),
            ),
        }
    }

    fn dump(&self, node: PoolId) -> VarsDump {
        match &self.pool[node as usize].node {
            VarNode::Unset => VarsDump::U {},
            VarNode::Leaf(leaf) => VarsDump::X {
                q: leaf.q,
                i: leaf.i,
                x: leaf.value,
                c: if leaf.constant { Some(true) } else { None },
            },
            VarNode::Vector(children) => {
                VarsDump::V {
                    z: children.iter().map(|&c| self.dump(c)).collect(),
                }
            }
            VarNode::IntMap(map) => VarsDump::I {
                z: map.iter().map(|(&k, &c)| (k, self.dump(c))).collect(),
            },
            VarNode::StringMap(map) => VarsDump::S {
                z: map.iter().map(|(k, &c)| (k.clone(), self.dump(c))).collect(),
            },
        }
    }
}

// ── Public context handle ──

/// The per-thread variables context. Construction installs it as the active
/// context of the current thread; drop removes it. Overlapping contexts on
/// one thread are an error.
pub struct VarsContext {
    inner: *mut VarsInner,
}

impl VarsContext {
    /// Create and activate a context. Fails if one is already active on
    /// this thread.
    pub fn new() -> Result<Self, VarsError> {
        ACTIVE_CONTEXT.with(|cell| {
            if !cell.get().is_null() {
                return Err(VarsError::Management(
                    "a VarsContext is already active on this thread".to_string(),
                ));
            }
            let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
            let inner = Box::into_raw(Box::new(VarsInner::new(id)));
            cell.set(inner);
            Ok(VarsContext { inner })
        })
    }

    /// The root of the variables tree.
    pub fn x(&self) -> Var {
        Var::root()
    }

    /// Stamp dense `i` indices over all leaves in lexicographic tree order
    /// and forbid further leaf creation. Returns the frozen config.
    pub fn freeze(&self) -> Result<VarsMapperConfig, VarsError> {
        with_active(|inner| inner.freeze())?
    }

    /// Drop the `i` indices and allow leaf creation again.
    pub fn unfreeze(&self) -> Result<(), VarsError> {
        with_active(|inner| inner.unfreeze())?
    }

    /// Number of variable leaves created so far.
    pub fn num_vars(&self) -> usize {
        with_active(|inner| inner.num_vars()).unwrap_or(0)
    }

    /// Number of expression nodes in the arena.
    pub fn num_nodes(&self) -> usize {
        with_active(|inner| inner.arena.node_count()).unwrap_or(0)
    }

    /// Copy out the arena node at `index`, if it exists.
    pub fn expression_node(&self, index: usize) -> Option<crate::expression::ExpressionNode> {
        with_active(|inner| inner.arena.node(index)).ok().flatten()
    }

    /// Serializable snapshot of the variables tree; the canonical observable
    /// of the vars layer.
    pub fn dump(&self) -> VarsDump {
        with_active(|inner| inner.dump(0)).expect("the VarsContext is active while it is alive")
    }
}

impl Drop for VarsContext {
    fn drop(&mut self) {
        ACTIVE_CONTEXT.with(|cell| {
            if cell.get() == self.inner {
                cell.set(std::ptr::null_mut());
            }
        });
        // SAFETY: `inner` came from `Box::into_raw` in `new` and is dropped
        // exactly once here.
        unsafe {
            drop(Box::from_raw(self.inner));
        }
    }
}

/// A handle to a node of the active context's variables tree. Copyable and
/// cheap; every operation resolves through the thread-local active context.
#[derive(Clone, Copy, Debug)]
pub struct Var {
    node: PoolId,
}

impl Var {
    /// The root of the active context's tree. The handle itself never
    /// fails; operations on it do if no context is active.
    pub fn root() -> Var {
        Var { node: 0 }
    }

    /// Descend by integer key, creating the child on first access. On a
    /// dense vector this is a bounds-checked element access.
    pub fn at(self, key: usize) -> Result<Var, VarsError> {
        with_active(|inner| inner.child_int(self.node, key as u64))?.map(|node| Var { node })
    }

    /// Descend by string key, creating the child on first access. The empty
    /// string is a valid key.
    pub fn key(self, key: &str) -> Result<Var, VarsError> {
        with_active(|inner| inner.child_str(self.node, key))?.map(|node| Var { node })
    }

    /// Declare this node a dense vector of `dim` doubles,
    /// `1 <= dim <= 1_000_000`. Re-declaring with the same dimension is a
    /// no-op.
    pub fn dense_double_vector(self, dim: usize) -> Result<(), VarsError> {
        with_active(|inner| inner.dense_double_vector(self.node, dim))?
    }

    /// Assign the leaf value. The first write wins; writing the same value
    /// again is a no-op, a different value is an error.
    pub fn set(self, value: f64) -> Result<(), VarsError> {
        with_active(|inner| inner.set_leaf(self.node, SetMode::Assign(value)))?
    }

    /// Mark an existing leaf as a constant, keeping its value.
    pub fn set_constant(self) -> Result<(), VarsError> {
        with_active(|inner| inner.set_leaf(self.node, SetMode::MarkConstant))?
    }

    /// Create (or re-affirm) a leaf with `value` and mark it constant.
    pub fn set_constant_value(self, value: f64) -> Result<(), VarsError> {
        with_active(|inner| inner.set_leaf(self.node, SetMode::AssignConstant(value)))?
    }

    /// The introduction-order index `q` of this leaf.
    pub fn var_index(self) -> Result<usize, VarsError> {
        with_active(|inner| inner.leaf_q(self.node))?
    }

    /// The serialized access path, e.g. `x["x"]["x2"]` — with a `{i}` suffix
    /// once the tree is frozen.
    pub fn full_name(self) -> Result<String, VarsError> {
        with_active(|inner| inner.full_name(self.node))
    }

    /// Use this leaf in an expression.
    pub fn value(self) -> Result<Value, VarsError> {
        let q = self.var_index()?;
        Ok(Value::from_var(q))
    }
}

// ── Frozen config and the mapper ──

/// Snapshot of the tree shape embedded in a frozen config, used by
/// [`VarsMapper`] path resolution.
#[derive(Clone, Debug)]
enum MapperNode {
    Unset,
    Vector(Vec<MapperNode>),
    IntMap(BTreeMap<u64, MapperNode>),
    StringMap(BTreeMap<String, MapperNode>),
    Leaf { index: u32, constant: bool },
}

/// The product of [`VarsContext::freeze`]: flat-index metadata for every
/// leaf, plus the translation from introduction order to flat order.
#[derive(Clone, Debug)]
pub struct VarsMapperConfig {
    /// Serialized access path per flat index, e.g. `x["x"]["x2"]{1}`.
    pub name: Vec<String>,
    /// Initial value per flat index.
    pub x0: Vec<f64>,
    /// Constness flag per flat index. Constants are excluded from gradient
    /// steps.
    pub is_constant: Vec<bool>,
    pub(crate) finalized_of_q: Vec<u32>,
    pub(crate) q_of_finalized: Vec<u32>,
    tree: MapperNode,
}

impl VarsMapperConfig {
    /// Total number of leaves.
    pub fn len(&self) -> usize {
        self.x0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x0.is_empty()
    }

    /// Translate a variable's introduction-order index `q` into its flat
    /// index `i`.
    pub fn finalized_index_of(&self, q: usize) -> Option<usize> {
        self.finalized_of_q.get(q).map(|&i| i as usize)
    }
}

/// Owns the mutable point `x`, initialized from the frozen config's `x0`.
/// Multiple mappers over one config are independent; no thread-local state
/// is involved.
pub struct VarsMapper {
    config: VarsMapperConfig,
    /// The current point, indexed by flat index.
    pub x: Vec<f64>,
}

impl VarsMapper {
    pub fn new(config: &VarsMapperConfig) -> Self {
        VarsMapper {
            config: config.clone(),
            x: config.x0.clone(),
        }
    }

    pub fn config(&self) -> &VarsMapperConfig {
        &self.config
    }

    /// Navigate by integer key from the root.
    pub fn at(&mut self, key: usize) -> Result<MapperView<'_>, VarsError> {
        let VarsMapper { config, x } = self;
        MapperView {
            x,
            node: &config.tree,
        }
        .at(key)
    }

    /// Navigate by string key from the root.
    pub fn key(&mut self, key: &str) -> Result<MapperView<'_>, VarsError> {
        let VarsMapper { config, x } = self;
        MapperView {
            x,
            node: &config.tree,
        }
        .key(key)
    }
}

/// A cursor into a [`VarsMapper`]'s tree, consumed by navigation and by the
/// terminal read/write operations.
pub struct MapperView<'a> {
    x: &'a mut Vec<f64>,
    node: &'a MapperNode,
}

impl fmt::Debug for MapperView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapperView").finish_non_exhaustive()
    }
}

impl<'a> MapperView<'a> {
    pub fn at(self, key: usize) -> Result<MapperView<'a>, VarsError> {
        let child = match self.node {
            MapperNode::IntMap(map) => map.get(&(key as u64)),
            MapperNode::Vector(children) => children.get(key),
            _ => None,
        };
        match child {
            Some(node) => Ok(MapperView { x: self.x, node }),
            None => Err(VarsError::MapperWrongVar),
        }
    }

    pub fn key(self, key: &str) -> Result<MapperView<'a>, VarsError> {
        let child = match self.node {
            MapperNode::StringMap(map) => map.get(key),
            _ => None,
        };
        match child {
            Some(node) => Ok(MapperView { x: self.x, node }),
            None => Err(VarsError::MapperWrongVar),
        }
    }

    fn leaf(&self) -> Result<(usize, bool), VarsError> {
        match self.node {
            MapperNode::Leaf { index, constant } => Ok((*index as usize, *constant)),
            _ => Err(VarsError::MapperNodeNotVar),
        }
    }

    /// Read the current value of this variable.
    pub fn get(self) -> Result<f64, VarsError> {
        let (index, _) = self.leaf()?;
        Ok(self.x[index])
    }

    /// Write the variable. Constants reject plain writes.
    pub fn set(self, value: f64) -> Result<(), VarsError> {
        let (index, constant) = self.leaf()?;
        if constant {
            return Err(VarsError::MapperVarIsConstant);
        }
        self.x[index] = value;
        Ok(())
    }

    /// Write a variable that is declared constant (the explicit spelling).
    pub fn set_constant_value(self, value: f64) -> Result<(), VarsError> {
        let (index, _) = self.leaf()?;
        self.x[index] = value;
        Ok(())
    }

    /// Mutable access to the value. Constants reject it.
    pub fn ref_mut(self) -> Result<&'a mut f64, VarsError> {
        let (index, constant) = self.leaf()?;
        if constant {
            return Err(VarsError::MapperVarIsConstant);
        }
        Ok(&mut self.x[index])
    }

    /// Mutable access bypassing the constness check.
    pub fn ref_even_for_a_constant(self) -> Result<&'a mut f64, VarsError> {
        let (index, _) = self.leaf()?;
        Ok(&mut self.x[index])
    }
}

// ── Debug dump ──

/// The JSON-serializable snapshot of a variables tree.
///
/// The wire shape is compact and stable: `{"I":{"z":[[key, child], ...]}}`
/// for int maps (keys ascending), `{"S":{"z":{key: child, ...}}}` for string
/// maps, `{"V":{"z":[...]}}` for dense vectors,
/// `{"X":{"q":..,"i"?:..,"x":..,"c"?:true}}` for leaves, and `{"U":{}}` for
/// unset placeholders.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum VarsDump {
    I {
        z: Vec<(u64, VarsDump)>,
    },
    S {
        z: BTreeMap<String, VarsDump>,
    },
    V {
        z: Vec<VarsDump>,
    },
    X {
        q: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        i: Option<u32>,
        x: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        c: Option<bool>,
    },
    U {},
}
