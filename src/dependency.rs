//! The dependency graph: every module-level entity is a node in an arena owned
//! by a [`Graph`], addressed by a [`NodeId`] handle.
//!
//! A node carries its kind-specific payload plus the list of nodes it refers
//! to directly. Identity is the handle, never the payload: two functions with
//! identical bodies stay two functions. The assembler walks these edges from
//! the module roots to find everything a module needs.

use std::collections::HashSet;

use crate::builder::BuildError;
use crate::instruction::{BlockType, Immediate};
use crate::types::{FunctionType, GlobalType, Limits, MemoryType, RefType, TableType, ValueType};

#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Fieldless mirror of [`NodeKind`], used to bucket nodes.
#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug)]
pub enum DependencyKind {
    Type,
    Function,
    ImportFunction,
    Global,
    ImportGlobal,
    Table,
    ImportTable,
    Memory,
    ImportMemory,
    Data,
    Elem,
    HasRefTo,
    HasMemory,
}

impl DependencyKind {
    pub const ALL: [DependencyKind; 13] = [
        DependencyKind::Type,
        DependencyKind::Function,
        DependencyKind::ImportFunction,
        DependencyKind::Global,
        DependencyKind::ImportGlobal,
        DependencyKind::Table,
        DependencyKind::ImportTable,
        DependencyKind::Memory,
        DependencyKind::ImportMemory,
        DependencyKind::Data,
        DependencyKind::Elem,
        DependencyKind::HasRefTo,
        DependencyKind::HasMemory,
    ];

    pub fn is_function(self) -> bool {
        matches!(self, DependencyKind::Function | DependencyKind::ImportFunction)
    }

    pub fn is_global(self) -> bool {
        matches!(self, DependencyKind::Global | DependencyKind::ImportGlobal)
    }

    pub fn is_table(self) -> bool {
        matches!(self, DependencyKind::Table | DependencyKind::ImportTable)
    }

    pub fn is_memory(self) -> bool {
        matches!(self, DependencyKind::Memory | DependencyKind::ImportMemory)
    }
}

/// Where an import comes from. A missing `name` is filled in with a generated
/// one (`f0`, `g1`, ...) when the node is created.
#[derive(PartialEq, Eq, Clone, Debug, Default)]
pub struct ImportPath {
    pub module: String,
    pub name: Option<String>,
}

impl ImportPath {
    pub fn new(module: &str, name: &str) -> ImportPath {
        ImportPath {
            module: module.to_string(),
            name: Some(name.to_string()),
        }
    }
}

/// A resolved import location.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct ImportName {
    pub module: String,
    pub name: String,
}

/// Immediate operands that still refer to nodes; resolved into an
/// [`Immediate`] once every node has an index.
#[derive(Clone, Debug)]
pub enum Pending {
    Ready(Immediate),
    /// `U32(index of deps[0])`
    DepIndex,
    /// `U32Pair(index of deps[0], index of deps[1])`
    DepIndexPair,
    /// `U32Pair(index of deps[0], n)`
    DepIndexWith(u32),
    Block {
        block_type: PendingBlockType,
        body: Vec<Instruction>,
    },
    If {
        block_type: PendingBlockType,
        then: Vec<Instruction>,
        else_: Option<Vec<Instruction>>,
    },
}

#[derive(Clone, Copy, Debug)]
pub enum PendingBlockType {
    Inline(BlockType),
    /// The signature lives in the type node `deps[0]`.
    TypeNode,
}

/// An instruction as the builder produces it: immediates may still name
/// dependency nodes instead of indices.
#[derive(Clone, Debug)]
pub struct Instruction {
    pub name: &'static str,
    /// Concrete stack effect of this occurrence.
    pub ty: FunctionType,
    pub deps: Vec<NodeId>,
    pub args: Pending,
}

impl Instruction {
    pub fn simple(name: &'static str, ty: FunctionType, immediate: Immediate) -> Instruction {
        Instruction {
            name,
            ty,
            deps: vec![],
            args: Pending::Ready(immediate),
        }
    }
}

/// A single-instruction constant expression, as used for global initialisers
/// and segment offsets.
#[derive(Clone, Debug)]
pub struct ConstExpr {
    pub(crate) instr: Instruction,
    pub(crate) ty: ValueType,
}

impl ConstExpr {
    fn ready(name: &'static str, ty: ValueType, immediate: Immediate) -> ConstExpr {
        ConstExpr {
            instr: Instruction::simple(name, FunctionType::new(&[], &[ty]), immediate),
            ty,
        }
    }

    pub fn i32(value: i32) -> ConstExpr {
        ConstExpr::ready("i32.const", ValueType::I32, Immediate::I32(value))
    }

    pub fn i64(value: i64) -> ConstExpr {
        ConstExpr::ready("i64.const", ValueType::I64, Immediate::I64(value))
    }

    pub fn f32(value: f32) -> ConstExpr {
        ConstExpr::ready("f32.const", ValueType::F32, Immediate::F32(value))
    }

    pub fn f64(value: f64) -> ConstExpr {
        ConstExpr::ready("f64.const", ValueType::F64, Immediate::F64(value))
    }

    pub fn ref_null(ty: RefType) -> ConstExpr {
        ConstExpr::ready("ref.null", ty.into(), Immediate::RefType(ty))
    }

    pub fn value_type(&self) -> ValueType {
        self.ty
    }

    pub fn deps(&self) -> &[NodeId] {
        &self.instr.deps
    }
}

/// Code and signature of a locally defined function.
#[derive(Clone, Debug)]
pub struct FuncBody {
    pub ty: FunctionType,
    pub locals: Vec<ValueType>,
    pub body: Vec<Instruction>,
}

#[derive(Clone, Debug)]
pub enum DataMode {
    Passive,
    Active { offset: ConstExpr },
}

#[derive(Clone, Debug)]
pub enum ElemMode {
    Passive,
    Declarative,
    Active { table: NodeId, offset: ConstExpr },
}

#[derive(Clone, Debug)]
pub enum NodeKind {
    Type(FunctionType),
    Function(FuncBody),
    ImportFunction { path: ImportName, ty: FunctionType },
    Global { ty: GlobalType, init: ConstExpr },
    ImportGlobal { path: ImportName, ty: GlobalType },
    Table(TableType),
    ImportTable { path: ImportName, ty: TableType },
    Memory(MemoryType),
    ImportMemory { path: ImportName, ty: MemoryType },
    Data { init: Vec<u8>, mode: DataMode },
    Elem { ty: RefType, init: Vec<ConstExpr>, mode: ElemMode },
    /// Asserts that the function in `deps[0]` is referenced by `ref.func`.
    HasRefTo,
    /// Asserts that a memory exists.
    HasMemory,
}

impl NodeKind {
    pub fn kind(&self) -> DependencyKind {
        match self {
            NodeKind::Type(_) => DependencyKind::Type,
            NodeKind::Function(_) => DependencyKind::Function,
            NodeKind::ImportFunction { .. } => DependencyKind::ImportFunction,
            NodeKind::Global { .. } => DependencyKind::Global,
            NodeKind::ImportGlobal { .. } => DependencyKind::ImportGlobal,
            NodeKind::Table(_) => DependencyKind::Table,
            NodeKind::ImportTable { .. } => DependencyKind::ImportTable,
            NodeKind::Memory(_) => DependencyKind::Memory,
            NodeKind::ImportMemory { .. } => DependencyKind::ImportMemory,
            NodeKind::Data { .. } => DependencyKind::Data,
            NodeKind::Elem { .. } => DependencyKind::Elem,
            NodeKind::HasRefTo => DependencyKind::HasRefTo,
            NodeKind::HasMemory => DependencyKind::HasMemory,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Node {
    pub kind: NodeKind,
    /// Direct references, in the order they were recorded. May repeat.
    pub deps: Vec<NodeId>,
}

/// Insertion-ordered set of node handles.
#[derive(Clone, Debug, Default)]
pub struct DependencySet {
    order: Vec<NodeId>,
    seen: HashSet<NodeId>,
}

impl DependencySet {
    pub fn new() -> DependencySet {
        DependencySet::default()
    }

    /// Returns `false` if `id` was already present.
    pub fn insert(&mut self, id: NodeId) -> bool {
        if self.seen.insert(id) {
            self.order.push(id);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.seen.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Forgets every handle inserted after the first `len`.
    pub fn truncate(&mut self, len: usize) {
        for id in self.order.drain(len.min(self.order.len())..) {
            self.seen.remove(&id);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.order.iter().copied()
    }

    pub fn into_vec(self) -> Vec<NodeId> {
        self.order
    }
}

/// Arena of dependency nodes.
#[derive(Clone, Debug)]
pub struct Graph {
    nodes: Vec<Node>,
    has_memory: NodeId,
    import_counts: [u32; 4],
}

impl Default for Graph {
    fn default() -> Self {
        Graph::new()
    }
}

impl Graph {
    pub fn new() -> Graph {
        let mut graph = Graph {
            nodes: vec![],
            has_memory: NodeId(0),
            import_counts: [0; 4],
        };
        graph.has_memory = graph.add(NodeKind::HasMemory, vec![]);
        graph
    }

    pub(crate) fn add(&mut self, kind: NodeKind, deps: Vec<NodeId>) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node { kind, deps });
        id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index())
    }

    pub fn kind(&self, id: NodeId) -> Option<DependencyKind> {
        self.get(id).map(|node| node.kind.kind())
    }

    /// The `has-memory` sentinel shared by every memory instruction.
    pub fn has_memory(&self) -> NodeId {
        self.has_memory
    }

    fn expect_kind(&self, id: NodeId, expected: &'static str, ok: fn(DependencyKind) -> bool) -> Result<(), BuildError> {
        match self.kind(id) {
            Some(kind) if ok(kind) => Ok(()),
            found => Err(BuildError::WrongNodeKind { expected, found }),
        }
    }

    /// Signature of a function node (local or imported).
    pub fn function_type(&self, id: NodeId) -> Result<&FunctionType, BuildError> {
        match self.get(id).map(|n| &n.kind) {
            Some(NodeKind::Function(func)) => Ok(&func.ty),
            Some(NodeKind::ImportFunction { ty, .. }) => Ok(ty),
            _ => Err(BuildError::WrongNodeKind {
                expected: "function",
                found: self.kind(id),
            }),
        }
    }

    pub fn global_type(&self, id: NodeId) -> Result<GlobalType, BuildError> {
        match self.get(id).map(|n| &n.kind) {
            Some(NodeKind::Global { ty, .. }) | Some(NodeKind::ImportGlobal { ty, .. }) => Ok(*ty),
            _ => Err(BuildError::WrongNodeKind {
                expected: "global",
                found: self.kind(id),
            }),
        }
    }

    pub fn table_type(&self, id: NodeId) -> Result<TableType, BuildError> {
        match self.get(id).map(|n| &n.kind) {
            Some(NodeKind::Table(ty)) | Some(NodeKind::ImportTable { ty, .. }) => Ok(*ty),
            _ => Err(BuildError::WrongNodeKind {
                expected: "table",
                found: self.kind(id),
            }),
        }
    }

    pub fn elem_type(&self, id: NodeId) -> Result<RefType, BuildError> {
        match self.get(id).map(|n| &n.kind) {
            Some(NodeKind::Elem { ty, .. }) => Ok(*ty),
            _ => Err(BuildError::WrongNodeKind {
                expected: "elem",
                found: self.kind(id),
            }),
        }
    }

    pub fn expect_memory(&self, id: NodeId) -> Result<(), BuildError> {
        self.expect_kind(id, "memory", DependencyKind::is_memory)
    }

    pub fn expect_data(&self, id: NodeId) -> Result<(), BuildError> {
        self.expect_kind(id, "data", |k| k == DependencyKind::Data)
    }

    // Entity constructors ------------------------------------------------------

    pub fn func_type(&mut self, ty: FunctionType) -> NodeId {
        self.add(NodeKind::Type(ty), vec![])
    }

    fn import_name(&mut self, slot: usize, prefix: char, path: ImportPath) -> ImportName {
        let index = self.import_counts[slot];
        self.import_counts[slot] += 1;
        ImportName {
            module: path.module,
            name: path.name.unwrap_or_else(|| format!("{}{}", prefix, index)),
        }
    }

    pub fn import_func(&mut self, path: ImportPath, ty: FunctionType) -> NodeId {
        let path = self.import_name(0, 'f', path);
        self.add(NodeKind::ImportFunction { path, ty }, vec![])
    }

    pub fn import_global(&mut self, path: ImportPath, ty: GlobalType) -> NodeId {
        let path = self.import_name(1, 'g', path);
        self.add(NodeKind::ImportGlobal { path, ty }, vec![])
    }

    pub fn import_table(&mut self, path: ImportPath, ty: TableType) -> NodeId {
        let path = self.import_name(2, 't', path);
        self.add(NodeKind::ImportTable { path, ty }, vec![])
    }

    pub fn import_memory(&mut self, path: ImportPath, ty: MemoryType) -> NodeId {
        let path = self.import_name(3, 'm', path);
        self.add(NodeKind::ImportMemory { path, ty }, vec![])
    }

    pub fn global(&mut self, init: ConstExpr, mutable: bool) -> NodeId {
        let ty = GlobalType::new(init.ty, mutable);
        let deps = init.instr.deps.clone();
        self.add(NodeKind::Global { ty, init }, deps)
    }

    /// `content`, when given, becomes an active element segment at offset 0.
    pub fn table(&mut self, ty: TableType, content: Option<Vec<ConstExpr>>) -> Result<NodeId, BuildError> {
        let table = self.add(NodeKind::Table(ty), vec![]);
        if let Some(content) = content {
            self.elem(
                ty.element,
                ElemMode::Active {
                    table,
                    offset: ConstExpr::i32(0),
                },
                content,
            )?;
        }
        Ok(table)
    }

    /// Lays `content` out as consecutive active data segments from offset 0.
    pub fn memory(&mut self, limits: Limits, content: &[&[u8]]) -> NodeId {
        let memory = self.add(NodeKind::Memory(MemoryType { limits }), vec![]);
        let mut offset = 0u32;
        for bytes in content {
            let mode = DataMode::Active {
                offset: ConstExpr::i32(offset as i32),
            };
            self.add(
                NodeKind::Data {
                    init: bytes.to_vec(),
                    mode,
                },
                vec![memory],
            );
            offset = offset.wrapping_add(bytes.len() as u32);
        }
        memory
    }

    /// A data segment. Active segments target memory 0; pass `memory` to also
    /// attach the segment to that memory node, so that it comes along
    /// wherever the memory does.
    pub fn data(&mut self, mode: DataMode, memory: Option<NodeId>, init: Vec<u8>) -> Result<NodeId, BuildError> {
        let mut deps = vec![];
        if let DataMode::Active { offset } = &mode {
            check_offset(offset)?;
            match memory {
                Some(memory) => {
                    self.expect_memory(memory)?;
                    deps.push(memory);
                }
                None => deps.push(self.has_memory),
            }
            deps.extend_from_slice(offset.deps());
        }
        Ok(self.add(NodeKind::Data { init, mode }, deps))
    }

    pub fn elem(&mut self, ty: RefType, mode: ElemMode, init: Vec<ConstExpr>) -> Result<NodeId, BuildError> {
        let mut deps = vec![];
        for entry in &init {
            if entry.ty != ValueType::from(ty) {
                return Err(BuildError::TypeMismatch {
                    expected: ValueType::from(ty).to_string(),
                    actual: entry.ty.to_string(),
                });
            }
            deps.extend_from_slice(entry.deps());
        }
        if let ElemMode::Active { table, offset } = &mode {
            check_offset(offset)?;
            let element = self.table_type(*table)?.element;
            if element != ty {
                return Err(BuildError::TypeMismatch {
                    expected: element.to_string(),
                    actual: ty.to_string(),
                });
            }
            deps.push(*table);
            deps.extend_from_slice(offset.deps());
        }
        Ok(self.add(NodeKind::Elem { ty, init, mode }, deps))
    }

    /// `ref.func` as a constant expression.
    pub fn const_ref_func(&self, func: NodeId) -> Result<ConstExpr, BuildError> {
        self.function_type(func)?;
        Ok(ConstExpr {
            instr: Instruction {
                name: "ref.func",
                ty: FunctionType::new(&[], &[ValueType::FuncRef]),
                deps: vec![func],
                args: Pending::DepIndex,
            },
            ty: ValueType::FuncRef,
        })
    }

    /// `global.get` as a constant expression; only immutable globals qualify.
    pub fn const_global_get(&self, global: NodeId) -> Result<ConstExpr, BuildError> {
        let ty = self.global_type(global)?;
        if ty.mutable {
            return Err(BuildError::MutableGlobalInConstExpr);
        }
        Ok(ConstExpr {
            instr: Instruction {
                name: "global.get",
                ty: FunctionType::new(&[], &[ty.value]),
                deps: vec![global],
                args: Pending::DepIndex,
            },
            ty: ty.value,
        })
    }

    /// Marks `func` as referenced by `ref.func`.
    pub fn has_ref_to(&mut self, func: NodeId) -> Result<NodeId, BuildError> {
        self.function_type(func)?;
        Ok(self.add(NodeKind::HasRefTo, vec![func]))
    }

    /// Segments that initialise `target`: data segments attached to a memory
    /// and active element segments of a table, in creation order.
    pub(crate) fn segments_of(&self, target: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(move |(_, node)| match &node.kind {
                NodeKind::Data { .. } => node.deps.first() == Some(&target),
                NodeKind::Elem {
                    mode: ElemMode::Active { table, .. },
                    ..
                } => *table == target,
                _ => false,
            })
            .map(|(i, _)| NodeId(i as u32))
    }

    /// Adds `id` and everything reachable from it to `set`, depth first in
    /// pre-order. Nodes never change once created, so a memory or table
    /// reaches its segments through [`segments_of`](Graph::segments_of), after
    /// its own dependencies.
    pub fn push_dependency(&self, set: &mut DependencySet, id: NodeId) {
        let mut stack = vec![id];
        while let Some(id) = stack.pop() {
            if !set.insert(id) {
                continue;
            }
            let node = match self.get(id) {
                Some(node) => node,
                None => continue,
            };
            let kind = node.kind.kind();
            if kind.is_memory() || kind.is_table() {
                let segments: Vec<NodeId> = self.segments_of(id).collect();
                stack.extend(segments.into_iter().rev().filter(|s| !set.contains(*s)));
            }
            for dep in node.deps.iter().rev() {
                if !set.contains(*dep) {
                    stack.push(*dep);
                }
            }
        }
    }
}

fn check_offset(offset: &ConstExpr) -> Result<(), BuildError> {
    if offset.ty != ValueType::I32 {
        return Err(BuildError::TypeMismatch {
            expected: ValueType::I32.to_string(),
            actual: offset.ty.to_string(),
        });
    }
    Ok(())
}
