//! Module assembly: from a set of roots to a fully indexed [`Module`].
//!
//! Everything reachable from the exports, the memory and the start function
//! is collected, bucketed by kind and numbered per index space (imports
//! before local definitions, discovery order within each group). Function
//! types are deduplicated structurally; every other node is identified by
//! its handle only. Instruction operands that still name nodes are then
//! rewritten into indices.

use std::collections::{HashMap, HashSet};

use log::{debug, trace};
use thiserror::Error;

use crate::binary::CodecError;
use crate::dependency::{
    ConstExpr, DataMode as NodeDataMode, DependencyKind, DependencySet, ElemMode, FuncBody, Graph, ImportName,
    Instruction, Node, NodeId, NodeKind, Pending, PendingBlockType,
};
use crate::instruction::{BlockType, Immediate, ResolvedInstruction};
use crate::module::{
    Data, DataMode, Element, ElementMode, Export, ExportIndex, ExternalKind, Function, Global, Import, Module,
};
use crate::types::{FunctionType, Limits, MemoryType, RefType, TableType};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AssemblyError {
    #[error("multiple memories ({0}), a module can have at most one")]
    MultipleMemories(usize),

    #[error("the module depends on a memory but none was found; add one to the roots")]
    MissingMemory,

    #[error("dependency {0:?} has no index")]
    UnresolvedDependency(NodeId),

    #[error("{0} is missing a dependency operand")]
    MissingOperand(&'static str),

    #[error("duplicate export name {0:?}")]
    DuplicateExport(String),

    #[error("import {module:?} {name:?} is declared twice with different descriptions")]
    ConflictingImport { module: String, name: String },

    #[error("export {0:?} is not a function, global, table or memory")]
    InvalidExport(String),

    #[error("invalid start function: {0}")]
    InvalidStart(String),
}

/// The memory root: either a memory node, or limits for a fresh empty one.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MemoryRoot {
    Limits(Limits),
    Node(NodeId),
}

impl From<Limits> for MemoryRoot {
    fn from(limits: Limits) -> MemoryRoot {
        MemoryRoot::Limits(limits)
    }
}

impl From<NodeId> for MemoryRoot {
    fn from(memory: NodeId) -> MemoryRoot {
        MemoryRoot::Node(memory)
    }
}

/// What a module is built from. Exports keep the order they were added in.
#[derive(Clone, Debug, Default)]
pub struct ModuleRoots {
    pub exports: Vec<(String, NodeId)>,
    pub start: Option<NodeId>,
    pub memory: Option<MemoryRoot>,
}

impl ModuleRoots {
    pub fn new() -> ModuleRoots {
        ModuleRoots::default()
    }

    pub fn export(mut self, name: &str, node: NodeId) -> ModuleRoots {
        self.exports.push((name.to_string(), node));
        self
    }

    pub fn start(mut self, func: NodeId) -> ModuleRoots {
        self.start = Some(func);
        self
    }

    pub fn memory(mut self, memory: impl Into<MemoryRoot>) -> ModuleRoots {
        self.memory = Some(memory.into());
        self
    }
}

/// Whatever loads and runs module bytes. The library only hands over the
/// bytes and the import list; it never executes code itself.
pub trait Host {
    type Instance;
    type Error: From<CodecError>;

    fn instantiate(&mut self, bytes: &[u8], imports: &[Import]) -> Result<Self::Instance, Self::Error>;
}

/// An assembled module, ready to encode.
#[derive(Debug, Clone, PartialEq)]
pub struct Assembled {
    module: Module,
}

impl Assembled {
    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn into_module(self) -> Module {
        self.module
    }

    /// The imports a host has to provide, in import index order.
    pub fn imports(&self) -> &[Import] {
        &self.module.imports
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        self.module.to_bytes()
    }

    pub fn instantiate<H: Host>(&self, host: &mut H) -> Result<H::Instance, H::Error> {
        let bytes = self.to_bytes()?;
        host.instantiate(&bytes, self.imports())
    }
}

/// Index assignment and operand resolution over one dependency set.
struct Layout<'a> {
    graph: &'a Graph,
    buckets: HashMap<DependencyKind, Vec<NodeId>>,
    indices: HashMap<NodeId, u32>,
    types: Vec<FunctionType>,
}

impl<'a> Layout<'a> {
    fn new(graph: &'a Graph, set: &DependencySet) -> Result<Layout<'a>, AssemblyError> {
        let mut buckets: HashMap<DependencyKind, Vec<NodeId>> = HashMap::new();
        for id in set.iter() {
            let kind = graph.kind(id).ok_or(AssemblyError::UnresolvedDependency(id))?;
            buckets.entry(kind).or_default().push(id);
        }
        for kind in DependencyKind::ALL.iter() {
            if let Some(nodes) = buckets.get(kind) {
                debug!("{:?}: {} nodes", kind, nodes.len());
            }
        }
        Ok(Layout {
            graph,
            buckets,
            indices: HashMap::new(),
            types: vec![],
        })
    }

    fn bucket(&self, kind: DependencyKind) -> &[NodeId] {
        self.buckets.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    fn node(&self, id: NodeId) -> Result<&'a Node, AssemblyError> {
        self.graph.get(id).ok_or(AssemblyError::UnresolvedDependency(id))
    }

    fn assign(&mut self, id: NodeId, index: u32) {
        trace!("{:?} -> {}", id, index);
        self.indices.insert(id, index);
    }

    fn index_of(&self, id: NodeId) -> Result<u32, AssemblyError> {
        self.indices
            .get(&id)
            .copied()
            .ok_or(AssemblyError::UnresolvedDependency(id))
    }

    /// Index of `ty` in the type section, appending it if it is new.
    fn push_type(&mut self, ty: &FunctionType) -> u32 {
        match self.types.iter().position(|t| t == ty) {
            Some(index) => {
                trace!("type {} reuses index {}", ty, index);
                index as u32
            }
            None => {
                self.types.push(ty.clone());
                self.types.len() as u32 - 1
            }
        }
    }

    /// Numbers `kind` after `offset` entries of the same index space.
    fn assign_in_order(&mut self, kind: DependencyKind, offset: u32) {
        let ids = self.bucket(kind).to_vec();
        for (i, id) in ids.into_iter().enumerate() {
            self.assign(id, offset + i as u32);
        }
    }

    fn check_memory(&self) -> Result<(), AssemblyError> {
        let memories = self.bucket(DependencyKind::Memory).len() + self.bucket(DependencyKind::ImportMemory).len();
        if memories > 1 {
            return Err(AssemblyError::MultipleMemories(memories));
        }
        if memories == 0 && !self.bucket(DependencyKind::HasMemory).is_empty() {
            return Err(AssemblyError::MissingMemory);
        }
        Ok(())
    }

    fn imports(&mut self) -> Result<Vec<Import>, AssemblyError> {
        let mut imports: Vec<Import> = vec![];
        let kinds = [
            DependencyKind::ImportFunction,
            DependencyKind::ImportGlobal,
            DependencyKind::ImportTable,
            DependencyKind::ImportMemory,
        ];
        for kind in kinds.iter() {
            let ids = self.bucket(*kind).to_vec();
            for (i, id) in ids.into_iter().enumerate() {
                let (path, external) = match &self.node(id)?.kind {
                    NodeKind::ImportFunction { path, ty } => (path, ExternalKind::Function(self.push_type(ty))),
                    NodeKind::ImportGlobal { path, ty } => (path, ExternalKind::Global(*ty)),
                    NodeKind::ImportTable { path, ty } => (path, ExternalKind::Table(*ty)),
                    NodeKind::ImportMemory { path, ty } => (path, ExternalKind::Memory(*ty)),
                    _ => return Err(AssemblyError::UnresolvedDependency(id)),
                };
                self.assign(id, i as u32);
                add_import(&mut imports, path, external)?;
            }
        }
        Ok(imports)
    }

    fn dep(&self, instr: &Instruction, i: usize) -> Result<u32, AssemblyError> {
        let id = instr.deps.get(i).ok_or(AssemblyError::MissingOperand(instr.name))?;
        self.index_of(*id)
    }

    fn block_type(&self, block_type: PendingBlockType, instr: &Instruction) -> Result<BlockType, AssemblyError> {
        match block_type {
            PendingBlockType::Inline(block_type) => Ok(block_type),
            PendingBlockType::TypeNode => Ok(BlockType::Index(self.dep(instr, 0)?)),
        }
    }

    fn resolve(&self, instr: &Instruction) -> Result<ResolvedInstruction, AssemblyError> {
        let immediate = match &instr.args {
            Pending::Ready(immediate) => immediate.clone(),
            Pending::DepIndex => Immediate::U32(self.dep(instr, 0)?),
            Pending::DepIndexPair => Immediate::U32Pair(self.dep(instr, 0)?, self.dep(instr, 1)?),
            Pending::DepIndexWith(n) => Immediate::U32Pair(self.dep(instr, 0)?, *n),
            Pending::Block { block_type, body } => Immediate::Block {
                block_type: self.block_type(*block_type, instr)?,
                body: self.resolve_body(body)?,
            },
            Pending::If {
                block_type,
                then,
                else_,
            } => Immediate::If {
                block_type: self.block_type(*block_type, instr)?,
                then: self.resolve_body(then)?,
                else_: else_.as_ref().map(|body| self.resolve_body(body)).transpose()?,
            },
        };
        Ok(ResolvedInstruction::new(instr.name, immediate))
    }

    fn resolve_body(&self, body: &[Instruction]) -> Result<Vec<ResolvedInstruction>, AssemblyError> {
        body.iter().map(|instr| self.resolve(instr)).collect()
    }

    fn resolve_const(&self, expr: &ConstExpr) -> Result<Vec<ResolvedInstruction>, AssemblyError> {
        Ok(vec![self.resolve(&expr.instr)?])
    }

    /// Numbers local functions after the imported ones. Bodies are resolved
    /// later, once every index is known.
    fn index_functions(&mut self) -> Result<Vec<(&'a FuncBody, u32)>, AssemblyError> {
        let imported = self.bucket(DependencyKind::ImportFunction).len() as u32;
        let ids = self.bucket(DependencyKind::Function).to_vec();
        let mut funcs = Vec::with_capacity(ids.len());
        for (i, id) in ids.into_iter().enumerate() {
            let func = match &self.node(id)?.kind {
                NodeKind::Function(func) => func,
                _ => return Err(AssemblyError::UnresolvedDependency(id)),
            };
            let type_index = self.push_type(&func.ty);
            self.assign(id, imported + i as u32);
            funcs.push((func, type_index));
        }
        Ok(funcs)
    }

    fn index_types(&mut self) -> Result<(), AssemblyError> {
        for id in self.bucket(DependencyKind::Type).to_vec() {
            let ty = match &self.node(id)?.kind {
                NodeKind::Type(ty) => ty,
                _ => return Err(AssemblyError::UnresolvedDependency(id)),
            };
            let index = self.push_type(ty);
            self.assign(id, index);
        }
        Ok(())
    }

    fn index_rest(&mut self) {
        let globals = self.bucket(DependencyKind::ImportGlobal).len() as u32;
        let tables = self.bucket(DependencyKind::ImportTable).len() as u32;
        let memories = self.bucket(DependencyKind::ImportMemory).len() as u32;
        self.assign_in_order(DependencyKind::Global, globals);
        self.assign_in_order(DependencyKind::Table, tables);
        self.assign_in_order(DependencyKind::Memory, memories);
        self.assign_in_order(DependencyKind::Elem, 0);
        self.assign_in_order(DependencyKind::Data, 0);
        // sentinels assert existence, their index is never meaningful
        let sentinels: Vec<NodeId> = self
            .bucket(DependencyKind::HasRefTo)
            .iter()
            .chain(self.bucket(DependencyKind::HasMemory))
            .copied()
            .collect();
        for id in sentinels {
            self.assign(id, 0);
        }
    }

    fn globals(&self) -> Result<Vec<Global>, AssemblyError> {
        self.bucket(DependencyKind::Global)
            .iter()
            .map(|&id| match &self.node(id)?.kind {
                NodeKind::Global { ty, init } => Ok(Global {
                    ty: *ty,
                    init: self.resolve_const(init)?,
                }),
                _ => Err(AssemblyError::UnresolvedDependency(id)),
            })
            .collect()
    }

    fn tables(&self) -> Result<Vec<TableType>, AssemblyError> {
        self.bucket(DependencyKind::Table)
            .iter()
            .map(|&id| match &self.node(id)?.kind {
                NodeKind::Table(ty) => Ok(*ty),
                _ => Err(AssemblyError::UnresolvedDependency(id)),
            })
            .collect()
    }

    fn memories(&self) -> Result<Vec<MemoryType>, AssemblyError> {
        self.bucket(DependencyKind::Memory)
            .iter()
            .map(|&id| match &self.node(id)?.kind {
                NodeKind::Memory(ty) => Ok(*ty),
                _ => Err(AssemblyError::UnresolvedDependency(id)),
            })
            .collect()
    }

    fn elements(&self) -> Result<Vec<Element>, AssemblyError> {
        self.bucket(DependencyKind::Elem)
            .iter()
            .map(|&id| match &self.node(id)?.kind {
                NodeKind::Elem { ty, init, mode } => Ok(Element {
                    ref_type: *ty,
                    init: init
                        .iter()
                        .map(|entry| self.resolve_const(entry))
                        .collect::<Result<_, _>>()?,
                    mode: match mode {
                        ElemMode::Passive => ElementMode::Passive,
                        ElemMode::Declarative => ElementMode::Declarative,
                        ElemMode::Active { table, offset } => ElementMode::Active {
                            table_index: self.index_of(*table)?,
                            offset: self.resolve_const(offset)?,
                        },
                    },
                }),
                _ => Err(AssemblyError::UnresolvedDependency(id)),
            })
            .collect()
    }

    fn datas(&self) -> Result<Vec<Data>, AssemblyError> {
        self.bucket(DependencyKind::Data)
            .iter()
            .map(|&id| match &self.node(id)?.kind {
                NodeKind::Data { init, mode } => Ok(Data {
                    init: init.clone(),
                    mode: match mode {
                        NodeDataMode::Passive => DataMode::Passive,
                        NodeDataMode::Active { offset } => DataMode::Active {
                            memory_index: 0,
                            offset: self.resolve_const(offset)?,
                        },
                    },
                }),
                _ => Err(AssemblyError::UnresolvedDependency(id)),
            })
            .collect()
    }

    /// Functions that `ref.func` names inside function bodies must also be
    /// referenced from outside any body: through an export, a global
    /// initialiser or an element segment. Whatever is left over goes into one
    /// declarative segment.
    fn undeclared_refs(&self, roots: &ModuleRoots) -> Result<Option<Element>, AssemblyError> {
        let mut declared: HashSet<NodeId> = roots.exports.iter().map(|(_, id)| *id).collect();
        for &id in self.bucket(DependencyKind::Global) {
            if let NodeKind::Global { init, .. } = &self.node(id)?.kind {
                declared.extend(init.deps());
            }
        }
        for &id in self.bucket(DependencyKind::Elem) {
            if let NodeKind::Elem { init, .. } = &self.node(id)?.kind {
                declared.extend(init.iter().flat_map(|entry| entry.deps()));
            }
        }
        let mut init = vec![];
        for &marker in self.bucket(DependencyKind::HasRefTo) {
            let func = *self
                .node(marker)?
                .deps
                .first()
                .ok_or(AssemblyError::MissingOperand("ref.func"))?;
            if declared.insert(func) {
                let index = self.index_of(func)?;
                trace!("declaring ref.func target {}", index);
                init.push(vec![ResolvedInstruction::new("ref.func", Immediate::U32(index))]);
            }
        }
        if init.is_empty() {
            return Ok(None);
        }
        Ok(Some(Element {
            ref_type: RefType::FuncRef,
            init,
            mode: ElementMode::Declarative,
        }))
    }

    fn start(&self, start: Option<NodeId>) -> Result<Option<u32>, AssemblyError> {
        let func = match start {
            Some(func) => func,
            None => return Ok(None),
        };
        let ty = self
            .graph
            .function_type(func)
            .map_err(|err| AssemblyError::InvalidStart(err.to_string()))?;
        if !ty.params.is_empty() || !ty.results.is_empty() {
            return Err(AssemblyError::InvalidStart(format!("expected type [] -> [], got {}", ty)));
        }
        Ok(Some(self.index_of(func)?))
    }

    fn exports(&self, roots: &ModuleRoots) -> Result<Vec<Export>, AssemblyError> {
        let mut names = HashSet::new();
        let mut exports = Vec::with_capacity(roots.exports.len());
        for (name, id) in &roots.exports {
            if !names.insert(name.as_str()) {
                return Err(AssemblyError::DuplicateExport(name.clone()));
            }
            let kind = self.graph.kind(*id).ok_or(AssemblyError::UnresolvedDependency(*id))?;
            let index = self.index_of(*id)?;
            let index = if kind.is_function() {
                ExportIndex::Function(index)
            } else if kind.is_global() {
                ExportIndex::Global(index)
            } else if kind.is_table() {
                ExportIndex::Table(index)
            } else if kind.is_memory() {
                ExportIndex::Memory(index)
            } else {
                return Err(AssemblyError::InvalidExport(name.clone()));
            };
            exports.push(Export {
                name: name.clone(),
                index,
            });
        }
        Ok(exports)
    }
}

fn add_import(imports: &mut Vec<Import>, path: &ImportName, kind: ExternalKind) -> Result<(), AssemblyError> {
    let conflict = imports
        .iter()
        .any(|i| i.module == path.module && i.name == path.name && i.kind != kind);
    if conflict {
        return Err(AssemblyError::ConflictingImport {
            module: path.module.clone(),
            name: path.name.clone(),
        });
    }
    imports.push(Import {
        module: path.module.clone(),
        name: path.name.clone(),
        kind,
    });
    Ok(())
}

impl Graph {
    /// Assembles the module reachable from `roots`.
    ///
    /// A `MemoryRoot::Limits` memory becomes a new node of this graph, which
    /// is why assembly needs `&mut self`.
    pub fn assemble(&mut self, roots: ModuleRoots) -> Result<Assembled, AssemblyError> {
        let memory = match roots.memory {
            Some(MemoryRoot::Limits(limits)) => Some(self.memory(limits, &[])),
            Some(MemoryRoot::Node(memory)) => Some(memory),
            None => None,
        };

        let mut set = DependencySet::new();
        for (_, id) in &roots.exports {
            self.push_dependency(&mut set, *id);
        }
        if let Some(memory) = memory {
            self.push_dependency(&mut set, memory);
        }
        if let Some(start) = roots.start {
            self.push_dependency(&mut set, start);
        }
        debug!("assembling {} of {} nodes", set.len(), self.len());

        let mut layout = Layout::new(self, &set)?;
        layout.check_memory()?;
        let imports = layout.imports()?;
        let funcs = layout.index_functions()?;
        layout.index_types()?;
        layout.index_rest();

        let functions = funcs
            .into_iter()
            .map(|(func, type_index)| -> Result<Function, AssemblyError> {
                Ok(Function {
                    type_index,
                    locals: func.locals.clone(),
                    body: layout.resolve_body(&func.body)?,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let mut elements = layout.elements()?;
        elements.extend(layout.undeclared_refs(&roots)?);
        debug_assert!(
            layout.types.iter().enumerate().all(|(i, ty)| !layout.types[..i].contains(ty)),
            "type section holds a duplicate"
        );

        let module = Module {
            types: layout.types.clone(),
            imports,
            functions,
            tables: layout.tables()?,
            memories: layout.memories()?,
            globals: layout.globals()?,
            exports: layout.exports(&roots)?,
            start: layout.start(roots.start)?,
            elements,
            datas: layout.datas()?,
        };
        debug!("assembled {}", module);
        Ok(Assembled { module })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{FuncDecl, MemAccess};
    use crate::dependency::ImportPath;
    use crate::types::{GlobalType, TableType, ValueType::*};

    fn instr(name: &'static str, immediate: Immediate) -> ResolvedInstruction {
        ResolvedInstruction::new(name, immediate)
    }

    fn void() -> FunctionType {
        FunctionType::new(&[], &[])
    }

    #[test]
    fn imports_are_indexed_before_local_functions() {
        let mut graph = Graph::new();
        let log = graph.import_func(ImportPath::new("env", "log"), FunctionType::new(&[I32], &[]));
        let run = graph
            .func(FuncDecl::new(&[I32], &[]), |ctx, params, _| {
                ctx.call(log, &[params[0].into()])?;
                Ok(())
            })
            .unwrap();
        let assembled = graph.assemble(ModuleRoots::new().export("run", run)).unwrap();
        let module = assembled.module();

        assert_eq!(module.types, vec![FunctionType::new(&[I32], &[])]);
        assert_eq!(
            assembled.imports(),
            &[Import {
                module: "env".into(),
                name: "log".into(),
                kind: ExternalKind::Function(0),
            }]
        );
        assert_eq!(module.export("run"), Some(ExportIndex::Function(1)));
        assert_eq!(
            module.functions[0].body,
            vec![instr("local.get", Immediate::U32(0)), instr("call", Immediate::U32(0))]
        );
    }

    #[test]
    fn identical_signatures_share_a_type() {
        let mut graph = Graph::new();
        let table = graph
            .table(
                TableType {
                    element: RefType::FuncRef,
                    limits: Limits::new(1, None),
                },
                None,
            )
            .unwrap();
        let inc = graph
            .func(FuncDecl::new(&[I32], &[I32]), |ctx, params, _| {
                ctx.op("i32.add", &[params[0].into(), 1i32.into()])?;
                Ok(())
            })
            .unwrap();
        let dispatch = graph
            .func(FuncDecl::new(&[I32], &[I32]), |ctx, params, _| {
                ctx.call_indirect(table, FunctionType::new(&[I32], &[I32]), &[params[0].into(), 0i32.into()])?;
                Ok(())
            })
            .unwrap();
        let roots = ModuleRoots::new().export("inc", inc).export("dispatch", dispatch);
        let module = graph.assemble(roots).unwrap().into_module();

        assert_eq!(module.types.len(), 1);
        assert!(module.functions.iter().all(|f| f.type_index == 0));
        let call = module.functions[1].body.last().unwrap();
        assert_eq!(call, &instr("call_indirect", Immediate::U32Pair(0, 0)));
    }

    #[test]
    fn memory_must_exist_exactly_once() {
        let mut graph = Graph::new();
        let load = graph
            .func(FuncDecl::new(&[], &[I32]), |ctx, _, _| {
                ctx.load("i32.load", MemAccess::default(), &[0i32.into()])?;
                Ok(())
            })
            .unwrap();
        assert_eq!(
            graph.assemble(ModuleRoots::new().export("load", load)),
            Err(AssemblyError::MissingMemory)
        );

        let module = graph
            .assemble(ModuleRoots::new().export("load", load).memory(Limits::new(1, None)))
            .unwrap()
            .into_module();
        assert_eq!(module.memories.len(), 1);

        let imported = graph.import_memory(
            ImportPath::new("env", "memory"),
            MemoryType {
                limits: Limits::new(1, None),
            },
        );
        let roots = ModuleRoots::new()
            .export("load", load)
            .export("memory", imported)
            .memory(Limits::new(1, None));
        assert_eq!(graph.assemble(roots), Err(AssemblyError::MultipleMemories(2)));
    }

    #[test]
    fn ref_func_targets_are_declared() {
        let mut graph = Graph::new();
        let target = graph.func(FuncDecl::new(&[], &[]), |_, _, _| Ok(())).unwrap();
        let get = graph
            .func(FuncDecl::new(&[], &[FuncRef]), |ctx, _, _| {
                ctx.ref_func(target)?;
                Ok(())
            })
            .unwrap();

        let module = graph.assemble(ModuleRoots::new().export("get", get)).unwrap().into_module();
        assert_eq!(
            module.elements,
            vec![Element {
                ref_type: RefType::FuncRef,
                init: vec![vec![instr("ref.func", Immediate::U32(1))]],
                mode: ElementMode::Declarative,
            }]
        );
        assert_eq!(module.functions[0].body, vec![instr("ref.func", Immediate::U32(1))]);

        // an export already declares the target
        let roots = ModuleRoots::new().export("get", get).export("target", target);
        let module = graph.assemble(roots).unwrap().into_module();
        assert!(module.elements.is_empty());
    }

    #[test]
    fn exports_and_start_are_checked() {
        let mut graph = Graph::new();
        let noop = graph.func(FuncDecl::new(&[], &[]), |_, _, _| Ok(())).unwrap();
        let id = graph
            .func(FuncDecl::new(&[I32], &[I32]), |ctx, params, _| {
                ctx.local_get(params[0])?;
                Ok(())
            })
            .unwrap();
        let ty = graph.func_type(void());

        let roots = ModuleRoots::new().export("f", noop).export("f", id);
        assert_eq!(graph.assemble(roots), Err(AssemblyError::DuplicateExport("f".into())));
        let roots = ModuleRoots::new().export("ty", ty);
        assert_eq!(graph.assemble(roots), Err(AssemblyError::InvalidExport("ty".into())));
        assert!(matches!(
            graph.assemble(ModuleRoots::new().start(id)),
            Err(AssemblyError::InvalidStart(_))
        ));

        let module = graph.assemble(ModuleRoots::new().start(noop)).unwrap().into_module();
        assert_eq!(module.start, Some(0));
        assert!(module.exports.is_empty());
    }

    #[test]
    fn conflicting_imports_are_rejected() {
        let mut graph = Graph::new();
        let a = graph.import_func(ImportPath::new("env", "f"), FunctionType::new(&[I32], &[]));
        let b = graph.import_func(ImportPath::new("env", "f"), void());
        let roots = ModuleRoots::new().export("a", a).export("b", b);
        assert_eq!(
            graph.assemble(roots),
            Err(AssemblyError::ConflictingImport {
                module: "env".into(),
                name: "f".into(),
            })
        );
    }

    #[test]
    fn globals_and_segments_resolve() {
        let mut graph = Graph::new();
        let base = graph.import_global(ImportPath::new("env", "base"), GlobalType::new(I32, false));
        let scale = graph.global(ConstExpr::i32(3), false);
        let counter = graph.global(ConstExpr::i32(0), true);
        let memory = graph.memory(Limits::new(1, None), &[b"ab", b"cd"]);
        let bump = graph
            .func(FuncDecl::new(&[], &[]), |ctx, _, _| {
                let x = ctx.op("i32.mul", &[base.into(), scale.into()])?;
                ctx.global_set(counter, &[x.into()])?;
                Ok(())
            })
            .unwrap();
        let roots = ModuleRoots::new().export("bump", bump).memory(memory);
        let assembled = graph.assemble(roots).unwrap();
        let module = assembled.module();

        assert_eq!(
            module.functions[0].body,
            vec![
                instr("global.get", Immediate::U32(0)),
                instr("global.get", Immediate::U32(1)),
                instr("i32.mul", Immediate::None),
                instr("global.set", Immediate::U32(2)),
            ]
        );
        let offsets: Vec<_> = module
            .datas
            .iter()
            .map(|d| match &d.mode {
                DataMode::Active { offset, .. } => offset.clone(),
                DataMode::Passive => vec![],
            })
            .collect();
        assert_eq!(
            offsets,
            vec![
                vec![instr("i32.const", Immediate::I32(0))],
                vec![instr("i32.const", Immediate::I32(2))],
            ]
        );

        let bytes = assembled.to_bytes().unwrap();
        assert_eq!(&Module::from_bytes(&bytes).unwrap(), module);
    }

    #[test]
    fn float_constants_round_trip_bitwise() {
        let mut graph = Graph::new();
        let f = graph
            .func(FuncDecl::new(&[], &[F32, F64]), |ctx, _, _| {
                ctx.f32_const(f32::NAN)?;
                ctx.f64_const(-0.0)?;
                Ok(())
            })
            .unwrap();
        let assembled = graph.assemble(ModuleRoots::new().export("f", f)).unwrap();
        let bytes = assembled.to_bytes().unwrap();
        assert_eq!(&Module::from_bytes(&bytes).unwrap(), assembled.module());

        let body = &assembled.module().functions[0].body;
        assert_eq!(body[1].immediate, Immediate::F64(-0.0));
        assert_ne!(body[1].immediate, Immediate::F64(0.0));
    }

    #[test]
    fn nested_blocks_resolve_type_nodes() {
        let mut graph = Graph::new();
        let f = graph
            .func(FuncDecl::new(&[I32, I32], &[I32]), |ctx, params, _| {
                ctx.local_get(params[0])?;
                ctx.local_get(params[1])?;
                ctx.block(FunctionType::new(&[I32, I32], &[I32]), |ctx, _| {
                    ctx.instr("i32.sub", &[])?;
                    Ok(())
                })?;
                Ok(())
            })
            .unwrap();
        let module = graph.assemble(ModuleRoots::new().export("f", f)).unwrap().into_module();

        assert_eq!(module.types, vec![FunctionType::new(&[I32, I32], &[I32])]);
        assert_eq!(
            module.functions[0].body[2],
            instr(
                "block",
                Immediate::Block {
                    block_type: BlockType::Index(0),
                    body: vec![instr("i32.sub", Immediate::None)],
                }
            )
        );
    }
}
