//! Structured form of an assembled module.
//!
//! Every index in here is final: instructions are [`ResolvedInstruction`]s
//! and references between entities are plain index-space positions. A
//! function keeps its type index, locals and body together, so the function
//! and code sections cannot disagree in length once a `Module` exists.

mod binary;

use std::fmt;

pub use self::binary::ModuleCodec;
use crate::binary::{Codec, CodecError};
use crate::instruction::{Immediate, ResolvedInstruction};
use crate::types::{FunctionType, GlobalType, MemoryType, RefType, TableType, ValueType};

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Module {
    pub types: Vec<FunctionType>,
    pub imports: Vec<Import>,
    pub functions: Vec<Function>,
    pub tables: Vec<TableType>,
    /// At most one, counting imported memories too.
    pub memories: Vec<MemoryType>,
    pub globals: Vec<Global>,
    pub exports: Vec<Export>,
    pub start: Option<u32>,
    pub elements: Vec<Element>,
    pub datas: Vec<Data>,
}

impl Module {
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        ModuleCodec.to_bytes(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Module, CodecError> {
        ModuleCodec.from_bytes(bytes)
    }

    pub fn export(&self, name: &str) -> Option<ExportIndex> {
        self.exports.iter().find(|e| e.name == name).map(|e| e.index)
    }

    pub fn imported_functions(&self) -> usize {
        self.imports
            .iter()
            .filter(|i| matches!(i.kind, ExternalKind::Function(_)))
            .count()
    }

    pub fn imported_globals(&self) -> usize {
        self.imports
            .iter()
            .filter(|i| matches!(i.kind, ExternalKind::Global(_)))
            .count()
    }

    /// Signature of a function in the function index space, imports first.
    pub fn function_type(&self, index: u32) -> Option<&FunctionType> {
        let imported = self.imports.iter().filter_map(|i| match i.kind {
            ExternalKind::Function(ty) => Some(ty),
            _ => None,
        });
        let local = self.functions.iter().map(|f| f.type_index);
        imported
            .chain(local)
            .nth(index as usize)
            .and_then(|ty| self.types.get(ty as usize))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub type_index: u32,
    /// Declared locals, parameters excluded.
    pub locals: Vec<ValueType>,
    pub body: Vec<ResolvedInstruction>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Global {
    pub ty: GlobalType,
    pub init: Vec<ResolvedInstruction>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExternalKind {
    /// Index into the type section.
    Function(u32),
    Table(TableType),
    Memory(MemoryType),
    Global(GlobalType),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Import {
    pub module: String,
    pub name: String,
    pub kind: ExternalKind,
}

impl fmt::Display for Import {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind = match self.kind {
            ExternalKind::Function(_) => "func",
            ExternalKind::Table(_) => "table",
            ExternalKind::Memory(_) => "memory",
            ExternalKind::Global(_) => "global",
        };
        write!(f, "{} {:?} {:?}", kind, self.module, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportIndex {
    Function(u32),
    Table(u32),
    Memory(u32),
    Global(u32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Export {
    pub name: String,
    pub index: ExportIndex,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ElementMode {
    Passive,
    Declarative,
    Active {
        table_index: u32,
        offset: Vec<ResolvedInstruction>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub ref_type: RefType,
    /// One constant expression per entry.
    pub init: Vec<Vec<ResolvedInstruction>>,
    pub mode: ElementMode,
}

impl Element {
    /// Function indices when every entry is a plain `ref.func`.
    pub fn function_indices(&self) -> Option<Vec<u32>> {
        if self.ref_type != RefType::FuncRef {
            return None;
        }
        self.init
            .iter()
            .map(|expr| match expr.as_slice() {
                [ResolvedInstruction {
                    name: "ref.func",
                    immediate: Immediate::U32(idx),
                }] => Some(*idx),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DataMode {
    Passive,
    Active {
        memory_index: u32,
        offset: Vec<ResolvedInstruction>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Data {
    pub init: Vec<u8>,
    pub mode: DataMode,
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Module types = {} imports = {} functions = {} tables = {} memories = {} globals = {} exports = {} \
             elements = {} datas = {}",
            self.types.len(),
            self.imports.len(),
            self.functions.len(),
            self.tables.len(),
            self.memories.len(),
            self.globals.len(),
            self.exports.len(),
            self.elements.len(),
            self.datas.len()
        )?;
        if let Some(start) = self.start {
            write!(f, " start = {}", start)?;
        }
        Ok(())
    }
}
