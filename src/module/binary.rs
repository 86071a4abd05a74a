//! Section layout of the binary module format.
//!
//! ```text
//! module  ::= magic version section*
//! section ::= id:byte size:u32 payload
//! ```
//!
//! Sections appear at most once, in the fixed order type, import, function,
//! table, memory, global, export, start, element, data count, code, data.
//! Empty sections are never written, and the data count section is written
//! exactly when there are data segments. Decoding insists on the same
//! canonical choices, so every module it accepts re-encodes to the same bytes.

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, trace};

use super::{Data, DataMode, Element, ElementMode, Export, ExportIndex, ExternalKind, Function, Global, Import, Module};
use crate::binary::encoding::{
    read_vu32, write_vu32, DATA_ACTIVE, DATA_ACTIVE_EXPLICIT, DATA_PASSIVE, DESC_FUNC, DESC_GLOBAL, DESC_MEMORY,
    DESC_TABLE, ELEMKIND_FUNCREF, ELEM_EXPLICIT_BIT, ELEM_EXPRESSIONS_BIT, ELEM_PASSIVE_BIT, MAGIC, SECTION_CODE,
    SECTION_DATA, SECTION_DATA_COUNT, SECTION_ELEMENT, SECTION_EXPORT, SECTION_FUNCTION, SECTION_GLOBAL, SECTION_IMPORT,
    SECTION_MEMORY, SECTION_START, SECTION_TABLE, SECTION_TYPE, VERSION,
};
use crate::binary::{iso, tagged_union, vec, with_byte_length, Bytes, Codec, CodecError, Name, Reader, TaggedUnion, U32};
use crate::instruction::codec::ExpressionCodec;
use crate::instruction::{Immediate, ResolvedInstruction};
use crate::types::{
    function_type_codec, global_type_codec, memory_type_codec, table_type_codec, GlobalType, RefType, RefTypeCodec,
    ValueType, ValueTypeCodec,
};

/// Wire order of the known sections.
const SECTION_ORDER: [u8; 12] = [
    SECTION_TYPE,
    SECTION_IMPORT,
    SECTION_FUNCTION,
    SECTION_TABLE,
    SECTION_MEMORY,
    SECTION_GLOBAL,
    SECTION_EXPORT,
    SECTION_START,
    SECTION_ELEMENT,
    SECTION_DATA_COUNT,
    SECTION_CODE,
    SECTION_DATA,
];

/// Locals a single function may declare.
const MAX_LOCALS: u64 = 50_000;

fn section_name(id: u8) -> &'static str {
    match id {
        SECTION_TYPE => "type",
        SECTION_IMPORT => "import",
        SECTION_FUNCTION => "function",
        SECTION_TABLE => "table",
        SECTION_MEMORY => "memory",
        SECTION_GLOBAL => "global",
        SECTION_EXPORT => "export",
        SECTION_START => "start",
        SECTION_ELEMENT => "element",
        SECTION_DATA_COUNT => "data count",
        SECTION_CODE => "code",
        SECTION_DATA => "data",
        _ => "unknown",
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// `0x00 typeidx | 0x01 tabletype | 0x02 memtype | 0x03 globaltype`
struct ExternalKindCodec;

impl Codec<ExternalKind> for ExternalKindCodec {
    fn encode(&self, value: &ExternalKind, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        match value {
            ExternalKind::Function(ty) => {
                buf.push(DESC_FUNC);
                U32.encode(ty, buf)
            }
            ExternalKind::Table(ty) => {
                buf.push(DESC_TABLE);
                table_type_codec().encode(ty, buf)
            }
            ExternalKind::Memory(ty) => {
                buf.push(DESC_MEMORY);
                memory_type_codec().encode(ty, buf)
            }
            ExternalKind::Global(ty) => {
                buf.push(DESC_GLOBAL);
                global_type_codec().encode(ty, buf)
            }
        }
    }

    fn decode(&self, reader: &mut Reader<'_>) -> Result<ExternalKind, CodecError> {
        let offset = reader.pos();
        match reader.read_byte()? {
            DESC_FUNC => Ok(ExternalKind::Function(U32.decode(reader)?)),
            DESC_TABLE => Ok(ExternalKind::Table(table_type_codec().decode(reader)?)),
            DESC_MEMORY => Ok(ExternalKind::Memory(memory_type_codec().decode(reader)?)),
            DESC_GLOBAL => Ok(ExternalKind::Global(global_type_codec().decode(reader)?)),
            found => Err(CodecError::InvalidTag { offset, found }),
        }
    }
}

fn import_codec() -> impl Codec<Import> {
    iso(
        (Name, Name, ExternalKindCodec),
        |i: &Import| (i.module.clone(), i.name.clone(), i.kind),
        |(module, name, kind): (String, String, ExternalKind)| Import { module, name, kind },
    )
}

fn export_index_codec() -> TaggedUnion<ExportIndex> {
    fn index(e: &ExportIndex) -> u32 {
        match *e {
            ExportIndex::Function(i) | ExportIndex::Table(i) | ExportIndex::Memory(i) | ExportIndex::Global(i) => i,
        }
    }
    tagged_union(
        vec![
            (
                DESC_FUNC,
                Box::new(iso(U32, index, ExportIndex::Function)) as Box<dyn Codec<ExportIndex>>,
            ),
            (
                DESC_TABLE,
                Box::new(iso(U32, index, ExportIndex::Table)) as Box<dyn Codec<ExportIndex>>,
            ),
            (
                DESC_MEMORY,
                Box::new(iso(U32, index, ExportIndex::Memory)) as Box<dyn Codec<ExportIndex>>,
            ),
            (
                DESC_GLOBAL,
                Box::new(iso(U32, index, ExportIndex::Global)) as Box<dyn Codec<ExportIndex>>,
            ),
        ],
        |e| {
            Some(match e {
                ExportIndex::Function(_) => DESC_FUNC,
                ExportIndex::Table(_) => DESC_TABLE,
                ExportIndex::Memory(_) => DESC_MEMORY,
                ExportIndex::Global(_) => DESC_GLOBAL,
            })
        },
    )
}

fn export_codec() -> impl Codec<Export> {
    iso(
        (Name, export_index_codec()),
        |e: &Export| (e.name.clone(), e.index),
        |(name, index): (String, ExportIndex)| Export { name, index },
    )
}

fn global_codec() -> impl Codec<Global> {
    iso(
        (global_type_codec(), ExpressionCodec),
        |g: &Global| (g.ty, g.init.clone()),
        |(ty, init): (GlobalType, Vec<ResolvedInstruction>)| Global { ty, init },
    )
}

/// Locals as runs of `(count, type)`. Runs are maximal and never empty.
struct LocalsCodec;

impl Codec<Vec<ValueType>> for LocalsCodec {
    fn encode(&self, value: &Vec<ValueType>, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        let mut runs: Vec<(u32, ValueType)> = vec![];
        for ty in value {
            match runs.last_mut() {
                Some((count, last)) if last == ty => *count += 1,
                _ => runs.push((1, *ty)),
            }
        }
        vec((U32, ValueTypeCodec)).encode(&runs, buf)
    }

    fn decode(&self, reader: &mut Reader<'_>) -> Result<Vec<ValueType>, CodecError> {
        let runs = read_vu32(reader)?;
        let mut locals = vec![];
        let mut total = 0u64;
        for _ in 0..runs {
            let offset = reader.pos();
            let count = U32.decode(reader)?;
            let ty = ValueTypeCodec.decode(reader)?;
            if count == 0 || locals.last() == Some(&ty) {
                return Err(CodecError::NonCanonical {
                    offset,
                    what: "local declarations",
                });
            }
            total += u64::from(count);
            if total > MAX_LOCALS {
                return Err(CodecError::TooManyLocals(total));
            }
            locals.extend(std::iter::repeat(ty).take(count as usize));
        }
        Ok(locals)
    }
}

/// One code-section entry. The type index lives in the function section, so
/// it is neither written nor read here.
struct CodeCodec;

impl Codec<Function> for CodeCodec {
    fn encode(&self, value: &Function, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        let mut entry = Vec::new();
        LocalsCodec.encode(&value.locals, &mut entry)?;
        ExpressionCodec.encode(&value.body, &mut entry)?;
        write_vu32(buf, entry.len() as u32);
        buf.extend_from_slice(&entry);
        Ok(())
    }

    fn decode(&self, reader: &mut Reader<'_>) -> Result<Function, CodecError> {
        let (locals, body) = with_byte_length((LocalsCodec, ExpressionCodec)).decode(reader)?;
        Ok(Function {
            type_index: 0,
            locals,
            body,
        })
    }
}

fn element_flags(element: &Element) -> u32 {
    let mut flags = match &element.mode {
        ElementMode::Passive => ELEM_PASSIVE_BIT,
        ElementMode::Declarative => ELEM_PASSIVE_BIT | ELEM_EXPLICIT_BIT,
        ElementMode::Active { table_index, .. } if *table_index != 0 || element.ref_type != RefType::FuncRef => {
            ELEM_EXPLICIT_BIT
        }
        ElementMode::Active { .. } => 0,
    };
    if element.function_indices().is_none() {
        flags |= ELEM_EXPRESSIONS_BIT;
    }
    flags
}

fn ref_func(index: u32) -> Vec<ResolvedInstruction> {
    vec![ResolvedInstruction::new("ref.func", Immediate::U32(index))]
}

/// Element segments in all eight flag forms; the encoder picks the most
/// compact form that can express the segment.
struct ElementCodec;

impl Codec<Element> for ElementCodec {
    fn encode(&self, value: &Element, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        let flags = element_flags(value);
        write_vu32(buf, flags);
        if let ElementMode::Active { table_index, offset } = &value.mode {
            if flags & ELEM_EXPLICIT_BIT != 0 {
                write_vu32(buf, *table_index);
            }
            ExpressionCodec.encode(offset, buf)?;
        }
        let indices = value.function_indices();
        if flags & (ELEM_PASSIVE_BIT | ELEM_EXPLICIT_BIT) != 0 {
            match indices {
                Some(_) => buf.push(ELEMKIND_FUNCREF),
                None => RefTypeCodec.encode(&value.ref_type, buf)?,
            }
        }
        match indices {
            Some(indices) => vec(U32).encode(&indices, buf),
            None => vec(ExpressionCodec).encode(&value.init, buf),
        }
    }

    fn decode(&self, reader: &mut Reader<'_>) -> Result<Element, CodecError> {
        let offset = reader.pos();
        let flags = read_vu32(reader)?;
        if flags > 7 {
            return Err(CodecError::InvalidTag {
                offset,
                found: flags as u8,
            });
        }
        let expressions = flags & ELEM_EXPRESSIONS_BIT != 0;
        let mode = if flags & ELEM_PASSIVE_BIT == 0 {
            let table_index = if flags & ELEM_EXPLICIT_BIT != 0 {
                read_vu32(reader)?
            } else {
                0
            };
            ElementMode::Active {
                table_index,
                offset: ExpressionCodec.decode(reader)?,
            }
        } else if flags & ELEM_EXPLICIT_BIT != 0 {
            ElementMode::Declarative
        } else {
            ElementMode::Passive
        };
        let ref_type = match (flags & (ELEM_PASSIVE_BIT | ELEM_EXPLICIT_BIT) != 0, expressions) {
            (false, _) => RefType::FuncRef,
            (true, true) => RefTypeCodec.decode(reader)?,
            (true, false) => {
                let kind_offset = reader.pos();
                match reader.read_byte()? {
                    ELEMKIND_FUNCREF => RefType::FuncRef,
                    found => {
                        return Err(CodecError::InvalidTag {
                            offset: kind_offset,
                            found,
                        })
                    }
                }
            }
        };
        let init = if expressions {
            vec(ExpressionCodec).decode(reader)?
        } else {
            vec(U32).decode(reader)?.into_iter().map(ref_func).collect()
        };
        let element = Element { ref_type, init, mode };
        if element_flags(&element) != flags {
            return Err(CodecError::NonCanonical {
                offset,
                what: "element segment flags",
            });
        }
        Ok(element)
    }
}

/// `0 expr bytes | 1 bytes | 2 memidx expr bytes`
struct DataCodec;

impl Codec<Data> for DataCodec {
    fn encode(&self, value: &Data, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        match &value.mode {
            DataMode::Passive => write_vu32(buf, DATA_PASSIVE),
            DataMode::Active { memory_index, offset } => {
                if *memory_index == 0 {
                    write_vu32(buf, DATA_ACTIVE);
                } else {
                    write_vu32(buf, DATA_ACTIVE_EXPLICIT);
                    write_vu32(buf, *memory_index);
                }
                ExpressionCodec.encode(offset, buf)?;
            }
        }
        Bytes.encode(&value.init, buf)
    }

    fn decode(&self, reader: &mut Reader<'_>) -> Result<Data, CodecError> {
        let offset = reader.pos();
        let mode = match read_vu32(reader)? {
            DATA_ACTIVE => DataMode::Active {
                memory_index: 0,
                offset: ExpressionCodec.decode(reader)?,
            },
            DATA_PASSIVE => DataMode::Passive,
            DATA_ACTIVE_EXPLICIT => {
                let memory_index = read_vu32(reader)?;
                if memory_index == 0 {
                    return Err(CodecError::NonCanonical {
                        offset,
                        what: "explicit memory index 0",
                    });
                }
                DataMode::Active {
                    memory_index,
                    offset: ExpressionCodec.decode(reader)?,
                }
            }
            found => {
                return Err(CodecError::InvalidTag {
                    offset,
                    found: found as u8,
                })
            }
        };
        Ok(Data {
            init: Bytes.decode(reader)?,
            mode,
        })
    }
}

// ---------------------------------------------------------------------------
// Module
// ---------------------------------------------------------------------------

fn write_section<T, C: Codec<T>>(buf: &mut Vec<u8>, id: u8, codec: C, value: &T) -> Result<(), CodecError> {
    buf.push(id);
    with_byte_length(codec).encode(value, buf)
}

fn write_vec_section<T, C: Codec<T>>(buf: &mut Vec<u8>, id: u8, codec: C, values: &Vec<T>) -> Result<(), CodecError> {
    if values.is_empty() {
        return Ok(());
    }
    write_section(buf, id, vec(codec), values)
}

fn non_empty<T>(values: Vec<T>, offset: usize) -> Result<Vec<T>, CodecError> {
    if values.is_empty() {
        return Err(CodecError::NonCanonical {
            offset,
            what: "empty section",
        });
    }
    Ok(values)
}

/// The whole module: preamble, version and sections.
pub struct ModuleCodec;

impl Codec<Module> for ModuleCodec {
    fn encode(&self, module: &Module, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        buf.extend_from_slice(&MAGIC);
        let mut version = [0u8; 4];
        LittleEndian::write_u32(&mut version, VERSION);
        buf.extend_from_slice(&version);

        write_vec_section(buf, SECTION_TYPE, function_type_codec(), &module.types)?;
        write_vec_section(buf, SECTION_IMPORT, import_codec(), &module.imports)?;
        let type_indices: Vec<u32> = module.functions.iter().map(|f| f.type_index).collect();
        write_vec_section(buf, SECTION_FUNCTION, U32, &type_indices)?;
        write_vec_section(buf, SECTION_TABLE, table_type_codec(), &module.tables)?;
        write_vec_section(buf, SECTION_MEMORY, memory_type_codec(), &module.memories)?;
        write_vec_section(buf, SECTION_GLOBAL, global_codec(), &module.globals)?;
        write_vec_section(buf, SECTION_EXPORT, export_codec(), &module.exports)?;
        if let Some(start) = &module.start {
            write_section(buf, SECTION_START, U32, start)?;
        }
        write_vec_section(buf, SECTION_ELEMENT, ElementCodec, &module.elements)?;
        if !module.datas.is_empty() {
            write_section(buf, SECTION_DATA_COUNT, U32, &(module.datas.len() as u32))?;
        }
        write_vec_section(buf, SECTION_CODE, CodeCodec, &module.functions)?;
        write_vec_section(buf, SECTION_DATA, DataCodec, &module.datas)?;
        Ok(())
    }

    fn decode(&self, reader: &mut Reader<'_>) -> Result<Module, CodecError> {
        let offset = reader.pos();
        if reader.read_bytes(MAGIC.len())? != MAGIC {
            return Err(CodecError::InvalidPreamble { offset });
        }
        let version = LittleEndian::read_u32(reader.read_bytes(4)?);
        if version != VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }

        let mut module = Module::default();
        let mut type_indices = vec![];
        let mut codes = vec![];
        let mut data_count = None;
        let mut last = None;
        while !reader.is_empty() {
            let offset = reader.pos();
            let id = reader.read_byte()?;
            let rank = SECTION_ORDER
                .iter()
                .position(|s| *s == id)
                .ok_or(CodecError::InvalidTag { offset, found: id })?;
            if last.map_or(false, |last| rank <= last) {
                return Err(CodecError::InvalidTag { offset, found: id });
            }
            last = Some(rank);

            let len = read_vu32(reader)? as usize;
            let start = reader.pos();
            let mut sub = reader.sub_reader(len)?;
            debug!("{} section ({}) at {:#x}, {} bytes", section_name(id), id, start, len);
            match id {
                SECTION_TYPE => module.types = non_empty(vec(function_type_codec()).decode(&mut sub)?, start)?,
                SECTION_IMPORT => module.imports = non_empty(vec(import_codec()).decode(&mut sub)?, start)?,
                SECTION_FUNCTION => type_indices = non_empty(vec(U32).decode(&mut sub)?, start)?,
                SECTION_TABLE => module.tables = non_empty(vec(table_type_codec()).decode(&mut sub)?, start)?,
                SECTION_MEMORY => module.memories = non_empty(vec(memory_type_codec()).decode(&mut sub)?, start)?,
                SECTION_GLOBAL => module.globals = non_empty(vec(global_codec()).decode(&mut sub)?, start)?,
                SECTION_EXPORT => module.exports = non_empty(vec(export_codec()).decode(&mut sub)?, start)?,
                SECTION_START => module.start = Some(U32.decode(&mut sub)?),
                SECTION_ELEMENT => module.elements = non_empty(vec(ElementCodec).decode(&mut sub)?, start)?,
                SECTION_DATA_COUNT => data_count = Some((U32.decode(&mut sub)?, start)),
                SECTION_CODE => codes = non_empty(vec(CodeCodec).decode(&mut sub)?, start)?,
                _ => module.datas = non_empty(vec(DataCodec).decode(&mut sub)?, start)?,
            }
            if !sub.is_empty() {
                return Err(CodecError::LengthMismatch {
                    offset: start,
                    expected: len,
                    actual: sub.pos() - start,
                });
            }
        }

        if type_indices.len() != codes.len() {
            return Err(CodecError::FunctionCodeMismatch {
                functions: type_indices.len(),
                codes: codes.len(),
            });
        }
        module.functions = codes
            .into_iter()
            .zip(type_indices)
            .map(|(code, type_index)| Function { type_index, ..code })
            .collect();

        match data_count {
            Some((declared, _)) if declared as usize != module.datas.len() => {
                return Err(CodecError::DataCountMismatch {
                    declared,
                    actual: module.datas.len(),
                })
            }
            Some((_, offset)) if module.datas.is_empty() => {
                return Err(CodecError::NonCanonical {
                    offset,
                    what: "data count without data segments",
                })
            }
            None if !module.datas.is_empty() => {
                return Err(CodecError::NonCanonical {
                    offset: reader.pos(),
                    what: "data segments without data count",
                })
            }
            _ => {}
        }
        validate(&module)?;
        trace!("decoded {}", module);
        Ok(module)
    }
}

fn validate(module: &Module) -> Result<(), CodecError> {
    let n_types = module.types.len();
    let imported_types = module.imports.iter().filter_map(|i| match i.kind {
        ExternalKind::Function(ty) => Some(ty),
        _ => None,
    });
    for ty in imported_types.chain(module.functions.iter().map(|f| f.type_index)) {
        if ty as usize >= n_types {
            return Err(CodecError::TypeIndexOutOfRange(ty));
        }
    }
    let memories = module.memories.len()
        + module
            .imports
            .iter()
            .filter(|i| matches!(i.kind, ExternalKind::Memory(_)))
            .count();
    if memories > 1 {
        return Err(CodecError::MultipleMemories(memories));
    }
    Ok(())
}
