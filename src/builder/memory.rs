//! Memory, table and reference instructions.

use super::operands::Operand;
use super::{innermost, observed_effect, single, BuildContext, BuildError, StackVar};
use crate::dependency::{Instruction, NodeId, Pending};
use crate::instruction::{by_name, Immediate, ImmediateKind, MemArg, StackEffect};
use crate::types::{FunctionType, RefType, ValueType};

/// Offset and alignment of a load or store. `align` is a log2 exponent;
/// `None` stands for the natural alignment of the access.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Default)]
pub struct MemAccess {
    pub offset: u32,
    pub align: Option<u32>,
}

impl MemAccess {
    pub fn offset(offset: u32) -> MemAccess {
        MemAccess { offset, align: None }
    }
}

impl<'g> BuildContext<'g> {
    fn mem_access(&mut self, name: &str, access: MemAccess, args: &[Operand]) -> Result<Vec<StackVar>, BuildError> {
        let spec = by_name(name).ok_or_else(|| BuildError::UnknownInstruction(name.to_string()))?;
        let (natural, params, results) = match (spec.immediate, spec.stack) {
            (ImmediateKind::MemArg { natural }, StackEffect::Fixed { params, results }) => (natural, params, results),
            _ => return Err(BuildError::WrongHelper(name.to_string())),
        };
        let align = access.align.unwrap_or(natural);
        if align > natural {
            return Err(BuildError::InvalidAlignment {
                name: spec.name.to_string(),
                align,
                natural,
            });
        }
        self.stack_args(spec.name, params, args)?;
        self.push_instruction(Instruction {
            name: spec.name,
            ty: FunctionType::new(params, results),
            deps: vec![self.graph.has_memory()],
            args: Pending::Ready(Immediate::MemArg(MemArg {
                align,
                offset: access.offset,
            })),
        })
    }

    /// Any `*.load*` instruction, e.g. `i64.load32_u`.
    pub fn load(&mut self, name: &str, access: MemAccess, args: &[Operand]) -> Result<StackVar, BuildError> {
        single(name, self.mem_access(name, access, args)?)
    }

    /// Any `*.store*` instruction; `args` are the address and the value.
    pub fn store(&mut self, name: &str, access: MemAccess, args: &[Operand]) -> Result<(), BuildError> {
        if !name.contains(".store") {
            return Err(BuildError::WrongHelper(name.to_string()));
        }
        self.mem_access(name, access, args)?;
        Ok(())
    }

    fn memory_op(
        &mut self,
        name: &'static str,
        params: &[ValueType],
        results: &[ValueType],
        immediate: Immediate,
        args: &[Operand],
    ) -> Result<Vec<StackVar>, BuildError> {
        self.stack_args(name, params, args)?;
        self.push_instruction(Instruction {
            name,
            ty: FunctionType::new(params, results),
            deps: vec![self.graph.has_memory()],
            args: Pending::Ready(immediate),
        })
    }

    /// Current memory size in pages.
    pub fn memory_size(&mut self) -> Result<StackVar, BuildError> {
        let results = self.memory_op("memory.size", &[], &[ValueType::I32], Immediate::U32(0), &[])?;
        single("memory.size", results)
    }

    /// Grows memory by the given number of pages, yielding the old size or -1.
    pub fn memory_grow(&mut self, args: &[Operand]) -> Result<StackVar, BuildError> {
        let results = self.memory_op(
            "memory.grow",
            &[ValueType::I32],
            &[ValueType::I32],
            Immediate::U32(0),
            args,
        )?;
        single("memory.grow", results)
    }

    /// `args`: destination, byte value, length.
    pub fn memory_fill(&mut self, args: &[Operand]) -> Result<(), BuildError> {
        self.memory_op("memory.fill", &[ValueType::I32; 3], &[], Immediate::U32(0), args)?;
        Ok(())
    }

    /// `args`: destination, source, length.
    pub fn memory_copy(&mut self, args: &[Operand]) -> Result<(), BuildError> {
        self.memory_op("memory.copy", &[ValueType::I32; 3], &[], Immediate::U32Pair(0, 0), args)?;
        Ok(())
    }

    /// Copies from a passive data segment. `args`: destination, source
    /// offset within the segment, length.
    pub fn memory_init(&mut self, data: NodeId, args: &[Operand]) -> Result<(), BuildError> {
        self.graph.expect_data(data)?;
        let params = [ValueType::I32; 3];
        self.stack_args("memory.init", &params, args)?;
        self.push_instruction(Instruction {
            name: "memory.init",
            ty: FunctionType::new(&params, &[]),
            deps: vec![data, self.graph.has_memory()],
            args: Pending::DepIndexWith(0),
        })?;
        Ok(())
    }

    pub fn data_drop(&mut self, data: NodeId) -> Result<(), BuildError> {
        self.graph.expect_data(data)?;
        self.push_instruction(Instruction {
            name: "data.drop",
            ty: FunctionType::default(),
            deps: vec![data],
            args: Pending::DepIndex,
        })?;
        Ok(())
    }

    fn table_op(
        &mut self,
        name: &'static str,
        table: NodeId,
        params: &[ValueType],
        results: &[ValueType],
        args: &[Operand],
    ) -> Result<Vec<StackVar>, BuildError> {
        self.stack_args(name, params, args)?;
        self.push_instruction(Instruction {
            name,
            ty: FunctionType::new(params, results),
            deps: vec![table],
            args: Pending::DepIndex,
        })
    }

    fn element(&self, table: NodeId) -> Result<ValueType, BuildError> {
        Ok(self.graph.table_type(table)?.element.into())
    }

    /// `args`: index.
    pub fn table_get(&mut self, table: NodeId, args: &[Operand]) -> Result<StackVar, BuildError> {
        let t = self.element(table)?;
        single("table.get", self.table_op("table.get", table, &[ValueType::I32], &[t], args)?)
    }

    /// `args`: index, reference.
    pub fn table_set(&mut self, table: NodeId, args: &[Operand]) -> Result<(), BuildError> {
        let t = self.element(table)?;
        self.table_op("table.set", table, &[ValueType::I32, t], &[], args)?;
        Ok(())
    }

    pub fn table_size(&mut self, table: NodeId) -> Result<StackVar, BuildError> {
        self.element(table)?;
        single("table.size", self.table_op("table.size", table, &[], &[ValueType::I32], &[])?)
    }

    /// `args`: initial reference, number of entries to add.
    pub fn table_grow(&mut self, table: NodeId, args: &[Operand]) -> Result<StackVar, BuildError> {
        let t = self.element(table)?;
        single(
            "table.grow",
            self.table_op("table.grow", table, &[t, ValueType::I32], &[ValueType::I32], args)?,
        )
    }

    /// `args`: start index, reference, length.
    pub fn table_fill(&mut self, table: NodeId, args: &[Operand]) -> Result<(), BuildError> {
        let t = self.element(table)?;
        self.table_op("table.fill", table, &[ValueType::I32, t, ValueType::I32], &[], args)?;
        Ok(())
    }

    /// `args`: destination index, source index, length.
    pub fn table_copy(&mut self, dst: NodeId, src: NodeId, args: &[Operand]) -> Result<(), BuildError> {
        let (to, from) = (self.element(dst)?, self.element(src)?);
        if to != from {
            return Err(BuildError::TypeMismatch {
                expected: to.to_string(),
                actual: from.to_string(),
            });
        }
        let params = [ValueType::I32; 3];
        self.stack_args("table.copy", &params, args)?;
        self.push_instruction(Instruction {
            name: "table.copy",
            ty: FunctionType::new(&params, &[]),
            deps: vec![dst, src],
            args: Pending::DepIndexPair,
        })?;
        Ok(())
    }

    /// Copies from an element segment. `args`: destination, source offset
    /// within the segment, length.
    pub fn table_init(&mut self, table: NodeId, elem: NodeId, args: &[Operand]) -> Result<(), BuildError> {
        let element = self.graph.table_type(table)?.element;
        let ty = self.graph.elem_type(elem)?;
        if element != ty {
            return Err(BuildError::TypeMismatch {
                expected: element.to_string(),
                actual: ty.to_string(),
            });
        }
        let params = [ValueType::I32; 3];
        self.stack_args("table.init", &params, args)?;
        self.push_instruction(Instruction {
            name: "table.init",
            ty: FunctionType::new(&params, &[]),
            deps: vec![elem, table],
            args: Pending::DepIndexPair,
        })?;
        Ok(())
    }

    pub fn elem_drop(&mut self, elem: NodeId) -> Result<(), BuildError> {
        self.graph.elem_type(elem)?;
        self.push_instruction(Instruction {
            name: "elem.drop",
            ty: FunctionType::default(),
            deps: vec![elem],
            args: Pending::DepIndex,
        })?;
        Ok(())
    }

    pub fn ref_null(&mut self, ty: RefType) -> Result<StackVar, BuildError> {
        let results = self.push_instruction(Instruction::simple(
            "ref.null",
            FunctionType::new(&[], &[ty.into()]),
            Immediate::RefType(ty),
        ))?;
        single("ref.null", results)
    }

    /// Tests the reference on top of the stack.
    pub fn ref_is_null(&mut self, args: &[Operand]) -> Result<StackVar, BuildError> {
        match args {
            [] => {}
            [Operand::Stack(_)] => self.check_token_order(args)?,
            _ => return Err(BuildError::WrongHelper("ref.is_null".to_string())),
        }
        let frame = innermost(&mut self.frames)?;
        let popped = frame.pop_any(&mut self.next_id)?;
        if !popped.ty.is_ref() {
            return Err(BuildError::TypeMismatch {
                expected: "a reference".to_string(),
                actual: popped.ty.to_string(),
            });
        }
        let results = frame.push_vals(&[ValueType::I32], &mut self.next_id);
        self.append_instruction(Instruction::simple(
            "ref.is_null",
            observed_effect(&[popped.ty], &[ValueType::I32]),
            Immediate::None,
        ))?;
        single("ref.is_null", results)
    }

    /// A reference to `func`. The function is also marked as referenced, so
    /// the module declares it.
    pub fn ref_func(&mut self, func: NodeId) -> Result<StackVar, BuildError> {
        let marker = self.graph.has_ref_to(func)?;
        let results = self.push_instruction(Instruction {
            name: "ref.func",
            ty: FunctionType::new(&[], &[ValueType::FuncRef]),
            deps: vec![func, marker],
            args: Pending::DepIndex,
        })?;
        single("ref.func", results)
    }
}
