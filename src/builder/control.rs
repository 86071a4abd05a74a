//! Structured control, branches, calls and the parametric instructions.

use super::operands::Operand;
use super::{
    format_stack, innermost, observed_effect, single, BuildContext, BuildError, FrameKind, Label, MaybeValue, StackVar,
    Target,
};
use crate::dependency::{Instruction, NodeId, Pending, PendingBlockType};
use crate::instruction::{BlockType, Immediate};
use crate::types::{FunctionType, RefType, ValueType};
use MaybeValue::{Unknown, Val};

impl<'g> BuildContext<'g> {
    /// `[] -> []` and `[] -> [t]` are written inline; any other signature
    /// needs a type node.
    fn block_type(&mut self, ty: &FunctionType) -> (PendingBlockType, Vec<NodeId>) {
        match (ty.params.as_slice(), ty.results.as_slice()) {
            ([], []) => (PendingBlockType::Inline(BlockType::Empty), vec![]),
            ([], [t]) => (PendingBlockType::Inline(BlockType::Value(*t)), vec![]),
            _ => {
                let node = self.graph.func_type(ty.clone());
                (PendingBlockType::TypeNode, vec![node])
            }
        }
    }

    fn structured<F>(&mut self, name: &'static str, kind: FrameKind, ty: FunctionType, build: F) -> Result<Vec<StackVar>, BuildError>
    where
        F: FnOnce(&mut BuildContext<'g>, Label) -> Result<(), BuildError>,
    {
        self.atomically(|ctx| {
            let body = ctx.build_frame(kind, &ty, build)?;
            let (block_type, deps) = ctx.block_type(&ty);
            ctx.push_instruction(Instruction {
                name,
                ty,
                deps,
                args: Pending::Block { block_type, body },
            })
        })
    }

    /// `block`: `build` fills the body; branches to its label exit the block.
    pub fn block<F>(&mut self, ty: FunctionType, build: F) -> Result<Vec<StackVar>, BuildError>
    where
        F: FnOnce(&mut BuildContext<'g>, Label) -> Result<(), BuildError>,
    {
        self.structured("block", FrameKind::Block, ty, build)
    }

    /// `loop`: branches to its label jump back to the start.
    pub fn loop_<F>(&mut self, ty: FunctionType, build: F) -> Result<Vec<StackVar>, BuildError>
    where
        F: FnOnce(&mut BuildContext<'g>, Label) -> Result<(), BuildError>,
    {
        self.structured("loop", FrameKind::Loop, ty, build)
    }

    /// One-armed `if`, consuming an `i32` condition from the stack. Without an
    /// else branch the block must leave the stack as it found it.
    pub fn if_<F>(&mut self, ty: FunctionType, then: F) -> Result<Vec<StackVar>, BuildError>
    where
        F: FnOnce(&mut BuildContext<'g>, Label) -> Result<(), BuildError>,
    {
        if ty.params != ty.results {
            return Err(BuildError::IfWithoutElse(ty.to_string()));
        }
        self.atomically(|ctx| {
            let then = ctx.build_frame(FrameKind::If, &ty, then)?;
            ctx.push_if(ty, then, None)
        })
    }

    pub fn if_else<F, G>(&mut self, ty: FunctionType, then: F, else_: G) -> Result<Vec<StackVar>, BuildError>
    where
        F: FnOnce(&mut BuildContext<'g>, Label) -> Result<(), BuildError>,
        G: FnOnce(&mut BuildContext<'g>, Label) -> Result<(), BuildError>,
    {
        self.atomically(|ctx| {
            let then = ctx.build_frame(FrameKind::If, &ty, then)?;
            let else_ = ctx.build_frame(FrameKind::Else, &ty, else_)?;
            ctx.push_if(ty, then, Some(else_))
        })
    }

    fn push_if(&mut self, ty: FunctionType, then: Vec<Instruction>, else_: Option<Vec<Instruction>>) -> Result<Vec<StackVar>, BuildError> {
        let (block_type, deps) = self.block_type(&ty);
        let mut params = ty.params;
        params.push(ValueType::I32);
        self.push_instruction(Instruction {
            name: "if",
            ty: FunctionType {
                params,
                results: ty.results,
            },
            deps,
            args: Pending::If {
                block_type,
                then,
                else_,
            },
        })
    }

    pub fn br(&mut self, target: impl Into<Target>) -> Result<(), BuildError> {
        let (depth, frame) = self.resolve_target(target.into())?;
        let types = frame.label_types().to_vec();
        let frame = innermost(&mut self.frames)?;
        frame.pop_expecteds(&types, &mut self.next_id)?;
        frame.set_unreachable();
        self.append_instruction(Instruction::simple(
            "br",
            FunctionType::new(&types, &[]),
            Immediate::U32(depth),
        ))
    }

    /// Conditional branch; the label's values stay on the stack when the
    /// branch is not taken.
    pub fn br_if(&mut self, target: impl Into<Target>, args: &[Operand]) -> Result<Vec<StackVar>, BuildError> {
        let (depth, frame) = self.resolve_target(target.into())?;
        let types = frame.label_types().to_vec();
        let mut params = types.clone();
        params.push(ValueType::I32);
        self.stack_args("br_if", &params, args)?;
        self.push_instruction(Instruction::simple(
            "br_if",
            FunctionType::new(&params, &types),
            Immediate::U32(depth),
        ))
    }

    /// Every target must carry the same number of values as `default`.
    pub fn br_table(&mut self, targets: &[Target], default: impl Into<Target>, args: &[Operand]) -> Result<(), BuildError> {
        let (default, default_frame) = self.resolve_target(default.into())?;
        let types = default_frame.label_types().to_vec();
        let mut params = types.clone();
        params.push(ValueType::I32);
        self.stack_args("br_table", &params, args)?;

        let mut labels = Vec::with_capacity(targets.len());
        let mut arities = Vec::with_capacity(targets.len());
        for target in targets {
            let (depth, frame) = self.resolve_target(*target)?;
            if frame.label_types().len() != types.len() {
                return Err(BuildError::InconsistentBrTable);
            }
            labels.push(depth);
            arities.push(frame.label_types().to_vec());
        }

        let frame = innermost(&mut self.frames)?;
        frame.pop_expected(ValueType::I32, &mut self.next_id)?;
        for label_types in &arities {
            let popped = frame.pop_expecteds(label_types, &mut self.next_id)?;
            frame.stack.extend(popped);
        }
        frame.pop_expecteds(&types, &mut self.next_id)?;
        frame.set_unreachable();
        self.append_instruction(Instruction::simple(
            "br_table",
            FunctionType::new(&params, &[]),
            Immediate::BrTable { labels, default },
        ))
    }

    pub fn return_(&mut self, args: &[Operand]) -> Result<(), BuildError> {
        let types = self.return_types.clone();
        self.stack_args("return", &types, args)?;
        let frame = innermost(&mut self.frames)?;
        frame.pop_expecteds(&types, &mut self.next_id)?;
        frame.set_unreachable();
        self.append_instruction(Instruction::simple(
            "return",
            FunctionType::new(&types, &[]),
            Immediate::None,
        ))
    }

    pub fn unreachable(&mut self) -> Result<(), BuildError> {
        self.set_unreachable()?;
        self.append_instruction(Instruction::simple("unreachable", FunctionType::default(), Immediate::None))
    }

    pub fn nop(&mut self) -> Result<(), BuildError> {
        self.push_instruction(Instruction::simple("nop", FunctionType::default(), Immediate::None))?;
        Ok(())
    }

    pub fn call(&mut self, func: NodeId, args: &[Operand]) -> Result<Vec<StackVar>, BuildError> {
        let ty = self.graph.function_type(func)?.clone();
        self.stack_args("call", &ty.params, args)?;
        self.push_instruction(Instruction {
            name: "call",
            ty,
            deps: vec![func],
            args: Pending::DepIndex,
        })
    }

    /// Calls through `table` with the callee index on top of the arguments.
    pub fn call_indirect(&mut self, table: NodeId, ty: FunctionType, args: &[Operand]) -> Result<Vec<StackVar>, BuildError> {
        let element = self.graph.table_type(table)?.element;
        if element != RefType::FuncRef {
            return Err(BuildError::TypeMismatch {
                expected: RefType::FuncRef.to_string(),
                actual: element.to_string(),
            });
        }
        let mut params = ty.params.clone();
        params.push(ValueType::I32);
        self.stack_args("call_indirect", &params, args)?;
        let type_node = self.graph.func_type(ty.clone());
        self.push_instruction(Instruction {
            name: "call_indirect",
            ty: FunctionType {
                params,
                results: ty.results,
            },
            deps: vec![type_node, table],
            args: Pending::DepIndexPair,
        })
    }

    /// Drops the top value, whatever its type.
    pub fn drop(&mut self, args: &[Operand]) -> Result<(), BuildError> {
        match args {
            [] => {}
            [Operand::Stack(_)] => self.check_token_order(args)?,
            _ => return Err(BuildError::WrongHelper("drop".to_string())),
        }
        let frame = innermost(&mut self.frames)?;
        let popped = frame.pop_any(&mut self.next_id)?;
        self.append_instruction(Instruction::simple(
            "drop",
            observed_effect(&[popped.ty], &[]),
            Immediate::None,
        ))
    }

    /// Untyped `select`: both values must be numbers, or both vectors, of
    /// the same type; an `unknown` operand takes the other's type. The
    /// condition may be given inline.
    pub fn select(&mut self, args: &[Operand]) -> Result<StackVar, BuildError> {
        match args {
            [] => {}
            [Operand::Stack(_), Operand::Stack(_), cond] => {
                self.check_token_order(args)?;
                if !matches!(cond, Operand::Stack(_)) {
                    let instr = self.materialize(*cond, ValueType::I32)?;
                    self.push_instruction(instr)?;
                }
            }
            _ => return Err(BuildError::WrongHelper("select".to_string())),
        }

        let frame = innermost(&mut self.frames)?;
        frame.pop_expected(ValueType::I32, &mut self.next_id)?;
        let t2 = frame.pop_any(&mut self.next_id)?.ty;
        let t1 = frame.pop_any(&mut self.next_id)?.ty;
        if !(t1.is_num() && t2.is_num() || t1.is_vec() && t2.is_vec()) {
            return Err(BuildError::InvalidSelect(format_stack(&[t1, t2])));
        }
        let ty = match (t1, t2) {
            (Val(a), Val(b)) if a == b => a,
            (Val(a), Unknown) | (Unknown, Val(a)) => a,
            (Unknown, Unknown) => return Err(BuildError::AmbiguousSelect),
            _ => return Err(BuildError::InvalidSelect(format_stack(&[t1, t2]))),
        };
        let results = frame.push_vals(&[ty], &mut self.next_id);
        self.append_instruction(Instruction::simple(
            "select",
            FunctionType::new(&[ty, ty, ValueType::I32], &[ty]),
            Immediate::None,
        ))?;
        single("select", results)
    }

    /// `select` with an explicit result type, required for reference types.
    pub fn select_t(&mut self, ty: ValueType, args: &[Operand]) -> Result<StackVar, BuildError> {
        let params = [ty, ty, ValueType::I32];
        self.stack_args("select", &params, args)?;
        let results = self.push_instruction(Instruction::simple(
            "select_t",
            FunctionType::new(&params, &[ty]),
            Immediate::ValueTypes(vec![ty]),
        ))?;
        single("select", results)
    }
}
