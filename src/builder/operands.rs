//! Inline operands and the variable instructions.
//!
//! Helpers take their inputs as a slice of [`Operand`]s. An empty slice means
//! "already on the stack"; otherwise there is one operand per parameter, and
//! constants, locals and globals among them are materialised as
//! `*.const`/`local.get`/`global.get`. When such an operand has to sit below a
//! value that is already on the stack, the instruction producing it is
//! inserted retroactively into the body at the right position.

use log::trace;

use super::{fresh, format_stack, innermost, single, BuildContext, BuildError, Local, MaybeValue, StackVar};
use crate::dependency::{Instruction, NodeId, Pending};
use crate::instruction::Immediate;
use crate::types::{FunctionType, ValueType};

#[derive(PartialEq, Clone, Copy, Debug)]
pub enum Const {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl Const {
    pub fn ty(self) -> ValueType {
        match self {
            Const::I32(_) => ValueType::I32,
            Const::I64(_) => ValueType::I64,
            Const::F32(_) => ValueType::F32,
            Const::F64(_) => ValueType::F64,
        }
    }
}

#[derive(PartialEq, Clone, Copy, Debug)]
pub enum Operand {
    Stack(StackVar),
    Local(Local),
    Global(NodeId),
    Const(Const),
}

impl From<StackVar> for Operand {
    fn from(var: StackVar) -> Operand {
        Operand::Stack(var)
    }
}

impl From<Local> for Operand {
    fn from(local: Local) -> Operand {
        Operand::Local(local)
    }
}

impl From<NodeId> for Operand {
    fn from(global: NodeId) -> Operand {
        Operand::Global(global)
    }
}

impl From<i32> for Operand {
    fn from(v: i32) -> Operand {
        Operand::Const(Const::I32(v))
    }
}

impl From<i64> for Operand {
    fn from(v: i64) -> Operand {
        Operand::Const(Const::I64(v))
    }
}

impl From<f32> for Operand {
    fn from(v: f32) -> Operand {
        Operand::Const(Const::F32(v))
    }
}

impl From<f64> for Operand {
    fn from(v: f64) -> Operand {
        Operand::Const(Const::F64(v))
    }
}

fn mismatch(expected: ValueType, actual: impl ToString) -> BuildError {
    BuildError::TypeMismatch {
        expected: expected.to_string(),
        actual: actual.to_string(),
    }
}

impl<'g> BuildContext<'g> {
    /// Turns a non-stack operand into the instruction that loads it.
    pub(super) fn materialize(&self, operand: Operand, ty: ValueType) -> Result<Instruction, BuildError> {
        let load = FunctionType::new(&[], &[ty]);
        match operand {
            Operand::Local(local) => {
                let actual = self.local(local)?;
                if actual != ty {
                    return Err(mismatch(ty, actual));
                }
                Ok(Instruction::simple("local.get", load, Immediate::U32(local.index)))
            }
            Operand::Global(global) => {
                let actual = self.graph.global_type(global)?.value;
                if actual != ty {
                    return Err(mismatch(ty, actual));
                }
                Ok(Instruction {
                    name: "global.get",
                    ty: load,
                    deps: vec![global],
                    args: Pending::DepIndex,
                })
            }
            Operand::Const(c) => {
                if c.ty() != ty {
                    return Err(mismatch(ty, c.ty()));
                }
                let (name, immediate) = match c {
                    Const::I32(v) => ("i32.const", Immediate::I32(v)),
                    Const::I64(v) => ("i64.const", Immediate::I64(v)),
                    Const::F32(v) => ("f32.const", Immediate::F32(v)),
                    Const::F64(v) => ("f64.const", Immediate::F64(v)),
                };
                Ok(Instruction::simple(name, load, immediate))
            }
            Operand::Stack(var) => Err(mismatch(ty, var.ty)),
        }
    }

    /// Puts the operands of an instruction with parameters `expected` onto the
    /// stack, so that the instruction itself can then pop them.
    pub(crate) fn stack_args(&mut self, name: &str, expected: &[ValueType], args: &[Operand]) -> Result<(), BuildError> {
        if args.is_empty() {
            return Ok(());
        }
        let n = expected.len();
        if args.len() != n {
            return Err(BuildError::ArgumentCount {
                name: name.to_string(),
                expected: n,
                actual: args.len(),
            });
        }

        self.check_token_order(args)?;

        // a stack token after a materialised operand forces insertion
        let mut had_new = false;
        let mut must_reorder = false;
        for arg in args {
            match arg {
                Operand::Stack(_) if had_new => must_reorder = true,
                Operand::Stack(_) => {}
                _ => had_new = true,
            }
        }

        // every operand is checked before the frame is touched
        let producers = args
            .iter()
            .zip(expected)
            .map(|(&arg, &ty)| match arg {
                Operand::Stack(var) if var.ty.matches(ty) => Ok(None),
                Operand::Stack(var) => Err(mismatch(ty, var.ty)),
                _ => self.materialize(arg, ty).map(Some),
            })
            .collect::<Result<Vec<Option<Instruction>>, BuildError>>()?;

        if !must_reorder {
            for instr in producers.into_iter().flatten() {
                self.push_instruction(instr)?;
            }
            return Ok(());
        }

        // last operand first, so the enumeration index is the position from
        // the top of the stack
        let frame = innermost(&mut self.frames)?;
        let saved = (frame.stack.clone(), frame.body.clone(), self.deps.len());
        for (position, instr) in producers.into_iter().rev().enumerate() {
            let instr = match instr {
                Some(instr) => instr,
                None => continue,
            };
            if let Err(err) = self.insert_instruction(position, instr) {
                let (stack, body, deps) = saved;
                let frame = innermost(&mut self.frames)?;
                frame.stack = stack;
                frame.body = body;
                self.deps.truncate(deps);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Stack tokens among `args` must be the topmost stack entries, in
    /// argument order.
    pub(super) fn check_token_order(&self, args: &[Operand]) -> Result<(), BuildError> {
        let stack = self.stack();
        let tokens: Vec<StackVar> = args
            .iter()
            .filter_map(|arg| match arg {
                Operand::Stack(var) => Some(*var),
                _ => None,
            })
            .collect();
        let k = tokens.len();
        for (j, var) in tokens.iter().enumerate() {
            let at = (stack.len() + j).checked_sub(k).and_then(|p| stack.get(p));
            match at {
                Some(top) if top.id == var.id => {}
                None if self.is_unreachable() => {}
                _ => return Err(BuildError::StackTokenOrder),
            }
        }
        Ok(())
    }

    /// Inserts a producer of one value into the body so that its result ends
    /// up at `position` from the top of the current stack (0 = on top).
    ///
    /// Instructions are unapplied from the end of the body until the slot is
    /// exposed, then `instr` and the unwound instructions are re-applied.
    /// Tokens already handed out keep their identity.
    pub(crate) fn insert_instruction(&mut self, position: usize, instr: Instruction) -> Result<StackVar, BuildError> {
        let next_id = &mut self.next_id;
        let frame = innermost(&mut self.frames)?;
        let blocked = |frame: &super::ControlFrame| BuildError::InsertionUnreachable {
            position,
            stack: format_stack(&frame.stack_types()),
        };
        if frame.unreachable || frame.stack.len() < position {
            return Err(blocked(frame));
        }

        let mut stack = frame.stack.clone();
        let target = if position == stack.len() {
            None
        } else {
            Some(stack[stack.len() - position - 1].id)
        };
        // results taken off by each unapplied instruction, last instruction first
        let mut saved: Vec<Vec<StackVar>> = vec![];
        loop {
            let exposed = match target {
                None => stack.is_empty(),
                Some(id) => stack.last().map(|v| v.id) == Some(id),
            };
            if exposed {
                break;
            }
            let undo = match frame.body.len().checked_sub(saved.len() + 1) {
                Some(index) => &frame.body[index],
                None => return Err(blocked(frame)),
            };
            let n_results = undo.ty.results.len();
            if stack.len() < n_results {
                return Err(blocked(frame));
            }
            saved.push(stack.split_off(stack.len() - n_results));
            for ty in &undo.ty.params {
                stack.push(fresh(next_id, MaybeValue::Val(*ty)));
            }
            if let Some(id) = target {
                if !stack.iter().any(|v| v.id == id) {
                    return Err(blocked(frame));
                }
            }
        }
        trace!(
            "inserting {} below {} stack entries, rewinding {} instructions",
            instr.name,
            position,
            saved.len()
        );

        let ty = instr.ty.results.first().map_or(MaybeValue::Unknown, |t| MaybeValue::Val(*t));
        let var = fresh(next_id, ty);
        stack.push(var);
        let at = frame.body.len() - saved.len();
        for (offset, results) in saved.into_iter().rev().enumerate() {
            let n_params = frame.body[at + offset].ty.params.len();
            stack.truncate(stack.len() - n_params);
            stack.extend(results);
        }
        frame.stack = stack;
        for dep in &instr.deps {
            self.deps.insert(*dep);
        }
        frame.body.insert(at, instr);
        Ok(var)
    }

    pub fn local_get(&mut self, local: Local) -> Result<StackVar, BuildError> {
        let ty = self.local(local)?;
        let instr = self.materialize(Operand::Local(local), ty)?;
        single("local.get", self.push_instruction(instr)?)
    }

    pub fn local_set(&mut self, local: Local, args: &[Operand]) -> Result<(), BuildError> {
        let ty = self.local(local)?;
        self.stack_args("local.set", &[ty], args)?;
        self.push_instruction(Instruction::simple(
            "local.set",
            FunctionType::new(&[ty], &[]),
            Immediate::U32(local.index),
        ))?;
        Ok(())
    }

    pub fn local_tee(&mut self, local: Local, args: &[Operand]) -> Result<StackVar, BuildError> {
        let ty = self.local(local)?;
        self.stack_args("local.tee", &[ty], args)?;
        let results = self.push_instruction(Instruction::simple(
            "local.tee",
            FunctionType::new(&[ty], &[ty]),
            Immediate::U32(local.index),
        ))?;
        single("local.tee", results)
    }

    pub fn global_get(&mut self, global: NodeId) -> Result<StackVar, BuildError> {
        let ty = self.graph.global_type(global)?.value;
        let instr = self.materialize(Operand::Global(global), ty)?;
        single("global.get", self.push_instruction(instr)?)
    }

    pub fn global_set(&mut self, global: NodeId, args: &[Operand]) -> Result<(), BuildError> {
        let ty = self.graph.global_type(global)?;
        if !ty.mutable {
            return Err(BuildError::ImmutableGlobal);
        }
        self.stack_args("global.set", &[ty.value], args)?;
        self.push_instruction(Instruction {
            name: "global.set",
            ty: FunctionType::new(&[ty.value], &[]),
            deps: vec![global],
            args: Pending::DepIndex,
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::FuncDecl;
    use crate::dependency::{ConstExpr, Graph, ImportPath, NodeKind};
    use crate::types::ValueType::*;

    fn body(graph: &Graph, func: NodeId) -> Vec<String> {
        match &graph.get(func).unwrap().kind {
            NodeKind::Function(f) => f
                .body
                .iter()
                .map(|i| match &i.args {
                    Pending::Ready(Immediate::I32(v)) => format!("{} {}", i.name, v),
                    Pending::Ready(Immediate::U32(v)) => format!("{} {}", i.name, v),
                    _ => i.name.to_string(),
                })
                .collect(),
            _ => panic!("not a function"),
        }
    }

    fn frame_state(ctx: &BuildContext) -> (Vec<StackVar>, Vec<&'static str>, Vec<NodeId>) {
        let body = ctx.frames.last().map(|f| f.body.iter().map(|i| i.name).collect()).unwrap_or_default();
        (ctx.stack().to_vec(), body, ctx.deps.iter().collect())
    }

    #[test]
    fn constant_is_inserted_below_stack_token() {
        let mut graph = Graph::new();
        let func = graph
            .func(FuncDecl::new(&[I32], &[I32]), |ctx, params, _| {
                let x = ctx.op("i32.mul", &[params[0].into(), 2i32.into()])?;
                ctx.op("i32.sub", &[10i32.into(), x.into()])?;
                Ok(())
            })
            .unwrap();
        assert_eq!(
            body(&graph, func),
            vec!["i32.const 10", "local.get 0", "i32.const 2", "i32.mul", "i32.sub"]
        );
    }

    #[test]
    fn out_of_order_tokens_are_rejected() {
        let mut graph = Graph::new();
        graph
            .func(FuncDecl::new(&[I32, I32], &[I32]), |ctx, params, _| {
                let a = ctx.local_get(params[0])?;
                let b = ctx.local_get(params[1])?;
                let c = ctx.op("i32.add", &[a.into(), b.into()])?;
                let d = ctx.i32_const(5)?;
                // 7 has to go below both c and d
                let s = ctx.op("i32.add", &[7i32.into(), c.into()]);
                assert_eq!(s, Err(BuildError::StackTokenOrder));
                let e = ctx.op("i32.add", &[c.into(), d.into()])?;
                assert_eq!(ctx.stack(), &[e]);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn insertion_preserves_existing_tokens() {
        let mut graph = Graph::new();
        let func = graph
            .func(FuncDecl::new(&[], &[I32, I32]), |ctx, _, _| {
                let one = ctx.i32_const(1)?;
                let two = ctx.i32_const(2)?;
                let sum = ctx.op("i32.sub", &[3i32.into(), two.into()])?;
                assert_eq!(ctx.stack(), &[one, sum]);
                Ok(())
            })
            .unwrap();
        assert_eq!(
            body(&graph, func),
            vec!["i32.const 1", "i32.const 3", "i32.const 2", "i32.sub"]
        );
    }

    #[test]
    fn insertion_rewinds_through_consumers() {
        let mut graph = Graph::new();
        let func = graph
            .func(FuncDecl::new(&[], &[I32]), |ctx, _, _| {
                let a = ctx.i32_const(1)?;
                let b = ctx.i32_const(2)?;
                let c = ctx.op("i32.add", &[a.into(), b.into()])?;
                ctx.op("i32.sub", &[9i32.into(), c.into()])?;
                Ok(())
            })
            .unwrap();
        assert_eq!(
            body(&graph, func),
            vec!["i32.const 9", "i32.const 1", "i32.const 2", "i32.add", "i32.sub"]
        );
    }

    #[test]
    fn insertion_stops_at_frame_boundary() {
        let mut graph = Graph::new();
        let err = graph
            .func(FuncDecl::new(&[], &[]), |ctx, _, _| {
                ctx.i32_const(0)?;
                ctx.block(FunctionType::new(&[I32], &[]), |ctx, _| {
                    let p = ctx.stack()[0];
                    ctx.op("i32.add", &[1i32.into(), p.into()])?;
                    ctx.drop(&[])?;
                    Ok(())
                })?;
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, BuildError::InsertionUnreachable { position: 1, .. }));
    }

    #[test]
    fn rejected_operand_leaves_frame_untouched() {
        let mut graph = Graph::new();
        let counter = graph.global(ConstExpr::i32(0), true);
        let wide = graph.global(ConstExpr::i64(0), true);
        graph
            .func(FuncDecl::new(&[], &[]), |ctx, _, _| {
                ctx.i32_const(1)?;
                let before = frame_state(ctx);
                // `counter` checks out, `wide` does not
                let result = ctx.op("i32.add", &[counter.into(), wide.into()]);
                assert!(matches!(result, Err(BuildError::TypeMismatch { .. })));
                assert_eq!(frame_state(ctx), before);
                ctx.drop(&[])?;
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn failed_insertion_is_undone() {
        let mut graph = Graph::new();
        let sink = graph.import_func(ImportPath::new("env", "sink"), FunctionType::new(&[I32, I32, I32, I32], &[]));
        let limit = graph.global(ConstExpr::i32(9), false);
        graph
            .func(FuncDecl::new(&[], &[]), |ctx, _, _| {
                ctx.i32_const(0)?;
                ctx.block(FunctionType::new(&[I32], &[]), |ctx, _| {
                    let p = ctx.stack()[0];
                    let t = ctx.i32_const(1)?;
                    let before = frame_state(ctx);
                    // `limit` fits below `t`, nothing fits below the block parameter
                    let result = ctx.call(sink, &[2i32.into(), p.into(), limit.into(), t.into()]);
                    assert!(matches!(result, Err(BuildError::InsertionUnreachable { position: 3, .. })));
                    assert_eq!(frame_state(ctx), before);
                    ctx.drop(&[])?;
                    ctx.drop(&[])?;
                    Ok(())
                })?;
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn globals_and_locals_are_type_checked() {
        let mut graph = Graph::new();
        let counter = graph.global(ConstExpr::i64(0), true);
        let limit = graph.global(ConstExpr::i32(9), false);
        let func = graph
            .func(FuncDecl::new(&[], &[]).with_locals(&[I32]), |ctx, _, locals| {
                assert!(matches!(
                    ctx.op("i32.add", &[counter.into(), 1i32.into()]),
                    Err(BuildError::TypeMismatch { .. })
                ));
                assert_eq!(ctx.global_set(limit, &[1i32.into()]), Err(BuildError::ImmutableGlobal));
                ctx.global_set(counter, &[5i64.into()])?;
                ctx.local_set(locals[0], &[limit.into()])?;
                Ok(())
            })
            .unwrap();
        assert_eq!(
            body(&graph, func),
            vec!["i64.const", "global.set", "global.get", "local.set 0"]
        );
        assert_eq!(graph.get(func).unwrap().deps, vec![counter, limit]);
    }
}
