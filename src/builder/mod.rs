//! Stack-typed instruction builder.
//!
//! A [`BuildContext`] runs the format's validation algorithm while a function
//! body is being written: every helper checks its inputs against a virtual
//! operand stack, pushes typed [`StackVar`] tokens for its outputs and records
//! the dependency nodes it touches. Nested `block`/`loop`/`if` bodies open a
//! new [`ControlFrame`]; a scope guard closes it again on every exit path.
//!
//! ```ignore
//! let add = graph.func(FuncDecl::new(&[I32, I32], &[I32]), |ctx, params, _| {
//!     ctx.op("i32.add", &[params[0].into(), params[1].into()])?;
//!     Ok(())
//! })?;
//! ```

mod control;
mod memory;
mod operands;

use std::fmt;
use std::ops::{Deref, DerefMut};

use thiserror::Error;

pub use self::memory::MemAccess;
pub use self::operands::{Const, Operand};
use crate::dependency::{DependencyKind, DependencySet, FuncBody, Graph, Instruction, NodeId, NodeKind};
use crate::instruction::{by_name, Immediate, ImmediateKind, StackEffect};
use crate::types::{format_types, FunctionType, ValueType};
use MaybeValue::{Unknown, Val};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BuildError {
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("expected stack {expected} at end of block, got {actual}")]
    LeftoverStack { expected: String, actual: String },

    #[error("{name}: expected 0 or {expected} arguments, got {actual}")]
    ArgumentCount {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("no block found for label {0}")]
    UnknownLabel(String),

    #[error("inconsistent length of block label types in br_table")]
    InconsistentBrTable,

    #[error("select: ambiguous operand types, both are unknown")]
    AmbiguousSelect,

    #[error("select: invalid operand types {0}")]
    InvalidSelect(String),

    #[error("cannot insert instruction at stack position {position} into {stack}")]
    InsertionUnreachable { position: usize, stack: String },

    #[error("stack operands are not on top of the stack in argument order")]
    StackTokenOrder,

    #[error("mutable global used in constant expression")]
    MutableGlobalInConstExpr,

    #[error("global is immutable")]
    ImmutableGlobal,

    #[error("unknown instruction {0}")]
    UnknownInstruction(String),

    #[error("instruction {0} cannot be built with this helper")]
    WrongHelper(String),

    #[error("alignment must not be larger than natural: 2^{align} for {name} (natural 2^{natural})")]
    InvalidAlignment { name: String, align: u32, natural: u32 },

    #[error("unknown local {0}")]
    UnknownLocal(u32),

    #[error("expected a {expected} node, found {found:?}")]
    WrongNodeKind {
        expected: &'static str,
        found: Option<DependencyKind>,
    },

    #[error("if without else must not change the stack, got {0}")]
    IfWithoutElse(String),

    #[error("no open control frame")]
    NoOpenFrame,
}

/// Type of an operand-stack entry: a value type, or `Unknown` when it was
/// synthesised under unreachable code.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum MaybeValue {
    Val(ValueType),
    Unknown,
}

impl MaybeValue {
    pub fn matches(self, ty: ValueType) -> bool {
        match self {
            Val(v) => v == ty,
            Unknown => true,
        }
    }

    pub fn is_num(self) -> bool {
        match self {
            Val(v) => v.is_num(),
            Unknown => true,
        }
    }

    pub fn is_vec(self) -> bool {
        match self {
            Val(v) => v.is_vec(),
            Unknown => true,
        }
    }

    pub fn is_ref(self) -> bool {
        match self {
            Val(v) => v.is_ref(),
            Unknown => true,
        }
    }
}

impl fmt::Display for MaybeValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Val(v) => v.fmt(f),
            Unknown => write!(f, "unknown"),
        }
    }
}

/// A typed token standing for one operand-stack entry. Tokens are unique
/// within the function being built.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct StackVar {
    id: u32,
    ty: MaybeValue,
}

impl StackVar {
    pub fn ty(&self) -> MaybeValue {
        self.ty
    }
}

/// Handle to a parameter or declared local.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct Local {
    index: u32,
    ty: ValueType,
}

impl Local {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn ty(&self) -> ValueType {
        self.ty
    }
}

/// Identifies an enclosing block for branches.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct Label(u32);

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Branch target: a relative depth (0 is the innermost block) or a label.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Target {
    Depth(u32),
    Label(Label),
}

impl From<u32> for Target {
    fn from(depth: u32) -> Target {
        Target::Depth(depth)
    }
}

impl From<Label> for Target {
    fn from(label: Label) -> Target {
        Target::Label(label)
    }
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum FrameKind {
    Function,
    Block,
    Loop,
    If,
    Else,
}

#[derive(Clone, Debug)]
pub struct ControlFrame {
    label: Label,
    kind: FrameKind,
    start_types: Vec<ValueType>,
    end_types: Vec<ValueType>,
    stack: Vec<StackVar>,
    body: Vec<Instruction>,
    unreachable: bool,
}

fn fresh(next_id: &mut u32, ty: MaybeValue) -> StackVar {
    let var = StackVar { id: *next_id, ty };
    *next_id += 1;
    var
}

pub(crate) fn bracket(types: &[ValueType]) -> String {
    format!("[{}]", format_types(types))
}

fn format_stack(stack: &[MaybeValue]) -> String {
    let types: Vec<String> = stack.iter().map(|t| t.to_string()).collect();
    format!("[{}]", types.join(" "))
}

impl ControlFrame {
    /// Types a branch to this frame carries: a loop is re-entered at its top.
    fn label_types(&self) -> &[ValueType] {
        if self.kind == FrameKind::Loop {
            &self.start_types
        } else {
            &self.end_types
        }
    }

    fn stack_types(&self) -> Vec<MaybeValue> {
        self.stack.iter().map(|v| v.ty).collect()
    }

    fn push_vals(&mut self, types: &[ValueType], next_id: &mut u32) -> Vec<StackVar> {
        let vars: Vec<StackVar> = types.iter().map(|t| fresh(next_id, Val(*t))).collect();
        self.stack.extend_from_slice(&vars);
        vars
    }

    fn pop_val(&mut self, next_id: &mut u32) -> Option<StackVar> {
        match self.stack.pop() {
            Some(var) => Some(var),
            None if self.unreachable => Some(fresh(next_id, Unknown)),
            None => None,
        }
    }

    fn pop_any(&mut self, next_id: &mut u32) -> Result<StackVar, BuildError> {
        self.pop_val(next_id).ok_or_else(|| BuildError::TypeMismatch {
            expected: "a value".to_string(),
            actual: "[]".to_string(),
        })
    }

    fn pop_expected(&mut self, expected: ValueType, next_id: &mut u32) -> Result<StackVar, BuildError> {
        let mut popped = self.pop_expecteds(&[expected], next_id)?;
        Ok(popped.remove(0))
    }

    /// Pops `expected` (last entry on top), returning the tokens in stack
    /// order. On a mismatch the stack is left untouched.
    fn pop_expecteds(&mut self, expected: &[ValueType], next_id: &mut u32) -> Result<Vec<StackVar>, BuildError> {
        let height = self.stack.len();
        let mut popped = Vec::with_capacity(expected.len());
        for &ty in expected.iter().rev() {
            match self.pop_val(next_id) {
                Some(var) if var.ty.matches(ty) => popped.push(var),
                found => {
                    let mut seen = self.stack_types();
                    seen.extend(found.map(|v| v.ty));
                    seen.extend(popped.iter().rev().map(|v: &StackVar| v.ty));
                    popped.extend(found);
                    // only the first `height` pops came off the real stack
                    popped.truncate(height);
                    self.stack.extend(popped.into_iter().rev());
                    return Err(BuildError::TypeMismatch {
                        expected: bracket(expected),
                        actual: format_stack(&seen),
                    });
                }
            }
        }
        popped.reverse();
        Ok(popped)
    }

    fn set_unreachable(&mut self) {
        self.stack.clear();
        self.unreachable = true;
    }
}

/// Stack effect of a polymorphic instruction as observed. Operands that were
/// synthesised in unreachable code are left out; such bodies are never
/// rewound.
fn observed_effect(params: &[MaybeValue], results: &[ValueType]) -> FunctionType {
    FunctionType {
        params: params
            .iter()
            .filter_map(|t| match t {
                Val(v) => Some(*v),
                Unknown => None,
            })
            .collect(),
        results: results.to_vec(),
    }
}

fn innermost(frames: &mut [ControlFrame]) -> Result<&mut ControlFrame, BuildError> {
    frames.last_mut().ok_or(BuildError::NoOpenFrame)
}

/// Mutable state threaded through the construction of one function body.
pub struct BuildContext<'g> {
    graph: &'g mut Graph,
    locals: Vec<ValueType>,
    frames: Vec<ControlFrame>,
    deps: DependencySet,
    return_types: Vec<ValueType>,
    next_id: u32,
    next_label: u32,
}

/// Closes the frames opened after it was created, whichever way the nested
/// build exits.
struct FrameGuard<'c, 'g> {
    ctx: &'c mut BuildContext<'g>,
    depth: usize,
}

impl<'c, 'g> Deref for FrameGuard<'c, 'g> {
    type Target = BuildContext<'g>;

    fn deref(&self) -> &BuildContext<'g> {
        self.ctx
    }
}

impl<'c, 'g> DerefMut for FrameGuard<'c, 'g> {
    fn deref_mut(&mut self) -> &mut BuildContext<'g> {
        self.ctx
    }
}

impl<'c, 'g> Drop for FrameGuard<'c, 'g> {
    fn drop(&mut self) {
        self.ctx.frames.truncate(self.depth);
    }
}

/// Innermost-frame and dependency state an operation returns to if it fails.
struct Checkpoint {
    frames: usize,
    stack: Vec<StackVar>,
    unreachable: bool,
    body: usize,
    deps: usize,
}

impl<'g> BuildContext<'g> {
    fn new(graph: &'g mut Graph, locals: Vec<ValueType>, ty: &FunctionType) -> BuildContext<'g> {
        let mut ctx = BuildContext {
            graph,
            locals,
            frames: vec![],
            deps: DependencySet::new(),
            return_types: ty.results.clone(),
            next_id: 0,
            next_label: 0,
        };
        let label = ctx.new_label();
        ctx.frames.push(ControlFrame {
            label,
            kind: FrameKind::Function,
            start_types: vec![],
            end_types: ty.results.clone(),
            stack: vec![],
            body: vec![],
            unreachable: false,
        });
        ctx
    }

    fn new_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    pub fn graph(&self) -> &Graph {
        self.graph
    }

    pub fn graph_mut(&mut self) -> &mut Graph {
        self.graph
    }

    /// Tokens on the innermost frame's stack, bottom first.
    pub fn stack(&self) -> &[StackVar] {
        self.frames.last().map(|f| f.stack.as_slice()).unwrap_or(&[])
    }

    pub fn is_unreachable(&self) -> bool {
        self.frames.last().map(|f| f.unreachable).unwrap_or(false)
    }

    /// Number of open control frames, the function frame included.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    fn add_deps(&mut self, deps: &[NodeId]) {
        for dep in deps {
            self.deps.insert(*dep);
        }
    }

    /// Applies `instr`'s stack effect to the innermost frame and appends it.
    pub(crate) fn push_instruction(&mut self, instr: Instruction) -> Result<Vec<StackVar>, BuildError> {
        let frame = innermost(&mut self.frames)?;
        frame.pop_expecteds(&instr.ty.params, &mut self.next_id)?;
        let results = frame.push_vals(&instr.ty.results, &mut self.next_id);
        for dep in &instr.deps {
            self.deps.insert(*dep);
        }
        frame.body.push(instr);
        Ok(results)
    }

    /// Appends `instr` whose stack effect the caller has already applied.
    fn append_instruction(&mut self, instr: Instruction) -> Result<(), BuildError> {
        self.add_deps(&instr.deps);
        innermost(&mut self.frames)?.body.push(instr);
        Ok(())
    }

    fn set_unreachable(&mut self) -> Result<(), BuildError> {
        innermost(&mut self.frames)?.set_unreachable();
        Ok(())
    }

    fn push_ctrl<'c>(&'c mut self, kind: FrameKind, ty: &FunctionType) -> (FrameGuard<'c, 'g>, Label) {
        let depth = self.frames.len();
        let label = self.new_label();
        let mut frame = ControlFrame {
            label,
            kind,
            start_types: ty.params.clone(),
            end_types: ty.results.clone(),
            stack: vec![],
            body: vec![],
            unreachable: false,
        };
        frame.push_vals(&ty.params, &mut self.next_id);
        self.frames.push(frame);
        (FrameGuard { ctx: self, depth }, label)
    }

    /// Closes the innermost frame: its stack must hold exactly its end types.
    fn pop_ctrl(&mut self) -> Result<ControlFrame, BuildError> {
        let mut frame = self.frames.pop().ok_or(BuildError::NoOpenFrame)?;
        let end_types = frame.end_types.clone();
        frame.pop_expecteds(&end_types, &mut self.next_id)?;
        if !frame.stack.is_empty() {
            return Err(BuildError::LeftoverStack {
                expected: bracket(&end_types),
                actual: format_stack(&frame.stack_types()),
            });
        }
        Ok(frame)
    }

    fn checkpoint(&self) -> Checkpoint {
        let frame = self.frames.last();
        Checkpoint {
            frames: self.frames.len(),
            stack: self.stack().to_vec(),
            unreachable: self.is_unreachable(),
            body: frame.map(|f| f.body.len()).unwrap_or(0),
            deps: self.deps.len(),
        }
    }

    /// Valid only while the operation since `checkpoint` has appended to the
    /// innermost body rather than inserting into it.
    fn rollback(&mut self, checkpoint: Checkpoint) {
        self.frames.truncate(checkpoint.frames);
        if let Some(frame) = self.frames.last_mut() {
            frame.stack = checkpoint.stack;
            frame.unreachable = checkpoint.unreachable;
            frame.body.truncate(checkpoint.body);
        }
        self.deps.truncate(checkpoint.deps);
    }

    /// Runs `op`, undoing its effect on the stack, body and dependencies
    /// when it fails. Token ids and labels stay consumed.
    fn atomically<T, F>(&mut self, op: F) -> Result<T, BuildError>
    where
        F: FnOnce(&mut BuildContext<'g>) -> Result<T, BuildError>,
    {
        let checkpoint = self.checkpoint();
        let result = op(self);
        if result.is_err() {
            self.rollback(checkpoint);
        }
        result
    }

    /// Runs `build` inside a fresh frame and returns the body it produced.
    fn build_frame<F>(&mut self, kind: FrameKind, ty: &FunctionType, build: F) -> Result<Vec<Instruction>, BuildError>
    where
        F: FnOnce(&mut BuildContext<'g>, Label) -> Result<(), BuildError>,
    {
        let (mut guard, label) = self.push_ctrl(kind, ty);
        build(&mut *guard, label)?;
        let frame = guard.pop_ctrl()?;
        Ok(frame.body)
    }

    /// Finds the frame a branch refers to, returning its relative depth.
    fn resolve_target(&self, target: Target) -> Result<(u32, &ControlFrame), BuildError> {
        let n = self.frames.len();
        let index = match target {
            Target::Depth(depth) => (depth as usize)
                .checked_add(1)
                .and_then(|d| n.checked_sub(d))
                .ok_or_else(|| BuildError::UnknownLabel(depth.to_string()))?,
            Target::Label(label) => self
                .frames
                .iter()
                .rposition(|f| f.label == label)
                .ok_or_else(|| BuildError::UnknownLabel(label.to_string()))?,
        };
        Ok(((n - 1 - index) as u32, &self.frames[index]))
    }

    fn local(&self, local: Local) -> Result<ValueType, BuildError> {
        let ty = *self
            .locals
            .get(local.index as usize)
            .ok_or(BuildError::UnknownLocal(local.index))?;
        if ty != local.ty {
            return Err(BuildError::TypeMismatch {
                expected: ty.to_string(),
                actual: local.ty.to_string(),
            });
        }
        Ok(ty)
    }

    /// Emits any fixed-signature instruction without immediates, e.g.
    /// `i32.add` or `f64.convert_i64_s`.
    pub fn instr(&mut self, name: &str, args: &[Operand]) -> Result<Vec<StackVar>, BuildError> {
        let spec = by_name(name).ok_or_else(|| BuildError::UnknownInstruction(name.to_string()))?;
        let (params, results) = match (spec.stack, spec.immediate) {
            (StackEffect::Fixed { params, results }, ImmediateKind::None) => (params, results),
            _ => return Err(BuildError::WrongHelper(name.to_string())),
        };
        self.stack_args(spec.name, params, args)?;
        self.push_instruction(Instruction::simple(
            spec.name,
            FunctionType::new(params, results),
            Immediate::None,
        ))
    }

    /// Like [`instr`](BuildContext::instr) for instructions with one result.
    pub fn op(&mut self, name: &str, args: &[Operand]) -> Result<StackVar, BuildError> {
        single(name, self.instr(name, args)?)
    }

    fn push_const(&mut self, name: &'static str, ty: ValueType, immediate: Immediate) -> Result<StackVar, BuildError> {
        let results = self.push_instruction(Instruction::simple(name, FunctionType::new(&[], &[ty]), immediate))?;
        single(name, results)
    }

    pub fn i32_const(&mut self, value: i32) -> Result<StackVar, BuildError> {
        self.push_const("i32.const", ValueType::I32, Immediate::I32(value))
    }

    pub fn i64_const(&mut self, value: i64) -> Result<StackVar, BuildError> {
        self.push_const("i64.const", ValueType::I64, Immediate::I64(value))
    }

    pub fn f32_const(&mut self, value: f32) -> Result<StackVar, BuildError> {
        self.push_const("f32.const", ValueType::F32, Immediate::F32(value))
    }

    pub fn f64_const(&mut self, value: f64) -> Result<StackVar, BuildError> {
        self.push_const("f64.const", ValueType::F64, Immediate::F64(value))
    }

    /// Closes the function frame, handing back the body and its dependencies.
    fn finish(mut self) -> Result<(Vec<Instruction>, Vec<NodeId>), BuildError> {
        let frame = self.pop_ctrl()?;
        if !self.frames.is_empty() {
            return Err(BuildError::NoOpenFrame);
        }
        Ok((frame.body, self.deps.into_vec()))
    }
}

fn single(name: &str, mut results: Vec<StackVar>) -> Result<StackVar, BuildError> {
    match results.len() {
        1 => Ok(results.remove(0)),
        _ => Err(BuildError::WrongHelper(name.to_string())),
    }
}

/// Signature and locals of a function to build.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FuncDecl {
    pub params: Vec<ValueType>,
    pub locals: Vec<ValueType>,
    pub results: Vec<ValueType>,
}

impl FuncDecl {
    pub fn new(params: &[ValueType], results: &[ValueType]) -> FuncDecl {
        FuncDecl {
            params: params.to_vec(),
            locals: vec![],
            results: results.to_vec(),
        }
    }

    pub fn with_locals(mut self, locals: &[ValueType]) -> FuncDecl {
        self.locals = locals.to_vec();
        self
    }
}

/// Groups locals by type (in order of first appearance), returning the
/// grouped list and each declared local's final index.
fn sort_locals(locals: &[ValueType], offset: u32) -> (Vec<ValueType>, Vec<u32>) {
    let mut groups: Vec<(ValueType, Vec<usize>)> = vec![];
    for (j, ty) in locals.iter().enumerate() {
        match groups.iter_mut().find(|(t, _)| t == ty) {
            Some((_, members)) => members.push(j),
            None => groups.push((*ty, vec![j])),
        }
    }
    let mut sorted = Vec::with_capacity(locals.len());
    let mut indices = vec![0; locals.len()];
    for (ty, members) in groups {
        for j in members {
            indices[j] = offset + sorted.len() as u32;
            sorted.push(ty);
        }
    }
    (sorted, indices)
}

impl Graph {
    /// Builds a function. `build` receives handles for the parameters and the
    /// declared locals; whatever it leaves on the stack must match the
    /// declared results exactly.
    pub fn func<F>(&mut self, decl: FuncDecl, build: F) -> Result<NodeId, BuildError>
    where
        F: FnOnce(&mut BuildContext<'_>, &[Local], &[Local]) -> Result<(), BuildError>,
    {
        let FuncDecl {
            params,
            locals,
            results,
        } = decl;
        let (sorted, indices) = sort_locals(&locals, params.len() as u32);
        let param_handles: Vec<Local> = params
            .iter()
            .enumerate()
            .map(|(index, &ty)| Local { index: index as u32, ty })
            .collect();
        let local_handles: Vec<Local> = locals
            .iter()
            .zip(indices)
            .map(|(&ty, index)| Local { index, ty })
            .collect();
        let ty = FunctionType { params, results };

        let mut all_locals = ty.params.clone();
        all_locals.extend_from_slice(&sorted);
        let mut ctx = BuildContext::new(self, all_locals, &ty);
        build(&mut ctx, &param_handles, &local_handles)?;
        let (body, deps) = ctx.finish()?;

        Ok(self.add(
            NodeKind::Function(FuncBody {
                ty,
                locals: sorted,
                body,
            }),
            deps,
        ))
    }
}
