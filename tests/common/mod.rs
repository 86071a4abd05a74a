//! A small interpreter over decoded modules, used to run assembled code in
//! tests. It covers the integer subset the scenarios need: locals and
//! globals, linear memory, structured control, direct calls and host
//! function imports. Anything else traps with `Unsupported`.

#![allow(dead_code)]

use std::collections::HashMap;
use std::rc::Rc;

use stackasm::binary::CodecError;
use stackasm::instruction::{BlockType, Immediate, MemArg, ResolvedInstruction};
use stackasm::module::{DataMode, ExportIndex, ExternalKind, Import};
use stackasm::types::{FunctionType, ValueType};
use stackasm::{Host, Module};
use thiserror::Error;

const PAGE_SIZE: usize = 65536;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Ref(Option<u32>),
}

impl Value {
    fn zero(ty: ValueType) -> Value {
        match ty {
            ValueType::I32 => Value::I32(0),
            ValueType::I64 => Value::I64(0),
            ValueType::F32 => Value::F32(0.0),
            ValueType::F64 => Value::F64(0.0),
            _ => Value::Ref(None),
        }
    }
}

#[derive(Error, Debug)]
pub enum Trap {
    #[error("decode: {0}")]
    Codec(#[from] CodecError),
    #[error("unreachable executed")]
    Unreachable,
    #[error("out of bounds memory access at {0}")]
    OutOfBounds(u64),
    #[error("integer divide by zero")]
    DivideByZero,
    #[error("missing import {0}")]
    MissingImport(String),
    #[error("no export named {0}")]
    NoExport(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("operand stack underflow")]
    StackUnderflow,
}

pub type HostFunc = Rc<dyn Fn(&[Value]) -> Vec<Value>>;

/// Resolves imports by `(module, name)` and instantiates modules.
#[derive(Default)]
pub struct Interpreter {
    funcs: HashMap<(String, String), HostFunc>,
    globals: HashMap<(String, String), Value>,
}

impl Interpreter {
    pub fn new() -> Interpreter {
        Interpreter::default()
    }

    pub fn func(mut self, module: &str, name: &str, f: impl Fn(&[Value]) -> Vec<Value> + 'static) -> Interpreter {
        self.funcs.insert((module.to_string(), name.to_string()), Rc::new(f));
        self
    }

    pub fn global(mut self, module: &str, name: &str, value: Value) -> Interpreter {
        self.globals.insert((module.to_string(), name.to_string()), value);
        self
    }
}

impl Host for Interpreter {
    type Instance = Instance;
    type Error = Trap;

    fn instantiate(&mut self, bytes: &[u8], imports: &[Import]) -> Result<Instance, Trap> {
        let module = Module::from_bytes(bytes)?;
        assert_eq!(module.imports, imports);
        Instance::new(module, self)
    }
}

enum Callable {
    Host(HostFunc),
    Local(usize),
}

enum Flow {
    Next,
    Branch(u32),
    Return,
}

pub struct Instance {
    module: Rc<Module>,
    funcs: Vec<Callable>,
    globals: Vec<Value>,
    memory: Vec<u8>,
}

fn missing(import: &Import) -> Trap {
    Trap::MissingImport(format!("{}.{}", import.module, import.name))
}

impl Instance {
    fn new(module: Module, host: &Interpreter) -> Result<Instance, Trap> {
        let mut funcs = vec![];
        let mut globals = vec![];
        let mut memory = vec![];
        for import in &module.imports {
            let key = (import.module.clone(), import.name.clone());
            match import.kind {
                ExternalKind::Function(_) => {
                    let f = host.funcs.get(&key).ok_or_else(|| missing(import))?;
                    funcs.push(Callable::Host(Rc::clone(f)));
                }
                ExternalKind::Global(_) => globals.push(*host.globals.get(&key).ok_or_else(|| missing(import))?),
                ExternalKind::Memory(ty) => memory = vec![0; ty.limits.min as usize * PAGE_SIZE],
                ExternalKind::Table(_) => return Err(Trap::Unsupported("table imports".into())),
            }
        }
        funcs.extend((0..module.functions.len()).map(Callable::Local));
        if let Some(ty) = module.memories.first() {
            memory = vec![0; ty.limits.min as usize * PAGE_SIZE];
        }
        let mut instance = Instance {
            module: Rc::new(module),
            funcs,
            globals,
            memory,
        };

        let module = Rc::clone(&instance.module);
        for global in &module.globals {
            let value = instance.const_expr(&global.init)?;
            instance.globals.push(value);
        }
        for data in &module.datas {
            if let DataMode::Active { offset, .. } = &data.mode {
                let start = match instance.const_expr(offset)? {
                    Value::I32(v) => v as u32 as usize,
                    other => return Err(Trap::Unsupported(format!("data offset {:?}", other))),
                };
                let end = start + data.init.len();
                if end > instance.memory.len() {
                    return Err(Trap::OutOfBounds(end as u64));
                }
                instance.memory[start..end].copy_from_slice(&data.init);
            }
        }
        if let Some(start) = module.start {
            instance.call(start, vec![])?;
        }
        Ok(instance)
    }

    fn const_expr(&self, expr: &[ResolvedInstruction]) -> Result<Value, Trap> {
        match expr {
            [instr] => match (instr.name, &instr.immediate) {
                ("i32.const", Immediate::I32(v)) => Ok(Value::I32(*v)),
                ("i64.const", Immediate::I64(v)) => Ok(Value::I64(*v)),
                ("global.get", Immediate::U32(g)) => Ok(self.globals[*g as usize]),
                ("ref.func", Immediate::U32(f)) => Ok(Value::Ref(Some(*f))),
                ("ref.null", _) => Ok(Value::Ref(None)),
                _ => Err(Trap::Unsupported(instr.to_string())),
            },
            _ => Err(Trap::Unsupported("constant expression length".into())),
        }
    }

    pub fn memory(&self) -> &[u8] {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.memory
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        match self.module.export(name)? {
            ExportIndex::Global(g) => self.globals.get(g as usize).copied(),
            _ => None,
        }
    }

    pub fn invoke(&mut self, name: &str, args: &[Value]) -> Result<Vec<Value>, Trap> {
        match self.module.export(name) {
            Some(ExportIndex::Function(f)) => self.call(f, args.to_vec()),
            _ => Err(Trap::NoExport(name.to_string())),
        }
    }

    fn call(&mut self, index: u32, args: Vec<Value>) -> Result<Vec<Value>, Trap> {
        let local = match &self.funcs[index as usize] {
            Callable::Host(f) => return Ok(f(&args)),
            Callable::Local(i) => *i,
        };
        let module = Rc::clone(&self.module);
        let func = &module.functions[local];
        let ty = &module.types[func.type_index as usize];
        let mut locals = args;
        locals.extend(func.locals.iter().map(|t| Value::zero(*t)));
        let mut frame = Frame { locals, stack: vec![] };
        self.exec(&mut frame, &func.body)?;
        let n = ty.results.len();
        let at = frame.stack.len().checked_sub(n).ok_or(Trap::StackUnderflow)?;
        Ok(frame.stack.split_off(at))
    }

    fn block_type(&self, block_type: BlockType) -> FunctionType {
        match block_type {
            BlockType::Empty => FunctionType::default(),
            BlockType::Value(t) => FunctionType::new(&[], &[t]),
            BlockType::Index(i) => self.module.types[i as usize].clone(),
        }
    }

    /// Runs a block body; `Branch(0)` out of the body targets this block.
    fn block(&mut self, frame: &mut Frame, block_type: BlockType, body: &[ResolvedInstruction], is_loop: bool) -> Result<Flow, Trap> {
        let ty = self.block_type(block_type);
        let height = frame.stack.len() - ty.params.len();
        loop {
            match self.exec(frame, body)? {
                Flow::Next => return Ok(Flow::Next),
                Flow::Branch(0) if is_loop => frame.unwind(height, ty.params.len()),
                Flow::Branch(0) => {
                    frame.unwind(height, ty.results.len());
                    return Ok(Flow::Next);
                }
                Flow::Branch(n) => return Ok(Flow::Branch(n - 1)),
                Flow::Return => return Ok(Flow::Return),
            }
        }
    }

    fn address(&self, frame: &mut Frame, arg: &MemArg, width: usize) -> Result<usize, Trap> {
        let base = frame.pop_i32()? as u32 as u64;
        let ea = base + u64::from(arg.offset);
        if ea + width as u64 > self.memory.len() as u64 {
            return Err(Trap::OutOfBounds(ea));
        }
        Ok(ea as usize)
    }

    fn load(&self, frame: &mut Frame, arg: &MemArg, width: usize) -> Result<u64, Trap> {
        let ea = self.address(frame, arg, width)?;
        let mut bytes = [0u8; 8];
        bytes[..width].copy_from_slice(&self.memory[ea..ea + width]);
        Ok(u64::from_le_bytes(bytes))
    }

    fn store(&mut self, frame: &mut Frame, arg: &MemArg, width: usize, value: u64) -> Result<(), Trap> {
        let ea = self.address(frame, arg, width)?;
        self.memory[ea..ea + width].copy_from_slice(&value.to_le_bytes()[..width]);
        Ok(())
    }

    fn exec(&mut self, frame: &mut Frame, body: &[ResolvedInstruction]) -> Result<Flow, Trap> {
        for instr in body {
            match self.step(frame, instr)? {
                Flow::Next => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Next)
    }

    fn step(&mut self, frame: &mut Frame, instr: &ResolvedInstruction) -> Result<Flow, Trap> {
        use Immediate as Imm;
        use Value::{I32, I64};
        match (instr.name, &instr.immediate) {
            ("nop", _) => {}
            ("unreachable", _) => return Err(Trap::Unreachable),
            ("block", Imm::Block { block_type, body }) => return self.block(frame, *block_type, body, false),
            ("loop", Imm::Block { block_type, body }) => return self.block(frame, *block_type, body, true),
            ("if", Imm::If { block_type, then, else_ }) => {
                let cond = frame.pop_i32()?;
                let empty = vec![];
                let body = if cond != 0 { then } else { else_.as_ref().unwrap_or(&empty) };
                return self.block(frame, *block_type, body, false);
            }
            ("br", Imm::U32(depth)) => return Ok(Flow::Branch(*depth)),
            ("br_if", Imm::U32(depth)) => {
                if frame.pop_i32()? != 0 {
                    return Ok(Flow::Branch(*depth));
                }
            }
            ("br_table", Imm::BrTable { labels, default }) => {
                let i = frame.pop_i32()? as u32 as usize;
                return Ok(Flow::Branch(*labels.get(i).unwrap_or(default)));
            }
            ("return", _) => return Ok(Flow::Return),
            ("call", Imm::U32(f)) => {
                let ty = self.function_type(*f);
                let at = frame.stack.len().checked_sub(ty.params.len()).ok_or(Trap::StackUnderflow)?;
                let args = frame.stack.split_off(at);
                let results = self.call(*f, args)?;
                frame.stack.extend(results);
            }
            ("drop", _) => {
                frame.pop()?;
            }
            ("select", _) | ("select_t", _) => {
                let cond = frame.pop_i32()?;
                let b = frame.pop()?;
                let a = frame.pop()?;
                frame.push(if cond != 0 { a } else { b });
            }
            ("local.get", Imm::U32(i)) => frame.push(frame.locals[*i as usize]),
            ("local.set", Imm::U32(i)) => frame.locals[*i as usize] = frame.pop()?,
            ("local.tee", Imm::U32(i)) => {
                let v = frame.pop()?;
                frame.locals[*i as usize] = v;
                frame.push(v);
            }
            ("global.get", Imm::U32(g)) => frame.push(self.globals[*g as usize]),
            ("global.set", Imm::U32(g)) => self.globals[*g as usize] = frame.pop()?,
            ("i32.const", Imm::I32(v)) => frame.push(I32(*v)),
            ("i64.const", Imm::I64(v)) => frame.push(I64(*v)),
            ("i32.load", Imm::MemArg(m)) => {
                let v = self.load(frame, m, 4)?;
                frame.push(I32(v as u32 as i32));
            }
            ("i32.load8_u", Imm::MemArg(m)) => {
                let v = self.load(frame, m, 1)?;
                frame.push(I32(v as i32));
            }
            ("i64.load", Imm::MemArg(m)) => {
                let v = self.load(frame, m, 8)?;
                frame.push(I64(v as i64));
            }
            ("i64.load32_u", Imm::MemArg(m)) => {
                let v = self.load(frame, m, 4)?;
                frame.push(I64(v as i64));
            }
            ("i32.store", Imm::MemArg(m)) | ("i32.store8", Imm::MemArg(m)) => {
                let v = frame.pop_i32()? as u32 as u64;
                let width = if instr.name == "i32.store" { 4 } else { 1 };
                self.store(frame, m, width, v)?;
            }
            ("i64.store", Imm::MemArg(m)) | ("i64.store32", Imm::MemArg(m)) => {
                let v = frame.pop_i64()? as u64;
                let width = if instr.name == "i64.store" { 8 } else { 4 };
                self.store(frame, m, width, v)?;
            }
            ("memory.size", _) => frame.push(I32((self.memory.len() / PAGE_SIZE) as i32)),
            ("memory.grow", _) => {
                let delta = frame.pop_i32()? as u32 as usize;
                let pages = self.memory.len() / PAGE_SIZE;
                self.memory.resize((pages + delta) * PAGE_SIZE, 0);
                frame.push(I32(pages as i32));
            }
            ("i32.eqz", _) => {
                let a = frame.pop_i32()?;
                frame.push(I32((a == 0) as i32));
            }
            ("i64.eqz", _) => {
                let a = frame.pop_i64()?;
                frame.push(I32((a == 0) as i32));
            }
            ("i32.wrap_i64", _) => {
                let a = frame.pop_i64()?;
                frame.push(I32(a as i32));
            }
            ("i64.extend_i32_u", _) => {
                let a = frame.pop_i32()?;
                frame.push(I64(a as u32 as i64));
            }
            ("i64.extend_i32_s", _) => {
                let a = frame.pop_i32()?;
                frame.push(I64(a as i64));
            }
            (name, Imm::None) if name.starts_with("i32.") => {
                let b = frame.pop_i32()?;
                let a = frame.pop_i32()?;
                frame.push(I32(i32_binary(name, a, b)?));
            }
            (name, Imm::None) if name.starts_with("i64.") => {
                let b = frame.pop_i64()?;
                let a = frame.pop_i64()?;
                let v = i64_binary(name, a, b)?;
                // comparisons produce an i32
                let result = if is_comparison(name) { I32(v as i32) } else { I64(v) };
                frame.push(result);
            }
            _ => return Err(Trap::Unsupported(instr.to_string())),
        }
        Ok(Flow::Next)
    }

    fn function_type(&self, index: u32) -> FunctionType {
        self.module.function_type(index).cloned().unwrap_or_default()
    }
}

fn is_comparison(name: &str) -> bool {
    let op = name.splitn(2, '.').nth(1).unwrap_or("");
    matches!(op, "eq" | "ne" | "lt_s" | "lt_u" | "gt_s" | "gt_u" | "le_s" | "le_u" | "ge_s" | "ge_u")
}

fn i32_binary(name: &str, a: i32, b: i32) -> Result<i32, Trap> {
    let (ua, ub) = (a as u32, b as u32);
    Ok(match &name[4..] {
        "add" => a.wrapping_add(b),
        "sub" => a.wrapping_sub(b),
        "mul" => a.wrapping_mul(b),
        "div_u" => ua.checked_div(ub).ok_or(Trap::DivideByZero)? as i32,
        "rem_u" => ua.checked_rem(ub).ok_or(Trap::DivideByZero)? as i32,
        "and" => a & b,
        "or" => a | b,
        "xor" => a ^ b,
        "shl" => a.wrapping_shl(ub),
        "shr_s" => a.wrapping_shr(ub),
        "shr_u" => ua.wrapping_shr(ub) as i32,
        "eq" => (a == b) as i32,
        "ne" => (a != b) as i32,
        "lt_s" => (a < b) as i32,
        "lt_u" => (ua < ub) as i32,
        "gt_s" => (a > b) as i32,
        "gt_u" => (ua > ub) as i32,
        "le_s" => (a <= b) as i32,
        "le_u" => (ua <= ub) as i32,
        "ge_s" => (a >= b) as i32,
        "ge_u" => (ua >= ub) as i32,
        _ => return Err(Trap::Unsupported(name.to_string())),
    })
}

fn i64_binary(name: &str, a: i64, b: i64) -> Result<i64, Trap> {
    let (ua, ub) = (a as u64, b as u64);
    Ok(match &name[4..] {
        "add" => a.wrapping_add(b),
        "sub" => a.wrapping_sub(b),
        "mul" => a.wrapping_mul(b),
        "div_u" => ua.checked_div(ub).ok_or(Trap::DivideByZero)? as i64,
        "rem_u" => ua.checked_rem(ub).ok_or(Trap::DivideByZero)? as i64,
        "and" => a & b,
        "or" => a | b,
        "xor" => a ^ b,
        "shl" => a.wrapping_shl(ub as u32),
        "shr_s" => a.wrapping_shr(ub as u32),
        "shr_u" => ua.wrapping_shr(ub as u32) as i64,
        "eq" => (a == b) as i64,
        "ne" => (a != b) as i64,
        "lt_s" => (a < b) as i64,
        "lt_u" => (ua < ub) as i64,
        "gt_s" => (a > b) as i64,
        "gt_u" => (ua > ub) as i64,
        "le_s" => (a <= b) as i64,
        "le_u" => (ua <= ub) as i64,
        "ge_s" => (a >= b) as i64,
        "ge_u" => (ua >= ub) as i64,
        _ => return Err(Trap::Unsupported(name.to_string())),
    })
}

struct Frame {
    locals: Vec<Value>,
    stack: Vec<Value>,
}

impl Frame {
    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Result<Value, Trap> {
        self.stack.pop().ok_or(Trap::StackUnderflow)
    }

    fn pop_i32(&mut self) -> Result<i32, Trap> {
        match self.pop()? {
            Value::I32(v) => Ok(v),
            other => Err(Trap::Unsupported(format!("expected i32, got {:?}", other))),
        }
    }

    fn pop_i64(&mut self) -> Result<i64, Trap> {
        match self.pop()? {
            Value::I64(v) => Ok(v),
            other => Err(Trap::Unsupported(format!("expected i64, got {:?}", other))),
        }
    }

    /// Drops everything above `height` except the top `keep` values.
    fn unwind(&mut self, height: usize, keep: usize) {
        let top = self.stack.split_off(self.stack.len() - keep);
        self.stack.truncate(height);
        self.stack.extend(top);
    }
}
