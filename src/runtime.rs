//! JVM runtime module responsible for creating a new runtime
//! environment and running programs.
//!
//! Every invocation gets its own `Frame`; calls nest on the host stack.
//! Instruction handlers never move the instruction pointer themselves,
//! they return a `Control` telling the run loop what to do next.
use std::collections::{HashMap, HashSet};
use std::env;
use std::fmt;
use std::rc::Rc;

use serde::Deserialize;
use tracing::{debug, trace, warn};

use crate::bytecode::OPCode;
use crate::error::{Error, Location, RuntimeError, RuntimeErrorKind};
use crate::ir::{canonical_name, Constant, Instruction, MemberRef, Operand, ROOT_CLASS};
use crate::profiler::{ProgramCounter, Profiler};
use crate::program::{BaseTypeKind, LoadedMethod, Manifest, MethodDescriptor, MethodKey, Type};
use crate::value::{Heap, HeapObject, ObjectRef, Value};

type Result<T> = std::result::Result<T, RuntimeError>;

/// Tunables for a `Runtime`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Instructions executed before the run is aborted, unlimited if unset.
    pub instruction_budget: Option<u64>,
    pub max_call_depth: usize,
    /// Loop entries before a loop header is reported hot.
    pub hot_loop_threshold: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            instruction_budget: None,
            max_call_depth: 1024,
            hot_loop_threshold: 1000,
        }
    }
}

impl RuntimeConfig {
    pub const BUDGET_VAR: &'static str = "POUROVER_INSTRUCTION_BUDGET";
    pub const DEPTH_VAR: &'static str = "POUROVER_MAX_CALL_DEPTH";
    pub const HOT_LOOP_VAR: &'static str = "POUROVER_HOT_LOOP_THRESHOLD";

    /// Defaults overridden by the `POUROVER_*` environment variables.
    pub fn from_env() -> std::result::Result<Self, Error> {
        Self::from_vars(|name| env::var(name).ok())
    }

    pub fn from_vars(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> std::result::Result<Self, Error> {
        let mut config = Self::default();
        if let Some(budget) = parse_var(&lookup, Self::BUDGET_VAR)? {
            config.instruction_budget = Some(budget);
        }
        if let Some(depth) = parse_var(&lookup, Self::DEPTH_VAR)? {
            config.max_call_depth = depth;
        }
        if let Some(threshold) = parse_var(&lookup, Self::HOT_LOOP_VAR)? {
            config.hot_loop_threshold = threshold;
        }
        Ok(config)
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    variable: &str,
) -> std::result::Result<Option<T>, Error> {
    match lookup(variable) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config {
                variable: variable.to_string(),
                value,
            }),
    }
}

/// Arguments handed to a host bridge.
pub struct BridgeCall<'a> {
    pub heap: &'a mut Heap,
    /// Receiver of instance calls, `None` for static ones.
    pub receiver: Option<Value>,
    pub args: &'a [Value],
}

/// Host function standing in for a Java method. The returned value is
/// pushed for non-void descriptors and dropped otherwise.
pub type Bridge = Rc<dyn Fn(BridgeCall<'_>) -> Result<Value>>;

/// What the run loop does after an instruction.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Control {
    Advance,
    JumpTo(usize),
    Return(Option<Value>),
}

/// Execution environment for one method invocation: locals, operand
/// stack and instruction pointer.
#[derive(Debug)]
pub struct Frame {
    /// `None` marks a slot that was never written.
    pub locals: Vec<Option<Value>>,
    pub stack: Vec<Value>,
    pub ip: usize,
    pub method: Rc<LoadedMethod>,
    pub receiver: Option<ObjectRef>,
}

impl Frame {
    /// Build a frame with the receiver in slot 0 for instance methods and
    /// the arguments after it. Wide parameters take two slots.
    pub fn new(method: Rc<LoadedMethod>, receiver: Option<Value>, args: &[Value]) -> Result<Self> {
        let expected = method.descriptor.arg_count();
        if args.len() != expected {
            return Err(RuntimeError::type_mismatch(format!(
                "{}.{}{} takes {expected} argument(s), got {}",
                method.class,
                method.name(),
                method.ir.descriptor,
                args.len()
            )));
        }
        let mut frame = Self {
            locals: vec![None; method.ir.max_locals as usize],
            stack: Vec::with_capacity(method.ir.max_stack as usize),
            ip: 0,
            receiver: None,
            method: Rc::clone(&method),
        };

        let mut slot = 0;
        if let Some(receiver) = receiver {
            frame.receiver = match receiver {
                Value::Ref(handle) => Some(handle),
                other => {
                    return Err(RuntimeError::type_mismatch(format!(
                        "receiver must be a reference, got {}",
                        other.kind()
                    )))
                }
            };
            frame.store(0, receiver)?;
            slot = 1;
        }
        for (ty, value) in method.descriptor.arg_types.iter().zip(args) {
            check_type(ty, *value)?;
            frame.store(slot, *value)?;
            slot += ty.size();
        }
        Ok(frame)
    }

    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub fn pop(&mut self) -> Result<Value> {
        self.stack.pop().ok_or_else(|| {
            RuntimeError::new(RuntimeErrorKind::StackUnderflow, "pop from an empty operand stack")
        })
    }

    pub fn peek(&self) -> Result<Value> {
        self.stack.last().copied().ok_or_else(|| {
            RuntimeError::new(RuntimeErrorKind::StackUnderflow, "peek at an empty operand stack")
        })
    }

    pub fn pop_int(&mut self) -> Result<i32> {
        match self.pop()? {
            Value::Int(v) => Ok(v),
            other => Err(RuntimeError::type_mismatch(format!(
                "expected int on the stack, found {}",
                other.kind()
            ))),
        }
    }

    /// Pop a reference or null.
    pub fn pop_ref(&mut self) -> Result<Value> {
        let value = self.pop()?;
        if !value.is_reference() {
            return Err(RuntimeError::type_mismatch(format!(
                "expected reference on the stack, found {}",
                value.kind()
            )));
        }
        Ok(value)
    }

    /// Pop the `count` topmost values, first argument first.
    pub fn pop_args(&mut self, count: usize) -> Result<Vec<Value>> {
        if self.stack.len() < count {
            return Err(RuntimeError::new(
                RuntimeErrorKind::StackUnderflow,
                format!("call needs {count} argument(s), stack holds {}", self.stack.len()),
            ));
        }
        Ok(self.stack.split_off(self.stack.len() - count))
    }

    pub fn load(&self, index: usize) -> Result<Value> {
        match self.locals.get(index) {
            Some(Some(value)) => Ok(*value),
            Some(None) => Err(RuntimeError::new(
                RuntimeErrorKind::InvalidLocal,
                format!("local {index} read before it was written"),
            )),
            None => Err(self.local_out_of_range(index)),
        }
    }

    pub fn store(&mut self, index: usize, value: Value) -> Result<()> {
        if index >= self.locals.len() {
            return Err(self.local_out_of_range(index));
        }
        self.locals[index] = Some(value);
        Ok(())
    }

    fn local_out_of_range(&self, index: usize) -> RuntimeError {
        RuntimeError::new(
            RuntimeErrorKind::InvalidLocal,
            format!(
                "local {index} is outside of the {} declared local(s)",
                self.locals.len()
            ),
        )
    }
}

fn check_type(ty: &Type, value: Value) -> Result<()> {
    let ok = if ty.is_int_like() {
        matches!(value, Value::Int(_))
    } else {
        value.is_reference()
    };
    if ok {
        Ok(())
    } else {
        Err(RuntimeError::type_mismatch(format!(
            "parameter of type {ty} cannot take {} value {value}",
            value.kind()
        )))
    }
}

/// `Runtime` executes normalized programs. It owns the manifest, the
/// bridge table, the heap and the static fields; nothing is global.
pub struct Runtime {
    manifest: Manifest,
    bridges: HashMap<MethodKey, Bridge>,
    heap: Heap,
    statics: HashMap<(String, String), Value>,
    // Classes whose <clinit> has started.
    initialized: HashSet<String>,
    // Classes whose <clinit> failed.
    erroneous: HashSet<String>,
    config: RuntimeConfig,
    profiler: Profiler,
    depth: usize,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("classes", &self.manifest.len())
            .field("bridges", &self.bridges.len())
            .field("heap_objects", &self.heap.len())
            .field("config", &self.config)
            .finish()
    }
}

impl Runtime {
    pub fn new(manifest: Manifest) -> Self {
        Self::with_config(manifest, RuntimeConfig::default())
    }

    pub fn with_config(manifest: Manifest, config: RuntimeConfig) -> Self {
        let mut runtime = Self {
            manifest,
            bridges: HashMap::new(),
            heap: Heap::new(),
            statics: HashMap::new(),
            initialized: HashSet::new(),
            erroneous: HashSet::new(),
            profiler: Profiler::new(config.hot_loop_threshold, config.instruction_budget),
            config,
            depth: 0,
        };
        // Every constructor chain ends here.
        runtime.register_bridge(ROOT_CLASS, "<init>", "()V", |_| Ok(Value::Null));
        runtime
    }

    /// Register `handler` for `class.method descriptor`. A bridge takes
    /// precedence over an interpreted method with the same key.
    pub fn register_bridge<F>(&mut self, class: &str, method: &str, descriptor: &str, handler: F)
    where
        F: Fn(BridgeCall<'_>) -> Result<Value> + 'static,
    {
        let key = MethodKey::new(class, method, descriptor);
        debug!(bridge = %key, "registered bridge");
        self.bridges.insert(key, Rc::new(handler));
    }

    /// Call a static method from the host.
    pub fn invoke_static(
        &mut self,
        class: &str,
        method: &str,
        descriptor: &str,
        args: &[Value],
    ) -> Result<Option<Value>> {
        let key = MethodKey::new(class, method, descriptor);
        let parsed = MethodDescriptor::parse(descriptor)
            .map_err(|err| RuntimeError::bad_operand(err.to_string()))?;
        let result = if let Some(bridge) = self.bridges.get(&key).cloned() {
            self.call_bridge(&bridge, &key, &parsed, None, args.to_vec())?
        } else {
            let target = self.static_method(&key)?;
            self.ensure_initialized(&key.class)?;
            self.execute(target, None, args)?
        };
        debug!(
            method = %key,
            executed = self.profiler.executed(),
            "invocation finished"
        );
        Ok(result)
    }

    /// Overwrite a static field, e.g. to provide `System.out`.
    pub fn set_static(&mut self, class: &str, field: &str, value: Value) {
        self.statics
            .insert((canonical_name(class), field.to_string()), value);
    }

    /// Current value of a static field that has been written, without
    /// running any class initializer.
    pub fn get_static(&self, class: &str, field: &str) -> Option<Value> {
        self.statics
            .get(&(canonical_name(class), field.to_string()))
            .copied()
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn profiler(&self) -> &Profiler {
        &self.profiler
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    fn static_method(&self, key: &MethodKey) -> Result<Rc<LoadedMethod>> {
        let method = self
            .manifest
            .find_method(key)
            .ok_or_else(|| RuntimeError::lookup(format!("no method or bridge for {key}")))?;
        if !method.is_static() {
            return Err(RuntimeError::lookup(format!("{key} is not static")));
        }
        Ok(method)
    }

    /// Run `<clinit>` the first time an interpreted class is touched.
    /// A class whose initializer failed stays unusable.
    fn ensure_initialized(&mut self, class: &str) -> Result<()> {
        if self.erroneous.contains(class) {
            return Err(RuntimeError::lookup(format!(
                "class {class} failed to initialize"
            )));
        }
        if self.initialized.contains(class) {
            return Ok(());
        }
        let Some(loaded) = self.manifest.class(class) else {
            return Ok(());
        };
        let clinit = loaded.method("<clinit>", "()V").cloned();
        self.initialized.insert(class.to_string());
        if let Some(clinit) = clinit {
            debug!(class, "running class initializer");
            if let Err(err) = self.execute(clinit, None, &[]) {
                warn!(class, error = %err, "class initializer failed");
                self.erroneous.insert(class.to_string());
                return Err(err);
            }
        }
        Ok(())
    }

    fn execute(
        &mut self,
        method: Rc<LoadedMethod>,
        receiver: Option<Value>,
        args: &[Value],
    ) -> Result<Option<Value>> {
        if self.depth >= self.config.max_call_depth {
            return Err(RuntimeError::new(
                RuntimeErrorKind::CallDepthExceeded,
                format!(
                    "calling {}.{}{} exceeds the depth limit of {}",
                    method.class,
                    method.name(),
                    method.ir.descriptor,
                    self.config.max_call_depth
                ),
            ));
        }
        let mut frame = Frame::new(method, receiver, args)?;
        self.depth += 1;
        let result = self.run(&mut frame);
        self.depth -= 1;
        result
    }

    /// Interpret `frame` until its method returns.
    fn run(&mut self, frame: &mut Frame) -> Result<Option<Value>> {
        let method = Rc::clone(&frame.method);
        loop {
            let index = frame.ip;
            let Some(insn) = method.ir.instructions.get(index) else {
                return Err(RuntimeError::new(
                    RuntimeErrorKind::FellOffEnd,
                    format!("no instruction at index {index}"),
                )
                .at(location(&method, index.saturating_sub(1))));
            };
            self.profiler
                .count_instruction()
                .map_err(|err| err.at(location(&method, index)))?;
            trace!(
                method = method.name(),
                index,
                offset = insn.offset,
                opcode = %insn.opcode,
                depth = frame.stack.len(),
                "dispatch"
            );
            match self
                .step(frame, insn)
                .map_err(|err| err.at(location(&method, index)))?
            {
                Control::Advance => frame.ip += 1,
                Control::JumpTo(target) => {
                    self.profiler.count_jump(
                        ProgramCounter::new(method.id, index),
                        ProgramCounter::new(method.id, target),
                    );
                    frame.ip = target;
                }
                Control::Return(value) => return Ok(value),
            }
        }
    }

    /// Evaluate a single instruction.
    fn step(&mut self, frame: &mut Frame, insn: &Instruction) -> Result<Control> {
        match &insn.opcode {
            OPCode::Nop => {}
            OPCode::AconstNull => frame.push(Value::Null),
            OPCode::Iconst | OPCode::Bipush | OPCode::Sipush => {
                frame.push(Value::Int(int_operand(insn, 0)?))
            }
            OPCode::Lconst => {
                let value = self.heap.alloc(HeapObject::Long(int_operand(insn, 0)?.into()));
                frame.push(Value::Ref(value));
            }
            OPCode::Fconst => {
                let value = self.heap.alloc(HeapObject::Float(int_operand(insn, 0)? as f32));
                frame.push(Value::Ref(value));
            }
            OPCode::Dconst => {
                let value = self.heap.alloc(HeapObject::Double(int_operand(insn, 0)?.into()));
                frame.push(Value::Ref(value));
            }
            OPCode::Ldc | OPCode::LdcW | OPCode::Ldc2W => {
                let value = self.load_constant(constant_operand(insn)?);
                frame.push(value);
            }

            OPCode::Iload => {
                let value = frame.load(local_operand(insn)?)?;
                if value.as_int().is_none() {
                    return Err(RuntimeError::type_mismatch(format!(
                        "ILOAD of a {} local",
                        value.kind()
                    )));
                }
                frame.push(value);
            }
            OPCode::Aload => {
                let value = frame.load(local_operand(insn)?)?;
                if !value.is_reference() {
                    return Err(RuntimeError::type_mismatch("ALOAD of an int local"));
                }
                frame.push(value);
            }
            OPCode::Lload | OPCode::Fload | OPCode::Dload => {
                let value = frame.load(local_operand(insn)?)?;
                frame.push(value);
            }
            OPCode::Istore => {
                let value = frame.pop_int()?;
                frame.store(local_operand(insn)?, Value::Int(value))?;
            }
            OPCode::Astore => {
                let value = frame.pop_ref()?;
                frame.store(local_operand(insn)?, value)?;
            }
            OPCode::Lstore | OPCode::Fstore | OPCode::Dstore => {
                let value = frame.pop()?;
                frame.store(local_operand(insn)?, value)?;
            }
            OPCode::Iinc => {
                let index = local_operand(insn)?;
                let delta = int_operand(insn, 1)?;
                let current = match frame.load(index)? {
                    Value::Int(v) => v,
                    other => {
                        return Err(RuntimeError::type_mismatch(format!(
                            "IINC of a {} local",
                            other.kind()
                        )))
                    }
                };
                frame.store(index, Value::Int(current.wrapping_add(delta)))?;
            }

            OPCode::Iaload | OPCode::Baload | OPCode::Caload | OPCode::Saload => {
                let index = frame.pop_int()?;
                let array = non_null(frame.pop_ref()?)?;
                let elements = self.int_array(array)?;
                let value = elements[array_index(elements.len(), index)?];
                frame.push(Value::Int(value));
            }
            OPCode::Aaload => {
                let index = frame.pop_int()?;
                let array = non_null(frame.pop_ref()?)?;
                let elements = self.ref_array(array)?;
                let value = elements[array_index(elements.len(), index)?];
                frame.push(value);
            }
            OPCode::Iastore | OPCode::Bastore | OPCode::Castore | OPCode::Sastore => {
                let value = frame.pop_int()?;
                let index = frame.pop_int()?;
                let array = non_null(frame.pop_ref()?)?;
                self.store_int_element(&insn.opcode, array, index, value)?;
            }
            OPCode::Aastore => {
                let value = frame.pop_ref()?;
                let index = frame.pop_int()?;
                let array = non_null(frame.pop_ref()?)?;
                let elements = self.ref_array_mut(array)?;
                let slot = array_index(elements.len(), index)?;
                elements[slot] = value;
            }
            OPCode::Arraylength => {
                let array = non_null(frame.pop_ref()?)?;
                let length = match self.heap.get(array) {
                    Some(HeapObject::IntArray { elements, .. }) => elements.len(),
                    Some(HeapObject::RefArray { elements, .. }) => elements.len(),
                    other => return Err(not_an("array", other)),
                };
                frame.push(Value::Int(length as i32));
            }

            OPCode::Pop => {
                frame.pop()?;
            }
            OPCode::Pop2 => {
                let top = frame.pop()?;
                if !self.heap.is_wide(top) {
                    frame.pop()?;
                }
            }
            OPCode::Dup => {
                let top = frame.peek()?;
                frame.push(top);
            }
            OPCode::DupX1 => {
                let v1 = frame.pop()?;
                let v2 = frame.pop()?;
                frame.stack.extend([v1, v2, v1]);
            }
            OPCode::DupX2 => {
                let v1 = frame.pop()?;
                let v2 = frame.pop()?;
                if self.heap.is_wide(v2) {
                    frame.stack.extend([v1, v2, v1]);
                } else {
                    let v3 = frame.pop()?;
                    frame.stack.extend([v1, v3, v2, v1]);
                }
            }
            OPCode::Dup2 => {
                let v1 = frame.pop()?;
                if self.heap.is_wide(v1) {
                    frame.stack.extend([v1, v1]);
                } else {
                    let v2 = frame.pop()?;
                    frame.stack.extend([v2, v1, v2, v1]);
                }
            }
            OPCode::Swap => {
                let v1 = frame.pop()?;
                let v2 = frame.pop()?;
                frame.stack.extend([v1, v2]);
            }

            OPCode::Iadd => binary(frame, |a, b| Ok(a.wrapping_add(b)))?,
            OPCode::Isub => binary(frame, |a, b| Ok(a.wrapping_sub(b)))?,
            OPCode::Imul => binary(frame, |a, b| Ok(a.wrapping_mul(b)))?,
            OPCode::Idiv => binary(frame, |a, b| {
                divisor(b)?;
                Ok(a.wrapping_div(b))
            })?,
            OPCode::Irem => binary(frame, |a, b| {
                divisor(b)?;
                Ok(a.wrapping_rem(b))
            })?,
            OPCode::Ishl => binary(frame, |a, b| Ok(a.wrapping_shl(b as u32 & 31)))?,
            OPCode::Ishr => binary(frame, |a, b| Ok(a >> (b & 31)))?,
            OPCode::Iushr => binary(frame, |a, b| Ok(((a as u32) >> (b & 31)) as i32))?,
            OPCode::Iand => binary(frame, |a, b| Ok(a & b))?,
            OPCode::Ior => binary(frame, |a, b| Ok(a | b))?,
            OPCode::Ixor => binary(frame, |a, b| Ok(a ^ b))?,
            OPCode::Ineg => unary(frame, i32::wrapping_neg)?,
            OPCode::I2b => unary(frame, |v| v as i8 as i32)?,
            OPCode::I2c => unary(frame, |v| v as u16 as i32)?,
            OPCode::I2s => unary(frame, |v| v as i16 as i32)?,

            OPCode::Ifeq => return branch_if(insn, frame.pop_int()? == 0),
            OPCode::Ifne => return branch_if(insn, frame.pop_int()? != 0),
            OPCode::Iflt => return branch_if(insn, frame.pop_int()? < 0),
            OPCode::Ifge => return branch_if(insn, frame.pop_int()? >= 0),
            OPCode::Ifgt => return branch_if(insn, frame.pop_int()? > 0),
            OPCode::Ifle => return branch_if(insn, frame.pop_int()? <= 0),
            OPCode::IfIcmpeq
            | OPCode::IfIcmpne
            | OPCode::IfIcmplt
            | OPCode::IfIcmpge
            | OPCode::IfIcmpgt
            | OPCode::IfIcmple => {
                let b = frame.pop_int()?;
                let a = frame.pop_int()?;
                let taken = match insn.opcode {
                    OPCode::IfIcmpeq => a == b,
                    OPCode::IfIcmpne => a != b,
                    OPCode::IfIcmplt => a < b,
                    OPCode::IfIcmpge => a >= b,
                    OPCode::IfIcmpgt => a > b,
                    _ => a <= b,
                };
                return branch_if(insn, taken);
            }
            OPCode::IfAcmpeq | OPCode::IfAcmpne => {
                let b = frame.pop_ref()?;
                let a = frame.pop_ref()?;
                return branch_if(insn, (a == b) == (insn.opcode == OPCode::IfAcmpeq));
            }
            OPCode::Ifnull => return branch_if(insn, frame.pop_ref()? == Value::Null),
            OPCode::Ifnonnull => return branch_if(insn, frame.pop_ref()? != Value::Null),
            OPCode::Goto | OPCode::GotoW => return branch_if(insn, true),

            OPCode::Ireturn => return Ok(Control::Return(Some(Value::Int(frame.pop_int()?)))),
            OPCode::Areturn => return Ok(Control::Return(Some(frame.pop_ref()?))),
            OPCode::Lreturn | OPCode::Freturn | OPCode::Dreturn => {
                return Ok(Control::Return(Some(frame.pop()?)))
            }
            OPCode::Return => return Ok(Control::Return(None)),

            OPCode::Getstatic => {
                let field = field_operand(insn)?;
                self.ensure_initialized(&field.owner)?;
                let value = self
                    .statics
                    .get(&(field.owner.clone(), field.name.clone()))
                    .copied()
                    .unwrap_or_else(|| Value::default_for(&field.descriptor));
                frame.push(value);
            }
            OPCode::Putstatic => {
                let field = field_operand(insn)?;
                let value = frame.pop()?;
                check_field(field, value)?;
                self.ensure_initialized(&field.owner)?;
                self.statics
                    .insert((field.owner.clone(), field.name.clone()), value);
            }
            OPCode::Getfield => {
                let field = field_operand(insn)?;
                let object = non_null(frame.pop_ref()?)?;
                let value = match self.heap.get(object) {
                    Some(HeapObject::Instance { fields, .. }) => fields
                        .get(&field.name)
                        .copied()
                        .unwrap_or_else(|| Value::default_for(&field.descriptor)),
                    other => return Err(not_an("instance", other)),
                };
                frame.push(value);
            }
            OPCode::Putfield => {
                let field = field_operand(insn)?;
                let value = frame.pop()?;
                check_field(field, value)?;
                let object = non_null(frame.pop_ref()?)?;
                match self.heap.get_mut(object) {
                    Some(HeapObject::Instance { fields, .. }) => {
                        fields.insert(field.name.clone(), value);
                    }
                    other => return Err(not_an("instance", other.as_deref())),
                }
            }

            OPCode::Invokestatic
            | OPCode::Invokespecial
            | OPCode::Invokevirtual
            | OPCode::Invokeinterface => self.invoke(frame, insn)?,

            OPCode::New => {
                let class = class_operand(insn)?;
                self.ensure_initialized(class)?;
                let object = self.heap.alloc(HeapObject::Instance {
                    class: class.to_string(),
                    fields: HashMap::new(),
                });
                frame.push(Value::Ref(object));
            }
            OPCode::Newarray => {
                let component = primitive_component(insn)?;
                let length = array_length(frame.pop_int()?)?;
                let array = self.heap.alloc(HeapObject::IntArray {
                    component,
                    elements: vec![0; length],
                });
                frame.push(Value::Ref(array));
            }
            OPCode::Anewarray => {
                let component = class_operand(insn)?.to_string();
                let length = array_length(frame.pop_int()?)?;
                let array = self.heap.alloc(HeapObject::RefArray {
                    component,
                    elements: vec![Value::Null; length],
                });
                frame.push(Value::Ref(array));
            }
            OPCode::Checkcast => {
                frame.peek()?;
            }
            OPCode::Monitorenter | OPCode::Monitorexit => {
                non_null(frame.pop_ref()?)?;
            }

            other => {
                return Err(RuntimeError::new(
                    RuntimeErrorKind::UnsupportedOperation,
                    format!("{other} is not supported"),
                ))
            }
        }
        Ok(Control::Advance)
    }

    fn invoke(&mut self, frame: &mut Frame, insn: &Instruction) -> Result<()> {
        let target = method_operand(insn)?;
        let descriptor = MethodDescriptor::parse(&target.descriptor)
            .map_err(|err| RuntimeError::bad_operand(err.to_string()))?;
        let args = frame.pop_args(descriptor.arg_count())?;
        let receiver = match insn.opcode {
            OPCode::Invokestatic => None,
            _ => Some(frame.pop_ref()?),
        };
        let key = MethodKey::new(&target.owner, &target.name, &target.descriptor);

        let result = if let Some(bridge) = self.bridges.get(&key).cloned() {
            self.call_bridge(&bridge, &key, &descriptor, receiver, args)?
        } else {
            match insn.opcode {
                OPCode::Invokestatic => {
                    let method = self.static_method(&key)?;
                    self.ensure_initialized(&key.class)?;
                    self.execute(method, None, &args)?
                }
                OPCode::Invokespecial => {
                    let receiver = receiver.unwrap_or(Value::Null);
                    non_null(receiver)?;
                    let method = self
                        .manifest
                        .find_method(&key)
                        .ok_or_else(|| RuntimeError::lookup(format!("no method or bridge for {key}")))?;
                    if method.is_static() {
                        return Err(RuntimeError::lookup(format!("{key} is static")));
                    }
                    self.execute(method, Some(receiver), &args)?
                }
                _ => {
                    return Err(RuntimeError::lookup(format!(
                        "virtual call to {key} needs a bridge"
                    )))
                }
            }
        };

        if descriptor.returns_value() {
            let value = result.ok_or_else(|| {
                RuntimeError::type_mismatch(format!("{key} returned no value"))
            })?;
            frame.push(value);
        }
        Ok(())
    }

    fn call_bridge(
        &mut self,
        bridge: &Bridge,
        key: &MethodKey,
        descriptor: &MethodDescriptor,
        receiver: Option<Value>,
        args: Vec<Value>,
    ) -> Result<Option<Value>> {
        if args.len() != descriptor.arg_count() {
            return Err(RuntimeError::type_mismatch(format!(
                "{key} takes {} argument(s), got {}",
                descriptor.arg_count(),
                args.len()
            )));
        }
        trace!(bridge = %key, "calling bridge");
        let value = (**bridge)(BridgeCall {
            heap: &mut self.heap,
            receiver,
            args: &args,
        })
        .map_err(|err| RuntimeError::new(RuntimeErrorKind::Bridge, format!("{key}: {err}")))?;
        Ok(descriptor.returns_value().then_some(value))
    }

    fn load_constant(&mut self, constant: &Constant) -> Value {
        match constant {
            Constant::Int(v) => Value::Int(*v),
            Constant::String(text) => Value::Ref(self.heap.intern_string(text)),
            Constant::Class(name) => Value::Ref(self.heap.class_literal(name)),
            Constant::Float(v) => Value::Ref(self.heap.alloc(HeapObject::Float(*v))),
            Constant::Long(v) => Value::Ref(self.heap.alloc(HeapObject::Long(*v))),
            Constant::Double(v) => Value::Ref(self.heap.alloc(HeapObject::Double(*v))),
        }
    }

    fn int_array(&self, array: ObjectRef) -> Result<&Vec<i32>> {
        match self.heap.get(array) {
            Some(HeapObject::IntArray { elements, .. }) => Ok(elements),
            other => Err(not_an("int array", other)),
        }
    }

    fn ref_array(&self, array: ObjectRef) -> Result<&Vec<Value>> {
        match self.heap.get(array) {
            Some(HeapObject::RefArray { elements, .. }) => Ok(elements),
            other => Err(not_an("reference array", other)),
        }
    }

    fn ref_array_mut(&mut self, array: ObjectRef) -> Result<&mut Vec<Value>> {
        match self.heap.get_mut(array) {
            Some(HeapObject::RefArray { elements, .. }) => Ok(elements),
            other => Err(not_an("reference array", other.as_deref())),
        }
    }

    fn store_int_element(
        &mut self,
        opcode: &OPCode,
        array: ObjectRef,
        index: i32,
        value: i32,
    ) -> Result<()> {
        let (component, elements) = match self.heap.get_mut(array) {
            Some(HeapObject::IntArray {
                component,
                elements,
            }) => (*component, elements),
            other => return Err(not_an("int array", other.as_deref())),
        };
        let slot = array_index(elements.len(), index)?;
        elements[slot] = match (opcode, component) {
            (OPCode::Bastore, BaseTypeKind::Boolean) => value & 1,
            (OPCode::Bastore, _) => value as i8 as i32,
            (OPCode::Castore, _) => value as u16 as i32,
            (OPCode::Sastore, _) => value as i16 as i32,
            _ => value,
        };
        Ok(())
    }
}

fn location(method: &LoadedMethod, index: usize) -> Location {
    let insn = method.ir.instructions.get(index);
    Location {
        class: method.class.clone(),
        method: method.name().to_string(),
        descriptor: method.ir.descriptor.clone(),
        index,
        offset: insn.map_or(0, |i| i.offset),
        opcode: insn.map_or_else(String::new, |i| i.opcode.to_string()),
    }
}

fn binary(frame: &mut Frame, op: impl Fn(i32, i32) -> Result<i32>) -> Result<()> {
    let b = frame.pop_int()?;
    let a = frame.pop_int()?;
    frame.push(Value::Int(op(a, b)?));
    Ok(())
}

fn unary(frame: &mut Frame, op: impl Fn(i32) -> i32) -> Result<()> {
    let v = frame.pop_int()?;
    frame.push(Value::Int(op(v)));
    Ok(())
}

fn divisor(b: i32) -> Result<()> {
    if b == 0 {
        return Err(RuntimeError::new(RuntimeErrorKind::Arithmetic, "/ by zero"));
    }
    Ok(())
}

fn branch_if(insn: &Instruction, taken: bool) -> Result<Control> {
    let target = match insn.operand(0) {
        Some(Operand::BranchTarget(target)) => *target,
        other => return Err(unexpected_operand("a branch target", other)),
    };
    Ok(if taken {
        Control::JumpTo(target)
    } else {
        Control::Advance
    })
}

fn non_null(value: Value) -> Result<ObjectRef> {
    match value {
        Value::Ref(handle) => Ok(handle),
        Value::Null => Err(RuntimeError::new(
            RuntimeErrorKind::NullReference,
            "dereferenced null",
        )),
        Value::Int(_) => Err(RuntimeError::type_mismatch("expected a reference, found int")),
    }
}

fn not_an(expected: &str, found: Option<&HeapObject>) -> RuntimeError {
    match found {
        Some(object) => RuntimeError::type_mismatch(format!(
            "expected {expected}, found {}",
            object.kind()
        )),
        None => RuntimeError::type_mismatch(format!("expected {expected}, found a dangling reference")),
    }
}

fn check_field(field: &MemberRef, value: Value) -> Result<()> {
    let (ty, _) = Type::decode(&field.descriptor).map_err(RuntimeError::bad_operand)?;
    check_type(&ty, value)
}

fn array_index(length: usize, index: i32) -> Result<usize> {
    usize::try_from(index)
        .ok()
        .filter(|index| *index < length)
        .ok_or_else(|| {
            RuntimeError::new(
                RuntimeErrorKind::IndexOutOfBounds,
                format!("index {index} out of bounds for length {length}"),
            )
        })
}

fn array_length(count: i32) -> Result<usize> {
    usize::try_from(count).map_err(|_| {
        RuntimeError::new(
            RuntimeErrorKind::IndexOutOfBounds,
            format!("negative array size {count}"),
        )
    })
}

/// Component of `NEWARRAY`, given by name (`int`) or by type code (10).
fn primitive_component(insn: &Instruction) -> Result<BaseTypeKind> {
    let component = match insn.operand(0) {
        Some(Operand::Raw(name)) => match name.as_str() {
            "boolean" => Some(BaseTypeKind::Boolean),
            "char" => Some(BaseTypeKind::Char),
            "byte" => Some(BaseTypeKind::Byte),
            "short" => Some(BaseTypeKind::Short),
            "int" => Some(BaseTypeKind::Int),
            _ => None,
        },
        Some(Operand::IntLiteral(code)) => match *code {
            4 => Some(BaseTypeKind::Boolean),
            5 => Some(BaseTypeKind::Char),
            8 => Some(BaseTypeKind::Byte),
            9 => Some(BaseTypeKind::Short),
            10 => Some(BaseTypeKind::Int),
            _ => None,
        },
        other => return Err(unexpected_operand("an array component type", other)),
    };
    component.ok_or_else(|| {
        RuntimeError::new(
            RuntimeErrorKind::UnsupportedOperation,
            format!(
                "arrays of {} are not supported",
                insn.operands
                    .first()
                    .map_or_else(String::new, ToString::to_string)
            ),
        )
    })
}

fn unexpected_operand(expected: &str, found: Option<&Operand>) -> RuntimeError {
    match found {
        Some(operand) => RuntimeError::bad_operand(format!("expected {expected}, found {operand}")),
        None => RuntimeError::bad_operand(format!("expected {expected}, found nothing")),
    }
}

fn int_operand(insn: &Instruction, position: usize) -> Result<i32> {
    match insn.operand(position) {
        Some(Operand::IntLiteral(v)) => Ok(*v),
        other => Err(unexpected_operand("an integer", other)),
    }
}

fn local_operand(insn: &Instruction) -> Result<usize> {
    match insn.operand(0) {
        Some(Operand::LocalIndex(index)) => Ok(*index as usize),
        other => Err(unexpected_operand("a local index", other)),
    }
}

fn constant_operand(insn: &Instruction) -> Result<&Constant> {
    match insn.operand(0) {
        Some(Operand::ConstLiteral(constant)) => Ok(constant),
        other => Err(unexpected_operand("a constant", other)),
    }
}

fn field_operand(insn: &Instruction) -> Result<&MemberRef> {
    match insn.operand(0) {
        Some(Operand::FieldRef(field)) => Ok(field),
        other => Err(unexpected_operand("a field reference", other)),
    }
}

fn method_operand(insn: &Instruction) -> Result<&MemberRef> {
    match insn.operand(0) {
        Some(Operand::MethodRef(method)) => Ok(method),
        other => Err(unexpected_operand("a method reference", other)),
    }
}

fn class_operand(insn: &Instruction) -> Result<&str> {
    match insn.operand(0) {
        Some(Operand::ClassRef(name)) => Ok(name),
        other => Err(unexpected_operand("a class reference", other)),
    }
}
