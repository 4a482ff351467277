//! The dispatch loop.
//!
//! One [`Interpreter`] drives one call stack over a shared [`Program`] and
//! a shared heap. Execution is a sequence of [`Interpreter::step`]s: each
//! step first checks for cancellation, then passes a GC safepoint, then
//! either executes one instruction or performs one unwinding transition.

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use super::cancel::CancelToken;
use super::frame::CallStack;
use super::ops::{self, Arith, ArithResult, Interrupt, OpResult};
use super::unwind::{catches, Exception};
use crate::config::RuntimeConfig;
use crate::error::{FaultKind, InvokeError, Trap};
use crate::heap::{Handle, Heap, HeapObject, HostValue, Mutator, SharedHeap, Value};
use crate::link::{FunctionKey, Program, TypeKey};
use crate::object::instruction::InstructionError;
use crate::object::{Constant, Function, ImportId, Instruction, StringId, SymbolKind, TypeKind, TypeRef};

/// Where an interpreter is in its life.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecState {
    Running,
    /// Looking for a handler for an exception, one frame per step.
    Unwinding(Exception),
    /// The entry function returned.
    Returned(Value),
    Trapped(Trap),
}

impl ExecState {
    pub fn is_finished(&self) -> bool {
        matches!(self, ExecState::Returned(_) | ExecState::Trapped(_))
    }
}

pub struct Interpreter {
    program: Arc<Program>,
    heap: Arc<SharedHeap>,
    mutator: Mutator,
    stack: CallStack,
    state: ExecState,
    config: RuntimeConfig,
    cancel: CancelToken,
    ticks: u64,
}

impl Interpreter {
    /// Attach a new call stack to `heap`. It stays attached until dropped.
    pub fn new(
        program: Arc<Program>,
        heap: &Arc<SharedHeap>,
        config: RuntimeConfig,
        cancel: CancelToken,
    ) -> Self {
        heap.register_statics(program.statics());
        Self {
            program,
            mutator: heap.attach(),
            heap: Arc::clone(heap),
            stack: CallStack::new(config.max_frames, config.max_operand_stack),
            state: ExecState::Trapped(Trap::corrupted("no invocation started")),
            config,
            cancel,
            ticks: 0,
        }
    }

    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    pub fn state(&self) -> &ExecState {
        &self.state
    }

    pub fn depth(&self) -> usize {
        self.stack.depth()
    }

    /// Prepare a call of `entry` with host arguments.
    pub fn start(&mut self, entry: FunctionKey, args: &[HostValue]) -> Result<(), InvokeError> {
        let name = self.program.function_name(entry);
        let function = self
            .program
            .function(entry)
            .ok_or_else(|| InvokeError::UnknownEntry(name.clone()))?;
        if !function.accepts(args.len()) {
            return Err(InvokeError::WrongArity {
                name,
                expected: function.arity as usize,
                got: args.len(),
            });
        }
        let (arity, locals, max_stack) = (
            frame_arity(function),
            function.locals as usize,
            function.max_stack as usize,
        );
        let fixed = function.arity as usize;
        let variadic = function.variadic;

        let values = self.heap.with(|heap| {
            let mut values = args
                .iter()
                .map(|arg| arg.to_value(heap))
                .collect::<Result<Vec<_>, _>>()?;
            if variadic {
                let rest = values.split_off(fixed);
                values.push(Value::Ref(heap.alloc(HeapObject::List(rest))));
            }
            Ok::<_, InvokeError>(values)
        })?;

        debug!(entry = %name, args = args.len(), "starting invocation");
        self.stack = CallStack::new(self.config.max_frames, self.config.max_operand_stack);
        self.ticks = 0;
        self.state = match self.enter(entry, values, arity, locals, max_stack) {
            Ok(()) => ExecState::Running,
            Err(trap) => ExecState::Trapped(trap),
        };
        Ok(())
    }

    fn enter(
        &mut self,
        entry: FunctionKey,
        values: Vec<Value>,
        arity: usize,
        locals: usize,
        max_stack: usize,
    ) -> Result<(), Trap> {
        for value in values {
            self.stack.push(value)?;
        }
        self.stack.push_frame(entry, None, arity, locals, max_stack)
    }

    /// Run until the invocation returns or traps.
    pub fn run(&mut self) -> Result<Value, Trap> {
        while self.step() {}
        match &self.state {
            ExecState::Returned(value) => Ok(*value),
            ExecState::Trapped(trap) => Err(trap.clone()),
            _ => Err(Trap::corrupted("interpreter stopped before finishing")),
        }
    }

    /// Copy a value out of the heap for the host.
    pub fn to_host(&self, value: Value) -> Result<HostValue, Trap> {
        self.heap
            .with(|heap| HostValue::from_value(value, heap, &self.program))
    }

    /// Advance by one instruction or one unwinding transition. Returns
    /// whether there is more to do.
    pub fn step(&mut self) -> bool {
        if self.state.is_finished() {
            return false;
        }

        self.ticks += 1;
        let interval = u64::from(self.config.cancel_check_interval.max(1));
        if self.ticks % interval == 0 && self.cancel.is_cancelled() {
            warn!(depth = self.stack.depth(), "invocation cancelled");
            self.state = ExecState::Trapped(Trap::Cancelled);
            return false;
        }

        self.safepoint();

        let state = std::mem::replace(&mut self.state, ExecState::Running);
        self.state = match state {
            ExecState::Running => match self.execute() {
                Ok(next) => next,
                Err(Interrupt::Fault(kind)) => self.fault(kind),
                Err(Interrupt::Trap(trap)) => {
                    debug!(%trap, "trapped");
                    ExecState::Trapped(trap)
                }
            },
            ExecState::Unwinding(exception) => self.unwind(exception),
            finished => finished,
        };
        !self.state.is_finished()
    }

    fn roots(&self) -> Vec<Value> {
        let mut roots = self.stack.roots();
        if let ExecState::Unwinding(exception) = &self.state {
            roots.push(exception.value);
        }
        roots
    }

    fn safepoint(&self) {
        if self.heap.wants_collection() {
            if let Some(reclaimed) = self.mutator.collect(self.roots()) {
                trace!(reclaimed, "collected at safepoint");
            }
        } else {
            self.mutator.safepoint(|| self.roots());
        }
    }

    fn fault(&self, kind: FaultKind) -> ExecState {
        if !self.config.catchable.is_catchable(kind) {
            debug!(fault = %kind, "fault is not catchable");
            return ExecState::Trapped(Trap::Fault(kind));
        }
        match self.stack.frame() {
            Ok(frame) => ExecState::Unwinding(Exception {
                value: Value::Fault(kind),
                function: frame.function,
                site: frame.site,
            }),
            Err(trap) => ExecState::Trapped(trap),
        }
    }

    /// One unwinding transition: enter a handler of the active frame, or
    /// pop the frame and keep looking.
    fn unwind(&mut self, exception: Exception) -> ExecState {
        match self.find_handler(exception.value) {
            Ok(Some(target)) => match self.enter_handler(target, exception.value) {
                Ok(()) => ExecState::Running,
                Err(trap) => ExecState::Trapped(trap),
            },
            Ok(None) => {
                self.stack.pop_frame();
                if !self.stack.is_empty() {
                    return ExecState::Unwinding(exception);
                }
                debug!(
                    raised_in = %self.program.function_name(exception.function),
                    site = exception.site,
                    "uncaught exception"
                );
                match self.to_host(exception.value) {
                    Ok(value) => ExecState::Trapped(Trap::UncaughtException(value)),
                    Err(trap) => ExecState::Trapped(trap),
                }
            }
            Err(trap) => ExecState::Trapped(trap),
        }
    }

    fn find_handler(&self, value: Value) -> Result<Option<usize>, Trap> {
        let frame = self.stack.frame()?;
        let function = self
            .program
            .function(frame.function)
            .ok_or_else(|| Trap::corrupted("frame refers to a missing function"))?;
        let object = frame.function.object;
        self.heap.with(|heap| {
            for handler in &function.handlers {
                if handler.covers(frame.site)
                    && catches(heap, &self.program, object, handler.catch, value)?
                {
                    return Ok(Some(handler.target as usize));
                }
            }
            Ok(None)
        })
    }

    fn enter_handler(&mut self, target: usize, value: Value) -> Result<(), Trap> {
        self.stack.clear_operands()?;
        self.stack.push(value)?;
        let frame = self.stack.frame_mut()?;
        trace!(target, "entering handler");
        frame.ip = target;
        Ok(())
    }

    fn execute(&mut self) -> OpResult<ExecState> {
        let program = Arc::clone(&self.program);
        let heap = &*self.heap;
        let stack = &mut self.stack;

        let frame = stack.frame()?;
        let key = frame.function;
        let ip = frame.ip;
        let function = program
            .function(key)
            .ok_or_else(|| Trap::corrupted("frame refers to a missing function"))?;
        let (instruction, next) = Instruction::decode(&function.code, ip).map_err(|err| match err {
            InstructionError::UnknownOpcode(opcode) => Trap::InvalidOpcode {
                opcode,
                function: program.function_name(key),
                offset: ip,
            },
            InstructionError::Truncated => Trap::corrupted(format!(
                "truncated instruction at offset {} of {}",
                ip,
                program.function_name(key)
            )),
        })?;
        {
            let frame = stack.frame_mut()?;
            frame.site = ip;
            frame.ip = next;
        }
        trace!(function = key.function, ip, ?instruction);

        match instruction {
            Instruction::Nop => {}
            Instruction::Nil => stack.push(Value::Nil)?,
            Instruction::True => stack.push(Value::Bool(true))?,
            Instruction::False => stack.push(Value::Bool(false))?,
            Instruction::Const(id) => {
                let value = materialize(heap, &program, key.object, id)?;
                stack.push(value)?;
            }
            Instruction::Int(n) => stack.push(Value::Int(n))?,
            Instruction::Pop => {
                stack.pop()?;
            }
            Instruction::Dup => {
                let value = stack.peek(0)?;
                stack.push(value)?;
            }
            Instruction::Swap => {
                let b = stack.pop()?;
                let a = stack.pop()?;
                stack.push(b)?;
                stack.push(a)?;
            }
            Instruction::Pick(distance) => {
                let value = stack.peek(distance as usize)?;
                stack.push(value)?;
            }
            Instruction::LoadLocal(slot) => {
                let value = stack.local(slot)?;
                stack.push(value)?;
            }
            Instruction::StoreLocal(slot) => {
                let value = stack.pop()?;
                stack.set_local(slot, value)?;
            }
            Instruction::LoadCapture(index) => {
                let closure = stack
                    .frame()?
                    .closure
                    .ok_or_else(|| Trap::corrupted("capture load outside a closure"))?;
                let value = heap.with(|h| match h.get(closure)? {
                    HeapObject::Closure { captures, .. } => {
                        captures.get(index as usize).copied().ok_or_else(|| {
                            Trap::corrupted(format!("capture {} out of range", index))
                        })
                    }
                    other => Err(Trap::corrupted(format!(
                        "frame closure is a {}",
                        other.kind_name()
                    ))),
                })?;
                stack.push(value)?;
            }
            Instruction::LoadImport(import) => {
                let binding = bound(&program, key.object, import, SymbolKind::Value)?;
                let value = materialize(heap, &program, binding.0, binding.1)?;
                stack.push(value)?;
            }
            Instruction::LoadStatic(index) => {
                let value = program
                    .statics()
                    .get(key.object, index as usize)
                    .ok_or_else(|| Trap::corrupted(format!("static {} out of range", index)))?;
                stack.push(value)?;
            }
            Instruction::StoreStatic(index) => {
                let value = stack.pop()?;
                if !program.statics().set(key.object, index as usize, value) {
                    return Err(Trap::corrupted(format!("static {} out of range", index)).into());
                }
            }

            Instruction::Add => arithmetic(heap, stack, Arith::Add)?,
            Instruction::Sub => arithmetic(heap, stack, Arith::Sub)?,
            Instruction::Mul => arithmetic(heap, stack, Arith::Mul)?,
            Instruction::Div => arithmetic(heap, stack, Arith::Div)?,
            Instruction::Rem => arithmetic(heap, stack, Arith::Rem)?,
            Instruction::Neg => {
                let value = stack.pop()?;
                let negated = heap.with(|h| ops::negate(h, value))?;
                stack.push(negated)?;
            }
            Instruction::Eq | Instruction::Ne => {
                let b = stack.pop()?;
                let a = stack.pop()?;
                let equal = heap.with(|h| ops::equals(h, a, b))?;
                stack.push(Value::Bool(equal == (instruction == Instruction::Eq)))?;
            }
            Instruction::Lt | Instruction::Le | Instruction::Gt | Instruction::Ge => {
                let b = stack.pop()?;
                let a = stack.pop()?;
                let ordering = heap.with(|h| ops::compare(h, a, b))?;
                let result = match (instruction, ordering) {
                    (_, None) => false,
                    (Instruction::Lt, Some(o)) => o == Ordering::Less,
                    (Instruction::Le, Some(o)) => o != Ordering::Greater,
                    (Instruction::Gt, Some(o)) => o == Ordering::Greater,
                    (_, Some(o)) => o != Ordering::Less,
                };
                stack.push(Value::Bool(result))?;
            }
            Instruction::Not => {
                let value = condition(stack.pop()?, "not")?;
                stack.push(Value::Bool(!value))?;
            }

            Instruction::Jump(target) => stack.frame_mut()?.ip = target as usize,
            Instruction::JumpIfFalse(target) => {
                if !condition(stack.pop()?, "a conditional jump")? {
                    stack.frame_mut()?.ip = target as usize;
                }
            }
            Instruction::JumpIfTrue(target) => {
                if condition(stack.pop()?, "a conditional jump")? {
                    stack.frame_mut()?.ip = target as usize;
                }
            }

            Instruction::Call { function, argc } => {
                let callee = FunctionKey {
                    object: key.object,
                    function,
                };
                call(&program, heap, stack, callee, None, argc)?;
            }
            Instruction::CallImport { import, argc } => {
                let (object, function) = bound(&program, key.object, import, SymbolKind::Function)?;
                call(&program, heap, stack, FunctionKey { object, function }, None, argc)?;
            }
            Instruction::CallClosure { argc } => {
                let target = stack.remove(argc as usize)?;
                let (handle, callee) = heap.with(|h| closure_target(h, target))?;
                call(&program, heap, stack, callee, Some(handle), argc)?;
            }
            Instruction::CallVirtual { name, argc } => {
                let receiver = stack.peek((argc as usize).saturating_sub(1))?;
                let name = program
                    .object(key.object)
                    .map(|o| o.string(StringId(name)))
                    .unwrap_or("<invalid>");
                let callee = heap.with(|h| dispatch(h, &program, receiver, name))?;
                call(&program, heap, stack, callee, None, argc)?;
            }
            Instruction::Return => {
                let value = stack.pop()?;
                stack.pop_frame();
                if stack.is_empty() {
                    debug!(function = %program.function_name(key), "invocation returned");
                    return Ok(ExecState::Returned(value));
                }
                stack.push(value)?;
            }

            Instruction::NewRecord(ty) => {
                let ty = TypeKey {
                    object: key.object,
                    ty,
                };
                let count = field_count(&program, ty, TypeKind::Record)?;
                let fields = stack.pop_n(count)?;
                check_fields(heap, &program, ty, &fields)?;
                stack.push(Value::Ref(heap.alloc(HeapObject::Record { ty, fields })))?;
            }
            Instruction::GetField(index) => {
                let record = stack.pop()?;
                let value = heap.with(|h| h.field(record, index as usize))?;
                stack.push(value)?;
            }
            Instruction::SetField(index) => {
                let value = stack.pop()?;
                let record = stack.pop()?;
                heap.with(|h| set_field(h, &program, record, index as usize, value))?;
            }
            Instruction::MakeClosure { function, ty } => {
                let ty = TypeKey {
                    object: key.object,
                    ty,
                };
                let count = field_count(&program, ty, TypeKind::Closure)?;
                let captures = stack.pop_n(count)?;
                check_fields(heap, &program, ty, &captures)?;
                let closure = HeapObject::Closure {
                    function: FunctionKey {
                        object: key.object,
                        function,
                    },
                    ty,
                    captures,
                };
                stack.push(Value::Ref(heap.alloc(closure)))?;
            }

            Instruction::NewList(count) => {
                let items = stack.pop_n(count as usize)?;
                stack.push(Value::Ref(heap.alloc(HeapObject::List(items))))?;
            }
            Instruction::ListGet => {
                let index = stack.pop()?;
                let list = stack.pop()?;
                let value = heap.with(|h| {
                    let items = ops::list_items(h, list)?;
                    let i = ops::list_index(h, index, items.len())?;
                    Ok::<_, Interrupt>(items[i])
                })?;
                stack.push(value)?;
            }
            Instruction::ListSet => {
                let value = stack.pop()?;
                let index = stack.pop()?;
                let list = stack.pop()?;
                heap.with(|h| {
                    let len = ops::list_items(h, list)?.len();
                    let i = ops::list_index(h, index, len)?;
                    ops::list_mut(h, list)?[i] = value;
                    Ok::<_, Interrupt>(())
                })?;
            }
            Instruction::ListLen => {
                let list = stack.pop()?;
                let len = heap.with(|h| ops::list_items(h, list).map(|items| items.len()))?;
                stack.push(Value::Int(len as i64))?;
            }
            Instruction::ListPush => {
                let value = stack.pop()?;
                let list = stack.pop()?;
                heap.with(|h| ops::list_mut(h, list).map(|items| items.push(value)))?;
            }

            Instruction::LoadType(operand) => {
                let ty = resolve_type(&program, key.object, operand)?;
                stack.push(Value::Type(ty))?;
            }
            Instruction::IsInstance(operand) => {
                let ty = resolve_type(&program, key.object, operand)?;
                let value = stack.pop()?;
                let result = heap.with(|h| {
                    Ok::<_, Trap>(match ops::value_type(h, value)? {
                        Some(actual) => program.is_subtype(actual, ty),
                        None => false,
                    })
                })?;
                stack.push(Value::Bool(result))?;
            }
            Instruction::TypeCmp => {
                let b = stack.pop()?;
                let a = stack.pop()?;
                match (a, b) {
                    (Value::Type(a), Value::Type(b)) => {
                        stack.push(Value::Int(program.compare_types(a, b)))?
                    }
                    _ => {
                        let describe = |v: Value| v.scalar_type_name().unwrap_or("a reference");
                        return Err(Trap::type_violation(format!(
                            "cannot compare {} with {} as types",
                            describe(a),
                            describe(b)
                        ))
                        .into());
                    }
                }
            }

            Instruction::Raise => {
                let value = stack.pop()?;
                debug!(function = %program.function_name(key), site = ip, "raise");
                return Ok(ExecState::Unwinding(Exception {
                    value,
                    function: key,
                    site: ip,
                }));
            }
            Instruction::TypeOf => {
                let value = stack.pop()?;
                let name = heap.with(|h| ops::type_name(h, &program, value))?;
                stack.push(Value::Ref(heap.alloc(HeapObject::Str(name))))?;
            }
            Instruction::Abort => {
                warn!(function = %program.function_name(key), site = ip, "abort");
                return Err(Trap::Aborted.into());
            }
        }
        Ok(ExecState::Running)
    }
}

/// Build a fresh heap value for constant `id` of `object`.
fn materialize(heap: &SharedHeap, program: &Program, object: usize, id: u32) -> Result<Value, Trap> {
    let file = program
        .object(object)
        .ok_or_else(|| Trap::corrupted(format!("no object {}", object)))?;
    let constant = file
        .constants
        .get(id as usize)
        .ok_or_else(|| Trap::corrupted(format!("constant {} out of range", id)))?;
    Ok(match constant {
        Constant::Nil => Value::Nil,
        Constant::Bool(b) => Value::Bool(*b),
        Constant::Int(n) => Value::Int(*n),
        Constant::Float(x) => Value::Float(*x),
        Constant::Str(s) => Value::Ref(heap.alloc(HeapObject::Str(file.string(*s).to_string()))),
        Constant::Record { ty, fields } => {
            let fields = fields
                .iter()
                .map(|field| materialize(heap, program, object, field.0))
                .collect::<Result<Vec<_>, _>>()?;
            let ty = TypeKey { object, ty: ty.0 };
            // Imported field types are only known after linking.
            check_fields(heap, program, ty, &fields)?;
            Value::Ref(heap.alloc(HeapObject::Record { ty, fields }))
        }
    })
}

/// Follow import `import` of `object`, which must be bound to a `kind`.
fn bound(program: &Program, object: usize, import: u32, kind: SymbolKind) -> Result<(usize, u32), Trap> {
    match program.binding(object, import) {
        Some(binding) if binding.kind == kind => Ok((binding.object, binding.index)),
        _ => {
            let name = program
                .object(object)
                .map(|o| o.import_name(ImportId(import)))
                .unwrap_or_else(|| format!("#{}", import));
            Err(Trap::UnresolvedImport(name))
        }
    }
}

/// Values a frame of `function` starts with: its parameters plus the rest
/// list of a variadic function.
fn frame_arity(function: &Function) -> usize {
    function.arity as usize + usize::from(function.variadic)
}

fn call(
    program: &Program,
    heap: &SharedHeap,
    stack: &mut CallStack,
    callee: FunctionKey,
    closure: Option<Handle>,
    argc: u8,
) -> Result<(), Trap> {
    let function = program
        .function(callee)
        .ok_or_else(|| Trap::corrupted(format!("call to missing function {}", callee.function)))?;
    if !function.accepts(argc.into()) {
        return Err(Trap::corrupted(format!(
            "{} takes {} arguments, called with {}",
            program.function_name(callee),
            function.arity_text(),
            argc
        )));
    }
    if function.variadic {
        let rest = stack.pop_n(argc as usize - function.arity as usize)?;
        stack.push(Value::Ref(heap.alloc(HeapObject::List(rest))))?;
    }
    stack.push_frame(
        callee,
        closure,
        frame_arity(function),
        function.locals as usize,
        function.max_stack as usize,
    )
}

/// The method `name` of the receiver's type.
fn dispatch(heap: &Heap, program: &Program, receiver: Value, name: &str) -> Result<FunctionKey, Trap> {
    let Some(ty) = ops::value_type(heap, receiver)? else {
        return Err(Trap::type_violation(format!(
            "cannot call method '{}' on {}",
            name,
            ops::type_name(heap, program, receiver)?
        )));
    };
    program.method(ty, name).ok_or_else(|| {
        Trap::type_violation(format!(
            "{} has no method '{}'",
            program.type_name(ty),
            name
        ))
    })
}

fn resolve_type(program: &Program, object: usize, operand: u32) -> Result<TypeKey, Trap> {
    let reference = TypeRef::from_operand(operand);
    program.resolve_type(object, reference).ok_or_else(|| match reference {
        TypeRef::Import(import) => Trap::UnresolvedImport(
            program
                .object(object)
                .map(|o| o.import_name(import))
                .unwrap_or_else(|| format!("#{}", import)),
        ),
        TypeRef::Local(id) => Trap::corrupted(format!("type {} out of range", id)),
    })
}

fn closure_target(heap: &Heap, value: Value) -> Result<(Handle, FunctionKey), Trap> {
    if let Value::Ref(handle) = value {
        if let HeapObject::Closure { function, .. } = heap.get(handle)? {
            return Ok((handle, *function));
        }
    }
    let kind = match value {
        Value::Ref(handle) => heap.get(handle)?.kind_name(),
        other => other.scalar_type_name().unwrap_or("?"),
    };
    Err(Trap::type_violation(format!("cannot call a {}", kind)))
}

fn condition(value: Value, context: &str) -> Result<bool, Trap> {
    match value {
        Value::Bool(b) => Ok(b),
        other => Err(Trap::type_violation(format!(
            "{} expects a Bool, got {}",
            context,
            other.scalar_type_name().unwrap_or("a reference")
        ))),
    }
}

fn arithmetic(heap: &SharedHeap, stack: &mut CallStack, op: Arith) -> OpResult<()> {
    let b = stack.pop()?;
    let a = stack.pop()?;
    let value = match heap.with(|h| ops::arithmetic(h, op, a, b))? {
        ArithResult::Value(value) => value,
        ArithResult::Concat(text) => Value::Ref(heap.alloc(HeapObject::Str(text))),
    };
    stack.push(value)?;
    Ok(())
}

fn field_count(program: &Program, ty: TypeKey, kind: TypeKind) -> Result<usize, Trap> {
    match program.descriptor(ty) {
        Some(descriptor) if descriptor.kind == kind => Ok(descriptor.fields.len()),
        Some(_) => Err(Trap::type_violation(format!(
            "{} is not a {:?} type",
            program.type_name(ty),
            kind
        ))),
        None => Err(Trap::corrupted(format!("type {} out of range", ty.ty))),
    }
}

fn field_violation(program: &Program, ty: TypeKey, index: usize) -> Trap {
    let field = program
        .descriptor(ty)
        .and_then(|d| d.fields.get(index))
        .zip(program.object(ty.object))
        .map(|(field, object)| object.string(field.name).to_string())
        .unwrap_or_else(|| index.to_string());
    Trap::type_violation(format!(
        "value does not fit field '{}' of {}",
        field,
        program.type_name(ty)
    ))
}

fn check_fields(heap: &SharedHeap, program: &Program, ty: TypeKey, values: &[Value]) -> Result<(), Trap> {
    let descriptor = program
        .descriptor(ty)
        .ok_or_else(|| Trap::corrupted(format!("type {} out of range", ty.ty)))?;
    heap.with(|h| {
        for (index, (field, value)) in descriptor.fields.iter().zip(values).enumerate() {
            if !ops::check_field(h, program, ty.object, field.ty, *value)? {
                return Err(field_violation(program, ty, index));
            }
        }
        Ok(())
    })
}

fn set_field(
    heap: &mut Heap,
    program: &Program,
    record: Value,
    index: usize,
    value: Value,
) -> Result<(), Trap> {
    let ty = match record {
        Value::Ref(handle) => match heap.get(handle)? {
            HeapObject::Record { ty, .. } => Some(*ty),
            _ => None,
        },
        _ => None,
    };
    // Non-records fall through to set_field, which reports them.
    if let Some(ty) = ty {
        let declared = program
            .descriptor(ty)
            .and_then(|d| d.fields.get(index))
            .map(|field| field.ty);
        if let Some(declared) = declared {
            if !ops::check_field(heap, program, ty.object, declared, value)? {
                return Err(field_violation(program, ty, index));
            }
        }
    }
    heap.set_field(record, index, value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::{
        assemble, BinaryOp, Builder, CatchClause, CatchKind, ExprKind, FieldTy, FunctionDecl,
        ModuleIr, StmtKind, SymbolBindings, TypeDecl,
    };
    use crate::config::CatchableFaults;
    use crate::link::{resolve, LinkSet, MemoryProvider};
    use crate::object::{Function, Import, ObjectFile, StringId};
    use pretty_assertions::assert_eq;

    fn module(types: Vec<TypeDecl>, functions: Vec<FunctionDecl>) -> ModuleIr {
        ModuleIr {
            name: "app".into(),
            types,
            functions,
            ..Default::default()
        }
    }

    fn link(module: &ModuleIr) -> Arc<Program> {
        let object = assemble(module, &SymbolBindings::for_module(module)).unwrap();
        let set = resolve(Arc::new(object), &MemoryProvider::new()).unwrap();
        Arc::new(Program::link(set))
    }

    fn invoke_with(
        program: &Arc<Program>,
        heap: &Arc<SharedHeap>,
        config: RuntimeConfig,
        entry: &str,
        args: &[HostValue],
    ) -> Result<HostValue, Trap> {
        let mut interp = Interpreter::new(Arc::clone(program), heap, config, CancelToken::new());
        interp.start(program.entry(entry).unwrap(), args).unwrap();
        let value = interp.run()?;
        interp.to_host(value)
    }

    fn invoke(program: &Arc<Program>, entry: &str, args: &[HostValue]) -> Result<HostValue, Trap> {
        let config = RuntimeConfig::default();
        let heap = SharedHeap::new(config.gc_threshold);
        invoke_with(program, &heap, config, entry, args)
    }

    fn try_catch(b: &mut Builder, body: Vec<crate::assembler::Stmt>, catches: Vec<CatchClause>) -> crate::assembler::Stmt {
        b.stmt(StmtKind::Try { body, catches })
    }

    fn clause(b: &mut Builder, catch: CatchKind, binding: Option<&str>, body: Vec<crate::assembler::Stmt>) -> CatchClause {
        CatchClause {
            node: b.node(),
            catch,
            binding: binding.map(str::to_string),
            body,
        }
    }

    /// An object whose only function runs the given raw code.
    fn raw_program(code: Vec<u8>, imports: Vec<Import>, strings: &[&str]) -> Arc<Program> {
        let mut object = ObjectFile::new("raw");
        object.strings.push("main".into());
        object.strings.extend(strings.iter().map(|s| s.to_string()));
        object.imports = imports;
        object.functions.push(Function {
            name: StringId(1),
            arity: 0,
            variadic: false,
            locals: 0,
            max_stack: 4,
            code,
            handlers: Vec::new(),
        });
        Arc::new(Program::link(LinkSet {
            objects: vec![Arc::new(object)],
            bindings: vec![Vec::new()],
        }))
    }

    fn run_raw(program: &Arc<Program>) -> Result<Value, Trap> {
        let heap = SharedHeap::new(64);
        let mut interp = Interpreter::new(
            Arc::clone(program),
            &heap,
            RuntimeConfig::default(),
            CancelToken::new(),
        );
        interp
            .start(FunctionKey { object: 0, function: 0 }, &[])
            .unwrap();
        interp.run()
    }

    #[test]
    fn test_add() {
        let mut b = Builder::new();
        let a = b.local("a");
        let c = b.local("b");
        let sum = b.binary(BinaryOp::Add, a, c);
        let ret = b.ret(sum);
        let add = b.function("add", &["a", "b"], vec![ret]);
        let program = link(&module(vec![], vec![add]));

        let result = invoke(&program, "add", &[HostValue::Int(2), HostValue::Int(3)]);
        assert_eq!(result, Ok(HostValue::Int(5)));
    }

    #[test]
    fn test_recursive_fib() {
        let mut b = Builder::new();
        let n = b.local("n");
        let two = b.int(2);
        let small = b.binary(BinaryOp::Lt, n, two);
        let n = b.local("n");
        let base = b.ret(n);
        let guard = b.stmt(StmtKind::If {
            condition: small,
            then_branch: vec![base],
            else_branch: vec![],
        });
        let n1 = b.local("n");
        let one = b.int(1);
        let minus1 = b.binary(BinaryOp::Sub, n1, one);
        let n2 = b.local("n");
        let two = b.int(2);
        let minus2 = b.binary(BinaryOp::Sub, n2, two);
        let left = b.call("fib", vec![minus1]);
        let right = b.call("fib", vec![minus2]);
        let sum = b.binary(BinaryOp::Add, left, right);
        let ret = b.ret(sum);
        let fib = b.function("fib", &["n"], vec![guard, ret]);
        let program = link(&module(vec![], vec![fib]));

        assert_eq!(invoke(&program, "fib", &[HostValue::Int(15)]), Ok(HostValue::Int(610)));
    }

    #[test]
    fn test_wrong_entry_arity_is_an_invoke_error() {
        let mut b = Builder::new();
        let zero = b.int(0);
        let ret = b.ret(zero);
        let main = b.function("main", &["x"], vec![ret]);
        let program = link(&module(vec![], vec![main]));

        let heap = SharedHeap::new(16);
        let mut interp =
            Interpreter::new(Arc::clone(&program), &heap, RuntimeConfig::default(), CancelToken::new());
        let err = interp.start(program.entry("main").unwrap(), &[]).unwrap_err();
        assert_eq!(
            err,
            InvokeError::WrongArity {
                name: "app::main".into(),
                expected: 1,
                got: 0
            }
        );
    }

    #[test]
    fn test_raise_caught_in_same_frame() {
        let mut b = Builder::new();
        let value = b.int(42);
        let raise = b.raise(value);
        let e = b.local("e");
        let one = b.int(1);
        let next = b.binary(BinaryOp::Add, e, one);
        let ret = b.ret(next);
        let handler = clause(&mut b, CatchKind::Any, Some("e"), vec![ret]);
        let body = try_catch(&mut b, vec![raise], vec![handler]);
        let main = b.function("main", &[], vec![body]);
        let program = link(&module(vec![], vec![main]));

        assert_eq!(invoke(&program, "main", &[]), Ok(HostValue::Int(43)));
    }

    #[test]
    fn test_uncaught_raise_traps_with_value() {
        let mut b = Builder::new();
        let boom = b.str("boom");
        let raise = b.raise(boom);
        let main = b.function("main", &[], vec![raise]);
        let program = link(&module(vec![], vec![main]));

        assert_eq!(
            invoke(&program, "main", &[]),
            Err(Trap::UncaughtException(HostValue::Str("boom".into())))
        );
    }

    #[test]
    fn test_catch_by_ancestor_type() {
        let mut b = Builder::new();
        let error = b.record_type("Error", None, &[]);
        let io_error = b.record_type("IoError", Some("Error"), &[]);
        let record = b.expr(ExprKind::Record {
            ty: "IoError".into(),
            fields: vec![],
        });
        let raise = b.raise(record);
        let skipped = b.int(-1);
        let skipped = b.ret(skipped);
        let skip = clause(
            &mut b,
            CatchKind::Fault(crate::error::FaultKind::Overflow),
            None,
            vec![skipped],
        );
        let e = b.local("e");
        let name = b.expr(ExprKind::TypeOf(Box::new(e)));
        let ret = b.ret(name);
        let handler = clause(&mut b, CatchKind::Type("Error".into()), Some("e"), vec![ret]);
        let body = try_catch(&mut b, vec![raise], vec![skip, handler]);
        let main = b.function("main", &[], vec![body]);
        let program = link(&module(vec![error, io_error], vec![main]));

        assert_eq!(invoke(&program, "main", &[]), Ok(HostValue::Str("IoError".into())));
    }

    fn overflow_program() -> Arc<Program> {
        let mut b = Builder::new();
        let x = b.local("x");
        let one = b.int(1);
        let sum = b.binary(BinaryOp::Add, x, one);
        let ret = b.ret(sum);
        let minus_one = b.int(-1);
        let fallback = b.ret(minus_one);
        let handler = clause(
            &mut b,
            CatchKind::Fault(crate::error::FaultKind::Overflow),
            None,
            vec![fallback],
        );
        let body = try_catch(&mut b, vec![ret], vec![handler]);
        let main = b.function("main", &["x"], vec![body]);
        link(&module(vec![], vec![main]))
    }

    #[test]
    fn test_overflow_is_catchable_by_default() {
        let program = overflow_program();
        let args = [HostValue::Int(i64::MAX)];
        assert_eq!(invoke(&program, "main", &args), Ok(HostValue::Int(-1)));
        assert_eq!(
            invoke(&program, "main", &[HostValue::Int(1)]),
            Ok(HostValue::Int(2))
        );
    }

    #[test]
    fn test_uncatchable_overflow_traps() {
        let program = overflow_program();
        let config = RuntimeConfig {
            catchable: CatchableFaults::none(),
            ..RuntimeConfig::default()
        };
        let heap = SharedHeap::new(config.gc_threshold);
        let result = invoke_with(&program, &heap, config, "main", &[HostValue::Int(i64::MAX)]);
        assert_eq!(result, Err(Trap::Fault(crate::error::FaultKind::Overflow)));
    }

    #[test]
    fn test_exception_crosses_frames() {
        let mut b = Builder::new();
        let seven = b.int(7);
        let raise = b.raise(seven);
        let mut inner = b.function("inner", &[], vec![raise]);
        inner.exported = false;

        let call = b.call("inner", vec![]);
        let ret = b.ret(call);
        let e = b.local("e");
        let two = b.int(2);
        let doubled = b.binary(BinaryOp::Mul, e, two);
        let handled = b.ret(doubled);
        let handler = clause(&mut b, CatchKind::Any, Some("e"), vec![handled]);
        let body = try_catch(&mut b, vec![ret], vec![handler]);
        let main = b.function("main", &[], vec![body]);
        let program = link(&module(vec![], vec![inner, main]));

        assert_eq!(invoke(&program, "main", &[]), Ok(HostValue::Int(14)));
    }

    #[test]
    fn test_covering_handler_of_other_type_does_not_catch() {
        let mut b = Builder::new();
        let error = b.record_type("Error", None, &[]);
        let five = b.int(5);
        let raise = b.raise(five);
        let one = b.int(1);
        let caught = b.ret(one);
        let handler = clause(&mut b, CatchKind::Type("Error".into()), None, vec![caught]);
        let body = try_catch(&mut b, vec![raise], vec![handler]);
        let main = b.function("main", &[], vec![body]);
        let program = link(&module(vec![error], vec![main]));

        assert_eq!(
            invoke(&program, "main", &[]),
            Err(Trap::UncaughtException(HostValue::Int(5)))
        );
    }

    #[test]
    fn test_unmatched_handler_in_caller_passes_exception_up() {
        let mut b = Builder::new();
        let error = b.record_type("Error", None, &[]);
        let other = b.record_type("Other", None, &[]);
        let record = b.expr(ExprKind::Record {
            ty: "Other".into(),
            fields: vec![],
        });
        let raise = b.raise(record);
        let mut inner = b.function("inner", &[], vec![raise]);
        inner.exported = false;

        let call = b.call("inner", vec![]);
        let ret = b.ret(call);
        let zero = b.int(0);
        let caught = b.ret(zero);
        let handler = clause(&mut b, CatchKind::Type("Error".into()), Some("e"), vec![caught]);
        let body = try_catch(&mut b, vec![ret], vec![handler]);
        let main = b.function("main", &[], vec![body]);
        let program = link(&module(vec![error, other], vec![inner, main]));

        match invoke(&program, "main", &[]) {
            Err(Trap::UncaughtException(HostValue::Record { ty, fields })) => {
                assert!(ty.ends_with("Other"), "{}", ty);
                assert!(fields.is_empty());
            }
            other => panic!("expected the Other record to escape, got {:?}", other),
        }
    }

    fn spin_program() -> Arc<Program> {
        let mut b = Builder::new();
        let forever = b.expr(ExprKind::Bool(true));
        let spin = b.stmt(StmtKind::While {
            condition: forever,
            body: vec![],
        });
        let main = b.function("main", &[], vec![spin]);
        link(&module(vec![], vec![main]))
    }

    #[test]
    fn test_cancellation_stops_a_spinning_loop() {
        let program = spin_program();
        let heap = SharedHeap::new(64);
        let token = CancelToken::new();
        let mut interp =
            Interpreter::new(Arc::clone(&program), &heap, RuntimeConfig::default(), token.clone());
        interp.start(program.entry("main").unwrap(), &[]).unwrap();
        for _ in 0..1000 {
            assert!(interp.step());
        }
        token.cancel();
        assert!(!interp.step());
        assert_eq!(interp.state(), &ExecState::Trapped(Trap::Cancelled));
    }

    #[test]
    fn test_cancellation_is_checked_at_the_interval() {
        let program = spin_program();
        let heap = SharedHeap::new(64);
        let token = CancelToken::new();
        let config = RuntimeConfig {
            cancel_check_interval: 10,
            ..RuntimeConfig::default()
        };
        let mut interp = Interpreter::new(Arc::clone(&program), &heap, config, token.clone());
        interp.start(program.entry("main").unwrap(), &[]).unwrap();
        token.cancel();
        let mut steps = 0;
        while interp.step() {
            steps += 1;
        }
        assert_eq!(steps, 9);
        assert_eq!(interp.run(), Err(Trap::Cancelled));
    }

    #[test]
    fn test_invalid_opcode_traps() {
        let program = raw_program(vec![0x00, 0xFF], Vec::new(), &[]);
        assert_eq!(
            run_raw(&program),
            Err(Trap::InvalidOpcode {
                opcode: 0xFF,
                function: "raw::main".into(),
                offset: 1,
            })
        );
    }

    #[test]
    fn test_unbound_import_traps() {
        let mut code = Vec::new();
        Instruction::CallImport { import: 0, argc: 0 }.encode(&mut code);
        Instruction::Return.encode(&mut code);
        let import = Import {
            module: StringId(2),
            name: StringId(3),
            kind: SymbolKind::Function,
        };
        let program = raw_program(code, vec![import], &["lib", "f"]);
        assert_eq!(
            run_raw(&program),
            Err(Trap::UnresolvedImport("lib::f".into()))
        );
    }

    #[test]
    fn test_unbounded_recursion_overflows() {
        let mut b = Builder::new();
        let call = b.call("down", vec![]);
        let ret = b.ret(call);
        let down = b.function("down", &[], vec![ret]);
        let program = link(&module(vec![], vec![down]));

        let config = RuntimeConfig {
            max_frames: 64,
            ..RuntimeConfig::default()
        };
        let heap = SharedHeap::new(config.gc_threshold);
        assert_eq!(
            invoke_with(&program, &heap, config, "down", &[]),
            Err(Trap::StackOverflow)
        );
    }

    #[test]
    fn test_closure_reads_its_captures() {
        let mut b = Builder::new();
        let adder = TypeDecl {
            node: b.node(),
            name: "Adder".into(),
            kind: TypeKind::Closure,
            parent: None,
            fields: vec![("n".into(), FieldTy::Int)],
            methods: Vec::new(),
            exported: false,
        };
        let x = b.local("x");
        let n = b.expr(ExprKind::Capture("n".into()));
        let sum = b.binary(BinaryOp::Add, x, n);
        let ret = b.ret(sum);
        let mut add_n = b.function("add_n", &["x"], vec![ret]);
        add_n.captures = vec!["n".into()];
        add_n.exported = false;

        let k = b.local("k");
        let closure = b.expr(ExprKind::Closure {
            function: "add_n".into(),
            ty: "Adder".into(),
            captures: vec![k],
        });
        let bind = b.let_("f", closure);
        let f = b.local("f");
        let ten = b.int(10);
        let call = b.expr(ExprKind::CallClosure {
            closure: Box::new(f),
            args: vec![ten],
        });
        let ret = b.ret(call);
        let main = b.function("main", &["k"], vec![bind, ret]);
        let program = link(&module(vec![adder], vec![add_n, main]));

        assert_eq!(invoke(&program, "main", &[HostValue::Int(5)]), Ok(HostValue::Int(15)));
        // A capture of the wrong declared type is rejected at construction.
        assert!(matches!(
            invoke(&program, "main", &[HostValue::Str("5".into())]),
            Err(Trap::TypeViolation(_))
        ));
    }

    #[test]
    fn test_lists_strings_and_type_names() {
        let mut b = Builder::new();
        let one = b.int(1);
        let two = b.int(2);
        let items = b.expr(ExprKind::List(vec![one, two]));
        let bind = b.let_("l", items);
        let l = b.local("l");
        let three = b.int(3);
        let push = b.stmt(StmtKind::Push { list: l, value: three });

        let l = b.local("l");
        let len = b.expr(ExprKind::Len(Box::new(l)));
        let l = b.local("l");
        let list_name = b.expr(ExprKind::TypeOf(Box::new(l)));
        let s = b.str("s");
        let str_name = b.expr(ExprKind::TypeOf(Box::new(s)));
        let bang = b.str("!");
        let joined = b.binary(BinaryOp::Add, str_name, bang);
        let l = b.local("l");
        let idx = b.int(2);
        let last = b.expr(ExprKind::Index {
            list: Box::new(l),
            index: Box::new(idx),
        });
        let result = b.expr(ExprKind::List(vec![len, list_name, joined, last]));
        let ret = b.ret(result);
        let main = b.function("main", &[], vec![bind, push, ret]);
        let program = link(&module(vec![], vec![main]));

        assert_eq!(
            invoke(&program, "main", &[]),
            Ok(HostValue::List(vec![
                HostValue::Int(3),
                HostValue::Str("List".into()),
                HostValue::Str("Str!".into()),
                HostValue::Int(3),
            ]))
        );
    }

    #[test]
    fn test_index_out_of_bounds_raises_fault() {
        let mut b = Builder::new();
        let one = b.int(1);
        let items = b.expr(ExprKind::List(vec![one]));
        let five = b.int(5);
        let index = b.expr(ExprKind::Index {
            list: Box::new(items),
            index: Box::new(five),
        });
        let ret = b.ret(index);
        let main = b.function("main", &[], vec![ret]);
        let program = link(&module(vec![], vec![main]));

        assert_eq!(
            invoke(&program, "main", &[]),
            Err(Trap::UncaughtException(HostValue::Fault(
                crate::error::FaultKind::OutOfBounds
            )))
        );
    }

    #[test]
    fn test_field_writes_are_type_checked() {
        let mut b = Builder::new();
        let point = b.record_type("Point", None, &[("x", FieldTy::Int)]);
        let zero = b.int(0);
        let record = b.expr(ExprKind::Record {
            ty: "Point".into(),
            fields: vec![zero],
        });
        let bind = b.let_("p", record);
        let p = b.local("p");
        let v = b.local("v");
        let write = b.stmt(StmtKind::SetField {
            record: p,
            ty: Some("Point".into()),
            index: 0,
            value: v,
        });
        let p = b.local("p");
        let read = b.expr(ExprKind::Field {
            record: Box::new(p),
            ty: Some("Point".into()),
            index: 0,
        });
        let ret = b.ret(read);
        let main = b.function("main", &["v"], vec![bind, write, ret]);
        let program = link(&module(vec![point], vec![main]));

        assert_eq!(invoke(&program, "main", &[HostValue::Int(9)]), Ok(HostValue::Int(9)));
        assert!(matches!(
            invoke(&program, "main", &[HostValue::Str("nine".into())]),
            Err(Trap::TypeViolation(_))
        ));
    }

    #[test]
    fn test_collection_keeps_live_values() {
        // keep = ["keep"]; i = 0; while i < 300 { let t = [i, "x"]; i = i + 1 }; return keep[0]
        let mut b = Builder::new();
        let text = b.str("keep");
        let keep = b.expr(ExprKind::List(vec![text]));
        let bind_keep = b.let_("keep", keep);
        let zero = b.int(0);
        let bind_i = b.let_("i", zero);
        let i = b.local("i");
        let limit = b.int(300);
        let cond = b.binary(BinaryOp::Lt, i, limit);
        let i = b.local("i");
        let x = b.str("x");
        let garbage = b.expr(ExprKind::List(vec![i, x]));
        let bind_t = b.let_("t", garbage);
        let i = b.local("i");
        let one = b.int(1);
        let next = b.binary(BinaryOp::Add, i, one);
        let step = b.assign("i", next);
        let lp = b.stmt(StmtKind::While {
            condition: cond,
            body: vec![bind_t, step],
        });
        let keep = b.local("keep");
        let zero = b.int(0);
        let first = b.expr(ExprKind::Index {
            list: Box::new(keep),
            index: Box::new(zero),
        });
        let ret = b.ret(first);
        let main = b.function("main", &[], vec![bind_keep, bind_i, lp, ret]);
        let program = link(&module(vec![], vec![main]));

        let config = RuntimeConfig {
            gc_threshold: 16,
            ..RuntimeConfig::default()
        };
        let heap = SharedHeap::new(config.gc_threshold);
        let result = invoke_with(&program, &heap, config, "main", &[]);
        assert_eq!(result, Ok(HostValue::Str("keep".into())));

        let stats = heap.stats();
        assert!(stats.collections > 0);
        assert!(stats.live < 64, "garbage survived: {} live", stats.live);
    }

    #[test]
    fn test_mixed_arithmetic_and_comparison() {
        let mut b = Builder::new();
        let x = b.local("x");
        let half = b.expr(ExprKind::Float(0.5));
        let product = b.binary(BinaryOp::Mul, x, half);
        let neg = b.expr(ExprKind::Unary {
            op: crate::assembler::UnaryOp::Neg,
            operand: Box::new(product),
        });
        let ret = b.ret(neg);
        let main = b.function("main", &["x"], vec![ret]);
        let program = link(&module(vec![], vec![main]));

        assert_eq!(invoke(&program, "main", &[HostValue::Int(3)]), Ok(HostValue::Float(-1.5)));
        assert!(matches!(
            invoke(&program, "main", &[HostValue::Bool(true)]),
            Err(Trap::TypeViolation(_))
        ));
    }

    /// `Shape {}` with `area` and `name`; `Square { side }` overrides `area`.
    fn shapes_module(b: &mut Builder, functions: Vec<FunctionDecl>) -> ModuleIr {
        let mut shape = b.record_type("Shape", None, &[]);
        shape.methods = vec![
            ("area".into(), "shape_area".into()),
            ("name".into(), "shape_name".into()),
        ];
        let mut square = b.record_type("Square", Some("Shape"), &[("side", FieldTy::Int)]);
        square.methods = vec![("area".into(), "square_area".into())];

        let zero = b.int(0);
        let ret = b.ret(zero);
        let shape_area = b.function("shape_area", &["this"], vec![ret]);
        let name = b.str("shape");
        let ret = b.ret(name);
        let shape_name = b.function("shape_name", &["this"], vec![ret]);
        let side = |b: &mut Builder| {
            let this = b.local("this");
            b.expr(ExprKind::Field {
                record: Box::new(this),
                ty: Some("Square".into()),
                index: 0,
            })
        };
        let lhs = side(&mut *b);
        let rhs = side(&mut *b);
        let product = b.binary(BinaryOp::Mul, lhs, rhs);
        let ret = b.ret(product);
        let square_area = b.function("square_area", &["this"], vec![ret]);

        let mut all = vec![shape_area, shape_name, square_area];
        all.extend(functions);
        module(vec![shape, square], all)
    }

    fn method_call(b: &mut Builder, receiver: &str, method: &str) -> crate::assembler::Expr {
        let receiver = b.local(receiver);
        b.expr(ExprKind::MethodCall {
            receiver: Box::new(receiver),
            method: method.into(),
            args: vec![],
        })
    }

    #[test]
    fn test_method_calls_dispatch_on_the_receiver_type() {
        let mut b = Builder::new();
        let three = b.int(3);
        let square = b.expr(ExprKind::Record {
            ty: "Square".into(),
            fields: vec![three],
        });
        let bind_sq = b.let_("sq", square);
        let shape = b.expr(ExprKind::Record {
            ty: "Shape".into(),
            fields: vec![],
        });
        let bind_sh = b.let_("sh", shape);
        let sq_area = method_call(&mut b, "sq", "area");
        let sh_area = method_call(&mut b, "sh", "area");
        let sq_name = method_call(&mut b, "sq", "name");
        let list = b.expr(ExprKind::List(vec![sq_area, sh_area, sq_name]));
        let ret = b.ret(list);
        let main = b.function("main", &[], vec![bind_sq, bind_sh, ret]);

        let missing = method_call(&mut b, "x", "perimeter");
        let ret = b.ret(missing);
        let perimeter = b.function("perimeter", &["x"], vec![ret]);

        let program = link(&shapes_module(&mut b, vec![main, perimeter]));
        assert_eq!(
            invoke(&program, "main", &[]),
            Ok(HostValue::List(vec![
                HostValue::Int(9),
                HostValue::Int(0),
                HostValue::Str("shape".into()),
            ]))
        );
        assert_eq!(
            invoke(&program, "perimeter", &[HostValue::Int(1)]),
            Err(Trap::TypeViolation("cannot call method 'perimeter' on Int".into()))
        );
    }

    #[test]
    fn test_type_values_compare_by_ancestry() {
        let mut b = Builder::new();
        let ty = |b: &mut Builder, name: &str| b.expr(ExprKind::TypeValue(name.into()));
        let compare = |b: &mut Builder, lhs: &str, rhs: &str| {
            let lhs = ty(b, lhs);
            let rhs = ty(b, rhs);
            b.expr(ExprKind::TypeCompare {
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            })
        };
        let below = compare(&mut b, "Square", "Shape");
        let same = compare(&mut b, "Shape", "Shape");
        let above = compare(&mut b, "Shape", "Square");
        let two = b.int(2);
        let square = b.expr(ExprKind::Record {
            ty: "Square".into(),
            fields: vec![two],
        });
        let is_shape = b.expr(ExprKind::IsInstance {
            value: Box::new(square),
            ty: "Shape".into(),
        });
        let int = b.int(2);
        let int_is_shape = b.expr(ExprKind::IsInstance {
            value: Box::new(int),
            ty: "Shape".into(),
        });
        let value = ty(&mut b, "Square");
        let list = b.expr(ExprKind::List(vec![below, same, above, is_shape, int_is_shape, value]));
        let ret = b.ret(list);
        let main = b.function("main", &[], vec![ret]);

        let one = b.int(1);
        let shape = ty(&mut b, "Shape");
        let bad = b.expr(ExprKind::TypeCompare {
            lhs: Box::new(one),
            rhs: Box::new(shape),
        });
        let ret = b.ret(bad);
        let mixed = b.function("mixed", &[], vec![ret]);

        let program = link(&shapes_module(&mut b, vec![main, mixed]));
        assert_eq!(
            invoke(&program, "main", &[]),
            Ok(HostValue::List(vec![
                HostValue::Int(-1),
                HostValue::Int(0),
                HostValue::Int(1),
                HostValue::Bool(true),
                HostValue::Bool(false),
                HostValue::Type("Square".into()),
            ]))
        );
        assert!(matches!(invoke(&program, "mixed", &[]), Err(Trap::TypeViolation(_))));
    }

    #[test]
    fn test_statics_persist_across_invocations() {
        // bump(): if count == nil { count = 0 }; count = count + 1; return count
        let mut b = Builder::new();
        let count = b.expr(ExprKind::Static("count".into()));
        let nil = b.expr(ExprKind::Nil);
        let unset = b.binary(BinaryOp::Eq, count, nil);
        let zero = b.int(0);
        let reset = b.stmt(StmtKind::SetStatic {
            name: "count".into(),
            value: zero,
        });
        let init = b.stmt(StmtKind::If {
            condition: unset,
            then_branch: vec![reset],
            else_branch: vec![],
        });
        let count = b.expr(ExprKind::Static("count".into()));
        let one = b.int(1);
        let next = b.binary(BinaryOp::Add, count, one);
        let store = b.stmt(StmtKind::SetStatic {
            name: "count".into(),
            value: next,
        });
        let count = b.expr(ExprKind::Static("count".into()));
        let ret = b.ret(count);
        let bump = b.function("bump", &[], vec![init, store, ret]);
        let mut m = module(vec![], vec![bump]);
        m.statics.push("count".into());
        let program = link(&m);

        let config = RuntimeConfig::default();
        let heap = SharedHeap::new(config.gc_threshold);
        for expected in 1..=3 {
            assert_eq!(
                invoke_with(&program, &heap, config.clone(), "bump", &[]),
                Ok(HostValue::Int(expected))
            );
        }
    }

    #[test]
    fn test_collection_keeps_static_values() {
        // keep = ["kept"]; allocate 300 lists; return keep[0]
        let mut b = Builder::new();
        let text = b.str("kept");
        let list = b.expr(ExprKind::List(vec![text]));
        let store = b.stmt(StmtKind::SetStatic {
            name: "keep".into(),
            value: list,
        });
        let zero = b.int(0);
        let bind_i = b.let_("i", zero);
        let i = b.local("i");
        let limit = b.int(300);
        let cond = b.binary(BinaryOp::Lt, i, limit);
        let i = b.local("i");
        let garbage = b.expr(ExprKind::List(vec![i]));
        let bind_t = b.let_("t", garbage);
        let i = b.local("i");
        let one = b.int(1);
        let next = b.binary(BinaryOp::Add, i, one);
        let step = b.assign("i", next);
        let lp = b.stmt(StmtKind::While {
            condition: cond,
            body: vec![bind_t, step],
        });
        let keep = b.expr(ExprKind::Static("keep".into()));
        let zero = b.int(0);
        let first = b.expr(ExprKind::Index {
            list: Box::new(keep),
            index: Box::new(zero),
        });
        let ret = b.ret(first);
        let main = b.function("main", &[], vec![store, bind_i, lp, ret]);
        let mut m = module(vec![], vec![main]);
        m.statics.push("keep".into());
        let program = link(&m);

        let config = RuntimeConfig {
            gc_threshold: 16,
            ..RuntimeConfig::default()
        };
        let heap = SharedHeap::new(config.gc_threshold);
        let result = invoke_with(&program, &heap, config, "main", &[]);
        assert_eq!(result, Ok(HostValue::Str("kept".into())));
        assert!(heap.stats().collections > 0);
    }

    #[test]
    fn test_rest_arguments_arrive_as_a_list() {
        // sum(first, ...rest): total = first; for each r in rest { total = total + r }
        let mut b = Builder::new();
        let first = b.local("first");
        let bind_total = b.let_("total", first);
        let zero = b.int(0);
        let bind_i = b.let_("i", zero);
        let i = b.local("i");
        let rest = b.local("rest");
        let len = b.expr(ExprKind::Len(Box::new(rest)));
        let cond = b.binary(BinaryOp::Lt, i, len);
        let total = b.local("total");
        let rest = b.local("rest");
        let i = b.local("i");
        let item = b.expr(ExprKind::Index {
            list: Box::new(rest),
            index: Box::new(i),
        });
        let sum = b.binary(BinaryOp::Add, total, item);
        let add = b.assign("total", sum);
        let i = b.local("i");
        let one = b.int(1);
        let next = b.binary(BinaryOp::Add, i, one);
        let step = b.assign("i", next);
        let lp = b.stmt(StmtKind::While {
            condition: cond,
            body: vec![add, step],
        });
        let total = b.local("total");
        let ret = b.ret(total);
        let mut sum = b.function("sum", &["first"], vec![bind_total, bind_i, lp, ret]);
        sum.rest = Some("rest".into());

        let one = b.int(1);
        let alone = b.call("sum", vec![one]);
        let args: Vec<_> = (1..=3).map(|n| b.int(n)).collect();
        let several = b.call("sum", args);
        let list = b.expr(ExprKind::List(vec![alone, several]));
        let ret = b.ret(list);
        let main = b.function("main", &[], vec![ret]);
        let program = link(&module(vec![], vec![sum, main]));

        assert_eq!(
            invoke(&program, "main", &[]),
            Ok(HostValue::List(vec![HostValue::Int(1), HostValue::Int(6)]))
        );
        let args: Vec<_> = (1..=4).map(HostValue::Int).collect();
        assert_eq!(invoke(&program, "sum", &args), Ok(HostValue::Int(10)));
    }
}
