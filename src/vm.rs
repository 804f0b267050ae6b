use std::collections::HashMap;
use std::mem;

use crate::call_frame::CallFrame;
use crate::chunk::OpCode;
use crate::compiler::Parser;
use crate::error::{ErrorKind, RuntimeError, TraceFrame};
use crate::gc::GarbageCollector;
use crate::natives;
use crate::objects::object::{Object, ObjectType};
use crate::objects::object_closure::ObjectClosure;
use crate::objects::object_coroutine::{CoroutineStatus, ObjectCoroutine, SavedCaller};
use crate::objects::object_dict::ObjectDict;
use crate::objects::object_function::ObjectFunction;
use crate::objects::object_list::ObjectList;
use crate::objects::object_manager::ObjectManager;
use crate::objects::object_native_function::{NativeFn, ObjectNativeFunction};
use crate::objects::object_string::ObjectString;
use crate::objects::object_upvalue::ObjectUpvalue;
use crate::table::Table;
use crate::value::{
    as_bool, as_number, as_object, is_bool, is_closure, is_coroutine, is_dict, is_list, is_nil,
    is_number, is_object, is_string, make_bool_value, make_nil_value, make_number_value,
    make_object_value, object_kind, values_equal, Value,
};

pub const FRAMES_MAX: usize = 64;
pub const STACK_INITIAL: usize = FRAMES_MAX * (u8::MAX as usize + 1);

const GC_HEAP_GROW_FACTOR: usize = 2;
const GC_FIRST_TRIGGER: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretResult {
    Ok,
    CompileError,
    RuntimeError,
}

/// Everything that makes up one runnable context: the value stack, the
/// call frames, and the open upvalues pointing into the stack (kept in
/// descending slot-address order). The main context lives in the VM;
/// suspended coroutines each own one of these.
pub struct ExecutionContext {
    pub stack: Vec<Value>,
    pub frames: Vec<CallFrame>,
    pub open_upvalues: Vec<*mut ObjectUpvalue>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        ExecutionContext {
            stack: Vec::with_capacity(STACK_INITIAL),
            frames: Vec::with_capacity(FRAMES_MAX),
            open_upvalues: Vec::new(),
        }
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        ExecutionContext::new()
    }
}

pub struct VM {
    context: ExecutionContext,
    // Null while the main context is running.
    current_coroutine: *mut ObjectCoroutine,
    globals: Table,
    strings: Table,
    object_manager: ObjectManager,
    gc: GarbageCollector,
    bytes_allocated: usize,
    next_gc: usize,
}

impl VM {
    pub fn new() -> VM {
        let mut vm = VM {
            context: ExecutionContext::new(),
            current_coroutine: std::ptr::null_mut(),
            globals: Table::new(),
            strings: Table::new(),
            object_manager: ObjectManager::new(),
            gc: GarbageCollector::new(),
            bytes_allocated: 0,
            next_gc: GC_FIRST_TRIGGER,
        };
        vm.define_native("print", -1, natives::print_native);
        vm.define_native("clock", 0, natives::clock_native);
        vm.define_native("len", 1, natives::len_native);
        vm
    }

    /// Register (or replace) a global native function.
    pub fn define_native(&mut self, name: &str, arity: i32, function: NativeFn) {
        let (ptr, _) = self
            .object_manager
            .alloc_native(name.to_string(), arity, function);
        self.globals
            .insert(name.to_string(), make_object_value(ptr as *mut Object));
    }

    pub fn get_global(&self, name: &str) -> Option<Value> {
        self.globals.find(name)
    }

    pub fn gc_stats(&self) -> &crate::gc::GcStats {
        self.gc.stats()
    }

    pub fn interpret(&mut self, source: &str) -> InterpretResult {
        let function =
            Parser::new(&mut self.object_manager, &mut self.strings, source).compile();
        let Some(function) = function else {
            return InterpretResult::CompileError;
        };

        let (function_ptr, _) = self.object_manager.adopt_function(function);
        let (closure_ptr, _) = self.object_manager.alloc_closure(function_ptr);
        self.push(make_object_value(closure_ptr as *mut Object));
        self.context.frames.push(CallFrame::new(closure_ptr, 0));

        match self.run() {
            Ok(()) => InterpretResult::Ok,
            Err(error) => {
                self.report_runtime_error(&error);
                self.reset();
                InterpretResult::RuntimeError
            }
        }
    }

    fn report_runtime_error(&mut self, error: &RuntimeError) {
        eprint!("{}", error);
    }

    /// A runtime error unwinds everything; the VM needs a fresh start
    /// before it can interpret again.
    fn reset(&mut self) {
        if !self.current_coroutine.is_null() {
            unsafe {
                (*self.current_coroutine).status = CoroutineStatus::Errored;
            }
            self.current_coroutine = std::ptr::null_mut();
        }
        self.context.stack.clear();
        self.context.frames.clear();
        self.context.open_upvalues.clear();
    }

    // ---- stack ----------------------------------------------------------

    fn push(&mut self, value: Value) {
        if self.context.stack.len() == self.context.stack.capacity() {
            self.grow_stack();
        }
        self.context.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.context.stack.pop().expect("stack underflow")
    }

    fn peek(&self, distance: usize) -> Value {
        let len = self.context.stack.len();
        self.context.stack[len - distance - 1]
    }

    /// Growing the stack buffer moves it; open upvalue pointers are
    /// re-based so absolute slot references stay valid. Frames use offsets
    /// and need no fixing.
    fn grow_stack(&mut self) {
        let old_base = self.context.stack.as_ptr() as usize;
        let slots: Vec<usize> = self
            .context
            .open_upvalues
            .iter()
            .map(|&upvalue| unsafe {
                ((*upvalue).location as usize - old_base) / mem::size_of::<Value>()
            })
            .collect();

        let additional = self.context.stack.capacity().max(u8::MAX as usize + 1);
        self.context.stack.reserve(additional);

        let new_base = self.context.stack.as_mut_ptr();
        for (&upvalue, &slot) in self.context.open_upvalues.iter().zip(slots.iter()) {
            unsafe {
                (*upvalue).location = new_base.add(slot);
            }
        }
    }

    fn is_falsey(value: &Value) -> bool {
        is_nil(value) || (is_bool(value) && !as_bool(value))
    }

    // ---- allocation & GC ------------------------------------------------

    fn maybe_collect(&mut self) {
        self.bytes_allocated += self.object_manager.drain_pending_bytes();
        #[cfg(feature = "debug_stress_gc")]
        {
            self.collect_garbage();
        }
        #[cfg(not(feature = "debug_stress_gc"))]
        if self.bytes_allocated > self.next_gc {
            self.collect_garbage();
        }
    }

    fn collect_garbage(&mut self) {
        self.bytes_allocated += self.object_manager.drain_pending_bytes();
        let before = self.bytes_allocated;

        self.gc
            .mark_roots(&self.context, &self.globals, self.current_coroutine, &[]);
        self.gc.trace_references();
        self.gc.prune_interned(&mut self.strings);
        let freed = self.gc.sweep(&mut self.object_manager);

        self.bytes_allocated = self.bytes_allocated.saturating_sub(freed);
        self.next_gc = (self.bytes_allocated * GC_HEAP_GROW_FACTOR).max(GC_FIRST_TRIGGER);
        self.gc
            .record_cycle(before, freed, self.bytes_allocated, self.next_gc);
    }

    fn allocate_closure(&mut self, function: *mut ObjectFunction) -> *mut ObjectClosure {
        self.maybe_collect();
        let (ptr, _) = self.object_manager.alloc_closure(function);
        ptr
    }

    fn allocate_upvalue(&mut self, location: *mut Value) -> *mut ObjectUpvalue {
        self.maybe_collect();
        let (ptr, _) = self.object_manager.alloc_upvalue(location);
        ptr
    }

    fn allocate_coroutine(&mut self, closure: *mut ObjectClosure) -> *mut ObjectCoroutine {
        self.maybe_collect();
        let (ptr, _) = self.object_manager.alloc_coroutine(closure);
        ptr
    }

    fn intern_take(&mut self, text: String) -> *mut ObjectString {
        if let Some(existing) = self.strings.find(&text) {
            return as_object(&existing) as *mut ObjectString;
        }
        self.maybe_collect();
        self.object_manager.intern_take(&mut self.strings, text)
    }

    // ---- bytecode reading -----------------------------------------------

    fn read_byte(&mut self) -> u8 {
        let frame = self.context.frames.last_mut().expect("no active frame");
        let byte = unsafe { (&(*(*frame.closure).function).chunk.code)[frame.ip] };
        frame.ip += 1;
        byte
    }

    fn read_u24(&mut self) -> usize {
        let low = self.read_byte() as usize;
        let mid = self.read_byte() as usize;
        let high = self.read_byte() as usize;
        low | (mid << 8) | (high << 16)
    }

    fn read_u32(&mut self) -> usize {
        let b1 = self.read_byte() as usize;
        let b2 = self.read_byte() as usize;
        let b3 = self.read_byte() as usize;
        let b4 = self.read_byte() as usize;
        (b1 << 24) | (b2 << 16) | (b3 << 8) | b4
    }

    fn read_constant(&mut self, long: bool) -> Value {
        let index = if long {
            self.read_u24()
        } else {
            self.read_byte() as usize
        };
        let frame = self.context.frames.last().expect("no active frame");
        unsafe { (*(*frame.closure).function).chunk.get_constant(index) }
    }

    fn read_string_constant(&mut self, long: bool) -> *mut ObjectString {
        as_object(&self.read_constant(long)) as *mut ObjectString
    }

    fn runtime_error(&self, kind: ErrorKind) -> RuntimeError {
        let mut error = RuntimeError::new(kind);
        for frame in self.context.frames.iter().rev() {
            unsafe {
                let function = (*frame.closure).function;
                let offset = frame.ip.saturating_sub(1);
                error.trace.push(TraceFrame {
                    line: (*function).chunk.line_at(offset),
                    function: (*function).name.clone(),
                });
            }
        }
        error
    }

    // ---- dispatch -------------------------------------------------------

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            #[cfg(feature = "debug_trace_execution")]
            debug_feature::trace_instruction(self);

            let byte = self.read_byte();
            let Some(instruction) = OpCode::from_byte(byte) else {
                return Err(self.runtime_error(ErrorKind::Internal(format!(
                    "unknown opcode {}",
                    byte
                ))));
            };

            match instruction {
                OpCode::Constant => {
                    let constant = self.read_constant(false);
                    self.push(constant);
                }
                OpCode::ConstantLong => {
                    let constant = self.read_constant(true);
                    self.push(constant);
                }
                OpCode::Nil => self.push(make_nil_value()),
                OpCode::True => self.push(make_bool_value(true)),
                OpCode::False => self.push(make_bool_value(false)),
                OpCode::Pop => {
                    self.pop();
                }

                OpCode::GetLocal | OpCode::GetLocalLong => {
                    let slot = if instruction == OpCode::GetLocal {
                        self.read_byte() as usize
                    } else {
                        self.read_u24()
                    };
                    let base = self.context.frames.last().expect("no active frame").slots;
                    let value = self.context.stack[base + slot];
                    self.push(value);
                }
                OpCode::SetLocal | OpCode::SetLocalLong => {
                    let slot = if instruction == OpCode::SetLocal {
                        self.read_byte() as usize
                    } else {
                        self.read_u24()
                    };
                    let base = self.context.frames.last().expect("no active frame").slots;
                    self.context.stack[base + slot] = self.peek(0);
                }

                OpCode::GetGlobal | OpCode::GetGlobalLong => {
                    let name = self.read_string_constant(instruction == OpCode::GetGlobalLong);
                    let content = unsafe { &(*name).content };
                    match self.globals.find(content) {
                        Some(value) => self.push(value),
                        None => {
                            return Err(self.runtime_error(ErrorKind::UndefinedGlobal(
                                content.clone(),
                            )))
                        }
                    }
                }
                OpCode::SetGlobal | OpCode::SetGlobalLong => {
                    let name = self.read_string_constant(instruction == OpCode::SetGlobalLong);
                    let content = unsafe { &(*name).content };
                    if self.globals.find(content).is_none() {
                        return Err(
                            self.runtime_error(ErrorKind::UndefinedGlobal(content.clone()))
                        );
                    }
                    let value = self.peek(0);
                    self.globals.insert(content.clone(), value);
                }

                OpCode::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let frame = self.context.frames.last().expect("no active frame");
                    let value = unsafe { *(*(&(*frame.closure).upvalues)[slot]).location };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let value = self.peek(0);
                    let frame = self.context.frames.last().expect("no active frame");
                    unsafe {
                        *(*(&mut (*frame.closure).upvalues)[slot]).location = value;
                    }
                }

                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(make_bool_value(values_equal(&a, &b)));
                }
                OpCode::Greater | OpCode::Less | OpCode::Subtract | OpCode::Multiply
                | OpCode::Divide => {
                    self.binary_op(instruction)?;
                }
                OpCode::Add => {
                    if is_string(&self.peek(0)) && is_string(&self.peek(1)) {
                        self.concatenate()?;
                    } else {
                        #[cfg(feature = "dynamic_type_checking")]
                        if !(is_number(&self.peek(0)) && is_number(&self.peek(1))) {
                            return Err(self.runtime_error(ErrorKind::TypeMismatch(
                                "Operands must be two numbers or two strings.".to_string(),
                            )));
                        }
                        let b = as_number(&self.pop());
                        let a = as_number(&self.pop());
                        self.push(make_number_value(a + b));
                    }
                }
                OpCode::Not => {
                    let value = self.pop();
                    self.push(make_bool_value(Self::is_falsey(&value)));
                }
                OpCode::Negate => {
                    #[cfg(feature = "dynamic_type_checking")]
                    if !is_number(&self.peek(0)) {
                        return Err(self.runtime_error(ErrorKind::TypeMismatch(
                            "Operand must be a number.".to_string(),
                        )));
                    }
                    let value = self.pop();
                    self.push(make_number_value(-as_number(&value)));
                }

                OpCode::Jump => {
                    let jump = self.read_u32();
                    self.context.frames.last_mut().expect("no active frame").ip += jump;
                }
                OpCode::JumpIfFalse => {
                    let jump = self.read_u32();
                    if Self::is_falsey(&self.peek(0)) {
                        self.context.frames.last_mut().expect("no active frame").ip += jump;
                    }
                }
                OpCode::Loop => {
                    let jump = self.read_u32();
                    self.context.frames.last_mut().expect("no active frame").ip -= jump;
                }

                OpCode::Call => {
                    let argc = self.read_byte() as usize;
                    let callee = self.peek(argc);
                    self.call_value(callee, argc)?;
                }

                OpCode::Closure | OpCode::ClosureLong => {
                    let constant = self.read_constant(instruction == OpCode::ClosureLong);
                    let function_ptr = as_object(&constant) as *mut ObjectFunction;
                    let closure_ptr = self.allocate_closure(function_ptr);
                    self.push(make_object_value(closure_ptr as *mut Object));

                    let upvalue_count = unsafe { (*function_ptr).upvalue_count };
                    for index in 0..upvalue_count {
                        let is_local = self.read_byte() == 1;
                        let slot = self.read_byte() as usize;
                        let upvalue = if is_local {
                            let base =
                                self.context.frames.last().expect("no active frame").slots;
                            self.capture_upvalue(base + slot)
                        } else {
                            let frame = self.context.frames.last().expect("no active frame");
                            unsafe { (&(*frame.closure).upvalues)[slot] }
                        };
                        unsafe {
                            (&mut (*closure_ptr).upvalues)[index] = upvalue;
                        }
                    }
                }
                OpCode::CloseUpvalue => {
                    let top = self.context.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }

                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.context.frames.pop().expect("no active frame");
                    self.close_upvalues(frame.slots);

                    if self.context.frames.is_empty() {
                        if self.current_coroutine.is_null() {
                            self.context.stack.truncate(0);
                            return Ok(());
                        }
                        unsafe {
                            self.finish_coroutine(result);
                        }
                    } else {
                        self.context.stack.truncate(frame.slots);
                        self.push(result);
                    }
                }

                OpCode::List | OpCode::ListLong => {
                    let count = if instruction == OpCode::List {
                        self.read_byte() as usize
                    } else {
                        self.read_u24()
                    };
                    self.list_literal(count);
                }
                OpCode::Dict | OpCode::DictLong => {
                    let count = if instruction == OpCode::Dict {
                        self.read_byte() as usize
                    } else {
                        self.read_u24()
                    };
                    self.dict_literal(count)?;
                }

                OpCode::GetField => {
                    let key = self.pop();
                    let receiver = self.pop();
                    let value = self.get_field(&receiver, &key)?;
                    self.push(value);
                }
                OpCode::SetField => {
                    let value = self.pop();
                    let key = self.pop();
                    let receiver = self.pop();
                    self.set_field(&receiver, &key, value)?;
                    self.push(value);
                }

                OpCode::Coroutine => {
                    let value = self.peek(0);
                    if !is_closure(&value) {
                        return Err(self.runtime_error(ErrorKind::Internal(
                            "coroutine wrapper expects a closure".to_string(),
                        )));
                    }
                    let closure = as_object(&value) as *mut ObjectClosure;
                    let coroutine = self.allocate_coroutine(closure);
                    self.pop();
                    self.push(make_object_value(coroutine as *mut Object));
                }
                OpCode::Yield => {
                    if self.current_coroutine.is_null() {
                        return Err(self.runtime_error(ErrorKind::YieldOutsideCoroutine));
                    }
                    let value = self.pop();
                    unsafe {
                        self.suspend_coroutine(value);
                    }
                }
                OpCode::Await => {
                    let value = self.pop();
                    if !is_coroutine(&value) {
                        return Err(self.runtime_error(ErrorKind::BadCallTarget(
                            "Can only await coroutines.".to_string(),
                        )));
                    }
                    let coroutine = as_object(&value) as *mut ObjectCoroutine;
                    unsafe {
                        self.resume_coroutine(coroutine)?;
                    }
                }
            }
        }
    }

    fn binary_op(&mut self, op: OpCode) -> Result<(), RuntimeError> {
        #[cfg(feature = "dynamic_type_checking")]
        if !(is_number(&self.peek(0)) && is_number(&self.peek(1))) {
            return Err(self.runtime_error(ErrorKind::TypeMismatch(
                "Operands must be numbers.".to_string(),
            )));
        }

        let b = as_number(&self.pop());
        let a = as_number(&self.pop());
        match op {
            OpCode::Greater => self.push(make_bool_value(a > b)),
            OpCode::Less => self.push(make_bool_value(a < b)),
            OpCode::Subtract => self.push(make_number_value(a - b)),
            OpCode::Multiply => self.push(make_number_value(a * b)),
            OpCode::Divide => self.push(make_number_value(a / b)),
            _ => {
                return Err(self.runtime_error(ErrorKind::Internal(
                    "unexpected binary operator".to_string(),
                )))
            }
        }
        Ok(())
    }

    fn concatenate(&mut self) -> Result<(), RuntimeError> {
        unsafe {
            let b = as_object(&self.peek(0)) as *mut ObjectString;
            let a = as_object(&self.peek(1)) as *mut ObjectString;
            let mut combined =
                String::with_capacity((&(*a).content).len() + (&(*b).content).len());
            combined.push_str(&(*a).content);
            combined.push_str(&(*b).content);
            // Operands stay on the stack until the result exists, so a
            // collection triggered by the allocation cannot free them.
            let result = self.intern_take(combined);
            self.pop();
            self.pop();
            self.push(make_object_value(result as *mut Object));
        }
        Ok(())
    }

    // ---- calls ----------------------------------------------------------

    fn call_value(&mut self, callee: Value, argc: usize) -> Result<(), RuntimeError> {
        if is_object(&callee) {
            match object_kind(&callee) {
                Some(ObjectType::Closure) => {
                    return self.call_closure(as_object(&callee) as *mut ObjectClosure, argc)
                }
                Some(ObjectType::Native) => {
                    return self
                        .call_native(as_object(&callee) as *mut ObjectNativeFunction, argc)
                }
                Some(ObjectType::Coroutine) => {
                    return self
                        .instantiate_coroutine(as_object(&callee) as *mut ObjectCoroutine, argc)
                }
                _ => {}
            }
        }
        Err(self.runtime_error(ErrorKind::BadCallTarget(
            "Can only call functions.".to_string(),
        )))
    }

    fn call_closure(&mut self, closure: *mut ObjectClosure, argc: usize) -> Result<(), RuntimeError> {
        let arity = unsafe { (*(*closure).function).arity } as usize;
        if argc != arity {
            return Err(self.runtime_error(ErrorKind::ArityMismatch {
                expected: arity,
                got: argc,
            }));
        }
        if self.context.frames.len() == FRAMES_MAX {
            return Err(self.runtime_error(ErrorKind::StackOverflow));
        }
        let slots = self.context.stack.len() - argc - 1;
        self.context.frames.push(CallFrame::new(closure, slots));
        Ok(())
    }

    fn call_native(
        &mut self,
        native: *mut ObjectNativeFunction,
        argc: usize,
    ) -> Result<(), RuntimeError> {
        #[cfg(feature = "native_arity_checking")]
        {
            let arity = unsafe { (*native).arity };
            if arity >= 0 && arity as usize != argc {
                return Err(self.runtime_error(ErrorKind::ArityMismatch {
                    expected: arity as usize,
                    got: argc,
                }));
            }
        }

        let function = unsafe { (*native).function };
        let args_start = self.context.stack.len() - argc;
        let args: Vec<Value> = self.context.stack[args_start..].to_vec();
        match function(&args) {
            Ok(result) => {
                self.context.stack.truncate(args_start - 1);
                self.push(result);
                Ok(())
            }
            Err(message) => Err(self.runtime_error(ErrorKind::NativeError(message))),
        }
    }

    /// Calling a coroutine value produces a fresh suspended instance with
    /// the arguments seeded into its frame-zero slots.
    fn instantiate_coroutine(
        &mut self,
        template: *mut ObjectCoroutine,
        argc: usize,
    ) -> Result<(), RuntimeError> {
        let closure = unsafe { (*template).closure };
        let arity = unsafe { (*(*closure).function).arity } as usize;
        if argc != arity {
            return Err(self.runtime_error(ErrorKind::ArityMismatch {
                expected: arity,
                got: argc,
            }));
        }

        let instance = self.allocate_coroutine(closure);
        let args_start = self.context.stack.len() - argc;
        unsafe {
            (*instance)
                .stack
                .extend_from_slice(&self.context.stack[args_start..]);
        }
        self.context.stack.truncate(args_start - 1);
        self.push(make_object_value(instance as *mut Object));
        Ok(())
    }

    // ---- upvalues -------------------------------------------------------

    fn capture_upvalue(&mut self, slot: usize) -> *mut ObjectUpvalue {
        let location = unsafe { self.context.stack.as_mut_ptr().add(slot) };

        // The list is ordered by descending slot address; at most one open
        // upvalue exists per slot.
        let mut index = 0;
        while index < self.context.open_upvalues.len() {
            let existing = self.context.open_upvalues[index];
            let existing_location = unsafe { (*existing).location };
            if std::ptr::eq(existing_location, location) {
                return existing;
            }
            if (existing_location as usize) < (location as usize) {
                break;
            }
            index += 1;
        }

        let upvalue = self.allocate_upvalue(location);
        self.context.open_upvalues.insert(index, upvalue);
        upvalue
    }

    /// Close every open upvalue at or above the given slot, starting from
    /// the head of the descending-ordered list.
    fn close_upvalues(&mut self, from_slot: usize) {
        let from = unsafe { self.context.stack.as_mut_ptr().add(from_slot) } as usize;
        while let Some(&upvalue) = self.context.open_upvalues.first() {
            let location = unsafe { (*upvalue).location } as usize;
            if location < from {
                break;
            }
            unsafe {
                (*upvalue).close();
            }
            self.context.open_upvalues.remove(0);
        }
    }

    // ---- aggregates & fields --------------------------------------------

    fn list_literal(&mut self, count: usize) {
        let start = self.context.stack.len() - count;
        let elements = self.context.stack[start..].to_vec();
        // The elements stay on the stack through the allocation so they
        // remain rooted if it triggers a collection.
        self.maybe_collect();
        let (ptr, _) = self.object_manager.alloc_list(elements);
        self.context.stack.truncate(start);
        self.push(make_object_value(ptr as *mut Object));
    }

    fn dict_literal(&mut self, count: usize) -> Result<(), RuntimeError> {
        let start = self.context.stack.len() - 2 * count;
        let mut entries = HashMap::with_capacity(count);
        for pair in self.context.stack[start..].chunks(2) {
            let (key, value) = (pair[0], pair[1]);
            if !is_string(&key) {
                return Err(self.runtime_error(ErrorKind::Internal(
                    "dict key must be a string".to_string(),
                )));
            }
            // Duplicate keys keep the last-written value.
            entries.insert(as_object(&key) as *mut ObjectString, value);
        }

        self.maybe_collect();
        let (ptr, _) = self.object_manager.alloc_dict(entries);
        self.context.stack.truncate(start);
        self.push(make_object_value(ptr as *mut Object));
        Ok(())
    }

    fn list_index(&self, elements: &[Value], key: &Value) -> Result<usize, RuntimeError> {
        if !is_number(key) {
            return Err(self.runtime_error(ErrorKind::TypeMismatch(
                "List indices must be numbers.".to_string(),
            )));
        }
        let number = as_number(key);
        if number.fract() != 0.0 {
            return Err(self.runtime_error(ErrorKind::TypeMismatch(
                "List indices must be integers.".to_string(),
            )));
        }
        let index = number as i64;
        if index < 0 || index as usize >= elements.len() {
            return Err(self.runtime_error(ErrorKind::IndexOutOfRange(format!(
                "List index {} out of range (len {}).",
                index,
                elements.len()
            ))));
        }
        Ok(index as usize)
    }

    fn get_field(&self, receiver: &Value, key: &Value) -> Result<Value, RuntimeError> {
        if is_list(receiver) {
            let list = unsafe { &*(as_object(receiver) as *mut ObjectList) };
            let index = self.list_index(&list.elements, key)?;
            return Ok(list.elements[index]);
        }
        if is_dict(receiver) {
            if !is_string(key) {
                return Err(self.runtime_error(ErrorKind::TypeMismatch(
                    "Dict keys must be strings.".to_string(),
                )));
            }
            let dict = unsafe { &*(as_object(receiver) as *mut ObjectDict) };
            let key_ptr = as_object(key) as *mut ObjectString;
            // A missing key reads as nil.
            return Ok(dict
                .entries
                .get(&key_ptr)
                .copied()
                .unwrap_or_else(make_nil_value));
        }
        Err(self.runtime_error(ErrorKind::TypeMismatch(
            "Only lists and dicts have fields.".to_string(),
        )))
    }

    fn set_field(&mut self, receiver: &Value, key: &Value, value: Value) -> Result<(), RuntimeError> {
        if is_list(receiver) {
            let list = unsafe { &mut *(as_object(receiver) as *mut ObjectList) };
            let index = self.list_index(&list.elements, key)?;
            list.elements[index] = value;
            return Ok(());
        }
        if is_dict(receiver) {
            if !is_string(key) {
                return Err(self.runtime_error(ErrorKind::TypeMismatch(
                    "Dict keys must be strings.".to_string(),
                )));
            }
            let dict = unsafe { &mut *(as_object(receiver) as *mut ObjectDict) };
            dict.entries
                .insert(as_object(key) as *mut ObjectString, value);
            return Ok(());
        }
        Err(self.runtime_error(ErrorKind::TypeMismatch(
            "Only lists and dicts have fields.".to_string(),
        )))
    }

    // ---- coroutines -----------------------------------------------------

    unsafe fn resume_coroutine(
        &mut self,
        coroutine: *mut ObjectCoroutine,
    ) -> Result<(), RuntimeError> {
        match (*coroutine).status {
            CoroutineStatus::Completed | CoroutineStatus::Errored => {
                return Err(self.runtime_error(ErrorKind::CoroutineCompleted));
            }
            CoroutineStatus::Running => {
                return Err(self.runtime_error(ErrorKind::CoroutineRunning));
            }
            CoroutineStatus::Suspended => {}
        }

        if !(*coroutine).started {
            let arity = (*(*(*coroutine).closure).function).arity as usize;
            let seeded = (*coroutine).stack.len() - 1;
            if seeded != arity {
                return Err(self.runtime_error(ErrorKind::ArityMismatch {
                    expected: arity,
                    got: seeded,
                }));
            }
        }

        let caller_stack =
            mem::replace(&mut self.context.stack, mem::take(&mut (*coroutine).stack));
        let caller_frames =
            mem::replace(&mut self.context.frames, mem::take(&mut (*coroutine).frames));
        let caller_upvalues = mem::replace(
            &mut self.context.open_upvalues,
            mem::take(&mut (*coroutine).open_upvalues),
        );
        (*coroutine).resumed_by = Some(Box::new(SavedCaller {
            stack: caller_stack,
            frames: caller_frames,
            open_upvalues: caller_upvalues,
            coroutine: self.current_coroutine,
        }));
        self.current_coroutine = coroutine;
        (*coroutine).status = CoroutineStatus::Running;

        if (*coroutine).started {
            // The pending yield expression evaluates to nil on resume.
            self.push(make_nil_value());
        } else {
            (*coroutine).started = true;
        }
        Ok(())
    }

    unsafe fn suspend_coroutine(&mut self, value: Value) {
        let coroutine = self.current_coroutine;
        (*coroutine).resume_value = value;
        (*coroutine).status = CoroutineStatus::Suspended;

        let caller = (*coroutine)
            .resumed_by
            .take()
            .expect("running coroutine has no awaiter");
        (*coroutine).stack = mem::replace(&mut self.context.stack, caller.stack);
        (*coroutine).frames = mem::replace(&mut self.context.frames, caller.frames);
        (*coroutine).open_upvalues =
            mem::replace(&mut self.context.open_upvalues, caller.open_upvalues);
        self.current_coroutine = caller.coroutine;

        self.push(value);
    }

    /// A coroutine whose outermost frame returned transfers the result to
    /// its awaiter exactly like a yield, but leaves the coroutine dead.
    unsafe fn finish_coroutine(&mut self, result: Value) {
        let coroutine = self.current_coroutine;
        (*coroutine).status = CoroutineStatus::Completed;
        (*coroutine).resume_value = result;

        let caller = (*coroutine)
            .resumed_by
            .take()
            .expect("completed coroutine has no awaiter");
        self.context.stack = caller.stack;
        self.context.frames = caller.frames;
        self.context.open_upvalues = caller.open_upvalues;
        self.current_coroutine = caller.coroutine;

        self.push(result);
    }
}

impl Default for VM {
    fn default() -> Self {
        VM::new()
    }
}

#[cfg(feature = "debug_trace_execution")]
mod debug_feature {
    use super::*;
    use crate::debug;
    use crate::value::format_value;

    pub fn trace_instruction(vm: &VM) {
        print!("          ");
        for value in &vm.context.stack {
            print!("[ {} ]", format_value(value));
        }
        println!();
        if let Some(frame) = vm.context.frames.last() {
            let chunk = unsafe { &(*(*frame.closure).function).chunk };
            debug::disassemble_instruction(chunk, frame.ip);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interprets_arithmetic() {
        let mut vm = VM::new();
        assert_eq!(vm.interpret("!(5 - 4 > 3 * 2 == !nil);"), InterpretResult::Ok);
    }

    #[test]
    fn interprets_string_concatenation() {
        let mut vm = VM::new();
        assert_eq!(
            vm.interpret("var s = \"st\" + \"ri\" + \"ng\";"),
            InterpretResult::Ok
        );
    }

    #[test]
    fn concatenated_strings_are_interned() {
        let mut vm = VM::new();
        assert_eq!(
            vm.interpret("var ok = \"str\" + \"ing\" == \"string\";"),
            InterpretResult::Ok
        );
    }

    #[test]
    fn syntax_errors_are_compile_errors() {
        let mut vm = VM::new();
        assert_eq!(vm.interpret("var = 1;"), InterpretResult::CompileError);
    }

    #[test]
    fn type_errors_are_runtime_errors() {
        let mut vm = VM::new();
        assert_eq!(vm.interpret("1 + true;"), InterpretResult::RuntimeError);
    }

    #[test]
    fn undefined_globals_are_runtime_errors() {
        let mut vm = VM::new();
        assert_eq!(vm.interpret("missing;"), InterpretResult::RuntimeError);
        let mut vm = VM::new();
        assert_eq!(vm.interpret("missing = 1;"), InterpretResult::RuntimeError);
    }

    #[test]
    fn natives_are_predefined_globals() {
        let mut vm = VM::new();
        assert!(vm.get_global("print").is_some());
        assert!(vm.get_global("clock").is_some());
        assert_eq!(vm.interpret("var t = clock();"), InterpretResult::Ok);
    }

    #[test]
    fn native_arity_is_enforced() {
        let mut vm = VM::new();
        assert_eq!(
            vm.interpret("clock(1, 2);"),
            if cfg!(feature = "native_arity_checking") {
                InterpretResult::RuntimeError
            } else {
                InterpretResult::Ok
            }
        );
    }

    #[test]
    fn calling_a_number_is_a_runtime_error() {
        let mut vm = VM::new();
        assert_eq!(vm.interpret("var x = 1; x();"), InterpretResult::RuntimeError);
    }

    #[test]
    fn closure_arity_is_enforced() {
        let mut vm = VM::new();
        assert_eq!(
            vm.interpret("fun f(a, b) { return a; } f(1);"),
            InterpretResult::RuntimeError
        );
    }

    #[test]
    fn deep_recursion_overflows_the_frame_stack() {
        let mut vm = VM::new();
        assert_eq!(
            vm.interpret("fun f() { f(); } f();"),
            InterpretResult::RuntimeError
        );
    }

    #[test]
    fn closures_capture_and_mutate_locals() {
        let mut vm = VM::new();
        assert_eq!(
            vm.interpret(
                "fun make() {
                     var n = 0;
                     fun inc() {
                         n = n + 1;
                         return n;
                     }
                     return inc;
                 }
                 var counter = make();
                 counter();
                 counter();"
            ),
            InterpretResult::Ok
        );
    }

    #[test]
    fn list_indexing_checks_bounds() {
        let mut vm = VM::new();
        assert_eq!(
            vm.interpret("var l = [1, 2]; l[1];"),
            InterpretResult::Ok
        );
        let mut vm = VM::new();
        assert_eq!(
            vm.interpret("var l = [1, 2]; l[2];"),
            InterpretResult::RuntimeError
        );
        let mut vm = VM::new();
        assert_eq!(
            vm.interpret("var l = [1, 2]; l[0.5];"),
            InterpretResult::RuntimeError
        );
    }

    #[test]
    fn field_access_on_numbers_is_a_runtime_error() {
        let mut vm = VM::new();
        assert_eq!(vm.interpret("var x = 1; x.field;"), InterpretResult::RuntimeError);
    }

    #[test]
    fn coroutines_yield_and_complete() {
        let mut vm = VM::new();
        assert_eq!(
            vm.interpret(
                "coroutine g() {
                     yield 1;
                     yield 2;
                 }
                 var c = g();
                 await c;
                 await c;"
            ),
            InterpretResult::Ok
        );
    }

    #[test]
    fn awaiting_a_completed_coroutine_is_a_runtime_error() {
        let mut vm = VM::new();
        assert_eq!(
            vm.interpret(
                "coroutine g() { return 1; }
                 var c = g();
                 await c;
                 await c;"
            ),
            InterpretResult::RuntimeError
        );
    }

    #[test]
    fn yield_outside_a_coroutine_is_a_runtime_error() {
        let mut vm = VM::new();
        assert_eq!(vm.interpret("yield 1;"), InterpretResult::RuntimeError);
    }

    #[test]
    fn awaiting_a_number_is_a_runtime_error() {
        let mut vm = VM::new();
        assert_eq!(vm.interpret("await 1;"), InterpretResult::RuntimeError);
    }

    #[test]
    fn while_loops_terminate() {
        let mut vm = VM::new();
        assert_eq!(
            vm.interpret(
                "var i = 0;
                 while i < 10 {
                     i = i + 1;
                 }"
            ),
            InterpretResult::Ok
        );
    }

    #[test]
    fn for_loop_with_empty_clauses_runs_until_break() {
        let mut vm = VM::new();
        assert_eq!(
            vm.interpret(
                "var i = 0;
                 for ;; {
                     i = i + 1;
                     if i == 3 { break; }
                 }"
            ),
            InterpretResult::Ok
        );
    }

    #[test]
    fn the_vm_recovers_state_size_after_reset() {
        let mut vm = VM::new();
        assert_eq!(vm.interpret("1 + true;"), InterpretResult::RuntimeError);
        assert!(vm.context.stack.is_empty());
        assert!(vm.context.frames.is_empty());
        assert!(vm.context.open_upvalues.is_empty());
    }
}
