//! The bytecode interpreter.
//!
//! The VM executes one script at a time over a value stack and a frame
//! stack. Dispatch is a dense match over the opcode byte. Nested execution
//! (native code calling back into Ember: interceptors, promise reactions,
//! generator resumption) re-enters [`Vm::run`] with a frame mark; the loop
//! returns to its caller when the frame stack drops back to the mark.

mod attr;
mod call;
mod exceptions;
mod generator;
mod promise;

use ahash::{AHashMap, AHashSet};
use smallvec::SmallVec;

pub(crate) use exceptions::ExceptionHandler;
pub(crate) use generator::Resume;

use crate::{
    bytecode::Opcode,
    compiler::{self, HANDLER_NO_CATCH, HANDLER_NO_FINALLY},
    config::VmConfig,
    error::{InterpretError, RunError, RunResult},
    heap::{Generation, Heap, HeapId, HeapStats},
    io::PrintWriter,
    natives,
    object::{
        Array, BehaviorType, Class, Closure, Dict, Module, Namespace, ObjData, Upvalue,
    },
    value::Value,
};

pub(crate) const FRAMES_MAX: usize = 64;

/// One activation on the call stack.
#[derive(Debug)]
pub(crate) struct CallFrame {
    pub closure: HeapId,
    /// The closure's function, cached to keep instruction fetch cheap.
    pub function: HeapId,
    pub ip: usize,
    /// Base index of this frame's window into the value stack.
    pub slots: usize,
    pub handlers: SmallVec<[ExceptionHandler; 2]>,
    /// Whether this call pushed the closure's namespace.
    pub pushed_namespace: bool,
}

/// Heap ids of the predefined classes and the root namespace.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CoreClasses {
    pub object: HeapId,
    pub class: HeapId,
    pub trait_class: HeapId,
    pub namespace: HeapId,
    pub module: HeapId,
    pub string: HeapId,
    pub number: HeapId,
    pub int: HeapId,
    pub float: HeapId,
    pub bool_: HeapId,
    pub nil: HeapId,
    pub function: HeapId,
    pub method: HeapId,
    pub array: HeapId,
    pub dictionary: HeapId,
    pub range: HeapId,
    pub exception: HeapId,
    pub generator: HeapId,
    pub promise: HeapId,
    pub root_namespace: HeapId,
}

/// A virtual machine executing one Ember program.
pub struct Vm<'out> {
    pub(crate) heap: Heap,
    pub(crate) stack: Vec<Value>,
    pub(crate) frames: Vec<CallFrame>,
    /// Open upvalues, sorted by stack slot descending.
    pub(crate) open_upvalues: Vec<HeapId>,
    pub(crate) globals: AHashMap<HeapId, Value>,
    /// Names bound with `val` at global scope.
    pub(crate) immutable_globals: AHashSet<HeapId>,
    /// Class registry: name id to class value.
    pub(crate) classes: AHashMap<HeapId, Value>,
    /// Namespace registry: fully-qualified name id to namespace value.
    pub(crate) namespaces: AHashMap<HeapId, Value>,
    /// Module registry: source path id to module value.
    pub(crate) modules: AHashMap<HeapId, Value>,
    /// Namespace nesting during execution; the root namespace is always at
    /// the bottom.
    pub(crate) namespace_stack: Vec<HeapId>,
    pub(crate) running_generator: Option<HeapId>,
    /// Exception saved across a finally block, rethrown by EndFinally.
    pub(crate) pending_exception: Option<Value>,
    /// Root for the in-flight exception while unwinding.
    pub(crate) thrown: Option<Value>,
    /// In-progress functions of the compiler chain; GC roots during compile.
    pub(crate) compiler_roots: Vec<HeapId>,
    pub(crate) init_string: HeapId,
    pub(crate) core: CoreClasses,
    /// Pre-interned interceptor hook names and internal capture keys.
    pub(crate) hooks: natives::HookNames,
    pub(crate) config: VmConfig,
    pub(crate) current_module: Option<HeapId>,
    pub(crate) out: &'out mut dyn PrintWriter,
}

impl<'out> Vm<'out> {
    /// Builds a VM: bootstraps the core class hierarchy and registers the
    /// `lang` natives. Everything created here lives in the Permanent
    /// generation.
    pub fn new(config: VmConfig, out: &'out mut dyn PrintWriter) -> Self {
        let mut heap = Heap::new(config.clone());
        heap.set_allocation_generation(Generation::Permanent);

        let init_string = heap.copy_string("init");
        let empty = heap.copy_string("");
        let root_namespace = heap.allocate(
            ObjData::Namespace(Namespace {
                short_name: empty,
                full_name: empty,
                parent: None,
                values: AHashMap::new(),
            }),
            None,
        );

        let mut globals = AHashMap::new();
        let mut classes = AHashMap::new();

        // The knot at the root of the metaclass graph: Object, Class, and
        // their metaclasses reference each other cyclically.
        let object = raw_class(&mut heap, "Object", BehaviorType::Class);
        let class_class = raw_class(&mut heap, "Class", BehaviorType::Class);
        let object_meta = raw_class(&mut heap, "Object class", BehaviorType::Metaclass);
        let class_meta = raw_class(&mut heap, "Class class", BehaviorType::Metaclass);
        heap.set_class(object, object_meta);
        heap.set_class(class_class, class_meta);
        heap.set_class(object_meta, class_class);
        heap.set_class(class_meta, class_class);
        heap.class_mut(class_class).superclass = Some(object);
        heap.class_mut(object_meta).superclass = Some(class_class);
        heap.class_mut(class_meta).superclass = Some(class_class);
        for (class, name) in [(object, "Object"), (class_class, "Class")] {
            let id = heap.copy_string(name);
            globals.insert(id, Value::Obj(class));
            classes.insert(id, Value::Obj(class));
        }

        let mut define = |heap: &mut Heap, name: &str, superclass: HeapId| {
            let meta = raw_class(heap, &format!("{name} class"), BehaviorType::Metaclass);
            heap.set_class(meta, class_class);
            heap.class_mut(meta).superclass = Some(class_class);
            let cls = raw_class(heap, name, BehaviorType::Class);
            heap.set_class(cls, meta);
            heap.class_mut(cls).superclass = Some(superclass);
            let id = heap.copy_string(name);
            globals.insert(id, Value::Obj(cls));
            classes.insert(id, Value::Obj(cls));
            cls
        };

        let trait_class = define(&mut heap, "Trait", object);
        let namespace = define(&mut heap, "Namespace", object);
        let module = define(&mut heap, "Module", object);
        let string = define(&mut heap, "String", object);
        let number = define(&mut heap, "Number", object);
        let int = define(&mut heap, "Int", number);
        let float = define(&mut heap, "Float", number);
        let bool_ = define(&mut heap, "Bool", object);
        let nil = define(&mut heap, "Nil", object);
        let function = define(&mut heap, "Function", object);
        let method = define(&mut heap, "Method", object);
        let array = define(&mut heap, "Array", object);
        let dictionary = define(&mut heap, "Dictionary", object);
        let range = define(&mut heap, "Range", object);
        let exception = define(&mut heap, "Exception", object);
        let generator = define(&mut heap, "Generator", object);
        let promise = define(&mut heap, "Promise", object);

        let core = CoreClasses {
            object,
            class: class_class,
            trait_class,
            namespace,
            module,
            string,
            number,
            int,
            float,
            bool_,
            nil,
            function,
            method,
            array,
            dictionary,
            range,
            exception,
            generator,
            promise,
            root_namespace,
        };

        let hooks = natives::HookNames::intern(&mut heap);
        let mut vm = Self {
            heap,
            stack: Vec::with_capacity(FRAMES_MAX * 256),
            frames: Vec::with_capacity(FRAMES_MAX),
            open_upvalues: Vec::new(),
            globals,
            immutable_globals: AHashSet::new(),
            classes,
            namespaces: AHashMap::new(),
            modules: AHashMap::new(),
            namespace_stack: vec![root_namespace],
            running_generator: None,
            pending_exception: None,
            thrown: None,
            compiler_roots: Vec::new(),
            init_string,
            core,
            hooks,
            config,
            current_module: None,
            out,
        };
        let empty_name = empty;
        vm.namespaces.insert(empty_name, Value::Obj(root_namespace));
        natives::register_core(&mut vm);
        vm.heap.set_allocation_generation(Generation::Eden);
        vm
    }

    /// Compiles and runs a script.
    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        let function = compiler::compile(self, source).map_err(InterpretError::Compile)?;

        let path = self.intern_string("<script>");
        self.protect(Value::Obj(path));
        let closure = self.allocate(
            ObjData::Closure(Closure { function, upvalues: Vec::new(), namespace: None }),
            Some(self.core.function),
        );
        self.protect(Value::Obj(closure));
        let module = self.allocate(
            ObjData::Module(Module {
                path,
                closure: Some(closure),
                val_fields: AHashMap::new(),
                var_fields: AHashMap::new(),
            }),
            Some(self.core.module),
        );
        self.modules.insert(path, Value::Obj(module));
        self.current_module = Some(module);
        self.unprotect();
        self.unprotect();

        self.push(Value::Obj(closure));
        if let Err(error) = self.call_closure(closure, 0) {
            return Err(InterpretError::Runtime(self.report_uncaught(error)));
        }
        match self.run(0) {
            Ok(_) => Ok(()),
            Err(error) => Err(InterpretError::Runtime(self.report_uncaught(error))),
        }
    }

    /// Point-in-time heap statistics, for hosts and tests.
    #[must_use]
    pub fn heap_stats(&self) -> HeapStats {
        self.heap.stats()
    }

    // === Stack discipline ===

    #[inline]
    pub(crate) fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    #[inline]
    pub(crate) fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack underflow")
    }

    #[inline]
    pub(crate) fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    /// Roots a value on the stack while allocating linked structures, per
    /// the young-object protection rule.
    #[inline]
    pub(crate) fn protect(&mut self, value: Value) {
        self.stack.push(value);
    }

    #[inline]
    pub(crate) fn unprotect(&mut self) {
        self.stack.pop();
    }

    /// Argument `i` of a native call with `argc` arguments on the stack.
    #[inline]
    pub(crate) fn native_arg(&self, argc: usize, i: usize) -> Value {
        self.stack[self.stack.len() - argc + i]
    }

    // === Allocation with collection pressure ===

    pub(crate) fn allocate(&mut self, data: ObjData, class: Option<HeapId>) -> HeapId {
        self.maybe_collect();
        self.heap.allocate(data, class)
    }

    pub(crate) fn intern_string(&mut self, chars: &str) -> HeapId {
        self.maybe_collect();
        self.heap.copy_string(chars)
    }

    pub(crate) fn take_string(&mut self, chars: String) -> HeapId {
        self.maybe_collect();
        self.heap.take_string(chars)
    }

    fn maybe_collect(&mut self) {
        if self.heap.allocation_generation() == Generation::Permanent {
            return;
        }
        if self.config.stress_gc {
            self.collect_garbage(Generation::Eden);
        } else if let Some(generation) = self.heap.pressure() {
            self.collect_garbage(generation);
        }
    }

    // === Garbage collection driver ===

    /// Collects `generation` and every younger generation, youngest first.
    pub(crate) fn collect_garbage(&mut self, generation: Generation) {
        for g in Generation::ALL {
            if g > generation {
                break;
            }
            self.gc_cycle(g);
        }
    }

    fn gc_cycle(&mut self, generation: Generation) {
        let log = self.heap.log_gc();
        let before = self.heap.bytes_allocated(generation);
        if log {
            tracing::debug!(?generation, bytes = before, "gc begin");
        }

        self.mark_roots(generation);
        self.heap.mark_remembered_set(generation);
        self.heap.trace_references(generation);
        self.heap.remove_white_strings(generation);
        let (freed, promoted) = self.heap.sweep(generation);
        self.heap.process_remembered_set(generation);
        self.heap.adjust_threshold(generation);

        if log {
            tracing::debug!(
                ?generation,
                freed,
                promoted,
                remaining = self.heap.bytes_allocated(generation),
                "gc end"
            );
        }
    }

    fn mark_roots(&mut self, generation: Generation) {
        for i in 0..self.stack.len() {
            let value = self.stack[i];
            self.heap.mark_value(value, generation);
        }

        for i in 0..self.frames.len() {
            let closure = self.frames[i].closure;
            self.heap.mark_object(closure, generation);
            for h in 0..self.frames[i].handlers.len() {
                if let Some(class) = self.frames[i].handlers[h].class {
                    self.heap.mark_object(class, generation);
                }
            }
        }

        for i in 0..self.open_upvalues.len() {
            let upvalue = self.open_upvalues[i];
            self.heap.mark_object(upvalue, generation);
        }

        let mut running = self.running_generator;
        while let Some(gen_id) = running {
            self.heap.mark_object(gen_id, generation);
            running = self.heap.generator(gen_id).outer;
        }

        for (&name, &value) in &self.globals {
            self.heap.mark_object(name, generation);
            self.heap.mark_value(value, generation);
        }
        for (&name, &value) in self.classes.iter().chain(&self.namespaces).chain(&self.modules) {
            self.heap.mark_object(name, generation);
            self.heap.mark_value(value, generation);
        }
        for i in 0..self.namespace_stack.len() {
            let namespace = self.namespace_stack[i];
            self.heap.mark_object(namespace, generation);
        }

        for i in 0..self.compiler_roots.len() {
            let function = self.compiler_roots[i];
            self.heap.mark_object(function, generation);
        }

        if let Some(value) = self.thrown {
            self.heap.mark_value(value, generation);
        }
        if let Some(value) = self.pending_exception {
            self.heap.mark_value(value, generation);
        }
        if let Some(module) = self.current_module {
            self.heap.mark_object(module, generation);
        }
        self.heap.mark_object(self.init_string, generation);
        for name in self.hooks.all() {
            self.heap.mark_object(name, generation);
        }
    }

    // === Instruction fetch ===

    #[inline]
    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("no active call frame")
    }

    #[inline]
    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("no active call frame")
    }

    #[inline]
    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("no active call frame");
        let ip = frame.ip;
        frame.ip += 1;
        let function = frame.function;
        self.heap.function(function).chunk.code[ip]
    }

    #[inline]
    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte();
        let lo = self.read_byte();
        u16::from_be_bytes([hi, lo])
    }

    #[inline]
    fn read_constant(&mut self) -> Value {
        let index = self.read_byte();
        let function = self.frame().function;
        self.heap.function(function).chunk.constant(index)
    }

    /// Reads a constant that is known to be an interned string.
    #[inline]
    fn read_string(&mut self) -> HeapId {
        match self.read_constant() {
            Value::Obj(id) => id,
            other => panic!("expected string constant, found {other:?}"),
        }
    }

    // === The dispatch loop ===

    /// Runs until the frame stack drops back to `frame_mark`; returns the
    /// value the finishing frame produced.
    pub(crate) fn run(&mut self, frame_mark: usize) -> RunResult<Value> {
        macro_rules! throwing {
            ($self:ident, $expr:expr) => {
                if let Err(error) = $expr {
                    $self.unwind(error, frame_mark)?;
                    continue;
                }
            };
        }

        loop {
            let byte = self.read_byte();
            let op = Opcode::from_repr(byte).expect("invalid opcode in bytecode");
            match op {
                Opcode::Constant => {
                    let value = self.read_constant();
                    self.push(value);
                }
                Opcode::Nil => self.push(Value::Nil),
                Opcode::True => self.push(Value::Bool(true)),
                Opcode::False => self.push(Value::Bool(false)),
                Opcode::Pop => {
                    self.pop();
                }
                Opcode::Dup => self.push(self.peek(0)),

                Opcode::GetLocal => {
                    let slot = usize::from(self.read_byte());
                    let base = self.frame().slots;
                    self.push(self.stack[base + slot]);
                }
                Opcode::SetLocal => {
                    let slot = usize::from(self.read_byte());
                    let base = self.frame().slots;
                    self.stack[base + slot] = self.peek(0);
                }
                Opcode::GetGlobal => {
                    let name = self.read_string();
                    throwing!(self, self.get_global(name));
                }
                Opcode::SetGlobal => {
                    let name = self.read_string();
                    throwing!(self, self.set_global(name));
                }
                Opcode::DefineGlobal => {
                    let name = self.read_string();
                    self.define_global(name, true);
                }
                Opcode::DefineGlobalVal => {
                    let name = self.read_string();
                    self.define_global(name, false);
                }
                Opcode::GetUpvalue => {
                    let index = usize::from(self.read_byte());
                    let closure = self.frame().closure;
                    let upvalue = self.heap.closure(closure).upvalues[index];
                    let value = match *self.heap.upvalue(upvalue) {
                        Upvalue::Open(slot) => self.stack[slot],
                        Upvalue::Closed(value) => value,
                    };
                    self.push(value);
                }
                Opcode::SetUpvalue => {
                    let index = usize::from(self.read_byte());
                    let closure = self.frame().closure;
                    let upvalue = self.heap.closure(closure).upvalues[index];
                    let value = self.peek(0);
                    self.heap.write_barrier(upvalue, value);
                    match self.heap.upvalue_mut(upvalue) {
                        Upvalue::Open(slot) => {
                            let slot = *slot;
                            self.stack[slot] = value;
                        }
                        Upvalue::Closed(closed) => *closed = value,
                    }
                }
                Opcode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }

                Opcode::GetProperty => {
                    let name = self.read_string();
                    let site = self.frame().ip - 2;
                    throwing!(self, self.op_get_property(name, site));
                }
                Opcode::SetProperty => {
                    let name = self.read_string();
                    throwing!(self, self.op_set_property(name));
                }
                Opcode::GetSuper => {
                    let name = self.read_string();
                    throwing!(self, self.op_get_super(name));
                }
                Opcode::GetIndex => throwing!(self, self.op_get_index()),
                Opcode::SetIndex => throwing!(self, self.op_set_index()),

                Opcode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a.equals(b)));
                }
                Opcode::Greater => throwing!(self, self.comparison(|a, b| a > b)),
                Opcode::Less => throwing!(self, self.comparison(|a, b| a < b)),
                Opcode::Add => throwing!(self, self.op_add()),
                Opcode::Subtract => {
                    throwing!(self, self.arithmetic(i32::checked_sub, |a, b| a - b));
                }
                Opcode::Multiply => {
                    throwing!(self, self.arithmetic(i32::checked_mul, |a, b| a * b));
                }
                Opcode::Divide => throwing!(self, self.op_divide()),
                Opcode::Modulo => throwing!(self, self.op_modulo()),
                Opcode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()));
                }
                Opcode::Negate => throwing!(self, self.op_negate()),

                Opcode::Print => {
                    let value = self.pop();
                    let text = value.display(&self.heap);
                    self.out.print(&text);
                    self.out.print("\n");
                }

                Opcode::Jump => {
                    let offset = usize::from(self.read_u16());
                    self.frame_mut().ip += offset;
                }
                Opcode::JumpIfFalse => {
                    let offset = usize::from(self.read_u16());
                    if self.peek(0).is_falsey() {
                        self.frame_mut().ip += offset;
                    }
                }
                Opcode::Loop => {
                    let offset = usize::from(self.read_u16());
                    self.frame_mut().ip -= offset;
                }

                Opcode::Call => {
                    let argc = usize::from(self.read_byte());
                    let callee = self.peek(argc);
                    throwing!(self, self.call_value(callee, argc));
                }
                Opcode::Invoke => {
                    let name = self.read_string();
                    let argc = usize::from(self.read_byte());
                    throwing!(self, self.invoke(name, argc));
                }
                Opcode::SuperInvoke => {
                    let name = self.read_string();
                    let argc = usize::from(self.read_byte());
                    let superclass = self.pop();
                    throwing!(self, self.invoke_from_class_value(superclass, name, argc));
                }
                Opcode::Closure => throwing!(self, self.op_closure()),
                Opcode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("return without a frame");
                    self.close_upvalues(frame.slots);
                    if frame.pushed_namespace {
                        self.namespace_stack.pop();
                    }
                    self.stack.truncate(frame.slots);
                    if self.frames.len() == frame_mark {
                        return Ok(result);
                    }
                    self.push(result);
                }

                Opcode::Array => {
                    let count = usize::from(self.read_byte());
                    self.op_array(count);
                }
                Opcode::Dictionary => {
                    let count = usize::from(self.read_byte());
                    throwing!(self, self.op_dictionary(count));
                }

                Opcode::Class => {
                    let name = self.read_string();
                    self.op_class(name);
                }
                Opcode::Trait => {
                    let name = self.read_string();
                    self.op_trait(name);
                }
                Opcode::Inherit => throwing!(self, self.op_inherit()),
                Opcode::ImplementTraits => {
                    let count = usize::from(self.read_byte());
                    throwing!(self, self.op_implement_traits(count));
                }
                Opcode::Method => {
                    let name = self.read_string();
                    self.op_method(name, false);
                }
                Opcode::StaticMethod => {
                    let name = self.read_string();
                    self.op_method(name, true);
                }

                Opcode::Throw => {
                    let exception = self.pop();
                    self.thrown = Some(exception);
                    self.unwind(RunError { exception }, frame_mark)?;
                }
                Opcode::PushHandler => throwing!(self, self.op_push_handler()),
                Opcode::PopHandler => {
                    self.frame_mut().handlers.pop();
                }
                Opcode::EndFinally => {
                    if let Some(exception) = self.pending_exception.take() {
                        self.unwind(RunError { exception }, frame_mark)?;
                    }
                }

                Opcode::Yield => {
                    let value = self.pop();
                    let value = match self.suspend_running_generator(value) {
                        Ok(value) => value,
                        Err(error) => {
                            self.unwind(error, frame_mark)?;
                            continue;
                        }
                    };
                    return Ok(value);
                }
                Opcode::Await => match self.op_await() {
                    Ok(Some(value)) => self.push(value),
                    Ok(None) => return Ok(Value::Nil),
                    Err(error) => {
                        self.unwind(error, frame_mark)?;
                    }
                },

                Opcode::BeginNamespace => {
                    let name = self.read_string();
                    self.op_begin_namespace(name);
                }
                Opcode::EndNamespace => {
                    if self.namespace_stack.len() > 1 {
                        self.namespace_stack.pop();
                    }
                }
            }
        }
    }

    // === Globals and namespaces ===

    fn current_namespace(&self) -> HeapId {
        *self.namespace_stack.last().expect("namespace stack is never empty")
    }

    fn define_global(&mut self, name: HeapId, mutable: bool) {
        let value = self.peek(0);
        let namespace = self.current_namespace();
        if namespace == self.core.root_namespace {
            self.globals.insert(name, value);
            if mutable {
                self.immutable_globals.remove(&name);
            } else {
                self.immutable_globals.insert(name);
            }
            if let Some(module) = self.current_module {
                self.heap.write_barrier(module, value);
                let fields = if mutable {
                    &mut self.heap.module_mut(module).var_fields
                } else {
                    &mut self.heap.module_mut(module).val_fields
                };
                fields.insert(name, value);
            }
        } else {
            self.heap.write_barrier(namespace, value);
            self.heap.namespace_mut(namespace).values.insert(name, value);
        }
        self.pop();
    }

    fn get_global(&mut self, name: HeapId) -> RunResult<()> {
        if let Some(&value) = self.globals.get(&name) {
            self.push(value);
            return Ok(());
        }
        let mut namespace = Some(self.current_namespace());
        while let Some(ns) = namespace {
            if let Some(&value) = self.heap.namespace(ns).values.get(&name) {
                self.push(value);
                return Ok(());
            }
            namespace = self.heap.namespace(ns).parent;
        }
        let text = self.heap.string_value(name).to_owned();
        Err(self.runtime_error(format!("Undefined variable '{text}'.")))
    }

    /// Resolves a name the way `GetGlobal` does, without stack effects.
    pub(crate) fn resolve_global(&self, name: HeapId) -> Option<Value> {
        if let Some(&value) = self.globals.get(&name) {
            return Some(value);
        }
        let mut namespace = Some(self.current_namespace());
        while let Some(ns) = namespace {
            if let Some(&value) = self.heap.namespace(ns).values.get(&name) {
                return Some(value);
            }
            namespace = self.heap.namespace(ns).parent;
        }
        None
    }

    fn set_global(&mut self, name: HeapId) -> RunResult<()> {
        let value = self.peek(0);
        if self.globals.contains_key(&name) {
            if self.immutable_globals.contains(&name) {
                let text = self.heap.string_value(name).to_owned();
                return Err(self.runtime_error(format!("Cannot reassign val '{text}'.")));
            }
            self.globals.insert(name, value);
            if let Some(module) = self.current_module {
                self.heap.write_barrier(module, value);
                self.heap.module_mut(module).var_fields.insert(name, value);
            }
            return Ok(());
        }
        let mut namespace = Some(self.current_namespace());
        while let Some(ns) = namespace {
            if self.heap.namespace(ns).values.contains_key(&name) {
                self.heap.write_barrier(ns, value);
                self.heap.namespace_mut(ns).values.insert(name, value);
                return Ok(());
            }
            namespace = self.heap.namespace(ns).parent;
        }
        let text = self.heap.string_value(name).to_owned();
        Err(self.runtime_error(format!("Undefined variable '{text}'.")))
    }

    fn op_begin_namespace(&mut self, name: HeapId) {
        let parent = self.current_namespace();
        if let Some(&Value::Obj(existing)) = self.heap.namespace(parent).values.get(&name) {
            if matches!(self.heap.data(existing), ObjData::Namespace(_)) {
                self.namespace_stack.push(existing);
                return;
            }
        }
        let parent_full = self.heap.string_value(self.heap.namespace(parent).full_name).to_owned();
        let short = self.heap.string_value(name).to_owned();
        let full_name = if parent_full.is_empty() {
            self.intern_string(&short)
        } else {
            self.take_string(format!("{parent_full}.{short}"))
        };
        self.protect(Value::Obj(full_name));
        let namespace = self.allocate(
            ObjData::Namespace(Namespace {
                short_name: name,
                full_name,
                parent: Some(parent),
                values: AHashMap::new(),
            }),
            Some(self.core.namespace),
        );
        self.unprotect();
        self.heap.write_barrier(parent, Value::Obj(namespace));
        self.heap.namespace_mut(parent).values.insert(name, Value::Obj(namespace));
        self.namespaces.insert(full_name, Value::Obj(namespace));
        if parent == self.core.root_namespace {
            self.globals.insert(name, Value::Obj(namespace));
        }
        self.namespace_stack.push(namespace);
    }

    // === Upvalues ===

    /// Captures a stack slot as an upvalue, reusing an existing open one so
    /// all closures over a slot share state.
    pub(crate) fn capture_upvalue(&mut self, slot: usize) -> HeapId {
        let mut insert_at = self.open_upvalues.len();
        for (i, &upvalue) in self.open_upvalues.iter().enumerate() {
            match *self.heap.upvalue(upvalue) {
                Upvalue::Open(existing) if existing == slot => return upvalue,
                Upvalue::Open(existing) if existing < slot => {
                    insert_at = i;
                    break;
                }
                _ => {}
            }
        }
        let created = self.allocate(ObjData::Upvalue(Upvalue::Open(slot)), None);
        self.open_upvalues.insert(insert_at, created);
        created
    }

    /// Closes every open upvalue at or above `from_slot`, moving the stack
    /// value into the upvalue object.
    pub(crate) fn close_upvalues(&mut self, from_slot: usize) {
        while let Some(&upvalue) = self.open_upvalues.first() {
            let slot = match *self.heap.upvalue(upvalue) {
                Upvalue::Open(slot) if slot >= from_slot => slot,
                _ => break,
            };
            let value = self.stack[slot];
            self.heap.write_barrier(upvalue, value);
            *self.heap.upvalue_mut(upvalue) = Upvalue::Closed(value);
            self.open_upvalues.remove(0);
        }
    }

    fn op_closure(&mut self) -> RunResult<()> {
        let function = match self.read_constant() {
            Value::Obj(id) => id,
            other => panic!("closure constant is not a function: {other:?}"),
        };
        let namespace = {
            let current = self.current_namespace();
            (current != self.core.root_namespace).then_some(current)
        };
        let closure = self.allocate(
            ObjData::Closure(Closure { function, upvalues: Vec::new(), namespace }),
            Some(self.core.function),
        );
        self.push(Value::Obj(closure));

        let upvalue_count = usize::from(self.heap.function(function).upvalue_count);
        for _ in 0..upvalue_count {
            let is_local = self.read_byte() == 1;
            let index = usize::from(self.read_byte());
            let upvalue = if is_local {
                let base = self.frame().slots;
                self.capture_upvalue(base + index)
            } else {
                let enclosing = self.frame().closure;
                self.heap.closure(enclosing).upvalues[index]
            };
            self.heap.write_barrier(closure, Value::Obj(upvalue));
            match self.heap.data_mut(closure) {
                ObjData::Closure(c) => c.upvalues.push(upvalue),
                _ => unreachable!("closure allocated above"),
            }
        }
        Ok(())
    }

    // === Collections ===

    fn op_array(&mut self, count: usize) {
        let start = self.stack.len() - count;
        let array = self.allocate(ObjData::Array(Array::default()), Some(self.core.array));
        // The elements are still rooted on the stack while we move them in.
        for i in start..self.stack.len() {
            let value = self.stack[i];
            self.heap.write_barrier(array, value);
            self.heap.array_mut(array).elements.push(value);
        }
        self.stack.truncate(start);
        self.push(Value::Obj(array));
    }

    fn op_dictionary(&mut self, count: usize) -> RunResult<()> {
        let start = self.stack.len() - count * 2;
        let dict = self.allocate(ObjData::Dictionary(Dict::new()), Some(self.core.dictionary));
        for i in 0..count {
            let key = self.stack[start + i * 2];
            let value = self.stack[start + i * 2 + 1];
            let Some(hash) = key.hash(&self.heap) else {
                let text = key.display(&self.heap);
                return Err(self.runtime_error(format!("Unhashable dictionary key: {text}.")));
            };
            self.heap.write_barrier(dict, key);
            self.heap.write_barrier(dict, value);
            self.heap.dict_mut(dict).set(key, hash, value);
        }
        self.stack.truncate(start);
        self.push(Value::Obj(dict));
        Ok(())
    }

    fn op_get_index(&mut self) -> RunResult<()> {
        enum Indexable {
            Array(usize),
            Str(usize),
            Dict,
            Other,
        }

        let index = self.pop();
        let receiver = self.pop();
        let Some(id) = receiver.as_obj() else {
            return Err(self.runtime_error("Can only index strings, arrays and dictionaries."));
        };
        let kind = match self.heap.data(id) {
            ObjData::Array(array) => Indexable::Array(array.elements.len()),
            ObjData::String(s) => Indexable::Str(s.chars.len()),
            ObjData::Dictionary(_) => Indexable::Dict,
            _ => Indexable::Other,
        };
        let result = match kind {
            Indexable::Array(len) => {
                let i = self.check_index(index, len)?;
                self.heap.array(id).elements[i]
            }
            Indexable::Str(len) => {
                let i = self.check_index(index, len)?;
                let Some(ch) = self.heap.string_value(id).get(i..=i) else {
                    return Err(self.runtime_error("Index is not on a character boundary."));
                };
                let ch = ch.to_owned();
                Value::Obj(self.take_string(ch))
            }
            Indexable::Dict => {
                let Some(hash) = index.hash(&self.heap) else {
                    let text = index.display(&self.heap);
                    return Err(self.runtime_error(format!("Unhashable dictionary key: {text}.")));
                };
                self.heap.dict(id).get(index, hash).unwrap_or(Value::Nil)
            }
            Indexable::Other => {
                return Err(self.runtime_error("Can only index strings, arrays and dictionaries."));
            }
        };
        self.push(result);
        Ok(())
    }

    fn op_set_index(&mut self) -> RunResult<()> {
        let value = self.pop();
        let index = self.pop();
        let receiver = self.pop();
        let Some(id) = receiver.as_obj() else {
            return Err(self.runtime_error("Can only index arrays and dictionaries."));
        };
        let array_len = match self.heap.data(id) {
            ObjData::Array(array) => Some(array.elements.len()),
            ObjData::Dictionary(_) => None,
            _ => return Err(self.runtime_error("Can only index arrays and dictionaries.")),
        };
        match array_len {
            Some(len) => {
                let i = self.check_index(index, len)?;
                self.heap.write_barrier(id, value);
                self.heap.array_mut(id).elements[i] = value;
            }
            None => {
                let Some(hash) = index.hash(&self.heap) else {
                    let text = index.display(&self.heap);
                    return Err(self.runtime_error(format!("Unhashable dictionary key: {text}.")));
                };
                self.heap.write_barrier(id, index);
                self.heap.write_barrier(id, value);
                self.heap.dict_mut(id).set(index, hash, value);
            }
        }
        self.push(value);
        Ok(())
    }

    fn check_index(&mut self, index: Value, len: usize) -> RunResult<usize> {
        let Value::Int(i) = index else {
            return Err(self.runtime_error("Index must be an integer."));
        };
        if i < 0 || (i as usize) >= len {
            return Err(self.runtime_error(format!("Index {i} out of bounds for length {len}.")));
        }
        Ok(i as usize)
    }

    // === Arithmetic ===

    /// `Add` is overloaded: numbers add (Int overflow promotes to Float);
    /// if either operand is a string the other is stringified and the two
    /// concatenate.
    fn op_add(&mut self) -> RunResult<()> {
        let b = self.peek(0);
        let a = self.peek(1);
        let a_str = self.value_as_string(a);
        let b_str = self.value_as_string(b);
        match (a, b, a_str.or(b_str)) {
            (Value::Int(x), Value::Int(y), _) => {
                self.pop();
                self.pop();
                match x.checked_add(y) {
                    Some(sum) => self.push(Value::Int(sum)),
                    None => self.push(Value::Float(f64::from(x) + f64::from(y))),
                }
            }
            (_, _, None) => {
                let (Some(x), Some(y)) = (a.as_number(), b.as_number()) else {
                    return Err(
                        self.runtime_error("Operands must be two numbers or two strings.")
                    );
                };
                self.pop();
                self.pop();
                self.push(Value::Float(x + y));
            }
            (_, _, Some(_)) => {
                let mut text = a.display(&self.heap);
                text.push_str(&b.display(&self.heap));
                let id = self.take_string(text);
                self.pop();
                self.pop();
                self.push(Value::Obj(id));
            }
        }
        Ok(())
    }

    fn value_as_string(&self, value: Value) -> Option<HeapId> {
        match value {
            Value::Obj(id) if matches!(self.heap.data(id), ObjData::String(_)) => Some(id),
            _ => None,
        }
    }

    fn arithmetic(
        &mut self,
        int_op: fn(i32, i32) -> Option<i32>,
        float_op: fn(f64, f64) -> f64,
    ) -> RunResult<()> {
        let b = self.peek(0);
        let a = self.peek(1);
        match (a, b) {
            (Value::Int(x), Value::Int(y)) => {
                self.pop();
                self.pop();
                match int_op(x, y) {
                    Some(result) => self.push(Value::Int(result)),
                    None => self.push(Value::Float(float_op(f64::from(x), f64::from(y)))),
                }
            }
            _ => {
                let (Some(x), Some(y)) = (a.as_number(), b.as_number()) else {
                    return Err(self.runtime_error("Operands must be numbers."));
                };
                self.pop();
                self.pop();
                self.push(Value::Float(float_op(x, y)));
            }
        }
        Ok(())
    }

    /// Integer division truncates; division by integer zero is an error.
    fn op_divide(&mut self) -> RunResult<()> {
        if let (Value::Int(_), Value::Int(0)) = (self.peek(1), self.peek(0)) {
            return Err(self.runtime_error("Division by zero."));
        }
        self.arithmetic(i32::checked_div, |a, b| a / b)
    }

    fn op_modulo(&mut self) -> RunResult<()> {
        if let (Value::Int(_), Value::Int(0)) = (self.peek(1), self.peek(0)) {
            return Err(self.runtime_error("Division by zero."));
        }
        self.arithmetic(i32::checked_rem, |a, b| a % b)
    }

    fn comparison(&mut self, op: fn(f64, f64) -> bool) -> RunResult<()> {
        let b = self.peek(0);
        let a = self.peek(1);
        let (Some(x), Some(y)) = (a.as_number(), b.as_number()) else {
            return Err(self.runtime_error("Operands must be numbers."));
        };
        self.pop();
        self.pop();
        self.push(Value::Bool(op(x, y)));
        Ok(())
    }

    fn op_negate(&mut self) -> RunResult<()> {
        match self.peek(0) {
            Value::Int(i) => {
                self.pop();
                self.push(Value::Int(i.wrapping_neg()));
            }
            Value::Float(f) => {
                self.pop();
                self.push(Value::Float(-f));
            }
            _ => return Err(self.runtime_error("Operand must be a number.")),
        }
        Ok(())
    }

    // === Exception handler installation ===

    fn op_push_handler(&mut self) -> RunResult<()> {
        let class_index = self.read_byte();
        let handler_ip = usize::from(self.read_u16());
        let finally = self.read_u16();
        let class = if class_index == HANDLER_NO_CATCH {
            None
        } else {
            let function = self.frame().function;
            let name = match self.heap.function(function).chunk.constant(class_index) {
                Value::Obj(id) => id,
                other => panic!("catch class constant is not a string: {other:?}"),
            };
            let Some(value) = self.resolve_global(name) else {
                let text = self.heap.string_value(name).to_owned();
                return Err(self.runtime_error(format!("Undefined variable '{text}'.")));
            };
            let Some(id) = value.as_obj() else {
                return Err(self.runtime_error("Catch clause expects a class."));
            };
            if !matches!(self.heap.data(id), ObjData::Class(_)) {
                return Err(self.runtime_error("Catch clause expects a class."));
            }
            Some(id)
        };
        let handler = ExceptionHandler {
            class,
            handler_ip,
            finally_ip: (finally != HANDLER_NO_FINALLY).then_some(usize::from(finally)),
            stack_depth: self.stack.len(),
        };
        self.frame_mut().handlers.push(handler);
        Ok(())
    }

    // === Classes ===

    /// Runtime class creation: the class and its metaclass.
    fn op_class(&mut self, name: HeapId) {
        let namespace = {
            let current = self.current_namespace();
            (current != self.core.root_namespace).then_some(current)
        };
        let full_name = match namespace {
            Some(ns) => {
                let prefix = self.heap.string_value(self.heap.namespace(ns).full_name).to_owned();
                let short = self.heap.string_value(name).to_owned();
                self.take_string(format!("{prefix}.{short}"))
            }
            None => name,
        };
        self.protect(Value::Obj(full_name));
        let meta_name = {
            let short = self.heap.string_value(name).to_owned();
            self.take_string(format!("{short} class"))
        };
        self.protect(Value::Obj(meta_name));
        let metaclass = self.allocate(
            ObjData::Class(Class::new(meta_name, meta_name, BehaviorType::Metaclass)),
            Some(self.core.class),
        );
        self.protect(Value::Obj(metaclass));
        let mut class_data = Class::new(name, full_name, BehaviorType::Class);
        class_data.namespace = namespace;
        let class = self.allocate(ObjData::Class(class_data), Some(metaclass));
        self.unprotect();
        self.unprotect();
        self.unprotect();
        self.classes.insert(full_name, Value::Obj(class));
        self.push(Value::Obj(class));
    }

    fn op_trait(&mut self, name: HeapId) {
        let trait_obj = self.allocate(
            ObjData::Class(Class::new(name, name, BehaviorType::Trait)),
            Some(self.core.trait_class),
        );
        self.classes.insert(name, Value::Obj(trait_obj));
        self.push(Value::Obj(trait_obj));
    }

    /// `Inherit`: copy superclass methods and traits into the subclass (and
    /// metaclass methods into the sub-metaclass), then pop the subclass so
    /// the superclass stays as the `super` local.
    fn op_inherit(&mut self) -> RunResult<()> {
        let subclass = self.peek(0);
        let superclass = self.peek(1);
        let (Some(sub), Some(sup)) = (subclass.as_obj(), superclass.as_obj()) else {
            return Err(self.runtime_error("Superclass must be a class."));
        };
        if !matches!(self.heap.data(sup), ObjData::Class(c) if c.behavior == BehaviorType::Class) {
            return Err(self.runtime_error("Superclass must be a class."));
        }

        self.heap.write_barrier(sub, superclass);
        let (methods, traits) = {
            let sup_class = self.heap.class(sup);
            (sup_class.methods.clone(), sup_class.traits.clone())
        };
        {
            let sub_class = self.heap.class_mut(sub);
            sub_class.superclass = Some(sup);
            sub_class.traits.extend(traits);
            for (name, method) in methods {
                sub_class.methods.entry(name).or_insert(method);
            }
        }
        self.rebuild_interceptors(sub);

        // Metaclass chain mirrors the class chain for static dispatch.
        if let (Some(sub_meta), Some(sup_meta)) =
            (self.heap.header(sub).class, self.heap.header(sup).class)
        {
            let meta_methods = self.heap.class(sup_meta).methods.clone();
            self.heap.write_barrier(sub_meta, Value::Obj(sup_meta));
            let meta = self.heap.class_mut(sub_meta);
            meta.superclass = Some(sup_meta);
            for (name, method) in meta_methods {
                meta.methods.entry(name).or_insert(method);
            }
        }

        self.pop();
        Ok(())
    }

    /// `ImplementTraits`: stack is `[class, t1 .. tn]`; traits flatten in
    /// declaration order, so a later trait's method wins a conflict.
    fn op_implement_traits(&mut self, count: usize) -> RunResult<()> {
        let class_value = self.peek(count);
        let Some(class) = class_value.as_obj() else {
            return Err(self.runtime_error("Can only implement traits on a class."));
        };
        for i in 0..count {
            let trait_value = self.peek(count - 1 - i);
            let Some(trait_id) = trait_value.as_obj() else {
                return Err(self.runtime_error("Can only implement traits."));
            };
            let is_trait = matches!(
                self.heap.data(trait_id),
                ObjData::Class(c) if c.behavior == BehaviorType::Trait
            );
            if !is_trait {
                let text = trait_value.display(&self.heap);
                return Err(self.runtime_error(format!("{text} is not a trait.")));
            }
            self.heap.write_barrier(class, trait_value);
            let (methods, nested) = {
                let t = self.heap.class(trait_id);
                (t.methods.clone(), t.traits.clone())
            };
            let class_data = self.heap.class_mut(class);
            for (name, method) in methods {
                class_data.methods.insert(name, method);
            }
            class_data.traits.push(trait_id);
            class_data.traits.extend(nested);
        }
        self.rebuild_interceptors(class);
        for _ in 0..=count {
            self.pop();
        }
        Ok(())
    }

    /// `Method` / `StaticMethod`: install the closure at stack top on the
    /// class below it (or its metaclass).
    fn op_method(&mut self, name: HeapId, is_static: bool) {
        let method = self.peek(0);
        let class_value = self.peek(1);
        let class = class_value.as_obj().expect("method target is a class");
        let target = if is_static {
            self.heap.header(class).class.expect("class has a metaclass")
        } else {
            class
        };
        self.heap.write_barrier(target, method);
        self.heap.write_barrier(target, Value::Obj(name));
        self.heap.class_mut(target).methods.insert(name, method);
        if !is_static {
            self.note_interceptor(class, name);
        }
        self.pop();
    }

    /// Sets the interceptor bit for a freshly installed method, when its
    /// name is one of the hook names.
    fn note_interceptor(&mut self, class: HeapId, name: HeapId) {
        let Some(flag) = natives::interceptor_flag(self.heap.string_value(name)) else {
            return;
        };
        self.heap.class_mut(class).interceptors.insert(flag);
    }

    /// Recomputes the interceptor bitset from the full method table, after
    /// bulk method copies (inheritance, traits).
    fn rebuild_interceptors(&mut self, class: HeapId) {
        let names: Vec<HeapId> = self.heap.class(class).methods.keys().copied().collect();
        for name in names {
            self.note_interceptor(class, name);
        }
    }

    // === Classification ===

    /// The class used for method dispatch on a value.
    pub(crate) fn class_of(&self, value: Value) -> HeapId {
        match value {
            Value::Nil | Value::Undefined => self.core.nil,
            Value::Bool(_) => self.core.bool_,
            Value::Int(_) => self.core.int,
            Value::Float(_) => self.core.float,
            Value::Obj(id) => {
                if let Some(class) = self.heap.header(id).class {
                    return class;
                }
                match self.heap.data(id) {
                    ObjData::String(_) => self.core.string,
                    ObjData::Function(_) | ObjData::Closure(_) | ObjData::NativeFunction(_) => {
                        self.core.function
                    }
                    ObjData::BoundMethod(_) | ObjData::NativeMethod(_) => self.core.method,
                    ObjData::Array(_) => self.core.array,
                    ObjData::Dictionary(_) => self.core.dictionary,
                    ObjData::Range(_) => self.core.range,
                    ObjData::Namespace(_) => self.core.namespace,
                    ObjData::Module(_) => self.core.module,
                    ObjData::Generator(_) | ObjData::Frame(_) => self.core.generator,
                    ObjData::Promise(_) => self.core.promise,
                    ObjData::Exception(_) => self.core.exception,
                    ObjData::Class(_) | ObjData::Instance(_) | ObjData::Upvalue(_) => {
                        self.core.object
                    }
                }
            }
        }
    }
}

/// Allocates a bare class with no metaclass wiring; bootstrap only.
fn raw_class(heap: &mut Heap, name: &str, behavior: BehaviorType) -> HeapId {
    let name_id = heap.copy_string(name);
    let mut class = Class::new(name_id, name_id, behavior);
    class.is_native = true;
    heap.allocate(ObjData::Class(class), None)
}
