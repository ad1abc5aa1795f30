//! Calling conventions: closures, bound methods, classes, natives, and the
//! reentrant helpers native code uses to call back into Ember.

use smallvec::SmallVec;

use crate::{
    error::RunResult,
    heap::HeapId,
    natives::{NativeFn, NativeMethodFn},
    object::{Array, BehaviorType, GeneratorState, Generator, Instance, ObjData, SavedFrame},
    value::Value,
    vm::{CallFrame, FRAMES_MAX, Vm},
};

/// What a callee turned out to be, extracted up front to keep heap borrows
/// short.
enum Callee {
    Closure,
    Bound(Value, Value),
    NativeFunction(NativeFn),
    NativeMethod(NativeMethodFn),
    Class,
    NotCallable,
}

impl<'out> Vm<'out> {
    /// Calls the value sitting below `argc` arguments on the stack. On
    /// return either a new frame has been pushed or the call completed and
    /// its result replaced the callee and arguments.
    pub(crate) fn call_value(&mut self, callee: Value, argc: usize) -> RunResult<()> {
        let Some(id) = callee.as_obj() else {
            return Err(self.runtime_error("Can only call functions and classes."));
        };
        let kind = match self.heap.data(id) {
            ObjData::Closure(_) => Callee::Closure,
            ObjData::BoundMethod(b) => Callee::Bound(b.receiver, b.method),
            ObjData::NativeFunction(n) => Callee::NativeFunction(n.function),
            ObjData::NativeMethod(n) => Callee::NativeMethod(n.function),
            ObjData::Class(_) => Callee::Class,
            _ => Callee::NotCallable,
        };
        match kind {
            Callee::Closure => self.call_closure(id, argc),
            Callee::Bound(receiver, method) => {
                let slot = self.stack.len() - argc - 1;
                self.stack[slot] = receiver;
                self.call_value(method, argc)
            }
            Callee::NativeFunction(function) => {
                let result = function(self, argc)?;
                self.finish_native_call(argc, result);
                Ok(())
            }
            Callee::NativeMethod(function) => {
                let receiver = self.peek(argc);
                let result = function(self, receiver, argc)?;
                self.finish_native_call(argc, result);
                Ok(())
            }
            Callee::Class => self.instantiate(id, argc),
            Callee::NotCallable => {
                Err(self.runtime_error("Can only call functions and classes."))
            }
        }
    }

    /// Replaces the `argc + 1` call slots with a native's result.
    fn finish_native_call(&mut self, argc: usize, result: Value) {
        let base = self.stack.len() - argc - 1;
        self.stack.truncate(base);
        self.push(result);
    }

    /// Pushes a frame for a closure, or builds a Generator/Promise for
    /// generator and async functions.
    pub(crate) fn call_closure(&mut self, closure: HeapId, argc: usize) -> RunResult<()> {
        let function = self.heap.closure(closure).function;
        let (arity, is_generator, is_async) = {
            let f = self.heap.function(function);
            (usize::from(f.arity), f.is_generator, f.is_async)
        };
        if argc != arity {
            return Err(self.runtime_error(format!(
                "Expected {arity} arguments but got {argc}."
            )));
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        if is_generator {
            let generator = self.make_generator(closure, argc)?;
            self.push(Value::Obj(generator));
            return Ok(());
        }
        if is_async {
            return self.call_async(closure, argc);
        }
        self.push_closure_frame(closure, function, 0, argc, SmallVec::new());
        Ok(())
    }

    /// Installs a call frame whose slot window starts at the callee slot.
    pub(crate) fn push_closure_frame(
        &mut self,
        closure: HeapId,
        function: HeapId,
        ip: usize,
        argc: usize,
        handlers: SmallVec<[super::ExceptionHandler; 2]>,
    ) {
        let namespace = self.heap.closure(closure).namespace;
        let pushed_namespace = match namespace {
            Some(ns) => {
                self.namespace_stack.push(ns);
                true
            }
            None => false,
        };
        self.frames.push(CallFrame {
            closure,
            function,
            ip,
            slots: self.stack.len() - argc - 1,
            handlers,
            pushed_namespace,
        });
    }

    /// Snapshots the call window `[callee, args...]` into a fresh Generator
    /// without running the body.
    pub(crate) fn make_generator(&mut self, closure: HeapId, argc: usize) -> RunResult<HeapId> {
        let base = self.stack.len() - argc - 1;
        let slots = self.stack[base..].to_vec();
        let frame = self.allocate(
            ObjData::Frame(SavedFrame { closure, ip: 0, slots, handlers: SmallVec::new() }),
            None,
        );
        self.protect(Value::Obj(frame));
        let generator = self.allocate(
            ObjData::Generator(Generator {
                frame,
                outer: None,
                inner: None,
                value: Value::Nil,
                state: GeneratorState::Start,
            }),
            Some(self.core.generator),
        );
        self.unprotect();
        self.stack.truncate(base);
        Ok(generator)
    }

    /// Class call: allocate an instance, then run `init` when present.
    fn instantiate(&mut self, class: HeapId, argc: usize) -> RunResult<()> {
        let (behavior, is_native) = {
            let c = self.heap.class(class);
            (c.behavior, c.is_native)
        };
        if behavior == BehaviorType::Trait {
            return Err(self.runtime_error("Cannot instantiate a trait."));
        }
        if is_native {
            // Native classes construct through a native `init` that returns
            // the finished object; the class itself is the receiver.
            let init = self.heap.class(class).methods.get(&self.init_string).copied();
            let Some(init) = init else {
                let name = self.heap.string_value(self.heap.class(class).name).to_owned();
                return Err(self.runtime_error(format!(
                    "Cannot instantiate native class '{name}'."
                )));
            };
            let function = match self.heap.data(init.as_obj().expect("native init is an object")) {
                ObjData::NativeMethod(n) => n.function,
                _ => panic!("native class init must be a native method"),
            };
            let result = function(self, Value::Obj(class), argc)?;
            self.finish_native_call(argc, result);
            return Ok(());
        }

        let fields = self.heap.class(class).default_fields.clone();
        let instance = self.allocate(ObjData::Instance(Instance { fields }), Some(class));
        let slot = self.stack.len() - argc - 1;
        self.stack[slot] = Value::Obj(instance);

        let init = self.heap.class(class).methods.get(&self.init_string).copied();
        match init {
            Some(init) => self.call_value(init, argc),
            None if argc != 0 => {
                Err(self.runtime_error(format!("Expected 0 arguments but got {argc}.")))
            }
            None => Ok(()),
        }
    }

    // === Invoke: combined lookup + call ===

    /// `Invoke name argc`: dispatch without materializing a BoundMethod.
    pub(crate) fn invoke(&mut self, name: HeapId, argc: usize) -> RunResult<()> {
        enum Receiver {
            Instance,
            NamespaceMember(Option<Value>),
            Class,
            Other,
        }

        let receiver = self.peek(argc);
        if let Some(id) = receiver.as_obj() {
            let kind = match self.heap.data(id) {
                ObjData::Instance(_) => Receiver::Instance,
                ObjData::Namespace(ns) => Receiver::NamespaceMember(ns.values.get(&name).copied()),
                ObjData::Class(_) => Receiver::Class,
                _ => Receiver::Other,
            };
            match kind {
                Receiver::Instance => {
                    // An instance field shadows a class method.
                    if let Some(field) = self.instance_field(id, name) {
                        let slot = self.stack.len() - argc - 1;
                        self.stack[slot] = field;
                        return self.call_value(field, argc);
                    }
                    let class = self.heap.header(id).class.expect("instance has a class");
                    return self.invoke_from_class(class, name, argc);
                }
                Receiver::NamespaceMember(member) => {
                    let Some(member) = member else {
                        let text = self.heap.string_value(name).to_owned();
                        return Err(
                            self.runtime_error(format!("Undefined property '{text}'."))
                        );
                    };
                    let slot = self.stack.len() - argc - 1;
                    self.stack[slot] = member;
                    return self.call_value(member, argc);
                }
                Receiver::Class => {
                    // Static dispatch through the metaclass.
                    if let Some(metaclass) = self.heap.header(id).class {
                        if let Some(method) = self.find_method(metaclass, name) {
                            return self.call_value(method, argc);
                        }
                    }
                    let text = self.heap.string_value(name).to_owned();
                    let class_name =
                        self.heap.string_value(self.heap.class(id).name).to_owned();
                    return Err(self.runtime_error(format!(
                        "Undefined static method '{text}' on class {class_name}."
                    )));
                }
                Receiver::Other => {}
            }
        }
        let class = self.class_of(receiver);
        self.invoke_from_class(class, name, argc)
    }

    pub(crate) fn invoke_from_class_value(
        &mut self,
        class: Value,
        name: HeapId,
        argc: usize,
    ) -> RunResult<()> {
        let id = class.as_obj().expect("superclass is a class object");
        self.invoke_from_class(id, name, argc)
    }

    pub(crate) fn invoke_from_class(
        &mut self,
        class: HeapId,
        name: HeapId,
        argc: usize,
    ) -> RunResult<()> {
        if let Some(method) = self.find_method(class, name) {
            return self.call_value(method, argc);
        }

        // Method and field both missed: the undefined-invoke hook gets the
        // name and the arguments bundled into an array.
        let receiver = self.peek(argc);
        let hook_name = self.hooks.undefined_invoke;
        let hook = self
            .heap
            .class(class)
            .interceptors
            .contains(crate::object::Interceptors::UNDEFINED_INVOKE)
            .then(|| self.find_method(class, hook_name))
            .flatten();
        if let Some(hook) = hook {
            let args_array =
                self.allocate(ObjData::Array(Array::default()), Some(self.core.array));
            for i in 0..argc {
                let value = self.native_arg(argc, i);
                self.heap.write_barrier(args_array, value);
                self.heap.array_mut(args_array).elements.push(value);
            }
            let base = self.stack.len() - argc - 1;
            self.stack.truncate(base);
            let result = self.call_method_reentrant(
                receiver,
                hook,
                &[Value::Obj(name), Value::Obj(args_array)],
            )?;
            self.push(result);
            return Ok(());
        }

        let text = self.heap.string_value(name).to_owned();
        Err(self.runtime_error(format!("Undefined property '{text}'.")))
    }

    // === Reentrant calls from native code ===

    /// Calls any callable with the given arguments and runs it to
    /// completion, returning its result.
    pub(crate) fn call_function(&mut self, callee: Value, args: &[Value]) -> RunResult<Value> {
        let frame_mark = self.frames.len();
        self.push(callee);
        for &arg in args {
            self.push(arg);
        }
        self.call_value(callee, args.len())?;
        if self.frames.len() > frame_mark {
            self.run(frame_mark)
        } else {
            Ok(self.pop())
        }
    }

    /// Calls a method with an explicit receiver in slot zero.
    pub(crate) fn call_method_reentrant(
        &mut self,
        receiver: Value,
        method: Value,
        args: &[Value],
    ) -> RunResult<Value> {
        let frame_mark = self.frames.len();
        self.push(receiver);
        for &arg in args {
            self.push(arg);
        }
        self.call_value(method, args.len())?;
        if self.frames.len() > frame_mark {
            self.run(frame_mark)
        } else {
            Ok(self.pop())
        }
    }
}
