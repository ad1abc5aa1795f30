//! Native bindings: the `lang` core registered into every VM.
//!
//! Natives read their arguments through the VM stack and report failures
//! through the runtime-error path, so a misbehaving script sees an ordinary
//! catchable exception. A native that needs to run Ember code (promise
//! executors, generator resumption) re-enters the dispatch loop through the
//! reentrant call helpers.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::{
    error::RunResult,
    heap::{Heap, HeapId},
    object::{
        Array, GeneratorState, Interceptors, NativeFunction, NativeMethod, ObjData, Promise,
        Range,
    },
    value::Value,
    vm::{Resume, Vm},
};

/// Host function: `(vm, argc) -> value`. Arguments are the top `argc` stack
/// values; the VM replaces them (and the callee) with the result.
pub(crate) type NativeFn = fn(&mut Vm<'_>, usize) -> RunResult<Value>;

/// Host method: `(vm, receiver, argc) -> value`.
pub(crate) type NativeMethodFn = fn(&mut Vm<'_>, Value, usize) -> RunResult<Value>;

/// Interned names for interceptor hooks and internal capture keys.
#[derive(Debug, Clone, Copy)]
pub(crate) struct HookNames {
    pub before_get: HeapId,
    pub after_get: HeapId,
    pub before_set: HeapId,
    pub after_set: HeapId,
    pub undefined_get: HeapId,
    pub undefined_invoke: HeapId,
    /// Capture key linking an async call's promise to its coroutine.
    pub coroutine: HeapId,
}

impl HookNames {
    pub fn intern(heap: &mut Heap) -> Self {
        Self {
            before_get: heap.copy_string("__beforeGet__"),
            after_get: heap.copy_string("__afterGet__"),
            before_set: heap.copy_string("__beforeSet__"),
            after_set: heap.copy_string("__afterSet__"),
            undefined_get: heap.copy_string("__undefinedGet__"),
            undefined_invoke: heap.copy_string("__undefinedInvoke__"),
            coroutine: heap.copy_string("coroutine"),
        }
    }

    pub fn all(&self) -> [HeapId; 7] {
        [
            self.before_get,
            self.after_get,
            self.before_set,
            self.after_set,
            self.undefined_get,
            self.undefined_invoke,
            self.coroutine,
        ]
    }
}

/// Maps a method name to the interceptor bit it activates, if any.
pub(crate) fn interceptor_flag(name: &str) -> Option<Interceptors> {
    match name {
        "__beforeGet__" => Some(Interceptors::BEFORE_GET),
        "__afterGet__" => Some(Interceptors::AFTER_GET),
        "__beforeSet__" => Some(Interceptors::BEFORE_SET),
        "__afterSet__" => Some(Interceptors::AFTER_SET),
        "__undefinedGet__" => Some(Interceptors::UNDEFINED_GET),
        "__undefinedInvoke__" => Some(Interceptors::UNDEFINED_INVOKE),
        _ => None,
    }
}

// === Registration ===

pub(crate) fn define_native_function(vm: &mut Vm<'_>, name: &str, function: NativeFn) {
    let name_id = vm.intern_string(name);
    vm.protect(Value::Obj(name_id));
    let native = vm.allocate(
        ObjData::NativeFunction(NativeFunction { name: name_id, function }),
        Some(vm.core.function),
    );
    vm.unprotect();
    vm.globals.insert(name_id, Value::Obj(native));
}

pub(crate) fn define_native_method(
    vm: &mut Vm<'_>,
    class: HeapId,
    name: &str,
    function: NativeMethodFn,
) {
    let name_id = vm.intern_string(name);
    vm.protect(Value::Obj(name_id));
    let native = vm.allocate(
        ObjData::NativeMethod(NativeMethod { name: name_id, class, function }),
        Some(vm.core.method),
    );
    vm.unprotect();
    vm.heap.write_barrier(class, Value::Obj(native));
    vm.heap.class_mut(class).methods.insert(name_id, Value::Obj(native));
}

/// Installs a static method on a class's metaclass.
pub(crate) fn define_native_static(
    vm: &mut Vm<'_>,
    class: HeapId,
    name: &str,
    function: NativeMethodFn,
) {
    let metaclass = vm.heap.header(class).class.expect("class has a metaclass");
    define_native_method(vm, metaclass, name, function);
}

/// Registers the whole `lang` package. Runs once per VM, during bootstrap.
pub(crate) fn register_core(vm: &mut Vm<'_>) {
    define_native_function(vm, "clock", clock);
    define_native_function(vm, "error", error);
    define_native_function(vm, "toString", to_string_fn);

    let core = vm.core;
    define_native_method(vm, core.object, "equals", object_equals);
    define_native_method(vm, core.object, "getClass", object_get_class);
    define_native_method(vm, core.object, "getClassName", object_get_class_name);
    define_native_method(vm, core.object, "hasField", object_has_field);
    define_native_method(vm, core.object, "toString", object_to_string);

    define_native_method(vm, core.class, "name", class_name);
    define_native_method(vm, core.class, "superclass", class_superclass);

    define_native_method(vm, core.string, "length", string_length);
    define_native_method(vm, core.string, "indexOf", string_index_of);
    define_native_method(vm, core.string, "substring", string_substring);
    define_native_method(vm, core.string, "contains", string_contains);

    define_native_method(vm, core.array, "length", array_length);
    define_native_method(vm, core.array, "push", array_push);
    define_native_method(vm, core.array, "pop", array_pop);
    define_native_method(vm, core.array, "indexOf", array_index_of);

    define_native_method(vm, core.dictionary, "length", dict_length);
    define_native_method(vm, core.dictionary, "containsKey", dict_contains_key);
    define_native_method(vm, core.dictionary, "remove", dict_remove);
    define_native_method(vm, core.dictionary, "keys", dict_keys);

    define_native_method(vm, core.range, "init", range_init);
    define_native_method(vm, core.range, "start", range_start);
    define_native_method(vm, core.range, "end", range_end);
    define_native_method(vm, core.range, "length", range_length);
    define_native_method(vm, core.range, "contains", range_contains);

    // Exception instantiates as an ordinary class; its behavior is native.
    vm.heap.class_mut(core.exception).is_native = false;
    define_native_method(vm, core.exception, "init", exception_init);
    define_native_method(vm, core.exception, "getMessage", exception_get_message);
    define_native_method(vm, core.exception, "getStackTrace", exception_get_stack_trace);

    define_native_method(vm, core.generator, "resume", generator_resume);
    define_native_method(vm, core.generator, "isFinished", generator_is_finished);

    define_native_method(vm, core.promise, "init", promise_init);
    define_native_method(vm, core.promise, "then", promise_then);
    define_native_method(vm, core.promise, "catch", promise_catch);
    define_native_static(vm, core.promise, "resolve", promise_resolve_static);
    define_native_static(vm, core.promise, "reject", promise_reject_static);
}

fn check_arity(vm: &mut Vm<'_>, what: &str, expected: usize, argc: usize) -> RunResult<()> {
    if argc == expected {
        Ok(())
    } else {
        Err(vm.runtime_error(format!(
            "{what} expects {expected} argument{} but got {argc}.",
            if expected == 1 { "" } else { "s" }
        )))
    }
}

// === Global functions ===

fn clock(vm: &mut Vm<'_>, argc: usize) -> RunResult<Value> {
    check_arity(vm, "native function clock()", 0, argc)?;
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64());
    Ok(Value::Float(seconds))
}

fn error(vm: &mut Vm<'_>, argc: usize) -> RunResult<Value> {
    check_arity(vm, "native function error()", 1, argc)?;
    let message = vm.native_arg(argc, 0);
    let text = message.display(&vm.heap);
    Err(vm.runtime_error(text))
}

fn to_string_fn(vm: &mut Vm<'_>, argc: usize) -> RunResult<Value> {
    check_arity(vm, "native function toString()", 1, argc)?;
    let value = vm.native_arg(argc, 0);
    let text = value.display(&vm.heap);
    Ok(Value::Obj(vm.take_string(text)))
}

// === Object ===

fn object_equals(vm: &mut Vm<'_>, receiver: Value, argc: usize) -> RunResult<Value> {
    check_arity(vm, "method Object::equals()", 1, argc)?;
    let other = vm.native_arg(argc, 0);
    Ok(Value::Bool(receiver.equals(other)))
}

fn object_get_class(vm: &mut Vm<'_>, receiver: Value, argc: usize) -> RunResult<Value> {
    check_arity(vm, "method Object::getClass()", 0, argc)?;
    Ok(Value::Obj(vm.class_of(receiver)))
}

fn object_get_class_name(vm: &mut Vm<'_>, receiver: Value, argc: usize) -> RunResult<Value> {
    check_arity(vm, "method Object::getClassName()", 0, argc)?;
    let class = vm.class_of(receiver);
    Ok(Value::Obj(vm.heap.class(class).name))
}

fn object_has_field(vm: &mut Vm<'_>, receiver: Value, argc: usize) -> RunResult<Value> {
    check_arity(vm, "method Object::hasField()", 1, argc)?;
    let name = vm.native_arg(argc, 0);
    let Some(name_id) = name.as_obj().filter(|&id| {
        matches!(vm.heap.data(id), ObjData::String(_))
    }) else {
        return Err(vm.runtime_error("method Object::hasField() expects argument 1 to be a string."));
    };
    let has = receiver
        .as_obj()
        .filter(|&id| matches!(vm.heap.data(id), ObjData::Instance(_)))
        .is_some_and(|id| vm.instance_field(id, name_id).is_some());
    Ok(Value::Bool(has))
}

fn object_to_string(vm: &mut Vm<'_>, receiver: Value, argc: usize) -> RunResult<Value> {
    check_arity(vm, "method Object::toString()", 0, argc)?;
    let text = receiver.display(&vm.heap);
    Ok(Value::Obj(vm.take_string(text)))
}

// === Class ===

fn class_name(vm: &mut Vm<'_>, receiver: Value, argc: usize) -> RunResult<Value> {
    check_arity(vm, "method Class::name()", 0, argc)?;
    let Some(class) = as_class(vm, receiver) else {
        return Err(vm.runtime_error("method Class::name() expects a class receiver."));
    };
    Ok(Value::Obj(vm.heap.class(class).name))
}

fn class_superclass(vm: &mut Vm<'_>, receiver: Value, argc: usize) -> RunResult<Value> {
    check_arity(vm, "method Class::superclass()", 0, argc)?;
    let Some(class) = as_class(vm, receiver) else {
        return Err(vm.runtime_error("method Class::superclass() expects a class receiver."));
    };
    Ok(vm.heap.class(class).superclass.map_or(Value::Nil, Value::Obj))
}

// === String ===

fn as_string(vm: &Vm<'_>, value: Value) -> Option<HeapId> {
    value.as_obj().filter(|&id| matches!(vm.heap.data(id), ObjData::String(_)))
}

fn as_class(vm: &Vm<'_>, value: Value) -> Option<HeapId> {
    value.as_obj().filter(|&id| matches!(vm.heap.data(id), ObjData::Class(_)))
}

fn string_length(vm: &mut Vm<'_>, receiver: Value, argc: usize) -> RunResult<Value> {
    check_arity(vm, "method String::length()", 0, argc)?;
    let Some(id) = as_string(vm, receiver) else {
        return Err(vm.runtime_error("method String::length() expects a string receiver."));
    };
    Ok(Value::Int(vm.heap.string_value(id).len() as i32))
}

fn string_index_of(vm: &mut Vm<'_>, receiver: Value, argc: usize) -> RunResult<Value> {
    check_arity(vm, "method String::indexOf()", 1, argc)?;
    let needle = vm.native_arg(argc, 0);
    let (Some(haystack), Some(needle)) = (as_string(vm, receiver), as_string(vm, needle)) else {
        return Err(vm.runtime_error("method String::indexOf() expects a string argument."));
    };
    let haystack = vm.heap.string_value(haystack);
    let needle = vm.heap.string_value(needle);
    Ok(match haystack.find(needle) {
        Some(index) => Value::Int(index as i32),
        None => Value::Int(-1),
    })
}

fn string_substring(vm: &mut Vm<'_>, receiver: Value, argc: usize) -> RunResult<Value> {
    check_arity(vm, "method String::substring()", 2, argc)?;
    let Some(id) = as_string(vm, receiver) else {
        return Err(vm.runtime_error("method String::substring() expects a string receiver."));
    };
    let (Value::Int(start), Value::Int(end)) = (vm.native_arg(argc, 0), vm.native_arg(argc, 1))
    else {
        return Err(vm.runtime_error("method String::substring() expects integer bounds."));
    };
    let text = vm.heap.string_value(id);
    let len = text.len();
    if start < 0 || end < start || (end as usize) > len {
        return Err(vm.runtime_error(format!(
            "Substring bounds {start}..{end} out of range for length {len}."
        )));
    }
    let slice = text[start as usize..end as usize].to_owned();
    Ok(Value::Obj(vm.take_string(slice)))
}

fn string_contains(vm: &mut Vm<'_>, receiver: Value, argc: usize) -> RunResult<Value> {
    check_arity(vm, "method String::contains()", 1, argc)?;
    let needle = vm.native_arg(argc, 0);
    let (Some(haystack), Some(needle)) = (as_string(vm, receiver), as_string(vm, needle)) else {
        return Err(vm.runtime_error("method String::contains() expects a string argument."));
    };
    let result = vm.heap.string_value(haystack).contains(vm.heap.string_value(needle));
    Ok(Value::Bool(result))
}

// === Array ===

fn as_array(vm: &Vm<'_>, value: Value) -> Option<HeapId> {
    value.as_obj().filter(|&id| matches!(vm.heap.data(id), ObjData::Array(_)))
}

fn array_length(vm: &mut Vm<'_>, receiver: Value, argc: usize) -> RunResult<Value> {
    check_arity(vm, "method Array::length()", 0, argc)?;
    let Some(id) = as_array(vm, receiver) else {
        return Err(vm.runtime_error("method Array::length() expects an array receiver."));
    };
    Ok(Value::Int(vm.heap.array(id).elements.len() as i32))
}

fn array_push(vm: &mut Vm<'_>, receiver: Value, argc: usize) -> RunResult<Value> {
    check_arity(vm, "method Array::push()", 1, argc)?;
    let Some(id) = as_array(vm, receiver) else {
        return Err(vm.runtime_error("method Array::push() expects an array receiver."));
    };
    let value = vm.native_arg(argc, 0);
    vm.heap.write_barrier(id, value);
    vm.heap.array_mut(id).elements.push(value);
    Ok(Value::Nil)
}

fn array_pop(vm: &mut Vm<'_>, receiver: Value, argc: usize) -> RunResult<Value> {
    check_arity(vm, "method Array::pop()", 0, argc)?;
    let Some(id) = as_array(vm, receiver) else {
        return Err(vm.runtime_error("method Array::pop() expects an array receiver."));
    };
    match vm.heap.array_mut(id).elements.pop() {
        Some(value) => Ok(value),
        None => Err(vm.runtime_error("Cannot pop from an empty array.")),
    }
}

fn array_index_of(vm: &mut Vm<'_>, receiver: Value, argc: usize) -> RunResult<Value> {
    check_arity(vm, "method Array::indexOf()", 1, argc)?;
    let Some(id) = as_array(vm, receiver) else {
        return Err(vm.runtime_error("method Array::indexOf() expects an array receiver."));
    };
    let needle = vm.native_arg(argc, 0);
    let found = vm
        .heap
        .array(id)
        .elements
        .iter()
        .position(|&element| element.equals(needle));
    Ok(match found {
        Some(index) => Value::Int(index as i32),
        None => Value::Int(-1),
    })
}

// === Dictionary ===

fn as_dict(vm: &Vm<'_>, value: Value) -> Option<HeapId> {
    value.as_obj().filter(|&id| matches!(vm.heap.data(id), ObjData::Dictionary(_)))
}

fn dict_length(vm: &mut Vm<'_>, receiver: Value, argc: usize) -> RunResult<Value> {
    check_arity(vm, "method Dictionary::length()", 0, argc)?;
    let Some(id) = as_dict(vm, receiver) else {
        return Err(vm.runtime_error("method Dictionary::length() expects a dictionary receiver."));
    };
    Ok(Value::Int(vm.heap.dict(id).len() as i32))
}

fn dict_key_hash(vm: &mut Vm<'_>, key: Value) -> RunResult<u64> {
    match key.hash(&vm.heap) {
        Some(hash) => Ok(hash),
        None => {
            let text = key.display(&vm.heap);
            Err(vm.runtime_error(format!("Unhashable dictionary key: {text}.")))
        }
    }
}

fn dict_contains_key(vm: &mut Vm<'_>, receiver: Value, argc: usize) -> RunResult<Value> {
    check_arity(vm, "method Dictionary::containsKey()", 1, argc)?;
    let Some(id) = as_dict(vm, receiver) else {
        return Err(
            vm.runtime_error("method Dictionary::containsKey() expects a dictionary receiver.")
        );
    };
    let key = vm.native_arg(argc, 0);
    let hash = dict_key_hash(vm, key)?;
    Ok(Value::Bool(vm.heap.dict(id).get(key, hash).is_some()))
}

fn dict_remove(vm: &mut Vm<'_>, receiver: Value, argc: usize) -> RunResult<Value> {
    check_arity(vm, "method Dictionary::remove()", 1, argc)?;
    let Some(id) = as_dict(vm, receiver) else {
        return Err(vm.runtime_error("method Dictionary::remove() expects a dictionary receiver."));
    };
    let key = vm.native_arg(argc, 0);
    let hash = dict_key_hash(vm, key)?;
    Ok(vm.heap.dict_mut(id).remove(key, hash).unwrap_or(Value::Nil))
}

fn dict_keys(vm: &mut Vm<'_>, receiver: Value, argc: usize) -> RunResult<Value> {
    check_arity(vm, "method Dictionary::keys()", 0, argc)?;
    let Some(id) = as_dict(vm, receiver) else {
        return Err(vm.runtime_error("method Dictionary::keys() expects a dictionary receiver."));
    };
    let keys: Vec<Value> = vm.heap.dict(id).iter().map(|(key, _)| key).collect();
    let array = vm.allocate(ObjData::Array(Array { elements: keys }), Some(vm.core.array));
    Ok(Value::Obj(array))
}

// === Range ===

fn as_range(vm: &Vm<'_>, value: Value) -> Option<Range> {
    let id = value.as_obj()?;
    match vm.heap.data(id) {
        ObjData::Range(range) => Some(*range),
        _ => None,
    }
}

/// Native constructor: `Range(start, end)`. The receiver is the class being
/// instantiated, so subclasses keep their identity.
fn range_init(vm: &mut Vm<'_>, receiver: Value, argc: usize) -> RunResult<Value> {
    check_arity(vm, "method Range::init()", 2, argc)?;
    let (Value::Int(start), Value::Int(end)) = (vm.native_arg(argc, 0), vm.native_arg(argc, 1))
    else {
        return Err(vm.runtime_error("method Range::init() expects integer bounds."));
    };
    let class = as_class(vm, receiver).unwrap_or(vm.core.range);
    let range = vm.allocate(ObjData::Range(Range { start, end }), Some(class));
    Ok(Value::Obj(range))
}

fn range_start(vm: &mut Vm<'_>, receiver: Value, argc: usize) -> RunResult<Value> {
    check_arity(vm, "method Range::start()", 0, argc)?;
    let Some(range) = as_range(vm, receiver) else {
        return Err(vm.runtime_error("method Range::start() expects a range receiver."));
    };
    Ok(Value::Int(range.start))
}

fn range_end(vm: &mut Vm<'_>, receiver: Value, argc: usize) -> RunResult<Value> {
    check_arity(vm, "method Range::end()", 0, argc)?;
    let Some(range) = as_range(vm, receiver) else {
        return Err(vm.runtime_error("method Range::end() expects a range receiver."));
    };
    Ok(Value::Int(range.end))
}

fn range_length(vm: &mut Vm<'_>, receiver: Value, argc: usize) -> RunResult<Value> {
    check_arity(vm, "method Range::length()", 0, argc)?;
    let Some(range) = as_range(vm, receiver) else {
        return Err(vm.runtime_error("method Range::length() expects a range receiver."));
    };
    Ok(Value::Int((range.end - range.start).max(0)))
}

fn range_contains(vm: &mut Vm<'_>, receiver: Value, argc: usize) -> RunResult<Value> {
    check_arity(vm, "method Range::contains()", 1, argc)?;
    let Some(range) = as_range(vm, receiver) else {
        return Err(vm.runtime_error("method Range::contains() expects a range receiver."));
    };
    let Value::Int(value) = vm.native_arg(argc, 0) else {
        return Ok(Value::Bool(false));
    };
    Ok(Value::Bool(value >= range.start && value < range.end))
}

// === Exception ===

fn exception_init(vm: &mut Vm<'_>, receiver: Value, argc: usize) -> RunResult<Value> {
    check_arity(vm, "method Exception::init()", 1, argc)?;
    let message = vm.native_arg(argc, 0);
    let instance = receiver
        .as_obj()
        .filter(|&id| matches!(vm.heap.data(id), ObjData::Instance(_)));
    let Some(instance) = instance else {
        return Err(vm.runtime_error("method Exception::init() expects an instance receiver."));
    };
    let message_id = match as_string(vm, message) {
        Some(id) => id,
        None => {
            let text = message.display(&vm.heap);
            vm.take_string(text)
        }
    };
    vm.protect(Value::Obj(message_id));
    let message_name = vm.intern_string("message");
    vm.set_instance_field(instance, message_name, Value::Obj(message_id));
    vm.unprotect();

    let trace = vm.capture_stack_trace();
    let trace_array = vm.allocate(ObjData::Array(Array::default()), Some(vm.core.array));
    vm.protect(Value::Obj(trace_array));
    for entry in trace {
        let entry_id = vm.take_string(entry);
        vm.heap.write_barrier(trace_array, Value::Obj(entry_id));
        vm.heap.array_mut(trace_array).elements.push(Value::Obj(entry_id));
    }
    vm.unprotect();
    let trace_name = vm.intern_string("stacktrace");
    vm.set_instance_field(instance, trace_name, Value::Obj(trace_array));
    Ok(receiver)
}

fn exception_get_message(vm: &mut Vm<'_>, receiver: Value, argc: usize) -> RunResult<Value> {
    check_arity(vm, "method Exception::getMessage()", 0, argc)?;
    Ok(vm.exception_message_value(receiver))
}

fn exception_get_stack_trace(vm: &mut Vm<'_>, receiver: Value, argc: usize) -> RunResult<Value> {
    check_arity(vm, "method Exception::getStackTrace()", 0, argc)?;
    let Some(id) = receiver.as_obj() else {
        return Ok(Value::Nil);
    };
    match self_stacktrace(vm, id) {
        Some(value) => Ok(value),
        None => Ok(Value::Nil),
    }
}

fn self_stacktrace(vm: &Vm<'_>, id: HeapId) -> Option<Value> {
    match vm.heap.data(id) {
        ObjData::Exception(e) => Some(Value::Obj(e.stacktrace)),
        ObjData::Instance(_) => {
            let name = vm.heap.find_string("stacktrace")?;
            vm.instance_field(id, name)
        }
        _ => None,
    }
}

// === Generator ===

fn generator_resume(vm: &mut Vm<'_>, receiver: Value, argc: usize) -> RunResult<Value> {
    if argc > 1 {
        return Err(vm.runtime_error(format!(
            "method Generator::resume() expects at most 1 argument but got {argc}."
        )));
    }
    let Some(generator) = vm.as_generator(receiver) else {
        return Err(vm.runtime_error("method Generator::resume() expects a generator receiver."));
    };
    let value = if argc == 1 { vm.native_arg(argc, 0) } else { Value::Nil };
    vm.step_generator(generator, Resume::Send(value))
}

fn generator_is_finished(vm: &mut Vm<'_>, receiver: Value, argc: usize) -> RunResult<Value> {
    check_arity(vm, "method Generator::isFinished()", 0, argc)?;
    let Some(generator) = vm.as_generator(receiver) else {
        return Err(
            vm.runtime_error("method Generator::isFinished() expects a generator receiver.")
        );
    };
    let state = vm.heap.generator(generator).state;
    Ok(Value::Bool(matches!(state, GeneratorState::Return | GeneratorState::Error)))
}

// === Promise ===

/// Native constructor: `Promise(executor)`. The executor runs immediately
/// with `(resolve, reject)` continuations bound to the new promise.
fn promise_init(vm: &mut Vm<'_>, receiver: Value, argc: usize) -> RunResult<Value> {
    check_arity(vm, "method Promise::init()", 1, argc)?;
    let executor = vm.native_arg(argc, 0);
    let class = as_class(vm, receiver).unwrap_or(vm.core.promise);
    let promise = vm.allocate(ObjData::Promise(Promise::pending()), Some(class));
    vm.heap.write_barrier(promise, executor);
    vm.heap.promise_mut(promise).executor = executor;

    vm.protect(Value::Obj(promise));
    let resolve = vm.bound_native(promise, "resolve", promise_resolve_continuation);
    vm.protect(resolve);
    let reject = vm.bound_native(promise, "reject", promise_reject_continuation);
    vm.call_function(executor, &[resolve, reject])?;
    vm.unprotect();
    vm.unprotect();
    Ok(Value::Obj(promise))
}

fn promise_resolve_continuation(
    vm: &mut Vm<'_>,
    receiver: Value,
    argc: usize,
) -> RunResult<Value> {
    let value = if argc > 0 { vm.native_arg(argc, 0) } else { Value::Nil };
    let promise = receiver.as_obj().expect("resolve receiver is a promise");
    vm.fulfil_promise(promise, value)?;
    Ok(Value::Nil)
}

fn promise_reject_continuation(vm: &mut Vm<'_>, receiver: Value, argc: usize) -> RunResult<Value> {
    let value = if argc > 0 { vm.native_arg(argc, 0) } else { Value::Nil };
    let promise = receiver.as_obj().expect("reject receiver is a promise");
    vm.reject_promise(promise, value)?;
    Ok(Value::Nil)
}

fn promise_then(vm: &mut Vm<'_>, receiver: Value, argc: usize) -> RunResult<Value> {
    check_arity(vm, "method Promise::then()", 1, argc)?;
    let Some(promise) = vm.as_promise(receiver) else {
        return Err(vm.runtime_error("method Promise::then() expects a promise receiver."));
    };
    let handler = vm.native_arg(argc, 0);
    vm.add_reaction(promise, handler, Value::Nil)?;
    Ok(receiver)
}

fn promise_catch(vm: &mut Vm<'_>, receiver: Value, argc: usize) -> RunResult<Value> {
    check_arity(vm, "method Promise::catch()", 1, argc)?;
    let Some(promise) = vm.as_promise(receiver) else {
        return Err(vm.runtime_error("method Promise::catch() expects a promise receiver."));
    };
    let handler = vm.native_arg(argc, 0);
    vm.add_reaction(promise, Value::Nil, handler)?;
    Ok(receiver)
}

fn promise_resolve_static(vm: &mut Vm<'_>, _receiver: Value, argc: usize) -> RunResult<Value> {
    check_arity(vm, "static method Promise::resolve()", 1, argc)?;
    let value = vm.native_arg(argc, 0);
    if vm.as_promise(value).is_some() {
        return Ok(value);
    }
    let promise = vm.allocate(ObjData::Promise(Promise::pending()), Some(vm.core.promise));
    vm.protect(Value::Obj(promise));
    vm.fulfil_promise(promise, value)?;
    vm.unprotect();
    Ok(Value::Obj(promise))
}

fn promise_reject_static(vm: &mut Vm<'_>, _receiver: Value, argc: usize) -> RunResult<Value> {
    check_arity(vm, "static method Promise::reject()", 1, argc)?;
    let exception = vm.native_arg(argc, 0);
    let promise = vm.allocate(ObjData::Promise(Promise::pending()), Some(vm.core.promise));
    vm.protect(Value::Obj(promise));
    vm.reject_promise(promise, exception)?;
    vm.unprotect();
    Ok(Value::Obj(promise))
}
