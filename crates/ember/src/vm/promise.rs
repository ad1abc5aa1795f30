//! Promises and the async/await integration.
//!
//! There is no event loop in the core: settlement runs reactions
//! synchronously, in registration order. An async call builds a coroutine
//! (a generator under the hood) plus a pending Promise, runs the body
//! eagerly, and suspends at the first `await` of a pending promise; the
//! awaited promise gets a pair of native continuations that resume the
//! coroutine when it settles.

use crate::{
    error::RunResult,
    heap::HeapId,
    object::{GeneratorState, NativeMethod, ObjData, Promise, PromiseReaction, PromiseState},
    value::Value,
    vm::{Vm, generator::Resume},
};

impl<'out> Vm<'out> {
    /// `Await`: pop the operand; push its settled value, or suspend the
    /// running coroutine when it is a pending promise (returning `None` so
    /// the dispatch loop yields control to the coroutine's driver).
    pub(crate) fn op_await(&mut self) -> RunResult<Option<Value>> {
        let value = self.pop();
        let Some(promise) = self.as_promise(value) else {
            // Awaiting a plain value yields the value itself.
            return Ok(Some(value));
        };
        match self.heap.promise(promise).state {
            PromiseState::Fulfilled => Ok(Some(self.heap.promise(promise).value)),
            PromiseState::Rejected => {
                let exception = self
                    .heap
                    .promise(promise)
                    .exception
                    .map_or(Value::Nil, Value::Obj);
                self.thrown = Some(exception);
                Err(crate::error::RunError { exception })
            }
            PromiseState::Pending => {
                if self.running_generator.is_none() {
                    return Err(
                        self.runtime_error("Can only await inside an async function.")
                    );
                }
                self.suspend_running_generator(value)?;
                Ok(None)
            }
        }
    }

    /// Async call: build the coroutine and its promise, then run the body
    /// until it completes or first suspends. The promise is the call result.
    pub(crate) fn call_async(&mut self, closure: HeapId, argc: usize) -> RunResult<()> {
        let generator = self.make_generator(closure, argc)?;
        self.protect(Value::Obj(generator));
        let promise = self.allocate(
            ObjData::Promise(Promise::pending()),
            Some(self.core.promise),
        );
        self.unprotect();
        let coroutine_key = self.hooks.coroutine;
        self.heap.write_barrier(promise, Value::Obj(generator));
        self.heap
            .promise_mut(promise)
            .captures
            .insert(coroutine_key, Value::Obj(generator));

        self.push(Value::Obj(promise));
        self.drive_coroutine(generator, promise, Resume::Send(Value::Nil))?;
        Ok(())
    }

    /// Steps a coroutine once and reacts to how it stopped: settle its
    /// promise on return or error, or chain continuations onto the awaited
    /// promise on suspension.
    pub(crate) fn drive_coroutine(
        &mut self,
        generator: HeapId,
        promise: HeapId,
        resume: Resume,
    ) -> RunResult<()> {
        match self.step_generator(generator, resume) {
            Err(error) => {
                self.thrown = None;
                self.reject_promise(promise, error.exception)?;
            }
            Ok(value) => {
                if self.heap.generator(generator).state == GeneratorState::Yield {
                    let awaited = self
                        .as_promise(self.heap.generator(generator).value)
                        .expect("a coroutine only suspends on a pending promise");
                    self.chain_coroutine(awaited, promise)?;
                } else {
                    self.fulfil_promise(promise, value)?;
                }
            }
        }
        Ok(())
    }

    /// Registers native continuations on `awaited` that resume the
    /// coroutine owned by `promise` once `awaited` settles.
    fn chain_coroutine(&mut self, awaited: HeapId, promise: HeapId) -> RunResult<()> {
        let on_fulfilled = self.bound_native(promise, "continueCoroutine", coroutine_continue);
        self.protect(on_fulfilled);
        let on_rejected = self.bound_native(promise, "throwIntoCoroutine", coroutine_throw);
        self.unprotect();
        self.add_reaction(awaited, on_fulfilled, on_rejected)
    }

    /// Builds a BoundMethod over a one-off native, receiver included.
    pub(crate) fn bound_native(
        &mut self,
        receiver: HeapId,
        name: &str,
        function: crate::natives::NativeMethodFn,
    ) -> Value {
        let name_id = self.intern_string(name);
        self.protect(Value::Obj(name_id));
        let method = self.allocate(
            ObjData::NativeMethod(NativeMethod {
                name: name_id,
                class: self.core.promise,
                function,
            }),
            Some(self.core.method),
        );
        self.protect(Value::Obj(method));
        let bound = self.bind_method(Value::Obj(receiver), Value::Obj(method));
        self.unprotect();
        self.unprotect();
        bound
    }

    // === Settlement ===

    /// Fulfils a pending promise and runs fulfillment reactions in
    /// registration order. Settling twice is a no-op.
    pub(crate) fn fulfil_promise(&mut self, promise: HeapId, value: Value) -> RunResult<()> {
        if self.heap.promise(promise).state != PromiseState::Pending {
            return Ok(());
        }
        self.heap.write_barrier(promise, value);
        let reactions = {
            let p = self.heap.promise_mut(promise);
            p.state = PromiseState::Fulfilled;
            p.value = value;
            std::mem::take(&mut p.reactions)
        };
        for reaction in reactions {
            if !reaction.on_fulfilled.is_nil() {
                self.call_function(reaction.on_fulfilled, &[value])?;
            }
        }
        Ok(())
    }

    /// Rejects a pending promise with an exception value and runs rejection
    /// reactions in order. Unhandled rejections are dropped silently.
    pub(crate) fn reject_promise(&mut self, promise: HeapId, exception: Value) -> RunResult<()> {
        if self.heap.promise(promise).state != PromiseState::Pending {
            return Ok(());
        }
        let exception_obj = match exception.as_obj() {
            Some(id) => id,
            None => {
                let text = exception.display(&self.heap);
                let wrapped = self.make_exception(&text);
                wrapped.as_obj().expect("make_exception returns an object")
            }
        };
        self.heap.write_barrier(promise, Value::Obj(exception_obj));
        let reactions = {
            let p = self.heap.promise_mut(promise);
            p.state = PromiseState::Rejected;
            p.exception = Some(exception_obj);
            std::mem::take(&mut p.reactions)
        };
        self.thrown = None;
        for reaction in reactions {
            if !reaction.on_rejected.is_nil() {
                self.call_function(reaction.on_rejected, &[Value::Obj(exception_obj)])?;
            }
        }
        Ok(())
    }

    /// Adds a reaction pair; on an already-settled promise the relevant
    /// side runs immediately.
    pub(crate) fn add_reaction(
        &mut self,
        promise: HeapId,
        on_fulfilled: Value,
        on_rejected: Value,
    ) -> RunResult<()> {
        match self.heap.promise(promise).state {
            PromiseState::Pending => {
                self.heap.write_barrier(promise, on_fulfilled);
                self.heap.write_barrier(promise, on_rejected);
                self.heap
                    .promise_mut(promise)
                    .reactions
                    .push(PromiseReaction { on_fulfilled, on_rejected });
            }
            PromiseState::Fulfilled => {
                if !on_fulfilled.is_nil() {
                    let value = self.heap.promise(promise).value;
                    self.call_function(on_fulfilled, &[value])?;
                }
            }
            PromiseState::Rejected => {
                if !on_rejected.is_nil() {
                    let exception = self
                        .heap
                        .promise(promise)
                        .exception
                        .map_or(Value::Nil, Value::Obj);
                    self.call_function(on_rejected, &[exception])?;
                }
            }
        }
        Ok(())
    }

    pub(crate) fn as_promise(&self, value: Value) -> Option<HeapId> {
        let id = value.as_obj()?;
        matches!(self.heap.data(id), ObjData::Promise(_)).then_some(id)
    }
}

/// Continuation installed by `await`: resume the coroutine with the value.
fn coroutine_continue(vm: &mut Vm<'_>, receiver: Value, argc: usize) -> RunResult<Value> {
    let value = if argc > 0 { vm.native_arg(argc, 0) } else { Value::Nil };
    let promise = receiver.as_obj().expect("continuation receiver is a promise");
    let coroutine_key = vm.hooks.coroutine;
    let generator = vm
        .heap
        .promise(promise)
        .captures
        .get(&coroutine_key)
        .and_then(|v| v.as_obj())
        .expect("coroutine promise captures its generator");
    vm.drive_coroutine(generator, promise, Resume::Send(value))?;
    Ok(Value::Nil)
}

/// Rejection continuation: throw the exception into the coroutine.
fn coroutine_throw(vm: &mut Vm<'_>, receiver: Value, argc: usize) -> RunResult<Value> {
    let exception = if argc > 0 { vm.native_arg(argc, 0) } else { Value::Nil };
    let promise = receiver.as_obj().expect("continuation receiver is a promise");
    let coroutine_key = vm.hooks.coroutine;
    let generator = vm
        .heap
        .promise(promise)
        .captures
        .get(&coroutine_key)
        .and_then(|v| v.as_obj())
        .expect("coroutine promise captures its generator");
    vm.drive_coroutine(generator, promise, Resume::Throw(exception))?;
    Ok(Value::Nil)
}
