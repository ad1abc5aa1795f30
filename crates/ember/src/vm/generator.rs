//! Generator suspension and resumption.
//!
//! A generator's frame is a first-class heap object: suspending copies the
//! frame's stack window into it, resuming copies the window back and pushes
//! a fresh call frame. The VM tracks the chain of currently-running
//! generators through their `outer` links; async coroutines reuse exactly
//! this machinery.

use crate::{
    error::{RunError, RunResult},
    heap::HeapId,
    object::{GeneratorState, ObjData},
    value::Value,
    vm::{FRAMES_MAX, Vm},
};

/// How a generator is being re-entered.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Resume {
    /// Resume with a value: the result of the suspended `yield`/`await`.
    Send(Value),
    /// Resume by raising an exception at the suspension point.
    Throw(Value),
}

impl<'out> Vm<'out> {
    /// Suspends the running generator: saves the top frame into it, records
    /// the yielded value, and hands control back to the resumer. Returns
    /// the yielded value.
    pub(crate) fn suspend_running_generator(&mut self, value: Value) -> RunResult<Value> {
        let Some(generator) = self.running_generator else {
            return Err(self.runtime_error("Can't yield outside of a generator."));
        };

        let frame = self.frames.pop().expect("suspending without a frame");
        // Captured locals are moved off the stack now; closures over them
        // keep the values they saw at suspension.
        self.close_upvalues(frame.slots);
        let slots = self.stack[frame.slots..].to_vec();
        if frame.pushed_namespace {
            self.namespace_stack.pop();
        }
        self.stack.truncate(frame.slots);

        let frame_obj = self.heap.generator(generator).frame;
        for &slot in &slots {
            self.heap.write_barrier(frame_obj, slot);
        }
        {
            let saved = self.heap.frame_mut(frame_obj);
            saved.ip = frame.ip;
            saved.slots = slots;
            saved.handlers = frame.handlers;
        }

        self.heap.write_barrier(generator, value);
        let outer = {
            let g = self.heap.generator_mut(generator);
            g.value = value;
            g.state = GeneratorState::Yield;
            g.outer
        };
        self.running_generator = outer;
        Ok(value)
    }

    /// Drives a generator until its next suspension or return.
    ///
    /// Returns the value it yielded or returned. The generator's state
    /// afterwards distinguishes the two: `Yield` means suspended again,
    /// `Return` means finished. Errors propagate to the resumer after the
    /// state is set to `Error`.
    pub(crate) fn step_generator(&mut self, generator: HeapId, resume: Resume) -> RunResult<Value> {
        let state = self.heap.generator(generator).state;
        match state {
            GeneratorState::Resume | GeneratorState::Throw => {
                return Err(self.runtime_error("Generator is already running."));
            }
            GeneratorState::Return | GeneratorState::Error => {
                return Err(self.runtime_error("Cannot resume a finished generator."));
            }
            GeneratorState::Start | GeneratorState::Yield => {}
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }

        let frame_mark = self.frames.len();
        let frame_obj = self.heap.generator(generator).frame;
        let (closure, ip, slots, handlers) = {
            let saved = self.heap.frame(frame_obj);
            (saved.closure, saved.ip, saved.slots.clone(), saved.handlers.clone())
        };
        let function = self.heap.closure(closure).function;

        let argc = slots.len().saturating_sub(1);
        self.stack.extend(slots);
        self.push_closure_frame(closure, function, ip, argc, handlers);

        let previous = self.running_generator.replace(generator);
        if let Some(previous) = previous {
            self.heap.write_barrier(generator, Value::Obj(previous));
        }
        self.heap.generator_mut(generator).outer = previous;

        match resume {
            Resume::Send(value) => {
                if state == GeneratorState::Yield {
                    // The saved frame is parked on its yield expression;
                    // the sent value becomes that expression's result.
                    self.push(value);
                }
                self.heap.generator_mut(generator).state = GeneratorState::Resume;
            }
            Resume::Throw(exception) => {
                self.heap.generator_mut(generator).state = GeneratorState::Throw;
                if let Err(error) = self.unwind(RunError { exception }, frame_mark) {
                    self.running_generator = previous;
                    self.heap.generator_mut(generator).state = GeneratorState::Error;
                    return Err(error);
                }
                self.heap.generator_mut(generator).state = GeneratorState::Resume;
            }
        }

        let result = self.run(frame_mark);
        self.running_generator = previous;
        match result {
            Err(error) => {
                self.heap.generator_mut(generator).state = GeneratorState::Error;
                Err(error)
            }
            Ok(value) => {
                let g_state = self.heap.generator(generator).state;
                if g_state == GeneratorState::Yield {
                    Ok(value)
                } else {
                    self.heap.write_barrier(generator, value);
                    let g = self.heap.generator_mut(generator);
                    g.state = GeneratorState::Return;
                    g.value = value;
                    Ok(value)
                }
            }
        }
    }

    /// Whether a value is a generator object.
    pub(crate) fn as_generator(&self, value: Value) -> Option<HeapId> {
        let id = value.as_obj()?;
        matches!(self.heap.data(id), ObjData::Generator(_)).then_some(id)
    }
}
