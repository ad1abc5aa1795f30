//! Exception objects, handler stacks, and frame unwinding.

use crate::{
    error::{RunError, RunResult, RuntimeReport},
    heap::HeapId,
    object::{Array, ExceptionObj, ObjData},
    value::Value,
    vm::Vm,
};

/// One entry of a frame's exception handler stack, pushed by `PushHandler`.
///
/// A `class` of `None` means the try statement has no catch clause (finally
/// only). `stack_depth` is the operand stack height when the handler was
/// installed; unwinding restores it before jumping.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ExceptionHandler {
    pub class: Option<HeapId>,
    pub handler_ip: usize,
    pub finally_ip: Option<usize>,
    pub stack_depth: usize,
}

impl<'out> Vm<'out> {
    /// Builds an Exception object for a VM-level runtime error and returns
    /// it as an in-flight [`RunError`]. The message and trace are captured
    /// from the live frame stack before any unwinding happens.
    pub(crate) fn runtime_error(&mut self, message: impl Into<String>) -> RunError {
        let message = message.into();
        let exception = self.make_exception(&message);
        RunError { exception }
    }

    /// Allocates an Exception with the current stack trace. The finished
    /// object is rooted in the VM's thrown slot.
    pub(crate) fn make_exception(&mut self, message: &str) -> Value {
        let message_id = self.intern_string(message);
        self.protect(Value::Obj(message_id));

        let trace = self.capture_stack_trace();
        let trace_array = self.allocate(ObjData::Array(Array::default()), Some(self.core.array));
        self.protect(Value::Obj(trace_array));
        for entry in trace {
            let entry_id = self.take_string(entry);
            self.heap.write_barrier(trace_array, Value::Obj(entry_id));
            self.heap.array_mut(trace_array).elements.push(Value::Obj(entry_id));
        }

        let exception = self.allocate(
            ObjData::Exception(ExceptionObj { message: message_id, stacktrace: trace_array }),
            Some(self.core.exception),
        );
        self.unprotect();
        self.unprotect();
        let value = Value::Obj(exception);
        self.thrown = Some(value);
        value
    }

    /// Formats `[line N] in name` entries from the innermost frame outward.
    pub(crate) fn capture_stack_trace(&self) -> Vec<String> {
        let mut trace = Vec::with_capacity(self.frames.len());
        for frame in self.frames.iter().rev() {
            let function = frame.function;
            let f = self.heap.function(function);
            let line = f.chunk.line(frame.ip.saturating_sub(1));
            let name = match f.name {
                Some(name) => self.heap.string_value(name),
                None => "script",
            };
            trace.push(format!("[line {line}] in {name}"));
        }
        trace
    }

    /// Unwinds an in-flight exception against the handler chain.
    ///
    /// Returns `Ok(())` when a handler (or finally block) took control; the
    /// dispatch loop continues from the new ip. Returns the error when
    /// unwinding reaches `frame_mark` without a match; the caller at that
    /// mark (a nested native call or `interpret` itself) propagates it.
    pub(crate) fn unwind(&mut self, error: RunError, frame_mark: usize) -> RunResult<()> {
        let exception = error.exception;
        self.thrown = Some(exception);

        loop {
            if self.frames.is_empty() {
                return Err(error);
            }
            let handler = self
                .frames
                .last_mut()
                .and_then(|frame| frame.handlers.pop());
            if let Some(handler) = handler {
                let caught = match handler.class {
                    Some(class) => self.value_is_instance_of(exception, class),
                    None => false,
                };
                if caught {
                    self.stack.truncate(handler.stack_depth);
                    self.stack.push(exception);
                    let frame = self.frames.last_mut().expect("frame present during unwind");
                    frame.ip = handler.handler_ip;
                    self.pending_exception = None;
                    self.thrown = None;
                    return Ok(());
                }
                if let Some(finally_ip) = handler.finally_ip {
                    self.stack.truncate(handler.stack_depth);
                    let frame = self.frames.last_mut().expect("frame present during unwind");
                    frame.ip = finally_ip;
                    self.pending_exception = Some(exception);
                    return Ok(());
                }
                continue;
            }

            if self.frames.len() == frame_mark {
                return Err(error);
            }
            let frame = self.frames.pop().expect("frame stack empty during unwind");
            self.close_upvalues(frame.slots);
            if frame.pushed_namespace {
                self.namespace_stack.pop();
            }
            self.stack.truncate(frame.slots);
        }
    }

    /// Whether a value is an instance of a class, by class chain or trait
    /// implementation.
    pub(crate) fn value_is_instance_of(&self, value: Value, class: HeapId) -> bool {
        let mut current = Some(self.class_of(value));
        while let Some(id) = current {
            if id == class {
                return true;
            }
            let c = self.heap.class(id);
            if c.traits.contains(&class) {
                return true;
            }
            current = c.superclass;
        }
        false
    }

    /// The message carried by a thrown value: the `message` of an Exception
    /// object or instance, or the value's display form.
    pub(crate) fn exception_message_value(&mut self, value: Value) -> Value {
        if let Some(id) = value.as_obj() {
            match self.heap.data(id) {
                ObjData::Exception(e) => return Value::Obj(e.message),
                ObjData::Instance(_) => {
                    if let Some(message) = self
                        .heap
                        .find_string("message")
                        .and_then(|name| self.instance_field(id, name))
                    {
                        return message;
                    }
                }
                _ => {}
            }
        }
        let text = value.display(&self.heap);
        Value::Obj(self.take_string(text))
    }

    /// The stack trace carried by a thrown value, if it has one.
    fn exception_trace(&self, value: Value) -> Option<Vec<String>> {
        let id = value.as_obj()?;
        let trace_array = match self.heap.data(id) {
            ObjData::Exception(e) => Some(e.stacktrace),
            ObjData::Instance(_) => self
                .heap
                .find_string("stacktrace")
                .and_then(|name| self.instance_field(id, name))
                .and_then(Value::as_obj),
            _ => None,
        }?;
        if !matches!(self.heap.data(trace_array), ObjData::Array(_)) {
            return None;
        }
        Some(
            self.heap
                .array(trace_array)
                .elements
                .iter()
                .filter_map(|v| v.as_obj())
                .map(|id| self.heap.string_value(id).to_owned())
                .collect(),
        )
    }

    /// Formats an uncaught exception for the host.
    pub(crate) fn report_uncaught(&mut self, error: RunError) -> RuntimeReport {
        let stack_trace = self
            .exception_trace(error.exception)
            .unwrap_or_else(|| self.capture_stack_trace());
        let message = self.exception_message_value(error.exception);
        let message = message.display(&self.heap);
        self.reset_after_error();
        RuntimeReport { message, stack_trace }
    }

    fn reset_after_error(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
        self.running_generator = None;
        self.pending_exception = None;
        self.thrown = None;
        self.namespace_stack.truncate(1);
    }
}
