//! Property access: fields, method binding, interceptor hooks, super
//! dispatch, and the monomorphic inline caches on get/set sites.

use crate::{
    bytecode::PropertyCache,
    error::RunResult,
    heap::HeapId,
    object::{BoundMethod, Interceptors, ObjData},
    value::Value,
    vm::Vm,
};

impl<'out> Vm<'out> {
    /// `GetProperty name`: `receiver -> value`. `site` is the instruction
    /// offset, used as the inline-cache key.
    pub(crate) fn op_get_property(&mut self, name: HeapId, site: usize) -> RunResult<()> {
        let receiver = self.peek(0);
        let value = self.get_property_value(receiver, name, Some(site))?;
        self.pop();
        self.push(value);
        Ok(())
    }

    /// Property lookup with the full precedence chain. For instances:
    /// before-get hook, fields, methods (class chain), undefined-get hook,
    /// error; an after-get hook may transform the result.
    pub(crate) fn get_property_value(
        &mut self,
        receiver: Value,
        name: HeapId,
        site: Option<usize>,
    ) -> RunResult<Value> {
        enum Shape {
            Instance(HeapId),
            NamespaceMember(Option<Value>),
            Class,
            Other,
        }

        if let Some(id) = receiver.as_obj() {
            let shape = match self.heap.data(id) {
                ObjData::Instance(_) => {
                    Shape::Instance(self.heap.header(id).class.expect("instance has a class"))
                }
                ObjData::Namespace(ns) => Shape::NamespaceMember(ns.values.get(&name).copied()),
                ObjData::Class(_) => Shape::Class,
                _ => Shape::Other,
            };
            match shape {
                Shape::Instance(class) => {
                    return self.get_instance_property(receiver, id, class, name, site);
                }
                Shape::NamespaceMember(member) => {
                    return member.ok_or_else(|| {
                        let text = self.heap.string_value(name).to_owned();
                        self.runtime_error(format!("Undefined property '{text}'."))
                    });
                }
                Shape::Class => {
                    // Static access binds a metaclass method to the class.
                    if let Some(metaclass) = self.heap.header(id).class {
                        if let Some(method) = self.find_method(metaclass, name) {
                            return Ok(self.bind_method(receiver, method));
                        }
                    }
                    let text = self.heap.string_value(name).to_owned();
                    return Err(self.runtime_error(format!("Undefined property '{text}'.")));
                }
                Shape::Other => {}
            }
        }

        // Everything else dispatches through its built-in class.
        let class = self.class_of(receiver);
        match self.find_method(class, name) {
            Some(method) => Ok(self.bind_method(receiver, method)),
            None => {
                let text = self.heap.string_value(name).to_owned();
                Err(self.runtime_error(format!("Undefined property '{text}'.")))
            }
        }
    }

    fn get_instance_property(
        &mut self,
        receiver: Value,
        instance: HeapId,
        class: HeapId,
        name: HeapId,
        site: Option<usize>,
    ) -> RunResult<Value> {
        let interceptors = self.heap.class(class).interceptors;
        let get_hooks =
            Interceptors::BEFORE_GET | Interceptors::AFTER_GET | Interceptors::UNDEFINED_GET;
        let cacheable = !interceptors.intersects(get_hooks);

        if cacheable {
            if let Some(site) = site {
                if let Some(value) = self.cached_field(instance, class, site) {
                    return Ok(value);
                }
            }
        }

        let mut value = None;
        if interceptors.contains(Interceptors::BEFORE_GET) {
            let hook = self.hooks.before_get;
            if let Some(hook) = self.find_method(class, hook) {
                let result = self.call_method_reentrant(receiver, hook, &[Value::Obj(name)])?;
                if !result.is_nil() {
                    value = Some(result);
                }
            }
        }

        if value.is_none() {
            if let Some(index) = self.heap.class(class).field_indexes.get(&name).copied() {
                let field = self
                    .heap
                    .instance(instance)
                    .fields
                    .get(index as usize)
                    .copied()
                    .unwrap_or(Value::Undefined);
                if !field.is_undefined() {
                    if cacheable {
                        if let Some(site) = site {
                            self.fill_cache(class, site, index);
                        }
                    }
                    value = Some(field);
                }
            }
        }

        if value.is_none() {
            if let Some(method) = self.find_method(class, name) {
                value = Some(self.bind_method(receiver, method));
            }
        }

        if value.is_none() && interceptors.contains(Interceptors::UNDEFINED_GET) {
            let hook = self.hooks.undefined_get;
            if let Some(hook) = self.find_method(class, hook) {
                value = Some(self.call_method_reentrant(receiver, hook, &[Value::Obj(name)])?);
            }
        }

        let Some(mut value) = value else {
            let text = self.heap.string_value(name).to_owned();
            return Err(self.runtime_error(format!("Undefined property '{text}'.")));
        };

        if interceptors.contains(Interceptors::AFTER_GET) {
            let hook = self.hooks.after_get;
            if let Some(hook) = self.find_method(class, hook) {
                value =
                    self.call_method_reentrant(receiver, hook, &[value, Value::Obj(name)])?;
            }
        }
        Ok(value)
    }

    fn cached_field(&self, instance: HeapId, class: HeapId, site: usize) -> Option<Value> {
        let function = self.frames.last()?.function;
        let cache = self.heap.function(function).chunk.caches.get(&site)?;
        if cache.class != class || cache.epoch != self.heap.reuse_epoch() {
            return None;
        }
        let field = self.heap.instance(instance).fields.get(cache.index as usize).copied()?;
        (!field.is_undefined()).then_some(field)
    }

    fn fill_cache(&mut self, class: HeapId, site: usize, index: u32) {
        let Some(frame) = self.frames.last() else { return };
        let function = frame.function;
        let cache = PropertyCache { class, epoch: self.heap.reuse_epoch(), index };
        self.heap.function_mut(function).chunk.caches.insert(site, cache);
    }

    /// `SetProperty name`: `receiver value -> value`. Creates the field slot
    /// on the class the first time the name is assigned.
    pub(crate) fn op_set_property(&mut self, name: HeapId) -> RunResult<()> {
        let value = self.peek(0);
        let receiver = self.peek(1);
        let Some(instance) = receiver.as_obj() else {
            return Err(self.runtime_error("Only instances have fields."));
        };
        if !matches!(self.heap.data(instance), ObjData::Instance(_)) {
            return Err(self.runtime_error("Only instances have fields."));
        }
        let class = self.heap.header(instance).class.expect("instance has a class");
        let interceptors = self.heap.class(class).interceptors;

        let mut value = value;
        if interceptors.contains(Interceptors::BEFORE_SET) {
            let hook = self.hooks.before_set;
            if let Some(hook) = self.find_method(class, hook) {
                value =
                    self.call_method_reentrant(receiver, hook, &[Value::Obj(name), value])?;
            }
        }

        self.set_instance_field(instance, name, value);

        if interceptors.contains(Interceptors::AFTER_SET) {
            let hook = self.hooks.after_set;
            if let Some(hook) = self.find_method(class, hook) {
                self.call_method_reentrant(receiver, hook, &[Value::Obj(name)])?;
            }
        }

        self.pop();
        self.pop();
        self.push(value);
        Ok(())
    }

    /// `GetSuper name`: `receiver superclass -> bound method`.
    pub(crate) fn op_get_super(&mut self, name: HeapId) -> RunResult<()> {
        let superclass = self.pop();
        let class = superclass.as_obj().expect("super slot holds a class");
        let Some(method) = self.find_method(class, name) else {
            let text = self.heap.string_value(name).to_owned();
            return Err(self.runtime_error(format!("Undefined property '{text}'.")));
        };
        let receiver = self.peek(0);
        let bound = self.bind_method(receiver, method);
        self.pop();
        self.push(bound);
        Ok(())
    }

    // === Lookup helpers ===

    /// Finds a method by walking the class chain. Inheritance also copies
    /// method tables flat, so the walk usually ends at the first class.
    pub(crate) fn find_method(&self, class: HeapId, name: HeapId) -> Option<Value> {
        let mut current = Some(class);
        while let Some(id) = current {
            let c = self.heap.class(id);
            if let Some(&method) = c.methods.get(&name) {
                return Some(method);
            }
            current = c.superclass;
        }
        None
    }

    pub(crate) fn bind_method(&mut self, receiver: Value, method: Value) -> Value {
        let bound = self.allocate(
            ObjData::BoundMethod(BoundMethod { receiver, method }),
            Some(self.core.method),
        );
        Value::Obj(bound)
    }

    /// Reads an instance field by name, if the slot exists and is set.
    pub(crate) fn instance_field(&self, instance: HeapId, name: HeapId) -> Option<Value> {
        let class = self.heap.header(instance).class?;
        let index = self.heap.class(class).field_indexes.get(&name).copied()?;
        let field = self.heap.instance(instance).fields.get(index as usize).copied()?;
        (!field.is_undefined()).then_some(field)
    }

    /// Writes an instance field, growing the class field layout when the
    /// name is new.
    pub(crate) fn set_instance_field(&mut self, instance: HeapId, name: HeapId, value: Value) {
        let class = self.heap.header(instance).class.expect("instance has a class");
        let index = match self.heap.class(class).field_indexes.get(&name).copied() {
            Some(index) => index,
            None => {
                let index = {
                    let class_data = self.heap.class_mut(class);
                    let index = class_data.default_fields.len() as u32;
                    class_data.default_fields.push(Value::Nil);
                    class_data.field_indexes.insert(name, index);
                    index
                };
                self.heap.write_barrier(class, Value::Obj(name));
                index
            }
        };
        let fields = &mut self.heap.instance_mut(instance).fields;
        if fields.len() <= index as usize {
            fields.resize(index as usize + 1, Value::Undefined);
        }
        fields[index as usize] = value;
        self.heap.write_barrier(instance, value);
    }
}
