//! The object arena and the generational garbage collector.
//!
//! Objects live in a slot arena indexed by [`HeapId`]; freed slots are
//! recycled through a free list. Every object belongs to one of four
//! generations (Eden, Young, Old, Permanent). Collection of a generation
//! marks from the roots the VM supplies, traces through a gray-stack
//! worklist, then sweeps: marked objects are promoted one generation up,
//! unmarked ones are freed. The Permanent generation is never swept and
//! objects that reach it stay marked once a full collection has seen them.
//!
//! Cross-generation references are tracked with remembered sets: a write
//! barrier runs before every reference-storing field write, and records the
//! older object in the younger generation's set. During a collection the
//! recorded objects are scanned so their young children survive even when
//! nothing in the young roots reaches them.

use std::collections::BTreeMap;

use ahash::AHashSet;
use smallvec::SmallVec;

use crate::{
    config::VmConfig,
    intern::{InternTable, fnv1a},
    object::{
        Array, Class, Closure, Dict, EmberStr, Function, Generator, Instance, Module, Namespace,
        ObjData, Promise, SavedFrame, Upvalue,
    },
    value::Value,
};

/// Index of an object in the heap arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapId(usize);

impl HeapId {
    /// Returns the raw index value.
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

/// GC generation, youngest first. Objects are promoted one step per
/// surviving collection; Permanent objects are immortal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Generation {
    Eden = 0,
    Young = 1,
    Old = 2,
    Permanent = 3,
}

impl Generation {
    pub(crate) const ALL: [Self; 4] = [Self::Eden, Self::Young, Self::Old, Self::Permanent];

    #[inline]
    pub(crate) fn index(self) -> usize {
        self as usize
    }

    #[inline]
    pub(crate) fn next(self) -> Option<Self> {
        match self {
            Self::Eden => Some(Self::Young),
            Self::Young => Some(Self::Old),
            Self::Old => Some(Self::Permanent),
            Self::Permanent => None,
        }
    }
}

/// Shared header of every heap object.
#[derive(Debug)]
pub(crate) struct ObjHeader {
    /// The object's class, when it has one (instances, classes, and the
    /// built-in kinds once the core classes exist).
    pub class: Option<HeapId>,
    pub generation: Generation,
    pub is_marked: bool,
    /// Size currently charged to this object's generation byte counter.
    accounted_size: usize,
}

/// A heap object: header plus kind payload.
#[derive(Debug)]
pub(crate) struct Obj {
    pub header: ObjHeader,
    pub data: ObjData,
}

/// Per-generation bookkeeping.
#[derive(Debug)]
struct GenerationHeap {
    objects: Vec<HeapId>,
    bytes_allocated: usize,
    heap_size: usize,
    remembered: AHashSet<HeapId>,
}

/// Point-in-time heap statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapStats {
    /// Live objects across all generations.
    pub live_objects: usize,
    /// Recycled slots available for reuse.
    pub free_slots: usize,
    /// Live object count per kind name.
    pub objects_by_type: BTreeMap<&'static str, usize>,
    /// Allocated bytes per generation, Eden first.
    pub bytes_by_generation: [usize; 4],
    /// Interned string count.
    pub interned_strings: usize,
}

/// The arena, the intern table, and the collector state.
#[derive(Debug)]
pub(crate) struct Heap {
    slots: Vec<Option<Obj>>,
    free_slots: Vec<usize>,
    generations: [GenerationHeap; 4],
    gray_stack: Vec<HeapId>,
    strings: InternTable,
    allocation_generation: Generation,
    growth_factor: usize,
    log_gc: bool,
    /// Bumped whenever a slot is freed; property caches validate against it.
    reuse_epoch: u64,
}

impl Heap {
    pub fn new(config: VmConfig) -> Self {
        let sizes = [
            config.gc_eden_heap_size,
            config.gc_young_heap_size,
            config.gc_old_heap_size,
            config.gc_heap_size,
        ];
        Self {
            slots: Vec::new(),
            free_slots: Vec::new(),
            generations: sizes.map(|heap_size| GenerationHeap {
                objects: Vec::new(),
                bytes_allocated: 0,
                heap_size,
                remembered: AHashSet::new(),
            }),
            gray_stack: Vec::new(),
            strings: InternTable::default(),
            allocation_generation: Generation::Eden,
            growth_factor: config.gc_growth_factor.max(2),
            log_gc: config.log_gc,
            reuse_epoch: 0,
        }
    }

    /// Switches where new objects are born. The VM parks this at Permanent
    /// while bootstrapping the core classes, then drops back to Eden.
    pub fn set_allocation_generation(&mut self, generation: Generation) {
        self.allocation_generation = generation;
    }

    #[inline]
    pub fn allocation_generation(&self) -> Generation {
        self.allocation_generation
    }

    #[inline]
    pub fn reuse_epoch(&self) -> u64 {
        self.reuse_epoch
    }

    // === Allocation ===

    /// Allocates an object in the current allocation generation. Does not
    /// collect; the VM checks pressure before calling.
    pub fn allocate(&mut self, data: ObjData, class: Option<HeapId>) -> HeapId {
        let generation = self.allocation_generation;
        let size = data.size_estimate();
        let obj = Obj {
            header: ObjHeader {
                class,
                generation,
                is_marked: false,
                accounted_size: size,
            },
            data,
        };
        let id = if let Some(index) = self.free_slots.pop() {
            self.slots[index] = Some(obj);
            HeapId(index)
        } else {
            self.slots.push(Some(obj));
            HeapId(self.slots.len() - 1)
        };
        let heap = &mut self.generations[generation.index()];
        heap.bytes_allocated += size;
        heap.objects.push(id);
        id
    }

    /// Returns the oldest generation over its threshold, if any.
    pub fn pressure(&self) -> Option<Generation> {
        for generation in Generation::ALL.iter().rev() {
            let heap = &self.generations[generation.index()];
            if heap.bytes_allocated > heap.heap_size {
                return Some(*generation);
            }
        }
        None
    }

    // === String interning ===

    /// Interns a string by copying. Equal content always yields the same id.
    pub fn copy_string(&mut self, chars: &str) -> HeapId {
        let hash = fnv1a(chars.as_bytes());
        if let Some(id) = self.strings.find(&self.slots, hash, chars) {
            return id;
        }
        let id = self.allocate(
            ObjData::String(EmberStr { chars: chars.into(), hash }),
            None,
        );
        self.strings.insert(&self.slots, id);
        id
    }

    /// Interns a string, taking ownership of the buffer.
    pub fn take_string(&mut self, chars: String) -> HeapId {
        let hash = fnv1a(chars.as_bytes());
        if let Some(id) = self.strings.find(&self.slots, hash, &chars) {
            return id;
        }
        let id = self.allocate(
            ObjData::String(EmberStr { chars: chars.into_boxed_str(), hash }),
            None,
        );
        self.strings.insert(&self.slots, id);
        id
    }

    /// Looks up an interned string without allocating.
    pub fn find_string(&self, chars: &str) -> Option<HeapId> {
        self.strings.find(&self.slots, fnv1a(chars.as_bytes()), chars)
    }

    pub fn interned_count(&self) -> usize {
        self.strings.len()
    }

    // === Accessors ===

    pub fn header(&self, id: HeapId) -> &ObjHeader {
        &self.obj(id).header
    }

    pub fn set_class(&mut self, id: HeapId, class: HeapId) {
        self.obj_mut(id).header.class = Some(class);
    }

    pub fn data(&self, id: HeapId) -> &ObjData {
        &self.obj(id).data
    }

    pub fn data_mut(&mut self, id: HeapId) -> &mut ObjData {
        &mut self.obj_mut(id).data
    }

    fn obj(&self, id: HeapId) -> &Obj {
        self.slots[id.0].as_ref().expect("use of freed heap object")
    }

    fn obj_mut(&mut self, id: HeapId) -> &mut Obj {
        self.slots[id.0].as_mut().expect("use of freed heap object")
    }

    pub fn string(&self, id: HeapId) -> &EmberStr {
        match self.data(id) {
            ObjData::String(s) => s,
            other => panic!("expected String, found {}", other.kind_name()),
        }
    }

    pub fn string_value(&self, id: HeapId) -> &str {
        self.string(id).as_str()
    }

    pub fn function(&self, id: HeapId) -> &Function {
        match self.data(id) {
            ObjData::Function(f) => f,
            other => panic!("expected Function, found {}", other.kind_name()),
        }
    }

    pub fn function_mut(&mut self, id: HeapId) -> &mut Function {
        match self.data_mut(id) {
            ObjData::Function(f) => f,
            other => panic!("expected Function, found {}", other.kind_name()),
        }
    }

    pub fn closure(&self, id: HeapId) -> &Closure {
        match self.data(id) {
            ObjData::Closure(c) => c,
            other => panic!("expected Closure, found {}", other.kind_name()),
        }
    }

    pub fn upvalue(&self, id: HeapId) -> &Upvalue {
        match self.data(id) {
            ObjData::Upvalue(u) => u,
            other => panic!("expected Upvalue, found {}", other.kind_name()),
        }
    }

    pub fn upvalue_mut(&mut self, id: HeapId) -> &mut Upvalue {
        match self.data_mut(id) {
            ObjData::Upvalue(u) => u,
            other => panic!("expected Upvalue, found {}", other.kind_name()),
        }
    }

    pub fn class(&self, id: HeapId) -> &Class {
        match self.data(id) {
            ObjData::Class(c) => c,
            other => panic!("expected Class, found {}", other.kind_name()),
        }
    }

    pub fn class_mut(&mut self, id: HeapId) -> &mut Class {
        match self.data_mut(id) {
            ObjData::Class(c) => c,
            other => panic!("expected Class, found {}", other.kind_name()),
        }
    }

    pub fn instance(&self, id: HeapId) -> &Instance {
        match self.data(id) {
            ObjData::Instance(i) => i,
            other => panic!("expected Instance, found {}", other.kind_name()),
        }
    }

    pub fn instance_mut(&mut self, id: HeapId) -> &mut Instance {
        match self.data_mut(id) {
            ObjData::Instance(i) => i,
            other => panic!("expected Instance, found {}", other.kind_name()),
        }
    }

    pub fn array(&self, id: HeapId) -> &Array {
        match self.data(id) {
            ObjData::Array(a) => a,
            other => panic!("expected Array, found {}", other.kind_name()),
        }
    }

    pub fn array_mut(&mut self, id: HeapId) -> &mut Array {
        match self.data_mut(id) {
            ObjData::Array(a) => a,
            other => panic!("expected Array, found {}", other.kind_name()),
        }
    }

    pub fn dict(&self, id: HeapId) -> &Dict {
        match self.data(id) {
            ObjData::Dictionary(d) => d,
            other => panic!("expected Dictionary, found {}", other.kind_name()),
        }
    }

    pub fn dict_mut(&mut self, id: HeapId) -> &mut Dict {
        match self.data_mut(id) {
            ObjData::Dictionary(d) => d,
            other => panic!("expected Dictionary, found {}", other.kind_name()),
        }
    }

    pub fn namespace(&self, id: HeapId) -> &Namespace {
        match self.data(id) {
            ObjData::Namespace(n) => n,
            other => panic!("expected Namespace, found {}", other.kind_name()),
        }
    }

    pub fn namespace_mut(&mut self, id: HeapId) -> &mut Namespace {
        match self.data_mut(id) {
            ObjData::Namespace(n) => n,
            other => panic!("expected Namespace, found {}", other.kind_name()),
        }
    }

    pub fn module_mut(&mut self, id: HeapId) -> &mut Module {
        match self.data_mut(id) {
            ObjData::Module(m) => m,
            other => panic!("expected Module, found {}", other.kind_name()),
        }
    }

    pub fn generator(&self, id: HeapId) -> &Generator {
        match self.data(id) {
            ObjData::Generator(g) => g,
            other => panic!("expected Generator, found {}", other.kind_name()),
        }
    }

    pub fn generator_mut(&mut self, id: HeapId) -> &mut Generator {
        match self.data_mut(id) {
            ObjData::Generator(g) => g,
            other => panic!("expected Generator, found {}", other.kind_name()),
        }
    }

    pub fn frame(&self, id: HeapId) -> &SavedFrame {
        match self.data(id) {
            ObjData::Frame(f) => f,
            other => panic!("expected Frame, found {}", other.kind_name()),
        }
    }

    pub fn frame_mut(&mut self, id: HeapId) -> &mut SavedFrame {
        match self.data_mut(id) {
            ObjData::Frame(f) => f,
            other => panic!("expected Frame, found {}", other.kind_name()),
        }
    }

    pub fn promise(&self, id: HeapId) -> &Promise {
        match self.data(id) {
            ObjData::Promise(p) => p,
            other => panic!("expected Promise, found {}", other.kind_name()),
        }
    }

    pub fn promise_mut(&mut self, id: HeapId) -> &mut Promise {
        match self.data_mut(id) {
            ObjData::Promise(p) => p,
            other => panic!("expected Promise, found {}", other.kind_name()),
        }
    }

    // === Write barrier ===

    /// Records a cross-generation reference. Must run before any
    /// reference-storing field write where `owner` may be older than the
    /// value it now points to.
    pub fn write_barrier(&mut self, owner: HeapId, value: Value) {
        let Value::Obj(target) = value else { return };
        let owner_generation = self.header(owner).generation;
        let target_generation = self.header(target).generation;
        if owner_generation > target_generation {
            self.generations[target_generation.index()]
                .remembered
                .insert(owner);
        }
    }

    // === Mark phase ===

    /// Marks an object relative to the collected generation: older or
    /// already-marked objects are skipped.
    pub fn mark_object(&mut self, id: HeapId, generation: Generation) {
        let header = &mut self.obj_mut(id).header;
        if header.generation > generation || header.is_marked {
            return;
        }
        header.is_marked = true;
        self.gray_stack.push(id);
    }

    pub fn mark_value(&mut self, value: Value, generation: Generation) {
        if let Value::Obj(id) = value {
            self.mark_object(id, generation);
        }
    }

    /// Scans the collected generation's remembered set: the recorded older
    /// objects are not themselves markable (their generation is above the
    /// guard) but their children inside the collected range must survive.
    pub fn mark_remembered_set(&mut self, generation: Generation) {
        let entries: Vec<HeapId> = self.generations[generation.index()]
            .remembered
            .iter()
            .copied()
            .collect();
        for id in entries {
            if self.slots[id.0].is_some() {
                self.mark_children(id, generation);
            }
        }
    }

    /// Drains the gray stack, marking children of each grayed object.
    pub fn trace_references(&mut self, generation: Generation) {
        while let Some(id) = self.gray_stack.pop() {
            self.mark_children(id, generation);
        }
    }

    fn mark_children(&mut self, id: HeapId, generation: Generation) {
        let children = self.children(id);
        for child in children {
            self.mark_value(child, generation);
        }
    }

    /// Collects every reference held by an object, header class included.
    fn children(&self, id: HeapId) -> SmallVec<[Value; 8]> {
        let obj = self.obj(id);
        let mut out: SmallVec<[Value; 8]> = SmallVec::new();
        let mut push_id = |out: &mut SmallVec<[Value; 8]>, id: HeapId| out.push(Value::Obj(id));
        if let Some(class) = obj.header.class {
            push_id(&mut out, class);
        }
        match &obj.data {
            ObjData::String(_) | ObjData::Range(_) => {}
            ObjData::Function(f) => {
                if let Some(name) = f.name {
                    push_id(&mut out, name);
                }
                out.extend(f.chunk.constants().iter().copied());
            }
            ObjData::Closure(c) => {
                push_id(&mut out, c.function);
                for &upvalue in &c.upvalues {
                    push_id(&mut out, upvalue);
                }
                if let Some(namespace) = c.namespace {
                    push_id(&mut out, namespace);
                }
            }
            ObjData::Upvalue(u) => {
                if let Upvalue::Closed(value) = u {
                    out.push(*value);
                }
            }
            ObjData::Class(c) => {
                push_id(&mut out, c.name);
                push_id(&mut out, c.full_name);
                if let Some(superclass) = c.superclass {
                    push_id(&mut out, superclass);
                }
                if let Some(namespace) = c.namespace {
                    push_id(&mut out, namespace);
                }
                for &t in &c.traits {
                    push_id(&mut out, t);
                }
                for (&name, &method) in &c.methods {
                    push_id(&mut out, name);
                    out.push(method);
                }
                for &name in c.field_indexes.keys() {
                    push_id(&mut out, name);
                }
                out.extend(c.default_fields.iter().copied());
            }
            ObjData::Instance(i) => out.extend(i.fields.iter().copied()),
            ObjData::BoundMethod(b) => {
                out.push(b.receiver);
                out.push(b.method);
            }
            ObjData::NativeFunction(n) => push_id(&mut out, n.name),
            ObjData::NativeMethod(n) => {
                push_id(&mut out, n.name);
                push_id(&mut out, n.class);
            }
            ObjData::Array(a) => out.extend(a.elements.iter().copied()),
            ObjData::Dictionary(d) => {
                for (key, value) in d.iter() {
                    out.push(key);
                    out.push(value);
                }
            }
            ObjData::Namespace(n) => {
                push_id(&mut out, n.short_name);
                push_id(&mut out, n.full_name);
                if let Some(parent) = n.parent {
                    push_id(&mut out, parent);
                }
                for (&name, &value) in &n.values {
                    push_id(&mut out, name);
                    out.push(value);
                }
            }
            ObjData::Module(m) => {
                push_id(&mut out, m.path);
                if let Some(closure) = m.closure {
                    push_id(&mut out, closure);
                }
                for (&name, &value) in m.val_fields.iter().chain(m.var_fields.iter()) {
                    push_id(&mut out, name);
                    out.push(value);
                }
            }
            ObjData::Generator(g) => {
                push_id(&mut out, g.frame);
                if let Some(outer) = g.outer {
                    push_id(&mut out, outer);
                }
                if let Some(inner) = g.inner {
                    push_id(&mut out, inner);
                }
                out.push(g.value);
            }
            ObjData::Frame(f) => {
                push_id(&mut out, f.closure);
                out.extend(f.slots.iter().copied());
                for handler in &f.handlers {
                    if let Some(class) = handler.class {
                        push_id(&mut out, class);
                    }
                }
            }
            ObjData::Promise(p) => {
                out.push(p.value);
                if let Some(exception) = p.exception {
                    push_id(&mut out, exception);
                }
                out.push(p.executor);
                for (&name, &value) in &p.captures {
                    push_id(&mut out, name);
                    out.push(value);
                }
                for reaction in &p.reactions {
                    out.push(reaction.on_fulfilled);
                    out.push(reaction.on_rejected);
                }
            }
            ObjData::Exception(e) => {
                push_id(&mut out, e.message);
                push_id(&mut out, e.stacktrace);
            }
        }
        out
    }

    // === Sweep phase ===

    /// Removes intern-table entries whose string is about to be swept.
    pub fn remove_white_strings(&mut self, generation: Generation) {
        self.strings.remove_unmarked(&self.slots, generation);
    }

    /// Sweeps one generation: marked objects are promoted, the rest freed.
    /// The Permanent generation is never swept.
    pub fn sweep(&mut self, generation: Generation) -> (usize, usize) {
        let Some(next) = generation.next() else {
            return (0, 0);
        };
        let objects = std::mem::take(&mut self.generations[generation.index()].objects);
        let mut freed_bytes = 0usize;
        let mut promoted_bytes = 0usize;
        for id in objects {
            let marked = self.obj(id).header.is_marked;
            if marked {
                let size = self.obj(id).data.size_estimate();
                let header = &mut self.obj_mut(id).header;
                header.is_marked = false;
                let old_size = header.accounted_size;
                header.accounted_size = size;
                header.generation = next;
                self.generations[generation.index()].bytes_allocated = self.generations
                    [generation.index()]
                .bytes_allocated
                .saturating_sub(old_size);
                self.generations[next.index()].bytes_allocated += size;
                self.generations[next.index()].objects.push(id);
                promoted_bytes += size;
            } else {
                let obj = self.slots[id.0].take().expect("sweeping a freed slot");
                self.generations[generation.index()].bytes_allocated = self.generations
                    [generation.index()]
                .bytes_allocated
                .saturating_sub(obj.header.accounted_size);
                freed_bytes += obj.header.accounted_size;
                self.free_slots.push(id.0);
                self.reuse_epoch += 1;
                drop(obj);
            }
        }
        (freed_bytes, promoted_bytes)
    }

    /// Moves surviving remembered-set entries one generation up and clears
    /// the collected generation's set. Old and Permanent sets are left
    /// alone, matching the original collector.
    pub fn process_remembered_set(&mut self, generation: Generation) {
        if generation >= Generation::Old {
            return;
        }
        let next = generation.index() + 1;
        let entries = std::mem::take(&mut self.generations[generation.index()].remembered);
        for id in entries {
            if self.slots[id.0].is_none() {
                continue;
            }
            if self.header(id).generation.index() > next {
                self.generations[next].remembered.insert(id);
            }
        }
    }

    /// Grows a generation's threshold after a collection that left it more
    /// than half full.
    pub fn adjust_threshold(&mut self, generation: Generation) {
        let heap = &mut self.generations[generation.index()];
        if heap.bytes_allocated > heap.heap_size / 2 {
            heap.heap_size = heap.bytes_allocated * self.growth_factor;
            if self.log_gc {
                tracing::debug!(
                    generation = ?generation,
                    heap_size = heap.heap_size,
                    "gc threshold grown"
                );
            }
        }
    }

    pub fn bytes_allocated(&self, generation: Generation) -> usize {
        self.generations[generation.index()].bytes_allocated
    }

    pub fn log_gc(&self) -> bool {
        self.log_gc
    }

    // === Display and stats ===

    /// Renders an object the way `print` shows it.
    pub fn display_object(&self, id: HeapId) -> String {
        self.display_object_depth(id, 0)
    }

    fn display_value_depth(&self, value: Value, depth: usize) -> String {
        match value {
            Value::Obj(id) => self.display_object_depth(id, depth),
            other => other.display(self),
        }
    }

    fn display_object_depth(&self, id: HeapId, depth: usize) -> String {
        if depth > 4 {
            return "...".to_owned();
        }
        match self.data(id) {
            ObjData::String(s) => s.as_str().to_owned(),
            ObjData::Function(f) => match f.name {
                Some(name) => format!("<fn {}>", self.string_value(name)),
                None => "<script>".to_owned(),
            },
            ObjData::Closure(c) => self.display_object_depth(c.function, depth + 1),
            ObjData::Upvalue(_) => "<upvalue>".to_owned(),
            ObjData::Class(c) => match c.behavior {
                crate::object::BehaviorType::Trait => {
                    format!("<trait {}>", self.string_value(c.name))
                }
                _ => format!("<class {}>", self.string_value(c.name)),
            },
            ObjData::Instance(_) => {
                let class_name = self
                    .header(id)
                    .class
                    .map_or("?", |class| self.string_value(self.class(class).name));
                format!("<{class_name} instance>")
            }
            ObjData::BoundMethod(b) => self.display_value_depth(b.method, depth + 1),
            ObjData::NativeFunction(n) => format!("<native fn {}>", self.string_value(n.name)),
            ObjData::NativeMethod(n) => format!("<native method {}>", self.string_value(n.name)),
            ObjData::Array(a) => {
                let elements: Vec<String> = a
                    .elements
                    .iter()
                    .map(|&e| self.display_value_depth(e, depth + 1))
                    .collect();
                format!("[{}]", elements.join(", "))
            }
            ObjData::Dictionary(d) => {
                if d.len() == 0 {
                    return "[:]".to_owned();
                }
                let entries: Vec<String> = d
                    .iter()
                    .map(|(k, v)| {
                        format!(
                            "{}: {}",
                            self.display_value_depth(k, depth + 1),
                            self.display_value_depth(v, depth + 1)
                        )
                    })
                    .collect();
                format!("[{}]", entries.join(", "))
            }
            ObjData::Range(r) => format!("{}..{}", r.start, r.end),
            ObjData::Namespace(n) => format!("<namespace {}>", self.string_value(n.full_name)),
            ObjData::Module(m) => format!("<module {}>", self.string_value(m.path)),
            ObjData::Generator(_) => "<generator>".to_owned(),
            ObjData::Frame(_) => "<frame>".to_owned(),
            ObjData::Promise(_) => "<promise>".to_owned(),
            ObjData::Exception(e) => format!("<exception {}>", self.string_value(e.message)),
        }
    }

    pub fn stats(&self) -> HeapStats {
        let mut objects_by_type: BTreeMap<&'static str, usize> = BTreeMap::new();
        let mut live_objects = 0;
        for obj in self.slots.iter().flatten() {
            live_objects += 1;
            *objects_by_type.entry(obj.data.kind_name()).or_insert(0) += 1;
        }
        HeapStats {
            live_objects,
            free_slots: self.free_slots.len(),
            objects_by_type,
            bytes_by_generation: [
                self.bytes_allocated(Generation::Eden),
                self.bytes_allocated(Generation::Young),
                self.bytes_allocated(Generation::Old),
                self.bytes_allocated(Generation::Permanent),
            ],
            interned_strings: self.interned_count(),
        }
    }

    /// Whether an object is still live, for tests that probe GC behavior.
    #[cfg(test)]
    pub fn is_live(&self, id: HeapId) -> bool {
        self.slots[id.0].is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_heap() -> Heap {
        Heap::new(VmConfig::default())
    }

    #[test]
    fn interning_returns_identical_ids_for_equal_content() {
        let mut heap = test_heap();
        let a = heap.copy_string("foobar");
        let b = heap.copy_string("foobar");
        let c = heap.take_string("foo".to_owned() + "bar");
        assert_eq!(a, b);
        assert_eq!(a, c);
        let other = heap.copy_string("different");
        assert_ne!(a, other);
    }

    #[test]
    fn unreached_objects_are_freed_and_slots_recycled() {
        let mut heap = test_heap();
        let live = heap.copy_string("keep me");
        let dead = heap.allocate(ObjData::Array(Array::default()), None);
        heap.mark_object(live, Generation::Eden);
        heap.trace_references(Generation::Eden);
        heap.remove_white_strings(Generation::Eden);
        heap.sweep(Generation::Eden);
        assert!(heap.is_live(live));
        assert!(!heap.is_live(dead));
        assert_eq!(heap.header(live).generation, Generation::Young);
        // The freed slot is reused by the next allocation.
        let reused = heap.allocate(ObjData::Array(Array::default()), None);
        assert_eq!(reused.index(), dead.index());
    }

    #[test]
    fn marked_objects_promote_one_generation_per_cycle() {
        let mut heap = test_heap();
        let id = heap.copy_string("survivor");
        for expected in [Generation::Young, Generation::Old, Generation::Permanent] {
            let generation = heap.header(id).generation;
            heap.mark_object(id, generation);
            heap.trace_references(generation);
            heap.remove_white_strings(generation);
            heap.sweep(generation);
            assert_eq!(heap.header(id).generation, expected);
        }
        // Permanent is never swept; the object stays put.
        heap.sweep(Generation::Permanent);
        assert!(heap.is_live(id));
    }

    #[test]
    fn write_barrier_records_old_to_young_references() {
        let mut heap = test_heap();
        heap.set_allocation_generation(Generation::Old);
        let owner = heap.allocate(ObjData::Array(Array::default()), None);
        heap.set_allocation_generation(Generation::Eden);
        let young = heap.copy_string("young");
        heap.write_barrier(owner, Value::Obj(young));
        assert!(heap.generations[Generation::Eden.index()].remembered.contains(&owner));
        // Same-generation stores do not get recorded.
        let young2 = heap.copy_string("young2");
        heap.write_barrier(young, Value::Obj(young2));
        assert!(!heap.generations[Generation::Eden.index()].remembered.contains(&young));
    }

    #[test]
    fn remembered_set_keeps_young_children_alive() {
        let mut heap = test_heap();
        heap.set_allocation_generation(Generation::Old);
        let owner = heap.allocate(ObjData::Array(Array::default()), None);
        heap.set_allocation_generation(Generation::Eden);
        let young = heap.copy_string("pointee");
        heap.write_barrier(owner, Value::Obj(young));
        match heap.data_mut(owner) {
            ObjData::Array(a) => a.elements.push(Value::Obj(young)),
            _ => unreachable!(),
        }
        // Collect Eden with no stack roots at all: only the remembered set
        // keeps the young string alive.
        heap.mark_remembered_set(Generation::Eden);
        heap.trace_references(Generation::Eden);
        heap.remove_white_strings(Generation::Eden);
        heap.sweep(Generation::Eden);
        assert!(heap.is_live(young));
        assert_eq!(heap.header(young).generation, Generation::Young);
    }

    #[test]
    fn dead_strings_leave_the_intern_table() {
        let mut heap = test_heap();
        let doomed = heap.copy_string("ephemeral");
        assert_eq!(heap.interned_count(), 1);
        heap.remove_white_strings(Generation::Eden);
        heap.sweep(Generation::Eden);
        assert!(!heap.is_live(doomed));
        assert_eq!(heap.interned_count(), 0);
        // Interning the same text again must produce a fresh object, not a
        // dangling id.
        let fresh = heap.copy_string("ephemeral");
        assert!(heap.is_live(fresh));
    }
}
