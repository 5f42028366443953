//! Object arena for heap-allocated runtime values.
//!
//! Heap objects are stored in a slab of slots addressed by [`HeapId`]. Freed
//! slots are recycled through a free list, which doubles as the recycling pool
//! for ephemeral objects (iterators, ranges, function snapshots, exception
//! values): a hot loop that allocates and abandons an iterator per pass keeps
//! reusing the same few slots.
//!
//! Collection is mark-and-sweep, triggered at VM safepoints once enough
//! allocations have happened since the previous sweep. Roots are the globals
//! vector, the operand stack, and every frame's local slots; at a safepoint no
//! live value exists anywhere else.

use ahash::AHashMap;
use indexmap::IndexMap;

use crate::intern::StringId;
use crate::scope::{FunctionId, IntrinsicId, StructId};
use crate::value::Value;

/// Handle to an object in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapId(u32);

impl HeapId {
    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// A user struct instance: its blueprint plus named fields.
///
/// Fields keep declaration order (`IndexMap`) so display output and field
/// iteration are deterministic.
#[derive(Debug, Clone)]
pub(crate) struct Instance {
    pub struct_id: StructId,
    /// Interned struct name, kept here so display does not need the registry.
    pub name: StringId,
    pub fields: IndexMap<StringId, Value>,
}

/// A host-provided object exposing a fixed method table and field map.
#[derive(Debug, Clone)]
pub(crate) struct Wrapper {
    pub type_name: StringId,
    pub fields: IndexMap<StringId, Value>,
    /// Method name (plain, unmangled) to native delegate.
    pub methods: AHashMap<StringId, IntrinsicId>,
}

/// Cursor state for a non-restartable iterator.
#[derive(Debug, Clone)]
pub(crate) enum IterState {
    /// Index-based iteration over a list.
    List { list: HeapId, index: usize, done: bool },
    /// Inclusive range iteration; `current` is the next value to yield.
    Range { current: i64, end: i64, done: bool },
}

/// Heap object payloads.
#[derive(Debug, Clone)]
pub(crate) enum HeapData {
    /// Immutable character sequence produced at runtime (literals stay
    /// interned as `Value::Str`).
    Str(String),
    /// Ordered mutable sequence.
    List(Vec<Value>),
    /// Inclusive numeric range `[start, end]`.
    Range { start: i64, end: i64 },
    Iter(IterState),
    /// A function snapshot (named function reference or lambda).
    Function(FunctionId),
    Instance(Instance),
    /// A receiver paired with a method, from `instance.method` without a call.
    BoundMethod { receiver: Value, func: FunctionId },
    /// A script-thrown exception: message plus the thrown value.
    Exception { message: String, payload: Option<Value> },
    Wrapper(Wrapper),
    /// Shared mutable cell backing a by-ref parameter slot.
    Cell(Value),
}

/// Allocations between collections before the next safepoint sweeps.
const GC_THRESHOLD: usize = 4096;

/// Slab arena with free-list recycling and mark-and-sweep collection.
#[derive(Debug, Default)]
pub(crate) struct Heap {
    slots: Vec<Option<HeapData>>,
    free: Vec<u32>,
    marks: Vec<bool>,
    allocated_since_gc: usize,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, data: HeapData) -> HeapId {
        self.allocated_since_gc += 1;
        if let Some(slot) = self.free.pop() {
            self.slots[slot as usize] = Some(data);
            return HeapId(slot);
        }
        let slot = u32::try_from(self.slots.len()).expect("heap exceeded u32 slots");
        self.slots.push(Some(data));
        self.marks.push(false);
        HeapId(slot)
    }

    /// # Panics
    /// Panics if the id refers to a freed slot (a VM bug, not a user error).
    pub fn get(&self, id: HeapId) -> &HeapData {
        self.slots[id.index()].as_ref().expect("access to freed heap slot")
    }

    pub fn get_mut(&mut self, id: HeapId) -> &mut HeapData {
        self.slots[id.index()].as_mut().expect("access to freed heap slot")
    }

    /// Allocates a runtime string.
    pub fn alloc_str(&mut self, s: impl Into<String>) -> Value {
        Value::Ref(self.alloc(HeapData::Str(s.into())))
    }

    pub fn live_objects(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// True once enough allocation has happened to warrant a sweep.
    pub fn wants_collect(&self) -> bool {
        self.allocated_since_gc >= GC_THRESHOLD
    }

    /// Mark-and-sweep over the arena. `roots` yields every directly reachable
    /// value; reachability closes over list elements, instance and wrapper
    /// fields, iterator sources, bound-method receivers, exception payloads,
    /// and cells.
    pub fn collect<I>(&mut self, roots: I)
    where
        I: IntoIterator<Item = Value>,
    {
        self.marks.iter_mut().for_each(|m| *m = false);

        let mut worklist: Vec<HeapId> = roots
            .into_iter()
            .filter_map(|v| match v {
                Value::Ref(id) => Some(id),
                _ => None,
            })
            .collect();

        while let Some(id) = worklist.pop() {
            if self.marks[id.index()] {
                continue;
            }
            self.marks[id.index()] = true;
            let Some(data) = &self.slots[id.index()] else {
                continue;
            };
            trace_children(data, &mut worklist);
        }

        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_some() && !self.marks[index] {
                *slot = None;
                self.free.push(u32::try_from(index).expect("heap slot index fits u32"));
            }
        }
        self.allocated_since_gc = 0;
    }
}

fn trace_children(data: &HeapData, worklist: &mut Vec<HeapId>) {
    let mut push = |value: Value| {
        if let Value::Ref(id) = value {
            worklist.push(id);
        }
    };
    match data {
        HeapData::Str(_) | HeapData::Range { .. } | HeapData::Function(_) => {}
        HeapData::List(items) => items.iter().copied().for_each(push),
        HeapData::Iter(IterState::List { list, .. }) => worklist.push(*list),
        HeapData::Iter(IterState::Range { .. }) => {}
        HeapData::Instance(instance) => instance.fields.values().copied().for_each(push),
        HeapData::BoundMethod { receiver, .. } => push(*receiver),
        HeapData::Exception { payload, .. } => {
            if let Some(value) = payload {
                push(*value);
            }
        }
        HeapData::Wrapper(wrapper) => wrapper.fields.values().copied().for_each(push),
        HeapData::Cell(inner) => push(*inner),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_and_get() {
        let mut heap = Heap::new();
        let id = heap.alloc(HeapData::List(vec![Value::Int(1)]));
        match heap.get(id) {
            HeapData::List(items) => assert_eq!(items, &[Value::Int(1)]),
            other => panic!("unexpected heap data: {other:?}"),
        }
    }

    #[test]
    fn collect_frees_unreachable_and_recycles_slots() {
        let mut heap = Heap::new();
        let live = heap.alloc(HeapData::Str("keep".to_owned()));
        let dead = heap.alloc(HeapData::Str("drop".to_owned()));
        heap.collect([Value::Ref(live)]);
        assert_eq!(heap.live_objects(), 1);

        // The freed slot is recycled before the slab grows.
        let recycled = heap.alloc(HeapData::Str("new".to_owned()));
        assert_eq!(recycled, dead);
    }

    #[test]
    fn collect_traces_nested_structures() {
        let mut heap = Heap::new();
        let inner = heap.alloc(HeapData::Str("inner".to_owned()));
        let list = heap.alloc(HeapData::List(vec![Value::Ref(inner)]));
        let cell = heap.alloc(HeapData::Cell(Value::Ref(list)));
        heap.collect([Value::Ref(cell)]);
        assert_eq!(heap.live_objects(), 3);
    }
}
