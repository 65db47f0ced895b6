//! Virtual table construction.
//!
//! A vtable starts with [`HEADER_SLOTS`] fixed entries followed by one
//! entry per virtual method signature. A subclass table is a copy of its
//! parent's table, extended with newly introduced signatures; overriding
//! methods overwrite the inherited slot, so a slot number never changes
//! within the subtree that introduced it.

use ahash::AHashMap;
use jolt_object::{ARRAY_ELEMENTS_OFFSET, ObjectRef, POINTER_SIZE};
use serde::{Deserialize, Serialize};

use crate::class::{ClassId, CodePointer, RuntimeClass};
use crate::collector::RootVisitor;
use crate::fatal;
use crate::image::ImageKind;

pub const FINALIZER_SLOT: usize = 0;
pub const DELETER_SLOT: usize = 1;
pub const TRACER_SLOT: usize = 2;
pub const PRINTER_SLOT: usize = 3;
pub const HASHCODE_SLOT: usize = 4;
pub const HEADER_SLOTS: usize = 5;

/// A method of a class, by declaration index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodRef {
    pub class: ClassId,
    pub index: u16,
}

/// Runtime routines installed in the header slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Builtin {
    TraceInstance,
    TraceReferenceArray,
    TraceNothing,
    Print,
    IdentityHash,
}

pub type TraceFn = unsafe fn(ObjectRef, &mut RootVisitor<'_>);
pub type PrintFn = unsafe fn(ObjectRef) -> String;
pub type HashFn = unsafe fn(ObjectRef) -> u32;

impl Builtin {
    pub fn symbol(self) -> &'static str {
        match self {
            Self::TraceInstance => "jolt_trace_instance",
            Self::TraceReferenceArray => "jolt_trace_reference_array",
            Self::TraceNothing => "jolt_trace_nothing",
            Self::Print => "jolt_print_object",
            Self::IdentityHash => "jolt_identity_hash",
        }
    }

    pub fn from_symbol(symbol: &str) -> Option<Self> {
        [
            Self::TraceInstance,
            Self::TraceReferenceArray,
            Self::TraceNothing,
            Self::Print,
            Self::IdentityHash,
        ]
        .into_iter()
        .find(|b| b.symbol() == symbol)
    }

    /// In-process entry point.
    pub fn address(self) -> usize {
        match self {
            Self::TraceInstance => trace_instance as TraceFn as usize,
            Self::TraceReferenceArray => trace_reference_array as TraceFn as usize,
            Self::TraceNothing => trace_nothing as TraceFn as usize,
            Self::Print => print_object as PrintFn as usize,
            Self::IdentityHash => identity_hash as HashFn as usize,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotTarget {
    Null,
    Builtin(Builtin),
    Code(CodePointer),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VtSlot {
    /// The method this slot currently dispatches to, if any.
    pub method: Option<MethodRef>,
    pub target: SlotTarget,
}

impl VtSlot {
    const EMPTY: Self = Self {
        method: None,
        target: SlotTarget::Null,
    };

    fn builtin(builtin: Builtin) -> Self {
        Self {
            method: None,
            target: SlotTarget::Builtin(builtin),
        }
    }

    /// In-process word for a resident slot array.
    pub fn resident_word(&self) -> usize {
        match self.target {
            SlotTarget::Null => 0,
            SlotTarget::Builtin(builtin) => builtin.address(),
            SlotTarget::Code(code) => code.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VirtualTable {
    pub class: Option<ClassId>,
    slots: Vec<VtSlot>,
    by_signature: AHashMap<(String, String), usize>,
    /// Slot of each declared method, `None` for non-virtual ones.
    method_slots: Vec<Option<usize>>,
}

impl VirtualTable {
    /// The table of a class without a superclass, before its own methods.
    pub fn base(tracer: Builtin) -> Self {
        let mut slots = vec![VtSlot::EMPTY; HEADER_SLOTS];
        slots[TRACER_SLOT] = VtSlot::builtin(tracer);
        slots[PRINTER_SLOT] = VtSlot::builtin(Builtin::Print);
        slots[HASHCODE_SLOT] = VtSlot::builtin(Builtin::IdentityHash);
        Self {
            class: None,
            slots,
            by_signature: AHashMap::new(),
            method_slots: Vec::new(),
        }
    }

    pub fn build(class: &RuntimeClass, parent: Option<&VirtualTable>) -> Self {
        let mut table = match parent {
            Some(parent) => parent.clone(),
            None => Self::base(Builtin::TraceInstance),
        };
        table.class = Some(class.id);
        table.method_slots = vec![None; class.meta.methods.len()];

        for (index, method) in class.meta.methods.iter().enumerate() {
            if !method.is_virtual() {
                continue;
            }
            let slot = if method.is_finalizer() {
                FINALIZER_SLOT
            } else {
                let key = (method.name.clone(), method.descriptor.clone());
                match table.by_signature.get(&key) {
                    Some(&slot) => slot,
                    None => {
                        table.slots.push(VtSlot::EMPTY);
                        let slot = table.slots.len() - 1;
                        table.by_signature.insert(key, slot);
                        slot
                    }
                }
            };

            let target = match method.code {
                _ if method.is_finalizer() && (parent.is_none() || method.empty_body) => {
                    SlotTarget::Null
                }
                Some(code) if !method.is_abstract() => SlotTarget::Code(code),
                _ => SlotTarget::Null,
            };
            table.method_slots[index] = Some(slot);
            table.slots[slot] = VtSlot {
                method: Some(MethodRef {
                    class: class.id,
                    index: index as u16,
                }),
                target,
            };
        }

        if let Some(parent) = parent {
            table.assert_extends(parent, class);
        }
        log::trace!("vtable {}: {} slots", class.name(), table.slots.len());
        table
    }

    /// Prefix compatibility with the parent table.
    fn assert_extends(&self, parent: &VirtualTable, class: &RuntimeClass) {
        if self.slots.len() < parent.slots.len() {
            fatal!("vtable of {} shrank below its parent", class.name());
        }
        for (signature, slot) in &parent.by_signature {
            if self.by_signature.get(signature) != Some(slot) {
                fatal!(
                    "vtable of {} moved {}{} away from slot {slot}",
                    class.name(),
                    signature.0,
                    signature.1
                );
            }
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots(&self) -> &[VtSlot] {
        &self.slots
    }

    pub fn slot_of(&self, name: &str, descriptor: &str) -> Option<usize> {
        if name == "finalize" && descriptor == "()V" {
            return Some(FINALIZER_SLOT);
        }
        self.by_signature
            .get(&(name.to_string(), descriptor.to_string()))
            .copied()
    }

    pub fn method_slot(&self, index: usize) -> Option<usize> {
        self.method_slots.get(index).copied().flatten()
    }

    /// The target a call through `slot` reaches.
    pub fn dispatch(&self, slot: usize) -> SlotTarget {
        match self.slots.get(slot).map(|s| s.target) {
            Some(SlotTarget::Null) => fatal!("dispatch through null vtable slot {slot}"),
            Some(target) => target,
            None => fatal!("vtable slot {slot} out of range ({})", self.slots.len()),
        }
    }

    pub fn resident_words(&self) -> Box<[usize]> {
        self.slots.iter().map(VtSlot::resident_word).collect()
    }
}

/// Loads a slot from a live object's resident vtable.
///
/// # Safety
///
/// `obj` must be live, its vtable must be a resident slot array, and
/// `slot` must be within that array.
pub unsafe fn dispatch(obj: ObjectRef, slot: usize) -> usize {
    let vtable = obj.header().vtable();
    if vtable == 0 {
        fatal!("dispatch on {obj:?} without a vtable");
    }
    let entry = unsafe { *(vtable as *const usize).add(slot) };
    if entry == 0 {
        fatal!("dispatch through null vtable slot {slot} of {obj:?}");
    }
    entry
}

// ── builtins ───────────────────────────────────────────────────────

unsafe fn class_of<'a>(obj: ObjectRef) -> Option<&'a RuntimeClass> {
    let class = obj.header().class();
    if class == 0 {
        return None;
    }
    Some(unsafe { &*(class as *const RuntimeClass) })
}

unsafe fn visit_slot(slot: *mut u8, visitor: &mut RootVisitor<'_>) {
    let slot = slot as *mut usize;
    if unsafe { *slot } != 0 {
        visitor(slot);
    }
}

unsafe fn trace_instance(obj: ObjectRef, visitor: &mut RootVisitor<'_>) {
    let Some(class) = (unsafe { class_of(obj) }) else {
        return;
    };
    let Some(image) = class.image() else {
        fatal!("tracing instance of {} before its image exists", class.name());
    };
    if let ImageKind::Class(image) = &image.kind {
        for offset in &image.reference_offsets {
            unsafe { visit_slot(obj.field_ptr(*offset as usize), visitor) };
        }
    }
}

unsafe fn trace_reference_array(obj: ObjectRef, visitor: &mut RootVisitor<'_>) {
    let length = unsafe { obj.array_header() }.length();
    for i in 0..length {
        let slot = obj.field_ptr(ARRAY_ELEMENTS_OFFSET + i * POINTER_SIZE);
        unsafe { visit_slot(slot, visitor) };
    }
}

unsafe fn trace_nothing(_obj: ObjectRef, _visitor: &mut RootVisitor<'_>) {}

unsafe fn print_object(obj: ObjectRef) -> String {
    let name = unsafe { class_of(obj) }.map_or("<unknown>", RuntimeClass::name);
    format!("{name}@{:x}", unsafe { identity_hash(obj) })
}

unsafe fn identity_hash(obj: ObjectRef) -> u32 {
    let addr = obj.addr() as u64 >> 3;
    (addr ^ (addr >> 32)) as u32
}
