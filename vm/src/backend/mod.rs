//! Output backends.
//!
//! The session resolves every dependency of a constant before handing it
//! to the backend, so a backend only ever emits one value at a time and
//! never calls back into the session.

mod aot;
mod dynamic;

use std::sync::Arc;

use jolt_object::ObjectRef;
use serde::{Deserialize, Serialize};

pub use aot::AotBackend;
pub use dynamic::{CallSiteCache, DynamicBackend, StringObject};

use crate::class::{ClassTable, RuntimeClass};
use crate::config::Mode;
use crate::constant::ConstRef;
use crate::error::Result;
use crate::fatal;
use crate::image::NativeImage;
use crate::interner::Utf8;
use crate::module::AotModule;
use crate::vtable::VirtualTable;

/// A value stored into instance or static storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldValue {
    pub offset: u32,
    pub width: u8,
    pub value: ConstRef,
}

/// Element storage of a final array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArrayElements {
    References(Vec<ConstRef>),
    Bytes(Vec<u8>),
}

/// A constant with its dependencies already materialized.
pub enum Payload<'a> {
    Utf8(&'a Arc<Utf8>),
    String {
        text: &'a str,
        utf8: ConstRef,
        /// Resident header words for dynamic string objects.
        class: usize,
        vtable: usize,
    },
    ConstantPool {
        len: u32,
    },
    CallSite {
        class: ConstRef,
        name: ConstRef,
        descriptor: ConstRef,
    },
    StaticInstance {
        class: &'a RuntimeClass,
        class_ref: ConstRef,
        size: usize,
        fields: Vec<FieldValue>,
    },
    Method {
        class: ConstRef,
        image: &'a Arc<NativeImage>,
        position: usize,
    },
    NativeFunction {
        class: &'a RuntimeClass,
        index: usize,
    },
}

/// The reachable contents of a final object.
pub enum ObjectPayload {
    Instance {
        class: ConstRef,
        size: u32,
        fields: Vec<FieldValue>,
    },
    Array {
        class: ConstRef,
        length: u32,
        elements: ArrayElements,
    },
}

/// Rollback point; only meaningful to the backend that produced it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Checkpoint {
    pub(crate) cells: usize,
    pub(crate) symbols: usize,
    pub(crate) classes: usize,
    pub(crate) arrays: usize,
    pub(crate) strings: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Emitted {
    pub cells: usize,
    pub bytes: u64,
}

/// Turns resolved constants into references of one output mode.
pub trait Backend: Send {
    fn mode(&self) -> Mode;

    /// Handle for a class whose image is about to be built.
    fn reserve_class(&mut self, class: &Arc<RuntimeClass>) -> Result<ConstRef>;

    fn materialize_class(
        &mut self,
        class: &Arc<RuntimeClass>,
        handle: ConstRef,
        image: NativeImage,
    ) -> Result<Arc<NativeImage>>;

    fn materialize_constant(&mut self, payload: Payload<'_>) -> Result<ConstRef>;

    fn materialize_vtable(&mut self, vtable: &VirtualTable, classes: &ClassTable)
    -> Result<ConstRef>;

    /// Reference to the compiled body of a method, `Null` when abstract.
    fn code_ref(&mut self, class: &RuntimeClass, index: usize) -> Result<ConstRef>;

    fn loader_ref(&mut self, class: &RuntimeClass) -> Result<ConstRef>;

    fn reserve_object(&mut self, obj: ObjectRef) -> Result<ConstRef>;

    fn materialize_object(&mut self, handle: ConstRef, payload: ObjectPayload) -> Result<()>;

    fn checkpoint(&self) -> Checkpoint;

    fn rollback(&mut self, checkpoint: Checkpoint);

    fn emitted(&self) -> Emitted;

    fn finish(self: Box<Self>) -> Option<AotModule>;
}

/// External symbol of a method body.
pub fn mangle(class: &str, name: &str, descriptor: &str) -> String {
    let mut out = String::from("jolt_");
    escape_into(&mut out, class);
    out.push('_');
    escape_into(&mut out, name);
    out.push_str("__");
    escape_into(&mut out, descriptor);
    out
}

fn escape_into(out: &mut String, part: &str) {
    for c in part.chars() {
        match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' => out.push(c),
            '/' => out.push('_'),
            '_' => out.push_str("_1"),
            ';' => out.push_str("_2"),
            '[' => out.push_str("_3"),
            _ => out.push_str(&format!("_0{:04x}", c as u32)),
        }
    }
}

pub fn loader_symbol(module: &str) -> String {
    let mut out = String::from("jolt_");
    escape_into(&mut out, module);
    out.push_str("__loader_init");
    out
}

/// Writes a resident value into raw storage.
///
/// # Safety
///
/// `base + offset .. + width` must be writable.
pub(crate) unsafe fn store(base: *mut u8, field: &FieldValue) {
    let width = field.width as usize;
    let bytes = match field.value {
        ConstRef::Scalar(scalar) => scalar.to_bytes(width),
        other => match other.resident_addr() {
            Some(addr) => (addr as u64).to_le_bytes()[..width.min(8)].to_vec(),
            None => fatal!("storing unrelocated {other:?} into resident memory"),
        },
    };
    unsafe {
        std::ptr::copy_nonoverlapping(
            bytes.as_ptr(),
            base.add(field.offset as usize),
            bytes.len(),
        );
    }
}
