//! Structural layout of classes and call signatures.
//!
//! Everything here is computed lazily, once, and shared afterwards. A
//! computation may race with another thread computing the same entry; the
//! first result published wins and the loser's copy is dropped.

use std::sync::Arc;

use ahash::AHashMap;
use jolt_object::{ARRAY_ELEMENTS_OFFSET, HEADER_SIZE, POINTER_SIZE};
use parking_lot::RwLock;

use crate::class::{ClassId, ClassKind, ClassTable, PrimitiveType};
use crate::descriptor::{FieldType, MethodDescriptor};

/// Every object starts and ends on this boundary.
pub const OBJECT_ALIGN: usize = 8;
/// Each argument of a call buffer occupies one slot of this size.
pub const CALL_BUFFER_SLOT: usize = 8;

#[inline(always)]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldLayout {
    pub name: String,
    pub ty: FieldType,
    /// Byte offset from the object start, or from the static block start.
    pub offset: usize,
    /// Index into the declaring class's field list.
    pub index: usize,
}

/// Field offsets and sizes of one class.
#[derive(Debug)]
pub struct ClassLayout {
    pub class: ClassId,
    /// Allocation size of an instance, header included.
    pub instance_size: usize,
    /// Own instance fields in declaration order.
    pub fields: Vec<FieldLayout>,
    /// Offsets of every reference field, inherited ones included.
    pub reference_offsets: Vec<usize>,
    pub static_size: usize,
    pub static_fields: Vec<FieldLayout>,
    pub static_reference_offsets: Vec<usize>,
    pub parent: Option<Arc<ClassLayout>>,
}

impl ClassLayout {
    /// Instance field by name, searching superclasses too.
    pub fn field(&self, name: &str) -> Option<&FieldLayout> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .or_else(|| self.parent.as_ref()?.field(name))
    }

    pub fn static_field(&self, name: &str) -> Option<&FieldLayout> {
        self.static_fields.iter().find(|f| f.name == name)
    }

    fn empty(class: ClassId, instance_size: usize) -> Self {
        Self {
            class,
            instance_size,
            fields: Vec::new(),
            reference_offsets: Vec::new(),
            static_size: 0,
            static_fields: Vec::new(),
            static_reference_offsets: Vec::new(),
            parent: None,
        }
    }
}

/// Element size and kind of an array class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayLayout {
    pub element_size: usize,
    pub references: bool,
}

impl ArrayLayout {
    pub fn size_for(self, length: usize) -> usize {
        align_up(ARRAY_ELEMENTS_OFFSET + self.element_size * length, OBJECT_ALIGN)
    }

    pub fn element_offset(self, index: usize) -> usize {
        ARRAY_ELEMENTS_OFFSET + self.element_size * index
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    /// Managed call with the receiver as implicit first argument.
    Virtual,
    Static,
    /// C ABI call into a native method: environment pointer, then the
    /// receiver or the class, then arguments widened to at least 32 bits.
    Native { is_static: bool },
}

/// Machine-level argument type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbiType {
    U8,
    I8,
    U16,
    I16,
    I32,
    I64,
    F32,
    F64,
    Ptr,
}

impl AbiType {
    pub fn of(ty: &FieldType) -> Self {
        match ty {
            FieldType::Primitive(p) => match p {
                PrimitiveType::Boolean => Self::U8,
                PrimitiveType::Byte => Self::I8,
                PrimitiveType::Char => Self::U16,
                PrimitiveType::Short => Self::I16,
                PrimitiveType::Int => Self::I32,
                PrimitiveType::Float => Self::F32,
                PrimitiveType::Long => Self::I64,
                PrimitiveType::Double => Self::F64,
            },
            FieldType::Object(_) | FieldType::Array(_) => Self::Ptr,
        }
    }

    /// Promotion applied to sub-int arguments by the C ABI.
    pub fn widened(self) -> Self {
        match self {
            Self::U8 | Self::I8 | Self::U16 | Self::I16 => Self::I32,
            other => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub params: Vec<AbiType>,
    pub ret: Option<AbiType>,
}

/// Argument offsets for calls that pass arguments through memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallBuffer {
    pub offsets: Vec<usize>,
    pub size: usize,
}

#[derive(Default)]
pub struct LayoutCache {
    classes: RwLock<AHashMap<ClassId, Arc<ClassLayout>>>,
    signatures: RwLock<AHashMap<(String, CallKind), Arc<Signature>>>,
    buffers: RwLock<AHashMap<String, Arc<CallBuffer>>>,
}

impl LayoutCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn class_layout(&self, table: &ClassTable, id: ClassId) -> Arc<ClassLayout> {
        if let Some(layout) = self.classes.read().get(&id) {
            return layout.clone();
        }
        let computed = Arc::new(self.compute(table, id));
        self.classes.write().entry(id).or_insert(computed).clone()
    }

    fn compute(&self, table: &ClassTable, id: ClassId) -> ClassLayout {
        let class = table.get(id);
        match class.kind() {
            ClassKind::Primitive(_) => return ClassLayout::empty(id, HEADER_SIZE),
            ClassKind::Array { .. } => return ClassLayout::empty(id, ARRAY_ELEMENTS_OFFSET),
            ClassKind::Class => {}
        }

        let parent = class.super_class().map(|s| self.class_layout(table, s));
        let mut cursor = parent.as_ref().map_or(HEADER_SIZE, |p| p.instance_size);
        let mut reference_offsets = parent
            .as_ref()
            .map(|p| p.reference_offsets.clone())
            .unwrap_or_default();

        let mut fields = Vec::new();
        let mut static_fields = Vec::new();
        let mut static_cursor = 0;
        let mut static_reference_offsets = Vec::new();

        for (index, field) in class.meta.fields.iter().enumerate() {
            let ty = FieldType::parse(&field.descriptor);
            let size = ty.size();
            let (cursor, list, refs) = if field.is_static() {
                (&mut static_cursor, &mut static_fields, &mut static_reference_offsets)
            } else {
                (&mut cursor, &mut fields, &mut reference_offsets)
            };
            let offset = align_up(*cursor, size);
            *cursor = offset + size;
            if ty.is_reference() {
                refs.push(offset);
            }
            list.push(FieldLayout {
                name: field.name.clone(),
                ty,
                offset,
                index,
            });
        }

        let layout = ClassLayout {
            class: id,
            instance_size: align_up(cursor, OBJECT_ALIGN),
            fields,
            reference_offsets,
            static_size: align_up(static_cursor, OBJECT_ALIGN),
            static_fields,
            static_reference_offsets,
            parent,
        };
        log::trace!(
            "layout {}: instance {} bytes, statics {} bytes",
            class.name(),
            layout.instance_size,
            layout.static_size
        );
        layout
    }

    pub fn array_layout(&self, table: &ClassTable, id: ClassId) -> ArrayLayout {
        let class = table.get(id);
        let ClassKind::Array { component } = class.kind() else {
            crate::fatal!("{} is not an array class", class.name());
        };
        match table.get(component).kind() {
            ClassKind::Primitive(p) => ArrayLayout {
                element_size: p.size(),
                references: false,
            },
            _ => ArrayLayout {
                element_size: POINTER_SIZE,
                references: true,
            },
        }
    }

    pub fn signature(&self, descriptor: &str, kind: CallKind) -> Arc<Signature> {
        let key = (descriptor.to_string(), kind);
        if let Some(sig) = self.signatures.read().get(&key) {
            return sig.clone();
        }
        let parsed = MethodDescriptor::parse(descriptor);
        let mut params = Vec::with_capacity(parsed.params.len() + 2);
        match kind {
            CallKind::Virtual => params.push(AbiType::Ptr),
            CallKind::Static => {}
            CallKind::Native { .. } => {
                params.push(AbiType::Ptr);
                params.push(AbiType::Ptr);
            }
        }
        let native = matches!(kind, CallKind::Native { .. });
        params.extend(parsed.params.iter().map(|p| {
            let abi = AbiType::of(p);
            if native { abi.widened() } else { abi }
        }));
        let sig = Arc::new(Signature {
            params,
            ret: parsed.ret.as_ref().map(AbiType::of),
        });
        self.signatures.write().entry(key).or_insert(sig).clone()
    }

    pub fn call_buffer(&self, descriptor: &str) -> Arc<CallBuffer> {
        if let Some(buffer) = self.buffers.read().get(descriptor) {
            return buffer.clone();
        }
        let parsed = MethodDescriptor::parse(descriptor);
        let offsets: Vec<usize> = (0..parsed.params.len())
            .map(|i| i * CALL_BUFFER_SLOT)
            .collect();
        let buffer = Arc::new(CallBuffer {
            size: offsets.len() * CALL_BUFFER_SLOT,
            offsets,
        });
        self.buffers
            .write()
            .entry(descriptor.to_string())
            .or_insert(buffer)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.classes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::{FieldInfo, ResolvedClass};

    fn table_with_pair() -> (ClassTable, ClassId, ClassId) {
        let table = ClassTable::new();
        let base = table.define(
            ResolvedClass::new("Base")
                .with_field(FieldInfo::new("flag", "Z"))
                .with_field(FieldInfo::new("count", "I"))
                .with_field(FieldInfo::new("next", "LBase;"))
                .with_field(FieldInfo::new_static("total", "J")),
        );
        let derived = table.define(
            ResolvedClass::new("Derived")
                .with_super(base)
                .with_field(FieldInfo::new("b", "B"))
                .with_field(FieldInfo::new("d", "D")),
        );
        (table, base, derived)
    }

    #[test]
    fn fields_use_natural_alignment() {
        let (table, base, _) = table_with_pair();
        let cache = LayoutCache::new();
        let layout = cache.class_layout(&table, base);
        assert_eq!(layout.field("flag").map(|f| f.offset), Some(HEADER_SIZE));
        assert_eq!(layout.field("count").map(|f| f.offset), Some(align_up(HEADER_SIZE + 1, 4)));
        let next = layout.field("next").map(|f| f.offset);
        assert_eq!(next, Some(align_up(HEADER_SIZE + 8, POINTER_SIZE)));
        assert_eq!(layout.reference_offsets, vec![next.unwrap_or_default()]);
        assert_eq!(layout.instance_size % OBJECT_ALIGN, 0);
    }

    #[test]
    fn subclass_appends_after_padded_parent() {
        let (table, base, derived) = table_with_pair();
        let cache = LayoutCache::new();
        let base_layout = cache.class_layout(&table, base);
        let layout = cache.class_layout(&table, derived);
        assert_eq!(layout.field("b").map(|f| f.offset), Some(base_layout.instance_size));
        assert_eq!(
            layout.field("d").map(|f| f.offset),
            Some(base_layout.instance_size + 8)
        );
        // inherited lookups resolve to the parent's offsets
        assert_eq!(layout.field("count"), base_layout.field("count"));
        assert_eq!(layout.reference_offsets, base_layout.reference_offsets);
        assert!(layout.instance_size >= base_layout.instance_size);
    }

    #[test]
    fn statics_start_at_zero() {
        let (table, base, _) = table_with_pair();
        let cache = LayoutCache::new();
        let layout = cache.class_layout(&table, base);
        assert_eq!(layout.static_field("total").map(|f| f.offset), Some(0));
        assert_eq!(layout.static_size, 8);
        assert!(layout.field("total").is_none());
    }

    #[test]
    fn layouts_are_memoized() {
        let (table, _, derived) = table_with_pair();
        let cache = LayoutCache::new();
        let a = cache.class_layout(&table, derived);
        let b = cache.class_layout(&table, derived);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn array_layouts() {
        let table = ClassTable::new();
        let cache = LayoutCache::new();
        let longs = table.array_of(table.primitive(PrimitiveType::Long));
        let layout = cache.array_layout(&table, longs);
        assert_eq!(layout.element_size, 8);
        assert!(!layout.references);
        assert_eq!(layout.element_offset(2), ARRAY_ELEMENTS_OFFSET + 16);
        assert_eq!(layout.size_for(3), ARRAY_ELEMENTS_OFFSET + 24);
    }

    #[test]
    fn virtual_signature_has_receiver() {
        let cache = LayoutCache::new();
        let sig = cache.signature("(IJ)Ljava/lang/Object;", CallKind::Virtual);
        assert_eq!(sig.params, vec![AbiType::Ptr, AbiType::I32, AbiType::I64]);
        assert_eq!(sig.ret, Some(AbiType::Ptr));
        assert!(Arc::ptr_eq(
            &sig,
            &cache.signature("(IJ)Ljava/lang/Object;", CallKind::Virtual)
        ));
    }

    #[test]
    fn native_signature_widens_small_ints() {
        let cache = LayoutCache::new();
        let sig = cache.signature("(ZBCSF)V", CallKind::Native { is_static: true });
        assert_eq!(
            sig.params,
            vec![
                AbiType::Ptr,
                AbiType::Ptr,
                AbiType::I32,
                AbiType::I32,
                AbiType::I32,
                AbiType::I32,
                AbiType::F32
            ]
        );
        let managed = cache.signature("(ZBCSF)V", CallKind::Static);
        assert_eq!(managed.params[0], AbiType::U8);
        assert_eq!(managed.ret, None);
    }

    #[test]
    fn call_buffer_uses_fixed_slots() {
        let cache = LayoutCache::new();
        let buffer = cache.call_buffer("(BJD)V");
        assert_eq!(buffer.offsets, vec![0, 8, 16]);
        assert_eq!(buffer.size, 24);
    }
}
