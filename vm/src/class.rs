use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use ahash::AHashMap;
use bitflags::bitflags;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::fatal;
use crate::image::NativeImage;
use crate::module::LoadedModule;

bitflags! {
    /// Access and property flags of classes, fields and methods.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct AccessFlags: u16 {
        const PUBLIC = 0x0001;
        const PRIVATE = 0x0002;
        const PROTECTED = 0x0004;
        const STATIC = 0x0008;
        const FINAL = 0x0010;
        const SYNCHRONIZED = 0x0020;
        const VOLATILE = 0x0040;
        const TRANSIENT = 0x0080;
        const NATIVE = 0x0100;
        const INTERFACE = 0x0200;
        const ABSTRACT = 0x0400;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrimitiveType {
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Float,
    Long,
    Double,
}

impl PrimitiveType {
    pub const ALL: [Self; 8] = [
        Self::Boolean,
        Self::Byte,
        Self::Char,
        Self::Short,
        Self::Int,
        Self::Float,
        Self::Long,
        Self::Double,
    ];

    /// Size in bytes; also the natural alignment.
    pub const fn size(self) -> usize {
        match self {
            Self::Boolean | Self::Byte => 1,
            Self::Char | Self::Short => 2,
            Self::Int | Self::Float => 4,
            Self::Long | Self::Double => 8,
        }
    }

    pub const fn descriptor(self) -> char {
        match self {
            Self::Boolean => 'Z',
            Self::Byte => 'B',
            Self::Char => 'C',
            Self::Short => 'S',
            Self::Int => 'I',
            Self::Float => 'F',
            Self::Long => 'J',
            Self::Double => 'D',
        }
    }

    pub fn from_descriptor(c: char) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.descriptor() == c)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Boolean => "boolean",
            Self::Byte => "byte",
            Self::Char => "char",
            Self::Short => "short",
            Self::Int => "int",
            Self::Float => "float",
            Self::Long => "long",
            Self::Double => "double",
        }
    }
}

/// Index of a class in its [`ClassTable`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ClassId(u32);

impl ClassId {
    #[inline(always)]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Entry point of a compiled method body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodePointer(pub usize);

#[derive(Debug, Clone, PartialEq)]
pub enum ConstantValue {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
}

/// An opaque attribute: name plus its span in the class file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub start: u32,
    pub len: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldInfo {
    pub name: String,
    pub descriptor: String,
    pub access: AccessFlags,
    pub constant_value: Option<ConstantValue>,
    pub attributes: Vec<Attribute>,
}

impl FieldInfo {
    pub fn new(name: &str, descriptor: &str) -> Self {
        Self {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            access: AccessFlags::PUBLIC,
            constant_value: None,
            attributes: Vec::new(),
        }
    }

    pub fn new_static(name: &str, descriptor: &str) -> Self {
        Self::new(name, descriptor).with_access(AccessFlags::PUBLIC | AccessFlags::STATIC)
    }

    pub fn with_access(mut self, access: AccessFlags) -> Self {
        self.access = access;
        self
    }

    pub fn with_constant(mut self, value: ConstantValue) -> Self {
        self.constant_value = Some(value);
        self.attributes.push(Attribute {
            name: "ConstantValue".to_string(),
            start: 0,
            len: 2,
        });
        self
    }

    #[inline]
    pub fn is_static(&self) -> bool {
        self.access.contains(AccessFlags::STATIC)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MethodInfo {
    pub name: String,
    pub descriptor: String,
    pub access: AccessFlags,
    /// `None` for abstract methods and unlinked natives.
    pub code: Option<CodePointer>,
    /// The body is a lone return; lets a trivial `finalize` be skipped.
    pub empty_body: bool,
    pub attributes: Vec<Attribute>,
}

impl MethodInfo {
    pub fn new(name: &str, descriptor: &str) -> Self {
        Self {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            access: AccessFlags::PUBLIC,
            code: None,
            empty_body: false,
            attributes: Vec::new(),
        }
    }

    pub fn with_access(mut self, access: AccessFlags) -> Self {
        self.access = access;
        self
    }

    pub fn with_code(mut self, code: CodePointer) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_empty_body(mut self) -> Self {
        self.empty_body = true;
        self
    }

    pub fn with_attribute(mut self, attribute: Attribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    #[inline]
    pub fn is_static(&self) -> bool {
        self.access.contains(AccessFlags::STATIC)
    }

    #[inline]
    pub fn is_abstract(&self) -> bool {
        self.access.contains(AccessFlags::ABSTRACT) || self.code.is_none()
    }

    #[inline]
    pub fn is_native(&self) -> bool {
        self.access.contains(AccessFlags::NATIVE)
    }

    /// Dispatched through the vtable.
    pub fn is_virtual(&self) -> bool {
        !self.is_static()
            && !self.access.contains(AccessFlags::PRIVATE)
            && !self.name.starts_with('<')
    }

    pub fn is_finalizer(&self) -> bool {
        self.name == "finalize" && self.descriptor == "()V"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassKind {
    Class,
    Array { component: ClassId },
    Primitive(PrimitiveType),
}

/// Fully resolved class metadata handed over by the loader.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedClass {
    pub name: String,
    pub access: AccessFlags,
    pub kind: ClassKind,
    pub super_class: Option<ClassId>,
    pub interfaces: Vec<ClassId>,
    pub fields: Vec<FieldInfo>,
    pub methods: Vec<MethodInfo>,
    pub attributes: Vec<Attribute>,
    pub constant_pool_len: u32,
}

impl ResolvedClass {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            access: AccessFlags::PUBLIC,
            kind: ClassKind::Class,
            super_class: None,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            attributes: Vec::new(),
            constant_pool_len: 0,
        }
    }

    pub fn with_super(mut self, super_class: ClassId) -> Self {
        self.super_class = Some(super_class);
        self
    }

    pub fn with_access(mut self, access: AccessFlags) -> Self {
        self.access = access;
        self
    }

    pub fn with_interface(mut self, interface: ClassId) -> Self {
        self.interfaces.push(interface);
        self
    }

    pub fn with_field(mut self, field: FieldInfo) -> Self {
        self.fields.push(field);
        self
    }

    pub fn with_method(mut self, method: MethodInfo) -> Self {
        self.methods.push(method);
        self
    }

    pub fn with_attribute(mut self, attribute: Attribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn with_constant_pool(mut self, len: u32) -> Self {
        self.constant_pool_len = len;
        self
    }

    pub fn method_index(&self, name: &str, descriptor: &str) -> Option<usize> {
        self.methods
            .iter()
            .position(|m| m.name == name && m.descriptor == descriptor)
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }
}

/// Inner/outer class relation, linked after both sides are defined.
#[derive(Debug, Clone, Default)]
pub struct Nesting {
    pub outer: Option<ClassId>,
    pub inner: Vec<ClassId>,
    pub inner_access: AccessFlags,
}

/// A defined class, resident at a stable address for the process lifetime.
///
/// Its address is the class pointer written into every object header.
pub struct RuntimeClass {
    pub id: ClassId,
    pub meta: ResolvedClass,
    /// Linearized supertypes, root first, ending with this class.
    pub display: Vec<ClassId>,
    pub depth: usize,
    pub(crate) nesting: RwLock<Nesting>,
    pub(crate) image: OnceLock<Arc<NativeImage>>,
    /// Loaded module whose storage the image points into.
    pub(crate) module: OnceLock<Arc<LoadedModule>>,
    /// Static storage address; the mutex is the per-class lock.
    pub(crate) statics: Mutex<usize>,
    loader: AtomicUsize,
    delegatee: AtomicUsize,
}

impl RuntimeClass {
    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.meta.name
    }

    #[inline(always)]
    pub fn kind(&self) -> ClassKind {
        self.meta.kind
    }

    #[inline(always)]
    pub fn super_class(&self) -> Option<ClassId> {
        self.meta.super_class
    }

    pub fn address(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as usize
    }

    /// The published native image, if built.
    pub fn image(&self) -> Option<&Arc<NativeImage>> {
        self.image.get()
    }

    pub fn nesting(&self) -> Nesting {
        self.nesting.read().clone()
    }

    pub fn static_instance(&self) -> usize {
        *self.statics.lock()
    }

    pub fn loader(&self) -> usize {
        self.loader.load(Ordering::Acquire)
    }

    pub fn set_loader(&self, loader: usize) {
        self.loader.store(loader, Ordering::Release);
    }

    pub fn delegatee(&self) -> usize {
        self.delegatee.load(Ordering::Acquire)
    }

    pub fn set_delegatee(&self, delegatee: usize) {
        self.delegatee.store(delegatee, Ordering::Release);
    }

    /// Constant-time subtype check through the display.
    pub fn is_subclass_of(&self, other: &RuntimeClass) -> bool {
        self.display.get(other.depth) == Some(&other.id)
    }

    /// Descriptor form used for array naming: `I`, `Lfoo;` or `[...`.
    pub fn type_descriptor(&self) -> String {
        match self.meta.kind {
            ClassKind::Primitive(p) => p.descriptor().to_string(),
            ClassKind::Array { .. } => self.meta.name.clone(),
            ClassKind::Class => format!("L{};", self.meta.name),
        }
    }
}

impl std::fmt::Debug for RuntimeClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeClass")
            .field("id", &self.id)
            .field("name", &self.meta.name)
            .field("depth", &self.depth)
            .finish()
    }
}

struct ClassTableImpl {
    classes: Vec<Arc<RuntimeClass>>,
    by_name: AHashMap<String, ClassId>,
    arrays: AHashMap<ClassId, ClassId>,
}

/// The loader-side store of resolved classes.
///
/// Primitive classes are predefined. Every other class must name only
/// classes that are already defined.
pub struct ClassTable(RwLock<ClassTableImpl>);

impl Default for ClassTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassTable {
    pub fn new() -> Self {
        let table = Self(RwLock::new(ClassTableImpl {
            classes: Vec::new(),
            by_name: AHashMap::new(),
            arrays: AHashMap::new(),
        }));
        for primitive in PrimitiveType::ALL {
            let mut meta = ResolvedClass::new(primitive.name());
            meta.kind = ClassKind::Primitive(primitive);
            meta.access = AccessFlags::PUBLIC | AccessFlags::FINAL | AccessFlags::ABSTRACT;
            table.define(meta);
        }
        table
    }

    pub fn define(&self, meta: ResolvedClass) -> ClassId {
        Self::insert(&mut self.0.write(), meta)
    }

    fn insert(inner: &mut ClassTableImpl, meta: ResolvedClass) -> ClassId {
        if inner.by_name.contains_key(&meta.name) {
            fatal!("class `{}` defined twice", meta.name);
        }
        let count = inner.classes.len();
        let forward = meta
            .super_class
            .iter()
            .chain(meta.interfaces.iter())
            .chain(match &meta.kind {
                ClassKind::Array { component } => Some(component),
                _ => None,
            })
            .find(|id| id.index() >= count);
        if let Some(id) = forward {
            fatal!("class `{}` references undefined class {id:?}", meta.name);
        }

        let id = ClassId(count as u32);
        let mut display = match meta.super_class {
            Some(super_id) => inner.classes[super_id.index()].display.clone(),
            None => Vec::new(),
        };
        display.push(id);
        let depth = display.len() - 1;

        log::debug!("define {} as {id:?} at depth {depth}", meta.name);
        inner.by_name.insert(meta.name.clone(), id);
        inner.classes.push(Arc::new(RuntimeClass {
            id,
            meta,
            display,
            depth,
            nesting: RwLock::new(Nesting::default()),
            image: OnceLock::new(),
            module: OnceLock::new(),
            statics: Mutex::new(0),
            loader: AtomicUsize::new(0),
            delegatee: AtomicUsize::new(0),
        }));
        id
    }

    pub fn get(&self, id: ClassId) -> Arc<RuntimeClass> {
        match self.0.read().classes.get(id.index()) {
            Some(class) => class.clone(),
            None => fatal!("unknown class {id:?}"),
        }
    }

    pub fn lookup(&self, name: &str) -> Option<ClassId> {
        self.0.read().by_name.get(name).copied()
    }

    pub fn primitive(&self, primitive: PrimitiveType) -> ClassId {
        match self.lookup(primitive.name()) {
            Some(id) => id,
            None => fatal!("primitive class {} missing", primitive.name()),
        }
    }

    /// The array class with the given component, defined on first use.
    pub fn array_of(&self, component: ClassId) -> ClassId {
        if let Some(id) = self.0.read().arrays.get(&component) {
            return *id;
        }
        let mut inner = self.0.write();
        if let Some(id) = inner.arrays.get(&component) {
            return *id;
        }
        let component_class = match inner.classes.get(component.index()) {
            Some(class) => class.clone(),
            None => fatal!("unknown array component {component:?}"),
        };
        let name = format!("[{}", component_class.type_descriptor());
        let mut meta = ResolvedClass::new(&name);
        meta.kind = ClassKind::Array { component };
        meta.access = AccessFlags::PUBLIC | AccessFlags::FINAL | AccessFlags::ABSTRACT;
        let id = Self::insert(&mut inner, meta);
        inner.arrays.insert(component, id);
        id
    }

    /// Links `inner` as a member class of `outer`.
    pub fn nest(&self, outer: ClassId, inner: ClassId, access: AccessFlags) {
        let outer_class = self.get(outer);
        let inner_class = self.get(inner);
        outer_class.nesting.write().inner.push(inner);
        let mut nesting = inner_class.nesting.write();
        nesting.outer = Some(outer);
        nesting.inner_access = access;
    }

    pub fn len(&self) -> usize {
        self.0.read().classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all(&self) -> Vec<Arc<RuntimeClass>> {
        self.0.read().classes.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_are_predefined() {
        let table = ClassTable::new();
        assert_eq!(table.len(), PrimitiveType::ALL.len());
        let int = table.primitive(PrimitiveType::Int);
        assert_eq!(table.get(int).kind(), ClassKind::Primitive(PrimitiveType::Int));
        assert_eq!(table.get(int).type_descriptor(), "I");
    }

    #[test]
    fn display_is_root_first() {
        let table = ClassTable::new();
        let a = table.define(ResolvedClass::new("A"));
        let b = table.define(ResolvedClass::new("B").with_super(a));
        let c = table.define(ResolvedClass::new("C").with_super(b));
        let c_class = table.get(c);
        assert_eq!(c_class.display, vec![a, b, c]);
        assert_eq!(c_class.depth, 2);
        assert!(c_class.is_subclass_of(&table.get(a)));
        assert!(!table.get(a).is_subclass_of(&c_class));
    }

    #[test]
    #[should_panic(expected = "undefined class")]
    fn forward_reference_is_fatal() {
        let table = ClassTable::new();
        let bogus = ClassId(999);
        table.define(ResolvedClass::new("Broken").with_super(bogus));
    }

    #[test]
    fn array_classes_are_canonical() {
        let table = ClassTable::new();
        let obj = table.define(ResolvedClass::new("java/lang/Object"));
        let arr = table.array_of(obj);
        assert_eq!(table.array_of(obj), arr);
        assert_eq!(table.get(arr).name(), "[Ljava/lang/Object;");
        let int_arr = table.array_of(table.primitive(PrimitiveType::Int));
        assert_eq!(table.get(int_arr).name(), "[I");
        let nested = table.array_of(arr);
        assert_eq!(table.get(nested).name(), "[[Ljava/lang/Object;");
    }

    #[test]
    fn nesting_links_both_sides() {
        let table = ClassTable::new();
        let outer = table.define(ResolvedClass::new("Outer"));
        let inner = table.define(ResolvedClass::new("Outer$Inner"));
        table.nest(outer, inner, AccessFlags::STATIC);
        assert_eq!(table.get(outer).nesting().inner, vec![inner]);
        assert_eq!(table.get(inner).nesting().outer, Some(outer));
        assert_eq!(table.get(inner).nesting().inner_access, AccessFlags::STATIC);
    }

    #[test]
    fn method_classification() {
        let finalize = MethodInfo::new("finalize", "()V").with_code(CodePointer(0x10));
        assert!(finalize.is_finalizer());
        assert!(finalize.is_virtual());
        let init = MethodInfo::new("<init>", "()V").with_code(CodePointer(0x20));
        assert!(!init.is_virtual());
        let st = MethodInfo::new("f", "()V").with_access(AccessFlags::STATIC);
        assert!(!st.is_virtual());
        assert!(MethodInfo::new("g", "()V").is_abstract());
    }
}
