//! The build session: every dedup cache of one output mode.
//!
//! All cache kinds share one reentrant build lock, so check-then-insert is
//! linearizable per key and a recursive build on the same thread (a class
//! image asking for its own name, its ancestors, its vtable) re-enters
//! freely. A failed outermost build rolls back every entry it published.

use std::alloc::Layout;
use std::cell::RefCell;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use ahash::AHashMap;
use jolt_object::{ARRAY_ELEMENTS_OFFSET, ObjectRef, POINTER_SIZE};
use parking_lot::{Mutex, ReentrantMutex};

use crate::backend::{
    AotBackend, ArrayElements, Backend, Checkpoint, DynamicBackend, FieldValue, ObjectPayload,
    Payload,
};
use crate::class::{ClassId, ClassKind, ClassTable, PrimitiveType, RuntimeClass};
use crate::collector::{Collector, RootVisitor};
use crate::config::{Mode, SessionConfig};
use crate::constant::{CacheKey, ConstRef, Constant, ConstantKind, Scalar};
use crate::descriptor::FieldType;
use crate::error::{AllocError, Result};
use crate::fatal;
use crate::image::{self, NativeImage};
use crate::interner::Utf8Interner;
use crate::layout::{ArrayLayout, CallBuffer, CallKind, ClassLayout, LayoutCache, OBJECT_ALIGN, Signature};
use crate::module::{AotModule, LoadedModule};
use crate::monitor::MonitorTable;
use crate::vtable::{Builtin, TRACER_SLOT, TraceFn, VirtualTable};

enum Journal {
    Cache(CacheKey),
    Image(ClassId),
}

#[derive(Default)]
struct BuildState {
    caches: [AHashMap<CacheKey, ConstRef>; ConstantKind::ALL.len()],
    images: AHashMap<ClassId, Arc<NativeImage>>,
    vtables: AHashMap<ClassId, Arc<VirtualTable>>,
    /// Shared vtables of primitive and reference arrays.
    array_vtables: [Option<Arc<VirtualTable>>; 2],
    depth: usize,
    journal: Vec<Journal>,
    checkpoint: Checkpoint,
}

pub struct Session {
    config: SessionConfig,
    classes: Arc<ClassTable>,
    collector: Arc<dyn Collector>,
    interner: Utf8Interner,
    layouts: LayoutCache,
    monitors: MonitorTable,
    build: ReentrantMutex<RefCell<BuildState>>,
    backend: Mutex<Box<dyn Backend>>,
    modules: Mutex<Vec<Arc<LoadedModule>>>,
}

impl Session {
    pub fn new(
        config: SessionConfig,
        classes: Arc<ClassTable>,
        collector: Arc<dyn Collector>,
    ) -> Self {
        let backend: Box<dyn Backend> = match config.mode {
            Mode::Dynamic => Box::new(DynamicBackend::new(collector.clone())),
            Mode::AheadOfTime => Box::new(AotBackend::new(&config)),
        };
        log::debug!("session in {:?} mode over {} classes", config.mode, classes.len());
        Self {
            monitors: MonitorTable::new(config.monitor_capacity, config.spin_limit),
            config,
            classes,
            collector,
            interner: Utf8Interner::new(),
            layouts: LayoutCache::new(),
            build: ReentrantMutex::new(RefCell::new(BuildState::default())),
            backend: Mutex::new(backend),
            modules: Mutex::new(Vec::new()),
        }
    }

    /// Ends the session; an ahead-of-time session yields its module.
    pub fn teardown(self) -> Option<AotModule> {
        self.backend.into_inner().finish()
    }

    #[inline]
    pub fn mode(&self) -> Mode {
        self.config.mode
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn classes(&self) -> &Arc<ClassTable> {
        &self.classes
    }

    pub fn interner(&self) -> &Utf8Interner {
        &self.interner
    }

    pub fn monitors(&self) -> &MonitorTable {
        &self.monitors
    }

    // ── build state ────────────────────────────────────────────────

    fn with_state<R>(&self, f: impl FnOnce(&mut BuildState) -> R) -> R {
        let guard = self.build.lock();
        let mut state = guard.borrow_mut();
        f(&mut state)
    }

    fn cached(&self, key: &CacheKey) -> Option<ConstRef> {
        self.with_state(|s| s.caches[key.kind().index()].get(key).copied())
    }

    fn publish(&self, key: CacheKey, value: ConstRef) {
        self.with_state(|s| {
            if s.caches[key.kind().index()].insert(key.clone(), value).is_none() {
                s.journal.push(Journal::Cache(key));
            }
        });
    }

    /// Runs `f` as part of the current build, rolling the whole outermost
    /// build back if it fails.
    fn transaction<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let _guard = self.build.lock();
        let outermost = self.with_state(|s| {
            s.depth += 1;
            s.depth == 1
        });
        if outermost {
            let checkpoint = self.backend.lock().checkpoint();
            self.with_state(|s| {
                s.journal.clear();
                s.checkpoint = checkpoint;
            });
        }

        let result = f();

        self.with_state(|s| s.depth -= 1);
        if outermost {
            if let Err(err) = &result {
                let (undone, checkpoint) = self.with_state(|s| {
                    let journal = std::mem::take(&mut s.journal);
                    for entry in &journal {
                        match entry {
                            Journal::Cache(key) => {
                                s.caches[key.kind().index()].remove(key);
                            }
                            Journal::Image(id) => {
                                s.images.remove(id);
                            }
                        }
                    }
                    (journal.len(), s.checkpoint)
                });
                self.backend.lock().rollback(checkpoint);
                log::warn!("build failed ({err}); rolled back {undone} entries");
            }
        }
        result
    }

    // ── constants ──────────────────────────────────────────────────

    /// Materializes `constant`, once per identity.
    pub fn constant(&self, constant: &Constant<'_>) -> Result<ConstRef> {
        if let Some(scalar) = constant.scalar() {
            return Ok(ConstRef::Scalar(scalar));
        }
        let key = self.key(constant);
        if let Some(hit) = self.cached(&key) {
            return Ok(hit);
        }
        self.transaction(|| {
            if let Some(hit) = self.cached(&key) {
                return Ok(hit);
            }
            let value = self.materialize(constant, &key)?;
            self.publish(key.clone(), value);
            Ok(value)
        })
    }

    pub fn class_ref(&self, id: ClassId) -> Result<ConstRef> {
        self.constant(&Constant::Class(id))
    }

    fn key(&self, constant: &Constant<'_>) -> CacheKey {
        match *constant {
            Constant::Utf8(text) => CacheKey::Utf8(text.to_string()),
            Constant::String(text) => CacheKey::String(text.to_string()),
            Constant::Class(id) => CacheKey::Class(id),
            Constant::ArrayClass(component) => CacheKey::ArrayClass(component),
            Constant::ConstantPool(id) => CacheKey::ConstantPool(id),
            Constant::Method(id, index) => CacheKey::Method(id, index),
            Constant::StaticInstance(id) => CacheKey::StaticInstance(id),
            Constant::VirtualTable(id) => match self.classes.get(id).kind() {
                ClassKind::Array { component } => {
                    CacheKey::ArrayVirtualTable(self.is_reference(component))
                }
                _ => CacheKey::VirtualTable(id),
            },
            Constant::CallSite {
                class,
                name,
                descriptor,
                site,
            } => CacheKey::CallSite(class, name.to_string(), descriptor.to_string(), site),
            Constant::NativeFunction(id, index) => CacheKey::NativeFunction(id, index),
            Constant::FinalObject(obj) => CacheKey::FinalObject(obj.addr()),
            Constant::Int(_) | Constant::Long(_) | Constant::Float(_) | Constant::Double(_) => {
                fatal!("scalar constants are not cached")
            }
        }
    }

    /// Hands a resolved payload to the backend unless a recursive build
    /// already produced the entry.
    fn emit(&self, key: &CacheKey, payload: Payload<'_>) -> Result<ConstRef> {
        if let Some(hit) = self.cached(key) {
            return Ok(hit);
        }
        self.backend.lock().materialize_constant(payload)
    }

    fn materialize(&self, constant: &Constant<'_>, key: &CacheKey) -> Result<ConstRef> {
        match *constant {
            Constant::Class(id) => self.materialize_class(id, key),
            Constant::ArrayClass(component) => self.class_ref(self.classes.array_of(component)),
            Constant::Utf8(text) => {
                let record = self.interner.get(self.interner.intern(text));
                self.emit(key, Payload::Utf8(&record))
            }
            Constant::String(text) => {
                let utf8 = self.constant(&Constant::Utf8(text))?;
                let (class, vtable) = match self.classes.lookup(&self.config.string_class) {
                    Some(id) if self.mode() == Mode::Dynamic => {
                        let class = self.classes.get(id).address();
                        let vtable = self.constant(&Constant::VirtualTable(id))?;
                        (class, vtable.resident_addr().unwrap_or(0))
                    }
                    _ => (0, 0),
                };
                self.emit(
                    key,
                    Payload::String {
                        text,
                        utf8,
                        class,
                        vtable,
                    },
                )
            }
            Constant::ConstantPool(id) => {
                let len = self.classes.get(id).meta.constant_pool_len;
                self.emit(key, Payload::ConstantPool { len })
            }
            Constant::Method(id, index) => {
                let class = self.class_ref(id)?;
                let image = self.image(id)?;
                let Some(position) = image.class_image().and_then(|c| c.method_position(index))
                else {
                    fatal!("{} has no method #{index}", self.classes.get(id).name());
                };
                self.emit(
                    key,
                    Payload::Method {
                        class,
                        image: &image,
                        position,
                    },
                )
            }
            Constant::StaticInstance(id) => {
                let class = self.classes.get(id);
                let class_ref = self.class_ref(id)?;
                let layout = self.layout(id);
                let mut fields = Vec::new();
                for slot in &layout.static_fields {
                    if let Some(value) = &class.meta.fields[slot.index].constant_value {
                        fields.push(FieldValue {
                            offset: slot.offset as u32,
                            width: slot.ty.size() as u8,
                            value: self.constant(&Constant::from(value))?,
                        });
                    }
                }
                self.emit(
                    key,
                    Payload::StaticInstance {
                        class: &class,
                        class_ref,
                        size: layout.static_size,
                        fields,
                    },
                )
            }
            Constant::VirtualTable(id) => {
                let vtable = self.vtable(id);
                self.backend.lock().materialize_vtable(&vtable, &self.classes)
            }
            Constant::CallSite {
                class,
                name,
                descriptor,
                ..
            } => {
                let class = self.class_ref(class)?;
                let name = self.constant(&Constant::Utf8(name))?;
                let descriptor = self.constant(&Constant::Utf8(descriptor))?;
                self.emit(
                    key,
                    Payload::CallSite {
                        class,
                        name,
                        descriptor,
                    },
                )
            }
            Constant::NativeFunction(id, index) => {
                let class = self.classes.get(id);
                if class.meta.methods.get(index as usize).is_none() {
                    fatal!("{} has no method #{index}", class.name());
                }
                self.emit(
                    key,
                    Payload::NativeFunction {
                        class: &class,
                        index: index as usize,
                    },
                )
            }
            Constant::FinalObject(obj) => match self.mode() {
                Mode::Dynamic => Ok(ConstRef::address(obj.addr())),
                Mode::AheadOfTime => fatal!("final object {obj:?} used before it was registered"),
            },
            Constant::Int(_) | Constant::Long(_) | Constant::Float(_) | Constant::Double(_) => {
                fatal!("scalar constants are not cached")
            }
        }
    }

    /// Reserves the class's reference before building its image, so
    /// cycles through ancestors and nesting resolve to the reservation.
    fn materialize_class(&self, id: ClassId, key: &CacheKey) -> Result<ConstRef> {
        let class = self.classes.get(id);
        let handle = self.backend.lock().reserve_class(&class)?;
        self.publish(key.clone(), handle);

        let image = image::build(self, &class)?;
        let image = self
            .backend
            .lock()
            .materialize_class(&class, handle, image)?;
        self.with_state(|s| {
            s.images.insert(id, image);
            s.journal.push(Journal::Image(id));
        });
        log::debug!("built image of {}", class.name());
        Ok(handle)
    }

    pub(crate) fn loader_ref(&self, class: &RuntimeClass) -> Result<ConstRef> {
        self.backend.lock().loader_ref(class)
    }

    pub(crate) fn code_ref(&self, class: &RuntimeClass, index: usize) -> Result<ConstRef> {
        self.backend.lock().code_ref(class, index)
    }

    /// The built image of a class, building it first if needed.
    pub fn image(&self, id: ClassId) -> Result<Arc<NativeImage>> {
        self.class_ref(id)?;
        match self.with_state(|s| s.images.get(&id).cloned()) {
            Some(image) => Ok(image),
            None => fatal!(
                "image of {} requested while it is being built",
                self.classes.get(id).name()
            ),
        }
    }

    // ── final objects ──────────────────────────────────────────────

    /// Registers a live object graph as a constant.
    ///
    /// In ahead-of-time mode the object and everything it references are
    /// copied into cells; a graph may contain cycles. `obj` must come from
    /// [`Session::allocate_instance`] or [`Session::allocate_array`].
    pub fn register_object(&self, obj: ObjectRef) -> Result<ConstRef> {
        if self.mode() == Mode::Dynamic {
            return self.constant(&Constant::FinalObject(obj));
        }
        let key = CacheKey::FinalObject(obj.addr());
        self.transaction(|| {
            if let Some(hit) = self.cached(&key) {
                return Ok(hit);
            }
            let handle = self.backend.lock().reserve_object(obj)?;
            self.publish(key.clone(), handle);
            let payload = self.object_payload(obj)?;
            self.backend.lock().materialize_object(handle, payload)?;
            Ok(handle)
        })
    }

    fn object_payload(&self, obj: ObjectRef) -> Result<ObjectPayload> {
        let class = self.class_of(obj);
        let class_ref = self.class_ref(class.id)?;
        match class.kind() {
            ClassKind::Class => {
                let layout = self.layout(class.id);
                let mut fields = Vec::new();
                let mut current = Some(&layout);
                while let Some(level) = current {
                    for field in &level.fields {
                        let ptr = obj.field_ptr(field.offset);
                        let value = match &field.ty {
                            // SAFETY: the field lies inside the instance
                            FieldType::Primitive(p) => ConstRef::Scalar(unsafe { read_scalar(ptr, *p) }),
                            _ => self.reference(unsafe { (ptr as *const usize).read() })?,
                        };
                        fields.push(FieldValue {
                            offset: field.offset as u32,
                            width: field.ty.size() as u8,
                            value,
                        });
                    }
                    current = level.parent.as_ref();
                }
                fields.sort_by_key(|f| f.offset);
                Ok(ObjectPayload::Instance {
                    class: class_ref,
                    size: layout.instance_size as u32,
                    fields,
                })
            }
            ClassKind::Array { .. } => {
                let layout = self.array_layout(class.id);
                // SAFETY: the class says this is an array
                let length = unsafe { obj.array_header() }.length();
                let elements = if layout.references {
                    let mut refs = Vec::with_capacity(length);
                    for i in 0..length {
                        let slot = obj.field_ptr(layout.element_offset(i)) as *const usize;
                        refs.push(self.reference(unsafe { slot.read() })?);
                    }
                    ArrayElements::References(refs)
                } else {
                    let bytes = unsafe {
                        std::slice::from_raw_parts(
                            obj.field_ptr(ARRAY_ELEMENTS_OFFSET),
                            layout.element_size * length,
                        )
                    };
                    ArrayElements::Bytes(bytes.to_vec())
                };
                Ok(ObjectPayload::Array {
                    class: class_ref,
                    length: length as u32,
                    elements,
                })
            }
            ClassKind::Primitive(_) => fatal!("object {obj:?} claims a primitive class"),
        }
    }

    fn reference(&self, addr: usize) -> Result<ConstRef> {
        if addr == 0 {
            return Ok(ConstRef::Null);
        }
        // SAFETY: reference slots of session-allocated objects hold objects
        self.register_object(unsafe { ObjectRef::from_addr(addr) })
    }

    fn class_of(&self, obj: ObjectRef) -> Arc<RuntimeClass> {
        let addr = obj.header().class();
        if addr == 0 {
            fatal!("object {obj:?} has no class");
        }
        // SAFETY: class words are only ever written from resident classes
        let id = unsafe { &*(addr as *const RuntimeClass) }.id;
        self.classes.get(id)
    }

    // ── structure ──────────────────────────────────────────────────

    pub fn layout(&self, id: ClassId) -> Arc<ClassLayout> {
        self.layouts.class_layout(&self.classes, id)
    }

    pub fn array_layout(&self, id: ClassId) -> ArrayLayout {
        self.layouts.array_layout(&self.classes, id)
    }

    /// Byte offset of an instance or static field.
    pub fn field_offset(&self, id: ClassId, name: &str) -> Option<usize> {
        let layout = self.layout(id);
        layout
            .field(name)
            .or_else(|| layout.static_field(name))
            .map(|f| f.offset)
    }

    pub fn signature(&self, descriptor: &str, kind: CallKind) -> Arc<Signature> {
        self.layouts.signature(descriptor, kind)
    }

    pub fn call_buffer(&self, descriptor: &str) -> Arc<CallBuffer> {
        self.layouts.call_buffer(descriptor)
    }

    fn is_reference(&self, component: ClassId) -> bool {
        !matches!(self.classes.get(component).kind(), ClassKind::Primitive(_))
    }

    pub fn vtable(&self, id: ClassId) -> Arc<VirtualTable> {
        let class = self.classes.get(id);
        match class.kind() {
            ClassKind::Array { component } => return self.array_vtable(self.is_reference(component)),
            ClassKind::Primitive(_) => fatal!("primitive class {} has no vtable", class.name()),
            ClassKind::Class => {}
        }
        if let Some(vtable) = self.with_state(|s| s.vtables.get(&id).cloned()) {
            return vtable;
        }
        let parent = class.super_class().map(|s| self.vtable(s));
        let built = Arc::new(VirtualTable::build(&class, parent.as_deref()));
        self.with_state(|s| s.vtables.entry(id).or_insert(built).clone())
    }

    fn array_vtable(&self, references: bool) -> Arc<VirtualTable> {
        self.with_state(|s| {
            s.array_vtables[references as usize]
                .get_or_insert_with(|| {
                    let tracer = if references {
                        Builtin::TraceReferenceArray
                    } else {
                        Builtin::TraceNothing
                    };
                    Arc::new(VirtualTable::base(tracer))
                })
                .clone()
        })
    }

    pub fn vtable_slot(&self, id: ClassId, name: &str, descriptor: &str) -> Option<usize> {
        self.vtable(id).slot_of(name, descriptor)
    }

    /// Byte offset of a method's entry in its class's vtable.
    pub fn method_offset(&self, id: ClassId, name: &str, descriptor: &str) -> Option<usize> {
        self.vtable_slot(id, name, descriptor)
            .map(|slot| slot * POINTER_SIZE)
    }

    // ── allocation ─────────────────────────────────────────────────

    /// Vtable word for new instances; ahead-of-time instances get none.
    fn instance_vtable(&self, id: ClassId) -> Result<usize> {
        match self.mode() {
            Mode::Dynamic => Ok(self
                .constant(&Constant::VirtualTable(id))?
                .resident_addr()
                .unwrap_or(0)),
            Mode::AheadOfTime => Ok(0),
        }
    }

    pub fn allocate_instance(&self, id: ClassId) -> Result<ObjectRef> {
        let class = self.classes.get(id);
        if class.kind() != ClassKind::Class {
            fatal!("cannot instantiate {}", class.name());
        }
        self.class_ref(id)?;
        let size = self.layout(id).instance_size;
        let vtable = self.instance_vtable(id)?;
        let layout = Layout::from_size_align(size, OBJECT_ALIGN).map_err(|_| AllocError { size })?;
        let block = self.collector.allocate(layout, vtable)?;
        // SAFETY: freshly allocated with room for a header
        let obj = unsafe { ObjectRef::from_raw(block) };
        obj.header().set_class(class.address());
        Ok(obj)
    }

    pub fn allocate_array(&self, component: ClassId, length: usize) -> Result<ObjectRef> {
        let id = self.classes.array_of(component);
        self.class_ref(id)?;
        let size = self.array_layout(id).size_for(length);
        let vtable = self.instance_vtable(id)?;
        let layout = Layout::from_size_align(size, OBJECT_ALIGN).map_err(|_| AllocError { size })?;
        let block = self.collector.allocate(layout, vtable)?;
        // SAFETY: freshly allocated with room for an array header
        let obj = unsafe { ObjectRef::from_raw(block) };
        obj.header().set_class(self.classes.get(id).address());
        unsafe { obj.array_header() }.set_length(length);
        Ok(obj)
    }

    /// Frees a dead object and any monitor it inflated.
    ///
    /// # Safety
    ///
    /// `obj` must be unreachable and allocated by this session.
    pub unsafe fn reclaim_object(&self, obj: ObjectRef) {
        self.monitors.reclaim_object(obj.header());
        if let Some(ptr) = NonNull::new(obj.as_ptr()) {
            unsafe { self.collector.reclaim(ptr) };
        }
    }

    // ── collector hooks ────────────────────────────────────────────

    /// Presents every collector-managed object the session keeps alive:
    /// static storage, its reference fields, and registered final objects.
    pub fn visit_roots(&self, visitor: &mut RootVisitor<'_>) {
        if self.mode() != Mode::Dynamic {
            return;
        }
        let _guard = self.build.lock();
        let roots: Vec<(CacheKey, usize)> = self.with_state(|s| {
            let caches = &s.caches;
            [ConstantKind::StaticInstance, ConstantKind::FinalObject]
                .into_iter()
                .flat_map(move |kind| caches[kind.index()].iter())
                .filter_map(|(key, value)| Some((key.clone(), value.resident_addr()?)))
                .filter(|(_, addr)| *addr != 0)
                .collect()
        });

        for (key, addr) in roots {
            let mut slot = addr;
            visitor(&mut slot as *mut usize);
            if slot != addr {
                self.with_state(|s| {
                    s.caches[key.kind().index()].insert(key.clone(), ConstRef::address(slot))
                });
            }
            if let CacheKey::StaticInstance(id) = key {
                if slot != addr {
                    *self.classes.get(id).statics.lock() = slot;
                }
                for offset in &self.layout(id).static_reference_offsets {
                    let field = (slot + offset) as *mut usize;
                    // SAFETY: the offset lies inside the static block
                    if unsafe { field.read() } != 0 {
                        visitor(field);
                    }
                }
            }
        }
    }

    /// Presents every reference slot of `obj`.
    pub fn trace_object(&self, obj: ObjectRef, visitor: &mut RootVisitor<'_>) {
        let vtable = obj.header().vtable();
        if vtable != 0 {
            // SAFETY: resident vtables always have the header slots
            let tracer = unsafe { (vtable as *const usize).add(TRACER_SLOT).read() };
            if tracer != 0 {
                // SAFETY: the tracer slot only ever holds a `TraceFn`
                let trace = unsafe { std::mem::transmute::<usize, TraceFn>(tracer) };
                unsafe { trace(obj, visitor) };
                return;
            }
        }

        let class = self.class_of(obj);
        let mut visit = |offset: usize| {
            let slot = obj.field_ptr(offset) as *mut usize;
            // SAFETY: offsets come from the object's own layout
            if unsafe { slot.read() } != 0 {
                visitor(slot);
            }
        };
        match class.kind() {
            ClassKind::Class => self.layout(class.id).reference_offsets.iter().for_each(|&o| visit(o)),
            ClassKind::Array { .. } => {
                let layout = self.array_layout(class.id);
                if layout.references {
                    // SAFETY: the class says this is an array
                    let length = unsafe { obj.array_header() }.length();
                    (0..length).for_each(|i| visit(layout.element_offset(i)));
                }
            }
            ClassKind::Primitive(_) => {}
        }
    }

    // ── modules ────────────────────────────────────────────────────

    /// Re-publishes a loaded module's classes and strings in this session.
    pub fn adopt(&self, module: Arc<LoadedModule>) {
        if self.mode() != Mode::Dynamic {
            fatal!("ahead-of-time sessions cannot adopt loaded modules");
        }
        let _guard = self.build.lock();
        for &(id, _) in module.classes() {
            let class = self.classes.get(id);
            self.publish(CacheKey::Class(id), ConstRef::address(class.address()));
            if let Some(image) = class.image() {
                if let Some(class_image) = image.class_image() {
                    self.publish(CacheKey::VirtualTable(id), class_image.vtable);
                    if !class_image.mirror.static_instance.is_null() {
                        self.publish(CacheKey::StaticInstance(id), class_image.mirror.static_instance);
                    }
                }
                let image = image.clone();
                self.with_state(|s| s.images.insert(id, image));
            }
        }
        for (text, object) in module.strings() {
            self.publish(CacheKey::String(text.to_string()), object);
        }
        self.with_state(|s| s.journal.clear());
        log::debug!("adopted module `{}`", module.name);
        self.modules.lock().push(module);
    }

    // ── statistics ─────────────────────────────────────────────────

    pub fn stats(&self) -> SessionStats {
        let (constants, images, vtables) = self.with_state(|s| {
            let constants = ConstantKind::ALL
                .into_iter()
                .map(|kind| (kind, s.caches[kind.index()].len()))
                .collect();
            (constants, s.images.len(), s.vtables.len())
        });
        let emitted = self.backend.lock().emitted();
        SessionStats {
            mode: self.mode(),
            constants,
            images,
            vtables,
            layouts: self.layouts.len(),
            utf8: self.interner.len(),
            monitors: self.monitors.live(),
            cells: emitted.cells,
            cell_bytes: emitted.bytes,
            allocated: self.collector.allocated(),
            modules: self.modules.lock().len(),
        }
    }
}

/// Reads a primitive field.
///
/// # Safety
///
/// `ptr` must point at a readable value of type `p`.
unsafe fn read_scalar(ptr: *const u8, p: PrimitiveType) -> Scalar {
    unsafe {
        match p {
            PrimitiveType::Boolean => Scalar::Int(ptr.read() as i32),
            PrimitiveType::Byte => Scalar::Int(ptr.cast::<i8>().read() as i32),
            PrimitiveType::Char => Scalar::Int(ptr.cast::<u16>().read_unaligned() as i32),
            PrimitiveType::Short => Scalar::Int(ptr.cast::<i16>().read_unaligned() as i32),
            PrimitiveType::Int => Scalar::Int(ptr.cast::<i32>().read_unaligned()),
            PrimitiveType::Float => Scalar::Float(ptr.cast::<u32>().read_unaligned()),
            PrimitiveType::Long => Scalar::Long(ptr.cast::<i64>().read_unaligned()),
            PrimitiveType::Double => Scalar::Double(ptr.cast::<u64>().read_unaligned()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionStats {
    pub mode: Mode,
    pub constants: Vec<(ConstantKind, usize)>,
    pub images: usize,
    pub vtables: usize,
    pub layouts: usize,
    pub utf8: usize,
    pub monitors: usize,
    pub cells: usize,
    pub cell_bytes: u64,
    pub allocated: usize,
    pub modules: usize,
}

impl SessionStats {
    pub fn constants_of(&self, kind: ConstantKind) -> usize {
        self.constants
            .iter()
            .find(|(k, _)| *k == kind)
            .map_or(0, |(_, n)| *n)
    }
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "mode: {:?}", self.mode)?;
        for (kind, count) in &self.constants {
            if *count > 0 {
                writeln!(f, "  {:<16} {count}", kind.name())?;
            }
        }
        writeln!(f, "images: {}  vtables: {}  layouts: {}", self.images, self.vtables, self.layouts)?;
        writeln!(f, "utf8 records: {}  live monitors: {}", self.utf8, self.monitors)?;
        if self.mode == Mode::AheadOfTime {
            writeln!(f, "cells: {} ({} bytes)", self.cells, self.cell_bytes)?;
        }
        write!(f, "collector: {} bytes, modules: {}", self.allocated, self.modules)
    }
}
