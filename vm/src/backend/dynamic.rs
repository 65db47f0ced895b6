use std::alloc::Layout;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use jolt_object::{ObjectHeader, ObjectRef};

use super::{Backend, Checkpoint, Emitted, ObjectPayload, Payload, store};
use crate::class::{ClassTable, RuntimeClass};
use crate::collector::Collector;
use crate::config::Mode;
use crate::constant::ConstRef;
use crate::error::{AllocError, Result};
use crate::fatal;
use crate::image::{ImageKind, NativeImage};
use crate::interner::Utf8;
use crate::layout::OBJECT_ALIGN;
use crate::module::AotModule;
use crate::vtable::VirtualTable;

/// A resident string constant.
#[repr(C)]
#[derive(Debug)]
pub struct StringObject {
    header: ObjectHeader,
    utf8: usize,
}

impl StringObject {
    pub(crate) fn new(class: usize, vtable: usize, utf8: usize) -> Self {
        Self {
            header: ObjectHeader::new(vtable, class),
            utf8,
        }
    }

    pub fn header(&self) -> &ObjectHeader {
        &self.header
    }

    pub fn utf8(&self) -> &Utf8 {
        // SAFETY: points at an interned record, never freed
        unsafe { &*(self.utf8 as *const Utf8) }
    }

    pub fn as_str(&self) -> &str {
        self.utf8().as_str()
    }
}

/// First-level inline cache of a call site.
#[repr(C)]
#[derive(Debug)]
pub struct CallSiteCache {
    pub name: usize,
    pub descriptor: usize,
    pub class: usize,
    /// Head of the cache node chain, filled in by generated code.
    pub first: AtomicUsize,
}

/// Hands out tagged addresses of values that already live in this process.
///
/// Everything it creates stays resident until the backend is dropped, or
/// for the rest of the process once the session is torn down.
pub struct DynamicBackend {
    collector: Arc<dyn Collector>,
    strings: Vec<Box<StringObject>>,
    vtables: Vec<Box<[usize]>>,
    pools: Vec<Box<[usize]>>,
    call_sites: Vec<Box<CallSiteCache>>,
}

impl DynamicBackend {
    pub fn new(collector: Arc<dyn Collector>) -> Self {
        Self {
            collector,
            strings: Vec::new(),
            vtables: Vec::new(),
            pools: Vec::new(),
            call_sites: Vec::new(),
        }
    }

    /// Allocates and fills static storage once per class, under its lock.
    fn static_instance(
        &mut self,
        class: &RuntimeClass,
        size: usize,
        fields: &[super::FieldValue],
    ) -> Result<ConstRef> {
        let mut statics = class.statics.lock();
        if *statics == 0 {
            let layout = Layout::from_size_align(size, OBJECT_ALIGN)
                .map_err(|_| AllocError { size })?;
            let block = self.collector.allocate(layout, 0)?;
            for field in fields {
                // SAFETY: offsets come from the static layout of `class`
                unsafe { store(block.as_ptr(), field) };
            }
            *statics = block.as_ptr() as usize;
            log::debug!("static storage of {}: {size} bytes", class.name());
        }
        Ok(ConstRef::address(*statics))
    }
}

impl Backend for DynamicBackend {
    fn mode(&self) -> Mode {
        Mode::Dynamic
    }

    fn reserve_class(&mut self, class: &Arc<RuntimeClass>) -> Result<ConstRef> {
        Ok(ConstRef::address(class.address()))
    }

    fn materialize_class(
        &mut self,
        class: &Arc<RuntimeClass>,
        _handle: ConstRef,
        image: NativeImage,
    ) -> Result<Arc<NativeImage>> {
        let image = Arc::new(image);
        let published = class.image.get_or_init(|| image.clone());
        if !Arc::ptr_eq(published, &image) {
            log::debug!("{} was already published, keeping the first image", class.name());
        }
        Ok(published.clone())
    }

    fn materialize_constant(&mut self, payload: Payload<'_>) -> Result<ConstRef> {
        Ok(match payload {
            Payload::Utf8(utf8) => ConstRef::address(Arc::as_ptr(utf8) as usize),
            Payload::String {
                utf8,
                class,
                vtable,
                ..
            } => {
                let Some(utf8) = utf8.resident_addr() else {
                    fatal!("string contents {utf8:?} are not resident");
                };
                let object = Box::new(StringObject::new(class, vtable, utf8));
                let addr = &*object as *const StringObject as usize;
                self.strings.push(object);
                ConstRef::address(addr)
            }
            Payload::ConstantPool { len } => {
                let pool = vec![0usize; (len as usize).max(1)].into_boxed_slice();
                let addr = pool.as_ptr() as usize;
                self.pools.push(pool);
                ConstRef::address(addr)
            }
            Payload::CallSite {
                class,
                name,
                descriptor,
            } => {
                let resident = |r: ConstRef| match r.resident_addr() {
                    Some(addr) => addr,
                    None => fatal!("call site operand {r:?} is not resident"),
                };
                let cache = Box::new(CallSiteCache {
                    name: resident(name),
                    descriptor: resident(descriptor),
                    class: resident(class),
                    first: AtomicUsize::new(0),
                });
                let addr = &*cache as *const CallSiteCache as usize;
                self.call_sites.push(cache);
                ConstRef::address(addr)
            }
            Payload::StaticInstance {
                class,
                size,
                fields,
                ..
            } => self.static_instance(class, size, &fields)?,
            Payload::Method {
                image, position, ..
            } => {
                let ImageKind::Class(class_image) = &image.kind else {
                    fatal!("method constant of a class without methods");
                };
                ConstRef::address(&class_image.methods[position] as *const _ as usize)
            }
            Payload::NativeFunction { class, index } => {
                let method = &class.meta.methods[index];
                if !method.is_native() {
                    fatal!("{}.{} is not native", class.name(), method.name);
                }
                match method.code {
                    Some(code) => ConstRef::Function(code.0 as u64),
                    None => ConstRef::Null,
                }
            }
        })
    }

    fn materialize_vtable(
        &mut self,
        vtable: &VirtualTable,
        _classes: &ClassTable,
    ) -> Result<ConstRef> {
        let words = vtable.resident_words();
        let addr = words.as_ptr() as usize;
        self.vtables.push(words);
        Ok(ConstRef::address(addr))
    }

    fn code_ref(&mut self, class: &RuntimeClass, index: usize) -> Result<ConstRef> {
        Ok(match class.meta.methods[index].code {
            Some(code) => ConstRef::Function(code.0 as u64),
            None => ConstRef::Null,
        })
    }

    fn loader_ref(&mut self, class: &RuntimeClass) -> Result<ConstRef> {
        Ok(ConstRef::address(class.loader()))
    }

    fn reserve_object(&mut self, obj: ObjectRef) -> Result<ConstRef> {
        Ok(ConstRef::address(obj.addr()))
    }

    fn materialize_object(&mut self, _handle: ConstRef, _payload: ObjectPayload) -> Result<()> {
        Ok(())
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint::default()
    }

    fn rollback(&mut self, _checkpoint: Checkpoint) {}

    fn emitted(&self) -> Emitted {
        Emitted::default()
    }

    fn finish(self: Box<Self>) -> Option<AotModule> {
        log::debug!(
            "dynamic backend: {} strings, {} vtables, {} pools, {} call sites stay resident",
            self.strings.len(),
            self.vtables.len(),
            self.pools.len(),
            self.call_sites.len()
        );
        // published images point into the arenas for the rest of the process
        let _arenas = Box::leak(self);
        None
    }
}
