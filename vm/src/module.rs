//! Ahead-of-time modules: persistence and re-publication in a new process.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use ahash::AHashMap;
use jolt_object::{
    ARRAY_ELEMENTS_OFFSET, ArrayHeader, ObjectHeader, ObjectRef, POINTER_SIZE,
};
use serde::{Deserialize, Serialize};

use crate::backend::{ArrayElements, CallSiteCache, FieldValue, StringObject, store};
use crate::class::{ClassId, ClassTable, RuntimeClass};
use crate::config::SessionConfig;
use crate::constant::{CellId, ConstRef, SymbolId};
use crate::descriptor::FieldType;
use crate::error::ImageError;
use crate::image::{ImageKind, NativeImage};
use crate::interner::Utf8Interner;
use crate::vtable::Builtin;

const MODULE_MAGIC: &[u8; 8] = b"JOLTAOT\0";
const MODULE_VERSION: u32 = 1;

/// One relocatable record of an ahead-of-time module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Cell {
    /// Placeholder of a build that has not filled it yet.
    Reserved,
    Utf8(String),
    String {
        utf8: ConstRef,
    },
    Class(Box<NativeImage>),
    VirtualTable(Vec<ConstRef>),
    ConstantPool {
        len: u32,
    },
    CallSite {
        class: ConstRef,
        name: ConstRef,
        descriptor: ConstRef,
    },
    StaticInstance {
        class: ConstRef,
        size: u32,
        fields: Vec<FieldValue>,
    },
    Object {
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

/// Everything a loader needs to find again in the next process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub classes: Vec<(String, CellId)>,
    /// Array classes by descriptor, e.g. `[Ljava/lang/Object;`.
    pub arrays: Vec<(String, CellId)>,
    pub strings: Vec<CellId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AotModule {
    pub name: String,
    pub cells: Vec<Cell>,
    pub symbols: Vec<String>,
    pub manifest: Manifest,
}

impl AotModule {
    pub fn cell(&self, id: CellId) -> Option<&Cell> {
        self.cells.get(id.index())
    }

    pub fn symbol(&self, id: SymbolId) -> Option<&str> {
        self.symbols.get(id.index()).map(String::as_str)
    }

    pub fn class_cell(&self, name: &str) -> Option<CellId> {
        self.manifest
            .classes
            .iter()
            .chain(self.manifest.arrays.iter())
            .find(|(n, _)| n == name)
            .map(|(_, cell)| *cell)
    }

    pub fn class_image(&self, name: &str) -> Option<&NativeImage> {
        match self.cell(self.class_cell(name)?)? {
            Cell::Class(image) => Some(image),
            _ => None,
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ImageError> {
        let mut writer = BufWriter::new(File::create(path)?);
        self.write_to(&mut writer)?;
        writer.flush()?;
        log::debug!("saved module `{}` to {}", self.name, path.display());
        Ok(())
    }

    pub fn write_to(&self, w: &mut dyn Write) -> Result<(), ImageError> {
        w.write_all(MODULE_MAGIC)?;
        write_u32(w, MODULE_VERSION)?;
        bincode::serialize_into(w, self)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ImageError> {
        let mut reader = BufReader::new(File::open(path)?);
        Self::read_from(&mut reader)
    }

    pub fn read_from(r: &mut dyn Read) -> Result<Self, ImageError> {
        let mut magic = [0u8; 8];
        r.read_exact(&mut magic)?;
        if &magic != MODULE_MAGIC {
            return Err(ImageError::BadMagic);
        }
        let version = read_u32(r)?;
        if version != MODULE_VERSION {
            return Err(ImageError::Version(version));
        }
        Ok(bincode::deserialize_from(r)?)
    }
}

fn write_u32(w: &mut dyn Write, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn read_u32(r: &mut dyn Read) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

/// Resolves external code symbols to in-process entry points.
pub type SymbolResolver<'a> = dyn Fn(&str) -> Option<usize> + 'a;

/// Storage a loaded module keeps resident.
enum Resident {
    None,
    Utf8,
    String(Box<StringObject>),
    Words(Box<[u64]>),
    CallSite(Box<CallSiteCache>),
}

/// A module re-published into this process.
pub struct LoadedModule {
    pub name: String,
    addresses: Vec<usize>,
    resident: Vec<Resident>,
    /// Method table entry addresses, by class cell.
    methods: AHashMap<CellId, Vec<usize>>,
    classes: Vec<(ClassId, CellId)>,
    /// Relocated images, published only once every cell is filled.
    images: AHashMap<ClassId, Arc<NativeImage>>,
    strings: Vec<(String, CellId)>,
    utf8: Utf8Interner,
}

impl LoadedModule {
    /// In-process form of a reference recorded in the module.
    pub fn resolve(&self, r: ConstRef) -> Option<ConstRef> {
        match r {
            ConstRef::Cell(cell) => self.addresses.get(cell.index()).map(|&a| ConstRef::address(a)),
            ConstRef::Element(cell, index) => self
                .methods
                .get(&cell)?
                .get(index as usize)
                .map(|&a| ConstRef::address(a)),
            ConstRef::Symbol(_) => None,
            other => Some(other),
        }
    }

    pub fn classes(&self) -> &[(ClassId, CellId)] {
        &self.classes
    }

    /// Interned strings with the resident objects they were loaded into.
    pub fn strings(&self) -> impl Iterator<Item = (&str, ConstRef)> + '_ {
        self.strings
            .iter()
            .map(|(text, cell)| (text.as_str(), ConstRef::address(self.addresses[cell.index()])))
    }

    pub fn string_object(&self, cell: CellId) -> Option<&StringObject> {
        match self.resident.get(cell.index())? {
            Resident::String(object) => Some(object),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// Resident vtable of `class`, staged here or published earlier.
    fn vtable_of(&self, class: &RuntimeClass) -> usize {
        self.images
            .get(&class.id)
            .or_else(|| class.image())
            .and_then(|image| image.class_image())
            .and_then(|c| c.vtable.resident_addr())
            .unwrap_or(0)
    }

    pub fn interned(&self) -> usize {
        self.utf8.len()
    }

    /// Bytes of storage allocated for loaded cells.
    pub fn resident_bytes(&self) -> usize {
        self.resident
            .iter()
            .map(|r| match r {
                Resident::None | Resident::Utf8 => 0,
                Resident::String(_) => size_of::<StringObject>(),
                Resident::Words(words) => words.len() * size_of::<u64>(),
                Resident::CallSite(_) => size_of::<CallSiteCache>(),
            })
            .sum()
    }
}

/// Re-publishes an ahead-of-time module against a freshly loaded class table.
pub struct LoaderInit<'a> {
    classes: &'a ClassTable,
    resolver: Box<SymbolResolver<'a>>,
    loader: usize,
    string_class: String,
}

impl<'a> LoaderInit<'a> {
    pub fn new(classes: &'a ClassTable) -> Self {
        Self {
            classes,
            resolver: Box::new(|_| None),
            loader: 0,
            string_class: SessionConfig::default().string_class,
        }
    }

    pub fn with_string_class(mut self, name: &str) -> Self {
        self.string_class = name.to_string();
        self
    }

    pub fn with_resolver(mut self, resolver: impl Fn(&str) -> Option<usize> + 'a) -> Self {
        self.resolver = Box::new(resolver);
        self
    }

    /// Loader written into every class of the module.
    pub fn with_loader(mut self, loader: usize) -> Self {
        self.loader = loader;
        self
    }

    pub fn run(&self, module: &AotModule) -> Result<Arc<LoadedModule>, ImageError> {
        let count = module.cells.len();
        let mut addresses = vec![0usize; count];
        let mut resident: Vec<Resident> = (0..count).map(|_| Resident::None).collect();
        let mut runtime: AHashMap<CellId, Arc<RuntimeClass>> = AHashMap::new();
        let utf8 = Utf8Interner::new();

        for (name, cell) in module.manifest.classes.iter().chain(&module.manifest.arrays) {
            let Some(id) = self.resolve_class(name) else {
                return Err(ImageError::UnknownClass(name.clone()));
            };
            let class = self.classes.get(id);
            if class.image().is_some() {
                return Err(ImageError::Malformed(format!("`{name}` already has an image")));
            }
            addresses[cell.index()] = class.address();
            runtime.insert(*cell, class);
        }

        // allocate storage first so every cell has an address to relocate to
        for (index, cell) in module.cells.iter().enumerate() {
            let slot = &mut resident[index];
            match cell {
                Cell::Reserved => {
                    return Err(ImageError::Malformed(format!("cell {index} was never filled")));
                }
                Cell::Class(_) => {
                    if !runtime.contains_key(&CellId(index as u32)) {
                        return Err(ImageError::Malformed(format!(
                            "class cell {index} missing from the manifest"
                        )));
                    }
                }
                Cell::Utf8(text) => {
                    addresses[index] = Arc::as_ptr(&utf8.get(utf8.intern(text))) as usize;
                    *slot = Resident::Utf8;
                }
                Cell::String { .. } => {
                    let object = Box::new(StringObject::new(0, 0, 0));
                    addresses[index] = &*object as *const StringObject as usize;
                    *slot = Resident::String(object);
                }
                Cell::VirtualTable(slots) => {
                    *slot = words(slots.len() * POINTER_SIZE, &mut addresses[index]);
                }
                Cell::ConstantPool { len } => {
                    *slot = words((*len as usize).max(1) * POINTER_SIZE, &mut addresses[index]);
                }
                Cell::CallSite { .. } => {
                    let cache = Box::new(CallSiteCache {
                        name: 0,
                        descriptor: 0,
                        class: 0,
                        first: AtomicUsize::new(0),
                    });
                    addresses[index] = &*cache as *const CallSiteCache as usize;
                    *slot = Resident::CallSite(cache);
                }
                Cell::StaticInstance { size, .. } | Cell::Object { size, .. } => {
                    *slot = words(*size as usize, &mut addresses[index]);
                }
                Cell::Array {
                    length, elements, ..
                } => {
                    let element_size = match elements {
                        ArrayElements::References(_) => POINTER_SIZE,
                        ArrayElements::Bytes(bytes) => {
                            bytes.len().checked_div(*length as usize).unwrap_or(0)
                        }
                    };
                    let size = ARRAY_ELEMENTS_OFFSET + element_size * *length as usize;
                    *slot = words(size, &mut addresses[index]);
                }
            }
        }

        let mut loaded = LoadedModule {
            name: module.name.clone(),
            addresses,
            resident,
            methods: AHashMap::new(),
            classes: Vec::new(),
            images: AHashMap::new(),
            strings: Vec::new(),
            utf8,
        };

        self.stage_images(module, &mut loaded, &runtime)?;
        self.fill_cells(module, &mut loaded, &runtime)?;

        let loaded = Arc::new(loaded);
        self.publish(&loaded)?;
        log::debug!(
            "loaded module `{}`: {} cells, {} classes",
            module.name,
            module.cells.len(),
            loaded.classes.len()
        );
        Ok(loaded)
    }

    /// Hands the staged images to their classes. Each class keeps the module
    /// alive, since its image points into the module's storage.
    fn publish(&self, loaded: &Arc<LoadedModule>) -> Result<(), ImageError> {
        for &(id, _) in &loaded.classes {
            let class = self.classes.get(id);
            let image = loaded.images[&id].clone();
            let statics = image
                .class_image()
                .and_then(|c| c.mirror.static_instance.resident_addr());
            if class.image.set(image).is_err() {
                return Err(ImageError::Malformed(format!(
                    "`{}` was published by a concurrent load",
                    class.name()
                )));
            }
            class.module.get_or_init(|| loaded.clone());
            class.set_loader(self.loader);
            if let Some(addr) = statics {
                *class.statics.lock() = addr;
            }
        }
        Ok(())
    }

    fn resolve_class(&self, name: &str) -> Option<ClassId> {
        if !name.starts_with('[') {
            return self.classes.lookup(name);
        }
        self.resolve_type(&FieldType::parse(name))
    }

    fn resolve_type(&self, ty: &FieldType) -> Option<ClassId> {
        match ty {
            FieldType::Primitive(p) => Some(self.classes.primitive(*p)),
            FieldType::Object(name) => self.classes.lookup(name),
            FieldType::Array(component) => {
                let component = self.resolve_type(component)?;
                Some(self.classes.array_of(component))
            }
        }
    }

    fn relocate(
        &self,
        module: &AotModule,
        loaded: &LoadedModule,
        r: ConstRef,
    ) -> Result<ConstRef, ImageError> {
        match r {
            ConstRef::Cell(cell) => match loaded.addresses.get(cell.index()) {
                Some(&addr) => Ok(ConstRef::address(addr)),
                None => Err(ImageError::Malformed(format!("dangling {cell:?}"))),
            },
            ConstRef::Element(..) => loaded
                .resolve(r)
                .ok_or_else(|| ImageError::Malformed(format!("unresolved {r:?}"))),
            ConstRef::Symbol(id) => {
                let Some(name) = module.symbol(id) else {
                    return Err(ImageError::Malformed(format!("dangling {id:?}")));
                };
                if let Some(builtin) = Builtin::from_symbol(name) {
                    return Ok(ConstRef::Function(builtin.address() as u64));
                }
                if name == crate::backend::loader_symbol(&module.name) {
                    return Ok(ConstRef::address(self.loader));
                }
                match (self.resolver)(name) {
                    Some(addr) => Ok(ConstRef::Function(addr as u64)),
                    None => Err(ImageError::UnresolvedSymbol(name.to_string())),
                }
            }
            other => Ok(other),
        }
    }

    fn stage_images(
        &self,
        module: &AotModule,
        loaded: &mut LoadedModule,
        runtime: &AHashMap<CellId, Arc<RuntimeClass>>,
    ) -> Result<(), ImageError> {
        for (name, cell) in module.manifest.classes.iter().chain(&module.manifest.arrays) {
            let Some(Cell::Class(image)) = module.cell(*cell) else {
                return Err(ImageError::Malformed(format!("`{name}` is not a class cell")));
            };
            let class = &runtime[cell];
            let mut image = (**image).clone();
            image.map_refs(&mut |r| self.relocate(module, loaded, r))?;
            if class.delegatee() != 0 {
                image.common.delegatee = ConstRef::address(class.delegatee());
            }

            let image = Arc::new(image);
            if let ImageKind::Class(class_image) = &image.kind {
                let methods = class_image
                    .methods
                    .iter()
                    .map(|m| m as *const _ as usize)
                    .collect();
                loaded.methods.insert(*cell, methods);
            }
            loaded.images.insert(class.id, image);
            loaded.classes.push((class.id, *cell));
        }
        Ok(())
    }

    fn fill_cells(
        &self,
        module: &AotModule,
        loaded: &mut LoadedModule,
        runtime: &AHashMap<CellId, Arc<RuntimeClass>>,
    ) -> Result<(), ImageError> {
        let string_class = match module.manifest.strings.first() {
            Some(_) => self.classes.lookup(&self.string_class).map(|id| self.classes.get(id)),
            None => None,
        };

        for (index, cell) in module.cells.iter().enumerate() {
            let base = loaded.addresses[index] as *mut u8;
            match cell {
                Cell::String { utf8 } => {
                    let text = match utf8.cell().and_then(|c| module.cell(c)) {
                        Some(Cell::Utf8(text)) => text.clone(),
                        _ => return Err(ImageError::Malformed(format!("string cell {index}"))),
                    };
                    let contents = self.relocate(module, loaded, *utf8)?;
                    let class = string_class.as_ref().map_or(0, |c| c.address());
                    let vtable = string_class.as_ref().map_or(0, |c| loaded.vtable_of(c));
                    let Resident::String(object) = &mut loaded.resident[index] else {
                        return Err(ImageError::Malformed(format!("string cell {index}")));
                    };
                    **object =
                        StringObject::new(class, vtable, contents.resident_addr().unwrap_or(0));
                    loaded.strings.push((text, CellId(index as u32)));
                }
                Cell::VirtualTable(slots) => {
                    for (i, slot) in slots.iter().enumerate() {
                        let value = self.relocate(module, loaded, *slot)?;
                        let field = FieldValue {
                            offset: (i * POINTER_SIZE) as u32,
                            width: POINTER_SIZE as u8,
                            value,
                        };
                        // SAFETY: the table was sized to the slot count
                        unsafe { store(base, &field) };
                    }
                }
                Cell::CallSite {
                    class,
                    name,
                    descriptor,
                } => {
                    let addr = |r: ConstRef| -> Result<usize, ImageError> {
                        Ok(self.relocate(module, loaded, r)?.resident_addr().unwrap_or(0))
                    };
                    let (class, name, descriptor) = (addr(*class)?, addr(*name)?, addr(*descriptor)?);
                    if let Resident::CallSite(cache) = &mut loaded.resident[index] {
                        cache.class = class;
                        cache.name = name;
                        cache.descriptor = descriptor;
                    }
                }
                Cell::StaticInstance { fields, .. } => {
                    self.fill_fields(module, loaded, base, fields)?;
                }
                Cell::Object { class, fields, .. } => {
                    self.fill_header(loaded, runtime, base, *class)?;
                    self.fill_fields(module, loaded, base, fields)?;
                }
                Cell::Array {
                    class,
                    length,
                    elements,
                } => {
                    self.fill_header(loaded, runtime, base, *class)?;
                    // SAFETY: sized for an array header above
                    unsafe { &*(base as *const ArrayHeader) }.set_length(*length as usize);
                    match elements {
                        ArrayElements::References(refs) => {
                            for (i, r) in refs.iter().enumerate() {
                                let field = FieldValue {
                                    offset: (ARRAY_ELEMENTS_OFFSET + i * POINTER_SIZE) as u32,
                                    width: POINTER_SIZE as u8,
                                    value: self.relocate(module, loaded, *r)?,
                                };
                                // SAFETY: sized for `length` references
                                unsafe { store(base, &field) };
                            }
                        }
                        ArrayElements::Bytes(bytes) => unsafe {
                            std::ptr::copy_nonoverlapping(
                                bytes.as_ptr(),
                                base.add(ARRAY_ELEMENTS_OFFSET),
                                bytes.len(),
                            );
                        },
                    }
                }
                Cell::Reserved
                | Cell::Utf8(_)
                | Cell::Class(_)
                | Cell::ConstantPool { .. } => {}
            }
        }
        Ok(())
    }

    fn fill_header(
        &self,
        loaded: &LoadedModule,
        runtime: &AHashMap<CellId, Arc<RuntimeClass>>,
        base: *mut u8,
        class: ConstRef,
    ) -> Result<(), ImageError> {
        let Some(runtime_class) = class.cell().and_then(|c| runtime.get(&c)) else {
            return Err(ImageError::Malformed(format!("object of unknown class {class:?}")));
        };
        let vtable = loaded.vtable_of(runtime_class);
        // SAFETY: every object cell is at least a header long
        let header = unsafe { &*(base as *const ObjectHeader) };
        header.set_class(runtime_class.address());
        header.set_vtable(vtable);
        Ok(())
    }

    fn fill_fields(
        &self,
        module: &AotModule,
        loaded: &LoadedModule,
        base: *mut u8,
        fields: &[FieldValue],
    ) -> Result<(), ImageError> {
        for field in fields {
            let value = self.relocate(module, loaded, field.value)?;
            // SAFETY: offsets were taken from the layout the storage was sized by
            unsafe { store(base, &FieldValue { value, ..*field }) };
        }
        Ok(())
    }
}

/// Zeroed, word-aligned storage of at least `size` bytes.
fn words(size: usize, addr: &mut usize) -> Resident {
    let words = vec![0u64; size.div_ceil(8).max(1)].into_boxed_slice();
    *addr = words.as_ptr() as usize;
    Resident::Words(words)
}

/// Header of a loaded final object.
///
/// # Safety
///
/// `obj` must come from [`LoadedModule::resolve`] on a live module.
pub unsafe fn loaded_object(obj: ConstRef) -> Option<ObjectRef> {
    match obj.resident_addr()? {
        0 => None,
        addr => Some(unsafe { ObjectRef::from_addr(addr) }),
    }
}
