use std::sync::Arc;

use ahash::AHashMap;
use jolt_object::ObjectRef;

use super::{Backend, Checkpoint, Emitted, ObjectPayload, Payload, loader_symbol, mangle};
use crate::class::{ClassKind, ClassTable, RuntimeClass};
use crate::config::{Mode, SessionConfig};
use crate::constant::{CellId, ConstRef, SymbolId};
use crate::error::{Result, RuntimeError};
use crate::fatal;
use crate::image::NativeImage;
use crate::module::{AotModule, Cell, Manifest};
use crate::vtable::{SlotTarget, VirtualTable};

/// Emits relocatable cells into a module under construction.
pub struct AotBackend {
    name: String,
    max_cells: Option<usize>,
    cells: Vec<Cell>,
    symbols: Vec<String>,
    symbol_ids: AHashMap<String, SymbolId>,
    manifest: Manifest,
}

impl AotBackend {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            name: config.module_name.clone(),
            max_cells: config.max_cells,
            cells: Vec::new(),
            symbols: Vec::new(),
            symbol_ids: AHashMap::new(),
            manifest: Manifest::default(),
        }
    }

    fn push(&mut self, cell: Cell) -> Result<CellId> {
        if let Some(max) = self.max_cells {
            if self.cells.len() >= max {
                return Err(RuntimeError::OutOfMemory(format!(
                    "module `{}` is limited to {max} cells",
                    self.name
                )));
            }
        }
        let id = CellId(self.cells.len() as u32);
        self.cells.push(cell);
        Ok(id)
    }

    fn fill(&mut self, handle: ConstRef, cell: Cell) {
        let Some(id) = handle.cell() else {
            fatal!("filling {handle:?}, which is not a cell");
        };
        match self.cells.get_mut(id.index()) {
            Some(slot @ Cell::Reserved) => *slot = cell,
            Some(other) => fatal!("cell {id:?} filled twice (holds {other:?})"),
            None => fatal!("cell {id:?} does not exist"),
        }
    }

    fn symbol(&mut self, name: String) -> SymbolId {
        if let Some(&id) = self.symbol_ids.get(&name) {
            return id;
        }
        let id = SymbolId(self.symbols.len() as u32);
        self.symbols.push(name.clone());
        self.symbol_ids.insert(name, id);
        id
    }

    fn method_symbol(&mut self, class: &RuntimeClass, index: usize) -> SymbolId {
        let method = &class.meta.methods[index];
        self.symbol(mangle(class.name(), &method.name, &method.descriptor))
    }
}

impl Backend for AotBackend {
    fn mode(&self) -> Mode {
        Mode::AheadOfTime
    }

    fn reserve_class(&mut self, class: &Arc<RuntimeClass>) -> Result<ConstRef> {
        let cell = self.push(Cell::Reserved)?;
        let entry = (class.name().to_string(), cell);
        match class.kind() {
            ClassKind::Array { .. } => self.manifest.arrays.push(entry),
            ClassKind::Class | ClassKind::Primitive(_) => self.manifest.classes.push(entry),
        }
        Ok(ConstRef::Cell(cell))
    }

    fn materialize_class(
        &mut self,
        _class: &Arc<RuntimeClass>,
        handle: ConstRef,
        image: NativeImage,
    ) -> Result<Arc<NativeImage>> {
        self.fill(handle, Cell::Class(Box::new(image.clone())));
        Ok(Arc::new(image))
    }

    fn materialize_constant(&mut self, payload: Payload<'_>) -> Result<ConstRef> {
        Ok(match payload {
            Payload::Utf8(utf8) => ConstRef::Cell(self.push(Cell::Utf8(utf8.as_str().to_string()))?),
            Payload::String { utf8, .. } => {
                let cell = self.push(Cell::String { utf8 })?;
                self.manifest.strings.push(cell);
                ConstRef::Cell(cell)
            }
            Payload::ConstantPool { len } => ConstRef::Cell(self.push(Cell::ConstantPool { len })?),
            Payload::CallSite {
                class,
                name,
                descriptor,
            } => ConstRef::Cell(self.push(Cell::CallSite {
                class,
                name,
                descriptor,
            })?),
            Payload::StaticInstance {
                class_ref,
                size,
                fields,
                ..
            } => ConstRef::Cell(self.push(Cell::StaticInstance {
                class: class_ref,
                size: size as u32,
                fields,
            })?),
            Payload::Method { class, position, .. } => match class.cell() {
                Some(cell) => ConstRef::Element(cell, position as u32),
                None => fatal!("method table of {class:?} is not a cell"),
            },
            Payload::NativeFunction { class, index } => {
                if !class.meta.methods[index].is_native() {
                    fatal!("{}.{} is not native", class.name(), class.meta.methods[index].name);
                }
                ConstRef::Symbol(self.method_symbol(class, index))
            }
        })
    }

    fn materialize_vtable(
        &mut self,
        vtable: &VirtualTable,
        classes: &ClassTable,
    ) -> Result<ConstRef> {
        let mut slots = Vec::with_capacity(vtable.len());
        for slot in vtable.slots() {
            slots.push(match (slot.target, slot.method) {
                (SlotTarget::Null, _) => ConstRef::Null,
                (SlotTarget::Builtin(builtin), _) => {
                    ConstRef::Symbol(self.symbol(builtin.symbol().to_string()))
                }
                (SlotTarget::Code(_), Some(method)) => {
                    let class = classes.get(method.class);
                    ConstRef::Symbol(self.method_symbol(&class, method.index as usize))
                }
                (SlotTarget::Code(_), None) => fatal!("code slot without a method"),
            });
        }
        Ok(ConstRef::Cell(self.push(Cell::VirtualTable(slots))?))
    }

    fn code_ref(&mut self, class: &RuntimeClass, index: usize) -> Result<ConstRef> {
        Ok(match class.meta.methods[index].code {
            Some(_) => ConstRef::Symbol(self.method_symbol(class, index)),
            None => ConstRef::Null,
        })
    }

    fn loader_ref(&mut self, _class: &RuntimeClass) -> Result<ConstRef> {
        let symbol = loader_symbol(&self.name);
        Ok(ConstRef::Symbol(self.symbol(symbol)))
    }

    fn reserve_object(&mut self, _obj: ObjectRef) -> Result<ConstRef> {
        Ok(ConstRef::Cell(self.push(Cell::Reserved)?))
    }

    fn materialize_object(&mut self, handle: ConstRef, payload: ObjectPayload) -> Result<()> {
        let cell = match payload {
            ObjectPayload::Instance {
                class,
                size,
                fields,
            } => Cell::Object {
                class,
                size,
                fields,
            },
            ObjectPayload::Array {
                class,
                length,
                elements,
            } => Cell::Array {
                class,
                length,
                elements,
            },
        };
        self.fill(handle, cell);
        Ok(())
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            cells: self.cells.len(),
            symbols: self.symbols.len(),
            classes: self.manifest.classes.len(),
            arrays: self.manifest.arrays.len(),
            strings: self.manifest.strings.len(),
        }
    }

    fn rollback(&mut self, checkpoint: Checkpoint) {
        log::debug!(
            "rolling back {} cells of module `{}`",
            self.cells.len() - checkpoint.cells,
            self.name
        );
        self.cells.truncate(checkpoint.cells);
        for name in self.symbols.drain(checkpoint.symbols..) {
            self.symbol_ids.remove(&name);
        }
        self.manifest.classes.truncate(checkpoint.classes);
        self.manifest.arrays.truncate(checkpoint.arrays);
        self.manifest.strings.truncate(checkpoint.strings);
    }

    fn emitted(&self) -> Emitted {
        Emitted {
            cells: self.cells.len(),
            bytes: bincode::serialized_size(&self.cells).unwrap_or(0),
        }
    }

    fn finish(self: Box<Self>) -> Option<AotModule> {
        let this = *self;
        if let Some(index) = this.cells.iter().position(|c| matches!(c, Cell::Reserved)) {
            fatal!("module `{}` finished with cell {index} still reserved", this.name);
        }
        log::debug!(
            "module `{}`: {} cells, {} symbols, {} classes",
            this.name,
            this.cells.len(),
            this.symbols.len(),
            this.manifest.classes.len() + this.manifest.arrays.len()
        );
        Some(AotModule {
            name: this.name,
            cells: this.cells,
            symbols: this.symbols,
            manifest: this.manifest,
        })
    }
}
