//! Native images.
//!
//! An image is the layout-exact record of a class that generated code
//! reads: names, display, field and method tables, vtable and static
//! storage references. It is built once per class and backend-agnostic;
//! every reference in it is a [`ConstRef`] of the session's mode.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::class::{AccessFlags, Attribute, ClassKind, RuntimeClass};
use crate::config::Mode;
use crate::constant::{ConstRef, Constant};
use crate::error::Result;
use crate::fatal;
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClassStatus {
    Loaded,
    Linked,
    Initialized,
}

/// Per-class runtime state generated code checks before static access.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mirror {
    pub status: ClassStatus,
    pub initialized: bool,
    /// Static storage, `Null` until allocated.
    pub static_instance: ConstRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeImage {
    pub name: ConstRef,
    pub start: u32,
    pub len: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldImage {
    pub name: ConstRef,
    pub descriptor: ConstRef,
    pub access: AccessFlags,
    /// From the object start, or from the static block start.
    pub offset: u32,
    pub declaring: ConstRef,
    /// Materialized `ConstantValue`, `Null` when absent.
    pub initial_value: ConstRef,
    pub attributes: Vec<AttributeImage>,
}

impl FieldImage {
    pub fn is_static(&self) -> bool {
        self.access.contains(AccessFlags::STATIC)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodImage {
    pub name: ConstRef,
    pub descriptor: ConstRef,
    pub access: AccessFlags,
    /// Declaration index in the class.
    pub index: u16,
    pub vtable_slot: Option<u32>,
    /// Compiled body, `Null` when abstract.
    pub code: ConstRef,
    pub declaring: ConstRef,
    pub attributes: Vec<AttributeImage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassImage {
    pub instance_size: u32,
    pub vtable: ConstRef,
    pub vtable_size: u32,
    pub static_size: u32,
    pub mirror: Mirror,
    /// Instance fields, then static fields.
    pub fields: Vec<FieldImage>,
    /// Instance methods, then static methods.
    pub methods: Vec<MethodImage>,
    pub attributes: Vec<AttributeImage>,
    pub inner: Vec<ConstRef>,
    pub outer: ConstRef,
    pub inner_access: AccessFlags,
    /// Tracer data for instances and for static storage.
    pub reference_offsets: Vec<u32>,
    pub static_reference_offsets: Vec<u32>,
}

impl ClassImage {
    /// Position of a method in [`ClassImage::methods`] by declaration index.
    pub fn method_position(&self, index: u16) -> Option<usize> {
        self.methods.iter().position(|m| m.index == index)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ImageKind {
    Class(ClassImage),
    Array {
        component: ConstRef,
        element_size: u32,
    },
    Primitive {
        size: u32,
    },
}

/// Part shared by every kind of class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommonImage {
    pub name: ConstRef,
    pub access: AccessFlags,
    /// Ancestors, root first, ending with the class itself.
    pub display: Vec<ConstRef>,
    pub depth: u32,
    pub super_class: ConstRef,
    pub interfaces: Vec<ConstRef>,
    /// Loader object, or the loader-init routine of an ahead-of-time module.
    pub loader: ConstRef,
    pub delegatee: ConstRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NativeImage {
    pub common: CommonImage,
    pub kind: ImageKind,
}

impl NativeImage {
    pub fn class_image(&self) -> Option<&ClassImage> {
        match &self.kind {
            ImageKind::Class(image) => Some(image),
            _ => None,
        }
    }

    /// Rewrites every reference in place.
    pub fn map_refs<E>(
        &mut self,
        f: &mut impl FnMut(ConstRef) -> Result<ConstRef, E>,
    ) -> Result<(), E> {
        let common = &mut self.common;
        common.name = f(common.name)?;
        map_all(&mut common.display, f)?;
        common.super_class = f(common.super_class)?;
        map_all(&mut common.interfaces, f)?;
        common.loader = f(common.loader)?;
        common.delegatee = f(common.delegatee)?;

        match &mut self.kind {
            ImageKind::Class(image) => {
                image.vtable = f(image.vtable)?;
                image.mirror.static_instance = f(image.mirror.static_instance)?;
                for field in &mut image.fields {
                    field.name = f(field.name)?;
                    field.descriptor = f(field.descriptor)?;
                    field.declaring = f(field.declaring)?;
                    field.initial_value = f(field.initial_value)?;
                    map_attributes(&mut field.attributes, f)?;
                }
                for method in &mut image.methods {
                    method.name = f(method.name)?;
                    method.descriptor = f(method.descriptor)?;
                    method.code = f(method.code)?;
                    method.declaring = f(method.declaring)?;
                    map_attributes(&mut method.attributes, f)?;
                }
                map_attributes(&mut image.attributes, f)?;
                map_all(&mut image.inner, f)?;
                image.outer = f(image.outer)?;
            }
            ImageKind::Array { component, .. } => *component = f(*component)?,
            ImageKind::Primitive { .. } => {}
        }
        Ok(())
    }
}

fn map_all<E>(
    refs: &mut [ConstRef],
    f: &mut impl FnMut(ConstRef) -> Result<ConstRef, E>,
) -> Result<(), E> {
    for r in refs {
        *r = f(*r)?;
    }
    Ok(())
}

fn map_attributes<E>(
    attributes: &mut [AttributeImage],
    f: &mut impl FnMut(ConstRef) -> Result<ConstRef, E>,
) -> Result<(), E> {
    for attribute in attributes {
        attribute.name = f(attribute.name)?;
    }
    Ok(())
}

// ── builder ────────────────────────────────────────────────────────

/// Assembles the image of `class`, whose own reference is already reserved.
pub(crate) fn build(session: &Session, class: &Arc<RuntimeClass>) -> Result<NativeImage> {
    let mut display = Vec::with_capacity(class.display.len());
    for &ancestor in &class.display {
        display.push(session.class_ref(ancestor)?);
    }
    let super_class = match class.super_class() {
        Some(super_class) => session.class_ref(super_class)?,
        None => ConstRef::Null,
    };
    let mut interfaces = Vec::with_capacity(class.meta.interfaces.len());
    for &interface in &class.meta.interfaces {
        interfaces.push(session.class_ref(interface)?);
    }
    let delegatee = match session.mode() {
        Mode::Dynamic => ConstRef::address(class.delegatee()),
        Mode::AheadOfTime => ConstRef::Null,
    };
    let common = CommonImage {
        name: session.constant(&Constant::Utf8(class.name()))?,
        access: class.meta.access,
        display,
        depth: class.depth as u32,
        super_class,
        interfaces,
        loader: session.loader_ref(class)?,
        delegatee,
    };

    let kind = match class.kind() {
        ClassKind::Primitive(primitive) => ImageKind::Primitive {
            size: primitive.size() as u32,
        },
        ClassKind::Array { component } => ImageKind::Array {
            component: session.class_ref(component)?,
            element_size: session.array_layout(class.id).element_size as u32,
        },
        ClassKind::Class => ImageKind::Class(build_class(session, class)?),
    };
    Ok(NativeImage { common, kind })
}

fn build_class(session: &Session, class: &Arc<RuntimeClass>) -> Result<ClassImage> {
    let this = session.class_ref(class.id)?;
    let layout = session.layout(class.id);
    let vtable = session.vtable(class.id);
    let vtable_ref = session.constant(&Constant::VirtualTable(class.id))?;

    let mut fields = Vec::with_capacity(class.meta.fields.len());
    for statics in [false, true] {
        for (index, field) in class.meta.fields.iter().enumerate() {
            if field.is_static() != statics {
                continue;
            }
            let slots = if statics { &layout.static_fields } else { &layout.fields };
            let Some(slot) = slots.iter().find(|f| f.index == index) else {
                fatal!("{}.{} has no layout slot", class.name(), field.name);
            };
            let initial_value = match &field.constant_value {
                Some(value) => session.constant(&Constant::from(value))?,
                None => ConstRef::Null,
            };
            fields.push(FieldImage {
                name: session.constant(&Constant::Utf8(&field.name))?,
                descriptor: session.constant(&Constant::Utf8(&field.descriptor))?,
                access: field.access,
                offset: slot.offset as u32,
                declaring: this,
                initial_value,
                attributes: attributes(session, &field.attributes)?,
            });
        }
    }

    let mut methods = Vec::with_capacity(class.meta.methods.len());
    for statics in [false, true] {
        for (index, method) in class.meta.methods.iter().enumerate() {
            if method.is_static() != statics {
                continue;
            }
            methods.push(MethodImage {
                name: session.constant(&Constant::Utf8(&method.name))?,
                descriptor: session.constant(&Constant::Utf8(&method.descriptor))?,
                access: method.access,
                index: index as u16,
                vtable_slot: vtable.method_slot(index).map(|slot| slot as u32),
                code: session.code_ref(class, index)?,
                declaring: this,
                attributes: attributes(session, &method.attributes)?,
            });
        }
    }

    let nesting = class.nesting();
    let mut inner = Vec::with_capacity(nesting.inner.len());
    for &id in &nesting.inner {
        inner.push(session.class_ref(id)?);
    }
    let outer = match nesting.outer {
        Some(id) => session.class_ref(id)?,
        None => ConstRef::Null,
    };

    let static_instance = match session.mode() {
        Mode::AheadOfTime if layout.static_size > 0 => {
            session.constant(&Constant::StaticInstance(class.id))?
        }
        _ => ConstRef::address(class.static_instance()),
    };

    Ok(ClassImage {
        instance_size: layout.instance_size as u32,
        vtable: vtable_ref,
        vtable_size: vtable.len() as u32,
        static_size: layout.static_size as u32,
        mirror: Mirror {
            status: ClassStatus::Loaded,
            initialized: false,
            static_instance,
        },
        fields,
        methods,
        attributes: attributes(session, &class.meta.attributes)?,
        inner,
        outer,
        inner_access: nesting.inner_access,
        reference_offsets: layout.reference_offsets.iter().map(|&o| o as u32).collect(),
        static_reference_offsets: layout
            .static_reference_offsets
            .iter()
            .map(|&o| o as u32)
            .collect(),
    })
}

fn attributes(session: &Session, attributes: &[Attribute]) -> Result<Vec<AttributeImage>> {
    attributes
        .iter()
        .map(|attribute| {
            Ok(AttributeImage {
                name: session.constant(&Constant::Utf8(&attribute.name))?,
                start: attribute.start,
                len: attribute.len,
            })
        })
        .collect()
}
