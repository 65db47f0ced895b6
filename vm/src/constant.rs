use jolt_object::{ObjectRef, Value};
use serde::{Deserialize, Serialize};

use crate::class::{ClassId, ConstantValue};

/// Index of a cell in an ahead-of-time module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellId(pub u32);

impl CellId {
    #[inline(always)]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index of an external symbol in an ahead-of-time module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SymbolId(pub u32);

impl SymbolId {
    #[inline(always)]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Numeric payload; floating point values are kept as their bit patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scalar {
    Int(i32),
    Long(i64),
    Float(u32),
    Double(u64),
}

impl Scalar {
    /// Little-endian bytes truncated to `width`.
    pub fn to_bytes(self, width: usize) -> Vec<u8> {
        let raw = match self {
            Self::Int(v) => v as i64 as u64,
            Self::Long(v) => v as u64,
            Self::Float(bits) => bits as u64,
            Self::Double(bits) => bits,
        };
        raw.to_le_bytes()[..width.min(8)].to_vec()
    }
}

/// A materialized reference, as handed to generated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConstRef {
    Null,
    Scalar(Scalar),
    /// Tagged absolute address of a resident value.
    Address(u64),
    /// Untagged entry point of resident code.
    Function(u64),
    Cell(CellId),
    /// Entry `index` of a table cell (a class's method table).
    Element(CellId, u32),
    Symbol(SymbolId),
}

impl ConstRef {
    #[inline]
    pub fn address(addr: usize) -> Self {
        if addr == 0 {
            return Self::Null;
        }
        Self::Address(Value::from_addr(addr).raw())
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self == Self::Null
    }

    /// The tagged value of an `Address`.
    pub fn value(self) -> Option<Value> {
        match self {
            Self::Address(raw) => Some(Value::from_raw(raw)),
            _ => None,
        }
    }

    /// The untagged in-process address of `Address` and `Function`.
    pub fn resident_addr(self) -> Option<usize> {
        match self {
            Self::Address(raw) => Some(Value::from_raw(raw).addr()),
            Self::Function(addr) => Some(addr as usize),
            Self::Null => Some(0),
            _ => None,
        }
    }

    pub fn cell(self) -> Option<CellId> {
        match self {
            Self::Cell(cell) | Self::Element(cell, _) => Some(cell),
            _ => None,
        }
    }
}

/// Something generated code may ask to have materialized.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Constant<'a> {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Utf8(&'a str),
    String(&'a str),
    Class(ClassId),
    /// Array class of the given component.
    ArrayClass(ClassId),
    ConstantPool(ClassId),
    /// Method by declaration index.
    Method(ClassId, u16),
    StaticInstance(ClassId),
    VirtualTable(ClassId),
    /// Inline cache of one call site.
    CallSite {
        class: ClassId,
        name: &'a str,
        descriptor: &'a str,
        site: u32,
    },
    NativeFunction(ClassId, u16),
    FinalObject(ObjectRef),
}

impl Constant<'_> {
    pub fn scalar(&self) -> Option<Scalar> {
        match *self {
            Self::Int(v) => Some(Scalar::Int(v)),
            Self::Long(v) => Some(Scalar::Long(v)),
            Self::Float(v) => Some(Scalar::Float(v.to_bits())),
            Self::Double(v) => Some(Scalar::Double(v.to_bits())),
            _ => None,
        }
    }
}

impl<'a> From<&'a ConstantValue> for Constant<'a> {
    fn from(value: &'a ConstantValue) -> Self {
        match value {
            ConstantValue::Int(v) => Self::Int(*v),
            ConstantValue::Long(v) => Self::Long(*v),
            ConstantValue::Float(v) => Self::Float(*v),
            ConstantValue::Double(v) => Self::Double(*v),
            ConstantValue::String(s) => Self::String(s),
        }
    }
}

/// The dedup cache a constant lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstantKind {
    Class,
    ConstantPool,
    Method,
    String,
    Utf8,
    CallSite,
    StaticInstance,
    VirtualTable,
    ArrayClass,
    FinalObject,
    NativeFunction,
}

impl ConstantKind {
    pub const ALL: [Self; 11] = [
        Self::Class,
        Self::ConstantPool,
        Self::Method,
        Self::String,
        Self::Utf8,
        Self::CallSite,
        Self::StaticInstance,
        Self::VirtualTable,
        Self::ArrayClass,
        Self::FinalObject,
        Self::NativeFunction,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Self::Class => "class",
            Self::ConstantPool => "constant pool",
            Self::Method => "method",
            Self::String => "string",
            Self::Utf8 => "utf8",
            Self::CallSite => "call site",
            Self::StaticInstance => "static instance",
            Self::VirtualTable => "vtable",
            Self::ArrayClass => "array class",
            Self::FinalObject => "final object",
            Self::NativeFunction => "native function",
        }
    }

    #[inline(always)]
    pub(crate) const fn index(self) -> usize {
        self as usize
    }
}

/// Identity of a cached constant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum CacheKey {
    Class(ClassId),
    ConstantPool(ClassId),
    Method(ClassId, u16),
    String(String),
    Utf8(String),
    CallSite(ClassId, String, String, u32),
    StaticInstance(ClassId),
    VirtualTable(ClassId),
    /// The shared vtable of primitive (`false`) or reference (`true`) arrays.
    ArrayVirtualTable(bool),
    ArrayClass(ClassId),
    FinalObject(usize),
    NativeFunction(ClassId, u16),
}

impl CacheKey {
    pub(crate) fn kind(&self) -> ConstantKind {
        match self {
            Self::Class(_) => ConstantKind::Class,
            Self::ConstantPool(_) => ConstantKind::ConstantPool,
            Self::Method(..) => ConstantKind::Method,
            Self::String(_) => ConstantKind::String,
            Self::Utf8(_) => ConstantKind::Utf8,
            Self::CallSite(..) => ConstantKind::CallSite,
            Self::StaticInstance(_) => ConstantKind::StaticInstance,
            Self::VirtualTable(_) | Self::ArrayVirtualTable(_) => ConstantKind::VirtualTable,
            Self::ArrayClass(_) => ConstantKind::ArrayClass,
            Self::FinalObject(_) => ConstantKind::FinalObject,
            Self::NativeFunction(..) => ConstantKind::NativeFunction,
        }
    }
}
