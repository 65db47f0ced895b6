use jolt_object::POINTER_SIZE;

use crate::class::PrimitiveType;
use crate::fatal;

/// A parsed field type descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldType {
    Primitive(PrimitiveType),
    /// `Lname;`
    Object(String),
    /// `[component`
    Array(Box<FieldType>),
}

impl FieldType {
    /// Parses a complete field descriptor.
    ///
    /// Input comes from an already verified class, so anything malformed
    /// is a broken loader invariant.
    pub fn parse(descriptor: &str) -> Self {
        match parse_one(descriptor) {
            Some((ty, "")) => ty,
            _ => fatal!("malformed field descriptor `{descriptor}`"),
        }
    }

    #[inline]
    pub fn is_reference(&self) -> bool {
        !matches!(self, Self::Primitive(_))
    }

    /// Size in bytes inside an object; also the natural alignment.
    pub fn size(&self) -> usize {
        match self {
            Self::Primitive(p) => p.size(),
            Self::Object(_) | Self::Array(_) => POINTER_SIZE,
        }
    }

    pub fn descriptor(&self) -> String {
        match self {
            Self::Primitive(p) => p.descriptor().to_string(),
            Self::Object(name) => format!("L{name};"),
            Self::Array(component) => format!("[{}", component.descriptor()),
        }
    }
}

/// A parsed method descriptor `(params)ret`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodDescriptor {
    pub params: Vec<FieldType>,
    /// `None` for `V`.
    pub ret: Option<FieldType>,
}

impl MethodDescriptor {
    pub fn parse(descriptor: &str) -> Self {
        let Some(mut rest) = descriptor.strip_prefix('(') else {
            fatal!("malformed method descriptor `{descriptor}`");
        };
        let mut params = Vec::new();
        while !rest.starts_with(')') {
            match parse_one(rest) {
                Some((ty, tail)) => {
                    params.push(ty);
                    rest = tail;
                }
                None => fatal!("malformed method descriptor `{descriptor}`"),
            }
        }
        let ret = match &rest[1..] {
            "V" => None,
            ret => match parse_one(ret) {
                Some((ty, "")) => Some(ty),
                _ => fatal!("malformed method return in `{descriptor}`"),
            },
        };
        Self { params, ret }
    }
}

fn parse_one(input: &str) -> Option<(FieldType, &str)> {
    let mut chars = input.chars();
    let first = chars.next()?;
    let rest = chars.as_str();
    if let Some(primitive) = PrimitiveType::from_descriptor(first) {
        return Some((FieldType::Primitive(primitive), rest));
    }
    match first {
        'L' => {
            let end = rest.find(';')?;
            if end == 0 {
                return None;
            }
            Some((FieldType::Object(rest[..end].to_string()), &rest[end + 1..]))
        }
        '[' => {
            let (component, tail) = parse_one(rest)?;
            Some((FieldType::Array(Box::new(component)), tail))
        }
        _ => None,
    }
}
