use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Utf8Id(u32);

impl Utf8Id {
    #[inline(always)]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Resident UTF-8 record; its address is what dynamic-mode code sees.
#[repr(C)]
#[derive(Debug)]
pub struct Utf8 {
    len: usize,
    bytes: Box<[u8]>,
}

impl Utf8 {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes).unwrap_or("<invalid utf-8>")
    }
}

struct Utf8InternerImpl {
    table: Vec<Arc<Utf8>>,
    mappings: AHashMap<Box<[u8]>, Utf8Id>,
}

impl Utf8InternerImpl {
    fn get_or_add(&mut self, value: &[u8]) -> Utf8Id {
        if let Some(&id) = self.mappings.get(value) {
            return id;
        }
        let id = Utf8Id(self.table.len() as u32);
        self.table.push(Arc::new(Utf8 {
            len: value.len(),
            bytes: value.into(),
        }));
        self.mappings.insert(value.into(), id);
        id
    }
}

/// Content-keyed interner: equal bytes always map to the same id and the
/// same resident [`Utf8`] record.
pub struct Utf8Interner(RwLock<Utf8InternerImpl>);

impl Default for Utf8Interner {
    fn default() -> Self {
        Self::new()
    }
}

impl Utf8Interner {
    pub fn new() -> Self {
        Self(RwLock::new(Utf8InternerImpl {
            table: Vec::new(),
            mappings: AHashMap::new(),
        }))
    }

    pub fn intern(&self, value: &str) -> Utf8Id {
        self.intern_bytes(value.as_bytes())
    }

    pub fn intern_bytes(&self, value: &[u8]) -> Utf8Id {
        if let Some(&id) = self.0.read().mappings.get(value) {
            return id;
        }
        self.0.write().get_or_add(value)
    }

    pub fn get(&self, id: Utf8Id) -> Arc<Utf8> {
        match self.0.read().table.get(id.index()) {
            Some(utf8) => utf8.clone(),
            None => crate::fatal!("unknown utf8 {id:?}"),
        }
    }

    pub fn len(&self) -> usize {
        self.0.read().table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
