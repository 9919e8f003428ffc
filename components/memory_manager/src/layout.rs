//! Per-type layout answers, resolved once and cached.

use crate::error::{GcError, GcResult};
use crate::header::{GcHeader, HEADER_SIZE, WORD};
use core_types::{Finalizer, GcRef, TypeId, TypeLayout};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Everything the collector needs to know about one type.
#[derive(Debug, Clone)]
pub struct TypeInfo {
    pub fixed_size: usize,
    pub pointer_offsets: Vec<usize>,
    pub varsize: Option<VarsizeInfo>,
    pub weakpointer_offset: Option<usize>,
    pub finalizer: Option<Finalizer>,
}

/// Variable-sized part of a [`TypeInfo`].
#[derive(Debug, Clone)]
pub struct VarsizeInfo {
    pub item_size: usize,
    pub offset_to_variable_part: usize,
    pub offset_to_length: usize,
    pub pointer_offsets: Vec<usize>,
}

impl TypeInfo {
    fn resolve(layout: &dyn TypeLayout, type_id: TypeId) -> TypeInfo {
        let varsize = layout.is_varsize(type_id).then(|| VarsizeInfo {
            item_size: layout.varsize_item_size(type_id),
            offset_to_variable_part: layout.varsize_offset_to_variable_part(type_id),
            offset_to_length: layout.varsize_offset_to_length(type_id),
            pointer_offsets: layout.varsize_pointer_offsets(type_id),
        });
        TypeInfo {
            fixed_size: layout.fixed_size(type_id),
            pointer_offsets: layout.offsets_to_pointers(type_id),
            varsize,
            weakpointer_offset: layout.weakpointer_offset(type_id),
            finalizer: layout.finalizer(type_id),
        }
    }

    /// Payload size of an instance with `length` items.
    pub fn payload_size(&self, length: usize) -> usize {
        match &self.varsize {
            Some(v) => v.offset_to_variable_part + length * v.item_size,
            None => self.fixed_size,
        }
    }
}

/// Caches [`TypeInfo`] per type id in front of the layout oracle.
pub struct LayoutCache {
    layout: Arc<dyn TypeLayout>,
    cache: RwLock<HashMap<TypeId, Arc<TypeInfo>>>,
}

impl LayoutCache {
    pub fn new(layout: Arc<dyn TypeLayout>) -> Self {
        LayoutCache {
            layout,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Layout of `type_id`, querying the oracle on first use.
    pub fn info(&self, type_id: TypeId) -> Arc<TypeInfo> {
        if let Some(info) = self.cache.read().get(&type_id) {
            return info.clone();
        }
        let info = Arc::new(TypeInfo::resolve(self.layout.as_ref(), type_id));
        self.cache
            .write()
            .entry(type_id)
            .or_insert(info)
            .clone()
    }

    /// Like [`info`](Self::info), for ids coming from the allocation API.
    pub fn checked_info(&self, type_id: TypeId) -> GcResult<Arc<TypeInfo>> {
        if !self.cache.read().contains_key(&type_id) && !self.layout.is_known(type_id) {
            return Err(GcError::InvalidRequest(format!("unknown {}", type_id)));
        }
        Ok(self.info(type_id))
    }

    /// Layout of the object `obj`.
    ///
    /// # Safety
    ///
    /// `obj` must be a live managed object.
    pub unsafe fn info_of(&self, obj: GcRef) -> Arc<TypeInfo> {
        self.info(GcHeader::from_ref(obj).type_id())
    }

    /// Total block size of `obj`, header included, rounded to whole words.
    ///
    /// # Safety
    ///
    /// `obj` must be a live managed object.
    pub unsafe fn object_size(&self, obj: GcRef) -> usize {
        let info = self.info_of(obj);
        let length = match &info.varsize {
            Some(v) => obj.read_word(v.offset_to_length),
            None => 0,
        };
        round_up_to_word(HEADER_SIZE + info.payload_size(length))
    }

    /// Calls `f` with the offset of every strong pointer field of `obj`.
    /// The weak pointer field is not reported.
    ///
    /// # Safety
    ///
    /// `obj` must be a live managed object whose length word, if any, is set.
    pub unsafe fn for_each_pointer_offset(&self, obj: GcRef, mut f: impl FnMut(usize)) {
        let info = self.info_of(obj);
        for &offset in &info.pointer_offsets {
            f(offset);
        }
        if let Some(v) = &info.varsize {
            if v.pointer_offsets.is_empty() {
                return;
            }
            let length = obj.read_word(v.offset_to_length);
            for i in 0..length {
                let item = v.offset_to_variable_part + i * v.item_size;
                for &offset in &v.pointer_offsets {
                    f(item + offset);
                }
            }
        }
    }

    /// Calls `f` with every non-null object `obj` points to.
    ///
    /// # Safety
    ///
    /// `obj` must be a live managed object.
    pub unsafe fn trace(&self, obj: GcRef, mut f: impl FnMut(GcRef)) {
        self.for_each_pointer_offset(obj, |offset| {
            if let Some(target) = obj.load_ref(offset) {
                f(target);
            }
        });
    }

    /// Number of types resolved so far.
    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    /// Returns true if no type has been resolved yet.
    pub fn is_empty(&self) -> bool {
        self.cache.read().is_empty()
    }
}

pub(crate) fn round_up_to_word(bytes: usize) -> usize {
    (bytes + WORD - 1) & !(WORD - 1)
}
