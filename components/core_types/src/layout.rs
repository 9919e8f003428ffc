//! The type layout oracle.
//!
//! The collector never interprets object payloads on its own. For every type
//! id it asks a [`TypeLayout`] where the pointer fields are, whether the type
//! has a variable-sized part, where its weak pointer lives and which
//! finalizer to run.
//!
//! [`TypeTable`] is a ready-made oracle backed by a vector of
//! [`TypeDescriptor`]s, used by the command-line driver and the tests.

use crate::gc_ref::{GcRef, TypeId};

/// Finalizer invoked on the mutator side for an object that became
/// unreachable. The object stays valid for the duration of the call.
pub type Finalizer = fn(GcRef);

/// Queries answered by the front-end about the layout of each type.
///
/// All offsets are in bytes relative to the object payload ([`GcRef`]).
/// Answers for a given type id must never change.
pub trait TypeLayout: Send + Sync {
    /// Size in bytes of the fixed part of the payload.
    fn fixed_size(&self, type_id: TypeId) -> usize;

    /// Whether instances carry a variable-sized part after the fixed part.
    fn is_varsize(&self, type_id: TypeId) -> bool;

    /// Offsets of the pointer fields in the fixed part.
    fn offsets_to_pointers(&self, type_id: TypeId) -> Vec<usize>;

    /// Size of one item of the variable-sized part.
    fn varsize_item_size(&self, type_id: TypeId) -> usize;

    /// Offset of the first item of the variable-sized part.
    fn varsize_offset_to_variable_part(&self, type_id: TypeId) -> usize;

    /// Offset of the word holding the number of items.
    fn varsize_offset_to_length(&self, type_id: TypeId) -> usize;

    /// Offsets of pointer fields inside one item of the variable-sized part.
    fn varsize_pointer_offsets(&self, type_id: TypeId) -> Vec<usize>;

    /// Offset of the weak pointer field, if the type is a weak reference.
    fn weakpointer_offset(&self, type_id: TypeId) -> Option<usize>;

    /// Finalizer for instances of the type, if any.
    fn finalizer(&self, type_id: TypeId) -> Option<Finalizer>;

    /// Whether `type_id` names a type the oracle can answer for. The other
    /// queries are only asked about such ids.
    fn is_known(&self, _type_id: TypeId) -> bool {
        true
    }
}

/// Description of one type registered in a [`TypeTable`].
#[derive(Debug, Clone, Default)]
pub struct TypeDescriptor {
    /// Name used in diagnostics.
    pub name: String,
    /// Size of the fixed part.
    pub fixed_size: usize,
    /// Pointer fields of the fixed part.
    pub pointer_offsets: Vec<usize>,
    /// Variable-sized part, if any.
    pub varsize: Option<VarsizeDescriptor>,
    /// Weak pointer field, if any.
    pub weakpointer_offset: Option<usize>,
    /// Finalizer, if any.
    pub finalizer: Option<Finalizer>,
}

/// Variable-sized part of a [`TypeDescriptor`].
#[derive(Debug, Clone, Default)]
pub struct VarsizeDescriptor {
    /// Size of one item.
    pub item_size: usize,
    /// Offset of the first item.
    pub offset_to_variable_part: usize,
    /// Offset of the length word.
    pub offset_to_length: usize,
    /// Pointer fields within one item.
    pub pointer_offsets: Vec<usize>,
}

impl TypeDescriptor {
    /// A fixed-size type with the given payload size and no pointers.
    pub fn fixed(name: &str, fixed_size: usize) -> Self {
        TypeDescriptor {
            name: name.to_string(),
            fixed_size,
            ..Default::default()
        }
    }

    /// Adds pointer fields.
    pub fn with_pointers(mut self, offsets: &[usize]) -> Self {
        self.pointer_offsets.extend_from_slice(offsets);
        self
    }

    /// Makes the type variable-sized.
    pub fn with_varsize(mut self, varsize: VarsizeDescriptor) -> Self {
        self.varsize = Some(varsize);
        self
    }

    /// Marks the field at `offset` as a weak pointer.
    pub fn with_weakpointer(mut self, offset: usize) -> Self {
        self.weakpointer_offset = Some(offset);
        self
    }

    /// Attaches a finalizer.
    pub fn with_finalizer(mut self, finalizer: Finalizer) -> Self {
        self.finalizer = Some(finalizer);
        self
    }
}

/// A [`TypeLayout`] backed by a table indexed by type id.
///
/// # Examples
///
/// ```
/// use core_types::{TypeDescriptor, TypeLayout, TypeTable};
///
/// let mut table = TypeTable::new();
/// let node = table.register(TypeDescriptor::fixed("node", 16).with_pointers(&[0]));
///
/// assert_eq!(table.fixed_size(node), 16);
/// assert_eq!(table.offsets_to_pointers(node), vec![0]);
/// assert!(!table.is_varsize(node));
/// ```
#[derive(Debug, Clone, Default)]
pub struct TypeTable {
    types: Vec<TypeDescriptor>,
}

impl TypeTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        TypeTable { types: Vec::new() }
    }

    /// Registers a type and returns its id.
    pub fn register(&mut self, descriptor: TypeDescriptor) -> TypeId {
        let id = TypeId(self.types.len() as u32);
        self.types.push(descriptor);
        id
    }

    /// Returns the descriptor of a registered type.
    pub fn get(&self, type_id: TypeId) -> Option<&TypeDescriptor> {
        self.types.get(type_id.0 as usize)
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Returns true if no type is registered.
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    fn descriptor(&self, type_id: TypeId) -> &TypeDescriptor {
        match self.types.get(type_id.0 as usize) {
            Some(descriptor) => descriptor,
            None => panic!("unknown {} queried from type table", type_id),
        }
    }

    fn varsize(&self, type_id: TypeId) -> Option<&VarsizeDescriptor> {
        self.descriptor(type_id).varsize.as_ref()
    }
}

impl TypeLayout for TypeTable {
    fn fixed_size(&self, type_id: TypeId) -> usize {
        self.descriptor(type_id).fixed_size
    }

    fn is_varsize(&self, type_id: TypeId) -> bool {
        self.varsize(type_id).is_some()
    }

    fn offsets_to_pointers(&self, type_id: TypeId) -> Vec<usize> {
        self.descriptor(type_id).pointer_offsets.clone()
    }

    fn varsize_item_size(&self, type_id: TypeId) -> usize {
        self.varsize(type_id).map_or(0, |v| v.item_size)
    }

    fn varsize_offset_to_variable_part(&self, type_id: TypeId) -> usize {
        self.varsize(type_id).map_or(0, |v| v.offset_to_variable_part)
    }

    fn varsize_offset_to_length(&self, type_id: TypeId) -> usize {
        self.varsize(type_id).map_or(0, |v| v.offset_to_length)
    }

    fn varsize_pointer_offsets(&self, type_id: TypeId) -> Vec<usize> {
        self.varsize(type_id)
            .map(|v| v.pointer_offsets.clone())
            .unwrap_or_default()
    }

    fn weakpointer_offset(&self, type_id: TypeId) -> Option<usize> {
        self.descriptor(type_id).weakpointer_offset
    }

    fn finalizer(&self, type_id: TypeId) -> Option<Finalizer> {
        self.descriptor(type_id).finalizer
    }

    fn is_known(&self, type_id: TypeId) -> bool {
        self.get(type_id).is_some()
    }
}
