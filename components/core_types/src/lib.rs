//! Shared vocabulary between the garbage collector and the rest of the
//! runtime.
//!
//! The collector treats the front-end as a set of collaborators that it only
//! talks to through narrow interfaces:
//!
//! - [`GcRef`] - address of a managed object's payload
//! - [`TypeId`] - identifier the layout oracle understands
//! - [`TypeLayout`] - layout oracle (pointer offsets, varsize parts, weak
//!   pointers, finalizers)
//! - [`RootWalker`] - root enumeration callback protocol
//!
//! [`TypeTable`] and [`RootSet`] are simple implementations of the two
//! collaborator traits, good enough for tools and tests.
//!
//! # Examples
//!
//! ```
//! use core_types::{TypeDescriptor, TypeLayout, TypeTable};
//!
//! let mut types = TypeTable::new();
//! let pair = types.register(TypeDescriptor::fixed("pair", 16).with_pointers(&[0, 8]));
//! assert_eq!(types.offsets_to_pointers(pair), vec![0, 8]);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod gc_ref;
mod layout;
mod roots;

pub use gc_ref::{GcRef, TypeId};
pub use layout::{Finalizer, TypeDescriptor, TypeLayout, TypeTable, VarsizeDescriptor};
pub use roots::{RootCallback, RootSet, RootWalker};
