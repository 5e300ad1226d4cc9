//! User-defined type system: class descriptors and typed values.
//!
//! A class describes the shape of persisted nodes; an object is one typed
//! value of a class. Classes have a canonical serialized form (the catalog
//! key) and objects encode to the byte layout their class dictates.

mod class;
mod object;
mod parse;

pub use class::{Class, PrimitiveKind};
pub use object::{Literal, Object, PrimitiveValue, Value};

/// Stable 64-bit identifier of a node within its class.
pub type ObjectId = u64;
