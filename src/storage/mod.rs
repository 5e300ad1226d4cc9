//! Per-class node storage.
//!
//! The catalog maps a class's canonical serialization to its metadata
//! record; node storages are short-lived views over that record's data
//! page list. Fixed-size classes go through [`ValStorage`], anything
//! containing a string through [`VarStorage`]; both speak the common
//! [`NodeStore`] contract.

mod catalog;
mod slot;
mod val;
mod var;

pub use catalog::{Catalog, CatalogEntry};
pub use val::{ValCursor, ValStorage};
pub use var::{VarCursor, VarStorage};

use std::sync::Arc;

use crate::error::Result;
use crate::pager::PageAllocator;
use crate::types::{Class, Object, ObjectId};

/// One live node read out of a slot.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRecord {
    pub id: ObjectId,
    pub object: Object,
}

/// Common contract of the two storage variants. Predicates and visitors
/// see live nodes in slot order.
pub trait NodeStore {
    /// Persists a node, returning its id.
    fn add(&mut self, object: &Object) -> Result<ObjectId>;

    /// Frees every node matching the predicate; returns how many.
    fn remove_if(&mut self, pred: &mut dyn FnMut(&NodeRecord) -> bool) -> Result<u64>;

    /// Calls `visit` on every node matching the predicate.
    fn visit(
        &mut self,
        pred: &mut dyn FnMut(&NodeRecord) -> bool,
        visit: &mut dyn FnMut(&NodeRecord) -> Result<()>,
    ) -> Result<()>;

    /// Collects every node matching the predicate.
    fn collect_if(&mut self, pred: &mut dyn FnMut(&NodeRecord) -> bool)
        -> Result<Vec<NodeRecord>>;

    /// Frees all data pages and resets the class's node count. The
    /// monotonic id counter is left alone so ids are never reissued.
    fn drop_storage(&mut self) -> Result<()>;
}

/// Storage view for a class, picked by its size determinacy.
pub fn open_store<'a>(
    alloc: &'a mut PageAllocator,
    class: &Arc<Class>,
) -> Result<Box<dyn NodeStore + 'a>> {
    if class.size().is_some() {
        Ok(Box::new(ValStorage::open(alloc, class)?))
    } else {
        Ok(Box::new(VarStorage::open(alloc, class)?))
    }
}
