//! Database facade: wires the allocator, class catalog and per-class node
//! storages behind one handle. Single-threaded; a caller sharing a
//! [`Database`] across threads must serialize every call externally.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::Result;
use crate::file::DbFile;
use crate::pager::{PageAllocator, Superblock};
use crate::query::{self, Pattern};
use crate::storage::{open_store, Catalog, NodeRecord};
use crate::types::{Class, Object, ObjectId};


#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenMode {
    /// Open an existing database, failing on a bad superblock.
    Read,
    /// Clear the file and initialize a fresh database.
    Write,
    /// Try `Read`; reinitialize on a structurally broken file.
    #[default]
    Default,
}

pub struct Database {
    alloc: PageAllocator,
}

impl Database {
    pub fn open(path: &Path, mode: OpenMode) -> Result<Self> {
        let file = DbFile::open(path)?;
        Self::with_file(file, mode)
    }

    pub fn with_file(mut file: DbFile, mode: OpenMode) -> Result<Self> {
        let alloc = match mode {
            OpenMode::Read => PageAllocator::open(file)?,
            OpenMode::Write => PageAllocator::init(file)?,
            OpenMode::Default => match Superblock::read(&mut file) {
                Ok(_) => PageAllocator::open(file)?,
                Err(error) if error.is_recoverable_open_failure() => {
                    warn!(%error, "cannot open database for reading, reinitializing");
                    PageAllocator::init(file)?
                }
                Err(error) => return Err(error),
            },
        };
        info!(pages = alloc.pages_count(), "database opened");
        Ok(Self { alloc })
    }

    /// Registers a class descriptor under its canonical serialization.
    pub fn add_class(&mut self, class: &Arc<Class>) -> Result<()> {
        Catalog::new(&mut self.alloc).add_class(class)
    }

    /// Drops every node of the class, then its catalog record.
    pub fn remove_class(&mut self, class: &Arc<Class>) -> Result<()> {
        Catalog::new(&mut self.alloc).remove_class(class)
    }

    pub fn contains_class(&mut self, class: &Arc<Class>) -> Result<bool> {
        Catalog::new(&mut self.alloc).contains(class)
    }

    /// Persists a node, dispatching on the class's size determinacy.
    pub fn add_node(&mut self, object: &Object) -> Result<ObjectId> {
        open_store(&mut self.alloc, object.class())?.add(object)
    }

    /// Live node count of the class, straight from its catalog record.
    pub fn node_count(&mut self, class: &Arc<Class>) -> Result<u64> {
        Catalog::new(&mut self.alloc)
            .find(class)?
            .map(|entry| entry.node_count)
            .ok_or_else(|| crate::error::DbError::NotFound(format!("class {}", class.name())))
    }

    pub fn remove_nodes_if(
        &mut self,
        class: &Arc<Class>,
        mut pred: impl FnMut(&NodeRecord) -> bool,
    ) -> Result<u64> {
        open_store(&mut self.alloc, class)?.remove_if(&mut pred)
    }

    pub fn visit_nodes(
        &mut self,
        class: &Arc<Class>,
        mut pred: impl FnMut(&NodeRecord) -> bool,
        mut visit: impl FnMut(&NodeRecord) -> Result<()>,
    ) -> Result<()> {
        open_store(&mut self.alloc, class)?.visit(&mut pred, &mut visit)
    }

    pub fn collect_nodes_if(
        &mut self,
        class: &Arc<Class>,
        mut pred: impl FnMut(&NodeRecord) -> bool,
    ) -> Result<Vec<NodeRecord>> {
        open_store(&mut self.alloc, class)?.collect_if(&mut pred)
    }

    pub fn print_all_classes(&mut self, out: &mut dyn Write) -> Result<()> {
        Catalog::new(&mut self.alloc).visit_classes(&mut |entry| {
            writeln!(out, "[ {} ] {}", entry.page, entry.serialized)?;
            Ok(())
        })
    }

    pub fn print_all_nodes(&mut self, class: &Arc<Class>, out: &mut dyn Write) -> Result<()> {
        self.print_nodes_if(class, |_| true, out)
    }

    pub fn print_nodes_if(
        &mut self,
        class: &Arc<Class>,
        pred: impl FnMut(&NodeRecord) -> bool,
        out: &mut dyn Write,
    ) -> Result<()> {
        self.visit_nodes(class, pred, |record| {
            writeln!(out, "[ {} ] {}", record.id, record.object)?;
            Ok(())
        })
    }

    /// Runs a pattern over the live graph; every matching row goes to the
    /// sink as a struct of (center, leaf...) nodes.
    pub fn pattern_match(
        &mut self,
        pattern: &Pattern,
        mut sink: impl FnMut(Object) -> Result<()>,
    ) -> Result<()> {
        query::pattern_match(&mut self.alloc, pattern, &mut sink)
    }
}
