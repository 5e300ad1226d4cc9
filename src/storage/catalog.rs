use rand::rngs::OsRng;
use rand::RngCore;
use tracing::debug;

use crate::error::{DbError, Result};
use crate::pager::{
    page_offset, PageAllocator, PageHeader, PageIndex, PageKind, PageList, CLASS_LIST_ANCHOR,
    PAGE_HEADER_SIZE, PAGE_SIZE,
};
use crate::types::Class;

/// On-disk class record: `{magic, node_count, next_id, data page list
/// {head, tail, count}}` followed by the length-prefixed serialized
/// descriptor. Records are packed back to back in catalog pages.
pub const RECORD_HEADER_SIZE: u64 = 48;

const NODE_COUNT_FIELD: u64 = 8;
const NEXT_ID_FIELD: u64 = 16;
const LIST_FIELD: u64 = 24;

/// A class record located in the catalog. The struct is a snapshot; the
/// mutable fields (`node_count`, `next_id`, the data page list) are read
/// and written through the record's file offsets.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub page: PageIndex,
    pub offset: u16,
    pub magic: u64,
    pub node_count: u64,
    pub next_id: u64,
    pub serialized: String,
}

impl CatalogEntry {
    pub fn header_offset(&self) -> u64 {
        page_offset(self.page, self.offset as u64)
    }

    pub fn node_count_offset(&self) -> u64 {
        self.header_offset() + NODE_COUNT_FIELD
    }

    pub fn next_id_offset(&self) -> u64 {
        self.header_offset() + NEXT_ID_FIELD
    }

    /// Anchor of the class's data page list.
    pub fn list_anchor(&self) -> u64 {
        self.header_offset() + LIST_FIELD
    }

    pub fn record_size(&self) -> u64 {
        RECORD_HEADER_SIZE + 4 + self.serialized.len() as u64
    }
}

/// The class catalog: a page list rooted in the superblock holding one
/// record per registered class, in insertion order.
pub struct Catalog<'a> {
    alloc: &'a mut PageAllocator,
}

impl<'a> Catalog<'a> {
    pub fn new(alloc: &'a mut PageAllocator) -> Self {
        Self { alloc }
    }

    fn class_list() -> PageList {
        PageList::new(CLASS_LIST_ANCHOR)
    }

    /// Registers a class under its canonical serialization.
    pub fn add_class(&mut self, class: &Class) -> Result<()> {
        let serialized = class.serialize();
        if self.find_serialized(&serialized)?.is_some() {
            return Err(DbError::AlreadyExists(format!("class {}", class.name())));
        }

        let need = RECORD_HEADER_SIZE + 4 + serialized.len() as u64;
        if PAGE_HEADER_SIZE + need > PAGE_SIZE {
            return Err(DbError::BadArgument(format!(
                "serialized descriptor of class {} does not fit a catalog page",
                class.name()
            )));
        }

        let mut page = self.page_with_room(need)?;
        let magic = OsRng.next_u64();
        let record = page_offset(page.index, page.initialized_offset as u64);
        let file = self.alloc.file_mut();
        file.write_val::<u64>(record, magic)?;
        file.write_val::<u64>(record + NODE_COUNT_FIELD, 0)?;
        file.write_val::<u64>(record + NEXT_ID_FIELD, 0)?;
        file.write_val::<u64>(record + LIST_FIELD, 0)?;
        file.write_val::<u64>(record + LIST_FIELD + 8, 0)?;
        file.write_val::<u64>(record + LIST_FIELD + 16, 0)?;
        let next = file.write_val::<u32>(record + RECORD_HEADER_SIZE, serialized.len() as u32)?;
        file.write_bytes(next, serialized.as_bytes())?;

        page.free_offset += need as u16;
        page.initialized_offset += need as u16;
        page.write(file)?;

        debug!(class = %serialized, page = page.index, "registered class");
        Ok(())
    }

    /// Drops every data page of the class, then erases its record. Records
    /// behind it in the same page slide down; an emptied catalog page goes
    /// back to the allocator.
    pub fn remove_class(&mut self, class: &Class) -> Result<()> {
        let serialized = class.serialize();
        let entry = self
            .find_serialized(&serialized)?
            .ok_or_else(|| DbError::NotFound(format!("class {}", class.name())))?;

        let data_list = PageList::new(entry.list_anchor());
        let mut data_pages = Vec::new();
        let mut iter = data_list.iter(self.alloc.file_mut())?;
        while let Some(header) = iter.next(self.alloc.file_mut())? {
            data_pages.push(header.index);
        }
        for index in data_pages {
            self.alloc.free(index)?;
        }

        let mut page = PageHeader::read(self.alloc.file_mut(), entry.page)?;
        let record_size = entry.record_size();
        let record_end = entry.offset as u64 + record_size;
        let tail_len = page.initialized_offset as u64 - record_end;
        if tail_len > 0 {
            let file = self.alloc.file_mut();
            let tail = file.read_bytes(page_offset(entry.page, record_end), tail_len as usize)?;
            file.write_bytes(page_offset(entry.page, entry.offset as u64), &tail)?;
        }
        page.free_offset -= record_size as u16;
        page.initialized_offset -= record_size as u16;

        if page.initialized_offset as u64 == PAGE_HEADER_SIZE {
            Self::class_list().erase(self.alloc.file_mut(), page.index)?;
            self.alloc.free(page.index)?;
        } else {
            page.write(self.alloc.file_mut())?;
        }

        debug!(class = %serialized, "removed class");
        Ok(())
    }

    pub fn contains(&mut self, class: &Class) -> Result<bool> {
        Ok(self.find(class)?.is_some())
    }

    pub fn find(&mut self, class: &Class) -> Result<Option<CatalogEntry>> {
        self.find_serialized(&class.serialize())
    }

    pub fn find_serialized(&mut self, serialized: &str) -> Result<Option<CatalogEntry>> {
        let mut found = None;
        self.visit_classes(&mut |entry| {
            if entry.serialized == serialized && found.is_none() {
                found = Some(entry.clone());
            }
            Ok(())
        })?;
        Ok(found)
    }

    /// Calls back with every class record in insertion order.
    pub fn visit_classes(
        &mut self,
        f: &mut dyn FnMut(&CatalogEntry) -> Result<()>,
    ) -> Result<()> {
        let file = self.alloc.file_mut();
        let mut pages = Self::class_list().iter(file)?;
        while let Some(page) = pages.next(file)? {
            let mut offset = PAGE_HEADER_SIZE;
            while offset < page.initialized_offset as u64 {
                let entry = read_record(file, page.index, offset as u16)?;
                offset += entry.record_size();
                f(&entry)?;
            }
        }
        Ok(())
    }

    /// Finds a catalog page with `need` free bytes, chaining a new one in
    /// when every existing page is packed.
    fn page_with_room(&mut self, need: u64) -> Result<PageHeader> {
        let file = self.alloc.file_mut();
        let mut pages = Self::class_list().iter(file)?;
        while let Some(page) = pages.next(file)? {
            if page.initialized_offset as u64 + need <= PAGE_SIZE {
                return Ok(page);
            }
        }

        let index = self.alloc.allocate()?;
        let file = self.alloc.file_mut();
        let mut page = PageHeader::read(file, index)?;
        page.kind = PageKind::Catalog;
        page.write(file)?;
        Self::class_list().push_back(file, index)?;
        PageHeader::read(file, index)
    }
}

fn read_record(
    file: &mut crate::file::DbFile,
    page: PageIndex,
    offset: u16,
) -> Result<CatalogEntry> {
    let base = page_offset(page, offset as u64);
    let magic = file.read_val::<u64>(base)?;
    let node_count = file.read_val::<u64>(base + NODE_COUNT_FIELD)?;
    let next_id = file.read_val::<u64>(base + NEXT_ID_FIELD)?;
    let len = file.read_val::<u32>(base + RECORD_HEADER_SIZE)? as usize;
    if offset as u64 + RECORD_HEADER_SIZE + 4 + len as u64 > PAGE_SIZE {
        return Err(DbError::Structure(format!(
            "catalog record at page {page} offset {offset} overruns the page"
        )));
    }
    let bytes = file.read_bytes(base + RECORD_HEADER_SIZE + 4, len)?;
    let serialized = String::from_utf8(bytes)
        .map_err(|_| DbError::Structure("catalog record descriptor is not valid UTF-8".into()))?;
    Ok(CatalogEntry {
        page,
        offset,
        magic,
        node_count,
        next_id,
        serialized,
    })
}
