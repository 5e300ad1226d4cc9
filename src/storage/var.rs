use std::sync::Arc;

use tracing::trace;

use crate::error::{DbError, Result};
use crate::pager::{
    page_offset, PageAllocator, PageHeader, PageIndex, PageList, NO_PAGE, PAGE_HEADER_SIZE,
    PAGE_SIZE,
};
use crate::storage::slot::{
    self, SlotTag, FREE_CHAIN_END, FREE_LINK_SIZE, SLOT_ID_OFFSET, VAR_SLOT_HEADER,
};
use crate::storage::{Catalog, CatalogEntry, NodeRecord, NodeStore};
use crate::types::{Class, Object, ObjectId};

/// Node storage for classes without a determinate size. Each slot records
/// its payload capacity after the id, so iteration can step over freed
/// slots and reuse keeps the original footprint (a smaller object written
/// into a reclaimed slot never moves its neighbors). Ids come from the
/// class's monotonic counter and are never reissued.
pub struct VarStorage<'a> {
    alloc: &'a mut PageAllocator,
    class: Arc<Class>,
    entry: CatalogEntry,
}

#[derive(Debug, Clone, Copy)]
struct Pos {
    page: PageHeader,
    offset: u64,
}

/// A reclaimable slot found by the first-fit scan, with enough context to
/// unlink it from the page's free chain.
struct FreeFit {
    offset: u64,
    prev: Option<u64>,
    stored_next: u32,
}

#[derive(Debug, Clone, Copy)]
enum CursorState {
    Before,
    At(Pos, ObjectId),
    End,
}

/// Bidirectional cursor over the live nodes of a [`VarStorage`]. Slots
/// are variable-width, so retreating rescans the page from its start to
/// find the preceding slot.
#[derive(Debug, Clone, Copy)]
pub struct VarCursor {
    state: CursorState,
}

impl VarCursor {
    pub fn id(&self) -> Option<ObjectId> {
        match self.state {
            CursorState::At(_, id) => Some(id),
            _ => None,
        }
    }

    pub fn page(&self) -> Option<u64> {
        match self.state {
            CursorState::At(pos, _) => Some(pos.page.index),
            _ => None,
        }
    }

    pub fn in_page_offset(&self) -> Option<u64> {
        match self.state {
            CursorState::At(pos, _) => Some(pos.offset),
            _ => None,
        }
    }
}

impl<'a> VarStorage<'a> {
    pub fn open(alloc: &'a mut PageAllocator, class: &Arc<Class>) -> Result<Self> {
        if class.size().is_some() {
            return Err(DbError::Runtime(format!(
                "class {} is fixed-size, use the value storage",
                class.name()
            )));
        }
        let entry = Catalog::new(&mut *alloc)
            .find(class)?
            .ok_or_else(|| DbError::NotFound(format!("class {}", class.name())))?;
        Ok(Self {
            alloc,
            class: class.clone(),
            entry,
        })
    }

    pub fn node_count(&self) -> u64 {
        self.entry.node_count
    }

    fn list(&self) -> PageList {
        PageList::new(self.entry.list_anchor())
    }

    fn set_node_count(&mut self, count: u64) -> Result<()> {
        self.entry.node_count = count;
        self.alloc
            .file_mut()
            .write_val::<u64>(self.entry.node_count_offset(), count)?;
        Ok(())
    }

    fn take_next_id(&mut self) -> Result<ObjectId> {
        let id = self.entry.next_id;
        self.entry.next_id = id + 1;
        self.alloc
            .file_mut()
            .write_val::<u64>(self.entry.next_id_offset(), id + 1)?;
        Ok(id)
    }

    fn first_pos(&mut self) -> Result<Option<Pos>> {
        let head = self.list().head(self.alloc.file_mut())?;
        if head == NO_PAGE {
            return Ok(None);
        }
        let page = PageHeader::read(self.alloc.file_mut(), head)?;
        self.normalize(Pos {
            page,
            offset: PAGE_HEADER_SIZE,
        })
    }

    fn normalize(&mut self, mut pos: Pos) -> Result<Option<Pos>> {
        loop {
            if pos.offset < pos.page.initialized_offset as u64 {
                return Ok(Some(pos));
            }
            if pos.page.next == NO_PAGE {
                return Ok(None);
            }
            pos = Pos {
                page: PageHeader::read(self.alloc.file_mut(), pos.page.next)?,
                offset: PAGE_HEADER_SIZE,
            };
        }
    }

    fn capacity_at(&mut self, pos: &Pos) -> Result<u64> {
        let base = page_offset(pos.page.index, pos.offset);
        Ok(self.alloc.file_mut().read_val::<u32>(base + SLOT_ID_OFFSET + 8)? as u64)
    }

    /// Steps over the slot at `pos`, whatever its tag; the stride comes
    /// from the recorded capacity.
    fn advance(&mut self, pos: Pos) -> Result<Option<Pos>> {
        let capacity = self.capacity_at(&pos)?;
        self.normalize(Pos {
            offset: pos.offset + VAR_SLOT_HEADER + capacity,
            ..pos
        })
    }

    fn next_live(&mut self, pos: Option<Pos>) -> Result<Option<Pos>> {
        let mut cursor = match pos {
            None => self.first_pos()?,
            Some(p) => self.advance(p)?,
        };
        while let Some(p) = cursor {
            let tag = self
                .alloc
                .file_mut()
                .read_val::<u64>(page_offset(p.page.index, p.offset))?;
            match slot::classify(tag, self.entry.magic) {
                SlotTag::Live => return Ok(Some(p)),
                SlotTag::Free => cursor = self.advance(p)?,
                SlotTag::Uninit => {
                    return Err(DbError::Runtime(format!(
                        "unrecognized slot tag in page {} at offset {}",
                        p.page.index, p.offset
                    )))
                }
            }
        }
        Ok(None)
    }

    /// Offset of the slot preceding `before` in the page, found by
    /// walking strides from the start of the slot region.
    fn prev_slot_in_page(&mut self, page: &PageHeader, before: u64) -> Result<u64> {
        let mut offset = PAGE_HEADER_SIZE;
        loop {
            let capacity = self.capacity_at(&Pos { page: *page, offset })?;
            let next = offset + VAR_SLOT_HEADER + capacity;
            if next >= before {
                return Ok(offset);
            }
            offset = next;
        }
    }

    /// Last initialized slot of the storage, or `None` when empty.
    fn last_pos(&mut self) -> Result<Option<Pos>> {
        let tail = self.list().tail(self.alloc.file_mut())?;
        if tail == NO_PAGE {
            return Ok(None);
        }
        let mut page = PageHeader::read(self.alloc.file_mut(), tail)?;
        loop {
            if page.initialized_offset as u64 > PAGE_HEADER_SIZE {
                let offset = self.prev_slot_in_page(&page, page.initialized_offset as u64)?;
                return Ok(Some(Pos { page, offset }));
            }
            if page.prev == NO_PAGE {
                return Ok(None);
            }
            page = PageHeader::read(self.alloc.file_mut(), page.prev)?;
        }
    }

    fn retreat(&mut self, pos: Pos) -> Result<Option<Pos>> {
        if pos.offset > PAGE_HEADER_SIZE {
            let offset = self.prev_slot_in_page(&pos.page, pos.offset)?;
            return Ok(Some(Pos { offset, ..pos }));
        }
        let mut page = pos.page;
        loop {
            if page.prev == NO_PAGE {
                return Ok(None);
            }
            page = PageHeader::read(self.alloc.file_mut(), page.prev)?;
            if page.initialized_offset as u64 > PAGE_HEADER_SIZE {
                let offset = self.prev_slot_in_page(&page, page.initialized_offset as u64)?;
                return Ok(Some(Pos { page, offset }));
            }
        }
    }

    fn prev_live(&mut self, pos: Option<Pos>) -> Result<Option<Pos>> {
        let mut cursor = match pos {
            None => self.last_pos()?,
            Some(p) => self.retreat(p)?,
        };
        while let Some(p) = cursor {
            let tag = self
                .alloc
                .file_mut()
                .read_val::<u64>(page_offset(p.page.index, p.offset))?;
            match slot::classify(tag, self.entry.magic) {
                SlotTag::Live => return Ok(Some(p)),
                SlotTag::Free => cursor = self.retreat(p)?,
                SlotTag::Uninit => {
                    return Err(DbError::Runtime(format!(
                        "unrecognized slot tag in page {} at offset {}",
                        p.page.index, p.offset
                    )))
                }
            }
        }
        Ok(None)
    }

    /// Cursor resting before the first node.
    pub fn cursor(&self) -> VarCursor {
        VarCursor {
            state: CursorState::Before,
        }
    }

    /// Cursor resting past the last node.
    pub fn cursor_at_end(&self) -> VarCursor {
        VarCursor {
            state: CursorState::End,
        }
    }

    /// Advances to the next live node, re-reading it from the file.
    pub fn cursor_next(&mut self, cursor: &mut VarCursor) -> Result<Option<NodeRecord>> {
        let next = match cursor.state {
            CursorState::Before => self.next_live(None)?,
            CursorState::At(pos, _) => self.next_live(Some(pos))?,
            CursorState::End => None,
        };
        match next {
            Some(pos) => {
                let record = self.read_record(&pos)?;
                cursor.state = CursorState::At(pos, record.id);
                Ok(Some(record))
            }
            None => {
                cursor.state = CursorState::End;
                Ok(None)
            }
        }
    }

    /// Retreats to the previous live node.
    pub fn cursor_prev(&mut self, cursor: &mut VarCursor) -> Result<Option<NodeRecord>> {
        let prev = match cursor.state {
            CursorState::End => self.prev_live(None)?,
            CursorState::At(pos, _) => self.prev_live(Some(pos))?,
            CursorState::Before => None,
        };
        match prev {
            Some(pos) => {
                let record = self.read_record(&pos)?;
                cursor.state = CursorState::At(pos, record.id);
                Ok(Some(record))
            }
            None => {
                cursor.state = CursorState::Before;
                Ok(None)
            }
        }
    }

    fn read_record(&mut self, pos: &Pos) -> Result<NodeRecord> {
        let base = page_offset(pos.page.index, pos.offset);
        let id = self.alloc.file_mut().read_val::<u64>(base + SLOT_ID_OFFSET)?;
        let class = self.class.clone();
        let object = Object::read_at(&class, self.alloc.file_mut(), base + VAR_SLOT_HEADER)?;
        Ok(NodeRecord { id, object })
    }

    fn free_slot(&mut self, pos: &Pos) -> Result<()> {
        let mut page = PageHeader::read(self.alloc.file_mut(), pos.page.index)?;
        let next = slot::chain_next_for_free(&page);
        let base = page_offset(page.index, pos.offset);
        let magic = self.entry.magic;
        let file = self.alloc.file_mut();
        file.write_val::<u64>(base, !magic)?;
        // capacity stays; only the tag and the chain link change
        file.write_val::<u32>(base + VAR_SLOT_HEADER, next)?;
        page.free_offset = pos.offset as u16;
        page.write(file)?;
        Ok(())
    }

    /// First-fit over the page's free chain: the first freed slot whose
    /// recorded capacity covers `needed`.
    fn find_free_fit(&mut self, page: &PageHeader, needed: u64) -> Result<Option<FreeFit>> {
        let mut prev = None;
        let mut cursor = if page.free_offset < page.initialized_offset {
            Some(page.free_offset as u64)
        } else {
            None
        };
        while let Some(offset) = cursor {
            let base = page_offset(page.index, offset);
            let file = self.alloc.file_mut();
            let tag = file.read_val::<u64>(base)?;
            if slot::classify(tag, self.entry.magic) != SlotTag::Free {
                return Err(DbError::Runtime(format!(
                    "free chain of page {} reaches a non-free slot at {offset}",
                    page.index
                )));
            }
            let capacity = file.read_val::<u32>(base + SLOT_ID_OFFSET + 8)? as u64;
            let stored_next = file.read_val::<u32>(base + VAR_SLOT_HEADER)?;
            if capacity >= needed {
                return Ok(Some(FreeFit {
                    offset,
                    prev,
                    stored_next,
                }));
            }
            prev = Some(offset);
            cursor = if stored_next == FREE_CHAIN_END {
                None
            } else {
                Some(stored_next as u64)
            };
        }
        Ok(None)
    }

    fn write_live_slot(
        &mut self,
        page: PageIndex,
        offset: u64,
        id: ObjectId,
        capacity: Option<u64>,
        object: &Object,
    ) -> Result<()> {
        let base = page_offset(page, offset);
        let magic = self.entry.magic;
        let file = self.alloc.file_mut();
        file.write_val::<u64>(base, magic)?;
        file.write_val::<u64>(base + SLOT_ID_OFFSET, id)?;
        if let Some(capacity) = capacity {
            file.write_val::<u32>(base + SLOT_ID_OFFSET + 8, capacity as u32)?;
        }
        object.write_at(file, base + VAR_SLOT_HEADER)?;
        Ok(())
    }

    fn add_node(&mut self, object: &Object) -> Result<ObjectId> {
        let needed = object.size().max(FREE_LINK_SIZE);
        let slot_total = VAR_SLOT_HEADER + needed;
        if PAGE_HEADER_SIZE + slot_total > PAGE_SIZE {
            return Err(DbError::NotImplemented("object does not fit a data page"));
        }

        let list = self.list();
        let mut reuse = None;
        let mut carve = None;
        let mut pages = list.iter(self.alloc.file_mut())?;
        while let Some(page) = pages.next(self.alloc.file_mut())? {
            if let Some(fit) = self.find_free_fit(&page, needed)? {
                reuse = Some((page, fit));
                break;
            }
            if page.initialized_offset as u64 + slot_total <= PAGE_SIZE {
                carve = Some(page);
                break;
            }
        }

        let id = self.take_next_id()?;
        if let Some((mut page, fit)) = reuse {
            self.write_live_slot(page.index, fit.offset, id, None, object)?;
            match fit.prev {
                None => {
                    page.free_offset = slot::chain_head_after_pop(fit.stored_next, &page);
                    page.write(self.alloc.file_mut())?;
                }
                Some(prev) => {
                    self.alloc.file_mut().write_val::<u32>(
                        page_offset(page.index, prev + VAR_SLOT_HEADER),
                        fit.stored_next,
                    )?;
                }
            }
        } else {
            let mut page = match carve {
                Some(page) => page,
                None => {
                    let index = self.alloc.allocate()?;
                    list.push_back(self.alloc.file_mut(), index)?;
                    PageHeader::read(self.alloc.file_mut(), index)?
                }
            };
            let offset = page.initialized_offset as u64;
            self.write_live_slot(page.index, offset, id, Some(needed), object)?;
            if page.free_offset == page.initialized_offset {
                page.free_offset += slot_total as u16;
            }
            page.initialized_offset += slot_total as u16;
            page.write(self.alloc.file_mut())?;
        }

        self.set_node_count(self.entry.node_count + 1)?;
        trace!(id, class = %self.entry.serialized, "added node");
        Ok(id)
    }
}

impl NodeStore for VarStorage<'_> {
    fn add(&mut self, object: &Object) -> Result<ObjectId> {
        self.add_node(object)
    }

    fn remove_if(&mut self, pred: &mut dyn FnMut(&NodeRecord) -> bool) -> Result<u64> {
        let mut removed = 0;
        let mut pos = self.next_live(None)?;
        while let Some(p) = pos {
            let record = self.read_record(&p)?;
            if pred(&record) {
                self.free_slot(&p)?;
                removed += 1;
                trace!(id = record.id, "removed node");
            }
            pos = self.next_live(Some(p))?;
        }
        if removed > 0 {
            self.set_node_count(self.entry.node_count - removed)?;
        }
        Ok(removed)
    }

    fn visit(
        &mut self,
        pred: &mut dyn FnMut(&NodeRecord) -> bool,
        visit: &mut dyn FnMut(&NodeRecord) -> Result<()>,
    ) -> Result<()> {
        let mut pos = self.next_live(None)?;
        while let Some(p) = pos {
            let record = self.read_record(&p)?;
            if pred(&record) {
                visit(&record)?;
            }
            pos = self.next_live(Some(p))?;
        }
        Ok(())
    }

    fn collect_if(
        &mut self,
        pred: &mut dyn FnMut(&NodeRecord) -> bool,
    ) -> Result<Vec<NodeRecord>> {
        let mut records = Vec::new();
        self.visit(pred, &mut |record| {
            records.push(record.clone());
            Ok(())
        })?;
        Ok(records)
    }

    fn drop_storage(&mut self) -> Result<()> {
        let list = self.list();
        let mut pages = Vec::new();
        let mut iter = list.iter(self.alloc.file_mut())?;
        while let Some(page) = iter.next(self.alloc.file_mut())? {
            pages.push(page.index);
        }
        for index in pages {
            list.erase(self.alloc.file_mut(), index)?;
            self.alloc.free(index)?;
        }
        self.set_node_count(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::DbFile;
    use tempfile::NamedTempFile;

    fn string_class() -> Arc<Class> {
        Class::string("name").expect("class")
    }

    fn fresh_with_class(class: &Arc<Class>) -> (NamedTempFile, PageAllocator) {
        let tmp = NamedTempFile::new().expect("temp file");
        let file = DbFile::open(tmp.path()).expect("open");
        let mut alloc = PageAllocator::init(file).expect("init");
        Catalog::new(&mut alloc).add_class(class).expect("add class");
        (tmp, alloc)
    }

    fn add_str(store: &mut VarStorage<'_>, class: &Arc<Class>, value: &str) -> ObjectId {
        store
            .add(&Object::new(class, [value]).expect("object"))
            .expect("add")
    }

    fn all_strings(store: &mut VarStorage<'_>) -> Vec<(ObjectId, String)> {
        store
            .collect_if(&mut |_| true)
            .expect("collect")
            .into_iter()
            .map(|r| (r.id, r.object.as_str().expect("string").to_owned()))
            .collect()
    }

    #[test]
    fn ids_are_monotonic() {
        let class = string_class();
        let (_tmp, mut alloc) = fresh_with_class(&class);
        let mut store = VarStorage::open(&mut alloc, &class).expect("open");

        assert_eq!(add_str(&mut store, &class, "a"), 0);
        assert_eq!(add_str(&mut store, &class, "bb"), 1);
        assert_eq!(add_str(&mut store, &class, "ccc"), 2);
        assert_eq!(store.node_count(), 3);
    }

    #[test]
    fn first_fit_reuses_a_reclaimed_slot_in_place() {
        let class = string_class();
        let (_tmp, mut alloc) = fresh_with_class(&class);
        let mut store = VarStorage::open(&mut alloc, &class).expect("open");

        add_str(&mut store, &class, "a");
        add_str(&mut store, &class, "bb");
        add_str(&mut store, &class, "ccc");
        store
            .remove_if(&mut |record| record.object.as_str() == Some("bb"))
            .expect("remove");

        // "dd" fits the reclaimed slot exactly, so it shows up between
        // its physical neighbors with a fresh id
        let id = add_str(&mut store, &class, "dd");
        assert_eq!(id, 3);
        assert_eq!(
            all_strings(&mut store),
            vec![
                (0, "a".to_owned()),
                (3, "dd".to_owned()),
                (2, "ccc".to_owned()),
            ]
        );
    }

    #[test]
    fn too_large_for_a_reclaimed_slot_appends_instead() {
        let class = string_class();
        let (_tmp, mut alloc) = fresh_with_class(&class);
        let mut store = VarStorage::open(&mut alloc, &class).expect("open");

        add_str(&mut store, &class, "aa");
        add_str(&mut store, &class, "bbbb");
        store
            .remove_if(&mut |record| record.object.as_str() == Some("aa"))
            .expect("remove");

        // needs 4 + 8 payload bytes, the freed slot only holds 4 + 2
        add_str(&mut store, &class, "eeeeeeee");
        assert_eq!(
            all_strings(&mut store),
            vec![(1, "bbbb".to_owned()), (2, "eeeeeeee".to_owned())]
        );
        assert_eq!(store.node_count(), 2);
    }

    #[test]
    fn removed_ids_are_never_reissued() {
        let class = string_class();
        let (_tmp, mut alloc) = fresh_with_class(&class);
        let mut store = VarStorage::open(&mut alloc, &class).expect("open");

        add_str(&mut store, &class, "one");
        add_str(&mut store, &class, "two");
        store.remove_if(&mut |_| true).expect("remove all");
        assert_eq!(store.node_count(), 0);

        assert_eq!(add_str(&mut store, &class, "three"), 2);
    }

    #[test]
    fn chain_survives_a_partial_reuse() {
        let class = string_class();
        let (_tmp, mut alloc) = fresh_with_class(&class);
        let mut store = VarStorage::open(&mut alloc, &class).expect("open");

        add_str(&mut store, &class, "aaaaaaaa");
        add_str(&mut store, &class, "bb");
        add_str(&mut store, &class, "cccc");
        store
            .remove_if(&mut |r| {
                matches!(r.object.as_str(), Some("aaaaaaaa") | Some("cccc"))
            })
            .expect("remove");

        // chain head is "cccc" (freed last); "dddddd" skips it and takes
        // the "aaaaaaaa" slot further down the chain
        let id = add_str(&mut store, &class, "dddddd");
        assert_eq!(id, 3);
        assert_eq!(
            all_strings(&mut store),
            vec![(3, "dddddd".to_owned()), (1, "bb".to_owned())]
        );

        // the remaining free slot is still linked and reusable
        let id = add_str(&mut store, &class, "ee");
        assert_eq!(id, 4);
        assert_eq!(
            all_strings(&mut store),
            vec![
                (3, "dddddd".to_owned()),
                (1, "bb".to_owned()),
                (4, "ee".to_owned()),
            ]
        );
    }

    #[test]
    fn cursor_retreats_over_variable_strides() {
        let class = string_class();
        let (_tmp, mut alloc) = fresh_with_class(&class);
        let mut store = VarStorage::open(&mut alloc, &class).expect("open");
        for value in ["a", "bb", "ccc"] {
            add_str(&mut store, &class, value);
        }
        store
            .remove_if(&mut |r| r.object.as_str() == Some("bb"))
            .expect("remove");

        let mut cursor = store.cursor_at_end();
        let mut backward = Vec::new();
        while let Some(record) = store.cursor_prev(&mut cursor).expect("prev") {
            backward.push(record.object.as_str().expect("string").to_owned());
        }
        assert_eq!(backward, vec!["ccc".to_owned(), "a".to_owned()]);

        // and forward again from the front sentinel
        let record = store.cursor_next(&mut cursor).expect("next").expect("node");
        assert_eq!(record.object.as_str(), Some("a"));
        assert_eq!(cursor.id(), Some(0));
        assert!(cursor.page().is_some());
    }

    #[test]
    fn spills_to_a_new_page_when_full() {
        let class = string_class();
        let (_tmp, mut alloc) = fresh_with_class(&class);
        let mut store = VarStorage::open(&mut alloc, &class).expect("open");

        // each slot takes 20 + 4 + 100 bytes; 32 of them overflow one page
        let value = "x".repeat(100);
        for _ in 0..33 {
            add_str(&mut store, &class, &value);
        }
        assert_eq!(store.list().count(store.alloc.file_mut()).expect("count"), 2);
        assert_eq!(store.node_count(), 33);
        assert_eq!(all_strings(&mut store).len(), 33);
    }

    #[test]
    fn oversized_object_is_not_implemented() {
        let class = string_class();
        let (_tmp, mut alloc) = fresh_with_class(&class);
        let mut store = VarStorage::open(&mut alloc, &class).expect("open");
        let object = Object::new(&class, ["y".repeat(5000)]).expect("object");
        assert!(matches!(
            store.add(&object),
            Err(DbError::NotImplemented(_))
        ));
    }
}
