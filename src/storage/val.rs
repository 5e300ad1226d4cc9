use std::sync::Arc;

use tracing::trace;

use crate::error::{DbError, Result};
use crate::pager::{
    page_offset, PageAllocator, PageHeader, PageList, NO_PAGE, PAGE_HEADER_SIZE, PAGE_SIZE,
};
use crate::storage::slot::{self, SlotTag, FREE_LINK_SIZE, SLOT_ID_OFFSET, VAL_SLOT_HEADER};
use crate::storage::{Catalog, CatalogEntry, NodeRecord, NodeStore};
use crate::types::{Class, Object, ObjectId};

/// Node storage for classes with a determinate size. Every slot has the
/// same width, so a node's id is derivable from its position:
/// `id = page_ordinal * nodes_per_page + in_page_slot`. The id is still
/// written into the slot for audit and for agreement with the
/// variable-size layout.
pub struct ValStorage<'a> {
    alloc: &'a mut PageAllocator,
    class: Arc<Class>,
    entry: CatalogEntry,
    payload_size: u64,
}

/// Walker position: a page (with its ordinal in the class's page list)
/// and a slot offset inside it.
#[derive(Debug, Clone, Copy)]
struct Pos {
    page: PageHeader,
    ordinal: u64,
    offset: u64,
}

#[derive(Debug, Clone, Copy)]
enum CursorState {
    Before,
    At(Pos, ObjectId),
    End,
}

/// Bidirectional cursor over the live nodes of a [`ValStorage`]. The
/// cursor holds a position only; every motion goes through the storage,
/// so nodes freed since the last step are skipped on the next one.
#[derive(Debug, Clone, Copy)]
pub struct ValCursor {
    state: CursorState,
}

impl ValCursor {
    /// Id of the node the cursor rests on.
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

impl<'a> ValStorage<'a> {
    pub fn open(alloc: &'a mut PageAllocator, class: &Arc<Class>) -> Result<Self> {
        let size = class.size().ok_or_else(|| {
            DbError::Runtime(format!(
                "class {} is not fixed-size, use the variable storage",
                class.name()
            ))
        })?;
        let entry = Catalog::new(&mut *alloc)
            .find(class)?
            .ok_or_else(|| DbError::NotFound(format!("class {}", class.name())))?;
        Ok(Self {
            alloc,
            class: class.clone(),
            entry,
            // a freed slot must hold the chain link in its payload region
            payload_size: size.max(FREE_LINK_SIZE),
        })
    }

    pub fn node_count(&self) -> u64 {
        self.entry.node_count
    }

    fn slot_size(&self) -> u64 {
        VAL_SLOT_HEADER + self.payload_size
    }

    fn nodes_per_page(&self) -> u64 {
        (PAGE_SIZE - PAGE_HEADER_SIZE) / self.slot_size()
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

    fn slot_id(&self, pos: &Pos) -> ObjectId {
        pos.ordinal * self.nodes_per_page() + (pos.offset - PAGE_HEADER_SIZE) / self.slot_size()
    }

    /// Moves to the first slot of the first page holding any slots.
    fn first_pos(&mut self) -> Result<Option<Pos>> {
        let head = self.list().head(self.alloc.file_mut())?;
        if head == NO_PAGE {
            return Ok(None);
        }
        let page = PageHeader::read(self.alloc.file_mut(), head)?;
        self.normalize(Pos {
            page,
            ordinal: 0,
            offset: PAGE_HEADER_SIZE,
        })
    }

    /// Walks forward until the position names an initialized slot,
    /// crossing page boundaries as needed.
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
                ordinal: pos.ordinal + 1,
                offset: PAGE_HEADER_SIZE,
            };
        }
    }

    fn advance(&mut self, pos: Pos) -> Result<Option<Pos>> {
        self.normalize(Pos {
            offset: pos.offset + self.slot_size(),
            ..pos
        })
    }

    /// Next live slot strictly after `pos` (or from the start for `None`).
    /// Freed slots are skipped; a tag that matches neither the magic nor
    /// its complement inside the initialized region is an invariant
    /// breach.
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

    /// Last initialized slot of the storage, or `None` when empty.
    fn last_pos(&mut self) -> Result<Option<Pos>> {
        let tail = self.list().tail(self.alloc.file_mut())?;
        if tail == NO_PAGE {
            return Ok(None);
        }
        let mut ordinal = self.list().count(self.alloc.file_mut())? - 1;
        let mut page = PageHeader::read(self.alloc.file_mut(), tail)?;
        loop {
            if page.initialized_offset as u64 > PAGE_HEADER_SIZE {
                return Ok(Some(Pos {
                    page,
                    ordinal,
                    offset: page.initialized_offset as u64 - self.slot_size(),
                }));
            }
            if page.prev == NO_PAGE {
                return Ok(None);
            }
            page = PageHeader::read(self.alloc.file_mut(), page.prev)?;
            ordinal -= 1;
        }
    }

    fn retreat(&mut self, pos: Pos) -> Result<Option<Pos>> {
        if pos.offset > PAGE_HEADER_SIZE {
            return Ok(Some(Pos {
                offset: pos.offset - self.slot_size(),
                ..pos
            }));
        }
        let mut page = pos.page;
        let mut ordinal = pos.ordinal;
        loop {
            if page.prev == NO_PAGE {
                return Ok(None);
            }
            page = PageHeader::read(self.alloc.file_mut(), page.prev)?;
            ordinal -= 1;
            if page.initialized_offset as u64 > PAGE_HEADER_SIZE {
                return Ok(Some(Pos {
                    page,
                    ordinal,
                    offset: page.initialized_offset as u64 - self.slot_size(),
                }));
            }
        }
    }

    /// Previous live slot strictly before `pos` (or from the end for
    /// `None`).
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
    pub fn cursor(&self) -> ValCursor {
        ValCursor {
            state: CursorState::Before,
        }
    }

    /// Cursor resting past the last node.
    pub fn cursor_at_end(&self) -> ValCursor {
        ValCursor {
            state: CursorState::End,
        }
    }

    /// Advances to the next live node, re-reading it from the file.
    pub fn cursor_next(&mut self, cursor: &mut ValCursor) -> Result<Option<NodeRecord>> {
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
    pub fn cursor_prev(&mut self, cursor: &mut ValCursor) -> Result<Option<NodeRecord>> {
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
        let object = Object::read_at(&class, self.alloc.file_mut(), base + VAL_SLOT_HEADER)?;
        Ok(NodeRecord { id, object })
    }

    fn write_live_slot(&mut self, pos: &Pos, id: ObjectId, object: &Object) -> Result<()> {
        let base = page_offset(pos.page.index, pos.offset);
        let magic = self.entry.magic;
        let file = self.alloc.file_mut();
        file.write_val::<u64>(base, magic)?;
        file.write_val::<u64>(base + SLOT_ID_OFFSET, id)?;
        object.write_at(file, base + VAL_SLOT_HEADER)?;
        Ok(())
    }

    fn free_slot(&mut self, pos: &Pos) -> Result<()> {
        // re-read: earlier removals may have moved this page's chain head
        let mut page = PageHeader::read(self.alloc.file_mut(), pos.page.index)?;
        let next = slot::chain_next_for_free(&page);
        let base = page_offset(page.index, pos.offset);
        let magic = self.entry.magic;
        let file = self.alloc.file_mut();
        file.write_val::<u64>(base, !magic)?;
        file.write_val::<u32>(base + VAL_SLOT_HEADER, next)?;
        page.free_offset = pos.offset as u16;
        page.write(file)?;
        Ok(())
    }

    fn add_node(&mut self, object: &Object) -> Result<ObjectId> {
        let slot_size = self.slot_size();
        if PAGE_HEADER_SIZE + slot_size > PAGE_SIZE {
            return Err(DbError::NotImplemented(
                "object does not fit a fixed-size page slot",
            ));
        }

        let list = self.list();
        let tail = list.tail(self.alloc.file_mut())?;
        let (mut page, mut ordinal) = if tail == NO_PAGE {
            let index = self.alloc.allocate()?;
            list.push_back(self.alloc.file_mut(), index)?;
            (PageHeader::read(self.alloc.file_mut(), index)?, 0)
        } else {
            let ordinal = list.count(self.alloc.file_mut())? - 1;
            (PageHeader::read(self.alloc.file_mut(), tail)?, ordinal)
        };

        let id;
        if (page.free_offset as u64) < page.initialized_offset as u64 {
            // reclaimed slot at the head of the page's free chain
            let offset = page.free_offset as u64;
            let base = page_offset(page.index, offset);
            let tag = self.alloc.file_mut().read_val::<u64>(base)?;
            if slot::classify(tag, self.entry.magic) != SlotTag::Free {
                return Err(DbError::Runtime(format!(
                    "slot at page {} offset {offset} expected free but occupied",
                    page.index
                )));
            }
            let stored = self
                .alloc
                .file_mut()
                .read_val::<u32>(base + VAL_SLOT_HEADER)?;
            let pos = Pos {
                page,
                ordinal,
                offset,
            };
            id = self.slot_id(&pos);
            self.write_live_slot(&pos, id, object)?;
            page.free_offset = slot::chain_head_after_pop(stored, &page);
            page.write(self.alloc.file_mut())?;
        } else {
            if page.initialized_offset as u64 + slot_size > PAGE_SIZE {
                let index = self.alloc.allocate()?;
                list.push_back(self.alloc.file_mut(), index)?;
                page = PageHeader::read(self.alloc.file_mut(), index)?;
                ordinal += 1;
            }
            let pos = Pos {
                page,
                ordinal,
                offset: page.initialized_offset as u64,
            };
            id = self.slot_id(&pos);
            self.write_live_slot(&pos, id, object)?;
            page.free_offset += slot_size as u16;
            page.initialized_offset += slot_size as u16;
            page.write(self.alloc.file_mut())?;
        }

        self.set_node_count(self.entry.node_count + 1)?;
        trace!(id, class = %self.entry.serialized, "added node");
        Ok(id)
    }
}

impl NodeStore for ValStorage<'_> {
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
    use crate::types::{Literal, PrimitiveKind};
    use tempfile::NamedTempFile;

    fn fresh_with_class(class: &Arc<Class>) -> (NamedTempFile, PageAllocator) {
        let tmp = NamedTempFile::new().expect("temp file");
        let file = DbFile::open(tmp.path()).expect("open");
        let mut alloc = PageAllocator::init(file).expect("init");
        Catalog::new(&mut alloc).add_class(class).expect("add class");
        (tmp, alloc)
    }

    fn int_class() -> Arc<Class> {
        Class::primitive(PrimitiveKind::Int, "age").expect("class")
    }

    fn all_values(store: &mut ValStorage<'_>) -> Vec<(ObjectId, i64)> {
        store
            .collect_if(&mut |_| true)
            .expect("collect")
            .into_iter()
            .map(|r| (r.id, r.object.as_i64().expect("int")))
            .collect()
    }

    #[test]
    fn ids_are_positional() {
        let class = int_class();
        let (_tmp, mut alloc) = fresh_with_class(&class);
        let mut store = ValStorage::open(&mut alloc, &class).expect("open");

        for value in [10i64, 20, 30] {
            store
                .add(&Object::new(&class, [value]).expect("object"))
                .expect("add");
        }
        assert_eq!(all_values(&mut store), vec![(0, 10), (1, 20), (2, 30)]);
        assert_eq!(store.node_count(), 3);
    }

    #[test]
    fn removed_slot_is_reused_with_its_positional_id() {
        let class = int_class();
        let (_tmp, mut alloc) = fresh_with_class(&class);
        let mut store = ValStorage::open(&mut alloc, &class).expect("open");

        for value in [10i64, 20, 30] {
            store
                .add(&Object::new(&class, [value]).expect("object"))
                .expect("add");
        }
        let removed = store
            .remove_if(&mut |record| record.id == 1)
            .expect("remove");
        assert_eq!(removed, 1);
        assert_eq!(all_values(&mut store), vec![(0, 10), (2, 30)]);
        assert_eq!(store.node_count(), 2);

        let id = store
            .add(&Object::new(&class, [40i64]).expect("object"))
            .expect("reinsert");
        assert_eq!(id, 1);
        assert_eq!(all_values(&mut store), vec![(0, 10), (1, 40), (2, 30)]);
    }

    #[test]
    fn chained_removals_reuse_in_lifo_order() {
        let class = int_class();
        let (_tmp, mut alloc) = fresh_with_class(&class);
        let mut store = ValStorage::open(&mut alloc, &class).expect("open");

        for value in 0..5i64 {
            store
                .add(&Object::new(&class, [value]).expect("object"))
                .expect("add");
        }
        store
            .remove_if(&mut |record| record.id == 1 || record.id == 3)
            .expect("remove");

        // slot 3 was freed last, so it heads the chain
        let first = store
            .add(&Object::new(&class, [13i64]).expect("object"))
            .expect("add");
        let second = store
            .add(&Object::new(&class, [11i64]).expect("object"))
            .expect("add");
        assert_eq!((first, second), (3, 1));
        assert_eq!(store.node_count(), 5);
    }

    #[test]
    fn filling_a_page_allocates_exactly_one_more() {
        let class = int_class();
        let (_tmp, mut alloc) = fresh_with_class(&class);
        // slot = 16 + max(4, 4); one data page holds (4096 - 24) / 20 slots
        let per_page = (PAGE_SIZE - PAGE_HEADER_SIZE) / 20;

        let mut store = ValStorage::open(&mut alloc, &class).expect("open");
        for value in 0..per_page {
            store
                .add(&Object::new(&class, [value as i64]).expect("object"))
                .expect("add");
        }
        let pages_after_fill = store.alloc.pages_count();

        let id = store
            .add(&Object::new(&class, [-1i64]).expect("object"))
            .expect("overflow add");
        assert_eq!(id, per_page);
        assert_eq!(store.alloc.pages_count(), pages_after_fill + 1);

        let records = store.collect_if(&mut |_| true).expect("collect");
        assert_eq!(records.len() as u64, per_page + 1);
        let ids: Vec<ObjectId> = records.iter().map(|r| r.id).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn cursor_walks_both_ways() {
        let class = int_class();
        let (_tmp, mut alloc) = fresh_with_class(&class);
        let mut store = ValStorage::open(&mut alloc, &class).expect("open");
        for value in [10i64, 20, 30] {
            store
                .add(&Object::new(&class, [value]).expect("object"))
                .expect("add");
        }

        let mut cursor = store.cursor();
        assert_eq!(cursor.id(), None);
        let mut forward = Vec::new();
        while let Some(record) = store.cursor_next(&mut cursor).expect("next") {
            assert_eq!(cursor.id(), Some(record.id));
            assert!(cursor.in_page_offset().expect("offset") >= PAGE_HEADER_SIZE);
            forward.push(record.object.as_i64().expect("int"));
        }
        assert_eq!(forward, vec![10, 20, 30]);

        // exhausted forward, the same cursor retreats over every node
        let mut backward = Vec::new();
        while let Some(record) = store.cursor_prev(&mut cursor).expect("prev") {
            backward.push(record.object.as_i64().expect("int"));
        }
        assert_eq!(backward, vec![30, 20, 10]);
        assert_eq!(cursor.id(), None);
    }

    #[test]
    fn node_removed_mid_iteration_is_skipped_on_the_next_motion() {
        let class = int_class();
        let (_tmp, mut alloc) = fresh_with_class(&class);
        let mut store = ValStorage::open(&mut alloc, &class).expect("open");
        for value in [10i64, 20, 30] {
            store
                .add(&Object::new(&class, [value]).expect("object"))
                .expect("add");
        }

        let mut cursor = store.cursor();
        let first = store.cursor_next(&mut cursor).expect("next").expect("node");
        assert_eq!(first.id, 0);
        store.remove_if(&mut |r| r.id == 1).expect("remove");
        let next = store.cursor_next(&mut cursor).expect("next").expect("node");
        assert_eq!(next.id, 2);
    }

    #[test]
    fn opening_an_unregistered_class_is_not_found() {
        let class = int_class();
        let other = Class::primitive(PrimitiveKind::Int, "height").expect("class");
        let (_tmp, mut alloc) = fresh_with_class(&class);
        assert!(matches!(
            ValStorage::open(&mut alloc, &other),
            Err(DbError::NotFound(_))
        ));
    }

    #[test]
    fn drop_storage_returns_pages_and_zeroes_the_count() {
        let class = int_class();
        let (_tmp, mut alloc) = fresh_with_class(&class);
        let mut store = ValStorage::open(&mut alloc, &class).expect("open");
        for value in 0..10i64 {
            store
                .add(&Object::new(&class, [value]).expect("object"))
                .expect("add");
        }
        store.drop_storage().expect("drop");
        assert_eq!(store.node_count(), 0);
        assert!(all_values(&mut store).is_empty());

        // predicate arguments keep working after a drop
        let id = store
            .add(&Object::new(&class, [Literal::from(5i64)]).expect("object"))
            .expect("add after drop");
        assert_eq!(id, 0);
    }
}
