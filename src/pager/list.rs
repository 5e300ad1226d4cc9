use crate::error::{DbError, Result};
use crate::file::DbFile;
use crate::pager::{PageHeader, PageIndex, NO_PAGE};

/// Doubly-linked list of pages belonging to one owner. The list header
/// `{head, tail, count}` lives at a fixed file offset inside the owner's
/// metadata (the superblock for the class catalog, a catalog record for a
/// class's data pages); the handle itself is stateless and re-reads it on
/// every operation.
#[derive(Debug, Clone, Copy)]
pub struct PageList {
    anchor: u64,
}

impl PageList {
    pub fn new(anchor: u64) -> Self {
        Self { anchor }
    }

    pub fn head(&self, file: &mut DbFile) -> Result<PageIndex> {
        file.read_val::<u64>(self.anchor)
    }

    pub fn tail(&self, file: &mut DbFile) -> Result<PageIndex> {
        file.read_val::<u64>(self.anchor + 8)
    }

    pub fn count(&self, file: &mut DbFile) -> Result<u64> {
        file.read_val::<u64>(self.anchor + 16)
    }

    pub fn is_empty(&self, file: &mut DbFile) -> Result<bool> {
        Ok(self.head(file)? == NO_PAGE)
    }

    fn write_header(
        &self,
        file: &mut DbFile,
        head: PageIndex,
        tail: PageIndex,
        count: u64,
    ) -> Result<()> {
        file.write_val::<u64>(self.anchor, head)?;
        file.write_val::<u64>(self.anchor + 8, tail)?;
        file.write_val::<u64>(self.anchor + 16, count)?;
        Ok(())
    }

    /// Links an allocated page at the tail. The page keeps its kind and
    /// offsets; only the links change.
    pub fn push_back(&self, file: &mut DbFile, index: PageIndex) -> Result<()> {
        let head = self.head(file)?;
        let tail = self.tail(file)?;
        let count = self.count(file)?;

        let mut page = PageHeader::read(file, index)?;
        page.next = NO_PAGE;
        if tail == NO_PAGE {
            page.prev = NO_PAGE;
            page.write(file)?;
            self.write_header(file, index, index, 1)?;
        } else {
            let mut old_tail = PageHeader::read(file, tail)?;
            old_tail.next = index;
            old_tail.write(file)?;
            page.prev = tail;
            page.write(file)?;
            self.write_header(file, head, index, count + 1)?;
        }
        Ok(())
    }

    /// Unlinks a page. The page itself is left for the caller, typically to
    /// hand back to the allocator.
    pub fn erase(&self, file: &mut DbFile, index: PageIndex) -> Result<()> {
        let head = self.head(file)?;
        let tail = self.tail(file)?;
        let count = self.count(file)?;
        if count == 0 {
            return Err(DbError::Runtime(format!(
                "erase of page {index} from an empty page list"
            )));
        }

        let page = PageHeader::read(file, index)?;
        if page.prev != NO_PAGE {
            let mut prev = PageHeader::read(file, page.prev)?;
            prev.next = page.next;
            prev.write(file)?;
        }
        if page.next != NO_PAGE {
            let mut next = PageHeader::read(file, page.next)?;
            next.prev = page.prev;
            next.write(file)?;
        }
        let new_head = if head == index { page.next } else { head };
        let new_tail = if tail == index { page.prev } else { tail };
        self.write_header(file, new_head, new_tail, count - 1)?;
        Ok(())
    }

    pub fn iter(&self, file: &mut DbFile) -> Result<PageListIter> {
        Ok(PageListIter {
            next: self.head(file)?,
        })
    }
}

/// Forward walker over a page list. Styled as an explicit cursor because
/// each step needs the backing file.
pub struct PageListIter {
    next: PageIndex,
}

impl PageListIter {
    pub fn next(&mut self, file: &mut DbFile) -> Result<Option<PageHeader>> {
        if self.next == NO_PAGE {
            return Ok(None);
        }
        let header = PageHeader::read(file, self.next)?;
        self.next = header.next;
        Ok(Some(header))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pager::{PageAllocator, PAGE_SIZE, SUPERBLOCK_SIZE};
    use tempfile::NamedTempFile;

    // a scratch anchor inside page 0, past the superblock fields
    const ANCHOR: u64 = SUPERBLOCK_SIZE + 64;

    fn fresh() -> (NamedTempFile, PageAllocator, PageList) {
        let tmp = NamedTempFile::new().expect("temp file");
        let file = DbFile::open(tmp.path()).expect("open");
        let alloc = PageAllocator::init(file).expect("init");
        (tmp, alloc, PageList::new(ANCHOR))
    }

    fn collect(list: &PageList, file: &mut DbFile) -> Vec<PageIndex> {
        let mut out = Vec::new();
        let mut iter = list.iter(file).expect("iter");
        while let Some(header) = iter.next(file).expect("step") {
            out.push(header.index);
        }
        out
    }

    #[test]
    fn push_back_chains_pages_in_order() {
        let (_tmp, mut alloc, list) = fresh();
        for _ in 0..3 {
            let page = alloc.allocate().expect("allocate");
            list.push_back(alloc.file_mut(), page).expect("push");
        }
        assert_eq!(collect(&list, alloc.file_mut()), vec![1, 2, 3]);
        assert_eq!(list.head(alloc.file_mut()).expect("head"), 1);
        assert_eq!(list.tail(alloc.file_mut()).expect("tail"), 3);
        assert_eq!(list.count(alloc.file_mut()).expect("count"), 3);
    }

    #[test]
    fn erase_middle_and_ends() {
        let (_tmp, mut alloc, list) = fresh();
        for _ in 0..4 {
            let page = alloc.allocate().expect("allocate");
            list.push_back(alloc.file_mut(), page).expect("push");
        }

        list.erase(alloc.file_mut(), 2).expect("erase middle");
        assert_eq!(collect(&list, alloc.file_mut()), vec![1, 3, 4]);

        list.erase(alloc.file_mut(), 1).expect("erase head");
        assert_eq!(collect(&list, alloc.file_mut()), vec![3, 4]);
        assert_eq!(list.head(alloc.file_mut()).expect("head"), 3);

        list.erase(alloc.file_mut(), 4).expect("erase tail");
        assert_eq!(collect(&list, alloc.file_mut()), vec![3]);
        assert_eq!(list.tail(alloc.file_mut()).expect("tail"), 3);

        list.erase(alloc.file_mut(), 3).expect("erase last");
        assert!(list.is_empty(alloc.file_mut()).expect("empty"));
        assert_eq!(list.count(alloc.file_mut()).expect("count"), 0);
    }

    #[test]
    fn erase_from_empty_list_fails() {
        let (_tmp, mut alloc, list) = fresh();
        assert!(list.erase(alloc.file_mut(), 1).is_err());
    }

    #[test]
    fn anchor_is_plain_file_state() {
        let (_tmp, mut alloc, list) = fresh();
        let page = alloc.allocate().expect("allocate");
        list.push_back(alloc.file_mut(), page).expect("push");
        assert!(ANCHOR + 24 <= PAGE_SIZE);
        assert_eq!(alloc.file_mut().read_val::<u64>(ANCHOR).expect("raw head"), page);
    }
}
