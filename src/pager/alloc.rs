use tracing::debug;

use crate::error::{DbError, Result};
use crate::file::DbFile;
use crate::pager::{
    page_offset, PageHeader, PageIndex, PageKind, Superblock, NO_PAGE, PAGE_SIZE,
};

/// Hands out pages from the superblock-rooted free list, growing the file
/// when the list is empty. Owns the backing file; every other layer reaches
/// the file through it. Not thread-safe.
pub struct PageAllocator {
    file: DbFile,
    superblock: Superblock,
}

impl PageAllocator {
    /// Opens over an existing superblock. Fails with a structure error if
    /// the file was never initialized.
    pub fn open(mut file: DbFile) -> Result<Self> {
        let superblock = Superblock::read(&mut file)?;
        Ok(Self { file, superblock })
    }

    /// Clears the file and starts from a fresh superblock.
    pub fn init(mut file: DbFile) -> Result<Self> {
        let superblock = Superblock::init(&mut file)?;
        Ok(Self { file, superblock })
    }

    pub fn file_mut(&mut self) -> &mut DbFile {
        &mut self.file
    }

    pub fn pages_count(&self) -> u64 {
        self.superblock.pages_count
    }

    /// Pops the free list, or grows the file by one page. The returned page
    /// carries a fresh data header with empty offsets and null links.
    pub fn allocate(&mut self) -> Result<PageIndex> {
        let index = if self.superblock.free_head != NO_PAGE {
            let index = self.superblock.free_head;
            let header = PageHeader::read(&mut self.file, index)?;
            if header.kind != PageKind::Free {
                return Err(DbError::Runtime(format!(
                    "free-list page {index} is not marked free"
                )));
            }
            self.superblock.free_head = header.next;
            index
        } else {
            let index = self.superblock.pages_count;
            self.file.grow((index + 1) * PAGE_SIZE)?;
            self.superblock.pages_count += 1;
            index
        };
        PageHeader::new(index, PageKind::Data).write(&mut self.file)?;
        self.superblock.write(&mut self.file)?;
        debug!(page = index, "allocated page");
        Ok(index)
    }

    /// Marks the page free and links it at the head of the free list.
    pub fn free(&mut self, index: PageIndex) -> Result<()> {
        if index == NO_PAGE || index >= self.superblock.pages_count {
            return Err(DbError::BadArgument(format!(
                "page index {index} is not allocatable"
            )));
        }
        let mut header = PageHeader::new(index, PageKind::Free);
        header.next = self.superblock.free_head;
        header.write(&mut self.file)?;
        self.superblock.free_head = index;
        self.superblock.write(&mut self.file)?;
        debug!(page = index, "freed page");
        Ok(())
    }

    /// Exchanges the byte contents of two pages and repoints their list
    /// neighbors. List anchors (heads and tails stored in owner metadata)
    /// are the caller's concern.
    pub fn swap(&mut self, a: PageIndex, b: PageIndex) -> Result<()> {
        if a == b {
            return Ok(());
        }
        if a == NO_PAGE || b == NO_PAGE {
            return Err(DbError::BadArgument("cannot swap the superblock page".into()));
        }

        let header_a = PageHeader::read(&mut self.file, a)?;
        let header_b = PageHeader::read(&mut self.file, b)?;

        let bytes_a = self.file.read_bytes(page_offset(a, 0), PAGE_SIZE as usize)?;
        let bytes_b = self.file.read_bytes(page_offset(b, 0), PAGE_SIZE as usize)?;
        self.file.write_bytes(page_offset(a, 0), &bytes_b)?;
        self.file.write_bytes(page_offset(b, 0), &bytes_a)?;

        // a link to index `a` now refers to the contents living at `b`
        let cross = |link: PageIndex| {
            if link == a {
                b
            } else if link == b {
                a
            } else {
                link
            }
        };

        for position in [a, b] {
            let mut header = PageHeader::read(&mut self.file, position)?;
            header.prev = cross(header.prev);
            header.next = cross(header.next);
            header.write(&mut self.file)?;
        }

        let mut neighbors = [header_a.prev, header_a.next, header_b.prev, header_b.next];
        neighbors.sort_unstable();
        let mut last = NO_PAGE;
        for neighbor in neighbors {
            if neighbor == NO_PAGE || neighbor == a || neighbor == b || neighbor == last {
                continue;
            }
            last = neighbor;
            let mut other = PageHeader::read(&mut self.file, neighbor)?;
            let (prev, next) = (cross(other.prev), cross(other.next));
            if (prev, next) != (other.prev, other.next) {
                other.prev = prev;
                other.next = next;
                other.write(&mut self.file)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pager::PAGE_HEADER_SIZE;
    use tempfile::NamedTempFile;

    fn fresh_alloc() -> (NamedTempFile, PageAllocator) {
        let tmp = NamedTempFile::new().expect("temp file");
        let file = DbFile::open(tmp.path()).expect("open");
        let alloc = PageAllocator::init(file).expect("init");
        (tmp, alloc)
    }

    #[test]
    fn allocate_grows_the_file() {
        let (_tmp, mut alloc) = fresh_alloc();
        assert_eq!(alloc.allocate().expect("allocate"), 1);
        assert_eq!(alloc.allocate().expect("allocate"), 2);
        assert_eq!(alloc.pages_count(), 3);
        assert_eq!(alloc.file_mut().len().expect("len"), 3 * PAGE_SIZE);
    }

    #[test]
    fn freed_page_is_reused_first() {
        let (_tmp, mut alloc) = fresh_alloc();
        let first = alloc.allocate().expect("allocate");
        let second = alloc.allocate().expect("allocate");
        alloc.free(first).expect("free");
        assert_eq!(alloc.allocate().expect("reallocate"), first);
        assert_eq!(alloc.allocate().expect("allocate past free list"), second + 1);
    }

    #[test]
    fn free_list_survives_reopen() {
        let tmp = NamedTempFile::new().expect("temp file");
        {
            let file = DbFile::open(tmp.path()).expect("open");
            let mut alloc = PageAllocator::init(file).expect("init");
            let page = alloc.allocate().expect("allocate");
            alloc.allocate().expect("allocate");
            alloc.free(page).expect("free");
        }
        let file = DbFile::open(tmp.path()).expect("reopen");
        let mut alloc = PageAllocator::open(file).expect("open existing");
        assert_eq!(alloc.allocate().expect("allocate"), 1);
    }

    #[test]
    fn cannot_free_superblock_or_unallocated() {
        let (_tmp, mut alloc) = fresh_alloc();
        assert!(alloc.free(NO_PAGE).is_err());
        assert!(alloc.free(7).is_err());
    }

    #[test]
    fn swap_exchanges_contents_and_repoints_neighbors() {
        let (_tmp, mut alloc) = fresh_alloc();
        let first = alloc.allocate().expect("allocate");
        let second = alloc.allocate().expect("allocate");
        let third = alloc.allocate().expect("allocate");

        // chain 1 <-> 2 <-> 3 by hand
        for (index, prev, next) in [
            (first, NO_PAGE, second),
            (second, first, third),
            (third, second, NO_PAGE),
        ] {
            let mut header = PageHeader::new(index, PageKind::Data);
            header.prev = prev;
            header.next = next;
            header.write(alloc.file_mut()).expect("write header");
        }
        alloc
            .file_mut()
            .write_val::<u64>(page_offset(second, PAGE_HEADER_SIZE), 77)
            .expect("mark page two");

        alloc.swap(first, second).expect("swap");

        let at_first = PageHeader::read(alloc.file_mut(), first).expect("read");
        let at_second = PageHeader::read(alloc.file_mut(), second).expect("read");
        let at_third = PageHeader::read(alloc.file_mut(), third).expect("read");

        // old page two now lives at index one, still chained second <- first -> third
        assert_eq!(at_first.prev, second);
        assert_eq!(at_first.next, third);
        assert_eq!(at_second.prev, NO_PAGE);
        assert_eq!(at_second.next, first);
        assert_eq!(at_third.prev, first);
        assert_eq!(
            alloc
                .file_mut()
                .read_val::<u64>(page_offset(first, PAGE_HEADER_SIZE))
                .expect("read marker"),
            77
        );
    }
}
