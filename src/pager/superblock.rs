use tracing::debug;

use crate::error::{DbError, Result};
use crate::file::DbFile;
use crate::pager::{PageIndex, NO_PAGE, PAGE_SIZE};

pub const SUPERBLOCK_MAGIC: u64 = u64::from_le_bytes(*b"nodumdb\0");

/// File offset of the class-catalog page-list header `{head, tail, count}`.
pub const CLASS_LIST_ANCHOR: u64 = 24;

pub const SUPERBLOCK_SIZE: u64 = 48;

/// The fixed record at byte 0 of the file: magic, allocator free-list head,
/// total page count, and the class-catalog page list. The list header
/// itself is read and written through [`PageList`](crate::pager::PageList)
/// at [`CLASS_LIST_ANCHOR`]; only the allocator fields are cached here.
#[derive(Debug, Clone, Copy)]
pub struct Superblock {
    pub free_head: PageIndex,
    pub pages_count: u64,
}

impl Superblock {
    pub fn read(file: &mut DbFile) -> Result<Self> {
        if file.len()? < PAGE_SIZE {
            return Err(DbError::Structure(
                "file shorter than the superblock page".into(),
            ));
        }
        let magic = file.read_val::<u64>(0)?;
        if magic != SUPERBLOCK_MAGIC {
            return Err(DbError::Structure(format!(
                "superblock magic mismatch: 0x{magic:016X}"
            )));
        }
        let free_head = file.read_val::<u64>(8)?;
        let pages_count = file.read_val::<u64>(16)?;
        if pages_count == 0 || file.len()? < pages_count * PAGE_SIZE {
            return Err(DbError::Structure(format!(
                "superblock page count {pages_count} exceeds file length"
            )));
        }
        Ok(Self {
            free_head,
            pages_count,
        })
    }

    /// Clears the file and writes a fresh superblock claiming page 0.
    pub fn init(file: &mut DbFile) -> Result<Self> {
        debug!("initializing superblock");
        file.clear()?;
        file.grow(PAGE_SIZE)?;
        let sb = Self {
            free_head: NO_PAGE,
            pages_count: 1,
        };
        file.write_val::<u64>(0, SUPERBLOCK_MAGIC)?;
        sb.write(file)?;
        // empty class-catalog page list
        file.write_val::<u64>(CLASS_LIST_ANCHOR, NO_PAGE)?;
        file.write_val::<u64>(CLASS_LIST_ANCHOR + 8, NO_PAGE)?;
        file.write_val::<u64>(CLASS_LIST_ANCHOR + 16, 0)?;
        Ok(sb)
    }

    pub fn write(&self, file: &mut DbFile) -> Result<()> {
        file.write_val::<u64>(8, self.free_head)?;
        file.write_val::<u64>(16, self.pages_count)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn init_then_read() {
        let tmp = NamedTempFile::new().expect("temp file");
        let mut file = DbFile::open(tmp.path()).expect("open");

        let sb = Superblock::init(&mut file).expect("init");
        assert_eq!(sb.pages_count, 1);
        assert_eq!(sb.free_head, NO_PAGE);

        let read = Superblock::read(&mut file).expect("read");
        assert_eq!(read.pages_count, 1);
        assert_eq!(read.free_head, NO_PAGE);
    }

    #[test]
    fn empty_file_is_structure_error() {
        let tmp = NamedTempFile::new().expect("temp file");
        let mut file = DbFile::open(tmp.path()).expect("open");
        assert!(matches!(
            Superblock::read(&mut file),
            Err(DbError::Structure(_))
        ));
    }

    #[test]
    fn zeroed_file_is_structure_error() {
        let tmp = NamedTempFile::new().expect("temp file");
        let mut file = DbFile::open(tmp.path()).expect("open");
        file.grow(PAGE_SIZE).expect("grow");
        assert!(matches!(
            Superblock::read(&mut file),
            Err(DbError::Structure(_))
        ));
    }
}
