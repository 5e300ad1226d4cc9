//! Byte-addressable backing file.
//!
//! Every read and write goes straight to the underlying file; there is no
//! caching layer. Scalars are little-endian fixed-width, strings are raw
//! bytes with the length carried by the caller's framing.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::Result;

mod sealed {
    pub trait Sealed {}
}

/// Fixed-width scalar readable and writable at an arbitrary file offset.
pub trait Scalar: sealed::Sealed + Copy {
    const SIZE: usize;
    fn decode(bytes: &[u8]) -> Self;
    fn encode(self, out: &mut [u8]);
}

macro_rules! impl_scalar {
    ($($ty:ty),*) => {
        $(
            impl sealed::Sealed for $ty {}
            impl Scalar for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();
                fn decode(bytes: &[u8]) -> Self {
                    <$ty>::from_le_bytes(bytes.try_into().expect("slice has scalar width"))
                }
                fn encode(self, out: &mut [u8]) {
                    out.copy_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

impl_scalar!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

pub struct DbFile {
    file: File,
}

impl DbFile {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self { file })
    }

    /// Wraps an already-opened handle. The handle must be readable and
    /// writable and positioned anywhere; positioning is managed per call.
    pub fn from_std(file: File) -> Self {
        Self { file }
    }

    pub fn len(&mut self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn is_empty(&mut self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Truncates the file to zero length.
    pub fn clear(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    /// Extends the file to `new_len` bytes, zero-filled. Shrinking is not
    /// performed; a smaller `new_len` is a no-op.
    pub fn grow(&mut self, new_len: u64) -> Result<()> {
        if self.len()? < new_len {
            self.file.set_len(new_len)?;
        }
        Ok(())
    }

    pub fn read_val<T: Scalar>(&mut self, offset: u64) -> Result<T> {
        let mut buf = [0u8; 8];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buf[..T::SIZE])?;
        Ok(T::decode(&buf[..T::SIZE]))
    }

    /// Writes `value` at `offset` and returns the offset just past it.
    pub fn write_val<T: Scalar>(&mut self, offset: u64, value: T) -> Result<u64> {
        let mut buf = [0u8; 8];
        value.encode(&mut buf[..T::SIZE]);
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&buf[..T::SIZE])?;
        Ok(offset + T::SIZE as u64)
    }

    pub fn read_bytes(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Writes `bytes` at `offset` and returns the offset just past them.
    pub fn write_bytes(&mut self, offset: u64, bytes: &[u8]) -> Result<u64> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(bytes)?;
        Ok(offset + bytes.len() as u64)
    }
}
