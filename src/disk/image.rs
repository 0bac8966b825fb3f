use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

use memmap::{Mmap, MmapMut, MmapOptions};

use crate::disk::error::DiskError;

/// Provide backing storage (file or memory) for disk images.
#[derive(Debug)]
pub enum Image {
    ReadOnlyMap(Mmap),
    ReadWriteMap(MmapMut),
    Memory(Box<[u8]>),
}

impl Image {
    pub fn open_memory(length: usize) -> Image {
        Image::Memory(vec![0; length].into_boxed_slice())
    }

    /// Take ownership of an existing byte buffer.
    pub fn from_bytes(bytes: Vec<u8>) -> Image {
        Image::Memory(bytes.into_boxed_slice())
    }

    pub fn open_read_only<P: AsRef<Path>>(path: P) -> io::Result<Image> {
        let file = File::open(path)?;
        let mmap = unsafe { MmapOptions::new().map(&file)? };
        Ok(Image::ReadOnlyMap(mmap))
    }

    pub fn open_read_write<P: AsRef<Path>>(path: P) -> io::Result<Image> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mmap = unsafe { MmapOptions::new().map_mut(&file)? };
        Ok(Image::ReadWriteMap(mmap))
    }

    pub fn create<P: AsRef<Path>>(path: P, length: usize, create_new: bool) -> io::Result<Image> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .create_new(create_new)
            .open(path)?;
        file.set_len(length as u64)?;
        let mmap = unsafe { MmapOptions::new().map_mut(&file)? };
        Ok(Image::ReadWriteMap(mmap))
    }

    pub fn len(&self) -> usize {
        match self {
            Image::ReadOnlyMap(mmap) => mmap.len(),
            Image::ReadWriteMap(mmap) => mmap.len(),
            Image::Memory(array) => array.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_bounds(&self, offset: usize) -> io::Result<()> {
        if offset > self.len() {
            Err(DiskError::InvalidTrackSector.into())
        } else {
            Ok(())
        }
    }

    pub fn check_writability(&self) -> io::Result<()> {
        match self {
            Image::ReadOnlyMap(_) => Err(DiskError::IoError.into()),
            Image::ReadWriteMap(_) => Ok(()),
            Image::Memory(_) => Ok(()),
        }
    }

    pub fn slice(&self, offset: usize, length: usize) -> io::Result<&[u8]> {
        self.check_bounds(offset + length)?;
        Ok(match self {
            Image::ReadOnlyMap(mmap) => &mmap[offset..offset + length],
            Image::ReadWriteMap(mmap) => &mmap[offset..offset + length],
            Image::Memory(array) => &array[offset..offset + length],
        })
    }

    pub fn slice_mut(&mut self, offset: usize, length: usize) -> io::Result<&mut [u8]> {
        self.check_bounds(offset + length)?;
        match self {
            Image::ReadOnlyMap(_) => Err(DiskError::IoError.into()),
            Image::ReadWriteMap(mmap) => Ok(&mut mmap[offset..offset + length]),
            Image::Memory(array) => Ok(&mut array[offset..offset + length]),
        }
    }

    /// Copy the full image contents.  Used both for `save()` and for the
    /// snapshots taken before destructive operations.
    pub fn to_vec(&self) -> Vec<u8> {
        match self {
            Image::ReadOnlyMap(mmap) => mmap.to_vec(),
            Image::ReadWriteMap(mmap) => mmap.to_vec(),
            Image::Memory(array) => array.to_vec(),
        }
    }

    /// Overwrite the image contents from a snapshot of equal length.
    pub fn restore(&mut self, snapshot: &[u8]) -> io::Result<()> {
        let length = self.len();
        assert_eq!(snapshot.len(), length);
        self.slice_mut(0, length)?.copy_from_slice(snapshot);
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        match self {
            Image::ReadOnlyMap(_) => Err(DiskError::IoError.into()),
            Image::ReadWriteMap(mmap) => mmap.flush(),
            Image::Memory(_) => Ok(()),
        }
    }
}
