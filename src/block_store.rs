//! Fixed-geometry block store backed by a single image file.
//!
//! The device is 65,536 blocks of 512 bytes. The last 16 blocks hold the
//! free-block map (one bit per block); their own bits are set at creation
//! and never cleared. All other policy lives above this layer.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::{trace, warn};

use crate::bitmap::Bitmap;
use crate::errno::Errno;
use crate::{BLOCK_COUNT, BLOCK_SIZE, IMAGE_SIZE};

/// Number of trailing blocks reserved for the free-block map.
pub const MAP_BLOCKS: usize = BLOCK_COUNT / 8 / BLOCK_SIZE;
/// First block of the free-block map region.
pub const MAP_START: usize = BLOCK_COUNT - MAP_BLOCKS;

/// One raw 512-byte block.
pub type Block = [u8; BLOCK_SIZE];

/// An all-zero block, for initializing freshly allocated storage.
pub const ZERO_BLOCK: Block = [0u8; BLOCK_SIZE];

/// Identifier of one device block. The 16-bit representation covers the
/// device exactly, so out-of-range ids are unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct BlockId(u16);

impl BlockId {
  pub const fn new(id: u16) -> Self {
    Self(id)
  }

  pub fn index(self) -> usize {
    self.0 as usize
  }

  pub fn raw(self) -> u16 {
    self.0
  }
}

/// A fixed-capacity array of blocks stored in one backing file, together
/// with the allocation state of every block.
pub struct BlockStore {
  file: File,
  free_map: Bitmap,
}

impl BlockStore {
  /// Create a new zero-filled image at `path`, reserving the map blocks.
  pub fn create(path: &Path) -> Result<Self, Errno> {
    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(true)
      .open(path)?;
    file.set_len(IMAGE_SIZE)?;

    let mut store = Self {
      file,
      free_map: Bitmap::new(BLOCK_COUNT),
    };
    for bit in MAP_START..BLOCK_COUNT {
      store.free_map.set(bit)?;
    }
    store.flush()?;
    Ok(store)
  }

  /// Open an existing image, reconstructing the free-block map from the
  /// trailing map blocks.
  pub fn open(path: &Path) -> Result<Self, Errno> {
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    let len = file.metadata()?.len();
    if len != IMAGE_SIZE {
      return Err(Errno::EBADFS(format!(
        "image is {len} bytes, expected {IMAGE_SIZE}"
      )));
    }

    let mut bytes = vec![0u8; MAP_BLOCKS * BLOCK_SIZE];
    let mut reader = &file;
    reader.seek(SeekFrom::Start((MAP_START * BLOCK_SIZE) as u64))?;
    reader.read_exact(&mut bytes)?;

    let free_map = Bitmap::from_bytes(BLOCK_COUNT, &bytes)?;
    for bit in MAP_START..BLOCK_COUNT {
      if !free_map.test(bit)? {
        return Err(Errno::EBADFS(String::from(
          "free-block map does not cover its own blocks",
        )));
      }
    }
    Ok(Self { file, free_map })
  }

  /// Allocate the lowest free block, marking it in use.
  pub fn allocate(&mut self) -> Result<BlockId, Errno> {
    let bit = self
      .free_map
      .first_zero()
      .ok_or_else(|| Errno::ENOSPC(String::from("no free blocks left")))?;
    self.free_map.set(bit)?;
    self.persist_map_block(bit)?;
    trace!("allocated block {bit}");
    Ok(BlockId::new(bit as u16))
  }

  /// Mark a specific block in use; fails if it already is.
  pub fn request(&mut self, id: BlockId) -> Result<(), Errno> {
    if self.free_map.test(id.index())? {
      return Err(Errno::EEXIST(format!(
        "block {} is already allocated",
        id.raw()
      )));
    }
    self.free_map.set(id.index())?;
    self.persist_map_block(id.index())
  }

  /// Return a block to the pool. The map's own blocks are never released.
  pub fn release(&mut self, id: BlockId) -> Result<(), Errno> {
    if id.index() >= MAP_START {
      return Err(Errno::EINVAL(format!(
        "block {} belongs to the free-block map",
        id.raw()
      )));
    }
    if !self.free_map.test(id.index())? {
      warn!("releasing block {} which is already free", id.raw());
      return Ok(());
    }
    self.free_map.reset(id.index())?;
    self.persist_map_block(id.index())
  }

  pub fn is_allocated(&self, id: BlockId) -> Result<bool, Errno> {
    self.free_map.test(id.index())
  }

  /// Number of blocks currently free.
  pub fn free_count(&self) -> u32 {
    BLOCK_COUNT as u32 - self.free_map.popcount()
  }

  /// Copy block `id` into `dst`.
  pub fn read(&self, id: BlockId, dst: &mut Block) -> Result<(), Errno> {
    let mut reader = &self.file;
    reader.seek(SeekFrom::Start((id.index() * BLOCK_SIZE) as u64))?;
    reader.read_exact(dst)?;
    Ok(())
  }

  /// Overwrite block `id` with `src`.
  pub fn write(&mut self, id: BlockId, src: &Block) -> Result<(), Errno> {
    self.file.seek(SeekFrom::Start((id.index() * BLOCK_SIZE) as u64))?;
    self.file.write_all(src)?;
    Ok(())
  }

  /// Write the free-block map back and sync the backing file.
  pub fn flush(&mut self) -> Result<(), Errno> {
    for chunk in 0..MAP_BLOCKS {
      self.persist_map_chunk(chunk)?;
    }
    self.file.sync_all()?;
    Ok(())
  }

  fn persist_map_block(&mut self, bit: usize) -> Result<(), Errno> {
    self.persist_map_chunk(bit / (BLOCK_SIZE * 8))
  }

  fn persist_map_chunk(&mut self, chunk: usize) -> Result<(), Errno> {
    let mut block = ZERO_BLOCK;
    block.copy_from_slice(&self.free_map.as_bytes()[chunk * BLOCK_SIZE..(chunk + 1) * BLOCK_SIZE]);
    self.write(BlockId::new((MAP_START + chunk) as u16), &block)
  }
}

impl Drop for BlockStore {
  fn drop(&mut self) {
    if let Err(err) = self.flush() {
      warn!("flushing block store on drop failed: {err}");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn scratch() -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.img");
    (dir, path)
  }

  #[test]
  fn create_reserves_only_the_map_blocks() {
    let (_dir, path) = scratch();
    let mut store = BlockStore::create(&path).unwrap();

    assert_eq!(store.free_count(), (BLOCK_COUNT - MAP_BLOCKS) as u32);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), IMAGE_SIZE);

    // the pool below the map is untouched, so the lowest block comes first
    assert_eq!(store.allocate().unwrap(), BlockId::new(0));
    assert_eq!(store.allocate().unwrap(), BlockId::new(1));
  }

  #[test]
  fn open_rejects_wrong_image_size() {
    let (_dir, path) = scratch();
    std::fs::write(&path, b"not an image").unwrap();

    assert!(matches!(BlockStore::open(&path), Err(Errno::EBADFS(_))));
  }

  #[test]
  fn read_write_round_trips() {
    let (_dir, path) = scratch();
    let mut store = BlockStore::create(&path).unwrap();
    let id = store.allocate().unwrap();

    let mut block = ZERO_BLOCK;
    for (i, byte) in block.iter_mut().enumerate() {
      *byte = (i % 251) as u8;
    }
    store.write(id, &block).unwrap();

    let mut readback = ZERO_BLOCK;
    store.read(id, &mut readback).unwrap();
    assert_eq!(readback, block);
  }

  #[test]
  fn request_conflicts_on_taken_blocks() {
    let (_dir, path) = scratch();
    let mut store = BlockStore::create(&path).unwrap();

    store.request(BlockId::new(7)).unwrap();
    assert!(matches!(
      store.request(BlockId::new(7)),
      Err(Errno::EEXIST(_))
    ));
    assert!(matches!(
      store.request(BlockId::new((MAP_START) as u16)),
      Err(Errno::EEXIST(_))
    ));
  }

  #[test]
  fn release_reopens_the_lowest_slot() {
    let (_dir, path) = scratch();
    let mut store = BlockStore::create(&path).unwrap();

    let first = store.allocate().unwrap();
    let _second = store.allocate().unwrap();
    store.release(first).unwrap();
    assert_eq!(store.allocate().unwrap(), first);
  }

  #[test]
  fn map_blocks_cannot_be_released() {
    let (_dir, path) = scratch();
    let mut store = BlockStore::create(&path).unwrap();

    assert!(matches!(
      store.release(BlockId::new(MAP_START as u16)),
      Err(Errno::EINVAL(_))
    ));
  }

  #[test]
  fn allocation_state_survives_reopen() {
    let (_dir, path) = scratch();
    {
      let mut store = BlockStore::create(&path).unwrap();
      store.request(BlockId::new(0)).unwrap();
      store.allocate().unwrap();
      store.allocate().unwrap();
      store.flush().unwrap();
    }

    let store = BlockStore::open(&path).unwrap();
    assert_eq!(store.free_count(), (BLOCK_COUNT - MAP_BLOCKS - 3) as u32);
    assert!(store.is_allocated(BlockId::new(0)).unwrap());
    assert!(store.is_allocated(BlockId::new(1)).unwrap());
    assert!(store.is_allocated(BlockId::new(2)).unwrap());
    assert!(!store.is_allocated(BlockId::new(3)).unwrap());
  }
}

// vim:ts=2 sw=2
