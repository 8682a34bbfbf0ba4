//! Byte-exact on-disk layout: super-block, inode table and directory blocks.
//!
//! Every multi-byte field is little-endian. Block 0 is the super-block,
//! blocks 1..=32 hold the inode table (8 inodes of 64 bytes per block) and
//! a directory occupies exactly one data block.

use crate::bitmap::Bitmap;
use crate::block_store::{Block, BlockId, ZERO_BLOCK};
use crate::errno::Errno;
use crate::{BLOCK_COUNT, BLOCK_SIZE};

/// Block holding the super-block.
pub const SUPERBLOCK: BlockId = BlockId::new(0);
/// Number of blocks occupied by the inode table (blocks 1..=32).
pub const INODE_TABLE_BLOCKS: usize = 32;
/// Total number of inode slots.
pub const INODE_COUNT: usize = 256;
/// Size of one inode record in bytes.
pub const INODE_SIZE: usize = 64;
/// Inodes stored per table block.
pub const INODES_PER_BLOCK: usize = BLOCK_SIZE / INODE_SIZE;
/// Bytes of block 0 occupied by the inode free map (256 bits).
pub const INODE_MAP_BYTES: usize = INODE_COUNT / 8;

/// Entries per directory block.
pub const DIR_ENTRY_COUNT: usize = 7;
/// On-disk size of one directory entry: 64 name bytes plus the inode number.
pub const DIR_ENTRY_SIZE: usize = NAME_LEN + 1;
/// Size of the null-padded name field.
pub const NAME_LEN: usize = 64;
/// Longest representable entry name (the field keeps a terminating zero).
pub const NAME_MAX: usize = NAME_LEN - 1;
/// Offset of the out-of-band type-tag table inside a directory block.
/// Tag `k` describes entry `k`; the entries themselves end at byte 455.
pub const TYPE_TAG_OFFSET: usize = DIR_ENTRY_COUNT * DIR_ENTRY_SIZE;

/// Informational mode stamped on directories.
pub const MODE_DIRECTORY: i32 = 1777;
/// Informational mode stamped on regular files.
pub const MODE_REGULAR: i32 = 0o777;

/// Identifier of one inode slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct InodeId(u8);

impl InodeId {
  pub const fn new(id: u8) -> Self {
    Self(id)
  }

  pub fn index(self) -> usize {
    self.0 as usize
  }

  pub fn raw(self) -> u8 {
    self.0
  }
}

/// The root directory always lives in inode slot 0.
pub const ROOT_INODE: InodeId = InodeId::new(0);

/// Interpret a raw on-disk block pointer; 0 marks an unallocated slot.
/// (Block 0 is the super-block and can never back file data.)
pub fn block_pointer(raw: u16) -> Option<BlockId> {
  if raw == 0 {
    None
  } else {
    Some(BlockId::new(raw))
  }
}

/// Locate inode `id` inside the table: the containing block and the byte
/// offset of the record within it. Inodes share blocks, so all updates
/// read-modify-write the whole block.
pub fn inode_table_block(id: InodeId) -> (BlockId, usize) {
  (
    BlockId::new((1 + id.index() / INODES_PER_BLOCK) as u16),
    id.index() % INODES_PER_BLOCK * INODE_SIZE,
  )
}

pub(crate) fn u16_at(bytes: &[u8], offset: usize) -> u16 {
  let mut raw = [0u8; 2];
  raw.copy_from_slice(&bytes[offset..offset + 2]);
  u16::from_le_bytes(raw)
}

pub(crate) fn i32_at(bytes: &[u8], offset: usize) -> i32 {
  let mut raw = [0u8; 4];
  raw.copy_from_slice(&bytes[offset..offset + 4]);
  i32::from_le_bytes(raw)
}

pub(crate) fn i64_at(bytes: &[u8], offset: usize) -> i64 {
  let mut raw = [0u8; 8];
  raw.copy_from_slice(&bytes[offset..offset + 8]);
  i64::from_le_bytes(raw)
}

pub(crate) fn u64_at(bytes: &[u8], offset: usize) -> u64 {
  let mut raw = [0u8; 8];
  raw.copy_from_slice(&bytes[offset..offset + 8]);
  u64::from_le_bytes(raw)
}

/// Kind of a directory entry, stored as a one-byte tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
  Regular = 0,
  Directory = 1,
}

impl FileType {
  pub fn tag(self) -> u8 {
    self as u8
  }

  pub fn from_tag(tag: u8) -> Result<Self, Errno> {
    match tag {
      0 => Ok(FileType::Regular),
      1 => Ok(FileType::Directory),
      _ => Err(Errno::EBADFS(format!("unknown file type tag {tag}"))),
    }
  }
}

/// One on-disk inode, 64 bytes. A block pointer of 0 means "unallocated".
///
/// `device_id`, `user_id`, `group_id`, `file_mode`, `link_count` and the
/// three times are informational; nothing in the filesystem consults them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Inode {
  pub file_size: i32,
  pub device_id: i32,
  pub user_id: i32,
  pub group_id: i32,
  pub file_mode: i32,
  pub link_count: i32,
  pub change_time: i64,
  pub modification_time: i64,
  pub access_time: i64,
  pub direct_blocks: [u16; 6],
  pub indirect_block: u16,
  pub double_indirect_block: u16,
}

impl Inode {
  pub fn to_bytes(&self) -> [u8; INODE_SIZE] {
    let mut bytes = Vec::with_capacity(INODE_SIZE);
    bytes.extend_from_slice(&self.file_size.to_le_bytes());
    bytes.extend_from_slice(&self.device_id.to_le_bytes());
    bytes.extend_from_slice(&self.user_id.to_le_bytes());
    bytes.extend_from_slice(&self.group_id.to_le_bytes());
    bytes.extend_from_slice(&self.file_mode.to_le_bytes());
    bytes.extend_from_slice(&self.link_count.to_le_bytes());
    bytes.extend_from_slice(&self.change_time.to_le_bytes());
    bytes.extend_from_slice(&self.modification_time.to_le_bytes());
    bytes.extend_from_slice(&self.access_time.to_le_bytes());
    for pointer in self.direct_blocks {
      bytes.extend_from_slice(&pointer.to_le_bytes());
    }
    bytes.extend_from_slice(&self.indirect_block.to_le_bytes());
    bytes.extend_from_slice(&self.double_indirect_block.to_le_bytes());

    let mut out = [0u8; INODE_SIZE];
    out.copy_from_slice(&bytes);
    out
  }

  pub fn from_bytes(bytes: &[u8; INODE_SIZE]) -> Self {
    let mut direct_blocks = [0u16; 6];
    for (i, slot) in direct_blocks.iter_mut().enumerate() {
      *slot = u16_at(bytes, 48 + i * 2);
    }
    Self {
      file_size: i32_at(bytes, 0),
      device_id: i32_at(bytes, 4),
      user_id: i32_at(bytes, 8),
      group_id: i32_at(bytes, 12),
      file_mode: i32_at(bytes, 16),
      link_count: i32_at(bytes, 20),
      change_time: i64_at(bytes, 24),
      modification_time: i64_at(bytes, 32),
      access_time: i64_at(bytes, 40),
      direct_blocks,
      indirect_block: u16_at(bytes, 60),
      double_indirect_block: u16_at(bytes, 62),
    }
  }
}

/// Super-block contents: the inode free map plus cached geometry counters.
/// The counters are refreshed whenever the super-block is rewritten; the
/// free-block map remains the authority on block allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
  pub inode_map: Bitmap,
  pub total_blocks: u64,
  pub free_blocks: u64,
  pub block_size: u64,
}

impl Superblock {
  pub fn new() -> Self {
    Self {
      inode_map: Bitmap::new(INODE_COUNT),
      total_blocks: BLOCK_COUNT as u64,
      free_blocks: 0,
      block_size: BLOCK_SIZE as u64,
    }
  }

  pub fn to_block(&self) -> Block {
    let mut block = ZERO_BLOCK;
    block[..INODE_MAP_BYTES].copy_from_slice(self.inode_map.as_bytes());
    block[32..40].copy_from_slice(&self.total_blocks.to_le_bytes());
    block[40..48].copy_from_slice(&self.free_blocks.to_le_bytes());
    block[48..56].copy_from_slice(&self.block_size.to_le_bytes());
    block
  }

  pub fn from_block(block: &Block) -> Result<Self, Errno> {
    let superblock = Self {
      inode_map: Bitmap::from_bytes(INODE_COUNT, &block[..INODE_MAP_BYTES])?,
      total_blocks: u64_at(block, 32),
      free_blocks: u64_at(block, 40),
      block_size: u64_at(block, 48),
    };
    if superblock.total_blocks != BLOCK_COUNT as u64
      || superblock.block_size != BLOCK_SIZE as u64
    {
      return Err(Errno::EBADFS(format!(
        "super-block geometry mismatch: {} blocks of {} bytes",
        superblock.total_blocks, superblock.block_size
      )));
    }
    Ok(superblock)
  }
}

/// One directory slot: a null-padded name, the inode number and the type
/// tag kept in the block's padding. A slot with inode number 0 is free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntry {
  pub name: [u8; NAME_LEN],
  pub inode: u8,
  pub ftype: FileType,
}

impl DirEntry {
  pub fn empty() -> Self {
    Self {
      name: [0; NAME_LEN],
      inode: 0,
      ftype: FileType::Regular,
    }
  }

  pub fn new(name: &str, inode: InodeId, ftype: FileType) -> Result<Self, Errno> {
    let bytes = name.as_bytes();
    if bytes.is_empty() {
      return Err(Errno::EINVAL(String::from("entry name cannot be empty")));
    }
    if bytes.len() > NAME_MAX {
      return Err(Errno::ENAMETOOLONG(format!(
        "'{name}' is longer than {NAME_MAX} bytes"
      )));
    }
    let mut padded = [0u8; NAME_LEN];
    padded[..bytes.len()].copy_from_slice(bytes);
    Ok(Self {
      name: padded,
      inode: inode.raw(),
      ftype,
    })
  }

  pub fn is_free(&self) -> bool {
    self.inode == 0
  }

  pub fn name_bytes(&self) -> &[u8] {
    let len = self.name.iter().position(|b| *b == 0).unwrap_or(NAME_LEN);
    &self.name[..len]
  }

  pub fn name_string(&self) -> String {
    String::from_utf8_lossy(self.name_bytes()).into_owned()
  }

  pub fn matches(&self, name: &str) -> bool {
    !self.is_free() && self.name_bytes() == name.as_bytes()
  }
}

/// In-memory image of one directory block: seven fixed slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directory {
  pub entries: [DirEntry; DIR_ENTRY_COUNT],
}

impl Directory {
  pub fn empty() -> Self {
    Self {
      entries: [DirEntry::empty(); DIR_ENTRY_COUNT],
    }
  }

  /// Slot index of the entry named `name`, if present.
  pub fn find(&self, name: &str) -> Option<usize> {
    self.entries.iter().position(|entry| entry.matches(name))
  }

  /// Lowest free slot, if the directory is not full.
  pub fn free_slot(&self) -> Option<usize> {
    self.entries.iter().position(|entry| entry.is_free())
  }

  pub fn is_empty(&self) -> bool {
    self.entries.iter().all(|entry| entry.is_free())
  }

  pub fn clear_slot(&mut self, slot: usize) {
    self.entries[slot] = DirEntry::empty();
  }

  pub fn to_block(&self) -> Block {
    let mut block = ZERO_BLOCK;
    for (slot, entry) in self.entries.iter().enumerate() {
      let base = slot * DIR_ENTRY_SIZE;
      block[base..base + NAME_LEN].copy_from_slice(&entry.name);
      block[base + NAME_LEN] = entry.inode;
      block[TYPE_TAG_OFFSET + slot] = entry.ftype.tag();
    }
    block
  }

  pub fn from_block(block: &Block) -> Result<Self, Errno> {
    let mut entries = [DirEntry::empty(); DIR_ENTRY_COUNT];
    for (slot, entry) in entries.iter_mut().enumerate() {
      let base = slot * DIR_ENTRY_SIZE;
      let mut name = [0u8; NAME_LEN];
      name.copy_from_slice(&block[base..base + NAME_LEN]);
      let inode = block[base + NAME_LEN];
      let ftype = if inode == 0 {
        FileType::Regular
      } else {
        FileType::from_tag(block[TYPE_TAG_OFFSET + slot])?
      };
      *entry = DirEntry { name, inode, ftype };
    }
    Ok(Self { entries })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn inode_serializes_to_the_documented_offsets() {
    let inode = Inode {
      file_size: 600,
      device_id: 1,
      user_id: 2,
      group_id: 3,
      file_mode: MODE_DIRECTORY,
      link_count: 1,
      change_time: 0x0102_0304_0506_0708,
      modification_time: -1,
      access_time: 7,
      direct_blocks: [34, 35, 0, 0, 0, 0],
      indirect_block: 40,
      double_indirect_block: 41,
    };

    let bytes = inode.to_bytes();
    assert_eq!(&bytes[0..4], &600i32.to_le_bytes());
    assert_eq!(&bytes[16..20], &MODE_DIRECTORY.to_le_bytes());
    assert_eq!(&bytes[24..32], &0x0102_0304_0506_0708i64.to_le_bytes());
    assert_eq!(&bytes[32..40], &(-1i64).to_le_bytes());
    assert_eq!(&bytes[48..50], &34u16.to_le_bytes());
    assert_eq!(&bytes[50..52], &35u16.to_le_bytes());
    assert_eq!(&bytes[60..62], &40u16.to_le_bytes());
    assert_eq!(&bytes[62..64], &41u16.to_le_bytes());

    assert_eq!(Inode::from_bytes(&bytes), inode);
  }

  #[test]
  fn inode_table_positions_share_blocks() {
    assert_eq!(inode_table_block(InodeId::new(0)), (BlockId::new(1), 0));
    assert_eq!(inode_table_block(InodeId::new(7)), (BlockId::new(1), 448));
    assert_eq!(inode_table_block(InodeId::new(8)), (BlockId::new(2), 0));
    assert_eq!(inode_table_block(InodeId::new(255)), (BlockId::new(32), 448));
  }

  #[test]
  fn superblock_round_trips_through_block_zero() {
    let mut superblock = Superblock::new();
    superblock.inode_map.set(0).unwrap();
    superblock.inode_map.set(12).unwrap();
    superblock.free_blocks = 65_486;

    let block = superblock.to_block();
    assert_eq!(block[0], 0b0000_0001);
    assert_eq!(block[1], 0b0001_0000);

    let readback = Superblock::from_block(&block).unwrap();
    assert_eq!(readback, superblock);
  }

  #[test]
  fn superblock_rejects_foreign_geometry() {
    let mut block = Superblock::new().to_block();
    block[48..56].copy_from_slice(&4096u64.to_le_bytes());

    assert!(matches!(
      Superblock::from_block(&block),
      Err(Errno::EBADFS(_))
    ));
  }

  #[test]
  fn directory_entries_occupy_65_bytes_each() {
    let mut directory = Directory::empty();
    directory.entries[0] =
      DirEntry::new("notes.txt", InodeId::new(3), FileType::Regular).unwrap();
    directory.entries[2] =
      DirEntry::new("sub", InodeId::new(9), FileType::Directory).unwrap();

    let block = directory.to_block();
    assert_eq!(&block[0..9], b"notes.txt");
    assert_eq!(block[64], 3);
    assert_eq!(&block[2 * DIR_ENTRY_SIZE..2 * DIR_ENTRY_SIZE + 3], b"sub");
    assert_eq!(block[2 * DIR_ENTRY_SIZE + 64], 9);
    assert_eq!(block[TYPE_TAG_OFFSET], 0);
    assert_eq!(block[TYPE_TAG_OFFSET + 2], 1);

    let readback = Directory::from_block(&block).unwrap();
    assert_eq!(readback, directory);
    assert_eq!(readback.find("sub"), Some(2));
    assert_eq!(readback.find("missing"), None);
    assert_eq!(readback.free_slot(), Some(1));
    assert!(!readback.is_empty());
  }

  #[test]
  fn entry_names_are_limited_to_63_bytes() {
    let just_fits = "n".repeat(NAME_MAX);
    assert!(DirEntry::new(&just_fits, InodeId::new(1), FileType::Regular).is_ok());

    let too_long = "n".repeat(NAME_MAX + 1);
    assert!(matches!(
      DirEntry::new(&too_long, InodeId::new(1), FileType::Regular),
      Err(Errno::ENAMETOOLONG(_))
    ));
  }

  #[test]
  fn corrupt_type_tags_are_detected() {
    let mut directory = Directory::empty();
    directory.entries[0] =
      DirEntry::new("f", InodeId::new(1), FileType::Regular).unwrap();
    let mut block = directory.to_block();
    block[TYPE_TAG_OFFSET] = 9;

    assert!(matches!(
      Directory::from_block(&block),
      Err(Errno::EBADFS(_))
    ));
  }
}

// vim:ts=2 sw=2
