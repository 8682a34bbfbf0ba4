//! The filesystem proper: path resolution, directory bookkeeping and the
//! file I/O engine over the direct / indirect / double-indirect block map.

use std::path::Path;

use fancy_regex::Regex;
use lazy_static::lazy_static;
use log::debug;

use crate::bitmap::Bitmap;
use crate::block_store::{BlockId, BlockStore, ZERO_BLOCK};
use crate::errno::Errno;
use crate::layout::{
  block_pointer, inode_table_block, DirEntry, Directory, FileType, Inode, InodeId, Superblock,
  INODE_COUNT, INODE_SIZE, INODE_TABLE_BLOCKS, MODE_DIRECTORY, MODE_REGULAR, NAME_MAX,
  ROOT_INODE, SUPERBLOCK,
};
use crate::util::unixtime;
use crate::BLOCK_SIZE;

/// Index of an open descriptor slot.
pub type Fd = usize;

/// Size of the descriptor table.
pub const DESCRIPTOR_COUNT: usize = 256;

/// Logical blocks reachable through the direct pointers.
const DIRECT_BOUND: usize = 6;
/// Block ids stored per index block.
const INDEX_ENTRIES: usize = BLOCK_SIZE / 2;
/// First logical block past the single-indirect tier.
const INDIRECT_BOUND: usize = DIRECT_BOUND + INDEX_ENTRIES;
/// First logical block past the double-indirect tier. Nothing at or beyond
/// this index is representable; writes truncate there.
const DOUBLE_BOUND: usize = INDIRECT_BOUND + INDEX_ENTRIES * INDEX_ENTRIES;

/// An index block viewed as its 256 block-id slots.
type IndexBlock = [u16; INDEX_ENTRIES];

lazy_static! {
  static ref SEGMENT_RE: Regex = Regex::new(r"\A[^/\x00]+\z").unwrap();
}

/// Origin for [`TinyFs::seek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekWhence {
  /// Offset from the beginning of the file.
  Set = 0,
  /// Offset from the current position.
  Cur = 1,
  /// Offset from the end of the file.
  End = 2,
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirRecord {
  pub name: String,
  pub inode: InodeId,
  pub ftype: FileType,
}

/// Informational metadata of one file or directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
  pub inode: InodeId,
  pub ftype: FileType,
  pub size: i32,
  pub mode: i32,
  pub link_count: i32,
  pub user_id: i32,
  pub group_id: i32,
  pub change_time: i64,
  pub modification_time: i64,
  pub access_time: i64,
}

/// An open file: the inode it refers to and the read/write position.
/// Descriptor state is purely in-memory.
#[derive(Debug, Clone, Copy, Default)]
struct Descriptor {
  inode: InodeId,
  position: i32,
}

/// Parent directory of a path's final component, already read from disk.
struct ResolvedPath<'a> {
  dir_block: BlockId,
  directory: Directory,
  leaf: &'a str,
}

/// A mounted filesystem. Owns the block store, the descriptor table and the
/// descriptor bitmap; dropping the handle flushes the backing file.
pub struct TinyFs {
  store: BlockStore,
  superblock: Superblock,
  descriptors: [Descriptor; DESCRIPTOR_COUNT],
  descriptor_map: Bitmap,
}

impl TinyFs {
  /// Create a fresh filesystem image at `path` and mount it.
  pub fn format(path: &Path) -> Result<Self, Errno> {
    let mut store = BlockStore::create(path)?;

    // Fixed region: super-block plus the inode table.
    store.request(SUPERBLOCK)?;
    for table_block in 1..=INODE_TABLE_BLOCKS {
      let id = BlockId::new(table_block as u16);
      store.request(id)?;
      store.write(id, &ZERO_BLOCK)?;
    }

    // Root directory: inode slot 0 plus a single directory block.
    let root_block = store.allocate()?;
    store.write(root_block, &Directory::empty().to_block())?;

    let mut superblock = Superblock::new();
    superblock.inode_map.set(ROOT_INODE.index())?;

    let mut fs = Self {
      store,
      superblock,
      descriptors: [Descriptor::default(); DESCRIPTOR_COUNT],
      descriptor_map: Bitmap::new(DESCRIPTOR_COUNT),
    };

    let now = unixtime();
    let mut root = Inode::default();
    root.file_size = BLOCK_SIZE as i32;
    root.file_mode = MODE_DIRECTORY;
    root.link_count = 1;
    root.change_time = now;
    root.modification_time = now;
    root.access_time = now;
    root.direct_blocks[0] = root_block.raw();
    fs.write_inode(ROOT_INODE, &root)?;
    fs.write_superblock()?;

    debug!("formatted {}", path.display());
    Ok(fs)
  }

  /// Mount an existing image.
  pub fn mount(path: &Path) -> Result<Self, Errno> {
    let store = BlockStore::open(path)?;
    let mut block = ZERO_BLOCK;
    store.read(SUPERBLOCK, &mut block)?;
    let superblock = Superblock::from_block(&block)?;
    if !superblock.inode_map.test(ROOT_INODE.index())? {
      return Err(Errno::EBADFS(String::from("root inode is not allocated")));
    }

    debug!("mounted {} ({} free blocks)", path.display(), store.free_count());
    Ok(Self {
      store,
      superblock,
      descriptors: [Descriptor::default(); DESCRIPTOR_COUNT],
      descriptor_map: Bitmap::new(DESCRIPTOR_COUNT),
    })
  }

  /// Flush everything to the backing file and tear the handle down.
  pub fn unmount(mut self) -> Result<(), Errno> {
    debug!("unmounting");
    self.store.flush()
  }

  /// Create a regular file or directory at an absolute path. Missing
  /// ancestors are not created.
  pub fn create(&mut self, pathname: &str, ftype: FileType) -> Result<(), Errno> {
    let resolved = self.resolve_parent(pathname)?;
    if resolved.directory.find(resolved.leaf).is_some() {
      return Err(Errno::EEXIST(format!("'{pathname}' already exists")));
    }
    let slot = resolved
      .directory
      .free_slot()
      .ok_or_else(|| Errno::ENOSPC(format!("parent directory of '{pathname}' is full")))?;
    let free = self
      .superblock
      .inode_map
      .first_zero()
      .ok_or_else(|| Errno::ENOSPC(String::from("no free inodes left")))?;
    let inode_id = InodeId::new(free as u8);

    let data_block = match ftype {
      FileType::Directory => Some(self.store.allocate()?),
      FileType::Regular => None,
    };
    match self.install_node(&resolved, slot, inode_id, ftype, data_block) {
      Ok(()) => Ok(()),
      Err(err) => {
        if let Some(block) = data_block {
          let _ = self.store.release(block);
        }
        Err(err)
      }
    }
  }

  /// Open a regular file; the position starts at the beginning of the file.
  pub fn open(&mut self, pathname: &str) -> Result<Fd, Errno> {
    if pathname == "/" {
      return Err(Errno::EISDIR(String::from("cannot open the root directory")));
    }
    let resolved = self.resolve_parent(pathname)?;
    let slot = resolved
      .directory
      .find(resolved.leaf)
      .ok_or_else(|| Errno::ENOENT(format!("'{pathname}' does not exist")))?;
    let entry = resolved.directory.entries[slot];
    if entry.ftype == FileType::Directory {
      return Err(Errno::EISDIR(format!("cannot open directory '{pathname}'")));
    }

    let fd = self
      .descriptor_map
      .first_zero()
      .ok_or_else(|| Errno::ENOSPC(String::from("no free descriptors left")))?;
    self.descriptor_map.set(fd)?;
    self.descriptors[fd] = Descriptor {
      inode: InodeId::new(entry.inode),
      position: 0,
    };
    Ok(fd)
  }

  /// Close an open descriptor. Closing twice fails.
  pub fn close(&mut self, fd: Fd) -> Result<(), Errno> {
    self.descriptor(fd)?;
    self.descriptor_map.reset(fd)
  }

  /// Move a descriptor's position. The result is clamped to the file, so
  /// seeking before the start lands on 0 and past the end lands on EOF.
  pub fn seek(&mut self, fd: Fd, offset: i64, whence: SeekWhence) -> Result<u64, Errno> {
    let mut descriptor = self.descriptor(fd)?;
    let inode = self.read_inode(descriptor.inode)?;
    let size = inode.file_size as i64;
    let base = match whence {
      SeekWhence::Set => 0,
      SeekWhence::Cur => descriptor.position as i64,
      SeekWhence::End => size,
    };
    let target = base.saturating_add(offset).clamp(0, size);
    descriptor.position = target as i32;
    self.descriptors[fd] = descriptor;
    Ok(target as u64)
  }

  /// Read up to `dst.len()` bytes from the descriptor's position, stopping
  /// at end of file or at the first unmaterialized hole. Advances the
  /// position by the bytes actually copied.
  pub fn read(&mut self, fd: Fd, dst: &mut [u8]) -> Result<usize, Errno> {
    let mut descriptor = self.descriptor(fd)?;
    let inode = self.read_inode(descriptor.inode)?;
    let position = descriptor.position as usize;
    let want = dst.len().min((inode.file_size as usize).saturating_sub(position));

    let mut copied = 0usize;
    while copied < want {
      let pos = position + copied;
      let logical = pos / BLOCK_SIZE;
      let offset = pos % BLOCK_SIZE;
      let run = (BLOCK_SIZE - offset).min(want - copied);
      let id = match self.physical_block(&inode, logical)? {
        Some(id) => id,
        None => break,
      };
      let mut block = ZERO_BLOCK;
      self.store.read(id, &mut block)?;
      dst[copied..copied + run].copy_from_slice(&block[offset..offset + run]);
      copied += run;
    }

    descriptor.position = (position + copied) as i32;
    self.descriptors[fd] = descriptor;
    Ok(copied)
  }

  /// Write `src` at the descriptor's position, materializing data and index
  /// blocks as needed. Running out of space (or off the end of the
  /// addressable range) yields a short count, not an error; everything up to
  /// the returned count is committed when the call returns.
  pub fn write(&mut self, fd: Fd, src: &[u8]) -> Result<usize, Errno> {
    let mut descriptor = self.descriptor(fd)?;
    let mut inode = self.read_inode(descriptor.inode)?;
    let original = inode;
    let position = descriptor.position as usize;

    let mut written = 0usize;
    let mut failure: Option<Errno> = None;
    while written < src.len() {
      let pos = position + written;
      let logical = pos / BLOCK_SIZE;
      if logical >= DOUBLE_BOUND {
        break;
      }
      let offset = pos % BLOCK_SIZE;
      let run = (BLOCK_SIZE - offset).min(src.len() - written);
      let (id, fresh) = match self.materialize_block(&mut inode, logical) {
        Ok(found) => found,
        Err(Errno::ENOSPC(_)) => break,
        Err(err) => {
          failure = Some(err);
          break;
        }
      };
      // Freshly allocated blocks start from zeroes so a partial write never
      // exposes stale pool contents; existing blocks are read back first.
      let mut block = ZERO_BLOCK;
      if !fresh && run < BLOCK_SIZE {
        if let Err(err) = self.store.read(id, &mut block) {
          failure = Some(err);
          break;
        }
      }
      block[offset..offset + run].copy_from_slice(&src[written..written + run]);
      if let Err(err) = self.store.write(id, &block) {
        failure = Some(err);
        break;
      }
      written += run;
    }

    if written > 0 {
      let end = (position + written) as i32;
      if end > inode.file_size {
        inode.file_size = end;
      }
      let now = unixtime();
      inode.modification_time = now;
      inode.change_time = now;
      descriptor.position = end;
      self.descriptors[fd] = descriptor;
    }
    // Index blocks may have been materialized even when no byte landed.
    if inode != original {
      if let Err(err) = self.write_inode(descriptor.inode, &inode) {
        return Err(failure.unwrap_or(err));
      }
    }
    match failure {
      Some(err) => Err(err),
      None => Ok(written),
    }
  }

  /// Remove a file or an empty directory, returning all of its blocks to
  /// the pool. Descriptors still open on the removed inode are closed.
  pub fn remove(&mut self, pathname: &str) -> Result<(), Errno> {
    if pathname == "/" {
      return Err(Errno::EINVAL(String::from("cannot remove the root directory")));
    }
    let resolved = self.resolve_parent(pathname)?;
    let slot = resolved
      .directory
      .find(resolved.leaf)
      .ok_or_else(|| Errno::ENOENT(format!("'{pathname}' does not exist")))?;
    let entry = resolved.directory.entries[slot];
    let inode_id = InodeId::new(entry.inode);
    let inode = self.read_inode(inode_id)?;

    match entry.ftype {
      FileType::Directory => {
        let (block, directory) = self.read_directory(&inode)?;
        if !directory.is_empty() {
          return Err(Errno::ENOTEMPTY(format!("directory '{pathname}' is not empty")));
        }
        self.store.release(block)?;
      }
      FileType::Regular => {
        self.release_file_blocks(&inode)?;
      }
    }

    self.write_inode(inode_id, &Inode::default())?;
    self.superblock.inode_map.reset(inode_id.index())?;

    let mut directory = resolved.directory.clone();
    directory.clear_slot(slot);
    self.store.write(resolved.dir_block, &directory.to_block())?;
    self.write_superblock()?;

    for fd in 0..DESCRIPTOR_COUNT {
      if self.descriptor_map.test(fd)? && self.descriptors[fd].inode == inode_id {
        self.descriptor_map.reset(fd)?;
      }
    }

    debug!("removed '{pathname}' (inode {})", inode_id.raw());
    Ok(())
  }

  /// List a directory's live entries in slot order.
  pub fn get_dir(&self, pathname: &str) -> Result<Vec<DirRecord>, Errno> {
    let directory = if pathname == "/" {
      let root = self.read_inode(ROOT_INODE)?;
      self.read_directory(&root)?.1
    } else {
      let resolved = self.resolve_parent(pathname)?;
      let slot = resolved
        .directory
        .find(resolved.leaf)
        .ok_or_else(|| Errno::ENOENT(format!("'{pathname}' does not exist")))?;
      let entry = resolved.directory.entries[slot];
      if entry.ftype != FileType::Directory {
        return Err(Errno::ENOTDIR(format!("'{pathname}' is not a directory")));
      }
      let inode = self.read_inode(InodeId::new(entry.inode))?;
      self.read_directory(&inode)?.1
    };

    Ok(
      directory
        .entries
        .iter()
        .filter(|entry| !entry.is_free())
        .map(|entry| DirRecord {
          name: entry.name_string(),
          inode: InodeId::new(entry.inode),
          ftype: entry.ftype,
        })
        .collect(),
    )
  }

  /// Informational metadata of the file or directory at `pathname`.
  pub fn stat(&self, pathname: &str) -> Result<FileStat, Errno> {
    let (inode_id, ftype) = if pathname == "/" {
      (ROOT_INODE, FileType::Directory)
    } else {
      let resolved = self.resolve_parent(pathname)?;
      let slot = resolved
        .directory
        .find(resolved.leaf)
        .ok_or_else(|| Errno::ENOENT(format!("'{pathname}' does not exist")))?;
      let entry = resolved.directory.entries[slot];
      (InodeId::new(entry.inode), entry.ftype)
    };
    let inode = self.read_inode(inode_id)?;
    Ok(FileStat {
      inode: inode_id,
      ftype,
      size: inode.file_size,
      mode: inode.file_mode,
      link_count: inode.link_count,
      user_id: inode.user_id,
      group_id: inode.group_id,
      change_time: inode.change_time,
      modification_time: inode.modification_time,
      access_time: inode.access_time,
    })
  }

  /// Number of unallocated inode slots.
  pub fn free_inode_count(&self) -> u32 {
    INODE_COUNT as u32 - self.superblock.inode_map.popcount()
  }

  /// Number of unallocated device blocks.
  pub fn free_block_count(&self) -> u32 {
    self.store.free_count()
  }

  // ---- path resolution ------------------------------------------------

  /// Walk every intermediate segment of an absolute path and return the
  /// parent directory together with the unresolved final component.
  fn resolve_parent<'a>(&self, pathname: &'a str) -> Result<ResolvedPath<'a>, Errno> {
    let (ancestors, leaf) = split_path(pathname)?;
    if leaf.is_empty() {
      return Err(Errno::EINVAL(format!(
        "'{pathname}' does not name a directory entry"
      )));
    }

    let mut inode = self.read_inode(ROOT_INODE)?;
    for segment in ancestors {
      let (_, directory) = self.read_directory(&inode)?;
      let slot = directory
        .find(segment)
        .ok_or_else(|| Errno::ENOENT(format!("no such directory '{segment}'")))?;
      let entry = directory.entries[slot];
      if entry.ftype != FileType::Directory {
        return Err(Errno::ENOTDIR(format!("'{segment}' is not a directory")));
      }
      inode = self.read_inode(InodeId::new(entry.inode))?;
    }
    let (dir_block, directory) = self.read_directory(&inode)?;
    Ok(ResolvedPath {
      dir_block,
      directory,
      leaf,
    })
  }

  /// A directory inode's single data block, read and decoded.
  fn read_directory(&self, inode: &Inode) -> Result<(BlockId, Directory), Errno> {
    let id = block_pointer(inode.direct_blocks[0]).ok_or_else(|| {
      Errno::EBADFS(String::from("directory inode has no data block"))
    })?;
    self.checked(id)?;
    let mut block = ZERO_BLOCK;
    self.store.read(id, &mut block)?;
    Ok((id, Directory::from_block(&block)?))
  }

  // ---- inode and super-block access -----------------------------------

  fn read_inode(&self, id: InodeId) -> Result<Inode, Errno> {
    let (block_id, offset) = inode_table_block(id);
    let mut block = ZERO_BLOCK;
    self.store.read(block_id, &mut block)?;
    let mut raw = [0u8; INODE_SIZE];
    raw.copy_from_slice(&block[offset..offset + INODE_SIZE]);
    Ok(Inode::from_bytes(&raw))
  }

  fn write_inode(&mut self, id: InodeId, inode: &Inode) -> Result<(), Errno> {
    let (block_id, offset) = inode_table_block(id);
    let mut block = ZERO_BLOCK;
    self.store.read(block_id, &mut block)?;
    block[offset..offset + INODE_SIZE].copy_from_slice(&inode.to_bytes());
    self.store.write(block_id, &block)
  }

  fn write_superblock(&mut self) -> Result<(), Errno> {
    self.superblock.free_blocks = self.store.free_count() as u64;
    let block = self.superblock.to_block();
    self.store.write(SUPERBLOCK, &block)
  }

  // ---- descriptors -----------------------------------------------------

  fn descriptor(&self, fd: Fd) -> Result<Descriptor, Errno> {
    if fd >= DESCRIPTOR_COUNT || !self.descriptor_map.test(fd)? {
      return Err(Errno::EINVAL(format!("bad file descriptor {fd}")));
    }
    Ok(self.descriptors[fd])
  }

  // ---- create/remove internals ----------------------------------------

  fn install_node(
    &mut self,
    resolved: &ResolvedPath<'_>,
    slot: usize,
    inode_id: InodeId,
    ftype: FileType,
    data_block: Option<BlockId>,
  ) -> Result<(), Errno> {
    let now = unixtime();
    let mut inode = Inode::default();
    inode.link_count = 1;
    inode.change_time = now;
    inode.modification_time = now;
    inode.access_time = now;
    if let Some(block) = data_block {
      self.store.write(block, &Directory::empty().to_block())?;
      inode.file_mode = MODE_DIRECTORY;
      inode.file_size = BLOCK_SIZE as i32;
      inode.direct_blocks[0] = block.raw();
    } else {
      inode.file_mode = MODE_REGULAR;
    }

    self.write_inode(inode_id, &inode)?;
    let mut directory = resolved.directory.clone();
    directory.entries[slot] = DirEntry::new(resolved.leaf, inode_id, ftype)?;
    self.store.write(resolved.dir_block, &directory.to_block())?;
    self.superblock.inode_map.set(inode_id.index())?;
    self.write_superblock()
  }

  /// Release every block reachable from a regular file's inode: data blocks
  /// first, then the index blocks that pointed at them.
  fn release_file_blocks(&mut self, inode: &Inode) -> Result<(), Errno> {
    for raw in inode.direct_blocks {
      if let Some(id) = block_pointer(raw) {
        self.store.release(id)?;
      }
    }
    if let Some(index_id) = block_pointer(inode.indirect_block) {
      let index = self.read_index(index_id)?;
      for raw in index {
        if let Some(id) = block_pointer(raw) {
          self.store.release(id)?;
        }
      }
      self.store.release(index_id)?;
    }
    if let Some(outer_id) = block_pointer(inode.double_indirect_block) {
      let outer = self.read_index(outer_id)?;
      for raw in outer {
        if let Some(inner_id) = block_pointer(raw) {
          let inner = self.read_index(inner_id)?;
          for raw in inner {
            if let Some(id) = block_pointer(raw) {
              self.store.release(id)?;
            }
          }
          self.store.release(inner_id)?;
        }
      }
      self.store.release(outer_id)?;
    }
    Ok(())
  }

  // ---- logical-to-physical mapping ------------------------------------

  fn checked(&self, id: BlockId) -> Result<BlockId, Errno> {
    if !self.store.is_allocated(id)? {
      return Err(Errno::EBADFS(format!(
        "block {} is referenced but marked free",
        id.raw()
      )));
    }
    Ok(id)
  }

  /// Physical block backing logical index `logical`, or `None` for a hole
  /// (an unallocated slot anywhere along the pointer chain).
  fn physical_block(&self, inode: &Inode, logical: usize) -> Result<Option<BlockId>, Errno> {
    if logical < DIRECT_BOUND {
      return match block_pointer(inode.direct_blocks[logical]) {
        Some(id) => Ok(Some(self.checked(id)?)),
        None => Ok(None),
      };
    }
    if logical < INDIRECT_BOUND {
      let index_id = match block_pointer(inode.indirect_block) {
        Some(id) => self.checked(id)?,
        None => return Ok(None),
      };
      let index = self.read_index(index_id)?;
      return match block_pointer(index[logical - DIRECT_BOUND]) {
        Some(id) => Ok(Some(self.checked(id)?)),
        None => Ok(None),
      };
    }
    if logical < DOUBLE_BOUND {
      let outer_id = match block_pointer(inode.double_indirect_block) {
        Some(id) => self.checked(id)?,
        None => return Ok(None),
      };
      let outer = self.read_index(outer_id)?;
      let slot = logical - INDIRECT_BOUND;
      let inner_id = match block_pointer(outer[slot / INDEX_ENTRIES]) {
        Some(id) => self.checked(id)?,
        None => return Ok(None),
      };
      let inner = self.read_index(inner_id)?;
      return match block_pointer(inner[slot % INDEX_ENTRIES]) {
        Some(id) => Ok(Some(self.checked(id)?)),
        None => Ok(None),
      };
    }
    Ok(None)
  }

  /// Find the physical block backing `logical` for writing, allocating data
  /// and index blocks lazily. The flag is true when the data block is
  /// freshly allocated and its previous contents must not be read back.
  fn materialize_block(
    &mut self,
    inode: &mut Inode,
    logical: usize,
  ) -> Result<(BlockId, bool), Errno> {
    if logical < DIRECT_BOUND {
      if let Some(id) = block_pointer(inode.direct_blocks[logical]) {
        return Ok((id, false));
      }
      let id = self.store.allocate()?;
      inode.direct_blocks[logical] = id.raw();
      return Ok((id, true));
    }
    if logical < INDIRECT_BOUND {
      let index_id = self.ensure_index_block(&mut inode.indirect_block)?;
      let mut index = self.read_index(index_id)?;
      let slot = logical - DIRECT_BOUND;
      if let Some(id) = block_pointer(index[slot]) {
        return Ok((id, false));
      }
      let id = self.store.allocate()?;
      index[slot] = id.raw();
      if let Err(err) = self.write_index(index_id, &index) {
        let _ = self.store.release(id);
        return Err(err);
      }
      return Ok((id, true));
    }
    if logical >= DOUBLE_BOUND {
      return Err(Errno::EINVAL(format!("logical block {logical} is out of range")));
    }

    let outer_id = self.ensure_index_block(&mut inode.double_indirect_block)?;
    let mut outer = self.read_index(outer_id)?;
    let slot = logical - INDIRECT_BOUND;
    let (outer_slot, inner_slot) = (slot / INDEX_ENTRIES, slot % INDEX_ENTRIES);
    let inner_id = match block_pointer(outer[outer_slot]) {
      Some(id) => id,
      None => {
        let id = self.store.allocate()?;
        if let Err(err) = self.store.write(id, &ZERO_BLOCK) {
          let _ = self.store.release(id);
          return Err(err);
        }
        outer[outer_slot] = id.raw();
        if let Err(err) = self.write_index(outer_id, &outer) {
          let _ = self.store.release(id);
          return Err(err);
        }
        id
      }
    };
    let mut inner = self.read_index(inner_id)?;
    if let Some(id) = block_pointer(inner[inner_slot]) {
      return Ok((id, false));
    }
    let id = self.store.allocate()?;
    inner[inner_slot] = id.raw();
    if let Err(err) = self.write_index(inner_id, &inner) {
      let _ = self.store.release(id);
      return Err(err);
    }
    Ok((id, true))
  }

  /// Dereference an index-block pointer slot, allocating and zeroing a new
  /// index block when the slot is still empty.
  fn ensure_index_block(&mut self, slot: &mut u16) -> Result<BlockId, Errno> {
    if let Some(id) = block_pointer(*slot) {
      return Ok(id);
    }
    let id = self.store.allocate()?;
    if let Err(err) = self.store.write(id, &ZERO_BLOCK) {
      let _ = self.store.release(id);
      return Err(err);
    }
    *slot = id.raw();
    Ok(id)
  }

  fn read_index(&self, id: BlockId) -> Result<IndexBlock, Errno> {
    let mut block = ZERO_BLOCK;
    self.store.read(id, &mut block)?;
    let mut index = [0u16; INDEX_ENTRIES];
    for (slot, value) in index.iter_mut().enumerate() {
      *value = u16::from_le_bytes([block[slot * 2], block[slot * 2 + 1]]);
    }
    Ok(index)
  }

  fn write_index(&mut self, id: BlockId, index: &IndexBlock) -> Result<(), Errno> {
    let mut block = ZERO_BLOCK;
    for (slot, value) in index.iter().enumerate() {
      block[slot * 2..slot * 2 + 2].copy_from_slice(&value.to_le_bytes());
    }
    self.store.write(id, &block)
  }
}

/// Split an absolute path into its intermediate segments and the final
/// component. `"/"` yields no segments and an empty leaf; a trailing slash
/// also yields an empty leaf, which the callers reject.
fn split_path(pathname: &str) -> Result<(Vec<&str>, &str), Errno> {
  if pathname.is_empty() || !pathname.starts_with('/') {
    return Err(Errno::EINVAL(format!("path must be absolute: '{pathname}'")));
  }
  if pathname == "/" {
    return Ok((Vec::new(), ""));
  }

  let mut segments: Vec<&str> = pathname[1..].split('/').collect();
  let leaf = segments.pop().unwrap_or("");
  for segment in segments.iter() {
    check_segment(segment)?;
  }
  if !leaf.is_empty() {
    check_segment(leaf)?;
  }
  Ok((segments, leaf))
}

fn check_segment(segment: &str) -> Result<(), Errno> {
  if segment.is_empty() {
    return Err(Errno::EINVAL(String::from("empty path segment")));
  }
  if segment.len() > NAME_MAX {
    return Err(Errno::ENAMETOOLONG(format!(
      "segment '{segment}' is longer than {NAME_MAX} bytes"
    )));
  }
  if !SEGMENT_RE.is_match(segment).unwrap_or(false) {
    return Err(Errno::EINVAL(format!("invalid path segment '{segment}'")));
  }
  Ok(())
}


// vim:ts=2 sw=2
