//! A small Unix-style filesystem stored in a fixed-size block-device image.
//!
//! The image is a single 32 MiB backing file split into 65,536 blocks of
//! 512 bytes. Block 0 holds the super-block, blocks 1..=32 the inode table,
//! and the last 16 blocks the free-block map; everything in between is the
//! data pool. [`fs::TinyFs`] is the mount handle exposing the POSIX-flavored
//! surface: format, mount, create, open, read, write, seek, remove and
//! directory listing.

pub mod bitmap;
pub mod block_store;
pub mod errno;
pub mod fs;
pub mod layout;
pub mod util;

pub use errno::Errno;
pub use fs::{DirRecord, Fd, FileStat, SeekWhence, TinyFs};
pub use layout::FileType;

/// Size of a single device block in bytes.
pub const BLOCK_SIZE: usize = 512;
/// Total number of blocks in a device image.
pub const BLOCK_COUNT: usize = 65_536;
/// Exact byte size of a backing image file.
pub const IMAGE_SIZE: u64 = (BLOCK_COUNT * BLOCK_SIZE) as u64;

// vim:ts=2 sw=2
