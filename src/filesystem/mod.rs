//! Raw-filesystem block map readers.
//!
//! Given a readable device, a [`BlockMapReader`] determines the filesystem
//! type and produces a [`crate::bitset::BitSet`] over the device's block
//! count where bit *i* = 1 iff filesystem block *i* is in use. The bitset is
//! conservative: any block whose state cannot be proven free is left set.
//!
//! XFS is the reference implementation ([`xfs`]); EXT/FAT/ReiserFS readers
//! would implement the same trait with the same superblock-probe →
//! allocation-structure-walk shape but are out of scope here.

pub mod xfs;

use std::io;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilesystemType {
    Xfs,
    Unknown,
}

#[derive(Debug, Error)]
pub enum FilesystemError {
    #[error("i/o error reading device: {0}")]
    Io(#[from] io::Error),
    #[error("superblock magic mismatch")]
    BadMagic,
    #[error("filesystem structure inconsistent: {0}")]
    Structure(&'static str),
    #[error("filesystem marked in-progress (mkfs did not complete)")]
    InProgress,
    #[error("insufficient memory")]
    InsufficientMemory(#[from] crate::bitset::BitSetError),
}

/// A block device or image file readable by a block-map reader.
///
/// Implemented for anything that is `Read + Seek`; readers never write.
pub trait Device: io::Read + io::Seek {}
impl<T: io::Read + io::Seek> Device for T {}

/// Common contract for all filesystem block-map readers.
pub trait BlockMapReader {
    /// Classify `device`'s filesystem by reading its first sectors.
    fn probe(device: &mut dyn Device) -> Result<FilesystemType, FilesystemError>
    where
        Self: Sized;

    /// Block size in bytes, once opened.
    fn block_size(&self) -> u64;

    /// Total number of filesystem blocks.
    fn total_blocks(&self) -> u64;

    /// Whether the filesystem block containing `byte_offset` is in use.
    fn block_is_used(&self, byte_offset: u64) -> bool {
        let block = byte_offset / self.block_size();
        self.used_blocks().is_set(block as usize)
    }

    /// The full used-block bitset (conservative: unproven-free blocks stay set).
    fn used_blocks(&self) -> &crate::bitset::BitSet;
}
