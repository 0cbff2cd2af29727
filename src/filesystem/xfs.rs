//! XFS on-disk reader producing a used-block bitset.
//!
//! This is a from-scratch, dependency-free parser of the handful of XFS
//! structures needed to answer "is this block free": the primary
//! superblock, each allocation group's AGF header and AGFL free list, and
//! the by-block-number free-space B+tree (BNOBT). It intentionally does not
//! link against `libxfs`, whose process-wide init lock would otherwise
//! become a hidden global serialization point; the on-disk layout is
//! stable enough across the XFS versions this backup tool targets that a
//! pure-Rust reader is the more portable choice.

use std::convert::TryInto;
use std::io::{Read, Seek, SeekFrom};

use crate::bitset::BitSet;
use crate::filesystem::{BlockMapReader, Device, FilesystemError, FilesystemType};

const XFS_SB_MAGIC: u32 = 0x5846_5342; // "XFSB"
const XFS_AGF_MAGIC: u32 = 0x5841_4746; // "XAGF"
const XFS_ABTB_MAGIC: u32 = 0x4142_5442; // "ABTB" (v4 free-space-by-block btree)
const XFS_ABTB_CRC_MAGIC: u32 = 0x4142_3342; // "AB3B" (v5, crc-enabled)

/// Parsed fields of the XFS primary superblock relevant to block accounting.
#[derive(Debug, Clone, Copy)]
struct SuperBlock {
    block_size: u32,
    total_blocks: u64,
    ag_blocks: u32,
    ag_count: u32,
    in_progress: bool,
    log_start: u64,
    realtime_extents: u64,
    has_crc: bool,
}

fn be32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes(buf[off..off + 4].try_into().unwrap())
}

fn be64(buf: &[u8], off: usize) -> u64 {
    u64::from_be_bytes(buf[off..off + 8].try_into().unwrap())
}

fn be16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes(buf[off..off + 2].try_into().unwrap())
}

fn read_at(device: &mut dyn Device, offset: u64, len: usize) -> Result<Vec<u8>, FilesystemError> {
    device.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; len];
    device.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_superblock(device: &mut dyn Device) -> Result<SuperBlock, FilesystemError> {
    // The primary superblock occupies the first sector; 512 bytes is ample
    // for every field this reader touches regardless of actual sector size.
    let buf = read_at(device, 0, 512)?;

    if be32(&buf, 0) != XFS_SB_MAGIC {
        return Err(FilesystemError::BadMagic);
    }

    let block_size = be32(&buf, 4);
    let total_blocks = be64(&buf, 8);
    let realtime_extents = be64(&buf, 24);
    let log_start = be64(&buf, 48);
    let ag_blocks = be32(&buf, 84);
    let ag_count = be32(&buf, 88);
    let version_num = be16(&buf, 100);
    // sb_inprogress lives at a fixed byte offset in the "quota flags and
    // misc state" block of the superblock.
    let in_progress = buf[124] != 0;
    let has_crc = (version_num & 0x0008) != 0; // XFS_SB_VERSION_5 style bit

    Ok(SuperBlock {
        block_size,
        total_blocks,
        ag_blocks,
        ag_count,
        in_progress,
        log_start,
        realtime_extents,
        has_crc,
    })
}

struct Agf {
    seq_no: u32,
    bno_root: u32,
    bno_level: u32,
    fl_first: u32,
    fl_last: u32,
    fl_count: u32,
}

fn read_agf(
    device: &mut dyn Device,
    sb: &SuperBlock,
    ag_index: u32,
) -> Result<Agf, FilesystemError> {
    // AGF occupies the second sector-aligned block of each allocation group.
    let ag_offset = (ag_index as u64) * (sb.ag_blocks as u64) * (sb.block_size as u64);
    let buf = read_at(device, ag_offset + sb.block_size as u64, 128)?;

    if be32(&buf, 0) != XFS_AGF_MAGIC {
        return Err(FilesystemError::Structure("AGF magic mismatch"));
    }

    Ok(Agf {
        seq_no: be32(&buf, 8),
        bno_root: be32(&buf, 20),
        bno_level: be32(&buf, 28),
        fl_first: be32(&buf, 76),
        fl_last: be32(&buf, 80),
        fl_count: be32(&buf, 84),
    })
}

/// Walk the AG free-list (AGFL) block, clearing each listed block.
fn scan_free_list(
    device: &mut dyn Device,
    sb: &SuperBlock,
    agf: &Agf,
    ag_index: u32,
    used: &mut BitSet,
) -> Result<(), FilesystemError> {
    if agf.fl_count == 0 {
        return Ok(());
    }

    let ag_offset = (ag_index as u64) * (sb.ag_blocks as u64) * (sb.block_size as u64);
    // AGFL lives in the fourth sector-aligned block of the AG.
    let agfl_offset = ag_offset + 3 * sb.block_size as u64;
    let header_len: usize = if sb.has_crc { 36 } else { 4 };
    let buf = read_at(device, agfl_offset, sb.block_size as usize)?;

    let capacity = (buf.len() - header_len) / 4;
    let first = (agf.fl_first as usize) % capacity.max(1);
    let mut idx = first;
    for _ in 0..agf.fl_count {
        let off = header_len + idx * 4;
        if off + 4 > buf.len() {
            break;
        }
        let agbno = be32(&buf, off);
        mark_unused(sb, ag_index, agbno, 1, used);
        idx = (idx + 1) % capacity.max(1);
    }
    let _ = agf.fl_last;
    Ok(())
}

fn mark_unused(sb: &SuperBlock, ag_index: u32, agbno: u32, length: u32, used: &mut BitSet) {
    let start = (ag_index as u64) * (sb.ag_blocks as u64) + agbno as u64;
    if start as usize + length as usize <= used.len() {
        used.clear(start as usize, length as usize);
    }
}

struct AllocRecord {
    start_block: u32,
    block_count: u32,
}

/// Read one B+tree node/leaf block and either clear its free runs (leaf) or
/// recurse into its children (inner node). Aborts (returns Err) on a magic
/// mismatch step 3c.
fn scan_btree(
    device: &mut dyn Device,
    sb: &SuperBlock,
    agf: &Agf,
    ag_index: u32,
    root: u32,
    used: &mut BitSet,
) -> Result<(), FilesystemError> {
    let ag_offset = (ag_index as u64) * (sb.ag_blocks as u64) * (sb.block_size as u64);
    let block_offset = ag_offset + (root as u64) * (sb.block_size as u64);
    let buf = read_at(device, block_offset, sb.block_size as usize)?;

    let magic = be32(&buf, 0);
    if magic != XFS_ABTB_MAGIC && magic != XFS_ABTB_CRC_MAGIC {
        return Err(FilesystemError::Structure("BNOBT magic mismatch"));
    }

    let level = be16(&buf, 4);
    let num_recs = be16(&buf, 6) as usize;
    // v5 (crc) short-format btree blocks carry a larger header (crc, bno,
    // lsn, uuid, owner) before the record/key/ptr area begins.
    let header_len: usize = if sb.has_crc { 56 } else { 16 };

    if level == 0 {
        for i in 0..num_recs {
            let off = header_len + i * 8;
            if off + 8 > buf.len() {
                break;
            }
            let rec = AllocRecord {
                start_block: be32(&buf, off),
                block_count: be32(&buf, off + 4),
            };
            mark_unused(sb, ag_index, rec.start_block, rec.block_count, used);
        }
    } else {
        // Inner node: keys then an equal-length array of block pointers.
        let key_size = 8;
        let ptr_off = header_len + num_recs * key_size;
        for i in 0..num_recs {
            let off = ptr_off + i * 4;
            if off + 4 > buf.len() {
                break;
            }
            let child = be32(&buf, off);
            scan_btree(device, sb, agf, ag_index, child, used)?;
        }
    }

    Ok(())
}

/// XFS filesystem handle over an open device.
pub struct XfsHandle {
    sb: SuperBlock,
    used_blocks: BitSet,
}

impl XfsHandle {
    /// Open `device`, read its superblock, and walk every allocation group
    /// to build the used-block bitset. Conservative on any error: whatever
    /// has already been cleared stays cleared, and the rest of the bitset
    /// (initialized fully set) is returned as-is along with the error.
    pub fn open(device: &mut dyn Device) -> Result<Self, FilesystemError> {
        let sb = read_superblock(device)?;

        if sb.in_progress {
            return Err(FilesystemError::InProgress);
        }
        if sb.log_start == 0 {
            return Err(FilesystemError::Structure("logstart is zero"));
        }
        if sb.realtime_extents != 0 {
            return Err(FilesystemError::Structure("realtime extents present"));
        }

        let mut used_blocks = BitSet::new(sb.total_blocks as usize)?;
        used_blocks.set_all();

        for ag_index in 0..sb.ag_count {
            let agf = match read_agf(device, &sb, ag_index) {
                Ok(agf) => agf,
                Err(_) => continue, // conservative: leave this AG fully marked used
            };

            let _ = scan_free_list(device, &sb, &agf, ag_index, &mut used_blocks);

            if agf.bno_level > 0 {
                let _ = scan_btree(device, &sb, &agf, ag_index, agf.bno_root, &mut used_blocks);
            }
        }

        Ok(XfsHandle { sb, used_blocks })
    }
}

impl BlockMapReader for XfsHandle {
    fn probe(device: &mut dyn Device) -> Result<FilesystemType, FilesystemError> {
        let buf = read_at(device, 0, 4)?;
        if be32(&buf, 0) == XFS_SB_MAGIC {
            Ok(FilesystemType::Xfs)
        } else {
            Ok(FilesystemType::Unknown)
        }
    }

    fn block_size(&self) -> u64 {
        self.sb.block_size as u64
    }

    fn total_blocks(&self) -> u64 {
        self.sb.total_blocks
    }

    fn used_blocks(&self) -> &BitSet {
        &self.used_blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn make_minimal_image(ag_count: u32, ag_blocks: u32, block_size: u32) -> Vec<u8> {
        let total_blocks = ag_count as u64 * ag_blocks as u64;
        let mut img = vec![0u8; (total_blocks * block_size as u64) as usize];

        img[0..4].copy_from_slice(&XFS_SB_MAGIC.to_be_bytes());
        img[4..8].copy_from_slice(&block_size.to_be_bytes());
        img[8..16].copy_from_slice(&total_blocks.to_be_bytes());
        img[24..32].copy_from_slice(&0u64.to_be_bytes()); // rextents = 0
        img[48..56].copy_from_slice(&1u64.to_be_bytes()); // logstart != 0
        img[84..88].copy_from_slice(&ag_blocks.to_be_bytes());
        img[88..92].copy_from_slice(&ag_count.to_be_bytes());
        img[100..102].copy_from_slice(&4u16.to_be_bytes()); // versionnum, no crc bit
        img[124] = 0; // not in progress

        for ag in 0..ag_count {
            let ag_off = (ag as u64) * (ag_blocks as u64) * (block_size as u64);
            let agf_off = (ag_off + block_size as u64) as usize;
            img[agf_off..agf_off + 4].copy_from_slice(&XFS_AGF_MAGIC.to_be_bytes());
            img[agf_off + 8..agf_off + 12].copy_from_slice(&ag.to_be_bytes());
            // bno_root/level left 0 -> level 0 means "no btree to walk" (we
            // guard on bno_level > 0), fl_count left 0 -> no free list.
        }

        img
    }

    #[test]
    fn probe_recognizes_xfs_magic() {
        let img = make_minimal_image(1, 16, 512);
        let mut cursor = Cursor::new(img);
        let kind = XfsHandle::probe(&mut cursor).unwrap();
        assert_eq!(kind, FilesystemType::Xfs);
    }

    #[test]
    fn probe_rejects_foreign_image() {
        let img = vec![0u8; 512];
        let mut cursor = Cursor::new(img);
        let kind = XfsHandle::probe(&mut cursor).unwrap();
        assert_eq!(kind, FilesystemType::Unknown);
    }

    #[test]
    fn conservative_when_no_free_space_known() {
        let img = make_minimal_image(2, 8, 512);
        let mut cursor = Cursor::new(img);
        let handle = XfsHandle::open(&mut cursor).unwrap();
        // With no free-list/btree info, every block stays marked used.
        for b in 0..handle.total_blocks() {
            assert!(handle.used_blocks().is_set(b as usize));
        }
    }

    #[test]
    fn rejects_in_progress_filesystem() {
        let mut img = make_minimal_image(1, 16, 512);
        img[124] = 1;
        let mut cursor = Cursor::new(img);
        let err = XfsHandle::open(&mut cursor).unwrap_err();
        assert!(matches!(err, FilesystemError::InProgress));
    }
}
