//! On-disk layout of the filesystem's metadata structures.
//!
//! Everything the filesystem persists is defined here: the superblock,
//! inodes, directory entries and the journal metablock format, together
//! with the geometry constants tying them to 4 KiB blocks.
//!
//! All integers on disk are little-endian, and the host byte order is
//! never assumed: every structure crosses the disk boundary through
//! [`OnDisk::decode`] / [`OnDisk::encode`], which convert field by field.
//! No structure in this module is ever reinterpreted as a raw byte blob.

use bytemuck::{Pod, Zeroable};

use crate::crc::crc32c;
use crate::errors::{FsError, FsResult};

/// A disk block number.
pub type BlockNum = u32;

/// An inode number.
pub type InodeNum = u32;

/// Unit of I/O and the granularity of the filesystem.
pub const BLOCK_SIZE: usize = 4096;

/// Number of free-block-bitmap bits held by one block.
pub const BITS_PER_BLOCK: usize = BLOCK_SIZE * 8;

/// Byte offset of the superblock within block 0.
pub const SUPERBLOCK_OFFSET: usize = 512;

/// Superblock magic.
pub const MAGIC: u64 = 0xFBBF_BB00_3EE9_BEEF;

/// Journal metablock magic.
pub const JOURNAL_MAGIC: u64 = 0xFBBF_BB00_9EEB_CEED;

/// Checksum sentinel: a metablock or block reference carrying this value
/// has checksumming disabled.
pub const NO_CHECKSUM: u32 = 0x8260_0A5F;

/// Number of direct block pointers per inode.
pub const NDIRECT: usize = 9;

/// Number of block pointers per indirect or indirect2 block.
pub const NINDIRECT: usize = BLOCK_SIZE / 4;

/// Size of an inode on disk.
pub const INODE_SIZE: usize = 64;

/// Number of inodes held by one block of the inode table.
pub const INODES_PER_BLOCK: usize = BLOCK_SIZE / INODE_SIZE;

/// Maximum file size possible using only direct blocks.
pub const MAX_DIRECT_SIZE: usize = NDIRECT * BLOCK_SIZE;

/// ... plus the indirect block.
pub const MAX_INDIRECT_SIZE: usize = MAX_DIRECT_SIZE + NINDIRECT * BLOCK_SIZE;

/// ... plus the indirect2 block; the largest representable file.
pub const MAX_INDIRECT2_SIZE: usize =
    MAX_INDIRECT_SIZE + NINDIRECT * NINDIRECT * BLOCK_SIZE;

/// Largest representable file, in bytes.
pub const MAX_SIZE: usize = MAX_INDIRECT2_SIZE;

/// Size of a directory entry on disk.
pub const DIRENT_SIZE: usize = 128;

/// Longest directory entry name (the NUL terminator is not counted).
pub const MAX_NAME_LEN: usize = 123;

/// Block number sentinel marking an empty buffer-cache slot.
pub const EMPTY_BLOCK: BlockNum = BlockNum::MAX;

/// Number of `{bn, checksum, flags}` reference triples a metablock holds:
/// a 28-byte header followed by 12-byte triples in a 4 KiB block.
pub const REF_SIZE: usize = (NINDIRECT - 7) / 3;

/// The root directory lives at inode 1; inode 0 is reserved.
pub const ROOT_INODE: InodeNum = 1;

// Explicit little-endian accessors. These are the only raw-bytes reads
// and writes in the crate; everything above them traffics in host-order
// struct fields.

#[inline]
fn get_u16_le(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

#[inline]
fn get_u32_le(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

#[inline]
fn get_u64_le(buf: &[u8], off: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(bytes)
}

#[inline]
fn put_u16_le(buf: &mut [u8], off: usize, x: u16) {
    buf[off..off + 2].copy_from_slice(&x.to_le_bytes());
}

#[inline]
fn put_u32_le(buf: &mut [u8], off: usize, x: u32) {
    buf[off..off + 4].copy_from_slice(&x.to_le_bytes());
}

#[inline]
fn put_u64_le(buf: &mut [u8], off: usize, x: u64) {
    buf[off..off + 8].copy_from_slice(&x.to_le_bytes());
}

/// Reads the block pointer at index `i` of an indirect (or indirect2)
/// block image.
#[inline]
pub fn indirect_slot(block: &[u8], i: usize) -> BlockNum {
    get_u32_le(block, i * 4)
}

/// Writes the block pointer at index `i` of an indirect (or indirect2)
/// block image.
#[inline]
pub fn set_indirect_slot(block: &mut [u8], i: usize, bn: BlockNum) {
    put_u32_le(block, i * 4, bn);
}

/// The byte-order boundary for persistent structures.
///
/// `decode` reads a structure out of its on-disk little-endian image;
/// `encode` writes it back. Both operate on a `SIZE`-byte region.
pub trait OnDisk: Sized {
    /// Encoded size in bytes.
    const SIZE: usize;

    /// Decodes the structure from `buf[..Self::SIZE]`.
    fn decode(buf: &[u8]) -> Self;

    /// Encodes the structure into `buf[..Self::SIZE]`.
    fn encode(&self, buf: &mut [u8]);
}

/// Return the direct block index for file block index `bi`.
///
/// This is either an index into `Inode::direct`, or an index into an
/// indirect block.
#[inline]
pub fn bi_direct_index(bi: usize) -> usize {
    debug_assert!(bi < MAX_SIZE / BLOCK_SIZE);
    if bi < NDIRECT {
        bi
    } else {
        (bi - NDIRECT) % NINDIRECT
    }
}

/// Return the indirect block index for file block index `bi`.
///
/// This is an index into the indirect2 block.
#[inline]
pub fn bi_indirect_index(bi: usize) -> usize {
    debug_assert!(bi >= NDIRECT + NINDIRECT && bi < MAX_SIZE / BLOCK_SIZE);
    (bi - NDIRECT - NINDIRECT) / NINDIRECT
}

/// A journal sequence number or transaction id.
///
/// Tids are unsigned 16-bit values compared by signed wrap-difference, so
/// ordering stays well-defined across wrap; the journal length guarantees
/// that any two coexisting tids differ by less than 2¹⁵.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct Tid(pub u16);

impl Tid {
    /// Wrap-aware `self < other`.
    #[inline]
    pub fn lt(self, other: Tid) -> bool {
        (self.0.wrapping_sub(other.0) as i16) < 0
    }

    /// Wrap-aware `self <= other`.
    #[inline]
    pub fn le(self, other: Tid) -> bool {
        (self.0.wrapping_sub(other.0) as i16) <= 0
    }

    /// Wrap-aware `self >= other`.
    #[inline]
    pub fn ge(self, other: Tid) -> bool {
        (self.0.wrapping_sub(other.0) as i16) >= 0
    }

    /// Wrap-aware `self > other`.
    #[inline]
    pub fn gt(self, other: Tid) -> bool {
        (self.0.wrapping_sub(other.0) as i16) > 0
    }

    /// The next tid, wrapping.
    #[inline]
    pub fn next(self) -> Tid {
        Tid(self.0.wrapping_add(1))
    }
}

impl core::fmt::Display for Tid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Inode type field values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    /// Regular file.
    Regular,
    /// Directory. Only the root directory (inode 1) exists in practice.
    Directory,
}

impl FileType {
    /// Raw `type` field value for a free inode.
    pub const RAW_NONE: u32 = 0;
    /// Raw `type` field value for a regular file.
    pub const RAW_REGULAR: u32 = 1;
    /// Raw `type` field value for a directory.
    pub const RAW_DIRECTORY: u32 = 2;

    /// Interprets a raw `type` field. `None` covers both free inodes and
    /// unknown values; callers that care about the distinction inspect the
    /// raw field.
    pub fn from_raw(raw: u32) -> Option<FileType> {
        match raw {
            Self::RAW_REGULAR => Some(FileType::Regular),
            Self::RAW_DIRECTORY => Some(FileType::Directory),
            _ => None,
        }
    }

    /// Raw field value for this type.
    pub fn to_raw(self) -> u32 {
        match self {
            FileType::Regular => Self::RAW_REGULAR,
            FileType::Directory => Self::RAW_DIRECTORY,
        }
    }
}

/// The superblock, stored at byte [`SUPERBLOCK_OFFSET`] of block 0.
///
/// Regions are contiguous and non-overlapping in the order swap,
/// free-block bitmap, inode table, data area, journal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Superblock {
    /// Must equal [`MAGIC`].
    pub magic: u64,
    /// Number of blocks in the filesystem.
    pub nblocks: BlockNum,
    /// Number of blocks in swap space (opaque to the filesystem).
    pub nswap: BlockNum,
    /// Number of inodes in the filesystem.
    pub ninodes: InodeNum,
    /// Number of blocks in the journal.
    pub njournal: BlockNum,
    /// First swap space block; always 1.
    pub swap_bn: BlockNum,
    /// First free-block-bitmap block.
    pub fbb_bn: BlockNum,
    /// First inode table block.
    pub inode_bn: BlockNum,
    /// First data-area block.
    pub data_bn: BlockNum,
    /// First journal block.
    pub journal_bn: BlockNum,
}

impl OnDisk for Superblock {
    const SIZE: usize = 48;

    fn decode(buf: &[u8]) -> Self {
        Superblock {
            magic: get_u64_le(buf, 0),
            nblocks: get_u32_le(buf, 8),
            nswap: get_u32_le(buf, 12),
            ninodes: get_u32_le(buf, 16),
            njournal: get_u32_le(buf, 20),
            swap_bn: get_u32_le(buf, 24),
            fbb_bn: get_u32_le(buf, 28),
            inode_bn: get_u32_le(buf, 32),
            data_bn: get_u32_le(buf, 36),
            journal_bn: get_u32_le(buf, 40),
        }
    }

    fn encode(&self, buf: &mut [u8]) {
        put_u64_le(buf, 0, self.magic);
        put_u32_le(buf, 8, self.nblocks);
        put_u32_le(buf, 12, self.nswap);
        put_u32_le(buf, 16, self.ninodes);
        put_u32_le(buf, 20, self.njournal);
        put_u32_le(buf, 24, self.swap_bn);
        put_u32_le(buf, 28, self.fbb_bn);
        put_u32_le(buf, 32, self.inode_bn);
        put_u32_le(buf, 36, self.data_bn);
        put_u32_le(buf, 40, self.journal_bn);
    }
}

impl Superblock {
    /// Checks the magic field.
    pub fn is_valid_magic(&self) -> bool {
        self.magic == MAGIC
    }

    /// Number of blocks the free-block bitmap occupies.
    pub fn fbb_block_count(&self) -> usize {
        (self.nblocks as usize + BITS_PER_BLOCK - 1) / BITS_PER_BLOCK
    }

    /// Number of blocks the inode table occupies.
    pub fn inode_block_count(&self) -> usize {
        (self.ninodes as usize * INODE_SIZE + BLOCK_SIZE - 1) / BLOCK_SIZE
    }

    /// Block holding inode number `inum`.
    pub fn inode_block(&self, inum: InodeNum) -> BlockNum {
        self.inode_bn + inum / INODES_PER_BLOCK as u32
    }

    /// Byte offset of inode `inum` within its block.
    pub fn inode_offset(inum: InodeNum) -> usize {
        (inum as usize % INODES_PER_BLOCK) * INODE_SIZE
    }

    /// Checks the geometry invariants: magic, region contiguity and
    /// ordering, and journal fit. The offline checker reports each
    /// violation individually; this is the mount-time yes/no form.
    pub fn validate(&self) -> bool {
        self.is_valid_magic()
            && self.nblocks > 2
            && self.nblocks < 0x1000_0000
            && self.swap_bn == 1
            && self.swap_bn.checked_add(self.nswap) == Some(self.fbb_bn)
            && self.fbb_bn as usize + self.fbb_block_count() == self.inode_bn as usize
            && self.ninodes >= 10
            && self.inode_bn as usize + self.inode_block_count() <= self.data_bn as usize
            && self.data_bn < self.nblocks
            && self.data_bn <= self.journal_bn
            && self.journal_bn <= self.nblocks
            && self.njournal <= self.nblocks - self.journal_bn
    }
}

/// The persistent view of an inode: 64 bytes on disk.
///
/// Bytes 12..20 of the on-disk record hold two words that are meaningful
/// only in memory (the content lock and an in-memory reference count).
/// `decode` ignores them and `encode` writes them as zero, so persisting
/// an inode never leaks transient state; the live equivalents are kept in
/// the in-cache inode handle instead.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Inode {
    /// Raw file type field; see [`FileType`].
    pub itype: u32,
    /// File size in bytes.
    pub size: u32,
    /// Number of hard links.
    pub nlink: u32,
    /// Direct block pointers; 0 marks a hole.
    pub direct: [BlockNum; NDIRECT],
    /// Indirect block pointer, or 0.
    pub indirect: BlockNum,
    /// Doubly-indirect block pointer, or 0.
    pub indirect2: BlockNum,
}

impl OnDisk for Inode {
    const SIZE: usize = INODE_SIZE;

    fn decode(buf: &[u8]) -> Self {
        let mut direct = [0; NDIRECT];
        for (i, slot) in direct.iter_mut().enumerate() {
            *slot = get_u32_le(buf, 20 + i * 4);
        }
        Inode {
            itype: get_u32_le(buf, 0),
            size: get_u32_le(buf, 4),
            nlink: get_u32_le(buf, 8),
            direct,
            indirect: get_u32_le(buf, 56),
            indirect2: get_u32_le(buf, 60),
        }
    }

    fn encode(&self, buf: &mut [u8]) {
        put_u32_le(buf, 0, self.itype);
        put_u32_le(buf, 4, self.size);
        put_u32_le(buf, 8, self.nlink);
        // in-memory words
        put_u32_le(buf, 12, 0);
        put_u32_le(buf, 16, 0);
        for (i, &bn) in self.direct.iter().enumerate() {
            put_u32_le(buf, 20 + i * 4, bn);
        }
        put_u32_le(buf, 56, self.indirect);
        put_u32_le(buf, 60, self.indirect2);
    }
}

impl Inode {
    /// Interpreted file type; `None` for a free or unrecognized inode.
    pub fn file_type(&self) -> Option<FileType> {
        FileType::from_raw(self.itype)
    }

    /// Whether the inode is live (`type != 0`).
    pub fn is_live(&self) -> bool {
        self.itype != FileType::RAW_NONE
    }
}

/// A directory entry: inode number plus NUL-terminated name.
#[derive(Clone, Copy)]
pub struct DirEntry {
    /// Referenced inode; 0 marks a tombstone.
    pub inum: InodeNum,
    /// Name bytes, NUL-terminated within the field.
    pub name: [u8; MAX_NAME_LEN + 1],
}

impl Default for DirEntry {
    fn default() -> Self {
        DirEntry {
            inum: 0,
            name: [0; MAX_NAME_LEN + 1],
        }
    }
}

impl core::fmt::Debug for DirEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DirEntry")
            .field("inum", &self.inum)
            .field("name", &String::from_utf8_lossy(self.name_bytes()))
            .finish()
    }
}

impl OnDisk for DirEntry {
    const SIZE: usize = DIRENT_SIZE;

    fn decode(buf: &[u8]) -> Self {
        let mut name = [0u8; MAX_NAME_LEN + 1];
        name.copy_from_slice(&buf[4..DIRENT_SIZE]);
        DirEntry {
            inum: get_u32_le(buf, 0),
            name,
        }
    }

    fn encode(&self, buf: &mut [u8]) {
        put_u32_le(buf, 0, self.inum);
        buf[4..DIRENT_SIZE].copy_from_slice(&self.name);
    }
}

impl DirEntry {
    /// Builds an entry for `name`, rejecting reserved and overlong names.
    pub fn new(inum: InodeNum, name: &str) -> FsResult<DirEntry> {
        if !is_valid_name(name.as_bytes()) {
            return Err(FsError::BadName);
        }
        let mut entry = DirEntry {
            inum,
            ..DirEntry::default()
        };
        entry.name[..name.len()].copy_from_slice(name.as_bytes());
        Ok(entry)
    }

    /// The name up to (not including) its NUL terminator. An unterminated
    /// name field yields all [`MAX_NAME_LEN`]` + 1` bytes.
    pub fn name_bytes(&self) -> &[u8] {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.name.len());
        &self.name[..len]
    }
}

/// Whether `name` is acceptable as a directory entry name: non-empty, at
/// most [`MAX_NAME_LEN`] bytes, not `.` or `..`, and free of `/` and NUL.
pub fn is_valid_name(name: &[u8]) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name != b"."
        && name != b".."
        && !name.iter().any(|&b| b == b'/' || b == 0)
}

bitflags! {
    /// Journal metablock flags.
    pub struct MetaFlags: u16 {
        /// This block is a metablock (mandatory).
        const META = 0x01;
        /// The metablock was found erroneous; it is retained but skipped.
        const ERROR = 0x02;
        /// The writer marked the metablock corrupt.
        const CORRUPT = 0x04;
        /// Metablock starts transaction `tid`.
        const START = 0x10;
        /// Metablock commits `tid`.
        const COMMIT = 0x20;
        /// Metablock marks `tid` complete.
        const COMPLETE = 0x40;
    }
}

bitflags! {
    /// Per-reference flags within a journal metablock.
    pub struct RefFlags: u16 {
        /// The referenced data's first 8 bytes equalled the journal magic
        /// and were rewritten in the journal copy.
        const ESCAPED = 0x100;
        /// Reference present only to mark subsequent overwrites; no data
        /// block follows it in the journal.
        const NONJOURNALED = 0x200;
        /// A later transaction supersedes this write.
        const OVERWRITTEN = 0x400;
    }
}

/// One `{bn, checksum, flags}` triple of a metablock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockRef {
    /// Destination block number in the main filesystem area.
    pub bn: BlockNum,
    /// CRC32C of the journaled data block, or [`NO_CHECKSUM`].
    pub bchecksum: u32,
    /// See [`RefFlags`].
    pub bflags: RefFlags,
}

// Metablock field offsets within a journal block.
const JMB_CHECKSUM: usize = 8;
const JMB_SEQ: usize = 16;
const JMB_TID: usize = 18;
const JMB_COMMIT: usize = 20;
const JMB_COMPLETE: usize = 22;
const JMB_FLAGS: usize = 24;
const JMB_NREF: usize = 26;
const JMB_REFS: usize = 28;
const JMB_REF_STRIDE: usize = 12;

/// A decoded journal metablock.
///
/// `nref` preserves the raw on-disk count; `refs` materializes at most
/// [`REF_SIZE`] triples, so an implausible count can be reported without
/// running off the block.
#[derive(Clone, Debug)]
pub struct MetaBlock {
    /// Sequence number; unique and orders the journal.
    pub seq: Tid,
    /// Transaction this metablock belongs to.
    pub tid: Tid,
    /// First non-committed tid.
    pub commit_boundary: Tid,
    /// First non-completed tid.
    pub complete_boundary: Tid,
    /// See [`MetaFlags`].
    pub flags: MetaFlags,
    /// Raw reference count as stored on disk.
    pub nref: u16,
    /// Decoded references (`min(nref, REF_SIZE)` of them).
    pub refs: Vec<BlockRef>,
}

/// Tests whether a journal block could be a metablock: magic matches and
/// the CRC32C of bytes 16..4096 matches (or is the [`NO_CHECKSUM`]
/// sentinel, which disables checksumming for the block).
pub fn is_potential_metablock(buf: &[u8]) -> bool {
    debug_assert_eq!(buf.len(), BLOCK_SIZE);
    if get_u64_le(buf, 0) != JOURNAL_MAGIC {
        return false;
    }
    let checksum = get_u32_le(buf, JMB_CHECKSUM);
    checksum == NO_CHECKSUM || checksum == crc32c(&buf[16..BLOCK_SIZE])
}

impl MetaBlock {
    /// Decodes a journal block previously accepted by
    /// [`is_potential_metablock`].
    pub fn decode(buf: &[u8]) -> MetaBlock {
        debug_assert_eq!(buf.len(), BLOCK_SIZE);
        let nref = get_u16_le(buf, JMB_NREF);
        let nrefs = usize::from(nref).min(REF_SIZE);
        let mut refs = Vec::with_capacity(nrefs);
        for i in 0..nrefs {
            let off = JMB_REFS + i * JMB_REF_STRIDE;
            refs.push(BlockRef {
                bn: get_u32_le(buf, off),
                bchecksum: get_u32_le(buf, off + 4),
                bflags: RefFlags::from_bits_truncate(get_u16_le(buf, off + 8)),
            });
        }
        MetaBlock {
            seq: Tid(get_u16_le(buf, JMB_SEQ)),
            tid: Tid(get_u16_le(buf, JMB_TID)),
            commit_boundary: Tid(get_u16_le(buf, JMB_COMMIT)),
            complete_boundary: Tid(get_u16_le(buf, JMB_COMPLETE)),
            flags: MetaFlags::from_bits_truncate(get_u16_le(buf, JMB_FLAGS)),
            nref,
            refs,
        }
    }

    /// Encodes the metablock into a journal block image, including the
    /// magic and a freshly computed checksum.
    pub fn encode(&self, buf: &mut [u8]) {
        debug_assert_eq!(buf.len(), BLOCK_SIZE);
        buf.fill(0);
        put_u64_le(buf, 0, JOURNAL_MAGIC);
        put_u16_le(buf, JMB_SEQ, self.seq.0);
        put_u16_le(buf, JMB_TID, self.tid.0);
        put_u16_le(buf, JMB_COMMIT, self.commit_boundary.0);
        put_u16_le(buf, JMB_COMPLETE, self.complete_boundary.0);
        put_u16_le(buf, JMB_FLAGS, self.flags.bits());
        put_u16_le(buf, JMB_NREF, self.nref);
        for (i, r) in self.refs.iter().take(REF_SIZE).enumerate() {
            let off = JMB_REFS + i * JMB_REF_STRIDE;
            put_u32_le(buf, off, r.bn);
            put_u32_le(buf, off + 4, r.bchecksum);
            put_u16_le(buf, off + 8, r.bflags.bits());
        }
        let checksum = crc32c(&buf[16..BLOCK_SIZE]);
        put_u32_le(buf, JMB_CHECKSUM, checksum);
    }

    /// Rewrites the first 8 bytes of a journaled data block with the
    /// journal magic, undoing the escape encoding.
    pub fn unescape(data: &mut [u8]) {
        put_u64_le(data, 0, JOURNAL_MAGIC);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_constants() {
        assert_eq!(NINDIRECT, 1024);
        assert_eq!(INODES_PER_BLOCK, 64);
        assert_eq!(REF_SIZE, 339);
        assert_eq!(JMB_REFS + REF_SIZE * JMB_REF_STRIDE, BLOCK_SIZE);
        assert_eq!(MAX_SIZE, (9 + 1024 + 1024 * 1024) * 4096);
    }

    #[test]
    fn tid_wrap_comparison() {
        assert!(Tid(0xFFFF).lt(Tid(0x0001)));
        assert!(Tid(0x0001).gt(Tid(0xFFFF)));
        assert!(Tid(5).le(Tid(5)));
        assert!(Tid(5).ge(Tid(5)));
        assert!(!Tid(5).lt(Tid(5)));
        assert_eq!(Tid(0xFFFF).next(), Tid(0));
    }

    #[test]
    fn superblock_round_trip() {
        let sb = Superblock {
            magic: MAGIC,
            nblocks: 1024,
            nswap: 0,
            ninodes: 64,
            njournal: 64,
            swap_bn: 1,
            fbb_bn: 1,
            inode_bn: 2,
            data_bn: 3,
            journal_bn: 960,
        };
        let mut buf = [0u8; Superblock::SIZE];
        sb.encode(&mut buf);
        assert_eq!(Superblock::decode(&buf), sb);
        // explicitly little-endian on disk
        assert_eq!(&buf[0..8], &MAGIC.to_le_bytes());
    }

    #[test]
    fn inode_round_trip_zeroes_memory_words() {
        let ino = Inode {
            itype: FileType::RAW_REGULAR,
            size: 130,
            nlink: 1,
            direct: [7, 0, 0, 0, 0, 0, 0, 0, 0],
            indirect: 0,
            indirect2: 0,
        };
        let mut buf = [0xEEu8; INODE_SIZE];
        ino.encode(&mut buf);
        assert_eq!(&buf[12..20], &[0; 8]);
        assert_eq!(Inode::decode(&buf), ino);
    }

    #[test]
    fn dirent_names() {
        let e = DirEntry::new(2, "emerson.txt").unwrap();
        let mut buf = [0u8; DIRENT_SIZE];
        e.encode(&mut buf);
        let back = DirEntry::decode(&buf);
        assert_eq!(back.inum, 2);
        assert_eq!(back.name_bytes(), b"emerson.txt");

        assert!(DirEntry::new(2, ".").is_err());
        assert!(DirEntry::new(2, "..").is_err());
        assert!(DirEntry::new(2, "a/b").is_err());
        assert!(DirEntry::new(2, "").is_err());
        assert!(DirEntry::new(2, &"x".repeat(MAX_NAME_LEN + 1)).is_err());
        assert!(DirEntry::new(2, &"x".repeat(MAX_NAME_LEN)).is_ok());
    }

    #[test]
    fn metablock_round_trip() {
        let mb = MetaBlock {
            seq: Tid(12),
            tid: Tid(5),
            commit_boundary: Tid(6),
            complete_boundary: Tid(5),
            flags: MetaFlags::META | MetaFlags::START | MetaFlags::COMMIT,
            nref: 2,
            refs: vec![
                BlockRef {
                    bn: 100,
                    bchecksum: 0xDEAD_BEEF,
                    bflags: RefFlags::empty(),
                },
                BlockRef {
                    bn: 101,
                    bchecksum: NO_CHECKSUM,
                    bflags: RefFlags::ESCAPED,
                },
            ],
        };
        let mut buf = vec![0u8; BLOCK_SIZE];
        mb.encode(&mut buf);
        assert!(is_potential_metablock(&buf));
        let back = MetaBlock::decode(&buf);
        assert_eq!(back.seq, mb.seq);
        assert_eq!(back.tid, mb.tid);
        assert_eq!(back.flags, mb.flags);
        assert_eq!(back.refs, mb.refs);

        // a flipped byte invalidates the checksum
        buf[100] ^= 1;
        assert!(!is_potential_metablock(&buf));
    }

    #[test]
    fn block_index_classification() {
        assert_eq!(bi_direct_index(0), 0);
        assert_eq!(bi_direct_index(8), 8);
        assert_eq!(bi_direct_index(NDIRECT), 0);
        assert_eq!(bi_direct_index(NDIRECT + NINDIRECT + 3), 3);
        assert_eq!(bi_indirect_index(NDIRECT + NINDIRECT), 0);
        assert_eq!(bi_indirect_index(NDIRECT + 2 * NINDIRECT + 5), 1);
    }
}
