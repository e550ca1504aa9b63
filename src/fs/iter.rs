//! The inode-indexed file block iterator.
//!
//! Translates file byte offsets to data block numbers through the
//! inode's direct, indirect and doubly-indirect pointers. The iterator
//! keeps a buffer-cache reference for the indirect block covering the
//! current position (its "indirect class") and reuses it while the
//! position stays inside that class; crossing into another class swaps
//! the cached reference. [`FileIter::map`] installs new mappings,
//! allocating and zeroing indirect metablocks on demand.

use crate::errors::{FsError, FsResult};
use crate::fs::cache::BcRef;
use crate::fs::layout::{
    bi_direct_index, bi_indirect_index, indirect_slot, set_indirect_slot,
    BlockNum, BLOCK_SIZE, MAX_SIZE, NDIRECT, NINDIRECT,
};
use crate::fs::state::{FsState, InodeRef};

/// Offset value of an iterator that has run past the last mappable
/// block (`!active()`).
pub const NPOS: usize = usize::MAX;

// The "indirect class" for block index `bi`: 0 for direct blocks, 1 for
// blocks referenced by the primary indirect block, and 2 or more for
// blocks referenced from the indirect2 block.
#[inline]
fn iclass(bi: usize) -> usize {
    (bi + NINDIRECT - NDIRECT) / NINDIRECT
}

/// A positioned view into one inode's block map.
///
/// The iterator borrows the inode handle; the caller is responsible for
/// holding the inode's content lock (read for traversal, write for
/// [`FileIter::map`]).
pub struct FileIter<'a> {
    fs: &'a FsState,
    ino: &'a InodeRef,
    off: usize,
    indirect2: Option<BcRef>,
    indirect: Option<BcRef>,
    /// Data block number mapped at `off`, or 0.
    mapped: BlockNum,
    /// Whether a pointer slot exists for `off` (the indirect chain is
    /// present), regardless of whether it maps a block.
    has_slot: bool,
}

impl<'a> FileIter<'a> {
    /// Creates an iterator over `ino` positioned at offset 0.
    pub fn new(fs: &'a FsState, ino: &'a InodeRef) -> FileIter<'a> {
        let mut it = FileIter {
            fs,
            ino,
            off: 0,
            indirect2: None,
            indirect: None,
            mapped: 0,
            has_slot: false,
        };
        it.find(0);
        it
    }

    /// The current file offset.
    pub fn offset(&self) -> usize {
        self.off
    }

    /// Whether the iterator points at a real offset (not past the file
    /// size limit).
    pub fn active(&self) -> bool {
        self.off != NPOS
    }

    /// The file offset of the current block.
    pub fn block_offset(&self) -> usize {
        self.off - self.off % BLOCK_SIZE
    }

    /// Whether a data block is mapped at the current offset.
    pub fn present(&self) -> bool {
        self.mapped != 0
    }

    /// The data block number at the current offset, or 0 if none is
    /// mapped.
    pub fn blocknum(&self) -> BlockNum {
        self.mapped
    }

    /// Moves the iterator to file offset `off`. Positioning never fails:
    /// an unmapped offset simply leaves `present()` false.
    pub fn find(&mut self, off: usize) -> &mut Self {
        let bi = off.min(MAX_SIZE) / BLOCK_SIZE;

        // drop the cached indirect reference when crossing classes
        if self.indirect.is_some() && iclass(bi) != iclass(self.off / BLOCK_SIZE) {
            self.indirect = None;
        }

        self.off = off;
        self.mapped = 0;
        self.has_slot = false;

        if bi >= MAX_SIZE / BLOCK_SIZE {
            return self;
        }

        // load the doubly-indirect block if necessary
        if bi >= NDIRECT + NINDIRECT && self.indirect2.is_none() {
            let i2bn = self.ino.meta().indirect2;
            if i2bn != 0 {
                self.indirect2 = self.fs.cache().load(i2bn, None).ok();
            }
            if self.indirect2.is_none() {
                return self;
            }
        }

        // load the indirect block if necessary
        if bi >= NDIRECT && self.indirect.is_none() {
            let ibn = self.iptr(bi);
            if ibn != 0 {
                self.indirect = self.fs.cache().load(ibn, None).ok();
            }
            if self.indirect.is_none() {
                return self;
            }
        }

        self.has_slot = true;
        self.mapped = self.dptr(bi);
        self
    }

    /// Moves the iterator to the next larger file offset with a present
    /// block; if there is none, parks it at [`NPOS`].
    pub fn next(&mut self) {
        if self.off == NPOS {
            return;
        }
        let max_bi = MAX_SIZE / BLOCK_SIZE;
        let mut bi = self.off / BLOCK_SIZE + 1;
        while bi < max_bi {
            self.find(bi * BLOCK_SIZE);
            if self.present() {
                return;
            }
            let cls = iclass(bi);
            if cls > 1 && self.indirect2.is_none() {
                // no indirect2 block: nothing past this point
                bi = max_bi;
            } else if cls > 0 && self.indirect.is_none() {
                // this window has no indirect block; skip to the next
                bi = NDIRECT + cls * NINDIRECT;
            } else {
                bi += 1;
            }
        }
        self.off = NPOS;
        self.mapped = 0;
        self.has_slot = false;
    }

    /// Installs `bn` as the mapping for the current offset, allocating
    /// indirect and doubly-indirect blocks as necessary. `bn == 0`
    /// clears the mapping.
    ///
    /// Requires the inode's write lock.
    ///
    /// # Errors
    ///
    /// [`FsError::FileTooBig`] past the file size limit, or the
    /// allocation error when no metablock can be allocated, in which
    /// case the inode mapping is unchanged.
    pub fn map(&mut self, bn: BlockNum) -> FsResult<()> {
        assert!(self.ino.has_write_lock());
        let bi = self.off.min(MAX_SIZE) / BLOCK_SIZE;

        // simple cases: clearing an empty mapping, beyond the size limit
        if bn == 0 && !self.has_slot {
            return Ok(());
        }
        if self.off >= MAX_SIZE {
            return Err(FsError::FileTooBig);
        }

        // allocate & initialize a doubly-indirect block if necessary
        if bi >= NDIRECT + NINDIRECT && self.indirect2.is_none() {
            let (i2bn, entry) = self.allocate_metablock()?;
            self.indirect2 = Some(entry);
            let mut meta = self.ino.meta();
            meta.indirect2 = i2bn;
            self.ino.set_meta(&meta);
        }

        // allocate & initialize an indirect block if necessary
        if bi >= NDIRECT && self.indirect.is_none() {
            let (ibn, entry) = self.allocate_metablock()?;
            self.indirect = Some(entry);
            if bi >= NDIRECT + NINDIRECT {
                let i2 = self.indirect2.as_ref().expect("indirect2 loaded above");
                set_indirect_slot(&mut i2.data_mut()[..], bi_indirect_index(bi), ibn);
            } else {
                let mut meta = self.ino.meta();
                meta.indirect = ibn;
                self.ino.set_meta(&meta);
            }
        }

        // store the data block pointer
        if bi >= NDIRECT {
            let ind = self.indirect.as_ref().expect("indirect loaded above");
            set_indirect_slot(&mut ind.data_mut()[..], bi_direct_index(bi), bn);
        } else {
            let mut meta = self.ino.meta();
            meta.direct[bi] = bn;
            self.ino.set_meta(&meta);
        }
        self.has_slot = true;
        self.mapped = bn;
        Ok(())
    }

    // Pointer to the indirect block number covering `bi`: a slot of the
    // indirect2 block, or the inode's `indirect` field.
    fn iptr(&self, bi: usize) -> BlockNum {
        let cls = iclass(bi);
        if cls > 1 {
            let i2 = self.indirect2.as_ref().expect("indirect2 loaded");
            indirect_slot(&i2.data()[..], cls - 2)
        } else {
            self.ino.meta().indirect
        }
    }

    // The data block number stored for `bi`.
    fn dptr(&self, bi: usize) -> BlockNum {
        if bi >= NDIRECT {
            let ind = self.indirect.as_ref().expect("indirect loaded");
            indirect_slot(&ind.data()[..], bi_direct_index(bi))
        } else {
            self.ino.meta().direct[bi]
        }
    }

    // Allocates and zeroes a fresh indirect or doubly-indirect block.
    fn allocate_metablock(&self) -> FsResult<(BlockNum, BcRef)> {
        let bn = self.fs.allocate_extent(1)?;
        let entry = self.fs.cache().load(bn, None)?;
        entry.data_mut().fill(0);
        Ok((bn, entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::layout::{Inode, OnDisk, Superblock, INODE_SIZE, SUPERBLOCK_OFFSET};
    use crate::fs::{BlockDevice, MemDisk};
    use crate::mkfs::{BuildParams, InputFile};
    use std::sync::Arc;

    fn image_with_file(contents: &[u8]) -> Vec<u8> {
        let params = BuildParams {
            nblocks: 256,
            ..BuildParams::default()
        };
        crate::mkfs::build_image(
            &params,
            &[InputFile::from_bytes("f.dat", contents.to_vec())],
        )
        .unwrap()
    }

    fn punch_hole(image: &mut [u8], inum: u32, direct_idx: usize) {
        let sb = Superblock::decode(
            &image[SUPERBLOCK_OFFSET..SUPERBLOCK_OFFSET + Superblock::SIZE],
        );
        let off = sb.inode_block(inum) as usize * crate::fs::layout::BLOCK_SIZE
            + Superblock::inode_offset(inum);
        let mut ino = Inode::decode(&image[off..off + INODE_SIZE]);
        ino.direct[direct_idx] = 0;
        ino.encode(&mut image[off..off + INODE_SIZE]);
    }

    #[test]
    fn direct_blocks_resolve_in_order() {
        let image = image_with_file(&[7u8; 3 * BLOCK_SIZE]);
        let disk = Arc::new(MemDisk::new(image).unwrap()) as Arc<dyn BlockDevice>;
        let fs = crate::fs::state::FsState::mount(disk).unwrap();
        let ino = fs.lookup_inode_root(b"f.dat").unwrap().unwrap();

        ino.lock_read();
        let mut it = FileIter::new(&fs, &ino);
        let mut bns = Vec::new();
        while it.active() && it.present() {
            bns.push(it.blocknum());
            it.next();
        }
        ino.unlock_read();

        assert_eq!(bns.len(), 3);
        // the builder lays file data out contiguously
        assert_eq!(bns[1], bns[0] + 1);
        assert_eq!(bns[2], bns[0] + 2);
    }

    #[test]
    fn hole_is_absent_and_next_skips_it() {
        // file spans direct[0..3); punch direct[1]
        let mut image = image_with_file(&[9u8; 3 * BLOCK_SIZE]);
        punch_hole(&mut image, 2, 1);
        let disk = Arc::new(MemDisk::new(image).unwrap()) as Arc<dyn BlockDevice>;
        let fs = crate::fs::state::FsState::mount(disk).unwrap();
        let ino = fs.lookup_inode_root(b"f.dat").unwrap().unwrap();

        ino.lock_read();
        let mut it = FileIter::new(&fs, &ino);
        it.find(BLOCK_SIZE);
        assert!(!it.present());
        assert_eq!(it.blocknum(), 0);
        it.next();
        assert_eq!(it.offset(), 2 * BLOCK_SIZE);
        assert!(it.present());
        ino.unlock_read();
    }

    #[test]
    fn indirect_file_resolves_past_direct_area() {
        let image = image_with_file(&[3u8; (NDIRECT + 2) * BLOCK_SIZE]);
        let disk = Arc::new(MemDisk::new(image).unwrap()) as Arc<dyn BlockDevice>;
        let fs = crate::fs::state::FsState::mount(disk).unwrap();
        let ino = fs.lookup_inode_root(b"f.dat").unwrap().unwrap();
        assert!(ino.meta().indirect != 0);

        ino.lock_read();
        let mut it = FileIter::new(&fs, &ino);
        it.find(NDIRECT * BLOCK_SIZE);
        assert!(it.present());
        let first_indirect = it.blocknum();
        it.next();
        assert_eq!(it.blocknum(), first_indirect + 1);
        it.next();
        // past the last mapped block
        assert!(!it.active() || !it.present());
        ino.unlock_read();
    }

    #[test]
    fn map_installs_blocks_and_allocates_indirect_chain() {
        let image = image_with_file(&[1u8; BLOCK_SIZE]);
        let disk = Arc::new(MemDisk::new(image).unwrap()) as Arc<dyn BlockDevice>;
        let fs = crate::fs::state::FsState::mount(disk).unwrap();
        let ino = fs.lookup_inode_root(b"f.dat").unwrap().unwrap();

        ino.lock_write();
        let fresh = fs.allocate_extent(1).unwrap();
        let mut it = FileIter::new(&fs, &ino);
        // mapping block index NDIRECT forces an indirect block
        it.find(NDIRECT * BLOCK_SIZE);
        assert!(!it.present());
        it.map(fresh).unwrap();
        assert!(it.present());
        assert_eq!(it.blocknum(), fresh);
        assert!(ino.meta().indirect != 0);
        ino.unlock_write();

        // the mapping is visible to a fresh iterator
        ino.lock_read();
        let mut it2 = FileIter::new(&fs, &ino);
        it2.find(NDIRECT * BLOCK_SIZE);
        assert_eq!(it2.blocknum(), fresh);
        ino.unlock_read();
    }

    #[test]
    fn map_fails_past_file_size_limit() {
        let image = image_with_file(&[1u8; BLOCK_SIZE]);
        let disk = Arc::new(MemDisk::new(image).unwrap()) as Arc<dyn BlockDevice>;
        let fs = crate::fs::state::FsState::mount(disk).unwrap();
        let ino = fs.lookup_inode_root(b"f.dat").unwrap().unwrap();

        ino.lock_write();
        let mut it = FileIter::new(&fs, &ino);
        it.find(MAX_SIZE);
        assert!(matches!(it.map(55), Err(FsError::FileTooBig)));
        ino.unlock_write();
    }
}
