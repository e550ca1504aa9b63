//! Image builder: constructs a fresh, consistent filesystem image from a
//! boot sector and a list of input files.
//!
//! Geometry is computed from the block, swap, inode and journal counts;
//! file data is laid out contiguously in the data area, the root
//! directory is written last, and the free-block bitmap is initialized
//! to match. Every failure here is fatal to the build and reported with
//! the offending input.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::error;
use crate::errors::{FsError, FsResult};
use crate::fs::layout::{
    is_valid_name, set_indirect_slot, BlockNum, DirEntry, FileType, Inode,
    InodeNum, OnDisk, Superblock, BLOCK_SIZE, DIRENT_SIZE, INODES_PER_BLOCK,
    INODE_SIZE, MAGIC, MAX_DIRECT_SIZE, MAX_INDIRECT_SIZE, NDIRECT,
    ROOT_INODE, SUPERBLOCK_OFFSET,
};

/// Boot code may occupy at most this many bytes of block 0; the boot
/// signature and the superblock follow it.
pub const MAX_BOOT_SECTOR: usize = 510;

/// Geometry and content parameters for a build.
#[derive(Clone, Debug)]
pub struct BuildParams {
    /// Total block count; 0 selects the default of 1024.
    pub nblocks: BlockNum,
    /// Inode count; 0 derives a count from the geometry.
    pub ninodes: InodeNum,
    /// Swap region size in blocks.
    pub nswap: BlockNum,
    /// Journal size in blocks, carved from the end of the disk.
    pub njournal: BlockNum,
    /// Expected first data block; 0 leaves it unconstrained. When set,
    /// the first input file keeps its data contiguous from this block by
    /// placing its indirect block (if any) after the data.
    pub first_data_bn: BlockNum,
    /// Boot sector contents for block 0.
    pub bootsector: Option<Vec<u8>>,
}

impl Default for BuildParams {
    fn default() -> Self {
        BuildParams {
            nblocks: 1024,
            ninodes: 0,
            nswap: 0,
            njournal: 0,
            first_data_bn: 0,
            bootsector: None,
        }
    }
}

/// One file destined for the root directory.
pub struct InputFile {
    /// Directory entry name.
    pub name: String,
    /// File contents.
    pub data: Vec<u8>,
}

impl InputFile {
    /// Wraps in-memory contents.
    pub fn from_bytes(name: &str, data: Vec<u8>) -> InputFile {
        InputFile {
            name: name.to_string(),
            data,
        }
    }

    /// Reads `path` from the host filesystem.
    pub fn from_path(path: &Path, name: &str) -> FsResult<InputFile> {
        let mut data = Vec::new();
        File::open(path)?.read_to_end(&mut data)?;
        Ok(InputFile {
            name: name.to_string(),
            data,
        })
    }
}

struct Builder {
    image: Vec<u8>,
    sb: Superblock,
    /// Next unallocated block.
    freeb: BlockNum,
    /// Next unallocated inode.
    freeinode: InodeNum,
    /// Root directory entries accumulated so far.
    root: Vec<DirEntry>,
}

/// Builds a complete image from `params` and `files`.
///
/// The returned vector covers all `nblocks` blocks.
///
/// # Errors
///
/// Fatal build errors: inputs too large for the geometry, an oversized
/// boot sector, too many files, or malformed names.
pub fn build_image(params: &BuildParams, files: &[InputFile]) -> FsResult<Vec<u8>> {
    let sb = compute_geometry(params)?;

    let mut b = Builder {
        image: vec![0u8; sb.nblocks as usize * BLOCK_SIZE],
        sb,
        freeb: sb.data_bn,
        freeinode: ROOT_INODE + 1,
        root: Vec::new(),
    };

    if let Some(boot) = &params.bootsector {
        b.add_boot_sector(boot)?;
    }
    b.sb.encode(
        &mut b.image[SUPERBLOCK_OFFSET..SUPERBLOCK_OFFSET + Superblock::SIZE],
    );

    let mut indirect_at_end = params.first_data_bn != 0;
    for file in files {
        b.add_file(file, indirect_at_end)?;
        indirect_at_end = false;
    }

    b.add_root_directory()?;
    b.init_fbb();

    Ok(b.image)
}

// Computes the region layout for `params`, in order: boot/superblock,
// swap, free-block bitmap, inode table, data area, journal.
fn compute_geometry(params: &BuildParams) -> FsResult<Superblock> {
    let nblocks = if params.nblocks == 0 {
        1024
    } else {
        params.nblocks
    };

    let mut sb = Superblock {
        magic: MAGIC,
        nblocks,
        nswap: params.nswap,
        ninodes: params.ninodes,
        njournal: params.njournal,
        swap_bn: 1,
        ..Superblock::default()
    };
    sb.fbb_bn = sb.swap_bn + sb.nswap;
    sb.inode_bn = sb.fbb_bn + sb.fbb_block_count() as BlockNum;

    if sb.ninodes == 0 {
        sb.ninodes = if params.first_data_bn > sb.inode_bn {
            (params.first_data_bn - sb.inode_bn) * INODES_PER_BLOCK as u32
        } else if sb.inode_bn <= 3 {
            (16 - sb.inode_bn) * INODES_PER_BLOCK as u32
        } else {
            16 * INODES_PER_BLOCK as u32
        };
    }
    sb.data_bn = sb.inode_bn + sb.inode_block_count() as BlockNum;

    if sb.njournal > nblocks || sb.data_bn > nblocks - sb.njournal {
        error!("mkfs", "too few blocks, need at least {}", sb.data_bn + sb.njournal);
        return Err(FsError::NoSpace);
    }
    sb.journal_bn = nblocks - sb.njournal;

    if params.first_data_bn != 0 && params.first_data_bn != sb.data_bn {
        error!(
            "mkfs",
            "expected first data block {}, computed {}", params.first_data_bn, sb.data_bn
        );
        return Err(FsError::InvalidArgument);
    }

    Ok(sb)
}

impl Builder {
    fn block_mut(&mut self, bn: BlockNum) -> &mut [u8] {
        let off = bn as usize * BLOCK_SIZE;
        &mut self.image[off..off + BLOCK_SIZE]
    }

    fn add_boot_sector(&mut self, boot: &[u8]) -> FsResult<()> {
        if boot.len() > MAX_BOOT_SECTOR {
            error!(
                "mkfs",
                "boot sector too large: {} bytes (max {})",
                boot.len(),
                MAX_BOOT_SECTOR
            );
            return Err(FsError::InvalidArgument);
        }
        self.image[..boot.len()].copy_from_slice(boot);
        // boot sector signature
        self.image[510] = 0x55;
        self.image[511] = 0xAA;
        Ok(())
    }

    // Claims the next data-area block for `purpose`.
    fn advance_blockno(&mut self, purpose: &str) -> FsResult<BlockNum> {
        if self.freeb >= self.sb.journal_bn {
            error!("mkfs", "{}: out of space on output disk", purpose);
            return Err(FsError::NoSpace);
        }
        let bn = self.freeb;
        self.freeb += 1;
        Ok(bn)
    }

    fn add_file(&mut self, file: &InputFile, indirect_at_end: bool) -> FsResult<()> {
        if !is_valid_name(file.name.as_bytes()) {
            error!("mkfs", "{}: bad name", file.name);
            return Err(FsError::BadName);
        }

        // copy file data into consecutive blocks
        let first_block = self.freeb;
        let sz = file.data.len();
        for chunk_start in (0..sz).step_by(BLOCK_SIZE) {
            let bn = self.advance_blockno(&file.name)?;
            let chunk_end = (chunk_start + BLOCK_SIZE).min(sz);
            self.block_mut(bn)[..chunk_end - chunk_start]
                .copy_from_slice(&file.data[chunk_start..chunk_end]);
        }

        let inum = self.add_inode(
            None,
            FileType::Regular,
            sz,
            1,
            first_block,
            &file.name,
            indirect_at_end,
        )?;

        self.root.push(DirEntry::new(inum, &file.name)?);
        Ok(())
    }

    // Writes inode `inum` (or the next free one) covering `sz` bytes of
    // data laid out contiguously from `first_block`. Allocates and
    // populates an indirect block when the file outgrows the direct
    // pointers; `indirect_at_end` places it after the data instead of
    // before, keeping the data itself contiguous from `first_block`.
    #[allow(clippy::too_many_arguments)]
    fn add_inode(
        &mut self,
        inum: Option<InodeNum>,
        ftype: FileType,
        sz: usize,
        nlink: u32,
        first_block: BlockNum,
        what: &str,
        indirect_at_end: bool,
    ) -> FsResult<InodeNum> {
        let inum = match inum {
            Some(i) => i,
            None => {
                if self.freeinode == self.sb.ninodes {
                    error!("mkfs", "{}: out of inodes on output disk", what);
                    return Err(FsError::NoInode);
                }
                let i = self.freeinode;
                self.freeinode += 1;
                i
            }
        };

        let mut ino = Inode {
            itype: ftype.to_raw(),
            size: sz as u32,
            nlink,
            ..Inode::default()
        };

        if sz > MAX_INDIRECT_SIZE {
            error!("mkfs", "{}: file too big for indirect block", what);
            return Err(FsError::FileTooBig);
        }

        // lay out the indirect block
        let mut first_block = first_block;
        let mut indirect_bn = 0;
        if sz > MAX_DIRECT_SIZE {
            let bn = self.advance_blockno(what)?;
            if indirect_at_end {
                indirect_bn = bn;
            } else {
                // shift the file data up one block; the indirect block
                // takes its place in front
                let src = first_block as usize * BLOCK_SIZE;
                let end = bn as usize * BLOCK_SIZE;
                self.image.copy_within(src..end, src + BLOCK_SIZE);
                indirect_bn = first_block;
                first_block += 1;
                self.block_mut(indirect_bn).fill(0);
            }
            ino.indirect = indirect_bn;
        }

        // assign block pointers
        let nb_data = (sz + BLOCK_SIZE - 1) / BLOCK_SIZE;
        for bidx in 0..nb_data {
            let bn = first_block + bidx as u32;
            if bidx < NDIRECT {
                ino.direct[bidx] = bn;
            } else {
                set_indirect_slot(self.block_mut(indirect_bn), bidx - NDIRECT, bn);
            }
        }

        let off = self.sb.inode_block(inum) as usize * BLOCK_SIZE
            + Superblock::inode_offset(inum);
        ino.encode(&mut self.image[off..off + INODE_SIZE]);
        Ok(inum)
    }

    fn add_root_directory(&mut self) -> FsResult<()> {
        // pad the directory to a block multiple (at least one block)
        while self.root.len() * DIRENT_SIZE % BLOCK_SIZE != 0 || self.root.is_empty() {
            self.root.push(DirEntry::default());
        }

        let first_block = self.freeb;
        let sz = self.root.len() * DIRENT_SIZE;
        for _ in 0..sz / BLOCK_SIZE {
            self.advance_blockno("root directory")?;
        }
        for i in 0..self.root.len() {
            let off = first_block as usize * BLOCK_SIZE + i * DIRENT_SIZE;
            let entry = self.root[i];
            entry.encode(&mut self.image[off..off + DIRENT_SIZE]);
        }
        self.add_inode(
            Some(ROOT_INODE),
            FileType::Directory,
            sz,
            1,
            first_block,
            "root directory",
            false,
        )?;
        Ok(())
    }

    // Marks `[0, freeb)` allocated and `[freeb, nblocks)` free; the
    // partial byte past `nblocks` is marked free as well.
    fn init_fbb(&mut self) {
        let fbb_start = self.sb.fbb_bn as usize * BLOCK_SIZE;
        let nblocks = self.sb.nblocks as usize;
        let freeb = self.freeb as usize;

        let fbb = &mut self.image[fbb_start..fbb_start + (nblocks + 7) / 8];
        for byte in fbb[..nblocks / 8].iter_mut() {
            *byte = 0xFF;
        }
        for byte in fbb[..freeb / 8].iter_mut() {
            *byte = 0;
        }
        // the used blocks in the partial byte below `freeb` are
        // allocated too
        for b in (freeb & !7)..freeb {
            fbb[b / 8] &= !(1 << (b % 8));
        }
        let mut b = freeb;
        while b % 8 != 0 {
            fbb[b / 8] |= 1 << (b % 8);
            b += 1;
        }
        let mut b = nblocks;
        while b % 8 != 0 {
            fbb[b / 8] |= 1 << (b % 8);
            b += 1;
        }
    }
}
