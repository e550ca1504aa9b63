//! Offline consistency checker.
//!
//! Cross-validates an image: superblock geometry, journal (replayed
//! in-memory before anything else looks at the disk), static region
//! typing, the inode graph reachable from the root directory, directory
//! entry hygiene, and agreement between the free-block bitmap and actual
//! block ownership. Errors make the check fail; warnings (holes,
//! dangling references, allocated-but-unreferenced blocks) do not.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::io::Write;

use crate::fs::journal::{JournalReplayer, ReplaySink};
use crate::fs::layout::{
    BlockNum, DirEntry, FileType, Inode, InodeNum, OnDisk, Superblock,
    BITS_PER_BLOCK, BLOCK_SIZE, DIRENT_SIZE, INODES_PER_BLOCK, INODE_SIZE,
    MAX_INDIRECT2_SIZE, MAX_NAME_LEN, NDIRECT, NINDIRECT, ROOT_INODE,
    SUPERBLOCK_OFFSET,
};

/// Checker options.
#[derive(Clone, Copy, Debug, Default)]
pub struct CheckOptions {
    /// List inodes, block pointers and directory entries while walking.
    pub verbose: bool,
}

/// Outcome of a check run.
#[derive(Clone, Copy, Debug, Default)]
pub struct CheckReport {
    /// Number of errors; nonzero fails the check.
    pub errors: usize,
    /// Number of warnings; warnings never fail the check.
    pub warnings: usize,
}

impl CheckReport {
    /// True when the image checked out clean.
    pub fn ok(&self) -> bool {
        self.errors == 0
    }
}

struct Reporter<'a> {
    out: &'a mut dyn Write,
    verbose: bool,
    nerrors: usize,
    nwarnings: usize,
}

impl Reporter<'_> {
    fn e(&mut self, args: fmt::Arguments<'_>) {
        let _ = writeln!(self.out, "{args}");
        self.nerrors += 1;
    }

    fn w(&mut self, args: fmt::Arguments<'_>) {
        let _ = writeln!(self.out, "{args}");
        self.nwarnings += 1;
    }

    // context lines following an error, not counted separately
    fn x(&mut self, args: fmt::Arguments<'_>) {
        let _ = writeln!(self.out, "{args}");
    }

    fn v(&mut self, args: fmt::Arguments<'_>) {
        if self.verbose {
            let _ = writeln!(self.out, "{args}");
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BlockType {
    Unused,
    Superblock,
    Swap,
    Fbb,
    InodeTable,
    Journal,
    Directory,
    Regular,
    Indirect,
    Indirect2,
}

impl BlockType {
    fn name(self) -> &'static str {
        match self {
            BlockType::Unused => "unused",
            BlockType::Superblock => "superblock",
            BlockType::Swap => "swap",
            BlockType::Fbb => "fbb",
            BlockType::InodeTable => "inode",
            BlockType::Journal => "journal",
            BlockType::Directory => "directory",
            BlockType::Regular => "regular",
            BlockType::Indirect => "indirect",
            BlockType::Indirect2 => "indirect2",
        }
    }
}

#[derive(Clone)]
struct BlockInfo {
    btype: BlockType,
    owner: String,
    idx: Option<usize>,
}

struct InodeInfo {
    visits: u32,
    btype: BlockType,
    owner: String,
}

fn unparse_blockidx(idx: Option<usize>) -> String {
    match idx {
        Some(i) => format!("[{i}]"),
        None => String::new(),
    }
}

struct Check<'a, 'o> {
    data: &'a [u8],
    sb: Superblock,
    blocks: Vec<BlockInfo>,
    inodes: Vec<InodeInfo>,
    queue: VecDeque<InodeNum>,
    rep: Reporter<'o>,
}

impl Check<'_, '_> {
    fn fbb_free(&self, bn: BlockNum) -> bool {
        let byte =
            self.data[self.sb.fbb_bn as usize * BLOCK_SIZE + bn as usize / 8];
        byte & (1 << (bn % 8)) != 0
    }

    fn inode_at(&self, inum: InodeNum) -> Inode {
        let off = self.sb.inode_block(inum) as usize * BLOCK_SIZE
            + Superblock::inode_offset(inum);
        Inode::decode(&self.data[off..off + INODE_SIZE])
    }

    fn visit_block(
        &mut self,
        bn: BlockNum,
        btype: BlockType,
        owner: &str,
        idx: Option<usize>,
    ) {
        let info = &self.blocks[bn as usize];
        if info.btype != BlockType::Unused {
            let (old_type, old_owner, old_idx) =
                (info.btype, info.owner.clone(), info.idx);
            self.rep.e(format_args!(
                "block {}: reusing block for {}{} as {}",
                bn,
                owner,
                unparse_blockidx(idx),
                btype.name()
            ));
            self.rep.x(format_args!(
                "block {}: originally used for {}{} as {}",
                bn,
                old_owner,
                unparse_blockidx(old_idx),
                old_type.name()
            ));
        } else {
            self.blocks[bn as usize] = BlockInfo {
                btype,
                owner: owner.to_string(),
                idx,
            };
            if self.fbb_free(bn) {
                self.rep.e(format_args!(
                    "block {} @{} ({}): used block is marked free",
                    bn,
                    owner,
                    btype.name()
                ));
            }
        }
    }

    fn visit_inode(&mut self, inum: InodeNum, owner: &str) {
        self.inodes[inum as usize].visits += 1;

        if inum == 0 {
            self.rep
                .e(format_args!("{}: refers to inode number 0", owner));
        } else if self.inodes[inum as usize].visits == 1 {
            let ino = self.inode_at(inum);
            let btype = match ino.file_type() {
                Some(FileType::Directory) => BlockType::Directory,
                Some(FileType::Regular) => BlockType::Regular,
                None => {
                    self.rep.e(format_args!(
                        "inode {} @{}: unknown type {}",
                        inum, owner, ino.itype
                    ));
                    BlockType::Regular
                }
            };
            self.inodes[inum as usize].btype = btype;
            self.inodes[inum as usize].owner = owner.to_string();
            self.queue.push_back(inum);
        } else if self.inodes[inum as usize].btype == BlockType::Directory {
            let orig = self.inodes[inum as usize].owner.clone();
            let visits = self.inodes[inum as usize].visits;
            self.rep.e(format_args!(
                "inode {} @{}: more than one link to directory",
                inum, orig
            ));
            self.rep.x(format_args!(
                "inode {} @{}: link #{} from {}",
                inum, orig, visits, owner
            ));
        }
    }

    fn clear_inodeq(&mut self) {
        while let Some(inum) = self.queue.pop_front() {
            self.finish_visit(inum);
        }
    }

    fn finish_visit(&mut self, inum: InodeNum) {
        let ino = self.inode_at(inum);
        let owner = self.inodes[inum as usize].owner.clone();
        let btype = self.inodes[inum as usize].btype;
        let sz = ino.size as usize;

        if self.rep.verbose {
            let type_name = match ino.file_type() {
                Some(_) => btype.name().to_string(),
                None => format!("<type {}>", ino.itype),
            };
            self.rep.v(format_args!(
                "inode {} @{}: size {}, type {}, nlink {}",
                inum, owner, sz, type_name, ino.nlink
            ));
        }

        if sz > MAX_INDIRECT2_SIZE {
            self.rep.e(format_args!(
                "inode {} @{}: size {} too big (max {})",
                inum, owner, sz, MAX_INDIRECT2_SIZE
            ));
        }
        let mut contents = if btype == BlockType::Directory {
            if sz % DIRENT_SIZE != 0 {
                self.rep.e(format_args!(
                    "inode {} @{}: directory size {} not multiple of {}",
                    inum, owner, sz, DIRENT_SIZE
                ));
            }
            Some(HashSet::new())
        } else {
            None
        };

        for i in 0..NDIRECT {
            self.visit_data(ino.direct[i], i, sz, inum, &mut contents);
        }
        self.visit_indirect(ino.indirect, NDIRECT, sz, inum, &mut contents);
        self.visit_indirect2(ino.indirect2, NDIRECT + NINDIRECT, sz, inum, &mut contents);
    }

    fn visit_data(
        &mut self,
        b: BlockNum,
        idx: usize,
        sz: usize,
        inum: InodeNum,
        contents: &mut Option<HashSet<Vec<u8>>>,
    ) {
        let owner = self.inodes[inum as usize].owner.clone();
        let btype = self.inodes[inum as usize].btype;
        if b != 0 {
            self.rep
                .v(format_args!("  [{}]: data block {}", idx, b));
            if idx * BLOCK_SIZE >= sz {
                self.rep.w(format_args!(
                    "inode {} @{} [{}]: warning: dangling block reference",
                    inum, owner, idx
                ));
            }
            if (b as usize) < self.blocks.len() {
                self.visit_block(b, btype, &owner, Some(idx));
                if btype == BlockType::Directory {
                    self.visit_directory_data(b, idx * BLOCK_SIZE, sz, inum, contents);
                }
            } else {
                self.rep.e(format_args!(
                    "inode {} @{} [{}]: block number {} out of range",
                    inum, owner, idx, b
                ));
            }
        } else if idx * BLOCK_SIZE < sz {
            self.rep.w(format_args!(
                "inode {} @{} [{}]: warning: hole in file",
                inum, owner, idx
            ));
        }
    }

    fn visit_directory_data(
        &mut self,
        b: BlockNum,
        pos: usize,
        sz: usize,
        inum: InodeNum,
        contents: &mut Option<HashSet<Vec<u8>>>,
    ) {
        let owner = self.inodes[inum as usize].owner.clone();
        let base = b as usize * BLOCK_SIZE;
        let doff = pos / DIRENT_SIZE;
        for i in 0..BLOCK_SIZE / DIRENT_SIZE {
            if pos + (i + 1) * DIRENT_SIZE > sz {
                break;
            }
            let de = DirEntry::decode(
                &self.data[base + i * DIRENT_SIZE..base + (i + 1) * DIRENT_SIZE],
            );
            if de.inum == 0 {
                continue;
            }
            let name = de.name_bytes().to_vec();
            if name.is_empty() {
                self.rep.e(format_args!(
                    "inode {} @{} [{}]: dirent #{} empty name",
                    inum,
                    owner,
                    b,
                    doff + i
                ));
            } else if name.len() > MAX_NAME_LEN {
                self.rep.e(format_args!(
                    "inode {} @{} [{}]: dirent #{} name too long",
                    inum,
                    owner,
                    b,
                    doff + i
                ));
                self.rep.x(format_args!(
                    "inode {} @{} [{}]: name is \"{}\"",
                    inum,
                    owner,
                    b,
                    String::from_utf8_lossy(&name)
                ));
            }
            let display = String::from_utf8_lossy(&name).into_owned();
            if name == b"." || name == b".." || name.contains(&b'/') {
                self.rep.e(format_args!(
                    "inode {} @{} [{}]: dirent #{} name \"{}\" reserved",
                    inum,
                    owner,
                    b,
                    doff + i,
                    display
                ));
            }

            self.rep.v(format_args!(
                "    #{} \"{}\": inode {}",
                doff + i,
                display,
                de.inum
            ));

            if let Some(set) = contents {
                if !set.insert(name) {
                    self.rep.e(format_args!(
                        "inode {} @{} [{}]: dirent #{} reuses name \"{}\"",
                        inum,
                        owner,
                        b,
                        doff + i,
                        display
                    ));
                }
            }
            if de.inum < self.sb.ninodes {
                self.visit_inode(de.inum, &display);
            } else {
                self.rep.e(format_args!(
                    "inode {} @{} [{}]: directory entry #{} inode {} out of range",
                    inum,
                    owner,
                    b,
                    doff + i,
                    de.inum
                ));
            }
        }
    }

    fn visit_indirect(
        &mut self,
        b: BlockNum,
        idx: usize,
        sz: usize,
        inum: InodeNum,
        contents: &mut Option<HashSet<Vec<u8>>>,
    ) {
        let owner = self.inodes[inum as usize].owner.clone();
        if b != 0 {
            self.rep
                .v(format_args!("  [{}]: indirect block {}", idx, b));
            if idx * BLOCK_SIZE >= sz {
                self.rep.w(format_args!(
                    "inode {} @{} [{}]: warning: dangling indirect block reference",
                    inum, owner, idx
                ));
            }
            if (b as usize) < self.blocks.len() {
                self.visit_block(b, BlockType::Indirect, &owner, Some(idx));
                let base = b as usize * BLOCK_SIZE;
                for i in 0..NINDIRECT {
                    let slot = u32::from_le_bytes(
                        self.data[base + i * 4..base + i * 4 + 4]
                            .try_into()
                            .expect("4-byte slot"),
                    );
                    self.visit_data(slot, idx + i, sz, inum, contents);
                }
            } else {
                self.rep.e(format_args!(
                    "inode {} @{} [{}]: block number {} out of range",
                    inum, owner, idx, b
                ));
            }
        } else if idx * BLOCK_SIZE < sz {
            self.rep.w(format_args!(
                "inode {} @{} [{}]: warning: {}",
                inum,
                owner,
                idx,
                if idx == NDIRECT {
                    "missing indirect block"
                } else {
                    "hole in file"
                }
            ));
        }
    }

    fn visit_indirect2(
        &mut self,
        b: BlockNum,
        idx: usize,
        sz: usize,
        inum: InodeNum,
        contents: &mut Option<HashSet<Vec<u8>>>,
    ) {
        let owner = self.inodes[inum as usize].owner.clone();
        if b != 0 {
            self.rep
                .v(format_args!("  [{}]: indirect2 block {}", idx, b));
            if idx * BLOCK_SIZE >= sz {
                self.rep.w(format_args!(
                    "inode {} @{} [{}]: warning: dangling indirect2 block reference",
                    inum, owner, idx
                ));
            }
            if (b as usize) < self.blocks.len() {
                self.visit_block(b, BlockType::Indirect2, &owner, Some(idx));
                let base = b as usize * BLOCK_SIZE;
                for i in 0..NINDIRECT {
                    let slot = u32::from_le_bytes(
                        self.data[base + i * 4..base + i * 4 + 4]
                            .try_into()
                            .expect("4-byte slot"),
                    );
                    self.visit_indirect(slot, idx + i * NINDIRECT, sz, inum, contents);
                }
            } else {
                self.rep.e(format_args!(
                    "inode {} @{} [{}]: block number {} out of range",
                    inum, owner, idx, b
                ));
            }
        } else if idx * BLOCK_SIZE < sz {
            self.rep.w(format_args!(
                "inode {} @{} [{}]: warning: {}",
                inum,
                owner,
                idx,
                if idx == NDIRECT + NINDIRECT {
                    "missing indirect2 block"
                } else {
                    "hole in file"
                }
            ));
        }
    }
}

fn check_superblock(rep: &mut Reporter<'_>, sb: &Superblock) {
    if !sb.is_valid_magic() {
        rep.e(format_args!("bad magic number {:#018X}", sb.magic));
    }
    if sb.nblocks <= 2 || sb.nblocks >= 0x1000_0000 {
        rep.e(format_args!("bad number of blocks {}", sb.nblocks));
    }
    if sb.swap_bn != 1 {
        rep.e(format_args!(
            "unexpected swap_bn {} (expected 1)",
            sb.swap_bn
        ));
    }
    if sb.swap_bn.checked_add(sb.nswap).map_or(true, |e| e > sb.nblocks) {
        rep.e(format_args!("too many swap blocks {}", sb.nswap));
    }
    if sb.swap_bn.wrapping_add(sb.nswap) != sb.fbb_bn {
        rep.e(format_args!(
            "unexpected fbb_bn {} (expected {})",
            sb.fbb_bn,
            sb.swap_bn.wrapping_add(sb.nswap)
        ));
    }
    let nfbb =
        (sb.nblocks as usize + BITS_PER_BLOCK - 1) / BITS_PER_BLOCK;
    if sb.fbb_bn as usize + nfbb != sb.inode_bn as usize {
        rep.e(format_args!(
            "unexpected inode_bn {} (expected {})",
            sb.inode_bn,
            sb.fbb_bn as usize + nfbb
        ));
    }
    if sb.ninodes < 10 {
        rep.e(format_args!(
            "expected at least 10 inodes (have {})",
            sb.ninodes
        ));
    }
    let ninodeb =
        (sb.ninodes as usize + INODES_PER_BLOCK - 1) / INODES_PER_BLOCK;
    if sb.inode_bn as usize + ninodeb > sb.data_bn as usize {
        rep.e(format_args!(
            "unexpected data_bn {} (expected at least {})",
            sb.data_bn,
            sb.inode_bn as usize + ninodeb
        ));
    }
    if sb.data_bn >= sb.nblocks {
        rep.e(format_args!(
            "data_bn {} too large for disk (nblocks {})",
            sb.data_bn, sb.nblocks
        ));
    }
    if sb.journal_bn < sb.data_bn || sb.journal_bn > sb.nblocks {
        rep.e(format_args!("unexpected journal_bn {}", sb.journal_bn));
    }
    if sb.journal_bn <= sb.nblocks && sb.njournal > sb.nblocks - sb.journal_bn {
        rep.e(format_args!(
            "unexpected njournal {} (expected at most {})",
            sb.njournal,
            sb.nblocks - sb.journal_bn
        ));
    }
}

struct CheckReplaySink<'a, 'o, 'r> {
    image: &'a mut [u8],
    sb: &'a Superblock,
    rep: &'r mut Reporter<'o>,
}

impl ReplaySink for CheckReplaySink<'_, '_, '_> {
    fn error(&mut self, bi: usize, text: &str) {
        let njb = self.sb.nblocks - self.sb.journal_bn;
        self.rep
            .e(format_args!("journal block {}/{}: {}", bi, njb, text));
    }

    fn write_block(&mut self, bn: BlockNum, data: &[u8]) {
        let off = bn as usize * BLOCK_SIZE;
        self.image[off..off + BLOCK_SIZE].copy_from_slice(data);
    }

    fn write_replay_complete(&mut self) {
        let start = self.sb.journal_bn as usize * BLOCK_SIZE;
        let end = self.sb.nblocks as usize * BLOCK_SIZE;
        self.image[start..end].fill(0);
    }
}

fn replay_journal(image: &mut [u8], sb: &Superblock, rep: &mut Reporter<'_>) {
    // replay against a copy of the journal region
    let start = sb.journal_bn as usize * BLOCK_SIZE;
    let end = sb.nblocks as usize * BLOCK_SIZE;
    let jcopy = image[start..end].to_vec();

    let mut sink = CheckReplaySink { image, sb, rep };
    let mut jr = JournalReplayer::new(&jcopy);
    if jr.analyze(&mut sink) {
        jr.run(&mut sink);
    }
}

/// Checks `image`, writing findings to `out`.
///
/// When the image carries a journal, the journal is replayed against the
/// in-memory image (and its region zeroed) before the walk, so the check
/// covers the post-recovery state. Callers that want the recovery to
/// persist write the mutated image back; the checker itself never
/// touches the original medium.
pub fn check_image(
    image: &mut Vec<u8>,
    opts: &CheckOptions,
    out: &mut dyn Write,
) -> CheckReport {
    let mut rep = Reporter {
        out,
        verbose: opts.verbose,
        nerrors: 0,
        nwarnings: 0,
    };

    if image.len() % BLOCK_SIZE != 0 {
        rep.e(format_args!(
            "unexpected size {} is not a multiple of blocksize {}",
            image.len(),
            BLOCK_SIZE
        ));
    }
    if image.len() < BLOCK_SIZE {
        rep.e(format_args!("file size {} too small", image.len()));
        return CheckReport {
            errors: rep.nerrors,
            warnings: rep.nwarnings,
        };
    }

    // check superblock
    let sb = Superblock::decode(
        &image[SUPERBLOCK_OFFSET..SUPERBLOCK_OFFSET + Superblock::SIZE],
    );
    check_superblock(&mut rep, &sb);
    if rep.nerrors > 0 {
        return CheckReport {
            errors: rep.nerrors,
            warnings: rep.nwarnings,
        };
    }

    // a short image reads as zero blocks past its end
    if image.len() < sb.nblocks as usize * BLOCK_SIZE {
        image.resize(sb.nblocks as usize * BLOCK_SIZE, 0);
    }

    // check journal
    if sb.journal_bn < sb.nblocks {
        replay_journal(image, &sb, &mut rep);
    }

    let mut chk = Check {
        data: &image[..],
        sb,
        blocks: vec![
            BlockInfo {
                btype: BlockType::Unused,
                owner: String::new(),
                idx: None,
            };
            sb.nblocks as usize
        ],
        inodes: (0..sb.ninodes)
            .map(|_| InodeInfo {
                visits: 0,
                btype: BlockType::Unused,
                owner: String::new(),
            })
            .collect(),
        queue: VecDeque::new(),
        rep,
    };

    // mark statically typed blocks
    chk.visit_block(0, BlockType::Superblock, "superblock", None);
    for b in chk.sb.swap_bn..chk.sb.fbb_bn {
        chk.visit_block(b, BlockType::Swap, "swap space", Some((b - chk.sb.swap_bn) as usize));
    }
    for b in chk.sb.fbb_bn..chk.sb.inode_bn {
        chk.visit_block(b, BlockType::Fbb, "fbb", Some((b - chk.sb.fbb_bn) as usize));
    }
    for b in chk.sb.inode_bn..chk.sb.data_bn {
        chk.visit_block(b, BlockType::InodeTable, "inode", Some((b - chk.sb.inode_bn) as usize));
    }
    for b in chk.sb.journal_bn..chk.sb.nblocks {
        chk.visit_block(b, BlockType::Journal, "journal", Some((b - chk.sb.journal_bn) as usize));
    }

    // visit the root directory, then everything it references
    chk.visit_inode(ROOT_INODE, "root directory");
    chk.clear_inodeq();

    // check for lost inodes
    for inum in 0..chk.sb.ninodes {
        if chk.inodes[inum as usize].visits == 0 {
            let ino = chk.inode_at(inum);
            if ino.is_live() {
                chk.rep.e(format_args!(
                    "inode {}: lost inode appears live",
                    inum
                ));
                chk.visit_inode(inum, "lost inode");
                chk.clear_inodeq();
            }
        }
    }

    // check for garbage
    for b in chk.sb.data_bn..chk.sb.journal_bn {
        if !chk.fbb_free(b) && chk.blocks[b as usize].btype == BlockType::Unused {
            chk.rep.w(format_args!(
                "block {}: unreferenced block is marked allocated",
                b
            ));
        }
    }

    CheckReport {
        errors: chk.rep.nerrors,
        warnings: chk.rep.nwarnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mkfs::{build_image, BuildParams, InputFile};

    fn run_check(image: &mut Vec<u8>) -> (CheckReport, String) {
        let mut out = Vec::new();
        let report = check_image(image, &CheckOptions::default(), &mut out);
        (report, String::from_utf8(out).unwrap())
    }

    fn inode_pos(image: &[u8], inum: InodeNum) -> usize {
        let sb = Superblock::decode(
            &image[SUPERBLOCK_OFFSET..SUPERBLOCK_OFFSET + Superblock::SIZE],
        );
        sb.inode_block(inum) as usize * BLOCK_SIZE + Superblock::inode_offset(inum)
    }

    #[test]
    fn built_image_checks_clean() {
        let mut image = build_image(
            &BuildParams::default(),
            &[
                InputFile::from_bytes("emerson.txt", vec![b'x'; 130]),
                InputFile::from_bytes("big.bin", vec![0xCD; 11 * BLOCK_SIZE]),
            ],
        )
        .unwrap();
        let (report, output) = run_check(&mut image);
        assert!(report.ok(), "checker found: {output}");
        assert_eq!(report.warnings, 0, "checker warned: {output}");
    }

    #[test]
    fn bad_magic_fails() {
        let mut image = build_image(&BuildParams::default(), &[]).unwrap();
        image[SUPERBLOCK_OFFSET] ^= 0xFF;
        let (report, output) = run_check(&mut image);
        assert!(!report.ok());
        assert!(output.contains("bad magic number"));
    }

    #[test]
    fn duplicate_block_ownership_is_reported_with_both_owners() {
        let mut image = build_image(
            &BuildParams::default(),
            &[
                InputFile::from_bytes("first.txt", vec![1u8; BLOCK_SIZE]),
                InputFile::from_bytes("second.txt", vec![2u8; BLOCK_SIZE]),
            ],
        )
        .unwrap();
        // point inode 3's direct[0] at inode 2's block
        let pos2 = inode_pos(&image, 2);
        let ino2 = Inode::decode(&image[pos2..pos2 + INODE_SIZE]);
        let pos3 = inode_pos(&image, 3);
        let mut ino3 = Inode::decode(&image[pos3..pos3 + INODE_SIZE]);
        ino3.direct[0] = ino2.direct[0];
        ino3.encode(&mut image[pos3..pos3 + INODE_SIZE]);

        let (report, output) = run_check(&mut image);
        assert!(!report.ok());
        assert!(output.contains("reusing block"), "output: {output}");
        assert!(output.contains("first.txt"), "output: {output}");
        assert!(output.contains("second.txt"), "output: {output}");
    }

    #[test]
    fn hole_in_file_warns_but_passes() {
        let mut image = build_image(
            &BuildParams::default(),
            &[InputFile::from_bytes("holey", vec![5u8; 3 * BLOCK_SIZE])],
        )
        .unwrap();
        let pos = inode_pos(&image, 2);
        let mut ino = Inode::decode(&image[pos..pos + INODE_SIZE]);
        ino.direct[1] = 0;
        ino.encode(&mut image[pos..pos + INODE_SIZE]);

        let (report, output) = run_check(&mut image);
        assert!(report.ok(), "holes are warnings: {output}");
        assert!(output.contains("hole in file"), "output: {output}");
        // the orphaned data block is still marked allocated
        assert!(
            output.contains("unreferenced block is marked allocated"),
            "output: {output}"
        );
    }

    #[test]
    fn lost_inode_is_reported() {
        let mut image = build_image(&BuildParams::default(), &[]).unwrap();
        let pos = inode_pos(&image, 5);
        let ino = Inode {
            itype: FileType::RAW_REGULAR,
            size: 0,
            nlink: 1,
            ..Inode::default()
        };
        ino.encode(&mut image[pos..pos + INODE_SIZE]);

        let (report, output) = run_check(&mut image);
        assert!(!report.ok());
        assert!(output.contains("lost inode appears live"), "output: {output}");
    }

    #[test]
    fn reserved_and_duplicate_names_are_reported() {
        let mut image = build_image(
            &BuildParams::default(),
            &[
                InputFile::from_bytes("a.txt", vec![1u8; 16]),
                InputFile::from_bytes("b.txt", vec![2u8; 16]),
            ],
        )
        .unwrap();
        let root = {
            let pos = inode_pos(&image, ROOT_INODE);
            Inode::decode(&image[pos..pos + INODE_SIZE])
        };
        let dir = root.direct[0] as usize * BLOCK_SIZE;
        // rename the second entry to collide with the first
        let first = DirEntry::decode(&image[dir..dir + DIRENT_SIZE]);
        let mut second =
            DirEntry::decode(&image[dir + DIRENT_SIZE..dir + 2 * DIRENT_SIZE]);
        second.name = first.name;
        second.encode(&mut image[dir + DIRENT_SIZE..dir + 2 * DIRENT_SIZE]);

        let (report, output) = run_check(&mut image);
        assert!(!report.ok());
        assert!(output.contains("reuses name"), "output: {output}");
    }

    #[test]
    fn directory_size_not_multiple_of_dirent_fails() {
        let mut image = build_image(&BuildParams::default(), &[]).unwrap();
        let pos = inode_pos(&image, ROOT_INODE);
        let mut root = Inode::decode(&image[pos..pos + INODE_SIZE]);
        root.size += 60;
        root.encode(&mut image[pos..pos + INODE_SIZE]);

        let (report, output) = run_check(&mut image);
        assert!(!report.ok());
        assert!(
            output.contains("not multiple of"),
            "output: {output}"
        );
    }

    #[test]
    fn short_image_is_padded_with_zero_blocks() {
        let mut image = build_image(&BuildParams::default(), &[]).unwrap();
        let sb = Superblock::decode(
            &image[SUPERBLOCK_OFFSET..SUPERBLOCK_OFFSET + Superblock::SIZE],
        );
        // emulate the builder's on-disk truncation: keep only used blocks
        image.truncate((sb.data_bn as usize + 1) * BLOCK_SIZE);
        let (report, output) = run_check(&mut image);
        assert!(report.ok(), "checker found: {output}");
    }
}
