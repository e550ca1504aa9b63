//! Write-ahead journal replay.
//!
//! The replayer consumes an in-memory copy of the journal region and
//! reconstructs the set of committed-but-incomplete writes that must be
//! applied to the main filesystem area. It runs in two phases:
//!
//! * **analyze** discovers metablocks, validates the metablock chain
//!   (sequence uniqueness, boundary monotonicity, transaction integrity)
//!   and marks superseded writes;
//! * **run** emits one [`ReplaySink::write_block`] per surviving
//!   reference, followed by exactly one
//!   [`ReplaySink::write_replay_complete`], which the host uses to zero
//!   the journal region.
//!
//! Recoverable problems (a damaged metablock, a data block with a bad
//! checksum) flag the metablock erroneous and replay proceeds without it.
//! Anything that breaks the chain invariants aborts replay before a
//! single write is emitted, so a corrupted journal cannot damage the
//! filesystem.

use crate::crc::crc32c;
use crate::fs::layout::{
    is_potential_metablock, BlockNum, MetaBlock, MetaFlags, RefFlags, Tid,
    BLOCK_SIZE, REF_SIZE,
};

/// Callbacks invoked by the replayer.
///
/// `analyze` reports through [`message`](ReplaySink::message) and
/// [`error`](ReplaySink::error); `run` delivers the replayed writes.
pub trait ReplaySink {
    /// Report a progress message at journal block index `bi`.
    fn message(&mut self, bi: usize, text: &str) {
        let _ = (bi, text);
    }

    /// Report an error at journal block index `bi`.
    fn error(&mut self, bi: usize, text: &str);

    /// Write the 4096 bytes in `data` to block number `bn`.
    fn write_block(&mut self, bn: BlockNum, data: &[u8]);

    /// Called exactly once at the end of `run()`. The host is expected to
    /// zero the journal region on disk and flush.
    fn write_replay_complete(&mut self);
}

struct MetaRef {
    bi: usize,
    mb: MetaBlock,
}

/// The journal replayer.
///
/// Borrows the journal image for its lifetime; `analyze` must succeed
/// before `run` may be called.
pub struct JournalReplayer<'a> {
    jd: &'a [u8],
    nb: usize,
    metas: Vec<MetaRef>,
    ok: bool,
    analyzed: bool,
}

impl<'a> JournalReplayer<'a> {
    /// Creates a replayer over a journal image of whole blocks.
    pub fn new(jd: &'a [u8]) -> JournalReplayer<'a> {
        assert!(jd.len() % BLOCK_SIZE == 0);
        JournalReplayer {
            jd,
            nb: jd.len() / BLOCK_SIZE,
            metas: Vec::new(),
            ok: true,
            analyzed: false,
        }
    }

    fn block(&self, bi: usize) -> &[u8] {
        &self.jd[bi * BLOCK_SIZE..(bi + 1) * BLOCK_SIZE]
    }

    /// Analyzes the journal. Returns true iff the journal holds at least
    /// one metablock and every chain invariant holds, in which case
    /// [`run`](JournalReplayer::run) may be called.
    pub fn analyze(&mut self, sink: &mut dyn ReplaySink) -> bool {
        assert!(!self.analyzed);
        self.analyzed = true;

        // analyze block contents
        for bi in 0..self.nb {
            self.analyze_block(bi, sink);
        }
        if !self.ok || self.metas.is_empty() {
            return false;
        }

        // check metablock invariants
        // 1. No sequence number duplicates.
        // 2. `commit_boundary` monotonically increases.
        // 3. `complete_boundary` monotonically increases.
        // 4. `complete_boundary <= commit_boundary`.
        // 5. Completed tids are < `complete_boundary`.
        // 6. Committed tids are < `commit_boundary`.
        for mi in 0..self.metas.len() {
            let cur = &self.metas[mi].mb;
            let bi = self.metas[mi].bi;
            if mi != 0 {
                let last = &self.metas[mi - 1].mb;
                if cur.seq == last.seq {
                    sink.error(bi, "duplicate journal seqno");
                    self.ok = false;
                }
                if cur.commit_boundary.lt(last.commit_boundary) {
                    sink.error(bi, "journal commit_boundary backtracked");
                    self.ok = false;
                }
                if cur.complete_boundary.lt(last.complete_boundary) {
                    sink.error(bi, "journal complete_boundary backtracked");
                    self.ok = false;
                }
                if cur.nref > 0 && cur.tid.lt(last.commit_boundary) {
                    sink.error(bi, "journal adds data to a committed transaction");
                    self.ok = false;
                }
            }
            if cur.complete_boundary.gt(cur.commit_boundary) {
                sink.error(bi, "journal complete_boundary above commit_boundary");
                self.ok = false;
            }
            if cur.nref > 0 && cur.tid.lt(cur.complete_boundary) {
                sink.error(bi, "journal adds data to a completed transaction");
                self.ok = false;
            }
            if cur.flags.contains(MetaFlags::COMPLETE)
                && cur.tid.ge(cur.complete_boundary)
            {
                sink.error(bi, "completed transaction above complete_boundary");
                self.ok = false;
            }
            if cur.flags.contains(MetaFlags::COMMIT)
                && cur.tid.ge(cur.commit_boundary)
            {
                sink.error(bi, "committed transaction above commit_boundary");
                self.ok = false;
            }
        }
        if !self.ok {
            return false;
        }

        // Check transactions.
        // Every transaction in the region [complete_boundary,
        // commit_boundary) must be completely contained in the log, and
        // have a commit record but no complete record. The last valid
        // metablock has the relevant boundaries.
        let last = &self.metas[self.metas.len() - 1].mb;
        let complete_boundary = last.complete_boundary;
        let commit_boundary = last.commit_boundary;
        let mut tid = complete_boundary;
        while tid != commit_boundary {
            self.analyze_tid(tid, sink);
            tid = tid.next();
        }

        // Mark all but the latest write to each data block as overwritten,
        // so that previous writes are ignored.
        for mx in (1..=self.metas.len()).rev() {
            let tid = self.metas[mx - 1].mb.tid;
            if tid.ge(complete_boundary) && tid.lt(commit_boundary) {
                self.analyze_overwritten_blocks(mx);
            }
        }

        self.ok
    }

    fn analyze_block(&mut self, bi: usize, sink: &mut dyn ReplaySink) {
        if !is_potential_metablock(self.block(bi)) {
            return;
        }
        let mut mb = MetaBlock::decode(self.block(bi));

        // check flags
        if mb.flags.intersects(MetaFlags::ERROR | MetaFlags::CORRUPT) {
            sink.error(bi, "metablock marked jf_error (recoverable)");
            mb.flags |= MetaFlags::ERROR;
        }
        if !mb.flags.contains(MetaFlags::META) {
            sink.error(bi, "metablock not marked with jf_meta (recoverable)");
            mb.flags |= MetaFlags::ERROR;
        }
        if usize::from(mb.nref) > REF_SIZE {
            sink.error(bi, "metablock has too many refs (recoverable)");
            mb.flags |= MetaFlags::ERROR;
        }

        // check data checksums
        let mut delta = 1;
        for refi in 0..mb.refs.len() {
            let r = mb.refs[refi];
            if r.bflags.contains(RefFlags::NONJOURNALED) {
                continue;
            }
            if delta >= self.nb {
                sink.error(bi, "too many referenced datablocks");
                self.ok = false;
            }
            let dbi = (bi + delta) % self.nb;
            let djd = self.block(dbi);
            if is_potential_metablock(djd) && !r.bflags.contains(RefFlags::ESCAPED) {
                sink.error(dbi, "referenced datablock looks like metablock (recoverable)");
                mb.flags |= MetaFlags::ERROR;
            } else if r.bchecksum != crate::fs::layout::NO_CHECKSUM
                && r.bchecksum != crc32c(djd)
            {
                sink.error(dbi, "referenced datablock has bad checksum (recoverable)");
                mb.flags |= MetaFlags::ERROR;
            }
            delta += 1;
        }

        // add non-erroneous metablocks to the list in sequence order
        if !mb.flags.contains(MetaFlags::ERROR) {
            let mut x = 0;
            while x != self.metas.len() && mb.seq.ge(self.metas[x].mb.seq) {
                x += 1;
            }
            self.metas.insert(x, MetaRef { bi, mb });
        }
    }

    fn analyze_tid(&mut self, tid: Tid, sink: &mut dyn ReplaySink) {
        let mut flags = MetaFlags::empty();

        for mi in 0..self.metas.len() {
            let mb = &self.metas[mi].mb;
            let bi = self.metas[mi].bi;
            if !flags.is_empty()
                && !flags.contains(MetaFlags::COMMIT)
                && mb.seq != self.metas[mi - 1].mb.seq.next()
            {
                sink.error(bi, "missing seq number in committable region");
                self.ok = false;
            }
            if mb.tid == tid {
                if mb.flags.contains(MetaFlags::START) != flags.is_empty() {
                    sink.error(bi, "jf_start flag in improper place");
                    self.ok = false;
                }
                if flags.contains(MetaFlags::COMMIT) && mb.nref != 0 {
                    sink.error(bi, "transaction continues after jf_commit");
                    self.ok = false;
                }
                if flags.contains(MetaFlags::COMPLETE) {
                    sink.error(bi, "transaction continues after jf_complete");
                    self.ok = false;
                }
                if mb.flags.contains(MetaFlags::COMPLETE) {
                    sink.error(bi, "transaction completes below complete_boundary");
                    self.ok = false;
                }
                flags |= mb.flags;
            }
        }

        if !flags.contains(MetaFlags::COMMIT) {
            sink.error(0, "missing committed transaction in committable region");
            self.ok = false;
        }
    }

    fn analyze_overwritten_blocks(&mut self, mx: usize) {
        for refx in (0..self.metas[mx - 1].mb.refs.len()).rev() {
            let r = self.metas[mx - 1].mb.refs[refx];
            if !r.bflags.contains(RefFlags::OVERWRITTEN) {
                self.mark_overwritten_block(r.bn, mx, refx);
            }
        }
    }

    // Marks every reference to `bn` strictly before (`mx`, `refx`) as
    // overwritten, across all metablocks and transactions.
    fn mark_overwritten_block(&mut self, bn: BlockNum, mx: usize, refx: usize) {
        let mut mx = mx;
        let mut refx = refx;
        loop {
            let mb = &mut self.metas[mx - 1].mb;
            let upper = refx.min(mb.refs.len());
            for r in &mut mb.refs[..upper] {
                if r.bn == bn {
                    r.bflags |= RefFlags::OVERWRITTEN;
                }
            }
            if mx == 1 {
                break;
            }
            mx -= 1;
            refx = usize::MAX;
        }
    }

    /// Replays the journal by invoking the sink's write callbacks.
    ///
    /// # Panics
    ///
    /// Panics if `analyze` has not succeeded.
    pub fn run(&self, sink: &mut dyn ReplaySink) {
        assert!(self.analyzed && self.ok && !self.metas.is_empty());
        let last = &self.metas[self.metas.len() - 1].mb;
        let complete_boundary = last.complete_boundary;
        let commit_boundary = last.commit_boundary;

        for mr in &self.metas {
            let mb = &mr.mb;
            if !(mb.tid.ge(complete_boundary) && mb.tid.lt(commit_boundary)) {
                continue;
            }
            let mut delta = 1;
            for r in &mb.refs {
                if !r.bflags.contains(RefFlags::OVERWRITTEN)
                    && !r.bflags.contains(RefFlags::NONJOURNALED)
                {
                    let dbi = (mr.bi + delta) % self.nb;
                    let mut data = [0u8; BLOCK_SIZE];
                    data.copy_from_slice(self.block(dbi));
                    if r.bflags.contains(RefFlags::ESCAPED) {
                        MetaBlock::unescape(&mut data);
                    }
                    sink.write_block(r.bn, &data);
                }
                if !r.bflags.contains(RefFlags::NONJOURNALED) {
                    delta += 1;
                }
            }
        }
        sink.write_replay_complete();
    }
}
