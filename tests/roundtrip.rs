//! End-to-end scenarios: build an image, check it, mount it, read it
//! back, and recover it through the journal.

use std::sync::Arc;

use chickadeefs::check::{check_image, CheckOptions};
use chickadeefs::crc::crc32c;
use chickadeefs::fs::layout::{
    BlockRef, MetaBlock, MetaFlags, OnDisk, RefFlags, Superblock, Tid,
    BLOCK_SIZE, MAX_DIRECT_SIZE, SUPERBLOCK_OFFSET,
};
use chickadeefs::fs::state::FsState;
use chickadeefs::fs::{BlockDevice, MemDisk};
use chickadeefs::mkfs::{build_image, BuildParams, InputFile};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn decoded_sb(image: &[u8]) -> Superblock {
    Superblock::decode(&image[SUPERBLOCK_OFFSET..SUPERBLOCK_OFFSET + Superblock::SIZE])
}

fn check_ok(image: &Vec<u8>) -> (bool, String) {
    let mut copy = image.clone();
    let mut out = Vec::new();
    let report = check_image(&mut copy, &CheckOptions::default(), &mut out);
    (report.ok(), String::from_utf8(out).unwrap())
}

#[test]
fn built_image_with_small_file_checks_and_reads() {
    let contents = b"Nothing is at last sacred but the integrity \
                     of your own mind. Absolve you to yourself, and \
                     you shall have the suffrage of the world."
        .to_vec();
    assert!(contents.len() >= 130);
    let contents = contents[..130].to_vec();

    let image = build_image(
        &BuildParams::default(),
        &[InputFile::from_bytes("emerson.txt", contents.clone())],
    )
    .unwrap();

    let (ok, output) = check_ok(&image);
    assert!(ok, "checker found: {output}");

    let disk = Arc::new(MemDisk::new(image).unwrap()) as Arc<dyn BlockDevice>;
    let fs = FsState::mount(disk).unwrap();
    let mut buf = vec![0u8; 130];
    let n = fs.read_file_data(b"emerson.txt", &mut buf, 0).unwrap();
    assert_eq!(n, 130);
    assert_eq!(buf, contents);
}

#[test]
fn random_files_survive_build_check_mount() {
    let mut rng = StdRng::seed_from_u64(0x5EED);
    let mut files = Vec::new();
    let sizes = [
        1,
        517,
        BLOCK_SIZE,
        3 * BLOCK_SIZE + 9,
        MAX_DIRECT_SIZE + 5 * BLOCK_SIZE + 1,
    ];
    for (i, &sz) in sizes.iter().enumerate() {
        let mut data = vec![0u8; sz];
        rng.fill(&mut data[..]);
        files.push(InputFile::from_bytes(&format!("file{i}.bin"), data));
    }

    let params = BuildParams {
        nblocks: 2048,
        ..BuildParams::default()
    };
    let image = build_image(&params, &files).unwrap();

    let (ok, output) = check_ok(&image);
    assert!(ok, "checker found: {output}");

    let disk = Arc::new(MemDisk::new(image).unwrap()) as Arc<dyn BlockDevice>;
    let fs = FsState::mount(disk).unwrap();
    for (i, file) in files.iter().enumerate() {
        let mut buf = vec![0u8; file.data.len()];
        let n = fs
            .read_file_data(format!("file{i}.bin").as_bytes(), &mut buf, 0)
            .unwrap();
        assert_eq!(n, file.data.len(), "length mismatch for file{i}");
        assert_eq!(buf, file.data, "content mismatch for file{i}");
    }
}

#[test]
fn checker_recovers_journaled_image() {
    // Build an image with a journal, then simulate a crash between
    // commit and complete: the data area still has the old bytes, and
    // the journal carries the committed new version.
    let params = BuildParams {
        njournal: 16,
        ..BuildParams::default()
    };
    let mut image = build_image(
        &params,
        &[InputFile::from_bytes("db.log", vec![0xAAu8; 2 * BLOCK_SIZE])],
    )
    .unwrap();
    let sb = decoded_sb(&image);
    let target = sb.data_bn + 1; // second block of db.log

    let mut newdata = [0xBBu8; BLOCK_SIZE];
    newdata[0] = 1;
    let mb = MetaBlock {
        seq: Tid(7),
        tid: Tid(2),
        commit_boundary: Tid(3),
        complete_boundary: Tid(2),
        flags: MetaFlags::META | MetaFlags::START | MetaFlags::COMMIT,
        nref: 1,
        refs: vec![BlockRef {
            bn: target,
            bchecksum: crc32c(&newdata),
            bflags: RefFlags::empty(),
        }],
    };
    let jstart = sb.journal_bn as usize * BLOCK_SIZE;
    mb.encode(&mut image[jstart..jstart + BLOCK_SIZE]);
    image[jstart + BLOCK_SIZE..jstart + 2 * BLOCK_SIZE].copy_from_slice(&newdata);

    // the checker replays the journal before walking the image
    let mut out = Vec::new();
    let report = check_image(&mut image, &CheckOptions::default(), &mut out);
    assert!(
        report.ok(),
        "checker found: {}",
        String::from_utf8_lossy(&out)
    );

    // recovery applied the committed write and zeroed the journal
    let off = target as usize * BLOCK_SIZE;
    assert_eq!(&image[off..off + BLOCK_SIZE], &newdata[..]);
    assert!(image[jstart..].iter().all(|&b| b == 0));

    // the recovered image mounts and serves the new contents
    let disk = Arc::new(MemDisk::new(image).unwrap()) as Arc<dyn BlockDevice>;
    let fs = FsState::mount(disk).unwrap();
    let mut buf = vec![0u8; BLOCK_SIZE];
    let n = fs
        .read_file_data(b"db.log", &mut buf, BLOCK_SIZE)
        .unwrap();
    assert_eq!(n, BLOCK_SIZE);
    assert_eq!(buf, newdata);
}

#[test]
fn corrupt_journal_does_not_damage_the_image() {
    let params = BuildParams {
        njournal: 8,
        ..BuildParams::default()
    };
    let mut image = build_image(
        &params,
        &[InputFile::from_bytes("keep.txt", vec![0x42u8; BLOCK_SIZE])],
    )
    .unwrap();
    let sb = decoded_sb(&image);
    let target = sb.data_bn;

    // a committed transaction whose data block fails its checksum
    let mb = MetaBlock {
        seq: Tid(0),
        tid: Tid(1),
        commit_boundary: Tid(2),
        complete_boundary: Tid(1),
        flags: MetaFlags::META | MetaFlags::START | MetaFlags::COMMIT,
        nref: 1,
        refs: vec![BlockRef {
            bn: target,
            bchecksum: 0x0BAD_0BAD,
            bflags: RefFlags::empty(),
        }],
    };
    let jstart = sb.journal_bn as usize * BLOCK_SIZE;
    mb.encode(&mut image[jstart..jstart + BLOCK_SIZE]);
    image[jstart + BLOCK_SIZE..jstart + 2 * BLOCK_SIZE].fill(0x99);

    let before = image[target as usize * BLOCK_SIZE..(target as usize + 1) * BLOCK_SIZE]
        .to_vec();
    let mut out = Vec::new();
    let report = check_image(&mut image, &CheckOptions::default(), &mut out);
    let output = String::from_utf8_lossy(&out);

    // the journal errors are reported, but the data area is untouched
    assert!(!report.ok(), "journal corruption must be an error");
    assert!(output.contains("journal block"), "output: {output}");
    assert_eq!(
        &image[target as usize * BLOCK_SIZE..(target as usize + 1) * BLOCK_SIZE],
        &before[..]
    );
}

#[test]
fn mount_after_build_exposes_consistent_superblock() {
    let params = BuildParams {
        nblocks: 512,
        nswap: 4,
        njournal: 32,
        ..BuildParams::default()
    };
    let image = build_image(&params, &[]).unwrap();
    let sb = decoded_sb(&image);

    let disk = Arc::new(MemDisk::new(image).unwrap()) as Arc<dyn BlockDevice>;
    let fs = FsState::mount(disk).unwrap();
    let mounted = fs.superblock();
    assert_eq!(*mounted, sb);
    assert_eq!(mounted.nswap, 4);
    assert_eq!(mounted.swap_bn, 1);
    assert_eq!(mounted.fbb_bn, 5);
    assert_eq!(mounted.journal_bn, 512 - 32);
}
