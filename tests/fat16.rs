//! End-to-end FAT16 engine tests over RAM disks.
//!
//! Each case formats a fresh in-memory volume, runs real engine
//! operations against it and checks the on-disk outcome through the
//! public API (sizes, contents, listings, FAT mirror pairs).

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(opal_os::test_runner)]
#![reexport_test_harness_main = "test_main"]
#![allow(missing_docs)]
#![allow(clippy::missing_panics_doc)]

extern crate alloc;

use alloc::vec;
use alloc::vec::Vec;
use core::panic::PanicInfo;

use opal_os::block::RamDisk;
use opal_os::fat16::{self, Fat16, Fat16Error};

const DISK_SECTORS: usize = 4096;
const SECTORS_PER_CLUSTER: u8 = 4;
const CLUSTER_BYTES: usize = 2048;

#[unsafe(no_mangle)]
pub extern "C" fn kernel_main() -> ! {
    opal_os::allocator::init_heap();
    opal_os::init();

    test_main();

    opal_os::hlt_loop();
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    opal_os::test_panic_handler(info)
}

fn fresh_fs() -> Fat16<RamDisk> {
    let mut disk = RamDisk::new(DISK_SECTORS);
    fat16::format(&mut disk, DISK_SECTORS as u32, SECTORS_PER_CLUSTER);
    Fat16::mount(disk).expect("a freshly formatted volume mounts")
}

/// Number of clusters in the chain starting at `first`, and whether it
/// ends in a proper end-of-chain marker.
fn chain_shape(fs: &mut Fat16<RamDisk>, first: u16) -> (u32, bool) {
    let mut cluster = first;
    let mut count = 0;
    loop {
        count += 1;
        let (entry, _) = fs.fat_entry_pair(cluster);
        if entry >= 0xFFF8 {
            return (count, true);
        }
        if !(2..0xFFF8).contains(&entry) {
            return (count, false);
        }
        cluster = entry;
    }
}

#[test_case]
fn test_touch_write_read_roundtrip() {
    let mut fs = fresh_fs();

    fs.touch("/A.TXT").expect("touch creates the file");
    fs.write_file("/A.TXT", b"hi\n").expect("write succeeds");

    let mut buf = [0_u8; 10];
    let read = fs.read_at("/A.TXT", 0, &mut buf).expect("read succeeds");
    assert_eq!(read, 3, "All three bytes come back.");
    assert_eq!(&buf[..3], b"hi\n", "Contents round-trip.");
}

#[test_case]
fn test_touch_collision_fails() {
    let mut fs = fresh_fs();

    fs.touch("/A.TXT").expect("first touch succeeds");
    assert_eq!(
        fs.touch("/A.TXT"),
        Err(Fat16Error::AlreadyExists),
        "A colliding name is refused.",
    );
}

#[test_case]
fn test_empty_file_has_canonical_entry() {
    let mut fs = fresh_fs();

    fs.touch("/E.TXT").expect("touch succeeds");
    let entry = fs.stat("/E.TXT").expect("entry exists");
    assert_eq!(entry.size, 0, "Empty file has size 0.");
    assert_eq!(entry.first_cluster, 0, "Empty file has no chain.");
}

#[test_case]
fn test_mkdir_p_creates_each_level_and_is_idempotent() {
    let mut fs = fresh_fs();

    fs.mkdir_p("/USR/LIB/BIN").expect("mkdir -p succeeds");

    let usr = fs.list_names("/USR").expect("USR lists");
    assert!(usr.iter().any(|n| n == "LIB"), "/USR contains LIB.");
    let lib = fs.list_names("/USR/LIB").expect("LIB lists");
    assert!(lib.iter().any(|n| n == "BIN"), "/USR/LIB contains BIN.");

    fs.mkdir_p("/USR/LIB/BIN")
        .expect("re-running over existing directories is a no-op");
}

#[test_case]
fn test_mkdir_p_rejects_file_component() {
    let mut fs = fresh_fs();

    fs.touch("/USR").expect("file in the way");
    assert_eq!(
        fs.mkdir_p("/USR/LIB"),
        Err(Fat16Error::NotADirectory),
        "A file along the path is a hard failure.",
    );
}

#[test_case]
fn test_append_extends_content() {
    let mut fs = fresh_fs();

    fs.write_file("/L.TXT", b"abc").expect("write succeeds");
    fs.append_file("/L.TXT", b"DEF").expect("append succeeds");

    assert_eq!(fs.file_size("/L.TXT"), Ok(6), "Size covers both writes.");
    let mut buf = [0_u8; 16];
    let read = fs.read_at("/L.TXT", 0, &mut buf).expect("read succeeds");
    assert_eq!(&buf[..read], b"abcDEF", "Appended bytes follow the original.");
}

#[test_case]
fn test_append_across_cluster_boundary() {
    let mut fs = fresh_fs();

    let head: Vec<u8> = (0..2000_u32).map(|i| (i % 251) as u8).collect();
    let tail: Vec<u8> = (0..100_u32).map(|i| (i % 13) as u8).collect();

    fs.write_file("/B.BIN", &head).expect("write succeeds");
    fs.append_file("/B.BIN", &tail).expect("append succeeds");

    let data = fs.read_file("/B.BIN").expect("read back");
    assert_eq!(data.len(), 2100, "Total size spans the cluster boundary.");
    assert_eq!(&data[..2000], &head[..], "Head intact after tail fill.");
    assert_eq!(&data[2000..], &tail[..], "Tail lands after the head.");

    let entry = fs.stat("/B.BIN").expect("entry exists");
    let (clusters, terminated) = chain_shape(&mut fs, entry.first_cluster);
    assert_eq!(clusters, 2, "2100 bytes need two 2048-byte clusters.");
    assert!(terminated, "Chain ends in an end-of-chain marker.");
}

#[test_case]
fn test_write_chain_consistency() {
    let mut fs = fresh_fs();

    let data: Vec<u8> = (0..5000_u32).map(|i| (i % 199) as u8).collect();
    fs.write_file("/C.BIN", &data).expect("write succeeds");

    let entry = fs.stat("/C.BIN").expect("entry exists");
    assert!(entry.first_cluster >= 2, "Chain starts in the data region.");

    let (clusters, terminated) = chain_shape(&mut fs, entry.first_cluster);
    assert_eq!(
        clusters,
        (5000_u32).div_ceil(CLUSTER_BYTES as u32),
        "Exactly ceil(n / cluster_bytes) clusters.",
    );
    assert!(terminated, "Chain ends in an end-of-chain marker.");

    let read_back = fs.read_file("/C.BIN").expect("read back");
    assert_eq!(read_back, data, "Bytes 0..n equal the written data.");
}

#[test_case]
fn test_fat_mirror_invariant() {
    let mut fs = fresh_fs();

    fs.mkdir_p("/D1/D2").expect("directories allocate clusters");
    let data = vec![7_u8; 3 * CLUSTER_BYTES];
    fs.write_file("/D1/F.BIN", &data).expect("write succeeds");
    fs.append_file("/D1/F.BIN", b"tail").expect("append mutates the FAT");
    fs.rm("/D1/F.BIN").expect("rm frees the chain");

    for cluster in 2..64 {
        let (first, second) = fs.fat_entry_pair(cluster);
        assert_eq!(first, second, "FAT copies must agree on cluster {cluster}.");
    }
}

#[test_case]
fn test_rm_rf_deletes_everything() {
    let mut fs = fresh_fs();

    fs.mkdir_p("/T/A").expect("mkdir -p");
    fs.mkdir_p("/T/B").expect("mkdir -p");
    fs.mkdir("/T/C").expect("mkdir");
    fs.write_file("/T/A/F", b"one").expect("write");
    fs.write_file("/T/B/F", b"two").expect("write");

    let mut used = Vec::new();
    for path in ["/T", "/T/A", "/T/B", "/T/C", "/T/A/F", "/T/B/F"] {
        used.push(fs.stat(path).expect("exists before rm -r").first_cluster);
    }

    fs.rm_rf("/T").expect("rm -r succeeds");

    let root = fs.list_names("/").expect("root lists");
    assert!(!root.iter().any(|n| n == "T"), "T is gone from the root.");
    assert_eq!(
        fs.stat("/T"),
        Err(Fat16Error::NotFound),
        "The tree root entry is deleted.",
    );

    for cluster in used {
        if cluster >= 2 {
            let (first, second) = fs.fat_entry_pair(cluster);
            assert_eq!(first, 0, "Cluster {cluster} is free again.");
            assert_eq!(second, 0, "Mirror agrees cluster {cluster} is free.");
        }
    }
}

#[test_case]
fn test_rm_rf_refuses_root() {
    let mut fs = fresh_fs();
    assert_eq!(
        fs.rm_rf("/"),
        Err(Fat16Error::RootForbidden),
        "The root cannot be deleted.",
    );
}

#[test_case]
fn test_rm_rejects_directories() {
    let mut fs = fresh_fs();

    fs.mkdir("/D").expect("mkdir");
    assert_eq!(
        fs.rm("/D"),
        Err(Fat16Error::NotAFile),
        "rm is for files only.",
    );
}

#[test_case]
fn test_rmdir_requires_empty() {
    let mut fs = fresh_fs();

    fs.mkdir("/D").expect("mkdir");
    fs.touch("/D/F").expect("touch");
    assert_eq!(
        fs.rmdir("/D"),
        Err(Fat16Error::DirectoryNotEmpty),
        "A populated directory stays.",
    );

    fs.rm("/D/F").expect("rm the file");
    fs.rmdir("/D").expect("an empty directory (just . and ..) goes");
    assert_eq!(fs.stat("/D"), Err(Fat16Error::NotFound), "D is gone.");
}

#[test_case]
fn test_mv_renames_in_place() {
    let mut fs = fresh_fs();

    fs.write_file("/OLD.TXT", b"data").expect("write");
    fs.mv("/OLD.TXT", "/NEW.TXT").expect("rename succeeds");

    assert_eq!(fs.stat("/OLD.TXT"), Err(Fat16Error::NotFound), "Old name gone.");
    let data = fs.read_file("/NEW.TXT").expect("new name readable");
    assert_eq!(data, b"data", "Content survives a rename.");
}

#[test_case]
fn test_mv_into_directory_uses_basename() {
    let mut fs = fresh_fs();

    fs.mkdir("/DST").expect("mkdir");
    fs.write_file("/F.TXT", b"payload").expect("write");
    fs.mv("/F.TXT", "/DST").expect("move into directory");

    let data = fs.read_file("/DST/F.TXT").expect("file landed inside");
    assert_eq!(data, b"payload", "Content survives the move.");
    assert_eq!(fs.stat("/F.TXT"), Err(Fat16Error::NotFound), "Source gone.");
}

#[test_case]
fn test_mv_onto_existing_destination_fails() {
    let mut fs = fresh_fs();

    fs.write_file("/A", b"a").expect("write");
    fs.write_file("/B", b"b").expect("write");
    assert_eq!(
        fs.mv("/A", "/B"),
        Err(Fat16Error::AlreadyExists),
        "mv refuses to clobber.",
    );
}

#[test_case]
fn test_cp_refuses_directory_source() {
    let mut fs = fresh_fs();

    fs.mkdir("/D").expect("mkdir");
    assert_eq!(
        fs.cp("/D", "/E"),
        Err(Fat16Error::NotAFile),
        "Directories cannot be copied.",
    );
}

#[test_case]
fn test_cp_copies_content() {
    let mut fs = fresh_fs();

    fs.mkdir("/SUB").expect("mkdir");
    fs.write_file("/SRC.BIN", b"copy me").expect("write");
    fs.cp("/SRC.BIN", "/SUB").expect("copy into directory");

    assert_eq!(
        fs.read_file("/SUB/SRC.BIN").expect("copy readable"),
        b"copy me",
        "Copied bytes match.",
    );
    assert_eq!(
        fs.read_file("/SRC.BIN").expect("source still there"),
        b"copy me",
        "Source untouched.",
    );
}

#[test_case]
fn test_read_past_eof_returns_zero() {
    let mut fs = fresh_fs();

    fs.write_file("/S.TXT", b"xyz").expect("write");
    let mut buf = [0_u8; 8];
    assert_eq!(
        fs.read_at("/S.TXT", 100, &mut buf),
        Ok(0),
        "Reads past EOF succeed with zero bytes.",
    );
}

#[test_case]
fn test_read_at_offset_within_file() {
    let mut fs = fresh_fs();

    let data: Vec<u8> = (0..3000_u32).map(|i| (i % 97) as u8).collect();
    fs.write_file("/O.BIN", &data).expect("write");

    let mut buf = [0_u8; 200];
    let read = fs.read_at("/O.BIN", 2040, &mut buf).expect("offset read");
    assert_eq!(read, 200, "Full window available before EOF.");
    assert_eq!(&buf[..], &data[2040..2240], "Offset crossing a cluster edge.");
}

#[test_case]
fn test_list_dir_truncates_and_terminates() {
    let mut fs = fresh_fs();

    fs.touch("/AAAA.TXT").expect("touch");
    fs.touch("/BBBB.TXT").expect("touch");

    let mut small = [0xFF_u8; 6];
    let written = fs.list_dir("/", &mut small).expect("listing fits what it can");
    assert_eq!(written, 5, "Truncated to cap minus the terminator.");
    assert_eq!(small[5], 0, "Always NUL-terminated.");

    let mut big = [0_u8; 64];
    let written = fs.list_dir("/", &mut big).expect("full listing");
    let text = core::str::from_utf8(&big[..written]).expect("ASCII names");
    assert!(text.contains("AAAA.TXT\n"), "Each name ends its line.");
    assert!(text.contains("BBBB.TXT\n"), "Second entry listed too.");
}

#[test_case]
fn test_change_dir_and_relative_paths() {
    let mut fs = fresh_fs();

    fs.mkdir_p("/USR/LIB").expect("mkdir -p");
    fs.change_dir("/USR").expect("cd /USR");
    assert_eq!(fs.current_path(), "/USR", "cwd tracked.");

    fs.write_file("LIB/X.TXT", b"rel").expect("relative path resolves");
    assert_eq!(
        fs.read_file("/USR/LIB/X.TXT").expect("absolute sees it"),
        b"rel",
        "Relative writes land under the cwd.",
    );

    fs.change_dir("..").expect("cd ..");
    assert_eq!(fs.current_path(), "/", "Dot-dot pops to the root.");
    fs.change_dir("..").expect("cd .. at the root");
    assert_eq!(fs.current_path(), "/", "Dot-dot at the root stays put.");
}

#[test_case]
fn test_write_file_overwrite_shrinks_chain() {
    let mut fs = fresh_fs();

    let big = vec![1_u8; 3 * CLUSTER_BYTES];
    fs.write_file("/G.BIN", &big).expect("big write");
    fs.write_file("/G.BIN", b"small").expect("overwrite");

    let entry = fs.stat("/G.BIN").expect("entry exists");
    assert_eq!(entry.size, 5, "Size reflects the overwrite.");
    let (clusters, terminated) = chain_shape(&mut fs, entry.first_cluster);
    assert_eq!(clusters, 1, "Old chain freed, one cluster remains.");
    assert!(terminated, "Chain terminated.");
}
