//! Saving a filesystem to an image file and opening it again.

use std::fs::File;
use std::io::Write;

use std::path::Path;

use vdfs::{BlockStore, FileSystem, FsConfig, FsError, BSIZE, DATA_START, ITAB_START, ROOTINO};

fn config() -> FsConfig {
    let _ = env_logger::builder().is_test(true).try_init();
    FsConfig {
        background_aging: false,
        ..Default::default()
    }
}

/// image header, then the blocks
const HEADER: usize = 8;

fn inode_offset(ino: usize) -> usize {
    HEADER + ITAB_START * BSIZE + ino * 64
}

/// Overwrites `bytes` at `offset` of the image file.
fn patch(path: &Path, offset: usize, bytes: &[u8]) {
    let mut raw = std::fs::read(path).expect("read image");
    raw[offset..offset + bytes.len()].copy_from_slice(bytes);
    std::fs::write(path, raw).expect("write image");
}

/// Root directory holding file "f" (inode 2) of two blocks.
/// The root's entries sit in the first data block.
fn saved_tree(path: &Path) {
    let fs = FileSystem::with_config(64, config()).expect("new fs");
    fs.format().expect("format");
    let f = fs.create(ROOTINO, "f").expect("create");
    assert_eq!(f, 2);
    fs.write(f, 0, &[7u8; BSIZE + 1]).expect("write");
    fs.save(path).expect("save");
}

fn open_fails(path: &Path) -> bool {
    matches!(FileSystem::open(path, config()), Err(FsError::BadImage(_)))
}

#[test]
fn tree_survives_save_and_open() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("disk.img");

    {
        let fs = FileSystem::with_config(64, config()).expect("new fs");
        fs.format().expect("format");
        let d = fs.mkdir(ROOTINO, "etc").expect("mkdir");
        let f = fs.create(d, "motd").expect("create");
        // stays in the cache until save
        fs.write(f, 0, b"welcome back").expect("write");
        fs.save(&path).expect("save");
    }

    let fs = FileSystem::open(&path, config()).expect("open");
    assert_eq!(fs.num_blocks(), 64);
    let f = fs.lookup("/etc/motd").expect("lookup");
    assert_eq!(fs.read(f, 0, 64).expect("read"), b"welcome back");
    let names: Vec<String> = fs
        .readdir(ROOTINO, 8)
        .expect("readdir")
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, ["etc"]);
}

#[test]
fn sharing_is_recounted_on_open() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("cow.img");

    {
        let fs = FileSystem::with_config(64, config()).expect("new fs");
        fs.format().expect("format");
        let a = fs.create(ROOTINO, "a").expect("create");
        fs.write(a, 0, b"original").expect("write");
        fs.copy(ROOTINO, "a", ROOTINO, "b").expect("copy");
        fs.save(&path).expect("save");
    }

    let fs = FileSystem::open(&path, config()).expect("open");
    let a = fs.lookup("/a").expect("lookup a");
    let b = fs.lookup("/b").expect("lookup b");
    let free = fs.free_blocks();

    fs.write(b, 0, b"O").expect("write b");
    assert_eq!(fs.free_blocks(), free - 1);
    assert_eq!(fs.read(a, 0, 8).expect("read a"), b"original");
    assert_eq!(fs.read(b, 0, 8).expect("read b"), b"Original");

    fs.remove(ROOTINO, "a").expect("remove a");
    assert_eq!(fs.read(b, 0, 8).expect("read b"), b"Original");
}

#[test]
fn images_with_the_wrong_geometry_are_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");

    let small_blocks = dir.path().join("small.img");
    BlockStore::new(32, 256)
        .expect("store")
        .store(&small_blocks)
        .expect("write image");
    assert!(matches!(
        FileSystem::open(&small_blocks, config()),
        Err(FsError::BadImage(_))
    ));

    let too_few = dir.path().join("few.img");
    BlockStore::new(4, BSIZE)
        .expect("store")
        .store(&too_few)
        .expect("write image");
    assert!(matches!(
        FileSystem::open(&too_few, config()),
        Err(FsError::BadImage(_))
    ));

    let truncated = dir.path().join("cut.img");
    let mut file = File::create(&truncated).expect("create");
    file.write_all(&(BSIZE as u32).to_le_bytes()).expect("header");
    file.write_all(&16u32.to_le_bytes()).expect("header");
    file.write_all(&[0u8; 100]).expect("partial block");
    drop(file);
    assert!(matches!(
        FileSystem::open(&truncated, config()),
        Err(FsError::BadImage(_))
    ));

    let huge = dir.path().join("huge.img");
    let mut file = File::create(&huge).expect("create");
    file.write_all(&u32::MAX.to_le_bytes()).expect("header");
    file.write_all(&u32::MAX.to_le_bytes()).expect("header");
    file.write_all(&[0u8; BSIZE]).expect("one block");
    drop(file);
    assert!(matches!(
        FileSystem::open(&huge, config()),
        Err(FsError::BadImage(_))
    ));

    assert!(matches!(
        FileSystem::open(dir.path().join("missing.img"), config()),
        Err(FsError::Io(_))
    ));
}

#[test]
fn unformatted_image_opens_empty() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("blank.img");
    BlockStore::new(32, BSIZE)
        .expect("store")
        .store(&path)
        .expect("write image");

    let fs = FileSystem::open(&path, config()).expect("open");
    assert!(matches!(fs.lookup("/"), Err(FsError::NotFound(_))));
    fs.format().expect("format");
    assert_eq!(fs.lookup("/").expect("root"), ROOTINO);
}

#[test]
fn saved_tree_opens_before_patching() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("ok.img");
    saved_tree(&path);
    let fs = FileSystem::open(&path, config()).expect("open");
    assert_eq!(fs.lookup("/f").expect("lookup"), 2);
}

#[test]
fn oversized_inode_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("big.img");
    saved_tree(&path);
    patch(&path, inode_offset(ROOTINO as usize) + 4, &100_000u32.to_le_bytes());
    assert!(open_fails(&path));
}

#[test]
fn directory_with_a_partial_entry_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("partial.img");
    saved_tree(&path);
    patch(&path, inode_offset(ROOTINO as usize) + 4, &17u32.to_le_bytes());
    assert!(open_fails(&path));
}

#[test]
fn used_inode_without_a_kind_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("kindless.img");
    saved_tree(&path);
    patch(&path, inode_offset(2), &0u32.to_le_bytes());
    assert!(open_fails(&path));
}

#[test]
fn block_addresses_must_be_allocated_data_blocks() {
    let dir = tempfile::tempdir().expect("tempdir");

    let beyond = dir.path().join("beyond.img");
    saved_tree(&beyond);
    patch(&beyond, inode_offset(2) + 8, &999u32.to_le_bytes());
    assert!(open_fails(&beyond));

    let meta = dir.path().join("meta.img");
    saved_tree(&meta);
    patch(&meta, inode_offset(2) + 12, &(ITAB_START as u32).to_le_bytes());
    assert!(open_fails(&meta));

    let free = dir.path().join("free.img");
    saved_tree(&free);
    patch(&free, inode_offset(2) + 8, &40u32.to_le_bytes());
    assert!(open_fails(&free));
}

#[test]
fn entry_naming_a_bad_inode_is_an_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("dangling.img");
    saved_tree(&path);
    // inode number of the first entry, after its 14-byte name
    patch(&path, HEADER + DATA_START * BSIZE + 14, &500u16.to_le_bytes());

    let fs = FileSystem::open(&path, config()).expect("open");
    assert!(matches!(fs.readdir(ROOTINO, 8), Err(FsError::BadImage(_))));
    assert!(matches!(fs.lookup("/f"), Err(FsError::BadImage(_))));
    assert!(matches!(fs.disk_usage(), Err(FsError::BadImage(_))));
}
