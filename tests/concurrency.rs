//! Several threads on one filesystem, with the cache ager running.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use vdfs::{FileSystem, FsConfig, FsError, BSIZE, ROOTINO};

fn formatted(num_blocks: usize) -> Arc<FileSystem> {
    let _ = env_logger::builder().is_test(true).try_init();
    // a fast ager and a small cache to push evictions and aging into the mix
    let config = FsConfig {
        cache_capacity: 4,
        time_unit: Duration::from_millis(1),
        io_delay: Duration::from_micros(20),
        ..Default::default()
    };
    let fs = FileSystem::with_config(num_blocks, config).expect("new fs");
    fs.format().expect("format");
    Arc::new(fs)
}

#[test]
fn writers_in_separate_directories() {
    let fs = formatted(256);
    let barrier = Arc::new(Barrier::new(4));
    let handles: Vec<_> = (0..4u8)
        .map(|t| {
            let fs = fs.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                let dir = fs.mkdir(ROOTINO, &format!("t{t}")).expect("mkdir");
                for i in 0..5u8 {
                    let f = fs.create(dir, &format!("f{i}")).expect("create");
                    let data = vec![t * 16 + i; BSIZE + i as usize];
                    fs.write(f, 0, &data).expect("write");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("writer");
    }

    for t in 0..4u8 {
        for i in 0..5u8 {
            let f = fs.lookup(&format!("/t{t}/f{i}")).expect("lookup");
            let data = fs.read(f, 0, 2 * BSIZE).expect("read");
            assert_eq!(data, vec![t * 16 + i; BSIZE + i as usize]);
        }
    }
}

#[test]
fn readers_see_whole_directories() {
    let fs = formatted(128);
    let d = fs.mkdir(ROOTINO, "d").expect("mkdir");
    let stop = Arc::new(AtomicBool::new(false));
    let reads = Arc::new(AtomicUsize::new(0));

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let fs = fs.clone();
            let stop = stop.clone();
            let reads = reads.clone();
            thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    let entries = fs.readdir(d, usize::MAX).expect("readdir");
                    let attrs = fs.get_attrs(d).expect("attrs");
                    // every listed entry is complete and resolvable
                    for entry in &entries {
                        assert!(entry.name.starts_with('n'), "torn entry {:?}", entry.name);
                    }
                    assert!(entries.len() <= 40);
                    assert!(attrs.entries.unwrap_or(0) <= 40);
                    reads.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();

    for round in 0..2 {
        for i in 0..40 {
            fs.create(d, &format!("n{i}")).expect("create");
        }
        for i in (0..40).rev().step_by(1 + round) {
            fs.remove(d, &format!("n{i}")).expect("remove");
        }
        for name in fs.readdir(d, usize::MAX).expect("readdir") {
            fs.remove(d, &name.name).expect("remove rest");
        }
    }
    stop.store(true, Ordering::SeqCst);
    for reader in readers {
        reader.join().expect("reader");
    }
    assert!(reads.load(Ordering::SeqCst) > 0);
    assert!(fs.readdir(d, 10).expect("readdir").is_empty());
}

#[test]
fn reads_stay_correct_across_defrag() {
    let fs = formatted(128);
    let mut files = Vec::new();
    for i in 0..6u8 {
        let f = fs.create(ROOTINO, &format!("f{i}")).expect("create");
        fs.write(f, 0, &vec![i + 1; 2 * BSIZE]).expect("write");
        files.push((f, i + 1));
    }
    for i in [1u8, 3] {
        fs.remove(ROOTINO, &format!("f{i}")).expect("remove");
    }
    files.retain(|&(_, fill)| fill != 2 && fill != 4);

    let stop = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..3)
        .map(|_| {
            let fs = fs.clone();
            let stop = stop.clone();
            let files = files.clone();
            thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    for &(f, fill) in &files {
                        let data = fs.read(f, 0, 2 * BSIZE).expect("read");
                        assert!(data.iter().all(|&b| b == fill), "file {f} corrupted");
                    }
                }
            })
        })
        .collect();

    for _ in 0..3 {
        match fs.defrag() {
            Ok(_) | Err(FsError::Busy) => {}
            Err(e) => panic!("defrag: {e}"),
        }
        thread::sleep(Duration::from_millis(5));
    }
    stop.store(true, Ordering::SeqCst);
    for reader in readers {
        reader.join().expect("reader");
    }
}

#[test]
fn overlapping_defrags_are_busy_or_succeed() {
    let fs = formatted(128);
    for i in 0..8u8 {
        let f = fs.create(ROOTINO, &format!("f{i}")).expect("create");
        fs.write(f, 0, &vec![i; 3 * BSIZE]).expect("write");
    }
    for i in (0..8u8).step_by(2) {
        fs.remove(ROOTINO, &format!("f{i}")).expect("remove");
    }

    let barrier = Arc::new(Barrier::new(4));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let fs = fs.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                fs.defrag()
            })
        })
        .collect();

    let mut ok = 0;
    for handle in handles {
        match handle.join().expect("defrag thread") {
            Ok(_) => ok += 1,
            Err(FsError::Busy) => {}
            Err(e) => panic!("defrag: {e}"),
        }
    }
    assert!(ok >= 1);
    for i in (1..8u8).step_by(2) {
        let f = fs.lookup(&format!("/f{i}")).expect("lookup");
        assert_eq!(fs.read(f, 0, 3 * BSIZE).expect("read"), vec![i; 3 * BSIZE]);
    }
}

#[test]
fn aging_writes_back_in_the_background() {
    let fs = formatted(64);
    let f = fs.create(ROOTINO, "f").expect("create");
    fs.write(f, 0, b"flushed by the ager").expect("write");

    for _ in 0..500 {
        if fs.cached_blocks() == 0 {
            break;
        }
        thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(fs.cached_blocks(), 0);

    let usage = fs.disk_usage().expect("usage");
    let block = usage
        .iter()
        .find(|u| u.paths.iter().any(|p| p == "/f"))
        .expect("block of /f")
        .block;
    let on_disk = fs.disk_block(block).expect("read disk");
    assert_eq!(&on_disk[..19], b"flushed by the ager");
}
