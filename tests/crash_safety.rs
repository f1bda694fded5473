//! # Crash Safety Tests
//!
//! The book-keeping file is the commit marker: a fragment directory
//! without one is invisible no matter how much tile data it holds, a
//! corrupt one is skipped with the rest of the array still readable, and
//! `sync` makes a prefix of a still-open fragment durable and visible.

use gridstore::{ArraySchema, Config, Datatype, Mode, ReadStatus, StorageManager};
use tempfile::tempdir;

fn i32s(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn as_i32s(bytes: &[u8]) -> Vec<i32> {
    bytes
        .chunks_exact(4)
        .map(|c| i32::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

fn points_schema() -> ArraySchema {
    ArraySchema::sparse("points")
        .coords_type(Datatype::Int32)
        .dimension("x", 0, 3)
        .dimension("y", 0, 3)
        .capacity(2)
        .attribute("a", Datatype::Int32)
        .build()
        .unwrap()
}

fn read_values(mgr: &StorageManager) -> Vec<i32> {
    let mut array = mgr.array_init("points", Mode::Read, None, None).unwrap();
    let mut a = vec![0u8; 256];
    let mut c = vec![0u8; 256];
    let mut sizes = [0usize; 2];
    let status = array
        .read(&mut [a.as_mut_slice(), c.as_mut_slice()], &mut sizes)
        .unwrap();
    assert_eq!(status, ReadStatus::Completed);
    as_i32s(&a[..sizes[0]])
}

#[test]
fn abandoned_write_leaves_the_array_unchanged() {
    let dir = tempdir().unwrap();
    let ws = dir.path().join("ws");
    let mgr = StorageManager::init(&ws, Config::default()).unwrap();
    mgr.array_create(&points_schema()).unwrap();

    let mut array = mgr
        .array_init("points", Mode::WriteUnsorted, None, None)
        .unwrap();
    array.write(&[i32s(&[1]), i32s(&[0, 0])]).unwrap();
    mgr.array_finalize(array).unwrap();

    // A sorted write flushes whole tiles to disk as it goes; dropping the
    // handle without finalize simulates a crash before commit.
    let mut array = mgr.array_init("points", Mode::Write, None, None).unwrap();
    array
        .write(&[i32s(&[7, 8, 9]), i32s(&[1, 0, 1, 1, 2, 2])])
        .unwrap();
    drop(array);

    assert_eq!(read_values(&mgr), vec![1]);
}

#[test]
fn fragment_directory_without_marker_is_invisible() {
    let dir = tempdir().unwrap();
    let ws = dir.path().join("ws");
    let mgr = StorageManager::init(&ws, Config::default()).unwrap();
    mgr.array_create(&points_schema()).unwrap();

    let mut array = mgr
        .array_init("points", Mode::WriteUnsorted, None, None)
        .unwrap();
    array.write(&[i32s(&[5]), i32s(&[2, 2])]).unwrap();
    mgr.array_finalize(array).unwrap();

    // Strip the commit marker of the sealed fragment.
    let array_dir = ws.join("points");
    let fragment = std::fs::read_dir(&array_dir)
        .unwrap()
        .map(|e| e.unwrap())
        .find(|e| e.path().is_dir())
        .unwrap();
    std::fs::remove_file(fragment.path().join("__book_keeping.tdb")).unwrap();

    assert_eq!(read_values(&mgr), Vec::<i32>::new());
}

#[test]
fn corrupt_book_keeping_skips_the_fragment() {
    let dir = tempdir().unwrap();
    let ws = dir.path().join("ws");
    let mgr = StorageManager::init(&ws, Config::default()).unwrap();
    mgr.array_create(&points_schema()).unwrap();

    let mut array = mgr
        .array_init("points", Mode::WriteUnsorted, None, None)
        .unwrap();
    array.write(&[i32s(&[1]), i32s(&[0, 0])]).unwrap();
    mgr.array_finalize(array).unwrap();

    let mut array = mgr
        .array_init("points", Mode::WriteUnsorted, None, None)
        .unwrap();
    array.write(&[i32s(&[2]), i32s(&[1, 1])]).unwrap();
    mgr.array_finalize(array).unwrap();

    // Truncate the newest fragment's book-keeping mid-file. The fragment
    // list orders fragments oldest to newest.
    let array_dir = ws.join("points");
    let names = mgr
        .array_init("points", Mode::Read, None, None)
        .unwrap()
        .fragment_names();
    let marker = array_dir
        .join(names.last().unwrap())
        .join("__book_keeping.tdb");
    let bytes = std::fs::read(&marker).unwrap();
    std::fs::write(&marker, &bytes[..bytes.len() / 2]).unwrap();

    // The older fragment still reads; the corrupt one is gone.
    assert_eq!(read_values(&mgr), vec![1]);
}

#[test]
fn all_fragments_corrupt_fails_the_open() {
    let dir = tempdir().unwrap();
    let ws = dir.path().join("ws");
    let mgr = StorageManager::init(&ws, Config::default()).unwrap();
    mgr.array_create(&points_schema()).unwrap();

    let mut array = mgr
        .array_init("points", Mode::WriteUnsorted, None, None)
        .unwrap();
    array.write(&[i32s(&[1]), i32s(&[0, 0])]).unwrap();
    mgr.array_finalize(array).unwrap();

    let array_dir = ws.join("points");
    let fragment = std::fs::read_dir(&array_dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .find(|p| p.is_dir())
        .unwrap();
    std::fs::write(fragment.join("__book_keeping.tdb"), b"XXXX").unwrap();

    assert!(mgr.array_init("points", Mode::Read, None, None).is_err());
}

#[test]
fn sync_makes_the_written_prefix_visible() {
    let dir = tempdir().unwrap();
    let ws = dir.path().join("ws");
    let mgr = StorageManager::init(&ws, Config::default()).unwrap();
    mgr.array_create(&points_schema()).unwrap();

    let mut array = mgr.array_init("points", Mode::Write, None, None).unwrap();
    array
        .write(&[i32s(&[7, 8]), i32s(&[0, 0, 0, 1])])
        .unwrap();
    mgr.array_sync(&mut array).unwrap();

    // The synced prefix is visible to a fresh open even though the
    // writing handle is still alive.
    assert_eq!(read_values(&mgr), vec![7, 8]);

    array.write(&[i32s(&[9]), i32s(&[3, 3])]).unwrap();
    mgr.array_finalize(array).unwrap();
    assert_eq!(read_values(&mgr), vec![7, 8, 9]);
}
