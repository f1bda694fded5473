//! # Asynchronous I/O Tests
//!
//! The worker pool executes requests against shared handles and fires
//! each completion exactly once with a final status.

use std::sync::mpsc;
use std::sync::Arc;

use gridstore::{AioRequest, AioStatus, ArraySchema, Config, Datatype, Mode, StorageManager};
use parking_lot::Mutex;
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

#[test]
fn async_write_then_async_read() {
    let dir = tempdir().unwrap();
    let mgr = StorageManager::init(dir.path().join("ws"), Config::default()).unwrap();
    mgr.array_create(&points_schema()).unwrap();

    // Asynchronous write.
    let writer = Arc::new(Mutex::new(
        mgr.array_init("points", Mode::WriteUnsorted, None, None)
            .unwrap(),
    ));
    let (tx, rx) = mpsc::channel();
    let request = AioRequest::write(vec![i32s(&[10, 11]), i32s(&[0, 0, 1, 1])]).on_complete(
        Box::new(move |req| {
            tx.send(req.status).unwrap();
        }),
    );
    mgr.aio_submit(Arc::clone(&writer), request);
    assert_eq!(rx.recv().unwrap(), AioStatus::Completed);

    let writer = Arc::try_unwrap(writer).expect("pool released its handle").into_inner();
    mgr.array_finalize(writer).unwrap();

    // Asynchronous read with a subarray.
    let reader = Arc::new(Mutex::new(
        mgr.array_init("points", Mode::Read, None, None).unwrap(),
    ));
    let (tx, rx) = mpsc::channel();
    let request = AioRequest::read(vec![vec![0u8; 64], vec![0u8; 64]], Some(vec![0, 3, 0, 3]))
        .on_complete(Box::new(move |req| {
            tx.send((req.status, req.buffers.clone(), req.sizes.clone()))
                .unwrap();
        }));
    mgr.aio_submit(reader, request);

    let (status, buffers, sizes) = rx.recv().unwrap();
    assert_eq!(status, AioStatus::Completed);
    assert_eq!(as_i32s(&buffers[0][..sizes[0]]), vec![10, 11]);
    assert_eq!(as_i32s(&buffers[1][..sizes[1]]), vec![0, 0, 1, 1]);
}

#[test]
fn read_overflow_is_reported_as_a_status() {
    let dir = tempdir().unwrap();
    let mgr = StorageManager::init(dir.path().join("ws"), Config::default()).unwrap();
    mgr.array_create(&points_schema()).unwrap();

    let mut array = mgr
        .array_init("points", Mode::WriteUnsorted, None, None)
        .unwrap();
    array
        .write(&[i32s(&[1, 2, 3]), i32s(&[0, 0, 1, 1, 2, 2])])
        .unwrap();
    mgr.array_finalize(array).unwrap();

    let reader = Arc::new(Mutex::new(
        mgr.array_init("points", Mode::Read, None, None).unwrap(),
    ));
    // Room for one cell only.
    let (tx, rx) = mpsc::channel();
    let request = AioRequest::read(vec![vec![0u8; 4], vec![0u8; 8]], None).on_complete(Box::new(
        move |req| {
            tx.send((req.status, req.sizes.clone())).unwrap();
        },
    ));
    mgr.aio_submit(Arc::clone(&reader), request);

    let (status, sizes) = rx.recv().unwrap();
    assert_eq!(status, AioStatus::Overflow);
    assert_eq!(sizes, vec![4, 8]);
}

#[test]
fn errors_surface_in_the_completion() {
    let dir = tempdir().unwrap();
    let mgr = StorageManager::init(dir.path().join("ws"), Config::default()).unwrap();
    mgr.array_create(&points_schema()).unwrap();

    let reader = Arc::new(Mutex::new(
        mgr.array_init("points", Mode::Read, None, None).unwrap(),
    ));
    // Wrong buffer count for the selection.
    let (tx, rx) = mpsc::channel();
    let request = AioRequest::read(vec![vec![0u8; 16]], None).on_complete(Box::new(move |req| {
        tx.send((req.status, req.error.clone())).unwrap();
    }));
    mgr.aio_submit(reader, request);

    let (status, error) = rx.recv().unwrap();
    assert_eq!(status, AioStatus::Error);
    assert!(error.is_some());
}
