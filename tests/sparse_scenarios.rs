//! # Sparse Array Scenarios
//!
//! End-to-end coverage of the sparse write/read path over a small 2D
//! array: basic round-trips, newest-wins shadowing across fragments,
//! overflow-driven chunked reads, variable-length attributes, deletions,
//! and Hilbert cell order.

use gridstore::{
    ArraySchema, Compressor, Config, Datatype, Layout, Mode, ReadStatus, StorageManager, VAR_NUM,
};
use tempfile::tempdir;

fn i32s(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn u64s(values: &[u64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn as_i32s(bytes: &[u8]) -> Vec<i32> {
    bytes
        .chunks_exact(4)
        .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn as_u64s(bytes: &[u8]) -> Vec<u64> {
    bytes
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

/// 4x4 int32 grid, row-major, capacity 2, one int32 attribute.
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

/// Writes the S1 base data: cells (0,0)=10, (0,1)=11, (1,1)=12.
fn write_base(mgr: &StorageManager) {
    let mut array = mgr
        .array_init("points", Mode::WriteUnsorted, None, None)
        .unwrap();
    array
        .write(&[&i32s(&[10, 11, 12]), &i32s(&[0, 0, 0, 1, 1, 1])])
        .unwrap();
    mgr.array_finalize(array).unwrap();
}

/// Overwrites (0,1) with 99 in a second fragment.
fn write_overwrite(mgr: &StorageManager) {
    let mut array = mgr.array_init("points", Mode::Write, None, None).unwrap();
    array.write(&[&i32s(&[99]), &i32s(&[0, 1])]).unwrap();
    mgr.array_finalize(array).unwrap();
}

mod basic_round_trip {
    use super::*;

    #[test]
    fn subarray_read_returns_cells_in_cell_order() {
        let dir = tempdir().unwrap();
        let mgr = StorageManager::init(dir.path().join("ws"), Config::default()).unwrap();
        mgr.array_create(&points_schema()).unwrap();
        write_base(&mgr);

        let mut array = mgr
            .array_init("points", Mode::Read, Some(&[0, 1, 0, 1]), None)
            .unwrap();
        let mut a = vec![0u8; 64];
        let mut coords = vec![0u8; 64];
        let mut sizes = [0usize; 2];
        let status = array
            .read(&mut [a.as_mut_slice(), coords.as_mut_slice()], &mut sizes)
            .unwrap();

        assert_eq!(status, ReadStatus::Completed);
        assert_eq!(as_i32s(&a[..sizes[0]]), vec![10, 11, 12]);
        assert_eq!(as_i32s(&coords[..sizes[1]]), vec![0, 0, 0, 1, 1, 1]);
        assert!(!array.overflow(0));
    }

    #[test]
    fn non_intersecting_subarray_reads_nothing() {
        let dir = tempdir().unwrap();
        let mgr = StorageManager::init(dir.path().join("ws"), Config::default()).unwrap();
        mgr.array_create(&points_schema()).unwrap();
        write_base(&mgr);

        let mut array = mgr
            .array_init("points", Mode::Read, Some(&[3, 3, 0, 0]), None)
            .unwrap();
        let mut a = vec![0u8; 64];
        let mut coords = vec![0u8; 64];
        let mut sizes = [0usize; 2];
        let status = array
            .read(&mut [a.as_mut_slice(), coords.as_mut_slice()], &mut sizes)
            .unwrap();
        assert_eq!(status, ReadStatus::Completed);
        assert_eq!(sizes, [0, 0]);
    }

    #[test]
    fn sorted_mode_rejects_out_of_order_cells() {
        let dir = tempdir().unwrap();
        let mgr = StorageManager::init(dir.path().join("ws"), Config::default()).unwrap();
        mgr.array_create(&points_schema()).unwrap();

        let mut array = mgr.array_init("points", Mode::Write, None, None).unwrap();
        let result = array.write(&[&i32s(&[1, 2]), &i32s(&[2, 2, 0, 0])]);
        assert!(result.is_err());
    }

    #[test]
    fn out_of_domain_cells_are_rejected() {
        let dir = tempdir().unwrap();
        let mgr = StorageManager::init(dir.path().join("ws"), Config::default()).unwrap();
        mgr.array_create(&points_schema()).unwrap();

        let mut array = mgr
            .array_init("points", Mode::WriteUnsorted, None, None)
            .unwrap();
        array.write(&[&i32s(&[7]), &i32s(&[9, 9])]).unwrap();
        assert!(mgr.array_finalize(array).is_err());
    }
}

mod newest_wins {
    use super::*;

    #[test]
    fn later_fragment_shadows_earlier_cell() {
        let dir = tempdir().unwrap();
        let mgr = StorageManager::init(dir.path().join("ws"), Config::default()).unwrap();
        mgr.array_create(&points_schema()).unwrap();
        write_base(&mgr);
        write_overwrite(&mgr);

        let mut array = mgr.array_init("points", Mode::Read, None, None).unwrap();
        let mut a = vec![0u8; 64];
        let mut coords = vec![0u8; 64];
        let mut sizes = [0usize; 2];
        array
            .read(&mut [a.as_mut_slice(), coords.as_mut_slice()], &mut sizes)
            .unwrap();

        assert_eq!(as_i32s(&a[..sizes[0]]), vec![10, 99, 12]);
        assert_eq!(as_i32s(&coords[..sizes[1]]), vec![0, 0, 0, 1, 1, 1]);
    }

    #[test]
    fn duplicate_inside_one_batch_keeps_the_last_write() {
        let dir = tempdir().unwrap();
        let mgr = StorageManager::init(dir.path().join("ws"), Config::default()).unwrap();
        mgr.array_create(&points_schema()).unwrap();

        let mut array = mgr
            .array_init("points", Mode::WriteUnsorted, None, None)
            .unwrap();
        array
            .write(&[&i32s(&[1, 2, 3]), &i32s(&[2, 2, 2, 2, 2, 2])])
            .unwrap();
        mgr.array_finalize(array).unwrap();

        let mut array = mgr.array_init("points", Mode::Read, None, None).unwrap();
        let mut a = vec![0u8; 64];
        let mut coords = vec![0u8; 64];
        let mut sizes = [0usize; 2];
        array
            .read(&mut [a.as_mut_slice(), coords.as_mut_slice()], &mut sizes)
            .unwrap();
        assert_eq!(as_i32s(&a[..sizes[0]]), vec![3]);
    }

    #[test]
    fn reader_snapshot_ignores_later_fragments() {
        let dir = tempdir().unwrap();
        let mgr = StorageManager::init(dir.path().join("ws"), Config::default()).unwrap();
        mgr.array_create(&points_schema()).unwrap();
        write_base(&mgr);

        let mut early_reader = mgr.array_init("points", Mode::Read, None, None).unwrap();
        write_overwrite(&mgr);

        let mut a = vec![0u8; 64];
        let mut coords = vec![0u8; 64];
        let mut sizes = [0usize; 2];
        early_reader
            .read(&mut [a.as_mut_slice(), coords.as_mut_slice()], &mut sizes)
            .unwrap();
        assert_eq!(as_i32s(&a[..sizes[0]]), vec![10, 11, 12]);
    }
}

mod overflow_resumption {
    use super::*;

    #[test]
    fn chunked_reads_match_s3() {
        let dir = tempdir().unwrap();
        let mgr = StorageManager::init(dir.path().join("ws"), Config::default()).unwrap();
        mgr.array_create(&points_schema()).unwrap();
        write_base(&mgr);
        write_overwrite(&mgr);

        let mut array = mgr.array_init("points", Mode::Read, None, None).unwrap();
        // Attribute buffer holds exactly two cells; coordinates are roomy.
        let mut a = vec![0u8; 8];
        let mut coords = vec![0u8; 64];
        let mut sizes = [0usize; 2];

        let status = array
            .read(&mut [a.as_mut_slice(), coords.as_mut_slice()], &mut sizes)
            .unwrap();
        assert_eq!(status, ReadStatus::Incomplete);
        assert!(array.overflow(0));
        assert!(!array.overflow(1));
        assert_eq!(as_i32s(&a[..sizes[0]]), vec![10, 99]);

        let status = array
            .read(&mut [a.as_mut_slice(), coords.as_mut_slice()], &mut sizes)
            .unwrap();
        assert_eq!(status, ReadStatus::Completed);
        assert_eq!(as_i32s(&a[..sizes[0]]), vec![12]);
        assert!(!array.overflow(0));

        let status = array
            .read(&mut [a.as_mut_slice(), coords.as_mut_slice()], &mut sizes)
            .unwrap();
        assert_eq!(status, ReadStatus::Completed);
        assert_eq!(sizes, [0, 0]);
    }

    #[test]
    fn any_chunking_concatenates_to_the_unbounded_read() {
        let dir = tempdir().unwrap();
        let mgr = StorageManager::init(dir.path().join("ws"), Config::default()).unwrap();
        mgr.array_create(&points_schema()).unwrap();

        // 16 cells written in two shuffled unsorted batches.
        let mut array = mgr
            .array_init("points", Mode::WriteUnsorted, None, None)
            .unwrap();
        let mut coords = Vec::new();
        let mut values = Vec::new();
        for x in [3i32, 1, 0, 2] {
            for y in [2i32, 0, 3, 1] {
                coords.extend_from_slice(&[x, y]);
                values.push(x * 10 + y);
            }
        }
        array
            .write(&[&i32s(&values[..8]), &i32s(&coords[..16])])
            .unwrap();
        array
            .write(&[&i32s(&values[8..]), &i32s(&coords[16..])])
            .unwrap();
        mgr.array_finalize(array).unwrap();

        // One unbounded read.
        let mut array = mgr.array_init("points", Mode::Read, None, None).unwrap();
        let mut a = vec![0u8; 1024];
        let mut c = vec![0u8; 1024];
        let mut sizes = [0usize; 2];
        array
            .read(&mut [a.as_mut_slice(), c.as_mut_slice()], &mut sizes)
            .unwrap();
        let full_values = as_i32s(&a[..sizes[0]]);
        let full_coords = as_i32s(&c[..sizes[1]]);
        assert_eq!(full_values.len(), 16);

        // The same read in 3-cell chunks.
        for chunk_cells in [1usize, 3, 5] {
            let mut array = mgr.array_init("points", Mode::Read, None, None).unwrap();
            let mut got_values = Vec::new();
            let mut got_coords = Vec::new();
            loop {
                let mut a = vec![0u8; 4 * chunk_cells];
                let mut c = vec![0u8; 8 * chunk_cells];
                let mut sizes = [0usize; 2];
                let status = array
                    .read(&mut [a.as_mut_slice(), c.as_mut_slice()], &mut sizes)
                    .unwrap();
                got_values.extend(as_i32s(&a[..sizes[0]]));
                got_coords.extend(as_i32s(&c[..sizes[1]]));
                if status == ReadStatus::Completed {
                    break;
                }
            }
            assert_eq!(got_values, full_values, "chunk size {}", chunk_cells);
            assert_eq!(got_coords, full_coords, "chunk size {}", chunk_cells);
        }
    }
}

mod variable_length {
    use super::*;

    fn strings_schema() -> ArraySchema {
        ArraySchema::sparse("strings")
            .coords_type(Datatype::Int32)
            .dimension("x", 0, 3)
            .dimension("y", 0, 3)
            .capacity(2)
            .attribute_with("s", Datatype::Char, VAR_NUM, Compressor::Gzip)
            .build()
            .unwrap()
    }

    #[test]
    fn payload_and_offsets_round_trip() {
        let dir = tempdir().unwrap();
        let mgr = StorageManager::init(dir.path().join("ws"), Config::default()).unwrap();
        mgr.array_create(&strings_schema()).unwrap();

        let mut array = mgr
            .array_init("strings", Mode::WriteUnsorted, None, None)
            .unwrap();
        array
            .write(&[u64s(&[0, 2]), b"hiworld".to_vec(), i32s(&[0, 0, 0, 1])])
            .unwrap();
        mgr.array_finalize(array).unwrap();

        let mut array = mgr.array_init("strings", Mode::Read, None, None).unwrap();
        let mut offsets = vec![0u8; 64];
        let mut payload = vec![0u8; 64];
        let mut coords = vec![0u8; 64];
        let mut sizes = [0usize; 3];
        let status = array
            .read(
                &mut [offsets.as_mut_slice(), payload.as_mut_slice(), coords.as_mut_slice()],
                &mut sizes,
            )
            .unwrap();

        assert_eq!(status, ReadStatus::Completed);
        assert_eq!(as_u64s(&offsets[..sizes[0]]), vec![0, 2]);
        assert_eq!(&payload[..sizes[1]], b"hiworld");
        assert_eq!(as_i32s(&coords[..sizes[2]]), vec![0, 0, 0, 1]);
    }

    #[test]
    fn empty_and_large_values_survive() {
        let dir = tempdir().unwrap();
        let mgr = StorageManager::init(dir.path().join("ws"), Config::default()).unwrap();
        mgr.array_create(&strings_schema()).unwrap();

        let big = vec![b'z'; 300];
        let mut payload = Vec::new();
        payload.extend_from_slice(b"ab");
        payload.extend_from_slice(&big);
        let mut array = mgr
            .array_init("strings", Mode::WriteUnsorted, None, None)
            .unwrap();
        array
            .write(&[u64s(&[0, 2, 2]), payload.clone(), i32s(&[0, 0, 1, 0, 2, 0])])
            .unwrap();
        mgr.array_finalize(array).unwrap();

        let mut array = mgr.array_init("strings", Mode::Read, None, None).unwrap();
        let mut offsets = vec![0u8; 64];
        let mut out = vec![0u8; 1024];
        let mut coords = vec![0u8; 64];
        let mut sizes = [0usize; 3];
        array
            .read(
                &mut [offsets.as_mut_slice(), out.as_mut_slice(), coords.as_mut_slice()],
                &mut sizes,
            )
            .unwrap();
        assert_eq!(as_u64s(&offsets[..sizes[0]]), vec![0, 2, 2]);
        assert_eq!(&out[..sizes[1]], payload.as_slice());
    }
}

mod deletions {
    use super::*;

    #[test]
    fn deleted_cell_disappears_from_reads() {
        let dir = tempdir().unwrap();
        let mgr = StorageManager::init(dir.path().join("ws"), Config::default()).unwrap();
        mgr.array_create(&points_schema()).unwrap();
        write_base(&mgr);

        let mut array = mgr
            .array_init("points", Mode::WriteUnsorted, None, None)
            .unwrap();
        array.write_deletions(&i32s(&[0, 1])).unwrap();
        mgr.array_finalize(array).unwrap();

        let mut array = mgr.array_init("points", Mode::Read, None, None).unwrap();
        let mut a = vec![0u8; 64];
        let mut coords = vec![0u8; 64];
        let mut sizes = [0usize; 2];
        array
            .read(&mut [a.as_mut_slice(), coords.as_mut_slice()], &mut sizes)
            .unwrap();
        assert_eq!(as_i32s(&a[..sizes[0]]), vec![10, 12]);
        assert_eq!(as_i32s(&coords[..sizes[1]]), vec![0, 0, 1, 1]);
    }

    #[test]
    fn rewrite_after_deletion_resurrects_the_cell() {
        let dir = tempdir().unwrap();
        let mgr = StorageManager::init(dir.path().join("ws"), Config::default()).unwrap();
        mgr.array_create(&points_schema()).unwrap();
        write_base(&mgr);

        let mut array = mgr
            .array_init("points", Mode::WriteUnsorted, None, None)
            .unwrap();
        array.write_deletions(&i32s(&[0, 1])).unwrap();
        mgr.array_finalize(array).unwrap();

        let mut array = mgr.array_init("points", Mode::Write, None, None).unwrap();
        array.write(&[&i32s(&[55]), &i32s(&[0, 1])]).unwrap();
        mgr.array_finalize(array).unwrap();

        let mut array = mgr.array_init("points", Mode::Read, None, None).unwrap();
        let mut a = vec![0u8; 64];
        let mut coords = vec![0u8; 64];
        let mut sizes = [0usize; 2];
        array
            .read(&mut [a.as_mut_slice(), coords.as_mut_slice()], &mut sizes)
            .unwrap();
        assert_eq!(as_i32s(&a[..sizes[0]]), vec![10, 55, 12]);
    }
}

mod hilbert_order {
    use super::*;

    #[test]
    fn reads_follow_the_curve_and_dedup_still_works() {
        let dir = tempdir().unwrap();
        let mgr = StorageManager::init(dir.path().join("ws"), Config::default()).unwrap();
        let schema = ArraySchema::sparse("curve")
            .coords_type(Datatype::Int32)
            .dimension("x", 0, 7)
            .dimension("y", 0, 7)
            .cell_order(Layout::Hilbert)
            .capacity(3)
            .attribute("a", Datatype::Int32)
            .build()
            .unwrap();
        mgr.array_create(&schema).unwrap();

        let mut array = mgr
            .array_init("curve", Mode::WriteUnsorted, None, None)
            .unwrap();
        let cells: Vec<[i32; 2]> = vec![[7, 0], [0, 0], [3, 4], [5, 5], [0, 7], [3, 4]];
        let coords: Vec<i32> = cells.iter().flatten().copied().collect();
        let values: Vec<i32> = (0..cells.len() as i32).collect();
        array.write(&[&i32s(&values), &i32s(&coords)]).unwrap();
        mgr.array_finalize(array).unwrap();

        let mut array = mgr.array_init("curve", Mode::Read, None, None).unwrap();
        let mut a = vec![0u8; 1024];
        let mut c = vec![0u8; 1024];
        let mut sizes = [0usize; 2];
        array
            .read(&mut [a.as_mut_slice(), c.as_mut_slice()], &mut sizes)
            .unwrap();

        let got_coords = as_i32s(&c[..sizes[1]]);
        // Duplicate (3,4) collapsed to the later value.
        assert_eq!(got_coords.len(), 10);
        let got_values = as_i32s(&a[..sizes[0]]);
        let at_34 = got_coords
            .chunks(2)
            .position(|p| p == [3, 4])
            .expect("cell (3,4) present");
        assert_eq!(got_values[at_34], 5);

        // Emission order is the schema's global order.
        let tuples: Vec<[i64; 2]> = got_coords
            .chunks(2)
            .map(|p| [p[0] as i64, p[1] as i64])
            .collect();
        for pair in tuples.windows(2) {
            assert_eq!(
                schema.global_cmp(&pair[0], &pair[1]),
                std::cmp::Ordering::Less
            );
        }
    }
}

mod iterator_facade {
    use super::*;

    #[test]
    fn walks_every_cell_once() {
        let dir = tempdir().unwrap();
        let mgr = StorageManager::init(dir.path().join("ws"), Config::default()).unwrap();
        mgr.array_create(&points_schema()).unwrap();
        write_base(&mgr);
        write_overwrite(&mgr);

        // Buffers hold two cells per refill to exercise resumption.
        let mut iter = mgr
            .array_iterator_init("points", None, None, &[8, 16])
            .unwrap();
        let mut seen = Vec::new();
        while !iter.end() {
            let value = i32::from_le_bytes(iter.value(0).unwrap().try_into().unwrap());
            let coords = as_i32s(iter.value(1).unwrap());
            seen.push((coords[0], coords[1], value));
            iter.next().unwrap();
        }
        assert_eq!(seen, vec![(0, 0, 10), (0, 1, 99), (1, 1, 12)]);
    }
}
