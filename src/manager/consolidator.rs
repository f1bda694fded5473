//! # Consolidator
//!
//! Merges all live fragments of one array into a single new fragment and
//! atomically retires the originals. The merge is simply the standard read
//! path pumped into the standard write path: reading the full domain
//! yields the deduplicated, deletion-free cell stream in global order, and
//! writing it back produces one fragment holding exactly that stream.
//!
//! Commit protocol: the new fragment seals (book-keeping published,
//! fragment appended to the list), then the fragment list is atomically
//! replaced with one naming only the new fragment, and only then are the
//! old directories deleted. A reader that opened before the swap keeps its
//! snapshot; the old fragments stay intact on disk until every step of the
//! swap has committed.

use eyre::{ensure, Result};
use log::debug;

use crate::array::{BufferTarget, Mode, ReadStatus};
use crate::fragment;
use crate::io;

use super::StorageManager;

/// Cells per internal buffer batch, scaled by the schema's tile budget.
const BATCH_TILES: u64 = 4;

/// Starting guess for variable-length payload bytes per cell; the buffers
/// double on demand, so a bad guess only costs a retry.
const VAR_CELL_GUESS: usize = 64;

pub(crate) fn consolidate(mgr: &StorageManager, name: &str) -> Result<()> {
    let mut read = mgr.array_init(name, Mode::Read, None, None)?;
    if read.fragments().len() <= 1 {
        debug!("array '{}' has {} fragment(s); nothing to consolidate", name, read.fragments().len());
        return Ok(());
    }
    let old_names = read.fragment_names();
    let array_dir = read.dir().clone();

    let schema = read.schema();
    let cells_per_batch = if schema.is_dense() {
        schema.tile_cell_num().expect("dense schemas always carry extents") * BATCH_TILES // INVARIANT: schema validation
    } else {
        schema.capacity() * BATCH_TILES
    } as usize;

    let mut write = mgr.array_init(name, Mode::Write, None, None)?;
    write.set_global_order_writes();

    let mut buffers: Vec<Vec<u8>> = read
        .targets()
        .iter()
        .map(|target| {
            let bytes = match target {
                BufferTarget::Coords => schema.coords_size() * cells_per_batch,
                BufferTarget::Fixed(slot) => {
                    schema.attribute(*slot).cell_size().expect("fixed target has a size") // INVARIANT: target kind
                        * cells_per_batch
                }
                BufferTarget::VarOffsets(_) => 8 * cells_per_batch,
                BufferTarget::VarPayload(_) => VAR_CELL_GUESS * cells_per_batch,
            };
            vec![0u8; bytes]
        })
        .collect();
    let mut sizes = vec![0usize; buffers.len()];

    loop {
        let status = {
            let mut views: Vec<&mut [u8]> = buffers.iter_mut().map(|b| b.as_mut_slice()).collect();
            read.read(&mut views, &mut sizes)?
        };

        if sizes.iter().any(|&s| s > 0) {
            let views: Vec<&[u8]> = buffers
                .iter()
                .zip(&sizes)
                .map(|(buffer, &size)| &buffer[..size])
                .collect();
            write.write(&views)?;
        } else if status == ReadStatus::Incomplete {
            // Not a single cell fit; some variable-length value outgrew
            // the guess. Double every overflowed buffer and retry.
            for (i, buffer) in buffers.iter_mut().enumerate() {
                if read.overflow(i) {
                    let doubled = buffer.len().max(1) * 2;
                    buffer.resize(doubled, 0);
                }
            }
            continue;
        }

        if status == ReadStatus::Completed {
            break;
        }
    }
    drop(read);

    let sealed = write.finalize()?;
    match sealed {
        Some(new_name) => {
            ensure!(
                fragment::is_live(&array_dir.join(&new_name)),
                "consolidated fragment '{}' failed to commit",
                new_name
            );
            fragment::write_fragment_list(&array_dir, &[new_name.clone()])?;
            debug!("array '{}' consolidated into '{}'", name, new_name);
        }
        None => {
            // Every cell was shadowed or deleted; the array is now empty.
            fragment::write_fragment_list(&array_dir, &[])?;
            debug!("array '{}' consolidated to empty", name);
        }
    }

    for old in &old_names {
        mgr.forget_fragment(&array_dir, old);
        io::delete_dir(&array_dir.join(old))?;
    }

    sweep_dead_fragments(&array_dir);
    Ok(())
}

/// Removes fragment directories that never committed and are old enough
/// that their writer cannot still be alive. Younger uncommitted
/// directories are left alone; they may belong to an in-progress write.
fn sweep_dead_fragments(array_dir: &std::path::Path) {
    let now_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let Ok(names) = io::list_dir(array_dir) else {
        return;
    };
    for name in names {
        let Some((timestamp_ms, _)) = fragment::parse_fragment_name(&name) else {
            continue;
        };
        let dir = array_dir.join(&name);
        if fragment::is_live(&dir) {
            continue;
        }
        if now_ms.saturating_sub(timestamp_ms) > crate::config::FRAGMENT_GC_GRACE_MS {
            debug!("garbage-collecting dead fragment '{}'", name);
            let _ = io::delete_dir(&dir);
        }
    }
}
