//! # File I/O Layer
//!
//! Filesystem primitives for the fragment engine: directory management,
//! atomic file publication, positional reads in three methods, and append
//! writers in two methods.
//!
//! ## Read Methods
//!
//! Tile files are immutable once a fragment is sealed, which makes all
//! three read methods equivalent in semantics and lets callers pick purely
//! on performance:
//!
//! - **Buffered**: positional `pread` through the OS page cache. No mapping
//!   cost, good for one-shot scans.
//! - **Mmap**: the whole file is mapped read-only; a read is a `memcpy`
//!   from the mapping. Repeated tile fetches from one fragment amortize the
//!   mapping cost and share the page cache across handles.
//! - **Direct**: `O_DIRECT` with an aligned bounce buffer. The requested
//!   range is rounded out to [`DIRECT_IO_ALIGNMENT`] boundaries, read into
//!   an aligned scratch buffer, and the wanted bytes are copied out. Used
//!   when the host process must not pollute the OS page cache.
//!
//! ## Write Methods
//!
//! Attribute files are append-only until the fragment seals:
//!
//! - **Buffered**: ordinary appends; `sync` flushes and fsyncs.
//! - **Direct**: the file is opened with `O_SYNC` so every append is
//!   durable when it returns. Alignment restrictions of `O_DIRECT` do not
//!   compose with variable-size compressed tiles, so synchronous writes
//!   stand in for direct writes on the write path.
//!
//! ## Atomic Publication
//!
//! Files that act as commit points (book-keeping, the fragment list) are
//! written to a `.tmp` sibling, fsynced, and renamed into place. Rename is
//! atomic on POSIX filesystems, so readers observe either the old or the
//! new content, never a torn file.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use memmap2::Mmap;

use crate::config::{IoMethod, DIRECT_IO_ALIGNMENT};

/// Creates a directory, failing if it already exists.
pub fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir(path)
        .wrap_err_with(|| format!("failed to create directory '{}'", path.display()))
}

/// Creates a directory and any missing parents.
pub fn create_dir_all(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .wrap_err_with(|| format!("failed to create directory '{}'", path.display()))
}

/// Recursively deletes a directory and its contents.
pub fn delete_dir(path: &Path) -> Result<()> {
    fs::remove_dir_all(path)
        .wrap_err_with(|| format!("failed to delete directory '{}'", path.display()))
}

/// Renames `from` to `to`. Atomic within one filesystem.
pub fn rename(from: &Path, to: &Path) -> Result<()> {
    fs::rename(from, to).wrap_err_with(|| {
        format!(
            "failed to rename '{}' to '{}'",
            from.display(),
            to.display()
        )
    })
}

pub fn file_exists(path: &Path) -> bool {
    path.is_file()
}

pub fn dir_exists(path: &Path) -> bool {
    path.is_dir()
}

/// Lists the entry names of a directory, sorted lexicographically.
///
/// Lexicographic order matters: fragment directory names are built so that
/// this order equals their temporal order.
pub fn list_dir(path: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let entries = fs::read_dir(path)
        .wrap_err_with(|| format!("failed to list directory '{}'", path.display()))?;
    for entry in entries {
        let entry = entry.wrap_err("failed to read directory entry")?;
        match entry.file_name().into_string() {
            Ok(name) => names.push(name),
            Err(raw) => eyre::bail!("non-UTF-8 entry {:?} in '{}'", raw, path.display()),
        }
    }
    names.sort_unstable();
    Ok(names)
}

/// Reads a whole file into memory.
pub fn read_file(path: &Path) -> Result<Vec<u8>> {
    let mut file = File::open(path)
        .wrap_err_with(|| format!("failed to open '{}'", path.display()))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)
        .wrap_err_with(|| format!("failed to read '{}'", path.display()))?;
    Ok(bytes)
}

/// Writes a file atomically: temp sibling, fsync, rename into place.
pub fn write_file_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| eyre::eyre!("'{}' has no parent directory", path.display()))?;
    let tmp = parent.join(format!(
        "{}.tmp",
        path.file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| eyre::eyre!("invalid file name in '{}'", path.display()))?
    ));

    let mut file = File::create(&tmp)
        .wrap_err_with(|| format!("failed to create '{}'", tmp.display()))?;
    file.write_all(bytes)
        .wrap_err_with(|| format!("failed to write '{}'", tmp.display()))?;
    file.sync_all()
        .wrap_err_with(|| format!("failed to sync '{}'", tmp.display()))?;
    drop(file);

    rename(&tmp, path)?;
    sync_dir(parent)
}

/// Creates an empty sentinel file.
pub fn touch(path: &Path) -> Result<()> {
    File::create(path)
        .wrap_err_with(|| format!("failed to create '{}'", path.display()))?
        .sync_all()
        .wrap_err_with(|| format!("failed to sync '{}'", path.display()))
}

/// Fsyncs a directory so entry renames/creations inside it are durable.
pub fn sync_dir(path: &Path) -> Result<()> {
    let dir = File::open(path)
        .wrap_err_with(|| format!("failed to open directory '{}'", path.display()))?;
    dir.sync_all()
        .wrap_err_with(|| format!("failed to sync directory '{}'", path.display()))
}

/// Positional reader over one immutable file, specialized by read method.
#[derive(Debug)]
pub enum FileReader {
    Buffered(File),
    Mmap { mmap: Mmap, len: u64 },
    Direct { file: File, len: u64 },
}

impl FileReader {
    pub fn open(path: &Path, method: IoMethod) -> Result<Self> {
        match method {
            IoMethod::Buffered => {
                let file = File::open(path)
                    .wrap_err_with(|| format!("failed to open '{}'", path.display()))?;
                Ok(FileReader::Buffered(file))
            }
            IoMethod::Mmap => {
                let file = File::open(path)
                    .wrap_err_with(|| format!("failed to open '{}'", path.display()))?;
                let len = file
                    .metadata()
                    .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
                    .len();
                // Zero-length mappings are rejected by the kernel; an empty
                // file has nothing to read anyway.
                if len == 0 {
                    return Ok(FileReader::Buffered(file));
                }
                // SAFETY: Mmap::map is unsafe because the file could be
                // truncated or rewritten externally while mapped. This is
                // safe because fragment files are immutable after seal: the
                // engine never modifies a sealed file, and external
                // modification of a live workspace is outside the supported
                // operating model (same contract as the write-side mmap in
                // any single-process embedded engine).
                let mmap = unsafe {
                    Mmap::map(&file)
                        .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
                };
                Ok(FileReader::Mmap { mmap, len })
            }
            IoMethod::Direct => {
                let file = open_direct(path)?;
                let len = file
                    .metadata()
                    .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
                    .len();
                Ok(FileReader::Direct { file, len })
            }
        }
    }

    pub fn len(&self) -> Result<u64> {
        match self {
            FileReader::Buffered(file) => {
                Ok(file.metadata().wrap_err("failed to stat file")?.len())
            }
            FileReader::Mmap { len, .. } | FileReader::Direct { len, .. } => Ok(*len),
        }
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Reads exactly `buf.len()` bytes starting at `offset`.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        match self {
            FileReader::Buffered(file) => {
                use std::os::unix::fs::FileExt;
                file.read_exact_at(buf, offset)
                    .wrap_err_with(|| format!("short read at offset {}", offset))
            }
            FileReader::Mmap { mmap, len } => {
                let end = offset
                    .checked_add(buf.len() as u64)
                    .ok_or_else(|| eyre::eyre!("read range overflows"))?;
                ensure!(
                    end <= *len,
                    "read [{}, {}) past end of file ({} bytes)",
                    offset,
                    end,
                    len
                );
                buf.copy_from_slice(&mmap[offset as usize..end as usize]);
                Ok(())
            }
            FileReader::Direct { file, len } => read_at_direct(file, *len, offset, buf),
        }
    }

    /// Hints the kernel that `[offset, offset+len)` will be read soon.
    pub fn prefetch(&self, offset: u64, len: usize) {
        if let FileReader::Mmap { mmap, len: file_len } = self {
            if offset >= *file_len {
                return;
            }
            let len = len.min((*file_len - offset) as usize);
            // SAFETY: madvise with MADV_WILLNEED is a kernel hint. The range
            // is clamped to the mapping above, and the mapping lives as long
            // as self, so the pointer arithmetic stays inside the map.
            #[cfg(unix)]
            unsafe {
                libc::madvise(
                    mmap.as_ptr().add(offset as usize) as *mut libc::c_void,
                    len,
                    libc::MADV_WILLNEED,
                );
            }
        }
    }
}

fn open_direct(path: &Path) -> Result<File> {
    // Filesystems without direct I/O support (tmpfs among them) reject
    // O_DIRECT at open; the aligned-read path works either way, so degrade
    // to a plain descriptor instead of failing the open.
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::fs::OpenOptionsExt;
        if let Ok(file) = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_DIRECT)
            .open(path)
        {
            return Ok(file);
        }
    }
    File::open(path)
        .wrap_err_with(|| format!("failed to open '{}' for direct I/O", path.display()))
}

/// Direct read through an aligned bounce buffer: rounds the range out to
/// the I/O alignment, reads the aligned span, copies the wanted bytes out.
fn read_at_direct(file: &File, file_len: u64, offset: u64, buf: &mut [u8]) -> Result<()> {
    use std::os::unix::fs::FileExt;

    let end = offset
        .checked_add(buf.len() as u64)
        .ok_or_else(|| eyre::eyre!("read range overflows"))?;
    ensure!(
        end <= file_len,
        "read [{}, {}) past end of file ({} bytes)",
        offset,
        end,
        file_len
    );

    let align = DIRECT_IO_ALIGNMENT as u64;
    let aligned_start = offset - offset % align;
    let aligned_end = end.div_ceil(align) * align;
    // The file tail is rarely alignment-sized; O_DIRECT still permits a
    // short read there, so clamp and read what exists.
    let span = (aligned_end.min(file_len.div_ceil(align) * align) - aligned_start) as usize;

    let mut scratch = AlignedBuf::new(span);
    let mut filled = 0usize;
    while filled < span {
        let n = file
            .read_at(&mut scratch.as_mut_slice()[filled..], aligned_start + filled as u64)
            .wrap_err_with(|| format!("direct read failed at offset {}", aligned_start))?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    let skip = (offset - aligned_start) as usize;
    ensure!(
        filled >= skip + buf.len(),
        "direct read returned {} bytes, needed {}",
        filled,
        skip + buf.len()
    );
    buf.copy_from_slice(&scratch.as_slice()[skip..skip + buf.len()]);
    Ok(())
}

/// Heap buffer aligned to the direct I/O boundary.
struct AlignedBuf {
    ptr: *mut u8,
    len: usize,
    layout: std::alloc::Layout,
}

impl AlignedBuf {
    fn new(len: usize) -> Self {
        let layout =
            std::alloc::Layout::from_size_align(len.max(DIRECT_IO_ALIGNMENT), DIRECT_IO_ALIGNMENT)
                .expect("alignment is a power of two and size fits isize");
        // SAFETY: layout has non-zero size (clamped to at least one
        // alignment unit above), so alloc_zeroed is well-defined. The
        // pointer is checked for null before use.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!ptr.is_null(), "aligned allocation failed");
        Self { ptr, len, layout }
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for layout.size() >= len bytes for the
        // lifetime of self, and no mutable borrow coexists (enforced by the
        // borrow checker through &self/&mut self).
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: same bounds as as_slice; &mut self guarantees exclusivity.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated with exactly this layout in new().
        unsafe { std::alloc::dealloc(self.ptr, self.layout) };
    }
}

// SAFETY: AlignedBuf owns its allocation exclusively; the raw pointer is
// never shared, so moving the buffer across threads is sound.
unsafe impl Send for AlignedBuf {}

/// Append-only writer for one attribute file of a fragment being built.
#[derive(Debug)]
pub struct FileAppender {
    path: PathBuf,
    file: File,
    offset: u64,
}

impl FileAppender {
    pub fn create(path: &Path, method: IoMethod) -> Result<Self> {
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        if method == IoMethod::Direct {
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                options.custom_flags(libc::O_SYNC);
            }
        }
        let file = options
            .open(path)
            .wrap_err_with(|| format!("failed to create '{}'", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            offset: 0,
        })
    }

    /// Appends `bytes` and returns the offset they start at.
    pub fn append(&mut self, bytes: &[u8]) -> Result<u64> {
        let offset = self.offset;
        self.file
            .write_all(bytes)
            .wrap_err_with(|| format!("failed to append to '{}'", self.path.display()))?;
        self.offset += bytes.len() as u64;
        Ok(offset)
    }

    /// Bytes appended so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sync(&self) -> Result<()> {
        self.file
            .sync_all()
            .wrap_err_with(|| format!("failed to sync '{}'", self.path.display()))
    }
}
