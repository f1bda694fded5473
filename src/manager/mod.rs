//! # Storage Manager
//!
//! The process-level entry point: owns one workspace directory, the
//! runtime [`Config`], the shared tile cache, and the asynchronous I/O
//! pool. Multiple managers (with different workspaces and configurations)
//! may coexist in one process; nothing here is global except the writer-id
//! counter that keeps fragment names unique across managers.
//!
//! ## Directory Objects
//!
//! Every directory the manager touches is classified by its sentinel:
//!
//! | object    | sentinel                  |
//! |-----------|---------------------------|
//! | workspace | `__tiledb_workspace.tdb`  |
//! | group     | `__tiledb_group.tdb`      |
//! | array     | `__array_schema.tdb`      |
//! | metadata  | `__tiledb_metadata.tdb`   |
//!
//! Directory operations (`ls`, `clear`, `delete`, `move_to`) refuse to act
//! on anything unrecognized, so a stray `rm`-style call can never eat an
//! unrelated directory.
//!
//! ## Snapshots
//!
//! `array_init` in read mode resolves the schema by name from the array's
//! schema file, then opens every fragment in the fragment list that has a
//! commit marker. The resulting handle is a snapshot: fragments committed
//! later (including a consolidation) are invisible to it. Fragments with a
//! corrupt book-keeping file are skipped with a warning; if corruption
//! leaves nothing to read the open fails.

pub mod consolidator;

use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use eyre::{bail, ensure, Result, WrapErr};
use hashbrown::HashMap;
use log::{debug, warn};
use parking_lot::Mutex;

use crate::aio::AioPool;
use crate::array::{Array, ArrayIterator, Mode};
use crate::cache::TileCache;
use crate::config::{
    Config, GROUP_FILE_NAME, METADATA_FILE_NAME, SCHEMA_FILE_NAME, WORKSPACE_FILE_NAME,
};
use crate::fragment::{self, reader::FragmentReader};
use crate::io;
use crate::schema::ArraySchema;

/// Fragment names embed a writer id; the counter is process-global so two
/// managers over one workspace can never mint colliding names.
static NEXT_WRITER_ID: AtomicU64 = AtomicU64::new(1);

/// Classification of a directory inside the workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirType {
    Workspace,
    Group,
    Array,
    Metadata,
    None,
}

pub struct StorageManager {
    workspace: PathBuf,
    config: Config,
    cache: Arc<TileCache>,
    aio: AioPool,
    /// `(array dir, fragment name) -> uid`: keeps tile cache keys stable
    /// across every handle that opens the same fragment.
    fragment_uids: Mutex<HashMap<(PathBuf, String), u64>>,
    next_fragment_uid: AtomicU64,
}

impl StorageManager {
    /// Establishes (or re-opens) a workspace and builds the shared tile
    /// cache from the configuration.
    pub fn init<P: AsRef<Path>>(workspace: P, config: Config) -> Result<Arc<Self>> {
        config.validate()?;
        let workspace = workspace.as_ref().to_path_buf();

        if workspace.is_dir() {
            let sentinel = workspace.join(WORKSPACE_FILE_NAME);
            if !sentinel.is_file() {
                ensure!(
                    io::list_dir(&workspace)?.is_empty(),
                    "'{}' exists and is not a workspace",
                    workspace.display()
                );
                io::touch(&sentinel)?;
            }
        } else {
            io::create_dir_all(&workspace)?;
            io::touch(&workspace.join(WORKSPACE_FILE_NAME))?;
        }

        let cache = Arc::new(TileCache::new(config.tile_cache_bytes));
        debug!(
            "workspace '{}' initialized (cache {} bytes)",
            workspace.display(),
            config.tile_cache_bytes
        );
        Ok(Arc::new(Self {
            workspace,
            config,
            cache,
            aio: AioPool::new(),
            fragment_uids: Mutex::new(HashMap::new()),
            next_fragment_uid: AtomicU64::new(1),
        }))
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tile_cache(&self) -> &Arc<TileCache> {
        &self.cache
    }

    /// Maps a workspace-relative path to a filesystem path, rejecting
    /// escapes.
    fn resolve(&self, path: &str) -> Result<PathBuf> {
        ensure!(!path.is_empty(), "empty path");
        let relative = Path::new(path);
        for component in relative.components() {
            ensure!(
                matches!(component, Component::Normal(_)),
                "path '{}' must be workspace-relative without '..'",
                path
            );
        }
        Ok(self.workspace.join(relative))
    }

    /// Classifies a directory by its sentinel file.
    pub fn dir_type(&self, path: &str) -> DirType {
        let Ok(dir) = self.resolve(path) else {
            return DirType::None;
        };
        Self::dir_type_of(&dir)
    }

    fn dir_type_of(dir: &Path) -> DirType {
        if !dir.is_dir() {
            DirType::None
        } else if dir.join(WORKSPACE_FILE_NAME).is_file() {
            DirType::Workspace
        } else if dir.join(SCHEMA_FILE_NAME).is_file() {
            DirType::Array
        } else if dir.join(METADATA_FILE_NAME).is_file() {
            DirType::Metadata
        } else if dir.join(GROUP_FILE_NAME).is_file() {
            DirType::Group
        } else {
            DirType::None
        }
    }

    /// A parent under which arrays and groups may be created.
    fn ensure_container(&self, dir: &Path) -> Result<()> {
        let kind = if dir == self.workspace {
            DirType::Workspace
        } else {
            Self::dir_type_of(dir)
        };
        ensure!(
            matches!(kind, DirType::Workspace | DirType::Group),
            "'{}' is not a workspace or group",
            dir.display()
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Groups
    // ------------------------------------------------------------------

    /// Creates a group directory marked with the group sentinel.
    pub fn group_create(&self, path: &str) -> Result<()> {
        let dir = self.resolve(path)?;
        let parent = dir
            .parent()
            .ok_or_else(|| eyre::eyre!("'{}' has no parent", path))?;
        self.ensure_container(parent)?;
        io::create_dir(&dir)?;
        io::touch(&dir.join(GROUP_FILE_NAME))
    }

    // ------------------------------------------------------------------
    // Arrays
    // ------------------------------------------------------------------

    /// Creates an array: its directory, its immutable schema file, and an
    /// empty fragment list.
    pub fn array_create(&self, schema: &ArraySchema) -> Result<()> {
        let dir = self.resolve(schema.name())?;
        let parent = dir
            .parent()
            .ok_or_else(|| eyre::eyre!("'{}' has no parent", schema.name()))?;
        self.ensure_container(parent)?;
        ensure!(!dir.exists(), "array '{}' already exists", schema.name());

        io::create_dir(&dir)?;
        io::write_file_atomic(&dir.join(SCHEMA_FILE_NAME), &schema.serialize())?;
        fragment::write_fragment_list(&dir, &[])?;
        debug!("array '{}' created", schema.name());
        Ok(())
    }

    /// Loads an array's schema by name.
    pub fn array_schema(&self, name: &str) -> Result<ArraySchema> {
        let dir = self.resolve(name)?;
        ensure!(
            Self::dir_type_of(&dir) == DirType::Array,
            "'{}' is not an array",
            name
        );
        let bytes = io::read_file(&dir.join(SCHEMA_FILE_NAME))?;
        ArraySchema::load(&bytes).wrap_err_with(|| format!("corrupt schema of array '{}'", name))
    }

    fn fragment_uid(&self, array_dir: &Path, name: &str) -> u64 {
        let mut uids = self.fragment_uids.lock();
        *uids
            .entry((array_dir.to_path_buf(), name.to_string()))
            .or_insert_with(|| self.next_fragment_uid.fetch_add(1, Ordering::Relaxed))
    }

    /// Opens an array handle. Read handles snapshot the live fragment set;
    /// write handles own one (not yet created) fragment.
    pub fn array_init(
        &self,
        name: &str,
        mode: Mode,
        subarray: Option<&[i64]>,
        attrs: Option<&[&str]>,
    ) -> Result<Array> {
        let dir = self.resolve(name)?;
        ensure!(
            Self::dir_type_of(&dir) == DirType::Array,
            "'{}' is not an array",
            name
        );
        let schema = Arc::new(self.array_schema(name)?);

        let mut fragments = Vec::new();
        if mode == Mode::Read {
            let names = fragment::read_fragment_list(&dir)?;
            let mut skipped_corrupt = 0usize;
            for fragment_name in &names {
                let fragment_dir = dir.join(fragment_name);
                if !fragment::is_live(&fragment_dir) {
                    warn!(
                        "fragment '{}' of array '{}' has no commit marker; ignoring",
                        fragment_name, name
                    );
                    continue;
                }
                let uid = self.fragment_uid(&dir, fragment_name);
                match FragmentReader::open(
                    &dir,
                    fragment_name,
                    uid,
                    Arc::clone(&schema),
                    self.config.read_method,
                ) {
                    Ok(reader) => fragments.push(reader),
                    Err(report) => {
                        warn!(
                            "skipping corrupt fragment '{}' of array '{}': {:#}",
                            fragment_name, name, report
                        );
                        skipped_corrupt += 1;
                    }
                }
            }
            if skipped_corrupt > 0 && fragments.is_empty() {
                bail!(
                    "array '{}' has no readable fragments ({} corrupt)",
                    name,
                    skipped_corrupt
                );
            }
        }

        Array::new(
            schema,
            dir,
            mode,
            fragments,
            subarray,
            attrs,
            Arc::clone(&self.cache),
            self.config.write_method,
            NEXT_WRITER_ID.fetch_add(1, Ordering::Relaxed),
        )
    }

    /// Seals the handle's open fragment (if any) and closes it.
    pub fn array_finalize(&self, array: Array) -> Result<()> {
        array.finalize()?;
        Ok(())
    }

    /// Durability point for everything the handle wrote so far.
    pub fn array_sync(&self, array: &mut Array) -> Result<()> {
        array.sync()
    }

    /// Durability point for one attribute of the handle's open fragment.
    pub fn array_sync_attribute(&self, array: &mut Array, attr_name: &str) -> Result<()> {
        array.sync_attribute(attr_name)
    }

    /// Merges all live fragments of an array into one and retires the
    /// originals.
    pub fn array_consolidate(&self, name: &str) -> Result<()> {
        consolidator::consolidate(self, name)
    }

    /// Queues an asynchronous request against a shared handle; the
    /// request's completion fires exactly once with its final status.
    pub fn aio_submit(&self, array: Arc<Mutex<Array>>, request: crate::aio::AioRequest) -> u64 {
        self.aio.submit(array, request)
    }

    /// Cancels a still-queued request; running requests complete.
    pub fn aio_cancel(&self, id: u64) -> bool {
        self.aio.cancel(id)
    }

    /// Opens a cell-at-a-time iterator over an array.
    pub fn array_iterator_init(
        &self,
        name: &str,
        subarray: Option<&[i64]>,
        attrs: Option<&[&str]>,
        buffer_sizes: &[usize],
    ) -> Result<ArrayIterator> {
        let array = self.array_init(name, Mode::Read, subarray, attrs)?;
        array.into_iter_cells(buffer_sizes)
    }

    // ------------------------------------------------------------------
    // Directory operations
    // ------------------------------------------------------------------

    /// Lists the recognized objects directly under a workspace or group.
    pub fn ls(&self, path: &str) -> Result<Vec<(String, DirType)>> {
        let dir = self.resolve(path)?;
        self.ensure_container(&dir)?;
        let mut entries = Vec::new();
        for name in io::list_dir(&dir)? {
            let kind = Self::dir_type_of(&dir.join(&name));
            if kind != DirType::None {
                entries.push((name, kind));
            }
        }
        Ok(entries)
    }

    /// Lists the workspace root.
    pub fn ls_workspace(&self) -> Result<Vec<(String, DirType)>> {
        let mut entries = Vec::new();
        for name in io::list_dir(&self.workspace)? {
            let kind = Self::dir_type_of(&self.workspace.join(&name));
            if kind != DirType::None {
                entries.push((name, kind));
            }
        }
        Ok(entries)
    }

    /// Drops every cached tile and uid of the fragments under `root`
    /// (prefix match, so clearing a group covers its nested arrays).
    fn forget_fragments(&self, root: &Path) {
        let mut uids = self.fragment_uids.lock();
        let stale: Vec<(PathBuf, String)> = uids
            .keys()
            .filter(|(dir, _)| dir.starts_with(root))
            .cloned()
            .collect();
        for key in stale {
            if let Some(uid) = uids.remove(&key) {
                self.cache.evict_fragment(uid);
            }
        }
    }

    pub(crate) fn forget_fragment(&self, array_dir: &Path, name: &str) {
        let mut uids = self.fragment_uids.lock();
        if let Some(uid) = uids.remove(&(array_dir.to_path_buf(), name.to_string())) {
            self.cache.evict_fragment(uid);
        }
    }

    /// Empties a recognized object without removing it: an array loses its
    /// fragments (schema stays), a group or workspace loses its children.
    pub fn clear(&self, path: &str) -> Result<()> {
        let dir = self.resolve(path)?;
        match Self::dir_type_of(&dir) {
            DirType::Array | DirType::Metadata => {
                self.forget_fragments(&dir);
                for name in io::list_dir(&dir)? {
                    if fragment::is_fragment_name(&name) {
                        io::delete_dir(&dir.join(&name))?;
                    }
                }
                fragment::write_fragment_list(&dir, &[])
            }
            DirType::Group | DirType::Workspace => {
                for name in io::list_dir(&dir)? {
                    let child = dir.join(&name);
                    if Self::dir_type_of(&child) != DirType::None {
                        self.remove_object(&child)?;
                    }
                }
                Ok(())
            }
            DirType::None => bail!("'{}' is not a recognized object", path),
        }
    }

    fn remove_object(&self, dir: &Path) -> Result<()> {
        self.forget_fragments(dir);
        io::delete_dir(dir)
    }

    /// Deletes a group, array, or metadata directory entirely.
    pub fn delete(&self, path: &str) -> Result<()> {
        let dir = self.resolve(path)?;
        match Self::dir_type_of(&dir) {
            DirType::Array | DirType::Metadata | DirType::Group => self.remove_object(&dir),
            DirType::Workspace => bail!("refusing to delete the workspace root"),
            DirType::None => bail!("'{}' is not a recognized object", path),
        }
    }

    /// Renames a recognized object to a new workspace-relative path.
    pub fn move_to(&self, from: &str, to: &str) -> Result<()> {
        let src = self.resolve(from)?;
        match Self::dir_type_of(&src) {
            DirType::Array | DirType::Metadata | DirType::Group => {}
            DirType::Workspace => bail!("refusing to move the workspace root"),
            DirType::None => bail!("'{}' is not a recognized object", from),
        }
        let dst = self.resolve(to)?;
        ensure!(!dst.exists(), "'{}' already exists", to);
        let parent = dst
            .parent()
            .ok_or_else(|| eyre::eyre!("'{}' has no parent", to))?;
        self.ensure_container(parent)?;
        // Cached uids key on the old path; drop them rather than chase the
        // rename.
        self.forget_fragments(&src);
        io::rename(&src, &dst)
    }
}

impl std::fmt::Debug for StorageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageManager")
            .field("workspace", &self.workspace)
            .finish()
    }
}
