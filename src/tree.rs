//! Whiteout-aware merging of layer filesystem trees.
//!
//! A layer is a filesystem delta: regular entries add or replace paths, and
//! two kinds of marker entries delete paths from the layers below.
//! - `.wh.<name>` removes `<name>` from the same directory.
//! - `.wh..wh..opq` hides everything below its directory.
//!
//! [`overlay`] applies one newer layer onto an accumulated target. It works
//! on anything implementing [`LayerTree`]: [`DiskTree`] for expanded layer
//! directories and [`MemTree`] for reasoning about merges without touching
//! the filesystem.
//!
//! The newer layer becomes the result. Its markers are applied to the target
//! first, then every target entry the newer layer does not shadow is moved
//! underneath it. Moving instead of copying means files, special nodes and
//! ownership are never rewritten, and directories present in both layers
//! naturally carry the newer layer's metadata.

use crate::error::{IoContext, SquashError, SquashResult};
use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::fs::{self, File, FileTimes};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

pub const WHITEOUT_PREFIX: &str = ".wh.";
pub const OPAQUE_MARKER: &str = ".wh..wh..opq";
/// Prefix of aufs bookkeeping entries (`.wh..wh.plnk`, `.wh..wh.aufs`).
const AUFS_META_PREFIX: &str = ".wh..wh.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Dir,
    /// Anything that is not a real directory, symlinks to directories included.
    Other,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Marker<'a> {
    /// Hides all lower entries of the containing directory.
    Opaque,
    /// Deletes the named sibling.
    Whiteout(&'a OsStr),
    /// aufs internal entry, never part of the image content.
    AufsMeta,
    /// A whiteout naming `.` or `..`, which would reach outside its directory.
    Invalid,
}

/// Classifies a directory entry name.
pub fn marker(name: &OsStr) -> Option<Marker<'_>> {
    let bytes = name.as_bytes();
    if bytes == OPAQUE_MARKER.as_bytes() {
        return Some(Marker::Opaque);
    }
    if bytes.starts_with(AUFS_META_PREFIX.as_bytes()) {
        return Some(Marker::AufsMeta);
    }
    match bytes.strip_prefix(WHITEOUT_PREFIX.as_bytes()) {
        Some(b".") | Some(b"..") => Some(Marker::Invalid),
        Some(target) if !target.is_empty() => Some(Marker::Whiteout(OsStr::from_bytes(target))),
        _ => None,
    }
}

fn whiteout_name(name: &OsStr) -> OsString {
    let mut out = OsString::from(WHITEOUT_PREFIX);
    out.push(name);
    out
}

/// A filesystem tree the merge algorithm can inspect and rearrange.
///
/// Paths are relative to the tree root; the empty path is the root itself.
pub trait LayerTree: Sized {
    /// Entries directly under `dir`, sorted by name. Empty when `dir` is not
    /// a real directory.
    fn list(&self, dir: &Path) -> SquashResult<Vec<(OsString, NodeKind)>>;

    fn kind(&self, path: &Path) -> SquashResult<Option<NodeKind>>;

    /// Removes `path` and everything below it. Missing paths are ignored.
    fn remove(&mut self, path: &Path) -> SquashResult<()>;

    /// Creates an empty regular file used as a marker.
    fn create_marker(&mut self, path: &Path) -> SquashResult<()>;

    /// Moves the subtree at `path` into `target` at the same relative path.
    /// The parent of `path` must already be a directory in `target`.
    fn move_into(&mut self, path: &Path, target: &mut Self) -> SquashResult<()>;

    /// Replaces this tree with `other`.
    fn replace_with(&mut self, other: Self) -> SquashResult<()>;

    fn begin_overlay(&mut self) -> SquashResult<()> {
        Ok(())
    }

    fn end_overlay(&mut self) -> SquashResult<()> {
        Ok(())
    }
}

/// Merges `layer` on top of `target`; afterwards `target` holds the result.
///
/// With `keep_markers` set, consumed markers stay in the result so they keep
/// masking content in layers below the target. Without it the result holds
/// no markers from `layer`.
pub fn overlay<T: LayerTree>(target: &mut T, mut layer: T, keep_markers: bool) -> SquashResult<()> {
    layer.begin_overlay()?;
    apply_markers(target, &mut layer, Path::new(""), true, keep_markers)?;
    underlay(target, &mut layer, Path::new(""))?;
    layer.end_overlay()?;
    target.replace_with(layer)
}

/// Removes every marker entry from `tree`.
pub fn strip_markers<T: LayerTree>(tree: &mut T) -> SquashResult<()> {
    tree.begin_overlay()?;
    strip_markers_in(tree, Path::new(""))?;
    tree.end_overlay()
}

fn strip_markers_in<T: LayerTree>(tree: &mut T, dir: &Path) -> SquashResult<()> {
    for (name, kind) in tree.list(dir)? {
        let path = dir.join(&name);
        if marker(&name).is_some() {
            tree.remove(&path)?;
        } else if kind == NodeKind::Dir {
            strip_markers_in(tree, &path)?;
        }
    }
    Ok(())
}

fn apply_markers<T: LayerTree>(
    target: &mut T,
    layer: &mut T,
    dir: &Path,
    target_live: bool,
    keep_markers: bool,
) -> SquashResult<()> {
    // Below a path that is not a real directory in the target there is
    // nothing to delete, but markers still have to be consumed.
    let target_live = target_live && target.kind(dir)? == Some(NodeKind::Dir)
        || dir.as_os_str().is_empty();

    for (name, kind) in layer.list(dir)? {
        let path = dir.join(&name);
        match marker(&name) {
            Some(Marker::Opaque) => {
                if target_live {
                    log::trace!("opaque directory {}", dir.display());
                    for (child, _) in target.list(dir)? {
                        target.remove(&dir.join(child))?;
                    }
                }
                if !keep_markers {
                    layer.remove(&path)?;
                }
            }
            Some(Marker::Whiteout(victim)) => {
                if target_live {
                    log::trace!("whiteout {}", dir.join(victim).display());
                    target.remove(&dir.join(victim))?;
                }
                if !keep_markers {
                    layer.remove(&path)?;
                }
            }
            Some(Marker::AufsMeta) => layer.remove(&path)?,
            Some(Marker::Invalid) => {
                return Err(SquashError::format(format!(
                    "invalid whiteout entry {}",
                    path.display()
                )));
            }
            None if kind == NodeKind::Dir => {
                apply_markers(target, layer, &path, target_live, keep_markers)?;
            }
            None => {}
        }
    }
    Ok(())
}

fn underlay<T: LayerTree>(target: &mut T, layer: &mut T, dir: &Path) -> SquashResult<()> {
    for (name, target_kind) in target.list(dir)? {
        let path = dir.join(&name);
        match layer.kind(&path)? {
            None => {
                if let Some(Marker::Whiteout(victim)) = marker(&name) {
                    let revived = dir.join(victim);
                    if let Some(kind) = layer.kind(&revived)? {
                        // The path was deleted below and re-created by the
                        // newer layer. A re-created directory must still
                        // hide what the deleted one contained.
                        let opaque = revived.join(OPAQUE_MARKER);
                        if kind == NodeKind::Dir && layer.kind(&opaque)?.is_none() {
                            layer.create_marker(&opaque)?;
                        }
                        continue;
                    }
                }
                target.move_into(&path, layer)?;
            }
            Some(NodeKind::Dir) if target_kind == NodeKind::Dir => {
                underlay(target, layer, &path)?;
            }
            // The newer entry shadows the older one.
            Some(_) => {}
        }
    }
    Ok(())
}

/// Removes a directory tree, making directories writable first if the
/// owner bits of an extracted layer prevent deletion.
pub fn remove_tree(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            make_dirs_writable(path)?;
            fs::remove_dir_all(path)
        }
        Err(e) => Err(e),
    }
}

fn make_dirs_writable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    for entry in WalkDir::new(path).follow_links(false) {
        let entry = entry?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let mode = entry.metadata()?.permissions().mode();
        if mode & 0o700 != 0o700 {
            fs::set_permissions(entry.path(), fs::Permissions::from_mode(mode | 0o700))?;
        }
    }
    Ok(())
}

/// Entries strictly below `root` with their paths relative to it. Parents
/// come before children and siblings are sorted by name. Symlinks are not
/// followed.
pub(crate) fn walk(root: &Path) -> impl Iterator<Item = SquashResult<(PathBuf, DirEntry)>> + '_ {
    WalkDir::new(root)
        .follow_links(false)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .map(move |entry| -> SquashResult<(PathBuf, DirEntry)> {
            let entry = entry?;
            let rel = entry
                .path()
                .strip_prefix(root)
                .map_err(|e| {
                    SquashError::io(
                        format!("Failed to relativize {}", entry.path().display()),
                        io::Error::other(e),
                    )
                })?
                .to_path_buf();
            Ok((rel, entry))
        })
}

/// An expanded layer directory on disk.
#[derive(Debug)]
pub struct DiskTree {
    root: PathBuf,
    saved_times: Vec<(PathBuf, FileTimes)>,
}

impl DiskTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            saved_times: Vec::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn abs(&self, path: &Path) -> PathBuf {
        if path.as_os_str().is_empty() {
            self.root.clone()
        } else {
            self.root.join(path)
        }
    }

    fn save_dir_times(&mut self, dir: &Path, meta: &fs::Metadata) -> SquashResult<()> {
        let accessed = meta.accessed().with_path("Failed to read atime of", dir)?;
        let modified = meta.modified().with_path("Failed to read mtime of", dir)?;
        self.saved_times.push((
            dir.to_path_buf(),
            FileTimes::new().set_accessed(accessed).set_modified(modified),
        ));
        Ok(())
    }
}

impl LayerTree for DiskTree {
    fn list(&self, dir: &Path) -> SquashResult<Vec<(OsString, NodeKind)>> {
        let abs = self.abs(dir);
        if self.kind(dir)? != Some(NodeKind::Dir) {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in fs::read_dir(&abs).with_path("Failed to read directory", &abs)? {
            let entry = entry.with_path("Failed to read directory", &abs)?;
            let file_type = entry
                .file_type()
                .with_path("Failed to stat", &entry.path())?;
            let kind = if file_type.is_dir() {
                NodeKind::Dir
            } else {
                NodeKind::Other
            };
            out.push((entry.file_name(), kind));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    fn kind(&self, path: &Path) -> SquashResult<Option<NodeKind>> {
        let abs = self.abs(path);
        match fs::symlink_metadata(&abs) {
            Ok(meta) if meta.is_dir() => Ok(Some(NodeKind::Dir)),
            Ok(_) => Ok(Some(NodeKind::Other)),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
                ) =>
            {
                Ok(None)
            }
            Err(e) => Err(SquashError::io(format!("Failed to stat {}", abs.display()), e)),
        }
    }

    fn remove(&mut self, path: &Path) -> SquashResult<()> {
        let abs = self.abs(path);
        match self.kind(path)? {
            Some(NodeKind::Dir) => remove_tree(&abs).with_path("Failed to remove", &abs),
            Some(NodeKind::Other) => fs::remove_file(&abs).with_path("Failed to remove", &abs),
            None => Ok(()),
        }
    }

    fn create_marker(&mut self, path: &Path) -> SquashResult<()> {
        let abs = self.abs(path);
        File::create(&abs)
            .map(drop)
            .with_path("Failed to create marker", &abs)
    }

    fn move_into(&mut self, path: &Path, target: &mut Self) -> SquashResult<()> {
        let from = self.abs(path);
        let to = target.abs(path);
        fs::rename(&from, &to)
            .io_context(format!("Failed to move {} to {}", from.display(), to.display()))
    }

    fn replace_with(&mut self, other: Self) -> SquashResult<()> {
        remove_tree(&self.root).with_path("Failed to remove", &self.root)?;
        fs::rename(&other.root, &self.root).io_context(format!(
            "Failed to move {} to {}",
            other.root.display(),
            self.root.display()
        ))?;
        self.saved_times.clear();
        Ok(())
    }

    /// Remembers directory timestamps, which moving entries in and out of a
    /// directory would otherwise bump.
    fn begin_overlay(&mut self) -> SquashResult<()> {
        self.saved_times.clear();
        let root = self.root.clone();
        let meta = fs::symlink_metadata(&root).with_path("Failed to stat", &root)?;
        self.save_dir_times(&root, &meta)?;
        for item in walk(&root) {
            let (_, entry) = item?;
            if entry.file_type().is_dir() {
                let meta = entry.metadata()?;
                self.save_dir_times(entry.path(), &meta)?;
            }
        }
        Ok(())
    }

    fn end_overlay(&mut self) -> SquashResult<()> {
        for (dir, times) in self.saved_times.drain(..) {
            let restored = File::open(&dir).and_then(|f| f.set_times(times));
            if let Err(e) = restored {
                log::warn!("Failed to restore timestamps of {}: {}", dir.display(), e);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemEntry {
    Dir,
    File(Vec<u8>),
    Symlink(PathBuf),
}

/// A layer tree held in memory, keyed by relative path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemTree {
    entries: BTreeMap<PathBuf, MemEntry>,
}

impl MemTree {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_parents(&mut self, path: &Path) {
        let mut parent = path.parent();
        while let Some(dir) = parent {
            if dir.as_os_str().is_empty() {
                break;
            }
            self.entries
                .entry(dir.to_path_buf())
                .or_insert(MemEntry::Dir);
            parent = dir.parent();
        }
    }

    pub fn insert(&mut self, path: impl AsRef<Path>, entry: MemEntry) -> &mut Self {
        let path = path.as_ref();
        self.ensure_parents(path);
        self.entries.insert(path.to_path_buf(), entry);
        self
    }

    pub fn dir(mut self, path: impl AsRef<Path>) -> Self {
        self.insert(path, MemEntry::Dir);
        self
    }

    pub fn file(mut self, path: impl AsRef<Path>, contents: impl Into<Vec<u8>>) -> Self {
        self.insert(path, MemEntry::File(contents.into()));
        self
    }

    pub fn symlink(mut self, path: impl AsRef<Path>, target: impl Into<PathBuf>) -> Self {
        self.insert(path, MemEntry::Symlink(target.into()));
        self
    }

    /// Adds a whiteout entry deleting `path`.
    pub fn whiteout(self, path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let name = whiteout_name(path.file_name().unwrap_or_default());
        let marker = path.with_file_name(name);
        self.file(marker, Vec::new())
    }

    /// Marks directory `dir` opaque.
    pub fn opaque(self, dir: impl AsRef<Path>) -> Self {
        let marker = dir.as_ref().join(OPAQUE_MARKER);
        self.file(marker, Vec::new())
    }

    pub fn get(&self, path: impl AsRef<Path>) -> Option<&MemEntry> {
        self.entries.get(path.as_ref())
    }

    pub fn entries(&self) -> &BTreeMap<PathBuf, MemEntry> {
        &self.entries
    }

    /// Paths of all entries, sorted.
    pub fn paths(&self) -> Vec<String> {
        self.entries
            .keys()
            .map(|p| p.to_string_lossy().into_owned())
            .collect()
    }

    /// Reads an expanded layer directory. Special files are recorded as
    /// empty regular files.
    pub fn load(root: &Path) -> SquashResult<Self> {
        let mut tree = Self::new();
        for item in walk(root) {
            let (path, entry) = item?;
            let file_type = entry.file_type();
            let node = if file_type.is_dir() {
                MemEntry::Dir
            } else if file_type.is_symlink() {
                let target = fs::read_link(entry.path())
                    .with_path("Failed to read link", entry.path())?;
                MemEntry::Symlink(target)
            } else if file_type.is_file() {
                MemEntry::File(fs::read(entry.path()).with_path("Failed to read", entry.path())?)
            } else {
                MemEntry::File(Vec::new())
            };
            tree.entries.insert(path, node);
        }
        Ok(tree)
    }
}

impl LayerTree for MemTree {
    fn list(&self, dir: &Path) -> SquashResult<Vec<(OsString, NodeKind)>> {
        if !dir.as_os_str().is_empty() && self.entries.get(dir) != Some(&MemEntry::Dir) {
            return Ok(Vec::new());
        }
        let mut out: Vec<(OsString, NodeKind)> = self
            .entries
            .iter()
            .filter(|(path, _)| path.parent() == Some(dir))
            .filter_map(|(path, entry)| {
                let kind = match entry {
                    MemEntry::Dir => NodeKind::Dir,
                    _ => NodeKind::Other,
                };
                path.file_name().map(|name| (name.to_os_string(), kind))
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    fn kind(&self, path: &Path) -> SquashResult<Option<NodeKind>> {
        if path.as_os_str().is_empty() {
            return Ok(Some(NodeKind::Dir));
        }
        Ok(self.entries.get(path).map(|entry| match entry {
            MemEntry::Dir => NodeKind::Dir,
            _ => NodeKind::Other,
        }))
    }

    fn remove(&mut self, path: &Path) -> SquashResult<()> {
        self.entries.retain(|p, _| !p.starts_with(path));
        Ok(())
    }

    fn create_marker(&mut self, path: &Path) -> SquashResult<()> {
        self.insert(path, MemEntry::File(Vec::new()));
        Ok(())
    }

    fn move_into(&mut self, path: &Path, target: &mut Self) -> SquashResult<()> {
        let moved: Vec<PathBuf> = self
            .entries
            .keys()
            .filter(|p| p.starts_with(path))
            .cloned()
            .collect();
        for p in moved {
            if let Some(entry) = self.entries.remove(&p) {
                target.entries.insert(p, entry);
            }
        }
        Ok(())
    }

    fn replace_with(&mut self, other: Self) -> SquashResult<()> {
        *self = other;
        Ok(())
    }
}
