//! A loaded image export: the layer graph, its tag table and the working
//! directory that holds every layer's files.
//!
//! Layout of the working directory mirrors the archive, plus one expanded
//! filesystem per layer while a squash is in progress:
//!
//! ```text
//! <root>/repositories
//! <root>/<id>/{VERSION,json,layer.tar}
//! <root>/<id>/layer/          expanded layer.tar
//! ```

use crate::archive::{self, LAYER_JSON, LAYER_TAR, REPOSITORIES_FILE};
use crate::cancel::Cancellation;
use crate::error::{IoContext, SquashError, SquashResult};
use crate::graph::{Layer, LayerGraph};
use crate::layer_config::short_id;
use crate::notifier::Notifier;
use crate::tag::TagRef;
use crate::tar_extractor;
use crate::tree;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Tag name to layer id, for one repository.
pub type TagInfo = BTreeMap<String, String>;

/// Repository name to its tags.
pub type Repositories = BTreeMap<String, TagInfo>;

const EXTRACTED_LAYER_DIR: &str = "layer";

#[derive(Debug)]
pub struct Export {
    root: PathBuf,
    graph: LayerGraph,
    repositories: Repositories,
    cancel: Cancellation,
}

impl Export {
    pub(crate) fn new(root: PathBuf, graph: LayerGraph, repositories: Repositories) -> Self {
        Self {
            root,
            graph,
            repositories,
            cancel: Cancellation::new(),
        }
    }

    /// Loads an export archive from `reader`, unpacking it into `dir`.
    pub fn load<R: std::io::Read>(reader: R, dir: &Path) -> SquashResult<Self> {
        Self::load_with(reader, dir, Cancellation::new())
    }

    /// Like [`Export::load`], but unpacking, extraction, merging and packing
    /// stop with [`SquashError::Interrupted`] once `cancel` is raised.
    pub fn load_with<R: std::io::Read>(
        reader: R,
        dir: &Path,
        cancel: Cancellation,
    ) -> SquashResult<Self> {
        let mut export = archive::load(reader, dir, &cancel)?;
        export.cancel = cancel;
        Ok(export)
    }

    pub fn cancellation(&self) -> &Cancellation {
        &self.cancel
    }

    pub fn graph(&self) -> &LayerGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut LayerGraph {
        &mut self.graph
    }

    pub fn repositories(&self) -> &Repositories {
        &self.repositories
    }

    pub fn layer_path(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    pub fn tar_path(&self, id: &str) -> PathBuf {
        self.layer_path(id).join(LAYER_TAR)
    }

    pub fn json_path(&self, id: &str) -> PathBuf {
        self.layer_path(id).join(LAYER_JSON)
    }

    pub fn extract_path(&self, id: &str) -> PathBuf {
        self.layer_path(id).join(EXTRACTED_LAYER_DIR)
    }

    /// Rejects exports where one repository tags several different layers:
    /// such an export holds more than one image and the squash point would be
    /// ambiguous.
    pub fn check_single_image(&self) -> SquashResult<()> {
        for (repo, tags) in &self.repositories {
            let ids: BTreeSet<&String> = tags.values().collect();
            if ids.len() > 1 {
                return Err(SquashError::format(format!(
                    "repository {repo} tags {} different layers; this is a full repository \
                     export with multiple images in it, export a specific image id or tag instead",
                    ids.len()
                )));
            }
        }
        Ok(())
    }

    /// Picks the layer the squash starts from.
    ///
    /// An explicit `from` wins (`"root"` names the root layer). Otherwise the
    /// first layer left by an earlier squash, then the first `FROM` layer,
    /// then the root.
    pub fn resolve_start(&self, from: Option<&str>) -> SquashResult<&Layer> {
        match from {
            Some("root") => self.graph.root(),
            Some(id) => self.graph.get_by_id(id),
            None => {
                if let Some(layer) = self.graph.first_squash_marker()? {
                    return Ok(layer);
                }
                if let Some(layer) = self.graph.first_from_marker()? {
                    return Ok(layer);
                }
                self.graph.root()
            }
        }
    }

    /// Expands every layer's `layer.tar`, parents first.
    pub fn extract_layers(&mut self, notifier: &Notifier) -> SquashResult<()> {
        let ids: Vec<String> = self
            .graph
            .ancestry_order()
            .into_iter()
            .map(|l| l.id().to_string())
            .collect();
        let total = ids.len() as u64;
        let progress = notifier.create_progress_bar(total, "Extracting layers");

        for (i, id) in ids.iter().enumerate() {
            self.cancel.check()?;
            let dest = self.extract_path(id);
            let tar_path = self.tar_path(id);
            notifier.debug(&format!("Extracting layer {}", short_id(id)));
            notifier.trace(&format!(
                "Unpacking {} into {}",
                tar_path.display(),
                dest.display()
            ));
            tar_extractor::extract_layer(&tar_path, &dest, &self.cancel)?;
            if let Some(layer) = self.graph.get_mut(id) {
                layer.set_dir(Some(dest));
            }
            notifier.progress(i as u64 + 1, total, "Extracted layers");
            if let Some(pb) = &progress {
                pb.inc(1);
            }
        }
        if let Some(pb) = progress {
            pb.finish_and_clear();
        }
        Ok(())
    }

    /// Deletes the expanded layer directories, except the merged result
    /// `keep`.
    pub fn remove_extracted_layers(&mut self, keep: &str) -> SquashResult<()> {
        for layer in self.graph.layers_mut() {
            if layer.id() == keep {
                continue;
            }
            if let Some(dir) = layer.dir().map(Path::to_path_buf) {
                tree::remove_tree(&dir).with_path("Failed to remove", &dir)?;
                layer.set_dir(None);
            }
        }
        Ok(())
    }

    /// Re-packs a layer's expanded directory into its `layer.tar` and
    /// returns the archive digest.
    pub fn tar_layer(&self, id: &str) -> SquashResult<String> {
        let layer = self.graph.get_by_id(id)?;
        let dir = layer.dir().ok_or_else(|| {
            SquashError::io(
                format!("layer {} is not extracted", layer.config.short_id()),
                std::io::Error::from(std::io::ErrorKind::NotFound),
            )
        })?;
        tar_extractor::pack_layer(dir, &self.tar_path(layer.id()), &self.cancel)
    }

    /// Writes a layer's in-memory manifest back to its `json` file.
    pub fn write_layer_config(&self, id: &str) -> SquashResult<()> {
        let layer = self.graph.get_by_id(id)?;
        let path = self.json_path(layer.id());
        let json = serde_json::to_vec(&layer.config)?;
        fs::write(&path, json).with_path("Failed to write", &path)
    }

    /// Gives a layer a new id, moving its directory along with it.
    pub fn rename_layer(&mut self, old: &str, new: &str) -> SquashResult<()> {
        if old == new {
            return Ok(());
        }
        archive::validate_layer_id(new)?;
        let from = self.layer_path(old);
        let to = self.layer_path(new);
        self.graph.rename(old, new)?;
        fs::rename(&from, &to)
            .io_context(format!("Failed to move {} to {}", from.display(), to.display()))?;
        let extracted = self.extract_path(new);
        if let Some(layer) = self.graph.get_mut(new) {
            if layer.dir().is_some() {
                layer.set_dir(Some(extracted));
            }
        }
        Ok(())
    }

    /// Points `repo:tag` at `layer_id`, replacing the repository's other tags.
    pub fn tag(&mut self, tag: &TagRef, layer_id: &str) {
        let mut info = TagInfo::new();
        info.insert(tag.tag.clone(), layer_id.to_string());
        self.repositories.insert(tag.repository.clone(), info);
    }

    /// Redirects every tag that points at one of `old_ids` to `new_id`.
    pub fn retarget_tags(&mut self, old_ids: &[String], new_id: &str) {
        for tags in self.repositories.values_mut() {
            for target in tags.values_mut() {
                if old_ids.contains(target) {
                    *target = new_id.to_string();
                }
            }
        }
    }

    /// Writes the tag table to the working directory's `repositories` file.
    pub fn write_tag_table(&self) -> SquashResult<()> {
        let path = self.root.join(REPOSITORIES_FILE);
        let json = serde_json::to_vec(&self.repositories)?;
        fs::write(&path, json).with_path("Failed to write", &path)
    }

    /// Root-to-leaf walk of the active chain. `marked` flags one layer,
    /// normally the squashed one.
    pub fn history<'a>(&'a self, marked: Option<&'a str>) -> History<'a> {
        History {
            graph: &self.graph,
            next: self.graph.root().ok(),
            marked,
        }
    }

    /// Serializes the export into `writer`.
    pub fn write_to<W: Write>(&self, writer: W) -> SquashResult<W> {
        archive::write(self, writer)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub id: String,
    pub command: String,
    pub squashed: bool,
}

impl fmt::Display for HistoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arrow = if self.squashed { "->" } else { "- " };
        write!(f, "  {} {} {}", arrow, short_id(&self.id), self.command)
    }
}

/// Lazy iterator returned by [`Export::history`].
pub struct History<'a> {
    graph: &'a LayerGraph,
    next: Option<&'a Layer>,
    marked: Option<&'a str>,
}

impl Iterator for History<'_> {
    type Item = HistoryEntry;

    fn next(&mut self) -> Option<HistoryEntry> {
        let layer = self.next.take()?;
        self.next = self.graph.child_of(layer.id()).ok().flatten();
        Some(HistoryEntry {
            id: layer.id().to_string(),
            command: layer.config.short_command(),
            squashed: self.marked == Some(layer.id()),
        })
    }
}
