//! Reading and writing the legacy `docker save` export layout.
//!
//! ```text
//! repositories              {"repo": {"tag": "<layer id>"}}
//! <layer id>/VERSION        "1.0"
//! <layer id>/json           layer manifest
//! <layer id>/layer.tar      filesystem delta
//! ```
//!
//! Loading unpacks the whole archive into a working directory and builds a
//! [`LayerGraph`]; the squash engine never sees archive bytes. Writing streams
//! the graph back out, parents before children, so the output can be replayed
//! layer by layer.

use crate::cancel::Cancellation;
use crate::error::{IoContext, SquashError, SquashResult};
use crate::export::{Export, Repositories};
use crate::graph::LayerGraph;
use crate::layer_config::LayerConfig;
use crate::tar_extractor;
use std::collections::{BTreeSet, VecDeque};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;
use tar_rs as tar;

pub const REPOSITORIES_FILE: &str = "repositories";
pub const LAYER_JSON: &str = "json";
pub const LAYER_TAR: &str = "layer.tar";
pub const LAYER_VERSION: &str = "VERSION";
const DEFAULT_VERSION: &[u8] = b"1.0";
const OCI_MANIFEST_FILE: &str = "manifest.json";

/// Unpacks an export stream into `dir` and loads it.
pub fn load<R: Read>(reader: R, dir: &Path, cancel: &Cancellation) -> SquashResult<Export> {
    tar_extractor::unpack_archive(reader, dir, cancel)?;
    load_dir(dir)
}

/// Loads an already unpacked export.
///
/// Layers referenced by the tag table are loaded together with all of their
/// ancestors. An export without tags loads every layer directory present.
pub fn load_dir(dir: &Path) -> SquashResult<Export> {
    let repositories = read_repositories(dir)?;
    if dir.join(OCI_MANIFEST_FILE).exists() {
        log::warn!("{OCI_MANIFEST_FILE} is not carried over; the output uses the legacy layout only");
    }

    let mut queue: VecDeque<String> = if repositories.is_empty() {
        layer_dirs(dir)?.into_iter().collect()
    } else {
        repositories
            .values()
            .flat_map(|tags| tags.values().cloned())
            .collect()
    };

    let mut seen = BTreeSet::new();
    let mut configs = Vec::new();
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id.clone()) {
            continue;
        }
        let config = read_layer_config(dir, &id)?;
        if let Some(parent) = config.parent_id() {
            queue.push_back(parent.to_string());
        }
        configs.push(config);
    }

    let graph = LayerGraph::from_configs(configs)?;
    log::debug!("Loaded {} layers from {}", graph.len(), dir.display());
    Ok(Export::new(dir.to_path_buf(), graph, repositories))
}

fn read_repositories(dir: &Path) -> SquashResult<Repositories> {
    let path = dir.join(REPOSITORIES_FILE);
    if !path.exists() {
        return Ok(Repositories::new());
    }
    let content = fs::read_to_string(&path).with_path("Failed to read", &path)?;
    serde_json::from_str(&content)
        .map_err(|e| SquashError::format(format!("invalid {REPOSITORIES_FILE} file: {e}")))
}

/// Directory names holding a layer manifest.
fn layer_dirs(dir: &Path) -> SquashResult<Vec<String>> {
    let mut ids = Vec::new();
    for entry in fs::read_dir(dir).with_path("Failed to read directory", dir)? {
        let entry = entry.with_path("Failed to read directory", dir)?;
        if !entry.path().join(LAYER_JSON).is_file() {
            continue;
        }
        match entry.file_name().into_string() {
            Ok(id) => ids.push(id),
            Err(name) => log::warn!("Skipping non UTF-8 directory {:?}", name),
        }
    }
    ids.sort();
    Ok(ids)
}

/// Rejects ids that could escape the export directory.
pub fn validate_layer_id(id: &str) -> SquashResult<()> {
    if id.is_empty() || id.starts_with('.') || id.contains(['/', '\\']) {
        return Err(SquashError::format(format!("invalid layer id {id:?}")));
    }
    Ok(())
}

fn read_layer_config(dir: &Path, id: &str) -> SquashResult<LayerConfig> {
    validate_layer_id(id)?;
    let layer_dir = dir.join(id);
    let json_path = layer_dir.join(LAYER_JSON);
    let content = fs::read_to_string(&json_path).map_err(|_| {
        SquashError::format(format!("manifest for layer {id} is missing from the export"))
    })?;
    let config: LayerConfig = serde_json::from_str(&content)
        .map_err(|e| SquashError::format(format!("malformed manifest for layer {id}: {e}")))?;
    if config.id != id {
        return Err(SquashError::format(format!(
            "manifest in directory {id} declares id {}",
            config.id
        )));
    }
    if !layer_dir.join(LAYER_TAR).is_file() {
        return Err(SquashError::format(format!(
            "{LAYER_TAR} for layer {id} is missing from the export"
        )));
    }
    Ok(config)
}

fn header(size: u64, mode: u32, mtime: u64, kind: tar::EntryType) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(kind);
    header.set_size(size);
    header.set_mode(mode);
    header.set_mtime(mtime);
    header.set_uid(0);
    header.set_gid(0);
    header
}

/// Serializes the export to `writer` and hands the writer back.
///
/// Entry headers carry fixed ownership and modes, and each layer's entries
/// use its creation time, so the same export always writes the same bytes.
pub fn write<W: Write>(export: &Export, writer: W) -> SquashResult<W> {
    let mut builder = tar::Builder::new(writer);

    for layer in export.graph().ancestry_order() {
        export.cancellation().check()?;
        let id = layer.id();
        let mtime = layer
            .config
            .created_at()
            .map(|t| t.timestamp().max(0) as u64)
            .unwrap_or(0);

        let mut dir_header = header(0, 0o755, mtime, tar::EntryType::Directory);
        builder
            .append_data(&mut dir_header, format!("{id}/"), std::io::empty())
            .io_context(format!("Failed to write layer {id}"))?;

        let version_path = export.layer_path(id).join(LAYER_VERSION);
        let version = fs::read(&version_path).unwrap_or_else(|_| DEFAULT_VERSION.to_vec());
        let mut version_header = header(version.len() as u64, 0o644, mtime, tar::EntryType::Regular);
        builder
            .append_data(&mut version_header, format!("{id}/{LAYER_VERSION}"), version.as_slice())
            .io_context(format!("Failed to write layer {id}"))?;

        let json = serde_json::to_vec(&layer.config)?;
        let mut json_header = header(json.len() as u64, 0o644, mtime, tar::EntryType::Regular);
        builder
            .append_data(&mut json_header, format!("{id}/{LAYER_JSON}"), json.as_slice())
            .io_context(format!("Failed to write layer {id}"))?;

        let tar_path = export.tar_path(id);
        let file = File::open(&tar_path).with_path("Failed to open", &tar_path)?;
        let size = file
            .metadata()
            .with_path("Failed to stat", &tar_path)?
            .len();
        let mut tar_header = header(size, 0o644, mtime, tar::EntryType::Regular);
        builder
            .append_data(&mut tar_header, format!("{id}/{LAYER_TAR}"), file)
            .io_context(format!("Failed to write layer {id}"))?;
    }

    if !export.repositories().is_empty() {
        let repositories = serde_json::to_vec(export.repositories())?;
        let mut repo_header = header(repositories.len() as u64, 0o644, 0, tar::EntryType::Regular);
        builder
            .append_data(&mut repo_header, REPOSITORIES_FILE, repositories.as_slice())
            .io_context("Failed to write repositories")?;
    }

    let mut writer = builder.into_inner().io_context("Failed to finish image archive")?;
    writer.flush().io_context("Failed to flush image archive")?;
    Ok(writer)
}
