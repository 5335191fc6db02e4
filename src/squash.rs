//! Folding a run of layers into one.
//!
//! [`squash_layers`] merges every descendant of a start layer into the start
//! layer's expanded directory, oldest first, using [`crate::tree::overlay`].
//! The merged layer then takes the manifest of the newest descendant, is
//! re-packed, and gets a content-derived id so the same input always yields
//! the same output. The descendants disappear from the graph and any tag that
//! pointed at the chain now points at the merged layer.

use crate::error::{SquashError, SquashResult};
use crate::export::Export;
use crate::layer_config::short_id;
use crate::notifier::Notifier;
use crate::tree::{self, DiskTree};
use sha2::{Digest, Sha256};
use std::io;
use std::path::PathBuf;

/// Id of a squashed layer: the sha256 of its parent id followed by the
/// digest of its repacked `layer.tar`.
pub fn squashed_layer_id(parent: Option<&str>, tar_digest: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parent.unwrap_or_default().as_bytes());
    hasher.update(tar_digest.as_bytes());
    hex::encode(hasher.finalize())
}

/// Merges every descendant of `start` into it and returns the id of the
/// resulting layer.
///
/// All layers from `start` down must already be extracted. When `start` has
/// no descendants nothing changes and its id is returned as is.
pub fn squash_layers(export: &mut Export, start: &str, notifier: &Notifier) -> SquashResult<String> {
    let start = export.graph().get_by_id(start)?.id().to_string();
    let descendants = export.graph().descendants(&start)?;
    if descendants.is_empty() {
        notifier.info(&format!(
            "Layer {} has no descendants, nothing to squash",
            short_id(&start)
        ));
        return Ok(start);
    }

    let start_dir = extracted_dir(export, &start)?;
    let mut layer_dirs = Vec::with_capacity(descendants.len());
    for id in &descendants {
        layer_dirs.push(extracted_dir(export, id)?);
    }

    // Whiteouts in the merged layer must keep hiding content of the layers
    // below it. A root layer has nothing below, so its markers are dropped.
    let keep_markers = export.graph().parent_of(&start).is_some();
    let mut target = DiskTree::new(start_dir);
    if !keep_markers {
        tree::strip_markers(&mut target)?;
    }

    notifier.info(&format!(
        "Squashing {} layers into {}",
        descendants.len(),
        short_id(&start)
    ));
    let total = descendants.len() as u64;
    let progress = notifier.create_progress_bar(total, "Merging layers");
    for (i, (id, dir)) in descendants.iter().zip(layer_dirs).enumerate() {
        export.cancellation().check()?;
        notifier.debug(&format!("Merging layer {}", short_id(id)));
        tree::overlay(&mut target, DiskTree::new(dir), keep_markers)?;
        if let Some(layer) = export.graph_mut().get_mut(id) {
            layer.set_dir(None);
        }
        notifier.progress(i as u64 + 1, total, "Merged layers");
        if let Some(pb) = &progress {
            pb.inc(1);
        }
    }
    if let Some(pb) = progress {
        pb.finish_and_clear();
    }

    let newest = export
        .graph()
        .get_by_id(&descendants[descendants.len() - 1])?
        .config
        .clone();
    if let Some(layer) = export.graph_mut().get_mut(&start) {
        layer.config.mark_squashed(&newest);
    }
    for id in descendants.iter().rev() {
        export.graph_mut().detach(id)?;
        let dir = export.layer_path(id);
        if let Err(e) = tree::remove_tree(&dir) {
            notifier.warn(&format!("Failed to remove {}: {}", dir.display(), e));
        }
    }

    notifier.info(&format!("Packing squashed layer {}", short_id(&start)));
    let digest = export.tar_layer(&start)?;
    let parent = export.graph().parent_of(&start).map(|p| p.id().to_string());
    let new_id = squashed_layer_id(parent.as_deref(), &digest);
    notifier.debug(&format!(
        "Squashed layer {} becomes {}",
        short_id(&start),
        short_id(&new_id)
    ));

    export.rename_layer(&start, &new_id)?;
    export.write_layer_config(&new_id)?;

    let mut replaced = descendants;
    replaced.push(start);
    export.retarget_tags(&replaced, &new_id);
    Ok(new_id)
}

fn extracted_dir(export: &Export, id: &str) -> SquashResult<PathBuf> {
    match export.graph().get(id).and_then(|l| l.dir()) {
        Some(dir) if dir.is_dir() => Ok(dir.to_path_buf()),
        _ => Err(SquashError::io(
            format!("layer {} has not been extracted", short_id(id)),
            io::Error::from(io::ErrorKind::NotFound),
        )),
    }
}
