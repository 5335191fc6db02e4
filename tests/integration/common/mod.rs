//! Builders for synthetic image exports and helpers to read results back.

use anyhow::Result;
use imgsquash::layer_config::ContainerConfig;
use imgsquash::tree::{self, MemEntry, MemTree};
use imgsquash::{Export, LayerConfig, Notifier, Repositories};
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tar_rs as tar;
use tempfile::TempDir;

/// Fixed entry time so identical inputs produce identical archives.
pub const MTIME: u64 = 1_600_000_000;

pub fn layer_id(c: char) -> String {
    c.to_string().repeat(64)
}

pub struct TestLayer {
    pub config: LayerConfig,
    pub tree: MemTree,
}

impl TestLayer {
    pub fn new(c: char, parent: Option<char>, cmd: &str, tree: MemTree) -> Self {
        let parent = parent.map(layer_id);
        let mut config = LayerConfig::new(layer_id(c), parent.as_deref());
        config.created = Some(format!("2023-01-01T0{}:00:00Z", (c as u8 - b'a') % 10));
        config.container_config = Some(ContainerConfig {
            cmd: Some(vec!["/bin/sh".into(), "-c".into(), cmd.into()]),
            ..Default::default()
        });
        Self { config, tree }
    }
}

/// Writes an export archive holding `layers` and the given tags.
pub struct ExportBuilder {
    layers: Vec<TestLayer>,
    repositories: Repositories,
    uid: u64,
    gid: u64,
}

impl ExportBuilder {
    pub fn new(owner: &Path) -> Result<Self> {
        // Entries are owned by the test user so extraction can restore ownership.
        let meta = fs::metadata(owner)?;
        Ok(Self {
            layers: Vec::new(),
            repositories: Repositories::new(),
            uid: meta.uid() as u64,
            gid: meta.gid() as u64,
        })
    }

    pub fn layer(mut self, layer: TestLayer) -> Self {
        self.layers.push(layer);
        self
    }

    pub fn tag(mut self, repo: &str, tag: &str, id: &str) -> Self {
        self.repositories
            .entry(repo.to_string())
            .or_default()
            .insert(tag.to_string(), id.to_string());
        self
    }

    fn header(&self, kind: tar::EntryType, mode: u32, size: u64) -> tar::Header {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(kind);
        header.set_mode(mode);
        header.set_size(size);
        header.set_mtime(MTIME);
        header.set_uid(self.uid);
        header.set_gid(self.gid);
        header
    }

    fn layer_tar(&self, tree: &MemTree) -> Result<Vec<u8>> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, entry) in tree.entries() {
            match entry {
                MemEntry::Dir => {
                    let mut header = self.header(tar::EntryType::Directory, 0o755, 0);
                    builder.append_data(&mut header, path, std::io::empty())?;
                }
                MemEntry::File(data) => {
                    let mut header =
                        self.header(tar::EntryType::Regular, 0o644, data.len() as u64);
                    builder.append_data(&mut header, path, data.as_slice())?;
                }
                MemEntry::Symlink(target) => {
                    let mut header = self.header(tar::EntryType::Symlink, 0o777, 0);
                    builder.append_link(&mut header, path, target)?;
                }
            }
        }
        Ok(builder.into_inner()?)
    }

    pub fn build(&self) -> Result<Vec<u8>> {
        let mut builder = tar::Builder::new(Vec::new());
        for layer in &self.layers {
            let id = &layer.config.id;
            let mut header = self.header(tar::EntryType::Directory, 0o755, 0);
            builder.append_data(&mut header, format!("{id}/"), std::io::empty())?;

            let files = [
                ("VERSION", b"1.0".to_vec()),
                ("json", serde_json::to_vec(&layer.config)?),
                ("layer.tar", self.layer_tar(&layer.tree)?),
            ];
            for (name, data) in files {
                let mut header =
                    self.header(tar::EntryType::Regular, 0o644, data.len() as u64);
                builder.append_data(&mut header, format!("{id}/{name}"), data.as_slice())?;
            }
        }
        if !self.repositories.is_empty() {
            let data = serde_json::to_vec(&self.repositories)?;
            let mut header = self.header(tar::EntryType::Regular, 0o644, data.len() as u64);
            builder.append_data(&mut header, "repositories", data.as_slice())?;
        }
        Ok(builder.into_inner()?)
    }

    pub fn write_to(&self, path: &Path) -> Result<PathBuf> {
        fs::write(path, self.build()?)?;
        Ok(path.to_path_buf())
    }
}

/// A squashed export read back from disk with every layer expanded.
pub struct Loaded {
    _dir: TempDir,
    pub export: Export,
}

impl Loaded {
    pub fn read(archive: &Path) -> Result<Self> {
        let dir = TempDir::new()?;
        let mut export = Export::load(fs::File::open(archive)?, dir.path())?;
        export.extract_layers(&Notifier::new(0))?;
        Ok(Self { _dir: dir, export })
    }

    /// Layer ids root to leaf.
    pub fn chain(&self) -> Result<Vec<String>> {
        Ok(self.export.graph().chain()?)
    }

    pub fn tree(&self, id: &str) -> Result<MemTree> {
        let layer = self.export.graph().get_by_id(id)?;
        let dir = layer
            .dir()
            .ok_or_else(|| anyhow::anyhow!("layer {id} was not extracted"))?;
        Ok(MemTree::load(dir)?)
    }

    pub fn config(&self, id: &str) -> Result<LayerConfig> {
        Ok(self.export.graph().get_by_id(id)?.config.clone())
    }

    /// Filesystem an image runtime would see: every layer stacked in order.
    pub fn flattened(&self) -> Result<MemTree> {
        let trees = self
            .chain()?
            .iter()
            .map(|id| self.tree(id))
            .collect::<Result<Vec<_>>>()?;
        Ok(flatten(trees))
    }
}

/// Reference result of stacking `layers` oldest first.
pub fn flatten(layers: Vec<MemTree>) -> MemTree {
    let mut layers = layers.into_iter();
    let mut acc = layers.next().unwrap_or_default();
    tree::strip_markers(&mut acc).unwrap();
    for layer in layers {
        tree::overlay(&mut acc, layer, false).unwrap();
    }
    acc
}
