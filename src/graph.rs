//! In-memory forest of layers linked by parent id.
//!
//! Each [`Layer`] owns the ordered list of its children's ids. The reverse
//! direction is a separate lookup-only index from child id to parent id, so
//! nothing owns its parent and a node goes away as soon as it is detached
//! from its parent's child list and the node table.

use crate::error::{SquashError, SquashResult};
use crate::layer_config::{LayerConfig, SHORT_ID_LEN};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct Layer {
    pub config: LayerConfig,
    dir: Option<PathBuf>,
    children: Vec<String>,
}

impl Layer {
    fn new(config: LayerConfig) -> Self {
        Self {
            config,
            dir: None,
            children: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn children(&self) -> &[String] {
        &self.children
    }

    /// Directory holding the expanded filesystem, set between extraction and removal.
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn set_dir(&mut self, dir: Option<PathBuf>) {
        self.dir = dir;
    }
}

#[derive(Debug, Default)]
pub struct LayerGraph {
    nodes: BTreeMap<String, Layer>,
    parents: HashMap<String, String>,
}

impl LayerGraph {
    /// Builds the forest and validates that every parent exists and that
    /// following parents always ends at a root.
    pub fn from_configs(configs: Vec<LayerConfig>) -> SquashResult<Self> {
        let mut nodes = BTreeMap::new();
        for config in configs {
            if config.id.is_empty() {
                return Err(SquashError::format("layer manifest with an empty id"));
            }
            if nodes.contains_key(&config.id) {
                return Err(SquashError::format(format!(
                    "duplicate layer id {}",
                    config.id
                )));
            }
            nodes.insert(config.id.clone(), Layer::new(config));
        }

        let mut parents = HashMap::new();
        let links: Vec<(String, String)> = nodes
            .values()
            .filter_map(|l| l.config.parent_id().map(|p| (l.id().to_string(), p.to_string())))
            .collect();
        for (child, parent) in links {
            let parent_node = nodes.get_mut(&parent).ok_or_else(|| {
                SquashError::format(format!(
                    "layer {child} references missing parent layer {parent}"
                ))
            })?;
            // BTreeMap iteration keeps each child list sorted by id.
            parent_node.children.push(child.clone());
            parents.insert(child, parent);
        }

        let graph = Self { nodes, parents };
        graph.check_acyclic()?;
        Ok(graph)
    }

    fn check_acyclic(&self) -> SquashResult<()> {
        for id in self.nodes.keys() {
            let mut seen = HashSet::new();
            let mut current = id.as_str();
            while let Some(parent) = self.parents.get(current) {
                if !seen.insert(current) {
                    return Err(SquashError::format(format!(
                        "parent links of layer {id} form a cycle"
                    )));
                }
                current = parent.as_str();
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Layer> {
        self.nodes.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Layer> {
        self.nodes.get_mut(id)
    }

    pub fn layers_mut(&mut self) -> impl Iterator<Item = &mut Layer> {
        self.nodes.values_mut()
    }

    /// Looks a layer up by full id, or by an unambiguous prefix of at least
    /// the short id length.
    pub fn get_by_id(&self, id: &str) -> SquashResult<&Layer> {
        if let Some(layer) = self.nodes.get(id) {
            return Ok(layer);
        }
        if id.len() >= SHORT_ID_LEN {
            let mut matches = self.nodes.values().filter(|l| l.id().starts_with(id));
            if let (Some(layer), None) = (matches.next(), matches.next()) {
                return Ok(layer);
            }
        }
        Err(SquashError::not_found(format!("no layer matching {id}")))
    }

    pub fn parent_of(&self, id: &str) -> Option<&Layer> {
        self.parents.get(id).and_then(|p| self.nodes.get(p))
    }

    /// The only top-level ancestor in the graph.
    pub fn root(&self) -> SquashResult<&Layer> {
        let mut roots = self.nodes.values().filter(|l| !self.parents.contains_key(l.id()));
        match (roots.next(), roots.next()) {
            (Some(root), None) => Ok(root),
            (None, _) => Err(SquashError::format("export contains no layers")),
            (Some(a), Some(b)) => Err(SquashError::format(format!(
                "export contains more than one root layer ({} and {})",
                a.config.short_id(),
                b.config.short_id()
            ))),
        }
    }

    /// The single child of `id`, or `None` for a leaf. Branching below `id`
    /// cannot be squashed and is reported as a format error.
    pub fn child_of(&self, id: &str) -> SquashResult<Option<&Layer>> {
        let layer = self.get_by_id(id)?;
        match layer.children.as_slice() {
            [] => Ok(None),
            [child] => Ok(self.nodes.get(child)),
            many => Err(SquashError::format(format!(
                "layer {} has {} children; branching history cannot be squashed",
                layer.config.short_id(),
                many.len()
            ))),
        }
    }

    /// Ids of the active chain, root first.
    pub fn chain(&self) -> SquashResult<Vec<String>> {
        let root = self.root()?;
        let mut chain = vec![root.id().to_string()];
        chain.extend(self.descendants(root.id())?);
        Ok(chain)
    }

    /// Strict descendants of `id`, oldest to newest.
    pub fn descendants(&self, id: &str) -> SquashResult<Vec<String>> {
        let mut out = Vec::new();
        let mut current = self.get_by_id(id)?.id().to_string();
        while let Some(child) = self.child_of(&current)? {
            current = child.id().to_string();
            out.push(current.clone());
        }
        Ok(out)
    }

    pub fn leaf(&self) -> SquashResult<&Layer> {
        let chain = self.chain()?;
        let last = chain
            .last()
            .ok_or_else(|| SquashError::format("export contains no layers"))?;
        self.get_by_id(last)
    }

    fn first_in_chain(&self, pred: impl Fn(&LayerConfig) -> bool) -> SquashResult<Option<&Layer>> {
        for id in self.chain()? {
            let layer = self.get_by_id(&id)?;
            if pred(&layer.config) {
                return Ok(Some(layer));
            }
        }
        Ok(None)
    }

    /// Earliest layer produced by a previous squash.
    pub fn first_squash_marker(&self) -> SquashResult<Option<&Layer>> {
        self.first_in_chain(LayerConfig::is_squash_marker)
    }

    /// Earliest layer that starts the declared base image.
    pub fn first_from_marker(&self) -> SquashResult<Option<&Layer>> {
        self.first_in_chain(LayerConfig::is_from_marker)
    }

    /// Every layer, parents before children: roots in id order, then depth first.
    pub fn ancestry_order(&self) -> Vec<&Layer> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<&str> = self
            .nodes
            .values()
            .filter(|l| !self.parents.contains_key(l.id()))
            .map(Layer::id)
            .rev()
            .collect();
        while let Some(id) = stack.pop() {
            if let Some(layer) = self.nodes.get(id) {
                out.push(layer);
                stack.extend(layer.children.iter().rev().map(String::as_str));
            }
        }
        out
    }

    /// Removes a leaf layer from the graph and returns it.
    pub fn detach(&mut self, id: &str) -> SquashResult<Layer> {
        let layer = self
            .nodes
            .get(id)
            .ok_or_else(|| SquashError::not_found(format!("no layer matching {id}")))?;
        if !layer.children.is_empty() {
            return Err(SquashError::format(format!(
                "cannot detach layer {} while it still has children",
                layer.config.short_id()
            )));
        }
        if let Some(parent) = self.parents.remove(id) {
            if let Some(parent) = self.nodes.get_mut(&parent) {
                parent.children.retain(|c| c != id);
            }
        }
        self.nodes
            .remove(id)
            .ok_or_else(|| SquashError::not_found(format!("no layer matching {id}")))
    }

    /// Gives a layer a new identity and rewires every edge that names it.
    pub fn rename(&mut self, old: &str, new: &str) -> SquashResult<()> {
        if old == new {
            return Ok(());
        }
        if self.nodes.contains_key(new) {
            return Err(SquashError::format(format!("layer id {new} already exists")));
        }
        let mut layer = self
            .nodes
            .remove(old)
            .ok_or_else(|| SquashError::not_found(format!("no layer matching {old}")))?;
        layer.config.id = new.to_string();

        if let Some(parent) = self.parents.remove(old) {
            if let Some(parent_node) = self.nodes.get_mut(&parent) {
                for child in parent_node.children.iter_mut().filter(|c| c.as_str() == old) {
                    *child = new.to_string();
                }
                parent_node.children.sort();
            }
            self.parents.insert(new.to_string(), parent);
        }
        for child in &layer.children {
            if let Some(child_node) = self.nodes.get_mut(child) {
                child_node.config.parent = Some(new.to_string());
            }
            self.parents.insert(child.clone(), new.to_string());
        }
        self.nodes.insert(new.to_string(), layer);
        Ok(())
    }
}
