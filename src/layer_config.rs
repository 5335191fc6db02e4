//! Serde model of a legacy layer manifest (`<layer id>/json`).
//!
//! Only the fields the squasher reads or rewrites are typed; everything else
//! is captured in flattened maps so a manifest survives a load/write cycle
//! without losing keys the squasher does not know about.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Creation command fragment of a layer produced by a previous squash.
pub const SQUASH_MARKER: &str = "#(squash)";

/// Creation command fragments of a layer that starts an image (`FROM`).
pub const FROM_MARKERS: [&str; 2] = ["#(nop) ADD file:", "#(from)"];

/// Length of the abbreviated layer id used in logs and history.
pub const SHORT_ID_LEN: usize = 12;

const HISTORY_COMMAND_LEN: usize = 60;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(rename = "Cmd", default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerConfig {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_config: Option<ContainerConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ContainerConfig>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LayerConfig {
    pub fn new(id: impl Into<String>, parent: Option<&str>) -> Self {
        Self {
            id: id.into(),
            parent: parent.map(str::to_string),
            ..Default::default()
        }
    }

    /// Parent id, treating an empty string the same as a missing field.
    pub fn parent_id(&self) -> Option<&str> {
        self.parent.as_deref().filter(|p| !p.is_empty())
    }

    pub fn short_id(&self) -> &str {
        short_id(&self.id)
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created
            .as_deref()
            .and_then(|c| DateTime::parse_from_rfc3339(c).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// The config that describes how the layer was built. Older manifests
    /// only carry `config`, so fall back to it.
    pub fn build_config(&self) -> Option<&ContainerConfig> {
        self.container_config.as_ref().or(self.config.as_ref())
    }

    /// Full creation command line, or an empty string.
    pub fn command(&self) -> String {
        self.build_config()
            .and_then(|c| c.cmd.as_ref())
            .map(|cmd| cmd.join(" "))
            .unwrap_or_default()
    }

    /// Command with the shell prefix stripped, truncated for history output.
    pub fn short_command(&self) -> String {
        let command = self.command();
        let command = if let Some(rest) = command.strip_prefix("/bin/sh -c #(nop) ") {
            rest.trim_start().to_string()
        } else if let Some(rest) = command.strip_prefix("/bin/sh -c ") {
            rest.trim_start().to_string()
        } else {
            command
        };
        command.chars().take(HISTORY_COMMAND_LEN).collect()
    }

    pub fn is_squash_marker(&self) -> bool {
        self.command().contains(SQUASH_MARKER)
    }

    pub fn is_from_marker(&self) -> bool {
        let command = self.command();
        FROM_MARKERS.iter().any(|m| command.contains(m))
    }

    /// Turns this manifest into the manifest of a squashed layer whose newest
    /// merged content came from `newest`.
    ///
    /// The runtime `config` and creation time follow `newest`, since the image
    /// configuration of a legacy export lives on its last layer. The creation
    /// command becomes a squash marker so later runs start from this layer.
    pub fn mark_squashed(&mut self, newest: &LayerConfig) {
        if newest.id != self.id {
            self.config = newest.config.clone();
            self.created = newest.created.clone();
            for (key, value) in &newest.extra {
                self.extra.insert(key.clone(), value.clone());
            }
        }
        // The stored size belongs to the old content.
        self.extra.remove("Size");

        let from = self.parent_id().map(short_id).unwrap_or("scratch");
        let marker = format!("{SQUASH_MARKER} from {from}");
        let container_config = self.container_config.get_or_insert_with(Default::default);
        container_config.cmd = Some(vec!["/bin/sh".into(), "-c".into(), marker]);
    }
}

pub fn short_id(id: &str) -> &str {
    match id.char_indices().nth(SHORT_ID_LEN) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}
