//! OCI runtime spec types.
//!
//! Only the fields the supervisor inspects are typed. Everything else is kept
//! in the flattened `extra` maps so a spec is persisted exactly as received.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

/// Name of the persisted spec inside a bundle or container directory.
pub const CONFIG_FILENAME: &str = "config.json";

/// Container runtime spec (`config.json`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSpec {
    #[serde(default)]
    pub oci_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<Root>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<ProcessSpec>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linux: Option<Linux>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Root {
    pub path: String,
    #[serde(default)]
    pub readonly: bool,
}

/// Process section of a runtime spec, also the payload of AddProcess.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessSpec {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub terminal: bool,
    #[serde(default)]
    pub user: User,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cwd: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Linux {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<Namespace>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uid_mappings: Vec<IdMapping>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gid_mappings: Vec<IdMapping>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Namespace {
    #[serde(rename = "type")]
    pub ns_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMapping {
    #[serde(rename = "containerID")]
    pub container_id: u32,
    #[serde(rename = "hostID")]
    pub host_id: u32,
    pub size: u32,
}

impl RuntimeSpec {
    /// Load `config.json` from a bundle directory.
    pub async fn from_bundle(bundle: &Path) -> Result<Self> {
        let path = bundle.join(CONFIG_FILENAME);
        let data = tokio::fs::read(&path).await?;
        serde_json::from_slice(&data)
            .map_err(|e| Error::Spec(format!("{}: {e}", path.display())))
    }

    /// Whether the init process requests a terminal.
    pub fn terminal(&self) -> bool {
        self.process.as_ref().is_some_and(|p| p.terminal)
    }

    /// Host uid/gid that container root maps to.
    ///
    /// Without a user namespace this is root on the host.
    pub fn root_ids(&self) -> Result<(u32, u32)> {
        let Some(linux) = &self.linux else {
            return Ok((0, 0));
        };
        if !linux.namespaces.iter().any(|ns| ns.ns_type == "user") {
            return Ok((0, 0));
        }
        Ok((
            host_id_from_map(0, &linux.uid_mappings)?,
            host_id_from_map(0, &linux.gid_mappings)?,
        ))
    }

    /// Resolve a relative `root.path` against the bundle it was loaded from.
    ///
    /// The spec is persisted into a different directory, so a relative rootfs
    /// would otherwise point nowhere.
    pub fn absolutize_root(&mut self, bundle: &Path) {
        if let Some(root) = &mut self.root
            && !Path::new(&root.path).is_absolute()
        {
            root.path = bundle.join(&root.path).to_string_lossy().into_owned();
        }
    }
}

fn host_id_from_map(id: u32, mappings: &[IdMapping]) -> u32 {
    mappings
        .iter()
        .find(|m| {
            id >= m.container_id
                && u64::from(id) < u64::from(m.container_id) + u64::from(m.size)
        })
        .map(|m| m.host_id + (id - m.container_id))
        .unwrap_or(0)
}
