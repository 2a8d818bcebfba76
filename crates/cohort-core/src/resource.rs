use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Index of a node inside one bundle's computation graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub usize);

/// A named output of a graph node that has not been materialized yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOutput {
    pub node: NodeId,
    pub output: String,
}

impl PendingOutput {
    pub fn new(node: NodeId, output: impl Into<String>) -> Self {
        Self {
            node,
            output: output.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ResourceValue {
    /// Already available on local storage.
    Path(PathBuf),
    /// Remote-storage locator; must be staged before execution.
    Remote(String),
    /// Produced by the computation graph of the current bundle.
    Pending(PendingOutput),
    /// Structured field recovered from a compound result document.
    Data(Value),
}

impl ResourceValue {
    pub fn as_path(&self) -> Option<&Path> {
        match self {
            ResourceValue::Path(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_pending(&self) -> Option<&PendingOutput> {
        match self {
            ResourceValue::Pending(p) => Some(p),
            _ => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            ResourceValue::Path(p) => p.display().to_string(),
            ResourceValue::Remote(locator) => locator.clone(),
            ResourceValue::Pending(p) => format!("<node {}:{}>", p.node.0, p.output),
            ResourceValue::Data(v) => v.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Site {
    Named(String),
    /// Explicit "no site" marker used when only some subjects declare one.
    Unspecified,
}

/// Named inputs and outputs of one unit.
///
/// Entries can only be added; a name that is already present keeps its value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourcePool {
    entries: BTreeMap<String, ResourceValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    site: Option<Site>,
}

impl ResourcePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `value` under `name` unless the name is taken. Returns whether
    /// the entry was added.
    pub fn add(&mut self, name: impl Into<String>, value: ResourceValue) -> bool {
        let name = name.into();
        if self.entries.contains_key(&name) {
            return false;
        }
        self.entries.insert(name, value);
        true
    }

    pub fn get(&self, name: &str) -> Option<&ResourceValue> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ResourceValue)> {
        self.entries.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn site(&self) -> Option<&Site> {
        self.site.as_ref()
    }

    pub fn set_site(&mut self, site: Site) {
        self.site = Some(site);
    }
}
