//! Per-bundle computation graph.
//!
//! Nodes may only link to outputs of nodes added before them, so node ids are
//! already a topological order and the graph cannot contain cycles.

use anyhow::{anyhow, bail, Context, Result};
use cohort_core::{ensure_dir, NodeId, PendingOutput};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

/// A materialized node output.
#[derive(Debug, Clone, PartialEq)]
pub enum Artifact {
    File(PathBuf),
    Data(Value),
}

impl Artifact {
    fn as_argument(&self) -> String {
        match self {
            Artifact::File(path) => path.to_string_lossy().to_string(),
            Artifact::Data(Value::String(s)) => s.clone(),
            Artifact::Data(v) => v.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeInput {
    Artifact(Artifact),
    Link(PendingOutput),
}

pub struct TaskContext<'a> {
    pub node_name: &'a str,
    pub work_dir: &'a Path,
    pub inputs: &'a BTreeMap<String, Artifact>,
}

pub trait Task: Send + Sync {
    fn kind(&self) -> &'static str;
    fn run(&self, ctx: &TaskContext<'_>) -> Result<BTreeMap<String, Artifact>>;
}

pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub task: Arc<dyn Task>,
    pub inputs: BTreeMap<String, NodeInput>,
    pub memory_gb: f64,
}

impl Node {
    pub fn dependencies(&self) -> BTreeSet<NodeId> {
        self.inputs
            .values()
            .filter_map(|input| match input {
                NodeInput::Link(link) => Some(link.node),
                NodeInput::Artifact(_) => None,
            })
            .collect()
    }
}

pub struct Workflow {
    name: String,
    base_dir: PathBuf,
    nodes: Vec<Node>,
}

impl Workflow {
    pub fn new(name: impl Into<String>, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            base_dir: base_dir.into(),
            nodes: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Scratch directory holding one subdirectory per node.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        task: Arc<dyn Task>,
        inputs: BTreeMap<String, NodeInput>,
        memory_gb: f64,
    ) -> Result<NodeId> {
        let name = name.into();
        if self.nodes.iter().any(|n| n.name == name) {
            bail!("duplicate node name in workflow {}: {}", self.name, name);
        }
        for (input, value) in &inputs {
            if let NodeInput::Link(link) = value {
                if link.node.0 >= self.nodes.len() {
                    bail!(
                        "node {} input {} links to unknown node {}",
                        name,
                        input,
                        link.node.0
                    );
                }
            }
        }
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            id,
            name,
            task,
            inputs,
            memory_gb,
        });
        Ok(id)
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node_dir(&self, id: NodeId) -> PathBuf {
        let name = self
            .node(id)
            .map(|n| n.name.as_str())
            .unwrap_or("unknown");
        self.base_dir.join(name)
    }

    pub fn to_dot(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "digraph \"{}\" {{", self.name);
        for node in &self.nodes {
            let _ = writeln!(
                out,
                "  n{} [label=\"{} ({})\"];",
                node.id.0,
                node.name,
                node.task.kind()
            );
        }
        for node in &self.nodes {
            for (input, value) in &node.inputs {
                if let NodeInput::Link(link) = value {
                    let _ = writeln!(
                        out,
                        "  n{} -> n{} [label=\"{} -> {}\"];",
                        link.node.0, node.id.0, link.output, input
                    );
                }
            }
        }
        out.push_str("}\n");
        out
    }

    pub fn write_dot(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            ensure_dir(parent)?;
        }
        fs::write(path, self.to_dot())
            .with_context(|| format!("failed to write graph to {}", path.display()))
    }
}

/// Shared no-op entry node every unit's subgraph hangs off.
pub struct StarterTask;

pub const STARTER_OUTPUT: &str = "starter";

impl Task for StarterTask {
    fn kind(&self) -> &'static str {
        "starter"
    }

    fn run(&self, _ctx: &TaskContext<'_>) -> Result<BTreeMap<String, Artifact>> {
        Ok(BTreeMap::from([(
            STARTER_OUTPUT.to_string(),
            Artifact::Data(Value::String(String::new())),
        )]))
    }
}

/// Runs an external program in the node directory.
///
/// `{name}` in an argument is replaced by the input of that name and
/// `{out_dir}` by the node directory. Every declared output must exist once
/// the program exits successfully.
pub struct CommandTask {
    command: Vec<String>,
    outputs: BTreeMap<String, String>,
}

impl CommandTask {
    pub fn new(command: Vec<String>, outputs: BTreeMap<String, String>) -> Result<Self> {
        if command.is_empty() {
            bail!("command must not be empty");
        }
        Ok(Self { command, outputs })
    }

    fn render(&self, ctx: &TaskContext<'_>) -> Vec<String> {
        self.command
            .iter()
            .map(|part| {
                let mut rendered = part.replace("{out_dir}", &ctx.work_dir.to_string_lossy());
                for (name, artifact) in ctx.inputs {
                    let placeholder = format!("{{{}}}", name);
                    if rendered.contains(&placeholder) {
                        rendered = rendered.replace(&placeholder, &artifact.as_argument());
                    }
                }
                rendered
            })
            .collect()
    }
}

impl Task for CommandTask {
    fn kind(&self) -> &'static str {
        "command"
    }

    fn run(&self, ctx: &TaskContext<'_>) -> Result<BTreeMap<String, Artifact>> {
        let argv = self.render(ctx);
        let output = Command::new(&argv[0])
            .args(&argv[1..])
            .current_dir(ctx.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("failed to launch {}", argv[0]))?;
        if !output.status.success() {
            let stderr_tail = String::from_utf8_lossy(&output.stderr)
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("no output on stderr")
                .to_string();
            bail!(
                "{} exited with {}: {}",
                argv[0],
                output
                    .status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                stderr_tail
            );
        }
        let mut produced = BTreeMap::new();
        for (name, file) in &self.outputs {
            let path = ctx.work_dir.join(file);
            if !path.exists() {
                bail!("{} did not produce {} ({})", argv[0], name, path.display());
            }
            produced.insert(name.clone(), Artifact::File(path));
        }
        Ok(produced)
    }
}

/// Copies every input into `<dest_dir>/<input name>/`. Structured inputs are
/// written as `<input name>.json`.
pub struct SinkTask {
    dest_dir: PathBuf,
}

impl SinkTask {
    pub fn new(dest_dir: impl Into<PathBuf>) -> Self {
        Self {
            dest_dir: dest_dir.into(),
        }
    }
}

impl Task for SinkTask {
    fn kind(&self) -> &'static str {
        "sink"
    }

    fn run(&self, ctx: &TaskContext<'_>) -> Result<BTreeMap<String, Artifact>> {
        let mut stored = BTreeMap::new();
        for (name, artifact) in ctx.inputs {
            let dir = self.dest_dir.join(name);
            ensure_dir(&dir)?;
            let dest = match artifact {
                Artifact::File(src) => {
                    let file_name = src
                        .file_name()
                        .ok_or_else(|| anyhow!("{} has no file name", src.display()))?;
                    let dest = dir.join(file_name);
                    fs::copy(src, &dest).with_context(|| {
                        format!("failed to copy {} to {}", src.display(), dest.display())
                    })?;
                    dest
                }
                Artifact::Data(value) => {
                    let dest = dir.join(format!("{}.json", name));
                    fs::write(&dest, serde_json::to_vec_pretty(value)?)
                        .with_context(|| format!("failed to write {}", dest.display()))?;
                    dest
                }
            };
            stored.insert(name.clone(), Artifact::File(dest));
        }
        Ok(stored)
    }
}
