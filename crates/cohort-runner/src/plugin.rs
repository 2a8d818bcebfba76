//! Graph execution backends.

use crate::graph::{Artifact, NodeInput, TaskContext, Workflow};
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use cohort_core::{ensure_dir, RunConfig};
use serde_json::json;
use std::any::Any;
use std::collections::{BTreeMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Mutex};
use std::thread;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceLimits {
    pub n_procs: usize,
    pub memory_gb: f64,
}

impl ResourceLimits {
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            n_procs: config.num_processors.max(1),
            memory_gb: config.memory_gb,
        }
    }
}

pub trait ExecutionPlugin: Send + Sync {
    fn name(&self) -> &'static str;
    fn run(
        &self,
        workflow: &Workflow,
        limits: ResourceLimits,
        callback: Option<&CallbackLog>,
    ) -> Result<()>;
}

/// JSON-lines log of node lifecycle events, shared by every bundle of a run.
pub struct CallbackLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl CallbackLog {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            ensure_dir(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open callback log {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, workflow: &str, node: &str, status: &str, error: Option<&str>) {
        let line = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "workflow": workflow,
            "node": node,
            "status": status,
            "error": error,
        });
        let mut file = self.file.lock().unwrap_or_else(|p| p.into_inner());
        if let Err(e) = writeln!(file, "{}", line) {
            warn!(path = %self.path.display(), "failed to append to callback log: {}", e);
        }
    }
}

/// Runs ready nodes on up to `n_procs` threads while the summed memory
/// estimate of running nodes stays within `memory_gb`. A node whose estimate
/// alone exceeds the ceiling runs when nothing else does.
pub struct MultiProcPlugin;

impl ExecutionPlugin for MultiProcPlugin {
    fn name(&self) -> &'static str {
        "MultiProc"
    }

    fn run(
        &self,
        workflow: &Workflow,
        limits: ResourceLimits,
        callback: Option<&CallbackLog>,
    ) -> Result<()> {
        let nodes = workflow.nodes();
        let mut waiting_on: Vec<usize> = nodes.iter().map(|n| n.dependencies().len()).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
        for node in nodes {
            for dep in node.dependencies() {
                dependents[dep.0].push(node.id.0);
            }
        }
        let mut ready: VecDeque<usize> = waiting_on
            .iter()
            .enumerate()
            .filter(|(_, n)| **n == 0)
            .map(|(i, _)| i)
            .collect();
        let mut outputs: Vec<Option<BTreeMap<String, Artifact>>> = vec![None; nodes.len()];
        let mut completed = 0usize;
        let mut failure: Option<anyhow::Error> = None;

        info!(
            workflow = workflow.name(),
            nodes = nodes.len(),
            n_procs = limits.n_procs,
            memory_gb = limits.memory_gb,
            "running workflow with plugin {}",
            self.name()
        );

        thread::scope(|scope| {
            let (tx, rx) = mpsc::channel::<(usize, Result<BTreeMap<String, Artifact>>)>();
            let mut running = 0usize;
            let mut memory_in_use = 0.0f64;

            loop {
                while failure.is_none() && running < limits.n_procs.max(1) {
                    let fits = ready.iter().position(|&i| {
                        running == 0 || memory_in_use + nodes[i].memory_gb <= limits.memory_gb
                    });
                    let Some(slot) = fits else { break };
                    let Some(idx) = ready.remove(slot) else { break };
                    let node = &nodes[idx];
                    let inputs = match resolve_inputs(node.inputs.iter(), &outputs) {
                        Ok(inputs) => inputs,
                        Err(e) => {
                            failure = Some(e.context(format!("node {}", node.name)));
                            break;
                        }
                    };
                    let work_dir = workflow.node_dir(node.id);
                    if let Some(cb) = callback {
                        cb.record(workflow.name(), &node.name, "started", None);
                    }
                    running += 1;
                    memory_in_use += node.memory_gb;
                    let tx = tx.clone();
                    scope.spawn(move || {
                        let result = run_node(&node.name, node.task.as_ref(), &work_dir, &inputs);
                        let _ = tx.send((idx, result));
                    });
                }

                if running == 0 {
                    break;
                }
                let Ok((idx, result)) = rx.recv() else { break };
                running -= 1;
                memory_in_use -= nodes[idx].memory_gb;
                let node = &nodes[idx];
                match result {
                    Ok(produced) => {
                        debug!(node = %node.name, "node finished");
                        if let Some(cb) = callback {
                            cb.record(workflow.name(), &node.name, "finished", None);
                        }
                        outputs[idx] = Some(produced);
                        completed += 1;
                        for &next in &dependents[idx] {
                            waiting_on[next] -= 1;
                            if waiting_on[next] == 0 {
                                ready.push_back(next);
                            }
                        }
                    }
                    Err(e) => {
                        let message = format!("{:#}", e);
                        warn!(node = %node.name, "node failed: {}", message);
                        if let Some(cb) = callback {
                            cb.record(workflow.name(), &node.name, "failed", Some(&message));
                        }
                        if failure.is_none() {
                            failure = Some(e.context(format!("node {} failed", node.name)));
                        }
                    }
                }
            }
        });

        if let Some(e) = failure {
            return Err(e);
        }
        if completed != nodes.len() {
            return Err(anyhow!(
                "workflow {} stalled after {} of {} nodes",
                workflow.name(),
                completed,
                nodes.len()
            ));
        }
        Ok(())
    }
}

fn resolve_inputs<'a>(
    inputs: impl Iterator<Item = (&'a String, &'a NodeInput)>,
    outputs: &[Option<BTreeMap<String, Artifact>>],
) -> Result<BTreeMap<String, Artifact>> {
    let mut resolved = BTreeMap::new();
    for (name, input) in inputs {
        let artifact = match input {
            NodeInput::Artifact(artifact) => artifact.clone(),
            NodeInput::Link(link) => outputs
                .get(link.node.0)
                .and_then(Option::as_ref)
                .and_then(|produced| produced.get(&link.output))
                .cloned()
                .ok_or_else(|| {
                    anyhow!(
                        "input {} expects output {} of node {} which was not produced",
                        name,
                        link.output,
                        link.node.0
                    )
                })?,
        };
        resolved.insert(name.clone(), artifact);
    }
    Ok(resolved)
}

fn run_node(
    name: &str,
    task: &dyn crate::graph::Task,
    work_dir: &Path,
    inputs: &BTreeMap<String, Artifact>,
) -> Result<BTreeMap<String, Artifact>> {
    ensure_dir(work_dir)?;
    let ctx = TaskContext {
        node_name: name,
        work_dir,
        inputs,
    };
    match panic::catch_unwind(AssertUnwindSafe(|| task.run(&ctx))) {
        Ok(result) => result,
        Err(payload) => Err(anyhow!("task panicked: {}", panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
