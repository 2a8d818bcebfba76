//! Runs several bundles at once, each in its own worker process.
//!
//! A worker re-enters the CLI exactly like an array task does, with the
//! bundle index fixed and a `--result-file` to report back through. Every
//! bundle gets a fresh process, so memory held by one bundle's computation is
//! returned to the system before the next bundle starts.

use crate::cluster::Invocation;
use cohort_core::{ensure_dir, Error, ExecutionResult, Result};
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::{debug, warn};

/// Working-directory subfolder holding one result file per bundle.
pub const RESULTS_DIR: &str = "bundle_results";

/// Runs one bundle to completion somewhere other than the calling thread.
pub trait BundleLauncher: Send + Sync {
    fn launch(&self, bundle_index: usize) -> Result<ExecutionResult>;
}

pub struct ProcessLauncher {
    invocation: Invocation,
    result_dir: PathBuf,
}

impl ProcessLauncher {
    pub fn new(invocation: Invocation, result_dir: impl Into<PathBuf>) -> Self {
        Self {
            invocation,
            result_dir: result_dir.into(),
        }
    }

    pub fn result_path(&self, bundle_index: usize) -> PathBuf {
        self.result_dir.join(format!("bundle_{}.json", bundle_index))
    }
}

impl BundleLauncher for ProcessLauncher {
    fn launch(&self, bundle_index: usize) -> Result<ExecutionResult> {
        ensure_dir(&self.result_dir)?;
        let result_path = self.result_path(bundle_index);
        if result_path.exists() {
            fs::remove_file(&result_path)
                .map_err(|e| Error::io("failed to clear stale bundle result", &result_path, e))?;
        }

        let program = &self.invocation.program;
        let mut cmd = Command::new(program);
        cmd.args(self.invocation.bundle_args(bundle_index));
        cmd.arg("--result-file").arg(&result_path);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::inherit());

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::io("failed to start bundle worker", program, e))?;
        debug!(bundle = bundle_index, pid = child.id(), "bundle worker started");
        let status = child
            .wait()
            .map_err(|e| Error::io("failed to wait for bundle worker", program, e))?;

        match fs::read(&result_path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| Error::parse(&result_path, e)),
            Err(_) => Err(Error::Worker {
                bundle: bundle_index,
                message: status.to_string(),
            }),
        }
    }
}

/// Caps how many bundles run at the same time.
#[derive(Debug, Clone, Copy)]
pub struct BundlePool {
    slots: usize,
}

impl BundlePool {
    pub fn new(slots: usize) -> Self {
        Self {
            slots: slots.max(1),
        }
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Launches every bundle, at most `slots` at a time, and returns the
    /// outcomes in the order of `indices`. One failed launch does not stop
    /// the others.
    pub fn run(
        &self,
        indices: &[usize],
        launcher: &dyn BundleLauncher,
    ) -> Vec<Result<ExecutionResult>> {
        let launch = |index: &usize| launcher.launch(*index);
        let threads = self.slots.min(indices.len()).max(1);
        match ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("bundle-waiter-{}", i))
            .build()
        {
            Ok(pool) => pool.install(|| indices.par_iter().map(launch).collect()),
            Err(e) => {
                warn!("bundle pool unavailable, running bundles one at a time: {}", e);
                indices.iter().map(launch).collect()
            }
        }
    }
}
