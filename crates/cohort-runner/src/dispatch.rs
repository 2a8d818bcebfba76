//! Picks the execution backend for a resolved run mode and drives it.

use crate::builders::BuilderRegistry;
use crate::cloud::{CloudStager, LocatorStore, ObjectStore};
use crate::cluster::{ClusterBatchWriter, CommandSubmitter, Invocation, Submission, Submitter};
use crate::executor::BundleExecutor;
use crate::plugin::{CallbackLog, ExecutionPlugin, MultiProcPlugin};
use crate::pool::{BundleLauncher, BundlePool, ProcessLauncher, RESULTS_DIR};
use crate::report::{JsonSummaryReport, ReportWriter};
use cohort_core::{
    bundle_count, load_cloud_index, load_manifest, partition_bundles, select_bundle,
    status_counts, Bundle, DataSource, Error, ExecutionResult, FlatManifest, Platform, Result,
    RunConfig, RunMode, UnitIdentity, UnitSelector,
};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, info_span, warn};

pub const CALLBACK_LOG: &str = "callback.log";

#[derive(Debug)]
pub enum RunOutcome {
    Executed(Vec<ExecutionResult>),
    Submitted(Submission),
}

/// Bundle layout of a data source, as `describe` prints it.
#[derive(Debug, Clone, Serialize)]
pub struct RunPlan {
    pub units: usize,
    pub units_per_bundle: usize,
    pub bundles: Vec<PlannedBundle>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedBundle {
    pub index: usize,
    pub units: Vec<String>,
}

pub fn plan_run(config: &RunConfig, source: &DataSource) -> Result<RunPlan> {
    let flat = load_source(source)?;
    let bundles = partition_bundles(&flat, config.units_per_bundle)?;
    Ok(RunPlan {
        units: flat.len(),
        units_per_bundle: config.units_per_bundle,
        bundles: bundles
            .iter()
            .map(|b| PlannedBundle {
                index: b.index(),
                units: b.identities().iter().map(UnitIdentity::to_string).collect(),
            })
            .collect(),
    })
}

fn load_source(source: &DataSource) -> Result<FlatManifest> {
    match source {
        DataSource::Manifest(path) => load_manifest(path),
        DataSource::CloudIndex(path) => load_cloud_index(path),
    }
}

pub struct Dispatcher {
    config: RunConfig,
    registry: BuilderRegistry,
    plugin: Box<dyn ExecutionPlugin>,
    store: Arc<dyn ObjectStore>,
    submitter: Box<dyn Submitter>,
    report: Box<dyn ReportWriter>,
    launcher: Option<Box<dyn BundleLauncher>>,
    program: PathBuf,
}

impl Dispatcher {
    pub fn new(config: RunConfig, registry: BuilderRegistry) -> Self {
        Self {
            config,
            registry,
            plugin: Box::new(MultiProcPlugin),
            store: Arc::new(LocatorStore::new()),
            submitter: Box::new(CommandSubmitter),
            report: Box::new(JsonSummaryReport),
            launcher: None,
            program: std::env::current_exe().unwrap_or_else(|_| PathBuf::from("cohort")),
        }
    }

    pub fn with_plugin(mut self, plugin: Box<dyn ExecutionPlugin>) -> Self {
        self.plugin = plugin;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_submitter(mut self, submitter: Box<dyn Submitter>) -> Self {
        self.submitter = submitter;
        self
    }

    pub fn with_report_writer(mut self, report: Box<dyn ReportWriter>) -> Self {
        self.report = report;
        self
    }

    /// Replaces the worker processes started when `bundles_at_once > 1`.
    pub fn with_launcher(mut self, launcher: Box<dyn BundleLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Program that array tasks and bundle workers re-invoke; defaults to
    /// the running executable.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn run(&self, mode: RunMode) -> Result<RunOutcome> {
        let span = info_span!("run", name = %self.config.run_name, mode = mode.as_str());
        let _guard = span.enter();
        self.config.ensure_directories()?;

        let (results, fatal) = match mode {
            RunMode::ClusterRun { source, platform } => {
                return self.submit(source, platform).map(RunOutcome::Submitted);
            }
            RunMode::LocalRun {
                manifest,
                selector: None,
            } => {
                let flat = load_manifest(&manifest)?;
                let bundles = partition_bundles(&flat, self.config.units_per_bundle)?;
                info!(
                    units = flat.len(),
                    bundles = bundles.len(),
                    "running all bundles locally"
                );
                if self.pooled(bundles.len()) {
                    let indices: Vec<usize> = bundles.iter().map(Bundle::index).collect();
                    self.run_pooled(&DataSource::Manifest(manifest), &indices)
                } else {
                    let callback = self.open_callback_log();
                    self.execute_all(bundles, callback.as_ref())
                }
            }
            RunMode::LocalRun {
                manifest,
                selector: Some(selector),
            } => {
                let flat = load_manifest(&manifest)?;
                let bundle = select_bundle(&flat, selector, self.config.units_per_bundle)?;
                let callback = self.open_callback_log();
                (vec![self.executor(callback.as_ref()).run(bundle)?], None)
            }
            RunMode::CloudRun {
                index,
                selector: Some(selector),
            } => {
                let stager = CloudStager::open(&index, self.store.clone())?;
                let bundle = stager.fetch_bundle(selector, &self.config)?;
                let callback = self.open_callback_log();
                let result = self.executor(callback.as_ref()).run(bundle)?;
                (vec![result], self.upload(&stager).err())
            }
            RunMode::CloudRun {
                index,
                selector: None,
            } => {
                let stager = CloudStager::open(&index, self.store.clone())?;
                let total = bundle_count(stager.unit_count(), self.config.units_per_bundle);
                info!(units = stager.unit_count(), bundles = total, "running cloud bundles here");
                let (results, fatal) = if self.pooled(total) {
                    let indices: Vec<usize> = (1..=total).collect();
                    self.run_pooled(&DataSource::CloudIndex(index), &indices)
                } else {
                    let callback = self.open_callback_log();
                    self.cloud_loop(&stager, total, callback.as_ref())
                };
                (results, fatal.or(self.upload(&stager).err()))
            }
        };

        self.log_summary(&results);
        if self.config.write_report {
            self.write_reports(&results);
        }
        match fatal {
            Some(e) => Err(e),
            None => Ok(RunOutcome::Executed(results)),
        }
    }

    fn executor<'a>(&'a self, callback: Option<&'a CallbackLog>) -> BundleExecutor<'a> {
        BundleExecutor::new(&self.config, &self.registry, self.plugin.as_ref())
            .with_callback(callback)
    }

    fn open_callback_log(&self) -> Option<CallbackLog> {
        let path = self.config.output_directory.join(CALLBACK_LOG);
        match CallbackLog::open(&path) {
            Ok(log) => Some(log),
            Err(e) => {
                warn!("callback log disabled: {:#}", e);
                None
            }
        }
    }

    fn pooled(&self, bundles: usize) -> bool {
        self.config.bundles_at_once > 1 && bundles > 1
    }

    /// Runs every bundle here, one after another. Returns all results plus
    /// the first fatal bundle error, if any; a fatal error in one bundle does
    /// not stop its siblings.
    fn execute_all(
        &self,
        bundles: Vec<Bundle>,
        callback: Option<&CallbackLog>,
    ) -> (Vec<ExecutionResult>, Option<Error>) {
        let executor = self.executor(callback);
        let mut collected = Collected::with_capacity(bundles.len());
        for bundle in bundles {
            let index = bundle.index();
            collected.record(index, executor.run(bundle));
        }
        collected.finish()
    }

    /// Stages and runs cloud bundles `1..=total` here, one after another.
    fn cloud_loop(
        &self,
        stager: &CloudStager,
        total: usize,
        callback: Option<&CallbackLog>,
    ) -> (Vec<ExecutionResult>, Option<Error>) {
        let executor = self.executor(callback);
        let mut collected = Collected::with_capacity(total);
        for k in 1..=total {
            let outcome = stager
                .fetch_bundle(UnitSelector::Bundle(k), &self.config)
                .and_then(|bundle| executor.run(bundle));
            collected.record(k, outcome);
        }
        collected.finish()
    }

    /// Runs each bundle in its own worker process, `bundles_at_once` at a
    /// time. Workers read their own slice of `source`, so cloud bundles are
    /// staged by the worker that runs them.
    fn run_pooled(
        &self,
        source: &DataSource,
        indices: &[usize],
    ) -> (Vec<ExecutionResult>, Option<Error>) {
        let pool = BundlePool::new(self.config.bundles_at_once);
        info!(
            slots = pool.slots(),
            bundles = indices.len(),
            "running bundles in worker processes"
        );
        let default_launcher;
        let launcher: &dyn BundleLauncher = match &self.launcher {
            Some(launcher) => launcher.as_ref(),
            None => match self.invocation(source.clone()) {
                Ok(invocation) => {
                    default_launcher = ProcessLauncher::new(
                        invocation,
                        self.config.working_directory.join(RESULTS_DIR),
                    );
                    &default_launcher
                }
                Err(e) => return (Vec::new(), Some(e)),
            },
        };
        let mut collected = Collected::with_capacity(indices.len());
        for (index, outcome) in indices.iter().zip(pool.run(indices, launcher)) {
            collected.record(*index, outcome);
        }
        collected.finish()
    }

    fn upload(&self, stager: &CloudStager) -> Result<()> {
        if self.config.upload_results {
            stager.upload(&self.config)?;
        }
        Ok(())
    }

    fn submit(&self, source: DataSource, platform: Platform) -> Result<Submission> {
        let unit_count = load_source(&source)?.len();
        let units_per_bundle = self.config.units_per_bundle;
        let task_count = bundle_count(unit_count, units_per_bundle);
        let invocation = self.invocation(source)?;
        info!(units = unit_count, tasks = task_count, %platform, "preparing array job");
        ClusterBatchWriter::new(&self.config, platform).submit(
            &invocation,
            task_count,
            units_per_bundle.min(unit_count),
            self.submitter.as_ref(),
        )
    }

    /// Command line that re-runs one bundle of `source` in a new process.
    fn invocation(&self, source: DataSource) -> Result<Invocation> {
        let config_path = self.config.config_path.clone().ok_or_else(|| {
            Error::config("re-invoking bundles needs the path of the configuration file")
        })?;
        let source = match source {
            DataSource::Manifest(path) => DataSource::Manifest(absolute(&path)),
            DataSource::CloudIndex(path) => DataSource::CloudIndex(absolute(&path)),
        };
        Ok(Invocation {
            program: self.program.clone(),
            source,
            config_path,
        })
    }

    fn log_summary(&self, results: &[ExecutionResult]) {
        let counts = status_counts(results)
            .into_iter()
            .filter(|(_, n)| *n > 0)
            .map(|(status, n)| format!("{}={}", status, n))
            .collect::<Vec<_>>()
            .join(" ");
        info!(bundles = results.len(), "run finished: {}", counts);
        for failed in results.iter().filter(|r| r.is_failed()) {
            warn!(
                bundle = failed.bundle_index,
                "bundle failed: {}",
                failed.message.as_deref().unwrap_or("no message")
            );
        }
    }

    fn write_reports(&self, results: &[ExecutionResult]) {
        match self
            .report
            .write(&self.config.output_directory, &self.config.run_name, results)
        {
            Ok(artifacts) => {
                for artifact in artifacts {
                    if artifact.success {
                        info!(report = %artifact.name, path = %artifact.path.display(), "report written");
                    } else {
                        warn!(
                            report = %artifact.name,
                            "report could not be written: {}",
                            artifact.message.as_deref().unwrap_or("unknown error")
                        );
                    }
                }
            }
            Err(e) => warn!("report generation failed: {:#}", e),
        }
    }
}

/// Results of a multi-bundle run plus the first fatal bundle error.
struct Collected {
    results: Vec<ExecutionResult>,
    fatal: Option<Error>,
}

impl Collected {
    fn with_capacity(bundles: usize) -> Self {
        Self {
            results: Vec::with_capacity(bundles),
            fatal: None,
        }
    }

    fn record(&mut self, index: usize, outcome: Result<ExecutionResult>) {
        match outcome {
            Ok(result) => self.results.push(result),
            Err(e) => {
                error!(bundle = index, "bundle aborted: {}", e);
                self.fatal.get_or_insert(e);
            }
        }
    }

    fn finish(self) -> (Vec<ExecutionResult>, Option<Error>) {
        (self.results, self.fatal)
    }
}

fn absolute(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
