//! Runs one bundle: validates inputs, reconciles existing outputs, builds
//! the missing categories into one shared graph and executes it.

use crate::builders::{
    BuilderRegistry, OutputCategory, UnitContext, FD_PLOT_KEY, MOSAIC_KEY, STARTER_KEY,
};
use crate::graph::{NodeInput, SinkTask, StarterTask, Workflow, STARTER_OUTPUT};
use crate::plugin::{CallbackLog, ExecutionPlugin, ResourceLimits};
use crate::reconcile::reconcile_outputs;
use anyhow::anyhow;
use cohort_core::{
    ensure_dir, Bundle, Error, ExecutionResult, PendingOutput, ResourcePool, ResourceValue,
    Result, RunConfig, RunStatus, UnitIdentity,
};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, info_span, warn};

pub const STARTER_NODE: &str = "starter_node";

pub struct BundleExecutor<'a> {
    config: &'a RunConfig,
    registry: &'a BuilderRegistry,
    plugin: &'a dyn ExecutionPlugin,
    callback: Option<&'a CallbackLog>,
}

impl<'a> BundleExecutor<'a> {
    pub fn new(
        config: &'a RunConfig,
        registry: &'a BuilderRegistry,
        plugin: &'a dyn ExecutionPlugin,
    ) -> Self {
        Self {
            config,
            registry,
            plugin,
            callback: None,
        }
    }

    pub fn with_callback(mut self, callback: Option<&'a CallbackLog>) -> Self {
        self.callback = callback;
        self
    }

    /// Runs `bundle` to completion.
    ///
    /// Invalid inputs and builder failures abort the bundle with `Err`. A
    /// failing graph run is reported as a `failed` result instead, so sibling
    /// bundles keep going.
    pub fn run(&self, bundle: Bundle) -> Result<ExecutionResult> {
        let span = info_span!("bundle", index = bundle.index(), units = bundle.len());
        let _guard = span.enter();
        let started = Instant::now();
        let config = self.config;
        let bundle_index = bundle.index();

        ensure_dir(&config.run_output_dir())?;
        let mut workflow = Workflow::new(
            config.run_name.clone(),
            config
                .working_directory
                .join(&config.run_name)
                .join(format!("bundle_{}", bundle_index)),
        );
        let starter = workflow
            .add_node(STARTER_NODE, Arc::new(StarterTask), BTreeMap::new(), 0.0)
            .map_err(|source| Error::Build {
                category: STARTER_NODE.to_string(),
                unit: format!("bundle {}", bundle_index),
                source,
            })?;

        let mut identities = Vec::with_capacity(bundle.len());
        let mut new_outputs = 0usize;

        for (identity, mut pool) in bundle.into_units() {
            validate_pool(&identity, &pool)?;
            let output_dir = identity.output_dir(&config.output_directory, &config.run_name);
            ensure_dir(&output_dir)?;
            let name = identity.label();

            let found = reconcile_outputs(&output_dir, &identity, &mut pool)?;
            if found > 0 {
                info!(unit = %identity, found, "reusing outputs already on disk");
            }
            pool.add(
                STARTER_KEY,
                ResourceValue::Pending(PendingOutput::new(starter, STARTER_OUTPUT)),
            );

            let unit = UnitContext {
                identity: &identity,
                name: &name,
                output_dir: &output_dir,
            };
            for category in OutputCategory::ALL {
                if pool.contains(category.resource_key()) {
                    continue;
                }
                if !pool.contains(category.primary_input()) {
                    debug!(unit = %identity, %category, "no {} for this unit", category.primary_input());
                    continue;
                }
                let Some(builder) = self.registry.get(category) else {
                    debug!(%category, "no builder registered");
                    continue;
                };
                let build_error = |source: anyhow::Error| Error::Build {
                    category: category.name().to_string(),
                    unit: identity.to_string(),
                    source,
                };
                builder
                    .build(&mut workflow, &mut pool, config, &unit)
                    .map_err(build_error)?;
                if !pool.contains(category.resource_key()) {
                    return Err(build_error(anyhow!(
                        "builder did not provide {}",
                        category.resource_key()
                    )));
                }
            }

            for output in sink_outputs(&pool, config) {
                let Some(pending) = pool.get(&output).and_then(ResourceValue::as_pending) else {
                    continue;
                };
                let inputs =
                    BTreeMap::from([(output.clone(), NodeInput::Link(pending.clone()))]);
                workflow
                    .add_node(
                        format!("datasink_{}{}", output, name),
                        Arc::new(SinkTask::new(output_dir.clone())),
                        inputs,
                        0.0,
                    )
                    .map_err(|source| Error::Build {
                        category: output.clone(),
                        unit: identity.to_string(),
                        source,
                    })?;
                new_outputs += 1;
            }
            identities.push(identity);
        }

        let mut result = ExecutionResult {
            bundle_index,
            units: identities,
            status: RunStatus::Started,
            message: None,
            elapsed_secs: 0.0,
        };

        if new_outputs > 0 {
            if config.write_graph {
                let dot = config
                    .output_directory
                    .join(format!("{}_bundle_{}.dot", config.run_name, bundle_index));
                if let Err(e) = workflow.write_dot(&dot) {
                    warn!("could not write workflow graph: {:#}", e);
                }
            }
            info!(
                plugin = self.plugin.name(),
                nodes = workflow.len(),
                new_outputs,
                "running bundle workflow"
            );
            match self.plugin.run(
                &workflow,
                ResourceLimits::from_config(config),
                self.callback,
            ) {
                Ok(()) => result.status = RunStatus::Finished,
                Err(e) => {
                    result.status = RunStatus::Failed;
                    result.message = Some(format!("{:#}", e));
                }
            }
        } else {
            result.status = RunStatus::Cached;
            info!("everything is already done for bundle {}", bundle_index);
        }

        if !config.keep_intermediates && workflow.base_dir().exists() {
            if let Err(e) = fs::remove_dir_all(workflow.base_dir()) {
                warn!(
                    dir = %workflow.base_dir().display(),
                    "couldn't remove the working directory: {}", e
                );
            }
        }

        result.elapsed_secs = started.elapsed().as_secs_f64();
        match &result.message {
            Some(message) if result.status == RunStatus::Failed => error!("{}", message),
            _ => info!(
                status = %result.status,
                elapsed_minutes = result.elapsed_secs / 60.0,
                "bundle done"
            ),
        }
        Ok(result)
    }
}

/// Every local path must be an existing file and nothing may still be remote.
fn validate_pool(identity: &UnitIdentity, pool: &ResourcePool) -> Result<()> {
    let invalid: Vec<(String, String)> = pool
        .iter()
        .filter(|(_, value)| match value {
            ResourceValue::Path(path) => !path.is_file(),
            ResourceValue::Remote(_) => true,
            ResourceValue::Pending(_) | ResourceValue::Data(_) => false,
        })
        .map(|(name, value)| (name.clone(), value.describe()))
        .collect();
    if invalid.is_empty() {
        Ok(())
    } else {
        Err(Error::InvalidResources {
            unit: identity.to_string(),
            paths: invalid,
        })
    }
}

/// Pool entries that get persisted to the unit's output directory.
fn sink_outputs(pool: &ResourcePool, config: &RunConfig) -> BTreeSet<String> {
    let mut outputs: BTreeSet<String> = if config.keep_intermediates {
        pool.names().filter(|n| *n != STARTER_KEY).cloned().collect()
    } else {
        OutputCategory::ALL
            .into_iter()
            .map(OutputCategory::resource_key)
            .filter(|key| pool.contains(key))
            .map(str::to_string)
            .collect()
    };
    if config.write_report {
        if pool.contains(MOSAIC_KEY) {
            outputs.insert(MOSAIC_KEY.to_string());
        }
        if pool.contains(OutputCategory::FunctionalTemporal.resource_key())
            && pool.contains(FD_PLOT_KEY)
        {
            outputs.insert(FD_PLOT_KEY.to_string());
        }
    }
    outputs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_collects_every_bad_entry() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("anat.nii");
        fs::write(&real, b"nifti").unwrap();
        let mut pool = ResourcePool::new();
        pool.add("anatomical_scan", ResourceValue::Path(real));
        pool.add("functional_scan", ResourceValue::Path(dir.path().join("missing.nii")));
        pool.add("brain_mask", ResourceValue::Remote("s3://bucket/mask.nii".into()));
        let id = UnitIdentity::new("sub_01", None, None);
        match validate_pool(&id, &pool) {
            Err(Error::InvalidResources { paths, .. }) => {
                let names: Vec<&str> = paths.iter().map(|(n, _)| n.as_str()).collect();
                assert_eq!(names, vec!["brain_mask", "functional_scan"]);
            }
            other => panic!("expected invalid resources, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn sink_list_follows_output_flags() {
        let mut pool = ResourcePool::new();
        let pending = |n| ResourceValue::Pending(PendingOutput::new(cohort_core::NodeId(n), "out"));
        pool.add("anatomical_scan", ResourceValue::Path("/a.nii".into()));
        pool.add("anatomical_spatial_metrics", pending(1));
        pool.add("functional_temporal_metrics", pending(2));
        pool.add(MOSAIC_KEY, pending(3));
        pool.add(FD_PLOT_KEY, pending(4));
        pool.add("skull_stripped", pending(5));
        pool.add(STARTER_KEY, pending(0));

        let mut config = RunConfig::new("qc", "/out", "/work");
        let plain: Vec<String> = sink_outputs(&pool, &config).into_iter().collect();
        assert_eq!(
            plain,
            vec!["anatomical_spatial_metrics", "functional_temporal_metrics"]
        );

        config.write_report = true;
        let reported = sink_outputs(&pool, &config);
        assert!(reported.contains(MOSAIC_KEY) && reported.contains(FD_PLOT_KEY));

        config.keep_intermediates = true;
        let all = sink_outputs(&pool, &config);
        assert!(all.contains("skull_stripped") && all.contains("anatomical_scan"));
        assert!(!all.contains(STARTER_KEY));
    }
}
