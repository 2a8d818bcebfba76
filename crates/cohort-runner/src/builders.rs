//! Output categories and the builders that extend a bundle graph to produce
//! them.

use crate::graph::{Artifact, CommandTask, NodeInput, Workflow};
use anyhow::{anyhow, bail, Result};
use cohort_core::{BuilderSpec, Error, PendingOutput, ResourcePool, ResourceValue, RunConfig, UnitIdentity};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

pub const ANATOMICAL_SCAN: &str = "anatomical_scan";
pub const FUNCTIONAL_SCAN: &str = "functional_scan";
/// Pool entry linking a unit's subgraph to the bundle's shared entry node.
pub const STARTER_KEY: &str = "starter";
/// Extra outputs persisted when reports are requested.
pub const MOSAIC_KEY: &str = "mosaic";
pub const FD_PLOT_KEY: &str = "fd_plot";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OutputCategory {
    AnatomicalSpatial,
    FunctionalSpatial,
    FunctionalTemporal,
    AnatomicalHeaderInfo,
    FunctionalHeaderInfo,
}

impl OutputCategory {
    /// Build order within one unit.
    pub const ALL: [OutputCategory; 5] = [
        OutputCategory::AnatomicalSpatial,
        OutputCategory::FunctionalSpatial,
        OutputCategory::FunctionalTemporal,
        OutputCategory::AnatomicalHeaderInfo,
        OutputCategory::FunctionalHeaderInfo,
    ];

    pub fn name(self) -> &'static str {
        match self {
            OutputCategory::AnatomicalSpatial => "anatomical_spatial",
            OutputCategory::FunctionalSpatial => "functional_spatial",
            OutputCategory::FunctionalTemporal => "functional_temporal",
            OutputCategory::AnatomicalHeaderInfo => "anatomical_header_info",
            OutputCategory::FunctionalHeaderInfo => "functional_header_info",
        }
    }

    /// Pool entry whose presence means the category is done.
    pub fn resource_key(self) -> &'static str {
        match self {
            OutputCategory::AnatomicalSpatial => "anatomical_spatial_metrics",
            OutputCategory::FunctionalSpatial => "functional_spatial_metrics",
            OutputCategory::FunctionalTemporal => "functional_temporal_metrics",
            OutputCategory::AnatomicalHeaderInfo => "anatomical_header_info",
            OutputCategory::FunctionalHeaderInfo => "functional_header_info",
        }
    }

    /// Field holding this category inside a compound result document.
    pub fn document_field(self) -> &'static str {
        self.name()
    }

    /// Input the category is computed from; units without it are skipped.
    pub fn primary_input(self) -> &'static str {
        match self {
            OutputCategory::AnatomicalSpatial | OutputCategory::AnatomicalHeaderInfo => {
                ANATOMICAL_SCAN
            }
            OutputCategory::FunctionalSpatial
            | OutputCategory::FunctionalTemporal
            | OutputCategory::FunctionalHeaderInfo => FUNCTIONAL_SCAN,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }
}

impl fmt::Display for OutputCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub struct UnitContext<'a> {
    pub identity: &'a UnitIdentity,
    /// Node-name suffix unique to the unit within the bundle.
    pub name: &'a str,
    pub output_dir: &'a Path,
}

pub trait OutputBuilder: Send + Sync {
    /// Adds the nodes producing this builder's category and registers their
    /// outputs in `pool` as pending entries.
    fn build(
        &self,
        workflow: &mut Workflow,
        pool: &mut ResourcePool,
        config: &RunConfig,
        unit: &UnitContext<'_>,
    ) -> Result<()>;
}

#[derive(Default)]
pub struct BuilderRegistry {
    builders: BTreeMap<OutputCategory, Box<dyn OutputBuilder>>,
}

impl BuilderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, category: OutputCategory, builder: Box<dyn OutputBuilder>) {
        self.builders.insert(category, builder);
    }

    pub fn with(mut self, category: OutputCategory, builder: Box<dyn OutputBuilder>) -> Self {
        self.register(category, builder);
        self
    }

    pub fn get(&self, category: OutputCategory) -> Option<&dyn OutputBuilder> {
        self.builders.get(&category).map(|b| b.as_ref())
    }

    pub fn categories(&self) -> impl Iterator<Item = OutputCategory> + '_ {
        self.builders.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.builders.is_empty()
    }

    /// Resolves the `builders` section of the run configuration.
    pub fn from_config(config: &RunConfig) -> cohort_core::Result<Self> {
        let mut registry = Self::new();
        for (name, spec) in &config.builders {
            let category = OutputCategory::from_name(name).ok_or_else(|| {
                Error::config(format!(
                    "unknown output category '{}' in builders; expected one of: {}",
                    name,
                    OutputCategory::ALL.map(OutputCategory::name).join(", ")
                ))
            })?;
            if !spec.outputs.contains_key(category.resource_key()) {
                return Err(Error::config(format!(
                    "builder {} must declare the output {}",
                    name,
                    category.resource_key()
                )));
            }
            if spec.command.is_empty() {
                return Err(Error::config(format!("builder {} has an empty command", name)));
            }
            registry.register(category, Box::new(CommandBuilder::new(category, spec.clone())));
        }
        Ok(registry)
    }
}

/// Builds a category with one external command node.
pub struct CommandBuilder {
    category: OutputCategory,
    spec: BuilderSpec,
}

impl CommandBuilder {
    pub fn new(category: OutputCategory, spec: BuilderSpec) -> Self {
        Self { category, spec }
    }
}

impl OutputBuilder for CommandBuilder {
    fn build(
        &self,
        workflow: &mut Workflow,
        pool: &mut ResourcePool,
        _config: &RunConfig,
        unit: &UnitContext<'_>,
    ) -> Result<()> {
        let mut inputs = BTreeMap::new();
        for name in &self.spec.inputs {
            let value = pool
                .get(name)
                .ok_or_else(|| anyhow!("{} is missing input {}", unit.identity, name))?;
            inputs.insert(name.clone(), node_input(name, value)?);
        }
        if let Some(ResourceValue::Pending(starter)) = pool.get(STARTER_KEY) {
            inputs.insert(STARTER_KEY.to_string(), NodeInput::Link(starter.clone()));
        }
        let task = CommandTask::new(self.spec.command.clone(), self.spec.outputs.clone())?;
        let node = workflow.add_node(
            format!("{}{}", self.category.name(), unit.name),
            Arc::new(task),
            inputs,
            self.spec.memory_gb,
        )?;
        for output in self.spec.outputs.keys() {
            pool.add(
                output.clone(),
                ResourceValue::Pending(PendingOutput::new(node, output.clone())),
            );
        }
        Ok(())
    }
}

fn node_input(name: &str, value: &ResourceValue) -> Result<NodeInput> {
    Ok(match value {
        ResourceValue::Path(path) => NodeInput::Artifact(Artifact::File(path.clone())),
        ResourceValue::Data(data) => NodeInput::Artifact(Artifact::Data(data.clone())),
        ResourceValue::Pending(pending) => NodeInput::Link(pending.clone()),
        ResourceValue::Remote(locator) => {
            bail!("input {} was never staged from {}", name, locator)
        }
    })
}
