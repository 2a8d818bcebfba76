use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const DEFAULT_QUEUE: &str = "all.q";
pub const DEFAULT_PARALLEL_ENV: &str = "mpi_smp";
pub const DEFAULT_HOURS_PER_UNIT: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Platform {
    #[serde(rename = "PBS")]
    Pbs,
    #[serde(rename = "SGE")]
    Sge,
    #[serde(rename = "SLURM")]
    Slurm,
}

impl Platform {
    pub const ALL: [Platform; 3] = [Platform::Sge, Platform::Pbs, Platform::Slurm];

    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Pbs => "PBS",
            Platform::Sge => "SGE",
            Platform::Slurm => "SLURM",
        }
    }

    /// Interprets the `resource_manager` setting. Missing values and any
    /// spelling of "none" mean local execution.
    pub fn from_resource_manager(raw: Option<&str>) -> Result<Option<Platform>> {
        match raw.map(str::trim) {
            None | Some("") => Ok(None),
            Some(value) if value.eq_ignore_ascii_case("none") => Ok(None),
            Some(value) => value.parse().map(Some),
        }
    }
}

impl FromStr for Platform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PBS" => Ok(Platform::Pbs),
            "SGE" => Ok(Platform::Sge),
            "SLURM" => Ok(Platform::Slurm),
            other => Err(Error::config(format!(
                "the resource manager {} is not one of the valid choices: {}",
                other,
                Platform::ALL.map(Platform::as_str).join(", ")
            ))),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// External command that produces one output category for one unit.
///
/// `command` tokens may reference `{input_name}` placeholders for any name
/// listed in `inputs` and `{out_dir}` for the node's working directory.
/// `outputs` maps resource names to file names relative to that directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuilderSpec {
    pub command: Vec<String>,
    #[serde(default)]
    pub inputs: Vec<String>,
    pub outputs: BTreeMap<String, String>,
    #[serde(default = "default_node_memory")]
    pub memory_gb: f64,
}

fn default_node_memory() -> f64 {
    1.0
}

#[derive(Debug, Deserialize)]
struct RawRunConfig {
    pipeline_name: String,
    num_processors: usize,
    memory_allocated: f64,
    output_directory: PathBuf,
    working_directory: PathBuf,
    #[serde(default = "one")]
    num_subjects_per_bundle: usize,
    #[serde(default = "one")]
    num_bundles_at_once: usize,
    #[serde(default)]
    resource_manager: Option<String>,
    #[serde(default)]
    queue: Option<String>,
    #[serde(default)]
    parallel_environment: Option<String>,
    #[serde(default)]
    hours_per_unit: Option<u32>,
    #[serde(default)]
    write_all_outputs: bool,
    #[serde(default)]
    write_report: bool,
    #[serde(default)]
    write_graph: bool,
    #[serde(default)]
    upload_to_s3: bool,
    #[serde(default)]
    upload_destination: Option<String>,
    #[serde(default)]
    builders: BTreeMap<String, BuilderSpec>,
}

fn one() -> usize {
    1
}

/// Resolved run settings, passed explicitly through every layer.
#[derive(Debug, Clone, Serialize)]
pub struct RunConfig {
    pub run_name: String,
    pub num_processors: usize,
    pub memory_gb: f64,
    pub units_per_bundle: usize,
    pub bundles_at_once: usize,
    pub output_directory: PathBuf,
    pub working_directory: PathBuf,
    pub platform: Option<Platform>,
    pub queue: String,
    pub parallel_env: String,
    pub hours_per_unit: u32,
    pub keep_intermediates: bool,
    pub write_report: bool,
    pub write_graph: bool,
    pub upload_results: bool,
    pub upload_destination: Option<String>,
    pub builders: BTreeMap<String, BuilderSpec>,
    /// Absolute path of the YAML file this config came from; array tasks are
    /// re-invoked with it.
    pub config_path: Option<PathBuf>,
}

impl RunConfig {
    /// Minimal local configuration; everything else takes its default.
    pub fn new(
        run_name: impl Into<String>,
        output_directory: impl Into<PathBuf>,
        working_directory: impl Into<PathBuf>,
    ) -> Self {
        Self {
            run_name: run_name.into(),
            num_processors: 1,
            memory_gb: 1.0,
            units_per_bundle: 1,
            bundles_at_once: 1,
            output_directory: output_directory.into(),
            working_directory: working_directory.into(),
            platform: None,
            queue: DEFAULT_QUEUE.to_string(),
            parallel_env: DEFAULT_PARALLEL_ENV.to_string(),
            hours_per_unit: DEFAULT_HOURS_PER_UNIT,
            keep_intermediates: false,
            write_report: false,
            write_graph: false,
            upload_results: false,
            upload_destination: None,
            builders: BTreeMap::new(),
            config_path: None,
        }
    }

    pub fn from_yaml_str(raw: &str, origin: &Path) -> Result<Self> {
        let raw: RawRunConfig = serde_yaml::from_str(raw).map_err(|e| Error::parse(origin, e))?;
        let config = Self {
            run_name: raw.pipeline_name,
            num_processors: raw.num_processors,
            memory_gb: raw.memory_allocated,
            units_per_bundle: raw.num_subjects_per_bundle,
            bundles_at_once: raw.num_bundles_at_once,
            output_directory: raw.output_directory,
            working_directory: raw.working_directory,
            platform: Platform::from_resource_manager(raw.resource_manager.as_deref())?,
            queue: raw.queue.unwrap_or_else(|| DEFAULT_QUEUE.to_string()),
            parallel_env: raw
                .parallel_environment
                .unwrap_or_else(|| DEFAULT_PARALLEL_ENV.to_string()),
            hours_per_unit: raw.hours_per_unit.unwrap_or(DEFAULT_HOURS_PER_UNIT),
            keep_intermediates: raw.write_all_outputs,
            write_report: raw.write_report,
            write_graph: raw.write_graph,
            upload_results: raw.upload_to_s3,
            upload_destination: raw.upload_destination,
            builders: raw.builders,
            config_path: None,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.run_name.trim().is_empty() {
            return Err(Error::config("pipeline_name must not be empty"));
        }
        if self.num_processors == 0 {
            return Err(Error::config("num_processors must be at least 1"));
        }
        if !(self.memory_gb > 0.0) {
            return Err(Error::config("memory_allocated must be positive"));
        }
        if self.units_per_bundle == 0 {
            return Err(Error::config("num_subjects_per_bundle must be at least 1"));
        }
        if self.bundles_at_once == 0 {
            return Err(Error::config("num_bundles_at_once must be at least 1"));
        }
        if self.upload_results && self.upload_destination.is_none() {
            return Err(Error::config(
                "upload_to_s3 is set but no upload_destination was given",
            ));
        }
        Ok(())
    }

    /// Creates the output and working directories.
    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.output_directory).map_err(|e| {
            Error::io("output directory unable to be created", &self.output_directory, e)
        })?;
        fs::create_dir_all(&self.working_directory).map_err(|e| {
            Error::io("working directory unable to be created", &self.working_directory, e)
        })?;
        Ok(())
    }

    pub fn run_output_dir(&self) -> PathBuf {
        self.output_directory.join(&self.run_name)
    }
}

pub fn load_run_config(path: &Path) -> Result<RunConfig> {
    let raw = fs::read_to_string(path)
        .map_err(|e| Error::io("failed to read pipeline configuration", path, e))?;
    let mut config = RunConfig::from_yaml_str(&raw, path)?;
    config.config_path = Some(fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf()));
    Ok(config)
}
