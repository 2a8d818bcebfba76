use crate::bundle::UnitSelector;
use crate::config::Platform;
use crate::error::{Error, Result};
use std::path::PathBuf;

/// Raw, possibly contradictory inputs as given on the command line.
#[derive(Debug, Clone, Default)]
pub struct RunInputs {
    pub manifest: Option<PathBuf>,
    pub cloud_index: Option<PathBuf>,
    pub bundle_index: Option<usize>,
    pub unit_index: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataSource {
    Manifest(PathBuf),
    CloudIndex(PathBuf),
}

/// How one invocation runs. Each variant carries only the fields that are
/// meaningful for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMode {
    /// Locally stored data. With a selector only that slice runs here, which
    /// is how array tasks of a manifest-based cluster run re-enter.
    LocalRun {
        manifest: PathBuf,
        selector: Option<UnitSelector>,
    },
    /// Data staged from object storage before each bundle executes.
    CloudRun {
        index: PathBuf,
        selector: Option<UnitSelector>,
    },
    /// Write and submit one array job with a task per bundle.
    ClusterRun {
        source: DataSource,
        platform: Platform,
    },
}

impl RunMode {
    pub fn resolve(inputs: RunInputs, platform: Option<Platform>) -> Result<RunMode> {
        let source = match (inputs.manifest, inputs.cloud_index) {
            (Some(_), Some(_)) => {
                return Err(Error::config(
                    "provide either a participant manifest or a cloud index, not both",
                ))
            }
            (None, None) => {
                return Err(Error::config(
                    "a participant manifest is required for regular runs, or a cloud index for cloud-based runs",
                ))
            }
            (Some(manifest), None) => DataSource::Manifest(manifest),
            (None, Some(index)) => DataSource::CloudIndex(index),
        };

        let selector = match (inputs.bundle_index, inputs.unit_index) {
            (Some(_), Some(_)) => {
                return Err(Error::config(
                    "provide either a bundle index or a unit index, not both",
                ))
            }
            (Some(0), None) | (None, Some(0)) => {
                return Err(Error::config("bundle and unit indices start at 1"))
            }
            (Some(k), None) => Some(UnitSelector::Bundle(k)),
            (None, Some(i)) => Some(UnitSelector::Unit(i)),
            (None, None) => None,
        };

        Ok(match (source, selector, platform) {
            (DataSource::Manifest(manifest), Some(selector), _) => RunMode::LocalRun {
                manifest,
                selector: Some(selector),
            },
            (DataSource::CloudIndex(index), Some(selector), _) => RunMode::CloudRun {
                index,
                selector: Some(selector),
            },
            (source, None, Some(platform)) => RunMode::ClusterRun { source, platform },
            (DataSource::Manifest(manifest), None, None) => RunMode::LocalRun {
                manifest,
                selector: None,
            },
            (DataSource::CloudIndex(index), None, None) => RunMode::CloudRun {
                index,
                selector: None,
            },
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::LocalRun { selector: None, .. } => "local",
            RunMode::LocalRun { .. } => "local_slice",
            RunMode::CloudRun { selector: None, .. } => "cloud_loop",
            RunMode::CloudRun { .. } => "cloud_bundle",
            RunMode::ClusterRun { .. } => "cluster",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(manifest: bool, cloud: bool, bundle: Option<usize>, unit: Option<usize>) -> RunInputs {
        RunInputs {
            manifest: manifest.then(|| PathBuf::from("participants.yml")),
            cloud_index: cloud.then(|| PathBuf::from("cloud.yml")),
            bundle_index: bundle,
            unit_index: unit,
        }
    }

    #[test]
    fn each_valid_combination_selects_one_mode() {
        let local = RunMode::resolve(inputs(true, false, None, None), None).unwrap();
        assert_eq!(local.as_str(), "local");
        let cloud_loop = RunMode::resolve(inputs(false, true, None, None), None).unwrap();
        assert_eq!(cloud_loop.as_str(), "cloud_loop");
        let cloud_bundle = RunMode::resolve(inputs(false, true, Some(3), None), None).unwrap();
        assert_eq!(
            cloud_bundle,
            RunMode::CloudRun {
                index: PathBuf::from("cloud.yml"),
                selector: Some(UnitSelector::Bundle(3)),
            }
        );
        let cluster =
            RunMode::resolve(inputs(false, true, None, None), Some(Platform::Slurm)).unwrap();
        assert_eq!(
            cluster,
            RunMode::ClusterRun {
                source: DataSource::CloudIndex(PathBuf::from("cloud.yml")),
                platform: Platform::Slurm,
            }
        );
    }

    #[test]
    fn array_tasks_never_resubmit() {
        let task = RunMode::resolve(inputs(true, false, Some(2), None), Some(Platform::Sge)).unwrap();
        assert_eq!(task.as_str(), "local_slice");
        let task = RunMode::resolve(inputs(false, true, None, Some(5)), Some(Platform::Pbs)).unwrap();
        assert_eq!(task.as_str(), "cloud_bundle");
    }

    #[test]
    fn contradictory_inputs_are_rejected() {
        for bad in [
            inputs(true, true, None, None),
            inputs(false, false, Some(1), None),
            inputs(true, false, Some(1), Some(1)),
            inputs(false, true, Some(0), None),
        ] {
            assert!(matches!(RunMode::resolve(bad, None), Err(Error::Config(_))));
        }
    }
}
