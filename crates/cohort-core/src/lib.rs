//! Data model and planning for bundled per-subject runs: unit identities,
//! resource pools, manifest flattening, bundle partitioning, index
//! resolution, run configuration and run-mode selection.

pub mod bundle;
pub mod config;
pub mod error;
pub mod fsutil;
pub mod identity;
pub mod manifest;
pub mod mode;
pub mod resource;
pub mod result;

pub use bundle::{
    bundle_count, bundle_range, partition_bundles, select_bundle, selector_range, unit_position,
    Bundle, UnitSelector,
};
pub use config::{load_run_config, BuilderSpec, Platform, RunConfig};
pub use error::{Error, Result};
pub use fsutil::{atomic_write_bytes, atomic_write_json_pretty, ensure_dir};
pub use identity::UnitIdentity;
pub use manifest::{flatten_manifest, load_cloud_index, load_manifest, FlatManifest, SITE_KEY};
pub use mode::{DataSource, RunInputs, RunMode};
pub use resource::{NodeId, PendingOutput, ResourcePool, ResourceValue, Site};
pub use result::{status_counts, ExecutionResult, RunStatus};
