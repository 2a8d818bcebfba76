//! Execution side of a cohort run: per-bundle computation graphs, output
//! reconciliation, the bundle executor and the local, cloud and cluster
//! backends the dispatcher chooses between.

pub mod builders;
pub mod cloud;
pub mod cluster;
pub mod dispatch;
pub mod executor;
pub mod graph;
pub mod plugin;
pub mod pool;
pub mod reconcile;
pub mod report;

pub use builders::{BuilderRegistry, CommandBuilder, OutputBuilder, OutputCategory, UnitContext};
pub use cloud::{CloudStager, LocatorStore, ObjectStore};
pub use cluster::{ClusterBatchWriter, CommandSubmitter, Invocation, Submission, Submitter};
pub use dispatch::{plan_run, Dispatcher, PlannedBundle, RunOutcome, RunPlan, CALLBACK_LOG};
pub use executor::BundleExecutor;
pub use graph::{Artifact, CommandTask, NodeInput, SinkTask, StarterTask, Task, TaskContext, Workflow};
pub use plugin::{CallbackLog, ExecutionPlugin, MultiProcPlugin, ResourceLimits};
pub use pool::{BundleLauncher, BundlePool, ProcessLauncher};
pub use reconcile::reconcile_outputs;
pub use report::{JsonSummaryReport, ReportArtifact, ReportWriter};
