//! Run-level reports written after all bundles have executed.

use crate::builders::OutputCategory;
use anyhow::Result;
use chrono::Utc;
use cohort_core::{atomic_write_json_pretty, status_counts, ExecutionResult, UnitIdentity};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportArtifact {
    pub name: String,
    pub path: PathBuf,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

pub trait ReportWriter: Send + Sync {
    fn write(
        &self,
        output_dir: &Path,
        run_name: &str,
        results: &[ExecutionResult],
    ) -> Result<Vec<ReportArtifact>>;
}

/// Writes `<run>_summary.json` with per-bundle statuses, and one
/// `<run>_<category>.json` per output category collecting the metrics of
/// every unit keyed by `subject/session/scan`.
#[derive(Debug, Default)]
pub struct JsonSummaryReport;

impl ReportWriter for JsonSummaryReport {
    fn write(
        &self,
        output_dir: &Path,
        run_name: &str,
        results: &[ExecutionResult],
    ) -> Result<Vec<ReportArtifact>> {
        let mut artifacts = Vec::new();

        let counts: Map<String, Value> = status_counts(results)
            .into_iter()
            .map(|(status, n)| (status.to_string(), json!(n)))
            .collect();
        let summary = json!({
            "run_name": run_name,
            "generated_at": Utc::now().to_rfc3339(),
            "bundles": results.len(),
            "status_counts": counts,
            "results": results,
        });
        let summary_path = output_dir.join(format!("{}_summary.json", run_name));
        artifacts.push(artifact(
            "summary",
            summary_path.clone(),
            atomic_write_json_pretty(&summary_path, &summary).map_err(anyhow::Error::from),
        ));

        let run_dir = output_dir.join(run_name);
        for category in OutputCategory::ALL {
            let mut doc = Map::new();
            for identity in results.iter().flat_map(|r| r.units.iter()) {
                let unit_dir = identity.output_dir(output_dir, run_name);
                if let Some(value) = category_document(&unit_dir, identity, category) {
                    doc.insert(identity.document_key(), value);
                }
            }
            if doc.is_empty() {
                debug!(%category, dir = %run_dir.display(), "no outputs to aggregate");
                continue;
            }
            let path = output_dir.join(format!("{}_{}.json", run_name, category.name()));
            let written = atomic_write_json_pretty(&path, &Value::Object(doc));
            artifacts.push(artifact(category.name(), path, written.map_err(anyhow::Error::from)));
        }
        Ok(artifacts)
    }
}

fn artifact(name: &str, path: PathBuf, written: Result<()>) -> ReportArtifact {
    let (success, message) = match written {
        Ok(()) => (true, None),
        Err(e) => (false, Some(format!("{:#}", e))),
    };
    ReportArtifact {
        name: name.to_string(),
        path,
        success,
        message,
    }
}

/// Metrics of one category for one unit: the first JSON file in the
/// category's output directory, or the unit's entry in a compound document.
fn category_document(
    unit_dir: &Path,
    identity: &UnitIdentity,
    category: OutputCategory,
) -> Option<Value> {
    let from_dir = WalkDir::new(unit_dir.join(category.resource_key()))
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .find_map(|e| read_json(e.path()));
    if from_dir.is_some() {
        return from_dir;
    }
    WalkDir::new(unit_dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| read_json(e.path()))
        .find_map(|doc| {
            doc.get(identity.document_key())
                .and_then(|entry| entry.get(category.document_field()))
                .cloned()
        })
}

fn read_json(path: &Path) -> Option<Value> {
    if path.extension().and_then(|e| e.to_str()) != Some("json") {
        return None;
    }
    serde_json::from_slice(&fs::read(path).ok()?).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cohort_core::RunStatus;

    #[test]
    fn summary_and_category_aggregates_are_written() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path();
        let a = UnitIdentity::new("sub_01", None, None);
        let b = UnitIdentity::new("sub_02", Some("ses_1".into()), None);

        let metrics = a.output_dir(out, "qc").join("anatomical_spatial_metrics");
        fs::create_dir_all(&metrics).unwrap();
        fs::write(metrics.join("metrics.json"), r#"{"snr": 12.5}"#).unwrap();
        let b_dir = b.output_dir(out, "qc");
        fs::create_dir_all(&b_dir).unwrap();
        fs::write(
            b_dir.join("qap.json"),
            json!({"sub_02/ses_1/scan_0": {"anatomical_spatial": {"snr": 9.0}}}).to_string(),
        )
        .unwrap();

        let results = vec![
            ExecutionResult {
                bundle_index: 1,
                units: vec![a, b],
                status: RunStatus::Finished,
                message: None,
                elapsed_secs: 3.0,
            },
            ExecutionResult::failed(2, vec![UnitIdentity::new("sub_03", None, None)], "boom"),
        ];
        let artifacts = JsonSummaryReport.write(out, "qc", &results).unwrap();
        let names: Vec<&str> = artifacts.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["summary", "anatomical_spatial"]);
        assert!(artifacts.iter().all(|a| a.success));

        let summary: Value =
            serde_json::from_slice(&fs::read(out.join("qc_summary.json")).unwrap()).unwrap();
        assert_eq!(summary["status_counts"]["finished"], 1);
        assert_eq!(summary["status_counts"]["failed"], 1);
        assert_eq!(summary["results"][1]["message"], "boom");

        let aggregate: Value =
            serde_json::from_slice(&fs::read(out.join("qc_anatomical_spatial.json")).unwrap())
                .unwrap();
        assert_eq!(aggregate["sub_01/session_0/scan_0"]["snr"], 12.5);
        assert_eq!(aggregate["sub_02/ses_1/scan_0"]["snr"], 9.0);
    }
}
