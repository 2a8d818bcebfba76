use serde_json::Value;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

fn write_run(root: &Path, subjects: usize, bundles_at_once: usize) -> (PathBuf, PathBuf) {
    fs::create_dir_all(root.join("data")).unwrap();
    let mut manifest = String::new();
    for i in 1..=subjects {
        let file = root.join(format!("data/sub_{:02}_anat.nii", i));
        fs::write(&file, b"nifti").unwrap();
        manifest.push_str(&format!(
            "sub_{:02}:\n  ses_1:\n    anatomical_scan: {}\n",
            i,
            file.display()
        ));
    }
    let manifest_path = root.join("manifest.yml");
    fs::write(&manifest_path, manifest).unwrap();

    // each metrics file records the pid of the cohort process that ran it
    let config = format!(
        r#"pipeline_name: qc
num_processors: 1
memory_allocated: 2
output_directory: {out}
working_directory: {work}
num_subjects_per_bundle: 1
num_bundles_at_once: {bundles_at_once}
builders:
  anatomical_spatial:
    command: ["sh", "-c", "echo $PPID > metrics.json", "{{anatomical_scan}}"]
    inputs: [anatomical_scan]
    outputs:
      anatomical_spatial_metrics: metrics.json
"#,
        out = root.join("out").display(),
        work = root.join("work").display(),
        bundles_at_once = bundles_at_once,
    );
    let config_path = root.join("pipeline.yml");
    fs::write(&config_path, config).unwrap();
    (config_path, manifest_path)
}

fn cohort() -> Command {
    Command::new(env!("CARGO_BIN_EXE_cohort"))
}

#[cfg(unix)]
#[test]
fn pooled_bundles_run_in_separate_worker_processes() {
    let dir = tempfile::tempdir().unwrap();
    let (config, manifest) = write_run(dir.path(), 4, 2);

    let child = cohort()
        .arg("run")
        .arg("--config")
        .arg(&config)
        .arg("--manifest")
        .arg(&manifest)
        .arg("--json")
        .stdout(std::process::Stdio::piped())
        .spawn()
        .unwrap();
    let parent_pid = child.id().to_string();
    let output = child.wait_with_output().unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stdout));

    let payload: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(payload["ok"], Value::Bool(true));
    let results = payload["results"].as_array().unwrap();
    let indices: Vec<u64> = results
        .iter()
        .map(|r| r["bundle_index"].as_u64().unwrap())
        .collect();
    assert_eq!(indices, vec![1, 2, 3, 4]);
    assert!(results.iter().all(|r| r["status"] == "finished"), "{:?}", results);

    let mut pids = BTreeSet::new();
    for i in 1..=4 {
        let metrics = dir.path().join(format!(
            "out/qc/sub_{:02}/ses_1/scan_0/anatomical_spatial_metrics/metrics.json",
            i
        ));
        pids.insert(fs::read_to_string(metrics).unwrap().trim().to_string());
        assert!(dir
            .path()
            .join(format!("work/bundle_results/bundle_{}.json", i))
            .is_file());
    }
    assert_eq!(pids.len(), 4, "{:?}", pids);
    assert!(!pids.contains(&parent_pid));
}

#[test]
fn result_file_requires_a_selected_bundle() {
    let dir = tempfile::tempdir().unwrap();
    let (config, manifest) = write_run(dir.path(), 2, 1);
    let output = cohort()
        .arg("run")
        .arg("--config")
        .arg(&config)
        .arg("--manifest")
        .arg(&manifest)
        .arg("--result-file")
        .arg(dir.path().join("r.json"))
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("--result-file needs"));
    assert!(!dir.path().join("r.json").exists());
}

#[cfg(unix)]
#[test]
fn a_selected_bundle_reports_through_its_result_file() {
    let dir = tempfile::tempdir().unwrap();
    let (config, manifest) = write_run(dir.path(), 3, 1);
    let result_file = dir.path().join("results/bundle_2.json");
    let status = cohort()
        .arg("run")
        .arg("--config")
        .arg(&config)
        .arg("--manifest")
        .arg(&manifest)
        .arg("--bundle-idx")
        .arg("2")
        .arg("--result-file")
        .arg(&result_file)
        .status()
        .unwrap();
    assert!(status.success());

    let result: Value = serde_json::from_str(&fs::read_to_string(&result_file).unwrap()).unwrap();
    assert_eq!(result["bundle_index"], 2);
    assert_eq!(result["status"], "finished");
    assert_eq!(result["units"].as_array().unwrap().len(), 1);
    assert!(!dir.path().join("out/qc_summary.json").exists());
}
