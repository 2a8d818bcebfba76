//! Array-job batch files for PBS, SGE and SLURM.
//!
//! One task per bundle. Each task re-invokes this tool with the same
//! configuration and data source plus `--bundle-idx $<TASK_VAR>`, which makes
//! the task execute that bundle locally on its node.

use anyhow::{bail, Context};
use chrono::Local;
use cohort_core::{atomic_write_bytes, ensure_dir, DataSource, Error, Platform, Result, RunConfig};
use regex::{Captures, Regex};
use serde::Serialize;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{info, warn};

pub const CLUSTER_FILES_DIR: &str = "cluster_files";
pub const PID_FILE: &str = "pid.txt";

const PBS_TEMPLATE: &str = "#! {shell}
## PBS batch file - {timestamp}
#PBS -S {shell}
#PBS -N {job_name}
#PBS -t 1-{num_tasks}
#PBS -q {queue}
#PBS -l nodes=1:ppn={cores_per_task}
#PBS -l mem={memory_gb}gb
#PBS -u {user}
#PBS -e {work_dir}/{job_name}.err
#PBS -o {work_dir}/{job_name}.out
";

const SGE_TEMPLATE: &str = "#! {shell}
## SGE batch file - {timestamp}
#$ -S {shell}
#$ -N {job_name}
#$ -t 1-{num_tasks}
#$ -q {queue}
#$ -pe {par_env} {cores_per_task}
#$ -l h_vmem={memory_gb}G
#$ -e {work_dir}/{job_name}.err
#$ -o {work_dir}/{job_name}.out
";

const SLURM_TEMPLATE: &str = "#! {shell}
## SLURM batch file - {timestamp}
#SBATCH --job-name={job_name}
#SBATCH --array=1-{num_tasks}
#SBATCH --cpus-per-task={cores_per_task}
#SBATCH --mem={memory_gb}G
#SBATCH --time={time_limit}
#SBATCH -o {work_dir}/{job_name}.%a.out
#SBATCH -e {work_dir}/{job_name}.%a.err
";

fn template(platform: Platform) -> &'static str {
    match platform {
        Platform::Pbs => PBS_TEMPLATE,
        Platform::Sge => SGE_TEMPLATE,
        Platform::Slurm => SLURM_TEMPLATE,
    }
}

/// Environment variable holding the 1-based array task index.
pub fn task_variable(platform: Platform) -> &'static str {
    match platform {
        Platform::Pbs => "PBS_ARRAYID",
        Platform::Sge => "SGE_TASK_ID",
        Platform::Slurm => "SLURM_ARRAY_TASK_ID",
    }
}

pub fn submit_program(platform: Platform) -> &'static str {
    match platform {
        Platform::Pbs | Platform::Sge => "qsub",
        Platform::Slurm => "sbatch",
    }
}

/// Pattern whose first capture group is the job id in the submit output.
fn confirmation_pattern(platform: Platform) -> &'static str {
    match platform {
        Platform::Sge => r"Your job-array (\d+)",
        Platform::Pbs => r"(?m)(?:Your job-array |^\s*)(\d+)",
        Platform::Slurm => r"Submitted batch job (\d+)",
    }
}

/// Runs the scheduler's submit program and returns everything it printed.
pub trait Submitter: Send + Sync {
    fn submit(&self, program: &str, script: &Path) -> anyhow::Result<String>;
}

pub struct CommandSubmitter;

impl Submitter for CommandSubmitter {
    fn submit(&self, program: &str, script: &Path) -> anyhow::Result<String> {
        let output = Command::new(program)
            .arg(script)
            .output()
            .with_context(|| format!("failed to run {}", program))?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.status.success() {
            let stderr_tail = String::from_utf8_lossy(&output.stderr)
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("no output on stderr")
                .to_string();
            bail!(
                "{} exited with {}: {}",
                program,
                output
                    .status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "a signal".to_string()),
                stderr_tail
            );
        }
        Ok(stdout)
    }
}

/// How an array task re-enters this tool.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: PathBuf,
    pub source: DataSource,
    pub config_path: PathBuf,
}

impl Invocation {
    fn source_flag(&self) -> (&'static str, &PathBuf) {
        match &self.source {
            DataSource::Manifest(path) => ("--manifest", path),
            DataSource::CloudIndex(path) => ("--cloud-index", path),
        }
    }

    pub fn command_line(&self, task_var: &str) -> String {
        let (flag, path) = self.source_flag();
        format!(
            "{} run --config {} {} {} --bundle-idx ${}",
            shell_quote(&self.program),
            shell_quote(&self.config_path),
            flag,
            shell_quote(path),
            task_var
        )
    }

    /// Arguments that run bundle `bundle_index` in a fresh process.
    pub fn bundle_args(&self, bundle_index: usize) -> Vec<OsString> {
        let (flag, path) = self.source_flag();
        vec![
            "run".into(),
            "--config".into(),
            self.config_path.clone().into(),
            flag.into(),
            path.clone().into(),
            "--bundle-idx".into(),
            bundle_index.to_string().into(),
        ]
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Submission {
    pub platform: Platform,
    pub job_id: String,
    pub script_path: PathBuf,
    pub pid_path: PathBuf,
    pub task_count: usize,
}

pub struct ClusterBatchWriter<'a> {
    config: &'a RunConfig,
    platform: Platform,
}

impl<'a> ClusterBatchWriter<'a> {
    pub fn new(config: &'a RunConfig, platform: Platform) -> Self {
        Self { config, platform }
    }

    pub fn cluster_files_dir(&self) -> PathBuf {
        self.config.output_directory.join(CLUSTER_FILES_DIR)
    }

    /// Values substituted into the scheduler template.
    pub fn parameters(
        &self,
        timestamp: &str,
        task_count: usize,
        units_per_task: usize,
    ) -> BTreeMap<&'static str, String> {
        let config = self.config;
        let hours = u64::from(config.hours_per_unit).saturating_mul(units_per_task.max(1) as u64);
        BTreeMap::from([
            ("timestamp", timestamp.to_string()),
            ("shell", env_or("SHELL", "/bin/bash")),
            ("job_name", config.run_name.clone()),
            ("num_tasks", task_count.to_string()),
            ("queue", config.queue.clone()),
            ("par_env", config.parallel_env.clone()),
            ("cores_per_task", config.num_processors.to_string()),
            ("memory_gb", format!("{}", config.memory_gb.ceil().max(1.0) as u64)),
            ("user", current_user()),
            ("work_dir", self.cluster_files_dir().display().to_string()),
            ("time_limit", format!("{}:00:00", hours)),
        ])
    }

    /// Full batch script: the filled-in template, an echo of the task index
    /// and the re-invocation line.
    pub fn render(
        &self,
        invocation: &Invocation,
        parameters: &BTreeMap<&'static str, String>,
    ) -> Result<String> {
        let task_var = task_variable(self.platform);
        let header = fill_template(template(self.platform), parameters)?;
        Ok(format!(
            "{}echo \"Running task: ${}\"\n{}\n",
            header,
            task_var,
            invocation.command_line(task_var)
        ))
    }

    /// Writes the batch file, submits it and records the job id.
    pub fn submit(
        &self,
        invocation: &Invocation,
        task_count: usize,
        units_per_task: usize,
        submitter: &dyn Submitter,
    ) -> Result<Submission> {
        let dir = self.cluster_files_dir();
        ensure_dir(&dir)?;
        let timestamp = Local::now().format("%Y_%m_%d_%H_%M_%S").to_string();
        let parameters = self.parameters(&timestamp, task_count, units_per_task);
        let script = self.render(invocation, &parameters)?;
        let script_path = dir.join(format!("cohort_submit_{}.{}", timestamp, self.platform));
        atomic_write_bytes(&script_path, script.as_bytes())?;
        info!(
            platform = %self.platform,
            tasks = task_count,
            script = %script_path.display(),
            "submitting array job"
        );

        let program = submit_program(self.platform);
        let submission_error = |message: String| Error::Submission {
            platform: self.platform.to_string(),
            message,
        };
        let output = submitter
            .submit(program, &script_path)
            .map_err(|e| submission_error(format!("{:#}", e)))?;
        let job_id = parse_job_id(self.platform, &output).ok_or_else(|| {
            submission_error(format!(
                "{} did not confirm the submission: {}",
                program,
                output.trim()
            ))
        })?;

        let pid_path = dir.join(PID_FILE);
        fs::write(&pid_path, &job_id)
            .map_err(|e| Error::io("failed to write pid file", &pid_path, e))?;
        info!(job_id = %job_id, "array job submitted");
        Ok(Submission {
            platform: self.platform,
            job_id,
            script_path,
            pid_path,
            task_count,
        })
    }
}

pub fn parse_job_id(platform: Platform, output: &str) -> Option<String> {
    let pattern = Regex::new(confirmation_pattern(platform)).ok()?;
    pattern
        .captures(output)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

fn fill_template(template: &str, parameters: &BTreeMap<&'static str, String>) -> Result<String> {
    let placeholder = Regex::new(r"\{([a-z_]+)\}")
        .map_err(|e| Error::config(format!("invalid placeholder pattern: {}", e)))?;
    if let Some(missing) = placeholder
        .captures_iter(template)
        .map(|c| c[1].to_string())
        .find(|key| !parameters.contains_key(key.as_str()))
    {
        return Err(Error::config(format!(
            "batch template uses an unknown parameter '{}'",
            missing
        )));
    }
    Ok(placeholder
        .replace_all(template, |c: &Captures<'_>| {
            parameters.get(&c[1]).cloned().unwrap_or_default()
        })
        .into_owned())
}

fn env_or(key: &str, fallback: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| {
            warn!("could not determine the submitting user");
            "unknown".to_string()
        })
}

/// Single-quotes a path for the batch script unless every byte is safe to
/// leave bare.
fn shell_quote(path: &Path) -> String {
    let raw = path.to_string_lossy();
    let bare = !raw.is_empty()
        && raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_./:=+,@%".contains(&b));
    if bare {
        return raw.into_owned();
    }
    let mut quoted = String::with_capacity(raw.len() + 2);
    quoted.push('\'');
    for c in raw.chars() {
        match c {
            '\'' => quoted.push_str("'\\''"),
            c => quoted.push(c),
        }
    }
    quoted.push('\'');
    quoted
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeSubmitter {
        response: String,
        calls: Mutex<Vec<(String, PathBuf)>>,
    }

    impl FakeSubmitter {
        fn new(response: &str) -> Self {
            Self {
                response: response.to_string(),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl Submitter for FakeSubmitter {
        fn submit(&self, program: &str, script: &Path) -> anyhow::Result<String> {
            self.calls
                .lock()
                .unwrap()
                .push((program.to_string(), script.to_path_buf()));
            Ok(self.response.clone())
        }
    }

    fn invocation(source: DataSource) -> Invocation {
        Invocation {
            program: PathBuf::from("/opt/cohort/bin/cohort"),
            source,
            config_path: PathBuf::from("/data/run config.yml"),
        }
    }

    #[test]
    fn slurm_script_carries_time_limit_and_task_index() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RunConfig::new("qc_run", dir.path(), dir.path().join("work"));
        config.num_processors = 4;
        config.memory_gb = 7.5;
        let writer = ClusterBatchWriter::new(&config, Platform::Slurm);
        let params = writer.parameters("2026_01_02_03_04_05", 3, 4);
        let script = writer
            .render(
                &invocation(DataSource::Manifest("/data/manifest.yml".into())),
                &params,
            )
            .unwrap();

        assert!(script.contains("#SBATCH --array=1-3"), "{}", script);
        assert!(script.contains("#SBATCH --time=32:00:00"));
        assert!(script.contains("#SBATCH --cpus-per-task=4"));
        assert!(script.contains("#SBATCH --mem=8G"));
        assert!(script.contains("echo \"Running task: $SLURM_ARRAY_TASK_ID\""));
        assert!(script.trim_end().ends_with(
            "/opt/cohort/bin/cohort run --config '/data/run config.yml' --manifest /data/manifest.yml --bundle-idx $SLURM_ARRAY_TASK_ID"
        ));
        assert!(!script.contains('{'));
    }

    #[test]
    fn sge_submission_writes_script_and_pid() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunConfig::new("qc_run", dir.path(), dir.path().join("work"));
        let writer = ClusterBatchWriter::new(&config, Platform::Sge);
        let submitter =
            FakeSubmitter::new("Your job-array 4242.1-5:1 (\"qc_run\") has been submitted\n");
        let submission = writer
            .submit(
                &invocation(DataSource::CloudIndex("/data/index.yml".into())),
                5,
                1,
                &submitter,
            )
            .unwrap();

        assert_eq!(submission.job_id, "4242");
        assert_eq!(fs::read_to_string(&submission.pid_path).unwrap(), "4242");
        let script = fs::read_to_string(&submission.script_path).unwrap();
        assert!(script.contains("#$ -pe mpi_smp 1"));
        assert!(script.contains("#$ -q all.q"));
        assert!(script.contains("--cloud-index /data/index.yml --bundle-idx $SGE_TASK_ID"));
        let name = submission.script_path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("cohort_submit_") && name.ends_with(".SGE"), "{}", name);
        let calls = submitter.calls.lock().unwrap();
        assert_eq!(calls[0].0, "qsub");
    }

    #[test]
    fn unconfirmed_submission_leaves_no_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunConfig::new("qc_run", dir.path(), dir.path().join("work"));
        let writer = ClusterBatchWriter::new(&config, Platform::Slurm);
        let err = writer
            .submit(
                &invocation(DataSource::Manifest("/m.yml".into())),
                2,
                1,
                &FakeSubmitter::new("sbatch: error: invalid partition"),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Submission { .. }), "{}", err);
        assert!(!dir.path().join(CLUSTER_FILES_DIR).join(PID_FILE).exists());
    }

    #[test]
    fn job_ids_follow_each_dialect() {
        assert_eq!(
            parse_job_id(Platform::Slurm, "Submitted batch job 991\n").as_deref(),
            Some("991")
        );
        assert_eq!(
            parse_job_id(Platform::Pbs, "1234[].pbs-server\n").as_deref(),
            Some("1234")
        );
        assert_eq!(parse_job_id(Platform::Sge, "Submitted batch job 991"), None);
    }

    #[test]
    fn bundle_args_match_the_array_task_command() {
        let args = invocation(DataSource::CloudIndex("/data/index.yml".into())).bundle_args(7);
        let args: Vec<String> = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            vec![
                "run",
                "--config",
                "/data/run config.yml",
                "--cloud-index",
                "/data/index.yml",
                "--bundle-idx",
                "7"
            ]
        );
    }

    #[test]
    fn script_paths_are_quoted_only_when_needed() {
        assert_eq!(
            shell_quote(Path::new("/scratch/run_01/a+b@2.yml")),
            "/scratch/run_01/a+b@2.yml"
        );
        assert_eq!(shell_quote(Path::new("")), "''");
        assert_eq!(
            shell_quote(Path::new("/data/my study/$HOME")),
            "'/data/my study/$HOME'"
        );
        assert_eq!(shell_quote(Path::new("/data/o'brien.yml")), "'/data/o'\\''brien.yml'");
    }

    #[test]
    fn unknown_template_parameters_are_rejected() {
        let params = BTreeMap::from([("shell", "/bin/sh".to_string())]);
        assert!(fill_template("#! {shell}\n{mystery}\n", &params).is_err());
        assert_eq!(fill_template("#! {shell}", &params).unwrap(), "#! /bin/sh");
    }
}
