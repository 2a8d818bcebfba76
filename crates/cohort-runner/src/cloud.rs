//! Staging of cloud-indexed units to local storage and upload of results.

use anyhow::{anyhow, bail, Context};
use cohort_core::{
    atomic_write_bytes, ensure_dir, load_cloud_index, selector_range, Bundle, Error,
    FlatManifest, ResourcePool, ResourceValue, Result, RunConfig, UnitIdentity, UnitSelector,
};
use reqwest::blocking::Client;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, info_span};
use walkdir::WalkDir;

pub const STAGED_DIR: &str = "staged";

/// Transfers single objects between remote storage and the local disk.
pub trait ObjectStore: Send + Sync {
    fn download(&self, locator: &str, dest: &Path) -> anyhow::Result<()>;
    fn upload(&self, src: &Path, locator: &str) -> anyhow::Result<()>;
}

/// Understands plain paths, `file://`, `http(s)://` and `s3://bucket/key`
/// locators. S3 objects are reached through their virtual-hosted HTTPS URL.
#[derive(Debug, Clone)]
pub struct LocatorStore {
    timeout: Duration,
}

impl Default for LocatorStore {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
        }
    }
}

enum Location {
    Local(PathBuf),
    Http(String),
}

impl LocatorStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn client(&self) -> anyhow::Result<Client> {
        Client::builder()
            .timeout(self.timeout)
            .build()
            .context("failed to build HTTP client")
    }

    fn locate(locator: &str) -> anyhow::Result<Location> {
        if let Some(rest) = locator.strip_prefix("s3://") {
            let (bucket, key) = rest
                .split_once('/')
                .filter(|(bucket, key)| !bucket.is_empty() && !key.is_empty())
                .ok_or_else(|| anyhow!("invalid S3 locator: {}", locator))?;
            return Ok(Location::Http(format!(
                "https://{}.s3.amazonaws.com/{}",
                bucket, key
            )));
        }
        if locator.starts_with("http://") || locator.starts_with("https://") {
            return Ok(Location::Http(locator.to_string()));
        }
        let path = locator.strip_prefix("file://").unwrap_or(locator);
        if path.is_empty() {
            bail!("empty locator");
        }
        Ok(Location::Local(PathBuf::from(path)))
    }
}

impl ObjectStore for LocatorStore {
    fn download(&self, locator: &str, dest: &Path) -> anyhow::Result<()> {
        let bytes = match Self::locate(locator)? {
            Location::Local(src) => {
                fs::read(&src).with_context(|| format!("failed to read {}", src.display()))?
            }
            Location::Http(url) => {
                let response = self
                    .client()?
                    .get(&url)
                    .send()
                    .with_context(|| format!("GET {} failed", url))?
                    .error_for_status()
                    .with_context(|| format!("GET {} failed", url))?;
                response
                    .bytes()
                    .with_context(|| format!("failed to read body of {}", url))?
                    .to_vec()
            }
        };
        atomic_write_bytes(dest, &bytes)?;
        Ok(())
    }

    fn upload(&self, src: &Path, locator: &str) -> anyhow::Result<()> {
        let bytes = fs::read(src).with_context(|| format!("failed to read {}", src.display()))?;
        match Self::locate(locator)? {
            Location::Local(dest) => atomic_write_bytes(&dest, &bytes)?,
            Location::Http(url) => {
                self.client()?
                    .put(&url)
                    .body(bytes)
                    .send()
                    .with_context(|| format!("PUT {} failed", url))?
                    .error_for_status()
                    .with_context(|| format!("PUT {} failed", url))?;
            }
        }
        Ok(())
    }
}

/// Units listed in a cloud index, fetched to local storage on demand.
pub struct CloudStager {
    index: FlatManifest,
    keys: Vec<UnitIdentity>,
    store: Arc<dyn ObjectStore>,
}

impl CloudStager {
    pub fn open(index_path: &Path, store: Arc<dyn ObjectStore>) -> Result<Self> {
        let index = load_cloud_index(index_path)?;
        info!(index = %index_path.display(), units = index.len(), "loaded cloud index");
        Ok(Self::from_index(index, store))
    }

    pub fn from_index(index: FlatManifest, store: Arc<dyn ObjectStore>) -> Self {
        let keys = index.keys().cloned().collect();
        Self { index, keys, store }
    }

    /// Identity of unit `unit_index` (1-based, in index order).
    pub fn identity(&self, unit_index: usize) -> Option<&UnitIdentity> {
        unit_index.checked_sub(1).and_then(|pos| self.keys.get(pos))
    }

    pub fn unit_count(&self) -> usize {
        self.index.len()
    }

    /// Stages unit `unit_index` (1-based, in index order). Every remote entry
    /// is replaced by the path of its local copy.
    pub fn fetch(&self, unit_index: usize, config: &RunConfig) -> Result<(UnitIdentity, ResourcePool)> {
        let (identity, remote) = self
            .identity(unit_index)
            .and_then(|id| self.index.get_key_value(id))
            .ok_or_else(|| {
                Error::Staging(format!(
                    "unit {} is not in the cloud index ({} units)",
                    unit_index,
                    self.index.len()
                ))
            })?;
        let span = info_span!("stage", unit = %identity);
        let _guard = span.enter();

        let unit_dir = config
            .working_directory
            .join(STAGED_DIR)
            .join(identity.subject_key())
            .join(identity.session_key())
            .join(identity.scan_key());
        let mut pool = ResourcePool::new();
        if let Some(site) = remote.site() {
            pool.set_site(site.clone());
        }
        for (name, value) in remote.iter() {
            let locator = match value {
                ResourceValue::Remote(locator) => locator,
                other => {
                    pool.add(name.clone(), other.clone());
                    continue;
                }
            };
            let dest = unit_dir.join(name).join(file_name(locator));
            if dest.is_file() {
                debug!(resource = %name, "already staged");
            } else {
                ensure_dir(dest.parent().unwrap_or(&unit_dir))?;
                self.store.download(locator, &dest).map_err(|e| {
                    Error::Staging(format!(
                        "failed to download {} for {}: {:#}",
                        locator, identity, e
                    ))
                })?;
                debug!(resource = %name, dest = %dest.display(), "staged");
            }
            pool.add(name.clone(), ResourceValue::Path(dest));
        }
        Ok((identity.clone(), pool))
    }

    /// Stages units `first..=last`; any failure aborts the whole range.
    pub fn fetch_range(&self, first: usize, last: usize, config: &RunConfig) -> Result<FlatManifest> {
        (first..=last)
            .map(|idx| self.fetch(idx, config))
            .collect()
    }

    pub fn fetch_bundle(&self, selector: UnitSelector, config: &RunConfig) -> Result<Bundle> {
        let range = selector_range(selector, config.units_per_bundle, self.unit_count())?;
        let index = match selector {
            UnitSelector::Bundle(k) => k,
            UnitSelector::Unit(i) => i,
        };
        info!(
            bundle = index,
            first = range.start(),
            last = range.end(),
            "staging bundle from cloud storage"
        );
        let units = self.fetch_range(*range.start(), *range.end(), config)?;
        Ok(Bundle::new(index, units.into_iter().collect()))
    }

    /// Mirrors `<output_directory>/<run_name>` under the configured
    /// destination. Returns the number of files uploaded.
    pub fn upload(&self, config: &RunConfig) -> Result<usize> {
        let destination = config
            .upload_destination
            .as_deref()
            .ok_or_else(|| Error::config("no upload_destination configured"))?;
        let root = config.output_directory.clone();
        let run_dir = config.run_output_dir();
        if !run_dir.is_dir() {
            return Ok(0);
        }
        let mut uploaded = 0;
        for entry in WalkDir::new(&run_dir).sort_by_file_name() {
            let entry = entry.map_err(|e| Error::Staging(format!("failed to walk outputs: {}", e)))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry.path().strip_prefix(&root).unwrap_or(entry.path());
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let locator = format!("{}/{}", destination.trim_end_matches('/'), key);
            self.store.upload(entry.path(), &locator).map_err(|e| {
                Error::Staging(format!("failed to upload {}: {:#}", entry.path().display(), e))
            })?;
            uploaded += 1;
        }
        info!(uploaded, destination, "uploaded run outputs");
        Ok(uploaded)
    }
}

fn file_name(locator: &str) -> String {
    let trimmed = locator.split(['?', '#']).next().unwrap_or(locator);
    trimmed
        .rsplit('/')
        .find(|s| !s.is_empty())
        .unwrap_or("data")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingStore {
        inner: LocatorStore,
        downloads: Arc<AtomicUsize>,
    }

    impl ObjectStore for CountingStore {
        fn download(&self, locator: &str, dest: &Path) -> anyhow::Result<()> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            self.inner.download(locator, dest)
        }

        fn upload(&self, src: &Path, locator: &str) -> anyhow::Result<()> {
            self.inner.upload(src, locator)
        }
    }

    fn remote_fixture(dir: &Path, subjects: &[&str]) -> PathBuf {
        let bucket = dir.join("bucket");
        let mut yaml = String::new();
        for sub in subjects {
            let anat = bucket.join(sub).join("anat.nii.gz");
            fs::create_dir_all(anat.parent().unwrap()).unwrap();
            fs::write(&anat, sub.as_bytes()).unwrap();
            yaml.push_str(&format!(
                "- subject: {}\n  session: ses_1\n  resources:\n    anatomical_scan: file://{}\n",
                sub,
                anat.display()
            ));
        }
        let index = dir.join("index.yml");
        fs::write(&index, yaml).unwrap();
        index
    }

    #[test]
    fn fetch_stages_into_the_working_directory_once() {
        let dir = tempfile::tempdir().unwrap();
        let index = remote_fixture(dir.path(), &["sub_02", "sub_01"]);
        let downloads = Arc::new(AtomicUsize::new(0));
        let stager = CloudStager::open(
            &index,
            Arc::new(CountingStore {
                inner: LocatorStore::new(),
                downloads: downloads.clone(),
            }),
        )
        .unwrap();
        let config = RunConfig::new("qc", dir.path().join("out"), dir.path().join("work"));

        let (id, pool) = stager.fetch(1, &config).unwrap();
        assert_eq!(id.subject(), "sub_01");
        let staged = pool.get("anatomical_scan").and_then(|v| v.as_path()).unwrap();
        assert_eq!(
            staged,
            dir.path()
                .join("work/staged/sub_01/ses_1/scan_0/anatomical_scan/anat.nii.gz")
        );
        assert_eq!(fs::read(staged).unwrap(), b"sub_01");

        stager.fetch(1, &config).unwrap();
        assert_eq!(downloads.load(Ordering::SeqCst), 1);
        assert!(matches!(stager.fetch(3, &config), Err(Error::Staging(_))));
    }

    #[test]
    fn unit_positions_follow_index_order() {
        let dir = tempfile::tempdir().unwrap();
        let subjects: Vec<String> = (1..=40).rev().map(|n| format!("s{:02}", n)).collect();
        let refs: Vec<&str> = subjects.iter().map(String::as_str).collect();
        let index = remote_fixture(dir.path(), &refs);
        let stager = CloudStager::open(&index, Arc::new(LocatorStore::new())).unwrap();
        let config = RunConfig::new("qc", dir.path().join("out"), dir.path().join("work"));

        assert_eq!(stager.identity(0), None);
        assert_eq!(stager.identity(1).map(|id| id.subject()), Some("s01"));
        assert_eq!(stager.identity(40).map(|id| id.subject()), Some("s40"));
        assert_eq!(stager.identity(41), None);
        let (id, pool) = stager.fetch(37, &config).unwrap();
        assert_eq!(id.subject(), "s37");
        let staged = pool.get("anatomical_scan").and_then(|v| v.as_path()).unwrap();
        assert_eq!(fs::read(staged).unwrap(), b"s37");
    }

    #[test]
    fn fetch_bundle_uses_the_shared_range_formula() {
        let dir = tempfile::tempdir().unwrap();
        let index = remote_fixture(dir.path(), &["s1", "s2", "s3", "s4", "s5"]);
        let stager = CloudStager::open(&index, Arc::new(LocatorStore::new())).unwrap();
        let mut config = RunConfig::new("qc", dir.path().join("out"), dir.path().join("work"));
        config.units_per_bundle = 2;

        let bundle = stager.fetch_bundle(UnitSelector::Bundle(3), &config).unwrap();
        assert_eq!(bundle.index(), 3);
        let subjects: Vec<String> = bundle
            .identities()
            .iter()
            .map(|id| id.subject().to_string())
            .collect();
        assert_eq!(subjects, vec!["s5"]);
        assert!(stager.fetch_bundle(UnitSelector::Bundle(4), &config).is_err());
    }

    #[test]
    fn a_missing_object_fails_the_whole_range() {
        let dir = tempfile::tempdir().unwrap();
        let index = remote_fixture(dir.path(), &["s1", "s2"]);
        fs::remove_file(dir.path().join("bucket/s2/anat.nii.gz")).unwrap();
        let stager = CloudStager::open(&index, Arc::new(LocatorStore::new())).unwrap();
        let config = RunConfig::new("qc", dir.path().join("out"), dir.path().join("work"));
        let err = stager.fetch_range(1, 2, &config).unwrap_err();
        assert!(matches!(err, Error::Staging(ref m) if m.contains("s2")), "{}", err);
    }

    #[test]
    fn upload_mirrors_the_run_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RunConfig::new("qc", dir.path().join("out"), dir.path().join("work"));
        let metrics = config.run_output_dir().join("sub_01/session_0/scan_0/anatomical_spatial_metrics");
        fs::create_dir_all(&metrics).unwrap();
        fs::write(metrics.join("m.json"), "{}").unwrap();
        let dest = dir.path().join("mirror");
        config.upload_results = true;
        config.upload_destination = Some(format!("file://{}", dest.display()));

        let stager = CloudStager::from_index(FlatManifest::new(), Arc::new(LocatorStore::new()));
        assert_eq!(stager.upload(&config).unwrap(), 1);
        assert!(dest
            .join("qc/sub_01/session_0/scan_0/anatomical_spatial_metrics/m.json")
            .is_file());
    }

    #[test]
    fn s3_locators_map_to_https() {
        match LocatorStore::locate("s3://fcp-indi/data/sub_01/anat.nii.gz").unwrap() {
            Location::Http(url) => assert_eq!(
                url,
                "https://fcp-indi.s3.amazonaws.com/data/sub_01/anat.nii.gz"
            ),
            Location::Local(_) => panic!("expected an HTTP location"),
        }
        assert!(LocatorStore::locate("s3://bucket-only").is_err());
        assert_eq!(file_name("https://host/a/b.nii.gz?sig=1"), "b.nii.gz");
    }
}
