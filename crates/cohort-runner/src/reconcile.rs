use crate::builders::OutputCategory;
use cohort_core::{Error, ResourcePool, ResourceValue, Result, UnitIdentity};
use serde_json::Value;
use std::fs;
use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;

/// Merges outputs already present in `output_dir` into `pool`.
///
/// A `<resource>/` directory contributes its first file (by name). A compound
/// `*.json` document contributes, for this unit's entry, only the category
/// fields the pool is still missing. Anything else is a stray file and is
/// ignored. Returns the number of entries added.
pub fn reconcile_outputs(
    output_dir: &Path,
    identity: &UnitIdentity,
    pool: &mut ResourcePool,
) -> Result<usize> {
    if !output_dir.is_dir() {
        return Ok(0);
    }
    let mut added = 0;
    for entry in WalkDir::new(output_dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(output_dir).to_path_buf();
            Error::io(
                "failed to scan output directory",
                &path,
                e.into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("filesystem loop")),
            )
        })?;
        let name = entry.file_name().to_string_lossy().to_string();
        if pool.contains(&name) {
            continue;
        }
        let path = entry.path();
        if entry.file_type().is_dir() {
            if let Some(first) = first_file(path) {
                debug!(unit = %identity, resource = %name, "found existing output");
                pool.add(name, ResourceValue::Path(first));
                added += 1;
            }
        } else if path.extension().and_then(|e| e.to_str()) == Some("json") {
            added += merge_document(path, identity, pool);
        } else {
            debug!(unit = %identity, file = %path.display(), "ignoring stray file in output directory");
        }
    }
    Ok(added)
}

fn first_file(dir: &Path) -> Option<std::path::PathBuf> {
    WalkDir::new(dir)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .find(|e| e.file_type().is_file())
        .map(|e| e.into_path())
}

fn merge_document(path: &Path, identity: &UnitIdentity, pool: &mut ResourcePool) -> usize {
    let doc: Value = match fs::read(path)
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
    {
        Some(doc) => doc,
        None => {
            debug!(file = %path.display(), "ignoring unreadable result document");
            return 0;
        }
    };
    let Some(fields) = doc.get(identity.document_key()).and_then(Value::as_object) else {
        return 0;
    };
    let mut added = 0;
    for category in OutputCategory::ALL {
        let key = category.resource_key();
        if pool.contains(key) {
            continue;
        }
        if let Some(value) = fields.get(category.document_field()) {
            pool.add(key, ResourceValue::Data(value.clone()));
            added += 1;
        }
    }
    added
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn existing_output_directories_are_merged() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = dir.path().join("anatomical_spatial_metrics");
        fs::create_dir_all(&metrics).unwrap();
        fs::write(metrics.join("b.json"), "{}").unwrap();
        fs::write(metrics.join("a.json"), "{}").unwrap();
        fs::create_dir_all(dir.path().join("empty_output")).unwrap();
        fs::write(dir.path().join("notes.txt"), "stray").unwrap();

        let id = UnitIdentity::new("sub_01", None, None);
        let mut pool = ResourcePool::new();
        let added = reconcile_outputs(dir.path(), &id, &mut pool).unwrap();
        assert_eq!(added, 1);
        assert_eq!(
            pool.get("anatomical_spatial_metrics")
                .and_then(|v| v.as_path()),
            Some(metrics.join("a.json").as_path())
        );
        assert!(!pool.contains("empty_output"));
        assert!(!pool.contains("notes.txt"));
    }

    #[test]
    fn compound_documents_fill_only_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        let id = UnitIdentity::new("sub-01", Some("ses_1".to_string()), Some("rest_1".to_string()));
        let doc = json!({
            "sub_01/ses_1/rest_1": {
                "functional_spatial": {"fber": 1.5},
                "functional_temporal": {"dvars": 0.9},
                "functional_header_info": {"tr": 2.0}
            },
            "sub_02/ses_1/rest_1": {"anatomical_spatial": {"snr": 3.0}}
        });
        fs::write(dir.path().join("results.json"), doc.to_string()).unwrap();
        fs::write(dir.path().join("broken.json"), "{not json").unwrap();

        let mut pool = ResourcePool::new();
        let existing = ResourceValue::Path("/already/there.json".into());
        pool.add("functional_spatial_metrics", existing.clone());
        let added = reconcile_outputs(dir.path(), &id, &mut pool).unwrap();
        assert_eq!(added, 2);
        assert_eq!(pool.get("functional_spatial_metrics"), Some(&existing));
        assert_eq!(
            pool.get("functional_temporal_metrics"),
            Some(&ResourceValue::Data(json!({"dvars": 0.9})))
        );
        assert!(pool.contains("functional_header_info"));
        assert!(!pool.contains("anatomical_spatial_metrics"));
    }

    #[test]
    fn missing_output_directory_adds_nothing() {
        let id = UnitIdentity::new("sub_01", None, None);
        let mut pool = ResourcePool::new();
        let added = reconcile_outputs(Path::new("/definitely/not/here"), &id, &mut pool).unwrap();
        assert_eq!(added, 0);
    }
}
