//! Participant manifests and cloud index files.
//!
//! Both flatten into a [`FlatManifest`]: one [`ResourcePool`] per
//! [`UnitIdentity`], iterated in identity order. Every positional lookup
//! (bundle slices, cloud staging, cluster array tasks) relies on that order.

use crate::error::{Error, Result};
use crate::identity::UnitIdentity;
use crate::resource::{ResourcePool, ResourceValue, Site};
use serde::Deserialize;
use serde_yaml::Value as YamlValue;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub type FlatManifest = BTreeMap<UnitIdentity, ResourcePool>;

/// Session-level key carrying the subject's acquisition site.
pub const SITE_KEY: &str = "site_name";

pub fn load_manifest(path: &Path) -> Result<FlatManifest> {
    let raw = fs::read_to_string(path)
        .map_err(|e| Error::io("failed to read participant manifest", path, e))?;
    let doc: YamlValue = serde_yaml::from_str(&raw).map_err(|e| Error::parse(path, e))?;
    flatten_manifest(&doc, path.parent())
}

/// Collapses `subject -> session -> resources` into one entry per
/// subject/session/scan combination.
///
/// A resource mapped directly to a path belongs to the session-level unit
/// (no scan); a resource mapped to `{scan: path}` fans out to one unit per
/// scan. Relative paths are resolved against `base_dir`.
pub fn flatten_manifest(doc: &YamlValue, base_dir: Option<&Path>) -> Result<FlatManifest> {
    let subjects = match doc {
        YamlValue::Mapping(m) if !m.is_empty() => m,
        YamlValue::Null => return Err(Error::config("the participant manifest is empty")),
        YamlValue::Mapping(_) => return Err(Error::config("the participant manifest is empty")),
        _ => {
            return Err(Error::config(
                "the participant manifest must map subject ids to sessions",
            ))
        }
    };

    let mut flat = FlatManifest::new();
    let mut sites: BTreeMap<String, Site> = BTreeMap::new();

    for (subject_key, sessions) in subjects {
        let subject = scalar_to_string(subject_key)
            .ok_or_else(|| Error::config("subject ids must be scalar values"))?;
        let sessions = sessions.as_mapping().ok_or_else(|| {
            Error::config(format!(
                "subject {} must map session ids to resources",
                subject
            ))
        })?;

        for (session_key, resources) in sessions {
            let session = scalar_to_string(session_key).ok_or_else(|| {
                Error::config(format!("subject {} has a non-scalar session id", subject))
            })?;
            let resources = resources.as_mapping().ok_or_else(|| {
                Error::config(format!(
                    "session {} of subject {} must map resource names to paths",
                    session, subject
                ))
            })?;

            for (resource_key, value) in resources {
                let resource = scalar_to_string(resource_key).ok_or_else(|| {
                    Error::config(format!(
                        "subject {} session {} has a non-scalar resource name",
                        subject, session
                    ))
                })?;

                if resource == SITE_KEY {
                    let site = match scalar_to_string(value) {
                        Some(name) => Site::Named(name),
                        None if value.is_null() => Site::Unspecified,
                        None => {
                            return Err(Error::config(format!(
                                "{} of subject {} must be a string",
                                SITE_KEY, subject
                            )))
                        }
                    };
                    sites.insert(subject.clone(), site);
                    continue;
                }

                match value {
                    YamlValue::Mapping(scans) => {
                        for (scan_key, path) in scans {
                            let scan = scalar_to_string(scan_key).ok_or_else(|| {
                                Error::config(format!(
                                    "{} of subject {} has a non-scalar scan id",
                                    resource, subject
                                ))
                            })?;
                            let path = path_value(path, base_dir).ok_or_else(|| {
                                malformed_path(&subject, &session, &resource)
                            })?;
                            let id = UnitIdentity::new(
                                subject.clone(),
                                Some(session.clone()),
                                Some(scan),
                            );
                            flat.entry(id)
                                .or_default()
                                .add(resource.clone(), ResourceValue::Path(path));
                        }
                    }
                    other => {
                        let path = path_value(other, base_dir)
                            .ok_or_else(|| malformed_path(&subject, &session, &resource))?;
                        let id = UnitIdentity::new(subject.clone(), Some(session.clone()), None);
                        flat.entry(id)
                            .or_default()
                            .add(resource.clone(), ResourceValue::Path(path));
                    }
                }
            }
        }
    }

    if flat.is_empty() {
        return Err(Error::config(
            "the participant manifest does not declare any resources",
        ));
    }

    // Keep records uniform when only some subjects name a site.
    if !sites.is_empty() {
        for (id, pool) in flat.iter_mut() {
            let site = sites
                .get(id.subject())
                .cloned()
                .unwrap_or(Site::Unspecified);
            pool.set_site(site);
        }
    }

    Ok(flat)
}

#[derive(Debug, Deserialize)]
struct CloudIndexEntry {
    subject: String,
    #[serde(default)]
    session: Option<String>,
    #[serde(default)]
    scan: Option<String>,
    #[serde(default)]
    site: Option<String>,
    resources: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CloudIndexDoc {
    Entries(Vec<CloudIndexEntry>),
    Keyed(BTreeMap<String, BTreeMap<String, String>>),
}

/// Loads a cloud index: either a list of entries or a mapping keyed by
/// `subject/session/scan`, each naming the remote locator of every resource.
pub fn load_cloud_index(path: &Path) -> Result<FlatManifest> {
    let raw = fs::read_to_string(path)
        .map_err(|e| Error::io("failed to read cloud index", path, e))?;
    let doc: CloudIndexDoc = serde_yaml::from_str(&raw).map_err(|e| Error::parse(path, e))?;
    let mut flat = FlatManifest::new();
    match doc {
        CloudIndexDoc::Entries(entries) => {
            for entry in entries {
                let id = UnitIdentity::new(entry.subject, entry.session, entry.scan);
                let pool = flat.entry(id).or_default();
                for (name, locator) in entry.resources {
                    pool.add(name, ResourceValue::Remote(locator));
                }
                if let Some(site) = entry.site {
                    pool.set_site(Site::Named(site));
                }
            }
        }
        CloudIndexDoc::Keyed(map) => {
            for (key, resources) in map {
                let id = parse_unit_key(&key)
                    .ok_or_else(|| Error::parse(path, format!("invalid unit key '{}'", key)))?;
                let pool = flat.entry(id).or_default();
                for (name, locator) in resources {
                    pool.add(name, ResourceValue::Remote(locator));
                }
            }
        }
    }
    if flat.is_empty() {
        return Err(Error::config(format!(
            "the cloud index {} is empty",
            path.display()
        )));
    }
    for pool in flat.values_mut().filter(|pool| pool.site().is_none()) {
        let derived = pool.iter().find_map(|(_, value)| match value {
            ResourceValue::Remote(locator) if locator.contains(".nii") => site_from_locator(locator),
            _ => None,
        });
        if let Some(site) = derived {
            pool.set_site(Site::Named(site));
        }
    }
    Ok(flat)
}

/// Remote data is laid out as `.../<site>/<subject>/<session>/<scan>/<file>`,
/// so the site is the fifth path component from the end.
fn site_from_locator(locator: &str) -> Option<String> {
    let path = locator.split(['?', '#']).next().unwrap_or(locator);
    let path = path.split_once("://").map_or(path, |(_, rest)| rest);
    path.split('/')
        .rev()
        .nth(4)
        .filter(|site| !site.is_empty())
        .map(str::to_string)
}

fn parse_unit_key(key: &str) -> Option<UnitIdentity> {
    let mut parts = key.split('/');
    let subject = parts.next().filter(|s| !s.is_empty())?;
    let session = parts.next().map(str::to_string);
    let scan = parts.next().map(str::to_string);
    if parts.next().is_some() {
        return None;
    }
    Some(UnitIdentity::new(subject, session, scan))
}

fn scalar_to_string(value: &YamlValue) -> Option<String> {
    match value {
        YamlValue::String(s) => Some(s.clone()),
        YamlValue::Number(n) => Some(n.to_string()),
        YamlValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn path_value(value: &YamlValue, base_dir: Option<&Path>) -> Option<PathBuf> {
    let raw = match value {
        YamlValue::String(s) if !s.is_empty() => s,
        _ => return None,
    };
    let path = PathBuf::from(raw);
    match base_dir {
        Some(base) if path.is_relative() => Some(base.join(path)),
        _ => Some(path),
    }
}

fn malformed_path(subject: &str, session: &str, resource: &str) -> Error {
    Error::config(format!(
        "{} of subject {} session {} must be a path or a scan-to-path mapping",
        resource, subject, session
    ))
}
