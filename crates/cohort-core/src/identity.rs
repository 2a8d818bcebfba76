use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

pub const DEFAULT_SESSION: &str = "session_0";
pub const DEFAULT_SCAN: &str = "scan_0";

/// One subject/session/scan combination.
///
/// The raw components are kept as given in the manifest; comparison, hashing
/// and every derived name go through the normalized form, so `sub-01` and
/// `sub_01` denote the same unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitIdentity {
    subject: String,
    session: Option<String>,
    scan: Option<String>,
}

impl UnitIdentity {
    pub fn new(subject: impl Into<String>, session: Option<String>, scan: Option<String>) -> Self {
        Self {
            subject: subject.into(),
            session,
            scan,
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    pub fn scan(&self) -> Option<&str> {
        self.scan.as_deref()
    }

    pub fn subject_key(&self) -> String {
        normalize_component(&self.subject)
    }

    pub fn session_key(&self) -> String {
        normalized_or(self.session.as_deref(), DEFAULT_SESSION)
    }

    pub fn scan_key(&self) -> String {
        normalized_or(self.scan.as_deref(), DEFAULT_SCAN)
    }

    pub fn key(&self) -> (String, String, String) {
        (self.subject_key(), self.session_key(), self.scan_key())
    }

    /// Suffix used to keep graph node names unique per unit: `_sub_ses_scan`.
    pub fn label(&self) -> String {
        let (subject, session, scan) = self.key();
        format!("_{}_{}_{}", subject, session, scan)
    }

    /// Key under which compound result documents store this unit.
    pub fn document_key(&self) -> String {
        self.to_string()
    }

    pub fn output_dir(&self, output_root: &Path, run_name: &str) -> PathBuf {
        let (subject, session, scan) = self.key();
        output_root
            .join(run_name)
            .join(subject)
            .join(session)
            .join(scan)
    }
}

pub fn normalize_component(raw: &str) -> String {
    raw.replace(['-', '.'], "_")
}

fn normalized_or(raw: Option<&str>, default: &str) -> String {
    match raw {
        Some(value) if !value.is_empty() => normalize_component(value),
        _ => default.to_string(),
    }
}

impl PartialEq for UnitIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for UnitIdentity {}

impl Hash for UnitIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl PartialOrd for UnitIdentity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for UnitIdentity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl fmt::Display for UnitIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (subject, session, scan) = self.key();
        write!(f, "{}/{}/{}", subject, session, scan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_components_fall_back_to_placeholders() {
        let id = UnitIdentity::new("sub-01", None, Some(String::new()));
        assert_eq!(
            id.key(),
            (
                "sub_01".to_string(),
                DEFAULT_SESSION.to_string(),
                DEFAULT_SCAN.to_string()
            )
        );
        assert_eq!(id.label(), "_sub_01_session_0_scan_0");
    }

    #[test]
    fn identities_compare_after_normalization() {
        let a = UnitIdentity::new("sub-01", Some("ses.1".to_string()), None);
        let b = UnitIdentity::new("sub_01", Some("ses_1".to_string()), Some("scan_0".to_string()));
        assert_eq!(a, b);
        let c = UnitIdentity::new("sub_02", None, None);
        assert!(a < c);
    }

    #[test]
    fn output_dir_follows_run_layout() {
        let id = UnitIdentity::new("s-1", Some("pre".to_string()), Some("rest.1".to_string()));
        let dir = id.output_dir(Path::new("/out"), "qc_run");
        assert_eq!(dir, PathBuf::from("/out/qc_run/s_1/pre/rest_1"));
        assert_eq!(id.document_key(), "s_1/pre/rest_1");
    }
}
