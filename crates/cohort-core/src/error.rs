use std::path::{Path, PathBuf};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Empty or malformed manifest, invalid scheduler, contradictory run inputs.
    #[error("configuration error: {0}")]
    Config(String),

    /// Declared inputs that are not usable on local storage. Fatal for the
    /// whole bundle.
    #[error("the paths provided for {unit} are not valid:\n{}", format_invalid(.paths))]
    InvalidResources {
        unit: String,
        paths: Vec<(String, String)>,
    },

    #[error("remote staging failed: {0}")]
    Staging(String),

    #[error("error submitting run to {platform} queue: {message}")]
    Submission { platform: String, message: String },

    #[error("failed to build {category} for {unit}: {source:#}")]
    Build {
        category: String,
        unit: String,
        #[source]
        source: anyhow::Error,
    },

    /// A bundle worker process ended without reporting a result.
    #[error("bundle {bundle} worker exited without a result: {message}")]
    Worker { bundle: usize, message: String },

    #[error("{context} ({}): {source}", .path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }

    pub fn io(context: &'static str, path: &Path, source: std::io::Error) -> Self {
        Error::Io {
            context,
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn parse(path: &Path, message: impl ToString) -> Self {
        Error::Parse {
            path: path.to_path_buf(),
            message: message.to_string(),
        }
    }
}

fn format_invalid(paths: &[(String, String)]) -> String {
    paths
        .iter()
        .map(|(resource, path)| format!("  {}: {}", resource, path))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_resources_lists_every_path() {
        let err = Error::InvalidResources {
            unit: "sub_01/session_0/scan_0".to_string(),
            paths: vec![
                ("anatomical_scan".to_string(), "/missing/a.nii".to_string()),
                ("functional_scan".to_string(), "/missing/f.nii".to_string()),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("sub_01/session_0/scan_0"), "{}", msg);
        assert!(msg.contains("anatomical_scan: /missing/a.nii"), "{}", msg);
        assert!(msg.contains("functional_scan: /missing/f.nii"), "{}", msg);
    }
}
