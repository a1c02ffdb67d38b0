//! Request target validation.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use liverelay_relay::TEMP_SUFFIX;
use regex::Regex;

static TARGET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/([0-9a-zA-Z]{1,32})/([_0-9a-zA-Z]{1,32}[^/]*)$").unwrap()
});

/// Why a request target was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TargetError {
    #[error("target must be absolute")]
    NotAbsolute,

    #[error("target must not contain '..'")]
    ParentReference,

    #[error("target must be /{{dir}}/{{name}}")]
    Malformed,

    #[error("target names a temporary file")]
    TempName,
}

/// A validated `/{dir}/{name}` target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTarget {
    dir: String,
    name: String,
}

impl FileTarget {
    /// Parses a raw request target. Any query string is ignored.
    pub fn parse(target: &str) -> Result<Self, TargetError> {
        if !target.starts_with('/') {
            return Err(TargetError::NotAbsolute);
        }
        if target.contains("..") {
            return Err(TargetError::ParentReference);
        }

        let path = target.split_once('?').map_or(target, |(path, _)| path);
        let caps = TARGET_RE.captures(path).ok_or(TargetError::Malformed)?;
        let name = &caps[2];
        if name.ends_with(TEMP_SUFFIX) {
            return Err(TargetError::TempName);
        }

        Ok(Self {
            dir: caps[1].to_string(),
            name: name.to_string(),
        })
    }

    pub fn dir(&self) -> &str {
        &self.dir
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory holding the file under `root`.
    pub fn file_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.dir)
    }

    /// Final location of the file under `root`.
    pub fn file_path(&self, root: &Path) -> PathBuf {
        root.join(&self.dir).join(&self.name)
    }
}
