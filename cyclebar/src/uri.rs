use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{BarrierError, Result};

const FILE_SCHEME: &str = "file://";

/// External name of a barrier.
///
/// A URI is a filesystem path naming the shared-memory backing file, with an
/// optional `file://` prefix. Every participant that resolves the same path
/// meets at the same barrier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BarrierUri {
    raw: String,
    path: PathBuf,
}

impl BarrierUri {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let path = trimmed.strip_prefix(FILE_SCHEME).unwrap_or(trimmed);
        if path.is_empty() || path.ends_with('/') || path.contains('\0') {
            return Err(BarrierError::InvalidUri(raw.to_string()));
        }
        Ok(Self {
            raw: trimmed.to_string(),
            path: PathBuf::from(path),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Private file a leader fills in before publishing it under `path`.
    pub(crate) fn staging_path(&self, pid: u32) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(format!(".{}.staging", pid));
        self.path.with_file_name(name)
    }
}

impl fmt::Display for BarrierUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
