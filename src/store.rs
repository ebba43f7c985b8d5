use std::fs;
use std::io::Write;

use camino::Utf8Path;
use tempfile::Builder;

use crate::error::XrefError;

/// Writes artifacts so a destination is either complete or absent.
pub struct ArtifactStore;

impl ArtifactStore {
    pub fn write_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), XrefError> {
        let parent = match path.parent() {
            Some(parent) if !parent.as_str().is_empty() => parent,
            _ => Utf8Path::new("."),
        };
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| XrefError::Filesystem(format!("create {parent}: {err}")))?;
        let mut temp = Builder::new()
            .prefix(".xref-fetch")
            .suffix(".part")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| XrefError::Filesystem(err.to_string()))?;
        temp.write_all(content)
            .map_err(|err| XrefError::Filesystem(format!("write {path}: {err}")))?;
        temp.as_file()
            .sync_all()
            .map_err(|err| XrefError::Filesystem(format!("sync {path}: {err}")))?;
        temp.persist(path.as_std_path())
            .map_err(|err| XrefError::Filesystem(format!("persist {path}: {}", err.error)))?;
        Ok(())
    }

    pub fn artifact_exists(path: &Utf8Path) -> bool {
        path.as_std_path().is_file()
    }
}
