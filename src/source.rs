//! Where per-species identifier sets come from.
//!
//! The object cache that computes identifiers is outside this crate; it
//! hands them over either inline in the run file or as a JSON file of
//! [`MappingJob`]s written by an earlier phase.

use std::collections::BTreeMap;
use std::fs;

use camino::Utf8PathBuf;

use crate::domain::MappingJob;
use crate::error::XrefError;

pub trait IdentifierSource: Send + Sync {
    fn jobs(&self, retriever: &str) -> Result<Vec<MappingJob>, XrefError>;
}

/// Jobs known up front. A retriever with no entry gets one context-free job.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentifierSource {
    jobs: BTreeMap<String, Vec<MappingJob>>,
}

impl StaticIdentifierSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, retriever: &str, jobs: Vec<MappingJob>) {
        self.jobs.insert(retriever.to_string(), jobs);
    }
}

pub fn unscoped_job() -> MappingJob {
    MappingJob {
        species: None,
        reference_db: None,
        identifiers: Vec::new(),
    }
}

impl IdentifierSource for StaticIdentifierSource {
    fn jobs(&self, retriever: &str) -> Result<Vec<MappingJob>, XrefError> {
        match self.jobs.get(retriever) {
            Some(jobs) if !jobs.is_empty() => Ok(jobs.clone()),
            _ => Ok(vec![unscoped_job()]),
        }
    }
}

/// Reads a JSON array of jobs when the phase runs, not when it is built.
#[derive(Debug, Clone)]
pub struct JsonFileIdentifierSource {
    path: Utf8PathBuf,
}

impl JsonFileIdentifierSource {
    pub fn new(path: Utf8PathBuf) -> Self {
        Self { path }
    }
}

impl IdentifierSource for JsonFileIdentifierSource {
    fn jobs(&self, _retriever: &str) -> Result<Vec<MappingJob>, XrefError> {
        let content = fs::read_to_string(self.path.as_std_path())
            .map_err(|err| XrefError::Filesystem(format!("read {}: {err}", self.path)))?;
        serde_json::from_str(&content)
            .map_err(|err| XrefError::Configuration(format!("jobs file {}: {err}", self.path)))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn static_source_defaults_to_unscoped_job() {
        let source = StaticIdentifierSource::new();
        let jobs = source.jobs("zinc").unwrap();
        assert_eq!(jobs, vec![unscoped_job()]);
    }

    #[test]
    fn json_file_source_reads_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("jobs.json")).unwrap();
        fs::write(
            path.as_std_path(),
            r#"[{"species": "hsa", "reference_db": "KEGG", "identifiers": ["P1", "P2"]}]"#,
        )
        .unwrap();

        let jobs = JsonFileIdentifierSource::new(path).jobs("kegg").unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].identifiers, vec!["P1".to_string(), "P2".to_string()]);
    }

    #[test]
    fn malformed_jobs_file_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("jobs.json")).unwrap();
        fs::write(path.as_std_path(), "{not json").unwrap();
        let err = JsonFileIdentifierSource::new(path).jobs("kegg").unwrap_err();
        assert_matches!(err, XrefError::Configuration(_));
    }
}
