use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::error::{FailureKind, XrefError};

fn is_key_safe(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.'))
        && value != "."
        && value != ".."
}

/// Species key embedded in artifact filenames (for example `9606` or `hsa`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SpeciesId(String);

impl SpeciesId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SpeciesId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SpeciesId {
    type Err = XrefError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        if !is_key_safe(normalized) {
            return Err(XrefError::InvalidSpecies(value.to_string()));
        }
        Ok(Self(normalized.to_string()))
    }
}

impl TryFrom<String> for SpeciesId {
    type Error = XrefError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SpeciesId> for String {
    fn from(value: SpeciesId) -> Self {
        value.0
    }
}

/// Reference database key (for example `UniProt_KEGG` or a numeric db id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ReferenceDbId(String);

impl ReferenceDbId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReferenceDbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ReferenceDbId {
    type Err = XrefError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        if !is_key_safe(normalized) {
            return Err(XrefError::InvalidReferenceDb(value.to_string()));
        }
        Ok(Self(normalized.to_string()))
    }
}

impl TryFrom<String> for ReferenceDbId {
    type Error = XrefError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ReferenceDbId> for String {
    fn from(value: ReferenceDbId) -> Self {
        value.0
    }
}

/// The species and reference database a task maps identifiers for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeciesContext {
    pub species: Option<SpeciesId>,
    pub reference_db: Option<ReferenceDbId>,
}

impl fmt::Display for SpeciesContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let species = self.species.as_ref().map(SpeciesId::as_str).unwrap_or("-");
        let refdb = self
            .reference_db
            .as_ref()
            .map(ReferenceDbId::as_str)
            .unwrap_or("-");
        write!(f, "species={species} reference_db={refdb}")
    }
}

/// Per-species identifier set handed over by the upstream object cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingJob {
    #[serde(default)]
    pub species: Option<SpeciesId>,
    #[serde(default)]
    pub reference_db: Option<ReferenceDbId>,
    #[serde(default)]
    pub identifiers: Vec<String>,
}

/// One unit of work dispatched to a worker. Never mutated after dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievalTask {
    pub retriever: String,
    pub source_locator: String,
    pub destination: Utf8PathBuf,
    pub max_age: Duration,
    pub identifiers: Vec<String>,
    pub context: SpeciesContext,
    pub retry_budget: u32,
}

impl RetrievalTask {
    pub fn validate(&self) -> Result<(), XrefError> {
        if self.source_locator.trim().is_empty() {
            return Err(XrefError::Configuration(format!(
                "retriever {} has no source URL",
                self.retriever
            )));
        }
        if self.destination.as_str().trim().is_empty() {
            return Err(XrefError::Configuration(format!(
                "retriever {} has no destination",
                self.retriever
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchAction {
    /// Artifact was younger than `max_age`; no network I/O happened.
    Fresh,
    Downloaded,
    Failed,
}

/// Requests sent and time spent waiting, kept even when a fetch fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchUsage {
    pub attempts: u32,
    pub total_wait: Duration,
}

/// Outcome of one task, owned by the scheduler once a worker returns it.
#[derive(Debug, Clone, Serialize)]
pub struct FetchResult {
    pub retriever: String,
    pub destination: Utf8PathBuf,
    pub context: SpeciesContext,
    pub action: FetchAction,
    pub attempts: u32,
    #[serde(with = "duration_ms")]
    pub total_wait: Duration,
    pub bytes: u64,
    pub error_kind: Option<FailureKind>,
    pub message: Option<String>,
}

impl FetchResult {
    pub fn succeeded(&self) -> bool {
        !matches!(self.action, FetchAction::Failed)
    }

    pub fn with_usage(mut self, usage: FetchUsage) -> Self {
        self.attempts = usage.attempts;
        self.total_wait = usage.total_wait;
        self
    }

    pub fn failed(task: &RetrievalTask, error: &XrefError) -> Self {
        Self {
            retriever: task.retriever.clone(),
            destination: task.destination.clone(),
            context: task.context.clone(),
            action: FetchAction::Failed,
            attempts: 0,
            total_wait: Duration::ZERO,
            bytes: 0,
            error_kind: Some(error.kind()),
            message: Some(error.to_string()),
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_species_valid() {
        let species: SpeciesId = " 9606 ".parse().unwrap();
        assert_eq!(species.as_str(), "9606");
    }

    #[test]
    fn parse_species_rejects_path_separators() {
        let err = "../etc".parse::<SpeciesId>().unwrap_err();
        assert_matches!(err, XrefError::InvalidSpecies(_));
        let err = "".parse::<SpeciesId>().unwrap_err();
        assert_matches!(err, XrefError::InvalidSpecies(_));
    }

    #[test]
    fn parse_reference_db_invalid() {
        let err = "uni prot".parse::<ReferenceDbId>().unwrap_err();
        assert_matches!(err, XrefError::InvalidReferenceDb(_));
    }

    #[test]
    fn mapping_job_rejects_bad_species_in_json() {
        let raw = r#"{"species": "a/b", "identifiers": ["P1"]}"#;
        assert!(serde_json::from_str::<MappingJob>(raw).is_err());
    }

    #[test]
    fn task_without_locator_is_configuration_error() {
        let task = RetrievalTask {
            retriever: "kegg".to_string(),
            source_locator: " ".to_string(),
            destination: Utf8PathBuf::from("out/kegg_9606.txt"),
            max_age: Duration::ZERO,
            identifiers: Vec::new(),
            context: SpeciesContext::default(),
            retry_budget: 1,
        };
        assert_matches!(task.validate(), Err(XrefError::Configuration(_)));
    }
}
