use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::domain::{FetchAction, FetchResult};
use crate::error::FailureKind;

#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    pub destination: Utf8PathBuf,
    pub species: Option<String>,
    pub reference_db: Option<String>,
    pub error_kind: Option<FailureKind>,
    pub message: Option<String>,
}

/// Per-retriever counts reported at the end of a retrieval phase.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrievalSummary {
    pub retriever: String,
    pub attempted: usize,
    pub downloaded: usize,
    pub fresh: usize,
    pub failed: usize,
    pub requests: u64,
    pub failures: Vec<FailureRecord>,
}

impl RetrievalSummary {
    pub fn from_results(retriever: &str, results: &[FetchResult]) -> Self {
        let mut summary = Self {
            retriever: retriever.to_string(),
            attempted: results.len(),
            ..Self::default()
        };
        for result in results {
            summary.requests += u64::from(result.attempts);
            match result.action {
                FetchAction::Downloaded => summary.downloaded += 1,
                FetchAction::Fresh => summary.fresh += 1,
                FetchAction::Failed => {
                    summary.failed += 1;
                    summary.failures.push(FailureRecord {
                        destination: result.destination.clone(),
                        species: result.context.species.as_ref().map(|s| s.to_string()),
                        reference_db: result.context.reference_db.as_ref().map(|r| r.to_string()),
                        error_kind: result.error_kind,
                        message: result.message.clone(),
                    });
                }
            }
        }
        summary
    }

    pub fn succeeded(&self) -> usize {
        self.downloaded + self.fresh
    }

    pub fn log(&self) {
        info!(
            retriever = %self.retriever,
            attempted = self.attempted,
            succeeded = self.succeeded(),
            downloaded = self.downloaded,
            fresh = self.fresh,
            failed = self.failed,
            "retrieval finished"
        );
        for failure in &self.failures {
            warn!(
                retriever = %self.retriever,
                destination = %failure.destination,
                species = failure.species.as_deref().unwrap_or("-"),
                reference_db = failure.reference_db.as_deref().unwrap_or("-"),
                kind = ?failure.error_kind,
                "failed: {}",
                failure.message.as_deref().unwrap_or("unknown error")
            );
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum PhaseStatus {
    Completed,
    Skipped { reason: String },
    Failed { message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseReport {
    pub name: String,
    #[serde(flatten)]
    pub status: PhaseStatus,
    pub summary: Option<RetrievalSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub phases: Vec<PhaseReport>,
}

impl RunReport {
    pub fn failed_phases(&self) -> usize {
        self.phases
            .iter()
            .filter(|phase| matches!(phase.status, PhaseStatus::Failed { .. }))
            .count()
    }

    pub fn failed_tasks(&self) -> usize {
        self.phases
            .iter()
            .filter_map(|phase| phase.summary.as_ref())
            .map(|summary| summary.failed)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::domain::SpeciesContext;

    fn result(action: FetchAction, attempts: u32) -> FetchResult {
        FetchResult {
            retriever: "uniprot".to_string(),
            destination: Utf8PathBuf::from("out/uniprot_9606.tsv"),
            context: SpeciesContext {
                species: Some("9606".parse().unwrap()),
                reference_db: None,
            },
            action,
            attempts,
            total_wait: Duration::ZERO,
            bytes: 0,
            error_kind: matches!(action, FetchAction::Failed).then_some(FailureKind::QueryFailed),
            message: None,
        }
    }

    #[test]
    fn summary_counts_each_action() {
        let results = vec![
            result(FetchAction::Downloaded, 2),
            result(FetchAction::Fresh, 0),
            result(FetchAction::Failed, 5),
            result(FetchAction::Downloaded, 1),
        ];
        let summary = RetrievalSummary::from_results("uniprot", &results);
        assert_eq!(summary.attempted, 4);
        assert_eq!(summary.downloaded, 2);
        assert_eq!(summary.fresh, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.succeeded(), 3);
        assert_eq!(summary.requests, 8);
        assert_eq!(summary.failures[0].species.as_deref(), Some("9606"));
        assert_eq!(summary.failures[0].error_kind, Some(FailureKind::QueryFailed));
    }
}
