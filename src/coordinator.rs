//! Strictly ordered, best-effort pipeline phases.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use tracing::{error, info, warn};

use crate::batch::{BatchJobBuilder, TaskTemplate};
use crate::cancel::CancellationToken;
use crate::error::XrefError;
use crate::report::{PhaseReport, PhaseStatus, RetrievalSummary, RunReport};
use crate::retriever::DataRetriever;
use crate::scheduler::BoundedConcurrencyScheduler;
use crate::source::IdentifierSource;
use crate::store::ArtifactStore;

#[derive(Debug, Clone, Default)]
pub struct PhaseOutcome {
    pub summary: Option<RetrievalSummary>,
}

pub trait Phase: Send + Sync {
    fn name(&self) -> &str;

    /// Files or non-empty directories that earlier phases must have produced.
    fn required_inputs(&self) -> &[Utf8PathBuf] {
        &[]
    }

    /// Abort the run when this phase fails.
    fn stop_on_failure(&self) -> bool {
        false
    }

    fn run(&self, cancel: &CancellationToken) -> Result<PhaseOutcome, XrefError>;
}

type PhaseFn = dyn Fn(&CancellationToken) -> Result<(), XrefError> + Send + Sync;

/// A step owned by an external collaborator (reference db setup, parsing).
pub struct FnPhase {
    name: String,
    requires: Vec<Utf8PathBuf>,
    stop_on_failure: bool,
    step: Box<PhaseFn>,
}

impl FnPhase {
    pub fn new<F>(name: &str, step: F) -> Self
    where
        F: Fn(&CancellationToken) -> Result<(), XrefError> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            requires: Vec::new(),
            stop_on_failure: false,
            step: Box::new(step),
        }
    }

    pub fn requiring(mut self, inputs: Vec<Utf8PathBuf>) -> Self {
        self.requires = inputs;
        self
    }

    pub fn stopping_on_failure(mut self) -> Self {
        self.stop_on_failure = true;
        self
    }
}

impl Phase for FnPhase {
    fn name(&self) -> &str {
        &self.name
    }

    fn required_inputs(&self) -> &[Utf8PathBuf] {
        &self.requires
    }

    fn stop_on_failure(&self) -> bool {
        self.stop_on_failure
    }

    fn run(&self, cancel: &CancellationToken) -> Result<PhaseOutcome, XrefError> {
        (self.step)(cancel)?;
        Ok(PhaseOutcome::default())
    }
}

/// Builds tasks for one retriever and pushes them through the scheduler.
pub struct RetrievalPhase {
    pub template: TaskTemplate,
    pub source: Arc<dyn IdentifierSource>,
    pub retriever: Arc<dyn DataRetriever>,
    pub scheduler: BoundedConcurrencyScheduler,
    pub pool_size: usize,
    pub requires: Vec<Utf8PathBuf>,
    pub stop_on_failure: bool,
}

impl Phase for RetrievalPhase {
    fn name(&self) -> &str {
        &self.template.retriever
    }

    fn required_inputs(&self) -> &[Utf8PathBuf] {
        &self.requires
    }

    fn stop_on_failure(&self) -> bool {
        self.stop_on_failure
    }

    fn run(&self, _cancel: &CancellationToken) -> Result<PhaseOutcome, XrefError> {
        let jobs = self.source.jobs(&self.template.retriever)?;
        let tasks = BatchJobBuilder::build(&self.template, &jobs)?;
        info!(
            retriever = %self.template.retriever,
            jobs = jobs.len(),
            tasks = tasks.len(),
            pool_size = self.scheduler.effective_parallelism(self.pool_size),
            "starting retrieval"
        );
        let results =
            self.scheduler
                .run_all(Arc::clone(&self.retriever), tasks, self.pool_size)?;
        let summary = RetrievalSummary::from_results(&self.template.retriever, &results);
        summary.log();
        Ok(PhaseOutcome {
            summary: Some(summary),
        })
    }
}

pub struct RunCoordinator {
    cancel: CancellationToken,
}

impl RunCoordinator {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// Runs phases in order. Only a failing `stop_on_failure` phase, or
    /// cancellation, ends the run early.
    pub fn run(&self, phases: &[Box<dyn Phase>]) -> Result<RunReport, XrefError> {
        let started_at = Utc::now();
        let mut reports = Vec::with_capacity(phases.len());

        for phase in phases {
            let name = phase.name().to_string();
            if self.cancel.is_cancelled() {
                reports.push(PhaseReport {
                    name,
                    status: PhaseStatus::Skipped {
                        reason: "run cancelled".to_string(),
                    },
                    summary: None,
                });
                continue;
            }

            let missing = phase
                .required_inputs()
                .iter()
                .filter(|path| !input_present(path))
                .map(|path| path.to_string())
                .collect::<Vec<_>>();
            if !missing.is_empty() {
                warn!(phase = %name, missing = ?missing, "required inputs missing, skipping phase");
                reports.push(PhaseReport {
                    name,
                    status: PhaseStatus::Skipped {
                        reason: format!("missing inputs: {}", missing.join(", ")),
                    },
                    summary: None,
                });
                continue;
            }

            info!(phase = %name, "phase started");
            match phase.run(&self.cancel) {
                Ok(outcome) => {
                    info!(phase = %name, "phase completed");
                    reports.push(PhaseReport {
                        name,
                        status: PhaseStatus::Completed,
                        summary: outcome.summary,
                    });
                }
                Err(err) => {
                    error!(phase = %name, kind = %err.kind(), "phase failed: {err}");
                    let message = err.to_string();
                    reports.push(PhaseReport {
                        name: name.clone(),
                        status: PhaseStatus::Failed {
                            message: message.clone(),
                        },
                        summary: None,
                    });
                    if phase.stop_on_failure() {
                        return Err(XrefError::PhaseFailed {
                            phase: name,
                            message,
                        });
                    }
                }
            }
        }

        let report = RunReport {
            started_at,
            finished_at: Utc::now(),
            phases: reports,
        };
        info!(
            phases = report.phases.len(),
            failed_phases = report.failed_phases(),
            failed_tasks = report.failed_tasks(),
            "run finished"
        );
        Ok(report)
    }
}

fn input_present(path: &Utf8Path) -> bool {
    if ArtifactStore::artifact_exists(path) {
        return true;
    }
    path.as_std_path()
        .read_dir()
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}
