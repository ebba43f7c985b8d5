//! Turns a resolved run file into an ordered list of phases.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::batch::BatchJobBuilder;
use crate::cancel::{CancellationToken, Sleeper};
use crate::client::RateLimitAwareClient;
use crate::config::{JobsSpec, ResolvedConfig, RetrieverSettings};
use crate::coordinator::{Phase, RetrievalPhase, RunCoordinator};
use crate::error::XrefError;
use crate::executor::RetryableHttpExecutor;
use crate::rate_limit::RateLimitState;
use crate::report::RunReport;
use crate::retriever::Retriever;
use crate::scheduler::BoundedConcurrencyScheduler;
use crate::source::{IdentifierSource, JsonFileIdentifierSource, StaticIdentifierSource};
use crate::transport::{DefaultTransport, Transport};

#[derive(Debug, Clone, Serialize)]
pub struct PlannedTask {
    pub source_locator: String,
    pub destination: String,
    pub species: Option<String>,
    pub reference_db: Option<String>,
    pub identifiers: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedRetriever {
    pub retriever: String,
    pub service: String,
    pub strategy: String,
    pub parallelism: usize,
    pub requires: Vec<String>,
    pub tasks: Vec<PlannedTask>,
    /// Why no tasks could be listed, typically a jobs file an earlier phase writes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unresolved: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunPlan {
    pub worker_budget: usize,
    pub inter_wave_cooldown_secs: u64,
    pub retrievers: Vec<PlannedRetriever>,
}

pub struct App {
    config: ResolvedConfig,
    transport: Arc<dyn Transport>,
    cancel: CancellationToken,
    sleeper: Arc<dyn Sleeper>,
}

impl App {
    pub fn new(config: ResolvedConfig, cancel: CancellationToken) -> Self {
        let transport = Arc::new(DefaultTransport::new(config.request_timeout));
        Self::with_transport(config, transport, cancel)
    }

    pub fn with_transport(
        config: ResolvedConfig,
        transport: Arc<dyn Transport>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            transport,
            sleeper: Arc::new(cancel.clone()),
            cancel,
        }
    }

    /// Replaces every wait (cooldowns, rate limits, retry delays).
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    fn scheduler(&self) -> BoundedConcurrencyScheduler {
        BoundedConcurrencyScheduler::new(self.cancel.clone())
            .with_worker_budget(self.config.worker_budget)
            .with_cooldown(self.config.inter_wave_cooldown)
            .with_sleeper(Arc::clone(&self.sleeper))
    }

    /// Builds one retrieval phase per configured retriever, in file order.
    /// Retrievers that share a service share its quota state for the run.
    pub fn phases(&self) -> Result<Vec<Box<dyn Phase>>, XrefError> {
        let executor = RetryableHttpExecutor::new(Arc::clone(&self.transport), self.cancel.clone());
        let client = RateLimitAwareClient::new(executor, Arc::clone(&self.sleeper));
        let mut states: BTreeMap<String, Arc<RateLimitState>> = BTreeMap::new();

        let mut phases: Vec<Box<dyn Phase>> = Vec::with_capacity(self.config.retrievers.len());
        for settings in &self.config.retrievers {
            let state = states
                .entry(settings.service.name.clone())
                .or_insert_with(|| Arc::new(RateLimitState::for_profile(&settings.service)));
            let retriever = Retriever::new(
                settings.name(),
                settings.strategy.build()?,
                client.clone(),
                settings.service.clone(),
                Arc::clone(state),
            );
            phases.push(Box::new(RetrievalPhase {
                template: settings.template.clone(),
                source: identifier_source(settings),
                retriever: Arc::new(retriever),
                scheduler: self.scheduler(),
                pool_size: settings.pool_size,
                requires: settings.requires.clone(),
                stop_on_failure: settings.stop_on_failure,
            }));
        }
        Ok(phases)
    }

    pub fn run(&self) -> Result<RunReport, XrefError> {
        self.run_with(Vec::new(), Vec::new())
    }

    /// Runs the configured retrievers between caller-owned phases, such as
    /// reference database setup before and parsing after.
    pub fn run_with(
        &self,
        before: Vec<Box<dyn Phase>>,
        after: Vec<Box<dyn Phase>>,
    ) -> Result<RunReport, XrefError> {
        let mut phases = before;
        phases.extend(self.phases()?);
        phases.extend(after);
        info!(phases = phases.len(), "run starting");
        RunCoordinator::new(self.cancel.clone()).run(&phases)
    }

    /// Describes the tasks a run would schedule without touching the network.
    pub fn plan(&self) -> Result<RunPlan, XrefError> {
        let scheduler = self.scheduler();
        let mut retrievers = Vec::with_capacity(self.config.retrievers.len());
        for settings in &self.config.retrievers {
            let strategy = settings.strategy.build()?;
            let mut planned = PlannedRetriever {
                retriever: settings.name().to_string(),
                service: settings.service.name.clone(),
                strategy: strategy.name().to_string(),
                parallelism: scheduler.effective_parallelism(settings.pool_size),
                requires: settings.requires.iter().map(|p| p.to_string()).collect(),
                tasks: Vec::new(),
                unresolved: None,
            };
            match identifier_source(settings).jobs(settings.name()) {
                Ok(jobs) => {
                    planned.tasks = BatchJobBuilder::build(&settings.template, &jobs)?
                        .into_iter()
                        .map(|task| PlannedTask {
                            source_locator: task.source_locator,
                            destination: task.destination.to_string(),
                            species: task.context.species.map(|s| s.to_string()),
                            reference_db: task.context.reference_db.map(|r| r.to_string()),
                            identifiers: task.identifiers.len(),
                        })
                        .collect();
                }
                Err(err) => planned.unresolved = Some(err.to_string()),
            }
            retrievers.push(planned);
        }
        Ok(RunPlan {
            worker_budget: self.config.worker_budget,
            inter_wave_cooldown_secs: self.config.inter_wave_cooldown.as_secs(),
            retrievers,
        })
    }
}

fn identifier_source(settings: &RetrieverSettings) -> Arc<dyn IdentifierSource> {
    match &settings.jobs {
        JobsSpec::Inline(jobs) => {
            let mut source = StaticIdentifierSource::new();
            source.insert(settings.name(), jobs.clone());
            Arc::new(source)
        }
        JobsSpec::File(path) => Arc::new(JsonFileIdentifierSource::new(path.clone())),
    }
}
