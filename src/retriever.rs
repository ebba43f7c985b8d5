use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::client::RateLimitAwareClient;
use crate::domain::{FetchAction, FetchResult, FetchUsage, RetrievalTask};
use crate::error::XrefError;
use crate::fetch_policy::should_fetch;
use crate::rate_limit::RateLimitState;
use crate::services::ServiceProfile;
use crate::store::ArtifactStore;
use crate::strategy::FetchStrategy;
use crate::transport::HttpRequest;

/// Fetches one task's artifact to its destination.
///
/// Transfer failures come back as a failed [`FetchResult`] that still counts
/// the requests made; `Err` means the task could not be attempted at all.
pub trait DataRetriever: Send + Sync {
    fn name(&self) -> &str;
    fn retrieve(&self, task: &RetrievalTask) -> Result<FetchResult, XrefError>;
}

pub struct Retriever {
    name: String,
    strategy: Box<dyn FetchStrategy>,
    client: RateLimitAwareClient,
    profile: ServiceProfile,
    state: Arc<RateLimitState>,
}

impl Retriever {
    pub fn new(
        name: &str,
        strategy: Box<dyn FetchStrategy>,
        client: RateLimitAwareClient,
        profile: ServiceProfile,
        state: Arc<RateLimitState>,
    ) -> Self {
        Self {
            name: name.to_string(),
            strategy,
            client,
            profile,
            state,
        }
    }
}

impl Retriever {
    /// Fetches every page, then publishes the concatenation in one write.
    fn download(
        &self,
        task: &RetrievalTask,
        requests: &[HttpRequest],
        usage: &mut FetchUsage,
    ) -> Result<Vec<u8>, XrefError> {
        let mut buffer = Vec::new();
        for request in requests {
            let body = self.client.fetch_counted(
                request,
                &self.profile,
                &self.state,
                task.retry_budget,
                usage,
            )?;
            buffer.extend_from_slice(&body);
        }
        ArtifactStore::write_atomic(&task.destination, &buffer)?;
        Ok(buffer)
    }
}

impl DataRetriever for Retriever {
    fn name(&self) -> &str {
        &self.name
    }

    fn retrieve(&self, task: &RetrievalTask) -> Result<FetchResult, XrefError> {
        task.validate()?;
        if !should_fetch(&task.destination, task.max_age) {
            debug!(
                retriever = %self.name,
                destination = %task.destination,
                "artifact is fresh, skipping"
            );
            return Ok(FetchResult {
                retriever: self.name.clone(),
                destination: task.destination.clone(),
                context: task.context.clone(),
                action: FetchAction::Fresh,
                attempts: 0,
                total_wait: Duration::ZERO,
                bytes: 0,
                error_kind: None,
                message: None,
            });
        }

        let requests = self.strategy.build_requests(task)?;
        let mut usage = FetchUsage::default();
        let buffer = match self.download(task, &requests, &mut usage) {
            Ok(buffer) => buffer,
            Err(err) => {
                error!(
                    retriever = %self.name,
                    source = %task.source_locator,
                    destination = %task.destination,
                    species = ?task.context.species.as_ref().map(|s| s.as_str()),
                    reference_db = ?task.context.reference_db.as_ref().map(|r| r.as_str()),
                    kind = %err.kind(),
                    attempts = usage.attempts,
                    "task failed: {err}"
                );
                return Ok(FetchResult::failed(task, &err).with_usage(usage));
            }
        };

        info!(
            retriever = %self.name,
            strategy = self.strategy.name(),
            destination = %task.destination,
            requests = requests.len(),
            bytes = buffer.len(),
            attempts = usage.attempts,
            "artifact written"
        );
        Ok(FetchResult {
            retriever: self.name.clone(),
            destination: task.destination.clone(),
            context: task.context.clone(),
            action: FetchAction::Downloaded,
            attempts: usage.attempts,
            total_wait: usage.total_wait,
            bytes: buffer.len() as u64,
            error_kind: None,
            message: None,
        })
    }
}
