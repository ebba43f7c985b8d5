//! Order-preserving partitioning and task construction.

use std::collections::BTreeSet;
use std::time::Duration;

use camino::Utf8PathBuf;

use crate::domain::{MappingJob, RetrievalTask, SpeciesContext};
use crate::error::XrefError;

/// Splits `items` into consecutive chunks of `batch_size`; the last chunk may be shorter.
pub fn partition<T: Clone>(items: &[T], batch_size: usize) -> Result<Vec<Vec<T>>, XrefError> {
    if batch_size == 0 {
        return Err(XrefError::Configuration(
            "batch size must be greater than zero".to_string(),
        ));
    }
    Ok(items
        .chunks(batch_size)
        .map(|chunk| chunk.to_vec())
        .collect())
}

/// Settings the builder needs from one retriever's configuration.
#[derive(Debug, Clone)]
pub struct TaskTemplate {
    pub retriever: String,
    pub source_locator: String,
    pub destination_template: String,
    pub max_age: Duration,
    pub identifiers_per_task: usize,
    pub retry_budget: u32,
    pub requires_identifiers: bool,
}

pub struct BatchJobBuilder;

impl BatchJobBuilder {
    /// Expands every (species x reference db) job into bounded-size tasks.
    ///
    /// Destination templates may use `{retriever}`, `{species}`,
    /// `{reference_db}` and `{batch}`. When a job carries a species or a
    /// reference db the template must embed it, and two tasks expanding to the
    /// same destination are rejected, so two workers never write the same
    /// file. A job split into several batches gets a `_partN` suffix if the
    /// template has no `{batch}` placeholder.
    pub fn build(
        template: &TaskTemplate,
        jobs: &[MappingJob],
    ) -> Result<Vec<RetrievalTask>, XrefError> {
        if template.source_locator.trim().is_empty() {
            return Err(XrefError::Configuration(format!(
                "retriever {} has no source URL",
                template.retriever
            )));
        }
        if template.destination_template.trim().is_empty() {
            return Err(XrefError::Configuration(format!(
                "retriever {} has no destination template",
                template.retriever
            )));
        }

        let mut tasks = Vec::new();
        let mut destinations = BTreeSet::new();
        for job in jobs {
            Self::check_template_keys(template, job)?;
            if template.requires_identifiers && job.identifiers.is_empty() {
                return Err(XrefError::Configuration(format!(
                    "retriever {} received an empty identifier list for {}",
                    template.retriever,
                    SpeciesContext {
                        species: job.species.clone(),
                        reference_db: job.reference_db.clone(),
                    }
                )));
            }

            let batches = if job.identifiers.is_empty() {
                vec![Vec::new()]
            } else {
                partition(&job.identifiers, template.identifiers_per_task)?
            };
            let split = batches.len() > 1;
            for (index, identifiers) in batches.into_iter().enumerate() {
                let destination = expand_destination(template, job, index, split);
                if !destinations.insert(destination.clone()) {
                    return Err(XrefError::Configuration(format!(
                        "retriever {} has two tasks writing {destination}; jobs must differ by species or reference db",
                        template.retriever
                    )));
                }
                tasks.push(RetrievalTask {
                    retriever: template.retriever.clone(),
                    source_locator: expand_keys(&template.source_locator, template, job),
                    destination,
                    max_age: template.max_age,
                    identifiers,
                    context: SpeciesContext {
                        species: job.species.clone(),
                        reference_db: job.reference_db.clone(),
                    },
                    retry_budget: template.retry_budget,
                });
            }
        }
        Ok(tasks)
    }

    fn check_template_keys(template: &TaskTemplate, job: &MappingJob) -> Result<(), XrefError> {
        let dest = &template.destination_template;
        if job.species.is_some() && !dest.contains("{species}") {
            return Err(XrefError::Configuration(format!(
                "destination template for {} must contain {{species}}",
                template.retriever
            )));
        }
        if job.reference_db.is_some() && !dest.contains("{reference_db}") {
            return Err(XrefError::Configuration(format!(
                "destination template for {} must contain {{reference_db}}",
                template.retriever
            )));
        }
        Ok(())
    }
}

fn expand_keys(raw: &str, template: &TaskTemplate, job: &MappingJob) -> String {
    raw.replace("{retriever}", &template.retriever)
        .replace(
            "{species}",
            job.species.as_ref().map(|s| s.as_str()).unwrap_or(""),
        )
        .replace(
            "{reference_db}",
            job.reference_db.as_ref().map(|r| r.as_str()).unwrap_or(""),
        )
}

fn expand_destination(
    template: &TaskTemplate,
    job: &MappingJob,
    index: usize,
    split: bool,
) -> Utf8PathBuf {
    let expanded = expand_keys(&template.destination_template, template, job);
    if expanded.contains("{batch}") {
        return Utf8PathBuf::from(expanded.replace("{batch}", &index.to_string()));
    }
    if !split {
        return Utf8PathBuf::from(expanded);
    }
    let path = Utf8PathBuf::from(expanded);
    let stem = path.file_stem().unwrap_or("artifact").to_string();
    let name = match path.extension() {
        Some(ext) => format!("{stem}_part{index}.{ext}"),
        None => format!("{stem}_part{index}"),
    };
    path.with_file_name(name)
}
