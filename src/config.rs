use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::Deserialize;

use crate::batch::TaskTemplate;
use crate::domain::MappingJob;
use crate::error::XrefError;
use crate::scheduler::{DEFAULT_INTER_WAVE_COOLDOWN, DEFAULT_WORKER_BUDGET};
use crate::services::{ServiceOverride, ServiceProfile};
use crate::strategy::{IDS_PLACEHOLDER, StrategyConfig};

pub const DEFAULT_CONFIG_FILE: &str = "xref-fetch.json";
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_IDENTIFIERS_PER_TASK: usize = 1000;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub pool_size: Option<usize>,
    #[serde(default)]
    pub worker_budget: Option<usize>,
    #[serde(default)]
    pub inter_wave_cooldown_secs: Option<u64>,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    /// Names of retrievers to run; all enabled retrievers when absent.
    #[serde(default)]
    pub enabled: Option<Vec<String>>,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceOverride>,
    #[serde(default)]
    pub retrievers: Vec<RetrieverEntry>,
}

#[derive(Debug, Deserialize)]
pub struct RetrieverEntry {
    pub name: String,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub max_age_secs: Option<u64>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub identifiers_per_task: Option<usize>,
    #[serde(default)]
    pub pool_size: Option<usize>,
    #[serde(default)]
    pub max_connect_retries: Option<u32>,
    #[serde(default)]
    pub requires: Vec<Utf8PathBuf>,
    #[serde(default)]
    pub stop_on_failure: bool,
    #[serde(default)]
    pub jobs: Vec<MappingJob>,
    #[serde(default)]
    pub jobs_file: Option<Utf8PathBuf>,
}

#[derive(Debug, Clone)]
pub enum JobsSpec {
    Inline(Vec<MappingJob>),
    File(Utf8PathBuf),
}

#[derive(Debug, Clone)]
pub struct RetrieverSettings {
    pub template: TaskTemplate,
    pub service: ServiceProfile,
    pub strategy: StrategyConfig,
    pub pool_size: usize,
    pub requires: Vec<Utf8PathBuf>,
    pub stop_on_failure: bool,
    pub jobs: JobsSpec,
}

impl RetrieverSettings {
    pub fn name(&self) -> &str {
        &self.template.retriever
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub worker_budget: usize,
    pub inter_wave_cooldown: Duration,
    pub request_timeout: Duration,
    pub retrievers: Vec<RetrieverSettings>,
}

impl ResolvedConfig {
    /// Keeps only the named retrievers, failing on names that are not configured.
    pub fn retain_only(&mut self, names: &[String]) -> Result<(), XrefError> {
        if names.is_empty() {
            return Ok(());
        }
        let known = self
            .retrievers
            .iter()
            .map(|r| r.name().to_string())
            .collect::<BTreeSet<_>>();
        if let Some(unknown) = names.iter().find(|name| !known.contains(*name)) {
            return Err(XrefError::Configuration(format!(
                "retriever {unknown} is not configured or not enabled"
            )));
        }
        self.retrievers
            .retain(|r| names.iter().any(|name| name == r.name()));
        Ok(())
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, XrefError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Err(XrefError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| XrefError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| XrefError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, XrefError> {
        let schema_version = config.schema_version.unwrap_or(1);
        let default_pool = config.pool_size.unwrap_or(DEFAULT_WORKER_BUDGET);
        let worker_budget = config.worker_budget.unwrap_or(DEFAULT_WORKER_BUDGET);
        if worker_budget == 0 || default_pool == 0 {
            return Err(XrefError::Configuration(
                "pool_size and worker_budget must be greater than zero".to_string(),
            ));
        }

        let mut seen = BTreeSet::new();
        for entry in &config.retrievers {
            if !seen.insert(entry.name.clone()) {
                return Err(XrefError::Configuration(format!(
                    "retriever {} is defined twice",
                    entry.name
                )));
            }
        }
        if let Some(enabled) = &config.enabled {
            if let Some(unknown) = enabled.iter().find(|name| !seen.contains(*name)) {
                return Err(XrefError::Configuration(format!(
                    "enabled list names unknown retriever {unknown}"
                )));
            }
        }

        let retrievers = config
            .retrievers
            .into_iter()
            .filter(|entry| entry.enabled.unwrap_or(true))
            .filter(|entry| {
                config
                    .enabled
                    .as_ref()
                    .is_none_or(|names| names.contains(&entry.name))
            })
            .map(|entry| resolve_retriever(entry, default_pool, &config.services))
            .collect::<Result<Vec<_>, XrefError>>()?;

        Ok(ResolvedConfig {
            schema_version,
            worker_budget,
            inter_wave_cooldown: config
                .inter_wave_cooldown_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_INTER_WAVE_COOLDOWN),
            request_timeout: config
                .request_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            retrievers,
        })
    }
}

fn resolve_retriever(
    entry: RetrieverEntry,
    default_pool: usize,
    services: &BTreeMap<String, ServiceOverride>,
) -> Result<RetrieverSettings, XrefError> {
    let url = entry
        .url
        .filter(|url| !url.trim().is_empty())
        .ok_or_else(|| {
            XrefError::Configuration(format!("retriever {} is missing url", entry.name))
        })?;
    let destination = entry
        .destination
        .filter(|dest| !dest.trim().is_empty())
        .ok_or_else(|| {
            XrefError::Configuration(format!(
                "retriever {} is missing destination",
                entry.name
            ))
        })?;
    let identifiers_per_task = entry
        .identifiers_per_task
        .unwrap_or(DEFAULT_IDENTIFIERS_PER_TASK);
    let pool_size = entry.pool_size.unwrap_or(default_pool);
    if identifiers_per_task == 0 || pool_size == 0 {
        return Err(XrefError::Configuration(format!(
            "retriever {}: identifiers_per_task and pool_size must be greater than zero",
            entry.name
        )));
    }

    let service_name = entry.service.unwrap_or_else(|| entry.name.clone());
    let service = ServiceProfile::resolve(&service_name, services.get(&service_name))?;
    entry.strategy.build()?;

    let jobs = match (entry.jobs_file, entry.jobs.is_empty()) {
        (Some(_), false) => {
            return Err(XrefError::Configuration(format!(
                "retriever {} sets both jobs and jobs_file",
                entry.name
            )));
        }
        (Some(path), true) => JobsSpec::File(path),
        (None, _) => JobsSpec::Inline(entry.jobs),
    };

    let requires_identifiers = needs_identifiers(&entry.strategy, &url);
    Ok(RetrieverSettings {
        template: TaskTemplate {
            retriever: entry.name,
            source_locator: url,
            destination_template: destination,
            max_age: entry
                .max_age_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_MAX_AGE),
            identifiers_per_task,
            retry_budget: entry
                .max_connect_retries
                .unwrap_or(service.max_connect_retries),
            requires_identifiers,
        },
        service,
        strategy: entry.strategy,
        pool_size,
        requires: entry.requires,
        stop_on_failure: entry.stop_on_failure,
        jobs,
    })
}

fn needs_identifiers(strategy: &StrategyConfig, url: &str) -> bool {
    match strategy {
        StrategyConfig::Get { .. } => url.contains(IDS_PLACEHOLDER),
        StrategyConfig::Ftp => false,
        StrategyConfig::Soap { envelope, .. } => envelope.contains("{id}"),
        StrategyConfig::PostForm { .. }
        | StrategyConfig::PostMultipart { .. }
        | StrategyConfig::PostJson { .. } => true,
    }
}
