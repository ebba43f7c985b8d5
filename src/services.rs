//! Per-service throttling and error-signalling conventions.

use std::time::Duration;

use serde::Deserialize;

use crate::error::XrefError;
use crate::executor::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_RETRIES};

pub const DEFAULT_DECEPTIVE_RETRY_CAP: u32 = 5;
pub const DEFAULT_DECEPTIVE_RETRY_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_INITIAL_QUOTA: i64 = 10;
pub const DEFAULT_MAX_RATE_LIMIT_WAIT: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_MAX_RATE_LIMIT_RETRIES: u32 = 30;
pub const DEFAULT_MIN_RATE_LIMIT_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceProfile {
    pub name: String,
    /// Header carrying the remaining request budget, if the service sends one.
    pub quota_header: Option<String>,
    /// Header carrying seconds until the budget resets.
    pub reset_header: Option<String>,
    pub honor_retry_after: bool,
    /// Substrings that turn a 2xx body into a failed query.
    pub error_markers: Vec<String>,
    /// When set, a 2xx body lacking this substring is a failed query.
    pub success_marker: Option<String>,
    pub deceptive_retry_cap: u32,
    pub deceptive_retry_delay: Duration,
    pub retryable_statuses: Vec<u16>,
    pub initial_quota: i64,
    /// Wait for the reset interval before sending when the quota is spent.
    pub admission_control: bool,
    pub max_rate_limit_wait: Duration,
    /// Re-issues allowed after rate-limit responses, whatever they advertise.
    pub max_rate_limit_retries: u32,
    /// Floor for every rate-limit wait, so `Retry-After: 0` cannot spin.
    pub min_rate_limit_wait: Duration,
    pub connect_timeout: Duration,
    pub max_connect_retries: u32,
}

impl ServiceProfile {
    pub fn generic(name: &str) -> Self {
        Self {
            name: name.to_string(),
            quota_header: None,
            reset_header: None,
            honor_retry_after: true,
            error_markers: Vec::new(),
            success_marker: None,
            deceptive_retry_cap: DEFAULT_DECEPTIVE_RETRY_CAP,
            deceptive_retry_delay: DEFAULT_DECEPTIVE_RETRY_DELAY,
            retryable_statuses: vec![502, 503, 504],
            initial_quota: DEFAULT_INITIAL_QUOTA,
            admission_control: false,
            max_rate_limit_wait: DEFAULT_MAX_RATE_LIMIT_WAIT,
            max_rate_limit_retries: DEFAULT_MAX_RATE_LIMIT_RETRIES,
            min_rate_limit_wait: DEFAULT_MIN_RATE_LIMIT_WAIT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_connect_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn builtin(name: &str) -> Option<Self> {
        let base = Self::generic(name);
        let profile = match name {
            "uniprot" => Self {
                max_connect_retries: 5,
                ..base
            },
            "ensembl" => Self {
                quota_header: Some("x-ratelimit-remaining".to_string()),
                reset_header: Some("x-ratelimit-reset".to_string()),
                admission_control: true,
                ..base
            },
            "kegg" => Self {
                max_connect_retries: 1,
                ..base
            },
            "brenda" => Self {
                error_markers: vec!["<soap:Fault".to_string(), "<SOAP-ENV:Fault".to_string()],
                ..base
            },
            "pharos" => Self {
                error_markers: vec!["\"errors\"".to_string()],
                ..base
            },
            "biomart" => Self {
                error_markers: vec!["ERROR".to_string()],
                success_marker: Some("[success]".to_string()),
                ..base
            },
            "zinc" => Self {
                max_connect_retries: 1,
                ..base
            },
            _ => return None,
        };
        Some(profile)
    }

    /// Builtin profile for `name` (or a generic one) with config overrides applied.
    pub fn resolve(name: &str, overrides: Option<&ServiceOverride>) -> Result<Self, XrefError> {
        let mut profile = Self::builtin(name).unwrap_or_else(|| Self::generic(name));
        if let Some(over) = overrides {
            over.apply(&mut profile)?;
        }
        Ok(profile)
    }
}

/// Optional per-service settings from the run file; durations in seconds.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceOverride {
    #[serde(default)]
    pub quota_header: Option<String>,
    #[serde(default)]
    pub reset_header: Option<String>,
    #[serde(default)]
    pub honor_retry_after: Option<bool>,
    #[serde(default)]
    pub error_markers: Option<Vec<String>>,
    #[serde(default)]
    pub success_marker: Option<String>,
    #[serde(default)]
    pub deceptive_retry_cap: Option<u32>,
    #[serde(default)]
    pub deceptive_retry_delay_secs: Option<u64>,
    #[serde(default)]
    pub retryable_statuses: Option<Vec<u16>>,
    #[serde(default)]
    pub initial_quota: Option<i64>,
    #[serde(default)]
    pub admission_control: Option<bool>,
    #[serde(default)]
    pub max_rate_limit_wait_secs: Option<u64>,
    #[serde(default)]
    pub max_rate_limit_retries: Option<u32>,
    #[serde(default)]
    pub min_rate_limit_wait_secs: Option<u64>,
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_connect_retries: Option<u32>,
}

impl ServiceOverride {
    fn apply(&self, profile: &mut ServiceProfile) -> Result<(), XrefError> {
        if let Some(value) = &self.quota_header {
            profile.quota_header = Some(value.to_ascii_lowercase());
        }
        if let Some(value) = &self.reset_header {
            profile.reset_header = Some(value.to_ascii_lowercase());
        }
        if let Some(value) = self.honor_retry_after {
            profile.honor_retry_after = value;
        }
        if let Some(value) = &self.error_markers {
            profile.error_markers = value.clone();
        }
        if let Some(value) = &self.success_marker {
            profile.success_marker = Some(value.clone());
        }
        if let Some(value) = self.deceptive_retry_cap {
            if value == 0 {
                return Err(XrefError::Configuration(format!(
                    "service {}: deceptive_retry_cap must be at least 1",
                    profile.name
                )));
            }
            profile.deceptive_retry_cap = value;
        }
        if let Some(value) = self.deceptive_retry_delay_secs {
            profile.deceptive_retry_delay = Duration::from_secs(value);
        }
        if let Some(value) = &self.retryable_statuses {
            profile.retryable_statuses = value.clone();
        }
        if let Some(value) = self.initial_quota {
            profile.initial_quota = value;
        }
        if let Some(value) = self.admission_control {
            profile.admission_control = value;
        }
        if let Some(value) = self.max_rate_limit_wait_secs {
            profile.max_rate_limit_wait = Duration::from_secs(value);
        }
        if let Some(value) = self.max_rate_limit_retries {
            profile.max_rate_limit_retries = value;
        }
        if let Some(value) = self.min_rate_limit_wait_secs {
            if value == 0 {
                return Err(XrefError::Configuration(format!(
                    "service {}: min_rate_limit_wait_secs must be at least 1",
                    profile.name
                )));
            }
            profile.min_rate_limit_wait = Duration::from_secs(value);
        }
        if let Some(value) = self.connect_timeout_secs {
            if value == 0 {
                return Err(XrefError::Configuration(format!(
                    "service {}: connect_timeout_secs must be at least 1",
                    profile.name
                )));
            }
            profile.connect_timeout = Duration::from_secs(value);
        }
        if let Some(value) = self.max_connect_retries {
            profile.max_connect_retries = value;
        }
        Ok(())
    }
}
