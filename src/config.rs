use std::time::Duration;

use url::Url;

use crate::error::{PipeLensError, Result};

pub const DEFAULT_API_VERSION: &str = "7.1-preview.1";
pub const DEFAULT_DAYS: u32 = 30;

#[derive(Debug, Clone)]
pub struct Config {
    /// Organisation root, e.g. `https://dev.azure.com/contoso`.
    pub service_root: Url,
    pub default_project: String,
    pub api_version: String,
    pub max_pipelines: u32,
    pub max_runs: u32,
    /// Time-to-live in minutes shared by every cache entry class.
    pub cache_duration_minutes: i64,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub concurrency: usize,
}

impl Config {
    pub fn new(service_root: &str, default_project: impl Into<String>) -> Result<Self> {
        let service_root = Url::parse(service_root)
            .map_err(|e| PipeLensError::Config(format!("Invalid service root URL: {e}")))?;

        if service_root.cannot_be_a_base() {
            return Err(PipeLensError::Config(format!(
                "Service root cannot be used as a base URL: {service_root}"
            )));
        }

        Ok(Self {
            service_root,
            default_project: default_project.into(),
            api_version: DEFAULT_API_VERSION.to_string(),
            max_pipelines: 500,
            max_runs: 100,
            cache_duration_minutes: 15,
            request_timeout: Duration::from_secs(30),
            max_retries: 2,
            concurrency: 10,
        })
    }

    /// Root without a trailing slash, used for human-facing links.
    pub fn root_str(&self) -> &str {
        self.service_root.as_str().trim_end_matches('/')
    }

    pub fn pipeline_web_url(&self, project: &str, pipeline_id: u64) -> String {
        format!(
            "{}/{project}/_build?definitionId={pipeline_id}",
            self.root_str()
        )
    }

    pub fn run_web_url(&self, project: &str, run_id: u64) -> String {
        format!("{}/{project}/_build/results?buildId={run_id}", self.root_str())
    }
}
