use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::core::AzureClient;

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineListDto {
    #[serde(default)]
    pub value: Vec<PipelineDto>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineDto {
    pub id: u64,
    pub name: String,
    pub queue_status: Option<String>,
    pub repository: Option<RepositoryRefDto>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepositoryRefDto {
    pub id: String,
}

impl PipelineDto {
    /// Pipelines without a queue status are treated as enabled.
    pub fn is_enabled(&self) -> bool {
        self.queue_status
            .as_deref()
            .map_or(true, |status| status.eq_ignore_ascii_case("enabled"))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunListDto {
    #[serde(default)]
    pub value: Vec<RunDto>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunDto {
    pub id: u64,
    pub result: Option<String>,
    pub created_date: Option<String>,
    pub finished_date: Option<String>,
    pub url: Option<String>,
}

/// Normalised run outcome used for counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded,
    Failed,
    Other,
}

impl RunDto {
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(self.finished_date.as_deref()?)
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(self.created_date.as_deref()?)
    }

    pub fn outcome(&self) -> RunOutcome {
        match self.result.as_deref().map(str::to_ascii_lowercase).as_deref() {
            Some("succeeded") => RunOutcome::Succeeded,
            Some("failed") => RunOutcome::Failed,
            _ => RunOutcome::Other,
        }
    }

    /// Wall-clock duration in minutes when both timestamps are known.
    #[allow(clippy::cast_precision_loss)]
    pub fn duration_minutes(&self) -> Option<f64> {
        let created = self.created_at()?;
        let finished = self.finished_at()?;
        Some((finished - created).num_milliseconds() as f64 / 60_000.0)
    }
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunDetailDto {
    pub stages: Option<Vec<StageDto>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageDto {
    pub name: Option<String>,
    pub result: Option<String>,
    pub error_message: Option<String>,
    pub issues: Option<Vec<IssueDto>>,
    pub log: Option<LogReferenceDto>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IssueDto {
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogReferenceDto {
    pub url: Option<String>,
}

impl StageDto {
    pub fn is_failed(&self) -> bool {
        self.result
            .as_deref()
            .is_some_and(|r| r.eq_ignore_ascii_case("failed"))
    }

    /// Error message followed by issue messages, in payload order.
    pub fn messages(&self) -> impl Iterator<Item = &str> {
        self.error_message.as_deref().into_iter().chain(
            self.issues
                .iter()
                .flatten()
                .filter_map(|issue| issue.message.as_deref()),
        )
    }

    pub fn log_url(&self) -> Option<&str> {
        self.log.as_ref()?.url.as_deref()
    }
}

impl RunDetailDto {
    pub fn failed_stages(&self) -> impl Iterator<Item = &StageDto> {
        self.stages.iter().flatten().filter(|s| s.is_failed())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepositoryListDto {
    #[serde(default)]
    pub value: Vec<RepositoryDto>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryDto {
    pub id: String,
    #[serde(default)]
    pub is_disabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectListDto {
    #[serde(default)]
    pub count: usize,
    #[serde(default)]
    pub value: Vec<ProjectDto>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectDto {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

pub fn pipelines_endpoint(max_pipelines: u32, api_version: &str) -> String {
    format!("pipelines?$top={max_pipelines}&api-version={api_version}")
}

pub fn runs_endpoint(pipeline_id: u64, max_runs: u32, api_version: &str) -> String {
    format!("pipelines/{pipeline_id}/runs?$top={max_runs}&api-version={api_version}")
}

pub fn run_detail_endpoint(pipeline_id: u64, run_id: u64, api_version: &str) -> String {
    format!("pipelines/{pipeline_id}/runs/{run_id}?api-version={api_version}")
}

pub fn repositories_endpoint(api_version: &str) -> String {
    format!("git/repositories?api-version={api_version}")
}

impl AzureClient {
    pub async fn fetch_pipeline_list(
        &self,
        project: &str,
        max_pipelines: u32,
        api_version: &str,
    ) -> Option<PipelineListDto> {
        self.fetch_one(project, &pipelines_endpoint(max_pipelines, api_version))
            .await
    }

    pub async fn fetch_repositories(
        &self,
        project: &str,
        api_version: &str,
    ) -> Option<RepositoryListDto> {
        self.fetch_one(project, &repositories_endpoint(api_version))
            .await
    }

    pub async fn fetch_projects(&self, api_version: &str) -> Option<ProjectListDto> {
        let endpoint = format!("_apis/projects?api-version={api_version}");
        let endpoint = match self.organization_url(&endpoint) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                log::warn!("Cannot build projects URL: {e}");
                return None;
            }
        };
        // Absolute endpoints ignore the project scope.
        self.fetch_one("", &endpoint).await
    }
}
