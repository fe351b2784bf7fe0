use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::providers::azure::stage_type::StageType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardReport {
    pub project: String,
    pub days: u32,
    pub totals: Totals,
    pub stage_failures: IndexMap<String, StageFailure>,
    pub pipeline_stats: IndexMap<String, PipelineStats>,
    pub failed_pipelines: Vec<FailedPipeline>,
    pub all_pipelines: Vec<PipelineSummary>,
    pub execution_times: Vec<ExecutionTime>,
    pub execution_stats: Option<ExecutionStats>,
    pub progress: Progress,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Totals {
    pub pipelines: usize,
    pub runs: usize,
    pub success: usize,
    pub failed: usize,
    pub other: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageFailure {
    pub stage_type: StageType,
    pub count: usize,
    /// Share of all failed runs, two decimals.
    pub percentage: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStats {
    pub success: usize,
    pub failed: usize,
    pub other: usize,
    pub success_rate: String,
    pub failure_rate: String,
    pub other_rate: String,
    pub avg_duration: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedStage {
    pub name: String,
    pub stage_type: StageType,
    pub result: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedPipeline {
    pub id: u64,
    pub name: String,
    pub run_id: u64,
    pub date: Option<String>,
    pub url: String,
    pub failed_stages: Vec<FailedStage>,
    pub errors: Vec<String>,
    pub log_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSummary {
    pub id: u64,
    pub name: String,
    pub url: String,
    pub last_run: Option<String>,
    pub last_status: Option<String>,
    pub last_duration: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionTime {
    pub pipeline: String,
    pub run_id: u64,
    pub duration: f64,
}

/// Duration statistics in minutes, formatted to two decimals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStats {
    pub average: String,
    pub median: String,
    pub min: String,
    pub max: String,
    pub percentile95: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub total_pipelines: usize,
    pub processed: usize,
}

/// Envelope returned by the dashboard entry point. Callers must check `success`
/// before reading `data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<DashboardReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub last_updated: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time: Option<f64>,
    pub from_cache: bool,
}

impl DashboardResponse {
    pub fn failure(error: String, at: DateTime<Utc>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            last_updated: at,
            processing_time: None,
            from_cache: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearCacheResponse {
    pub success: bool,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}
