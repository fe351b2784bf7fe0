use csv::{QuoteStyle, WriterBuilder};
use log::{info, warn};
use serde::Serialize;

use super::core::AzureProvider;
use crate::error::{PipeLensError, Result};
use crate::providers::azure::client::pipelines::{
    runs_endpoint, RunDetailDto, RunDto, RunListDto, RunOutcome,
};
use crate::providers::azure::filters::DashboardParams;
use crate::providers::azure::stats::format_fixed;

/// One exported run. Empty strings stand in for absent values.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportRow {
    #[serde(rename = "Pipeline")]
    pub pipeline: String,
    #[serde(rename = "Run ID")]
    pub run_id: u64,
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "Date")]
    pub date: String,
    #[serde(rename = "Duration (min)")]
    pub duration: String,
    #[serde(rename = "Failed Stages")]
    pub failed_stages: String,
    #[serde(rename = "Errors")]
    pub errors: String,
    #[serde(rename = "URL")]
    pub url: String,
}

impl ExportRow {
    fn new(pipeline: &str, run: &RunDto, detail: Option<&RunDetailDto>) -> Self {
        let failed: Vec<_> = detail
            .map(|d| d.failed_stages().collect())
            .unwrap_or_default();

        let failed_stages = failed
            .iter()
            .filter_map(|s| s.name.as_deref())
            .collect::<Vec<_>>()
            .join(";");
        let errors = failed
            .iter()
            .flat_map(|s| s.messages())
            .collect::<Vec<_>>()
            .join("|");
        let url = failed
            .iter()
            .find_map(|s| s.log_url())
            .or(run.url.as_deref())
            .unwrap_or_default()
            .to_string();

        Self {
            pipeline: pipeline.to_string(),
            run_id: run.id,
            status: run.result.clone().unwrap_or_else(|| "unknown".to_string()),
            date: run.finished_date.clone().unwrap_or_default(),
            duration: run.duration_minutes().map(format_fixed).unwrap_or_default(),
            failed_stages,
            errors,
            url,
        }
    }
}

impl AzureProvider {
    /// Flattens every run of every eligible pipeline into rows. Run lists are fetched
    /// again rather than taken from the cache. Fails when the aggregation fails.
    pub async fn export_rows(&self, params: &DashboardParams) -> Result<Vec<ExportRow>> {
        let aggregate = self.aggregate(params).await?;
        let report = &aggregate.cached.report;
        let project = report.project.as_str();

        let endpoints: Vec<String> = report
            .all_pipelines
            .iter()
            .map(|p| runs_endpoint(p.id, self.config.max_runs, &self.config.api_version))
            .collect();
        let run_lists = self
            .client
            .fetch_batch::<RunListDto>(project, &endpoints)
            .await;

        let max_runs = self.config.max_runs as usize;
        let mut entries = Vec::new();
        for (pipeline, runs) in report.all_pipelines.iter().zip(run_lists) {
            let Some(runs) = runs else {
                warn!("Skipping export of pipeline {}: runs unavailable", pipeline.name);
                continue;
            };
            entries.extend(
                runs.value
                    .into_iter()
                    .take(max_runs)
                    .map(|run| (pipeline, run)),
            );
        }

        let failed_keys: Vec<(u64, u64)> = entries
            .iter()
            .filter(|(_, run)| run.outcome() == RunOutcome::Failed)
            .map(|(pipeline, run)| (pipeline.id, run.id))
            .collect();
        let mut details = self
            .failure_details(project, &failed_keys)
            .await
            .into_iter();

        let rows: Vec<ExportRow> = entries
            .iter()
            .map(|(pipeline, run)| {
                let detail = if run.outcome() == RunOutcome::Failed {
                    details.next().flatten()
                } else {
                    None
                };
                ExportRow::new(&pipeline.name, run, detail.as_ref())
            })
            .collect();

        info!("Exporting {} runs", rows.len());
        Ok(rows)
    }

    pub async fn export_csv(&self, params: &DashboardParams) -> Result<String> {
        let rows = self.export_rows(params).await?;
        render_csv(&rows)
    }
}

/// Every field is quoted, so names that look like numbers keep their quotes.
pub fn render_csv(rows: &[ExportRow]) -> Result<String> {
    let mut writer = WriterBuilder::new()
        .quote_style(QuoteStyle::Always)
        .has_headers(false)
        .from_writer(Vec::new());

    writer.write_record([
        "Pipeline",
        "Run ID",
        "Status",
        "Date",
        "Duration (min)",
        "Failed Stages",
        "Errors",
        "URL",
    ])?;
    for row in rows {
        writer.serialize(row)?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| PipeLensError::Io(e.into_error()))?;
    String::from_utf8(bytes)
        .map_err(|e| PipeLensError::Api(format!("Invalid UTF-8 in export: {e}")))
}
