use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use futures::FutureExt;
use indexmap::IndexMap;
use log::{debug, error, info, warn};

use super::core::AzureProvider;
use crate::error::{PipeLensError, Result};
use crate::insights::{
    DashboardReport, DashboardResponse, ExecutionTime, FailedPipeline, FailedStage,
    PipelineStats, PipelineSummary, Progress, StageFailure, Totals,
};
use crate::providers::azure::cache::CachedReport;
use crate::providers::azure::client::pipelines::{
    run_detail_endpoint, runs_endpoint, PipelineDto, PipelineListDto, RunDetailDto, RunDto,
    RunListDto, RunOutcome,
};
use crate::providers::azure::filters::{DashboardParams, Filters};
use crate::providers::azure::stage_type::StageType;
use crate::providers::azure::stats::{compute_stats, format_fixed};

pub struct Aggregate {
    pub cached: CachedReport,
    pub from_cache: bool,
}

impl AzureProvider {
    /// Dashboard entry point. Never fails: errors and panics inside the aggregation
    /// become `{success: false, error}`.
    pub async fn get_dashboard_data(&self, params: &DashboardParams) -> DashboardResponse {
        let started = Instant::now();
        info!("Loading dashboard data");

        match AssertUnwindSafe(self.aggregate(params)).catch_unwind().await {
            Ok(Ok(aggregate)) => {
                let processing_time = started.elapsed().as_secs_f64();
                if !aggregate.from_cache {
                    info!("Dashboard computed in {processing_time:.3}s");
                }

                DashboardResponse {
                    success: true,
                    data: Some(aggregate.cached.report),
                    error: None,
                    last_updated: aggregate.cached.stored_at,
                    processing_time: (!aggregate.from_cache).then_some(processing_time),
                    from_cache: aggregate.from_cache,
                }
            }
            Ok(Err(e)) => {
                error!("Dashboard aggregation failed: {e}");
                DashboardResponse::failure(e.to_string(), self.cache.now())
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "aggregation panicked".to_string());
                error!("Dashboard aggregation panicked: {message}");
                DashboardResponse::failure(message, self.cache.now())
            }
        }
    }

    /// Returns the cached report for these filters when fresh, otherwise recomputes it.
    pub async fn aggregate(&self, params: &DashboardParams) -> Result<Aggregate> {
        let filters = Filters::resolve(params, &self.config.default_project)?;

        if let Some(cached) = self.cache.lookup(&filters.base, &filters.full) {
            info!(
                "Serving dashboard from cache (valid until {})",
                cached.stored_at + Duration::minutes(self.config.cache_duration_minutes)
            );
            return Ok(Aggregate {
                cached,
                from_cache: true,
            });
        }

        let flight = self.cache.flight(&filters.full);
        let result = {
            let _guard = flight.lock().await;
            self.compute_once(&filters).await
        };
        self.cache.end_flight(&filters.full, flight);

        result
    }

    /// Runs while holding the flight lock for `filters.full`.
    async fn compute_once(&self, filters: &Filters) -> Result<Aggregate> {
        // Another caller may have filled the entry while we waited.
        if let Some(cached) = self.cache.lookup(&filters.base, &filters.full) {
            debug!("Dashboard populated by a concurrent request");
            return Ok(Aggregate {
                cached,
                from_cache: true,
            });
        }

        let report = self.build_report(filters).await?;
        let cached = self.cache.put(&filters.base, &filters.full, report);

        Ok(Aggregate {
            cached,
            from_cache: false,
        })
    }

    async fn build_report(&self, filters: &Filters) -> Result<DashboardReport> {
        let now = self.cache.now();
        let cutoff = now - Duration::days(i64::from(filters.days));

        let pipelines = self.pipeline_list(&filters.project).await?;
        let active_repos = if pipelines.value.iter().any(|p| p.repository.is_some()) {
            self.active_repositories(&filters.project).await
        } else {
            None
        };

        let mut builder = ReportBuilder::new(filters, pipelines.value.len());

        let eligible: Vec<&PipelineDto> = pipelines
            .value
            .iter()
            .filter(|p| {
                let ok = is_eligible(p, active_repos.as_ref(), filters);
                if !ok {
                    builder.progress.processed += 1;
                }
                ok
            })
            .collect();

        info!(
            "Processing {} of {} pipelines in project {}",
            eligible.len(),
            pipelines.value.len(),
            filters.project
        );

        let run_lists = self.run_lists(filters, &eligible).await;

        for (index, (pipeline, runs)) in eligible.iter().zip(run_lists).enumerate() {
            debug!(
                "Folding pipeline {}/{}: {}",
                index + 1,
                eligible.len(),
                pipeline.name
            );

            let url = self.config.pipeline_web_url(&filters.project, pipeline.id);
            let summary = builder.add_pipeline(pipeline, url);

            let Some(runs) = runs else {
                builder.progress.processed += 1;
                continue;
            };

            let max_runs = self.config.max_runs as usize;
            for (run, finished) in in_window_runs(&runs, cutoff, max_runs) {
                let run_url = self.config.run_web_url(&filters.project, run.id);
                builder.record_run(pipeline, summary, run, finished, run_url);
            }

            builder.progress.processed += 1;
        }

        let failed_keys: Vec<(u64, u64)> = builder
            .failed_pipelines
            .iter()
            .map(|f| (f.id, f.run_id))
            .collect();
        let details = self.failure_details(&filters.project, &failed_keys).await;

        for (index, detail) in details.iter().enumerate() {
            if let Some(detail) = detail {
                builder.apply_failure_detail(index, detail);
            }
        }

        Ok(builder.finish())
    }

    async fn pipeline_list(&self, project: &str) -> Result<PipelineListDto> {
        if let Some(pipelines) = self.cache.get_pipeline_list(project) {
            debug!("Reusing cached pipeline list for {project}");
            return Ok(pipelines);
        }

        let pipelines = self
            .client
            .fetch_pipeline_list(project, self.config.max_pipelines, &self.config.api_version)
            .await
            .ok_or_else(|| {
                PipeLensError::Api(format!("Could not load pipelines for project '{project}'"))
            })?;

        self.cache.put_pipeline_list(project, pipelines.clone());
        Ok(pipelines)
    }

    async fn active_repositories(&self, project: &str) -> Option<HashSet<String>> {
        let Some(repos) = self
            .client
            .fetch_repositories(project, &self.config.api_version)
            .await
        else {
            warn!("Repository list unavailable for {project}; not filtering by repository");
            return None;
        };

        Some(
            repos
                .value
                .into_iter()
                .filter(|r| !r.is_disabled)
                .map(|r| r.id)
                .collect(),
        )
    }

    /// Run lists aligned with `pipelines`. Fresh cached lists are reused; the rest are
    /// fetched in one batch and zipped back by position.
    async fn run_lists(
        &self,
        filters: &Filters,
        pipelines: &[&PipelineDto],
    ) -> Vec<Option<Vec<RunDto>>> {
        let mut lists = Vec::with_capacity(pipelines.len());
        let mut pending = Vec::new();

        for (slot, pipeline) in pipelines.iter().enumerate() {
            let cached = self
                .cache
                .get_runs_for(&filters.project, pipeline.id, &filters.base);
            if cached.is_none() {
                pending.push((slot, pipeline.id));
            }
            lists.push(cached);
        }

        debug!(
            "Run lists: {} from cache, {} to fetch",
            pipelines.len() - pending.len(),
            pending.len()
        );

        let endpoints: Vec<String> = pending
            .iter()
            .map(|&(_, id)| runs_endpoint(id, self.config.max_runs, &self.config.api_version))
            .collect();
        let fetched = self
            .client
            .fetch_batch::<RunListDto>(&filters.project, &endpoints)
            .await;

        for ((slot, pipeline_id), response) in pending.into_iter().zip(fetched) {
            match response {
                Some(list) => {
                    self.cache.put_runs_for(
                        &filters.project,
                        pipeline_id,
                        &filters.base,
                        list.value.clone(),
                    );
                    lists[slot] = Some(list.value);
                }
                None => warn!("No runs available for pipeline {pipeline_id}"),
            }
        }

        lists
    }

    /// Failure details for `(pipeline id, run id)` pairs, aligned with the input.
    pub(super) async fn failure_details(
        &self,
        project: &str,
        runs: &[(u64, u64)],
    ) -> Vec<Option<RunDetailDto>> {
        let mut details = Vec::with_capacity(runs.len());
        let mut pending = Vec::new();

        for (slot, &(pipeline_id, run_id)) in runs.iter().enumerate() {
            let cached = self.cache.get_failure_detail(project, pipeline_id, run_id);
            if cached.is_none() {
                pending.push((slot, pipeline_id, run_id));
            }
            details.push(cached);
        }

        let endpoints: Vec<String> = pending
            .iter()
            .map(|&(_, pipeline_id, run_id)| {
                run_detail_endpoint(pipeline_id, run_id, &self.config.api_version)
            })
            .collect();
        let fetched = self
            .client
            .fetch_batch::<RunDetailDto>(project, &endpoints)
            .await;

        for ((slot, pipeline_id, run_id), response) in pending.into_iter().zip(fetched) {
            if let Some(detail) = response {
                self.cache
                    .put_failure_detail(project, pipeline_id, run_id, detail.clone());
                details[slot] = Some(detail);
            }
        }

        details
    }
}

fn is_eligible(
    pipeline: &PipelineDto,
    active_repos: Option<&HashSet<String>>,
    filters: &Filters,
) -> bool {
    if !pipeline.is_enabled() {
        debug!("Skipping disabled pipeline {}", pipeline.name);
        return false;
    }

    if let (Some(repo), Some(active)) = (&pipeline.repository, active_repos) {
        if !active.contains(&repo.id) {
            debug!("Skipping pipeline {} with inactive repository", pipeline.name);
            return false;
        }
    }

    filters.matches_pipeline(&pipeline.name)
}

/// Finished runs inside the window, newest first. Only the first `max_runs` entries of
/// the upstream list are considered.
fn in_window_runs(
    runs: &[RunDto],
    cutoff: DateTime<Utc>,
    max_runs: usize,
) -> Vec<(&RunDto, DateTime<Utc>)> {
    let mut in_window: Vec<_> = runs
        .iter()
        .take(max_runs)
        .filter_map(|run| {
            let finished = run.finished_at()?;
            (finished >= cutoff).then_some((run, finished))
        })
        .collect();

    in_window.sort_by(|a, b| b.1.cmp(&a.1));
    in_window
}

fn percentage(part: usize, total: usize) -> String {
    if total == 0 {
        return format_fixed(0.0);
    }

    #[allow(clippy::cast_precision_loss)]
    let pct = part as f64 / total as f64 * 100.0;
    format_fixed(pct)
}

#[derive(Default)]
struct PipelineCounter {
    success: usize,
    failed: usize,
    other: usize,
    durations: Vec<f64>,
}

impl PipelineCounter {
    fn into_stats(self) -> PipelineStats {
        let total = self.success + self.failed + self.other;

        #[allow(clippy::cast_precision_loss)]
        let avg_duration = (!self.durations.is_empty()).then(|| {
            format_fixed(self.durations.iter().sum::<f64>() / self.durations.len() as f64)
        });

        PipelineStats {
            success: self.success,
            failed: self.failed,
            other: self.other,
            success_rate: percentage(self.success, total),
            failure_rate: percentage(self.failed, total),
            other_rate: percentage(self.other, total),
            avg_duration,
        }
    }
}

struct ReportBuilder<'a> {
    filters: &'a Filters,
    totals: Totals,
    stage_counts: IndexMap<String, (StageType, usize)>,
    pipeline_stats: IndexMap<String, PipelineCounter>,
    failed_pipelines: Vec<FailedPipeline>,
    all_pipelines: Vec<PipelineSummary>,
    execution_times: Vec<ExecutionTime>,
    progress: Progress,
}

impl<'a> ReportBuilder<'a> {
    fn new(filters: &'a Filters, total_pipelines: usize) -> Self {
        Self {
            filters,
            totals: Totals::default(),
            stage_counts: IndexMap::new(),
            pipeline_stats: IndexMap::new(),
            failed_pipelines: Vec::new(),
            all_pipelines: Vec::new(),
            execution_times: Vec::new(),
            progress: Progress {
                total_pipelines,
                processed: 0,
            },
        }
    }

    /// Registers an eligible pipeline and returns its summary slot.
    fn add_pipeline(&mut self, pipeline: &PipelineDto, url: String) -> usize {
        self.totals.pipelines += 1;
        self.all_pipelines.push(PipelineSummary {
            id: pipeline.id,
            name: pipeline.name.clone(),
            url,
            last_run: None,
            last_status: None,
            last_duration: None,
        });
        self.all_pipelines.len() - 1
    }

    fn record_run(
        &mut self,
        pipeline: &PipelineDto,
        summary: usize,
        run: &RunDto,
        finished: DateTime<Utc>,
        run_url: String,
    ) {
        let outcome = run.outcome();
        let counter = self
            .pipeline_stats
            .entry(pipeline.name.clone())
            .or_default();

        self.totals.runs += 1;
        match outcome {
            RunOutcome::Succeeded => {
                self.totals.success += 1;
                counter.success += 1;
            }
            RunOutcome::Failed => {
                self.totals.failed += 1;
                counter.failed += 1;
            }
            RunOutcome::Other => {
                self.totals.other += 1;
                counter.other += 1;
            }
        }

        let duration = run.duration_minutes();
        if let Some(duration) = duration {
            counter.durations.push(duration);
            self.execution_times.push(ExecutionTime {
                pipeline: pipeline.name.clone(),
                run_id: run.id,
                duration,
            });
        }

        let summary = &mut self.all_pipelines[summary];
        if summary.last_run.is_none() {
            summary.last_run = Some(finished.to_rfc3339());
            summary.last_status = Some(
                run.result
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string()),
            );
            summary.last_duration = duration.map(format_fixed);
        }

        if outcome == RunOutcome::Failed {
            self.failed_pipelines.push(FailedPipeline {
                id: pipeline.id,
                name: pipeline.name.clone(),
                run_id: run.id,
                date: run.finished_date.clone(),
                url: run_url,
                failed_stages: Vec::new(),
                errors: Vec::new(),
                log_url: None,
            });
        }
    }

    /// Attaches failed stages of one failed run. Stages excluded by the stage filters
    /// are left out of the breakdown; the run itself stays counted as failed.
    fn apply_failure_detail(&mut self, index: usize, detail: &RunDetailDto) {
        let occurrence = &mut self.failed_pipelines[index];

        for stage in detail.failed_stages() {
            let name = stage.name.as_deref().unwrap_or("unnamed");
            let stage_type = StageType::classify(name);
            if !self.filters.matches_stage(name, stage_type) {
                continue;
            }

            self.stage_counts
                .entry(name.to_string())
                .or_insert((stage_type, 0))
                .1 += 1;

            occurrence.failed_stages.push(FailedStage {
                name: name.to_string(),
                stage_type,
                result: stage.result.clone().unwrap_or_default(),
            });
            occurrence
                .errors
                .extend(stage.messages().map(str::to_string));
            if occurrence.log_url.is_none() {
                occurrence.log_url = stage.log_url().map(str::to_string);
            }
        }
    }

    fn finish(self) -> DashboardReport {
        let total_failed = self.totals.failed;
        let stage_failures = if total_failed == 0 {
            IndexMap::new()
        } else {
            self.stage_counts
                .into_iter()
                .map(|(name, (stage_type, count))| {
                    let failure = StageFailure {
                        stage_type,
                        count,
                        percentage: percentage(count, total_failed),
                    };
                    (name, failure)
                })
                .collect()
        };

        let pipeline_stats = self
            .pipeline_stats
            .into_iter()
            .map(|(name, counter)| (name, counter.into_stats()))
            .collect();

        let durations: Vec<f64> = self.execution_times.iter().map(|t| t.duration).collect();

        DashboardReport {
            project: self.filters.project.clone(),
            days: self.filters.days,
            totals: self.totals,
            stage_failures,
            pipeline_stats,
            failed_pipelines: self.failed_pipelines,
            all_pipelines: self.all_pipelines,
            execution_stats: compute_stats(&durations),
            execution_times: self.execution_times,
            progress: self.progress,
        }
    }
}
