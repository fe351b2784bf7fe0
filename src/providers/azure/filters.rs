use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use super::stage_type::StageType;
use crate::config::DEFAULT_DAYS;
use crate::error::{PipeLensError, Result};

/// Raw filter parameters as supplied by a caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardParams {
    pub project_name: Option<String>,
    pub days: Option<u32>,
    pub pipeline_filter: Option<String>,
    pub stage_filter: Option<String>,
    pub stage_type_filter: Option<String>,
}

/// Exact cache key built from normalised filter values. The base key carries only the
/// project and window; the full key carries every filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    project: String,
    days: u32,
    pipeline_filter: Option<String>,
    stage_filter: Option<String>,
    stage_type: Option<StageType>,
}

/// Filters after defaulting, normalisation and pattern compilation.
#[derive(Debug, Clone)]
pub struct Filters {
    pub project: String,
    pub days: u32,
    pub pipeline_pattern: Option<Regex>,
    pub stage_pattern: Option<Regex>,
    pub stage_type: Option<StageType>,
    /// Governs reuse of pipeline and run lists.
    pub base: Fingerprint,
    /// Governs reuse of the finished report.
    pub full: Fingerprint,
}

impl Filters {
    pub fn resolve(params: &DashboardParams, default_project: &str) -> Result<Self> {
        let project = non_empty(params.project_name.as_deref())
            .unwrap_or(default_project)
            .to_string();
        if project.is_empty() {
            return Err(PipeLensError::Config("No project selected".to_string()));
        }

        let days = params.days.filter(|&d| d > 0).unwrap_or(DEFAULT_DAYS);
        let pipeline_filter = active_filter(params.pipeline_filter.as_deref());
        let stage_filter = active_filter(params.stage_filter.as_deref());
        let stage_type = active_filter(params.stage_type_filter.as_deref())
            .map(str::parse::<StageType>)
            .transpose()?;

        let base = Fingerprint {
            project: project.clone(),
            days,
            pipeline_filter: None,
            stage_filter: None,
            stage_type: None,
        };
        let full = Fingerprint {
            pipeline_filter: pipeline_filter.map(str::to_string),
            stage_filter: stage_filter.map(str::to_string),
            stage_type,
            ..base.clone()
        };

        Ok(Self {
            pipeline_pattern: compile("pipeline", pipeline_filter)?,
            stage_pattern: compile("stage", stage_filter)?,
            project,
            days,
            stage_type,
            base,
            full,
        })
    }

    pub fn matches_pipeline(&self, name: &str) -> bool {
        self.pipeline_pattern
            .as_ref()
            .map_or(true, |re| re.is_match(name))
    }

    /// Whether a failed stage belongs in the failure breakdown.
    pub fn matches_stage(&self, name: &str, stage_type: StageType) -> bool {
        let name_ok = self
            .stage_pattern
            .as_ref()
            .map_or(true, |re| re.is_match(name));
        let type_ok = self.stage_type.map_or(true, |t| t == stage_type);
        name_ok && type_ok
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// `"all"` (any case) selects everything, same as no filter.
fn active_filter(value: Option<&str>) -> Option<&str> {
    non_empty(value).filter(|v| !v.eq_ignore_ascii_case("all"))
}

fn compile(kind: &str, pattern: Option<&str>) -> Result<Option<Regex>> {
    pattern
        .map(|p| {
            RegexBuilder::new(p)
                .case_insensitive(true)
                .build()
                .map_err(|e| PipeLensError::Config(format!("Invalid {kind} filter '{p}': {e}")))
        })
        .transpose()
}
