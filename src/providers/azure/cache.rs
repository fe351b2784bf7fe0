use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use log::info;

use super::client::pipelines::{PipelineListDto, ProjectListDto, RunDetailDto, RunDto};
use super::filters::Fingerprint;
use crate::insights::DashboardReport;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone)]
pub struct CachedReport {
    pub report: DashboardReport,
    pub stored_at: DateTime<Utc>,
}

struct ReportEntry {
    base: Fingerprint,
    cached: CachedReport,
}

struct RunListEntry {
    base: Fingerprint,
    stored_at: DateTime<Utc>,
    runs: Vec<RunDto>,
}

struct DetailEntry {
    stored_at: DateTime<Utc>,
    detail: RunDetailDto,
}

#[derive(Default)]
struct CacheState {
    pipelines: HashMap<String, PipelineListDto>,
    runs: HashMap<(String, u64), RunListEntry>,
    run_details: HashMap<(String, u64, u64), DetailEntry>,
    reports: HashMap<Fingerprint, ReportEntry>,
    projects: Option<ProjectListDto>,
}

/// Process-wide cache shared by every aggregation call.
///
/// Reports, run lists and failure details expire after one shared TTL. The pipeline
/// list is reused for as long as it is present and the project list until [`reset`].
///
/// [`reset`]: CacheStore::reset
pub struct CacheStore {
    clock: Arc<dyn Clock>,
    ttl: Duration,
    state: Mutex<CacheState>,
    flights: Mutex<HashMap<Fingerprint, Arc<tokio::sync::Mutex<()>>>>,
}

impl CacheStore {
    pub fn new(clock: Arc<dyn Clock>, ttl_minutes: i64) -> Self {
        Self {
            clock,
            ttl: Duration::minutes(ttl_minutes),
            state: Mutex::new(CacheState::default()),
            flights: Mutex::new(HashMap::new()),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_fresh(&self, stored_at: DateTime<Utc>) -> bool {
        self.now() - stored_at < self.ttl
    }

    pub fn lookup(&self, base: &Fingerprint, full: &Fingerprint) -> Option<CachedReport> {
        let state = self.state();
        let entry = state.reports.get(full)?;
        (entry.base == *base && self.is_fresh(entry.cached.stored_at))
            .then(|| entry.cached.clone())
    }

    /// Stores a report and evicts every report that is no longer fresh.
    pub fn put(
        &self,
        base: &Fingerprint,
        full: &Fingerprint,
        report: DashboardReport,
    ) -> CachedReport {
        let now = self.now();
        let cached = CachedReport {
            report,
            stored_at: now,
        };

        let mut state = self.state();
        state
            .reports
            .retain(|_, entry| now - entry.cached.stored_at < self.ttl);
        state.reports.insert(
            full.clone(),
            ReportEntry {
                base: base.clone(),
                cached: cached.clone(),
            },
        );
        cached
    }

    pub fn get_pipeline_list(&self, project: &str) -> Option<PipelineListDto> {
        self.state().pipelines.get(project).cloned()
    }

    pub fn put_pipeline_list(&self, project: &str, pipelines: PipelineListDto) {
        self.state().pipelines.insert(project.to_string(), pipelines);
    }

    pub fn get_runs_for(
        &self,
        project: &str,
        pipeline_id: u64,
        base: &Fingerprint,
    ) -> Option<Vec<RunDto>> {
        let state = self.state();
        let entry = state.runs.get(&(project.to_string(), pipeline_id))?;
        (entry.base == *base && self.is_fresh(entry.stored_at)).then(|| entry.runs.clone())
    }

    pub fn put_runs_for(
        &self,
        project: &str,
        pipeline_id: u64,
        base: &Fingerprint,
        runs: Vec<RunDto>,
    ) {
        let entry = RunListEntry {
            base: base.clone(),
            stored_at: self.now(),
            runs,
        };
        self.state()
            .runs
            .insert((project.to_string(), pipeline_id), entry);
    }

    pub fn get_failure_detail(
        &self,
        project: &str,
        pipeline_id: u64,
        run_id: u64,
    ) -> Option<RunDetailDto> {
        let state = self.state();
        let entry = state
            .run_details
            .get(&(project.to_string(), pipeline_id, run_id))?;
        self.is_fresh(entry.stored_at).then(|| entry.detail.clone())
    }

    pub fn put_failure_detail(
        &self,
        project: &str,
        pipeline_id: u64,
        run_id: u64,
        detail: RunDetailDto,
    ) {
        let now = self.now();
        let entry = DetailEntry {
            stored_at: now,
            detail,
        };

        let mut state = self.state();
        state
            .run_details
            .retain(|_, entry| now - entry.stored_at < self.ttl);
        state
            .run_details
            .insert((project.to_string(), pipeline_id, run_id), entry);
    }

    pub fn get_projects(&self) -> Option<ProjectListDto> {
        self.state().projects.clone()
    }

    pub fn put_projects(&self, projects: ProjectListDto) {
        self.state().projects = Some(projects);
    }

    /// Lock that serialises concurrent misses for the same report fingerprint.
    pub fn flight(&self, full: &Fingerprint) -> Arc<tokio::sync::Mutex<()>> {
        let mut flights = self.flights.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(flights.entry(full.clone()).or_default())
    }

    /// Hands back a lock obtained from [`flight`]. The entry is dropped once no other
    /// caller holds it.
    ///
    /// [`flight`]: CacheStore::flight
    pub fn end_flight(&self, full: &Fingerprint, flight: Arc<tokio::sync::Mutex<()>>) {
        let mut flights = self.flights.lock().unwrap_or_else(PoisonError::into_inner);
        let unshared = flights
            .get(full)
            .is_some_and(|held| Arc::ptr_eq(held, &flight) && Arc::strong_count(&flight) == 2);
        if unshared {
            flights.remove(full);
        }
    }

    #[cfg(test)]
    pub(crate) fn report_count(&self) -> usize {
        self.state().reports.len()
    }

    #[cfg(test)]
    pub(crate) fn flight_count(&self) -> usize {
        self.flights
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Drops every cached entry.
    pub fn reset(&self) {
        *self.state() = CacheState::default();
        info!("Cache cleared");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::insights::{Progress, Totals};
    use indexmap::IndexMap;

    pub struct FixedClock(Mutex<DateTime<Utc>>);

    impl FixedClock {
        pub fn at(now: DateTime<Utc>) -> Arc<Self> {
            Arc::new(Self(Mutex::new(now)))
        }

        pub fn advance(&self, by: Duration) {
            let mut now = self.0.lock().unwrap();
            *now += by;
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    fn start() -> DateTime<Utc> {
        "2024-06-15T12:00:00Z".parse().unwrap()
    }

    fn fp(n: u64) -> Fingerprint {
        use super::super::filters::{DashboardParams, Filters};
        let params = DashboardParams {
            days: Some(u32::try_from(n).unwrap()),
            ..DashboardParams::default()
        };
        Filters::resolve(&params, "Web").unwrap().base
    }

    fn report() -> DashboardReport {
        DashboardReport {
            project: "Web".to_string(),
            days: 30,
            totals: Totals::default(),
            stage_failures: IndexMap::new(),
            pipeline_stats: IndexMap::new(),
            failed_pipelines: vec![],
            all_pipelines: vec![],
            execution_times: vec![],
            execution_stats: None,
            progress: Progress::default(),
        }
    }

    fn runs() -> Vec<RunDto> {
        serde_json::from_str(r#"[{"id":1,"result":"succeeded"}]"#).unwrap()
    }

    #[test]
    fn test_report_hit_within_ttl() {
        let clock = FixedClock::at(start());
        let cache = CacheStore::new(clock.clone(), 15);
        cache.put(&fp(1), &fp(2), report());

        clock.advance(Duration::minutes(14));

        assert!(cache.lookup(&fp(1), &fp(2)).is_some());
    }

    #[test]
    fn test_report_expires_at_ttl() {
        let clock = FixedClock::at(start());
        let cache = CacheStore::new(clock.clone(), 15);
        cache.put(&fp(1), &fp(2), report());

        clock.advance(Duration::minutes(15));

        assert!(cache.lookup(&fp(1), &fp(2)).is_none());
    }

    #[test]
    fn test_report_requires_matching_fingerprints() {
        let cache = CacheStore::new(FixedClock::at(start()), 15);
        cache.put(&fp(1), &fp(2), report());

        assert!(cache.lookup(&fp(1), &fp(3)).is_none());
        assert!(cache.lookup(&fp(4), &fp(2)).is_none());
    }

    #[test]
    fn test_runs_reuse_requires_same_base() {
        let cache = CacheStore::new(FixedClock::at(start()), 15);
        cache.put_runs_for("Web", 7, &fp(1), runs());

        assert_eq!(cache.get_runs_for("Web", 7, &fp(1)).unwrap().len(), 1);
        assert!(cache.get_runs_for("Web", 7, &fp(2)).is_none());
        assert!(cache.get_runs_for("Api", 7, &fp(1)).is_none());
    }

    #[test]
    fn test_runs_expire() {
        let clock = FixedClock::at(start());
        let cache = CacheStore::new(clock.clone(), 15);
        cache.put_runs_for("Web", 7, &fp(1), runs());

        clock.advance(Duration::minutes(16));

        assert!(cache.get_runs_for("Web", 7, &fp(1)).is_none());
    }

    #[test]
    fn test_pipeline_list_has_no_ttl() {
        let clock = FixedClock::at(start());
        let cache = CacheStore::new(clock.clone(), 15);
        cache.put_pipeline_list("Web", PipelineListDto { value: vec![] });

        clock.advance(Duration::days(2));

        assert!(cache.get_pipeline_list("Web").is_some());
        assert!(cache.get_pipeline_list("Api").is_none());
    }

    #[test]
    fn test_failure_detail_roundtrip_and_expiry() {
        let clock = FixedClock::at(start());
        let cache = CacheStore::new(clock.clone(), 15);
        cache.put_failure_detail("Web", 1, 2, RunDetailDto { stages: None });

        assert!(cache.get_failure_detail("Web", 1, 2).is_some());
        assert!(cache.get_failure_detail("Web", 1, 3).is_none());

        clock.advance(Duration::minutes(20));
        assert!(cache.get_failure_detail("Web", 1, 2).is_none());
    }

    #[test]
    fn test_reset_clears_everything() {
        let cache = CacheStore::new(FixedClock::at(start()), 15);
        cache.put(&fp(1), &fp(2), report());
        cache.put_pipeline_list("Web", PipelineListDto { value: vec![] });
        cache.put_runs_for("Web", 7, &fp(1), runs());
        cache.put_failure_detail("Web", 1, 2, RunDetailDto { stages: None });
        cache.put_projects(ProjectListDto {
            count: 0,
            value: vec![],
        });

        cache.reset();

        assert!(cache.lookup(&fp(1), &fp(2)).is_none());
        assert!(cache.get_pipeline_list("Web").is_none());
        assert!(cache.get_runs_for("Web", 7, &fp(1)).is_none());
        assert!(cache.get_failure_detail("Web", 1, 2).is_none());
        assert!(cache.get_projects().is_none());
    }

    #[test]
    fn test_put_evicts_expired_reports() {
        let clock = FixedClock::at(start());
        let cache = CacheStore::new(clock.clone(), 15);

        for days in 1..=20 {
            cache.put(&fp(days), &fp(days), report());
            clock.advance(Duration::minutes(30));
        }
        cache.put(&fp(21), &fp(21), report());

        assert_eq!(cache.report_count(), 1);
        assert!(cache.lookup(&fp(21), &fp(21)).is_some());
    }

    #[test]
    fn test_put_keeps_fresh_reports() {
        let clock = FixedClock::at(start());
        let cache = CacheStore::new(clock.clone(), 15);
        cache.put(&fp(1), &fp(1), report());
        clock.advance(Duration::minutes(5));
        cache.put(&fp(2), &fp(2), report());

        assert!(cache.lookup(&fp(1), &fp(1)).is_some());
        assert!(cache.lookup(&fp(2), &fp(2)).is_some());
    }

    #[test]
    fn test_failure_details_evicted_when_expired() {
        let clock = FixedClock::at(start());
        let cache = CacheStore::new(clock.clone(), 15);
        cache.put_failure_detail("Web", 1, 2, RunDetailDto { stages: None });
        clock.advance(Duration::minutes(20));
        cache.put_failure_detail("Web", 1, 3, RunDetailDto { stages: None });

        assert_eq!(cache.state().run_details.len(), 1);
    }

    #[test]
    fn test_end_flight_releases_unshared_lock() {
        let cache = CacheStore::new(FixedClock::at(start()), 15);

        for days in 1..=50 {
            let flight = cache.flight(&fp(days));
            cache.end_flight(&fp(days), flight);
        }

        assert_eq!(cache.flight_count(), 0);
    }

    #[test]
    fn test_end_flight_keeps_lock_with_waiters() {
        let cache = CacheStore::new(FixedClock::at(start()), 15);
        let first = cache.flight(&fp(1));
        let waiter = cache.flight(&fp(1));

        cache.end_flight(&fp(1), first);
        assert_eq!(cache.flight_count(), 1);

        cache.end_flight(&fp(1), waiter);
        assert_eq!(cache.flight_count(), 0);
    }

    #[test]
    fn test_flight_is_shared_per_fingerprint() {
        let cache = CacheStore::new(FixedClock::at(start()), 15);

        let a = cache.flight(&fp(1));
        let b = cache.flight(&fp(1));
        let c = cache.flight(&fp(2));

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
