use chrono::{DateTime, Utc};
use jobgate_core::job::{ConcurrencySpec, JobSpec};
use jobgate_core::types::DispatchId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::JobError;

/// Mutable run-state of one job. Survives spec edits via `replace`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobRunState {
    /// Instant of the most recent dispatch.
    pub last_run: Option<DateTime<Utc>>,
    pub run_count: u64,
    /// Validation error from the latest evaluation, if any.
    pub error: Option<String>,
    /// Next planned fire instant. Doubles as the cron cache.
    pub next_fire_time: Option<DateTime<Utc>>,
    /// `once`/`when` instants that have already fired or been skipped.
    #[serde(default)]
    pub consumed: Vec<DateTime<Utc>>,
    /// Set after the first clean evaluation; gates `run_on_start`.
    #[serde(default)]
    pub started: bool,
    /// A catch-up run is owed once the blackout window ends.
    #[serde(default)]
    pub pending_after_skip: bool,
    /// Instants at which a due occurrence is skipped.
    #[serde(default)]
    pub skip_explicit: Vec<DateTime<Utc>>,
    /// One-off extra runs, fired at the first tick at or after each instant.
    #[serde(default)]
    pub run_explicit: Vec<DateTime<Utc>>,
    /// Occurrence held back by the job-level `splay` until this instant.
    #[serde(default)]
    pub splay_until: Option<DateTime<Utc>>,
}

impl JobRunState {
    /// Forget rule-derived bookkeeping after the temporal rule changed.
    pub fn reset_rule(&mut self) {
        self.next_fire_time = None;
        self.consumed.clear();
        self.pending_after_skip = false;
        self.splay_until = None;
    }

    /// Store the result of one evaluation. `error` is always overwritten.
    pub fn apply(&mut self, eval: &Evaluation) {
        self.error = eval.error.as_ref().map(ToString::to_string);
        if eval.error.is_some() {
            return;
        }
        self.next_fire_time = eval.next_fire;
        if let Some(consumed) = &eval.consumed {
            self.consumed = consumed.clone();
        }
        self.pending_after_skip = eval.pending_after_skip;
        self.skip_explicit = eval.skip_explicit.clone();
        self.run_explicit = eval.run_explicit.clone();
        self.splay_until = eval.splay_until;
        self.started = true;
    }

    pub fn record_run(&mut self, at: DateTime<Utc>) {
        self.last_run = Some(at);
        self.run_count += 1;
    }
}

/// Why a due job was held back without being marked erroneous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Suppression {
    /// Inside `skip_during_range`.
    Blackout,
    /// Outside the job's `range` (or inside it when inverted).
    OutOfRange,
    /// Matched an explicit skip instant.
    Skipped,
}

/// What made a job due.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Rule,
    OnStart,
    AfterBlackout,
    /// A `run_explicit` instant came due.
    Explicit,
}

/// Output of the temporal rule evaluator for one job at one instant.
///
/// `next_fire`, `consumed` and `pending_after_skip` describe the run-state
/// *after* this tick: a due or suppressed occurrence counts as consumed.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub due: bool,
    pub error: Option<JobError>,
    pub next_fire: Option<DateTime<Utc>>,
    pub suppressed: Option<Suppression>,
    pub trigger: Option<Trigger>,
    /// Replacement consumed-instant set; `None` leaves it unchanged.
    pub consumed: Option<Vec<DateTime<Utc>>>,
    pub pending_after_skip: bool,
    /// Explicit skip/run instants still outstanding after this tick.
    pub skip_explicit: Vec<DateTime<Utc>>,
    pub run_explicit: Vec<DateTime<Utc>>,
    pub splay_until: Option<DateTime<Utc>>,
}

impl Evaluation {
    pub fn errored(error: JobError) -> Self {
        Self {
            due: false,
            error: Some(error),
            next_fire: None,
            suppressed: None,
            trigger: None,
            consumed: None,
            pending_after_skip: false,
            skip_explicit: Vec::new(),
            run_explicit: Vec::new(),
            splay_until: None,
        }
    }

    /// Not due, nothing changes.
    pub fn idle(state: &JobRunState) -> Self {
        Self {
            due: false,
            error: None,
            next_fire: state.next_fire_time,
            suppressed: None,
            trigger: None,
            consumed: None,
            pending_after_skip: state.pending_after_skip,
            skip_explicit: state.skip_explicit.clone(),
            run_explicit: state.run_explicit.clone(),
            splay_until: state.splay_until,
        }
    }
}

/// Introspection view returned by `status(name)`.
///
/// Serializes as the job's spec fields plus underscore-prefixed run-state.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub name: String,
    #[serde(flatten)]
    pub spec: JobSpec,
    #[serde(rename = "_last_run")]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(rename = "_run_count")]
    pub run_count: u64,
    #[serde(rename = "_next_fire_time")]
    pub next_fire_time: Option<DateTime<Utc>>,
    #[serde(rename = "_error", skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skip_explicit: Vec<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub run_explicit: Vec<DateTime<Utc>>,
}

impl JobStatus {
    pub fn new(name: &str, spec: &JobSpec, state: &JobRunState) -> Self {
        Self {
            name: name.to_string(),
            spec: spec.clone(),
            last_run: state.last_run,
            run_count: state.run_count,
            next_fire_time: state.next_fire_time,
            error: state.error.clone(),
            skip_explicit: state.skip_explicit.clone(),
            run_explicit: state.run_explicit.clone(),
        }
    }
}

/// Summary of one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub fired: Vec<String>,
    pub errored: Vec<String>,
    pub suppressed: Vec<String>,
}

/// Everything a dispatch unit needs to run one job once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub jid: DispatchId,
    pub job: String,
    pub function: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub fire_time: DateTime<Utc>,
    pub splaytime: Option<i64>,
    /// Per-node cap on concurrent runs of this job.
    #[serde(default)]
    pub maxrunning: Option<u32>,
    pub concurrency: Option<ConcurrencySpec>,
}

impl DispatchRequest {
    pub fn new(job: &str, spec: &JobSpec, fire_time: DateTime<Utc>) -> Self {
        Self {
            jid: DispatchId::new(),
            job: job.to_string(),
            function: spec.function.clone(),
            args: spec.args.clone(),
            kwargs: spec.kwargs.clone(),
            fire_time,
            splaytime: spec.splaytime,
            maxrunning: spec.maxrunning,
            concurrency: spec.concurrency.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn status_serializes_with_underscore_fields() {
        let spec = JobSpec::new("test.ping").every_seconds(60);
        let state = JobRunState {
            error: Some("invalid cron string, ignoring job x".to_string()),
            run_count: 2,
            ..JobRunState::default()
        };
        let json = serde_json::to_value(JobStatus::new("x", &spec, &state)).unwrap();
        assert_eq!(json["function"], "test.ping");
        assert_eq!(json["seconds"], 60);
        assert_eq!(json["_run_count"], 2);
        assert_eq!(json["_error"], "invalid cron string, ignoring job x");
    }

    #[test]
    fn status_omits_error_when_clean() {
        let spec = JobSpec::new("test.ping").every_seconds(60);
        let json =
            serde_json::to_value(JobStatus::new("x", &spec, &JobRunState::default())).unwrap();
        assert!(json.get("_error").is_none());
    }

    #[test]
    fn error_evaluation_keeps_bookkeeping() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut state = JobRunState {
            next_fire_time: Some(at),
            consumed: vec![at],
            ..JobRunState::default()
        };
        state.apply(&Evaluation::errored(JobError::ConfigValidation("bad".into())));
        assert_eq!(state.error.as_deref(), Some("bad"));
        assert_eq!(state.next_fire_time, Some(at));
        assert_eq!(state.consumed, vec![at]);

        state.apply(&Evaluation::idle(&state.clone()));
        assert!(state.error.is_none());
    }
}
