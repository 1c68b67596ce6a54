//! Job definitions as they appear under `schedule:` in configuration.
//!
//! The temporal fields are kept close to their configured shape (strings and
//! raw JSON for windows) so that a malformed job still deserializes and can be
//! reported per-job by the scheduler instead of failing the whole config load.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Format used to parse `once` when the job does not set `once_fmt`.
pub const DEFAULT_ONCE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// A configured job. The table key is the job name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Opaque reference into the function registry.
    #[serde(alias = "func", alias = "fun")]
    pub function: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub kwargs: Map<String, Value>,
    #[serde(default = "bool_true")]
    pub enabled: bool,

    // Interval rule: all present fields are summed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minutes: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hours: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub once: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub once_fmt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<WhenSpec>,

    /// Blackout window `{start, end}`. Raw so a non-mapping value is reportable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_during_range: Option<Value>,
    /// Run only inside `{start, end}` (or outside it with `invert: true`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,

    /// Executor-side delay bucketed by node identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub splaytime: Option<i64>,
    /// Random offset added to each due occurrence before it fires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub splay: Option<SplaySpec>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub run_on_start: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub run_after_skip_range: bool,

    /// Cap on runs of this job in flight on one node. Extra runs are dropped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maxrunning: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<ConcurrencySpec>,
}

/// One label or a list of labels resolved through the `whens` lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WhenSpec {
    One(String),
    Many(Vec<String>),
}

impl WhenSpec {
    pub fn labels(&self) -> Vec<&str> {
        match self {
            WhenSpec::One(label) => vec![label.as_str()],
            WhenSpec::Many(labels) => labels.iter().map(String::as_str).collect(),
        }
    }
}

/// Job-level `splay`: `n` draws from `1..=n` seconds (`0` disables it), a
/// table from `start..=end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SplaySpec {
    Upto(u64),
    Between { start: u64, end: u64 },
}

impl SplaySpec {
    /// Inclusive bounds in seconds, `None` when `end < start`.
    pub fn bounds(&self) -> Option<(u64, u64)> {
        match *self {
            SplaySpec::Upto(0) => Some((0, 0)),
            SplaySpec::Upto(n) => Some((1, n)),
            SplaySpec::Between { start, end } => (end >= start).then_some((start, end)),
        }
    }
}

/// Governor admission settings for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcurrencySpec {
    /// Coordination path; defaults to `<lock_root>/<job name>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub max: u32,
    /// `None` waits forever, `0` is a single attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<f64>,
}

impl JobSpec {
    pub fn new(function: &str) -> Self {
        Self {
            function: function.to_string(),
            args: Vec::new(),
            kwargs: Map::new(),
            enabled: true,
            seconds: None,
            minutes: None,
            hours: None,
            days: None,
            cron: None,
            once: None,
            once_fmt: None,
            when: None,
            skip_during_range: None,
            range: None,
            until: None,
            after: None,
            splaytime: None,
            splay: None,
            run_on_start: false,
            run_after_skip_range: false,
            maxrunning: None,
            concurrency: None,
        }
    }

    pub fn every_seconds(mut self, seconds: i64) -> Self {
        self.seconds = Some(seconds);
        self
    }

    pub fn with_cron(mut self, expression: &str) -> Self {
        self.cron = Some(expression.to_string());
        self
    }

    pub fn with_once(mut self, at: &str) -> Self {
        self.once = Some(at.to_string());
        self
    }

    pub fn with_when(mut self, when: WhenSpec) -> Self {
        self.when = Some(when);
        self
    }

    pub fn with_skip_during_range(mut self, window: Value) -> Self {
        self.skip_during_range = Some(window);
        self
    }

    pub fn with_splaytime(mut self, splaytime: i64) -> Self {
        self.splaytime = Some(splaytime);
        self
    }

    /// Sum of the interval fields in seconds, `None` when none is set.
    pub fn interval_secs(&self) -> Option<i64> {
        let parts = [
            (self.seconds, 1),
            (self.minutes, 60),
            (self.hours, 3_600),
            (self.days, 86_400),
        ];
        if parts.iter().all(|(v, _)| v.is_none()) {
            return None;
        }
        Some(
            parts
                .iter()
                .map(|(v, mult)| v.unwrap_or(0).saturating_mul(*mult))
                .fold(0i64, i64::saturating_add),
        )
    }

    /// True when both specs describe the same primary temporal rule.
    pub fn same_rule(&self, other: &JobSpec) -> bool {
        self.interval_secs() == other.interval_secs()
            && self.cron == other.cron
            && self.once == other.once
            && self.once_fmt == other.once_fmt
            && self.when == other.when
    }
}

fn bool_true() -> bool {
    true
}

fn is_false(b: &bool) -> bool {
    !*b
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn interval_fields_are_summed() {
        let spec: JobSpec = serde_json::from_value(json!({
            "function": "test.ping",
            "minutes": 1,
            "seconds": 30
        }))
        .unwrap();
        assert_eq!(spec.interval_secs(), Some(90));
        assert!(spec.enabled);
    }

    #[test]
    fn function_aliases_accepted() {
        let spec: JobSpec =
            serde_json::from_value(json!({"fun": "state.apply", "cron": "* * * * *"})).unwrap();
        assert_eq!(spec.function, "state.apply");
        assert_eq!(spec.interval_secs(), None);
    }

    #[test]
    fn when_accepts_list_or_single() {
        let one: WhenSpec = serde_json::from_value(json!("deploy")).unwrap();
        let many: WhenSpec = serde_json::from_value(json!(["a", "b"])).unwrap();
        assert_eq!(one.labels(), vec!["deploy"]);
        assert_eq!(many.labels(), vec!["a", "b"]);
    }

    #[test]
    fn malformed_window_still_deserializes() {
        let spec: JobSpec = serde_json::from_value(json!({
            "function": "test.ping",
            "seconds": 10,
            "skip_during_range": ["1:00pm", "2:00pm"]
        }))
        .unwrap();
        assert!(spec.skip_during_range.unwrap().is_array());
    }

    #[test]
    fn maxrunning_and_concurrency_are_independent() {
        let spec: JobSpec = serde_json::from_value(json!({
            "function": "test.ping",
            "seconds": 5,
            "maxrunning": 2,
            "concurrency": {"max": 1, "path": "/locks/shared"}
        }))
        .unwrap();
        assert_eq!(spec.maxrunning, Some(2));
        let limit = spec.concurrency.unwrap();
        assert_eq!(limit.max, 1);
        assert_eq!(limit.timeout_secs, None);
    }

    #[test]
    fn splay_accepts_count_or_bounds() {
        let upto: SplaySpec = serde_json::from_value(json!(30)).unwrap();
        let between: SplaySpec = serde_json::from_value(json!({"start": 10, "end": 20})).unwrap();
        let reversed: SplaySpec = serde_json::from_value(json!({"start": 20, "end": 10})).unwrap();
        assert_eq!(upto.bounds(), Some((1, 30)));
        assert_eq!(between.bounds(), Some((10, 20)));
        assert_eq!(reversed.bounds(), None);
    }

    #[test]
    fn same_rule_ignores_non_temporal_fields() {
        let a = JobSpec::new("a").with_cron("0 * * * *");
        let mut b = JobSpec::new("b").with_cron("0 * * * *");
        b.splaytime = Some(30);
        assert!(a.same_rule(&b));
        assert!(!a.same_rule(&JobSpec::new("a").with_cron("5 * * * *")));
    }
}
