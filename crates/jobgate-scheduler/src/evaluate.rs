//! Temporal rule evaluation: (now, spec, run-state) → due / error / next fire.
//!
//! Pure with respect to the job: nothing here mutates run-state. The returned
//! [`Evaluation`] carries the post-tick bookkeeping for the caller to store.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use jobgate_core::config::DEFAULT_LOOP_INTERVAL_SECS;
use jobgate_core::job::{JobSpec, WhenSpec, DEFAULT_ONCE_FORMAT};
use rand::Rng;
use serde_json::Value;

use crate::datetime::{parse_flexible, parse_with_format, FLEXIBLE_FORMATS};
use crate::error::JobError;
use crate::types::{Evaluation, JobRunState, Suppression, Trigger};

/// Largest accepted interval (100 years).
const MAX_INTERVAL_SECS: i64 = 100 * 365 * 86_400;

/// Inputs shared by every job in one tick.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    pub now: DateTime<Utc>,
    /// Label → timestamp lookup for `when` jobs.
    pub whens: Option<&'a Value>,
    /// Table-wide blackout inherited by jobs without their own.
    pub skip_during_range: Option<&'a Value>,
    /// How long after its instant an explicit skip still applies. One loop
    /// interval, so some tick always lands inside it.
    pub tolerance: Duration,
}

impl<'a> EvalContext<'a> {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now,
            whens: None,
            skip_during_range: None,
            tolerance: Duration::seconds(DEFAULT_LOOP_INTERVAL_SECS as i64),
        }
    }
}

/// Primary temporal rule after validation.
enum Rule {
    Interval(Duration),
    Cron(Box<Schedule>),
    Once(DateTime<Utc>),
    /// Sorted, de-duplicated instants.
    When(Vec<DateTime<Utc>>),
}

#[derive(Debug, Clone, Copy)]
struct Window {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    invert: bool,
}

impl Window {
    /// Blackout membership: `[start, end)`.
    fn contains(&self, now: DateTime<Utc>) -> bool {
        self.start <= now && now < self.end
    }

    /// `range` admission: inside `[start, end]`, or outside it when inverted.
    fn allows(&self, now: DateTime<Utc>) -> bool {
        if self.invert {
            now <= self.start || now >= self.end
        } else {
            self.start <= now && now <= self.end
        }
    }
}

/// Evaluate one job. Validation failures come back as `Evaluation.error`.
pub fn evaluate(
    name: &str,
    spec: &JobSpec,
    state: &JobRunState,
    ctx: &EvalContext<'_>,
) -> Evaluation {
    evaluate_job(name, spec, state, ctx).unwrap_or_else(Evaluation::errored)
}

fn evaluate_job(
    name: &str,
    spec: &JobSpec,
    state: &JobRunState,
    ctx: &EvalContext<'_>,
) -> Result<Evaluation, JobError> {
    let now = ctx.now;

    if let Some(until) = spec.until.as_deref() {
        if now >= parse_bound(until, "until", name, now)? {
            return Ok(Evaluation::idle(state));
        }
    }
    if let Some(after) = spec.after.as_deref() {
        if now <= parse_bound(after, "after", name, now)? {
            return Ok(Evaluation::idle(state));
        }
    }

    let rule = resolve_rule(name, spec, ctx)?;
    // Windows are validated on every tick so a bad one is reported even
    // while the job is not due.
    let range = resolve_window(spec.range.as_ref(), "range", name, now)?;
    let blackout = resolve_window(
        spec.skip_during_range.as_ref().or(ctx.skip_during_range),
        "skip_during_range",
        name,
        now,
    )?;

    let splay = resolve_splay(spec, name)?;

    let pending = pending_fire(&rule, state, now);
    let on_start = spec.run_on_start && !state.started;

    // Job-level splay holds a due occurrence back until a random offset past it.
    let held_until = match splay {
        Some(bounds) if pending.is_some_and(|t| t <= now) => state
            .splay_until
            .or_else(|| pending.and_then(|t| splay_target(t, bounds)))
            .filter(|until| now < *until),
        _ => None,
    };
    let rule_due = pending.is_some_and(|t| t <= now) && held_until.is_none();
    let in_blackout = blackout.is_some_and(|w| w.contains(now));
    let catch_up = state.pending_after_skip && !in_blackout;

    let skip_explicit: Vec<_> = state
        .skip_explicit
        .iter()
        .filter(|at| at.checked_add_signed(ctx.tolerance).map_or(true, |end| now <= end))
        .copied()
        .collect();
    let skip_hit = skip_explicit.iter().any(|at| *at <= now);
    let explicit_due = state.run_explicit.iter().any(|at| *at <= now);

    let (due, suppressed, trigger) = if on_start {
        (true, None, Some(Trigger::OnStart))
    } else if rule_due || catch_up || explicit_due {
        let trigger = if rule_due {
            Trigger::Rule
        } else if catch_up {
            Trigger::AfterBlackout
        } else {
            Trigger::Explicit
        };
        if range.is_some_and(|r| !r.allows(now)) {
            (false, Some(Suppression::OutOfRange), Some(trigger))
        } else if in_blackout {
            (false, Some(Suppression::Blackout), Some(trigger))
        } else if skip_hit && !explicit_due {
            (false, Some(Suppression::Skipped), Some(trigger))
        } else {
            (true, None, Some(trigger))
        }
    } else {
        (false, None, None)
    };

    let skipped = suppressed == Some(Suppression::Skipped);
    // A due occurrence is used up whether it ran or was held back.
    let consume = rule_due && (due || suppressed.is_some());
    let (next_fire, consumed) = settle(&rule, state, now, pending, consume, due || skipped);

    let pending_after_skip = if due || skipped {
        false
    } else if suppressed == Some(Suppression::Blackout) && spec.run_after_skip_range {
        true
    } else {
        state.pending_after_skip
    };

    let skip_explicit = if skipped {
        skip_explicit.into_iter().filter(|at| *at > now).collect()
    } else {
        skip_explicit
    };
    let run_explicit = if explicit_due && (due || suppressed.is_some()) {
        state.run_explicit.iter().filter(|at| **at > now).copied().collect()
    } else {
        state.run_explicit.clone()
    };

    Ok(Evaluation {
        due,
        error: None,
        next_fire,
        suppressed,
        trigger,
        consumed,
        pending_after_skip,
        skip_explicit,
        run_explicit,
        splay_until: held_until,
    })
}

fn resolve_splay(spec: &JobSpec, name: &str) -> Result<Option<(u64, u64)>, JobError> {
    match spec.splay {
        None => Ok(None),
        Some(splay) => splay.bounds().map(Some).ok_or_else(|| {
            JobError::RangeOrder(format!(
                "invalid splay, end must be larger than start. Ignoring job {name}."
            ))
        }),
    }
}

/// `at` plus a random offset drawn from `bounds`, in seconds.
fn splay_target(at: DateTime<Utc>, (lo, hi): (u64, u64)) -> Option<DateTime<Utc>> {
    let offset = rand::thread_rng().gen_range(lo..=hi);
    let offset = Duration::try_seconds(i64::try_from(offset).ok()?)?;
    at.checked_add_signed(offset)
}

fn resolve_rule(name: &str, spec: &JobSpec, ctx: &EvalContext<'_>) -> Result<Rule, JobError> {
    let interval = spec.interval_secs();
    let primaries = [spec.cron.is_some(), spec.once.is_some(), spec.when.is_some()]
        .into_iter()
        .filter(|set| *set)
        .count();

    if primaries > 1 {
        return Err(JobError::ConfigValidation(format!(
            "unable to use \"when\", \"cron\", \"once\" options together. Ignoring job {name}."
        )));
    }
    if primaries == 1 && interval.is_some() {
        return Err(JobError::ConfigValidation(format!(
            "unable to use \"seconds\", \"minutes\", \"hours\", \"days\" with \"when\", \"cron\", \"once\" options. Ignoring job {name}."
        )));
    }

    if let Some(secs) = interval {
        if secs <= 0 {
            return Err(JobError::ConfigValidation(format!(
                "interval must be positive, got {secs}s. Ignoring job {name}."
            )));
        }
        if secs > MAX_INTERVAL_SECS {
            return Err(JobError::ConfigValidation(format!(
                "interval of {secs}s is too large. Ignoring job {name}."
            )));
        }
        return Ok(Rule::Interval(Duration::seconds(secs)));
    }

    if let Some(expr) = spec.cron.as_deref() {
        return Schedule::from_str(&normalize_cron(expr))
            .map(|schedule| Rule::Cron(Box::new(schedule)))
            .map_err(|_| {
                JobError::ConfigValidation(format!("invalid cron string, ignoring job {name}"))
            });
    }

    if let Some(once) = spec.once.as_deref() {
        let format = spec.once_fmt.as_deref().unwrap_or(DEFAULT_ONCE_FORMAT);
        return parse_with_format(once, format)
            .map(Rule::Once)
            .ok_or_else(|| {
                JobError::ConfigValidation(format!(
                    "date string could not be parsed: {once}, {format}. Ignoring job {name}."
                ))
            });
    }

    if let Some(when) = spec.when.as_ref() {
        return resolve_when(name, when, ctx).map(Rule::When);
    }

    Err(JobError::ConfigValidation(format!(
        "no schedule rule configured. Ignoring job {name}."
    )))
}

/// The cron crate wants a leading seconds field; plain 5-field expressions get `0`.
fn normalize_cron(expr: &str) -> String {
    let trimmed = expr.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    }
}

fn resolve_when(
    name: &str,
    when: &WhenSpec,
    ctx: &EvalContext<'_>,
) -> Result<Vec<DateTime<Utc>>, JobError> {
    let lookup = match ctx.whens {
        None | Some(Value::Null) => None,
        Some(Value::Object(map)) => Some(map),
        Some(_) => {
            return Err(JobError::TypeMismatch(format!(
                "grain 'whens' must be a dict. Ignoring job {name}."
            )))
        }
    };

    let mut instants = Vec::new();
    for label in when.labels() {
        // Labels missing from the lookup are taken as literal dates.
        let raw = match lookup.and_then(|map| map.get(label)) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => label.to_string(),
        };
        let at = parse_flexible(&raw, ctx.now).ok_or_else(|| {
            JobError::ConfigValidation(format!(
                "date string could not be parsed: {raw}, {FLEXIBLE_FORMATS}. Ignoring job {name}."
            ))
        })?;
        instants.push(at);
    }
    instants.sort();
    instants.dedup();
    Ok(instants)
}

fn resolve_window(
    raw: Option<&Value>,
    key: &str,
    name: &str,
    now: DateTime<Utc>,
) -> Result<Option<Window>, JobError> {
    let map = match raw {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Object(map)) => map,
        Some(_) => {
            return Err(JobError::TypeMismatch(format!(
                "{key} must be specified as a dictionary. Ignoring job {name}."
            )))
        }
    };

    let bound = |which: &str| {
        map.get(which)
            .and_then(Value::as_str)
            .and_then(|s| parse_flexible(s, now))
            .ok_or_else(|| {
                JobError::ConfigValidation(format!(
                    "invalid date string for {which} in {key}. Ignoring job {name}."
                ))
            })
    };
    let start = bound("start")?;
    let end = bound("end")?;

    if end <= start {
        return Err(JobError::RangeOrder(format!(
            "invalid range, end must be larger than start. Ignoring job {name}."
        )));
    }

    Ok(Some(Window {
        start,
        end,
        invert: map.get("invert").and_then(Value::as_bool).unwrap_or(false),
    }))
}

fn parse_bound(
    value: &str,
    key: &str,
    name: &str,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, JobError> {
    parse_flexible(value, now).ok_or_else(|| {
        JobError::ConfigValidation(format!(
            "invalid date string for {key}. Ignoring job {name}."
        ))
    })
}

/// Earliest not-yet-consumed fire instant of the rule.
fn pending_fire(rule: &Rule, state: &JobRunState, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match rule {
        Rule::Interval(every) => state.next_fire_time.or_else(|| match state.last_run {
            None => Some(now),
            Some(last) => last.checked_add_signed(*every),
        }),
        Rule::Cron(schedule) => state
            .next_fire_time
            .or_else(|| schedule.after(&now).next()),
        Rule::Once(at) => (!state.consumed.contains(at)).then_some(*at),
        Rule::When(instants) => instants
            .iter()
            .find(|t| !state.consumed.contains(t))
            .copied(),
    }
}

/// Post-tick next fire instant and consumed set.
fn settle(
    rule: &Rule,
    state: &JobRunState,
    now: DateTime<Utc>,
    pending: Option<DateTime<Utc>>,
    consume: bool,
    advance: bool,
) -> (Option<DateTime<Utc>>, Option<Vec<DateTime<Utc>>>) {
    match rule {
        Rule::Interval(every) => {
            if advance {
                (now.checked_add_signed(*every), None)
            } else {
                (pending, None)
            }
        }
        Rule::Cron(schedule) => {
            if consume {
                (schedule.after(&now).next(), None)
            } else {
                (pending, None)
            }
        }
        Rule::Once(at) => {
            let consumed = if consume || state.consumed.contains(at) {
                vec![*at]
            } else {
                Vec::new()
            };
            let next = (!consumed.contains(at)).then_some(*at);
            (next, Some(consumed))
        }
        Rule::When(instants) => {
            // Drop instants no longer produced by the lookup.
            let mut consumed: Vec<_> = state
                .consumed
                .iter()
                .filter(|t| instants.contains(t))
                .copied()
                .collect();
            if consume {
                consumed.extend(pending);
            }
            consumed.sort();
            consumed.dedup();
            let next = instants.iter().find(|t| !consumed.contains(t)).copied();
            (next, Some(consumed))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn t(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, s).unwrap()
    }

    fn spec(value: Value) -> JobSpec {
        serde_json::from_value(value).unwrap()
    }

    fn eval_at(spec: &JobSpec, state: &JobRunState, now: DateTime<Utc>) -> Evaluation {
        evaluate("job", spec, state, &EvalContext::at(now))
    }

    #[test]
    fn interval_due_on_first_sight_then_after_period() {
        let s = spec(json!({"function": "f", "seconds": 60}));
        let mut state = JobRunState::default();

        let ev = eval_at(&s, &state, t(0, 0, 0));
        assert!(ev.due);
        assert_eq!(ev.next_fire, Some(t(0, 1, 0)));
        state.apply(&ev);
        state.record_run(t(0, 0, 0));

        assert!(!eval_at(&s, &state, t(0, 0, 59)).due);
        assert!(eval_at(&s, &state, t(0, 1, 0)).due);
    }

    #[test]
    fn non_positive_interval_is_an_error() {
        let s = spec(json!({"function": "f", "minutes": 0}));
        let ev = eval_at(&s, &JobRunState::default(), t(0, 0, 0));
        assert!(!ev.due);
        assert!(matches!(ev.error, Some(JobError::ConfigValidation(ref m)) if m.contains("positive")));
    }

    #[test]
    fn conflicting_rules_are_rejected() {
        let s = spec(json!({"function": "f", "cron": "* * * * *", "once": "2024-01-01T00:00:00"}));
        let ev = eval_at(&s, &JobRunState::default(), t(0, 0, 0));
        assert!(ev.error.unwrap().to_string().contains("together"));

        let s = spec(json!({"function": "f", "cron": "* * * * *", "seconds": 5}));
        let ev = eval_at(&s, &JobRunState::default(), t(0, 0, 0));
        assert!(ev.error.unwrap().to_string().contains("\"seconds\""));
    }

    #[test]
    fn missing_rule_is_rejected() {
        let s = spec(json!({"function": "f"}));
        let ev = eval_at(&s, &JobRunState::default(), t(0, 0, 0));
        assert!(ev.error.unwrap().to_string().contains("no schedule rule"));
    }

    #[test]
    fn invalid_cron_month() {
        let s = spec(json!({"function": "f", "cron": "0 16 29 13 *"}));
        let ev = eval_at(&s, &JobRunState::default(), t(0, 0, 0));
        assert!(!ev.due);
        assert_eq!(
            ev.error,
            Some(JobError::ConfigValidation(
                "invalid cron string, ignoring job job".to_string()
            ))
        );
    }

    #[test]
    fn cron_caches_and_advances() {
        let s = spec(json!({"function": "f", "cron": "*/5 * * * *"}));
        let mut state = JobRunState::default();

        let ev = eval_at(&s, &state, t(0, 1, 0));
        assert!(!ev.due);
        assert_eq!(ev.next_fire, Some(t(0, 5, 0)));
        state.apply(&ev);

        let ev = eval_at(&s, &state, t(0, 5, 0));
        assert!(ev.due);
        assert_eq!(ev.next_fire, Some(t(0, 10, 0)));
    }

    #[test]
    fn six_field_cron_passes_through() {
        assert_eq!(normalize_cron("0 */5 * * * *"), "0 */5 * * * *");
        assert_eq!(normalize_cron(" */5 * * * * "), "0 */5 * * * *");
    }

    #[test]
    fn once_parse_failure_names_value_and_format() {
        let s = spec(json!({"function": "f", "once": "2017-13-13T13:00:00"}));
        let ev = eval_at(&s, &JobRunState::default(), t(0, 0, 0));
        assert!(!ev.due);
        let msg = ev.error.unwrap().to_string();
        assert!(msg.contains("date string could not be parsed"));
        assert!(msg.contains("2017-13-13T13:00:00"));
        assert!(msg.contains("%Y-%m-%dT%H:%M:%S"));
    }

    #[test]
    fn once_custom_format() {
        let s = spec(json!({"function": "f", "once": "01/01/2024 06:00", "once_fmt": "%m/%d/%Y %H:%M"}));
        let ev = eval_at(&s, &JobRunState::default(), t(6, 0, 0));
        assert!(ev.due);
        assert_eq!(ev.consumed, Some(vec![t(6, 0, 0)]));
        assert_eq!(ev.next_fire, None);
    }

    #[test]
    fn whens_must_be_a_mapping() {
        let s = spec(json!({"function": "f", "when": "deploy"}));
        let whens = json!(["deploy"]);
        let ctx = EvalContext {
            whens: Some(&whens),
            ..EvalContext::at(t(0, 0, 0))
        };
        let ev = evaluate("job", &s, &JobRunState::default(), &ctx);
        assert!(matches!(ev.error, Some(JobError::TypeMismatch(ref m)) if m.contains("grain 'whens' must be a dict")));
    }

    #[test]
    fn when_list_fires_each_instant_once() {
        let s = spec(json!({"function": "f", "when": ["first", "second"]}));
        let whens = json!({"first": "2024-01-01T01:00:00", "second": "2024-01-01T02:00:00"});
        let mut state = JobRunState::default();

        for (now, due) in [
            (t(0, 30, 0), false),
            (t(1, 0, 0), true),
            (t(1, 30, 0), false),
            (t(2, 0, 5), true),
            (t(3, 0, 0), false),
        ] {
            let ctx = EvalContext {
                whens: Some(&whens),
                ..EvalContext::at(now)
            };
            let ev = evaluate("job", &s, &state, &ctx);
            assert_eq!(ev.due, due, "at {now}");
            state.apply(&ev);
        }
        assert_eq!(state.next_fire_time, None);
    }

    #[test]
    fn skip_window_errors() {
        let cases = [
            (json!({"start": "1:00pm", "end": "25:00pm"}), "invalid date string for end in skip_during_range"),
            (json!({"start": "1:00pm", "end": "12:00pm"}), "end must be larger than start"),
            (json!(["1:00pm", "2:00pm"]), "must be specified as a dictionary"),
            (json!({"end": "2:00pm"}), "invalid date string for start in skip_during_range"),
        ];
        for (window, expected) in cases {
            let s = spec(json!({"function": "f", "seconds": 60, "skip_during_range": window}));
            let ev = eval_at(&s, &JobRunState::default(), t(12, 0, 0));
            assert!(!ev.due);
            let msg = ev.error.expect("window error").to_string();
            assert!(msg.contains(expected), "{msg}");
        }
    }

    #[test]
    fn skip_window_error_kinds() {
        let s = spec(json!({"function": "f", "seconds": 60, "skip_during_range": {"start": "1:00pm", "end": "12:00pm"}}));
        assert!(matches!(
            eval_at(&s, &JobRunState::default(), t(12, 0, 0)).error,
            Some(JobError::RangeOrder(_))
        ));
        let s = spec(json!({"function": "f", "seconds": 60, "skip_during_range": "1pm-2pm"}));
        assert!(matches!(
            eval_at(&s, &JobRunState::default(), t(12, 0, 0)).error,
            Some(JobError::TypeMismatch(_))
        ));
    }

    #[test]
    fn blackout_suppresses_without_error() {
        let s = spec(json!({
            "function": "f",
            "seconds": 60,
            "skip_during_range": {"start": "1:00pm", "end": "2:00pm"}
        }));
        let ev = eval_at(&s, &JobRunState::default(), t(13, 30, 0));
        assert!(!ev.due);
        assert!(ev.error.is_none());
        assert_eq!(ev.suppressed, Some(Suppression::Blackout));

        // end is exclusive
        assert!(eval_at(&s, &JobRunState::default(), t(14, 0, 0)).due);
    }

    #[test]
    fn global_blackout_applies_when_job_has_none() {
        let s = spec(json!({"function": "f", "seconds": 60}));
        let window = json!({"start": "2024-01-01T00:00:00", "end": "2024-01-01T06:00:00"});
        let ctx = EvalContext {
            skip_during_range: Some(&window),
            ..EvalContext::at(t(3, 0, 0))
        };
        let ev = evaluate("job", &s, &JobRunState::default(), &ctx);
        assert_eq!(ev.suppressed, Some(Suppression::Blackout));
    }

    #[test]
    fn range_restricts_and_inverts() {
        let s = spec(json!({
            "function": "f",
            "seconds": 60,
            "range": {"start": "9:00am", "end": "5:00pm"}
        }));
        assert!(eval_at(&s, &JobRunState::default(), t(10, 0, 0)).due);
        assert_eq!(
            eval_at(&s, &JobRunState::default(), t(20, 0, 0)).suppressed,
            Some(Suppression::OutOfRange)
        );

        let s = spec(json!({
            "function": "f",
            "seconds": 60,
            "range": {"start": "9:00am", "end": "5:00pm", "invert": true}
        }));
        assert!(!eval_at(&s, &JobRunState::default(), t(10, 0, 0)).due);
        assert!(eval_at(&s, &JobRunState::default(), t(20, 0, 0)).due);
    }

    #[test]
    fn until_and_after_gate_the_job() {
        let s = spec(json!({"function": "f", "seconds": 60, "until": "2024-01-01T06:00:00"}));
        assert!(eval_at(&s, &JobRunState::default(), t(5, 0, 0)).due);
        assert!(!eval_at(&s, &JobRunState::default(), t(6, 0, 0)).due);

        let s = spec(json!({"function": "f", "seconds": 60, "after": "2024-01-01T06:00:00"}));
        assert!(!eval_at(&s, &JobRunState::default(), t(6, 0, 0)).due);
        assert!(eval_at(&s, &JobRunState::default(), t(6, 0, 1)).due);

        let s = spec(json!({"function": "f", "seconds": 60, "until": "soon"}));
        let ev = eval_at(&s, &JobRunState::default(), t(6, 0, 0));
        assert!(ev.error.unwrap().to_string().contains("until"));
    }

    #[test]
    fn run_on_start_fires_first_evaluation_only() {
        let s = spec(json!({"function": "f", "cron": "0 0 1 1 *", "run_on_start": true}));
        let mut state = JobRunState::default();
        let ev = eval_at(&s, &state, t(12, 0, 0));
        assert!(ev.due);
        assert_eq!(ev.trigger, Some(Trigger::OnStart));
        state.apply(&ev);
        assert!(!eval_at(&s, &state, t(12, 0, 1)).due);
    }

    #[test]
    fn catch_up_after_blackout() {
        let s = spec(json!({
            "function": "f",
            "once": "2024-01-01T13:30:00",
            "skip_during_range": {"start": "1:00pm", "end": "2:00pm"},
            "run_after_skip_range": true
        }));
        let mut state = JobRunState::default();

        let ev = eval_at(&s, &state, t(13, 30, 0));
        assert_eq!(ev.suppressed, Some(Suppression::Blackout));
        assert!(ev.pending_after_skip);
        state.apply(&ev);

        assert!(!eval_at(&s, &state, t(13, 59, 0)).due);
        let ev = eval_at(&s, &state, t(14, 0, 0));
        assert!(ev.due);
        assert_eq!(ev.trigger, Some(Trigger::AfterBlackout));
        state.apply(&ev);
        assert!(!state.pending_after_skip);
        assert!(!eval_at(&s, &state, t(14, 1, 0)).due);
    }

    #[test]
    fn suppressed_once_without_catch_up_is_lost() {
        let s = spec(json!({
            "function": "f",
            "once": "2024-01-01T13:30:00",
            "skip_during_range": {"start": "1:00pm", "end": "2:00pm"}
        }));
        let mut state = JobRunState::default();
        state.apply(&eval_at(&s, &state, t(13, 30, 0)));
        assert!(!eval_at(&s, &state, t(14, 0, 0)).due);
    }

    #[test]
    fn explicit_skip_consumes_the_matching_occurrence() {
        let s = spec(json!({"function": "f", "cron": "0 * * * *"}));
        let mut state = JobRunState {
            next_fire_time: Some(t(1, 0, 0)),
            skip_explicit: vec![t(1, 0, 0)],
            ..JobRunState::default()
        };

        let ev = eval_at(&s, &state, t(1, 0, 0));
        assert!(!ev.due);
        assert!(ev.error.is_none());
        assert_eq!(ev.suppressed, Some(Suppression::Skipped));
        assert_eq!(ev.next_fire, Some(t(2, 0, 0)));
        assert!(ev.skip_explicit.is_empty());
        state.apply(&ev);

        assert!(eval_at(&s, &state, t(2, 0, 0)).due);
    }

    #[test]
    fn explicit_skip_moves_an_interval_on() {
        let s = spec(json!({"function": "f", "seconds": 60}));
        let mut state = JobRunState {
            last_run: Some(t(0, 0, 0)),
            skip_explicit: vec![t(0, 1, 0)],
            ..JobRunState::default()
        };
        let ev = eval_at(&s, &state, t(0, 1, 0));
        assert_eq!(ev.suppressed, Some(Suppression::Skipped));
        assert_eq!(ev.next_fire, Some(t(0, 2, 0)));
        state.apply(&ev);
        assert!(!eval_at(&s, &state, t(0, 1, 30)).due);
        assert!(eval_at(&s, &state, t(0, 2, 0)).due);
    }

    #[test]
    fn stale_skips_are_dropped() {
        let s = spec(json!({"function": "f", "cron": "0 * * * *"}));
        let state = JobRunState {
            next_fire_time: Some(t(2, 0, 0)),
            skip_explicit: vec![t(0, 30, 0), t(3, 0, 0)],
            ..JobRunState::default()
        };
        let ev = eval_at(&s, &state, t(1, 0, 0));
        assert!(!ev.due);
        assert_eq!(ev.skip_explicit, vec![t(3, 0, 0)]);
    }

    #[test]
    fn explicit_run_fires_once_outside_the_rule() {
        let s = spec(json!({"function": "f", "cron": "0 0 * * *"}));
        let mut state = JobRunState {
            next_fire_time: Some(t(0, 0, 0) + Duration::days(1)),
            run_explicit: vec![t(0, 30, 0)],
            ..JobRunState::default()
        };

        assert!(!eval_at(&s, &state, t(0, 29, 59)).due);
        let ev = eval_at(&s, &state, t(0, 30, 5));
        assert!(ev.due);
        assert_eq!(ev.trigger, Some(Trigger::Explicit));
        // the daily occurrence is untouched
        assert_eq!(ev.next_fire, state.next_fire_time);
        state.apply(&ev);
        assert!(state.run_explicit.is_empty());
        assert!(!eval_at(&s, &state, t(0, 31, 0)).due);
    }

    #[test]
    fn explicit_run_respects_blackout() {
        let s = spec(json!({
            "function": "f",
            "cron": "0 0 * * *",
            "skip_during_range": {"start": "1:00pm", "end": "2:00pm"}
        }));
        let state = JobRunState {
            next_fire_time: Some(t(0, 0, 0) + Duration::days(1)),
            run_explicit: vec![t(13, 15, 0)],
            ..JobRunState::default()
        };
        let ev = eval_at(&s, &state, t(13, 15, 0));
        assert_eq!(ev.suppressed, Some(Suppression::Blackout));
        assert!(ev.run_explicit.is_empty());
    }

    #[test]
    fn splay_holds_occurrence_until_offset() {
        let s = spec(json!({
            "function": "f",
            "seconds": 60,
            "splay": {"start": 30, "end": 30}
        }));
        let mut state = JobRunState {
            last_run: Some(t(0, 0, 0)),
            ..JobRunState::default()
        };

        let ev = eval_at(&s, &state, t(0, 1, 0));
        assert!(!ev.due);
        assert!(ev.suppressed.is_none());
        assert_eq!(ev.splay_until, Some(t(0, 1, 30)));
        state.apply(&ev);

        let ev = eval_at(&s, &state, t(0, 1, 20));
        assert!(!ev.due);
        state.apply(&ev);

        let ev = eval_at(&s, &state, t(0, 1, 30));
        assert!(ev.due);
        assert_eq!(ev.splay_until, None);
        assert_eq!(ev.next_fire, Some(t(0, 2, 30)));
    }

    #[test]
    fn splay_offset_is_within_bounds() {
        let s = spec(json!({"function": "f", "cron": "0 * * * *", "splay": 10}));
        let state = JobRunState {
            next_fire_time: Some(t(1, 0, 0)),
            ..JobRunState::default()
        };
        for _ in 0..50 {
            let until = eval_at(&s, &state, t(1, 0, 0)).splay_until.unwrap();
            assert!(until >= t(1, 0, 1) && until <= t(1, 0, 10));
        }
    }

    #[test]
    fn late_tick_past_splay_fires_at_once() {
        let s = spec(json!({"function": "f", "cron": "0 * * * *", "splay": {"start": 5, "end": 5}}));
        let state = JobRunState {
            next_fire_time: Some(t(1, 0, 0)),
            ..JobRunState::default()
        };
        let ev = eval_at(&s, &state, t(1, 0, 7));
        assert!(ev.due);
        assert_eq!(ev.next_fire, Some(t(2, 0, 0)));
    }

    #[test]
    fn reversed_splay_is_an_error() {
        let s = spec(json!({"function": "f", "seconds": 60, "splay": {"start": 20, "end": 10}}));
        let ev = eval_at(&s, &JobRunState::default(), t(0, 0, 0));
        assert!(!ev.due);
        assert_eq!(
            ev.error,
            Some(JobError::RangeOrder(
                "invalid splay, end must be larger than start. Ignoring job job.".to_string()
            ))
        );
    }
}
