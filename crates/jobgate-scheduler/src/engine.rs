use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use jobgate_core::config::{JobgateConfig, SchedulerConfig, DEFAULT_LOOP_INTERVAL_SECS};
use jobgate_core::job::JobSpec;
use jobgate_core::types::DispatchId;
use rusqlite::Connection;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::db::StateStore;
use crate::dispatch::Dispatcher;
use crate::error::{Result, SchedulerError};
use crate::evaluate::{evaluate, EvalContext};
use crate::table::{JobEntry, JobTable};
use crate::types::{DispatchRequest, JobRunState, JobStatus, TickReport};

/// The job table plus everything a tick needs: lookup data, the global
/// blackout, the enable switch, a dispatcher and optional persistence.
pub struct Scheduler {
    table: JobTable,
    dispatcher: Arc<dyn Dispatcher>,
    whens: Option<Value>,
    skip_during_range: Option<Value>,
    enabled: bool,
    /// Loop interval; an explicit skip applies for this long after its instant.
    tolerance: chrono::Duration,
    store: Option<StateStore>,
}

impl Scheduler {
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            table: JobTable::new(),
            dispatcher,
            whens: None,
            skip_during_range: None,
            enabled: true,
            tolerance: chrono::Duration::seconds(DEFAULT_LOOP_INTERVAL_SECS as i64),
            store: None,
        }
    }

    /// Build from config, opening `scheduler.state_db` when set.
    pub fn from_config(config: &JobgateConfig, dispatcher: Arc<dyn Dispatcher>) -> Result<Self> {
        let mut scheduler = Self::new(dispatcher);
        if let Some(path) = config.scheduler.state_db.as_deref() {
            scheduler = scheduler.with_store(StateStore::new(Connection::open(path)?)?)?;
            info!(%path, "run-state persistence enabled");
        }
        scheduler.load(config)?;
        Ok(scheduler)
    }

    /// Attach persistence and restore run-state for jobs already in the table.
    pub fn with_store(mut self, store: StateStore) -> Result<Self> {
        for (name, entry) in self.table.iter_mut() {
            if let Some(state) = store.load(name)? {
                entry.state = state;
            }
        }
        self.store = Some(store);
        Ok(self)
    }

    pub fn take_store(&mut self) -> Option<StateStore> {
        self.store.take()
    }

    /// Replace the whole table and table-level settings from `config`.
    pub fn load(&mut self, config: &JobgateConfig) -> Result<()> {
        let mut table = JobTable::new();
        for (name, spec) in &config.schedule {
            let state = self.restore(name)?;
            table.insert(
                name,
                JobEntry {
                    spec: spec.clone(),
                    state,
                },
            );
        }
        self.table = table;
        self.whens = config.whens.clone();
        self.skip_during_range = config.skip_during_range.clone();
        self.enabled = config.scheduler.enabled;
        self.tolerance = i64::try_from(config.scheduler.loop_interval_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX);
        info!(jobs = self.table.len(), enabled = self.enabled, "schedule loaded");
        Ok(())
    }

    fn restore(&self, name: &str) -> Result<JobRunState> {
        match &self.store {
            Some(store) => Ok(store.load(name)?.unwrap_or_default()),
            None => Ok(JobRunState::default()),
        }
    }

    // --- table management ---------------------------------------------------

    /// Add `name`, overwriting any job of that name. Run-state starts fresh
    /// unless the attached store remembers the name.
    pub fn add(&mut self, name: &str, spec: JobSpec) -> bool {
        let replaced = self.table.contains(name);
        let state = self.restore(name).unwrap_or_else(|e| {
            error!(job = %name, "failed to restore run-state: {e}");
            JobRunState::default()
        });
        self.table.insert(name, JobEntry { spec, state });
        info!(job = %name, replaced, "job added");
        replaced
    }

    /// Swap a job's spec, keeping its run history.
    pub fn replace(&mut self, name: &str, spec: JobSpec) -> Result<()> {
        self.table.replace(name, spec)?;
        self.persist(name);
        info!(job = %name, "job modified");
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let removed = self.table.remove(name).is_some();
        if removed {
            self.forget(name);
            info!(job = %name, "job deleted");
        }
        removed
    }

    pub fn remove_prefix(&mut self, prefix: &str) -> Vec<String> {
        let removed = self.table.remove_prefix(prefix);
        for name in &removed {
            self.forget(name);
        }
        info!(%prefix, count = removed.len(), "jobs deleted by prefix");
        removed
    }

    pub fn enable_job(&mut self, name: &str) -> Result<()> {
        self.table.set_enabled(name, true)?;
        info!(job = %name, "job enabled");
        Ok(())
    }

    pub fn disable_job(&mut self, name: &str) -> Result<()> {
        self.table.set_enabled(name, false)?;
        info!(job = %name, "job disabled");
        Ok(())
    }

    pub fn enable_schedule(&mut self) {
        self.enabled = true;
        info!("schedule enabled");
    }

    pub fn disable_schedule(&mut self) {
        self.enabled = false;
        info!("schedule disabled");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Skip the occurrence that comes due at `at`. The job's other runs are
    /// unaffected.
    pub fn skip_job(&mut self, name: &str, at: DateTime<Utc>) -> Result<()> {
        let entry = self.entry_mut(name)?;
        insert_sorted(&mut entry.state.skip_explicit, at);
        self.persist(name);
        info!(job = %name, %at, "job run skipped");
        Ok(())
    }

    /// Skip the occurrence at `at` and run once at `new_at` instead.
    pub fn postpone_job(
        &mut self,
        name: &str,
        at: DateTime<Utc>,
        new_at: DateTime<Utc>,
    ) -> Result<()> {
        let entry = self.entry_mut(name)?;
        insert_sorted(&mut entry.state.skip_explicit, at);
        insert_sorted(&mut entry.state.run_explicit, new_at);
        self.persist(name);
        info!(job = %name, %at, %new_at, "job run postponed");
        Ok(())
    }

    fn entry_mut(&mut self, name: &str) -> Result<&mut JobEntry> {
        self.table
            .get_mut(name)
            .ok_or_else(|| SchedulerError::JobNotFound {
                name: name.to_string(),
            })
    }

    pub fn set_whens(&mut self, whens: Option<Value>) {
        self.whens = whens;
    }

    pub fn set_global_skip_during_range(&mut self, window: Option<Value>) {
        self.skip_during_range = window;
    }

    // --- queries -------------------------------------------------------------

    pub fn table(&self) -> &JobTable {
        &self.table
    }

    pub fn status(&self, name: &str) -> Option<JobStatus> {
        self.table.status(name)
    }

    /// Status of every job, in name order.
    pub fn list(&self) -> Vec<JobStatus> {
        self.table
            .iter()
            .map(|(name, entry)| JobStatus::new(name, &entry.spec, &entry.state))
            .collect()
    }

    pub fn next_fire_time(&self, name: &str) -> Option<DateTime<Utc>> {
        self.table.get(name).and_then(|e| e.state.next_fire_time)
    }

    /// Dispatch `name` immediately, outside its schedule. Run-state is untouched.
    pub fn run_job(&self, name: &str, now: DateTime<Utc>) -> Result<DispatchId> {
        let entry = self
            .table
            .get(name)
            .ok_or_else(|| SchedulerError::JobNotFound {
                name: name.to_string(),
            })?;
        let request = DispatchRequest::new(name, &entry.spec, now);
        let jid = request.jid.clone();
        info!(job = %name, %jid, function = %entry.spec.function, "running job on demand");
        self.dispatcher.run(request);
        Ok(jid)
    }

    // --- tick ------------------------------------------------------------------

    /// Evaluate every enabled job against one shared `now` and dispatch the due ones.
    ///
    /// A job's validation error is stored on that job and never stops the tick.
    pub fn eval(&mut self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        if !self.enabled {
            debug!("schedule disabled, tick skipped");
            return report;
        }

        let ctx = EvalContext {
            now,
            whens: self.whens.as_ref(),
            skip_during_range: self.skip_during_range.as_ref(),
            tolerance: self.tolerance,
        };
        let mut requests = Vec::new();
        let mut dirty = Vec::new();

        for (name, entry) in self.table.iter_mut() {
            if !entry.spec.enabled {
                continue;
            }
            let before = entry.state.clone();
            let eval = evaluate(name, &entry.spec, &entry.state, &ctx);
            entry.state.apply(&eval);

            if let Some(err) = &eval.error {
                // only log on change; a broken job would otherwise warn every tick
                if before.error.as_deref() != entry.state.error.as_deref() {
                    warn!(job = %name, "{err}");
                }
                report.errored.push(name.clone());
            } else if let Some(reason) = eval.suppressed {
                debug!(job = %name, ?reason, "due job suppressed");
                report.suppressed.push(name.clone());
            }

            if eval.due {
                let request = DispatchRequest::new(name, &entry.spec, now);
                info!(
                    job = %name,
                    jid = %request.jid,
                    function = %entry.spec.function,
                    trigger = ?eval.trigger,
                    "job fired"
                );
                entry.state.record_run(now);
                requests.push(request);
                report.fired.push(name.clone());
            }

            if entry.state != before {
                dirty.push(name.clone());
            }
        }

        for request in requests {
            self.dispatcher.run(request);
        }
        for name in &dirty {
            self.persist(name);
        }
        report
    }

    fn persist(&self, name: &str) {
        let (Some(store), Some(entry)) = (&self.store, self.table.get(name)) else {
            return;
        };
        if let Err(e) = store.save(name, &entry.state) {
            error!(job = %name, "failed to persist run-state: {e}");
        }
    }

    fn forget(&self, name: &str) {
        if let Some(store) = &self.store {
            if let Err(e) = store.delete(name) {
                error!(job = %name, "failed to delete run-state: {e}");
            }
        }
    }
}

fn insert_sorted(list: &mut Vec<DateTime<Utc>>, at: DateTime<Utc>) {
    if let Err(pos) = list.binary_search(&at) {
        list.insert(pos, at);
    }
}

/// Shared handle to a [`Scheduler`]. Management calls and the tick loop take
/// the same lock, so a mutation never interleaves with a tick.
#[derive(Clone)]
pub struct SchedulerHandle {
    inner: Arc<Mutex<Scheduler>>,
}

impl SchedulerHandle {
    pub fn new(scheduler: Scheduler) -> Self {
        Self {
            inner: Arc::new(Mutex::new(scheduler)),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Scheduler> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn eval(&self, now: DateTime<Utc>) -> TickReport {
        self.lock().eval(now)
    }

    /// [`SchedulerHandle::run`] at `scheduler.loop_interval_secs`.
    pub async fn run_with_config(self, config: &SchedulerConfig, shutdown: watch::Receiver<bool>) {
        self.run(Duration::from_secs(config.loop_interval_secs), shutdown)
            .await
    }

    /// Tick every `every` until `shutdown` broadcasts `true` or its sender drops.
    pub async fn run(self, every: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = every.as_millis() as u64, "scheduler loop started");

        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.eval(Utc::now());
                    if !report.fired.is_empty() {
                        debug!(fired = report.fired.len(), errored = report.errored.len(), "tick");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("scheduler loop shutting down");
                        break;
                    }
                }
            }
        }
    }
}
