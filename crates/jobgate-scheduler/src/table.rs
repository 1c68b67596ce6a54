use std::collections::BTreeMap;

use jobgate_core::job::JobSpec;

use crate::error::{Result, SchedulerError};
use crate::types::{JobRunState, JobStatus};

/// One scheduled job: its declarative spec plus mutable run-state.
#[derive(Debug, Clone, PartialEq)]
pub struct JobEntry {
    pub spec: JobSpec,
    pub state: JobRunState,
}

impl JobEntry {
    pub fn new(spec: JobSpec) -> Self {
        Self {
            spec,
            state: JobRunState::default(),
        }
    }
}

/// Name → job mapping. Names are unique; iteration is in name order so ticks
/// visit jobs deterministically.
#[derive(Debug, Clone, Default)]
pub struct JobTable {
    jobs: BTreeMap<String, JobEntry>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite `name` with fresh run-state. Returns true if a job
    /// of that name was replaced.
    pub fn add(&mut self, name: &str, spec: JobSpec) -> bool {
        self.jobs
            .insert(name.to_string(), JobEntry::new(spec))
            .is_some()
    }

    /// Insert with pre-existing run-state (restored from storage).
    pub fn insert(&mut self, name: &str, entry: JobEntry) {
        self.jobs.insert(name.to_string(), entry);
    }

    /// Swap the spec of an existing job, keeping its run history.
    ///
    /// Rule-derived bookkeeping (cron cache, consumed instants) is dropped when
    /// the temporal rule changed. The stored error is cleared either way; the
    /// next evaluation recomputes it.
    pub fn replace(&mut self, name: &str, spec: JobSpec) -> Result<()> {
        let entry = self
            .jobs
            .get_mut(name)
            .ok_or_else(|| SchedulerError::JobNotFound {
                name: name.to_string(),
            })?;
        if !entry.spec.same_rule(&spec) {
            entry.state.reset_rule();
        }
        entry.state.error = None;
        entry.spec = spec;
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Option<JobEntry> {
        self.jobs.remove(name)
    }

    /// Remove every job whose name starts with `prefix`. Returns the removed names.
    pub fn remove_prefix(&mut self, prefix: &str) -> Vec<String> {
        let doomed: Vec<String> = self
            .jobs
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect();
        for name in &doomed {
            self.jobs.remove(name);
        }
        doomed
    }

    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> Result<()> {
        let entry = self
            .jobs
            .get_mut(name)
            .ok_or_else(|| SchedulerError::JobNotFound {
                name: name.to_string(),
            })?;
        entry.spec.enabled = enabled;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&JobEntry> {
        self.jobs.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut JobEntry> {
        self.jobs.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.jobs.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &JobEntry)> {
        self.jobs.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut JobEntry)> {
        self.jobs.iter_mut()
    }

    pub fn names(&self) -> Vec<String> {
        self.jobs.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn status(&self, name: &str) -> Option<JobStatus> {
        self.jobs
            .get(name)
            .map(|entry| JobStatus::new(name, &entry.spec, &entry.state))
    }
}
