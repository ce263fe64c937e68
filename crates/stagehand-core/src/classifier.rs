use crate::job::Job;
use crate::types::{Component, Phase};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// SystemState
// ---------------------------------------------------------------------------

/// Health of the long-lived infrastructure jobs observed in one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemState {
    /// Every system job is running (or there are none).
    Ready,
    /// Some system job is still coming up. Not an error.
    NotReady(String),
    /// A system job failed or terminated. The workflow cannot continue.
    Abort(String),
}

impl SystemState {
    pub fn is_abort(&self) -> bool {
        matches!(self, SystemState::Abort(_))
    }
}

// ---------------------------------------------------------------------------
// Classifier
// ---------------------------------------------------------------------------

/// Per-pass partition of child jobs into disjoint lifecycle buckets.
///
/// Rebuilt from scratch every reconcile pass with [`Classifier::reset`]
/// followed by one [`Classifier::classify`] per known child. Buckets are
/// ordered maps so every listing is sorted.
#[derive(Debug, Clone, Default)]
pub struct Classifier {
    pending: BTreeMap<String, Job>,
    running: BTreeMap<String, Job>,
    successful: BTreeMap<String, Job>,
    failed: BTreeMap<String, Job>,
    terminating: BTreeMap<String, Job>,
    system: BTreeMap<String, Job>,
}

impl Classifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Place `job` into exactly one bucket.
    ///
    /// Deletion marks win over everything else. System jobs are kept apart
    /// unless they failed. Uninitialized jobs are not visible yet and are
    /// dropped.
    pub fn classify(&mut self, name: &str, job: Job) {
        let name = name.to_string();

        if job.metadata.is_deleting() {
            self.terminating.insert(name, job);
            return;
        }

        if job.component() == Component::Sys {
            if job.phase() == Phase::Failed {
                self.failed.insert(name, job);
            } else {
                self.system.insert(name, job);
            }
            return;
        }

        match job.phase() {
            Phase::Uninitialized => {}
            Phase::Pending => {
                self.pending.insert(name, job);
            }
            Phase::Running => {
                self.running.insert(name, job);
            }
            Phase::Success => {
                self.successful.insert(name, job);
            }
            Phase::Failed => {
                self.failed.insert(name, job);
            }
        }
    }

    /// Convenience for classifying a whole listing by job name.
    pub fn classify_all(&mut self, jobs: impl IntoIterator<Item = Job>) {
        for job in jobs {
            let name = job.metadata.name.clone();
            self.classify(&name, job);
        }
    }

    // -----------------------------------------------------------------------
    // Membership
    // -----------------------------------------------------------------------

    pub fn is_pending<S: AsRef<str>>(&self, names: &[S]) -> bool {
        all_in(&self.pending, names)
    }

    pub fn is_running<S: AsRef<str>>(&self, names: &[S]) -> bool {
        all_in(&self.running, names)
    }

    pub fn is_successful<S: AsRef<str>>(&self, names: &[S]) -> bool {
        all_in(&self.successful, names)
    }

    pub fn is_failed<S: AsRef<str>>(&self, names: &[S]) -> bool {
        all_in(&self.failed, names)
    }

    pub fn is_terminating<S: AsRef<str>>(&self, names: &[S]) -> bool {
        all_in(&self.terminating, names)
    }

    /// Phase of a system job. System jobs live outside the phase buckets.
    pub fn system_phase(&self, name: &str) -> Option<Phase> {
        self.system.get(name).map(Job::phase)
    }

    /// Whether the orchestrator may delete `name`: it is an SUT job that has
    /// not reached a terminal phase.
    pub fn is_deletable(&self, name: &str) -> bool {
        self.get_deletable(name).is_some()
    }

    pub fn get_deletable(&self, name: &str) -> Option<&Job> {
        self.pending
            .get(name)
            .or_else(|| self.running.get(name))
            .filter(|job| job.component() == Component::Sut)
    }

    // -----------------------------------------------------------------------
    // Listings
    // -----------------------------------------------------------------------

    pub fn list_pending_jobs(&self) -> Vec<String> {
        self.pending.keys().cloned().collect()
    }

    pub fn list_running_jobs(&self) -> Vec<String> {
        self.running.keys().cloned().collect()
    }

    pub fn list_successful_jobs(&self) -> Vec<String> {
        self.successful.keys().cloned().collect()
    }

    pub fn list_failed_jobs(&self) -> Vec<String> {
        self.failed.keys().cloned().collect()
    }

    pub fn list_terminating_jobs(&self) -> Vec<String> {
        self.terminating.keys().cloned().collect()
    }

    pub fn list_system_jobs(&self) -> Vec<String> {
        self.system.keys().cloned().collect()
    }

    pub fn get_pending_jobs(&self) -> Vec<&Job> {
        self.pending.values().collect()
    }

    pub fn get_running_jobs(&self) -> Vec<&Job> {
        self.running.values().collect()
    }

    pub fn get_successful_jobs(&self) -> Vec<&Job> {
        self.successful.values().collect()
    }

    pub fn get_failed_jobs(&self) -> Vec<&Job> {
        self.failed.values().collect()
    }

    pub fn num_pending_jobs(&self) -> usize {
        self.pending.len()
    }

    pub fn num_running_jobs(&self) -> usize {
        self.running.len()
    }

    pub fn num_successful_jobs(&self) -> usize {
        self.successful.len()
    }

    pub fn num_failed_jobs(&self) -> usize {
        self.failed.len()
    }

    pub fn num_terminating_jobs(&self) -> usize {
        self.terminating.len()
    }

    pub fn num_system_jobs(&self) -> usize {
        self.system.len()
    }

    /// Workflow-relevant jobs. Terminating and system jobs do not count.
    pub fn count(&self) -> usize {
        self.pending.len() + self.running.len() + self.successful.len() + self.failed.len()
    }

    pub fn system_state(&self) -> SystemState {
        // failed system jobs are diverted to the failed bucket
        if let Some(job) = self
            .failed
            .values()
            .find(|job| job.component() == Component::Sys)
        {
            return SystemState::Abort(format!("System Job '{}' has failed", job.name()));
        }

        for job in self.system.values() {
            match job.phase() {
                Phase::Success => {
                    return SystemState::Abort(format!(
                        "System Job '{}' has terminated",
                        job.name()
                    ))
                }
                Phase::Pending => {
                    return SystemState::NotReady(format!(
                        "System Job '{}' is still pending",
                        job.name()
                    ))
                }
                Phase::Uninitialized => {
                    return SystemState::NotReady(format!(
                        "System Job '{}' is not yet initialized",
                        job.name()
                    ))
                }
                Phase::Running | Phase::Failed => {}
            }
        }

        SystemState::Ready
    }
}

fn all_in<S: AsRef<str>>(bucket: &BTreeMap<String, Job>, names: &[S]) -> bool {
    !names.is_empty() && names.iter().all(|n| bucket.contains_key(n.as_ref()))
}

impl fmt::Display for Classifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pending: {:?}, running: {:?}, successful: {:?}, failed: {:?}, terminating: {:?}, system: {:?}",
            self.list_pending_jobs(),
            self.list_running_jobs(),
            self.list_successful_jobs(),
            self.list_failed_jobs(),
            self.list_terminating_jobs(),
            self.list_system_jobs(),
        )
    }
}
