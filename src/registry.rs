use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::ConflictError;
use crate::types::{JobSnapshot, JobStatus};

#[derive(Debug, Clone)]
struct JobEntry {
    options: String,
    status: JobStatus,
    admission: u64,
}

/// In-flight jobs keyed by identifier. At most one entry per identifier.
///
/// Every operation is a single short critical section; nothing here awaits.
#[derive(Debug, Clone, Default)]
pub struct JobRegistry {
    inner: Arc<Mutex<Jobs>>,
}

#[derive(Debug, Default)]
struct Jobs {
    entries: HashMap<String, JobEntry>,
    next_admission: u64,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `jid` as running unless it already is.
    ///
    /// The returned guard releases the entry when dropped.
    pub fn admit(&self, jid: &str, options: &str) -> Result<Admission, ConflictError> {
        let mut jobs = self.lock();
        if jobs.entries.contains_key(jid) {
            return Err(ConflictError {
                jid: jid.to_string(),
            });
        }
        jobs.next_admission += 1;
        let admission = jobs.next_admission;
        jobs.entries.insert(
            jid.to_string(),
            JobEntry {
                options: options.to_string(),
                status: JobStatus::Running,
                admission,
            },
        );
        Ok(Admission {
            registry: self.clone(),
            jid: jid.to_string(),
            admission,
        })
    }

    pub fn release(&self, jid: &str) {
        self.lock().entries.remove(jid);
    }

    // Only removes the entry if it still belongs to this admission.
    fn release_admission(&self, jid: &str, admission: u64) {
        let mut jobs = self.lock();
        if jobs.entries.get(jid).is_some_and(|e| e.admission == admission) {
            jobs.entries.remove(jid);
        }
    }

    pub fn is_running(&self, jid: &str) -> bool {
        self.lock().entries.contains_key(jid)
    }

    /// Option string a running job was admitted with.
    pub fn options_of(&self, jid: &str) -> Option<String> {
        self.lock().entries.get(jid).map(|e| e.options.clone())
    }

    /// Current jobs, ordered by identifier.
    pub fn snapshot(&self) -> Vec<JobSnapshot> {
        let mut out: Vec<JobSnapshot> = self
            .lock()
            .entries
            .iter()
            .map(|(jid, entry)| JobSnapshot {
                jid: jid.clone(),
                status: entry.status,
            })
            .collect();
        out.sort_by(|a, b| a.jid.cmp(&b.jid));
        out
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Jobs> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Ownership of a registered job. Dropping it releases the identifier.
#[derive(Debug)]
pub struct Admission {
    registry: JobRegistry,
    jid: String,
    admission: u64,
}

impl Admission {
    pub fn jid(&self) -> &str {
        &self.jid
    }

    pub fn set_status(&self, status: JobStatus) {
        let mut jobs = self.registry.lock();
        if let Some(entry) = jobs.entries.get_mut(&self.jid) {
            if entry.admission == self.admission {
                entry.status = status;
            }
        }
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.registry.release_admission(&self.jid, self.admission);
    }
}
