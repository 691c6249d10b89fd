use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use log::{debug, info, warn};
use tokio::task::AbortHandle;

/// Deletes a job's artifacts once its retention window has passed
#[derive(Clone, Default)]
pub struct ArtifactReaper {
    pending: Arc<Mutex<HashMap<String, AbortHandle>>>,
}

impl ArtifactReaper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delete `paths` after `delay`. Scheduling the same job twice replaces the earlier timer.
    pub fn schedule(&self, job_id: &str, paths: Vec<PathBuf>, delay: Duration) {
        let pending = self.pending.clone();
        let id = job_id.to_string();

        debug!("Job {}: reaping {} artifact(s) in {}s", job_id, paths.len(), delay.as_secs());

        let mut guard = match self.pending.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let removed = delete_all(&id, &paths);
            info!("Job {}: 🗑️  Retention expired, removed {} artifact(s)", id, removed);
            if let Ok(mut pending) = pending.lock() {
                pending.remove(&id);
            }
        });

        if let Some(previous) = guard.insert(job_id.to_string(), handle.abort_handle()) {
            previous.abort();
        }
    }

    /// Cancel a scheduled reap. Returns false when nothing was pending.
    pub fn cancel(&self, job_id: &str) -> bool {
        let removed = match self.pending.lock() {
            Ok(mut g) => g.remove(job_id),
            Err(poisoned) => poisoned.into_inner().remove(job_id),
        };
        match removed {
            Some(handle) => {
                handle.abort();
                info!("Job {}: artifact deletion cancelled", job_id);
                true
            }
            None => false,
        }
    }

    /// Number of jobs still waiting for their retention window
    pub fn pending(&self) -> usize {
        self.pending.lock().map(|g| g.len()).unwrap_or(0)
    }
}

/// Delete every path once, logging failures. Returns how many files were removed.
pub fn delete_all(job_id: &str, paths: &[PathBuf]) -> usize {
    let mut removed = 0;
    for path in paths {
        match std::fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Job {}: {} already gone", job_id, path.display());
            }
            Err(e) => warn!("Job {}: failed to delete {}: {}", job_id, path.display(), e),
        }
    }
    removed
}
