use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::client::ClientMetadata;
use crate::geometry::AspectProfile;
use crate::normalize::normalized_path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }
}

/// Where a job is in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStage {
    Started,
    Normalizing,
    LookingUpClosingClip,
    Compositing,
    Logging,
    Completed,
    Failed,
}

/// Files a job reads and writes, all derived from the job ID and upload name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPaths {
    pub upload: PathBuf,
    /// Same as `upload` when the upload is already an MP4
    pub normalized: PathBuf,
    pub adjusted_input: PathBuf,
    pub adjusted_closing: PathBuf,
    pub output: PathBuf,
}

impl JobPaths {
    pub fn new(job_id: &str, file_name: &str, upload_dir: &Path, output_dir: &Path) -> Self {
        let upload = upload_dir.join(format!("{}_{}", job_id, file_name));
        let stem = upload
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| job_id.to_string());

        JobPaths {
            adjusted_input: upload_dir.join(format!("{}_input_adjusted.mp4", job_id)),
            adjusted_closing: upload_dir.join(format!("{}_closing_adjusted.mp4", job_id)),
            output: output_dir.join(format!("final_{}.mp4", stem)),
            normalized: normalized_path(&upload),
            upload,
        }
    }

    /// Every file this job may have written, closing clip excluded
    pub fn all(&self) -> Vec<PathBuf> {
        let mut paths = vec![self.upload.clone()];
        if self.normalized != self.upload {
            paths.push(self.normalized.clone());
        }
        paths.push(self.adjusted_input.clone());
        paths.push(self.adjusted_closing.clone());
        paths.push(self.output.clone());
        paths
    }
}

/// One upload-to-output run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub session_id: String,
    pub municipality: String,
    pub profile: AspectProfile,
    pub client: ClientMetadata,
    pub paths: JobPaths,
    pub status: JobStatus,
    pub stage: JobStage,
    /// Produced files, in the order they were created
    pub artifacts: Vec<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

impl Job {
    /// Allocate a job ID and derive the job's file layout
    pub fn new(
        session_id: &str,
        municipality: &str,
        profile: AspectProfile,
        client: ClientMetadata,
        file_name: &str,
        upload_dir: &Path,
        output_dir: &Path,
    ) -> Self {
        let id = Uuid::new_v4().to_string();
        let paths = JobPaths::new(&id, file_name, upload_dir, output_dir);
        Job {
            id,
            session_id: session_id.to_string(),
            municipality: municipality.to_string(),
            profile,
            client,
            paths,
            status: JobStatus::Running,
            stage: JobStage::Started,
            artifacts: Vec::new(),
            created_at: Utc::now(),
            finished_at: None,
            reason: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Track a produced file once
    pub fn add_artifact(&mut self, path: &Path) {
        if !self.artifacts.iter().any(|p| p == path) {
            self.artifacts.push(path.to_path_buf());
        }
    }

    pub fn succeed(&mut self) {
        if self.is_finished() {
            return;
        }
        self.status = JobStatus::Succeeded;
        self.stage = JobStage::Completed;
        self.finished_at = Some(Utc::now());
    }

    pub fn fail(&mut self, reason: &str) {
        if self.is_finished() {
            return;
        }
        self.status = JobStatus::Failed;
        self.stage = JobStage::Failed;
        self.reason = Some(reason.to_string());
        self.finished_at = Some(Utc::now());
    }
}

/// `<job_state_dir>/<id>.json`
pub fn job_state_path(job_state_dir: &Path, job_id: &str) -> PathBuf {
    job_state_dir.join(format!("{}.json", job_id))
}

/// Persist a job as `<job_state_dir>/<id>.json`
pub fn save_job(job: &Job, job_state_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(job_state_dir)
        .with_context(|| format!("Failed to create job state dir: {}", job_state_dir.display()))?;

    let path = job_state_path(job_state_dir, &job.id);
    let json = serde_json::to_string_pretty(job).context("Failed to serialize job")?;
    std::fs::write(&path, json)
        .with_context(|| format!("Failed to write job state: {}", path.display()))?;
    Ok(())
}

/// Load every job in `job_state_dir`, oldest first
pub fn load_all_jobs(job_state_dir: &Path) -> Result<Vec<Job>> {
    let mut jobs = Vec::new();
    if !job_state_dir.exists() {
        return Ok(jobs);
    }

    let entries = std::fs::read_dir(job_state_dir)
        .with_context(|| format!("Failed to read job state dir: {}", job_state_dir.display()))?;

    for entry in entries {
        let path = match entry {
            Ok(e) => e.path(),
            Err(e) => {
                warn!("Error reading job state entry: {}", e);
                continue;
            }
        };
        if path.extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }

        let parsed = std::fs::read_to_string(&path)
            .map_err(anyhow::Error::from)
            .and_then(|content| serde_json::from_str::<Job>(&content).map_err(anyhow::Error::from));
        match parsed {
            Ok(job) => jobs.push(job),
            Err(e) => warn!("Skipping unreadable job file {}: {}", path.display(), e),
        }
    }

    jobs.sort_by_key(|j| j.created_at);
    Ok(jobs)
}
