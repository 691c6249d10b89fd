use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use walkdir::WalkDir;
use crate::client::ClientMetadata;
use crate::config::PipelineConfig;
use crate::error::ValidationError;
use crate::geometry::AspectProfile;
use crate::job::Job;
use crate::pool::{JobAck, WorkerPool};

/// Upload manifest as dropped into the intake directory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub municipality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ip: Option<String>,
}

/// An upload whose fields all checked out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedUpload {
    pub municipality: String,
    pub file: PathBuf,
    pub profile: AspectProfile,
    pub session_id: String,
    pub client: ClientMetadata,
}

fn required(value: &Option<String>, name: &'static str) -> Result<String, ValidationError> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(ValidationError::MissingField(name)),
    }
}

impl UploadRequest {
    pub fn validate(&self) -> Result<ValidatedUpload, ValidationError> {
        let municipality = required(&self.municipality, "municipality")?;
        let file = match &self.file {
            Some(f) if !f.as_os_str().is_empty() => f.clone(),
            _ => return Err(ValidationError::MissingField("file")),
        };
        let profile: AspectProfile = required(&self.format, "format")?.parse()?;
        let session_id = required(&self.session_id, "sessionId")?;

        let client = ClientMetadata::from_user_agent(
            self.user_agent.as_deref().unwrap_or_default(),
            self.source_ip.as_deref().unwrap_or("unknown"),
        );

        Ok(ValidatedUpload { municipality, file, profile, session_id, client })
    }
}

/// What happened to one manifest
#[derive(Debug)]
pub enum IntakeOutcome {
    Accepted(JobAck),
    Rejected(String),
}

fn is_manifest(path: &Path) -> bool {
    let name = match path.file_name().and_then(|n| n.to_str()) {
        Some(n) => n,
        None => return false,
    };
    name.ends_with(".json") && !name.ends_with(".ack.json") && !name.starts_with('.')
}

/// Manifests waiting in the intake directory, oldest name first
pub fn scan_intake(intake_dir: &Path) -> Result<Vec<PathBuf>> {
    if !intake_dir.exists() {
        warn!("Intake directory does not exist: {}", intake_dir.display());
        return Ok(Vec::new());
    }

    let mut manifests = Vec::new();
    for entry in WalkDir::new(intake_dir).min_depth(1).max_depth(1).follow_links(false) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Error reading intake entry: {}", e);
                continue;
            }
        };
        let path = entry.path();
        if path.is_file() && is_manifest(path) {
            manifests.push(path.to_path_buf());
        }
    }
    manifests.sort();
    Ok(manifests)
}

pub fn ack_path(manifest: &Path) -> PathBuf {
    manifest.with_extension("ack.json")
}

pub fn rejected_path(manifest: &Path) -> PathBuf {
    manifest.with_extension("rejected")
}

pub fn why_txt_path(manifest: &Path) -> PathBuf {
    manifest.with_extension("why.txt")
}

/// Set a manifest aside with the reason next to it
fn reject(manifest: &Path, reason: &str) -> Result<IntakeOutcome> {
    warn!("Rejected {}: {}", manifest.display(), reason);

    let why = why_txt_path(manifest);
    std::fs::write(&why, reason)
        .with_context(|| format!("Failed to write why.txt: {}", why.display()))?;

    let rejected = rejected_path(manifest);
    std::fs::rename(manifest, &rejected)
        .with_context(|| format!("Failed to set aside manifest: {}", manifest.display()))?;

    Ok(IntakeOutcome::Rejected(reason.to_string()))
}

/// Move a file, falling back to copy + delete across filesystems
fn move_file(from: &Path, to: &Path) -> Result<()> {
    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }
    std::fs::copy(from, to)
        .with_context(|| format!("Failed to copy {} to {}", from.display(), to.display()))?;
    std::fs::remove_file(from)
        .with_context(|| format!("Failed to remove {}", from.display()))?;
    Ok(())
}

/// Move an upload on the blocking pool, since the copy fallback can take seconds
async fn move_upload(from: PathBuf, to: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || move_file(&from, &to))
        .await
        .context("Upload move task failed")?
}

/// Validate one manifest and queue its job
///
/// The job's queue place is reserved before the upload is moved, so a full queue
/// leaves the submitted file where it was.
pub async fn process_manifest(cfg: &PipelineConfig, pool: &WorkerPool, manifest: &Path) -> Result<IntakeOutcome> {
    let content = std::fs::read_to_string(manifest)
        .with_context(|| format!("Failed to read manifest: {}", manifest.display()))?;

    let request: UploadRequest = match serde_json::from_str(&content) {
        Ok(r) => r,
        Err(e) => return reject(manifest, &format!("manifest is not valid JSON: {}", e)),
    };

    let upload = match request.validate() {
        Ok(u) => u,
        Err(e) => return reject(manifest, &e.to_string()),
    };

    if !upload.file.is_file() {
        return reject(manifest, &format!("uploaded file not found: {}", upload.file.display()));
    }
    let file_name = match upload.file.file_name() {
        Some(n) => n.to_string_lossy().to_string(),
        None => return reject(manifest, "uploaded file has no name"),
    };

    let slot = match pool.reserve() {
        Ok(s) => s,
        Err(e) => return reject(manifest, &e.to_string()),
    };

    let job = Job::new(
        &upload.session_id,
        &upload.municipality,
        upload.profile,
        upload.client,
        &file_name,
        &cfg.upload_dir,
        &cfg.output_dir,
    );

    if let Err(e) = move_upload(upload.file.clone(), job.paths.upload.clone()).await {
        return reject(manifest, &format!("{:#}", e));
    }
    debug!("Moved {} to {}", upload.file.display(), job.paths.upload.display());

    let ack = slot.submit(job);

    let ack_file = ack_path(manifest);
    let json = serde_json::to_string_pretty(&ack).context("Failed to serialize acknowledgement")?;
    std::fs::write(&ack_file, json)
        .with_context(|| format!("Failed to write acknowledgement: {}", ack_file.display()))?;
    std::fs::remove_file(manifest)
        .with_context(|| format!("Failed to remove manifest: {}", manifest.display()))?;

    info!("📥 Accepted {} for {} as job {}", file_name, upload.municipality, ack.job_id);
    Ok(IntakeOutcome::Accepted(ack))
}

/// Write a manifest so the scanner never sees it half-written
pub fn write_manifest(intake_dir: &Path, request: &UploadRequest) -> Result<PathBuf> {
    std::fs::create_dir_all(intake_dir)
        .with_context(|| format!("Failed to create intake dir: {}", intake_dir.display()))?;

    let name = Uuid::new_v4().to_string();
    let tmp = intake_dir.join(format!("{}.tmp", name));
    let path = intake_dir.join(format!("{}.json", name));

    let json = serde_json::to_string_pretty(request).context("Failed to serialize manifest")?;
    std::fs::write(&tmp, json)
        .with_context(|| format!("Failed to write manifest: {}", tmp.display()))?;
    std::fs::rename(&tmp, &path)
        .with_context(|| format!("Failed to publish manifest: {}", path.display()))?;
    Ok(path)
}
