use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use anyhow::{Context, Result};
use chrono::Utc;
use log::{error, info, warn};
use crate::asset::VideoAsset;
use crate::compositor::{ClipCompositor, Composite};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::ffmpeg::{EncodeSettings, MediaToolkit};
use crate::job::{Job, JobStage, JobStatus, job_state_path, load_all_jobs, save_job};
use crate::lookup::ClosingClipLookup;
use crate::normalize::normalize;
use crate::progress::{ProgressEmitter, ProgressHub};
use crate::reaper::{ArtifactReaper, delete_all};
use crate::stats::{Outcome, StatisticsRecord, StatisticsRecorder};

/// Everything a worker needs to run jobs, shared by all workers
pub struct PipelineContext {
    pub config: PipelineConfig,
    pub toolkit: Arc<dyn MediaToolkit>,
    pub settings: EncodeSettings,
    pub lookup: Arc<dyn ClosingClipLookup>,
    pub recorder: StatisticsRecorder,
    pub reaper: ArtifactReaper,
    pub progress: ProgressHub,
}

impl PipelineContext {
    pub fn new(
        config: PipelineConfig,
        toolkit: Arc<dyn MediaToolkit>,
        lookup: Arc<dyn ClosingClipLookup>,
        progress: ProgressHub,
    ) -> Self {
        PipelineContext {
            settings: EncodeSettings::from_config(&config),
            recorder: StatisticsRecorder::new(config.statistics_file.clone()),
            reaper: ArtifactReaper::new(),
            config,
            toolkit,
            lookup,
            progress,
        }
    }
}

/// Drives one job from upload to download link
pub struct JobOrchestrator {
    ctx: Arc<PipelineContext>,
}

impl JobOrchestrator {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        JobOrchestrator { ctx }
    }

    /// Run a job to completion. The upload must already be at `job.paths.upload`.
    pub async fn run(&self, mut job: Job) -> Job {
        let mut progress = self.ctx.progress.emitter(&job.id, &job.session_id);
        info!("🎬 Job {}: {} ({}) for session {}", job.id, job.municipality, job.profile, job.session_id);

        match self.execute(&mut job, &mut progress).await {
            Ok(composite) => self.complete(&mut job, &mut progress, composite),
            Err(e) => self.abort(&mut job, &mut progress, e),
        }
        job
    }

    async fn execute(&self, job: &mut Job, progress: &mut ProgressEmitter) -> PipelineResult<Composite> {
        let ctx = &self.ctx;
        let toolkit = ctx.toolkit.as_ref();
        let paths = job.paths.clone();

        job.add_artifact(&paths.upload);
        self.transition(job, JobStage::Started);
        progress.emit(10, "Video uploaded, starting processing");

        progress.emit(20, "Checking video format");
        self.transition(job, JobStage::Normalizing);
        let normalized = normalize(toolkit, &ctx.settings, &paths.upload).await?;
        if normalized.reencoded {
            job.add_artifact(&normalized.path);
            progress.emit(30, "Video converted to MP4");
        } else {
            progress.emit(30, "Video is already MP4");
        }

        self.transition(job, JobStage::LookingUpClosingClip);
        let closing_path = ctx.lookup.lookup(&job.municipality).ok_or_else(|| {
            PipelineError::MappingNotFound { municipality: job.municipality.clone() }
        })?;
        if !closing_path.is_file() {
            return Err(PipelineError::AssetMissing { path: closing_path });
        }
        progress.emit(45, "Closing video loaded");

        self.transition(job, JobStage::Compositing);
        let input = probe(toolkit, &normalized.path).await?;
        let closing = probe(toolkit, &closing_path).await?;

        let compositor = ClipCompositor::new(toolkit, &ctx.settings, ctx.config.vertical_height);
        job.add_artifact(&paths.adjusted_input);
        job.add_artifact(&paths.adjusted_closing);
        compositor
            .adjust(&input, &closing, job.profile, &paths.adjusted_input, &paths.adjusted_closing)
            .await?;
        progress.emit(70, "Clips adjusted");

        job.add_artifact(&paths.output);
        let composite = compositor
            .concatenate(&paths.adjusted_input, &paths.adjusted_closing, &paths.output)
            .await?;
        progress.emit(90, "Finalizing video");

        Ok(composite)
    }

    fn complete(&self, job: &mut Job, progress: &mut ProgressEmitter, composite: Composite) {
        let ctx = &self.ctx;
        self.transition(job, JobStage::Logging);
        self.record(job, Some(&composite), Outcome::Success);

        let url = ctx.config.download_url(&composite.path);
        progress.finish("Video processed successfully", Some(url));

        job.succeed();
        self.persist(job);
        info!("✅ Job {}: {} ({}, {:.1}s)", job.id, composite.path.display(), composite.resolution, composite.duration_seconds);

        ctx.reaper.schedule(&job.id, self.retained_files(job), ctx.config.retention());
    }

    fn abort(&self, job: &mut Job, progress: &mut ProgressEmitter, err: PipelineError) {
        error!("❌ Job {} failed at {:?}: {}", job.id, job.stage, err);
        self.fail(job, progress, &err.user_message(), &err.to_string());
    }

    fn fail(&self, job: &mut Job, progress: &mut ProgressEmitter, user_message: &str, detail: &str) {
        delete_all(&job.id, &owned_files(job));

        progress.finish(user_message, None);
        self.record(job, None, Outcome::Error(detail.to_string()));

        job.fail(detail);
        self.persist(job);

        // Only the state file is left; it goes when the window closes
        let state = job_state_path(&self.ctx.config.job_state_dir, &job.id);
        self.ctx.reaper.schedule(&job.id, vec![state], self.ctx.config.retention());
    }

    /// Re-arm retention for jobs a previous daemon finished.
    /// Jobs whose window already closed are deleted now; returns how many.
    pub fn resume_retention(&self) -> Result<usize> {
        let jobs = load_all_jobs(&self.ctx.config.job_state_dir)
            .context("Failed to load jobs for retention")?;
        let retention = self.ctx.config.retention();
        let now = Utc::now();

        let mut expired = 0;
        for job in jobs.into_iter().filter(|j| j.is_finished()) {
            let files = self.retained_files(&job);
            let elapsed = job.finished_at
                .and_then(|at| (now - at).to_std().ok())
                .unwrap_or(Duration::ZERO);

            match retention.checked_sub(elapsed) {
                Some(left) if !left.is_zero() => self.ctx.reaper.schedule(&job.id, files, left),
                _ => {
                    let removed = delete_all(&job.id, &files);
                    info!("Job {}: 🗑️  Retention expired while stopped, removed {} file(s)", job.id, removed);
                    expired += 1;
                }
            }
        }
        Ok(expired)
    }

    /// Fail every job a previous daemon left running. Returns how many were found.
    pub fn recover_interrupted(&self) -> Result<usize> {
        let jobs = load_all_jobs(&self.ctx.config.job_state_dir)
            .context("Failed to load jobs for recovery")?;

        let mut recovered = 0;
        for mut job in jobs.into_iter().filter(|j| j.status == JobStatus::Running) {
            warn!("Job {}: ⚠️  Interrupted at {:?}, cleaning up", job.id, job.stage);
            let mut progress = self.ctx.progress.emitter(&job.id, &job.session_id);
            self.fail(
                &mut job,
                &mut progress,
                "Error processing the video: processing was interrupted",
                "interrupted by daemon restart",
            );
            recovered += 1;
        }
        Ok(recovered)
    }

    fn record(&self, job: &Job, composite: Option<&Composite>, outcome: Outcome) {
        let record = statistics_record(job, composite, outcome);
        if let Err(e) = self.ctx.recorder.append(&record) {
            warn!("Job {}: failed to record statistics: {:#}", job.id, e);
        }
    }

    fn transition(&self, job: &mut Job, stage: JobStage) {
        job.stage = stage;
        self.persist(job);
    }

    /// Everything deleted when a finished job's window closes, state file last
    fn retained_files(&self, job: &Job) -> Vec<PathBuf> {
        let mut files = owned_files(job);
        files.push(job_state_path(&self.ctx.config.job_state_dir, &job.id));
        files
    }

    fn persist(&self, job: &Job) {
        if let Err(e) = save_job(job, &self.ctx.config.job_state_dir) {
            warn!("Job {}: failed to save state: {:#}", job.id, e);
        }
    }
}

/// Produced artifacts plus every derived path a job may have written
fn owned_files(job: &Job) -> Vec<PathBuf> {
    let mut files = job.artifacts.clone();
    for path in job.paths.all() {
        if !files.contains(&path) {
            files.push(path);
        }
    }
    files
}

async fn probe(toolkit: &dyn MediaToolkit, path: &Path) -> PipelineResult<VideoAsset> {
    toolkit.probe(path).await.map_err(|e| PipelineError::Probe {
        path: path.to_path_buf(),
        detail: format!("{:#}", e),
    })
}

fn statistics_record(job: &Job, composite: Option<&Composite>, outcome: Outcome) -> StatisticsRecord {
    StatisticsRecord {
        municipality: job.municipality.clone(),
        format: job.profile.as_str().to_string(),
        device: job.client.device_label(),
        ip: job.client.source_ip.clone(),
        duration_seconds: composite.map(|c| c.duration_seconds),
        resolution: composite.map(|c| c.resolution.clone()),
        outcome,
        timestamp: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use crate::client::ClientMetadata;
    use tokio::sync::mpsc::UnboundedReceiver;
    use crate::geometry::AspectProfile;
    use crate::lookup::ClosingClipCatalog;
    use crate::progress::ProgressEvent;
    use crate::stats::parse_csv;
    use crate::testing::{FakeToolkit, test_config};

    struct Harness {
        _dir: tempfile::TempDir,
        config: PipelineConfig,
        toolkit: Arc<FakeToolkit>,
        orchestrator: JobOrchestrator,
        ctx: Arc<PipelineContext>,
        events: UnboundedReceiver<ProgressEvent>,
    }

    fn harness(toolkit: FakeToolkit, with_closing_clip: bool) -> Harness {
        harness_with(toolkit, with_closing_clip, |_| {})
    }

    fn harness_with(toolkit: FakeToolkit, with_closing_clip: bool, tweak: impl FnOnce(&mut PipelineConfig)) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        let mut config = test_config(root);
        tweak(&mut config);

        let toolkit = Arc::new(toolkit);
        if with_closing_clip {
            toolkit.add_video(&config.closing_clip_dir.join("springfield.mp4"), 1920, 1080, 25.0, 3.0, false);
        }

        let catalog = ClosingClipCatalog::load(
            &config.municipalities_file,
            &config.mapping_file,
            &config.closing_clip_dir,
        ).unwrap();

        let (hub, events) = ProgressHub::new();
        let ctx = Arc::new(PipelineContext::new(config.clone(), toolkit.clone(), Arc::new(catalog), hub));

        Harness {
            _dir: dir,
            config,
            toolkit,
            orchestrator: JobOrchestrator::new(ctx.clone()),
            ctx,
            events,
        }
    }

    impl Harness {
        fn upload(&self, municipality: &str, file_name: &str, profile: AspectProfile) -> Job {
            self.upload_sized(municipality, file_name, profile, 1280, 720)
        }

        fn upload_sized(&self, municipality: &str, file_name: &str, profile: AspectProfile, width: u32, height: u32) -> Job {
            let client = ClientMetadata::from_user_agent("Mozilla/5.0 (Linux; Android 14) Mobile", "10.0.0.7");
            let job = Job::new("sid-1", municipality, profile, client, file_name,
                               &self.config.upload_dir, &self.config.output_dir);
            self.toolkit.add_video(&job.paths.upload, width, height, 30.0, 5.0, true);
            job
        }

        fn state_files(&self) -> usize {
            std::fs::read_dir(&self.config.job_state_dir).unwrap().count()
        }

        fn percents(&mut self) -> Vec<u8> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event.percent);
            }
            out
        }

        fn records(&self) -> Vec<Vec<String>> {
            let text = std::fs::read_to_string(&self.config.statistics_file).unwrap();
            parse_csv(&text).into_iter().skip(1).collect()
        }

        fn output_files(&self) -> Vec<PathBuf> {
            std::fs::read_dir(&self.config.output_dir).unwrap()
                .map(|e| e.unwrap().path())
                .collect()
        }
    }

    #[tokio::test]
    async fn test_mov_upload_square_for_springfield() {
        let mut h = harness(FakeToolkit::default(), true);
        let job = h.upload("Springfield", "clip.mov", AspectProfile::Square);

        let job = h.orchestrator.run(job).await;
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.stage, JobStage::Completed);

        let final_asset = h.toolkit.asset(&job.paths.output).unwrap();
        assert_eq!(final_asset.resolution(), "720x720");
        assert!((final_asset.duration_seconds - 8.0).abs() < 1e-9);

        let records = h.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0][0], "Springfield");
        assert_eq!(records[0][1], "square");
        assert_eq!(records[0][2], "mobile (Android)");
        assert_eq!(records[0][4], "8");
        assert_eq!(records[0][5], "720x720");
        assert_eq!(records[0][6], "success");

        assert_eq!(h.percents(), vec![10, 20, 30, 45, 70, 90, 100]);
        assert_eq!(job.artifacts, job.paths.all());
        assert_eq!(h.ctx.reaper.pending(), 1);
    }

    #[tokio::test]
    async fn test_final_event_carries_download_link() {
        let mut h = harness(FakeToolkit::default(), true);
        let job = h.upload("Springfield", "clip.mp4", AspectProfile::Vertical);
        let job = h.orchestrator.run(job).await;

        let mut last = None;
        while let Ok(event) = h.events.try_recv() {
            last = Some(event);
        }
        let last = last.unwrap();
        assert_eq!(last.percent, 100);
        let name = job.paths.output.file_name().unwrap().to_string_lossy().to_string();
        assert_eq!(last.download_url, Some(format!("/static/videos/output/{}", name)));
        assert_eq!(h.toolkit.asset(&job.paths.output).unwrap().resolution(), "1080x1920");
    }

    #[tokio::test]
    async fn test_unknown_municipality_fails_cleanly() {
        let mut h = harness(FakeToolkit::default(), true);
        let job = h.upload("Unknown City", "clip.mov", AspectProfile::Square);

        let job = h.orchestrator.run(job).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.reason.as_deref().unwrap().contains("Unknown City"));

        assert!(h.output_files().is_empty());
        assert!(!job.paths.upload.exists());
        assert!(!job.paths.normalized.exists());

        let records = h.records();
        assert_eq!(records.len(), 1);
        assert!(records[0][6].starts_with("error:"));
        assert_eq!(records[0][4], "");
        assert_eq!(records[0][5], "");

        let percents = h.percents();
        assert_eq!(percents.last(), Some(&100));
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn test_missing_closing_clip_file() {
        let mut h = harness(FakeToolkit::default(), false);
        let job = h.upload("Springfield", "clip.mov", AspectProfile::Horizontal);

        let job = h.orchestrator.run(job).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert!(!job.paths.upload.exists());
        assert!(!job.paths.normalized.exists());
        assert!(h.output_files().is_empty());
        assert_eq!(h.percents(), vec![10, 20, 30, 100]);

        let records = h.records();
        assert_eq!(records.len(), 1);
        assert!(records[0][6].starts_with("error:"), "{}", records[0][6]);
        assert_eq!(records[0][4], "");
        assert_eq!(records[0][5], "");

        // Only the state file waits for the retention window
        assert!(job_state_path(&h.config.job_state_dir, &job.id).exists());
        assert_eq!(h.ctx.reaper.pending(), 1);
    }

    #[tokio::test]
    async fn test_portrait_upload_to_horizontal_has_even_frame() {
        let h = harness(FakeToolkit::default(), true);
        let job = h.upload_sized("Springfield", "portrait.mp4", AspectProfile::Horizontal, 1080, 1920);

        let job = h.orchestrator.run(job).await;
        assert_eq!(job.status, JobStatus::Succeeded);

        let final_asset = h.toolkit.asset(&job.paths.output).unwrap();
        assert_eq!(final_asset.resolution(), "1076x606");
        assert_eq!(final_asset.width % 2, 0);
        assert_eq!(final_asset.height % 2, 0);

        let adjusted = h.toolkit.asset(&job.paths.adjusted_closing).unwrap();
        assert_eq!(adjusted.size(), final_asset.size());

        let yuv420p_encodes = h.toolkit.commands().into_iter()
            .filter(|args| args.iter().any(|a| a == "yuv420p"))
            .count();
        assert_eq!(yuv420p_encodes, 3);
    }

    #[tokio::test]
    async fn test_state_file_reaped_with_artifacts() {
        let h = harness_with(FakeToolkit::default(), true, |c| c.retention_secs = 0);
        let job = h.upload("Springfield", "clip.mov", AspectProfile::Square);

        let job = h.orchestrator.run(job).await;
        assert_eq!(job.status, JobStatus::Succeeded);

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        for path in job.paths.all() {
            assert!(!path.exists(), "{} should be gone", path.display());
        }
        assert_eq!(h.state_files(), 0);
        assert_eq!(h.ctx.reaper.pending(), 0);
    }

    #[tokio::test]
    async fn test_failed_job_state_file_reaped() {
        let h = harness_with(FakeToolkit::default(), true, |c| c.retention_secs = 0);
        let job = h.upload("Unknown City", "clip.mp4", AspectProfile::Square);

        let job = h.orchestrator.run(job).await;
        assert_eq!(job.status, JobStatus::Failed);

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert_eq!(h.state_files(), 0);
        assert_eq!(h.records().len(), 1);
    }

    #[tokio::test]
    async fn test_retention_resumed_after_restart() {
        let h = harness(FakeToolkit::default(), true);

        let mut old = h.upload("Springfield", "old.mp4", AspectProfile::Square);
        std::fs::write(&old.paths.output, b"fake video").unwrap();
        old.add_artifact(&old.paths.upload.clone());
        old.add_artifact(&old.paths.output.clone());
        old.succeed();
        old.finished_at = Some(Utc::now() - chrono::Duration::hours(2));
        save_job(&old, &h.config.job_state_dir).unwrap();

        let mut recent = h.upload("Springfield", "recent.mp4", AspectProfile::Square);
        recent.add_artifact(&recent.paths.upload.clone());
        recent.succeed();
        save_job(&recent, &h.config.job_state_dir).unwrap();

        let mut running = h.upload("Springfield", "running.mp4", AspectProfile::Square);
        running.stage = JobStage::Compositing;
        save_job(&running, &h.config.job_state_dir).unwrap();

        assert_eq!(h.orchestrator.resume_retention().unwrap(), 1);

        assert!(!old.paths.upload.exists());
        assert!(!old.paths.output.exists());
        assert!(!job_state_path(&h.config.job_state_dir, &old.id).exists());

        assert!(recent.paths.upload.exists());
        assert!(running.paths.upload.exists());
        assert_eq!(h.state_files(), 2);
        assert_eq!(h.ctx.reaper.pending(), 1);
    }

    #[tokio::test]
    async fn test_conversion_failure_stops_before_lookup() {
        let mut h = harness(FakeToolkit::default().fail_when_output_contains("_clip.mp4"), true);
        let job = h.upload("Springfield", "clip.mov", AspectProfile::Square);

        let job = h.orchestrator.run(job).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert!(!job.paths.upload.exists());
        assert!(!job.paths.normalized.exists());
        assert_eq!(h.percents(), vec![10, 20, 100]);
        assert_eq!(h.toolkit.commands().len(), 1);
    }

    #[tokio::test]
    async fn test_encoding_failure_keeps_closing_clip() {
        let mut h = harness(FakeToolkit::default().fail_when_output_contains("final_"), true);
        let job = h.upload("Springfield", "clip.mp4", AspectProfile::Square);

        let job = h.orchestrator.run(job).await;
        assert_eq!(job.status, JobStatus::Failed);
        for path in job.paths.all() {
            assert!(!path.exists(), "{} should be gone", path.display());
        }
        assert!(h.config.closing_clip_dir.join("springfield.mp4").exists());

        let records = h.records();
        assert_eq!(records.len(), 1);
        assert!(records[0][6].starts_with("error:encoding failed"));
        assert_eq!(h.percents(), vec![10, 20, 30, 45, 70, 100]);
    }

    #[tokio::test]
    async fn test_job_state_is_persisted() {
        let h = harness(FakeToolkit::default(), true);
        let job = h.upload("Springfield", "clip.mp4", AspectProfile::Square);
        let id = job.id.clone();
        h.orchestrator.run(job).await;

        let jobs = load_all_jobs(&h.config.job_state_dir).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, id);
        assert_eq!(jobs[0].status, JobStatus::Succeeded);
        assert!(jobs[0].finished_at.is_some());
    }

    #[tokio::test]
    async fn test_interrupted_jobs_are_failed_on_recovery() {
        let mut h = harness(FakeToolkit::default(), true);
        let mut stale = h.upload("Springfield", "clip.mov", AspectProfile::Square);
        stale.stage = JobStage::Compositing;
        save_job(&stale, &h.config.job_state_dir).unwrap();

        assert_eq!(h.orchestrator.recover_interrupted().unwrap(), 1);
        assert!(!stale.paths.upload.exists());

        let jobs = load_all_jobs(&h.config.job_state_dir).unwrap();
        assert_eq!(jobs[0].status, JobStatus::Failed);
        assert_eq!(h.records().len(), 1);
        assert_eq!(h.percents(), vec![100]);

        assert_eq!(h.orchestrator.recover_interrupted().unwrap(), 0);
    }
}
