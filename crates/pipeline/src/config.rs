use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration for the closing-clip pipeline daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Path to the ffmpeg binary
    pub ffmpeg_bin: PathBuf,
    /// Path to the ffprobe binary
    pub ffprobe_bin: PathBuf,
    /// Directory where accepted uploads and their normalized/adjusted copies live
    pub upload_dir: PathBuf,
    /// Directory where final composited videos are written
    pub output_dir: PathBuf,
    /// Directory holding the municipality closing clips (never written to)
    pub closing_clip_dir: PathBuf,
    /// Text file mapping `<Name>.mp4 -> <closing clip file>`
    pub mapping_file: PathBuf,
    /// Text file listing one municipality per line
    pub municipalities_file: PathBuf,
    /// Append-only CSV statistics log
    pub statistics_file: PathBuf,
    /// Directory where job state JSON files are stored
    pub job_state_dir: PathBuf,
    /// Spool directory polled for upload manifests
    pub intake_dir: PathBuf,
    /// Directory where per-session progress streams are written
    pub progress_dir: PathBuf,
    /// Public prefix of download links handed to clients
    pub download_base: String,
    /// Number of jobs encoding at the same time
    pub max_concurrent_jobs: usize,
    /// Number of accepted jobs allowed to wait for a worker
    pub queue_capacity: usize,
    /// Seconds after which a finished job's artifacts are deleted
    pub retention_secs: u64,
    /// Interval in seconds between intake scans
    pub scan_interval_secs: u64,
    /// Kill an ffmpeg process running longer than this (None = no limit)
    pub ffmpeg_timeout_secs: Option<u64>,
    /// Canonical video codec
    pub video_codec: String,
    /// Canonical audio codec
    pub audio_codec: String,
    /// Video bitrate of the final output (e.g. "2000k")
    pub video_bitrate: String,
    /// Encoder preset, trading quality for turnaround
    pub preset: String,
    /// Output height of the vertical profile
    pub vertical_height: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl PipelineConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        let root = PathBuf::from("static");
        Self {
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            upload_dir: root.join("videos/uploaded"),
            output_dir: root.join("videos/output"),
            closing_clip_dir: root.join("videos/cierre"),
            mapping_file: PathBuf::from("file_mapping.txt"),
            municipalities_file: PathBuf::from("municipios.txt"),
            statistics_file: root.join("estadisticas/video_statistics.csv"),
            job_state_dir: PathBuf::from("/tmp/clipd-jobs"),
            intake_dir: PathBuf::from("/tmp/clipd-intake"),
            progress_dir: PathBuf::from("/tmp/clipd-progress"),
            download_base: "/static/videos/output".to_string(),
            max_concurrent_jobs: 2,
            queue_capacity: 16,
            retention_secs: 600, // 10 minutes
            scan_interval_secs: 2,
            ffmpeg_timeout_secs: Some(3600),
            video_codec: "libx264".to_string(),
            audio_codec: "aac".to_string(),
            video_bitrate: "2000k".to_string(),
            preset: "fast".to_string(),
            vertical_height: 1920,
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        if config.max_concurrent_jobs == 0 {
            anyhow::bail!("max_concurrent_jobs must be at least 1");
        }

        Ok(config)
    }

    /// Create every directory the pipeline writes into
    pub fn ensure_dirs(&self) -> Result<()> {
        let mut dirs = vec![
            self.upload_dir.clone(),
            self.output_dir.clone(),
            self.job_state_dir.clone(),
            self.intake_dir.clone(),
            self.progress_dir.clone(),
        ];
        if let Some(parent) = self.statistics_file.parent() {
            if !parent.as_os_str().is_empty() {
                dirs.push(parent.to_path_buf());
            }
        }

        for dir in dirs {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }
        Ok(())
    }

    /// Retention window as a Duration
    pub fn retention(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.retention_secs)
    }

    /// Public download link for a produced output file
    pub fn download_url(&self, output: &Path) -> String {
        let name = output
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        format!("{}/{}", self.download_base.trim_end_matches('/'), name)
    }
}
