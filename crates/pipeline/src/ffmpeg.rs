use std::path::{Path, PathBuf};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use log::{debug, info};
use tokio::process::Command;
use crate::asset::VideoAsset;
use crate::config::PipelineConfig;
use crate::ffprobe::FFProbeData;

/// Oldest ffmpeg release with every filter the pipeline uses
const MIN_FFMPEG_MAJOR: u32 = 4;

/// Sample rate used for generated silence and for every adjusted clip
const AUDIO_SAMPLE_RATE: u32 = 44100;

/// FFmpeg version information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FFmpegVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl FFmpegVersion {
    /// Check if this version meets the minimum requirement
    pub fn meets_requirement(&self) -> bool {
        self.major >= MIN_FFMPEG_MAJOR
    }

    /// Parse version from FFmpeg version string
    /// Example: "ffmpeg version 6.1.1-3ubuntu5" -> FFmpegVersion { major: 6, minor: 1, patch: 1 }
    pub fn parse(version_str: &str) -> Result<Self> {
        let version_part = version_str
            .split_whitespace()
            .find(|s| s.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false))
            .ok_or_else(|| anyhow!("No version number found in: {}", version_str))?;

        // Distribution builds append suffixes such as "-3ubuntu5"
        let numeric: String = version_part
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();

        let mut parts = numeric.split('.').filter(|p| !p.is_empty());

        let major = parts.next()
            .ok_or_else(|| anyhow!("Invalid version format: {}", version_str))?
            .parse::<u32>()
            .with_context(|| format!("Failed to parse major version from: {}", version_part))?;
        let minor = parts.next().and_then(|p| p.parse::<u32>().ok()).unwrap_or(0);
        let patch = parts.next().and_then(|p| p.parse::<u32>().ok()).unwrap_or(0);

        Ok(FFmpegVersion { major, minor, patch })
    }
}

/// Result from FFmpeg execution
#[derive(Debug, Clone)]
pub struct FFmpegResult {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Media operations the pipeline needs from ffmpeg/ffprobe
#[async_trait]
pub trait MediaToolkit: Send + Sync {
    /// Read size, frame rate, duration and audio presence of a video file
    async fn probe(&self, path: &Path) -> Result<VideoAsset>;

    /// Run ffmpeg with the given arguments; a non-zero exit is an error
    async fn run_ffmpeg(&self, args: Vec<String>) -> Result<FFmpegResult>;
}

/// Manager for the native FFmpeg binaries
pub struct FFmpegManager {
    pub ffmpeg_bin: PathBuf,
    pub ffprobe_bin: PathBuf,
    pub version: FFmpegVersion,
    pub timeout_secs: Option<u64>,
}

impl FFmpegManager {
    /// Initialize FFmpeg manager with version validation
    pub async fn new(config: &PipelineConfig) -> Result<Self> {
        let ffmpeg_bin = config.ffmpeg_bin.clone();
        let ffprobe_bin = config.ffprobe_bin.clone();

        let version = Self::detect_version(&ffmpeg_bin).await?;

        if !version.meets_requirement() {
            return Err(anyhow!(
                "FFmpeg version {}.{}.{} does not meet requirement (>= {}.0)",
                version.major, version.minor, version.patch, MIN_FFMPEG_MAJOR
            ));
        }

        info!("🎬 Using FFmpeg {}.{}.{} at {}",
              version.major, version.minor, version.patch, ffmpeg_bin.display());

        Ok(FFmpegManager {
            ffmpeg_bin,
            ffprobe_bin,
            version,
            timeout_secs: config.ffmpeg_timeout_secs,
        })
    }

    /// Detect FFmpeg version
    async fn detect_version(ffmpeg_bin: &Path) -> Result<FFmpegVersion> {
        let output = Command::new(ffmpeg_bin)
            .arg("-version")
            .output()
            .await
            .with_context(|| format!("Failed to execute FFmpeg at: {}", ffmpeg_bin.display()))?;

        if !output.status.success() {
            return Err(anyhow!("FFmpeg version check failed"));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let first_line = stdout.lines().next()
            .ok_or_else(|| anyhow!("Empty output from FFmpeg -version"))?;

        FFmpegVersion::parse(first_line)
    }

    /// Execute FFmpeg with captured output and an optional timeout
    pub async fn execute_ffmpeg(
        &self,
        args: Vec<String>,
        timeout_secs: Option<u64>,
    ) -> Result<FFmpegResult> {
        use tokio::io::{AsyncBufReadExt, BufReader};
        use tokio::time::{timeout, Duration};

        let cmd_str = format!("{} {}", self.ffmpeg_bin.display(), args.join(" "));
        debug!("Executing FFmpeg: {}", cmd_str);

        let mut cmd = Command::new(&self.ffmpeg_bin);
        cmd.args(&args);
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn()
            .with_context(|| format!(
                "Failed to spawn FFmpeg process at: {}. Ensure FFmpeg is installed and accessible.",
                self.ffmpeg_bin.display()
            ))?;

        let stdout = child.stdout.take()
            .ok_or_else(|| anyhow!("Failed to capture FFmpeg stdout"))?;
        let stderr = child.stderr.take()
            .ok_or_else(|| anyhow!("Failed to capture FFmpeg stderr"))?;

        let stdout_handle = tokio::spawn(async move {
            let mut lines = Vec::new();
            let mut line_stream = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = line_stream.next_line().await {
                lines.push(line);
            }
            lines.join("\n")
        });

        let stderr_handle = tokio::spawn(async move {
            let mut lines = Vec::new();
            let mut line_stream = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = line_stream.next_line().await {
                lines.push(line);
            }
            lines.join("\n")
        });

        let status = if let Some(timeout_secs) = timeout_secs {
            match timeout(Duration::from_secs(timeout_secs), child.wait()).await {
                Ok(result) => result.context("Failed to wait for FFmpeg process")?,
                Err(_) => {
                    child.kill().await.context("Failed to kill stuck FFmpeg process")?;
                    return Err(anyhow!(
                        "FFmpeg process timed out after {} seconds. Process was killed.",
                        timeout_secs
                    ));
                }
            }
        } else {
            child.wait().await.context("Failed to wait for FFmpeg process")?
        };

        let stdout = stdout_handle.await.context("Failed to read FFmpeg stdout")?;
        let stderr = stderr_handle.await.context("Failed to read FFmpeg stderr")?;

        if !status.success() {
            return Err(anyhow!(
                "FFmpeg failed (exit code: {})\nCommand: {}\nSTDERR:\n{}",
                status.code().unwrap_or(-1),
                cmd_str,
                last_lines(&stderr, 20)
            ));
        }

        debug!("FFmpeg execution completed successfully");

        Ok(FFmpegResult {
            exit_code: status.code(),
            stdout,
            stderr,
        })
    }

    /// Execute FFprobe and return its JSON output
    pub async fn execute_ffprobe(&self, file_path: &Path) -> Result<String> {
        if !file_path.exists() {
            return Err(anyhow!("File does not exist: {}", file_path.display()));
        }

        debug!("Executing FFprobe for: {}", file_path.display());

        let output = Command::new(&self.ffprobe_bin)
            .arg("-v")
            .arg("error")
            .arg("-print_format")
            .arg("json")
            .arg("-show_streams")
            .arg("-show_format")
            .arg(file_path)
            .output()
            .await
            .with_context(|| format!(
                "Failed to execute FFprobe for: {}. Ensure FFprobe is installed and accessible at: {}",
                file_path.display(),
                self.ffprobe_bin.display()
            ))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "FFprobe failed (exit code {}) for {}:\nSTDERR: {}",
                output.status.code().unwrap_or(-1),
                file_path.display(),
                stderr
            ));
        }

        String::from_utf8(output.stdout).context("FFprobe output is not valid UTF-8")
    }
}

#[async_trait]
impl MediaToolkit for FFmpegManager {
    async fn probe(&self, path: &Path) -> Result<VideoAsset> {
        let json = self.execute_ffprobe(path).await?;
        FFProbeData::parse(&json)?.to_asset(path)
    }

    async fn run_ffmpeg(&self, args: Vec<String>) -> Result<FFmpegResult> {
        self.execute_ffmpeg(args, self.timeout_secs).await
    }
}

/// Tail of a long ffmpeg log, enough to show the actual error
pub fn last_lines(text: &str, count: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(count);
    lines[start..].join("\n")
}

/// Codec settings shared by every encode of a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeSettings {
    pub video_codec: String,
    pub audio_codec: String,
    pub video_bitrate: String,
    pub preset: String,
}

impl EncodeSettings {
    pub fn from_config(cfg: &PipelineConfig) -> Self {
        EncodeSettings {
            video_codec: cfg.video_codec.clone(),
            audio_codec: cfg.audio_codec.clone(),
            video_bitrate: cfg.video_bitrate.clone(),
            preset: cfg.preset.clone(),
        }
    }
}

impl Default for EncodeSettings {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default_config())
    }
}

/// Command builder for generating FFmpeg command lines
pub struct CommandBuilder<'a> {
    settings: &'a EncodeSettings,
}

impl<'a> CommandBuilder<'a> {
    pub fn new(settings: &'a EncodeSettings) -> Self {
        CommandBuilder { settings }
    }

    fn base_args() -> Vec<String> {
        vec![
            "-hide_banner".to_string(),
            "-v".to_string(),
            "error".to_string(),
            "-y".to_string(),
        ]
    }

    /// Re-encode any container into the canonical MP4 (H.264 + AAC)
    pub fn build_normalize_command(&self, input: &Path, output: &Path) -> Vec<String> {
        let mut args = Self::base_args();

        args.push("-i".to_string());
        args.push(input.to_string_lossy().to_string());

        // First video stream, first audio stream if present
        args.push("-map".to_string());
        args.push("0:v:0".to_string());
        args.push("-map".to_string());
        args.push("0:a:0?".to_string());

        args.push("-c:v".to_string());
        args.push(self.settings.video_codec.clone());
        args.push("-pix_fmt".to_string());
        args.push("yuv420p".to_string());
        args.push("-c:a".to_string());
        args.push(self.settings.audio_codec.clone());

        args.push("-movflags".to_string());
        args.push("+faststart".to_string());

        args.push(output.to_string_lossy().to_string());
        args
    }

    /// Apply a video filter chain to one clip and normalize its audio layout
    ///
    /// Clips without audio get a silent stereo track so every adjusted clip has one
    /// video and one audio stream with identical parameters.
    pub fn build_adjust_command(
        &self,
        clip: &VideoAsset,
        video_filter: &str,
        output: &Path,
    ) -> Vec<String> {
        let mut args = Self::base_args();

        args.push("-i".to_string());
        args.push(clip.path.to_string_lossy().to_string());

        let audio_source = if clip.has_audio {
            "0:a:0".to_string()
        } else {
            args.push("-f".to_string());
            args.push("lavfi".to_string());
            args.push("-i".to_string());
            args.push(format!("anullsrc=channel_layout=stereo:sample_rate={}", AUDIO_SAMPLE_RATE));
            "1:a:0".to_string()
        };

        args.push("-filter_complex".to_string());
        args.push(format!("[0:v]{}[v]", video_filter));
        args.push("-map".to_string());
        args.push("[v]".to_string());
        args.push("-map".to_string());
        args.push(audio_source);

        args.push("-c:v".to_string());
        args.push(self.settings.video_codec.clone());
        args.push("-preset".to_string());
        args.push(self.settings.preset.clone());
        // Intermediate files are re-encoded again; keep them near-lossless
        args.push("-crf".to_string());
        args.push("18".to_string());
        args.push("-pix_fmt".to_string());
        args.push("yuv420p".to_string());

        args.push("-c:a".to_string());
        args.push(self.settings.audio_codec.clone());
        args.push("-ar".to_string());
        args.push(AUDIO_SAMPLE_RATE.to_string());
        args.push("-ac".to_string());
        args.push("2".to_string());

        if !clip.has_audio {
            args.push("-shortest".to_string());
        }

        args.push(output.to_string_lossy().to_string());
        args
    }

    /// Concatenate two adjusted clips and re-encode at the bounded bitrate
    pub fn build_concat_command(&self, first: &Path, second: &Path, output: &Path) -> Vec<String> {
        let mut args = Self::base_args();

        args.push("-i".to_string());
        args.push(first.to_string_lossy().to_string());
        args.push("-i".to_string());
        args.push(second.to_string_lossy().to_string());

        args.push("-filter_complex".to_string());
        args.push("[0:v][0:a][1:v][1:a]concat=n=2:v=1:a=1[v][a]".to_string());
        args.push("-map".to_string());
        args.push("[v]".to_string());
        args.push("-map".to_string());
        args.push("[a]".to_string());

        args.push("-c:v".to_string());
        args.push(self.settings.video_codec.clone());
        args.push("-b:v".to_string());
        args.push(self.settings.video_bitrate.clone());
        args.push("-preset".to_string());
        args.push(self.settings.preset.clone());
        args.push("-pix_fmt".to_string());
        args.push("yuv420p".to_string());
        args.push("-c:a".to_string());
        args.push(self.settings.audio_codec.clone());

        args.push("-movflags".to_string());
        args.push("+faststart".to_string());

        args.push(output.to_string_lossy().to_string());
        args
    }
}
