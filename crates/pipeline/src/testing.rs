//! In-process stand-in for ffmpeg/ffprobe used by unit tests.
//!
//! Registered videos are real (tiny) files on disk; every ffmpeg invocation writes its
//! output file and records the shape the real command would have produced.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use crate::asset::VideoAsset;
use crate::config::PipelineConfig;
use crate::ffmpeg::{FFmpegResult, MediaToolkit};
use crate::ffprobe::parse_frame_rate;

/// Configuration rooted in `root` with Springfield and Shelbyville mapped.
/// Only `springfield.mp4` is expected to exist in the closing clip directory.
pub fn test_config(root: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::default_config();
    config.upload_dir = root.join("uploaded");
    config.output_dir = root.join("output");
    config.closing_clip_dir = root.join("cierre");
    config.statistics_file = root.join("estadisticas/video_statistics.csv");
    config.job_state_dir = root.join("jobs");
    config.intake_dir = root.join("intake");
    config.progress_dir = root.join("progress");
    config.municipalities_file = root.join("municipios.txt");
    config.mapping_file = root.join("file_mapping.txt");
    config.ensure_dirs().unwrap();

    std::fs::write(&config.municipalities_file, "Springfield\nShelbyville\n").unwrap();
    std::fs::write(
        &config.mapping_file,
        "Springfield.mp4 -> springfield.mp4\nShelbyville.mp4 -> shelbyville.mp4\n",
    ).unwrap();
    config
}

#[derive(Default)]
pub struct FakeToolkit {
    assets: Mutex<HashMap<PathBuf, VideoAsset>>,
    commands: Mutex<Vec<Vec<String>>>,
    fail_patterns: Vec<String>,
}

impl FakeToolkit {
    /// Make every command whose output path contains `pattern` fail after writing a partial file
    pub fn fail_when_output_contains(mut self, pattern: &str) -> Self {
        self.fail_patterns.push(pattern.to_string());
        self
    }

    /// Create a file at `path` and register its video properties
    pub fn add_video(&self, path: &Path, width: u32, height: u32, fps: f64, duration: f64, has_audio: bool) -> VideoAsset {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, b"fake video").unwrap();
        let asset = VideoAsset {
            path: path.to_path_buf(),
            width,
            height,
            fps,
            duration_seconds: duration,
            has_audio,
        };
        self.assets.lock().unwrap().insert(path.to_path_buf(), asset.clone());
        asset
    }

    pub fn asset(&self, path: &Path) -> Option<VideoAsset> {
        self.assets.lock().unwrap().get(path).cloned()
    }

    pub fn commands(&self) -> Vec<Vec<String>> {
        self.commands.lock().unwrap().clone()
    }

    fn lookup(&self, path: &str) -> Result<VideoAsset> {
        self.asset(Path::new(path))
            .ok_or_else(|| anyhow!("{}: No such file or directory", path))
    }

    fn produce(&self, args: &[String], output: &Path) -> Result<VideoAsset> {
        let inputs: Vec<&String> = args.iter().enumerate()
            .filter(|(_, a)| *a == "-i")
            .filter_map(|(i, _)| args.get(i + 1))
            .filter(|a| !a.starts_with("anullsrc"))
            .collect();
        let first = inputs.first().ok_or_else(|| anyhow!("no input"))?;
        let mut asset = self.lookup(first)?;

        let filter = args.iter().position(|a| a == "-filter_complex")
            .and_then(|i| args.get(i + 1));

        match filter {
            Some(f) if f.contains("concat=n=2") => {
                let second = self.lookup(inputs.get(1).ok_or_else(|| anyhow!("no second input"))?)?;
                asset.duration_seconds += second.duration_seconds;
            }
            Some(f) => {
                let chain = f.trim_start_matches("[0:v]").trim_end_matches("[v]");
                for part in chain.split(',') {
                    let (name, params) = part.split_once('=').unwrap_or((part, ""));
                    let nums: Vec<&str> = params.split(':').collect();
                    match name {
                        "scale" | "crop" => {
                            asset.width = nums[0].parse()?;
                            asset.height = nums[1].parse()?;
                        }
                        "fps" => {
                            asset.fps = parse_frame_rate(params).ok_or_else(|| anyhow!("bad fps"))?;
                        }
                        _ => {}
                    }
                }
                asset.has_audio = true;
            }
            None => {}
        }

        asset.path = output.to_path_buf();
        Ok(asset)
    }
}

#[async_trait]
impl MediaToolkit for FakeToolkit {
    async fn probe(&self, path: &Path) -> Result<VideoAsset> {
        if !path.exists() {
            return Err(anyhow!("File does not exist: {}", path.display()));
        }
        self.asset(path).ok_or_else(|| anyhow!("Invalid data found when processing input"))
    }

    async fn run_ffmpeg(&self, args: Vec<String>) -> Result<FFmpegResult> {
        self.commands.lock().unwrap().push(args.clone());

        let output = PathBuf::from(args.last().ok_or_else(|| anyhow!("no output"))?);
        let out_str = output.to_string_lossy().to_string();

        if self.fail_patterns.iter().any(|p| out_str.contains(p.as_str())) {
            std::fs::write(&output, b"partial")?;
            return Err(anyhow!("FFmpeg failed (exit code: 1)\nConversion failed!"));
        }

        let asset = self.produce(&args, &output)?;
        std::fs::write(&output, b"fake video")?;
        self.assets.lock().unwrap().insert(output, asset);

        Ok(FFmpegResult {
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}
