use std::path::Path;
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use crate::asset::VideoAsset;

/// Complete ffprobe output structure
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeData {
    pub streams: Vec<FFProbeStream>,
    pub format: FFProbeFormat,
}

/// Format-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeFormat {
    pub format_name: String,
    pub duration: Option<String>,
    pub bit_rate: Option<String>,
}

/// Stream-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeStream {
    pub index: i32,
    pub codec_type: Option<String>,
    pub codec_name: Option<String>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub avg_frame_rate: Option<String>,
    pub r_frame_rate: Option<String>,
    pub duration: Option<String>,
}

impl FFProbeData {
    /// Parse the JSON printed by `ffprobe -print_format json -show_streams -show_format`
    pub fn parse(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse ffprobe JSON")
    }

    /// First video stream, if any
    pub fn video_stream(&self) -> Option<&FFProbeStream> {
        self.streams.iter().find(|s| s.codec_type.as_deref() == Some("video"))
    }

    /// Whether the container carries at least one audio stream
    pub fn has_audio(&self) -> bool {
        self.streams.iter().any(|s| s.codec_type.as_deref() == Some("audio"))
    }

    /// Turn probe output into the asset description used by the pipeline
    pub fn to_asset(&self, path: &Path) -> Result<VideoAsset> {
        let video = self
            .video_stream()
            .ok_or_else(|| anyhow!("No video stream in {}", path.display()))?;

        let width = video.width.filter(|w| *w > 0)
            .ok_or_else(|| anyhow!("Video stream has no width: {}", path.display()))?;
        let height = video.height.filter(|h| *h > 0)
            .ok_or_else(|| anyhow!("Video stream has no height: {}", path.display()))?;

        // avg_frame_rate is 0/0 for some containers; fall back to r_frame_rate
        let fps = video.avg_frame_rate.as_deref()
            .and_then(parse_frame_rate)
            .or_else(|| video.r_frame_rate.as_deref().and_then(parse_frame_rate))
            .ok_or_else(|| anyhow!("Video stream has no usable frame rate: {}", path.display()))?;

        let duration_seconds = self.format.duration.as_deref()
            .or(video.duration.as_deref())
            .and_then(|d| d.parse::<f64>().ok())
            .unwrap_or(0.0);

        Ok(VideoAsset {
            path: path.to_path_buf(),
            width: width as u32,
            height: height as u32,
            fps,
            duration_seconds,
            has_audio: self.has_audio(),
        })
    }
}

/// Parse frame rate from string (e.g., "30/1", "30000/1001", "29.97")
pub fn parse_frame_rate(frame_rate_str: &str) -> Option<f64> {
    if let Some((num_str, den_str)) = frame_rate_str.split_once('/') {
        if let (Ok(num), Ok(den)) = (num_str.parse::<f64>(), den_str.parse::<f64>()) {
            if den != 0.0 && num > 0.0 {
                return Some(num / den);
            }
        }
        return None;
    }

    frame_rate_str.parse::<f64>().ok()
        .filter(|&f| f > 0.0 && f < 1000.0)
}
