use std::path::PathBuf;
use serde::{Deserialize, Serialize};

/// Frame rates closer than this are treated as equal
const FPS_TOLERANCE: f64 = 0.01;

/// A video file on disk together with the properties the pipeline cares about
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoAsset {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub duration_seconds: f64,
    pub has_audio: bool,
}

impl VideoAsset {
    /// Resolution in the `WxH` form used by the statistics log
    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Same frame size and frame rate
    pub fn same_shape(&self, other: &VideoAsset) -> bool {
        self.size() == other.size() && (self.fps - other.fps).abs() < FPS_TOLERANCE
    }
}
