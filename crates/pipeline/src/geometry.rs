use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Serialize};
use crate::error::ValidationError;

/// Named target framing of the final video
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AspectProfile {
    /// 1:1
    Square,
    /// 9:16, scaled to a fixed output height
    Vertical,
    /// 16:9
    Horizontal,
}

impl AspectProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            AspectProfile::Square => "square",
            AspectProfile::Vertical => "vertical",
            AspectProfile::Horizontal => "horizontal",
        }
    }
}

impl fmt::Display for AspectProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AspectProfile {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "square" => Ok(AspectProfile::Square),
            "vertical" => Ok(AspectProfile::Vertical),
            "horizontal" => Ok(AspectProfile::Horizontal),
            _ => Err(ValidationError::InvalidFormat(s.to_string())),
        }
    }
}

/// Centered crop, optionally followed by a resize
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropPlan {
    pub source_width: u32,
    pub source_height: u32,
    pub crop_width: u32,
    pub crop_height: u32,
    /// Resize applied after cropping (width, height)
    pub resize: Option<(u32, u32)>,
}

impl CropPlan {
    /// Compute the crop for a clip of size `(width, height)`
    ///
    /// Crop sides are floored to even numbers so every profile can be encoded as yuv420p.
    /// `vertical_height` is the output height of the vertical profile; the width follows
    /// the cropped aspect and is rounded to an even number.
    pub fn compute(width: u32, height: u32, profile: AspectProfile, vertical_height: u32) -> Self {
        let (w, h) = (width as u64, height as u64);

        let (crop_width, crop_height, resize) = match profile {
            AspectProfile::Square => {
                let side = even_floor(w.min(h));
                (side, side, None)
            }
            AspectProfile::Vertical => {
                let new_width = even_floor(w.min(h * 9 / 16));
                let new_height = even_floor(new_width * 16 / 9);
                let resize = if new_height > 0 {
                    let scaled = (new_width * vertical_height as u64) as f64 / new_height as f64;
                    let even = ((scaled / 2.0).round() as u64 * 2).max(2);
                    Some((even as u32, vertical_height))
                } else {
                    None
                };
                (new_width, new_height, resize)
            }
            AspectProfile::Horizontal => {
                let new_height = even_floor(h.min(w * 9 / 16));
                let new_width = even_floor(new_height * 16 / 9);
                (new_width, new_height, None)
            }
        };

        CropPlan {
            source_width: width,
            source_height: height,
            crop_width: crop_width as u32,
            crop_height: crop_height as u32,
            resize,
        }
    }

    /// Top-left corner of the crop window
    pub fn offset(&self) -> (u32, u32) {
        (
            (self.source_width - self.crop_width) / 2,
            (self.source_height - self.crop_height) / 2,
        )
    }

    /// Center of the crop window in source coordinates, doubled to stay integral
    pub fn center_x2(&self) -> (u32, u32) {
        let (x, y) = self.offset();
        (2 * x + self.crop_width, 2 * y + self.crop_height)
    }

    /// Frame size after crop and resize
    pub fn output_size(&self) -> (u32, u32) {
        self.resize.unwrap_or((self.crop_width, self.crop_height))
    }

    /// ffmpeg filter chain implementing the plan
    pub fn to_filter(&self) -> String {
        let (x, y) = self.offset();
        let mut parts = vec![format!("crop={}:{}:{}:{}", self.crop_width, self.crop_height, x, y)];
        if let Some((rw, rh)) = self.resize {
            parts.push(format!("scale={}:{}", rw, rh));
        }
        parts.push("setsar=1".to_string());
        parts.join(",")
    }
}

fn even_floor(n: u64) -> u64 {
    n & !1
}
