use std::path::{Path, PathBuf};
use log::{debug, info, warn};
use crate::asset::VideoAsset;
use crate::error::{PipelineError, PipelineResult};
use crate::ffmpeg::{CommandBuilder, EncodeSettings, MediaToolkit};
use crate::geometry::{AspectProfile, CropPlan};

/// How the closing clip is brought to the uploaded clip's frame size and rate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reconciliation {
    pub resize: Option<(u32, u32)>,
    pub fps: Option<f64>,
}

impl Reconciliation {
    /// Shape of `clip` once the reconciliation is applied
    pub fn apply(&self, clip: &VideoAsset) -> VideoAsset {
        let mut out = clip.clone();
        if let Some((w, h)) = self.resize {
            out.width = w;
            out.height = h;
        }
        if let Some(fps) = self.fps {
            out.fps = fps;
        }
        out
    }

    fn filters(&self) -> Vec<String> {
        let mut parts = Vec::new();
        if let Some((w, h)) = self.resize {
            parts.push(format!("scale={}:{}", w, h));
        }
        if let Some(fps) = self.fps {
            parts.push(format!("fps={}", format_fps(fps)));
        }
        parts
    }
}

/// Decide how `second` must change to match `first`
///
/// When either size or frame rate differ, both are forced to the first clip's values.
pub fn reconcile(first: &VideoAsset, second: &VideoAsset) -> Reconciliation {
    if first.same_shape(second) {
        Reconciliation { resize: None, fps: None }
    } else {
        Reconciliation {
            resize: Some(first.size()),
            fps: Some(first.fps),
        }
    }
}

fn format_fps(fps: f64) -> String {
    let s = format!("{:.4}", fps);
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}

/// Filter chains for both clips of a job
#[derive(Debug, Clone, PartialEq)]
pub struct AdjustPlan {
    pub reconciliation: Reconciliation,
    pub input_crop: CropPlan,
    pub closing_crop: CropPlan,
    pub input_filter: String,
    pub closing_filter: String,
}

impl AdjustPlan {
    pub fn new(
        input: &VideoAsset,
        closing: &VideoAsset,
        profile: AspectProfile,
        vertical_height: u32,
    ) -> Self {
        let reconciliation = reconcile(input, closing);
        let closing_shape = reconciliation.apply(closing);

        let input_crop = CropPlan::compute(input.width, input.height, profile, vertical_height);
        let closing_crop = CropPlan::compute(closing_shape.width, closing_shape.height, profile, vertical_height);

        let mut closing_parts = reconciliation.filters();
        closing_parts.push(closing_crop.to_filter());

        AdjustPlan {
            reconciliation,
            input_crop,
            closing_crop,
            input_filter: input_crop.to_filter(),
            closing_filter: closing_parts.join(","),
        }
    }
}

/// Final composited video
#[derive(Debug, Clone, PartialEq)]
pub struct Composite {
    pub path: PathBuf,
    pub duration_seconds: f64,
    pub resolution: String,
}

/// Aligns, reframes and concatenates the uploaded clip with the closing clip
pub struct ClipCompositor<'a> {
    toolkit: &'a dyn MediaToolkit,
    settings: &'a EncodeSettings,
    vertical_height: u32,
}

impl<'a> ClipCompositor<'a> {
    pub fn new(toolkit: &'a dyn MediaToolkit, settings: &'a EncodeSettings, vertical_height: u32) -> Self {
        ClipCompositor { toolkit, settings, vertical_height }
    }

    /// Reconcile and reframe both clips into `input_out` and `closing_out`
    pub async fn adjust(
        &self,
        input: &VideoAsset,
        closing: &VideoAsset,
        profile: AspectProfile,
        input_out: &Path,
        closing_out: &Path,
    ) -> PipelineResult<AdjustPlan> {
        let plan = AdjustPlan::new(input, closing, profile, self.vertical_height);

        if plan.reconciliation.resize.is_some() {
            info!("Closing clip {}x{}@{:.2} differs from upload {}x{}@{:.2}, matching it",
                  closing.width, closing.height, closing.fps,
                  input.width, input.height, input.fps);
        }
        debug!("Input filter: {}", plan.input_filter);
        debug!("Closing filter: {}", plan.closing_filter);

        let builder = CommandBuilder::new(self.settings);

        let args = builder.build_adjust_command(input, &plan.input_filter, input_out);
        self.encode(args, input_out).await?;

        let args = builder.build_adjust_command(closing, &plan.closing_filter, closing_out);
        self.encode(args, closing_out).await?;

        Ok(plan)
    }

    /// Concatenate the adjusted clips in order and probe the result
    pub async fn concatenate(&self, first: &Path, second: &Path, output: &Path) -> PipelineResult<Composite> {
        let args = CommandBuilder::new(self.settings).build_concat_command(first, second, output);
        self.encode(args, output).await?;

        let asset = self.toolkit.probe(output).await.map_err(|e| PipelineError::Encoding {
            detail: format!("output is not readable: {:#}", e),
        })?;

        Ok(Composite {
            path: output.to_path_buf(),
            duration_seconds: asset.duration_seconds,
            resolution: asset.resolution(),
        })
    }

    async fn encode(&self, args: Vec<String>, output: &Path) -> PipelineResult<()> {
        if let Err(e) = self.toolkit.run_ffmpeg(args).await {
            if output.exists() {
                if let Err(rm) = std::fs::remove_file(output) {
                    warn!("Failed to remove partial output {}: {}", output.display(), rm);
                }
            }
            return Err(PipelineError::Encoding { detail: format!("{:#}", e) });
        }
        Ok(())
    }
}
