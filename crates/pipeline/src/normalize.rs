use std::path::{Path, PathBuf};
use log::{info, warn};
use crate::error::{PipelineError, PipelineResult};
use crate::ffmpeg::{CommandBuilder, EncodeSettings, MediaToolkit};

/// Extension of the canonical container
pub const CANONICAL_EXTENSION: &str = "mp4";

/// Whether the file is already in the canonical container, judged by extension
pub fn is_canonical(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|ext| ext.eq_ignore_ascii_case(CANONICAL_EXTENSION))
        .unwrap_or(false)
}

/// Where the normalized copy of `input` is written: same directory, same stem, `.mp4`
pub fn normalized_path(input: &Path) -> PathBuf {
    input.with_extension(CANONICAL_EXTENSION)
}

/// Outcome of a successful normalization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalized {
    pub path: PathBuf,
    /// False when the input was already canonical and returned as-is
    pub reencoded: bool,
}

/// Ensure `input` is an MP4, re-encoding it if needed
///
/// On failure any partial output is removed; the caller owns discarding the upload.
pub async fn normalize(
    toolkit: &dyn MediaToolkit,
    settings: &EncodeSettings,
    input: &Path,
) -> PipelineResult<Normalized> {
    if is_canonical(input) {
        return Ok(Normalized { path: input.to_path_buf(), reencoded: false });
    }

    let output = normalized_path(input);
    info!("Converting {} to {}", input.display(), output.display());

    let args = CommandBuilder::new(settings).build_normalize_command(input, &output);
    match toolkit.run_ffmpeg(args).await {
        Ok(_) => Ok(Normalized { path: output, reencoded: true }),
        Err(e) => {
            if output.exists() {
                if let Err(rm) = std::fs::remove_file(&output) {
                    warn!("Failed to remove partial conversion {}: {}", output.display(), rm);
                }
            }
            Err(PipelineError::Conversion {
                path: input.to_path_buf(),
                detail: format!("{:#}", e),
            })
        }
    }
}
