pub mod config;
pub mod error;
pub mod asset;
pub mod ffprobe;
pub mod ffmpeg;
pub mod geometry;
pub mod normalize;
pub mod compositor;
pub mod lookup;
pub mod client;
pub mod job;
pub mod progress;
pub mod stats;
pub mod reaper;
pub mod orchestrator;
pub mod pool;
pub mod intake;

#[cfg(test)]
mod testing;

pub use config::PipelineConfig;
pub use error::{PipelineError, PipelineResult, ValidationError};
pub use asset::VideoAsset;
pub use ffprobe::{FFProbeData, FFProbeFormat, FFProbeStream};
pub use ffmpeg::{FFmpegManager, MediaToolkit};
pub use geometry::{AspectProfile, CropPlan};
pub use job::{Job, JobStage, JobStatus};
pub use lookup::{ClosingClipCatalog, ClosingClipLookup};
pub use orchestrator::{JobOrchestrator, PipelineContext};
pub use pool::{JobAck, WorkerPool};
