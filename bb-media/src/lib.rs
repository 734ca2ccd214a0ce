//! Local image handling for jobs: per-job temp files, source resolution,
//! downscaling and artifact materialization.

mod artifact;
mod downscale;
mod error;
mod format;
mod prepare;
mod source;
mod temp;

pub use artifact::{
    ARTIFACT_DOWNLOAD_TIMEOUT, ARTIFACT_MAX_BYTES, ArtifactMaterializer, MaterializedImage, decode_inline,
    output_file_name,
};
pub use downscale::{DownscaleOutcome, downscale_to_fit};
pub use error::{MediaError, Result};
pub use format::{OutputFormat, extension_of, mime_of, sniff};
pub use prepare::{prepare_for_api, to_data_url};
pub use source::{ImageLimits, ImageSource, ResolvedImage, SourceResolver};
pub use temp::TempResources;
