use crate::downscale::downscale_to_fit;
use crate::error::Result;
use crate::source::{ImageLimits, ResolvedImage};
use crate::temp::TempResources;
use base64::Engine;

/// Shrinks `image` below the API payload ceiling and encodes it as a
/// `data:` URL ready for an image content part.
pub async fn prepare_for_api(
    image: &ResolvedImage,
    limits: &ImageLimits,
    temp: &mut TempResources,
) -> Result<String> {
    let outcome = downscale_to_fit(image, limits.api_max_bytes, limits.min_dimension, temp).await?;
    let last = outcome.sizes.last().copied().unwrap_or_default();
    if last > limits.api_max_bytes {
        tracing::warn!(
            bytes = last,
            limit = limits.api_max_bytes,
            "source still above api ceiling after downscale; sending anyway"
        );
    }
    let bytes = tokio::fs::read(&outcome.image.path).await?;
    Ok(to_data_url(outcome.image.mime(), &bytes))
}

pub fn to_data_url(mime: &str, bytes: &[u8]) -> String {
    format!(
        "data:{mime};base64,{}",
        base64::engine::general_purpose::STANDARD.encode(bytes)
    )
}
