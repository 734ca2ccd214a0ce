//! Iterative downscale of oversized sources.
//!
//! Each step halves both dimensions and re-encodes in the source format. A
//! step is kept only when its file is strictly smaller than the previous one;
//! the loop ends at the byte threshold, at the dimension floor, or on the
//! first step that does not shrink the file.

use crate::error::Result;
use crate::format::OutputFormat;
use crate::source::ResolvedImage;
use crate::temp::TempResources;
use image::DynamicImage;
use image::imageops::FilterType;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct DownscaleOutcome {
    pub image: ResolvedImage,
    /// Byte size of the original followed by every kept step.
    pub sizes: Vec<u64>,
}

/// Writes one halved candidate and reports its encoded size.
type HalveStep = fn(DynamicImage, OutputFormat, PathBuf, PathBuf) -> Result<(DynamicImage, u64)>;

#[tracing::instrument(level = "debug", skip_all, fields(path = %source.path.display(), max_bytes = max_bytes))]
pub async fn downscale_to_fit(
    source: &ResolvedImage,
    max_bytes: u64,
    min_dimension: u32,
    temp: &mut TempResources,
) -> Result<DownscaleOutcome> {
    downscale_with(source, max_bytes, min_dimension, temp, halve_and_write).await
}

async fn downscale_with(
    source: &ResolvedImage,
    max_bytes: u64,
    min_dimension: u32,
    temp: &mut TempResources,
    step: HalveStep,
) -> Result<DownscaleOutcome> {
    let mut size = tokio::fs::metadata(&source.path).await?.len();
    let mut sizes = vec![size];
    if size <= max_bytes {
        return Ok(DownscaleOutcome {
            image: source.clone(),
            sizes,
        });
    }

    // Re-encode in a format we can write; GIF sources come out as PNG.
    let target = match source.format {
        image::ImageFormat::Jpeg => OutputFormat::Jpg,
        image::ImageFormat::WebP => OutputFormat::Webp,
        _ => OutputFormat::Png,
    };
    let path = source.path.clone();
    let mut current_img = tokio::task::spawn_blocking(move || -> Result<DynamicImage> {
        Ok(image::ImageReader::open(path)?.with_guessed_format()?.decode()?)
    })
    .await??;
    let mut current = source.clone();

    while size > max_bytes {
        let (width, height) = (current_img.width() / 2, current_img.height() / 2);
        if width < min_dimension.max(1) || height < min_dimension.max(1) {
            tracing::debug!(width, height, min_dimension, "dimension floor reached");
            break;
        }

        let candidate = temp.allocate(target.extension());
        let (next_img, next_size) = {
            let candidate = candidate.clone();
            let dir = temp.dir().to_path_buf();
            tokio::task::spawn_blocking(move || step(current_img, target, dir, candidate))
                .await??
        };

        if next_size >= size {
            tracing::debug!(next_size, size, "downscale step did not shrink the file");
            temp.discard(&candidate);
            break;
        }

        tracing::debug!(width, height, from = size, to = next_size, "downscaled");
        size = next_size;
        sizes.push(size);
        current_img = next_img;
        current = ResolvedImage {
            path: candidate,
            format: target.image_format(),
        };
    }

    Ok(DownscaleOutcome {
        image: current,
        sizes,
    })
}

fn halve_and_write(
    img: DynamicImage,
    target: OutputFormat,
    dir: PathBuf,
    out: PathBuf,
) -> Result<(DynamicImage, u64)> {
    let resized = img.resize_exact(img.width() / 2, img.height() / 2, FilterType::Lanczos3);
    let bytes = crate::format::encode(&resized, target)?;
    std::fs::create_dir_all(dir)?;
    std::fs::write(&out, &bytes)?;
    Ok((resized, bytes.len() as u64))
}
