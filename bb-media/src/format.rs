use crate::error::{MediaError, Result};
use image::ImageFormat;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::webp::WebPEncoder;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

const JPEG_QUALITY: u8 = 85;

/// Format of the files sent back to the user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Png,
    Jpg,
    Webp,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpg => "jpg",
            Self::Webp => "webp",
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpg => "image/jpeg",
            Self::Webp => "image/webp",
        }
    }

    pub(crate) fn image_format(self) -> ImageFormat {
        match self {
            Self::Png => ImageFormat::Png,
            Self::Jpg => ImageFormat::Jpeg,
            Self::Webp => ImageFormat::WebP,
        }
    }

    /// Re-encodes `bytes` into this format. Bytes already in the target
    /// format pass through untouched.
    pub fn convert(self, bytes: &[u8]) -> Result<Vec<u8>> {
        let source = sniff(bytes)?;
        if source == self.image_format() {
            return Ok(bytes.to_vec());
        }
        let img = image::load_from_memory_with_format(bytes, source)?;
        encode(&img, self)
    }
}

impl FromStr for OutputFormat {
    type Err = MediaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "png" => Ok(Self::Png),
            "jpg" | "jpeg" => Ok(Self::Jpg),
            "webp" => Ok(Self::Webp),
            other => Err(MediaError::Validation(format!(
                "unsupported output format: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

/// Identifies image bytes by their header; anything unrecognised is a decode
/// error.
pub fn sniff(bytes: &[u8]) -> Result<ImageFormat> {
    image::guess_format(bytes).map_err(|_| MediaError::Decode("bytes are not an image".to_string()))
}

pub fn extension_of(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Png => "png",
        ImageFormat::Jpeg => "jpg",
        ImageFormat::WebP => "webp",
        ImageFormat::Gif => "gif",
        _ => "bin",
    }
}

pub fn mime_of(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Png => "image/png",
        ImageFormat::Jpeg => "image/jpeg",
        ImageFormat::WebP => "image/webp",
        ImageFormat::Gif => "image/gif",
        _ => "application/octet-stream",
    }
}

pub(crate) fn encode(img: &image::DynamicImage, format: OutputFormat) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    match format {
        OutputFormat::Png => {
            img.write_to(&mut std::io::Cursor::new(&mut out), ImageFormat::Png)?;
        }
        OutputFormat::Jpg => {
            let rgb = image::DynamicImage::ImageRgb8(img.to_rgb8());
            JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY).encode_image(&rgb)?;
        }
        OutputFormat::Webp => {
            let rgba = img.to_rgba8();
            WebPEncoder::new_lossless(&mut out).encode(
                &rgba,
                rgba.width(),
                rgba.height(),
                image::ExtendedColorType::Rgba8,
            )?;
        }
    }
    Ok(out)
}
