use crate::error::{GenError, Result};
use crate::types::{ChatMessage, ContentPart, GenerationRequest, Role};

pub const BLEND_SOURCES_MIN: usize = 2;
pub const BLEND_SOURCES_MAX: usize = 6;

/// Everything a request needs besides the image parts.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub seed: Option<u64>,
    pub format: Option<String>,
    pub size: Option<String>,
}

pub fn generate_request(
    model: &str,
    prompt: &str,
    style: Option<&str>,
    options: RequestOptions,
) -> GenerationRequest {
    let text = match style {
        Some(style) if !style.trim().is_empty() => format!("{prompt} in {style} style"),
        _ => prompt.to_string(),
    };
    build(model, vec![ContentPart::text(text)], options)
}

/// `images` are data or remote URLs; the mask, if any, goes last.
pub fn edit_request(
    model: &str,
    prompt: &str,
    images: Vec<String>,
    mask: Option<String>,
    options: RequestOptions,
) -> Result<GenerationRequest> {
    if images.is_empty() {
        return Err(GenError::InvalidInput(
            "edit requires at least one source image".to_string(),
        ));
    }
    let mut content = Vec::with_capacity(images.len() + 2);
    content.push(ContentPart::text(prompt));
    content.extend(images.into_iter().map(ContentPart::image));
    if let Some(mask) = mask {
        content.push(ContentPart::image(mask));
    }
    Ok(build(model, content, options))
}

pub fn blend_request(
    model: &str,
    prompt: &str,
    images: Vec<String>,
    strength: f32,
    options: RequestOptions,
) -> Result<GenerationRequest> {
    if !(BLEND_SOURCES_MIN..=BLEND_SOURCES_MAX).contains(&images.len()) {
        return Err(GenError::InvalidInput(format!(
            "blend requires {BLEND_SOURCES_MIN}-{BLEND_SOURCES_MAX} source images, got {}",
            images.len()
        )));
    }
    let mut content = Vec::with_capacity(images.len() + 1);
    content.push(ContentPart::text(format!(
        "{prompt} with blend strength {strength}"
    )));
    content.extend(images.into_iter().map(ContentPart::image));
    Ok(build(model, content, options))
}

fn build(model: &str, content: Vec<ContentPart>, options: RequestOptions) -> GenerationRequest {
    GenerationRequest {
        model: model.to_string(),
        messages: vec![ChatMessage {
            role: Role::User,
            content,
        }],
        modalities: vec!["image".to_string(), "text".to_string()],
        seed: options.seed,
        format: options.format,
        size: options.size,
    }
}
