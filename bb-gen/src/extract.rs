//! Pulls produced images out of a chat-completions response.
//!
//! Image models disagree on where they put their output, so extraction runs a
//! fixed cascade and stops at the first stage that finds anything.

use crate::types::{ArtifactSource, JobArtifact, Provenance};
use serde_json::Value;

/// Shortest string content, in bytes, treated as an inline image rather
/// than chatter.
const INLINE_CONTENT_MIN_LEN: usize = 1000;
const TOOL_IMAGE_MIN_LEN: usize = 100;
/// Base64 prefixes of PNG, JPEG, GIF and WebP headers.
const IMAGE_SIGNATURES: [&str; 4] = ["iVBORw0KGgo", "/9j/", "R0lGOD", "UklGRg"];

type Stage = fn(&Value, &mut Vec<ArtifactSource>);

pub fn extract_artifacts(response: &Value, provenance: &Provenance) -> Vec<JobArtifact> {
    let messages: Vec<&Value> = response
        .get("choices")
        .and_then(Value::as_array)
        .map(|choices| choices.iter().filter_map(|c| c.get("message")).collect())
        .unwrap_or_default();

    let stages: [(&str, Stage); 4] = [
        ("images", from_images_field),
        ("content", from_content),
        ("attachments", from_attachments),
        ("tool_calls", from_tool_calls),
    ];

    let mut found = Vec::new();
    for (name, stage) in stages {
        for message in &messages {
            stage(message, &mut found);
        }
        if !found.is_empty() {
            tracing::debug!(stage = name, count = found.len(), "artifacts extracted");
            return wrap(found, provenance);
        }
    }

    deep_search(response, &mut found);
    if found.is_empty() {
        tracing::debug!("no artifacts found in generation response");
    } else {
        tracing::debug!(stage = "deep_search", count = found.len(), "artifacts extracted");
    }
    wrap(found, provenance)
}

fn wrap(sources: Vec<ArtifactSource>, provenance: &Provenance) -> Vec<JobArtifact> {
    sources
        .into_iter()
        .map(|source| JobArtifact {
            source,
            provenance: provenance.clone(),
        })
        .collect()
}

fn classify(raw: &str) -> Option<ArtifactSource> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if raw.starts_with("http://") || raw.starts_with("https://") {
        return Some(ArtifactSource::Url {
            url: raw.to_string(),
        });
    }
    Some(ArtifactSource::Inline {
        data: raw.to_string(),
    })
}

fn from_images_field(message: &Value, out: &mut Vec<ArtifactSource>) {
    let Some(images) = message.get("images").and_then(Value::as_array) else {
        return;
    };
    for image in images {
        let url = image
            .get("image_url")
            .and_then(|u| u.get("url"))
            .or_else(|| image.get("url"))
            .and_then(Value::as_str);
        if let Some(source) = url.and_then(classify) {
            out.push(source);
        }
    }
}

fn from_content(message: &Value, out: &mut Vec<ArtifactSource>) {
    match message.get("content") {
        Some(Value::Array(parts)) => {
            for part in parts {
                match part.get("type").and_then(Value::as_str) {
                    Some("image") => {
                        let raw = part
                            .get("base64")
                            .and_then(Value::as_str)
                            .filter(|s| !s.trim().is_empty())
                            .or_else(|| part.get("url").and_then(Value::as_str));
                        if let Some(source) = raw.and_then(classify) {
                            out.push(source);
                        }
                    }
                    Some("image_url") => {
                        let raw = part
                            .get("image_url")
                            .and_then(|u| u.get("url"))
                            .and_then(Value::as_str);
                        if let Some(source) = raw.and_then(classify) {
                            out.push(source);
                        }
                    }
                    _ => {}
                }
            }
        }
        Some(Value::String(text)) => {
            let text = text.trim();
            if text.len() > INLINE_CONTENT_MIN_LEN {
                out.push(ArtifactSource::Inline {
                    data: text.to_string(),
                });
            }
        }
        _ => {}
    }
}

fn from_attachments(message: &Value, out: &mut Vec<ArtifactSource>) {
    let Some(attachments) = message.get("attachments").and_then(Value::as_array) else {
        return;
    };
    for attachment in attachments {
        let is_image = attachment
            .get("type")
            .and_then(Value::as_str)
            .is_some_and(|t| t.contains("image"));
        if !is_image {
            continue;
        }
        let data = attachment
            .get("data")
            .or_else(|| attachment.get("base64"))
            .and_then(Value::as_str);
        if let Some(source) = data.and_then(classify) {
            out.push(source);
        }
    }
}

fn from_tool_calls(message: &Value, out: &mut Vec<ArtifactSource>) {
    let Some(calls) = message.get("tool_calls").and_then(Value::as_array) else {
        return;
    };
    for call in calls {
        if call.get("type").and_then(Value::as_str) != Some("function") {
            continue;
        }
        let Some(arguments) = call.get("function").and_then(|f| f.get("arguments")) else {
            continue;
        };
        let parsed = match arguments {
            Value::String(s) => match serde_json::from_str::<Value>(s) {
                Ok(v) => v,
                Err(_) => continue,
            },
            other => other.clone(),
        };
        let image = parsed
            .get("image")
            .and_then(Value::as_str)
            .filter(|s| s.len() > TOOL_IMAGE_MIN_LEN);
        if let Some(source) = image.and_then(classify) {
            out.push(source);
        }
    }
}

fn looks_like_inline_image(s: &str) -> bool {
    s.len() > INLINE_CONTENT_MIN_LEN
        && (s.starts_with("data:image/") || IMAGE_SIGNATURES.iter().any(|sig| s.starts_with(sig)))
}

fn deep_search(value: &Value, out: &mut Vec<ArtifactSource>) {
    match value {
        Value::String(s) if looks_like_inline_image(s) => out.push(ArtifactSource::Inline {
            data: s.to_string(),
        }),
        Value::Array(items) => items.iter().for_each(|v| deep_search(v, out)),
        Value::Object(map) => map.values().for_each(|v| deep_search(v, out)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn long_png_b64() -> String {
        format!("iVBORw0KGgo{}", "A".repeat(1200))
    }

    fn provenance() -> Provenance {
        Provenance {
            seed: Some(7),
            style: Some("anime".to_string()),
            prompt: Some("a fox".to_string()),
            model: Some("m".to_string()),
        }
    }

    #[test]
    fn images_field_wins_over_text_content() {
        let response = json!({
            "choices": [{
                "message": {
                    "content": "Here you go!",
                    "images": [
                        { "type": "image_url", "image_url": { "url": "data:image/png;base64,AAAA" } },
                        { "type": "image_url", "image_url": { "url": "https://cdn.test/out.png" } }
                    ]
                }
            }]
        });
        let artifacts = extract_artifacts(&response, &provenance());
        assert_eq!(artifacts.len(), 2);
        assert_eq!(
            artifacts[0].source,
            ArtifactSource::Inline {
                data: "data:image/png;base64,AAAA".to_string()
            }
        );
        assert_eq!(
            artifacts[1].source,
            ArtifactSource::Url {
                url: "https://cdn.test/out.png".to_string()
            }
        );
        assert_eq!(artifacts[0].provenance.seed, Some(7));
    }

    #[test]
    fn content_parts_prefer_base64_over_url() {
        let response = json!({
            "choices": [{
                "message": {
                    "content": [
                        { "type": "text", "text": "ok" },
                        { "type": "image", "base64": " QUJD ", "url": "https://cdn.test/x.png" },
                        { "type": "image", "url": "https://cdn.test/y.png" }
                    ]
                }
            }]
        });
        let artifacts = extract_artifacts(&response, &Provenance::default());
        assert_eq!(artifacts.len(), 2);
        assert_eq!(
            artifacts[0].source,
            ArtifactSource::Inline {
                data: "QUJD".to_string()
            }
        );
        assert!(matches!(artifacts[1].source, ArtifactSource::Url { .. }));
    }

    #[test]
    fn short_text_content_is_not_an_image() {
        let response = json!({ "choices": [{ "message": { "content": "Here you go!" } }] });
        assert!(extract_artifacts(&response, &Provenance::default()).is_empty());
    }

    #[test]
    fn content_and_deep_search_measure_length_the_same_way() {
        // 600 chars, 1200 bytes.
        let wide = "é".repeat(600);
        let response = json!({ "choices": [{ "message": { "content": wide.clone() } }] });
        assert_eq!(extract_artifacts(&response, &Provenance::default()).len(), 1);
        assert!(looks_like_inline_image(&format!("data:image/png;base64,{wide}")));

        let narrow = "é".repeat(400);
        let response = json!({ "choices": [{ "message": { "content": narrow } }] });
        assert!(extract_artifacts(&response, &Provenance::default()).is_empty());
    }

    #[test]
    fn tool_call_arguments_are_searched() {
        let args = json!({ "image": "B".repeat(150) }).to_string();
        let response = json!({
            "choices": [{
                "message": {
                    "content": "",
                    "tool_calls": [{ "type": "function", "function": { "arguments": args } }]
                }
            }]
        });
        let artifacts = extract_artifacts(&response, &Provenance::default());
        assert_eq!(artifacts.len(), 1);
    }

    #[test]
    fn deep_search_finds_signature_prefixed_base64() {
        let response = json!({
            "choices": [{ "message": { "content": "" } }],
            "extra": { "nested": [ { "blob": long_png_b64() } ] }
        });
        let artifacts = extract_artifacts(&response, &Provenance::default());
        assert_eq!(artifacts.len(), 1);
        assert!(matches!(
            &artifacts[0].source,
            ArtifactSource::Inline { data } if data.starts_with("iVBORw0KGgo")
        ));
    }
}
