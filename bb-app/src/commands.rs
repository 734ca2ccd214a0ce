//! Chat command parsing and validation.
//!
//! Everything here runs before admission; a rejected command never reaches
//! the queue.

use crate::error::ValidationError;
use crate::preferences::{PreferenceChange, UserPreferences};
use crate::queue::{EDIT_SOURCES_MAX, JobKind, JobParams, MAX_COUNT};
use bb_channels::Attachment;
use bb_gen::{BLEND_SOURCES_MAX, BLEND_SOURCES_MIN};
use bb_media::{ImageSource, OutputFormat};

pub const PROMPT_MAX_CHARS: usize = 1000;
pub const STYLES: &[&str] = &["photorealistic", "anime", "sketch", "cartoon", "abstract"];
pub const SIZE_MIN: u32 = 64;
pub const SIZE_MAX: u32 = 4096;
pub const DEFAULT_BLEND_STRENGTH: f32 = 0.5;

/// Matched as whole words, case-insensitively.
const PROHIBITED_TERMS: &[&str] = &[
    "fuck",
    "shit",
    "bitch",
    "asshole",
    "porn",
    "sex",
    "naked",
    "rape",
    "incest",
    "pedophile",
    "murder",
    "suicide",
    "terrorist",
    "bomb",
    "kill",
];

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Info,
    Prefs(PreferenceChange),
    Job(JobRequest),
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub kind: JobKind,
    pub params: JobParams,
}

pub fn help_text() -> String {
    [
        "**Bananabot commands**",
        "`/imagine <prompt> [--style S] [--count 1-4] [--seed N] [--format png|jpg|webp] [--size WxH]`",
        "`/edit <prompt> [--source URL]... [--mask] [--format F] [--size WxH]` with 1-4 attached images; `--mask` treats the last image as the mask",
        "`/blend <prompt> [--source URL]... [--strength 0.0-1.0] [--format F]` with 2-6 attached images",
        "`/prefs [--style S] [--format F] [--size WxH]` shows or saves your defaults; `/prefs clear` removes them",
        "`/info`",
        "`/help`",
        "",
        "Styles: photorealistic, anime, sketch, cartoon, abstract",
    ]
    .join("\n")
}

pub fn info_text(model: &str) -> String {
    [
        "**🔍 Bot Information**".to_string(),
        format!("**🤖 Model:** `{model}`"),
        format!("**📦 Version:** v{}", env!("CARGO_PKG_VERSION")),
        String::new(),
        "**⚡ Performance:** response times depend on load and image complexity. Jobs run one at a time in the order they were queued.".to_string(),
        "**🔒 Rate limits:** each command has a per-user limit here, and the generation API applies its own limits on top.".to_string(),
        "**🛡️ Privacy:** prompts and images are sent to the generation API for processing. Only your saved defaults are kept by the bot.".to_string(),
    ]
    .join("\n")
}

/// `None` when `content` is not a bananabot command at all. `prefs` fills
/// in options the user did not pass.
pub fn parse(
    content: &str,
    attachments: &[Attachment],
    prefs: &UserPreferences,
) -> Option<Result<Command, ValidationError>> {
    let trimmed = content.trim();
    let rest = trimmed.strip_prefix('/')?;
    let (name, args) = match rest.split_once(char::is_whitespace) {
        Some((name, args)) => (name, args),
        None => (rest, ""),
    };
    let kind = match name.to_ascii_lowercase().as_str() {
        "help" => return Some(Ok(Command::Help)),
        "info" => return Some(Ok(Command::Info)),
        "prefs" => return Some(parse_prefs(args).map(Command::Prefs)),
        "imagine" => JobKind::Generate,
        "edit" => JobKind::Edit,
        "blend" => JobKind::Blend,
        _ => return None,
    };
    Some(parse_job(kind, args, attachments, prefs).map(Command::Job))
}

fn parse_prefs(args: &str) -> Result<PreferenceChange, ValidationError> {
    let args = args.trim();
    if args.is_empty() {
        return Ok(PreferenceChange::Show);
    }
    if args.eq_ignore_ascii_case("clear") {
        return Ok(PreferenceChange::Clear);
    }
    let mut prefs = UserPreferences::default();
    let mut tokens = args.split_whitespace();
    while let Some(token) = tokens.next() {
        let flag = token
            .strip_prefix("--")
            .map(str::to_ascii_lowercase)
            .ok_or_else(|| ValidationError::new(format!("Unexpected `{token}`; see /help")))?;
        let value = tokens
            .next()
            .ok_or_else(|| ValidationError::new(format!("`--{flag}` needs a value")))?;
        match flag.as_str() {
            "style" => prefs.style = Some(validate_style(value)?),
            "format" => prefs.format = Some(validate_format(value)?),
            "size" => prefs.size = Some(validate_size(value)?),
            _ => {
                return Err(ValidationError::new(format!(
                    "`--{flag}` is not an option for /prefs"
                )));
            }
        }
    }
    Ok(PreferenceChange::Set(prefs))
}

fn allowed_flags(kind: JobKind) -> &'static [&'static str] {
    match kind {
        JobKind::Generate => &["style", "count", "seed", "format", "size"],
        JobKind::Edit => &["source", "mask", "format", "size"],
        JobKind::Blend => &["source", "strength", "format"],
    }
}

/// Saved defaults apply only to options the command accepts.
fn apply_preferences(kind: JobKind, prefs: &UserPreferences, params: &mut JobParams) {
    let allowed = allowed_flags(kind);
    if allowed.contains(&"style") {
        params.style = prefs.style.clone();
    }
    if let Some(format) = prefs.format {
        params.format = format;
    }
    if allowed.contains(&"size") {
        params.size = prefs.size.clone();
    }
}

fn parse_job(
    kind: JobKind,
    args: &str,
    attachments: &[Attachment],
    prefs: &UserPreferences,
) -> Result<JobRequest, ValidationError> {
    let mut params = JobParams::default();
    apply_preferences(kind, prefs, &mut params);
    let mut words = Vec::new();
    let mut extra_sources = Vec::new();
    let mut use_mask = false;

    let mut tokens = args.split_whitespace();
    while let Some(token) = tokens.next() {
        let Some(flag) = token.strip_prefix("--") else {
            words.push(token);
            continue;
        };
        let flag = flag.to_ascii_lowercase();
        if !allowed_flags(kind).contains(&flag.as_str()) {
            return Err(ValidationError::new(format!(
                "`--{flag}` is not an option for /{}",
                kind.command_name()
            )));
        }
        if flag == "mask" {
            use_mask = true;
            continue;
        }
        let value = tokens
            .next()
            .ok_or_else(|| ValidationError::new(format!("`--{flag}` needs a value")))?;
        match flag.as_str() {
            "style" => params.style = Some(validate_style(value)?),
            "count" => params.count = validate_count(value)?,
            "seed" => {
                let seed = value
                    .parse::<u64>()
                    .map_err(|_| ValidationError::new("Seed must be a non-negative integer"))?;
                params.seed = Some(seed);
            }
            "format" => params.format = validate_format(value)?,
            "size" => params.size = Some(validate_size(value)?),
            "strength" => params.strength = Some(validate_strength(value)?),
            "source" => extra_sources.push(ImageSource::url(value)),
            _ => {}
        }
    }

    params.prompt = validate_prompt(&words.join(" "))?;

    let mut sources: Vec<ImageSource> = attachments.iter().map(attachment_source).collect();
    sources.extend(extra_sources);
    match kind {
        JobKind::Generate => {
            if !sources.is_empty() {
                return Err(ValidationError::new(
                    "/imagine does not take images; use /edit or /blend",
                ));
            }
        }
        JobKind::Edit => {
            if use_mask {
                if sources.len() < 2 {
                    return Err(ValidationError::new(
                        "`--mask` needs a source image and a mask image",
                    ));
                }
                params.mask = sources.pop();
            }
            if !(1..=EDIT_SOURCES_MAX).contains(&sources.len()) {
                return Err(ValidationError::new(format!(
                    "/edit needs 1-{EDIT_SOURCES_MAX} source images, got {}",
                    sources.len()
                )));
            }
        }
        JobKind::Blend => {
            if !(BLEND_SOURCES_MIN..=BLEND_SOURCES_MAX).contains(&sources.len()) {
                return Err(ValidationError::new(format!(
                    "/blend needs {BLEND_SOURCES_MIN}-{BLEND_SOURCES_MAX} source images, got {}",
                    sources.len()
                )));
            }
            params.strength.get_or_insert(DEFAULT_BLEND_STRENGTH);
        }
    }
    params.sources = sources;
    Ok(JobRequest { kind, params })
}

fn attachment_source(attachment: &Attachment) -> ImageSource {
    ImageSource::Url {
        url: attachment.url.clone(),
        filename: Some(attachment.name.clone()),
        content_type: attachment.content_type.clone(),
        size: attachment.size,
    }
}

/// Trimmed prompt, or the first rule it breaks.
pub fn validate_prompt(prompt: &str) -> Result<String, ValidationError> {
    let prompt = prompt.trim();
    if prompt.is_empty() {
        return Err(ValidationError::new("Prompt cannot be empty"));
    }
    let len = prompt.chars().count();
    if len > PROMPT_MAX_CHARS {
        return Err(ValidationError::new(format!(
            "Prompt must be no more than {PROMPT_MAX_CHARS} characters long, got {len}"
        )));
    }
    if let Some(term) = prohibited_term(prompt) {
        return Err(ValidationError::new(format!(
            "Prompt contains prohibited content: '{term}'"
        )));
    }
    if !is_balanced(prompt) {
        return Err(ValidationError::new(
            "Prompt contains unbalanced brackets or quotes",
        ));
    }
    Ok(prompt.to_string())
}

fn prohibited_term(prompt: &str) -> Option<&'static str> {
    let lower = prompt.to_lowercase();
    lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .find_map(|word| PROHIBITED_TERMS.iter().copied().find(|term| *term == word))
}

/// Brackets must nest; double quotes and backticks must pair up.
/// Apostrophes are ignored so contractions pass.
pub fn is_balanced(text: &str) -> bool {
    let mut stack = Vec::new();
    for c in text.chars() {
        match c {
            '(' | '[' | '{' => stack.push(c),
            ')' | ']' | '}' => {
                let open = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                if stack.pop() != Some(open) {
                    return false;
                }
            }
            _ => {}
        }
    }
    let quotes = text.chars().filter(|c| *c == '"').count();
    let ticks = text.chars().filter(|c| *c == '`').count();
    stack.is_empty() && quotes % 2 == 0 && ticks % 2 == 0
}

fn validate_style(value: &str) -> Result<String, ValidationError> {
    let style = value.to_ascii_lowercase();
    if STYLES.contains(&style.as_str()) {
        Ok(style)
    } else {
        Err(ValidationError::new(format!(
            "Unknown style '{value}'. Choose one of: {}",
            STYLES.join(", ")
        )))
    }
}

fn validate_format(value: &str) -> Result<OutputFormat, ValidationError> {
    value
        .parse::<OutputFormat>()
        .map_err(|_| ValidationError::new("Format must be one of png, jpg, webp"))
}

fn validate_count(value: &str) -> Result<u8, ValidationError> {
    match value.parse::<u8>() {
        Ok(n) if (1..=MAX_COUNT).contains(&n) => Ok(n),
        _ => Err(ValidationError::new(format!(
            "Count must be between 1 and {MAX_COUNT}"
        ))),
    }
}

fn validate_strength(value: &str) -> Result<f32, ValidationError> {
    match value.parse::<f32>() {
        Ok(s) if (0.0..=1.0).contains(&s) => Ok(s),
        _ => Err(ValidationError::new(
            "Strength must be between 0.0 and 1.0",
        )),
    }
}

/// `WxH`, both sides within the supported range.
pub fn validate_size(value: &str) -> Result<String, ValidationError> {
    let invalid = || {
        ValidationError::new(format!(
            "Size must look like 1024x1024 with sides between {SIZE_MIN} and {SIZE_MAX}"
        ))
    };
    let lower = value.to_ascii_lowercase();
    let (w, h) = lower.split_once('x').ok_or_else(invalid)?;
    let w: u32 = w.parse().map_err(|_| invalid())?;
    let h: u32 = h.parse().map_err(|_| invalid())?;
    let range = SIZE_MIN..=SIZE_MAX;
    if !range.contains(&w) || !range.contains(&h) {
        return Err(invalid());
    }
    Ok(format!("{w}x{h}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attachment(name: &str) -> Attachment {
        Attachment {
            name: name.to_string(),
            content_type: Some("image/png".to_string()),
            url: format!("https://cdn.example/{name}"),
            size: Some(1024),
        }
    }

    fn job(content: &str, attachments: &[Attachment]) -> Result<JobRequest, ValidationError> {
        job_with(content, attachments, &UserPreferences::default())
    }

    fn job_with(
        content: &str,
        attachments: &[Attachment],
        prefs: &UserPreferences,
    ) -> Result<JobRequest, ValidationError> {
        match parse(content, attachments, prefs).expect("is a command")? {
            Command::Job(request) => Ok(request),
            other => panic!("expected a job, got {other:?}"),
        }
    }

    #[test]
    fn non_commands_are_ignored() {
        let none = UserPreferences::default();
        assert!(parse("hello there", &[], &none).is_none());
        assert!(parse("/unknown thing", &[], &none).is_none());
        assert_eq!(parse("/help", &[], &none).expect("cmd").expect("ok"), Command::Help);
        assert_eq!(parse("/INFO", &[], &none).expect("cmd").expect("ok"), Command::Info);
    }

    #[test]
    fn imagine_parses_flags_around_the_prompt() {
        let request = job(
            "/imagine a banana --style Anime on the moon --count 3 --seed 7 --format jpeg --size 512X768",
            &[],
        )
        .expect("valid");
        assert_eq!(request.kind, JobKind::Generate);
        let params = request.params;
        assert_eq!(params.prompt, "a banana on the moon");
        assert_eq!(params.style.as_deref(), Some("anime"));
        assert_eq!(params.count, 3);
        assert_eq!(params.seed, Some(7));
        assert_eq!(params.format, OutputFormat::Jpg);
        assert_eq!(params.size.as_deref(), Some("512x768"));
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        assert!(job("/imagine cat --count 5", &[]).is_err());
        assert!(job("/imagine cat --count 0", &[]).is_err());
        assert!(job("/imagine cat --style baroque", &[]).is_err());
        assert!(job("/imagine cat --format gif", &[]).is_err());
        assert!(job("/imagine cat --size 32x32", &[]).is_err());
        assert!(job("/imagine cat --seed -1", &[]).is_err());
        assert!(job("/imagine cat --count", &[]).is_err());
        assert!(job("/imagine cat --strength 0.5", &[]).is_err());
    }

    #[test]
    fn prompt_rules() {
        assert!(validate_prompt("   ").is_err());
        assert!(validate_prompt(&"a".repeat(PROMPT_MAX_CHARS)).is_ok());
        assert!(validate_prompt(&"a".repeat(PROMPT_MAX_CHARS + 1)).is_err());
        let err = validate_prompt("a BOMB in a field").expect_err("prohibited");
        assert!(err.message.contains("bomb"));
        assert_eq!(
            validate_prompt("  a skill tree of bombastic sextants ").expect("word boundaries"),
            "a skill tree of bombastic sextants"
        );
    }

    #[test]
    fn balance_checks_brackets_and_quotes_but_not_apostrophes() {
        assert!(is_balanced("a (red [shiny] {apple})"));
        assert!(is_balanced("the dog's \"ball\""));
        assert!(!is_balanced("a (red apple"));
        assert!(!is_balanced("a (red] apple"));
        assert!(!is_balanced("a \"quoted apple"));
        assert!(!is_balanced("`code"));
        assert!(!is_balanced(")("));
    }

    #[test]
    fn edit_takes_attachments_then_source_flags_and_optional_mask() {
        let request = job(
            "/edit make it blue --source https://img.example/b.png --mask",
            &[attachment("a.png")],
        )
        .expect("valid");
        assert_eq!(request.kind, JobKind::Edit);
        assert_eq!(request.params.sources.len(), 1);
        assert_eq!(request.params.sources[0].label(), "a.png");
        assert_eq!(
            request.params.mask,
            Some(ImageSource::url("https://img.example/b.png"))
        );

        assert!(job("/edit make it blue", &[]).is_err());
        assert!(job("/edit make it blue --mask", &[attachment("a.png")]).is_err());
        let five: Vec<Attachment> = (0..5).map(|i| attachment(&format!("{i}.png"))).collect();
        assert!(job("/edit make it blue", &five).is_err());
    }

    #[test]
    fn blend_needs_two_to_six_sources_and_defaults_strength() {
        let two = [attachment("a.png"), attachment("b.png")];
        let request = job("/blend fuse them", &two).expect("valid");
        assert_eq!(request.params.strength, Some(DEFAULT_BLEND_STRENGTH));
        assert_eq!(request.params.sources.len(), 2);

        assert!(job("/blend fuse them", &two[..1]).is_err());
        let seven: Vec<Attachment> = (0..7).map(|i| attachment(&format!("{i}.png"))).collect();
        assert!(job("/blend fuse them", &seven).is_err());
        assert!(job("/blend fuse them --strength 1.5", &two).is_err());
        let request = job("/blend fuse them --strength 0.8", &two).expect("valid");
        assert_eq!(request.params.strength, Some(0.8));
    }

    #[test]
    fn imagine_rejects_images() {
        assert!(job("/imagine cat", &[attachment("a.png")]).is_err());
    }

    fn saved() -> UserPreferences {
        UserPreferences {
            style: Some("sketch".to_string()),
            format: Some(OutputFormat::Webp),
            size: Some("512x512".to_string()),
        }
    }

    #[test]
    fn saved_defaults_fill_only_what_was_not_passed() {
        let request = job_with("/imagine a pear --style anime", &[], &saved()).expect("valid");
        assert_eq!(request.params.style.as_deref(), Some("anime"));
        assert_eq!(request.params.format, OutputFormat::Webp);
        assert_eq!(request.params.size.as_deref(), Some("512x512"));

        let request = job_with("/imagine a pear --format png", &[], &saved()).expect("valid");
        assert_eq!(request.params.style.as_deref(), Some("sketch"));
        assert_eq!(request.params.format, OutputFormat::Png);
    }

    #[test]
    fn saved_defaults_skip_options_the_command_does_not_take() {
        let two = [attachment("a.png"), attachment("b.png")];
        let request = job_with("/blend fuse them", &two, &saved()).expect("valid");
        assert_eq!(request.params.style, None);
        assert_eq!(request.params.size, None);
        assert_eq!(request.params.format, OutputFormat::Webp);

        let request = job_with("/edit tint it", &two[..1], &saved()).expect("valid");
        assert_eq!(request.params.style, None);
        assert_eq!(request.params.size.as_deref(), Some("512x512"));
    }

    #[test]
    fn prefs_command_shows_sets_and_clears() {
        let none = UserPreferences::default();
        let prefs = |content: &str| parse(content, &[], &none).expect("is a command");

        assert_eq!(prefs("/prefs").expect("ok"), Command::Prefs(PreferenceChange::Show));
        assert_eq!(prefs("/prefs CLEAR").expect("ok"), Command::Prefs(PreferenceChange::Clear));
        assert_eq!(
            prefs("/prefs --style Anime --format jpeg --size 640x480").expect("ok"),
            Command::Prefs(PreferenceChange::Set(UserPreferences {
                style: Some("anime".to_string()),
                format: Some(OutputFormat::Jpg),
                size: Some("640x480".to_string()),
            }))
        );
        assert!(prefs("/prefs --count 2").is_err());
        assert!(prefs("/prefs --style").is_err());
        assert!(prefs("/prefs --style baroque").is_err());
        assert!(prefs("/prefs anime").is_err());
    }

    #[test]
    fn info_names_the_model_and_version() {
        let text = info_text("google/gemini-2.5-flash-image-preview");
        assert!(text.starts_with("**🔍 Bot Information**"));
        assert!(text.contains("`google/gemini-2.5-flash-image-preview`"));
        assert!(text.contains(&format!("v{}", env!("CARGO_PKG_VERSION"))));
    }
}
