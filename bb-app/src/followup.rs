//! Buttons attached to a finished job.
//!
//! A button carries only a token; the registry maps the token to a
//! serializable [`FollowUpSpec`] that replays the job without asking the user
//! for anything again.

use crate::queue::{JobKind, JobParams};
use bb_channels::MessageAction;
use bb_media::ImageSource;
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use ulid::Ulid;

pub const CUSTOM_ID_PREFIX: &str = "bb:";
pub const VARIATION_COUNT: u8 = 4;
const UPSCALE_PROMPT: &str = "Upscale this image to a higher resolution. Sharpen fine detail and keep the composition, colors and style unchanged.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FollowUpAction {
    Reroll,
    Variations,
    SameSeed,
    Upscale,
    EditResult,
}

impl FollowUpAction {
    pub fn label(self) -> &'static str {
        match self {
            Self::Reroll => "🔄 Reroll",
            Self::Variations => "🎯 Variations",
            Self::SameSeed => "🔢 Same Seed",
            Self::Upscale => "🔍 Upscale",
            Self::EditResult => "✏️ Edit Result",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowUpSpec {
    pub action: FollowUpAction,
    /// Kind of the job that produced the buttons.
    pub kind: JobKind,
    pub params: JobParams,
    /// First produced image. Only the actions that work on the result carry
    /// it, and they share one allocation.
    #[serde(default)]
    pub artifact: Option<Arc<ImageSource>>,
}

impl FollowUpSpec {
    /// The job this follow-up replays, or `None` when it needs an artifact it
    /// does not have.
    pub fn to_request(&self) -> Option<(JobKind, JobParams)> {
        match self.action {
            FollowUpAction::Reroll => Some((
                self.kind,
                JobParams {
                    seed: None,
                    ..self.params.clone()
                },
            )),
            FollowUpAction::Variations => Some((
                JobKind::Generate,
                JobParams {
                    count: VARIATION_COUNT,
                    seed: None,
                    ..self.params.clone()
                },
            )),
            FollowUpAction::SameSeed => {
                self.params.seed?;
                Some((self.kind, self.params.clone()))
            }
            FollowUpAction::Upscale => {
                let artifact = self.artifact.as_deref()?.clone();
                Some((
                    JobKind::Edit,
                    JobParams {
                        sources: vec![artifact],
                        format: self.params.format,
                        ..JobParams::prompt(UPSCALE_PROMPT)
                    },
                ))
            }
            FollowUpAction::EditResult => {
                let artifact = self.artifact.as_deref()?.clone();
                Some((
                    JobKind::Edit,
                    JobParams {
                        sources: vec![artifact],
                        format: self.params.format,
                        size: self.params.size.clone(),
                        ..JobParams::prompt(self.params.prompt.clone())
                    },
                ))
            }
        }
    }
}

/// The follow-ups offered for a finished job.
pub fn follow_ups_for(
    kind: JobKind,
    params: &JobParams,
    artifact: Option<ImageSource>,
) -> Vec<FollowUpSpec> {
    let spec = |action: FollowUpAction, artifact: Option<Arc<ImageSource>>| FollowUpSpec {
        action,
        kind,
        params: params.clone(),
        artifact,
    };
    let mut specs = vec![spec(FollowUpAction::Reroll, None)];
    if kind == JobKind::Generate {
        specs.push(spec(FollowUpAction::Variations, None));
    }
    if kind == JobKind::Generate && params.seed.is_some() {
        specs.push(spec(FollowUpAction::SameSeed, None));
    }
    if let Some(artifact) = artifact.map(Arc::new) {
        specs.push(spec(FollowUpAction::Upscale, Some(artifact.clone())));
        specs.push(spec(FollowUpAction::EditResult, Some(artifact)));
    }
    specs
}

pub struct FollowUpRegistry {
    entries: DashMap<Ulid, (DateTime<Utc>, FollowUpSpec)>,
    ttl: TimeDelta,
}

impl Default for FollowUpRegistry {
    fn default() -> Self {
        Self::new(TimeDelta::minutes(15))
    }
}

impl FollowUpRegistry {
    pub fn new(ttl: TimeDelta) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn register(&self, spec: FollowUpSpec, now: DateTime<Utc>) -> MessageAction {
        let token = Ulid::new();
        let label = spec.action.label().to_string();
        self.entries.insert(token, (now, spec));
        MessageAction {
            label,
            custom_id: format!("{CUSTOM_ID_PREFIX}{token}"),
        }
    }

    /// Looks up a button press. Entries stay until they expire, so a button
    /// can be pressed more than once.
    pub fn resolve(&self, custom_id: &str, now: DateTime<Utc>) -> Option<FollowUpSpec> {
        let token = custom_id.strip_prefix(CUSTOM_ID_PREFIX)?;
        let token = Ulid::from_string(token).ok()?;
        {
            let entry = self.entries.get(&token)?;
            let (created, spec) = entry.value();
            if now - *created <= self.ttl {
                return Some(spec.clone());
            }
        }
        self.entries.remove(&token);
        None
    }

    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, (created, _)| now - *created <= self.ttl);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> JobParams {
        JobParams {
            style: Some("anime".to_string()),
            seed: Some(42),
            count: 2,
            ..JobParams::prompt("a banana astronaut")
        }
    }

    fn artifact() -> ImageSource {
        ImageSource::url("https://cdn.example/out.png")
    }

    fn spec(action: FollowUpAction, kind: JobKind, params: JobParams) -> FollowUpSpec {
        FollowUpSpec {
            action,
            kind,
            params,
            artifact: Some(Arc::new(artifact())),
        }
    }

    #[test]
    fn generate_with_seed_offers_every_action() {
        let offered: Vec<FollowUpAction> =
            follow_ups_for(JobKind::Generate, &seeded(), Some(artifact()))
                .into_iter()
                .map(|s| s.action)
                .collect();
        assert_eq!(
            offered,
            vec![
                FollowUpAction::Reroll,
                FollowUpAction::Variations,
                FollowUpAction::SameSeed,
                FollowUpAction::Upscale,
                FollowUpAction::EditResult,
            ]
        );
    }

    #[test]
    fn only_result_actions_hold_the_artifact() {
        let specs = follow_ups_for(JobKind::Generate, &seeded(), Some(artifact()));
        for spec in &specs {
            match spec.action {
                FollowUpAction::Upscale | FollowUpAction::EditResult => {
                    assert_eq!(spec.artifact.as_deref(), Some(&artifact()));
                }
                _ => assert!(spec.artifact.is_none(), "{:?} kept the image", spec.action),
            }
        }
        let shared: Vec<&Arc<ImageSource>> =
            specs.iter().filter_map(|s| s.artifact.as_ref()).collect();
        assert_eq!(shared.len(), 2);
        assert!(Arc::ptr_eq(shared[0], shared[1]));
    }

    #[test]
    fn blend_without_artifact_only_offers_reroll() {
        let offered = follow_ups_for(JobKind::Blend, &JobParams::prompt("mix"), None);
        assert_eq!(offered.len(), 1);
        assert_eq!(offered[0].action, FollowUpAction::Reroll);
    }

    #[test]
    fn reroll_keeps_prompt_and_drops_seed() {
        let (kind, params) = spec(FollowUpAction::Reroll, JobKind::Generate, seeded())
            .to_request()
            .expect("request");
        assert_eq!(kind, JobKind::Generate);
        assert_eq!(params.prompt, "a banana astronaut");
        assert_eq!(params.style.as_deref(), Some("anime"));
        assert_eq!(params.seed, None);
    }

    #[test]
    fn variations_ask_for_four_images() {
        let (_, params) = spec(FollowUpAction::Variations, JobKind::Generate, seeded())
            .to_request()
            .expect("request");
        assert_eq!(params.count, VARIATION_COUNT);
        assert_eq!(params.seed, None);
    }

    #[test]
    fn same_seed_requires_a_seed() {
        let (_, params) = spec(FollowUpAction::SameSeed, JobKind::Generate, seeded())
            .to_request()
            .expect("request");
        assert_eq!(params, seeded());
        let unseeded = spec(
            FollowUpAction::SameSeed,
            JobKind::Generate,
            JobParams::prompt("x"),
        );
        assert!(unseeded.to_request().is_none());
    }

    #[test]
    fn result_actions_become_edits_of_the_artifact() {
        let (kind, params) = spec(FollowUpAction::EditResult, JobKind::Generate, seeded())
            .to_request()
            .expect("request");
        assert_eq!(kind, JobKind::Edit);
        assert_eq!(params.sources, vec![artifact()]);
        assert_eq!(params.prompt, "a banana astronaut");
        assert_eq!(params.count, 1);

        let (kind, params) = spec(FollowUpAction::Upscale, JobKind::Generate, seeded())
            .to_request()
            .expect("request");
        assert_eq!(kind, JobKind::Edit);
        assert_eq!(params.prompt, UPSCALE_PROMPT);

        let mut missing = spec(FollowUpAction::Upscale, JobKind::Generate, seeded());
        missing.artifact = None;
        assert!(missing.to_request().is_none());
    }

    #[test]
    fn registry_resolves_until_expiry() {
        let registry = FollowUpRegistry::new(TimeDelta::minutes(15));
        let now = Utc::now();
        let action = registry.register(spec(FollowUpAction::Reroll, JobKind::Generate, seeded()), now);
        assert!(action.custom_id.starts_with(CUSTOM_ID_PREFIX));
        assert_eq!(action.label, "🔄 Reroll");

        let hit = registry.resolve(&action.custom_id, now + TimeDelta::minutes(5));
        assert_eq!(hit.map(|s| s.action), Some(FollowUpAction::Reroll));
        assert!(registry.resolve(&action.custom_id, now + TimeDelta::minutes(6)).is_some());

        assert!(registry.resolve(&action.custom_id, now + TimeDelta::minutes(16)).is_none());
        assert!(registry.is_empty());
        assert!(registry.resolve("bb:not-a-ulid", now).is_none());
        assert!(registry.resolve("other:01H000", now).is_none());
    }

    #[test]
    fn prune_drops_only_expired_entries() {
        let registry = FollowUpRegistry::default();
        let now = Utc::now();
        registry.register(spec(FollowUpAction::Reroll, JobKind::Edit, seeded()), now - TimeDelta::minutes(20));
        registry.register(spec(FollowUpAction::Reroll, JobKind::Edit, seeded()), now);
        assert_eq!(registry.prune(now), 1);
        assert_eq!(registry.len(), 1);
    }
}
