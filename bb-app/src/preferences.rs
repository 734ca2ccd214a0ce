//! Per-user defaults for style, format and size, persisted as one JSON file
//! in the cache directory.

use anyhow::{Context, Result};
use bb_media::OutputFormat;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const PREFERENCES_FILE: &str = "user_preferences.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPreferences {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<OutputFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
}

impl UserPreferences {
    pub fn is_empty(&self) -> bool {
        self.style.is_none() && self.format.is_none() && self.size.is_none()
    }

    /// Fields set in `other` replace ours; unset fields are kept.
    fn merge(&mut self, other: UserPreferences) {
        if other.style.is_some() {
            self.style = other.style;
        }
        if other.format.is_some() {
            self.format = other.format;
        }
        if other.size.is_some() {
            self.size = other.size;
        }
    }

    pub fn describe(&self) -> String {
        if self.is_empty() {
            return "No saved preferences.".to_string();
        }
        let mut lines = vec!["**Your defaults**".to_string()];
        if let Some(style) = &self.style {
            lines.push(format!("Style: {style}"));
        }
        if let Some(format) = self.format {
            lines.push(format!("Format: {format}"));
        }
        if let Some(size) = &self.size {
            lines.push(format!("Size: {size}"));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PreferenceChange {
    Show,
    Set(UserPreferences),
    Clear,
}

pub struct PreferenceStore {
    path: PathBuf,
    entries: DashMap<String, UserPreferences>,
    save_lock: tokio::sync::Mutex<()>,
}

impl PreferenceStore {
    /// Loads `cache_dir/user_preferences.json`. A missing file is an empty
    /// store; an unreadable one is logged and replaced on the next save.
    pub async fn load(cache_dir: &Path) -> Result<Self> {
        let path = cache_dir.join(PREFERENCES_FILE);
        let entries = DashMap::new();
        match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<BTreeMap<String, UserPreferences>>(&bytes) {
                Ok(saved) => {
                    for (user, prefs) in saved {
                        entries.insert(user, prefs);
                    }
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), %e, "ignoring unreadable preferences file");
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()));
            }
        }
        tracing::debug!(users = entries.len(), path = %path.display(), "preferences loaded");
        Ok(Self {
            path,
            entries,
            save_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn get(&self, user_id: &str) -> UserPreferences {
        self.entries
            .get(user_id)
            .map(|p| p.value().clone())
            .unwrap_or_default()
    }

    /// Applies `change` and persists it. Returns the user's preferences
    /// afterwards.
    pub async fn apply(&self, user_id: &str, change: PreferenceChange) -> Result<UserPreferences> {
        let updated = match change {
            PreferenceChange::Show => return Ok(self.get(user_id)),
            PreferenceChange::Set(prefs) => {
                let mut entry = self.entries.entry(user_id.to_string()).or_default();
                entry.merge(prefs);
                entry.value().clone()
            }
            PreferenceChange::Clear => {
                self.entries.remove(user_id);
                UserPreferences::default()
            }
        };
        self.save().await?;
        tracing::info!(user_id, cleared = updated.is_empty(), "preferences updated");
        Ok(updated)
    }

    async fn save(&self) -> Result<()> {
        let _guard = self.save_lock.lock().await;
        let snapshot: BTreeMap<String, UserPreferences> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn saved_preferences_survive_a_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = PreferenceStore::load(dir.path()).await.expect("load");
        assert!(store.get("u1").is_empty());

        store
            .apply(
                "u1",
                PreferenceChange::Set(UserPreferences {
                    style: Some("anime".to_string()),
                    format: Some(OutputFormat::Jpg),
                    size: None,
                }),
            )
            .await
            .expect("set");
        let after = store
            .apply(
                "u1",
                PreferenceChange::Set(UserPreferences {
                    size: Some("512x512".to_string()),
                    ..UserPreferences::default()
                }),
            )
            .await
            .expect("merge");
        assert_eq!(after.style.as_deref(), Some("anime"));
        assert_eq!(after.size.as_deref(), Some("512x512"));

        let reloaded = PreferenceStore::load(dir.path()).await.expect("reload");
        assert_eq!(reloaded.get("u1"), after);
        assert!(reloaded.get("u2").is_empty());
    }

    #[tokio::test]
    async fn clear_removes_the_user_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = PreferenceStore::load(dir.path()).await.expect("load");
        store
            .apply(
                "u1",
                PreferenceChange::Set(UserPreferences {
                    style: Some("sketch".to_string()),
                    ..UserPreferences::default()
                }),
            )
            .await
            .expect("set");
        store.apply("u1", PreferenceChange::Clear).await.expect("clear");

        let raw = std::fs::read_to_string(dir.path().join(PREFERENCES_FILE)).expect("read");
        let saved: serde_json::Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(saved, serde_json::json!({}));
    }

    #[tokio::test]
    async fn corrupt_file_loads_as_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join(PREFERENCES_FILE), b"{ not json").expect("write");
        let store = PreferenceStore::load(dir.path()).await.expect("load");
        assert!(store.get("u1").is_empty());
    }

    #[test]
    fn description_lists_only_set_fields() {
        assert_eq!(UserPreferences::default().describe(), "No saved preferences.");
        let text = UserPreferences {
            format: Some(OutputFormat::Webp),
            ..UserPreferences::default()
        }
        .describe();
        assert!(text.contains("Format: webp"));
        assert!(!text.contains("Style"));
    }
}
